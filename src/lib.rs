//! magpie: Unified entry point for the magpie workspace.
//! This crate re-exports the internal crates so consumers can
//! `use magpie::engine::...`, `magpie::common::...`, etc.

pub mod prelude;

pub mod common { pub use ::common::*; }
pub mod context { pub use ::context::*; }
pub mod engine { pub use ::engine::*; }
pub mod errors { pub use ::errors::*; }
pub mod queue { pub use ::queue::*; }
pub mod storage { pub use ::storage::*; }
pub mod utils { pub use ::utils::*; }

#[cfg(feature = "js-sandbox")]
pub mod js_sandbox {
    pub use ::js_sandbox::*;
}
