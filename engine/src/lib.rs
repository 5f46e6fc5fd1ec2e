pub mod api;
pub mod config;
#[cfg(feature = "js-sandbox")]
pub mod dynamic;
pub mod handlers;
pub mod lease;
pub mod registry;
pub mod runner;
pub mod scheduler;
pub mod server;
pub mod trigger;

pub use config::{SchedulerConfig, ServerConfig, StorageConfig};
pub use lease::LeaseMonitor;
pub use registry::HandlerRegistry;
pub use runner::ScraperRunner;
pub use scheduler::Scheduler;
pub use server::{Server, ServerBuilder};
