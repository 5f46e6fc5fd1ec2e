// Common traits and structs
pub use ::common::interface::{
    LeaseStorage, LogStorage, Middleware, QueueStorage, ScraperStorage,
};
pub use ::common::model::{
    EnqueueRequest, Lease, LogLine, Priority, Schedule, Scraper, ScraperConfig, Task, TaskStatus,
};
pub use ::context::ScraperHandler;

// Errors
pub use ::errors::{BoxError, Error, ErrorKind, Result};

pub mod common {
    pub use ::common::interface::LeaseStorage;
    pub use ::common::interface::LogStorage;
    pub use ::common::interface::Middleware;
    pub use ::common::interface::QueueStorage;
    pub use ::common::interface::ScraperStorage;

    pub use ::common::model::Priority;
    pub use ::common::model::Schedule;
    pub use ::common::model::Scraper;
    pub use ::common::model::ScraperConfig;
    pub use ::common::model::Task;
    pub use ::common::model::TaskStatus;
}
pub mod context {
    pub use ::context::MiddlewareChain;
    pub use ::context::Request;
    pub use ::context::Response;
    pub use ::context::ScraperContext;
}
pub mod engine {
    pub use ::engine::server::{Server, ServerBuilder};
}
pub mod queue {
    pub use ::queue::Consumer;
    pub use ::queue::Queue;
}
pub mod storage {
    pub use ::storage::in_memory::*;
    pub use ::storage::redis::*;
}
pub mod errors {
    pub use ::errors::BoxError;
    pub use ::errors::Error;
    pub use ::errors::ErrorKind;
    pub use ::errors::Result;
}
