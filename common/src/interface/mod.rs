pub mod middleware;
pub mod storage;

pub use middleware::Middleware;
pub use storage::{LeaseStorage, LogStorage, QueueStorage, ScraperStorage};
