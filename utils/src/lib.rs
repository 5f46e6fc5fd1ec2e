pub mod connector;
pub mod logger;
pub mod retry;

pub use connector::create_redis_pool;
pub use retry::with_retries;
