pub mod consumer;
pub mod queue;

pub use consumer::{Consumer, ConsumerConfig, TaskContext, TaskHandler};
pub use queue::{Queue, DEFAULT_DEAD_THRESHOLD, DEFAULT_RETENTION};
