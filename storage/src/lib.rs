pub mod in_memory;
pub mod redis;

pub use in_memory::{
    InMemoryLeaseStorage, InMemoryLogStorage, InMemoryQueueStorage, InMemoryScraperStorage,
};
pub use redis::{RedisLeaseStorage, RedisLogStorage, RedisQueueStorage, RedisScraperStorage};
