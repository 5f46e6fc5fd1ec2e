pub mod error;

pub use error::{
    ApiError, BoxError, Error, ErrorKind, HandlerError, LeaseError, MiddlewareError, QueueError,
    Result, SandboxError, SchedulerError, StorageError,
};
