use std::error::Error as StdError;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

pub type BoxError = Box<dyn StdError + Send + Sync + 'static>;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    ReadOnly,
    Validation,
    Storage,
    Queue,
    Lease,
    Scheduler,
    Handler,
    Middleware,
    RateLimited,
    Http,
    Cancelled,
    Dead,
    Sandbox,
    Api,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::NotFound => write!(f, "not found"),
            ErrorKind::ReadOnly => write!(f, "read only"),
            ErrorKind::Validation => write!(f, "validation"),
            ErrorKind::Storage => write!(f, "storage"),
            ErrorKind::Queue => write!(f, "queue"),
            ErrorKind::Lease => write!(f, "lease"),
            ErrorKind::Scheduler => write!(f, "scheduler"),
            ErrorKind::Handler => write!(f, "handler"),
            ErrorKind::Middleware => write!(f, "middleware"),
            ErrorKind::RateLimited => write!(f, "rate limited"),
            ErrorKind::Http => write!(f, "http"),
            ErrorKind::Cancelled => write!(f, "cancelled"),
            ErrorKind::Dead => write!(f, "dead"),
            ErrorKind::Sandbox => write!(f, "sandbox"),
            ErrorKind::Api => write!(f, "api"),
        }
    }
}

pub struct ErrorInner {
    pub kind: ErrorKind,
    pub source: Option<BoxError>,
    pub message: Option<String>,
}

pub struct Error {
    pub inner: Box<ErrorInner>,
}

impl Error {
    pub fn new<E>(kind: ErrorKind, source: Option<E>) -> Error
    where
        E: Into<BoxError>,
    {
        Error {
            inner: Box::new(ErrorInner {
                kind,
                source: source.map(Into::into),
                message: None,
            }),
        }
    }

    pub fn with_message<E>(kind: ErrorKind, message: String, source: Option<E>) -> Error
    where
        E: Into<BoxError>,
    {
        Error {
            inner: Box::new(ErrorInner {
                kind,
                source: source.map(Into::into),
                message: Some(message),
            }),
        }
    }

    pub fn kind(&self) -> &ErrorKind {
        &self.inner.kind
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self.inner.kind, ErrorKind::NotFound)
    }

    pub fn is_read_only(&self) -> bool {
        matches!(self.inner.kind, ErrorKind::ReadOnly)
    }

    pub fn is_validation(&self) -> bool {
        matches!(self.inner.kind, ErrorKind::Validation)
    }

    pub fn is_storage(&self) -> bool {
        matches!(self.inner.kind, ErrorKind::Storage)
    }

    pub fn is_queue(&self) -> bool {
        matches!(self.inner.kind, ErrorKind::Queue)
    }

    pub fn is_handler(&self) -> bool {
        matches!(self.inner.kind, ErrorKind::Handler)
    }

    pub fn is_middleware(&self) -> bool {
        matches!(self.inner.kind, ErrorKind::Middleware)
    }

    pub fn is_rate_limited(&self) -> bool {
        matches!(self.inner.kind, ErrorKind::RateLimited)
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self.inner.kind, ErrorKind::Cancelled)
    }

    pub fn is_http(&self) -> bool {
        matches!(self.inner.kind, ErrorKind::Http)
    }

    /// True when the queue refused an enqueue because the scraper already
    /// has a pending or started task.
    pub fn is_task_active(&self) -> bool {
        self.downcast_source::<QueueError>()
            .map(|e| matches!(e, QueueError::TaskActive))
            .unwrap_or(false)
    }

    /// True when a heartbeat was rejected because the task left `Started`.
    pub fn is_ping_finished(&self) -> bool {
        self.downcast_source::<QueueError>()
            .map(|e| matches!(e, QueueError::PingFinished))
            .unwrap_or(false)
    }

    /// True when an update was rejected because the task is already in a
    /// terminal state.
    pub fn is_terminal_task(&self) -> bool {
        self.downcast_source::<QueueError>()
            .map(|e| matches!(e, QueueError::TerminalTask))
            .unwrap_or(false)
    }

    /// True for a JSON-RPC dispatch of an unknown method.
    pub fn is_method_not_found(&self) -> bool {
        self.downcast_source::<ApiError>()
            .map(|e| matches!(e, ApiError::MethodNotFound(_)))
            .unwrap_or(false)
    }

    /// Middleware name and delay when this is a retry-after signal.
    pub fn retry_after(&self) -> Option<(String, Duration)> {
        self.downcast_source::<MiddlewareError>().and_then(|e| match e {
            MiddlewareError::RetryAfter { name, after } => Some((name.clone(), *after)),
            _ => None,
        })
    }

    fn downcast_source<T: StdError + 'static>(&self) -> Option<&T> {
        self.inner
            .source
            .as_ref()
            .and_then(|s| s.downcast_ref::<T>())
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut f = f.debug_struct("magpie::Error");
        f.field("kind", &self.inner.kind);
        if let Some(ref message) = self.inner.message {
            f.field("message", message);
        }
        if let Some(ref source) = self.inner.source {
            f.field("source", source);
        }
        f.finish()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(ref message) = self.inner.message {
            write!(f, "{} error: {}", self.inner.kind, message)?;
        } else {
            write!(f, "{} error", self.inner.kind)?;
        }

        if let Some(ref source) = self.inner.source {
            write!(f, ": {source}")?;
        }

        Ok(())
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.inner
            .source
            .as_ref()
            .map(|e| &**e as &(dyn StdError + 'static))
    }
}

impl From<StorageError> for Error {
    fn from(err: StorageError) -> Self {
        let kind = match &err {
            StorageError::NotFound => ErrorKind::NotFound,
            StorageError::ReadOnly => ErrorKind::ReadOnly,
            _ => ErrorKind::Storage,
        };
        Error::new(kind, Some(err))
    }
}

impl From<QueueError> for Error {
    fn from(err: QueueError) -> Self {
        let kind = match &err {
            QueueError::TaskNotFound => ErrorKind::NotFound,
            _ => ErrorKind::Queue,
        };
        Error::new(kind, Some(err))
    }
}

impl From<LeaseError> for Error {
    fn from(err: LeaseError) -> Self {
        Error::new(ErrorKind::Lease, Some(err))
    }
}

impl From<SchedulerError> for Error {
    fn from(err: SchedulerError) -> Self {
        let kind = match &err {
            SchedulerError::InvalidCrontab(_) | SchedulerError::MissingCrontab => {
                ErrorKind::Validation
            }
            _ => ErrorKind::Scheduler,
        };
        Error::new(kind, Some(err))
    }
}

impl From<HandlerError> for Error {
    fn from(err: HandlerError) -> Self {
        let kind = match &err {
            HandlerError::Cancelled => ErrorKind::Cancelled,
            HandlerError::Unknown(_) => ErrorKind::Validation,
            _ => ErrorKind::Handler,
        };
        Error::new(kind, Some(err))
    }
}

impl From<MiddlewareError> for Error {
    fn from(err: MiddlewareError) -> Self {
        let kind = match &err {
            MiddlewareError::RateLimited { .. } => ErrorKind::RateLimited,
            _ => ErrorKind::Middleware,
        };
        Error::new(kind, Some(err))
    }
}

impl From<SandboxError> for Error {
    fn from(err: SandboxError) -> Self {
        Error::new(ErrorKind::Sandbox, Some(err))
    }
}

impl From<ApiError> for Error {
    fn from(err: ApiError) -> Self {
        Error::new(ErrorKind::Api, Some(err))
    }
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("entity not found")]
    NotFound,
    #[error("storage is read-only")]
    ReadOnly,
    #[error("backend unavailable: {0}")]
    Unavailable(#[source] BoxError),
    #[error("corrupt record: {0}")]
    Corrupt(#[source] BoxError),
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("task not found")]
    TaskNotFound,
    #[error("concurrent execution of the scraper is disallowed")]
    TaskActive,
    #[error("failed to ping not started task")]
    PingNotStarted,
    #[error("tried to ping finished task")]
    PingFinished,
    #[error("terminal task is immutable")]
    TerminalTask,
    #[error("task has timed out")]
    TaskTimedOut,
    #[error("unknown task handler: {0}")]
    UnknownHandler(String),
}

#[derive(Debug, Error)]
pub enum LeaseError {
    #[error("lease backend failed: {0}")]
    Backend(#[source] BoxError),
}

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("invalid crontab expression: {0}")]
    InvalidCrontab(String),
    #[error("crontab is required for crontab schedule")]
    MissingCrontab,
    #[error("trigger evaluation failed: {0}")]
    Trigger(#[source] BoxError),
}

#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("unknown scraper handler: {0}")]
    Unknown(String),
    #[error("handler failed: {0}")]
    Failed(#[source] BoxError),
    #[error("handler was cancelled")]
    Cancelled,
    #[error("invalid handler params: {0}")]
    InvalidParams(#[source] BoxError),
}

#[derive(Debug, Error)]
pub enum MiddlewareError {
    #[error("middleware {name} dropped the request")]
    Skip { name: String },
    #[error("middleware {name} requested retry after {after:?}")]
    RetryAfter { name: String, after: Duration },
    #[error("middleware {name} violation: {message}")]
    Violation { name: String, message: String },
    #[error("rate limited: {message}")]
    RateLimited { message: String },
    #[error("middleware {name} failed: {source}")]
    Other { name: String, source: BoxError },
}

#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("failed to compile source: {0}")]
    Compile(String),
    #[error("source must define a `handler` function")]
    MissingHandler,
    #[error("script exception: {0}")]
    Exception(String),
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("method not found: {0}")]
    MethodNotFound(String),
    #[error("invalid params: {0}")]
    InvalidParams(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl Error {
    pub fn not_found() -> Self {
        Error::from(StorageError::NotFound)
    }

    pub fn read_only() -> Self {
        Error::from(StorageError::ReadOnly)
    }

    pub fn task_active() -> Self {
        Error::from(QueueError::TaskActive)
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Error::with_message::<BoxError>(ErrorKind::Validation, message.into(), None)
    }

    pub fn cancelled() -> Self {
        Error::new::<BoxError>(ErrorKind::Cancelled, None)
    }

    pub fn http<E: Into<BoxError>>(source: E) -> Self {
        Error::new(ErrorKind::Http, Some(source))
    }

    pub fn storage_unavailable<E: Into<BoxError>>(source: E) -> Self {
        Error::from(StorageError::Unavailable(source.into()))
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::from(StorageError::Corrupt(err.to_string().into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let err = Error::not_found();
        assert!(err.is_not_found());
        assert_eq!(err.to_string(), "not found error: entity not found");
    }

    #[test]
    fn test_error_source() {
        let err = Error::storage_unavailable("connection refused");
        assert!(err.source().is_some());
        assert!(err.is_storage());
    }

    #[test]
    fn test_task_active_downcast() {
        let err = Error::task_active();
        assert!(err.is_task_active());
        assert!(!err.is_ping_finished());
        assert!(err.is_queue());
    }

    #[test]
    fn test_middleware_kinds() {
        let err = Error::from(MiddlewareError::RateLimited {
            message: "too many requests to example.com".into(),
        });
        assert!(err.is_rate_limited());

        let err = Error::from(MiddlewareError::Violation {
            name: "robots_txt".into(),
            message: "disallowed".into(),
        });
        assert!(err.is_middleware());
    }
}
