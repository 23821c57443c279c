//! Error types for the netloop engine

use core::fmt;

/// Result type for engine operations
pub type NetResult<T> = Result<T, NetError>;

/// Errors that can occur in engine operations
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetError {
    /// Bounded task queue is at capacity
    QueueFull,

    /// Task submitted to an executor that is already shut down
    Terminated,

    /// Operation not accepted while shutting down
    ShuttingDown,

    /// Channel is closed
    ChannelClosed,

    /// Operation requires a registered channel
    NotRegistered,

    /// Channel is already registered with an executor
    AlreadyRegistered,

    /// A connect is already in flight on this channel
    ConnectPending,

    /// Connect did not complete before the configured deadline
    ConnectTimeout,

    /// Synchronous wait gave up before the operation resolved
    Timeout,

    /// Asynchronous operation was cancelled
    Cancelled,

    /// Pipeline already contains a handler with this name
    DuplicateHandler(String),

    /// No live handler context with this name
    HandlerNotFound(String),

    /// A handler lifecycle callback failed and removing the handler
    /// failed as well
    RemovalAlsoFailed(String),

    /// Handler-reported failure carried through the exception path
    Handler(String),

    /// Operation not supported by this transport or executor
    Unsupported(&'static str),

    /// Invalid configuration value
    InvalidConfig(&'static str),

    /// OS-level error (raw errno)
    Os(i32),
}

impl fmt::Display for NetError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NetError::QueueFull => write!(f, "task queue full"),
            NetError::Terminated => write!(f, "executor terminated"),
            NetError::ShuttingDown => write!(f, "executor shutting down"),
            NetError::ChannelClosed => write!(f, "channel closed"),
            NetError::NotRegistered => write!(f, "channel not registered"),
            NetError::AlreadyRegistered => write!(f, "channel already registered"),
            NetError::ConnectPending => write!(f, "connect already in progress"),
            NetError::ConnectTimeout => write!(f, "connect timed out"),
            NetError::Timeout => write!(f, "wait timed out"),
            NetError::Cancelled => write!(f, "operation cancelled"),
            NetError::DuplicateHandler(name) => {
                write!(f, "duplicate handler name: {}", name)
            }
            NetError::HandlerNotFound(name) => write!(f, "handler not found: {}", name),
            NetError::RemovalAlsoFailed(name) => {
                write!(f, "handler {} failed and could not be removed", name)
            }
            NetError::Handler(msg) => write!(f, "handler error: {}", msg),
            NetError::Unsupported(what) => write!(f, "unsupported operation: {}", what),
            NetError::InvalidConfig(msg) => write!(f, "invalid config: {}", msg),
            NetError::Os(errno) => write!(f, "os error: errno {}", errno),
        }
    }
}

impl std::error::Error for NetError {}

impl From<std::io::Error> for NetError {
    fn from(e: std::io::Error) -> Self {
        NetError::Os(e.raw_os_error().unwrap_or(0))
    }
}

impl NetError {
    /// Capture the calling thread's current errno
    pub fn last_os_error() -> NetError {
        NetError::from(std::io::Error::last_os_error())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        assert_eq!(format!("{}", NetError::ConnectTimeout), "connect timed out");
        assert_eq!(
            format!("{}", NetError::DuplicateHandler("decoder".into())),
            "duplicate handler name: decoder"
        );
        assert_eq!(format!("{}", NetError::Os(111)), "os error: errno 111");
    }

    #[test]
    fn test_io_error_conversion() {
        let io = std::io::Error::from_raw_os_error(111);
        let e: NetError = io.into();
        assert_eq!(e, NetError::Os(111));
    }
}
