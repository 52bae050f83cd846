use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use crate::timeout::TimeoutKind;

/// Error type for ureq-engine
///
/// Errors are plain values. The same failure is handed to the
/// [`AsyncHandler`][crate::AsyncHandler] and to every waiter on the
/// [`ResponseFuture`][crate::ResponseFuture], which is why this is `Clone`.
#[derive(Debug, Clone, PartialEq, Eq)]
#[allow(missing_docs)]
#[non_exhaustive]
pub enum Error {
    TooManyConnections(usize),
    TooManyConnectionsPerPartition(usize),
    PoolClosed,
    ClientClosed,
    Timeout {
        kind: TimeoutKind,
        after: Duration,
        remote: Option<SocketAddr>,
    },
    ConnectTimeout {
        after: Duration,
        remote: SocketAddr,
    },
    TooManyRedirects(u32),
    NoLocationHeader,
    BadLocationHeader(String),
    BadHeader(String),
    BadUri(String),
    Resolve(String),
    NoAddress(String),
    Io {
        kind: io::ErrorKind,
        message: String,
    },
    RemotelyClosed,
    Protocol(String),
    BodyNotReplayable,
    Body(String),
    BodyExceedsLimit(usize),
    Auth(String),
    Handler(String),
    Filter(String),
    HandlerPanicked,
    Cancelled,
}

/// Classification of a failed attempt, deciding whether it can be retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// No byte of the request reached the peer. Safe to retry on a new connection.
    NotDelivered,

    /// Some of the request was delivered. Only idempotent or explicitly
    /// replayable requests may be retried.
    PartiallyDelivered,

    /// Never retried, surfaced to the caller as is.
    Fatal,
}

impl Error {
    /// Tell if this is an I/O level failure of the connection.
    pub fn is_io(&self) -> bool {
        matches!(self, Error::Io { .. } | Error::RemotelyClosed)
    }

    /// Tell if this error was produced by one of the timers.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout { .. } | Error::ConnectTimeout { .. })
    }

    /// Classify the error given whether any request bytes were delivered
    /// before it happened.
    pub fn class(&self, request_sent: bool) -> FailureClass {
        // One address timing out says nothing about the next one.
        if matches!(self, Error::ConnectTimeout { .. }) {
            return FailureClass::NotDelivered;
        }

        if !self.is_io() {
            return FailureClass::Fatal;
        }

        if request_sent {
            FailureClass::PartiallyDelivered
        } else {
            FailureClass::NotDelivered
        }
    }
}

impl From<io::Error> for Error {
    fn from(value: io::Error) -> Self {
        match value.kind() {
            io::ErrorKind::UnexpectedEof => Error::RemotelyClosed,
            kind => Error::Io {
                kind,
                message: value.to_string(),
            },
        }
    }
}

impl From<http::Error> for Error {
    fn from(value: http::Error) -> Self {
        Error::BadHeader(value.to_string())
    }
}

impl std::error::Error for Error {}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::TooManyConnections(max) => {
                write!(f, "too many connections: max {} reached", max)
            }
            Error::TooManyConnectionsPerPartition(max) => {
                write!(f, "too many connections per partition: max {} reached", max)
            }
            Error::PoolClosed => write!(f, "connection pool is closed"),
            Error::ClientClosed => write!(f, "client is closed"),
            Error::Timeout {
                kind,
                after,
                remote,
            } => {
                write!(f, "{} of {}ms", kind, after.as_millis())?;
                if let Some(remote) = remote {
                    write!(f, " to {}", remote)?;
                }
                Ok(())
            }
            Error::ConnectTimeout { after, remote } => {
                write!(f, "connect timeout of {}ms to {}", after.as_millis(), remote)
            }
            Error::TooManyRedirects(max) => write!(f, "maximum redirects reached: {}", max),
            Error::NoLocationHeader => write!(f, "missing a location header"),
            Error::BadLocationHeader(v) => write!(f, "location header is malformed: {}", v),
            Error::BadHeader(v) => write!(f, "bad header: {}", v),
            Error::BadUri(v) => write!(f, "bad uri: {}", v),
            Error::Resolve(v) => write!(f, "failed to resolve host: {}", v),
            Error::NoAddress(v) => write!(f, "no address resolved for host: {}", v),
            Error::Io { kind, message } => write!(f, "io error ({:?}): {}", kind, message),
            Error::RemotelyClosed => write!(f, "connection closed by peer"),
            Error::Protocol(v) => write!(f, "protocol error: {}", v),
            Error::BodyNotReplayable => write!(f, "request body cannot be sent again"),
            Error::Body(v) => write!(f, "request body failed: {}", v),
            Error::BodyExceedsLimit(max) => {
                write!(f, "response body exceeds limit of {} bytes", max)
            }
            Error::Auth(v) => write!(f, "authentication failed: {}", v),
            Error::Handler(v) => write!(f, "handler failed: {}", v),
            Error::Filter(v) => write!(f, "filter failed: {}", v),
            Error::HandlerPanicked => write!(f, "handler panicked"),
            Error::Cancelled => write!(f, "request was cancelled"),
        }
    }
}
