/// Reasons for not returning a connection to the pool.
///
/// Once any reason has been recorded for an Attempt, the connection is closed
/// when the Attempt ends instead of being offered back to its partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// HTTP/1.0 requires each request-response to end with a close.
    Http10,

    /// Client sent `connection: close`.
    ClientConnectionClose,

    /// Server sent `connection: close`.
    ServerConnectionClose,

    /// Keep-alive is disabled in the client configuration.
    KeepAliveDisabled,

    /// The handler aborted the response before it was fully read.
    ///
    /// The read state of the connection is undefined.
    HandlerAborted,

    /// A redirect or auth challenge response body could not be drained.
    BodyNotDrained,
}

impl CloseReason {
    pub(crate) fn explain(&self) -> &'static str {
        match self {
            CloseReason::Http10 => "version is http1.0",
            CloseReason::ClientConnectionClose => "client sent Connection: close",
            CloseReason::ServerConnectionClose => "server sent Connection: close",
            CloseReason::KeepAliveDisabled => "keep-alive is disabled",
            CloseReason::HandlerAborted => "handler aborted the response",
            CloseReason::BodyNotDrained => "response body was not drained",
        }
    }
}
