//! The narrow surface the engine needs from the network.

use std::io;
use std::net::SocketAddr;

use async_trait::async_trait;
use bytes::Bytes;
use http::{HeaderMap, Method, StatusCode, Uri, Version};

use crate::body::RandomAccessBody;
use crate::{Error, PartitionKey, ProxyServer};

/// The request line and headers of one Attempt, as handed to the transport.
#[derive(Debug, Clone)]
pub struct RequestHead {
    /// Request method.
    pub method: Method,
    /// Full target uri. The transport decides between origin and absolute form.
    pub uri: Uri,
    /// HTTP version.
    pub version: Version,
    /// Headers, including the ones added by the engine (`host`, auth).
    pub headers: HeaderMap,
    /// Body length. `None` when there is no body, `Some(-1)` when unknown.
    pub content_length: Option<i64>,
    /// Proxy the request goes through.
    pub proxy: Option<ProxyServer>,
}

/// Parsed parts of a response, in the order they arrive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseEvent {
    /// The status line.
    Status {
        /// Response version.
        version: Version,
        /// Response status.
        status: StatusCode,
    },
    /// All response headers.
    Headers(HeaderMap),
    /// A piece of the response body.
    BodyPart(Bytes),
    /// The response is complete.
    End,
}

/// Resolves hosts and opens connections.
///
/// Implementations own sockets, TLS and HTTP/1.1 framing. One instance is
/// shared by all requests of a [`Client`][crate::Client].
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// The connection type produced by this transport.
    type Conn: Connection;

    /// Resolve a host name to socket addresses.
    async fn resolve(&self, host: &str, port: u16) -> Result<Vec<SocketAddr>, Error>;

    /// Open a connection to `addr` for requests in partition `key`.
    ///
    /// For secure partitions this includes the TLS handshake.
    async fn connect(&self, addr: SocketAddr, key: &PartitionKey) -> Result<Self::Conn, Error>;
}

/// One open connection.
///
/// The engine calls [`Connection::close`] exactly once before dropping a
/// connection it will not reuse.
#[async_trait]
pub trait Connection: Send + 'static {
    /// Whether the peer has not closed the connection, as far as is known
    /// without reading from it.
    fn is_open(&self) -> bool;

    /// The remote socket address.
    fn remote_addr(&self) -> SocketAddr;

    /// Whether the connection is TLS.
    fn is_secure(&self) -> bool;

    /// Whether [`Connection::send_file_region`] bypasses intermediate buffers.
    fn supports_zero_copy(&self) -> bool {
        false
    }

    /// Write the request line and headers.
    async fn write_head(&mut self, head: &RequestHead) -> Result<(), Error>;

    /// Write a piece of the request body.
    async fn write_body(&mut self, data: Bytes) -> Result<(), Error>;

    /// Send a whole random access body, returning the number of bytes sent.
    async fn send_file_region(&mut self, body: &mut dyn RandomAccessBody) -> Result<u64, Error> {
        let _ = body;
        Err(io::Error::new(io::ErrorKind::Unsupported, "zero copy not supported").into())
    }

    /// Mark the end of the request.
    async fn finish_request(&mut self) -> Result<(), Error>;

    /// Read the next part of the response.
    async fn read_event(&mut self) -> Result<ResponseEvent, Error>;

    /// Close the connection. Must not block, it is called from sync contexts
    /// such as the pool cleaner.
    fn close(&mut self);
}
