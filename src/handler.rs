use std::any::Any;
use std::fmt;
use std::net::SocketAddr;

use bytes::Bytes;
use http::{HeaderMap, StatusCode, Uri, Version};

use crate::{Error, PartitionKey, RequestHead};

/// What the engine should do after a handler callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerState {
    /// Keep delivering the response.
    Continue,

    /// Stop reading. The connection is closed instead of pooled and the
    /// request completes with whatever the handler has so far.
    Abort,

    /// Hand the connection over to [`AsyncHandler::on_upgrade`].
    Upgrade,
}

/// Status line of a response, with where it came from.
#[derive(Debug, Clone)]
pub struct ResponseStatus {
    /// The uri of the Attempt that produced the response. After redirects
    /// this is the last hop.
    pub uri: Uri,
    /// Response version.
    pub version: Version,
    /// Response status.
    pub status: StatusCode,
    /// Remote address of the connection.
    pub remote: SocketAddr,
}

/// A connection handed over to the handler after an upgrade.
///
/// The engine no longer owns or accounts for the connection. Recover the
/// transport's connection type with [`Upgraded::downcast`].
pub struct Upgraded {
    conn: Box<dyn Any + Send>,
    key: PartitionKey,
    remote: SocketAddr,
}

impl Upgraded {
    pub(crate) fn new<C: Send + 'static>(conn: C, key: PartitionKey, remote: SocketAddr) -> Self {
        Upgraded {
            conn: Box::new(conn),
            key,
            remote,
        }
    }

    /// Partition the connection was opened for.
    pub fn partition(&self) -> &PartitionKey {
        &self.key
    }

    /// Remote address of the connection.
    pub fn remote_addr(&self) -> SocketAddr {
        self.remote
    }

    /// Take out the connection as the transport's connection type.
    pub fn downcast<C: 'static>(self) -> Result<C, Upgraded> {
        let Upgraded { conn, key, remote } = self;
        match conn.downcast::<C>() {
            Ok(c) => Ok(*c),
            Err(conn) => Err(Upgraded { conn, key, remote }),
        }
    }
}

impl fmt::Debug for Upgraded {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Upgraded")
            .field("key", &self.key)
            .field("remote", &self.remote)
            .finish()
    }
}

/// Receives the response of a request, piece by piece.
///
/// Callbacks for one Attempt arrive strictly in order, status, headers, body
/// parts, then exactly one of [`AsyncHandler::on_completed`] or
/// [`AsyncHandler::on_throwable`] for the whole request. Attempts that are
/// retried, redirected or answered with an auth challenge never reach the
/// handler's response callbacks.
///
/// The lifecycle methods are notifications only and default to doing nothing.
pub trait AsyncHandler: Send + 'static {
    /// The value the request resolves to.
    type Output: Send + 'static;

    /// The status line arrived.
    fn on_status_received(&mut self, status: &ResponseStatus) -> HandlerState;

    /// All headers arrived.
    fn on_headers_received(&mut self, headers: &HeaderMap) -> HandlerState;

    /// A piece of the body arrived.
    fn on_body_part_received(&mut self, part: &Bytes) -> HandlerState;

    /// The response is complete (or was aborted by the handler).
    fn on_completed(&mut self) -> Result<Self::Output, Error>;

    /// The request failed.
    fn on_throwable(&mut self, error: &Error);

    /// The handler returned [`HandlerState::Upgrade`] and now owns the connection.
    fn on_upgrade(&mut self, upgraded: Upgraded) -> Result<(), Error> {
        drop(upgraded);
        Err(Error::Protocol("handler does not support upgrades".into()))
    }

    /// About to resolve `host`.
    fn on_hostname_resolution_attempt(&mut self, host: &str) {
        let _ = host;
    }

    /// `host` resolved to `addrs`.
    fn on_hostname_resolved(&mut self, host: &str, addrs: &[SocketAddr]) {
        let _ = (host, addrs);
    }

    /// About to open a connection to `addr`.
    fn on_tcp_connect_attempt(&mut self, addr: SocketAddr) {
        let _ = addr;
    }

    /// A connection to `addr` was opened.
    fn on_tcp_connect_success(&mut self, addr: SocketAddr) {
        let _ = addr;
    }

    /// Opening a connection to `addr` failed.
    fn on_tcp_connect_failure(&mut self, addr: SocketAddr, error: &Error) {
        let _ = (addr, error);
    }

    /// A TLS connection completed its handshake.
    fn on_tls_handshake_completed(&mut self) {}

    /// About to look for an idle connection in the pool.
    fn on_connection_pool_attempt(&mut self) {}

    /// A pooled connection to `remote` is reused.
    fn on_connection_pooled(&mut self, remote: SocketAddr) {
        let _ = remote;
    }

    /// The connection to `remote` is offered back to the pool.
    fn on_connection_offer(&mut self, remote: SocketAddr) {
        let _ = remote;
    }

    /// About to write the request.
    fn on_request_send(&mut self, head: &RequestHead) {
        let _ = head;
    }

    /// A failed Attempt is retried.
    fn on_retry(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn downcast_upgraded() {
        let key = PartitionKey::new(&"ws://foo.test/".parse().unwrap(), None, None).unwrap();
        let remote: SocketAddr = "127.0.0.1:80".parse().unwrap();

        let up = Upgraded::new(42_u32, key.clone(), remote);
        let up = up.downcast::<String>().unwrap_err();
        assert_eq!(up.partition(), &key);
        assert_eq!(up.remote_addr(), remote);
        assert_eq!(up.downcast::<u32>().unwrap(), 42);
    }
}
