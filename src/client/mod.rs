//! Request execution
//!
//! [`Client::execute`] spawns a task per request. The task runs one or more
//! Attempts, each a connect, write and read cycle encoded as typed states,
//! for example `Attempt<RequestSent>` for the stage where the request is
//! written and the status is awaited.
//!
//! The states are:
//!
//! * **Connecting** - Reuse the connection from an auth handshake, lease an
//!   idle pooled connection, or take a pool slot and dial a new one
//! * **Connected** - Write the request head and stream the body
//! * **RequestSent** - Await the status, skipping interim `1xx` responses
//! * **StatusReceived** - Await the response headers
//! * **HeadersReceived** - Run response filters, answer auth challenges and
//!   follow redirects, otherwise hand status and headers to the handler
//! * **BodyReceiving** - Stream body parts to the handler, then offer the
//!   connection back to the pool
//!
//! ```text
//!                            ┌──────────────────┐
//! ┌ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ▶│    Connecting    │◀ ─ ─ ─ ─ ─ ─ ─ ─ ─ ┐
//!                            └──────────────────┘
//! │                                    │                               │
//!                                      ▼
//! │                          ┌──────────────────┐                      │
//!                            │    Connected     │─────────────┐
//! │                          └──────────────────┘             │        │
//!                                      │                      │
//! │                                    ▼                      │        │
//!                            ┌──────────────────┐             │
//! │                          │   RequestSent    │─────────────┤        │
//!                            └──────────────────┘             │
//! │                                    │                      │        │
//!                                      ▼                      │
//! │                          ┌──────────────────┐             │        │
//!                            │  StatusReceived  │─────────────┤
//! │                          └──────────────────┘             │        │
//!                                      │                      │
//! │                                    ▼                      ▼        │
//!    ┌──────────────────┐    ┌──────────────────┐    ┌──────────────────┐
//! └ ─│ Redirect / Auth  │◀───│ HeadersReceived  │    │  Retry / Replay  │
//!    └──────────────────┘    └──────────────────┘    └──────────────────┘
//!                                      │
//!                                      ▼
//!                            ┌──────────────────┐
//!                            │  BodyReceiving   │
//!                            └──────────────────┘
//!                                      │
//!                                      ▼
//!                            ┌──────────────────┐
//!                            │       Done       │
//!                            └──────────────────┘
//! ```
//!
//! Every Attempt is raced against its request and idle timers and against
//! cancellation of the [`ResponseFuture`]. Whichever ends first drops the
//! others, which closes the connection and the request body.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

use crate::pool::ConnectionPool;
use crate::{AsyncHandler, Authenticator, BasicAuthenticator, Config, Error, Request};
use crate::{Response, ResponseCollector, ResponseFuture, Transport};

mod amended;
mod attempt;
mod connect;
mod redirect;
mod task;

use self::task::RequestTask;

#[cfg(test)]
mod test;

/// Executes requests over a [`Transport`], pooling its connections.
///
/// Cheap to clone, clones share the pool.
pub struct Client<T: Transport> {
    inner: Arc<ClientInner<T>>,
}

pub(crate) struct ClientInner<T: Transport> {
    pub config: Config,
    pub transport: T,
    pub pool: ConnectionPool<T::Conn>,
    pub authenticator: Arc<dyn Authenticator>,
    closed: AtomicBool,
    cleaner: Mutex<Option<JoinHandle<()>>>,
}

impl<T: Transport> Client<T> {
    /// Create a client answering Basic challenges only.
    ///
    /// Idle connections are reaped periodically when created inside a tokio
    /// runtime.
    pub fn new(transport: T, config: Config) -> Self {
        Self::with_authenticator(transport, config, Arc::new(BasicAuthenticator))
    }

    /// Create a client with an [`Authenticator`] for auth challenges.
    pub fn with_authenticator(
        transport: T,
        config: Config,
        authenticator: Arc<dyn Authenticator>,
    ) -> Self {
        let pool = ConnectionPool::new(&config);

        let cleaner = if Handle::try_current().is_ok() {
            Some(pool.spawn_cleaner(config.pool_cleaner_period))
        } else {
            debug!("No runtime, idle connections are only reaped on lease");
            None
        };

        Client {
            inner: Arc::new(ClientInner {
                config,
                transport,
                pool,
                authenticator,
                closed: AtomicBool::new(false),
                cleaner: Mutex::new(cleaner),
            }),
        }
    }

    /// Execute `request`, streaming the response to `handler`.
    ///
    /// Must be called within a tokio runtime. The returned future resolves
    /// exactly once, with the handler's result or the error that ended the
    /// request.
    pub fn execute<H: AsyncHandler>(
        &self,
        request: Request,
        handler: H,
    ) -> ResponseFuture<H::Output> {
        if self.is_closed() {
            return self.reject(handler, Error::ClientClosed);
        }

        let request = match self.inner.config.filters.apply_request(request) {
            Ok(v) => v,
            Err(e) => {
                debug!("Request rejected by filter: {}", e);
                return self.reject(handler, e);
            }
        };

        let max_retry = request
            .max_request_retry()
            .unwrap_or(self.inner.config.max_request_retry);
        let future = ResponseFuture::new(max_retry);

        debug!("Execute {:?}", request);

        let task = RequestTask::new(self.inner.clone(), handler, future.clone(), request);
        let running = tokio::spawn(task.run());

        // A task that dies without resolving must not leave the future pending.
        let watched = future.clone();
        tokio::spawn(async move {
            if let Err(e) = running.await {
                let error = if e.is_panic() {
                    warn!("Request task panicked");
                    Error::HandlerPanicked
                } else {
                    Error::ClientClosed
                };
                watched.abandon(error);
            }
        });

        future
    }

    fn reject<H: AsyncHandler>(&self, mut handler: H, error: Error) -> ResponseFuture<H::Output> {
        let future = ResponseFuture::new(self.inner.config.max_request_retry);
        handler.on_throwable(&error);
        future.abandon(error);
        future
    }

    /// Execute `request`, collecting the response in memory.
    pub fn send(&self, request: Request) -> ResponseFuture<Response> {
        self.execute(request, ResponseCollector::new())
    }

    /// Close the client.
    ///
    /// Idle connections are closed, in flight requests fail when they next
    /// need a connection and new requests fail with [`Error::ClientClosed`].
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!("Close client");
        if let Some(cleaner) = self.inner.cleaner.lock().take() {
            cleaner.abort();
        }
        self.inner.pool.destroy();
    }

    /// Whether [`Client::close`] was called.
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// The configuration.
    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// The connection pool, for statistics and flushing.
    pub fn pool(&self) -> &ConnectionPool<T::Conn> {
        &self.inner.pool
    }
}

impl<T: Transport> Clone for Client<T> {
    fn clone(&self) -> Self {
        Client {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Transport> std::fmt::Debug for Client<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("pool", &self.inner.pool)
            .field("closed", &self.is_closed())
            .finish()
    }
}
