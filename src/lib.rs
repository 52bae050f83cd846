//! Async HTTP request execution engine.
//!
//! Given a [`Request`] and an [`AsyncHandler`], the engine acquires or opens a
//! connection, writes the request, streams the response back through the
//! handler and transparently handles redirects, retries, authentication
//! challenges and timeouts. The result is observed through a
//! [`ResponseFuture`] that resolves exactly once.
//!
//! The engine does not speak any wire format itself. Opening sockets, TLS,
//! DNS and HTTP/1.1 framing are provided by a [`Transport`] implementation,
//! and the engine only depends on that narrow surface.
//!
//! # Example
//!
//! ```no_run
//! # async fn run<T: ureq_engine::Transport>(transport: T) -> Result<(), ureq_engine::Error> {
//! use ureq_engine::{Client, Config, Request, ResponseCollector};
//!
//! let config = Config::default()
//!     .follow_redirect(true)
//!     .max_connections_per_partition(8);
//!
//! let client = Client::new(transport, config);
//!
//! let request = Request::get("https://example.test/my-path")
//!     .header("x-foo", "bar")
//!     .build()?;
//!
//! let response = client.execute(request, ResponseCollector::new()).get().await?;
//!
//! assert_eq!(response.status(), 200);
//! # Ok(())
//! # }
//! ```
//!
//! # In scope:
//!
//! * Connection pooling partitioned per (scheme, host, port, proxy, virtual host)
//! * Admission control (global and per partition connection limits)
//! * Request and idle (read) timeouts racing each attempt
//! * Retry of attempts that provably did not reach the server
//! * Redirect following and authentication challenge retries
//! * Incremental request bodies, including bodies fed asynchronously
//! * Request, response and I/O error filters, which may replay a request
//!
//! # Out of scope:
//!
//! * Wire-format encoding and decoding of HTTP messages
//! * TLS, DNS and socket handling
//! * Cookie jars
//! * Computing Digest/NTLM/Negotiate credentials

#![forbid(unsafe_code)]
#![warn(clippy::all)]
#![deny(missing_docs)]

#[macro_use]
extern crate log;

mod error;
pub use error::{Error, FailureClass};

mod close_reason;
pub use close_reason::CloseReason;

pub mod body;

mod config;
pub use config::{Config, RedirectAuthHeaders};

mod partition;
pub use partition::{PartitionKey, ProxyServer};

mod auth;
pub use auth::{AuthScheme, AuthTarget, Authenticator, BasicAuthenticator, Challenge, Realm};

mod request;
pub use request::{Request, RequestBuilder};

pub mod filter;

mod transport;
pub use transport::{Connection, RequestHead, ResponseEvent, Transport};

mod handler;
pub use handler::{AsyncHandler, HandlerState, ResponseStatus, Upgraded};

mod response;
pub use response::{Response, ResponseCollector};

pub mod pool;

mod timeout;
pub use timeout::{TimeoutKind, TimeoutSignal, TimeoutsHolder};

mod future;
pub use future::{Executor, FutureState, Inline, ResponseFuture};

pub mod client;
pub use client::Client;

// Re-export the basis for this library.
pub use http;
