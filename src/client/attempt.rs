//! One connect, write and read cycle of a request.
//!
//! An [`Attempt`] moves through typed states, each step consuming the
//! previous state. Redirects, auth challenges and completion end the Attempt
//! with an [`Outcome`]. Failures end it with a [`Failure`] the task
//! classifies for retry.

use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::BytesMut;
use http::{HeaderMap, StatusCode, Version};
use tokio::sync::Notify;

use crate::auth::parse_challenges;
use crate::body::{Body, BodyState};
use crate::pool::Leased;
use crate::{AsyncHandler, AuthScheme, AuthTarget, CloseReason, Connection, Error};
use crate::{HandlerState, PartitionKey, Request, RequestHead, ResponseEvent, ResponseFuture};
use crate::{ResponseStatus, TimeoutsHolder, Transport, Upgraded};

use super::amended::{build_head, has_connection_close};
use super::connect::{open_connection, Addresses};
use super::redirect;
use super::ClientInner;

pub(crate) mod state {
    pub(crate) trait Named {
        fn name() -> &'static str;
    }

    macro_rules! attempt_state {
        ($n:tt) => {
            pub(crate) enum $n {}
            impl Named for $n {
                fn name() -> &'static str {
                    stringify!($n)
                }
            }
        };
    }

    attempt_state!(Connecting);
    attempt_state!(Connected);
    attempt_state!(RequestSent);
    attempt_state!(StatusReceived);
    attempt_state!(HeadersReceived);
    attempt_state!(BodyReceiving);
}
use self::state::*;

// Challenges answered per scheme before the response is handed to the handler.
const MAX_HANDSHAKE_STEPS: u32 = 3;

/// What an Attempt borrows from its request task.
pub(crate) struct Ctx<'a, T: Transport, H: AsyncHandler> {
    pub client: &'a Arc<ClientInner<T>>,
    pub handler: &'a mut H,
    pub future: &'a ResponseFuture<H::Output>,
    pub request: &'a Request,
    pub timeouts: &'a TimeoutsHolder,
    pub addresses: &'a mut Option<Addresses>,
    pub auth: &'a mut AuthProgress,
}

/// Challenges answered so far, per target and scheme.
#[derive(Debug, Default)]
pub(crate) struct AuthProgress {
    steps: HashMap<(AuthTarget, AuthScheme), u32>,
}

impl AuthProgress {
    fn step(&self, target: AuthTarget, scheme: AuthScheme) -> u32 {
        self.steps.get(&(target, scheme)).copied().unwrap_or(0)
    }

    fn record(&mut self, target: AuthTarget, scheme: AuthScheme) {
        *self.steps.entry((target, scheme)).or_insert(0) += 1;
    }

    pub fn reset(&mut self) {
        self.steps.clear();
    }
}

/// How an Attempt ended, when it did not fail.
pub(crate) enum Outcome<C: Connection> {
    /// The response was delivered (or aborted by the handler).
    Done,

    /// Follow to the derived request.
    Redirect(Request),

    /// A filter asked to execute this request instead.
    Replay(Request),

    /// Answer an auth challenge. `conn` is the connection to continue a
    /// connection oriented handshake on.
    AuthRetry {
        request: Request,
        conn: Option<Leased<C>>,
    },
}

/// A failed Attempt, with what is known about how far it got.
#[derive(Debug)]
pub(crate) struct Failure {
    pub error: Error,
    /// The request head was written.
    pub sent: bool,
    /// Data was pulled from the request body.
    pub body_consumed: bool,
    /// A final response status was received.
    pub responded: bool,
}

impl Failure {
    fn before_send(error: Error) -> Self {
        Failure {
            error,
            sent: false,
            body_consumed: false,
            responded: false,
        }
    }
}

/// An Attempt in some state of the request lifecycle.
pub(crate) struct Attempt<'a, T: Transport, H: AsyncHandler, State> {
    inner: Inner<'a, T, H>,
    _ph: PhantomData<State>,
}

struct Inner<'a, T: Transport, H: AsyncHandler> {
    ctx: Ctx<'a, T, H>,
    key: PartitionKey,
    head: RequestHead,
    conn: Leased<T::Conn>,
    remote: SocketAddr,
    sent: bool,
    body_consumed: bool,
    responded: bool,
    version: Version,
    status: StatusCode,
    headers: HeaderMap,
    close_reason: Vec<CloseReason>,
}

pub(crate) enum Intercepted<'a, T: Transport, H: AsyncHandler> {
    Proceed(Attempt<'a, T, H, HeadersReceived>),
    Done(Outcome<T::Conn>),
}

pub(crate) enum Delivered<'a, T: Transport, H: AsyncHandler> {
    Body(Attempt<'a, T, H, BodyReceiving>),
    Done(Outcome<T::Conn>),
}

/// Run one Attempt to its end.
pub(crate) async fn run<T: Transport, H: AsyncHandler>(
    ctx: Ctx<'_, T, H>,
    reuse: Option<Leased<T::Conn>>,
) -> Result<Outcome<T::Conn>, Failure> {
    let attempt = Attempt::connect(ctx, reuse).await?;
    let attempt = attempt.send_request().await?;
    let attempt = attempt.recv_status().await?;
    let attempt = attempt.recv_headers().await?;

    let attempt = match attempt.intercept().await? {
        Intercepted::Proceed(v) => v,
        Intercepted::Done(outcome) => return Ok(outcome),
    };

    let attempt = match attempt.deliver()? {
        Delivered::Body(v) => v,
        Delivered::Done(outcome) => return Ok(outcome),
    };

    attempt.recv_body().await
}

impl<'a, T: Transport, H: AsyncHandler, S: Named> Attempt<'a, T, H, S> {
    fn wrap(inner: Inner<'a, T, H>) -> Attempt<'a, T, H, S> {
        let wrapped = Attempt {
            inner,
            _ph: PhantomData,
        };

        debug!("{:?}", wrapped);

        wrapped
    }
}

impl<'a, T: Transport, H: AsyncHandler> Attempt<'a, T, H, Connecting> {
    async fn connect(
        mut ctx: Ctx<'a, T, H>,
        reuse: Option<Leased<T::Conn>>,
    ) -> Result<Attempt<'a, T, H, Connected>, Failure> {
        debug!("Attempt<{}>", Connecting::name());

        let request = ctx.request;
        let config = &ctx.client.config;

        let key = PartitionKey::new(request.uri(), request.proxy(), request.virtual_host())
            .map_err(Failure::before_send)?;
        let head = build_head(request, config).map_err(Failure::before_send)?;

        let mut close_reason = Vec::new();
        if !config.keep_alive {
            close_reason.push(CloseReason::KeepAliveDisabled);
        } else if has_connection_close(&head.headers) {
            close_reason.push(CloseReason::ClientConnectionClose);
        }

        let conn = open_connection(&mut ctx, &key, reuse)
            .await
            .map_err(Failure::before_send)?;

        let remote = conn.remote_addr();
        ctx.timeouts.set_remote(remote);

        Ok(Attempt::wrap(Inner {
            ctx,
            key,
            head,
            conn,
            remote,
            sent: false,
            body_consumed: false,
            responded: false,
            version: Version::HTTP_11,
            status: StatusCode::OK,
            headers: HeaderMap::new(),
            close_reason,
        }))
    }
}

impl<'a, T: Transport, H: AsyncHandler> Attempt<'a, T, H, Connected> {
    async fn send_request(mut self) -> Result<Attempt<'a, T, H, RequestSent>, Failure> {
        let inner = &mut self.inner;
        let request = inner.ctx.request;

        let body = match request.body() {
            Some(gen) => {
                let body = gen
                    .create_body()
                    .map_err(|e| inner.fail(Error::Body(e.to_string())))?;
                Some(OpenBody::new(body))
            }
            None => None,
        };

        if let Some(body) = &body {
            inner.head.content_length = Some(body.content_length());
        }

        inner.ctx.handler.on_request_send(&inner.head);

        // A head that failed to be written can't have been processed.
        let result = inner.conn.write_head(&inner.head).await;
        result.map_err(|e| inner.fail(e))?;

        inner.sent = true;
        inner.ctx.timeouts.touch();

        if let Some(body) = body {
            inner.send_body(body).await?;
        }

        let result = inner.conn.finish_request().await;
        result.map_err(|e| inner.fail(e))?;
        inner.ctx.timeouts.touch();

        Ok(Attempt::wrap(self.inner))
    }
}

impl<'a, T: Transport, H: AsyncHandler> Attempt<'a, T, H, RequestSent> {
    async fn recv_status(mut self) -> Result<Attempt<'a, T, H, StatusReceived>, Failure> {
        let inner = &mut self.inner;
        let mut interim = false;

        loop {
            match inner.read().await? {
                ResponseEvent::Status { version, status } => {
                    if status.is_informational() && status != StatusCode::SWITCHING_PROTOCOLS {
                        trace!("Skip interim response: {}", status);
                        interim = true;
                        continue;
                    }

                    inner.responded = true;
                    inner.version = version;
                    inner.status = status;

                    if version == Version::HTTP_10 {
                        inner.close_reason.push(CloseReason::Http10);
                    }

                    break;
                }
                ResponseEvent::Headers(_) if interim => {
                    interim = false;
                }
                ev => return Err(inner.unexpected("status", &ev)),
            }
        }

        Ok(Attempt::wrap(self.inner))
    }
}

impl<'a, T: Transport, H: AsyncHandler> Attempt<'a, T, H, StatusReceived> {
    async fn recv_headers(mut self) -> Result<Attempt<'a, T, H, HeadersReceived>, Failure> {
        let inner = &mut self.inner;

        match inner.read().await? {
            ResponseEvent::Headers(headers) => {
                if has_connection_close(&headers) {
                    inner.close_reason.push(CloseReason::ServerConnectionClose);
                }
                inner.headers = headers;
            }
            ev => return Err(inner.unexpected("headers", &ev)),
        }

        Ok(Attempt::wrap(self.inner))
    }
}

impl<'a, T: Transport, H: AsyncHandler> Attempt<'a, T, H, HeadersReceived> {
    /// Handle filters, auth challenges and redirects before the handler
    /// sees anything.
    async fn intercept(mut self) -> Result<Intercepted<'a, T, H>, Failure> {
        let status = self.inner.status;
        let request = self.inner.ctx.request;
        let client = self.inner.ctx.client;
        let config = &client.config;

        if config.filters.has_response() {
            let replay = config
                .filters
                .apply_response(request, self.inner.response_status(), &self.inner.headers)
                .map_err(|e| self.inner.fail(e))?;

            if let Some(next) = replay {
                debug!("Response filter replays: {:?}", next);
                self.inner.drain().await;
                self.inner.release();
                return Ok(Intercepted::Done(Outcome::Replay(next)));
            }
        }

        if let Some(target) = AuthTarget::from_status(status) {
            if let Some((next, same_connection)) = self.inner.auth_retry(target)? {
                self.inner.drain().await;
                let conn = if same_connection {
                    self.inner.into_reusable()
                } else {
                    self.inner.release();
                    None
                };
                return Ok(Intercepted::Done(Outcome::AuthRetry {
                    request: next,
                    conn,
                }));
            }
        }

        let follow = request.follow_redirect().unwrap_or(config.follow_redirect);

        if follow && redirect::is_redirect(status) {
            let max = config.max_redirects;
            if self.inner.ctx.future.increment_redirect() > max {
                return Err(self.inner.fail(Error::TooManyRedirects(max)));
            }

            let next = redirect::next_request(request, status, &self.inner.headers, config)
                .map_err(|e| self.inner.fail(e))?;

            self.inner.drain().await;
            self.inner.release();

            return Ok(Intercepted::Done(Outcome::Redirect(next)));
        }

        Ok(Intercepted::Proceed(Attempt::wrap(self.inner)))
    }

    /// Hand status and headers to the handler.
    fn deliver(mut self) -> Result<Delivered<'a, T, H>, Failure> {
        let inner = &mut self.inner;
        inner.ctx.future.set_in_auth(false);

        let status = inner.response_status();

        match inner.ctx.handler.on_status_received(&status) {
            HandlerState::Continue => {}
            HandlerState::Abort => return Ok(Delivered::Done(self.inner.abort())),
            HandlerState::Upgrade => return self.inner.upgrade().map(Delivered::Done),
        }

        match inner.ctx.handler.on_headers_received(&inner.headers) {
            HandlerState::Continue => {}
            HandlerState::Abort => return Ok(Delivered::Done(self.inner.abort())),
            HandlerState::Upgrade => return self.inner.upgrade().map(Delivered::Done),
        }

        Ok(Delivered::Body(Attempt::wrap(self.inner)))
    }
}

impl<'a, T: Transport, H: AsyncHandler> Attempt<'a, T, H, BodyReceiving> {
    async fn recv_body(mut self) -> Result<Outcome<T::Conn>, Failure> {
        loop {
            match self.inner.read().await? {
                ResponseEvent::BodyPart(part) => {
                    match self.inner.ctx.handler.on_body_part_received(&part) {
                        HandlerState::Continue => {}
                        HandlerState::Abort => return Ok(self.inner.abort()),
                        HandlerState::Upgrade => return self.inner.upgrade(),
                    }
                }
                ResponseEvent::End => break,
                ev => return Err(self.inner.unexpected("body", &ev)),
            }
        }

        self.inner.release();

        Ok(Outcome::Done)
    }
}

impl<'a, T: Transport, H: AsyncHandler> Inner<'a, T, H> {
    fn fail(&self, error: Error) -> Failure {
        Failure {
            error,
            sent: self.sent,
            body_consumed: self.body_consumed,
            responded: self.responded,
        }
    }

    fn response_status(&self) -> ResponseStatus {
        ResponseStatus {
            uri: self.ctx.request.uri().clone(),
            version: self.version,
            status: self.status,
            remote: self.remote,
        }
    }

    fn unexpected(&self, expected: &str, ev: &ResponseEvent) -> Failure {
        let got = match ev {
            ResponseEvent::Status { .. } => "status",
            ResponseEvent::Headers(_) => "headers",
            ResponseEvent::BodyPart(_) => "body",
            ResponseEvent::End => "end",
        };
        self.fail(Error::Protocol(format!("expected {}, got {}", expected, got)))
    }

    async fn read(&mut self) -> Result<ResponseEvent, Failure> {
        let result = self.conn.read_event().await;
        match result {
            Ok(ev) => {
                self.ctx.timeouts.touch();
                Ok(ev)
            }
            Err(e) => Err(self.fail(e)),
        }
    }

    async fn send_body(&mut self, mut body: OpenBody) -> Result<(), Failure> {
        let client = self.ctx.client;
        let config = &client.config;

        if !config.disable_zero_copy && self.conn.supports_zero_copy() {
            if let Some(region) = body.as_random_access() {
                self.body_consumed = true;
                let result = self.conn.send_file_region(region).await;
                let sent = result.map_err(|e| self.fail(e))?;
                trace!("Sent {} body bytes zero copy", sent);
                self.ctx.timeouts.touch();
                body.close();
                return Ok(());
            }
        }

        let notify = Arc::new(Notify::new());
        body.set_listener(notify.clone());

        loop {
            let mut buf = BytesMut::with_capacity(config.body_chunk_size);

            let state = body
                .transfer_to(&mut buf)
                .map_err(|e| self.fail(Error::Body(e.to_string())))?;
            self.body_consumed = true;

            if !buf.is_empty() {
                let result = self.conn.write_body(buf.freeze()).await;
                result.map_err(|e| self.fail(e))?;
                self.ctx.timeouts.touch();
            }

            match state {
                BodyState::Continue => {}
                BodyState::Suspend => {
                    trace!("Body suspended");
                    notify.notified().await;
                }
                BodyState::Stop => break,
            }
        }

        body.close();

        Ok(())
    }

    fn auth_retry(&mut self, target: AuthTarget) -> Result<Option<(Request, bool)>, Failure> {
        let request = self.ctx.request;

        let realm = match target {
            AuthTarget::Server => request.realm(),
            AuthTarget::Proxy => request.proxy().and_then(|p| p.realm.as_ref()),
        };
        let Some(realm) = realm else {
            return Ok(None);
        };

        let challenges = parse_challenges(&self.headers, target);
        let Some(challenge) = challenges.iter().find(|c| c.scheme == realm.scheme) else {
            debug!("No {:?} challenge in {} response", realm.scheme, self.status);
            return Ok(None);
        };

        let step = self.ctx.auth.step(target, realm.scheme);
        let once = !realm.scheme.is_connection_oriented();
        if (once && step > 0) || step >= MAX_HANDSHAKE_STEPS {
            debug!("Give up {:?} auth after {} attempts", realm.scheme, step);
            return Ok(None);
        }

        let client = self.ctx.client;
        let value = client
            .authenticator
            .authorize(realm, challenge, &self.head, step)
            .map_err(|e| self.fail(e))?;
        let Some(value) = value else {
            return Ok(None);
        };

        self.ctx.auth.record(target, realm.scheme);
        self.ctx.future.set_in_auth(true);

        let mut next = request.clone();
        next.headers_mut().insert(target.authorization_header(), value);

        debug!("Answer {:?} challenge ({}), step {}", realm.scheme, self.status, step);

        Ok(Some((next, realm.scheme.is_connection_oriented())))
    }

    /// Read and discard the rest of the response.
    async fn drain(&mut self) {
        loop {
            match self.conn.read_event().await {
                Ok(ResponseEvent::End) => return,
                Ok(_) => self.ctx.timeouts.touch(),
                Err(e) => {
                    debug!("Failed to drain response body: {}", e);
                    self.close_reason.push(CloseReason::BodyNotDrained);
                    return;
                }
            }
        }
    }

    /// The connection, if it can carry another request.
    fn into_reusable(self) -> Option<Leased<T::Conn>> {
        if let Some(reason) = self.close_reason.first() {
            debug!("Not reusing connection: {}", reason.explain());
            return None;
        }
        self.conn.is_open().then_some(self.conn)
    }

    /// Offer the connection back to the pool, or close it.
    fn release(self) {
        let Inner {
            ctx,
            conn,
            remote,
            close_reason,
            ..
        } = self;

        if let Some(reason) = close_reason.first() {
            debug!("Close connection: {}", reason.explain());
            drop(conn);
            return;
        }

        ctx.handler.on_connection_offer(remote);
        ctx.client.pool.release(conn, true);
    }

    fn abort(mut self) -> Outcome<T::Conn> {
        self.close_reason.push(CloseReason::HandlerAborted);
        self.release();
        Outcome::Done
    }

    fn upgrade(self) -> Result<Outcome<T::Conn>, Failure> {
        let body_consumed = self.body_consumed;
        let failure = move |error| Failure {
            error,
            sent: true,
            body_consumed,
            responded: true,
        };

        let Inner {
            ctx,
            key,
            conn,
            remote,
            ..
        } = self;

        debug!("Upgrade connection: {}", key);

        let conn = conn.detach();
        ctx.handler
            .on_upgrade(Upgraded::new(conn, key, remote))
            .map_err(failure)?;

        Ok(Outcome::Done)
    }
}

/// A body that is closed exactly once, whichever way the Attempt ends.
struct OpenBody {
    body: Box<dyn Body>,
    closed: bool,
}

impl OpenBody {
    fn new(body: Box<dyn Body>) -> Self {
        OpenBody {
            body,
            closed: false,
        }
    }

    fn content_length(&self) -> i64 {
        self.body.content_length()
    }

    fn transfer_to(&mut self, target: &mut BytesMut) -> std::io::Result<BodyState> {
        self.body.transfer_to(target)
    }

    fn set_listener(&mut self, listener: Arc<Notify>) {
        self.body.set_listener(listener);
    }

    fn as_random_access(&mut self) -> Option<&mut dyn crate::body::RandomAccessBody> {
        self.body.as_random_access()
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Err(e) = self.body.close() {
            debug!("Failed to close body: {}", e);
        }
    }
}

impl Drop for OpenBody {
    fn drop(&mut self) {
        self.close();
    }
}

impl<'a, T: Transport, H: AsyncHandler, State: Named> fmt::Debug for Attempt<'a, T, H, State> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Attempt<{}>", State::name())
    }
}
