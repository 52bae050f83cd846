use std::sync::Arc;

use crate::pool::Leased;
use crate::{AsyncHandler, Error, FailureClass, Request, ResponseFuture};
use crate::{TimeoutsHolder, Transport};

use super::attempt::{self, AuthProgress, Ctx, Failure, Outcome};
use super::connect::Addresses;
use super::ClientInner;

/// Drives one request through its Attempts until the future resolves.
pub(crate) struct RequestTask<T: Transport, H: AsyncHandler> {
    client: Arc<ClientInner<T>>,
    handler: H,
    future: ResponseFuture<H::Output>,
    request: Request,
    reuse: Option<Leased<T::Conn>>,
    addresses: Option<Addresses>,
    auth: AuthProgress,
}

enum Step<C: crate::Connection> {
    Ended(Result<Outcome<C>, Failure>),
    Timeout(Error),
    Cancelled,
}

impl<T: Transport, H: AsyncHandler> RequestTask<T, H> {
    pub fn new(
        client: Arc<ClientInner<T>>,
        handler: H,
        future: ResponseFuture<H::Output>,
        request: Request,
    ) -> Self {
        RequestTask {
            client,
            handler,
            future,
            request,
            reuse: None,
            addresses: None,
            auth: AuthProgress::default(),
        }
    }

    pub async fn run(mut self) {
        self.future.start();

        loop {
            match self.step().await {
                Step::Ended(Ok(Outcome::Done)) => return self.complete(),

                Step::Ended(Ok(Outcome::Redirect(next))) => self.restart(next),

                Step::Ended(Ok(Outcome::Replay(next))) => {
                    self.handler.on_retry();
                    self.restart(next);
                }

                Step::Ended(Ok(Outcome::AuthRetry { request, conn })) => {
                    self.request = request;
                    self.reuse = conn;
                }

                Step::Ended(Err(failure)) => {
                    match self.replay_after(&failure) {
                        Ok(Some(next)) => {
                            debug!("Replay after: {}", failure.error);
                            self.handler.on_retry();
                            self.restart(next);
                            continue;
                        }
                        Ok(None) => {}
                        Err(error) => return self.fail(error),
                    }

                    if self.can_retry(&failure) {
                        debug!(
                            "Retry {} after: {}",
                            self.future.current_retry(),
                            failure.error
                        );
                        self.handler.on_retry();
                        continue;
                    }
                    return self.fail(failure.error);
                }

                Step::Timeout(error) => return self.fail(error),

                Step::Cancelled => {
                    debug!("Request cancelled: {:?}", self.request);
                    self.handler.on_throwable(&Error::Cancelled);
                    return;
                }
            }
        }
    }

    /// One Attempt, raced against its timers and cancellation.
    async fn step(&mut self) -> Step<T::Conn> {
        let config = &self.client.config;
        let request_timeout = self
            .request
            .request_timeout()
            .unwrap_or(config.request_timeout);
        let read_timeout = self.request.read_timeout().unwrap_or(config.read_timeout);

        let (timeouts, mut signal) = TimeoutsHolder::arm(request_timeout, read_timeout);

        let future = self.future.clone();
        let reuse = self.reuse.take();

        let ctx = Ctx {
            client: &self.client,
            handler: &mut self.handler,
            future: &self.future,
            request: &self.request,
            timeouts: &timeouts,
            addresses: &mut self.addresses,
            auth: &mut self.auth,
        };

        let step = tokio::select! {
            biased;
            _ = future.cancelled() => Step::Cancelled,
            error = signal.fired() => Step::Timeout(error),
            ended = attempt::run(ctx, reuse) => Step::Ended(ended),
        };

        timeouts.cancel();

        step
    }

    /// Start over with `request`, as a new request to wherever it points.
    fn restart(&mut self, request: Request) {
        self.request = request;
        self.reuse = None;
        self.addresses = None;
        self.auth.reset();
        self.future.set_in_auth(false);
    }

    /// Run the I/O error filters. A replay is subject to the same limits as
    /// a retry, and uses one up.
    fn replay_after(&self, failure: &Failure) -> Result<Option<Request>, Error> {
        let filters = &self.client.config.filters;
        if !failure.error.is_io() || !filters.has_io_exception() {
            return Ok(None);
        }

        let Some(next) = filters.apply_io_exception(&self.request, &failure.error)? else {
            return Ok(None);
        };

        if failure.responded || self.future.is_in_auth() || self.future.is_done() {
            return Ok(None);
        }

        let body_lost = failure.body_consumed
            && next.body().map(|b| !b.is_replayable()).unwrap_or(false);
        if body_lost {
            debug!("Can't replay, request body was consumed");
            return Ok(None);
        }

        Ok(self.future.increment_retry_and_check().then_some(next))
    }

    fn can_retry(&self, failure: &Failure) -> bool {
        // Once the server answered, the response belongs to the handler.
        if failure.responded || self.future.is_in_auth() || self.future.is_done() {
            return false;
        }

        let retryable = match failure.error.class(failure.sent) {
            FailureClass::NotDelivered => true,
            FailureClass::PartiallyDelivered => {
                self.request.is_idempotent() || self.request.is_replayable()
            }
            FailureClass::Fatal => false,
        };
        if !retryable {
            return false;
        }

        let body_lost = failure.body_consumed
            && self
                .request
                .body()
                .map(|b| !b.is_replayable())
                .unwrap_or(false);
        if body_lost {
            return false;
        }

        self.future.increment_retry_and_check()
    }

    fn complete(mut self) {
        if !self.future.begin_completion() {
            self.resolved_elsewhere();
            return;
        }
        let result = self.handler.on_completed();
        self.future.finish(result);
    }

    fn fail(mut self, error: Error) {
        if !self.future.begin_completion() {
            self.resolved_elsewhere();
            return;
        }
        debug!("Request failed: {}", error);
        self.handler.on_throwable(&error);
        self.future.finish(Err(error));
    }

    fn resolved_elsewhere(&mut self) {
        // Cancelled between the end of the Attempt and completion.
        if self.future.is_cancelled() {
            self.handler.on_throwable(&Error::Cancelled);
        }
    }
}
