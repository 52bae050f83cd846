//! Filters around request execution.
//!
//! Filters are configured on the [`Config`][crate::Config] and run in the
//! order they were added. Each gets a [`FilterContext`] and returns the one
//! the next filter sees.
//!
//! * [`RequestFilter`] runs once, before the request is executed. It can
//!   rewrite the request or reject it.
//! * [`ResponseFilter`] runs when a status and headers arrived, before
//!   redirects, auth challenges or the handler. It can ask for the request
//!   to be replayed instead.
//! * [`IoExceptionFilter`] runs when an Attempt fails with an I/O error. It
//!   can ask for the request to be replayed.
//!
//! A replay counts as a retry for the handler, which sees
//! [`AsyncHandler::on_retry`][crate::AsyncHandler::on_retry].

use std::fmt;
use std::sync::Arc;

use http::HeaderMap;

use crate::{Error, Request, ResponseStatus};

/// What a filter is given and passes on.
#[derive(Debug, Clone)]
pub struct FilterContext {
    request: Request,
    response_status: Option<ResponseStatus>,
    response_headers: Option<HeaderMap>,
    error: Option<Error>,
    replay: bool,
}

impl FilterContext {
    fn new(request: Request) -> Self {
        FilterContext {
            request,
            response_status: None,
            response_headers: None,
            error: None,
            replay: false,
        }
    }

    /// The request, as rewritten by earlier filters.
    pub fn request(&self) -> &Request {
        &self.request
    }

    /// Status of the response being filtered.
    pub fn response_status(&self) -> Option<&ResponseStatus> {
        self.response_status.as_ref()
    }

    /// Headers of the response being filtered.
    pub fn response_headers(&self) -> Option<&HeaderMap> {
        self.response_headers.as_ref()
    }

    /// The I/O error that failed the Attempt.
    pub fn error(&self) -> Option<&Error> {
        self.error.as_ref()
    }

    /// Whether an earlier filter asked for a replay.
    pub fn is_replay(&self) -> bool {
        self.replay
    }

    /// Pass on `request` instead.
    pub fn with_request(mut self, request: Request) -> Self {
        self.request = request;
        self
    }

    /// Abandon the current Attempt and execute `request` instead.
    ///
    /// Only response and I/O error filters can replay.
    pub fn replay(mut self, request: Request) -> Self {
        self.request = request;
        self.replay = true;
        self
    }
}

/// Rewrites or rejects a request before it is executed.
pub trait RequestFilter: Send + Sync {
    /// Filter `ctx`. An error fails the request without executing it.
    fn filter(&self, ctx: FilterContext) -> Result<FilterContext, Error>;
}

/// Inspects a response status and headers, possibly asking for a replay.
pub trait ResponseFilter: Send + Sync {
    /// Filter `ctx`. An error fails the request.
    fn filter(&self, ctx: FilterContext) -> Result<FilterContext, Error>;
}

/// Inspects an I/O failure, possibly asking for a replay.
pub trait IoExceptionFilter: Send + Sync {
    /// Filter `ctx`. An error fails the request with that error.
    fn filter(&self, ctx: FilterContext) -> Result<FilterContext, Error>;
}

impl<F> RequestFilter for F
where
    F: Fn(FilterContext) -> Result<FilterContext, Error> + Send + Sync,
{
    fn filter(&self, ctx: FilterContext) -> Result<FilterContext, Error> {
        self(ctx)
    }
}

impl<F> ResponseFilter for F
where
    F: Fn(FilterContext) -> Result<FilterContext, Error> + Send + Sync,
{
    fn filter(&self, ctx: FilterContext) -> Result<FilterContext, Error> {
        self(ctx)
    }
}

impl<F> IoExceptionFilter for F
where
    F: Fn(FilterContext) -> Result<FilterContext, Error> + Send + Sync,
{
    fn filter(&self, ctx: FilterContext) -> Result<FilterContext, Error> {
        self(ctx)
    }
}

/// The filters of a client, per kind.
#[derive(Clone, Default)]
pub struct Filters {
    request: Vec<Arc<dyn RequestFilter>>,
    response: Vec<Arc<dyn ResponseFilter>>,
    io_exception: Vec<Arc<dyn IoExceptionFilter>>,
}

impl Filters {
    pub(crate) fn add_request(&mut self, filter: Arc<dyn RequestFilter>) {
        self.request.push(filter);
    }

    pub(crate) fn add_response(&mut self, filter: Arc<dyn ResponseFilter>) {
        self.response.push(filter);
    }

    pub(crate) fn add_io_exception(&mut self, filter: Arc<dyn IoExceptionFilter>) {
        self.io_exception.push(filter);
    }

    pub(crate) fn has_response(&self) -> bool {
        !self.response.is_empty()
    }

    pub(crate) fn has_io_exception(&self) -> bool {
        !self.io_exception.is_empty()
    }

    pub(crate) fn apply_request(&self, request: Request) -> Result<Request, Error> {
        let mut ctx = FilterContext::new(request);
        for f in &self.request {
            ctx = f.filter(ctx)?;
        }
        if ctx.replay {
            debug!("Replay is ignored by request filters");
        }
        Ok(ctx.request)
    }

    /// The request to replay, if a filter asked for one.
    pub(crate) fn apply_response(
        &self,
        request: &Request,
        status: ResponseStatus,
        headers: &HeaderMap,
    ) -> Result<Option<Request>, Error> {
        let mut ctx = FilterContext::new(request.clone());
        ctx.response_status = Some(status);
        ctx.response_headers = Some(headers.clone());
        for f in &self.response {
            ctx = f.filter(ctx)?;
        }
        Ok(ctx.replay.then_some(ctx.request))
    }

    /// The request to replay, if a filter asked for one.
    pub(crate) fn apply_io_exception(
        &self,
        request: &Request,
        error: &Error,
    ) -> Result<Option<Request>, Error> {
        let mut ctx = FilterContext::new(request.clone());
        ctx.error = Some(error.clone());
        for f in &self.io_exception {
            ctx = f.filter(ctx)?;
        }
        Ok(ctx.replay.then_some(ctx.request))
    }
}

impl fmt::Debug for Filters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Filters")
            .field("request", &self.request.len())
            .field("response", &self.response.len())
            .field("io_exception", &self.io_exception.len())
            .finish()
    }
}
