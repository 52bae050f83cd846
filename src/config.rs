use std::sync::Arc;
use std::time::Duration;

use crate::filter::{Filters, IoExceptionFilter, RequestFilter, ResponseFilter};
use crate::pool::LeaseStrategy;

/// Strategy for keeping `authorization` headers during redirects.
///
/// * `Never` never preserves `authorization` header in redirects.
/// * `SameHost` send the authorization header in redirects only if the host
///   of the redirect is the same of the previous request, and both use the
///   same scheme (or switch to a more secure one, i.e. we can redirect from
///   `http` to `https`, but not the reverse).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[non_exhaustive]
pub enum RedirectAuthHeaders {
    /// Never preserve the `authorization` header on redirect. This is the default.
    #[default]
    Never,
    /// Preserve the `authorization` header when the redirect is to the same host
    /// and either scheme is the same or upgraded to https.
    SameHost,
}

/// Client configuration.
///
/// Read once when the [`Client`][crate::Client] is created. Per request
/// overrides live on [`Request`][crate::Request].
///
/// ```
/// use std::time::Duration;
/// use ureq_engine::Config;
///
/// let config = Config::default()
///     .max_connections_per_partition(4)
///     .read_timeout(Some(Duration::from_secs(10)))
///     .follow_redirect(true);
///
/// assert_eq!(config.max_redirects, 5);
/// ```
#[derive(Debug, Clone)]
pub struct Config {
    /// Max number of open connections in total. `None` is unbounded.
    pub max_connections: Option<usize>,

    /// Max number of open connections per partition. `None` is unbounded.
    pub max_connections_per_partition: Option<usize>,

    /// Soft cap on the number of idle connections kept per partition.
    pub max_idle_per_partition: Option<usize>,

    /// Order in which idle connections are leased.
    pub lease_strategy: LeaseStrategy,

    /// Time allowed to open a single connection.
    pub connect_timeout: Duration,

    /// Deadline for a whole Attempt, regardless of activity.
    pub request_timeout: Option<Duration>,

    /// Max time without any bytes sent or received.
    pub read_timeout: Option<Duration>,

    /// Idle connections older than this in the pool are closed.
    pub pooled_connection_idle_timeout: Duration,

    /// Max lifetime of a connection, counted from when it was opened.
    pub connection_ttl: Option<Duration>,

    /// How often the background cleaner sweeps the pool.
    pub pool_cleaner_period: Duration,

    /// Whether 3xx responses are followed.
    pub follow_redirect: bool,

    /// Max number of redirects followed for one request.
    pub max_redirects: u32,

    /// Treat 302 like 307, keeping method and body.
    pub strict_302_handling: bool,

    /// Which `authorization` headers survive a redirect.
    pub redirect_auth_headers: RedirectAuthHeaders,

    /// Max number of retries of Attempts that failed before delivering a response.
    pub max_request_retry: u32,

    /// Whether connections are kept alive and pooled.
    pub keep_alive: bool,

    /// Number of resolved addresses to race when opening a connection.
    pub connect_race: usize,

    /// Size of the buffer used to pull data out of request bodies.
    pub body_chunk_size: usize,

    /// Never use [`Connection::send_file_region`][crate::Connection::send_file_region].
    pub disable_zero_copy: bool,

    /// Request, response and I/O error filters, see [`crate::filter`].
    pub filters: Filters,
}

impl Config {
    /// Set [`Config::max_connections`].
    pub fn max_connections(mut self, v: usize) -> Self {
        self.max_connections = Some(v);
        self
    }

    /// Set [`Config::max_connections_per_partition`].
    pub fn max_connections_per_partition(mut self, v: usize) -> Self {
        self.max_connections_per_partition = Some(v);
        self
    }

    /// Set [`Config::max_idle_per_partition`].
    pub fn max_idle_per_partition(mut self, v: usize) -> Self {
        self.max_idle_per_partition = Some(v);
        self
    }

    /// Set [`Config::lease_strategy`].
    pub fn lease_strategy(mut self, v: LeaseStrategy) -> Self {
        self.lease_strategy = v;
        self
    }

    /// Set [`Config::connect_timeout`].
    pub fn connect_timeout(mut self, v: Duration) -> Self {
        self.connect_timeout = v;
        self
    }

    /// Set [`Config::request_timeout`].
    pub fn request_timeout(mut self, v: Option<Duration>) -> Self {
        self.request_timeout = v;
        self
    }

    /// Set [`Config::read_timeout`].
    pub fn read_timeout(mut self, v: Option<Duration>) -> Self {
        self.read_timeout = v;
        self
    }

    /// Set [`Config::pooled_connection_idle_timeout`].
    pub fn pooled_connection_idle_timeout(mut self, v: Duration) -> Self {
        self.pooled_connection_idle_timeout = v;
        self
    }

    /// Set [`Config::connection_ttl`].
    pub fn connection_ttl(mut self, v: Option<Duration>) -> Self {
        self.connection_ttl = v;
        self
    }

    /// Set [`Config::follow_redirect`].
    pub fn follow_redirect(mut self, v: bool) -> Self {
        self.follow_redirect = v;
        self
    }

    /// Set [`Config::max_redirects`].
    pub fn max_redirects(mut self, v: u32) -> Self {
        self.max_redirects = v;
        self
    }

    /// Set [`Config::strict_302_handling`].
    pub fn strict_302_handling(mut self, v: bool) -> Self {
        self.strict_302_handling = v;
        self
    }

    /// Set [`Config::redirect_auth_headers`].
    pub fn redirect_auth_headers(mut self, v: RedirectAuthHeaders) -> Self {
        self.redirect_auth_headers = v;
        self
    }

    /// Set [`Config::max_request_retry`].
    pub fn max_request_retry(mut self, v: u32) -> Self {
        self.max_request_retry = v;
        self
    }

    /// Set [`Config::keep_alive`].
    pub fn keep_alive(mut self, v: bool) -> Self {
        self.keep_alive = v;
        self
    }

    /// Set [`Config::connect_race`]. Values below 1 are treated as 1.
    pub fn connect_race(mut self, v: usize) -> Self {
        self.connect_race = v.max(1);
        self
    }

    /// Set [`Config::body_chunk_size`].
    pub fn body_chunk_size(mut self, v: usize) -> Self {
        self.body_chunk_size = v.max(1);
        self
    }

    /// Set [`Config::disable_zero_copy`].
    pub fn disable_zero_copy(mut self, v: bool) -> Self {
        self.disable_zero_copy = v;
        self
    }

    /// Add a filter run before each request is executed.
    pub fn request_filter(mut self, f: impl RequestFilter + 'static) -> Self {
        self.filters.add_request(Arc::new(f));
        self
    }

    /// Add a filter run on each response status and headers.
    pub fn response_filter(mut self, f: impl ResponseFilter + 'static) -> Self {
        self.filters.add_response(Arc::new(f));
        self
    }

    /// Add a filter run on each Attempt failing with an I/O error.
    pub fn io_exception_filter(mut self, f: impl IoExceptionFilter + 'static) -> Self {
        self.filters.add_io_exception(Arc::new(f));
        self
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_connections: None,
            max_connections_per_partition: None,
            max_idle_per_partition: None,
            lease_strategy: LeaseStrategy::Lifo,
            connect_timeout: Duration::from_secs(5),
            request_timeout: Some(Duration::from_secs(60)),
            read_timeout: Some(Duration::from_secs(60)),
            pooled_connection_idle_timeout: Duration::from_secs(60),
            connection_ttl: None,
            pool_cleaner_period: Duration::from_secs(1),
            follow_redirect: false,
            max_redirects: 5,
            strict_302_handling: false,
            redirect_auth_headers: RedirectAuthHeaders::Never,
            max_request_retry: 5,
            keep_alive: true,
            connect_race: 1,
            body_chunk_size: 8192,
            disable_zero_copy: false,
            filters: Filters::default(),
        }
    }
}
