use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http::{HeaderMap, HeaderName, HeaderValue, Method, Uri, Version};

use crate::body::{BodyGenerator, ByteBodyGenerator};
use crate::{Error, ProxyServer, Realm};

/// Description of a request to execute.
///
/// Read-only to the engine. Redirects and auth retries derive new requests
/// from it rather than changing it.
#[derive(Clone)]
pub struct Request {
    method: Method,
    uri: Uri,
    version: Version,
    headers: HeaderMap,
    body: Option<Arc<dyn BodyGenerator>>,
    proxy: Option<ProxyServer>,
    virtual_host: Option<String>,
    realm: Option<Realm>,
    request_timeout: Option<Option<Duration>>,
    read_timeout: Option<Option<Duration>>,
    follow_redirect: Option<bool>,
    max_request_retry: Option<u32>,
    replayable: bool,
}

impl Request {
    /// Start building a request.
    pub fn builder<U>(method: Method, uri: U) -> RequestBuilder
    where
        U: TryInto<Uri>,
        U::Error: Into<http::Error>,
    {
        let inner = uri
            .try_into()
            .map_err(|e| Error::BadUri(e.into().to_string()))
            .map(|uri| Request::new(method, uri));
        RequestBuilder { inner }
    }

    /// Start building a `GET` request.
    pub fn get<U>(uri: U) -> RequestBuilder
    where
        U: TryInto<Uri>,
        U::Error: Into<http::Error>,
    {
        Self::builder(Method::GET, uri)
    }

    /// Start building a `POST` request.
    pub fn post<U>(uri: U) -> RequestBuilder
    where
        U: TryInto<Uri>,
        U::Error: Into<http::Error>,
    {
        Self::builder(Method::POST, uri)
    }

    /// Start building a `PUT` request.
    pub fn put<U>(uri: U) -> RequestBuilder
    where
        U: TryInto<Uri>,
        U::Error: Into<http::Error>,
    {
        Self::builder(Method::PUT, uri)
    }

    fn new(method: Method, uri: Uri) -> Self {
        Request {
            method,
            uri,
            version: Version::HTTP_11,
            headers: HeaderMap::new(),
            body: None,
            proxy: None,
            virtual_host: None,
            realm: None,
            request_timeout: None,
            read_timeout: None,
            follow_redirect: None,
            max_request_retry: None,
            replayable: false,
        }
    }

    /// Request method.
    pub fn method(&self) -> &Method {
        &self.method
    }

    /// Target uri, without userinfo.
    pub fn uri(&self) -> &Uri {
        &self.uri
    }

    /// HTTP version.
    pub fn version(&self) -> Version {
        self.version
    }

    /// Request headers.
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Body source.
    pub fn body(&self) -> Option<&Arc<dyn BodyGenerator>> {
        self.body.as_ref()
    }

    /// Proxy to route through.
    pub fn proxy(&self) -> Option<&ProxyServer> {
        self.proxy.as_ref()
    }

    /// Host to send in the `host` header instead of the uri host.
    pub fn virtual_host(&self) -> Option<&str> {
        self.virtual_host.as_deref()
    }

    /// Server credentials.
    pub fn realm(&self) -> Option<&Realm> {
        self.realm.as_ref()
    }

    /// Request timeout override. `Some(None)` disables the timer.
    pub fn request_timeout(&self) -> Option<Option<Duration>> {
        self.request_timeout
    }

    /// Read timeout override. `Some(None)` disables the timer.
    pub fn read_timeout(&self) -> Option<Option<Duration>> {
        self.read_timeout
    }

    /// Follow redirect override.
    pub fn follow_redirect(&self) -> Option<bool> {
        self.follow_redirect
    }

    /// Max retry override.
    pub fn max_request_retry(&self) -> Option<u32> {
        self.max_request_retry
    }

    /// Whether the request may be resent after partial delivery even
    /// though the method is not idempotent.
    pub fn is_replayable(&self) -> bool {
        self.replayable
    }

    /// Whether the method is idempotent (RFC 9110, 9.2.2).
    pub fn is_idempotent(&self) -> bool {
        matches!(
            self.method,
            Method::GET | Method::HEAD | Method::OPTIONS | Method::TRACE | Method::PUT | Method::DELETE
        )
    }

    pub(crate) fn set_method(&mut self, method: Method) {
        self.method = method;
    }

    pub(crate) fn set_uri(&mut self, uri: Uri) {
        self.uri = uri;
    }

    /// Mutable request headers, for filters rewriting the request.
    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    pub(crate) fn clear_body(&mut self) {
        self.body = None;
    }

    pub(crate) fn clear_virtual_host(&mut self) {
        self.virtual_host = None;
    }

    pub(crate) fn clear_realm(&mut self) {
        self.realm = None;
    }
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("method", &self.method)
            .field("uri", &DebugUri(&self.uri))
            .field("version", &self.version)
            .field("headers", &self.headers)
            .field("body", &self.body.is_some())
            .field("proxy", &self.proxy)
            .finish()
    }
}

/// Prints scheme, authority and path but not the query, which may carry secrets.
pub(crate) struct DebugUri<'a>(pub &'a Uri);

impl fmt::Debug for DebugUri<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(s) = self.0.scheme_str() {
            write!(f, "{}://", s)?;
        }
        if let Some(a) = self.0.authority() {
            write!(f, "{}", a.host())?;
            if let Some(p) = a.port_u16() {
                write!(f, ":{}", p)?;
            }
        }
        write!(f, "{}", self.0.path())?;
        if self.0.query().is_some() {
            write!(f, "?<redacted>")?;
        }
        Ok(())
    }
}

/// Builder for [`Request`].
///
/// Errors are held until [`RequestBuilder::build`].
#[derive(Debug)]
pub struct RequestBuilder {
    inner: Result<Request, Error>,
}

impl RequestBuilder {
    fn and_then(mut self, f: impl FnOnce(&mut Request) -> Result<(), Error>) -> Self {
        if let Ok(req) = &mut self.inner {
            if let Err(e) = f(req) {
                self.inner = Err(e);
            }
        }
        self
    }

    /// Append a header.
    pub fn header<K, V>(self, key: K, value: V) -> Self
    where
        K: TryInto<HeaderName>,
        K::Error: Into<http::Error>,
        V: TryInto<HeaderValue>,
        V::Error: Into<http::Error>,
    {
        self.and_then(|req| {
            let key = key.try_into().map_err(|e| Error::from(e.into()))?;
            let value = value.try_into().map_err(|e| Error::from(e.into()))?;
            req.headers.append(key, value);
            Ok(())
        })
    }

    /// Set the HTTP version.
    pub fn version(self, version: Version) -> Self {
        self.and_then(|req| {
            req.version = version;
            Ok(())
        })
    }

    /// Send an in-memory body.
    pub fn body(self, body: impl Into<Bytes>) -> Self {
        self.body_generator(Arc::new(ByteBodyGenerator::new(body)))
    }

    /// Send a body from a generator.
    pub fn body_generator(self, body: Arc<dyn BodyGenerator>) -> Self {
        self.and_then(|req| {
            req.body = Some(body);
            Ok(())
        })
    }

    /// Route through a proxy.
    pub fn proxy(self, proxy: ProxyServer) -> Self {
        self.and_then(|req| {
            req.proxy = Some(proxy);
            Ok(())
        })
    }

    /// Send `host` as the `host` header, and partition connections by it.
    pub fn virtual_host(self, host: impl Into<String>) -> Self {
        self.and_then(|req| {
            req.virtual_host = Some(host.into());
            Ok(())
        })
    }

    /// Credentials for the server.
    pub fn realm(self, realm: Realm) -> Self {
        self.and_then(|req| {
            req.realm = Some(realm);
            Ok(())
        })
    }

    /// Override [`Config::request_timeout`][crate::Config::request_timeout].
    pub fn request_timeout(self, timeout: Option<Duration>) -> Self {
        self.and_then(|req| {
            req.request_timeout = Some(timeout);
            Ok(())
        })
    }

    /// Override [`Config::read_timeout`][crate::Config::read_timeout].
    pub fn read_timeout(self, timeout: Option<Duration>) -> Self {
        self.and_then(|req| {
            req.read_timeout = Some(timeout);
            Ok(())
        })
    }

    /// Override [`Config::follow_redirect`][crate::Config::follow_redirect].
    pub fn follow_redirect(self, v: bool) -> Self {
        self.and_then(|req| {
            req.follow_redirect = Some(v);
            Ok(())
        })
    }

    /// Override [`Config::max_request_retry`][crate::Config::max_request_retry].
    pub fn max_request_retry(self, v: u32) -> Self {
        self.and_then(|req| {
            req.max_request_retry = Some(v);
            Ok(())
        })
    }

    /// Allow retrying after partial delivery regardless of method.
    pub fn replayable(self, v: bool) -> Self {
        self.and_then(|req| {
            req.replayable = v;
            Ok(())
        })
    }

    /// Finish the request.
    ///
    /// Userinfo in the uri is moved into a preemptive Basic [`Realm`]
    /// unless a realm is already set.
    pub fn build(self) -> Result<Request, Error> {
        let mut req = self.inner?;

        let (uri, realm) = split_userinfo(&req.uri)?;
        if let Some(uri) = uri {
            req.uri = uri;
        }
        if req.realm.is_none() {
            req.realm = realm;
        }

        if req.uri.scheme().is_none() || req.uri.host().is_none() {
            return Err(Error::BadUri(format!("not absolute: {}", req.uri)));
        }

        Ok(req)
    }
}

fn split_userinfo(uri: &Uri) -> Result<(Option<Uri>, Option<Realm>), Error> {
    let Some(authority) = uri.authority() else {
        return Ok((None, None));
    };
    let Some((userinfo, host)) = authority.as_str().rsplit_once('@') else {
        return Ok((None, None));
    };

    let (user, pass) = userinfo.split_once(':').unwrap_or((userinfo, ""));
    let realm = Realm::basic(user, pass).preemptive(true);

    let mut parts = uri.clone().into_parts();
    parts.authority = Some(
        host.parse()
            .map_err(|_| Error::BadUri(format!("bad authority: {}", host)))?,
    );
    let uri = Uri::from_parts(parts).map_err(|e| Error::BadUri(e.to_string()))?;

    Ok((Some(uri), Some(realm)))
}

impl<B: Into<Bytes>> TryFrom<http::Request<B>> for Request {
    type Error = Error;

    fn try_from(value: http::Request<B>) -> Result<Self, Error> {
        let (parts, body) = value.into_parts();
        let body: Bytes = body.into();

        let mut builder = Request::builder(parts.method, parts.uri).version(parts.version);
        if !body.is_empty() {
            builder = builder.body(body);
        }

        let mut req = builder.build()?;
        req.headers = parts.headers;
        Ok(req)
    }
}
