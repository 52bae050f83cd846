use bytes::{Bytes, BytesMut};
use http::{HeaderMap, StatusCode, Uri, Version};

use crate::{AsyncHandler, Error, HandlerState, ResponseStatus};

/// A fully buffered response.
#[derive(Debug, Clone)]
pub struct Response {
    status: StatusCode,
    version: Version,
    headers: HeaderMap,
    uri: Uri,
    body: Bytes,
}

impl Response {
    /// Response status.
    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// Response version.
    pub fn version(&self) -> Version {
        self.version
    }

    /// Response headers.
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Uri of the last hop, after following redirects.
    pub fn uri(&self) -> &Uri {
        &self.uri
    }

    /// Response body.
    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// Convert into an [`http::Response`].
    pub fn into_http(self) -> http::Response<Bytes> {
        let mut res = http::Response::new(self.body);
        *res.status_mut() = self.status;
        *res.version_mut() = self.version;
        *res.headers_mut() = self.headers;
        res
    }
}

/// Handler that buffers the whole response.
#[derive(Debug, Default)]
pub struct ResponseCollector {
    status: Option<ResponseStatus>,
    headers: HeaderMap,
    body: BytesMut,
    max_body: Option<usize>,
    overflowed: bool,
}

impl ResponseCollector {
    /// Creates a collector without a body size limit.
    pub fn new() -> Self {
        Self::default()
    }

    /// Abort the response once the body grows beyond `max` bytes.
    ///
    /// The response then completes with [`Error::BodyExceedsLimit`].
    pub fn with_max_body(max: usize) -> Self {
        ResponseCollector {
            max_body: Some(max),
            ..Default::default()
        }
    }
}

impl AsyncHandler for ResponseCollector {
    type Output = Response;

    fn on_status_received(&mut self, status: &ResponseStatus) -> HandlerState {
        self.status = Some(status.clone());
        HandlerState::Continue
    }

    fn on_headers_received(&mut self, headers: &HeaderMap) -> HandlerState {
        self.headers = headers.clone();
        HandlerState::Continue
    }

    fn on_body_part_received(&mut self, part: &Bytes) -> HandlerState {
        if let Some(max) = self.max_body {
            if self.body.len() + part.len() > max {
                debug!("Response body exceeds {} bytes, aborting", max);
                self.overflowed = true;
                return HandlerState::Abort;
            }
        }
        self.body.extend_from_slice(part);
        HandlerState::Continue
    }

    fn on_completed(&mut self) -> Result<Response, Error> {
        let status = self
            .status
            .take()
            .ok_or_else(|| Error::Protocol("completed without status".into()))?;

        if self.overflowed {
            let max = self.max_body.unwrap_or_default();
            return Err(Error::BodyExceedsLimit(max));
        }

        Ok(Response {
            status: status.status,
            version: status.version,
            headers: std::mem::take(&mut self.headers),
            uri: status.uri,
            body: std::mem::take(&mut self.body).freeze(),
        })
    }

    fn on_throwable(&mut self, error: &Error) {
        debug!("Response failed: {}", error);
    }
}
