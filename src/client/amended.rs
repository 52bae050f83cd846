use http::uri::Scheme;
use http::{header, HeaderMap, HeaderValue, Uri};

use crate::partition::default_port;
use crate::{Config, Error, Request, RequestHead};

/// Build the head of an Attempt from the request, adding the headers the
/// engine is responsible for.
pub(crate) fn build_head(request: &Request, config: &Config) -> Result<RequestHead, Error> {
    let mut headers = request.headers().clone();

    if !headers.contains_key(header::HOST) {
        let value = match request.virtual_host() {
            Some(v) => from_str(v)?,
            None => {
                let host = request
                    .uri()
                    .host()
                    .ok_or_else(|| Error::BadUri(request.uri().to_string()))?;
                maybe_with_port(host, request.uri())?
            }
        };
        headers.insert(header::HOST, value);
    }

    if !headers.contains_key(header::AUTHORIZATION) {
        if let Some(realm) = request.realm() {
            if let Some(value) = realm.preemptive_header()? {
                headers.insert(header::AUTHORIZATION, value);
            }
        }
    }

    if let Some(realm) = request.proxy().and_then(|p| p.realm.as_ref()) {
        if !headers.contains_key(header::PROXY_AUTHORIZATION) {
            if let Some(value) = realm.preemptive_header()? {
                headers.insert(header::PROXY_AUTHORIZATION, value);
            }
        }
    }

    if !config.keep_alive {
        headers.insert(header::CONNECTION, HeaderValue::from_static("close"));
    }

    Ok(RequestHead {
        method: request.method().clone(),
        uri: request.uri().clone(),
        version: request.version(),
        headers,
        content_length: None,
        proxy: request.proxy().cloned(),
    })
}

/// Whether `connection: close` is among the headers.
pub(crate) fn has_connection_close(headers: &HeaderMap) -> bool {
    headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|v| v.trim().eq_ignore_ascii_case("close"))
}

fn from_str(src: &str) -> Result<HeaderValue, Error> {
    HeaderValue::from_str(src).map_err(|e| Error::BadHeader(e.to_string()))
}

fn maybe_with_port(host: &str, uri: &Uri) -> Result<HeaderValue, Error> {
    if let Some(port) = uri.port_u16() {
        let scheme = uri.scheme().unwrap_or(&Scheme::HTTP);
        if default_port(scheme) != Some(port) {
            return from_str(&format!("{}:{}", host, port));
        }
    }

    from_str(host)
}
