use http::uri::Scheme;
use http::{header, HeaderMap, Method, StatusCode, Uri};

use crate::{AuthScheme, Config, Error, PartitionKey, RedirectAuthHeaders, Request};

/// Statuses followed as redirects.
///
/// 304 is a redirect code, but it has no location header and thus we don't
/// consider it a redirection.
pub(crate) fn is_redirect(status: StatusCode) -> bool {
    matches!(status.as_u16(), 301 | 302 | 303 | 307 | 308)
}

/// Derive the request for the next hop.
pub(crate) fn next_request(
    previous: &Request,
    status: StatusCode,
    headers: &HeaderMap,
    config: &Config,
) -> Result<Request, Error> {
    let header = headers.get(header::LOCATION).ok_or(Error::NoLocationHeader)?;

    let location = header.to_str().map_err(|_| {
        Error::BadLocationHeader(String::from_utf8_lossy(header.as_bytes()).to_string())
    })?;

    let uri = resolve_location(previous.uri(), location)?;

    let code = status.as_u16();
    let strict = config.strict_302_handling;
    let method = previous.method();

    // POST, PUT etc change to GET on a redirect, like curl does.
    let switch_to_get = !matches!(*method, Method::GET | Method::HEAD)
        && (code == 301 || code == 303 || (code == 302 && !strict));
    let keep_body = code == 307 || code == 308 || (code == 302 && strict);

    let mut next = previous.clone();

    if switch_to_get {
        next.set_method(Method::GET);
    }

    let h = next.headers_mut();
    h.remove(header::HOST);
    h.remove(header::CONTENT_LENGTH);
    h.remove(header::COOKIE);

    if !keep_body || switch_to_get {
        next.clear_body();
        let h = next.headers_mut();
        h.remove(header::CONTENT_TYPE);
        h.remove(header::TRANSFER_ENCODING);
    } else if let Some(body) = previous.body() {
        if !body.is_replayable() {
            return Err(Error::BodyNotReplayable);
        }
    }

    let same_host = can_redirect_auth_header(previous.uri(), &uri);
    let ntlm = previous
        .realm()
        .map(|r| r.scheme == AuthScheme::Ntlm)
        .unwrap_or(false);

    let keep_auth_header = match config.redirect_auth_headers {
        RedirectAuthHeaders::Never => false,
        RedirectAuthHeaders::SameHost => same_host && !ntlm,
    };

    if !keep_auth_header {
        next.headers_mut().remove(header::AUTHORIZATION);
    }
    if !same_host {
        next.clear_realm();
    }

    let proxy_ntlm = previous
        .proxy()
        .and_then(|p| p.realm.as_ref())
        .map(|r| r.scheme.is_connection_oriented())
        .unwrap_or(false);
    if proxy_ntlm {
        next.headers_mut().remove(header::PROXY_AUTHORIZATION);
    }

    // The virtual host only applies to the original base.
    let prev_key = PartitionKey::new(previous.uri(), None, None)?;
    let next_key = PartitionKey::new(&uri, None, None)?;
    if !prev_key.is_same_base(&next_key) {
        next.clear_virtual_host();
    }

    debug!("Redirect ({}): {} -> {}", status, previous.method(), next.method());

    next.set_uri(uri);

    Ok(next)
}

fn can_redirect_auth_header(prev: &Uri, next: &Uri) -> bool {
    let host_prev = prev.authority().map(|a| a.host());
    let host_next = next.authority().map(|a| a.host());
    let scheme_prev = prev.scheme();
    let scheme_next = next.scheme();
    host_prev == host_next && (scheme_prev == scheme_next || scheme_next == Some(&Scheme::HTTPS))
}

/// Resolve a location header against the uri it was received for.
pub(crate) fn resolve_location(base: &Uri, location: &str) -> Result<Uri, Error> {
    let bad = || Error::BadLocationHeader(location.to_string());

    // Fragments are never sent.
    let location = location.split('#').next().unwrap_or_default().trim();
    if location.is_empty() {
        return Err(bad());
    }

    let scheme = base.scheme_str().ok_or_else(bad)?;
    let authority = base.authority().ok_or_else(bad)?;

    let resolved = if has_scheme(location) {
        location.to_string()
    } else if location.starts_with("//") {
        format!("{}:{}", scheme, location)
    } else if location.starts_with('/') {
        let (path, query) = split_query(location);
        format!("{}://{}{}{}", scheme, authority, remove_dot_segments(path), query)
    } else if location.starts_with('?') {
        format!("{}://{}{}{}", scheme, authority, base.path(), location)
    } else {
        let (path, query) = split_query(location);
        let dir = match base.path().rfind('/') {
            Some(i) => &base.path()[..=i],
            None => "/",
        };
        let merged = format!("{}{}", dir, path);
        format!("{}://{}{}{}", scheme, authority, remove_dot_segments(&merged), query)
    };

    let uri: Uri = resolved.parse().map_err(|_| bad())?;

    if uri.scheme().is_none() || uri.host().is_none() {
        return Err(bad());
    }

    Ok(uri)
}

fn has_scheme(location: &str) -> bool {
    match location.find(':') {
        Some(i) => {
            let scheme = &location[..i];
            !scheme.is_empty()
                && scheme.starts_with(|c: char| c.is_ascii_alphabetic())
                && scheme
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'))
                && location[i + 1..].starts_with("//")
        }
        None => false,
    }
}

fn split_query(location: &str) -> (&str, &str) {
    match location.find('?') {
        Some(i) => location.split_at(i),
        None => (location, ""),
    }
}

// RFC 3986, 5.2.4.
fn remove_dot_segments(path: &str) -> String {
    let mut out: Vec<&str> = Vec::new();
    let segments: Vec<&str> = path.split('/').skip(1).collect();
    let last = segments.len().saturating_sub(1);

    for (i, seg) in segments.iter().enumerate() {
        match *seg {
            "." => {
                if i == last {
                    out.push("");
                }
            }
            ".." => {
                out.pop();
                if i == last {
                    out.push("");
                }
            }
            s => out.push(s),
        }
    }

    format!("/{}", out.join("/"))
}

#[cfg(test)]
mod tests {
    use super::*;

    use http::HeaderValue;

    use crate::Realm;

    fn resolve(base: &str, location: &str) -> String {
        resolve_location(&base.parse().unwrap(), location)
            .unwrap()
            .to_string()
    }

    fn location(v: &'static str) -> HeaderMap {
        let mut h = HeaderMap::new();
        h.insert(header::LOCATION, HeaderValue::from_static(v));
        h
    }

    #[test]
    fn resolve_absolute() {
        assert_eq!(
            resolve("http://a.test/x", "https://b.test/y"),
            "https://b.test/y"
        );
    }

    #[test]
    fn resolve_scheme_relative() {
        assert_eq!(resolve("https://a.test/x", "//b.test/y"), "https://b.test/y");
    }

    #[test]
    fn resolve_absolute_path() {
        assert_eq!(
            resolve("http://a.test:8080/x/y?q=1", "/z?r=2"),
            "http://a.test:8080/z?r=2"
        );
    }

    #[test]
    fn resolve_query_only() {
        assert_eq!(resolve("http://a.test/x/y?q=1", "?r=2"), "http://a.test/x/y?r=2");
    }

    #[test]
    fn resolve_relative() {
        assert_eq!(resolve("http://a.test/x/y", "z"), "http://a.test/x/z");
        assert_eq!(resolve("http://a.test/x/y/", "z"), "http://a.test/x/y/z");
        assert_eq!(resolve("http://a.test/x/y", "../z"), "http://a.test/z");
        assert_eq!(resolve("http://a.test/x/y", "./z/."), "http://a.test/x/z/");
        assert_eq!(resolve("http://a.test/x", "../../z"), "http://a.test/z");
    }

    #[test]
    fn resolve_strips_fragment() {
        assert_eq!(resolve("http://a.test/", "/y#frag"), "http://a.test/y");
    }

    #[test]
    fn resolve_empty_is_bad() {
        let err = resolve_location(&"http://a.test/".parse().unwrap(), "#x").unwrap_err();
        assert!(matches!(err, Error::BadLocationHeader(_)));
    }

    #[test]
    fn redirect_statuses() {
        for code in [301, 302, 303, 307, 308] {
            assert!(is_redirect(StatusCode::from_u16(code).unwrap()));
        }
        for code in [200, 300, 304, 305, 404] {
            assert!(!is_redirect(StatusCode::from_u16(code).unwrap()));
        }
    }

    fn post() -> Request {
        Request::post("http://a.test/form")
            .header("content-type", "text/plain")
            .header("content-length", "5")
            .header("cookie", "a=b")
            .body("hello")
            .build()
            .unwrap()
    }

    #[test]
    fn post_302_switches_to_get() {
        let next = next_request(
            &post(),
            StatusCode::FOUND,
            &location("/done"),
            &Config::default(),
        )
        .unwrap();
        assert_eq!(next.method(), Method::GET);
        assert!(next.body().is_none());
        assert!(next.headers().get(header::CONTENT_TYPE).is_none());
        assert!(next.headers().get(header::CONTENT_LENGTH).is_none());
        assert!(next.headers().get(header::COOKIE).is_none());
        assert_eq!(next.uri(), "http://a.test/done");
    }

    #[test]
    fn post_302_strict_keeps_body() {
        let config = Config::default().strict_302_handling(true);
        let next = next_request(&post(), StatusCode::FOUND, &location("/done"), &config).unwrap();
        assert_eq!(next.method(), Method::POST);
        assert!(next.body().is_some());
        assert!(next.headers().get(header::CONTENT_TYPE).is_some());
        assert!(next.headers().get(header::CONTENT_LENGTH).is_none());
    }

    #[test]
    fn post_307_keeps_method_and_body() {
        let next = next_request(
            &post(),
            StatusCode::TEMPORARY_REDIRECT,
            &location("/done"),
            &Config::default(),
        )
        .unwrap();
        assert_eq!(next.method(), Method::POST);
        assert!(next.body().is_some());
    }

    #[test]
    fn post_303_switches_to_get() {
        let next = next_request(
            &post(),
            StatusCode::SEE_OTHER,
            &location("/done"),
            &Config::default(),
        )
        .unwrap();
        assert_eq!(next.method(), Method::GET);
    }

    #[test]
    fn head_301_stays_head() {
        let req = Request::builder(Method::HEAD, "http://a.test/").build().unwrap();
        let next = next_request(
            &req,
            StatusCode::MOVED_PERMANENTLY,
            &location("/b"),
            &Config::default(),
        )
        .unwrap();
        assert_eq!(next.method(), Method::HEAD);
    }

    #[test]
    fn non_replayable_body_cannot_be_resent() {
        let req = Request::put("http://a.test/")
            .body_generator(std::sync::Arc::new(crate::body::FeedableBodyGenerator::new()))
            .build()
            .unwrap();
        let err = next_request(
            &req,
            StatusCode::PERMANENT_REDIRECT,
            &location("/b"),
            &Config::default(),
        )
        .unwrap_err();
        assert_eq!(err, Error::BodyNotReplayable);
    }

    #[test]
    fn missing_location() {
        let err = next_request(
            &post(),
            StatusCode::FOUND,
            &HeaderMap::new(),
            &Config::default(),
        )
        .unwrap_err();
        assert_eq!(err, Error::NoLocationHeader);
    }

    fn authed(uri: &str) -> Request {
        Request::get(uri)
            .header("authorization", "Basic xyz")
            .realm(Realm::basic("a", "b"))
            .build()
            .unwrap()
    }

    #[test]
    fn auth_header_dropped_by_default() {
        let next = next_request(
            &authed("http://a.test/"),
            StatusCode::FOUND,
            &location("/b"),
            &Config::default(),
        )
        .unwrap();
        assert!(next.headers().get(header::AUTHORIZATION).is_none());
        assert!(next.realm().is_some());
    }

    #[test]
    fn auth_header_kept_same_host() {
        let config = Config::default().redirect_auth_headers(RedirectAuthHeaders::SameHost);

        let next = next_request(
            &authed("http://a.test/"),
            StatusCode::FOUND,
            &location("https://a.test/b"),
            &config,
        )
        .unwrap();
        assert!(next.headers().get(header::AUTHORIZATION).is_some());

        // Downgrade to http is not allowed.
        let next = next_request(
            &authed("https://a.test/"),
            StatusCode::FOUND,
            &location("http://a.test/b"),
            &config,
        )
        .unwrap();
        assert!(next.headers().get(header::AUTHORIZATION).is_none());
    }

    #[test]
    fn other_host_drops_auth_and_realm() {
        let config = Config::default().redirect_auth_headers(RedirectAuthHeaders::SameHost);
        let next = next_request(
            &authed("http://a.test/"),
            StatusCode::FOUND,
            &location("http://b.test/"),
            &config,
        )
        .unwrap();
        assert!(next.headers().get(header::AUTHORIZATION).is_none());
        assert!(next.realm().is_none());
    }

    #[test]
    fn virtual_host_kept_only_on_same_base() {
        let req = Request::get("http://10.0.0.1/")
            .virtual_host("a.test")
            .build()
            .unwrap();

        let next =
            next_request(&req, StatusCode::FOUND, &location("/b"), &Config::default()).unwrap();
        assert_eq!(next.virtual_host(), Some("a.test"));

        let next = next_request(
            &req,
            StatusCode::FOUND,
            &location("http://10.0.0.2/b"),
            &Config::default(),
        )
        .unwrap();
        assert_eq!(next.virtual_host(), None);
    }
}
