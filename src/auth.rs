use std::fmt;

use base64::prelude::BASE64_STANDARD;
use base64::Engine;
use http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode};

use crate::{Error, RequestHead};

/// Authentication schemes the engine knows how to drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AuthScheme {
    /// RFC 7617.
    Basic,
    /// RFC 7616.
    Digest,
    /// NTLM, a multi step handshake bound to one connection.
    Ntlm,
    /// SPNEGO, a multi step handshake bound to one connection.
    Negotiate,
}

impl AuthScheme {
    /// Whether the handshake authenticates the connection rather than the
    /// request, so that every step must reuse the same connection.
    pub fn is_connection_oriented(&self) -> bool {
        matches!(self, AuthScheme::Ntlm | AuthScheme::Negotiate)
    }

    fn parse(s: &str) -> Option<Self> {
        let scheme = if s.eq_ignore_ascii_case("basic") {
            AuthScheme::Basic
        } else if s.eq_ignore_ascii_case("digest") {
            AuthScheme::Digest
        } else if s.eq_ignore_ascii_case("ntlm") {
            AuthScheme::Ntlm
        } else if s.eq_ignore_ascii_case("negotiate") {
            AuthScheme::Negotiate
        } else {
            return None;
        };
        Some(scheme)
    }
}

/// Credentials for a server or proxy.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Realm {
    /// Scheme to answer challenges with.
    pub scheme: AuthScheme,
    /// User name.
    pub principal: String,
    /// Password.
    pub password: String,
    /// Send credentials on the first Attempt instead of waiting for a
    /// challenge. Only meaningful for [`AuthScheme::Basic`].
    pub use_preemptive_auth: bool,
}

impl Realm {
    /// Credentials for `scheme`.
    pub fn new(scheme: AuthScheme, principal: impl Into<String>, password: impl Into<String>) -> Self {
        Realm {
            scheme,
            principal: principal.into(),
            password: password.into(),
            use_preemptive_auth: false,
        }
    }

    /// Basic credentials.
    pub fn basic(principal: impl Into<String>, password: impl Into<String>) -> Self {
        Self::new(AuthScheme::Basic, principal, password)
    }

    /// Set [`Realm::use_preemptive_auth`].
    pub fn preemptive(mut self, v: bool) -> Self {
        self.use_preemptive_auth = v;
        self
    }

    /// The header value to send before any challenge, if this realm does so.
    pub(crate) fn preemptive_header(&self) -> Result<Option<HeaderValue>, Error> {
        if self.use_preemptive_auth && self.scheme == AuthScheme::Basic {
            Ok(Some(basic_credentials(&self.principal, &self.password)?))
        } else {
            Ok(None)
        }
    }
}

impl fmt::Debug for Realm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Realm")
            .field("scheme", &self.scheme)
            .field("principal", &self.principal)
            .field("password", &"***")
            .field("use_preemptive_auth", &self.use_preemptive_auth)
            .finish()
    }
}

/// Who issued a challenge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AuthTarget {
    /// `401` with `www-authenticate`.
    Server,
    /// `407` with `proxy-authenticate`.
    Proxy,
}

impl AuthTarget {
    pub(crate) fn from_status(status: StatusCode) -> Option<Self> {
        match status {
            StatusCode::UNAUTHORIZED => Some(AuthTarget::Server),
            StatusCode::PROXY_AUTHENTICATION_REQUIRED => Some(AuthTarget::Proxy),
            _ => None,
        }
    }

    /// Header carrying the challenge.
    pub fn challenge_header(&self) -> HeaderName {
        match self {
            AuthTarget::Server => header::WWW_AUTHENTICATE,
            AuthTarget::Proxy => header::PROXY_AUTHENTICATE,
        }
    }

    /// Header carrying the credentials.
    pub fn authorization_header(&self) -> HeaderName {
        match self {
            AuthTarget::Server => header::AUTHORIZATION,
            AuthTarget::Proxy => header::PROXY_AUTHORIZATION,
        }
    }
}

/// One challenge from a `www-authenticate` or `proxy-authenticate` header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Challenge {
    /// The challenge scheme.
    pub scheme: AuthScheme,
    /// Everything after the scheme token, unparsed.
    pub params: String,
}

/// Parse the challenges of known schemes in `headers`.
///
/// Unknown schemes and non-utf8 values are skipped.
pub(crate) fn parse_challenges(headers: &HeaderMap, target: AuthTarget) -> Vec<Challenge> {
    headers
        .get_all(target.challenge_header())
        .iter()
        .filter_map(|v| v.to_str().ok())
        .filter_map(|v| {
            let v = v.trim();
            let (scheme, params) = v.split_once(' ').unwrap_or((v, ""));
            let scheme = AuthScheme::parse(scheme)?;
            Some(Challenge {
                scheme,
                params: params.trim().to_string(),
            })
        })
        .collect()
}

/// Computes credential headers in answer to challenges.
///
/// `step` counts the challenges already answered for this scheme, which
/// lets connection oriented schemes walk through their handshake.
/// Returning `None` gives up, and the challenge response is delivered to
/// the handler.
pub trait Authenticator: Send + Sync + 'static {
    /// Compute the value of the authorization header.
    fn authorize(
        &self,
        realm: &Realm,
        challenge: &Challenge,
        head: &RequestHead,
        step: u32,
    ) -> Result<Option<HeaderValue>, Error>;
}

/// Answers Basic challenges once. Other schemes are left unanswered.
#[derive(Debug, Default)]
pub struct BasicAuthenticator;

impl Authenticator for BasicAuthenticator {
    fn authorize(
        &self,
        realm: &Realm,
        challenge: &Challenge,
        _head: &RequestHead,
        step: u32,
    ) -> Result<Option<HeaderValue>, Error> {
        if challenge.scheme != AuthScheme::Basic || step > 0 {
            return Ok(None);
        }
        Ok(Some(basic_credentials(&realm.principal, &realm.password)?))
    }
}

pub(crate) fn basic_credentials(user: &str, pass: &str) -> Result<HeaderValue, Error> {
    let creds = BASE64_STANDARD.encode(format!("{}:{}", user, pass));
    let auth = format!("Basic {}", creds);
    let mut value = HeaderValue::from_str(&auth).map_err(|e| Error::BadHeader(e.to_string()))?;
    value.set_sensitive(true);
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn basic_header() {
        let v = basic_credentials("martin", "secret").unwrap();
        assert_eq!(v, "Basic bWFydGluOnNlY3JldA==");
        assert!(v.is_sensitive());
    }

    #[test]
    fn parse_multiple_challenges() {
        let mut headers = HeaderMap::new();
        headers.append(
            header::WWW_AUTHENTICATE,
            HeaderValue::from_static("Basic realm=\"foo\""),
        );
        headers.append(header::WWW_AUTHENTICATE, HeaderValue::from_static("NTLM"));
        headers.append(
            header::WWW_AUTHENTICATE,
            HeaderValue::from_static("Bearer realm=\"x\""),
        );

        let c = parse_challenges(&headers, AuthTarget::Server);
        assert_eq!(c.len(), 2);
        assert_eq!(c[0].scheme, AuthScheme::Basic);
        assert_eq!(c[0].params, "realm=\"foo\"");
        assert_eq!(c[1].scheme, AuthScheme::Ntlm);
        assert_eq!(c[1].params, "");

        assert!(parse_challenges(&headers, AuthTarget::Proxy).is_empty());
    }

    #[test]
    fn connection_oriented_schemes() {
        assert!(AuthScheme::Ntlm.is_connection_oriented());
        assert!(AuthScheme::Negotiate.is_connection_oriented());
        assert!(!AuthScheme::Basic.is_connection_oriented());
        assert!(!AuthScheme::Digest.is_connection_oriented());
    }

    #[test]
    fn preemptive_only_for_basic() {
        let r = Realm::basic("a", "b").preemptive(true);
        assert!(r.preemptive_header().unwrap().is_some());
        let r = Realm::new(AuthScheme::Digest, "a", "b").preemptive(true);
        assert!(r.preemptive_header().unwrap().is_none());
        let r = Realm::basic("a", "b");
        assert!(r.preemptive_header().unwrap().is_none());
    }

    #[test]
    fn realm_debug_hides_password() {
        let r = Realm::basic("a", "hunter2");
        assert!(!format!("{:?}", r).contains("hunter2"));
    }
}
