use std::fmt;

use http::uri::Scheme;
use http::Uri;

use crate::Error;

/// A proxy that requests are routed through.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProxyServer {
    /// Host name of the proxy.
    pub host: String,
    /// Port of the proxy.
    pub port: u16,
    /// Whether the connection to the proxy itself is TLS.
    pub secure: bool,
    /// Credentials sent as `proxy-authorization`.
    pub realm: Option<crate::Realm>,
}

impl ProxyServer {
    /// Creates a plain proxy without credentials.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        ProxyServer {
            host: host.into().to_ascii_lowercase(),
            port,
            secure: false,
            realm: None,
        }
    }
}

/// Identifies which connections can be shared between requests.
///
/// Two requests with equal keys may share a connection. Requests with
/// differing keys never do.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PartitionKey {
    scheme: Scheme,
    host: String,
    port: u16,
    proxy: Option<(String, u16)>,
    virtual_host: Option<String>,
}

impl PartitionKey {
    /// Derive the key for a target uri.
    pub fn new(
        uri: &Uri,
        proxy: Option<&ProxyServer>,
        virtual_host: Option<&str>,
    ) -> Result<Self, Error> {
        let scheme = uri
            .scheme()
            .cloned()
            .ok_or_else(|| Error::BadUri(format!("missing scheme: {}", uri)))?;

        let host = uri
            .host()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| Error::BadUri(format!("missing host: {}", uri)))?
            .to_ascii_lowercase();

        let port = match uri.port_u16() {
            Some(p) => p,
            None => default_port(&scheme)
                .ok_or_else(|| Error::BadUri(format!("unknown scheme: {}", scheme)))?,
        };

        Ok(PartitionKey {
            scheme,
            host,
            port,
            proxy: proxy.map(|p| (p.host.clone(), p.port)),
            virtual_host: virtual_host.map(|v| v.to_ascii_lowercase()),
        })
    }

    /// The scheme of the target.
    pub fn scheme(&self) -> &Scheme {
        &self.scheme
    }

    /// The lowercased host of the target.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// The port of the target, defaulted from the scheme when absent in the uri.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Whether connections in this partition are TLS.
    pub fn is_secure(&self) -> bool {
        is_secure(&self.scheme)
    }

    /// The host and port to open a connection to. The proxy when there is one.
    pub fn connect_target(&self) -> (&str, u16) {
        match &self.proxy {
            Some((host, port)) => (host, *port),
            None => (&self.host, self.port),
        }
    }

    pub(crate) fn is_same_base(&self, other: &PartitionKey) -> bool {
        self.scheme == other.scheme && self.host == other.host && self.port == other.port
    }
}

impl fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}:{}", self.scheme, self.host, self.port)?;
        if let Some((host, port)) = &self.proxy {
            write!(f, " via {}:{}", host, port)?;
        }
        if let Some(v) = &self.virtual_host {
            write!(f, " as {}", v)?;
        }
        Ok(())
    }
}

pub(crate) fn default_port(scheme: &Scheme) -> Option<u16> {
    match scheme.as_str() {
        "http" | "ws" => Some(80),
        "https" | "wss" => Some(443),
        _ => None,
    }
}

pub(crate) fn is_secure(scheme: &Scheme) -> bool {
    matches!(scheme.as_str(), "https" | "wss")
}
