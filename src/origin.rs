//! The pool's partition key and the caller-facing URL it is derived from.

use std::fmt;

/// HTTP scheme understood by the pool. Only these two are meaningful origin-wise; anything else
/// is rejected by the caller before it reaches the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scheme {
    Http,
    Https,
}

impl Scheme {
    pub(crate) fn default_port(self) -> u16 {
        match self {
            Scheme::Http => 80,
            Scheme::Https => 443,
        }
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Scheme::Http => "http",
            Scheme::Https => "https",
        })
    }
}

/// `(scheme, host, port)` triple identifying an HTTP endpoint. This is the pool's partition key:
/// equality is tuple equality, and the caller is responsible for normalising `host` (lowercased,
/// punycoded) before constructing one — the pool does not normalise on entry (see Open Question
/// in the design notes).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Origin {
    pub scheme: Scheme,
    pub host: String,
    pub port: u16,
}

impl Origin {
    pub fn new(scheme: Scheme, host: impl Into<String>, port: u16) -> Self {
        Origin {
            scheme,
            host: host.into(),
            port,
        }
    }

    /// An `http://` origin on the default port (80).
    pub fn http(host: impl Into<String>) -> Self {
        Origin::new(Scheme::Http, host, Scheme::Http.default_port())
    }

    /// An `https://` origin on the default port (443).
    pub fn https(host: impl Into<String>) -> Self {
        Origin::new(Scheme::Https, host, Scheme::Https.default_port())
    }
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}:{}", self.scheme, self.host, self.port)
    }
}

/// `(scheme, host, port, target)` quadruple: an [`Origin`] plus the path+query sent on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Url {
    pub origin: Origin,
    pub target: String,
}

impl Url {
    pub fn new(origin: Origin, target: impl Into<String>) -> Self {
        Url {
            origin,
            target: target.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn origin_equality_is_tuple_equality() {
        let a = Origin::new(Scheme::Https, "example.com", 443);
        let b = Origin::new(Scheme::Https, "example.com", 443);
        let c = Origin::new(Scheme::Https, "example.com", 8443);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn default_ports() {
        assert_eq!(Scheme::Http.default_port(), 80);
        assert_eq!(Scheme::Https.default_port(), 443);
    }

    #[test]
    fn convenience_constructors_use_the_default_port() {
        assert_eq!(Origin::http("example.com").port, 80);
        assert_eq!(Origin::https("example.com").port, 443);
    }
}
