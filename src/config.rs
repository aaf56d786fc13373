//! Builders and configuration types (§6 "Configuration").
//!
//! Grounded in the teacher's top-level `Builder`/`ClientBuilder` (`core/client/mod.rs`): a plain
//! struct of `Option<T>` fields assembled with `self`-consuming setter methods, finished off by a
//! fallible `build()`.

use std::time::Duration;

use crate::connect::Connector;
#[cfg(feature = "rustls-tls")]
use crate::connect::TlsConfig;
use crate::origin::Origin;
use crate::pool::ConnectionPool;
use crate::proxy::{ProxyMode, ProxyPool};

/// The three independently-configurable timeouts honoured by [`ConnectionPool::send`].
#[derive(Debug, Clone, Copy, Default)]
pub struct Timeouts {
    /// Maximum wait for an admission permit.
    pub pool: Option<Duration>,
    /// Maximum wait for transport establishment (DNS, TCP, TLS, handshake).
    pub connect: Option<Duration>,
    /// Maximum wait for any single socket read.
    pub read: Option<Duration>,
}

impl Timeouts {
    pub fn new() -> Self {
        Timeouts::default()
    }

    pub fn with_pool(mut self, d: Duration) -> Self {
        self.pool = Some(d);
        self
    }

    pub fn with_connect(mut self, d: Duration) -> Self {
        self.connect = Some(d);
        self
    }

    pub fn with_read(mut self, d: Duration) -> Self {
        self.read = Some(d);
        self
    }
}

/// Builds a [`ConnectionPool`].
#[derive(Default)]
pub struct Builder {
    max_connections: Option<u32>,
    max_keepalive: Option<usize>,
    keepalive_expiry: Option<Duration>,
    http2: bool,
    #[cfg(feature = "rustls-tls")]
    tls: Option<TlsConfig>,
}

impl Builder {
    pub fn new() -> Self {
        Builder::default()
    }

    /// Caps the total number of simultaneously live connections. `None` (the default) is
    /// effectively unbounded.
    pub fn max_connections(mut self, n: u32) -> Self {
        self.max_connections = Some(n);
        self
    }

    /// Caps the number of `Idle` connections retained for reuse. Exceeding it on transition to
    /// `Idle` evicts and closes the connection instead of keeping it warm.
    pub fn max_keepalive(mut self, n: usize) -> Self {
        self.max_keepalive = Some(n);
        self
    }

    /// How long an `Idle` connection may sit before the sweeper closes it.
    pub fn keepalive_expiry(mut self, d: Duration) -> Self {
        self.keepalive_expiry = Some(d);
        self
    }

    /// Enables HTTP/2: ALPN-negotiated over TLS, prior-knowledge h2c over plain TCP.
    pub fn http2(mut self, enabled: bool) -> Self {
        self.http2 = enabled;
        self
    }

    #[cfg(feature = "rustls-tls")]
    pub fn tls_config(mut self, tls: TlsConfig) -> Self {
        self.tls = Some(tls);
        self
    }

    pub fn build(self) -> ConnectionPool {
        let connector = self.connector();
        ConnectionPool::new(
            connector,
            self.http2,
            self.max_connections,
            self.max_keepalive,
            self.keepalive_expiry,
        )
    }

    /// Consumes this builder's settings to start a proxy pool, keyed on `proxy_origin`.
    pub fn proxy(self, proxy_origin: Origin) -> ProxyBuilder {
        ProxyBuilder {
            base: self,
            proxy_origin,
            proxy_headers: http::HeaderMap::new(),
            proxy_mode: ProxyMode::Default,
        }
    }

    #[cfg(feature = "rustls-tls")]
    fn connector(&self) -> Connector {
        match &self.tls {
            Some(tls) => Connector::new().with_tls(tls.clone()),
            None => Connector::new(),
        }
    }

    #[cfg(not(feature = "rustls-tls"))]
    fn connector(&self) -> Connector {
        Connector::new()
    }
}

/// Builds a [`ProxyPool`], layering `proxy_origin`/`proxy_headers`/`proxy_mode` on top of a
/// [`Builder`]'s settings.
pub struct ProxyBuilder {
    base: Builder,
    proxy_origin: Origin,
    proxy_headers: http::HeaderMap,
    proxy_mode: ProxyMode,
}

impl ProxyBuilder {
    pub fn max_connections(mut self, n: u32) -> Self {
        self.base = self.base.max_connections(n);
        self
    }

    pub fn max_keepalive(mut self, n: usize) -> Self {
        self.base = self.base.max_keepalive(n);
        self
    }

    pub fn keepalive_expiry(mut self, d: Duration) -> Self {
        self.base = self.base.keepalive_expiry(d);
        self
    }

    pub fn proxy_headers(mut self, headers: http::HeaderMap) -> Self {
        self.proxy_headers = headers;
        self
    }

    pub fn proxy_mode(mut self, mode: ProxyMode) -> Self {
        self.proxy_mode = mode;
        self
    }

    #[cfg(feature = "rustls-tls")]
    pub fn tls_config(mut self, tls: TlsConfig) -> Self {
        self.base = self.base.tls_config(tls);
        self
    }

    pub fn build(self) -> ProxyPool {
        let connector = self.base.connector();
        let pool = ConnectionPool::new(
            connector,
            self.base.http2,
            self.base.max_connections,
            self.base.max_keepalive,
            self.base.keepalive_expiry,
        );
        ProxyPool::new(pool, self.proxy_origin, self.proxy_headers, self.proxy_mode)
    }
}
