//! `pond` — a client-side HTTP/1.1 and HTTP/2 connection pool with optional proxy support.
//!
//! Connections are kept per-origin, reused across requests while `Idle`, admitted under a
//! configurable concurrency budget, and multiplexed for HTTP/2 peers. A [`ProxyPool`] routes
//! the same request shape through an upstream proxy, either forwarding it in absolute-form or
//! tunnelling it end-to-end via `CONNECT`.
//!
//! ```ignore
//! use pond::{ConnectionPool, Origin, Scheme, Timeouts, Url};
//!
//! # async fn example() -> Result<(), pond::Error> {
//! let pool = ConnectionPool::builder().max_connections(64).build();
//! let origin = Origin::new(Scheme::Https, "example.com", 443);
//! let url = Url::new(origin, "/");
//! let body = pond::empty_body();
//!
//! let (_version, status, _headers, _body) = pool
//!     .send(http::Method::GET, url, http::HeaderMap::new(), body, Timeouts::new())
//!     .await?;
//! # Ok(())
//! # }
//! ```

mod admission;
mod body;
mod config;
mod connect;
mod connection;
mod error;
mod index;
mod origin;
mod pool;
mod proxy;

pub use body::PoolBody;
pub use config::{Builder, ProxyBuilder, Timeouts};
pub use connection::{empty_body, full_body, Protocol, ReqBody};
pub use error::{Error, Result};
pub use origin::{Origin, Scheme, Url};
pub use pool::ConnectionPool;
pub use proxy::{ProxyMode, ProxyPool};

#[cfg(feature = "rustls-tls")]
pub use connect::TlsConfig;
