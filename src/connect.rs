//! TCP (and optional TLS) connector used by [`crate::Connection::connect`].
//!
//! Grounded in the teacher's `core::client::connect::http::HttpConnector`: DNS resolution followed
//! by a TCP connect, with an optional connect-timeout race. TLS is layered on top with
//! `tokio-rustls`, mirroring the teacher's `rustls-tls-webpki-roots` feature combination rather
//! than its default BoringSSL stack — the pool needs a plain TLS client session, not browser TLS
//! fingerprinting, so the lighter, pure-Rust stack is the better fit here (see DESIGN.md).

use std::{fmt, io, sync::Arc, time::Duration};

use tokio::net::TcpStream;

use crate::{
    error::{Error, Result},
    origin::{Origin, Scheme},
};

#[cfg(feature = "rustls-tls")]
use std::sync::LazyLock;

#[cfg(feature = "rustls-tls")]
use rustls_pki_types::ServerName;

/// Shared TLS client configuration. Cheap to clone (wraps an `Arc`).
#[cfg(feature = "rustls-tls")]
#[derive(Clone)]
pub struct TlsConfig(pub(crate) Arc<rustls::ClientConfig>);

#[cfg(feature = "rustls-tls")]
impl TlsConfig {
    /// Build a TLS configuration trusting the Mozilla root store bundled via `webpki-roots`.
    pub fn webpki_roots() -> Self {
        static ROOTS: LazyLock<Arc<rustls::RootCertStore>> = LazyLock::new(|| {
            let mut store = rustls::RootCertStore::empty();
            store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
            Arc::new(store)
        });

        let config = rustls::ClientConfig::builder()
            .with_root_certificates((*ROOTS).clone())
            .with_no_client_auth();
        TlsConfig(Arc::new(config))
    }
}

#[cfg(feature = "rustls-tls")]
impl fmt::Debug for TlsConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("TlsConfig { .. }")
    }
}

#[cfg(not(feature = "rustls-tls"))]
#[derive(Clone, Debug)]
pub struct TlsConfig(());

/// The established transport, before any protocol handshake has taken place.
pub(crate) enum RawStream {
    Plain(TcpStream),
    #[cfg(feature = "rustls-tls")]
    Tls(Box<tokio_rustls::client::TlsStream<TcpStream>>),
}

impl RawStream {
    pub(crate) fn is_tls(&self) -> bool {
        match self {
            RawStream::Plain(_) => false,
            #[cfg(feature = "rustls-tls")]
            RawStream::Tls(_) => true,
        }
    }

    /// The protocol ALPN settled on, if this is a TLS stream and the peer participated in ALPN.
    pub(crate) fn alpn_protocol(&self) -> Option<Vec<u8>> {
        match self {
            RawStream::Plain(_) => None,
            #[cfg(feature = "rustls-tls")]
            RawStream::Tls(tls) => tls.get_ref().1.alpn_protocol().map(|p| p.to_vec()),
        }
    }

    /// Erases the concrete stream type behind a boxed `AsyncRead + AsyncWrite`, for handing off
    /// to hyper's connection builders.
    pub(crate) fn into_boxed_io(self) -> Box<dyn AsyncIo> {
        match self {
            RawStream::Plain(tcp) => Box::new(tcp),
            #[cfg(feature = "rustls-tls")]
            RawStream::Tls(tls) => Box::new(*tls),
        }
    }
}

/// A `Read + Write` stream usable as hyper transport, with the concrete type erased.
pub(crate) trait AsyncIo: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send {}
impl<T: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send> AsyncIo for T {}

/// Resolves DNS and opens a TCP connection to an origin, optionally racing against a
/// `connect` timeout and layering TLS on top for `https` origins.
#[derive(Clone, Default)]
pub(crate) struct Connector {
    #[cfg(feature = "rustls-tls")]
    tls: Option<TlsConfig>,
}

impl Connector {
    pub(crate) fn new() -> Self {
        Connector::default()
    }

    #[cfg(feature = "rustls-tls")]
    pub(crate) fn with_tls(mut self, tls: TlsConfig) -> Self {
        self.tls = Some(tls);
        self
    }

    pub(crate) async fn connect(
        &self,
        origin: &Origin,
        connect_timeout: Option<Duration>,
    ) -> Result<RawStream> {
        let tcp = Self::connect_tcp(&origin.host, origin.port, connect_timeout).await?;
        self.upgrade(origin, tcp).await
    }

    /// Dials a plain TCP connection to `origin`, without any TLS upgrade. Used by the proxy
    /// CONNECT-tunnel path to reach the proxy itself, before the tunnel is established.
    pub(crate) async fn dial_tcp(
        origin: &Origin,
        connect_timeout: Option<Duration>,
    ) -> Result<TcpStream> {
        Self::connect_tcp(&origin.host, origin.port, connect_timeout).await
    }

    /// Layers TLS on top of an already-established TCP stream, if `origin` is `https`. Used both
    /// by [`Connector::connect`] after dialing, and by the proxy CONNECT-tunnel path, which hands
    /// over a stream that is already connected to the target through the proxy.
    pub(crate) async fn upgrade(&self, origin: &Origin, tcp: TcpStream) -> Result<RawStream> {
        match origin.scheme {
            Scheme::Http => Ok(RawStream::Plain(tcp)),
            Scheme::Https => self.start_tls(origin, tcp).await,
        }
    }

    async fn connect_tcp(
        host: &str,
        port: u16,
        connect_timeout: Option<Duration>,
    ) -> Result<TcpStream> {
        let connect = async {
            let addrs = tokio::net::lookup_host((host, port))
                .await
                .map_err(Error::connect)?;

            let mut last_err = None;
            for addr in addrs {
                match TcpStream::connect(addr).await {
                    Ok(stream) => {
                        let _ = stream.set_nodelay(true);
                        return Ok(stream);
                    }
                    Err(e) => last_err = Some(e),
                }
            }
            Err(Error::connect(last_err.unwrap_or_else(|| {
                io::Error::new(io::ErrorKind::NotFound, "no addresses resolved")
            })))
        };

        match connect_timeout {
            Some(d) => tokio::time::timeout(d, connect)
                .await
                .map_err(|_| Error::connect(io::Error::new(io::ErrorKind::TimedOut, "connect")))?,
            None => connect.await,
        }
    }

    #[cfg(feature = "rustls-tls")]
    async fn start_tls(&self, origin: &Origin, tcp: TcpStream) -> Result<RawStream> {
        let tls = self
            .tls
            .clone()
            .unwrap_or_else(TlsConfig::webpki_roots);
        let connector = tokio_rustls::TlsConnector::from(tls.0);
        let server_name = ServerName::try_from(origin.host.clone())
            .map_err(Error::connect)?
            .to_owned();
        let stream = connector
            .connect(server_name, tcp)
            .await
            .map_err(Error::connect)?;
        Ok(RawStream::Tls(Box::new(stream)))
    }

    #[cfg(not(feature = "rustls-tls"))]
    async fn start_tls(&self, _origin: &Origin, _tcp: TcpStream) -> Result<RawStream> {
        Err(Error::connect(io::Error::new(
            io::ErrorKind::Unsupported,
            "https origins require the `rustls-tls` feature",
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn connects_to_loopback_listener() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accept = tokio::spawn(async move {
            let _ = listener.accept().await.unwrap();
        });

        let origin = Origin::new(Scheme::Http, "127.0.0.1", addr.port());
        let connector = Connector::new();
        let stream = connector.connect(&origin, None).await;
        assert!(stream.is_ok());
        accept.await.unwrap();
    }

    #[tokio::test]
    async fn connect_timeout_elapses_against_unroutable_address() {
        // 10.255.255.1 is a non-routable address commonly used to force a connect timeout
        // in test suites without relying on network conditions going the other way.
        let origin = Origin::new(Scheme::Http, "10.255.255.1", 81);
        let connector = Connector::new();
        let result = connector
            .connect(&origin, Some(Duration::from_millis(50)))
            .await;
        assert!(result.is_err());
    }
}
