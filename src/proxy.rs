//! Proxy pool (§4.6): forwards plain `http://` requests through an intermediate proxy, and
//! tunnels `https://` requests to it via `CONNECT`.
//!
//! The `CONNECT` handshake itself is grounded directly in the teacher's
//! `core::client::connect::proxy::tunnel::tunnel` function: write a raw `CONNECT host:port
//! HTTP/1.1` request, then read until the status line and header terminator are in hand, scanning
//! for `HTTP/1.1 200`/`HTTP/1.0 200` vs `407` by byte prefix rather than parsing a full response.

use std::time::Duration;

use http::{HeaderMap, Method, StatusCode};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::{
    config::Timeouts,
    connection::ReqBody,
    error::{Error, Result},
    origin::{Origin, Scheme, Url},
    pool::ConnectionPool,
};

/// Which requests get forwarded to the proxy verbatim versus tunnelled through it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProxyMode {
    /// `http://` requests are forwarded, `https://` requests are tunnelled.
    #[default]
    Default,
    /// Every request is forwarded, regardless of scheme.
    ForwardOnly,
    /// Every request is tunnelled, regardless of scheme.
    TunnelOnly,
}

/// A [`ConnectionPool`] that routes every request through a single upstream proxy, either by
/// rewriting the request into an absolute-form forward or by tunnelling via `CONNECT`.
pub struct ProxyPool {
    pool: ConnectionPool,
    proxy_origin: Origin,
    proxy_headers: HeaderMap,
    proxy_mode: ProxyMode,
}

impl ProxyPool {
    pub(crate) fn new(
        pool: ConnectionPool,
        proxy_origin: Origin,
        proxy_headers: HeaderMap,
        proxy_mode: ProxyMode,
    ) -> Self {
        ProxyPool {
            pool,
            proxy_origin,
            proxy_headers,
            proxy_mode,
        }
    }

    fn wants_tunnel(&self, url: &Url) -> bool {
        match self.proxy_mode {
            ProxyMode::TunnelOnly => true,
            ProxyMode::ForwardOnly => false,
            ProxyMode::Default => url.origin.scheme == Scheme::Https,
        }
    }

    /// Sends one request through the proxy, per §4.6.
    pub async fn send(
        &self,
        method: Method,
        url: Url,
        headers: HeaderMap,
        body: ReqBody,
        timeouts: Timeouts,
    ) -> Result<(
        http::Version,
        StatusCode,
        HeaderMap,
        crate::body::PoolBody,
    )> {
        if self.wants_tunnel(&url) {
            self.send_tunnelled(method, url, headers, body, timeouts)
                .await
        } else {
            self.send_forwarded(method, url, headers, body, timeouts)
                .await
        }
    }

    async fn send_forwarded(
        &self,
        method: Method,
        url: Url,
        mut headers: HeaderMap,
        body: ReqBody,
        timeouts: Timeouts,
    ) -> Result<(
        http::Version,
        StatusCode,
        HeaderMap,
        crate::body::PoolBody,
    )> {
        let absolute_target = format!("{}{}", url.origin, url.target);
        let forward_url = Url::new(self.proxy_origin.clone(), absolute_target);

        let mut merged = self.proxy_headers.clone();
        merged.extend(headers.drain());

        // HTTP/2 is never negotiated on the connection to the proxy itself: forwarding is a
        // plain HTTP/1.1 relay, regardless of what the eventual origin supports.
        self.pool
            .send_with_http2_override(method, forward_url, merged, body, timeouts, false)
            .await
    }

    async fn send_tunnelled(
        &self,
        method: Method,
        url: Url,
        headers: HeaderMap,
        body: ReqBody,
        timeouts: Timeouts,
    ) -> Result<(
        http::Version,
        StatusCode,
        HeaderMap,
        crate::body::PoolBody,
    )> {
        let target = url.origin.clone();
        self.pool
            .send_via_tunnel(
                &self.proxy_origin,
                &self.proxy_headers,
                &target,
                method,
                url,
                headers,
                body,
                timeouts,
            )
            .await
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

/// Performs the `CONNECT host:port` handshake against an already-established TCP stream to the
/// proxy. On success, returns the same stream, now speaking directly to `target`.
pub(crate) async fn connect_tunnel(
    mut stream: tokio::net::TcpStream,
    target: &Origin,
    proxy_headers: &HeaderMap,
    read_timeout: Option<Duration>,
) -> Result<tokio::net::TcpStream> {
    let request = build_connect_request(target, proxy_headers);
    let io = async {
        write_all(&mut stream, request.as_bytes()).await?;
        read_connect_response(&mut stream).await
    };

    match read_timeout {
        Some(d) => tokio::time::timeout(d, io)
            .await
            .map_err(|_| Error::read_timeout())??,
        None => io.await?,
    };

    Ok(stream)
}

fn build_connect_request(target: &Origin, proxy_headers: &HeaderMap) -> String {
    let host = &target.host;
    let port = target.port;
    let mut buf = format!("CONNECT {host}:{port} HTTP/1.1\r\nHost: {host}:{port}\r\n");
    for (name, value) in proxy_headers {
        buf.push_str(name.as_str());
        buf.push_str(": ");
        buf.push_str(value.to_str().unwrap_or(""));
        buf.push_str("\r\n");
    }
    buf.push_str("\r\n");
    buf
}

async fn write_all(stream: &mut tokio::net::TcpStream, buf: &[u8]) -> Result<()> {
    stream.write_all(buf).await.map_err(Error::connect)
}

/// Reads the proxy's CONNECT response byte-by-byte-buffered until the header terminator, then
/// checks the status line by prefix, mirroring the teacher's tunnel implementation rather than
/// pulling in a full HTTP/1.1 response parser for a handshake this narrow.
async fn read_connect_response(stream: &mut tokio::net::TcpStream) -> Result<()> {
    let mut buf = vec![0u8; 8192];
    let mut pos = 0;

    loop {
        let n = stream
            .read(&mut buf[pos..])
            .await
            .map_err(Error::connect)?;
        if n == 0 {
            return Err(Error::connect(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "proxy closed the connection before completing CONNECT",
            )));
        }
        pos += n;

        let received = &buf[..pos];
        if received.starts_with(b"HTTP/1.1 200") || received.starts_with(b"HTTP/1.0 200") {
            if received.ends_with(b"\r\n\r\n") {
                return Ok(());
            }
            if pos == buf.len() {
                return Err(Error::proxy(
                    StatusCode::OK,
                    "proxy CONNECT response headers exceeded the read buffer",
                ));
            }
            // else: keep reading, the header terminator hasn't arrived yet.
        } else if let Some((status, reason)) = parse_status_line(received) {
            return Err(Error::proxy(status, &reason));
        } else if pos == buf.len() {
            return Err(Error::proxy(
                StatusCode::BAD_GATEWAY,
                "proxy CONNECT response did not fit the read buffer",
            ));
        }
        // else: not enough bytes yet to even see a full status line.
    }
}

fn parse_status_line(received: &[u8]) -> Option<(StatusCode, String)> {
    let line_end = received.iter().position(|&b| b == b'\n')?;
    let line = std::str::from_utf8(&received[..line_end]).ok()?.trim();
    let mut parts = line.splitn(3, ' ');
    let _version = parts.next()?;
    let code = parts.next()?;
    let reason = parts.next().unwrap_or("").to_owned();
    let status = StatusCode::from_bytes(code.as_bytes()).ok()?;
    Some((status, reason))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn connect_tunnel_succeeds_on_200() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            let n = sock.read(&mut buf).await.unwrap();
            assert!(std::str::from_utf8(&buf[..n])
                .unwrap()
                .starts_with("CONNECT example.com:443 HTTP/1.1"));
            sock.write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n")
                .await
                .unwrap();
        });

        let stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        let target = Origin::new(Scheme::Https, "example.com", 443);
        let result = connect_tunnel(stream, &target, &HeaderMap::new(), None).await;
        assert!(result.is_ok());
        server.await.unwrap();
    }

    #[tokio::test]
    async fn connect_tunnel_surfaces_407_as_proxy_error() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            let _ = sock.read(&mut buf).await.unwrap();
            sock.write_all(b"HTTP/1.1 407 Proxy Authentication Required\r\n\r\n")
                .await
                .unwrap();
        });

        let stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        let target = Origin::new(Scheme::Https, "example.com", 443);
        let err = connect_tunnel(stream, &target, &HeaderMap::new(), None)
            .await
            .unwrap_err();
        assert!(err.is_proxy());
        server.await.unwrap();
    }
}
