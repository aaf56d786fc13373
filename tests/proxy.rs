//! Integration tests for the proxy pool (§4.6 of the design notes): forwarding a plaintext
//! request through a proxy in absolute-form, and a failed `CONNECT` tunnel leaving no trace in
//! the target-origin index.

mod support;

use std::sync::{Arc, Mutex};

use http::{HeaderMap, HeaderValue, Method, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use pond::{empty_body, ConnectionPool, Origin, ProxyMode, Scheme, Timeouts, Url};
use support::server;

#[tokio::test]
async fn forward_proxy_rewrites_to_absolute_form_and_merges_headers() {
    let seen_uri = Arc::new(Mutex::new(None));
    let seen_header = Arc::new(Mutex::new(None));
    let uri_slot = Arc::clone(&seen_uri);
    let header_slot = Arc::clone(&seen_header);

    let proxy = server::http(move |req| {
        *uri_slot.lock().unwrap() = Some(req.uri().to_string());
        *header_slot.lock().unwrap() = req
            .headers()
            .get("x-proxy-auth")
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned);
        async { http::Response::new(Full::new(Bytes::from("relayed"))) }
    });

    let proxy_origin = Origin::new(Scheme::Http, "127.0.0.1", proxy.addr().port());
    let mut proxy_headers = HeaderMap::new();
    proxy_headers.insert("x-proxy-auth", HeaderValue::from_static("secret"));

    let pool = ConnectionPool::builder()
        .proxy(proxy_origin)
        .proxy_headers(proxy_headers)
        .proxy_mode(ProxyMode::ForwardOnly)
        .build();

    let target = Url::new(Origin::new(Scheme::Http, "upstream.example", 80), "/widgets?id=1");
    let (_, status, _, body) = pool
        .send(Method::GET, target, HeaderMap::new(), empty_body(), Timeouts::new())
        .await
        .unwrap();

    assert_eq!(status, StatusCode::OK);
    let _ = BodyExt::collect(body).await.unwrap();

    assert_eq!(
        seen_uri.lock().unwrap().as_deref(),
        Some("http://upstream.example:80/widgets?id=1")
    );
    assert_eq!(seen_header.lock().unwrap().as_deref(), Some("secret"));
}

#[tokio::test]
async fn failed_connect_surfaces_proxy_error_without_registering_the_target() {
    let proxy = server::raw(|mut stream| async move {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        let mut buf = [0u8; 1024];
        let _ = stream.read(&mut buf).await;
        let _ = stream
            .write_all(b"HTTP/1.1 407 Proxy Authentication Required\r\n\r\n")
            .await;
    });

    let proxy_origin = Origin::new(Scheme::Http, "127.0.0.1", proxy.addr().port());
    let pool = ConnectionPool::builder()
        .proxy(proxy_origin)
        .proxy_mode(ProxyMode::TunnelOnly)
        .build();

    let target = Url::new(Origin::new(Scheme::Https, "upstream.example", 443), "/");
    let err = pool
        .send(Method::GET, target, HeaderMap::new(), empty_body(), Timeouts::new())
        .await
        .unwrap_err();

    assert!(err.is_proxy());
    assert!(err.to_string().contains("407"));
}
