//! Connection pool dispatch (§4.5) — the core of this crate.
//!
//! Grounded in the teacher's `Client::request`/`try_send_request` retry loop
//! (`core/client/mod.rs`): pick a connection, try the request, and on a retryable failure loop
//! back for a fresh pick. The actual pool bucket storage (`pool.rs` in the teacher) was withheld
//! from the retrieval pack, so the index/admission/selection machinery here is original work built
//! from how the surrounding client code uses it, composed with the [`crate::index::Index`] and
//! [`crate::admission::Admission`] building blocks.

use std::{
    sync::{Arc, Mutex as SyncMutex, Weak},
    time::{Duration, Instant},
};

use http::{HeaderMap, Method, Request, Response, StatusCode, Version};

use crate::{
    admission::Admission,
    body::{PoolBody, ReleaseConnection},
    config::{Builder, Timeouts},
    connect::Connector,
    connection::{Connection, HandshakeConfig, Lifecycle, ReqBody, SendFailure},
    error::Result,
    index::Index,
    origin::{Origin, Url},
    proxy,
};

/// A client-side HTTP/1.1 and HTTP/2 connection pool.
///
/// Cheap to clone: internally reference-counted, and every clone shares the same index,
/// admission budget, and background sweeper state.
#[derive(Clone)]
pub struct ConnectionPool(Arc<Inner>);

struct Inner {
    index: Arc<tokio::sync::Mutex<Index>>,
    admission: Admission,
    connector: Connector,
    http2: bool,
    last_sweep: SyncMutex<Instant>,
}

enum Selected {
    Reused(Arc<Connection>),
    New(Arc<Connection>),
}

impl ConnectionPool {
    pub fn builder() -> Builder {
        Builder::new()
    }

    pub(crate) fn new(
        connector: Connector,
        http2: bool,
        max_connections: Option<u32>,
        max_keepalive: Option<usize>,
        keepalive_expiry: Option<Duration>,
    ) -> Self {
        ConnectionPool(Arc::new(Inner {
            index: Arc::new(tokio::sync::Mutex::new(Index::new())),
            admission: Admission::new(max_connections, max_keepalive, keepalive_expiry),
            connector,
            http2,
            last_sweep: SyncMutex::new(Instant::now()),
        }))
    }

    /// Sends one request, selecting or constructing a connection for `url`'s origin.
    pub async fn send(
        &self,
        method: Method,
        url: Url,
        headers: HeaderMap,
        body: ReqBody,
        timeouts: Timeouts,
    ) -> Result<(Version, StatusCode, HeaderMap, PoolBody)> {
        let http2 = self.0.http2;
        self.dispatch(method, url, headers, body, timeouts, http2)
            .await
    }

    /// Same as [`ConnectionPool::send`], but overriding whether HTTP/2 is attempted on a freshly
    /// created connection. Used by [`crate::proxy::ProxyPool`] to disable HTTP/2 on the
    /// forward-proxy relay connection regardless of how the pool was configured.
    pub(crate) async fn send_with_http2_override(
        &self,
        method: Method,
        url: Url,
        headers: HeaderMap,
        body: ReqBody,
        timeouts: Timeouts,
        http2: bool,
    ) -> Result<(Version, StatusCode, HeaderMap, PoolBody)> {
        self.dispatch(method, url, headers, body, timeouts, http2)
            .await
    }

    /// Sends a request over a connection keyed by `target`, tunnelling a fresh `CONNECT` through
    /// `proxy_origin` the first time this target origin is seen.
    #[allow(clippy::too_many_arguments)]
    pub(crate) async fn send_via_tunnel(
        &self,
        proxy_origin: &Origin,
        proxy_headers: &HeaderMap,
        target: &Origin,
        method: Method,
        url: Url,
        headers: HeaderMap,
        body: ReqBody,
        timeouts: Timeouts,
    ) -> Result<(Version, StatusCode, HeaderMap, PoolBody)> {
        self.0.sweep_if_due().await;
        let mut request = Some(build_request(method, &url, headers, body));

        loop {
            let selected = self.0.select_or_create(target, timeouts.pool).await?;
            let connection = match selected {
                Selected::Reused(c) => c,
                Selected::New(c) => {
                    if let Err(e) = self
                        .establish_tunnelled(&c, proxy_origin, proxy_headers, target, &timeouts)
                        .await
                    {
                        self.0.evict(&c).await;
                        return Err(e);
                    }
                    c
                }
            };

            let req = request.take().expect("request is re-filled on every retry");
            match connection.send_request(req, timeouts.read).await {
                Ok(response) => return Ok(self.finish(connection, response)),
                Err(SendFailure::Retry(req)) => {
                    request = Some(req);
                    continue;
                }
                Err(SendFailure::Fatal(e)) => {
                    self.0.evict(&connection).await;
                    return Err(e);
                }
            }
        }
    }

    async fn establish_tunnelled(
        &self,
        connection: &Arc<Connection>,
        proxy_origin: &Origin,
        proxy_headers: &HeaderMap,
        target: &Origin,
        timeouts: &Timeouts,
    ) -> Result<()> {
        let proxy_tcp = Connector::dial_tcp(proxy_origin, timeouts.connect).await?;
        let target_tcp =
            proxy::connect_tunnel(proxy_tcp, target, proxy_headers, timeouts.read).await?;
        let cfg = HandshakeConfig {
            http2: self.0.http2,
            connect_timeout: timeouts.connect,
        };
        connection
            .connect_over(target_tcp, &self.0.connector, &cfg)
            .await?;
        Ok(())
    }

    async fn dispatch(
        &self,
        method: Method,
        url: Url,
        headers: HeaderMap,
        body: ReqBody,
        timeouts: Timeouts,
        http2: bool,
    ) -> Result<(Version, StatusCode, HeaderMap, PoolBody)> {
        self.0.sweep_if_due().await;
        let origin = url.origin.clone();
        let mut request = Some(build_request(method, &url, headers, body));

        loop {
            let selected = self.0.select_or_create(&origin, timeouts.pool).await?;
            let connection = match selected {
                Selected::Reused(c) => c,
                Selected::New(c) => {
                    let cfg = HandshakeConfig {
                        http2,
                        connect_timeout: timeouts.connect,
                    };
                    if let Err(e) = c.connect(&self.0.connector, &cfg).await {
                        self.0.evict(&c).await;
                        return Err(e);
                    }
                    c
                }
            };

            let req = request.take().expect("request is re-filled on every retry");
            match connection.send_request(req, timeouts.read).await {
                Ok(response) => return Ok(self.finish(connection, response)),
                Err(SendFailure::Retry(req)) => {
                    request = Some(req);
                    continue;
                }
                Err(SendFailure::Fatal(e)) => {
                    self.0.evict(&connection).await;
                    return Err(e);
                }
            }
        }
    }

    fn finish(
        &self,
        connection: Arc<Connection>,
        response: Response<hyper::body::Incoming>,
    ) -> (Version, StatusCode, HeaderMap, PoolBody) {
        let (parts, incoming) = response.into_parts();
        let callback: Weak<dyn ReleaseConnection> = Arc::downgrade(&self.0);
        let body = PoolBody::new(incoming, connection, callback);
        (parts.version, parts.status, parts.headers, body)
    }

    /// Drains the index, releases every admission permit, and closes every connection.
    pub async fn close(&self) {
        let drained = {
            let mut index = self.0.index.lock().await;
            index.drain_all()
        };
        for connection in drained {
            connection.close();
            connection.release_permit();
        }
        self.0.admission.close();
    }
}

impl Inner {
    async fn sweep_if_due(&self) {
        let due = {
            let mut last = self.last_sweep.lock().unwrap();
            if last.elapsed() >= Duration::from_secs(1) {
                *last = Instant::now();
                true
            } else {
                false
            }
        };
        if !due {
            return;
        }

        let now = Instant::now();
        let mut index = self.index.lock().await;
        let expired: Vec<_> = index
            .all()
            .into_iter()
            .filter(|c| {
                c.lifecycle() == Lifecycle::Idle
                    && c.expires_at().is_some_and(|deadline| deadline <= now)
            })
            .collect();
        for connection in &expired {
            index.remove(connection);
        }
        drop(index);
        for connection in expired {
            connection.close();
            connection.release_permit();
        }
    }

    /// Single-pass selection scan over the origin's connection set (§4.5). Evicts any `Idle`
    /// connection found to already be peer-dropped along the way.
    async fn select_or_create(&self, origin: &Origin, pool_timeout: Option<Duration>) -> Result<Selected> {
        let mut index = self.index.lock().await;
        let candidates = index.for_origin(origin);

        let mut idle_reuse = None;
        let mut active_h2 = None;
        let mut pending_share = None;
        let mut saw_http1 = false;
        let mut dropped = Vec::new();

        for c in &candidates {
            match c.lifecycle() {
                Lifecycle::Idle => {
                    if c.is_connection_dropped() {
                        dropped.push(Arc::clone(c));
                    } else if idle_reuse.is_none() {
                        idle_reuse = Some(Arc::clone(c));
                    }
                }
                Lifecycle::Active => {
                    if c.is_http2() {
                        active_h2.get_or_insert_with(|| Arc::clone(c));
                    } else {
                        saw_http1 = true;
                    }
                }
                Lifecycle::Ready => {
                    if !c.is_http2() {
                        saw_http1 = true;
                    }
                }
                Lifecycle::Pending => {
                    pending_share.get_or_insert_with(|| Arc::clone(c));
                }
                Lifecycle::Closed => {}
            }
        }

        for c in &dropped {
            index.remove(c);
        }

        let reused = idle_reuse.or(active_h2).or_else(|| {
            if self.http2 && !saw_http1 {
                pending_share
            } else {
                None
            }
        });

        if let Some(connection) = reused {
            connection.mark_as_ready();
            drop(index);
            for c in dropped {
                c.close();
                c.release_permit();
            }
            return Ok(Selected::Reused(connection));
        }
        drop(index);
        for c in dropped {
            c.close();
            c.release_permit();
        }

        // Admission must not be acquired while holding the index lock (design notes, §5).
        let permit = self.admission.acquire(pool_timeout).await?;
        let connection = Arc::new(Connection::pending(origin.clone()));
        connection.install_permit(permit);

        let mut index = self.index.lock().await;
        index.add(Arc::clone(&connection));
        Ok(Selected::New(connection))
    }

    async fn evict(&self, connection: &Arc<Connection>) {
        connection.close();
        let mut index = self.index.lock().await;
        index.remove(connection);
        drop(index);
        connection.release_permit();
    }
}

impl ReleaseConnection for Inner {
    fn response_closed(&self, connection: &Arc<Connection>) {
        connection.stream_closed();

        let index = Arc::clone(&self.index);
        let max_keepalive = self.admission.max_keepalive();
        let deadline = self.admission.deadline_from_now();
        let connection = Arc::clone(connection);

        // `response_closed` is invoked from `Drop`, which cannot `.await` the index lock;
        // the bookkeeping is deferred onto the runtime instead. This preserves the pool's
        // invariants up to a scheduling tick rather than the fully synchronous guarantee a
        // single-threaded event loop could offer for free — see DESIGN.md.
        tokio::spawn(async move {
            match connection.lifecycle() {
                Lifecycle::Closed => {
                    let mut idx = index.lock().await;
                    idx.remove(&connection);
                    drop(idx);
                    connection.release_permit();
                }
                Lifecycle::Idle => {
                    let total = index.lock().await.len();
                    if max_keepalive.is_some_and(|limit| total > limit) {
                        let mut idx = index.lock().await;
                        idx.remove(&connection);
                        drop(idx);
                        connection.close();
                        connection.release_permit();
                    } else if deadline.is_some() {
                        connection.set_expires_at(deadline);
                    }
                }
                Lifecycle::Pending | Lifecycle::Ready | Lifecycle::Active => {
                    // Still in use by another stream (HTTP/2) or about to be reused; nothing to
                    // do until its own transition fires another `response_closed`.
                }
            }
        });
    }
}

fn build_request(method: Method, url: &Url, headers: HeaderMap, body: ReqBody) -> Request<ReqBody> {
    let uri: http::Uri = url
        .target
        .parse()
        .unwrap_or_else(|_| http::Uri::from_static("/"));
    let mut request = Request::new(body);
    *request.method_mut() = method;
    *request.uri_mut() = uri;
    *request.headers_mut() = headers;
    request
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::origin::Scheme;

    fn pool() -> ConnectionPool {
        ConnectionPool::new(Connector::new(), false, None, None, None)
    }

    #[tokio::test]
    async fn a_fresh_pool_has_an_empty_index() {
        let pool = pool();
        assert_eq!(pool.0.index.lock().await.len(), 0);
    }

    #[tokio::test]
    async fn select_or_create_admits_a_new_connection_once() {
        let pool = pool();
        let origin = Origin::new(Scheme::Http, "example.com", 80);
        let selected = pool.0.select_or_create(&origin, None).await.unwrap();
        assert!(matches!(selected, Selected::New(_)));
        assert_eq!(pool.0.index.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn close_drains_the_index_and_releases_permits() {
        let pool = pool();
        let origin = Origin::new(Scheme::Http, "example.com", 80);
        let _ = pool.0.select_or_create(&origin, None).await.unwrap();
        pool.close().await;
        assert_eq!(pool.0.index.lock().await.len(), 0);
    }
}
