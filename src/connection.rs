//! A single pooled transport and its state machine.
//!
//! Grounded in the teacher's `core::client::client::PoolClient`/`PoolTx` split (one handle per
//! HTTP/1.1 connection, a cloneable sender for HTTP/2) and its `connect::Connected`/`PoisonPill`
//! pattern for signalling a dead connection without the owner having to poll the socket directly.
//! Unlike the teacher, which drives liveness off of `SendRequest::poll_ready` at call sites, this
//! pool additionally needs a background-observable "is this already dead" probe for the selection
//! scan (§4.4 of the design notes), so the background driver task that pumps the underlying
//! `hyper::client::conn` connection sets an `AtomicBool` the moment it returns — whether that's a
//! clean shutdown, a protocol error, or the peer closing the socket.

use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex as SyncMutex,
    },
    time::{Duration, Instant},
};

use http_body_util::combinators::BoxBody;
use hyper::{
    body::Incoming,
    client::conn::{http1, http2},
};
use hyper_util::rt::{TokioExecutor, TokioIo};
use tokio::sync::{Mutex as AsyncMutex, OnceCell};

use crate::{
    connect::Connector,
    error::{Error, Result},
    origin::Origin,
};

/// Boxed, erased request body accepted by [`Connection::send_request`] and by the pool's public
/// `send` entry point.
pub type ReqBody = BoxBody<bytes::Bytes, Box<dyn std::error::Error + Send + Sync>>;

/// An empty request body, for requests that carry no payload (`GET`, `HEAD`, a bodyless `CONNECT`
/// relay, ...). Grounded in the teacher's `Body::empty()` convenience constructor.
pub fn empty_body() -> ReqBody {
    use http_body_util::{BodyExt, Empty};
    Empty::new()
        .map_err(|never: std::convert::Infallible| match never {})
        .boxed()
}

/// A request body consisting of a single in-memory chunk. Grounded in the teacher's
/// `Body::reusable()`/`From<Bytes>` constructors.
pub fn full_body(chunk: impl Into<bytes::Bytes>) -> ReqBody {
    use http_body_util::{BodyExt, Full};
    Full::new(chunk.into())
        .map_err(|never: std::convert::Infallible| match never {})
        .boxed()
}

/// The wire protocol a connection settled on once its handshake completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Http1,
    Http2,
}

/// Connection lifecycle states (§4.1). `Pending` connections have no resolved protocol yet;
/// every other state does.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Lifecycle {
    Pending,
    Ready,
    Active,
    Idle,
    Closed,
}

struct StateInner {
    lifecycle: Lifecycle,
    /// Concurrent open streams: at most 1 for HTTP/1.1, arbitrarily many for HTTP/2.
    streams: u32,
    expires_at: Option<Instant>,
    /// Set when an HTTP/1.1 response has signalled non-keepalive (`Connection: close`, or a
    /// response version other than HTTP/1.1) but its body is still outstanding. The driver task
    /// keeps running so the caller can still read the body; once the last stream on this
    /// connection closes (`remove_stream`), the connection goes straight to `Closed` instead of
    /// `Idle` and only then is the driver actually torn down.
    close_after_body: bool,
}

/// Parameters governing how a [`Connection`] performs its handshake.
#[derive(Debug, Clone)]
pub(crate) struct HandshakeConfig {
    /// Attempt HTTP/2: via ALPN over TLS, or prior-knowledge h2c over plain TCP.
    pub http2: bool,
    pub connect_timeout: Option<Duration>,
}

enum ConnIo {
    Http1(AsyncMutex<http1::SendRequest<ReqBody>>),
    Http2(http2::SendRequest<ReqBody>),
}

/// Result of a resolved handshake: the negotiated protocol plus the handle used to issue
/// requests on it.
struct Resolved {
    protocol: Protocol,
    io: ConnIo,
}

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// A single pooled transport, from handshake through to teardown.
///
/// Cloning a `Connection` is cheap (it is reference-counted internally by virtue of always being
/// held behind an `Arc` in the pool index) and all clones observe the same lifecycle state.
pub struct Connection {
    id: u64,
    origin: Origin,
    // Shared with the background driver task (see `spawn_driver`), which updates these when the
    // underlying `hyper::client::conn` connection future resolves — cleanly, with an error, or
    // because the peer went away.
    state: Arc<SyncMutex<StateInner>>,
    dropped: Arc<AtomicBool>,
    resolved: OnceCell<Resolved>,
    driver: SyncMutex<Option<tokio::task::JoinHandle<()>>>,
    permit: SyncMutex<Option<crate::admission::Permit>>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("origin", &self.origin)
            .field("protocol", &self.protocol())
            .field("lifecycle", &self.lifecycle())
            .finish()
    }
}

impl Connection {
    /// Constructs a new connection in the `Pending` state for `origin`. Does not perform any I/O;
    /// call [`Connection::connect`] to drive the handshake.
    pub(crate) fn pending(origin: Origin) -> Self {
        Connection {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            origin,
            state: Arc::new(SyncMutex::new(StateInner {
                lifecycle: Lifecycle::Pending,
                streams: 0,
                expires_at: None,
                close_after_body: false,
            })),
            dropped: Arc::new(AtomicBool::new(false)),
            resolved: OnceCell::new(),
            driver: SyncMutex::new(None),
            permit: SyncMutex::new(None),
        }
    }

    /// Attaches the admission permit this connection was constructed under.
    pub(crate) fn install_permit(&self, permit: crate::admission::Permit) {
        *self.permit.lock().unwrap() = Some(permit);
    }

    /// Releases the admission permit, if one is attached, freeing the slot. Idempotent: a second
    /// call is a no-op.
    pub(crate) fn release_permit(&self) {
        self.permit.lock().unwrap().take();
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn origin(&self) -> &Origin {
        &self.origin
    }

    /// Protocol, once resolved. `None` while still `Pending`.
    pub fn protocol(&self) -> Option<Protocol> {
        self.resolved.get().map(|r| r.protocol)
    }

    pub(crate) fn lifecycle(&self) -> Lifecycle {
        self.state.lock().unwrap().lifecycle
    }

    pub(crate) fn is_http2(&self) -> bool {
        matches!(self.protocol(), Some(Protocol::Http2))
    }

    pub(crate) fn stream_count(&self) -> u32 {
        self.state.lock().unwrap().streams
    }

    pub(crate) fn expires_at(&self) -> Option<Instant> {
        self.state.lock().unwrap().expires_at
    }

    pub(crate) fn set_expires_at(&self, at: Option<Instant>) {
        self.state.lock().unwrap().expires_at = at;
    }

    /// Non-blocking probe for whether the underlying transport is known to be gone. Backed by the
    /// background driver task completing, rather than a live socket peek: once
    /// `hyper::client::conn`'s connection future takes ownership of the socket there is no way
    /// for the pool to inspect it directly, so the driver task itself is the source of truth.
    pub fn is_connection_dropped(&self) -> bool {
        self.dropped.load(Ordering::Acquire) || self.lifecycle() == Lifecycle::Closed
    }

    /// Reacquires an `Idle` connection for a new request, clearing its keep-alive deadline.
    /// A no-op for connections that are not `Idle` (e.g. an HTTP/2 connection gaining another
    /// concurrent stream while already `Active`).
    pub(crate) fn mark_as_ready(&self) {
        let mut state = self.state.lock().unwrap();
        state.expires_at = None;
        if state.lifecycle == Lifecycle::Idle {
            state.lifecycle = Lifecycle::Ready;
        }
    }

    /// Performs transport establishment and the protocol handshake, transitioning
    /// `Pending` → `Ready` (or `Active`, if a stream was opportunistically claimed on this
    /// connection before the handshake resolved — see the speculative-sharing design note).
    ///
    /// Safe to call concurrently from multiple tasks sharing the same `Pending` connection: only
    /// the first call does the work, the rest observe the same resolved outcome.
    pub(crate) async fn connect(
        &self,
        connector: &Connector,
        cfg: &HandshakeConfig,
    ) -> Result<Protocol> {
        let origin = self.origin.clone();
        self.connect_with(
            async move { connector.connect(&origin, cfg.connect_timeout).await },
            cfg,
        )
        .await
    }

    /// Resolves this connection's handshake over an already-connected TCP stream, instead of
    /// dialing one itself. Used by the proxy CONNECT-tunnel path (§4.6): the stream is already
    /// talking to the target origin by the time it reaches here, so all that remains is the
    /// (possible) TLS handshake and the HTTP/1.1 or HTTP/2 preface.
    pub(crate) async fn connect_over(
        &self,
        tcp: tokio::net::TcpStream,
        connector: &Connector,
        cfg: &HandshakeConfig,
    ) -> Result<Protocol> {
        let origin = self.origin.clone();
        self.connect_with(async move { connector.upgrade(&origin, tcp).await }, cfg)
            .await
    }

    async fn connect_with<F>(&self, dial: F, cfg: &HandshakeConfig) -> Result<Protocol>
    where
        F: std::future::Future<Output = Result<crate::connect::RawStream>>,
    {
        let resolved = self
            .resolved
            .get_or_try_init(|| async {
                let raw = dial.await?;
                self.finish_handshake(raw, cfg).await
            })
            .await?;

        let mut state = self.state.lock().unwrap();
        if state.lifecycle == Lifecycle::Pending {
            state.lifecycle = if state.streams > 0 {
                Lifecycle::Active
            } else {
                Lifecycle::Ready
            };
        }
        Ok(resolved.protocol)
    }

    async fn finish_handshake(
        &self,
        raw: crate::connect::RawStream,
        cfg: &HandshakeConfig,
    ) -> Result<Resolved> {
        // Over TLS, HTTP/2 is only attempted when ALPN actually negotiated it. Over plain TCP
        // there is no negotiation signal, so an `http2` request is honoured via prior-knowledge
        // h2c — the caller already knows the origin speaks it.
        let use_h2 = cfg.http2 && (raw.alpn_protocol().as_deref() == Some(b"h2") || !raw.is_tls());
        let io = TokioIo::new(raw.into_boxed_io());

        if use_h2 {
            let (sender, conn) = http2::Builder::new(TokioExecutor::new())
                .handshake(io)
                .await
                .map_err(Error::connect)?;
            self.spawn_driver(conn);
            Ok(Resolved {
                protocol: Protocol::Http2,
                io: ConnIo::Http2(sender),
            })
        } else {
            let (sender, conn) = http1::Builder::new()
                .handshake(io)
                .await
                .map_err(Error::connect)?;
            self.spawn_driver(conn);
            Ok(Resolved {
                protocol: Protocol::Http1,
                io: ConnIo::Http1(AsyncMutex::new(sender)),
            })
        }
    }

    /// Drives the underlying `hyper::client::conn` connection to completion in the background.
    /// Works for both the HTTP/1.1 and HTTP/2 connection futures, since both resolve to
    /// `Result<(), hyper::Error>` regardless of how they got there.
    fn spawn_driver<C>(&self, conn: C)
    where
        C: std::future::Future<Output = std::result::Result<(), hyper::Error>> + Send + 'static,
    {
        let state = Arc::clone(&self.state);
        let dropped = Arc::clone(&self.dropped);
        let handle = tokio::spawn(async move {
            let _ = conn.await;
            dropped.store(true, Ordering::Release);
            state.lock().unwrap().lifecycle = Lifecycle::Closed;
        });
        *self.driver.lock().unwrap() = Some(handle);
    }

    /// Serialises one request on this connection. Fails with [`SendFailure::Retry`] when the
    /// connection turns out to be unusable after all — e.g. an HTTP/1.1 sender whose driver has
    /// already exited, or a handshake that has not resolved yet — so the pool can select or build
    /// a fresh connection and retry.
    pub(crate) async fn send_request(
        &self,
        request: http::Request<ReqBody>,
        read_timeout: Option<Duration>,
    ) -> std::result::Result<http::Response<Incoming>, SendFailure> {
        let Some(resolved) = self.resolved.get() else {
            return Err(SendFailure::Retry(request));
        };

        match &resolved.io {
            ConnIo::Http1(sender) => self.send_http1(sender, request, read_timeout).await,
            ConnIo::Http2(sender) => {
                self.send_http2(&mut sender.clone(), request, read_timeout)
                    .await
            }
        }
    }

    async fn send_http1(
        &self,
        sender: &AsyncMutex<http1::SendRequest<ReqBody>>,
        request: http::Request<ReqBody>,
        read_timeout: Option<Duration>,
    ) -> std::result::Result<http::Response<Incoming>, SendFailure> {
        let mut sender = sender.lock().await;
        if sender.is_closed() || sender.ready().await.is_err() {
            self.close();
            return Err(SendFailure::Retry(request));
        }
        self.transition_active();

        let result = match read_timeout {
            Some(d) => tokio::time::timeout(d, sender.send_request(request))
                .await
                .map_err(|_| SendFailure::Fatal(Error::read_timeout()))?,
            None => sender.send_request(request).await,
        };

        match result {
            Ok(response) => {
                // The body is still outstanding at this point — the driver task is what pumps
                // its frames to the caller, so it must not be aborted yet. Record the intent to
                // close and let `remove_stream` act on it once the body is disposed of.
                if response.version() != http::Version::HTTP_11 || has_close_header(&response) {
                    self.mark_close_after_body();
                }
                Ok(response)
            }
            Err(e) => {
                self.close();
                Err(SendFailure::Fatal(Error::request(e)))
            }
        }
    }

    async fn send_http2(
        &self,
        sender: &mut http2::SendRequest<ReqBody>,
        request: http::Request<ReqBody>,
        read_timeout: Option<Duration>,
    ) -> std::result::Result<http::Response<Incoming>, SendFailure> {
        if sender.is_closed() {
            return Err(SendFailure::Retry(request));
        }
        self.add_stream();

        let send = async {
            match sender.ready().await {
                Ok(()) => sender.send_request(request).await,
                Err(e) => Err(e),
            }
        };
        let result = match read_timeout {
            Some(d) => tokio::time::timeout(d, send)
                .await
                .map_err(|_| SendFailure::Fatal(Error::read_timeout()))?,
            None => send.await,
        };

        match result {
            Ok(response) => Ok(response),
            Err(e) => {
                self.remove_stream();
                Err(SendFailure::Fatal(Error::request(e)))
            }
        }
    }

    /// Called by the response body wrapper (§4.2) once a stream on this connection has been
    /// fully consumed, explicitly closed, or dropped. For HTTP/1.1 this always vacates the single
    /// stream slot; for HTTP/2 it decrements the live-stream count, which may or may not reach
    /// zero.
    pub(crate) fn stream_closed(&self) {
        self.remove_stream();
    }

    fn transition_active(&self) {
        let mut state = self.state.lock().unwrap();
        state.lifecycle = Lifecycle::Active;
        state.streams = 1;
    }

    fn add_stream(&self) {
        let mut state = self.state.lock().unwrap();
        state.streams += 1;
        state.lifecycle = Lifecycle::Active;
    }

    /// Marks this HTTP/1.1 connection as non-keepalive once its in-flight body is disposed of.
    /// Does not touch `lifecycle` or tear down the driver itself — the body the driver is still
    /// delivering must be allowed to finish first; see `remove_stream`.
    fn mark_close_after_body(&self) {
        self.state.lock().unwrap().close_after_body = true;
    }

    fn remove_stream(&self) {
        let should_close = {
            let mut state = self.state.lock().unwrap();
            if state.streams > 0 {
                state.streams -= 1;
            }
            if state.lifecycle == Lifecycle::Closed {
                false
            } else if state.streams == 0 && state.close_after_body {
                state.lifecycle = Lifecycle::Closed;
                true
            } else {
                state.lifecycle = if state.streams == 0 {
                    Lifecycle::Idle
                } else {
                    Lifecycle::Active
                };
                false
            }
        };
        // The body has just been fully disposed of (drained, explicitly closed, or dropped), so
        // nothing is left reading from the driver — safe to tear it down now.
        if should_close {
            self.dropped.store(true, Ordering::Release);
            if let Some(handle) = self.driver.lock().unwrap().take() {
                handle.abort();
            }
        }
    }

    /// Tears the connection down: aborts the background driver (dropping the transport) and
    /// marks the connection `Closed` so the pool will evict it.
    pub(crate) fn close(&self) {
        self.state.lock().unwrap().lifecycle = Lifecycle::Closed;
        self.dropped.store(true, Ordering::Release);
        if let Some(handle) = self.driver.lock().unwrap().take() {
            handle.abort();
        }
    }
}

fn has_close_header(response: &http::Response<Incoming>) -> bool {
    response
        .headers()
        .get(http::header::CONNECTION)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("close"))
}

/// Outcome of a failed [`Connection::send_request`] call.
pub(crate) enum SendFailure {
    /// The connection cannot be used; the pool should select or build another and retry. Carries
    /// the request back, untouched, since nothing was ever written to the wire.
    Retry(http::Request<ReqBody>),
    /// A terminal failure: the caller's request fails with this error.
    Fatal(Error),
}
