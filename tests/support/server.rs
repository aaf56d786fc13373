//! A throwaway HTTP server for integration tests, run on its own thread and runtime so the
//! pool under test never shares a reactor with what it's talking to.
//!
//! Adapted from the teacher's `tests/support/server.rs`: same thread-plus-own-runtime shape,
//! same panic-propagation-through-a-channel `Drop` impl, trimmed to what this crate's tests
//! actually exercise (no TLS, no unix sockets, no low-level raw-response mode).

use std::{
    convert::Infallible,
    future::Future,
    net,
    sync::{atomic::{AtomicUsize, Ordering}, mpsc as std_mpsc, Arc},
    thread,
    time::Duration,
};

use http_body_util::Full;
use hyper::body::Bytes;
use tokio::{runtime, sync::oneshot};

pub struct Server {
    addr: net::SocketAddr,
    panic_rx: std_mpsc::Receiver<()>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    accepts: Arc<AtomicUsize>,
}

impl Server {
    pub fn addr(&self) -> net::SocketAddr {
        self.addr
    }

    /// Number of distinct TCP connections this server has accepted so far. Used to tell a reused
    /// keep-alive connection apart from a freshly dialled one.
    #[allow(unused)]
    pub fn accepts(&self) -> usize {
        self.accepts.load(Ordering::SeqCst)
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if !std::thread::panicking() {
            self.panic_rx
                .recv_timeout(Duration::from_secs(3))
                .expect("test server should not panic");
        }
    }
}

#[allow(unused)]
pub fn http<F, Fut>(func: F) -> Server
where
    F: Fn(http::Request<hyper::body::Incoming>) -> Fut + Clone + Send + 'static,
    Fut: Future<Output = http::Response<Full<Bytes>>> + Send + 'static,
{
    let test_name = thread::current().name().unwrap_or("<unknown>").to_string();
    thread::spawn(move || {
        let rt = runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .expect("new rt");
        let listener = rt.block_on(async {
            tokio::net::TcpListener::bind(&std::net::SocketAddr::from(([127, 0, 0, 1], 0)))
                .await
                .unwrap()
        });
        let addr = listener.local_addr().unwrap();

        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();
        let (panic_tx, panic_rx) = std_mpsc::channel();
        let accepts = Arc::new(AtomicUsize::new(0));
        let accepts_counter = Arc::clone(&accepts);
        let tname = format!("test({test_name})-support-server");
        thread::Builder::new()
            .name(tname)
            .spawn(move || {
                rt.block_on(async move {
                    let builder = hyper_util::server::conn::auto::Builder::new(
                        hyper_util::rt::TokioExecutor::new(),
                    );
                    loop {
                        tokio::select! {
                            _ = &mut shutdown_rx => break,
                            accepted = listener.accept() => {
                                let (io, _) = accepted.expect("accepted");
                                accepts_counter.fetch_add(1, Ordering::SeqCst);
                                let func = func.clone();
                                let infall = move |req| {
                                    let fut = func(req);
                                    async move { Ok::<_, Infallible>(fut.await) }
                                };
                                let svc = hyper::service::service_fn(infall);
                                let builder = builder.clone();
                                tokio::spawn(async move {
                                    let _ = builder
                                        .serve_connection_with_upgrades(
                                            hyper_util::rt::TokioIo::new(io),
                                            svc,
                                        )
                                        .await;
                                });
                            }
                        }
                    }
                    let _ = panic_tx.send(());
                });
            })
            .expect("thread spawn");
        Server {
            addr,
            panic_rx,
            shutdown_tx: Some(shutdown_tx),
            accepts,
        }
    })
    .join()
    .unwrap()
}

/// Accepts exactly one connection, hands the raw socket to `handler`, then stops — used by tests
/// that need to simulate a peer dropping the connection rather than speaking real HTTP.
#[allow(unused)]
pub fn raw<F, Fut>(handler: F) -> Server
where
    F: FnOnce(tokio::net::TcpStream) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let test_name = thread::current().name().unwrap_or("<unknown>").to_string();
    thread::spawn(move || {
        let rt = runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .expect("new rt");
        let listener = rt.block_on(async {
            tokio::net::TcpListener::bind(&std::net::SocketAddr::from(([127, 0, 0, 1], 0)))
                .await
                .unwrap()
        });
        let addr = listener.local_addr().unwrap();

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let (panic_tx, panic_rx) = std_mpsc::channel();
        let accepts = Arc::new(AtomicUsize::new(0));
        let accepts_counter = Arc::clone(&accepts);
        let tname = format!("test({test_name})-support-raw-server");
        thread::Builder::new()
            .name(tname)
            .spawn(move || {
                rt.block_on(async move {
                    if let Ok((io, _)) = listener.accept().await {
                        accepts_counter.fetch_add(1, Ordering::SeqCst);
                        handler(io).await;
                    }
                    let _ = shutdown_rx;
                    let _ = panic_tx.send(());
                });
            })
            .expect("thread spawn");
        Server {
            addr,
            panic_rx,
            shutdown_tx: Some(shutdown_tx),
            accepts,
        }
    })
    .join()
    .unwrap()
}
