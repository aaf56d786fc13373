//! Response body stream wrapper (§4.2): releases the owning connection back to the pool exactly
//! once, on every exit path — full drain, explicit close, or drop.
//!
//! Grounded in the teacher's `Pooled<T, Key>` `Drop` impl (`core/client/pool.rs`'s
//! `Pool::reused`/idle-return-on-drop dance, reconstructed here from its usage in
//! `core/client/mod.rs` since `pool.rs` itself was withheld): a wrapper type that holds a `Weak`
//! handle back to shared state and, in its `Drop`, hands the thing it was guarding back to the
//! owner. Here the "thing" is just a notification — the connection itself stays in the pool index
//! the whole time — so `Drop` only needs to fire a callback, guarded by an atomic so it can't
//! double-fire between a caller's explicit `close()` and the eventual `Drop`.

use std::{
    pin::Pin,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Weak,
    },
    task::{Context, Poll},
};

use bytes::Bytes;
use http_body::{Body, Frame};
use hyper::body::Incoming;

use crate::connection::Connection;

/// Called when a [`PoolBody`] is disposed of, exactly once.
pub(crate) trait ReleaseConnection: Send + Sync {
    fn response_closed(&self, connection: &Arc<Connection>);
}

struct Release {
    connection: Arc<Connection>,
    callback: Weak<dyn ReleaseConnection>,
    fired: AtomicBool,
}

impl Release {
    fn fire(&self) {
        if self.fired.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(callback) = self.callback.upgrade() {
            callback.response_closed(&self.connection);
        } else {
            tracing::debug!(id = self.connection.id(), "pool already gone, dropping release");
        }
    }
}

impl Drop for Release {
    fn drop(&mut self) {
        self.fire();
    }
}

/// The response body type returned from [`crate::PoolBody`]-producing calls. Wraps hyper's
/// `Incoming` body and, on every exit path, notifies the pool that the owning connection's stream
/// has closed.
pub struct PoolBody {
    inner: Incoming,
    release: Option<Release>,
}

impl PoolBody {
    pub(crate) fn new(
        inner: Incoming,
        connection: Arc<Connection>,
        callback: Weak<dyn ReleaseConnection>,
    ) -> Self {
        PoolBody {
            inner,
            release: Some(Release {
                connection,
                callback,
                fired: AtomicBool::new(false),
            }),
        }
    }

    /// Explicitly releases the connection without waiting for the body to be dropped or fully
    /// drained. Subsequent drops are no-ops thanks to the release's idempotence guard.
    pub fn close(&mut self) {
        if let Some(release) = &self.release {
            release.fire();
        }
    }
}

impl Body for PoolBody {
    type Data = Bytes;
    type Error = crate::error::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<std::result::Result<Frame<Bytes>, Self::Error>>> {
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll_frame(cx) {
            Poll::Ready(Some(Ok(frame))) => Poll::Ready(Some(Ok(frame))),
            Poll::Ready(Some(Err(e))) => {
                // The underlying transport broke mid-body: this connection is not fit to return
                // to the pool, regardless of what the caller does with us next.
                if let Some(release) = &this.release {
                    release.connection.close();
                }
                Poll::Ready(Some(Err(crate::error::Error::request(e))))
            }
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => Poll::Pending,
        }
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }
}

// No manual `Drop` impl here deliberately: Rust drops struct fields in declaration order, and
// `inner` is declared before `release`. That ordering alone gives us "the underlying body is
// dropped, then the pool callback fires" for free on every path that lets `PoolBody` simply go
// out of scope. An explicit `close()` call still fires the callback early via `Release::fire`'s
// idempotence guard.

#[cfg(test)]
mod tests {
    use super::*;
    use crate::origin::{Origin, Scheme};
    use std::sync::Mutex;

    struct RecordingCallback {
        calls: Mutex<Vec<u64>>,
    }

    impl ReleaseConnection for RecordingCallback {
        fn response_closed(&self, connection: &Arc<Connection>) {
            self.calls.lock().unwrap().push(connection.id());
        }
    }

    #[test]
    fn release_fires_at_most_once() {
        let connection = Arc::new(Connection::pending(Origin::new(
            Scheme::Http,
            "example.com",
            80,
        )));
        let recorder = Arc::new(RecordingCallback {
            calls: Mutex::new(Vec::new()),
        });
        let as_trait: Arc<dyn ReleaseConnection> = recorder.clone();
        let release = Release {
            connection: Arc::clone(&connection),
            callback: Arc::downgrade(&as_trait),
            fired: AtomicBool::new(false),
        };

        release.fire();
        release.fire();
        drop(release);

        assert_eq!(recorder.calls.lock().unwrap().len(), 1);
    }

    #[test]
    fn release_tolerates_pool_already_gone() {
        let connection = Arc::new(Connection::pending(Origin::new(
            Scheme::Http,
            "example.com",
            80,
        )));
        let recorder = Arc::new(RecordingCallback {
            calls: Mutex::new(Vec::new()),
        });
        let as_trait: Arc<dyn ReleaseConnection> = recorder.clone();
        let weak = Arc::downgrade(&as_trait);
        drop(as_trait);
        drop(recorder);

        let release = Release {
            connection,
            callback: weak,
            fired: AtomicBool::new(false),
        };
        // Must not panic even though the callback target is gone.
        release.fire();
    }
}
