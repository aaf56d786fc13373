//! Admission control (§4.4): a counting semaphore bounding total live connections, plus the
//! `max_keepalive` and `keepalive_expiry` policies that govern how long an `Idle` connection is
//! allowed to sit in the index.
//!
//! Grounded in the teacher's `Pool` construction in `core::client::mod::Client::builder()`, which
//! eagerly builds its idle-timeout/connection-limit state at construction time rather than
//! lazily on first use — the same shape as `tokio::sync::Semaphore`, which needs no runtime
//! handle to construct (see the design notes' "eager semaphore construction").

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::error::{Error, Result};

/// One unit of the global admission budget. Held by a [`crate::connection::Connection`] for as
/// long as it counts against `max_connections`; dropping it (or the pool explicitly releasing it)
/// frees the slot for another connection.
pub(crate) type Permit = OwnedSemaphorePermit;

/// Bounds the number of simultaneously live connections and governs idle retention policy.
pub(crate) struct Admission {
    semaphore: Arc<Semaphore>,
    max_keepalive: Option<usize>,
    keepalive_expiry: Option<Duration>,
}

impl Admission {
    /// `max_connections = None` is modelled as an effectively unbounded semaphore.
    pub(crate) fn new(
        max_connections: Option<u32>,
        max_keepalive: Option<usize>,
        keepalive_expiry: Option<Duration>,
    ) -> Self {
        let permits = max_connections
            .map(|n| n as usize)
            .unwrap_or(Semaphore::MAX_PERMITS);
        Admission {
            semaphore: Arc::new(Semaphore::new(permits)),
            max_keepalive,
            keepalive_expiry,
        }
    }

    /// Waits up to `timeout` for one admission permit. Fails with `Error::pool_timeout` if it
    /// elapses first, or `Error::closed` if the pool's semaphore has been torn down.
    pub(crate) async fn acquire(&self, timeout: Option<Duration>) -> Result<Permit> {
        let acquire = Arc::clone(&self.semaphore).acquire_owned();
        let permit = match timeout {
            Some(d) => tokio::time::timeout(d, acquire)
                .await
                .map_err(|_| Error::pool_timeout())?,
            None => acquire.await,
        };
        permit.map_err(|_| Error::closed())
    }

    pub(crate) fn max_keepalive(&self) -> Option<usize> {
        self.max_keepalive
    }

    pub(crate) fn deadline_from_now(&self) -> Option<Instant> {
        self.keepalive_expiry.map(|d| Instant::now() + d)
    }

    /// Closes the semaphore, waking every pending `acquire` with an error. Used by `close()`.
    pub(crate) fn close(&self) {
        self.semaphore.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn acquire_succeeds_under_the_limit() {
        let admission = Admission::new(Some(2), None, None);
        let a = admission.acquire(None).await.unwrap();
        let b = admission.acquire(None).await.unwrap();
        drop(a);
        drop(b);
    }

    #[tokio::test]
    async fn acquire_times_out_when_exhausted() {
        let admission = Admission::new(Some(1), None, None);
        let _held = admission.acquire(None).await.unwrap();
        let err = admission
            .acquire(Some(Duration::from_millis(20)))
            .await
            .unwrap_err();
        assert!(err.is_pool_timeout());
    }

    #[tokio::test]
    async fn releasing_a_permit_unblocks_a_waiter() {
        let admission = Admission::new(Some(1), None, None);
        let held = admission.acquire(None).await.unwrap();
        drop(held);
        let second = admission.acquire(Some(Duration::from_millis(50))).await;
        assert!(second.is_ok());
    }

    #[test]
    fn unbounded_when_max_connections_is_none() {
        let admission = Admission::new(None, None, None);
        assert_eq!(admission.semaphore.available_permits(), Semaphore::MAX_PERMITS);
    }
}
