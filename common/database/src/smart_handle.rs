use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::ReconcileError;
use crate::indexes::{self, IndexSpec, IndexStore};
use crate::Connection;

/// A connection that re-validates itself lazily.
///
/// [`SmartHandle::current`] checks how long ago the connection was last
/// refreshed; past the refresh interval it bumps the timestamp and starts a
/// refresh in the background. Callers always get the connection back right
/// away, even when it is stale or the refresh later fails.
///
/// The interval is a soft bound. Callers that observe staleness at the same
/// moment may each start a refresh, which is why [`Connection::refresh`] must
/// be cheap and safe to run concurrently.
pub struct SmartHandle<C: ?Sized> {
    inner: Arc<C>,
    last_refresh: RwLock<Instant>,
    refresh_interval: Duration,
    refresh_failures: Arc<AtomicU64>,
}

impl<C> SmartHandle<C>
where
    C: Connection + ?Sized,
{
    pub fn new(inner: Arc<C>, refresh_interval: Duration) -> Self {
        Self {
            inner,
            last_refresh: RwLock::new(Instant::now()),
            refresh_interval,
            refresh_failures: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Returns the connection, starting a background refresh if it is stale.
    /// Never blocks on the refresh itself.
    pub fn current(&self) -> Arc<C> {
        let elapsed = self
            .last_refresh
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .elapsed();

        if elapsed > self.refresh_interval {
            *self
                .last_refresh
                .write()
                .unwrap_or_else(PoisonError::into_inner) = Instant::now();

            self.spawn_refresh();
        }

        self.inner.clone()
    }

    fn spawn_refresh(&self) {
        let inner = self.inner.clone();
        let failures = self.refresh_failures.clone();
        let refresh = async move {
            match inner.refresh().await {
                Ok(()) => debug!("connection refreshed"),
                Err(err) => {
                    failures.fetch_add(1, Ordering::Relaxed);
                    metrics::counter!("smart_handle_refresh_failures_total").increment(1);
                    warn!("failed to refresh connection: {}", err);
                }
            }
        };

        // Don't panic if we're called from outside a runtime, just skip the refresh
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => drop(runtime.spawn(refresh)),
            Err(_) => warn!("no tokio runtime available, skipping connection refresh"),
        }
    }

    /// Number of background refreshes that failed since construction.
    pub fn refresh_failures(&self) -> u64 {
        self.refresh_failures.load(Ordering::Relaxed)
    }

    pub fn refresh_interval(&self) -> Duration {
        self.refresh_interval
    }

    /// Reconcile `specs` against the underlying store, in order, stopping at
    /// the first failure.
    pub async fn ensure_indexes(&self, specs: &[IndexSpec]) -> Result<(), ReconcileError>
    where
        C: IndexStore,
    {
        indexes::ensure_indexes(&*self.inner, specs).await
    }

    pub async fn close(&self) {
        self.inner.close().await
    }
}
