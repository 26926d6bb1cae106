use std::sync::Arc;

use tokio::sync::Mutex;

use crate::config::SyncSettings;
use crate::core::error::StoreError;
use crate::core::store::CacheHandle;

/// Meta key holding the unix-millis time of the last completed sweep.
pub const META_LAST_SWEEP: &str = "last_retention_sweep";

/// Periodic purge of old delivered messages.
#[derive(Clone)]
pub struct Retention {
    cache: CacheHandle,
    window_ms: i64,
    interval_ms: i64,
    last_sweep: Arc<Mutex<Option<i64>>>,
}

impl Retention {
    pub fn new(cache: CacheHandle, settings: &SyncSettings) -> Self {
        Retention {
            cache,
            window_ms: settings.retention_window_ms(),
            interval_ms: i64::try_from(settings.sweep_interval_ms).unwrap_or(i64::MAX),
            last_sweep: Arc::new(Mutex::new(None)),
        }
    }

    /// Sweep if the last one is older than the sweep interval. Returns the
    /// number of purged messages, or `None` when no sweep was due.
    ///
    /// Only `sent` messages are purged; anything still undelivered stays
    /// until the outbox resolves it.
    pub async fn maybe_sweep(&self, now: i64) -> Result<Option<usize>, StoreError> {
        // Held for the whole sweep so concurrent callers see the new stamp.
        let mut last = self.last_sweep.lock().await;
        if last.is_none() {
            *last = self
                .cache
                .get_meta(META_LAST_SWEEP)
                .await?
                .and_then(|v| v.parse::<i64>().ok());
        }
        if let Some(at) = *last {
            if now - at < self.interval_ms {
                return Ok(None);
            }
        }

        let purged = self.cache.purge_sent_before(now - self.window_ms).await?;
        self.cache.set_meta(META_LAST_SWEEP, now.to_string()).await?;
        *last = Some(now);
        log::info!("Retention sweep purged {} messages", purged);
        Ok(Some(purged))
    }
}
