use rand::Rng;

use crate::core::error::StoreError;
use crate::core::models::OutboxEntry;
use crate::core::store::CacheHandle;

/// Failed attempts after which an entry is abandoned.
pub const MAX_ATTEMPTS: u32 = 8;
/// Entries handed to one drain.
pub const READY_BATCH: u32 = 10;

const BACKOFF_BASE_MS: i64 = 2_000;
const BACKOFF_CAP_MS: i64 = 60_000;
const BACKOFF_JITTER_MS: i64 = 500;

/// Delay before the next attempt, given how many attempts had failed before
/// this one. `jitter_ms` is added on top of the capped exponential part.
pub fn backoff_delay_ms(prior_attempts: u32, jitter_ms: i64) -> i64 {
    let exp = BACKOFF_BASE_MS
        .checked_shl(prior_attempts.min(16))
        .unwrap_or(BACKOFF_CAP_MS);
    exp.min(BACKOFF_CAP_MS) + jitter_ms
}

/// What to do with an entry after a retryable failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Retry {
    At { attempts: u32, next_retry_at: i64 },
    GiveUp { attempts: u32 },
}

/// Bookkeeping for one more failed attempt on an entry that had failed
/// `prior_attempts` times.
pub fn schedule_retry(prior_attempts: u32, now: i64) -> Retry {
    let attempts = prior_attempts + 1;
    if attempts >= MAX_ATTEMPTS {
        return Retry::GiveUp { attempts };
    }
    let jitter = rand::thread_rng().gen_range(0..BACKOFF_JITTER_MS);
    Retry::At {
        attempts,
        next_retry_at: now + backoff_delay_ms(prior_attempts, jitter),
    }
}

/// Persistent queue of delivery intents, keyed by client id.
#[derive(Clone)]
pub struct Outbox {
    cache: CacheHandle,
}

impl Outbox {
    pub fn new(cache: CacheHandle) -> Self {
        Outbox { cache }
    }

    /// Queue a message for delivery. Enqueueing a client id twice keeps the
    /// first entry; returns whether a new entry was written.
    pub async fn enqueue(
        &self,
        thread_id: &str,
        body: &str,
        client_id: &str,
        composed_at: i64,
        now: i64,
    ) -> Result<bool, StoreError> {
        let entry = OutboxEntry {
            client_id: client_id.to_string(),
            thread_id: thread_id.to_string(),
            body: body.to_string(),
            composed_at,
            attempts: 0,
            next_retry_at: now,
            last_error: None,
        };
        let inserted = self.cache.insert_outbox(entry).await?;
        if !inserted {
            log::debug!("Outbox already holds {client_id}");
        }
        Ok(inserted)
    }

    /// Entries due at `now`, oldest composition first, at most one batch.
    pub async fn list_ready(&self, now: i64) -> Result<Vec<OutboxEntry>, StoreError> {
        self.cache.list_outbox_ready(now, READY_BATCH).await
    }

    pub async fn get(&self, client_id: &str) -> Result<Option<OutboxEntry>, StoreError> {
        self.cache.get_outbox(client_id).await
    }

    pub async fn record_attempt_failure(
        &self,
        client_id: &str,
        attempts: u32,
        next_retry_at: i64,
        error: &str,
    ) -> Result<bool, StoreError> {
        self.cache
            .record_outbox_failure(client_id, attempts, next_retry_at, error.to_string())
            .await
    }

    pub async fn remove(&self, client_id: &str) -> Result<bool, StoreError> {
        self.cache.remove_outbox(client_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_then_caps() {
        assert_eq!(backoff_delay_ms(0, 0), 2_000);
        assert_eq!(backoff_delay_ms(1, 0), 4_000);
        assert_eq!(backoff_delay_ms(4, 0), 32_000);
        assert_eq!(backoff_delay_ms(5, 0), 60_000);
        assert_eq!(backoff_delay_ms(40, 499), 60_499);
    }

    #[test]
    fn eighth_failure_gives_up() {
        for prior in 0..MAX_ATTEMPTS - 1 {
            match schedule_retry(prior, 1_000) {
                Retry::At { attempts, next_retry_at } => {
                    assert_eq!(attempts, prior + 1);
                    let delay = next_retry_at - 1_000;
                    let base = backoff_delay_ms(prior, 0);
                    assert!(delay >= base && delay < base + BACKOFF_JITTER_MS);
                }
                other => panic!("gave up early: {other:?}"),
            }
        }
        assert_eq!(
            schedule_retry(MAX_ATTEMPTS - 1, 1_000),
            Retry::GiveUp { attempts: MAX_ATTEMPTS }
        );
    }

    #[tokio::test]
    async fn enqueue_is_idempotent_and_ready_immediately() {
        let outbox = Outbox::new(CacheHandle::open_in_memory().unwrap());
        assert!(outbox.enqueue("t1", "hello", "c1", 100, 100).await.unwrap());
        assert!(!outbox.enqueue("t1", "changed", "c1", 200, 200).await.unwrap());

        let ready = outbox.list_ready(100).await.unwrap();
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].body, "hello");
        assert_eq!(ready[0].attempts, 0);
    }

    #[tokio::test]
    async fn ready_batch_is_capped() {
        let outbox = Outbox::new(CacheHandle::open_in_memory().unwrap());
        for i in 0..15 {
            outbox
                .enqueue("t1", "hi", &format!("c{i:02}"), i, 0)
                .await
                .unwrap();
        }
        let ready = outbox.list_ready(0).await.unwrap();
        assert_eq!(ready.len(), READY_BATCH as usize);
        assert_eq!(ready[0].client_id, "c00");
    }

    #[tokio::test]
    async fn failure_defers_the_entry() {
        let outbox = Outbox::new(CacheHandle::open_in_memory().unwrap());
        outbox.enqueue("t1", "hi", "c1", 0, 0).await.unwrap();
        assert!(outbox.record_attempt_failure("c1", 1, 5_000, "timeout").await.unwrap());

        assert!(outbox.list_ready(4_999).await.unwrap().is_empty());
        let entry = outbox.get("c1").await.unwrap().unwrap();
        assert_eq!(entry.attempts, 1);
        assert_eq!(entry.last_error.as_deref(), Some("timeout"));

        assert!(outbox.remove("c1").await.unwrap());
        assert!(!outbox.remove("c1").await.unwrap());
    }
}
