//! Background outbox delivery.
//!
//! A loop wakes on a fixed tick and on every offline → online edge and
//! spawns a drain. Drains never overlap: a trigger that lands while one is
//! running is dropped, and the next tick picks up whatever is left.

use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use super::connectivity::Connectivity;
use super::outbox::{schedule_retry, Outbox, Retry};
use super::retention::Retention;
use super::session::Session;
use super::InFlight;
use crate::config::SyncSettings;
use crate::core::api::{call_with_timeout, MessageApi, RemoteMessage, SendRequest};
use crate::core::models::{now_millis, DeliveryStatus, Message, MessageKind, OutboxEntry};
use crate::core::store::CacheHandle;

/// Delivery outcomes published to open conversations.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    Delivered(Message),
    Failed(Message),
    Retrying {
        thread_id: String,
        client_id: String,
        attempts: u32,
        next_retry_at: i64,
    },
}

impl SyncEvent {
    pub fn thread_id(&self) -> &str {
        match self {
            SyncEvent::Delivered(m) | SyncEvent::Failed(m) => &m.thread_id,
            SyncEvent::Retrying { thread_id, .. } => thread_id,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub attempted: usize,
    pub delivered: usize,
    pub retrying: usize,
    pub failed: usize,
}

enum Delivery {
    Delivered,
    Retrying,
    Failed,
}

/// Mark a local record confirmed, folding in the server's copy when one came
/// back. The client id is kept so the row keeps its list key.
pub(crate) fn confirm(mut local: Message, remote: Option<&RemoteMessage>) -> Message {
    local.status = DeliveryStatus::Sent;
    if let Some(remote) = remote {
        local.server_id = Some(remote.id.clone());
        local.server_created_at = Some(remote.created_at.timestamp_millis());
        if remote.attachment.is_some() {
            local.attachment = remote.attachment.clone();
        }
        if local.body.is_none() {
            local.body = remote.body.clone();
        }
    }
    local
}

struct Drainer {
    cache: CacheHandle,
    outbox: Outbox,
    api: Arc<dyn MessageApi>,
    session: Arc<Session>,
    connectivity: Connectivity,
    timeout: Duration,
    cancel: CancellationToken,
    draining: AtomicBool,
    events: broadcast::Sender<SyncEvent>,
}

impl Drainer {
    async fn drain_once(&self) -> Option<DrainReport> {
        let Some(_guard) = InFlight::acquire(&self.draining) else {
            log::debug!("Outbox drain already running, skipping trigger");
            return None;
        };

        let mut report = DrainReport::default();
        let ready = match self.outbox.list_ready(now_millis()).await {
            Ok(ready) => ready,
            Err(e) => {
                log::warn!("Failed to read outbox: {}", e);
                return Some(report);
            }
        };

        let total = ready.len();
        for entry in ready {
            if !self.connectivity.is_online() {
                log::info!("Went offline mid-drain, {} entries left", total - report.attempted);
                break;
            }
            report.attempted += 1;
            match self.deliver(entry).await {
                Delivery::Delivered => report.delivered += 1,
                Delivery::Retrying => report.retrying += 1,
                Delivery::Failed => report.failed += 1,
            }
        }

        if report.attempted > 0 {
            log::info!(
                "Outbox drain: {} attempted, {} delivered, {} retrying, {} failed",
                report.attempted,
                report.delivered,
                report.retrying,
                report.failed
            );
        }
        Some(report)
    }

    async fn deliver(&self, entry: OutboxEntry) -> Delivery {
        let request = SendRequest {
            thread_id: entry.thread_id.clone(),
            body: entry.body.clone(),
            client_id: entry.client_id.clone(),
            client_created_at: entry.composed_at,
            kind: MessageKind::Text,
        };
        let result = call_with_timeout(self.timeout, &self.cancel, |token| {
            self.api.send_message(&request, token)
        })
        .await;

        match result {
            Ok(outcome) => {
                let confirmed = confirm(self.local_copy(&entry).await, outcome.message());
                if let Err(e) = self.cache.put_messages(vec![confirmed.clone()]).await {
                    log::warn!("Failed to cache delivered message {}: {}", entry.client_id, e);
                }
                if let Err(e) = self.outbox.remove(&entry.client_id).await {
                    log::warn!("Failed to remove outbox entry {}: {}", entry.client_id, e);
                }
                log::info!(
                    "Delivered {} after {} failed attempts",
                    entry.client_id,
                    entry.attempts
                );
                self.publish(SyncEvent::Delivered(confirmed));
                Delivery::Delivered
            }
            Err(e) if e.is_retryable() => match schedule_retry(entry.attempts, now_millis()) {
                Retry::At {
                    attempts,
                    next_retry_at,
                } => {
                    if let Err(se) = self
                        .outbox
                        .record_attempt_failure(&entry.client_id, attempts, next_retry_at, &e.to_string())
                        .await
                    {
                        log::warn!("Failed to record attempt for {}: {}", entry.client_id, se);
                    }
                    log::debug!(
                        "Send of {} failed (attempt {}), retrying: {}",
                        entry.client_id,
                        attempts,
                        e
                    );
                    self.publish(SyncEvent::Retrying {
                        thread_id: entry.thread_id,
                        client_id: entry.client_id,
                        attempts,
                        next_retry_at,
                    });
                    Delivery::Retrying
                }
                Retry::GiveUp { attempts } => {
                    log::warn!("Giving up on {} after {} attempts: {}", entry.client_id, attempts, e);
                    self.abandon(entry).await
                }
            },
            Err(e) => {
                log::warn!("Send of {} rejected: {}", entry.client_id, e);
                self.abandon(entry).await
            }
        }
    }

    /// Mark the message failed and drop the entry. A failed message is
    /// never retried automatically.
    async fn abandon(&self, entry: OutboxEntry) -> Delivery {
        let mut failed = self.local_copy(&entry).await;
        if failed.status != DeliveryStatus::Sent {
            failed.status = DeliveryStatus::Failed;
            if let Err(e) = self.cache.put_messages(vec![failed.clone()]).await {
                log::warn!("Failed to mark {} failed: {}", entry.client_id, e);
            }
        }
        if let Err(e) = self.outbox.remove(&entry.client_id).await {
            log::warn!("Failed to remove outbox entry {}: {}", entry.client_id, e);
        }
        self.publish(SyncEvent::Failed(failed));
        Delivery::Failed
    }

    /// The cached record for an entry, or one rebuilt from the entry when
    /// the optimistic write never landed.
    async fn local_copy(&self, entry: &OutboxEntry) -> Message {
        match self.cache.get_message(&entry.thread_id, &entry.client_id).await {
            Ok(Some(message)) => return message,
            Ok(None) => log::debug!("No cached record for {}, rebuilding", entry.client_id),
            Err(e) => log::warn!("Failed to read cached record for {}: {}", entry.client_id, e),
        }
        let identity = self.session.identity().await.ok();
        Message {
            server_id: None,
            thread_id: entry.thread_id.clone(),
            tenant_id: identity
                .as_ref()
                .and_then(|i| i.tenant_id.clone())
                .unwrap_or_default(),
            sender_id: identity.map(|i| i.viewer_id).unwrap_or_default(),
            body: Some(entry.body.clone()),
            kind: MessageKind::Text,
            client_id: Some(entry.client_id.clone()),
            client_created_at: entry.composed_at,
            server_created_at: None,
            status: DeliveryStatus::Pending,
            attachment: None,
            superseded_server_ids: Default::default(),
        }
    }

    fn publish(&self, event: SyncEvent) {
        // No subscribers just means nothing is open.
        let _ = self.events.send(event);
    }
}

struct Running {
    stop: CancellationToken,
    task: JoinHandle<()>,
}

/// Owns the outbox drain and its triggers. Each engine has its own.
pub struct SyncLoop {
    drainer: Arc<Drainer>,
    retention: Option<Retention>,
    tick: Duration,
    running: Mutex<Option<Running>>,
}

impl SyncLoop {
    pub fn new(
        cache: CacheHandle,
        api: Arc<dyn MessageApi>,
        session: Arc<Session>,
        connectivity: Connectivity,
        settings: &SyncSettings,
        cancel: CancellationToken,
    ) -> Self {
        let (events, _) = broadcast::channel(64);
        SyncLoop {
            drainer: Arc::new(Drainer {
                outbox: Outbox::new(cache.clone()),
                cache,
                api,
                session,
                connectivity,
                timeout: settings.sync_timeout(),
                cancel,
                draining: AtomicBool::new(false),
                events,
            }),
            retention: None,
            tick: settings.tick_interval(),
            running: Mutex::new(None),
        }
    }

    /// Also run the retention sweep on each tick.
    pub fn with_retention(mut self, retention: Retention) -> Self {
        self.retention = Some(retention);
        self
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.drainer.events.subscribe()
    }

    /// Start the loop. A second call while running does nothing.
    pub fn start(&self) {
        let mut running = self.running.lock().unwrap_or_else(PoisonError::into_inner);
        if running.as_ref().is_some_and(|r| !r.task.is_finished()) {
            return;
        }
        let stop = CancellationToken::new();
        let task = tokio::spawn(run(
            self.drainer.clone(),
            self.retention.clone(),
            self.tick,
            stop.clone(),
        ));
        *running = Some(Running { stop, task });
        log::info!("Sync loop started (tick {:?})", self.tick);
    }

    /// Stop scheduling drains. A drain already running finishes normally.
    pub fn stop(&self) {
        let running = self
            .running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(running) = running {
            running.stop.cancel();
        }
    }

    pub fn is_running(&self) -> bool {
        self.running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|r| !r.task.is_finished())
    }

    pub fn is_draining(&self) -> bool {
        self.drainer.draining.load(std::sync::atomic::Ordering::Acquire)
    }

    /// Kick off a drain in the background.
    pub fn trigger(&self) {
        spawn_drain(&self.drainer);
    }

    /// Drain now. Returns `None` when another drain holds the guard.
    pub async fn drain_once(&self) -> Option<DrainReport> {
        self.drainer.drain_once().await
    }
}

impl Drop for SyncLoop {
    fn drop(&mut self) {
        self.stop();
    }
}

fn spawn_drain(drainer: &Arc<Drainer>) {
    let drainer = drainer.clone();
    tokio::spawn(async move {
        drainer.drain_once().await;
    });
}

async fn run(
    drainer: Arc<Drainer>,
    retention: Option<Retention>,
    tick: Duration,
    stop: CancellationToken,
) {
    let mut ticker = tokio::time::interval(tick);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut online = drainer.connectivity.subscribe();
    online.borrow_and_update();

    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            _ = ticker.tick() => {
                if let Some(retention) = &retention {
                    if let Err(e) = retention.maybe_sweep(now_millis()).await {
                        log::warn!("Retention sweep failed: {}", e);
                    }
                }
            }
            changed = online.changed() => {
                if changed.is_err() {
                    break;
                }
                if !*online.borrow_and_update() {
                    continue;
                }
                log::info!("Back online, draining outbox");
            }
        }
        if drainer.connectivity.is_online() {
            spawn_drain(&drainer);
        }
    }
    log::info!("Sync loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn optimistic() -> Message {
        Message {
            server_id: None,
            thread_id: "t1".into(),
            tenant_id: "team-1".into(),
            sender_id: "host-1".into(),
            body: Some("Hola".into()),
            kind: MessageKind::Text,
            client_id: Some("c1".into()),
            client_created_at: 1_000,
            server_created_at: None,
            status: DeliveryStatus::Pending,
            attachment: None,
            superseded_server_ids: Default::default(),
        }
    }

    #[test]
    fn confirm_keeps_the_list_key() {
        let remote = RemoteMessage {
            id: "srv-9".into(),
            thread_id: "t1".into(),
            sender_id: "host-1".into(),
            body: Some("Hola".into()),
            kind: MessageKind::Text,
            attachment: None,
            created_at: chrono::Utc.timestamp_millis_opt(2_000).unwrap(),
            client_id: None,
        };
        let sent = confirm(optimistic(), Some(&remote));
        assert_eq!(sent.status, DeliveryStatus::Sent);
        assert_eq!(sent.server_id.as_deref(), Some("srv-9"));
        assert_eq!(sent.order_key(), 2_000);
        assert_eq!(sent.list_key(), "c1");
    }

    #[test]
    fn bare_duplicate_ack_still_confirms() {
        let sent = confirm(optimistic(), None);
        assert_eq!(sent.status, DeliveryStatus::Sent);
        assert_eq!(sent.server_id, None);
        assert_eq!(sent.order_key(), 1_000);
    }
}
