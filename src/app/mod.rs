//! Sync engine orchestration: sessions, open conversations, the send
//! pipeline and the background outbox loop.

mod compose;
pub mod connectivity;
mod conversation;
pub mod outbox;
pub mod retention;
pub mod session;
pub mod sync;
pub mod watch;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub use compose::SendReport;
pub use connectivity::Connectivity;
pub use conversation::Conversation;
pub use outbox::Outbox;
pub use retention::Retention;
pub use session::{Identity, IdentitySource, Session, SessionStart, StaticIdentity};
pub use sync::{DrainReport, SyncEvent, SyncLoop};
pub use watch::PushEvent;

use crate::config::SyncSettings;
use crate::core::api::{call_with_timeout, MessageApi};
use crate::core::error::TransportError;
use crate::core::models::{now_millis, Thread};
use crate::core::store::CacheHandle;

/// Holds a boolean flag raised until dropped, so an early return or a
/// panic can't leave it stuck.
pub(crate) struct InFlight<'a> {
    flag: &'a AtomicBool,
}

impl<'a> InFlight<'a> {
    /// Raise the flag, or `None` if it is already up.
    pub(crate) fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| InFlight { flag })
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

/// What every conversation of one engine shares.
#[derive(Clone)]
pub(crate) struct Shared {
    pub(crate) cache: Option<CacheHandle>,
    pub(crate) outbox: Option<Outbox>,
    pub(crate) api: Arc<dyn MessageApi>,
    pub(crate) session: Arc<Session>,
    pub(crate) connectivity: Connectivity,
    pub(crate) settings: SyncSettings,
    pub(crate) cancel: CancellationToken,
}

type OpenConversations = Arc<Mutex<HashMap<String, Weak<Conversation>>>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// One signed-in chat session over a local cache and a remote API.
///
/// Without a cache (`None`) everything still works in memory; nothing
/// survives a restart and offline sends are not retried.
pub struct ChatEngine {
    shared: Shared,
    sync: Option<SyncLoop>,
    retention: Option<Retention>,
    conversations: OpenConversations,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl ChatEngine {
    pub fn new(
        cache: Option<CacheHandle>,
        api: Arc<dyn MessageApi>,
        identity: Arc<dyn IdentitySource>,
        settings: SyncSettings,
        online: bool,
    ) -> Self {
        let session = Arc::new(Session::new(identity));
        let connectivity = Connectivity::new(online);
        let cancel = CancellationToken::new();

        let retention = cache.as_ref().map(|c| Retention::new(c.clone(), &settings));
        let sync = cache.as_ref().map(|c| {
            let sync = SyncLoop::new(
                c.clone(),
                api.clone(),
                session.clone(),
                connectivity.clone(),
                &settings,
                cancel.clone(),
            );
            match &retention {
                Some(r) => sync.with_retention(r.clone()),
                None => sync,
            }
        });

        ChatEngine {
            shared: Shared {
                outbox: cache.as_ref().map(|c| Outbox::new(c.clone())),
                cache,
                api,
                session,
                connectivity,
                settings,
                cancel,
            },
            sync,
            retention,
            conversations: Arc::new(Mutex::new(HashMap::new())),
            dispatcher: Mutex::new(None),
        }
    }

    /// Resolve the viewer, enforce the cache partition, sweep old messages
    /// and start routing delivery events to open conversations.
    ///
    /// Background delivery is started separately with [`Self::start_sync`].
    pub async fn start_session(&self) -> Result<SessionStart, String> {
        let identity = self.shared.session.identity().await?;

        let mut replaced_viewer = None;
        if let Some(cache) = &self.shared.cache {
            match session::guard_partition(cache, &identity.viewer_id).await {
                Ok(previous) => replaced_viewer = previous,
                Err(e) => log::warn!("Partition check failed: {}", e),
            }
        }
        if let Some(retention) = &self.retention {
            if let Err(e) = retention.maybe_sweep(now_millis()).await {
                log::warn!("Retention sweep failed: {}", e);
            }
        }

        self.start_dispatcher();
        Ok(SessionStart {
            identity,
            replaced_viewer,
        })
    }

    pub fn start_sync(&self) {
        if let Some(sync) = &self.sync {
            sync.start();
        }
    }

    /// Stop scheduling drains. One already on the wire finishes normally.
    pub fn stop_sync(&self) {
        if let Some(sync) = &self.sync {
            sync.stop();
        }
    }

    pub fn connectivity(&self) -> &Connectivity {
        &self.shared.connectivity
    }

    pub fn set_online(&self, online: bool) {
        self.shared.connectivity.set_online(online);
    }

    pub fn session(&self) -> &Session {
        &self.shared.session
    }

    pub fn sync_loop(&self) -> Option<&SyncLoop> {
        self.sync.as_ref()
    }

    /// Cached threads visible to the current viewer.
    pub async fn cached_threads(&self) -> Vec<Thread> {
        let Some(cache) = &self.shared.cache else {
            return Vec::new();
        };
        let identity = match self.shared.session.identity().await {
            Ok(identity) => identity,
            Err(e) => {
                log::warn!("No session, not showing cached threads: {}", e);
                return Vec::new();
            }
        };
        match cache.load_threads().await {
            Ok(rows) => session::visible_threads(rows, &identity),
            Err(e) => {
                log::warn!("Failed to load cached threads: {}", e);
                Vec::new()
            }
        }
    }

    /// Fetch the thread list and cache it for the current viewer.
    pub async fn refresh_threads(&self) -> Result<Vec<Thread>, TransportError> {
        let api = &self.shared.api;
        let threads = call_with_timeout(self.shared.settings.sync_timeout(), &self.shared.cancel, |token| {
            api.list_threads(token)
        })
        .await?;

        if let Some(cache) = &self.shared.cache {
            match self.shared.session.identity().await {
                Ok(identity) => {
                    if let Err(e) = cache
                        .save_threads(Some(identity.viewer_id), threads.clone())
                        .await
                    {
                        log::warn!("Failed to cache threads: {}", e);
                    }
                }
                Err(e) => log::warn!("No session, threads not cached: {}", e),
            }
        }
        log::info!("{} threads", threads.len());
        Ok(threads)
    }

    /// Open a thread: cached history first, then the newest server page when
    /// online. Opening an already-open thread returns the same conversation.
    pub async fn open_conversation(&self, thread_id: &str) -> Arc<Conversation> {
        if let Some(existing) = self.conversation(thread_id) {
            return existing;
        }
        let conversation = Arc::new(Conversation::new(thread_id.to_string(), self.shared.clone()));
        {
            let mut open = lock(&self.conversations);
            open.retain(|_, weak| weak.strong_count() > 0);
            open.insert(thread_id.to_string(), Arc::downgrade(&conversation));
        }

        conversation.load_cached().await;
        if self.shared.connectivity.is_online() {
            if let Err(e) = conversation.refresh().await {
                log::warn!("Failed to fetch {}: {}", thread_id, e);
            }
        }
        conversation
    }

    /// An open conversation, if something still holds it.
    pub fn conversation(&self, thread_id: &str) -> Option<Arc<Conversation>> {
        lock(&self.conversations)
            .get(thread_id)
            .and_then(Weak::upgrade)
    }

    /// A server push: refresh the thread if it is open.
    pub async fn handle_push(&self, event: &PushEvent) {
        let Some(conversation) = self.conversation(&event.thread_id) else {
            log::debug!("Push for {} ignored, thread not open", event.thread_id);
            return;
        };
        if let Err(e) = conversation.refresh().await {
            log::warn!("Push refresh of {} failed: {}", event.thread_id, e);
        }
    }

    /// Run one outbox drain right away.
    pub async fn sync_now(&self) -> Option<DrainReport> {
        match &self.sync {
            Some(sync) => sync.drain_once().await,
            None => None,
        }
    }

    /// Stop background work and cancel anything still on the wire.
    pub fn shutdown(&self) {
        self.stop_sync();
        if let Some(task) = lock(&self.dispatcher).take() {
            task.abort();
        }
        self.shared.cancel.cancel();
    }

    fn start_dispatcher(&self) {
        let Some(sync) = &self.sync else {
            return;
        };
        let mut slot = lock(&self.dispatcher);
        if slot.is_some() {
            return;
        }
        let mut events = sync.subscribe();
        let conversations = self.conversations.clone();
        *slot = Some(tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => {
                        let target = lock(&conversations)
                            .get(event.thread_id())
                            .and_then(Weak::upgrade);
                        if let Some(conversation) = target {
                            conversation.apply_sync_event(&event);
                        }
                    }
                    Err(RecvError::Lagged(n)) => {
                        log::warn!("Missed {} sync events, reloading open threads", n);
                        let open: Vec<Arc<Conversation>> = lock(&conversations)
                            .values()
                            .filter_map(Weak::upgrade)
                            .collect();
                        for conversation in open {
                            conversation.load_cached().await;
                        }
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        }));
    }
}

impl Drop for ChatEngine {
    fn drop(&mut self) {
        if let Some(task) = lock(&self.dispatcher).take() {
            task.abort();
        }
    }
}
