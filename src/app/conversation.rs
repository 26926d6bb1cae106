use std::collections::HashSet;
use std::sync::atomic::AtomicBool;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::watch;

use super::sync::SyncEvent;
use super::Shared;
use crate::core::api::{call_with_timeout, MessagePage};
use crate::core::error::TransportError;
use crate::core::merge::merge;
use crate::core::models::{DeliveryStatus, Message};
use crate::core::store::PageCursor;

#[derive(Default)]
struct ViewState {
    messages: Vec<Message>,
    /// Cursor for the next older server page.
    cursor: Option<String>,
    has_more: bool,
    fetched: bool,
}

/// The live, ordered message list of one open thread.
///
/// Every change goes through [`merge`] under a synchronous lock, so
/// concurrent writers (push refresh, paging, sends, the sync loop) can land
/// in any order and converge on the same list.
pub struct Conversation {
    pub(crate) thread_id: String,
    pub(crate) shared: Shared,
    state: Mutex<ViewState>,
    pub(crate) sending: AtomicBool,
    live: watch::Sender<Vec<Message>>,
}

impl Conversation {
    pub(crate) fn new(thread_id: String, shared: Shared) -> Self {
        let (live, _) = watch::channel(Vec::new());
        Conversation {
            thread_id,
            shared,
            state: Mutex::new(ViewState {
                has_more: true,
                ..Default::default()
            }),
            sending: AtomicBool::new(false),
            live,
        }
    }

    pub fn thread_id(&self) -> &str {
        &self.thread_id
    }

    /// Snapshot of the current list, oldest first.
    pub fn messages(&self) -> Vec<Message> {
        self.lock().messages.clone()
    }

    /// Receives the full list after every change.
    pub fn subscribe(&self) -> watch::Receiver<Vec<Message>> {
        self.live.subscribe()
    }

    pub fn has_more(&self) -> bool {
        self.lock().has_more
    }

    pub fn is_sending(&self) -> bool {
        self.sending.load(std::sync::atomic::Ordering::Acquire)
    }

    fn lock(&self) -> MutexGuard<'_, ViewState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Merge records into the list and publish the result.
    pub(crate) fn apply(&self, incoming: &[Message]) -> Vec<Message> {
        let merged = {
            let mut state = self.lock();
            state.messages = merge(&state.messages, incoming);
            state.messages.clone()
        };
        self.live.send_replace(merged.clone());
        merged
    }

    /// Overwrite the status of one record, bypassing the merge order. Only
    /// used to drop an in-memory `Sending` back to `Pending`.
    pub(crate) fn downgrade_sending(&self, client_id: &str) {
        let snapshot = {
            let mut state = self.lock();
            let Some(message) = state
                .messages
                .iter_mut()
                .find(|m| m.client_id.as_deref() == Some(client_id))
            else {
                return;
            };
            if message.status != DeliveryStatus::Sending {
                return;
            }
            message.status = DeliveryStatus::Pending;
            state.messages.clone()
        };
        self.live.send_replace(snapshot);
    }

    pub(crate) fn find(&self, list_key: &str) -> Option<Message> {
        self.lock()
            .messages
            .iter()
            .find(|m| m.list_key() == list_key)
            .cloned()
    }

    pub(crate) fn apply_sync_event(&self, event: &SyncEvent) {
        match event {
            SyncEvent::Delivered(message) | SyncEvent::Failed(message) => {
                self.apply(std::slice::from_ref(message));
            }
            SyncEvent::Retrying { client_id, .. } => self.downgrade_sending(client_id),
        }
    }

    /// Fill the list from the local cache. Returns the number of records read.
    pub async fn load_cached(&self) -> usize {
        let Some(cache) = &self.shared.cache else {
            return 0;
        };
        match cache
            .load_messages(&self.thread_id, self.shared.settings.page_size, None)
            .await
        {
            Ok(messages) => {
                let count = messages.len();
                self.apply(&messages);
                count
            }
            Err(e) => {
                log::warn!("Failed to load cached messages for {}: {}", self.thread_id, e);
                0
            }
        }
    }

    /// Fetch the newest server page and merge it in. The first successful
    /// fetch also seeds the cursor for older pages.
    pub async fn refresh(&self) -> Result<usize, TransportError> {
        let page = self.fetch(None).await?;
        let first = {
            let mut state = self.lock();
            let first = !state.fetched;
            if first {
                state.fetched = true;
                state.cursor = page.next_cursor.clone();
                state.has_more = page.has_more;
            }
            first
        };
        if first {
            log::debug!("First page of {} fetched, has_more={}", self.thread_id, page.has_more);
        }
        Ok(self.absorb(page).await)
    }

    /// Extend the list backwards by one page. Online this pages the server;
    /// offline (or when the server fails) it reads older records from the
    /// cache. Returns the number of records added.
    pub async fn load_older(&self) -> Result<usize, TransportError> {
        if !self.shared.connectivity.is_online() {
            return Ok(self.load_older_cached().await);
        }

        let (fetched, cursor, has_more) = {
            let state = self.lock();
            (state.fetched, state.cursor.clone(), state.has_more)
        };
        if !fetched {
            return self.refresh().await;
        }
        let Some(cursor) = cursor.filter(|_| has_more) else {
            return Ok(self.load_older_cached().await);
        };

        match self.fetch(Some(&cursor)).await {
            Ok(page) => {
                {
                    let mut state = self.lock();
                    // A concurrent page may have moved the cursor already.
                    if state.cursor.as_deref() == Some(cursor.as_str()) {
                        state.cursor = page.next_cursor.clone();
                        state.has_more = page.has_more;
                    }
                }
                Ok(self.absorb(page).await)
            }
            Err(e) if e.is_retryable() => {
                log::warn!("Failed to page {}: {}, falling back to cache", self.thread_id, e);
                Ok(self.load_older_cached().await)
            }
            Err(e) => Err(e),
        }
    }

    async fn load_older_cached(&self) -> usize {
        let Some(cache) = &self.shared.cache else {
            return 0;
        };
        let (oldest, before_len) = {
            let state = self.lock();
            let oldest = state.messages.iter().map(PageCursor::of).min();
            (oldest, state.messages.len())
        };
        match cache
            .load_messages(&self.thread_id, self.shared.settings.page_size, oldest)
            .await
        {
            Ok(older) => {
                let after = self.apply(&older).len();
                after.saturating_sub(before_len)
            }
            Err(e) => {
                log::warn!("Failed to load older cached messages for {}: {}", self.thread_id, e);
                0
            }
        }
    }

    async fn fetch(&self, cursor: Option<&str>) -> Result<MessagePage, TransportError> {
        let api = &self.shared.api;
        let thread_id = self.thread_id.as_str();
        call_with_timeout(self.shared.settings.sync_timeout(), &self.shared.cancel, |token| {
            api.fetch_messages(thread_id, cursor, token)
        })
        .await
    }

    /// Merge a server page into the list and write the merged records back.
    async fn absorb(&self, page: MessagePage) -> usize {
        let tenant = match self.shared.session.identity().await {
            Ok(identity) => identity.tenant_id.unwrap_or_default(),
            Err(e) => {
                log::warn!("No identity while caching {}: {}", self.thread_id, e);
                String::new()
            }
        };
        let incoming: Vec<Message> = page
            .messages
            .into_iter()
            .map(|m| m.into_message(&tenant))
            .collect();
        let count = incoming.len();
        let merged = self.apply(&incoming);

        if let Some(cache) = &self.shared.cache {
            let touched = touched_by(&merged, &incoming);
            if let Err(e) = cache.put_messages(touched).await {
                log::warn!("Failed to cache messages for {}: {}", self.thread_id, e);
            }
        }
        count
    }
}

/// The merged records that absorbed any of `incoming`.
fn touched_by(merged: &[Message], incoming: &[Message]) -> Vec<Message> {
    let server_ids: HashSet<&str> = incoming.iter().filter_map(|m| m.server_id.as_deref()).collect();
    let client_ids: HashSet<&str> = incoming.iter().filter_map(|m| m.client_id.as_deref()).collect();
    merged
        .iter()
        .filter(|m| {
            m.server_id.as_deref().is_some_and(|id| server_ids.contains(id))
                || m.client_id.as_deref().is_some_and(|id| client_ids.contains(id))
                || m.superseded_server_ids.iter().any(|id| server_ids.contains(id.as_str()))
        })
        .cloned()
        .collect()
}
