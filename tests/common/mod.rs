#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::TimeZone;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use turnover_chat::app::{Identity, IdentitySource, StaticIdentity};
use turnover_chat::config::SyncSettings;
use turnover_chat::core::api::{MessageApi, MessagePage, RemoteMessage, SendOutcome, SendRequest};
use turnover_chat::core::error::TransportError;
use turnover_chat::core::models::{MessageKind, Thread};
use turnover_chat::core::store::CacheHandle;
use turnover_chat::ChatEngine;

pub const VIEWER: &str = "host-1";
pub const TENANT: &str = "team-1";

/// How the fake answers one send call.
#[derive(Debug, Clone)]
pub enum Reply {
    Accept,
    Fail(TransportError),
    /// Never answers; only the caller's deadline ends the call.
    Hang,
}

#[derive(Default)]
struct FakeState {
    sends: Vec<SendRequest>,
    script: VecDeque<Reply>,
    /// Messages the server has accepted, by client id.
    stored: HashMap<String, RemoteMessage>,
    pages: HashMap<(String, Option<String>), MessagePage>,
    fetches: Vec<(String, Option<String>)>,
    threads: Vec<Thread>,
    next_id: u32,
}

/// Scripted in-memory stand-in for the remote API. Sends accept by default
/// and dedupe on client id the way the real server does.
#[derive(Default)]
pub struct FakeApi {
    state: Mutex<FakeState>,
    gate: Mutex<Option<Arc<Notify>>>,
}

impl FakeApi {
    pub fn new() -> Arc<Self> {
        Arc::new(FakeApi::default())
    }

    /// Queue replies for the next send calls, in order.
    pub fn script(&self, replies: impl IntoIterator<Item = Reply>) {
        self.state.lock().unwrap().script.extend(replies);
    }

    /// Hold every send until the returned handle is notified.
    pub fn hold_sends(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.gate.lock().unwrap() = Some(gate.clone());
        gate
    }

    pub fn sends(&self) -> Vec<SendRequest> {
        self.state.lock().unwrap().sends.clone()
    }

    pub fn fetches(&self) -> Vec<(String, Option<String>)> {
        self.state.lock().unwrap().fetches.clone()
    }

    /// Pretend the server already stored this client id.
    pub fn preload(&self, request: &SendRequest) -> RemoteMessage {
        let mut state = self.state.lock().unwrap();
        store(&mut state, request)
    }

    pub fn set_page(&self, thread_id: &str, cursor: Option<&str>, page: MessagePage) {
        self.state
            .lock()
            .unwrap()
            .pages
            .insert((thread_id.to_string(), cursor.map(str::to_string)), page);
    }

    pub fn set_threads(&self, threads: Vec<Thread>) {
        self.state.lock().unwrap().threads = threads;
    }
}

fn store(state: &mut FakeState, request: &SendRequest) -> RemoteMessage {
    state.next_id += 1;
    let remote = RemoteMessage {
        id: format!("srv-{}", state.next_id),
        thread_id: request.thread_id.clone(),
        sender_id: VIEWER.into(),
        body: Some(request.body.clone()),
        kind: MessageKind::Text,
        attachment: None,
        created_at: chrono::Utc::now(),
        client_id: Some(request.client_id.clone()),
    };
    state.stored.insert(request.client_id.clone(), remote.clone());
    remote
}

#[async_trait]
impl MessageApi for FakeApi {
    async fn list_threads(&self, _cancel: CancellationToken) -> Result<Vec<Thread>, TransportError> {
        Ok(self.state.lock().unwrap().threads.clone())
    }

    async fn fetch_messages(
        &self,
        thread_id: &str,
        cursor: Option<&str>,
        _cancel: CancellationToken,
    ) -> Result<MessagePage, TransportError> {
        let key = (thread_id.to_string(), cursor.map(str::to_string));
        let mut state = self.state.lock().unwrap();
        state.fetches.push(key.clone());
        Ok(state.pages.get(&key).cloned().unwrap_or_default())
    }

    async fn send_message(
        &self,
        request: &SendRequest,
        cancel: CancellationToken,
    ) -> Result<SendOutcome, TransportError> {
        let reply = {
            let mut state = self.state.lock().unwrap();
            state.sends.push(request.clone());
            state.script.pop_front().unwrap_or(Reply::Accept)
        };

        let gate = self.gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            tokio::select! {
                _ = gate.notified() => {}
                _ = cancel.cancelled() => return Err(TransportError::Cancelled),
            }
        }

        match reply {
            Reply::Accept => {
                let mut state = self.state.lock().unwrap();
                if let Some(existing) = state.stored.get(&request.client_id) {
                    return Ok(SendOutcome::AlreadyExists(Some(existing.clone())));
                }
                Ok(SendOutcome::Created(store(&mut state, request)))
            }
            Reply::Fail(e) => Err(e),
            Reply::Hang => {
                cancel.cancelled().await;
                Err(TransportError::Cancelled)
            }
        }
    }
}

pub fn unavailable() -> Reply {
    Reply::Fail(TransportError::Server {
        status: 503,
        message: "unavailable".into(),
    })
}

pub fn rejected() -> Reply {
    Reply::Fail(TransportError::Rejected {
        status: 422,
        message: "thread closed".into(),
    })
}

/// Short timings so loop-driven tests finish quickly.
pub fn fast_settings() -> SyncSettings {
    SyncSettings {
        tick_interval_ms: 50,
        sync_timeout_ms: 500,
        send_timeout_ms: 500,
        ..SyncSettings::default()
    }
}

/// Settings with a tick far enough out that only explicit triggers drain.
pub fn manual_settings() -> SyncSettings {
    SyncSettings {
        tick_interval_ms: 3_600_000,
        ..fast_settings()
    }
}

pub fn identity(viewer: &str, tenant: Option<&str>) -> Arc<dyn IdentitySource> {
    Arc::new(StaticIdentity(Identity {
        viewer_id: viewer.into(),
        tenant_id: tenant.map(str::to_string),
    }))
}

pub async fn engine(
    cache: &CacheHandle,
    api: &Arc<FakeApi>,
    settings: SyncSettings,
    online: bool,
) -> ChatEngine {
    let engine = ChatEngine::new(
        Some(cache.clone()),
        api.clone(),
        identity(VIEWER, Some(TENANT)),
        settings,
        online,
    );
    engine.start_session().await.unwrap();
    engine
}

pub fn remote(id: &str, thread_id: &str, body: &str, at_ms: i64, client_id: Option<&str>) -> RemoteMessage {
    RemoteMessage {
        id: id.into(),
        thread_id: thread_id.into(),
        sender_id: "cleaner-7".into(),
        body: Some(body.into()),
        kind: MessageKind::Text,
        attachment: None,
        created_at: chrono::Utc.timestamp_millis_opt(at_ms).unwrap(),
        client_id: client_id.map(str::to_string),
    }
}

pub fn thread(id: &str, tenant: &str) -> Thread {
    Thread {
        id: id.into(),
        tenant_id: tenant.into(),
        property_id: Some("prop-1".into()),
        status: "open".into(),
        last_message_at: None,
        updated_at: 0,
        snapshot: serde_json::json!({ "id": id, "tenant_id": tenant }),
    }
}

/// Poll `check` until it holds or two seconds pass.
pub async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..200 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}
