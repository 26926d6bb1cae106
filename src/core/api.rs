use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::core::error::TransportError;
use crate::core::models::{DeliveryStatus, Message, MessageKind, Thread};

/// A message as the remote API returns it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RemoteMessage {
    pub id: String,
    pub thread_id: String,
    pub sender_id: String,
    pub body: Option<String>,
    #[serde(rename = "type", default = "default_kind")]
    pub kind: MessageKind,
    #[serde(default)]
    pub attachment: Option<String>,
    pub created_at: DateTime<Utc>,
    /// Echo of the idempotency token, when the server keeps it.
    #[serde(default)]
    pub client_id: Option<String>,
}

fn default_kind() -> MessageKind {
    MessageKind::Text
}

impl RemoteMessage {
    /// Lift into the local model. Anything the server returns is confirmed.
    pub fn into_message(self, tenant_id: &str) -> Message {
        let at = self.created_at.timestamp_millis();
        Message {
            server_id: Some(self.id),
            thread_id: self.thread_id,
            tenant_id: tenant_id.to_string(),
            sender_id: self.sender_id,
            body: self.body,
            kind: self.kind,
            client_id: self.client_id,
            client_created_at: at,
            server_created_at: Some(at),
            status: DeliveryStatus::Sent,
            attachment: self.attachment,
            superseded_server_ids: Default::default(),
        }
    }
}

/// One page of thread history, newest page first.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MessagePage {
    pub messages: Vec<RemoteMessage>,
    #[serde(default)]
    pub next_cursor: Option<String>,
    #[serde(default)]
    pub has_more: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SendRequest {
    pub thread_id: String,
    pub body: String,
    pub client_id: String,
    /// Unix milliseconds.
    pub client_created_at: i64,
    #[serde(rename = "type")]
    pub kind: MessageKind,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SendOutcome {
    Created(RemoteMessage),
    /// The server had already accepted this `client_id`. The stored copy is
    /// returned when the server includes it.
    AlreadyExists(Option<RemoteMessage>),
}

impl SendOutcome {
    pub fn message(&self) -> Option<&RemoteMessage> {
        match self {
            SendOutcome::Created(m) => Some(m),
            SendOutcome::AlreadyExists(m) => m.as_ref(),
        }
    }
}

/// The remote message service.
///
/// Implementations should stop work and return
/// [`TransportError::Cancelled`] once `cancel` fires.
#[async_trait]
pub trait MessageApi: Send + Sync {
    async fn list_threads(&self, cancel: CancellationToken) -> Result<Vec<Thread>, TransportError>;

    async fn fetch_messages(
        &self,
        thread_id: &str,
        cursor: Option<&str>,
        cancel: CancellationToken,
    ) -> Result<MessagePage, TransportError>;

    async fn send_message(
        &self,
        request: &SendRequest,
        cancel: CancellationToken,
    ) -> Result<SendOutcome, TransportError>;
}

/// Run one network call under a deadline.
///
/// The call gets a child of `parent`; when the deadline passes the child is
/// cancelled and the attempt reports [`TransportError::Timeout`].
pub async fn call_with_timeout<T, F, Fut>(
    timeout: Duration,
    parent: &CancellationToken,
    call: F,
) -> Result<T, TransportError>
where
    F: FnOnce(CancellationToken) -> Fut,
    Fut: Future<Output = Result<T, TransportError>>,
{
    let token = parent.child_token();
    let fut = call(token.clone());
    tokio::select! {
        result = fut => result,
        _ = tokio::time::sleep(timeout) => {
            token.cancel();
            Err(TransportError::Timeout(timeout))
        }
        _ = parent.cancelled() => Err(TransportError::Cancelled),
    }
}
