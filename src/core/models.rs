use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

/// A conversation as cached from the thread list.
///
/// `snapshot` is the full server payload; the sync engine never looks inside
/// it beyond the handful of fields lifted out here.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Thread {
    pub id: String,
    pub tenant_id: String,
    pub property_id: Option<String>,
    pub status: String,
    pub last_message_at: Option<i64>,
    pub updated_at: i64,
    pub snapshot: serde_json::Value,
}

/// A thread row as it sits in the cache, with its partition provenance.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedThread {
    pub thread: Thread,
    /// Viewer the record was cached for. `None` on rows written before
    /// viewer stamping existed.
    pub viewer_id: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Text,
    Image,
    System,
}

impl MessageKind {
    pub fn as_str(self) -> &'static str {
        match self {
            MessageKind::Text => "text",
            MessageKind::Image => "image",
            MessageKind::System => "system",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "image" => MessageKind::Image,
            "system" => MessageKind::System,
            _ => MessageKind::Text,
        }
    }
}

/// Delivery state of a message.
///
/// Ordered by how far along delivery is: a `Sent` record always wins a
/// merge, and `Failed` outranks the in-flight states.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    Pending,
    Sending,
    Failed,
    Sent,
}

impl DeliveryStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            DeliveryStatus::Pending => "pending",
            DeliveryStatus::Sending => "sending",
            DeliveryStatus::Failed => "failed",
            DeliveryStatus::Sent => "sent",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(DeliveryStatus::Pending),
            "sending" => Some(DeliveryStatus::Sending),
            "failed" => Some(DeliveryStatus::Failed),
            "sent" => Some(DeliveryStatus::Sent),
            _ => None,
        }
    }
}

/// One chat message, confirmed by the server or still local-only.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Message {
    pub server_id: Option<String>,
    pub thread_id: String,
    pub tenant_id: String,
    pub sender_id: String,
    pub body: Option<String>,
    pub kind: MessageKind,
    /// Idempotency token minted when the message was composed.
    pub client_id: Option<String>,
    /// Unix milliseconds, client clock.
    pub client_created_at: i64,
    /// Unix milliseconds, server clock. `None` until confirmed.
    pub server_created_at: Option<i64>,
    pub status: DeliveryStatus,
    pub attachment: Option<String>,
    /// Server ids this message was confirmed under before a later
    /// confirmation replaced them. Only merge reads these; never cached.
    #[serde(skip)]
    pub superseded_server_ids: BTreeSet<String>,
}

impl Message {
    /// Storage primary key: the server id once known, otherwise
    /// `thread_id:client_id`.
    pub fn local_key(&self) -> String {
        match (&self.server_id, &self.client_id) {
            (Some(id), _) => id.clone(),
            (None, Some(cid)) => format!("{}:{}", self.thread_id, cid),
            (None, None) => format!("{}:", self.thread_id),
        }
    }

    /// Rendering key. Prefers the client id so an optimistic row keeps the
    /// same key after the server confirms it.
    pub fn list_key(&self) -> &str {
        self.client_id
            .as_deref()
            .or(self.server_id.as_deref())
            .unwrap_or_default()
    }

    /// The one ordering key: server time when confirmed, client time before.
    pub fn order_key(&self) -> i64 {
        self.server_created_at.unwrap_or(self.client_created_at)
    }

    pub fn shows_spinner(&self) -> bool {
        matches!(
            self.status,
            DeliveryStatus::Pending | DeliveryStatus::Sending
        )
    }

    pub fn shows_error(&self) -> bool {
        self.status == DeliveryStatus::Failed
    }
}

/// A queued delivery intent for a message that has not reached `Sent`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OutboxEntry {
    pub client_id: String,
    pub thread_id: String,
    pub body: String,
    pub composed_at: i64,
    pub attempts: u32,
    pub next_retry_at: i64,
    pub last_error: Option<String>,
}

/// Current wall clock in unix milliseconds.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
