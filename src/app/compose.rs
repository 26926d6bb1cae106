//! Send pipeline: compose, show optimistically, persist, attempt once.

use super::conversation::Conversation;
use super::sync::confirm;
use super::InFlight;
use crate::core::api::{call_with_timeout, SendRequest};
use crate::core::error::{SendError, TransportError};
use crate::core::models::{now_millis, DeliveryStatus, Message, MessageKind};

/// How a send ended from the caller's point of view.
#[derive(Debug, Clone, PartialEq)]
pub enum SendReport {
    /// The server confirmed the message.
    Delivered(Message),
    /// Offline, or the attempt failed in a way worth retrying. The sync loop
    /// owns delivery from here.
    Queued(Message),
    /// The server refused the message for good.
    Rejected { message: Message, error: TransportError },
}

impl SendReport {
    pub fn message(&self) -> &Message {
        match self {
            SendReport::Delivered(m) | SendReport::Queued(m) => m,
            SendReport::Rejected { message, .. } => message,
        }
    }
}

impl Conversation {
    /// Send a text message to this thread.
    ///
    /// The message shows up in the list before anything touches storage or
    /// the network. It is written to the cache and the outbox before the
    /// first attempt, so nothing is lost if the attempt never returns.
    pub async fn send(&self, body: &str) -> Result<SendReport, SendError> {
        let body = body.trim();
        if body.is_empty() {
            return Err(SendError::EmptyBody);
        }
        let Some(_in_flight) = InFlight::acquire(&self.sending) else {
            return Err(SendError::AlreadySending);
        };

        let identity = self
            .shared
            .session
            .identity()
            .await
            .map_err(SendError::SessionNotReady)?;
        let tenant_id = identity
            .tenant_id
            .ok_or_else(|| SendError::SessionNotReady("no tenant for this viewer".into()))?;

        let online = self.shared.connectivity.is_online();
        let client_id = uuid::Uuid::new_v4().to_string();
        let composed_at = now_millis();
        let optimistic = Message {
            server_id: None,
            thread_id: self.thread_id.clone(),
            tenant_id,
            sender_id: identity.viewer_id,
            body: Some(body.to_string()),
            kind: MessageKind::Text,
            client_id: Some(client_id.clone()),
            client_created_at: composed_at,
            server_created_at: None,
            status: if online {
                DeliveryStatus::Sending
            } else {
                DeliveryStatus::Pending
            },
            attachment: None,
            superseded_server_ids: Default::default(),
        };
        self.apply(std::slice::from_ref(&optimistic));

        // The cache records "not delivered yet"; `Sending` only lives in the
        // view while this call is on the wire.
        if let Some(cache) = &self.shared.cache {
            let stored = Message {
                status: DeliveryStatus::Pending,
                ..optimistic.clone()
            };
            if let Err(e) = cache.put_messages(vec![stored]).await {
                log::warn!("Failed to cache outgoing message {}: {}", client_id, e);
            }
        }
        if let Some(outbox) = &self.shared.outbox {
            if let Err(e) = outbox
                .enqueue(&self.thread_id, body, &client_id, composed_at, now_millis())
                .await
            {
                log::warn!("Failed to queue outgoing message {}: {}", client_id, e);
            }
        }

        if !online {
            log::info!("Offline, queued {} for later delivery", client_id);
            return Ok(SendReport::Queued(self.current(optimistic)));
        }

        let request = SendRequest {
            thread_id: self.thread_id.clone(),
            body: body.to_string(),
            client_id: client_id.clone(),
            client_created_at: composed_at,
            kind: MessageKind::Text,
        };
        let api = &self.shared.api;
        let result = call_with_timeout(self.shared.settings.send_timeout(), &self.shared.cancel, |token| {
            api.send_message(&request, token)
        })
        .await;

        match result {
            Ok(outcome) => {
                let sent = confirm(optimistic, outcome.message());
                self.apply(std::slice::from_ref(&sent));
                if let Some(cache) = &self.shared.cache {
                    if let Err(e) = cache.put_messages(vec![sent.clone()]).await {
                        log::warn!("Failed to cache sent message {}: {}", client_id, e);
                    }
                }
                if let Some(outbox) = &self.shared.outbox {
                    if let Err(e) = outbox.remove(&client_id).await {
                        log::warn!("Failed to remove outbox entry {}: {}", client_id, e);
                    }
                }
                log::info!("Sent {}", client_id);
                Ok(SendReport::Delivered(self.current(sent)))
            }
            Err(e) if e.is_retryable() => {
                // The outbox entry stays as it is; the sync loop retries it.
                log::info!("Send of {} failed, left for retry: {}", client_id, e);
                self.downgrade_sending(&client_id);
                let pending = Message {
                    status: DeliveryStatus::Pending,
                    ..optimistic
                };
                Ok(SendReport::Queued(self.current(pending)))
            }
            Err(e) => {
                log::warn!("Send of {} rejected: {}", client_id, e);
                let failed = Message {
                    status: DeliveryStatus::Failed,
                    ..optimistic
                };
                self.apply(std::slice::from_ref(&failed));
                if let Some(cache) = &self.shared.cache {
                    if let Err(se) = cache.put_messages(vec![failed.clone()]).await {
                        log::warn!("Failed to mark {} failed: {}", client_id, se);
                    }
                }
                if let Some(outbox) = &self.shared.outbox {
                    if let Err(se) = outbox.remove(&client_id).await {
                        log::warn!("Failed to remove outbox entry {}: {}", client_id, se);
                    }
                }
                Ok(SendReport::Rejected {
                    message: self.current(failed),
                    error: e,
                })
            }
        }
    }

    /// The list's copy of a record, which may have moved on since `fallback`
    /// was built (e.g. the sync loop confirmed it first).
    fn current(&self, fallback: Message) -> Message {
        self.find(fallback.list_key()).unwrap_or(fallback)
    }
}
