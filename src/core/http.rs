//! `MessageApi` over the platform's JSON HTTP API.

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::core::api::{MessageApi, MessagePage, RemoteMessage, SendOutcome, SendRequest};
use crate::core::error::TransportError;
use crate::core::models::{now_millis, Thread};

pub struct HttpMessageApi {
    client: reqwest::Client,
    base: Url,
    token: String,
    page_size: u32,
}

#[derive(Deserialize)]
struct AlreadyExistsBody {
    #[serde(default)]
    already_exists: bool,
    #[serde(default)]
    message: Option<RemoteMessage>,
}

impl HttpMessageApi {
    pub fn new(api_url: &str, token: String, page_size: u32) -> Result<Self, String> {
        let mut base = Url::parse(api_url).map_err(|e| format!("invalid api url: {e}"))?;
        // Url::join drops the last segment unless the path ends in '/'
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        let client = reqwest::Client::builder()
            .user_agent(concat!("turnover-chat/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| format!("http client: {e}"))?;
        Ok(HttpMessageApi {
            client,
            base,
            token,
            page_size,
        })
    }

    fn url(&self, path: &str) -> Result<Url, TransportError> {
        self.base
            .join(path)
            .map_err(|e| TransportError::Decode(format!("bad url {path}: {e}")))
    }

    /// `threads/{thread_id}/messages`, with the id escaped as one segment.
    fn messages_url(&self, thread_id: &str) -> Result<Url, TransportError> {
        let mut url = self.url("threads")?;
        url.path_segments_mut()
            .map_err(|_| TransportError::Decode(format!("api url {} cannot take a path", self.base)))?
            .push(thread_id)
            .push("messages");
        Ok(url)
    }

    async fn execute(
        &self,
        request: reqwest::RequestBuilder,
        cancel: &CancellationToken,
    ) -> Result<reqwest::Response, TransportError> {
        let request = request.bearer_auth(&self.token);
        tokio::select! {
            result = request.send() => result.map_err(map_reqwest_err),
            _ = cancel.cancelled() => Err(TransportError::Cancelled),
        }
    }

    async fn read_json<T: DeserializeOwned>(
        response: reqwest::Response,
        cancel: &CancellationToken,
    ) -> Result<T, TransportError> {
        tokio::select! {
            result = response.json::<T>() => result.map_err(|e| TransportError::Decode(e.to_string())),
            _ = cancel.cancelled() => Err(TransportError::Cancelled),
        }
    }
}

#[async_trait]
impl MessageApi for HttpMessageApi {
    async fn list_threads(&self, cancel: CancellationToken) -> Result<Vec<Thread>, TransportError> {
        let url = self.url("threads")?;
        let response = check_status(self.execute(self.client.get(url), &cancel).await?).await?;
        let raw: Vec<serde_json::Value> = Self::read_json(response, &cancel).await?;
        raw.into_iter().map(thread_from_snapshot).collect()
    }

    async fn fetch_messages(
        &self,
        thread_id: &str,
        cursor: Option<&str>,
        cancel: CancellationToken,
    ) -> Result<MessagePage, TransportError> {
        let mut url = self.messages_url(thread_id)?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("limit", &self.page_size.to_string());
            if let Some(cursor) = cursor {
                query.append_pair("cursor", cursor);
            }
        }
        let response = check_status(self.execute(self.client.get(url), &cancel).await?).await?;
        Self::read_json(response, &cancel).await
    }

    async fn send_message(
        &self,
        request: &SendRequest,
        cancel: CancellationToken,
    ) -> Result<SendOutcome, TransportError> {
        let url = self.messages_url(&request.thread_id)?;
        let response = self
            .execute(self.client.post(url).json(request), &cancel)
            .await?;

        match response.status() {
            StatusCode::CONFLICT => {
                // Body is optional on a conflict; a missing copy is still an ack.
                let body: Option<AlreadyExistsBody> = Self::read_json(response, &cancel).await.ok();
                Ok(SendOutcome::AlreadyExists(body.and_then(|b| b.message)))
            }
            StatusCode::CREATED => Ok(SendOutcome::Created(Self::read_json(response, &cancel).await?)),
            status if status.is_success() => {
                let value: serde_json::Value = Self::read_json(response, &cancel).await?;
                let dup: AlreadyExistsBody = serde_json::from_value(value.clone())
                    .map_err(|e| TransportError::Decode(e.to_string()))?;
                if dup.already_exists {
                    Ok(SendOutcome::AlreadyExists(dup.message))
                } else {
                    let created: RemoteMessage = serde_json::from_value(value)
                        .map_err(|e| TransportError::Decode(e.to_string()))?;
                    Ok(SendOutcome::Created(created))
                }
            }
            status => {
                let message = response.text().await.unwrap_or_default();
                Err(classify_status(status.as_u16(), message))
            }
        }
    }
}

/// Map a non-success response onto the closed error kinds.
async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, TransportError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let message = response.text().await.unwrap_or_default();
    Err(classify_status(status.as_u16(), message))
}

fn classify_status(status: u16, message: String) -> TransportError {
    match status {
        408 | 425 | 429 => TransportError::Server { status, message },
        400..=499 => TransportError::Rejected { status, message },
        _ => TransportError::Server { status, message },
    }
}

fn map_reqwest_err(e: reqwest::Error) -> TransportError {
    if e.is_decode() {
        TransportError::Decode(e.to_string())
    } else {
        TransportError::Network(e.to_string())
    }
}

/// Lift the fields the sync engine cares about out of a thread payload and
/// keep the rest as an opaque snapshot.
fn thread_from_snapshot(snapshot: serde_json::Value) -> Result<Thread, TransportError> {
    let text = |key: &str| snapshot.get(key).and_then(|v| v.as_str()).map(str::to_string);
    let millis = |key: &str| {
        snapshot
            .get(key)
            .and_then(|v| v.as_str())
            .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
            .map(|t| t.timestamp_millis())
    };

    let id = text("id").ok_or_else(|| TransportError::Decode("thread without id".into()))?;
    let tenant_id =
        text("tenant_id").ok_or_else(|| TransportError::Decode(format!("thread {id} without tenant")))?;

    Ok(Thread {
        property_id: text("property_id"),
        status: text("status").unwrap_or_else(|| "open".into()),
        last_message_at: millis("last_message_at"),
        updated_at: now_millis(),
        id,
        tenant_id,
        snapshot,
    })
}
