use futures::{Stream, StreamExt};

use super::ChatEngine;

/// "Something changed in this thread." Carries no payload; the receiver
/// refetches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushEvent {
    pub thread_id: String,
}

/// Feed a push stream into the engine until the stream ends.
pub async fn run_push_listener<S>(engine: &ChatEngine, events: S)
where
    S: Stream<Item = PushEvent>,
{
    let mut events = std::pin::pin!(events);
    while let Some(event) = events.next().await {
        log::debug!("Push for thread {}", event.thread_id);
        engine.handle_push(&event).await;
    }
    log::info!("Push stream ended");
}
