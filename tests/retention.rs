mod common;

use common::*;
use turnover_chat::app::retention::META_LAST_SWEEP;
use turnover_chat::core::models::{now_millis, DeliveryStatus, Message, MessageKind};
use turnover_chat::core::store::CacheHandle;

const DAY: i64 = 86_400_000;

fn message(client_id: &str, at: i64, status: DeliveryStatus) -> Message {
    let sent = status == DeliveryStatus::Sent;
    Message {
        server_id: sent.then(|| format!("srv-{client_id}")),
        thread_id: "t1".into(),
        tenant_id: TENANT.into(),
        sender_id: VIEWER.into(),
        body: Some(format!("body {client_id}")),
        kind: MessageKind::Text,
        client_id: Some(client_id.into()),
        client_created_at: at,
        server_created_at: sent.then_some(at),
        status,
        attachment: None,
        superseded_server_ids: Default::default(),
    }
}

#[tokio::test]
async fn session_start_purges_only_old_sent_messages() {
    let cache = CacheHandle::open_in_memory().unwrap();
    let now = now_millis();
    cache
        .put_messages(vec![
            message("old-sent", now - 30 * DAY, DeliveryStatus::Sent),
            message("old-pending", now - 30 * DAY, DeliveryStatus::Pending),
            message("old-failed", now - 30 * DAY, DeliveryStatus::Failed),
            message("fresh-sent", now - DAY, DeliveryStatus::Sent),
        ])
        .await
        .unwrap();
    cache
        .insert_outbox(turnover_chat::core::models::OutboxEntry {
            client_id: "old-pending".into(),
            thread_id: "t1".into(),
            body: "body old-pending".into(),
            composed_at: now - 30 * DAY,
            attempts: 3,
            next_retry_at: now + DAY,
            last_error: None,
        })
        .await
        .unwrap();

    let api = FakeApi::new();
    let _engine = engine(&cache, &api, manual_settings(), false).await;

    assert!(cache.get_message("t1", "old-sent").await.unwrap().is_none());
    assert!(cache.get_message("t1", "old-pending").await.unwrap().is_some());
    assert!(cache.get_message("t1", "old-failed").await.unwrap().is_some());
    assert!(cache.get_message("t1", "fresh-sent").await.unwrap().is_some());
    assert!(cache.get_outbox("old-pending").await.unwrap().is_some());

    let stamp: i64 = cache
        .get_meta(META_LAST_SWEEP)
        .await
        .unwrap()
        .unwrap()
        .parse()
        .unwrap();
    assert!(stamp >= now);
}

#[tokio::test]
async fn recent_sweep_is_not_repeated() {
    let cache = CacheHandle::open_in_memory().unwrap();
    let now = now_millis();
    cache
        .set_meta(META_LAST_SWEEP, (now - DAY / 2).to_string())
        .await
        .unwrap();
    cache
        .put_messages(vec![message("old-sent", now - 30 * DAY, DeliveryStatus::Sent)])
        .await
        .unwrap();

    let api = FakeApi::new();
    let _engine = engine(&cache, &api, manual_settings(), false).await;

    assert!(cache.get_message("t1", "old-sent").await.unwrap().is_some());
}
