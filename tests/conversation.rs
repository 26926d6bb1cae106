mod common;

use common::*;
use turnover_chat::app::watch::run_push_listener;
use turnover_chat::app::PushEvent;
use turnover_chat::core::api::MessagePage;
use turnover_chat::core::models::DeliveryStatus;
use turnover_chat::core::store::CacheHandle;
use turnover_chat::ChatEngine;

fn page(messages: Vec<turnover_chat::core::api::RemoteMessage>, next: Option<&str>) -> MessagePage {
    MessagePage {
        has_more: next.is_some(),
        next_cursor: next.map(str::to_string),
        messages,
    }
}

#[tokio::test]
async fn opening_shows_cache_then_server_page() {
    let cache = CacheHandle::open_in_memory().unwrap();
    let api = FakeApi::new();
    api.set_page(
        "t1",
        None,
        page(
            vec![
                remote("s2", "t1", "On my way", 2_000, None),
                remote("s3", "t1", "Arrived", 3_000, None),
            ],
            Some("older-1"),
        ),
    );

    // Seed the cache with what an earlier session saw.
    let seed = remote("s1", "t1", "Hi!", 1_000, None).into_message(TENANT);
    cache.put_messages(vec![seed]).await.unwrap();

    let engine = engine(&cache, &api, manual_settings(), true).await;
    let conversation = engine.open_conversation("t1").await;

    let bodies: Vec<String> = conversation
        .messages()
        .into_iter()
        .filter_map(|m| m.body)
        .collect();
    assert_eq!(bodies, vec!["Hi!", "On my way", "Arrived"]);
    assert!(conversation.has_more());
    assert_eq!(cache.message_count("t1").await.unwrap(), 3);

    // Same thread, same conversation.
    let again = engine.open_conversation("t1").await;
    assert!(std::sync::Arc::ptr_eq(&conversation, &again));
}

#[tokio::test]
async fn load_older_follows_the_cursor_online() {
    let cache = CacheHandle::open_in_memory().unwrap();
    let api = FakeApi::new();
    api.set_page("t1", None, page(vec![remote("s3", "t1", "newest", 3_000, None)], Some("c1")));
    api.set_page("t1", Some("c1"), page(vec![remote("s2", "t1", "middle", 2_000, None)], Some("c2")));
    api.set_page("t1", Some("c2"), page(vec![remote("s1", "t1", "oldest", 1_000, None)], None));

    let engine = engine(&cache, &api, manual_settings(), true).await;
    let conversation = engine.open_conversation("t1").await;

    assert_eq!(conversation.load_older().await.unwrap(), 1);
    assert_eq!(conversation.load_older().await.unwrap(), 1);
    assert!(!conversation.has_more());

    let bodies: Vec<String> = conversation.messages().into_iter().filter_map(|m| m.body).collect();
    assert_eq!(bodies, vec!["oldest", "middle", "newest"]);
    let cursors: Vec<Option<String>> = api.fetches().into_iter().map(|(_, c)| c).collect();
    assert_eq!(cursors, vec![None, Some("c1".into()), Some("c2".into())]);
}

#[tokio::test]
async fn load_older_offline_reads_the_cache() {
    let cache = CacheHandle::open_in_memory().unwrap();
    let mut settings = manual_settings();
    settings.page_size = 2;

    let history: Vec<_> = (1..=5)
        .map(|i| remote(&format!("s{i}"), "t1", &format!("m{i}"), i * 1_000, None).into_message(TENANT))
        .collect();
    cache.put_messages(history).await.unwrap();

    let api = FakeApi::new();
    let engine = engine(&cache, &api, settings, false).await;
    let conversation = engine.open_conversation("t1").await;

    let bodies = |c: &turnover_chat::Conversation| -> Vec<String> {
        c.messages().into_iter().filter_map(|m| m.body).collect()
    };
    assert_eq!(bodies(&conversation), vec!["m4", "m5"]);

    assert_eq!(conversation.load_older().await.unwrap(), 2);
    assert_eq!(bodies(&conversation), vec!["m2", "m3", "m4", "m5"]);
    assert_eq!(conversation.load_older().await.unwrap(), 1);
    assert_eq!(conversation.load_older().await.unwrap(), 0);
    assert!(api.fetches().is_empty());
}

#[tokio::test]
async fn load_older_offline_keeps_messages_sharing_a_timestamp() {
    let cache = CacheHandle::open_in_memory().unwrap();
    let mut settings = manual_settings();
    settings.page_size = 2;

    cache
        .put_messages(vec![
            remote("s-a", "t1", "first", 1_000, None).into_message(TENANT),
            remote("s-b", "t1", "second", 1_000, None).into_message(TENANT),
            remote("s-c", "t1", "third", 1_010, None).into_message(TENANT),
        ])
        .await
        .unwrap();

    let api = FakeApi::new();
    let engine = engine(&cache, &api, settings, false).await;
    let conversation = engine.open_conversation("t1").await;
    assert_eq!(conversation.messages().len(), 2);

    assert_eq!(conversation.load_older().await.unwrap(), 1);
    assert_eq!(conversation.load_older().await.unwrap(), 0);
    let mut bodies: Vec<String> = conversation
        .messages()
        .into_iter()
        .filter_map(|m| m.body)
        .collect();
    bodies.sort();
    assert_eq!(bodies, vec!["first", "second", "third"]);
}

#[tokio::test]
async fn fetched_messages_are_cached_under_the_viewer_tenant() {
    let cache = CacheHandle::open_in_memory().unwrap();
    let api = FakeApi::new();
    api.set_page("t1", None, page(vec![remote("s1", "t1", "Hi!", 1_000, None)], None));

    // No session start: the identity is first needed while caching the page.
    let engine = ChatEngine::new(
        Some(cache.clone()),
        api.clone(),
        identity(VIEWER, Some(TENANT)),
        manual_settings(),
        true,
    );
    let conversation = engine.open_conversation("t1").await;
    assert_eq!(conversation.messages()[0].tenant_id, TENANT);

    let cached = cache.load_messages("t1", 10, None).await.unwrap();
    assert_eq!(cached.len(), 1);
    assert_eq!(cached[0].tenant_id, TENANT);
}

#[tokio::test]
async fn push_stream_refreshes_open_threads() {
    let cache = CacheHandle::open_in_memory().unwrap();
    let api = FakeApi::new();
    let engine = engine(&cache, &api, manual_settings(), true).await;
    let conversation = engine.open_conversation("t1").await;
    let mut live = conversation.subscribe();
    assert!(conversation.messages().is_empty());

    api.set_page("t1", None, page(vec![remote("s9", "t1", "New photo", 9_000, None)], None));
    let pushes = futures::stream::iter(vec![
        PushEvent { thread_id: "t1".into() },
        PushEvent { thread_id: "not-open".into() },
    ]);
    run_push_listener(&engine, pushes).await;

    live.changed().await.unwrap();
    let list = live.borrow_and_update().clone();
    assert_eq!(list.len(), 1);
    assert_eq!(list[0].status, DeliveryStatus::Sent);
    assert_eq!(list[0].body.as_deref(), Some("New photo"));
    // One fetch on open, one for the push; none for the unopened thread.
    assert_eq!(api.fetches().len(), 2);
}
