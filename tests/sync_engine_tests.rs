//! Integration tests for the read side of the engine: bulk load, change-feed
//! ingestion, the pending buffer, hydration backfill, the cache store, and
//! conversation switching.

mod support;

use serde_json::json;

use sprig::backend::BackendError;
use sprig::ingest::{ATTACHMENTS_TABLE, MESSAGES_TABLE, REACTIONS_TABLE, THREADS_TABLE};
use sprig::model::{AttachmentId, ConversationId, MessageId, ThreadId, UserId};
use sprig::{SessionEvent, SyncError};

use support::*;

fn c1() -> ConversationId {
    ConversationId::from("c1")
}

fn seed_c1(h: &Harness) {
    let mut rows = h.backend.rows();
    rows.messages.push(message_row("m1", "c1", "bob", "text", 10));
    rows.messages.push(message_row("m2", "c1", "carol", "image", 20));
    rows.threads.push(thread_row("t1", "c1", 5));
    rows.attachments.push(attachment_row("a1", "m2", "c1"));
    rows.attachments.push(attachment_row("a2", "m2", "c1"));
    rows.reactions.push(reaction_row("m1", "carol", "🌱", 11));
    rows.profiles.push(profile_row("bob", "Bob"));
    rows.profiles.push(profile_row("carol", "Carol"));
}

// ---------------------------------------------------------------------------
// Bulk load
// ---------------------------------------------------------------------------

#[tokio::test]
async fn open_conversation_loads_rows_profiles_and_batch_signs() {
    let h = Harness::new();
    seed_c1(&h);
    let mut events = h.session.subscribe_events();

    let count = h.session.open_conversation(c1()).await.unwrap();
    assert_eq!(count, 2);

    let view = h.session.view().await.unwrap();
    assert_eq!(view.conversation_id, c1());
    assert_eq!(view.messages.len(), 2);
    assert_eq!(view.threads.len(), 1);

    let m1 = view.message(&MessageId::from("m1")).unwrap();
    assert_eq!(
        m1.sender.as_ref().and_then(|p| p.display_name.as_deref()),
        Some("Bob")
    );
    assert_eq!(m1.reactions.len(), 1);

    let m2 = view.message(&MessageId::from("m2")).unwrap();
    assert_eq!(m2.attachments.len(), 2);
    assert!(m2.attachments.iter().all(|a| a.signed_url.is_some()));
    assert_eq!(h.storage.log().batch_signs, 1);
    assert_eq!(h.storage.log().single_signs, 0);
    assert_eq!(h.session.pending_hydrations(), 0);

    let mut loaded = false;
    while let Ok(event) = events.try_recv() {
        if let SessionEvent::Loaded { message_count, .. } = event {
            assert_eq!(message_count, 2);
            loaded = true;
        }
    }
    assert!(loaded, "expected a Loaded event");
}

#[tokio::test]
async fn failed_bulk_load_surfaces_user_message() {
    let h = Harness::new();
    seed_c1(&h);
    h.backend.fail("fetch_threads");
    let mut events = h.session.subscribe_events();

    let err = h.session.open_conversation(c1()).await.unwrap_err();
    assert!(matches!(err, SyncError::Backend(BackendError::Network(_))));

    let view = h.session.view().await.unwrap();
    assert!(view.messages.is_empty());
    assert_eq!(
        view.last_error.as_deref(),
        Some("Couldn't reach the server. Check your connection and try again.")
    );
    let mut saw_error = false;
    while let Ok(event) = events.try_recv() {
        saw_error |= matches!(event, SessionEvent::Error { .. });
    }
    assert!(saw_error);

    // Manual retry recovers.
    h.backend.recover("fetch_threads");
    assert_eq!(h.session.reload().await.unwrap(), 2);
}

#[tokio::test]
async fn malformed_rows_are_skipped_not_fatal() {
    let h = Harness::new();
    seed_c1(&h);
    h.backend
        .rows()
        .messages
        .push(json!({"id": "broken", "conversation_id": "c1"}));
    assert_eq!(h.session.open_conversation(c1()).await.unwrap(), 2);
}

// ---------------------------------------------------------------------------
// Change feed
// ---------------------------------------------------------------------------

#[tokio::test]
async fn duplicate_message_event_is_idempotent() {
    let h = Harness::new();
    h.session.open_conversation(c1()).await.unwrap();

    let row = message_row("m9", "c1", "bob", "text", 50);
    h.feed.push("c1", insert(MESSAGES_TABLE, row.clone())).await;
    settle().await;
    let once = h.session.snapshot().await.unwrap();

    h.feed.push("c1", insert(MESSAGES_TABLE, row)).await;
    settle().await;
    let twice = h.session.snapshot().await.unwrap();

    assert_eq!(once, twice);
    assert_eq!(twice.messages().len(), 1);
}

#[tokio::test]
async fn feed_messages_are_ordered_by_creation_time() {
    let h = Harness::new();
    h.session.open_conversation(c1()).await.unwrap();

    h.feed.push("c1", insert(MESSAGES_TABLE, message_row("late", "c1", "bob", "text", 30))).await;
    h.feed.push("c1", insert(MESSAGES_TABLE, message_row("b", "c1", "bob", "text", 10))).await;
    h.feed.push("c1", insert(MESSAGES_TABLE, message_row("a", "c1", "bob", "text", 10))).await;
    h.feed.push("c1", insert(MESSAGES_TABLE, message_row("other", "c2", "bob", "text", 1))).await;
    settle().await;

    let view = h.session.view().await.unwrap();
    let ids: Vec<&str> = view.messages.iter().map(|m| m.message.id.as_str()).collect();
    assert_eq!(ids, vec!["a", "b", "late"]);
}

#[tokio::test]
async fn attachment_before_or_after_message_converges() {
    let first = Harness::new();
    first.session.open_conversation(c1()).await.unwrap();
    first
        .feed
        .push("c1", insert(MESSAGES_TABLE, message_row("m1", "c1", "bob", "image", 10)))
        .await;
    first
        .feed
        .push("c1", insert(ATTACHMENTS_TABLE, attachment_row("a1", "m1", "c1")))
        .await;
    settle().await;

    let second = Harness::new();
    second.session.open_conversation(c1()).await.unwrap();
    second
        .feed
        .push("c1", insert(ATTACHMENTS_TABLE, attachment_row("a1", "m1", "c1")))
        .await;
    settle().await;
    assert_eq!(second.session.view().await.unwrap().pending_events, 1);
    second
        .feed
        .push("c1", insert(MESSAGES_TABLE, message_row("m1", "c1", "bob", "image", 10)))
        .await;
    settle().await;

    let a = first.session.view().await.unwrap();
    let b = second.session.view().await.unwrap();
    assert_eq!(a, b);
    let m1 = b.message(&MessageId::from("m1")).unwrap();
    assert_eq!(m1.attachments.len(), 1);
    assert!(m1.attachments[0].signed_url.is_some());
    assert_eq!(b.pending_events, 0);
}

#[tokio::test]
async fn reaction_rows_stay_unique() {
    let h = Harness::new();
    h.session.open_conversation(c1()).await.unwrap();
    h.feed
        .push("c1", insert(MESSAGES_TABLE, message_row("m1", "c1", "bob", "text", 10)))
        .await;

    let row = reaction_row("m1", "carol", "🌻", 12);
    let key = json!({"message_id": "m1", "user_id": "carol", "emoji": "🌻"});
    h.feed.push("c1", insert(REACTIONS_TABLE, row.clone())).await;
    h.feed.push("c1", insert(REACTIONS_TABLE, row.clone())).await;
    settle().await;
    let count = |view: &sprig::ChatView| {
        view.message(&MessageId::from("m1"))
            .map(|m| m.reactions.iter().map(|r| r.count).sum::<usize>())
            .unwrap_or(0)
    };
    assert_eq!(count(&h.session.view().await.unwrap()), 1);

    h.feed.push("c1", delete(REACTIONS_TABLE, key.clone())).await;
    settle().await;
    assert_eq!(count(&h.session.view().await.unwrap()), 0);

    h.feed.push("c1", insert(REACTIONS_TABLE, row)).await;
    settle().await;
    assert_eq!(count(&h.session.view().await.unwrap()), 1);
}

#[tokio::test]
async fn message_delete_cascades_to_children_and_reply_target() {
    let h = Harness::new();
    seed_c1(&h);
    h.session.open_conversation(c1()).await.unwrap();
    h.session
        .set_replying_to(Some(MessageId::from("m2")))
        .await
        .unwrap();

    let mut soft_deleted = message_row("m2", "c1", "carol", "image", 20);
    soft_deleted["deleted_at"] = json!(99);
    h.feed
        .push(
            "c1",
            sprig::ingest::RawChange {
                table: MESSAGES_TABLE.to_string(),
                kind: sprig::ingest::ChangeKind::Update,
                record: soft_deleted,
                old_record: json!({"id": "m2"}),
            },
        )
        .await;
    h.feed
        .push("c1", delete(MESSAGES_TABLE, json!({"id": "m1"})))
        .await;
    settle().await;

    let snap = h.session.snapshot().await.unwrap();
    assert!(snap.messages().is_empty());
    assert!(snap.attachments_for(&MessageId::from("m2")).is_empty());
    assert!(snap.reactions_for(&MessageId::from("m1")).is_empty());
    assert_eq!(snap.replying_to(), None);
    assert_eq!(h.session.signed_url(&AttachmentId::from("a1")).await, None);
}

#[tokio::test]
async fn archived_thread_drops_focus_but_keeps_messages() {
    let h = Harness::new();
    seed_c1(&h);
    let mut threaded = message_row("tm", "c1", "bob", "text", 30);
    threaded["thread_id"] = json!("t1");
    h.backend.rows().messages.push(threaded);
    h.session.open_conversation(c1()).await.unwrap();
    h.session
        .open_thread(Some(ThreadId::from("t1")))
        .await
        .unwrap();
    assert_eq!(h.session.view().await.unwrap().messages.len(), 1);

    let mut archived = thread_row("t1", "c1", 5);
    archived["archived_at"] = json!(100);
    h.feed.push("c1", insert(THREADS_TABLE, archived)).await;
    settle().await;

    let view = h.session.view().await.unwrap();
    assert_eq!(view.active_thread, None);
    assert!(view.threads.is_empty());
    let snap = h.session.snapshot().await.unwrap();
    assert!(snap.has_message(&MessageId::from("tm")));
}

#[tokio::test]
async fn pending_buffer_clears_past_ceiling() {
    let h = Harness::new();
    h.session.open_conversation(c1()).await.unwrap();

    for i in 0..200 {
        let row = attachment_row(&format!("a{i}"), &format!("ghost{i}"), "c1");
        h.feed.push("c1", insert(ATTACHMENTS_TABLE, row)).await;
    }
    settle().await;
    assert_eq!(h.session.view().await.unwrap().pending_events, 200);

    h.feed
        .push("c1", insert(ATTACHMENTS_TABLE, attachment_row("a200", "ghost200", "c1")))
        .await;
    settle().await;
    assert_eq!(h.session.view().await.unwrap().pending_events, 0);
}

#[tokio::test]
async fn orphan_delete_removes_buffered_child() {
    let h = Harness::new();
    h.session.open_conversation(c1()).await.unwrap();
    h.feed
        .push("c1", insert(ATTACHMENTS_TABLE, attachment_row("a1", "m1", "c1")))
        .await;
    h.feed
        .push("c1", delete(ATTACHMENTS_TABLE, json!({"id": "a1"})))
        .await;
    h.feed
        .push("c1", insert(MESSAGES_TABLE, message_row("m1", "c1", "bob", "text", 10)))
        .await;
    settle().await;

    let view = h.session.view().await.unwrap();
    assert!(view.message(&MessageId::from("m1")).unwrap().attachments.is_empty());
}

// ---------------------------------------------------------------------------
// Hydration
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn bare_media_message_is_hydrated_after_quiet_period() {
    let h = Harness::new();
    h.session.open_conversation(c1()).await.unwrap();
    // The attachment exists server-side but its feed event never arrives.
    h.backend
        .rows()
        .attachments
        .push(attachment_row("a1", "m1", "c1"));
    h.backend.rows().profiles.push(profile_row("bob", "Bob"));

    let row = message_row("m1", "c1", "bob", "image", 10);
    h.feed.push("c1", insert(MESSAGES_TABLE, row.clone())).await;
    h.feed.push("c1", insert(MESSAGES_TABLE, row)).await;
    settle().await;
    assert!(h.session.is_hydration_scheduled(&MessageId::from("m1")));
    assert_eq!(h.session.pending_hydrations(), 1);

    let fetches = h.backend.calls("fetch_attachments");
    advance(400).await;
    assert_eq!(h.backend.calls("fetch_attachments"), fetches);

    advance(300).await;
    assert_eq!(h.backend.calls("fetch_attachments"), fetches + 1);
    assert_eq!(h.session.pending_hydrations(), 0);

    let view = h.session.view().await.unwrap();
    let m1 = view.message(&MessageId::from("m1")).unwrap();
    assert_eq!(m1.attachments.len(), 1);
    assert!(m1.attachments[0].signed_url.is_some());
}

#[tokio::test(start_paused = true)]
async fn hydration_skips_messages_that_got_their_attachment() {
    let h = Harness::new();
    h.session.open_conversation(c1()).await.unwrap();
    h.feed
        .push("c1", insert(MESSAGES_TABLE, message_row("m1", "c1", "bob", "image", 10)))
        .await;
    h.feed
        .push("c1", insert(ATTACHMENTS_TABLE, attachment_row("a1", "m1", "c1")))
        .await;
    let fetches = h.backend.calls("fetch_attachments");
    advance(700).await;
    assert_eq!(h.backend.calls("fetch_attachments"), fetches);
}

#[tokio::test(start_paused = true)]
async fn switching_conversations_cancels_hydration() {
    let h = Harness::new();
    h.session.open_conversation(c1()).await.unwrap();
    h.feed
        .push("c1", insert(MESSAGES_TABLE, message_row("m1", "c1", "bob", "image", 10)))
        .await;
    settle().await;
    assert_eq!(h.session.pending_hydrations(), 1);

    h.session
        .open_conversation(ConversationId::from("c2"))
        .await
        .unwrap();
    assert_eq!(h.session.pending_hydrations(), 0);
    let fetches = h.backend.calls("fetch_attachments");
    advance(1_000).await;
    assert_eq!(h.backend.calls("fetch_attachments"), fetches);
}

// ---------------------------------------------------------------------------
// Conversation switching
// ---------------------------------------------------------------------------

#[tokio::test]
async fn late_results_from_previous_conversation_are_discarded() {
    let h = Harness::new();
    seed_c1(&h);
    h.backend
        .rows()
        .messages
        .push(message_row("n1", "c2", "bob", "text", 10));
    let gate = h.backend.gate("c1");

    let session = h.session.clone();
    let first = tokio::spawn(async move { session.open_conversation(c1()).await });
    settle().await;
    assert!(h.feed.is_listening("c1"));
    let stale_feed = h.feed.conversation("c1").unwrap();

    h.session
        .open_conversation(ConversationId::from("c2"))
        .await
        .unwrap();
    settle().await;
    assert!(!h.feed.is_listening("c1"));

    gate.notify_one();
    let result = first.await.unwrap();
    assert!(matches!(result, Err(SyncError::Superseded)));

    // The old stream is closed, so nothing can reach the new state through it.
    let late = insert(MESSAGES_TABLE, message_row("m9", "c1", "bob", "text", 99));
    assert!(stale_feed.send(late).await.is_err());

    let view = h.session.view().await.unwrap();
    assert_eq!(view.conversation_id, ConversationId::from("c2"));
    let ids: Vec<&str> = view.messages.iter().map(|m| m.message.id.as_str()).collect();
    assert_eq!(ids, vec!["n1"]);
}

#[tokio::test]
async fn close_conversation_is_idempotent() {
    let h = Harness::new();
    h.session.open_conversation(c1()).await.unwrap();
    let mut events = h.session.subscribe_events();

    h.session.close_conversation().await;
    h.session.close_conversation().await;
    settle().await;

    assert!(h.session.view().await.is_none());
    assert!(!h.feed.is_listening("c1"));
    let closed = std::iter::from_fn(|| events.try_recv().ok())
        .filter(|e| matches!(e, SessionEvent::Closed { .. }))
        .count();
    assert_eq!(closed, 1);
    assert!(matches!(
        h.session.send_text("anyone?").await,
        Err(SyncError::NoActiveConversation)
    ));
}

// ---------------------------------------------------------------------------
// Loads racing the change feed
// ---------------------------------------------------------------------------

#[tokio::test]
async fn reload_keeps_child_changes_made_during_the_fetch() {
    let h = Harness::new();
    seed_c1(&h);
    h.session.open_conversation(c1()).await.unwrap();
    let gate = h.backend.gate("c1");

    let session = h.session.clone();
    let reload = tokio::spawn(async move { session.reload().await });
    settle().await;

    h.feed
        .push("c1", insert(REACTIONS_TABLE, reaction_row("m1", "dave", "🌻", 40)))
        .await;
    h.feed
        .push(
            "c1",
            delete(
                REACTIONS_TABLE,
                json!({"message_id": "m1", "user_id": "carol", "emoji": "🌱"}),
            ),
        )
        .await;
    settle().await;

    gate.notify_one();
    assert_eq!(reload.await.unwrap().unwrap(), 2);

    // The server rows still list carol's reaction; the later delete wins.
    let snap = h.session.snapshot().await.unwrap();
    let users: Vec<&str> = snap
        .reactions_for(&MessageId::from("m1"))
        .iter()
        .map(|r| r.user_id.as_str())
        .collect();
    assert_eq!(users, vec!["dave"]);
}

#[tokio::test(start_paused = true)]
async fn prefilled_open_keeps_attachment_that_arrived_during_the_load() {
    let first = Harness::new();
    seed_c1(&first);
    first.session.open_conversation(c1()).await.unwrap();
    advance(250).await;

    let second = Harness::with_cache(Some((first.cache.clone(), first.clock.clone())));
    seed_c1(&second);
    let gate = second.backend.gate("c1");
    let session = second.session.clone();
    let open = tokio::spawn(async move { session.open_conversation(c1()).await });
    settle().await;
    assert_eq!(second.session.view().await.unwrap().messages.len(), 2);

    second
        .feed
        .push("c1", insert(ATTACHMENTS_TABLE, attachment_row("a3", "m2", "c1")))
        .await;
    settle().await;
    gate.notify_one();
    assert_eq!(open.await.unwrap().unwrap(), 2);
    settle().await;

    let view = second.session.view().await.unwrap();
    let m2 = view.message(&MessageId::from("m2")).unwrap();
    let ids: Vec<&str> = m2
        .attachments
        .iter()
        .map(|a| a.attachment.id.as_str())
        .collect();
    assert_eq!(ids.len(), 3);
    assert!(ids.contains(&"a3"));
    assert!(m2.attachments.iter().all(|a| a.signed_url.is_some()));
}

#[tokio::test]
async fn reconnect_reloads_to_recover_missed_events() {
    let h = Harness::new();
    seed_c1(&h);
    h.session.open_conversation(c1()).await.unwrap();
    let loads = h.backend.calls("fetch_messages");

    // Written while the socket was down; no feed event will carry them.
    h.backend
        .rows()
        .messages
        .push(message_row("m3", "c1", "bob", "text", 30));
    h.backend
        .rows()
        .reactions
        .push(reaction_row("m1", "dave", "🌻", 40));

    h.feed.reconnect("c1");
    settle().await;

    assert_eq!(h.backend.calls("fetch_messages"), loads + 1);
    let snap = h.session.snapshot().await.unwrap();
    assert!(snap.has_message(&MessageId::from("m3")));
    assert_eq!(snap.reactions_for(&MessageId::from("m1")).len(), 2);
}

// ---------------------------------------------------------------------------
// Cache store
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn cached_snapshot_prefills_next_session() {
    let first = Harness::new();
    seed_c1(&first);
    first.session.open_conversation(c1()).await.unwrap();
    advance(250).await;

    let second = Harness::with_cache(Some((first.cache.clone(), first.clock.clone())));
    second.backend.fail("fetch_messages");
    assert!(second.session.open_conversation(c1()).await.is_err());

    let view = second.session.view().await.unwrap();
    assert_eq!(view.messages.len(), 2);
    let m2 = view.message(&MessageId::from("m2")).unwrap();
    assert_eq!(m2.attachments.len(), 2);
    assert!(view.last_error.is_some());
}

#[tokio::test(start_paused = true)]
async fn switching_away_flushes_the_pending_snapshot() {
    let first = Harness::new();
    seed_c1(&first);
    first.session.open_conversation(c1()).await.unwrap();
    advance(250).await;

    first
        .feed
        .push("c1", insert(REACTIONS_TABLE, reaction_row("m1", "dave", "🌻", 40)))
        .await;
    settle().await;
    first
        .session
        .open_conversation(ConversationId::from("c2"))
        .await
        .unwrap();

    let second = Harness::with_cache(Some((first.cache.clone(), first.clock.clone())));
    second.backend.fail("fetch_messages");
    assert!(second.session.open_conversation(c1()).await.is_err());
    let snap = second.session.snapshot().await.unwrap();
    assert_eq!(snap.reactions_for(&MessageId::from("m1")).len(), 2);
}

#[tokio::test(start_paused = true)]
async fn expired_snapshot_is_ignored() {
    let first = Harness::new();
    seed_c1(&first);
    first.session.open_conversation(c1()).await.unwrap();
    advance(250).await;

    first.clock.advance(25 * 60 * 60 * 1000);
    let second = Harness::with_cache(Some((first.cache.clone(), first.clock.clone())));
    second.backend.fail("fetch_messages");
    assert!(second.session.open_conversation(c1()).await.is_err());
    assert!(second.session.view().await.unwrap().messages.is_empty());
}

#[tokio::test(start_paused = true)]
async fn membership_change_invalidates_user_cache() {
    let h = Harness::new();
    seed_c1(&h);
    h.backend.rows().overview = json!({
        "conversations": [
            {"id": "c1", "title": "Tomato growers", "is_channel": true, "joined": true, "member_count": 12}
        ],
        "roster": [profile_row("bob", "Bob")],
    });
    h.session.open_conversation(c1()).await.unwrap();
    let overview = h.session.load_overview().await.unwrap();
    assert_eq!(overview.conversations.len(), 1);
    assert_eq!(overview.roster[0].id, UserId::from("bob"));
    advance(250).await;
    assert_eq!(h.session.cached_overview(), Some(overview));
    assert_eq!(h.cache.keys().len(), 2);

    h.session
        .join_group(&ConversationId::from("c7"))
        .await
        .unwrap();
    assert_eq!(h.session.cached_overview(), None);
    assert!(h.cache.keys().is_empty());
}

// ---------------------------------------------------------------------------
// City feed
// ---------------------------------------------------------------------------

#[tokio::test]
async fn city_feed_is_forwarded_as_events() {
    let h = Harness::new();
    let mut events = h.session.subscribe_events();
    h.session.subscribe_city("oakland").await.unwrap();

    let tx = h.feed.city("oakland").unwrap();
    tx.send(insert("city_events", json!({"id": "e1", "city": "oakland", "title": "Seed swap"})))
        .await
        .unwrap();
    settle().await;

    let activity = std::iter::from_fn(|| events.try_recv().ok()).find_map(|e| match e {
        SessionEvent::CityActivity { city, record, .. } => Some((city, record)),
        _ => None,
    });
    let (city, record) = activity.expect("expected city activity");
    assert_eq!(city, "oakland");
    assert_eq!(record["title"], "Seed swap");

    h.session.close_city().await;
    settle().await;
    assert!(tx.is_closed());
}
