use super::*;

use tokio::time::{Duration, timeout};

use crate::state::test_helpers;
use crate::view::EDIT_WINDOW_MS;

fn text_draft(body: &str) -> MessageDraft {
    MessageDraft { kind: MessageKind::Text, body: body.into(), media_url: None, poll: None }
}

async fn recv_delivery(rx: &mut tokio::sync::mpsc::Receiver<SnapshotDelivery>) -> SnapshotDelivery {
    timeout(Duration::from_millis(500), rx.recv())
        .await
        .expect("snapshot receive timed out")
        .expect("subscriber channel closed unexpectedly")
}

// =============================================================================
// SEND
// =============================================================================

#[tokio::test]
async fn send_text_succeeds() {
    let state = test_helpers::test_app_state();
    let scope = Scope::Global;
    test_helpers::seed_scope(&state, &scope).await;
    let user = test_helpers::dummy_user(Role::Student);

    let msg = send_message(&state, &scope, &user, text_draft("  hello  "))
        .await
        .unwrap();
    assert_eq!(msg.body, "hello", "body is trimmed");
    assert_eq!(msg.author_id, user.id);
    assert_eq!(msg.kind, MessageKind::Text);
    assert!(!msg.edited);
    assert_eq!(msg.rev, 1);
    assert!(msg.created_at > 0);

    let scopes = state.scopes.read().await;
    let ss = scopes.get(&scope).unwrap();
    assert!(ss.messages.contains_key(&msg.id));
    assert!(ss.dirty.contains(&msg.id));
}

#[tokio::test]
async fn send_rejects_empty_body() {
    let state = test_helpers::test_app_state();
    let scope = Scope::Global;
    test_helpers::seed_scope(&state, &scope).await;
    let user = test_helpers::dummy_user(Role::Student);

    let result = send_message(&state, &scope, &user, text_draft("   ")).await;
    assert!(matches!(result.unwrap_err(), ChatError::EmptyBody));
}

#[tokio::test]
async fn send_media_requires_url() {
    let state = test_helpers::test_app_state();
    let scope = Scope::Global;
    test_helpers::seed_scope(&state, &scope).await;
    let user = test_helpers::dummy_user(Role::Mentor);

    let draft = MessageDraft { kind: MessageKind::Image, body: String::new(), media_url: None, poll: None };
    assert!(matches!(
        send_message(&state, &scope, &user, draft).await.unwrap_err(),
        ChatError::MissingMedia { kind: "image" }
    ));

    let draft = MessageDraft {
        kind: MessageKind::Gif,
        body: String::new(),
        media_url: Some("https://cdn.example/loop.gif".into()),
        poll: None,
    };
    let msg = send_message(&state, &scope, &user, draft).await.unwrap();
    assert_eq!(msg.media_url.as_deref(), Some("https://cdn.example/loop.gif"));
    assert!(msg.body.is_empty());
}

#[tokio::test]
async fn send_poll_requires_two_options() {
    let state = test_helpers::test_app_state();
    let scope = Scope::Global;
    test_helpers::seed_scope(&state, &scope).await;
    let user = test_helpers::dummy_user(Role::Student);

    let draft = MessageDraft {
        kind: MessageKind::Poll,
        body: String::new(),
        media_url: None,
        poll: Some(PollDraft { question: "lunch?".into(), options: vec!["pizza".into(), "  ".into()] }),
    };
    assert!(matches!(
        send_message(&state, &scope, &user, draft).await.unwrap_err(),
        ChatError::InvalidPoll
    ));

    let draft = MessageDraft {
        kind: MessageKind::Poll,
        body: String::new(),
        media_url: None,
        poll: Some(PollDraft { question: "lunch?".into(), options: vec!["pizza".into(), "dosa".into()] }),
    };
    let msg = send_message(&state, &scope, &user, draft).await.unwrap();
    let poll = msg.poll.expect("poll payload present");
    assert_eq!(poll.options.len(), 2);
    assert_eq!(poll.total_votes, 0);
}

#[tokio::test]
async fn send_requires_loaded_scope() {
    let state = test_helpers::test_app_state();
    let user = test_helpers::dummy_user(Role::Student);
    let result = send_message(&state, &Scope::Global, &user, text_draft("hi")).await;
    assert!(matches!(result.unwrap_err(), ChatError::ScopeNotLoaded(_)));
}

#[tokio::test]
async fn send_requires_scope_attribute() {
    let state = test_helpers::test_app_state();
    let scope = Scope::College("iit-d".into());
    test_helpers::seed_scope(&state, &scope).await;

    let mut user = test_helpers::dummy_user(Role::Student);
    user.college = None;
    let result = send_message(&state, &scope, &user, text_draft("hi")).await;
    assert!(matches!(
        result.unwrap_err(),
        ChatError::MissingScopeAttribute { attribute: "college" }
    ));
}

// =============================================================================
// SNAPSHOT DELIVERY
// =============================================================================

#[tokio::test]
async fn send_then_receive_full_snapshot() {
    let state = test_helpers::test_app_state();
    let scope = Scope::Global;
    test_helpers::seed_scope(&state, &scope).await;
    let (_reader, mut rx) = test_helpers::attach_subscriber(&state, &scope).await;

    let sender = test_helpers::dummy_user(Role::Student);
    send_message(&state, &scope, &sender, text_draft("hello"))
        .await
        .unwrap();

    let delivery = recv_delivery(&mut rx).await;
    assert_eq!(delivery.scope, scope);
    let snapshot = delivery.snapshot;
    assert_eq!(snapshot.len(), 1);
    assert_eq!(snapshot[0].body, "hello");
    assert_eq!(snapshot[0].author_id, sender.id);
    assert_eq!(snapshot[0].kind, MessageKind::Text);
}

#[tokio::test]
async fn snapshots_are_sorted_without_duplicates() {
    let state = test_helpers::test_app_state();
    let scope = Scope::Global;
    test_helpers::seed_scope(&state, &scope).await;
    let user = test_helpers::dummy_user(Role::Student);

    for body in ["one", "two", "three"] {
        send_message(&state, &scope, &user, text_draft(body))
            .await
            .unwrap();
    }

    let scopes = state.scopes.read().await;
    let snapshot = snapshot_of(scopes.get(&scope).unwrap());
    assert_eq!(snapshot.len(), 3);
    assert!(snapshot.windows(2).all(|w| w[0].created_at <= w[1].created_at));
    let mut ids: Vec<_> = snapshot.iter().map(|m| m.id).collect();
    ids.sort();
    ids.dedup();
    assert_eq!(ids.len(), 3, "no duplicate ids");
}

#[tokio::test]
async fn equal_timestamps_order_deterministically() {
    let state = test_helpers::test_app_state();
    let scope = Scope::Global;
    let author = uuid::Uuid::new_v4();
    // Three messages stamped in the same millisecond.
    let messages = vec![
        test_helpers::dummy_text_message(&scope, author, "a", 42),
        test_helpers::dummy_text_message(&scope, author, "b", 42),
        test_helpers::dummy_text_message(&scope, author, "c", 42),
    ];
    test_helpers::seed_scope_with_messages(&state, &scope, messages).await;

    let scopes = state.scopes.read().await;
    let first = snapshot_of(scopes.get(&scope).unwrap());
    let second = snapshot_of(scopes.get(&scope).unwrap());
    let first_ids: Vec<_> = first.iter().map(|m| m.id).collect();
    let second_ids: Vec<_> = second.iter().map(|m| m.id).collect();
    assert_eq!(first_ids, second_ids, "tie-break by id is stable");
}

#[tokio::test]
async fn scope_isolation() {
    let state = test_helpers::test_app_state();
    let college_x = Scope::College("x".into());
    let college_y = Scope::College("y".into());
    test_helpers::seed_scope(&state, &college_x).await;
    test_helpers::seed_scope(&state, &college_y).await;
    test_helpers::seed_scope(&state, &Scope::Global).await;
    let (_rx_id, mut x_rx) = test_helpers::attach_subscriber(&state, &college_x).await;
    let (_ry_id, mut y_rx) = test_helpers::attach_subscriber(&state, &college_y).await;
    let (_rg_id, mut g_rx) = test_helpers::attach_subscriber(&state, &Scope::Global).await;

    let mut user = test_helpers::dummy_user(Role::Student);
    user.college = Some("x".into());
    send_message(&state, &college_x, &user, text_draft("for x only"))
        .await
        .unwrap();

    let delivery = recv_delivery(&mut x_rx).await;
    assert_eq!(delivery.scope, college_x);
    assert_eq!(delivery.snapshot.len(), 1);

    assert!(y_rx.try_recv().is_err(), "college y must not observe it");
    assert!(g_rx.try_recv().is_err(), "global must not observe it");
}

// =============================================================================
// EDIT
// =============================================================================

#[tokio::test]
async fn edit_own_message_within_window() {
    let state = test_helpers::test_app_state();
    let scope = Scope::Global;
    test_helpers::seed_scope(&state, &scope).await;
    let user = test_helpers::dummy_user(Role::Student);

    let msg = send_message(&state, &scope, &user, text_draft("helo"))
        .await
        .unwrap();
    let edited = edit_message(&state, &scope, &user, msg.id, "hello")
        .await
        .unwrap();
    assert_eq!(edited.body, "hello");
    assert!(edited.edited);
    assert_eq!(edited.rev, 2);
}

#[tokio::test]
async fn edit_window_boundary_enforced() {
    let state = test_helpers::test_app_state();
    let scope = Scope::Global;
    test_helpers::seed_scope(&state, &scope).await;
    let user = test_helpers::dummy_user(Role::Student);

    let msg = send_message(&state, &scope, &user, text_draft("draft"))
        .await
        .unwrap();

    // One millisecond before the window closes: permitted.
    let edited = edit_message_at(&state, &scope, &user, msg.id, "v2", msg.created_at + EDIT_WINDOW_MS - 1)
        .await
        .unwrap();
    assert_eq!(edited.body, "v2");

    // One millisecond past: refused.
    let result = edit_message_at(&state, &scope, &user, msg.id, "v3", msg.created_at + EDIT_WINDOW_MS + 1).await;
    assert!(matches!(result.unwrap_err(), ChatError::EditWindowClosed { .. }));
}

#[tokio::test]
async fn edit_denied_for_non_author() {
    let state = test_helpers::test_app_state();
    let scope = Scope::Global;
    test_helpers::seed_scope(&state, &scope).await;
    let author = test_helpers::dummy_user(Role::Student);
    let stranger = test_helpers::dummy_user(Role::Mentor);

    let msg = send_message(&state, &scope, &author, text_draft("mine"))
        .await
        .unwrap();
    let result = edit_message(&state, &scope, &stranger, msg.id, "stolen").await;
    assert!(matches!(result.unwrap_err(), ChatError::NotAuthor { action: "edit" }));
}

#[tokio::test]
async fn edit_denied_for_non_text() {
    let state = test_helpers::test_app_state();
    let scope = Scope::Global;
    test_helpers::seed_scope(&state, &scope).await;
    let user = test_helpers::dummy_user(Role::Student);

    let draft = MessageDraft {
        kind: MessageKind::Poll,
        body: String::new(),
        media_url: None,
        poll: Some(PollDraft { question: "q?".into(), options: vec!["a".into(), "b".into()] }),
    };
    let msg = send_message(&state, &scope, &user, draft).await.unwrap();
    let result = edit_message(&state, &scope, &user, msg.id, "new question").await;
    assert!(matches!(result.unwrap_err(), ChatError::NotText));
}

#[tokio::test]
async fn edit_vanished_message_is_not_found() {
    let state = test_helpers::test_app_state();
    let scope = Scope::Global;
    test_helpers::seed_scope(&state, &scope).await;
    let user = test_helpers::dummy_user(Role::Student);

    let result = edit_message(&state, &scope, &user, uuid::Uuid::new_v4(), "hi").await;
    assert!(matches!(result.unwrap_err(), ChatError::NotFound(_)));
}

// =============================================================================
// DELETE
// =============================================================================

#[tokio::test]
async fn delete_missing_message_is_not_found() {
    let state = test_helpers::test_app_state();
    let scope = Scope::Global;
    test_helpers::seed_scope(&state, &scope).await;
    let user = test_helpers::dummy_user(Role::Student);

    let result = remove_message(&state, &scope, &user, uuid::Uuid::new_v4()).await;
    assert!(matches!(result.unwrap_err(), ChatError::NotFound(_)));
}

#[tokio::test]
async fn delete_denied_for_non_author() {
    let state = test_helpers::test_app_state();
    let scope = Scope::Global;
    test_helpers::seed_scope(&state, &scope).await;
    let author = test_helpers::dummy_user(Role::Student);
    let stranger = test_helpers::dummy_user(Role::Company);

    let msg = send_message(&state, &scope, &author, text_draft("mine"))
        .await
        .unwrap();
    let result = remove_message(&state, &scope, &stranger, msg.id).await;
    assert!(matches!(result.unwrap_err(), ChatError::NotAuthor { action: "delete" }));
}

#[tokio::test]
async fn delete_twice_reports_not_found_second_time() {
    let state = test_helpers::test_app_state();
    let scope = Scope::Global;
    test_helpers::seed_scope(&state, &scope).await;
    let user = test_helpers::dummy_user(Role::Student);

    let msg = send_message(&state, &scope, &user, text_draft("gone"))
        .await
        .unwrap();
    remove_message(&state, &scope, &user, msg.id).await.unwrap();
    let result = remove_message(&state, &scope, &user, msg.id).await;
    assert!(matches!(result.unwrap_err(), ChatError::NotFound(_)));
}

#[tokio::test]
async fn delete_tombstones_for_the_flush_path() {
    let state = test_helpers::test_app_state();
    let scope = Scope::Global;
    test_helpers::seed_scope(&state, &scope).await;
    let user = test_helpers::dummy_user(Role::Student);

    let msg = send_message(&state, &scope, &user, text_draft("short-lived"))
        .await
        .unwrap();
    remove_message(&state, &scope, &user, msg.id).await.unwrap();

    let scopes = state.scopes.read().await;
    let ss = scopes.get(&scope).unwrap();
    assert!(!ss.messages.contains_key(&msg.id), "gone from memory at once");
    assert!(!ss.dirty.contains(&msg.id), "never upserted again");
    assert!(ss.deleted.contains(&msg.id), "row deletion deferred to the flush path");
}

// =============================================================================
// JOIN / PART
// =============================================================================

#[tokio::test]
async fn join_returns_snapshot_and_registers_subscriber() {
    let state = test_helpers::test_app_state();
    let scope = Scope::Global;
    let existing = test_helpers::dummy_text_message(&scope, uuid::Uuid::new_v4(), "old", 10);
    test_helpers::seed_scope_with_messages(&state, &scope, vec![existing]).await;

    let user = test_helpers::dummy_user(Role::Student);
    let client_id = uuid::Uuid::new_v4();
    let (tx, _rx) = tokio::sync::mpsc::channel(16);
    let snapshot = join_scope(&state, &scope, &user, client_id, tx)
        .await
        .unwrap();
    assert_eq!(snapshot.len(), 1);
    assert_eq!(snapshot[0].body, "old");

    let scopes = state.scopes.read().await;
    assert!(scopes.get(&scope).unwrap().subscribers.contains_key(&client_id));
}

#[tokio::test]
async fn join_scoped_chat_requires_attribute() {
    let state = test_helpers::test_app_state();
    let scope = Scope::Region("west".into());
    test_helpers::seed_scope(&state, &scope).await;

    let mut user = test_helpers::dummy_user(Role::Student);
    user.region = None;
    let (tx, _rx) = tokio::sync::mpsc::channel(16);
    let result = join_scope(&state, &scope, &user, uuid::Uuid::new_v4(), tx).await;
    assert!(matches!(
        result.unwrap_err(),
        ChatError::MissingScopeAttribute { attribute: "region" }
    ));
}

#[tokio::test]
async fn last_part_evicts_clean_scope() {
    let state = test_helpers::test_app_state();
    let scope = Scope::Global;
    test_helpers::seed_scope(&state, &scope).await;
    let (client_id, _rx) = test_helpers::attach_subscriber(&state, &scope).await;

    part_scope(&state, &scope, client_id).await;

    let scopes = state.scopes.read().await;
    assert!(!scopes.contains_key(&scope), "clean scope evicted on last part");
}

#[tokio::test]
async fn part_keeps_scope_while_subscribers_remain() {
    let state = test_helpers::test_app_state();
    let scope = Scope::Global;
    test_helpers::seed_scope(&state, &scope).await;
    let (first, _rx1) = test_helpers::attach_subscriber(&state, &scope).await;
    let (_second, _rx2) = test_helpers::attach_subscriber(&state, &scope).await;

    part_scope(&state, &scope, first).await;

    let scopes = state.scopes.read().await;
    assert!(scopes.contains_key(&scope));
    assert_eq!(scopes.get(&scope).unwrap().subscribers.len(), 1);
}

#[tokio::test]
async fn dirty_clear_respects_rev() {
    let mut ss = ScopeState::new();
    let scope = Scope::Global;
    let stale = test_helpers::dummy_text_message(&scope, uuid::Uuid::new_v4(), "stale", 1);
    let fresh = test_helpers::dummy_text_message(&scope, uuid::Uuid::new_v4(), "fresh", 2);
    let gone = uuid::Uuid::new_v4();

    let stale_id = stale.id;
    let fresh_id = fresh.id;
    ss.dirty.extend([stale_id, fresh_id, gone]);
    ss.messages.insert(stale_id, stale);
    let mut bumped = fresh.clone();
    bumped.rev = 2; // mutated again after the flush snapshot
    ss.messages.insert(fresh_id, bumped);

    clear_flushed_dirty_ids(&mut ss, &[(stale_id, 1), (fresh_id, 1), (gone, 1)]);

    assert!(!ss.dirty.contains(&stale_id), "rev matched, cleared");
    assert!(ss.dirty.contains(&fresh_id), "newer rev stays dirty");
    assert!(!ss.dirty.contains(&gone), "deleted message cleared");
}
