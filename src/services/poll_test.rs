use super::*;

use crate::message::{MessageKind, Role};
use crate::services::chat::{MessageDraft, PollDraft, send_message};
use crate::state::test_helpers;

fn two_option_poll() -> PollPayload {
    PollPayload::new("lunch?", &["pizza".into(), "dosa".into()])
}

async fn seed_poll_message(state: &crate::state::AppState, scope: &Scope) -> ChatMessage {
    let user = test_helpers::dummy_user(Role::Student);
    let draft = MessageDraft {
        kind: MessageKind::Poll,
        body: String::new(),
        media_url: None,
        poll: Some(PollDraft { question: "lunch?".into(), options: vec!["pizza".into(), "dosa".into()] }),
    };
    send_message(state, scope, &user, draft).await.unwrap()
}

// =============================================================================
// apply_vote (pure)
// =============================================================================

#[test]
fn vote_increments_option_total_and_voters() {
    let mut poll = two_option_poll();
    let voter = Uuid::new_v4();
    let option_id = poll.options[0].id.clone();

    apply_vote(&mut poll, &option_id, voter).unwrap();

    assert_eq!(poll.options[0].votes, 1);
    assert_eq!(poll.options[1].votes, 0);
    assert_eq!(poll.total_votes, 1);
    assert!(poll.voters.contains(&voter));
}

#[test]
fn second_vote_by_same_user_is_a_no_op() {
    let mut poll = two_option_poll();
    let voter = Uuid::new_v4();
    let first = poll.options[0].id.clone();
    let second = poll.options[1].id.clone();

    apply_vote(&mut poll, &first, voter).unwrap();
    // Even on a different option.
    assert!(matches!(apply_vote(&mut poll, &second, voter), Err(VoteError::AlreadyVoted)));

    assert_eq!(poll.total_votes, 1);
    assert_eq!(poll.options[0].votes, 1);
    assert_eq!(poll.options[1].votes, 0);
    assert_eq!(poll.voters.len(), 1);
}

#[test]
fn unknown_option_leaves_payload_untouched() {
    let mut poll = two_option_poll();
    let voter = Uuid::new_v4();
    assert!(matches!(
        apply_vote(&mut poll, "no-such-option", voter),
        Err(VoteError::UnknownOption(_))
    ));
    assert_eq!(poll.total_votes, 0);
    assert!(!poll.voters.contains(&voter), "failed vote does not claim the voter slot");
}

#[test]
fn total_equals_sum_after_any_vote_sequence() {
    let mut poll = PollPayload::new("q?", &["a".into(), "b".into(), "c".into()]);
    let ids: Vec<String> = poll.options.iter().map(|o| o.id.clone()).collect();

    for i in 0..20 {
        let _ = apply_vote(&mut poll, &ids[i % 3], Uuid::new_v4());
    }
    // A few repeat voters mixed in.
    let repeat = Uuid::new_v4();
    apply_vote(&mut poll, &ids[0], repeat).unwrap();
    assert!(apply_vote(&mut poll, &ids[1], repeat).is_err());

    assert_eq!(poll.total_votes, poll.vote_sum());
    assert_eq!(u32::try_from(poll.voters.len()).unwrap(), poll.total_votes);
}

#[test]
fn percentage_display() {
    assert_eq!(percentage(0, 0), 0);
    assert_eq!(percentage(1, 2), 50);
    assert_eq!(percentage(2, 3), 67);
    assert_eq!(percentage(1, 3), 33);
    assert_eq!(percentage(3, 3), 100);
}

// =============================================================================
// cast_vote (service)
// =============================================================================

#[tokio::test]
async fn cast_vote_mutates_message_and_marks_dirty() {
    let state = test_helpers::test_app_state();
    let scope = Scope::Global;
    test_helpers::seed_scope(&state, &scope).await;
    let msg = seed_poll_message(&state, &scope).await;
    let option_id = msg.poll.as_ref().unwrap().options[0].id.clone();

    let voter = Uuid::new_v4();
    let updated = cast_vote(&state, &scope, msg.id, &option_id, voter)
        .await
        .unwrap();
    let poll = updated.poll.as_ref().unwrap();
    assert_eq!(poll.total_votes, 1);
    assert_eq!(updated.rev, 2);

    let scopes = state.scopes.read().await;
    assert!(scopes.get(&scope).unwrap().dirty.contains(&msg.id));
}

#[tokio::test]
async fn cast_vote_twice_changes_payload_once() {
    let state = test_helpers::test_app_state();
    let scope = Scope::Global;
    test_helpers::seed_scope(&state, &scope).await;
    let msg = seed_poll_message(&state, &scope).await;
    let option_id = msg.poll.as_ref().unwrap().options[0].id.clone();
    let voter = Uuid::new_v4();

    cast_vote(&state, &scope, msg.id, &option_id, voter)
        .await
        .unwrap();
    let second = cast_vote(&state, &scope, msg.id, &option_id, voter).await;
    assert!(matches!(second.unwrap_err(), VoteError::AlreadyVoted));

    let scopes = state.scopes.read().await;
    let stored = scopes.get(&scope).unwrap().messages.get(&msg.id).unwrap();
    let poll = stored.poll.as_ref().unwrap();
    assert_eq!(poll.total_votes, 1);
    assert_eq!(poll.voters.len(), 1);
}

#[tokio::test]
async fn concurrent_votes_both_count() {
    let state = test_helpers::test_app_state();
    let scope = Scope::Global;
    test_helpers::seed_scope(&state, &scope).await;
    let msg = seed_poll_message(&state, &scope).await;
    let first_option = msg.poll.as_ref().unwrap().options[0].id.clone();
    let second_option = msg.poll.as_ref().unwrap().options[1].id.clone();

    let a = tokio::spawn({
        let state = state.clone();
        let scope = scope.clone();
        let option = first_option.clone();
        async move { cast_vote(&state, &scope, msg.id, &option, Uuid::new_v4()).await }
    });
    let b = tokio::spawn({
        let state = state.clone();
        let scope = scope.clone();
        let option = second_option.clone();
        async move { cast_vote(&state, &scope, msg.id, &option, Uuid::new_v4()).await }
    });
    a.await.unwrap().unwrap();
    b.await.unwrap().unwrap();

    let scopes = state.scopes.read().await;
    let stored = scopes.get(&scope).unwrap().messages.get(&msg.id).unwrap();
    let poll = stored.poll.as_ref().unwrap();
    assert_eq!(poll.total_votes, 2, "no lost update under racing voters");
    assert_eq!(poll.vote_sum(), 2);
    assert_eq!(poll.options.iter().map(|o| o.votes).collect::<Vec<_>>(), vec![1, 1]);
    assert_eq!(poll.voters.len(), 2);
}

#[tokio::test]
async fn vote_on_text_message_is_refused() {
    let state = test_helpers::test_app_state();
    let scope = Scope::Global;
    test_helpers::seed_scope(&state, &scope).await;
    let user = test_helpers::dummy_user(Role::Student);
    let draft = MessageDraft { kind: MessageKind::Text, body: "not a poll".into(), media_url: None, poll: None };
    let msg = send_message(&state, &scope, &user, draft).await.unwrap();

    let result = cast_vote(&state, &scope, msg.id, "whatever", Uuid::new_v4()).await;
    assert!(matches!(result.unwrap_err(), VoteError::NotAPoll(_)));
}

#[tokio::test]
async fn vote_on_missing_message_is_not_found() {
    let state = test_helpers::test_app_state();
    let scope = Scope::Global;
    test_helpers::seed_scope(&state, &scope).await;

    let result = cast_vote(&state, &scope, Uuid::new_v4(), "opt", Uuid::new_v4()).await;
    assert!(matches!(result.unwrap_err(), VoteError::NotFound(_)));
}
