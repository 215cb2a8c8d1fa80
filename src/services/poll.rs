//! Poll service — one-vote-per-user aggregation.
//!
//! DESIGN
//! ======
//! `apply_vote` is pure: it either mutates the payload (option +1,
//! total +1, voter inserted) or signals `AlreadyVoted` and leaves it
//! untouched. `cast_vote` runs it under the scope map's write lock, so
//! two racing voters serialize and neither increment is lost — the
//! compare-and-swap the naive read-modify-write pattern lacks.
//!
//! `AlreadyVoted` is a no-op signal, not a failure: the dispatch layer
//! replies normally with `already_voted = true`.

use uuid::Uuid;

use crate::message::{ChatMessage, PollPayload, Scope};
use crate::services::chat::broadcast_snapshot;
use crate::state::AppState;

// =============================================================================
// TYPES
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum VoteError {
    #[error("message not found: {0}")]
    NotFound(Uuid),
    #[error("scope not loaded: {0}")]
    ScopeNotLoaded(Scope),
    #[error("message is not a poll: {0}")]
    NotAPoll(Uuid),
    #[error("unknown poll option: {0}")]
    UnknownOption(String),
    /// Not a failure: the voter already appears in the voter set.
    #[error("voter has already voted on this poll")]
    AlreadyVoted,
}

impl crate::frame::ErrorCode for VoteError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "E_NOT_FOUND",
            Self::ScopeNotLoaded(_) => "E_SCOPE_NOT_LOADED",
            Self::NotAPoll(_) => "E_NOT_A_POLL",
            Self::UnknownOption(_) => "E_UNKNOWN_OPTION",
            Self::AlreadyVoted => "E_ALREADY_VOTED",
        }
    }
}

// =============================================================================
// AGGREGATION
// =============================================================================

/// Apply one vote to a poll payload: matching option +1, total +1,
/// voter inserted — or `AlreadyVoted`/`UnknownOption` with the payload
/// unchanged.
///
/// # Errors
///
/// `AlreadyVoted` if the voter is in the voter set, `UnknownOption` if
/// no option carries the given id.
pub fn apply_vote(poll: &mut PollPayload, option_id: &str, voter_id: Uuid) -> Result<(), VoteError> {
    if poll.voters.contains(&voter_id) {
        return Err(VoteError::AlreadyVoted);
    }
    let option = poll
        .options
        .iter_mut()
        .find(|o| o.id == option_id)
        .ok_or_else(|| VoteError::UnknownOption(option_id.to_string()))?;

    option.votes += 1;
    poll.total_votes += 1;
    poll.voters.insert(voter_id);
    Ok(())
}

/// Display-only percentage: `round(votes / total * 100)`, 0 for an
/// empty poll. Never persisted.
#[must_use]
pub fn percentage(option_votes: u32, total_votes: u32) -> u32 {
    if total_votes == 0 {
        return 0;
    }
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    {
        (f64::from(option_votes) / f64::from(total_votes) * 100.0).round() as u32
    }
}

// =============================================================================
// SERVICE
// =============================================================================

/// Cast a vote on a poll message. Atomic under the scope write lock;
/// marks the message dirty and broadcasts the new snapshot.
///
/// # Errors
///
/// Returns `AlreadyVoted` as a no-op signal; `NotFound`, `NotAPoll`,
/// `UnknownOption`, or `ScopeNotLoaded` as real refusals.
pub async fn cast_vote(
    state: &AppState,
    scope: &Scope,
    message_id: Uuid,
    option_id: &str,
    voter_id: Uuid,
) -> Result<ChatMessage, VoteError> {
    let mut scopes = state.scopes.write().await;
    let scope_state = scopes
        .get_mut(scope)
        .ok_or_else(|| VoteError::ScopeNotLoaded(scope.clone()))?;
    let msg = scope_state
        .messages
        .get_mut(&message_id)
        .ok_or(VoteError::NotFound(message_id))?;
    let poll = msg.poll.as_mut().ok_or(VoteError::NotAPoll(message_id))?;

    apply_vote(poll, option_id, voter_id)?;
    msg.rev += 1;
    let result = msg.clone();

    scope_state.dirty.insert(message_id);
    broadcast_snapshot(scope, scope_state);

    Ok(result)
}

#[cfg(test)]
#[path = "poll_test.rs"]
mod tests;
