//! Chat service — scope subscriptions, message writes, snapshot fan-out.
//!
//! DESIGN
//! ======
//! Scope state is hydrated from Postgres when the first subscriber
//! arrives and kept in memory while anyone stays attached. Every
//! mutation (send, edit, delete, vote) happens under the scope map's
//! write lock, marks the message dirty for debounced persistence, and
//! broadcasts a freshly materialized full snapshot — ascending by
//! server-assigned timestamp — to every subscriber. Readers always see
//! complete snapshots, never diffs.
//!
//! ERROR HANDLING
//! ==============
//! On last-subscriber part, dirty messages are flushed before eviction.
//! If that flush fails, the scope is intentionally kept in memory with
//! dirty flags intact so the persistence worker can retry instead of
//! losing messages. Authorship and the edit window are enforced here,
//! not only in the client view.

use std::collections::HashMap;

use sqlx::PgPool;
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::frame::now_ms;
use crate::message::{ChatMessage, MessageKind, PollPayload, Role, Scope};
use crate::services::session::SessionUser;
use crate::state::{AppState, ScopeState, Snapshot, SnapshotDelivery};
use crate::view::EDIT_WINDOW_MS;

// =============================================================================
// TYPES
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    #[error("message not found: {0}")]
    NotFound(Uuid),
    #[error("scope not loaded: {0}")]
    ScopeNotLoaded(Scope),
    #[error("only the author may {action} this message")]
    NotAuthor { action: &'static str },
    #[error("edit window closed ({elapsed_ms}ms elapsed, limit {EDIT_WINDOW_MS}ms)")]
    EditWindowClosed { elapsed_ms: i64 },
    #[error("text message requires a non-empty body")]
    EmptyBody,
    #[error("{kind} message requires a media url")]
    MissingMedia { kind: &'static str },
    #[error("only text messages can be edited")]
    NotText,
    #[error("poll requires a question and at least two non-empty options")]
    InvalidPoll,
    #[error("no {attribute} on file for this chat")]
    MissingScopeAttribute { attribute: &'static str },
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl crate::frame::ErrorCode for ChatError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "E_NOT_FOUND",
            Self::ScopeNotLoaded(_) => "E_SCOPE_NOT_LOADED",
            Self::NotAuthor { .. } => "E_NOT_AUTHOR",
            Self::EditWindowClosed { .. } => "E_EDIT_WINDOW",
            Self::EmptyBody => "E_EMPTY_BODY",
            Self::MissingMedia { .. } => "E_MISSING_MEDIA",
            Self::NotText => "E_NOT_TEXT",
            Self::InvalidPoll => "E_INVALID_POLL",
            Self::MissingScopeAttribute { .. } => "E_MISSING_SCOPE_ATTR",
            Self::Database(_) => "E_DATABASE",
        }
    }

    fn retryable(&self) -> bool {
        matches!(self, Self::Database(_))
    }
}

/// Wire form of a send request, before the server stamps identity and
/// timestamp.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct MessageDraft {
    #[serde(default)]
    pub kind: MessageKind,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub media_url: Option<String>,
    #[serde(default)]
    pub poll: Option<PollDraft>,
}

/// Poll creation payload: question plus option labels.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct PollDraft {
    pub question: String,
    pub options: Vec<String>,
}

// =============================================================================
// JOIN / PART
// =============================================================================

/// Subscribe to a scope. Hydrates from Postgres if this is the first
/// subscriber. Returns the current ordered snapshot.
///
/// # Errors
///
/// Returns `MissingScopeAttribute` when the user lacks the region or
/// college attribute a scoped chat requires, or a database error if
/// hydration fails.
pub async fn join_scope(
    state: &AppState,
    scope: &Scope,
    user: &SessionUser,
    client_id: Uuid,
    tx: mpsc::Sender<SnapshotDelivery>,
) -> Result<Snapshot, ChatError> {
    check_membership(scope, user)?;

    let mut scopes = state.scopes.write().await;
    let needs_hydration = scopes.get(scope).is_none_or(|s| !s.hydrated);

    if needs_hydration {
        // Fetch outside the lock; another joiner may win the race, in
        // which case their hydration stands and ours is discarded.
        drop(scopes);
        let hydration = fetch_scope_messages(&state.pool, scope).await?;

        scopes = state.scopes.write().await;
        let scope_state = scopes.entry(scope.clone()).or_default();
        if !scope_state.hydrated {
            scope_state.messages = hydration;
            scope_state.hydrated = true;
            info!(%scope, count = scope_state.messages.len(), "hydrated scope from database");
        }
    }

    let scope_state = scopes.entry(scope.clone()).or_default();
    scope_state.subscribers.insert(client_id, tx);
    let snapshot = snapshot_of(scope_state);

    info!(%scope, %client_id, subscribers = scope_state.subscribers.len(), "client joined scope");
    Ok(snapshot)
}

/// Unsubscribe from a scope. If this was the last subscriber, flushes
/// dirty messages and pending tombstones, then evicts the scope state
/// from memory.
pub async fn part_scope(state: &AppState, scope: &Scope, client_id: Uuid) {
    {
        let mut scopes = state.scopes.write().await;
        let Some(scope_state) = scopes.get_mut(scope) else {
            return;
        };

        scope_state.subscribers.remove(&client_id);
        info!(%scope, %client_id, remaining = scope_state.subscribers.len(), "client left scope");

        if !scope_state.subscribers.is_empty() {
            return;
        }

        if scope_state.dirty.is_empty() && scope_state.deleted.is_empty() {
            scopes.remove(scope);
            info!(%scope, "evicted scope from memory");
            return;
        }
    }

    // Lock order is flush lock first, scope map second, same as the
    // background worker. The scope lock was released above to keep to
    // that order.
    let _flush_guard = state.flush_lock.lock().await;

    // PHASE: SNAPSHOT PENDING WORK FOR FINAL FLUSH
    // WHY: perform DB I/O outside the scope lock and keep dirty flags
    // and tombstones until the writes have actually succeeded.
    let (dirty_messages, dirty_revs, deleted_ids) = {
        let mut scopes = state.scopes.write().await;
        let Some(scope_state) = scopes.get_mut(scope) else {
            return;
        };
        if !scope_state.subscribers.is_empty() {
            return;
        }
        let dirty_messages = scope_state
            .dirty
            .iter()
            .filter_map(|id| scope_state.messages.get(id).cloned())
            .collect::<Vec<_>>();
        let dirty_revs = dirty_messages
            .iter()
            .map(|msg| (msg.id, msg.rev))
            .collect::<Vec<_>>();
        let deleted_ids: Vec<Uuid> = scope_state.deleted.iter().copied().collect();
        (dirty_messages, dirty_revs, deleted_ids)
    };

    let upsert_result = flush_messages(&state.pool, &dirty_messages).await;
    let delete_result = delete_messages(&state.pool, &deleted_ids).await;

    // PHASE: ACK OR RETAIN
    // WHY: clear dirties and tombstones only when persisted. On error,
    // retain state for the worker to retry.
    let mut scopes = state.scopes.write().await;
    let Some(scope_state) = scopes.get_mut(scope) else {
        return;
    };
    if !scope_state.subscribers.is_empty() {
        return;
    }

    match upsert_result {
        Ok(()) => clear_flushed_dirty_ids(scope_state, &dirty_revs),
        Err(e) => tracing::error!(error = %e, %scope, "final flush failed; scope retained for retry"),
    }
    match delete_result {
        Ok(()) => {
            for id in &deleted_ids {
                scope_state.deleted.remove(id);
            }
        }
        Err(e) => tracing::error!(error = %e, %scope, "final tombstone delete failed; scope retained for retry"),
    }

    if scope_state.dirty.is_empty() && scope_state.deleted.is_empty() {
        scopes.remove(scope);
        info!(%scope, "evicted scope from memory");
    } else {
        warn!(
            %scope,
            remaining_dirty = scope_state.dirty.len(),
            remaining_deleted = scope_state.deleted.len(),
            "retaining scope with unflushed work"
        );
    }
}

pub(crate) fn clear_flushed_dirty_ids(scope_state: &mut ScopeState, flushed_revs: &[(Uuid, i32)]) {
    for (message_id, flushed_rev) in flushed_revs {
        // EDGE: keep dirty flag if the message was mutated again after
        // the flush snapshot was taken.
        let can_clear = match scope_state.messages.get(message_id) {
            Some(current) => current.rev == *flushed_rev,
            None => true,
        };
        if can_clear {
            scope_state.dirty.remove(message_id);
        }
    }
}

fn check_membership(scope: &Scope, user: &SessionUser) -> Result<(), ChatError> {
    if scope.member_allowed(user.region.as_deref(), user.college.as_deref()) {
        return Ok(());
    }
    let attribute = match scope {
        Scope::Region(_) => "region",
        Scope::College(_) => "college",
        Scope::Global => unreachable!("global scope admits everyone"),
    };
    Err(ChatError::MissingScopeAttribute { attribute })
}

// =============================================================================
// SEND
// =============================================================================

/// Create a message in a scope. Assigns the id and the server timestamp
/// under the scope write lock, then broadcasts the new snapshot.
///
/// # Errors
///
/// Returns a validation error for a malformed draft, `ScopeNotLoaded`
/// if no subscriber holds the scope in memory, or
/// `MissingScopeAttribute` for a scope the user may not write into.
pub async fn send_message(
    state: &AppState,
    scope: &Scope,
    user: &SessionUser,
    draft: MessageDraft,
) -> Result<ChatMessage, ChatError> {
    check_membership(scope, user)?;
    let (body, media_url, poll) = validate_draft(&draft)?;

    let mut scopes = state.scopes.write().await;
    let scope_state = scopes
        .get_mut(scope)
        .ok_or_else(|| ChatError::ScopeNotLoaded(scope.clone()))?;

    let msg = ChatMessage {
        id: Uuid::new_v4(),
        scope: scope.clone(),
        author_id: user.id,
        author_name: user.name.clone(),
        author_role: user.role,
        kind: draft.kind,
        body,
        media_url,
        poll,
        created_at: now_ms(),
        edited: false,
        rev: 1,
    };

    let result = msg.clone();
    scope_state.dirty.insert(msg.id);
    scope_state.messages.insert(msg.id, msg);
    broadcast_snapshot(scope, scope_state);

    Ok(result)
}

/// Normalize and validate a draft: per kind, exactly one of {body,
/// media url, poll} is meaningful.
fn validate_draft(draft: &MessageDraft) -> Result<(String, Option<String>, Option<PollPayload>), ChatError> {
    match draft.kind {
        MessageKind::Text => {
            let body = draft.body.trim();
            if body.is_empty() {
                return Err(ChatError::EmptyBody);
            }
            Ok((body.to_string(), None, None))
        }
        MessageKind::Image | MessageKind::Video | MessageKind::Gif => {
            let url = draft
                .media_url
                .as_deref()
                .map(str::trim)
                .filter(|u| !u.is_empty())
                .ok_or(ChatError::MissingMedia { kind: draft.kind.as_str() })?;
            Ok((String::new(), Some(url.to_string()), None))
        }
        MessageKind::Poll => {
            let Some(poll) = &draft.poll else {
                return Err(ChatError::InvalidPoll);
            };
            let labels: Vec<String> = poll
                .options
                .iter()
                .map(|l| l.trim().to_string())
                .filter(|l| !l.is_empty())
                .collect();
            if poll.question.trim().is_empty() || labels.len() < 2 {
                return Err(ChatError::InvalidPoll);
            }
            Ok((String::new(), None, Some(PollPayload::new(poll.question.trim(), &labels))))
        }
    }
}

// =============================================================================
// EDIT / DELETE
// =============================================================================

/// Replace the body of the user's own text message, within the edit
/// window. Sets the edited flag and broadcasts the new snapshot.
///
/// # Errors
///
/// Returns `NotFound` if the message vanished, `NotAuthor`, `NotText`,
/// or `EditWindowClosed` when policy refuses the edit.
pub async fn edit_message(
    state: &AppState,
    scope: &Scope,
    user: &SessionUser,
    message_id: Uuid,
    new_body: &str,
) -> Result<ChatMessage, ChatError> {
    edit_message_at(state, scope, user, message_id, new_body, now_ms()).await
}

/// Internal: edit with explicit timestamp (for testing the window).
pub(crate) async fn edit_message_at(
    state: &AppState,
    scope: &Scope,
    user: &SessionUser,
    message_id: Uuid,
    new_body: &str,
    now_ms: i64,
) -> Result<ChatMessage, ChatError> {
    let body = new_body.trim();
    if body.is_empty() {
        return Err(ChatError::EmptyBody);
    }

    let mut scopes = state.scopes.write().await;
    let scope_state = scopes
        .get_mut(scope)
        .ok_or_else(|| ChatError::ScopeNotLoaded(scope.clone()))?;
    let msg = scope_state
        .messages
        .get_mut(&message_id)
        .ok_or(ChatError::NotFound(message_id))?;

    if msg.author_id != user.id {
        return Err(ChatError::NotAuthor { action: "edit" });
    }
    if msg.kind != MessageKind::Text {
        return Err(ChatError::NotText);
    }
    let elapsed_ms = now_ms - msg.created_at;
    if elapsed_ms >= EDIT_WINDOW_MS {
        return Err(ChatError::EditWindowClosed { elapsed_ms });
    }

    msg.body = body.to_string();
    msg.edited = true;
    msg.rev += 1;
    let result = msg.clone();

    scope_state.dirty.insert(message_id);
    broadcast_snapshot(scope, scope_state);

    Ok(result)
}

/// Delete the user's own message. Removes it from memory at once and
/// leaves a tombstone; the database row is deleted by the serialized
/// flush path, never alongside an in-flight upsert of the same row.
/// Deleting an already-deleted message reports `NotFound`; the
/// dispatch layer treats that as already-resolved.
///
/// # Errors
///
/// Returns `NotFound` or `NotAuthor`.
pub async fn remove_message(
    state: &AppState,
    scope: &Scope,
    user: &SessionUser,
    message_id: Uuid,
) -> Result<(), ChatError> {
    let mut scopes = state.scopes.write().await;
    let scope_state = scopes
        .get_mut(scope)
        .ok_or_else(|| ChatError::ScopeNotLoaded(scope.clone()))?;

    let Some(msg) = scope_state.messages.get(&message_id) else {
        return Err(ChatError::NotFound(message_id));
    };
    if msg.author_id != user.id {
        return Err(ChatError::NotAuthor { action: "delete" });
    }

    scope_state.messages.remove(&message_id);
    scope_state.dirty.remove(&message_id);
    scope_state.deleted.insert(message_id);
    broadcast_snapshot(scope, scope_state);

    Ok(())
}

// =============================================================================
// SNAPSHOT / BROADCAST
// =============================================================================

/// Materialize the complete ordered snapshot for a scope: ascending by
/// server timestamp, ties broken by id. Ids are unique by construction
/// (the map is keyed on them).
pub(crate) fn snapshot_of(scope_state: &ScopeState) -> Snapshot {
    let mut messages: Vec<ChatMessage> = scope_state.messages.values().cloned().collect();
    messages.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
    Snapshot::new(messages)
}

/// Rebuild and fan the snapshot out to every subscriber of the scope.
/// Best-effort: a subscriber with a full channel is skipped — the next
/// delivery carries the complete state anyway.
pub(crate) fn broadcast_snapshot(scope: &Scope, scope_state: &ScopeState) {
    let snapshot = snapshot_of(scope_state);
    for (client_id, tx) in &scope_state.subscribers {
        let delivery = SnapshotDelivery { scope: scope.clone(), snapshot: Snapshot::clone(&snapshot) };
        if tx.try_send(delivery).is_err() {
            warn!(%scope, %client_id, "subscriber channel full or closed; skipping delivery");
        }
    }
}

// =============================================================================
// PERSISTENCE HELPERS
// =============================================================================

async fn fetch_scope_messages(pool: &PgPool, scope: &Scope) -> Result<HashMap<Uuid, ChatMessage>, sqlx::Error> {
    // Unordered fetch; ordering happens in memory at snapshot time.
    let rows = sqlx::query_as::<
        _,
        (
            Uuid,
            Uuid,
            String,
            String,
            String,
            String,
            Option<String>,
            Option<serde_json::Value>,
            i64,
            bool,
            i32,
        ),
    >(
        "SELECT id, author_id, author_name, author_role, kind, body, media_url, poll, created_at, edited, rev \
         FROM messages WHERE scope_kind = $1 AND scope_key IS NOT DISTINCT FROM $2",
    )
    .bind(scope.kind_str())
    .bind(scope.key())
    .fetch_all(pool)
    .await?;

    let mut messages = HashMap::new();
    for (id, author_id, author_name, author_role, kind, body, media_url, poll, created_at, edited, rev) in rows {
        let Some(author_role) = Role::parse(&author_role) else {
            warn!(%id, author_role, "skipping message with unknown role");
            continue;
        };
        let Some(kind) = MessageKind::parse(&kind) else {
            warn!(%id, kind, "skipping message with unknown kind");
            continue;
        };
        let poll = poll.and_then(|v| serde_json::from_value::<PollPayload>(v).ok());
        messages.insert(
            id,
            ChatMessage {
                id,
                scope: scope.clone(),
                author_id,
                author_name,
                author_role,
                kind,
                body,
                media_url,
                poll,
                created_at,
                edited,
                rev,
            },
        );
    }
    Ok(messages)
}

/// Batch upsert messages to Postgres.
pub async fn flush_messages(pool: &PgPool, messages: &[ChatMessage]) -> Result<(), sqlx::Error> {
    for msg in messages {
        let poll = msg
            .poll
            .as_ref()
            .map(|p| serde_json::to_value(p).unwrap_or_default());
        sqlx::query(
            "INSERT INTO messages (id, scope_kind, scope_key, author_id, author_name, author_role, kind, body, media_url, poll, created_at, edited, rev) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13) \
             ON CONFLICT (id) DO UPDATE SET \
                 body = EXCLUDED.body, media_url = EXCLUDED.media_url, poll = EXCLUDED.poll, \
                 edited = EXCLUDED.edited, rev = EXCLUDED.rev",
        )
        .bind(msg.id)
        .bind(msg.scope.kind_str())
        .bind(msg.scope.key())
        .bind(msg.author_id)
        .bind(&msg.author_name)
        .bind(msg.author_role.as_str())
        .bind(msg.kind.as_str())
        .bind(&msg.body)
        .bind(&msg.media_url)
        .bind(&poll)
        .bind(msg.created_at)
        .bind(msg.edited)
        .bind(msg.rev)
        .execute(pool)
        .await?;
    }
    Ok(())
}

/// Batch delete tombstoned message rows.
pub async fn delete_messages(pool: &PgPool, ids: &[Uuid]) -> Result<(), sqlx::Error> {
    if ids.is_empty() {
        return Ok(());
    }
    sqlx::query("DELETE FROM messages WHERE id = ANY($1)")
        .bind(ids)
        .execute(pool)
        .await?;
    Ok(())
}

#[cfg(test)]
#[path = "chat_test.rs"]
mod tests;
