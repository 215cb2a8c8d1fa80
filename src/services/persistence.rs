//! Persistence service — pool setup and background flush for message
//! rows.
//!
//! DESIGN
//! ======
//! A background task flushes each scope's pending work (dirty upserts
//! plus tombstoned deletes), then sleeps before the next cycle, so
//! websocket handling never blocks on Postgres I/O. Every pass runs
//! under the state's flush lock, shared with the last-leaver flush in
//! `chat::part_scope`: since a tombstone outlives any upsert batch
//! snapshotted before it, the row of a deleted message is always
//! removed by the pass after the stale batch lands, never resurrected.
//!
//! ERROR HANDLING
//! ==============
//! Dirty flags are cleared only after successful writes, and only when
//! the persisted `rev` still matches the in-memory one; tombstones are
//! cleared only after the delete succeeds. This prioritizes durability
//! over duplicate flush attempts: repeated upserts are acceptable,
//! silent message loss is not.

use std::collections::HashMap;
use std::time::Duration;

use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use tokio::task::JoinHandle;
use tracing::{error, info};
use uuid::Uuid;

use crate::message::{ChatMessage, Scope};
use crate::services::chat;
use crate::state::{AppState, ScopeState};

const DEFAULT_MESSAGE_FLUSH_INTERVAL_MS: u64 = 200;
const DEFAULT_DB_MAX_CONNECTIONS: u32 = 5;
const DEFAULT_DB_ACQUIRE_TIMEOUT_SECS: u64 = 5;

fn env_parse<T>(key: &str, default: T) -> T
where
    T: std::str::FromStr + Copy,
{
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}

// =============================================================================
// POOL
// =============================================================================

/// Create the shared `PostgreSQL` pool and run embedded migrations
/// before any traffic is accepted.
///
/// # Errors
///
/// Returns an error if the connection or migrations fail.
pub async fn init_pool(database_url: &str) -> Result<PgPool, sqlx::Error> {
    let pool = PgPoolOptions::new()
        .max_connections(env_parse("DB_MAX_CONNECTIONS", DEFAULT_DB_MAX_CONNECTIONS))
        .acquire_timeout(Duration::from_secs(env_parse(
            "DB_ACQUIRE_TIMEOUT_SECS",
            DEFAULT_DB_ACQUIRE_TIMEOUT_SECS,
        )))
        .connect(database_url)
        .await?;

    sqlx::migrate!().run(&pool).await?;

    Ok(pool)
}

// =============================================================================
// FLUSH TASK
// =============================================================================

/// Spawn the background flush task. Returns a handle for shutdown.
pub fn spawn_flush_task(state: AppState) -> JoinHandle<()> {
    let flush_interval_ms = env_parse("MESSAGE_FLUSH_INTERVAL_MS", DEFAULT_MESSAGE_FLUSH_INTERVAL_MS);
    info!(flush_interval_ms, "message persistence flush configured");
    tokio::spawn(async move {
        loop {
            flush_all_pending(&state).await;
            tokio::time::sleep(Duration::from_millis(flush_interval_ms)).await;
        }
    })
}

async fn flush_all_pending(state: &AppState) {
    // One pass at a time across the whole process. A delete is issued
    // only by a pass, and a tombstone set mid-pass survives into the
    // next one, so it always lands after any stale upsert of its row.
    let _flush_guard = state.flush_lock.lock().await;

    // PHASE: SNAPSHOT PENDING WORK
    // WHY: collect immutable clones under lock, then perform I/O
    // lock-free.
    let work = {
        let scopes = state.scopes.read().await;
        collect_flush_work(&scopes)
    };

    // PHASE: FLUSH PER SCOPE + ACK
    // WHY: if a write fails we intentionally keep dirty flags and
    // tombstones for retry.
    for item in work {
        match chat::flush_messages(&state.pool, &item.messages).await {
            Ok(()) => {
                ack_flushed(state, &item.scope, &item.flushed_revs).await;
            }
            Err(e) => {
                error!(error = %e, count = item.messages.len(), scope = %item.scope, "persistence flush failed");
            }
        }

        if item.deleted_ids.is_empty() {
            continue;
        }
        match chat::delete_messages(&state.pool, &item.deleted_ids).await {
            Ok(()) => {
                ack_deleted(state, &item.scope, &item.deleted_ids).await;
            }
            Err(e) => {
                error!(error = %e, count = item.deleted_ids.len(), scope = %item.scope, "tombstone delete failed");
            }
        }
    }
}

#[derive(Debug)]
struct ScopeFlushWork {
    scope: Scope,
    messages: Vec<ChatMessage>,
    flushed_revs: Vec<(Uuid, i32)>,
    deleted_ids: Vec<Uuid>,
}

fn collect_flush_work(scopes: &HashMap<Scope, ScopeState>) -> Vec<ScopeFlushWork> {
    let mut collected = Vec::new();

    for (scope, scope_state) in scopes {
        if scope_state.dirty.is_empty() && scope_state.deleted.is_empty() {
            continue;
        }

        let messages = scope_state
            .dirty
            .iter()
            .filter_map(|id| scope_state.messages.get(id).cloned())
            .collect::<Vec<_>>();
        let revs = messages.iter().map(|msg| (msg.id, msg.rev)).collect::<Vec<_>>();
        let deleted_ids = scope_state.deleted.iter().copied().collect::<Vec<_>>();
        if messages.is_empty() && deleted_ids.is_empty() {
            continue;
        }
        collected.push(ScopeFlushWork { scope: scope.clone(), messages, flushed_revs: revs, deleted_ids });
    }

    collected
}

async fn ack_flushed(state: &AppState, scope: &Scope, flushed_revs: &[(Uuid, i32)]) {
    let mut scopes = state.scopes.write().await;
    let Some(scope_state) = scopes.get_mut(scope) else {
        return;
    };
    chat::clear_flushed_dirty_ids(scope_state, flushed_revs);
}

async fn ack_deleted(state: &AppState, scope: &Scope, deleted_ids: &[Uuid]) {
    let mut scopes = state.scopes.write().await;
    let Some(scope_state) = scopes.get_mut(scope) else {
        return;
    };
    for id in deleted_ids {
        scope_state.deleted.remove(id);
    }
}

#[cfg(test)]
pub(crate) async fn flush_all_pending_for_tests(state: &AppState) {
    flush_all_pending(state).await;
}

#[cfg(test)]
#[path = "persistence_test.rs"]
mod tests;
