//! Session and WS-ticket management.
//!
//! ARCHITECTURE
//! ============
//! HTTP auth uses long-lived session tokens, while websocket upgrades
//! use one-time short-lived tickets to avoid sending cookies over WS
//! query params. The identity provider itself is out of scope; login
//! upserts a user record and this module owns everything after that.
//! The current user is re-validated on every request, never cached
//! beyond the session.
//!
//! TRADE-OFFS
//! ==========
//! Ticket consumption is destructive (`DELETE ... RETURNING`) to
//! guarantee single use; this favors replay safety over reconnect
//! convenience.

use std::fmt::Write;

use rand::Rng;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::message::Role;

pub(crate) fn bytes_to_hex(bytes: &[u8]) -> String {
    let mut s = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        let _ = write!(s, "{b:02x}");
    }
    s
}

/// Generate a cryptographically random 32-byte hex token.
#[must_use]
pub fn generate_token() -> String {
    let bytes: [u8; 32] = rand::rng().random();
    bytes_to_hex(&bytes)
}

/// Generate a short-lived 16-byte hex WS ticket.
#[must_use]
pub(crate) fn generate_ws_ticket() -> String {
    let bytes: [u8; 16] = rand::rng().random();
    bytes_to_hex(&bytes)
}

/// Authenticated user as seen by the chat core.
#[derive(Debug, Clone, serde::Serialize)]
pub struct SessionUser {
    /// Unique user identifier.
    pub id: Uuid,
    /// Display name.
    pub name: String,
    /// Avatar image URL, if available.
    pub avatar_url: Option<String>,
    /// Participant role (student / mentor / company / college / admin).
    pub role: Role,
    /// Region on file; grants access to the regional chat.
    pub region: Option<String>,
    /// Institution on file; grants access to the college chat.
    pub college: Option<String>,
}

fn session_user_from_row(row: &sqlx::postgres::PgRow) -> SessionUser {
    let role: String = row.get("role");
    SessionUser {
        id: row.get("id"),
        name: row.get("name"),
        avatar_url: row.get("avatar_url"),
        role: Role::parse(&role).unwrap_or_default(),
        region: row.get("region"),
        college: row.get("college"),
    }
}

/// Upsert a user by email, returning the stored record. Stands in for
/// the external identity provider's account creation.
pub async fn upsert_user(
    pool: &PgPool,
    email: &str,
    name: &str,
    role: Role,
    region: Option<&str>,
    college: Option<&str>,
) -> Result<SessionUser, sqlx::Error> {
    let row = sqlx::query(
        "INSERT INTO users (id, email, name, role, region, college)
         VALUES ($1, $2, $3, $4, $5, $6)
         ON CONFLICT (email) DO UPDATE SET
             name = EXCLUDED.name,
             role = EXCLUDED.role,
             region = COALESCE(EXCLUDED.region, users.region),
             college = COALESCE(EXCLUDED.college, users.college)
         RETURNING id, name, avatar_url, role, region, college",
    )
    .bind(Uuid::new_v4())
    .bind(email)
    .bind(name)
    .bind(role.as_str())
    .bind(region)
    .bind(college)
    .fetch_one(pool)
    .await?;

    Ok(session_user_from_row(&row))
}

/// Create a session for the given user, returning the token.
pub async fn create_session(pool: &PgPool, user_id: Uuid) -> Result<String, sqlx::Error> {
    let token = generate_token();
    sqlx::query("INSERT INTO sessions (token, user_id) VALUES ($1, $2)")
        .bind(&token)
        .bind(user_id)
        .execute(pool)
        .await?;
    Ok(token)
}

/// Validate a session token and return the associated user.
pub async fn validate_session(pool: &PgPool, token: &str) -> Result<Option<SessionUser>, sqlx::Error> {
    let row = sqlx::query(
        r"SELECT u.id, u.name, u.avatar_url, u.role, u.region, u.college
          FROM sessions s
          JOIN users u ON u.id = s.user_id
          WHERE s.token = $1 AND s.expires_at > now()",
    )
    .bind(token)
    .fetch_optional(pool)
    .await?;

    Ok(row.map(|r| session_user_from_row(&r)))
}

/// Delete a session by token.
pub async fn delete_session(pool: &PgPool, token: &str) -> Result<(), sqlx::Error> {
    sqlx::query("DELETE FROM sessions WHERE token = $1")
        .bind(token)
        .execute(pool)
        .await?;
    Ok(())
}

/// Fetch a user by id (used after WS ticket consumption).
pub async fn fetch_user(pool: &PgPool, user_id: Uuid) -> Result<Option<SessionUser>, sqlx::Error> {
    let row = sqlx::query("SELECT id, name, avatar_url, role, region, college FROM users WHERE id = $1")
        .bind(user_id)
        .fetch_optional(pool)
        .await?;
    Ok(row.map(|r| session_user_from_row(&r)))
}

/// Create a short-lived WS ticket for the given user.
pub async fn create_ws_ticket(pool: &PgPool, user_id: Uuid) -> Result<String, sqlx::Error> {
    let ticket = generate_ws_ticket();
    sqlx::query("INSERT INTO ws_tickets (ticket, user_id) VALUES ($1, $2)")
        .bind(&ticket)
        .bind(user_id)
        .execute(pool)
        .await?;
    Ok(ticket)
}

/// Consume a WS ticket atomically, returning the `user_id` if valid.
pub async fn consume_ws_ticket(pool: &PgPool, ticket: &str) -> Result<Option<Uuid>, sqlx::Error> {
    let row = sqlx::query("DELETE FROM ws_tickets WHERE ticket = $1 AND expires_at > now() RETURNING user_id")
        .bind(ticket)
        .fetch_optional(pool)
        .await?;

    Ok(row.map(|r| r.get("user_id")))
}

#[cfg(test)]
#[path = "session_test.rs"]
mod tests;
