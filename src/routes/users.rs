//! User profile routes.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};
use serde::Serialize;
use sqlx::Row;
use uuid::Uuid;

use super::auth::AuthUser;
use crate::state::AppState;

#[derive(Serialize)]
pub struct UserProfile {
    pub id: Uuid,
    pub name: String,
    pub avatar_url: Option<String>,
    pub role: String,
    pub region: Option<String>,
    pub college: Option<String>,
    pub member_since: Option<String>,
    pub stats: UserStats,
}

#[derive(Serialize)]
pub struct UserStats {
    pub messages_sent: i64,
    pub polls_created: i64,
    pub last_active: Option<String>,
}

/// `GET /api/users/:id/profile` — return user info with message stats.
pub async fn user_profile(
    State(state): State<AppState>,
    _auth: AuthUser,
    Path(user_id): Path<Uuid>,
) -> Result<impl IntoResponse, StatusCode> {
    let user_row = sqlx::query(
        r"SELECT id, name, avatar_url, role, region, college,
                to_char(created_at, 'YYYY-MM-DD') AS member_since
         FROM users WHERE id = $1",
    )
    .bind(user_id)
    .fetch_optional(&state.pool)
    .await
    .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?
    .ok_or(StatusCode::NOT_FOUND)?;

    // Counts persisted messages only; dirty in-memory messages lag by
    // one flush interval.
    let stats_row = sqlx::query(
        r"SELECT
               COALESCE(COUNT(*), 0)                              AS messages_sent,
               COALESCE(COUNT(*) FILTER (WHERE kind = 'poll'), 0) AS polls_created,
               to_char(
                   MAX(to_timestamp(created_at / 1000.0) AT TIME ZONE 'UTC'),
                   'YYYY-MM-DD HH24:MI'
               ) AS last_active
           FROM messages
           WHERE author_id = $1",
    )
    .bind(user_id)
    .fetch_one(&state.pool)
    .await
    .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;

    let profile = UserProfile {
        id: user_row.get("id"),
        name: user_row.get("name"),
        avatar_url: user_row.get("avatar_url"),
        role: user_row.get("role"),
        region: user_row.get("region"),
        college: user_row.get("college"),
        member_since: user_row.get("member_since"),
        stats: UserStats {
            messages_sent: stats_row.get("messages_sent"),
            polls_created: stats_row.get("polls_created"),
            last_active: stats_row.get("last_active"),
        },
    };

    Ok(Json(profile))
}
