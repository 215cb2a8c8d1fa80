//! WebSocket handler — chat frame dispatch and snapshot delivery.
//!
//! DESIGN
//! ======
//! On upgrade, consumes a one-time ticket, loads the user, and enters a
//! `select!` loop:
//! - Incoming client frames → parse + dispatch by syscall prefix
//! - Snapshot deliveries from the chat service → push as `chat:snapshot`
//!
//! Handler functions are pure business logic — they validate, mutate state,
//! and return an `Outcome`. The dispatch layer owns all outbound concerns.
//! Each connection holds one `ChatView` which tracks the render phase and
//! the scroll position, so every snapshot push carries a `follow` hint
//! telling the client whether to stay pinned to the bottom.
//!
//! LIFECYCLE
//! =========
//! 1. Upgrade → send `session:connected` with `client_id` + user identity
//! 2. Client sends `chat:join` → hydrate + subscribe → snapshot reply
//! 3. Mutations (`chat:send` etc.) fan out snapshots to all subscribers
//! 4. Close → part scope, close the view

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use std::collections::HashMap;
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::frame::{Data, Frame};
use crate::message::{Role, Scope};
use crate::services::chat::{self, ChatError, MessageDraft};
use crate::services::poll::{self, VoteError};
use crate::services::session::{self, SessionUser};
use crate::slow_mode::SlowModeSettings;
use crate::state::{AppState, Snapshot, SnapshotDelivery};
use crate::view::ChatView;

// =============================================================================
// OUTCOME
// =============================================================================

/// Result returned by handler functions. The dispatch layer uses this to
/// decide what the sender receives — handlers never send frames directly.
/// Peers are never addressed here: they learn about mutations through the
/// snapshot fan-out, not through per-operation broadcasts.
enum Outcome {
    /// Send done+data to sender only.
    Reply(Data),
    /// Send empty done to sender only.
    Done,
    /// No response at all (scroll reports).
    Silent,
}

// =============================================================================
// UPGRADE
// =============================================================================

pub async fn handle_ws(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
    ws: WebSocketUpgrade,
) -> Response {
    let Some(ticket) = params.get("ticket") else {
        return (StatusCode::UNAUTHORIZED, "ticket required").into_response();
    };

    let user_id = match session::consume_ws_ticket(&state.pool, ticket).await {
        Ok(Some(uid)) => uid,
        Ok(None) => return (StatusCode::UNAUTHORIZED, "invalid or expired ticket").into_response(),
        Err(e) => {
            tracing::error!(error = %e, "ws ticket validation failed");
            return (StatusCode::INTERNAL_SERVER_ERROR, "ticket validation error").into_response();
        }
    };

    let user = match session::fetch_user(&state.pool, user_id).await {
        Ok(Some(user)) => user,
        Ok(None) => return (StatusCode::UNAUTHORIZED, "unknown user").into_response(),
        Err(e) => {
            tracing::error!(error = %e, "ws user lookup failed");
            return (StatusCode::INTERNAL_SERVER_ERROR, "user lookup error").into_response();
        }
    };

    ws.on_upgrade(move |socket| run_ws(socket, state, user))
}

// =============================================================================
// CONNECTION
// =============================================================================

async fn run_ws(mut socket: WebSocket, state: AppState, user: SessionUser) {
    let client_id = Uuid::new_v4();

    // Per-connection channel for snapshot deliveries from the chat service.
    let (client_tx, mut client_rx) = mpsc::channel::<SnapshotDelivery>(16);

    let welcome = Frame::request("session:connected", Data::new())
        .with_data("client_id", client_id.to_string())
        .with_data("user_id", user.id.to_string())
        .with_data("role", user.role.as_str());
    if send_frame(&mut socket, &welcome).await.is_err() {
        return;
    }

    info!(%client_id, user_id = %user.id, "ws: client connected");

    // Which scope this client has joined, and its render state.
    let mut current_scope: Option<Scope> = None;
    let mut view = ChatView::new();

    loop {
        tokio::select! {
            msg = socket.recv() => {
                let Some(msg) = msg else { break };
                let Ok(msg) = msg else { break };
                match msg {
                    Message::Text(text) => {
                        let frames =
                            process_inbound_text(&state, &mut current_scope, &mut view, client_id, &user, &client_tx, &text).await;
                        let mut closed = false;
                        for frame in frames {
                            if send_frame(&mut socket, &frame).await.is_err() {
                                closed = true;
                                break;
                            }
                        }
                        if closed {
                            break;
                        }
                    }
                    Message::Close(_) => break,
                    _ => {}
                }
            }
            Some(delivery) = client_rx.recv() => {
                let Some(frame) = delivery_frame(&mut view, current_scope.as_ref(), delivery) else { continue };
                if send_frame(&mut socket, &frame).await.is_err() {
                    break;
                }
            }
        }
    }

    if let Some(scope) = current_scope {
        chat::part_scope(&state, &scope, client_id).await;
    }
    view.close();
    info!(%client_id, "ws: client disconnected");
}

/// Gate one queued delivery against the currently joined scope. A
/// delivery for another scope raced a `chat:join` switch and is
/// dropped; it must never reach the view under the new scope's label.
fn delivery_frame(view: &mut ChatView, current_scope: Option<&Scope>, delivery: SnapshotDelivery) -> Option<Frame> {
    let scope = current_scope?;
    if delivery.scope != *scope {
        return None;
    }
    Some(snapshot_frame(view, scope, delivery.snapshot))
}

/// Apply a snapshot to the connection's view and build the delivery
/// frame. The `follow` flag reflects the scroll position at the moment
/// the snapshot arrived, so a reader scrolled up is not yanked down.
fn snapshot_frame(view: &mut ChatView, scope: &Scope, snapshot: Snapshot) -> Frame {
    let follow = view.apply_snapshot(snapshot);
    Frame::request("chat:snapshot", Data::new())
        .with_scope(scope.clone())
        .with_data("messages", serde_json::to_value(view.messages()).unwrap_or_default())
        .with_data("follow", follow)
}

// =============================================================================
// FRAME DISPATCH
// =============================================================================

/// Parse and process one inbound text frame; return frames for the sender.
///
/// Kept separate from the websocket transport so tests can exercise the
/// full dispatch path without a socket.
async fn process_inbound_text(
    state: &AppState,
    current_scope: &mut Option<Scope>,
    view: &mut ChatView,
    client_id: Uuid,
    user: &SessionUser,
    client_tx: &mpsc::Sender<SnapshotDelivery>,
    text: &str,
) -> Vec<Frame> {
    let mut req: Frame = match serde_json::from_str(text) {
        Ok(r) => r,
        Err(e) => {
            warn!(%client_id, error = %e, "ws: invalid inbound frame");
            let err = Frame::request("gateway:error", Data::new()).with_data("message", format!("invalid json: {e}"));
            return vec![err];
        }
    };

    // Stamp the authenticated user as `from`; never trust the client's claim.
    req.from = Some(user.id.to_string());

    let prefix = req.prefix();
    let is_scroll = req.syscall == "view:scroll";
    if !is_scroll {
        info!(%client_id, id = %req.id, syscall = %req.syscall, status = ?req.status, "ws: recv frame");
    }

    let result = match prefix {
        "chat" => handle_chat(state, current_scope, view, client_id, user, client_tx, &req).await,
        "view" => Ok(handle_view(view, &req)),
        "slowmode" => handle_slow_mode(state, current_scope.as_ref(), user, &req),
        _ => Err(req.error(format!("unknown prefix: {prefix}"))),
    };

    match result {
        Ok(Outcome::Reply(data)) => vec![req.done_with(data)],
        Ok(Outcome::Done) => vec![req.done()],
        Ok(Outcome::Silent) => vec![],
        Err(err_frame) => vec![err_frame],
    }
}

// =============================================================================
// CHAT HANDLERS
// =============================================================================

async fn handle_chat(
    state: &AppState,
    current_scope: &mut Option<Scope>,
    view: &mut ChatView,
    client_id: Uuid,
    user: &SessionUser,
    client_tx: &mpsc::Sender<SnapshotDelivery>,
    req: &Frame,
) -> Result<Outcome, Frame> {
    let op = req.op();

    if op == "join" {
        let Some(scope) = req.scope.clone() else {
            return Err(req.error("scope required"));
        };

        // Part the previous scope first; one live subscription per socket.
        if let Some(old_scope) = current_scope.take() {
            chat::part_scope(state, &old_scope, client_id).await;
        }

        return match chat::join_scope(state, &scope, user, client_id, client_tx.clone()).await {
            Ok(snapshot) => {
                *current_scope = Some(scope.clone());
                let follow = view.apply_snapshot(snapshot);

                let mut reply = Data::new();
                reply.insert("messages".into(), serde_json::to_value(view.messages()).unwrap_or_default());
                reply.insert("follow".into(), serde_json::json!(follow));
                let settings = state.slow_mode.settings(&scope);
                reply.insert("slow_mode".into(), serde_json::to_value(settings).unwrap_or_default());
                Ok(Outcome::Reply(reply))
            }
            Err(e) => Err(req.error_from(&e)),
        };
    }

    // Every other chat op requires a joined scope.
    let Some(scope) = current_scope.clone() else {
        return Err(req.error("must join a scope first"));
    };

    match op {
        "send" => {
            let draft: MessageDraft = match serde_json::to_value(&req.data).and_then(serde_json::from_value) {
                Ok(d) => d,
                Err(e) => return Err(req.error(format!("invalid draft: {e}"))),
            };

            // Claim the slow-mode slot up front; a concurrent connection
            // of the same user cannot also pass within the interval.
            let stamp = match state.slow_mode.check_and_record(&scope, user.id) {
                Ok(stamp) => stamp,
                Err(e) => return Err(req.error_from(&e)),
            };

            match chat::send_message(state, &scope, user, draft).await {
                Ok(msg) => {
                    let mut data = Data::new();
                    data.insert("message".into(), serde_json::to_value(&msg).unwrap_or_default());
                    Ok(Outcome::Reply(data))
                }
                Err(e) => {
                    // A rejected send must not cost the user their slot.
                    state.slow_mode.refund(&scope, user.id, stamp);
                    Err(req.error_from(&e))
                }
            }
        }
        "edit" => {
            let Some(message_id) = parse_message_id(req) else {
                return Err(req.error("message_id required"));
            };
            let body = req.data.get("body").and_then(|v| v.as_str()).unwrap_or("");

            match chat::edit_message(state, &scope, user, message_id, body).await {
                Ok(msg) => {
                    let mut data = Data::new();
                    data.insert("message".into(), serde_json::to_value(&msg).unwrap_or_default());
                    Ok(Outcome::Reply(data))
                }
                Err(e) => Err(req.error_from(&e)),
            }
        }
        "delete" => {
            let Some(message_id) = parse_message_id(req) else {
                return Err(req.error("message_id required"));
            };

            match chat::remove_message(state, &scope, user, message_id).await {
                Ok(()) => Ok(Outcome::Done),
                // EDGE: deleting a message that is already gone is the
                // outcome the client asked for, not a failure.
                Err(ChatError::NotFound(_)) => Ok(Outcome::Done),
                Err(e) => Err(req.error_from(&e)),
            }
        }
        "vote" => {
            let Some(message_id) = parse_message_id(req) else {
                return Err(req.error("message_id required"));
            };
            let Some(option_id) = req.data.get("option_id").and_then(|v| v.as_str()) else {
                return Err(req.error("option_id required"));
            };

            match poll::cast_vote(state, &scope, message_id, option_id, user.id).await {
                Ok(msg) => {
                    let mut data = Data::new();
                    data.insert("message".into(), serde_json::to_value(&msg).unwrap_or_default());
                    Ok(Outcome::Reply(data))
                }
                // EDGE: a duplicate vote keeps the tally untouched; tell
                // the sender rather than erroring.
                Err(VoteError::AlreadyVoted) => {
                    let mut data = Data::new();
                    data.insert("already_voted".into(), serde_json::json!(true));
                    Ok(Outcome::Reply(data))
                }
                Err(e) => Err(req.error_from(&e)),
            }
        }
        _ => Err(req.error(format!("unknown chat op: {op}"))),
    }
}

// =============================================================================
// VIEW HANDLER
// =============================================================================

/// Scroll position reports. Fire-and-forget: the offset only matters for
/// the `follow` decision on the next snapshot push.
fn handle_view(view: &mut ChatView, req: &Frame) -> Outcome {
    if req.op() != "scroll" {
        return Outcome::Done;
    }
    let px = req
        .data
        .get("bottom_offset_px")
        .and_then(serde_json::Value::as_f64)
        .unwrap_or(0.0);
    view.set_bottom_offset(px);
    Outcome::Silent
}

// =============================================================================
// SLOW MODE HANDLER
// =============================================================================

fn handle_slow_mode(
    state: &AppState,
    current_scope: Option<&Scope>,
    user: &SessionUser,
    req: &Frame,
) -> Result<Outcome, Frame> {
    let Some(scope) = req.scope.as_ref().or(current_scope) else {
        return Err(req.error("scope required"));
    };

    match req.op() {
        "get" => {
            let settings = state.slow_mode.settings(scope);
            let mut data = Data::new();
            data.insert("slow_mode".into(), serde_json::to_value(settings).unwrap_or_default());
            Ok(Outcome::Reply(data))
        }
        "set" => {
            if user.role != Role::Admin {
                return Err(req.error("only admins may configure slow mode"));
            }
            let enabled = req
                .data
                .get("enabled")
                .and_then(serde_json::Value::as_bool)
                .unwrap_or(false);
            let interval_secs = req
                .data
                .get("interval_secs")
                .and_then(serde_json::Value::as_u64)
                .and_then(|v| u32::try_from(v).ok())
                .unwrap_or(1);

            let settings = SlowModeSettings { enabled, interval_secs };
            state.slow_mode.configure(scope, settings);
            let applied = state.slow_mode.settings(scope);
            info!(%scope, enabled = applied.enabled, interval_secs = applied.interval_secs, "slow mode configured");

            let mut data = Data::new();
            data.insert("slow_mode".into(), serde_json::to_value(applied).unwrap_or_default());
            Ok(Outcome::Reply(data))
        }
        op => Err(req.error(format!("unknown slowmode op: {op}"))),
    }
}

// =============================================================================
// HELPERS
// =============================================================================

fn parse_message_id(req: &Frame) -> Option<Uuid> {
    req.data
        .get("message_id")
        .and_then(|v| v.as_str())
        .and_then(|s| s.parse().ok())
}

async fn send_frame(socket: &mut WebSocket, frame: &Frame) -> Result<(), ()> {
    let json = match serde_json::to_string(frame) {
        Ok(j) => j,
        Err(e) => {
            warn!(error = %e, "ws: failed to serialize frame");
            return Err(());
        }
    };
    if frame.status == crate::frame::Status::Error {
        let code = frame.data.get("code").and_then(|v| v.as_str()).unwrap_or("-");
        let message = frame.data.get("message").and_then(|v| v.as_str()).unwrap_or("-");
        warn!(id = %frame.id, syscall = %frame.syscall, code, message, "ws: send frame status=Error");
    } else {
        info!(id = %frame.id, syscall = %frame.syscall, status = ?frame.status, "ws: send frame");
    }
    socket.send(Message::Text(json.into())).await.map_err(|_| ())
}

#[cfg(test)]
#[path = "ws_test.rs"]
mod tests;
