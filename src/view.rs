//! Chat view controller — per-connection view state machine.
//!
//! DESIGN
//! ======
//! Each open chat view moves `Loading → Ready → Closed`. The first
//! snapshot delivery makes it Ready; every later delivery replaces the
//! whole visible list (no incremental patching). Teardown closes the
//! view exactly once, which is what gates the single unsubscribe call.
//!
//! Auto-scroll ("follow") fires only when the viewport was already
//! within `SCROLL_PIN_THRESHOLD_PX` of the bottom before the update, so
//! a reader who scrolled up into history is never yanked back down. The
//! client reports its offset via `view:scroll` frames.
//!
//! Permission checks here are the UX affordance; `services::chat`
//! re-enforces authorship and the edit window on every write.

use uuid::Uuid;

use crate::message::{ChatMessage, MessageKind};
use crate::state::Snapshot;

/// Edits are offered for this long after a message is created.
pub const EDIT_WINDOW_MS: i64 = 3 * 60 * 1000;

/// A view counts as "at the bottom" within this many pixels of it.
pub const SCROLL_PIN_THRESHOLD_PX: f64 = 120.0;

// =============================================================================
// STATE MACHINE
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewPhase {
    /// Subscribed, no snapshot delivered yet.
    Loading,
    /// Has a snapshot; renders the list.
    Ready,
    /// Unsubscribed. Terminal.
    Closed,
}

pub struct ChatView {
    phase: ViewPhase,
    snapshot: Snapshot,
    /// Client-reported distance from the bottom of the scrollback, px.
    bottom_offset_px: f64,
}

impl ChatView {
    #[must_use]
    pub fn new() -> Self {
        Self { phase: ViewPhase::Loading, snapshot: Snapshot::default(), bottom_offset_px: 0.0 }
    }

    #[must_use]
    pub fn phase(&self) -> ViewPhase {
        self.phase
    }

    /// Apply a snapshot delivery. Returns the follow decision: `true`
    /// when the viewport should auto-scroll to the new bottom, decided
    /// from the offset as it was *before* this update.
    ///
    /// Deliveries after close are ignored (in-flight fan-out racing a
    /// teardown).
    pub fn apply_snapshot(&mut self, snapshot: Snapshot) -> bool {
        if self.phase == ViewPhase::Closed {
            return false;
        }
        let follow = self.bottom_offset_px <= SCROLL_PIN_THRESHOLD_PX;
        self.snapshot = snapshot;
        self.phase = ViewPhase::Ready;
        follow
    }

    pub fn set_bottom_offset(&mut self, px: f64) {
        if self.phase != ViewPhase::Closed {
            self.bottom_offset_px = px.max(0.0);
        }
    }

    /// Close the view. Returns `true` on the transition, `false` if it
    /// was already closed — callers unsubscribe only on `true`.
    pub fn close(&mut self) -> bool {
        if self.phase == ViewPhase::Closed {
            return false;
        }
        self.phase = ViewPhase::Closed;
        true
    }

    /// Currently visible messages.
    #[must_use]
    pub fn messages(&self) -> &[ChatMessage] {
        &self.snapshot
    }

    /// Look up a visible message by id.
    #[must_use]
    pub fn message(&self, id: Uuid) -> Option<&ChatMessage> {
        self.snapshot.iter().find(|m| m.id == id)
    }

    // =========================================================================
    // PERMISSION POLICY (advisory)
    // =========================================================================

    /// Edit is offered to the author of a text message while the edit
    /// window is still open.
    #[must_use]
    pub fn can_edit(&self, message_id: Uuid, user_id: Uuid, now_ms: i64) -> bool {
        let Some(msg) = self.message(message_id) else {
            return false;
        };
        msg.author_id == user_id
            && msg.kind == MessageKind::Text
            && now_ms - msg.created_at < EDIT_WINDOW_MS
    }

    /// Delete is offered to the author only; no time window.
    #[must_use]
    pub fn can_delete(&self, message_id: Uuid, user_id: Uuid) -> bool {
        self.message(message_id)
            .is_some_and(|msg| msg.author_id == user_id)
    }
}

impl Default for ChatView {
    fn default() -> Self {
        Self::new()
    }
}

/// Send gate: blocked while rate-limited, with no authenticated user
/// bound, or when the user lacks the scope attribute.
#[must_use]
pub fn send_allowed(user_bound: bool, has_scope_attr: bool, rate_limited: bool) -> bool {
    user_bound && has_scope_attr && !rate_limited
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
#[path = "view_test.rs"]
mod tests;
