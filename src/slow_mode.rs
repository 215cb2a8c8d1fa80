//! Slow mode — minimum interval between a user's consecutive sends.
//!
//! DESIGN
//! ======
//! Per-scope settings (enabled flag + interval) over a map of last
//! accepted send timestamps keyed by `(scope, user)`. Pure arithmetic
//! over local state; no I/O is possible here. Callers claim the slot
//! with a single check-and-record before the store write and refund it
//! if the write fails, so a failed send never costs the user their
//! slot, and two connections of the same user cannot both pass the
//! check inside one interval.
//!
//! The limiter is keyed by user id on the server rather than per browser
//! profile, so a second tab or device shares the same cooldown.
//!
//! Settings are mutable at runtime (operator action) with env-var
//! defaults. Changing the interval mid-cooldown re-derives the remaining
//! time from the new interval on the next check.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::message::Scope;

const DEFAULT_SLOW_MODE_ENABLED: bool = false;
const DEFAULT_SLOW_MODE_INTERVAL_SECS: u32 = 5;

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
// PURE ARITHMETIC
// =============================================================================

/// Seconds of cooldown left: `ceil(interval - elapsed)`, floored at zero.
#[must_use]
pub fn remaining_secs(now_ms: i64, last_send_ms: i64, interval_secs: u32) -> u32 {
    let cooldown_ms = i64::from(interval_secs) * 1000 - (now_ms - last_send_ms);
    if cooldown_ms <= 0 {
        return 0;
    }
    u32::try_from((cooldown_ms + 999) / 1000).unwrap_or(u32::MAX)
}

/// Whether a send is allowed. A user with no recorded send is always
/// eligible.
#[must_use]
pub fn can_send(now_ms: i64, last_send_ms: Option<i64>, interval_secs: u32, enabled: bool) -> bool {
    if !enabled {
        return true;
    }
    let Some(last) = last_send_ms else {
        return true;
    };
    remaining_secs(now_ms, last, interval_secs) == 0
}

// =============================================================================
// ERROR TYPE
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum SlowModeError {
    #[error("slow mode active: retry in {remaining_secs}s")]
    Cooldown { remaining_secs: u32 },
}

impl crate::frame::ErrorCode for SlowModeError {
    fn error_code(&self) -> &'static str {
        "E_SLOW_MODE"
    }

    fn retryable(&self) -> bool {
        true
    }
}

// =============================================================================
// SETTINGS
// =============================================================================

/// Per-scope slow-mode configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlowModeSettings {
    pub enabled: bool,
    /// Minimum seconds between a user's consecutive sends. Positive.
    pub interval_secs: u32,
}

impl SlowModeSettings {
    fn from_env() -> Self {
        Self {
            enabled: env_parse("SLOW_MODE_ENABLED", DEFAULT_SLOW_MODE_ENABLED),
            interval_secs: env_parse("SLOW_MODE_INTERVAL_SECS", DEFAULT_SLOW_MODE_INTERVAL_SECS).max(1),
        }
    }
}

// =============================================================================
// LIMITER
// =============================================================================

#[derive(Clone)]
pub struct SlowMode {
    inner: Arc<Mutex<SlowModeInner>>,
    defaults: SlowModeSettings,
}

struct SlowModeInner {
    /// Operator overrides per scope; scopes not present use the defaults.
    settings: HashMap<Scope, SlowModeSettings>,
    /// Timestamp (ms) of the last accepted send per `(scope, user)`.
    last_send: HashMap<(Scope, Uuid), i64>,
}

impl SlowMode {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(SlowModeInner { settings: HashMap::new(), last_send: HashMap::new() })),
            defaults: SlowModeSettings::from_env(),
        }
    }

    /// Effective settings for a scope.
    #[must_use]
    pub fn settings(&self, scope: &Scope) -> SlowModeSettings {
        let inner = self
            .inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        inner.settings.get(scope).copied().unwrap_or(self.defaults)
    }

    /// Replace a scope's settings (operator action).
    pub fn configure(&self, scope: &Scope, settings: SlowModeSettings) {
        let mut inner = self
            .inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        inner.settings.insert(
            scope.clone(),
            SlowModeSettings { enabled: settings.enabled, interval_secs: settings.interval_secs.max(1) },
        );
    }

    /// Claim the user's send slot for this scope. Check and record
    /// happen under one lock acquisition, so concurrent connections of
    /// the same user serialize here and at most one claim succeeds per
    /// interval. Returns the recorded stamp, for `refund`.
    ///
    /// # Errors
    ///
    /// Returns `Cooldown` with the seconds left when the interval has
    /// not elapsed.
    pub fn check_and_record(&self, scope: &Scope, user_id: Uuid) -> Result<i64, SlowModeError> {
        self.check_and_record_at(scope, user_id, crate::frame::now_ms())
    }

    /// Internal: claim with explicit timestamp (for testing).
    pub(crate) fn check_and_record_at(&self, scope: &Scope, user_id: Uuid, now_ms: i64) -> Result<i64, SlowModeError> {
        let mut inner = self
            .inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let settings = inner.settings.get(scope).copied().unwrap_or(self.defaults);
        let last = inner.last_send.get(&(scope.clone(), user_id)).copied();

        if !can_send(now_ms, last, settings.interval_secs, settings.enabled) {
            // `can_send` returned false, so a last timestamp exists.
            let remaining = remaining_secs(now_ms, last.unwrap_or(now_ms), settings.interval_secs);
            return Err(SlowModeError::Cooldown { remaining_secs: remaining });
        }
        inner.last_send.insert((scope.clone(), user_id), now_ms);
        Ok(now_ms)
    }

    /// Give a claimed slot back after the store write failed. No-op
    /// unless the recorded timestamp is still the stamp returned by the
    /// claim, so a newer successful send is never erased.
    pub fn refund(&self, scope: &Scope, user_id: Uuid, stamp: i64) {
        let mut inner = self
            .inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let key = (scope.clone(), user_id);
        if inner.last_send.get(&key) == Some(&stamp) {
            inner.last_send.remove(&key);
        }
    }
}

impl Default for SlowMode {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
#[path = "slow_mode_test.rs"]
mod tests;
