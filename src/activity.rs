use std::sync::Mutex;

use time::{Duration, OffsetDateTime};

/// Inactivity window for remembered sessions.
pub const REMEMBERED_INACTIVITY_WINDOW: Duration = Duration::days(7);
/// Inactivity window for sessions without "remember me".
pub const SESSION_INACTIVITY_WINDOW: Duration = Duration::days(2);
/// Minimum spacing between two persisted interaction timestamps.
pub const DEFAULT_TOUCH_THROTTLE: Duration = Duration::seconds(30);

/// User interactions that count as activity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InteractionKind {
    PointerMove,
    KeyPress,
    Scroll,
    Touch,
    Click,
}

/// Inactivity window for the given durability choice.
#[must_use]
pub fn inactivity_window(remember_me: bool) -> Duration {
    if remember_me {
        REMEMBERED_INACTIVITY_WINDOW
    } else {
        SESSION_INACTIVITY_WINDOW
    }
}

/// Whether `last_activity` is recent enough to keep the session.
///
/// No recorded activity is never "just active": it returns `false`.
#[must_use]
pub fn is_within_inactivity_window(
    last_activity: Option<OffsetDateTime>,
    remember_me: bool,
    now: OffsetDateTime,
) -> bool {
    last_activity.is_some_and(|at| now - at < inactivity_window(remember_me))
}

/// Samples interaction events so that only one write per throttle period reaches storage.
#[derive(Debug)]
pub struct ActivityTracker {
    throttle: Duration,
    last_written: Mutex<Option<OffsetDateTime>>,
}

impl ActivityTracker {
    #[must_use]
    pub fn new(throttle: Duration) -> Self {
        Self {
            throttle,
            last_written: Mutex::new(None),
        }
    }

    /// Whether an interaction at `now` should be persisted.
    ///
    /// Claims the slot when it returns `true`, so concurrent callers inside the same
    /// throttle period get `false`.
    pub fn should_record(&self, now: OffsetDateTime) -> bool {
        let Ok(mut last) = self.last_written.lock() else {
            return true;
        };
        match *last {
            Some(prev) if now - prev < self.throttle && now >= prev => false,
            _ => {
                *last = Some(now);
                true
            }
        }
    }

    /// Forget the throttle state, e.g. after logout or a fresh login.
    pub fn reset(&self) {
        if let Ok(mut last) = self.last_written.lock() {
            *last = None;
        }
    }
}

impl Default for ActivityTracker {
    fn default() -> Self {
        Self::new(DEFAULT_TOUCH_THROTTLE)
    }
}
