//! Validity countdown for resolved payment requests and transfer tokens.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Tick cadence of a running timer.
pub const TICK_INTERVAL: Duration = Duration::from_secs(1);

/// Validity window of a resolved intent.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpiryWindow {
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl ExpiryWindow {
    pub fn new(created_at: DateTime<Utc>, expires_at: DateTime<Utc>) -> Self {
        Self {
            created_at,
            expires_at,
        }
    }

    /// Window of length `validity` ending at `expires_at`, for when only the
    /// expiry is known.
    pub fn ending_at(expires_at: DateTime<Utc>, validity: chrono::Duration) -> Self {
        Self {
            created_at: expires_at
                .checked_sub_signed(validity)
                .unwrap_or(DateTime::<Utc>::MIN_UTC),
            expires_at,
        }
    }

    /// Fraction of the window remaining at `now`, in `[0, 1]`.
    ///
    /// Exactly `0` at and after `expires_at`, and for empty or inverted windows.
    pub fn remaining_fraction(&self, now: DateTime<Utc>) -> f64 {
        let total = (self.expires_at - self.created_at).num_milliseconds();
        if total <= 0 || now >= self.expires_at {
            return 0.0;
        }
        let elapsed = (now - self.created_at).num_milliseconds();
        (1.0 - elapsed as f64 / total as f64).clamp(0.0, 1.0)
    }
}

/// Result of one timer tick.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ExpiryTick {
    pub fraction: f64,
    /// True on exactly one tick: the first that reaches zero.
    pub expired: bool,
}

/// Countdown state owned by one timer.
///
/// The fired flag lives here, beside the window it belongs to. A new
/// `expires_at` gets a fresh timer; the engine keeps the running one otherwise.
#[derive(Clone, Debug)]
pub struct ExpiryTimer {
    window: ExpiryWindow,
    fired: bool,
    last_fraction: f64,
}

impl ExpiryTimer {
    pub fn new(window: ExpiryWindow) -> Self {
        Self {
            window,
            fired: false,
            last_fraction: 1.0,
        }
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.window.expires_at
    }

    pub fn has_fired(&self) -> bool {
        self.fired
    }

    /// Advance to `now`. The reported fraction never increases, even if the
    /// clock steps backwards.
    pub fn tick(&mut self, now: DateTime<Utc>) -> ExpiryTick {
        let fraction = self.window.remaining_fraction(now).min(self.last_fraction);
        self.last_fraction = fraction;

        let expired = fraction <= 0.0 && !self.fired;
        if expired {
            self.fired = true;
        }
        ExpiryTick { fraction, expired }
    }

    /// Drive the timer on a one-second cadence, reading the wall clock.
    ///
    /// `on_tick` sees every tick, the first one immediately. The task ends
    /// after the expiring tick, or when the handle is dropped.
    pub fn spawn<F>(mut self, mut on_tick: F) -> ExpiryHandle
    where
        F: FnMut(ExpiryTick) + Send + 'static,
    {
        let expires_at = self.expires_at();
        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(TICK_INTERVAL);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                let tick = self.tick(Utc::now());
                on_tick(tick);
                if tick.expired || self.has_fired() {
                    break;
                }
            }
        });
        ExpiryHandle { expires_at, task }
    }
}

/// A running timer. Dropping it stops the timer.
#[derive(Debug)]
pub struct ExpiryHandle {
    expires_at: DateTime<Utc>,
    task: JoinHandle<()>,
}

impl ExpiryHandle {
    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for ExpiryHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}
