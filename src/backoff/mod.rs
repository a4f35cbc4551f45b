//! Process-wide pause for upstream fetches.
//!
//! When the upstream signals rate-limiting the whole process stops starting
//! new downloads until a deadline. The deadline only ever moves forward so
//! concurrent failures cannot flap it back and forth. In-memory only; a
//! restart clears it.

use std::sync::RwLock;

use chrono::{DateTime, Datelike, Duration, TimeZone, Utc};
use tracing::{info, warn};

#[derive(Default)]
struct PauseState {
    until: Option<DateTime<Utc>>,
    reason: String,
}

#[derive(Default)]
pub struct BackoffGate {
    state: RwLock<PauseState>,
}

impl BackoffGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remaining pause duration, or `None` when no pause is active. Expired
    /// deadlines read as inactive without needing an explicit clear.
    pub fn should_block(&self) -> Option<Duration> {
        let state = self.state.read().unwrap();
        let until = state.until?;
        let now = Utc::now();
        if now < until {
            Some(until - now)
        } else {
            None
        }
    }

    /// Current deadline and reason, for the status endpoint.
    pub fn active_pause(&self) -> Option<(DateTime<Utc>, String)> {
        let state = self.state.read().unwrap();
        let until = state.until?;
        if Utc::now() < until {
            Some((until, state.reason.clone()))
        } else {
            None
        }
    }

    /// Extend the pause to `until`. Earlier deadlines than the current one
    /// are ignored.
    pub fn set_pause_until(&self, until: DateTime<Utc>, reason: &str) {
        let mut state = self.state.write().unwrap();
        if state.until.map_or(true, |current| until > current) {
            state.until = Some(until);
            state.reason = reason.to_string();
            warn!(until = %until, reason, "upstream fetches paused");
        }
    }

    /// Administrative clear; the gate otherwise expires on its own.
    pub fn clear(&self) {
        let mut state = self.state.write().unwrap();
        state.until = None;
        state.reason.clear();
        info!("upstream fetch pause cleared");
    }
}

/// Next UTC midnight after `reference`, plus a buffer in minutes. Image
/// quotas reset at UTC midnight; the buffer absorbs clock skew.
pub fn next_utc_midnight_plus(reference: DateTime<Utc>, minutes: i64) -> DateTime<Utc> {
    let next_day = reference.date_naive() + chrono::Days::new(1);
    let midnight = Utc
        .with_ymd_and_hms(next_day.year(), next_day.month(), next_day.day(), 0, 0, 0)
        .unwrap();
    midnight + Duration::minutes(minutes)
}
