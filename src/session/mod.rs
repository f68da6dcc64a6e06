//! Remote Session Oracle seam.
//!
//! The oracle is the authentication provider's view of "who is logged in".
//! It is treated as untrusted with respect to latency and availability, so
//! every call may fail with a [`ProviderError`].

pub mod http_oracle;

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use thiserror::Error;

pub use http_oracle::HttpSessionOracle;

/// Snapshot of the provider's current authoritative session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub subject_id: String,
    pub expires_at: DateTime<Utc>,
    pub fetched_at: DateTime<Utc>,
}

impl Session {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    /// True when expiry falls inside `window` from `now`.
    pub fn expires_within(&self, now: DateTime<Utc>, window: std::time::Duration) -> bool {
        // Negative remaining time fails to_std and counts as inside the window.
        (self.expires_at - now)
            .to_std()
            .map(|remaining| remaining <= window)
            .unwrap_or(true)
    }
}

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("provider transport failure: {0}")]
    Transport(String),
    #[error("provider request timed out")]
    Timeout,
    #[error("provider returned status {0}")]
    Status(u16),
    #[error("provider response could not be decoded: {0}")]
    Decode(String),
}

#[async_trait]
pub trait SessionOracle: Send + Sync {
    /// Current session, or `None` when the provider has no session.
    async fn current_session(&self) -> Result<Option<Session>, ProviderError>;

    /// Politely end the session server-side.
    async fn revoke_session(&self) -> Result<(), ProviderError>;
}

/// Source of wall-clock time for expiry and bookkeeping.
pub trait Clock: Send + Sync + std::fmt::Debug {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to.
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<Mutex<DateTime<Utc>>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Arc::new(Mutex::new(start)),
        }
    }

    pub fn advance(&self, by: std::time::Duration) {
        let mut now = match self.now.lock() {
            Ok(g) => g,
            Err(e) => e.into_inner(),
        };
        *now += ChronoDuration::from_std(by).unwrap_or(ChronoDuration::zero());
    }

    pub fn set(&self, at: DateTime<Utc>) {
        let mut now = match self.now.lock() {
            Ok(g) => g,
            Err(e) => e.into_inner(),
        };
        *now = at;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        match self.now.lock() {
            Ok(g) => *g,
            Err(e) => *e.into_inner(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::time::Duration;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 1, 12, 0, 0).unwrap()
    }

    fn session_expiring_in(secs: i64) -> Session {
        Session {
            subject_id: "user-a".to_string(),
            expires_at: t0() + ChronoDuration::seconds(secs),
            fetched_at: t0(),
        }
    }

    #[test]
    fn test_expires_within_window() {
        let window = Duration::from_secs(300);
        assert!(session_expiring_in(120).expires_within(t0(), window));
        assert!(session_expiring_in(300).expires_within(t0(), window));
        assert!(!session_expiring_in(301).expires_within(t0(), window));
    }

    #[test]
    fn test_is_expired() {
        assert!(session_expiring_in(0).is_expired(t0()));
        assert!(session_expiring_in(-5).is_expired(t0()));
        assert!(!session_expiring_in(1).is_expired(t0()));
    }

    #[test]
    fn test_manual_clock_advances_only_on_request() {
        let clock = ManualClock::new(t0());
        assert_eq!(clock.now(), t0());

        clock.advance(Duration::from_secs(90));
        assert_eq!(clock.now(), t0() + ChronoDuration::seconds(90));

        let cloned = clock.clone();
        cloned.set(t0());
        assert_eq!(clock.now(), t0());
    }
}
