use chrono::{DateTime, Utc};
use serde::Serialize;

/// Outcome of one validation tick against the oracle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TickOutcome {
    Ok,
    ProviderError,
    SessionAbsent,
    IdentityMismatch,
    ExpiringSoon,
}

impl TickOutcome {
    /// Whether this outcome counts against the escalation threshold.
    pub fn is_penalized(self) -> bool {
        matches!(
            self,
            TickOutcome::ProviderError | TickOutcome::SessionAbsent | TickOutcome::IdentityMismatch
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// A previous tick's oracle query is still outstanding.
    InFlight,
    /// The consumer believes nobody is signed in.
    NoSubject,
    /// A cleanup cascade is tearing the session down.
    SigningOut,
    /// The session context changed while the oracle query was outstanding.
    Superseded,
}

/// What a request to validate actually did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "detail", rename_all = "snake_case")]
pub enum TickResult {
    Completed(TickOutcome),
    Skipped(SkipReason),
}

impl TickResult {
    pub fn outcome(self) -> Option<TickOutcome> {
        match self {
            TickResult::Completed(outcome) => Some(outcome),
            TickResult::Skipped(_) => None,
        }
    }
}

/// Guard's belief about session soundness.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthState {
    pub is_valid: bool,
    pub last_checked_at: Option<DateTime<Utc>>,
    pub warning_count: u32,
}

impl Default for HealthState {
    fn default() -> Self {
        Self {
            is_valid: true,
            last_checked_at: None,
            warning_count: 0,
        }
    }
}

impl HealthState {
    /// Fold a tick outcome into the state. Returns the new warning count.
    pub fn apply(&mut self, outcome: TickOutcome, now: DateTime<Utc>) -> u32 {
        self.last_checked_at = Some(now);
        match outcome {
            TickOutcome::Ok => {
                self.warning_count = 0;
                self.is_valid = true;
            }
            TickOutcome::ExpiringSoon => {}
            TickOutcome::ProviderError
            | TickOutcome::SessionAbsent
            | TickOutcome::IdentityMismatch => {
                self.warning_count = self.warning_count.saturating_add(1);
                self.is_valid = false;
            }
        }
        self.warning_count
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn should_escalate(&self, threshold: u32) -> bool {
        self.warning_count >= threshold
    }
}
