use tracing::{error, info, warn};

/// Security audit trail for the session guard, emitted under the
/// `audit` target.
#[derive(Debug, Clone, Default)]
pub struct AuditLogger;

impl AuditLogger {
    pub fn new() -> Self {
        Self
    }

    pub fn explicit_logout(&self, previous_subject: Option<&str>) {
        info!(target: "audit", event = "explicit_logout", subject_id = previous_subject.unwrap_or(""));
    }

    pub fn drift_detected(&self, expected: &str, observed: &str) {
        warn!(target: "audit", event = "drift_detected", expected, observed);
    }

    pub fn drift_settled(&self, expected: &str, observed: &str) {
        info!(target: "audit", event = "drift_settled", expected, observed);
    }

    /// The drift was overtaken by a sign-out that already completed.
    pub fn drift_superseded(&self, expected: &str, observed: &str) {
        info!(target: "audit", event = "drift_superseded", expected, observed);
    }

    pub fn identity_mismatch(&self, believed: &str, provider: &str) {
        warn!(target: "audit", event = "identity_mismatch", believed, provider);
    }

    pub fn session_absent(&self, believed: &str) {
        warn!(target: "audit", event = "session_absent", believed);
    }

    pub fn escalation(&self, warning_count: u32, threshold: u32) {
        error!(target: "audit", event = "escalation", warning_count, threshold);
    }

    pub fn forced_sign_out(&self, reason: &str, subject_id: Option<&str>) {
        warn!(target: "audit", event = "forced_sign_out", reason, subject_id = subject_id.unwrap_or(""));
    }

    pub fn cascade_stage_failed(&self, stage: &str, error_msg: &str) {
        warn!(target: "audit", event = "cascade_stage_failed", stage, error = error_msg);
    }

    pub fn hard_reload(&self, cause: &str) {
        error!(target: "audit", event = "hard_reload", cause);
    }
}
