//! Manual trigger surface for operators and debugging UIs.
//!
//! Calls go straight into the guard and share its contracts: `check_now`
//! never overlaps a scheduled tick, `force_sign_out_now` collapses into an
//! already running or completed cascade.

use serde::Serialize;
use tracing::info;

use super::{CascadeReport, GuardSnapshot, SessionGuard, SignOutReason, TickResult};
use crate::security::Observation;

/// Believed identity versus what the provider actually reports.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConsistencyReport {
    pub believed_subject_id: Option<String>,
    pub provider_subject_id: Option<String>,
    pub is_consistent: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider_error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct DiagnosticConsole {
    guard: SessionGuard,
}

impl DiagnosticConsole {
    pub fn new(guard: SessionGuard) -> Self {
        Self { guard }
    }

    pub fn guard(&self) -> &SessionGuard {
        &self.guard
    }

    pub async fn check_now(&self) -> TickResult {
        info!("manual validation requested");
        self.guard.validate().await
    }

    pub async fn force_sign_out_now(&self) -> Option<CascadeReport> {
        info!("manual sign-out requested");
        self.guard.force_sign_out(SignOutReason::Manual).await
    }

    pub async fn observe(&self, believed: Option<&str>) -> Observation {
        self.guard.observe(believed).await
    }

    pub async fn report_consistency(&self) -> ConsistencyReport {
        let believed_subject_id = self.guard.believed_subject().await;
        match self.guard.probe_provider().await {
            Ok(session) => {
                let provider_subject_id = session.map(|s| s.subject_id);
                ConsistencyReport {
                    is_consistent: believed_subject_id == provider_subject_id,
                    believed_subject_id,
                    provider_subject_id,
                    provider_error: None,
                }
            }
            Err(e) => ConsistencyReport {
                believed_subject_id,
                provider_subject_id: None,
                is_consistent: false,
                provider_error: Some(e.to_string()),
            },
        }
    }

    pub async fn snapshot(&self) -> GuardSnapshot {
        self.guard.snapshot().await
    }
}
