//! Fail-safe logout procedure.
//!
//! Stages run in a fixed order: remote revoke, ephemeral store wipe,
//! durable store wipe, ambient artifact wipe and, only when the revoke
//! call itself failed, a hard reload. A failing stage never stops the
//! stages after it.

use async_trait::async_trait;
use serde::Serialize;
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::security::AuditLogger;
use crate::session::SessionOracle;
use crate::storage::CredentialStore;

/// Why a forced sign-out was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SignOutReason {
    Drift,
    IdentityMismatch,
    SessionAbsent,
    Escalation,
    Manual,
}

impl SignOutReason {
    pub fn as_str(self) -> &'static str {
        match self {
            SignOutReason::Drift => "drift",
            SignOutReason::IdentityMismatch => "identity_mismatch",
            SignOutReason::SessionAbsent => "session_absent",
            SignOutReason::Escalation => "escalation",
            SignOutReason::Manual => "manual",
        }
    }

    pub fn is_anomaly(self) -> bool {
        !matches!(self, SignOutReason::Manual)
    }
}

/// Result of wiping one store.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StageReport {
    pub store: String,
    pub attempted: usize,
    pub removed: usize,
    pub failures: Vec<String>,
}

impl StageReport {
    pub fn succeeded(&self) -> bool {
        self.failures.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CascadeReport {
    pub reason: SignOutReason,
    pub revoked: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub revoke_error: Option<String>,
    pub stages: Vec<StageReport>,
    pub reloaded: bool,
}

/// Last-resort reset of the whole client.
#[async_trait]
pub trait Reloader: Send + Sync {
    /// Reload is defined to always succeed.
    async fn reload(&self);
}

/// Delete every key under `prefixes`, attempting each key independently.
pub async fn wipe_credentials(store: &dyn CredentialStore, prefixes: &[String]) -> StageReport {
    let mut report = StageReport {
        store: store.name().to_string(),
        ..StageReport::default()
    };

    for prefix in prefixes {
        let keys = match store.list_keys(prefix).await {
            Ok(keys) => keys,
            Err(e) => {
                report.failures.push(format!("list {prefix}: {e}"));
                continue;
            }
        };
        for key in keys {
            report.attempted += 1;
            match store.remove(&key).await {
                Ok(()) => report.removed += 1,
                Err(e) => report.failures.push(format!("{key}: {e}")),
            }
        }
    }
    report
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CascadeState {
    Idle,
    Running,
    Completed,
}

struct CascadeInner {
    oracle: Arc<dyn SessionOracle>,
    ephemeral: Arc<dyn CredentialStore>,
    durable: Arc<dyn CredentialStore>,
    ambient: Arc<dyn CredentialStore>,
    reloader: Arc<dyn Reloader>,
    prefixes: Vec<String>,
    state: Mutex<CascadeState>,
    audit: AuditLogger,
}

#[derive(Clone)]
pub struct CleanupCascade {
    inner: Arc<CascadeInner>,
}

impl std::fmt::Debug for CleanupCascade {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CleanupCascade")
            .field("prefixes", &self.inner.prefixes)
            .field("state", &self.inner.lock_state())
            .finish()
    }
}

impl CascadeInner {
    fn lock_state(&self) -> std::sync::MutexGuard<'_, CascadeState> {
        match self.state.lock() {
            Ok(g) => g,
            Err(e) => e.into_inner(),
        }
    }

    async fn execute(&self, reason: SignOutReason) -> CascadeReport {
        info!(reason = reason.as_str(), "cleanup cascade started");

        let (revoked, revoke_error) = match self.oracle.revoke_session().await {
            Ok(()) => (true, None),
            Err(e) => {
                warn!(error = %e, "remote revoke failed, continuing with local wipe");
                self.audit.cascade_stage_failed("remote_revoke", &e.to_string());
                (false, Some(e.to_string()))
            }
        };

        let mut stages = Vec::with_capacity(3);
        for store in [&self.ephemeral, &self.durable, &self.ambient] {
            let report = wipe_credentials(store.as_ref(), &self.prefixes).await;
            for failure in &report.failures {
                self.audit.cascade_stage_failed(&report.store, failure);
            }
            debug!(
                store = %report.store,
                attempted = report.attempted,
                removed = report.removed,
                "credential wipe finished"
            );
            stages.push(report);
        }

        let reloaded = revoke_error.is_some();
        if reloaded {
            self.audit.hard_reload("remote_revoke_failed");
            error!("remote revoke failed; performing hard reload");
            self.reloader.reload().await;
        }

        CascadeReport {
            reason,
            revoked,
            revoke_error,
            stages,
            reloaded,
        }
    }
}

impl CleanupCascade {
    pub fn new(
        oracle: Arc<dyn SessionOracle>,
        ephemeral: Arc<dyn CredentialStore>,
        durable: Arc<dyn CredentialStore>,
        ambient: Arc<dyn CredentialStore>,
        reloader: Arc<dyn Reloader>,
        prefixes: Vec<String>,
    ) -> Self {
        Self {
            inner: Arc::new(CascadeInner {
                oracle,
                ephemeral,
                durable,
                ambient,
                reloader,
                prefixes,
                state: Mutex::new(CascadeState::Idle),
                audit: AuditLogger::new(),
            }),
        }
    }

    /// Run the cascade unless it is already running or has completed for
    /// the current session. Returns `None` when the call was a no-op.
    ///
    /// The stages run on their own task, so dropping the returned future
    /// does not leave the cascade half applied.
    pub async fn run(&self, reason: SignOutReason) -> Option<CascadeReport> {
        {
            let mut state = self.inner.lock_state();
            if *state != CascadeState::Idle {
                debug!(reason = reason.as_str(), state = ?*state, "cleanup cascade already triggered");
                return None;
            }
            *state = CascadeState::Running;
        }

        let inner = self.inner.clone();
        let task = tokio::spawn(async move {
            let report = inner.execute(reason).await;
            *inner.lock_state() = CascadeState::Completed;
            report
        });

        match task.await {
            Ok(report) => Some(report),
            Err(e) => {
                // Only reachable if a stage panicked.
                error!(error = %e, "cleanup cascade task failed");
                *self.inner.lock_state() = CascadeState::Completed;
                None
            }
        }
    }

    /// Allow the cascade to run again once a new session has been adopted.
    pub fn rearm(&self) {
        let mut state = self.inner.lock_state();
        if *state == CascadeState::Completed {
            *state = CascadeState::Idle;
        }
    }

    pub fn is_running(&self) -> bool {
        *self.inner.lock_state() == CascadeState::Running
    }

    pub fn has_completed(&self) -> bool {
        *self.inner.lock_state() == CascadeState::Completed
    }

    pub fn prefixes(&self) -> &[String] {
        &self.inner.prefixes
    }
}

/// Reloader that wipes every key of every store, then bumps a watch
/// channel so the owner can rebuild its state from scratch.
pub struct StoreResetReloader {
    stores: Vec<Arc<dyn CredentialStore>>,
    signal: watch::Sender<u64>,
}

impl StoreResetReloader {
    pub fn new(stores: Vec<Arc<dyn CredentialStore>>) -> (Self, watch::Receiver<u64>) {
        let (signal, rx) = watch::channel(0);
        (Self { stores, signal }, rx)
    }
}

#[async_trait]
impl Reloader for StoreResetReloader {
    async fn reload(&self) {
        for store in &self.stores {
            let keys = match store.keys().await {
                Ok(keys) => keys,
                Err(e) => {
                    warn!(store = %store.name(), error = %e, "could not list keys for reload wipe");
                    continue;
                }
            };
            for key in keys {
                if let Err(e) = store.remove(&key).await {
                    warn!(store = %store.name(), key = %key, error = %e, "reload wipe failed for key");
                }
            }
        }
        self.signal.send_modify(|generation| *generation += 1);
        info!("client state reset for reload");
    }
}
