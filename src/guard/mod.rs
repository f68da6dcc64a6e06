//! Session Consistency Guard.
//!
//! [`SessionGuard`] keeps the consumer's believed subject aligned with the
//! remote provider. It owns the identity cache and health state, runs
//! validation ticks, escalates repeated failures, and drives the
//! [`CleanupCascade`] when the session can no longer be trusted.

pub mod cascade;
pub mod console;
pub mod health;
pub mod scheduler;

use async_trait::async_trait;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::security::{AuditLogger, IdentityCache, Observation};
use crate::session::{Clock, ProviderError, Session, SessionOracle};

pub use cascade::{CascadeReport, CleanupCascade, Reloader, SignOutReason, StageReport};
pub use console::{ConsistencyReport, DiagnosticConsole};
pub use health::{HealthState, SkipReason, TickOutcome, TickResult};
pub use scheduler::{spawn_validation_loop, SchedulerHandle};

/// Tunables for drift detection and escalation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuardSettings {
    /// Consecutive penalized ticks before a forced sign-out.
    pub escalation_threshold: u32,
    /// Sessions expiring within this window are reported as expiring soon.
    pub expiry_warning: Duration,
    /// Delay before acting on drift, letting legitimate transitions land.
    pub settle_window: Duration,
}

impl Default for GuardSettings {
    fn default() -> Self {
        Self {
            escalation_threshold: 3,
            expiry_warning: Duration::from_secs(300),
            settle_window: Duration::from_millis(100),
        }
    }
}

/// Supplies the subject the consumer currently believes is signed in.
#[async_trait]
pub trait SubjectSource: Send + Sync {
    async fn believed_subject(&self) -> Option<String>;
}

#[async_trait]
impl<F> SubjectSource for F
where
    F: Fn() -> Option<String> + Send + Sync,
{
    async fn believed_subject(&self) -> Option<String> {
        self()
    }
}

/// Delivered to listeners once a forced sign-out has completed.
#[derive(Debug, Clone, Serialize)]
pub struct SignOutEvent {
    pub reason: SignOutReason,
    pub subject_id: Option<String>,
    pub report: CascadeReport,
}

pub type SignOutListener = Arc<dyn Fn(&SignOutEvent) + Send + Sync>;

#[derive(Debug, Default)]
struct GuardCounters {
    ticks: AtomicU64,
    skipped_ticks: AtomicU64,
    drift_sign_outs_scheduled: AtomicU64,
    forced_sign_outs: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct GuardStats {
    pub ticks: u64,
    pub skipped_ticks: u64,
    pub drift_sign_outs_scheduled: u64,
    pub forced_sign_outs: u64,
}

/// Point-in-time view of the guard for diagnostics.
#[derive(Debug, Clone, Serialize)]
pub struct GuardSnapshot {
    pub believed_subject_id: Option<String>,
    pub cached_subject_id: Option<String>,
    pub health: HealthState,
    pub stats: GuardStats,
    pub sign_out_in_progress: bool,
    pub scheduler_running: bool,
}

#[derive(Debug, Clone)]
enum DriftEvidence {
    /// The consumer switched subjects without signing out.
    Observation { expected: String, observed: String },
    /// The provider holds a session for someone else.
    Provider { believed: String, provider: String },
}

impl DriftEvidence {
    fn reason(&self) -> SignOutReason {
        match self {
            DriftEvidence::Observation { .. } => SignOutReason::Drift,
            DriftEvidence::Provider { .. } => SignOutReason::IdentityMismatch,
        }
    }

    fn parties(&self) -> (&str, &str) {
        match self {
            DriftEvidence::Observation { expected, observed } => (expected.as_str(), observed.as_str()),
            DriftEvidence::Provider { believed, provider } => (believed.as_str(), provider.as_str()),
        }
    }
}

struct GuardInner {
    settings: GuardSettings,
    oracle: Arc<dyn SessionOracle>,
    cascade: CleanupCascade,
    clock: Arc<dyn Clock>,
    identity: IdentityCache,
    health: RwLock<HealthState>,
    believed: RwLock<Option<String>>,
    // Held for the whole of a tick so oracle queries never overlap.
    oracle_gate: tokio::sync::Mutex<()>,
    // Serializes belief changes against the deferred drift decision.
    transition: tokio::sync::Mutex<()>,
    // Bumped on explicit logout and completed sign-out.
    generation: AtomicU64,
    pending_drift: Mutex<Option<PendingDrift>>,
    scheduler: Mutex<Option<SchedulerHandle>>,
    listeners: Mutex<Vec<SignOutListener>>,
    counters: GuardCounters,
    audit: AuditLogger,
}

struct PendingDrift {
    handle: JoinHandle<()>,
    // Set once the settle window has elapsed and the task starts acting.
    resolving: Arc<AtomicBool>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(g) => g,
        Err(e) => e.into_inner(),
    }
}

/// The guard context. Cheap to clone; all clones share one state.
#[derive(Clone)]
pub struct SessionGuard {
    inner: Arc<GuardInner>,
}

/// Non-owning handle used by background tasks.
#[derive(Clone)]
pub struct WeakSessionGuard {
    inner: Weak<GuardInner>,
}

impl WeakSessionGuard {
    pub fn upgrade(&self) -> Option<SessionGuard> {
        self.inner.upgrade().map(|inner| SessionGuard { inner })
    }
}

impl std::fmt::Debug for SessionGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionGuard")
            .field("settings", &self.inner.settings)
            .field("cascade", &self.inner.cascade)
            .finish()
    }
}

impl SessionGuard {
    pub fn new(
        settings: GuardSettings,
        oracle: Arc<dyn SessionOracle>,
        cascade: CleanupCascade,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            inner: Arc::new(GuardInner {
                settings,
                oracle,
                cascade,
                clock,
                identity: IdentityCache::new(),
                health: RwLock::new(HealthState::default()),
                believed: RwLock::new(None),
                oracle_gate: tokio::sync::Mutex::new(()),
                transition: tokio::sync::Mutex::new(()),
                generation: AtomicU64::new(0),
                pending_drift: Mutex::new(None),
                scheduler: Mutex::new(None),
                listeners: Mutex::new(Vec::new()),
                counters: GuardCounters::default(),
                audit: AuditLogger::new(),
            }),
        }
    }

    pub fn downgrade(&self) -> WeakSessionGuard {
        WeakSessionGuard {
            inner: Arc::downgrade(&self.inner),
        }
    }

    pub fn settings(&self) -> &GuardSettings {
        &self.inner.settings
    }

    /// Register a callback run after every completed forced sign-out.
    pub fn on_forced_sign_out<F>(&self, callback: F)
    where
        F: Fn(&SignOutEvent) + Send + Sync + 'static,
    {
        lock(&self.inner.listeners).push(Arc::new(callback));
    }

    /// Record a change in the consumer's believed subject.
    pub async fn observe(&self, believed: Option<&str>) -> Observation {
        if believed.is_none() {
            // Supersede any pending drift reaction and in-flight tick
            // before yielding, so neither can act on the old session.
            self.inner.generation.fetch_add(1, Ordering::SeqCst);
            self.detach_pending_drift();
        }
        let _transition = self.inner.transition.lock().await;

        *self.inner.believed.write().await = believed.map(str::to_string);
        let observation = self
            .inner
            .identity
            .observe(believed, self.inner.clock.now())
            .await;

        match &observation {
            Observation::Cleared { previous } => {
                self.inner.health.write().await.reset();
                if previous.is_some() {
                    self.inner.audit.explicit_logout(previous.as_deref());
                }
            }
            Observation::FirstObservation { subject_id } => {
                // A new session starts a new anomaly scope.
                self.inner.cascade.rearm();
                info!(subject_id = %subject_id, "guarding new session");
            }
            Observation::Continuity => {}
            Observation::Drift { expected, observed } => {
                self.inner.audit.drift_detected(expected, observed);
                self.schedule_drift_sign_out(DriftEvidence::Observation {
                    expected: expected.clone(),
                    observed: observed.clone(),
                });
            }
        }
        observation
    }

    /// Run one validation tick. Never overlaps another tick.
    pub async fn validate(&self) -> TickResult {
        let inner = &self.inner;
        let Some(believed) = inner.believed.read().await.clone() else {
            inner.counters.skipped_ticks.fetch_add(1, Ordering::Relaxed);
            return TickResult::Skipped(SkipReason::NoSubject);
        };
        if inner.cascade.is_running() {
            inner.counters.skipped_ticks.fetch_add(1, Ordering::Relaxed);
            return TickResult::Skipped(SkipReason::SigningOut);
        }
        let Ok(_gate) = inner.oracle_gate.try_lock() else {
            inner.counters.skipped_ticks.fetch_add(1, Ordering::Relaxed);
            debug!("validation already in flight, skipping tick");
            return TickResult::Skipped(SkipReason::InFlight);
        };

        inner.counters.ticks.fetch_add(1, Ordering::Relaxed);
        let generation = inner.generation.load(Ordering::SeqCst);
        let fetched = inner.oracle.current_session().await;

        // An explicit sign-out while the query was outstanding makes the
        // answer irrelevant to the current context.
        if inner.generation.load(Ordering::SeqCst) != generation {
            inner.counters.skipped_ticks.fetch_add(1, Ordering::Relaxed);
            debug!("session context changed during validation, discarding result");
            return TickResult::Skipped(SkipReason::Superseded);
        }

        let now = inner.clock.now();
        let (outcome, provider_subject) =
            classify(&believed, &fetched, now, inner.settings.expiry_warning);
        let warning_count = inner.health.write().await.apply(outcome, now);

        match outcome {
            TickOutcome::Ok => debug!(subject_id = %believed, "session validated"),
            TickOutcome::ExpiringSoon => {
                info!(subject_id = %believed, "session expires soon, awaiting refresh")
            }
            TickOutcome::ProviderError => {
                if let Err(e) = &fetched {
                    warn!(error = %e, warning_count, "session validation failed, will retry");
                }
            }
            TickOutcome::SessionAbsent => {
                inner.audit.session_absent(&believed);
            }
            TickOutcome::IdentityMismatch => {
                let provider = provider_subject.unwrap_or_default();
                inner.audit.identity_mismatch(&believed, &provider);
                self.schedule_drift_sign_out(DriftEvidence::Provider { believed, provider });
            }
        }

        // No legitimate transition explains a missing session, so there is
        // nothing to wait for.
        if outcome == TickOutcome::SessionAbsent {
            self.force_sign_out(SignOutReason::SessionAbsent).await;
        }
        self.check_escalation().await;

        TickResult::Completed(outcome)
    }

    async fn check_escalation(&self) {
        let threshold = self.inner.settings.escalation_threshold;
        let health = self.inner.health.read().await.clone();
        if health.should_escalate(threshold) {
            self.inner.audit.escalation(health.warning_count, threshold);
            self.force_sign_out(SignOutReason::Escalation).await;
        }
    }

    /// Run the cleanup cascade. `None` means a cascade for the current
    /// session already ran or is running.
    ///
    /// The cascade and the session teardown after it run on their own task:
    /// dropping the returned future never leaves the guard half signed out.
    pub async fn force_sign_out(&self, reason: SignOutReason) -> Option<CascadeReport> {
        let guard = self.clone();
        let task = tokio::spawn(async move { guard.sign_out_to_completion(reason).await });
        match task.await {
            Ok(report) => report,
            Err(e) => {
                error!(error = %e, reason = reason.as_str(), "forced sign-out task failed");
                None
            }
        }
    }

    async fn sign_out_to_completion(&self, reason: SignOutReason) -> Option<CascadeReport> {
        let subject_id = self.inner.identity.subject_id().await;
        let report = self.inner.cascade.run(reason).await?;

        if reason.is_anomaly() {
            self.inner
                .audit
                .forced_sign_out(reason.as_str(), subject_id.as_deref());
        } else {
            info!(subject_id = subject_id.as_deref().unwrap_or(""), "manual sign-out completed");
        }

        self.inner.identity.clear().await;
        self.inner.health.write().await.reset();
        *self.inner.believed.write().await = None;
        // Counted before the generation bump so a drift task that sees the
        // new generation also sees the sign-out.
        self.inner
            .counters
            .forced_sign_outs
            .fetch_add(1, Ordering::SeqCst);
        self.inner.generation.fetch_add(1, Ordering::SeqCst);

        let event = SignOutEvent {
            reason,
            subject_id,
            report: report.clone(),
        };
        let listeners: Vec<SignOutListener> = lock(&self.inner.listeners).clone();
        for listener in listeners {
            listener(&event);
        }
        Some(report)
    }

    fn schedule_drift_sign_out(&self, evidence: DriftEvidence) -> bool {
        let mut pending = lock(&self.inner.pending_drift);
        if pending.as_ref().is_some_and(|p| !p.handle.is_finished()) {
            debug!("drift sign-out already pending");
            return false;
        }

        let generation = self.inner.generation.load(Ordering::SeqCst);
        let sign_outs = self.inner.counters.forced_sign_outs.load(Ordering::SeqCst);
        let settle = self.inner.settings.settle_window;
        let resolving = Arc::new(AtomicBool::new(false));
        let started = resolving.clone();
        let guard = self.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(settle).await;
            started.store(true, Ordering::SeqCst);
            guard.resolve_drift(evidence, generation, sign_outs).await;
        });
        *pending = Some(PendingDrift { handle, resolving });
        self.inner
            .counters
            .drift_sign_outs_scheduled
            .fetch_add(1, Ordering::Relaxed);
        true
    }

    async fn resolve_drift(&self, evidence: DriftEvidence, generation: u64, sign_outs: u64) {
        let _transition = self.inner.transition.lock().await;
        let (expected, observed) = evidence.parties();
        if self.inner.generation.load(Ordering::SeqCst) != generation {
            if self.inner.counters.forced_sign_outs.load(Ordering::SeqCst) != sign_outs {
                self.inner.audit.drift_superseded(expected, observed);
            } else {
                self.inner.audit.drift_settled(expected, observed);
            }
            return;
        }
        // A provider mismatch only settles through an explicit logout.
        if let DriftEvidence::Observation { expected, .. } = &evidence {
            let believed = self.inner.believed.read().await.clone();
            if believed.as_deref() == Some(expected.as_str()) {
                self.inner.audit.drift_settled(expected, observed);
                return;
            }
        }
        self.force_sign_out(evidence.reason()).await;
    }

    fn detach_pending_drift(&self) {
        if lock(&self.inner.pending_drift).take().is_some() {
            debug!("explicit sign-out supersedes pending drift reaction");
        }
    }

    /// Drop a drift reaction still inside its settle window. One already
    /// acting is left to finish; its sign-out runs on its own task anyway.
    fn cancel_pending_drift(&self) {
        let Some(pending) = lock(&self.inner.pending_drift).take() else {
            return;
        };
        if pending.resolving.load(Ordering::SeqCst) {
            debug!("drift reaction already acting, leaving it to finish");
        } else {
            pending.handle.abort();
        }
    }

    /// Query the provider without touching health state. Waits for any
    /// in-flight tick instead of overlapping it.
    pub async fn probe_provider(&self) -> Result<Option<Session>, ProviderError> {
        let _gate = self.inner.oracle_gate.lock().await;
        self.inner.oracle.current_session().await
    }

    /// Begin periodic validation: one tick now, then one per `interval`.
    /// Restarting replaces any previous schedule.
    pub fn start(&self, source: Arc<dyn SubjectSource>, interval: Duration, jitter: Duration) {
        let handle = spawn_validation_loop(self.downgrade(), source, interval, jitter);
        let previous = lock(&self.inner.scheduler).replace(handle);
        drop(previous);
        info!(interval_secs = interval.as_secs(), "session validation started");
    }

    /// Cancel periodic validation and any pending drift reaction. Safe to
    /// call repeatedly or without a prior `start`.
    pub fn stop(&self) {
        let handle = lock(&self.inner.scheduler).take();
        if let Some(mut handle) = handle {
            handle.stop();
            info!("session validation stopped");
        }
        self.cancel_pending_drift();
    }

    pub fn is_running(&self) -> bool {
        lock(&self.inner.scheduler)
            .as_ref()
            .is_some_and(SchedulerHandle::is_running)
    }

    pub async fn health(&self) -> HealthState {
        self.inner.health.read().await.clone()
    }

    pub async fn believed_subject(&self) -> Option<String> {
        self.inner.believed.read().await.clone()
    }

    pub async fn cached_subject(&self) -> Option<String> {
        self.inner.identity.subject_id().await
    }

    pub fn stats(&self) -> GuardStats {
        let c = &self.inner.counters;
        GuardStats {
            ticks: c.ticks.load(Ordering::Relaxed),
            skipped_ticks: c.skipped_ticks.load(Ordering::Relaxed),
            drift_sign_outs_scheduled: c.drift_sign_outs_scheduled.load(Ordering::Relaxed),
            forced_sign_outs: c.forced_sign_outs.load(Ordering::Relaxed),
        }
    }

    pub async fn snapshot(&self) -> GuardSnapshot {
        GuardSnapshot {
            believed_subject_id: self.believed_subject().await,
            cached_subject_id: self.cached_subject().await,
            health: self.health().await,
            stats: self.stats(),
            sign_out_in_progress: self.inner.cascade.is_running(),
            scheduler_running: self.is_running(),
        }
    }
}

fn classify(
    believed: &str,
    fetched: &Result<Option<Session>, ProviderError>,
    now: chrono::DateTime<chrono::Utc>,
    expiry_warning: Duration,
) -> (TickOutcome, Option<String>) {
    match fetched {
        Err(_) => (TickOutcome::ProviderError, None),
        Ok(None) => (TickOutcome::SessionAbsent, None),
        Ok(Some(session)) if session.is_expired(now) => (TickOutcome::SessionAbsent, None),
        Ok(Some(session)) if session.subject_id != believed => {
            (TickOutcome::IdentityMismatch, Some(session.subject_id.clone()))
        }
        Ok(Some(session)) if session.expires_within(now, expiry_warning) => {
            (TickOutcome::ExpiringSoon, Some(session.subject_id.clone()))
        }
        Ok(Some(session)) => (TickOutcome::Ok, Some(session.subject_id.clone())),
    }
}

#[cfg(test)]
pub(crate) mod testing;
