use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Serialize;
use tokio::signal;
use tracing::{error, info, warn};

use crate::agent::config::GuardConfig;
use crate::comms::local_api;
use crate::guard::cascade::StoreResetReloader;
use crate::guard::{CleanupCascade, DiagnosticConsole, Reloader, SessionGuard, SubjectSource};
use crate::session::{HttpSessionOracle, SessionOracle, SystemClock};
use crate::storage::{CredentialStore, FileStore, MemoryStore};

/// The three persistence layers the cascade purges.
#[derive(Clone)]
pub struct ClientStores {
    pub ephemeral: MemoryStore,
    pub durable: Arc<FileStore>,
    pub ambient: MemoryStore,
}

impl ClientStores {
    pub fn new(durable: Arc<FileStore>) -> Self {
        Self {
            ephemeral: MemoryStore::new("ephemeral"),
            durable,
            ambient: MemoryStore::new("ambient"),
        }
    }

    pub fn all(&self) -> Vec<Arc<dyn CredentialStore>> {
        vec![
            Arc::new(self.ephemeral.clone()),
            self.durable.clone(),
            Arc::new(self.ambient.clone()),
        ]
    }
}

/// Reads the believed subject that the consuming app keeps in the durable
/// store. A failed read repeats the last good answer rather than looking
/// like a logout.
pub struct DurableSubjectSource {
    store: Arc<FileStore>,
    key: String,
    last: Mutex<Option<String>>,
}

impl DurableSubjectSource {
    pub fn new(store: Arc<FileStore>, key: String) -> Self {
        Self {
            store,
            key,
            last: Mutex::new(None),
        }
    }
}

#[async_trait]
impl SubjectSource for DurableSubjectSource {
    async fn believed_subject(&self) -> Option<String> {
        let read = self.store.get(&self.key).await;
        let mut last = match self.last.lock() {
            Ok(g) => g,
            Err(e) => e.into_inner(),
        };
        match read {
            Ok(value) => *last = value.filter(|s| !s.trim().is_empty()),
            Err(e) => warn!(key = %self.key, error = %e, "could not read believed subject"),
        }
        last.clone()
    }
}

pub fn build_guard(
    cfg: &GuardConfig,
    oracle: Arc<dyn SessionOracle>,
    stores: &ClientStores,
    reloader: Arc<dyn Reloader>,
) -> SessionGuard {
    let cascade = CleanupCascade::new(
        oracle.clone(),
        Arc::new(stores.ephemeral.clone()),
        stores.durable.clone(),
        Arc::new(stores.ambient.clone()),
        reloader,
        cfg.credential_prefixes.clone(),
    );
    SessionGuard::new(cfg.guard_settings(), oracle, cascade, Arc::new(SystemClock))
}

fn oracle_from_env() -> Result<Arc<dyn SessionOracle>> {
    let oracle = HttpSessionOracle::from_env()?
        .context("session oracle not configured: set SESSION_ORACLE_URL and SESSION_ORACLE_TOKEN")?;
    Ok(Arc::new(oracle))
}

/// Run the guard until Ctrl+C, optionally serving the diagnostic API.
/// A hard reload tears the whole guard down and composes a fresh one.
pub async fn run(config_path: String, console_port: Option<u16>) -> Result<()> {
    let cfg = GuardConfig::load(&config_path)?;
    let oracle = oracle_from_env()?;
    let durable = Arc::new(FileStore::new("durable", cfg.durable_store_path()));
    info!(
        client_class = ?cfg.client_class,
        interval_secs = cfg.validation_interval().as_secs(),
        escalation_threshold = cfg.escalation_threshold,
        "session guard starting"
    );

    loop {
        let stores = ClientStores::new(durable.clone());
        let (reloader, mut reload_rx) = StoreResetReloader::new(stores.all());
        let guard = build_guard(&cfg, oracle.clone(), &stores, Arc::new(reloader));
        guard.on_forced_sign_out(|event| {
            info!(
                reason = event.reason.as_str(),
                subject_id = event.subject_id.as_deref().unwrap_or(""),
                reloaded = event.report.reloaded,
                "forced sign-out completed"
            );
        });

        let source = Arc::new(DurableSubjectSource::new(durable.clone(), cfg.subject_key()));
        guard.start(source, cfg.validation_interval(), cfg.interval_jitter());

        let console_task = console_port.map(|port| {
            let console = DiagnosticConsole::new(guard.clone());
            tokio::spawn(async move {
                if let Err(e) = local_api::serve(console, port).await {
                    error!(error = %e, "diagnostic API stopped");
                }
            })
        });

        let reload = tokio::select! {
            res = signal::ctrl_c() => {
                if let Err(e) = res {
                    warn!(error = %e, "failed to listen for shutdown signal");
                }
                false
            }
            _ = reload_rx.changed() => true,
        };

        guard.stop();
        if let Some(task) = console_task {
            task.abort();
            let _ = task.await; // Ignore cancellation errors
        }

        if !reload {
            info!("shutdown signal received, stopping session guard");
            return Ok(());
        }
        warn!("hard reload requested, rebuilding session guard");
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiagnosticAction {
    Check,
    SignOut,
    Report,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum DiagnosticOutput {
    Tick(crate::guard::TickResult),
    SignOut {
        performed: bool,
        report: Option<crate::guard::CascadeReport>,
    },
    Report(crate::guard::ConsistencyReport),
}

/// One-shot console invocation against the configured provider and stores.
pub async fn run_diagnostic(config_path: String, action: DiagnosticAction) -> Result<String> {
    let cfg = GuardConfig::load(&config_path)?;
    let oracle = oracle_from_env()?;
    let durable = Arc::new(FileStore::new("durable", cfg.durable_store_path()));
    let stores = ClientStores::new(durable.clone());
    let (reloader, _reload_rx) = StoreResetReloader::new(stores.all());
    let guard = build_guard(&cfg, oracle, &stores, Arc::new(reloader));

    let believed = DurableSubjectSource::new(durable, cfg.subject_key())
        .believed_subject()
        .await;
    guard.observe(believed.as_deref()).await;

    let console = DiagnosticConsole::new(guard);
    let output = match action {
        DiagnosticAction::Check => DiagnosticOutput::Tick(console.check_now().await),
        DiagnosticAction::SignOut => {
            let report = console.force_sign_out_now().await;
            DiagnosticOutput::SignOut {
                performed: report.is_some(),
                report,
            }
        }
        DiagnosticAction::Report => DiagnosticOutput::Report(console.report_consistency().await),
    };
    serde_json::to_string_pretty(&output).context("serializing diagnostic output")
}
