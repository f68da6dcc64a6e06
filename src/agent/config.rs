use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

use crate::guard::GuardSettings;

/// Clients that are often backgrounded lose session continuity more
/// easily and are validated more frequently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ClientClass {
    Mobile,
    #[default]
    Desktop,
}

impl ClientClass {
    pub fn default_interval(self) -> Duration {
        match self {
            ClientClass::Mobile => Duration::from_secs(3 * 60),
            ClientClass::Desktop => Duration::from_secs(5 * 60),
        }
    }
}

impl std::str::FromStr for ClientClass {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "mobile" => Ok(ClientClass::Mobile),
            "desktop" => Ok(ClientClass::Desktop),
            other => bail!("unknown client class: {other}"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuardConfig {
    #[serde(default)]
    pub client_class: ClientClass,
    /// Overrides the client class interval when set.
    #[serde(default)]
    pub validation_interval_secs: Option<u64>,
    #[serde(default)]
    pub interval_jitter_secs: u64,
    #[serde(default = "default_escalation_threshold")]
    pub escalation_threshold: u32,
    #[serde(default = "default_expiry_warning_secs")]
    pub expiry_warning_secs: u64,
    #[serde(default = "default_settle_window_ms")]
    pub settle_window_ms: u64,
    #[serde(default = "default_credential_prefixes")]
    pub credential_prefixes: Vec<String>,
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
}

fn default_escalation_threshold() -> u32 {
    3
}
fn default_expiry_warning_secs() -> u64 {
    300
}
fn default_settle_window_ms() -> u64 {
    100
}
fn default_credential_prefixes() -> Vec<String> {
    vec!["auth.".to_string(), "session.".to_string()]
}
fn default_state_dir() -> PathBuf {
    PathBuf::from("./state")
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            client_class: ClientClass::default(),
            validation_interval_secs: None,
            interval_jitter_secs: 0,
            escalation_threshold: default_escalation_threshold(),
            expiry_warning_secs: default_expiry_warning_secs(),
            settle_window_ms: default_settle_window_ms(),
            credential_prefixes: default_credential_prefixes(),
            state_dir: default_state_dir(),
        }
    }
}

impl GuardConfig {
    pub fn from_file(path: &str) -> Result<Self> {
        let raw = fs::read_to_string(path).context("reading config file")?;
        let mut cfg: GuardConfig = serde_json::from_str(&raw).context("parsing JSON")?;
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Like [`GuardConfig::from_file`], but a missing file yields defaults.
    pub fn load(path: &str) -> Result<Self> {
        if Path::new(path).exists() {
            return Self::from_file(path);
        }
        info!(path, "config file not found, using defaults");
        let mut cfg = Self::default();
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(class) = std::env::var("GUARD_CLIENT_CLASS") {
            self.client_class = class.parse()?;
        }
        if let Ok(secs) = std::env::var("GUARD_INTERVAL_SECS") {
            self.validation_interval_secs =
                Some(secs.parse().context("parsing GUARD_INTERVAL_SECS")?);
        }
        if let Ok(threshold) = std::env::var("GUARD_ESCALATION_THRESHOLD") {
            self.escalation_threshold = threshold
                .parse()
                .context("parsing GUARD_ESCALATION_THRESHOLD")?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.escalation_threshold == 0 {
            bail!("escalation_threshold must be at least 1");
        }
        if self.validation_interval_secs == Some(0) {
            bail!("validation_interval_secs must be positive");
        }
        if self.credential_prefixes.is_empty() {
            bail!("credential_prefixes must not be empty");
        }
        // An empty prefix would match every key in a shared store.
        if self.credential_prefixes.iter().any(|p| p.is_empty()) {
            bail!("credential_prefixes must not contain an empty prefix");
        }
        Ok(())
    }

    pub fn validation_interval(&self) -> Duration {
        self.validation_interval_secs
            .map(Duration::from_secs)
            .unwrap_or_else(|| self.client_class.default_interval())
    }

    pub fn interval_jitter(&self) -> Duration {
        Duration::from_secs(self.interval_jitter_secs)
    }

    pub fn guard_settings(&self) -> GuardSettings {
        GuardSettings {
            escalation_threshold: self.escalation_threshold,
            expiry_warning: Duration::from_secs(self.expiry_warning_secs),
            settle_window: Duration::from_millis(self.settle_window_ms),
        }
    }

    pub fn durable_store_path(&self) -> PathBuf {
        self.state_dir.join("durable.json")
    }

    /// Durable key under which the consuming app records its signed-in subject.
    pub fn subject_key(&self) -> String {
        format!("{}subject", self.credential_prefixes[0])
    }
}
