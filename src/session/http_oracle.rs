use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::AUTHORIZATION;
use reqwest::Client;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};

use super::{Clock, ProviderError, Session, SessionOracle, SystemClock};

/// Provider envelope: `{"session": {...}}` or `{"session": null}`.
#[derive(Debug, Deserialize)]
struct SessionEnvelope {
    #[serde(default)]
    session: Option<SessionBody>,
}

#[derive(Debug, Deserialize)]
struct SessionBody {
    subject_id: String,
    expires_at: DateTime<Utc>,
}

/// Remote Session Oracle backed by the provider's HTTP API.
#[derive(Debug, Clone)]
pub struct HttpSessionOracle {
    base_url: String,
    token: String,
    http_client: Client,
    clock: Arc<dyn Clock>,
}

impl HttpSessionOracle {
    pub fn new(base_url: impl Into<String>, token: impl Into<String>, timeout: Duration) -> Result<Self> {
        let http_client = Client::builder()
            .timeout(timeout)
            .build()
            .context("creating HTTP client")?;

        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
            http_client,
            clock: Arc::new(SystemClock),
        })
    }

    /// Create an oracle from environment variables.
    ///
    /// Environment variables:
    /// - `SESSION_ORACLE_URL`: provider base URL
    /// - `SESSION_ORACLE_TOKEN`: bearer token for the provider
    /// - `SESSION_ORACLE_TIMEOUT_SECS`: request timeout (default 10)
    pub fn from_env() -> Result<Option<Self>> {
        let base_url = std::env::var("SESSION_ORACLE_URL").ok();
        let token = std::env::var("SESSION_ORACLE_TOKEN").ok();
        let timeout = std::env::var("SESSION_ORACLE_TIMEOUT_SECS")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .unwrap_or(10);

        match (base_url, token) {
            (Some(base), Some(tok)) => {
                debug!(base_url = %base, "session oracle configured");
                Ok(Some(Self::new(base, tok, Duration::from_secs(timeout))?))
            }
            _ => {
                debug!("session oracle not configured (missing SESSION_ORACLE_URL or SESSION_ORACLE_TOKEN)");
                Ok(None)
            }
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    fn bearer(&self) -> String {
        format!("Bearer {}", self.token)
    }
}

fn map_transport(err: reqwest::Error) -> ProviderError {
    if err.is_timeout() {
        ProviderError::Timeout
    } else {
        ProviderError::Transport(err.to_string())
    }
}

#[async_trait]
impl SessionOracle for HttpSessionOracle {
    async fn current_session(&self) -> Result<Option<Session>, ProviderError> {
        let url = format!("{}/auth/v1/session", self.base_url);
        trace!(url = %url, "fetching current session");

        let response = self
            .http_client
            .get(&url)
            .header(AUTHORIZATION, self.bearer())
            .send()
            .await
            .map_err(map_transport)?;

        let status = response.status().as_u16();
        match status {
            200 => {
                let envelope: SessionEnvelope = response
                    .json()
                    .await
                    .map_err(|e| ProviderError::Decode(e.to_string()))?;
                Ok(envelope.session.map(|body| Session {
                    subject_id: body.subject_id,
                    expires_at: body.expires_at,
                    fetched_at: self.clock.now(),
                }))
            }
            401 | 404 => {
                debug!(status_code = status, "provider reports no session");
                Ok(None)
            }
            other => Err(ProviderError::Status(other)),
        }
    }

    async fn revoke_session(&self) -> Result<(), ProviderError> {
        let url = format!("{}/auth/v1/logout", self.base_url);
        let response = self
            .http_client
            .post(&url)
            .header(AUTHORIZATION, self.bearer())
            .send()
            .await
            .map_err(map_transport)?;

        let status = response.status();
        // 401 means the provider already dropped the session.
        if status.is_success() || status.as_u16() == 401 {
            Ok(())
        } else {
            Err(ProviderError::Status(status.as_u16()))
        }
    }
}
