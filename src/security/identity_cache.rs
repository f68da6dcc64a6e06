use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

/// How a reported subject relates to the cached one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Observation {
    /// Cache was empty and adopted the subject.
    FirstObservation { subject_id: String },
    /// Same subject as cached.
    Continuity,
    /// Consumer reported no subject; cache cleared.
    Cleared { previous: Option<String> },
    /// Cached `expected` but the consumer now reports `observed`.
    Drift { expected: String, observed: String },
}

#[derive(Debug, Default)]
struct CacheState {
    subject_id: Option<String>,
    adopted_at: Option<DateTime<Utc>>,
}

/// Last subject the guard associated with the active context.
///
/// Only drift resolution (through the cleanup cascade) or an explicit
/// clear ever removes a cached subject. Failed validation ticks never do.
#[derive(Debug, Clone, Default)]
pub struct IdentityCache {
    state: Arc<RwLock<CacheState>>,
}

impl IdentityCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn subject_id(&self) -> Option<String> {
        self.state.read().await.subject_id.clone()
    }

    pub async fn adopted_at(&self) -> Option<DateTime<Utc>> {
        self.state.read().await.adopted_at
    }

    /// Classify `reported` against the cache, adopting or clearing as needed.
    /// On drift the cache is left untouched.
    pub async fn observe(&self, reported: Option<&str>, now: DateTime<Utc>) -> Observation {
        let mut state = self.state.write().await;
        match (state.subject_id.as_deref(), reported) {
            (previous, None) => {
                let previous = previous.map(str::to_string);
                state.subject_id = None;
                state.adopted_at = None;
                Observation::Cleared { previous }
            }
            (None, Some(new_id)) => {
                state.subject_id = Some(new_id.to_string());
                state.adopted_at = Some(now);
                debug!(subject_id = %new_id, "identity adopted");
                Observation::FirstObservation {
                    subject_id: new_id.to_string(),
                }
            }
            (Some(cached), Some(new_id)) if cached == new_id => Observation::Continuity,
            (Some(cached), Some(new_id)) => Observation::Drift {
                expected: cached.to_string(),
                observed: new_id.to_string(),
            },
        }
    }

    /// Drop the cached subject.
    pub async fn clear(&self) {
        let mut state = self.state.write().await;
        state.subject_id = None;
        state.adopted_at = None;
    }
}
