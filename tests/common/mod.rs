#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use session_guard::guard::{CleanupCascade, GuardSettings, Reloader, SessionGuard, SignOutEvent};
use session_guard::session::{ProviderError, Session, SessionOracle, SystemClock};
use session_guard::storage::MemoryStore;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Provider stand-in whose answers the test controls.
#[derive(Default)]
pub struct FakeProvider {
    pub subject: Mutex<Option<String>>,
    pub fail_fetch: AtomicBool,
    pub fail_revoke: AtomicBool,
    pub queries: AtomicUsize,
    pub revokes: AtomicUsize,
}

impl FakeProvider {
    pub fn signed_in(subject: &str) -> Self {
        let provider = Self::default();
        *provider.subject.lock().unwrap() = Some(subject.to_string());
        provider
    }

    pub fn set_subject(&self, subject: Option<&str>) {
        *self.subject.lock().unwrap() = subject.map(str::to_string);
    }

    pub fn revokes(&self) -> usize {
        self.revokes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SessionOracle for FakeProvider {
    async fn current_session(&self) -> Result<Option<Session>, ProviderError> {
        self.queries.fetch_add(1, Ordering::SeqCst);
        if self.fail_fetch.load(Ordering::SeqCst) {
            return Err(ProviderError::Status(503));
        }
        let now = Utc::now();
        Ok(self.subject.lock().unwrap().clone().map(|subject_id| Session {
            subject_id,
            expires_at: now + ChronoDuration::hours(1),
            fetched_at: now,
        }))
    }

    async fn revoke_session(&self) -> Result<(), ProviderError> {
        self.revokes.fetch_add(1, Ordering::SeqCst);
        if self.fail_revoke.load(Ordering::SeqCst) {
            return Err(ProviderError::Transport("connection reset".to_string()));
        }
        *self.subject.lock().unwrap() = None;
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingReloader {
    pub reloads: AtomicUsize,
}

#[async_trait]
impl Reloader for RecordingReloader {
    async fn reload(&self) {
        self.reloads.fetch_add(1, Ordering::SeqCst);
    }
}

pub struct Client {
    pub guard: SessionGuard,
    pub provider: Arc<FakeProvider>,
    pub reloader: Arc<RecordingReloader>,
    pub ephemeral: MemoryStore,
    pub durable: MemoryStore,
    pub cookies: MemoryStore,
    pub events: Arc<Mutex<Vec<SignOutEvent>>>,
}

impl Client {
    pub async fn new(provider: FakeProvider) -> Self {
        let provider = Arc::new(provider);
        let reloader = Arc::new(RecordingReloader::default());

        let ephemeral = MemoryStore::new("ephemeral");
        ephemeral.set("auth.access_token", "access").await;
        ephemeral.set("ui.tab", "habits").await;
        let durable = MemoryStore::new("durable");
        durable.set("auth.refresh_token", "refresh").await;
        durable.set("challenges.joined", "[7]").await;
        let cookies = MemoryStore::new("cookies");
        cookies.set("session.id", "sid").await;
        cookies.set("locale", "en").await;

        let cascade = CleanupCascade::new(
            provider.clone(),
            Arc::new(ephemeral.clone()),
            Arc::new(durable.clone()),
            Arc::new(cookies.clone()),
            reloader.clone(),
            vec!["auth.".to_string(), "session.".to_string()],
        );
        let guard = SessionGuard::new(
            GuardSettings::default(),
            provider.clone(),
            cascade,
            Arc::new(SystemClock),
        );

        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        guard.on_forced_sign_out(move |event| sink.lock().unwrap().push(event.clone()));

        Self {
            guard,
            provider,
            reloader,
            ephemeral,
            durable,
            cookies,
            events,
        }
    }

    pub fn events(&self) -> Vec<SignOutEvent> {
        self.events.lock().unwrap().clone()
    }
}
