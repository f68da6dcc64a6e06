//! Scripted collaborators shared by the guard's unit tests.

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

use super::{CleanupCascade, GuardSettings, Reloader, SessionGuard, SignOutEvent};
use crate::session::{Clock, ManualClock, ProviderError, Session, SessionOracle};
use crate::storage::MemoryStore;

pub(crate) struct ScriptedOracle {
    clock: ManualClock,
    subject: Mutex<Option<String>>,
    expires_in: Mutex<chrono::Duration>,
    pub fail_fetch: AtomicBool,
    pub fail_revoke: AtomicBool,
    pub hold_fetch: AtomicBool,
    pub release: Notify,
    pub hold_revoke: AtomicBool,
    pub revoke_release: Notify,
    queries: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    revokes: AtomicUsize,
}

impl ScriptedOracle {
    fn new(clock: ManualClock) -> Self {
        Self {
            clock,
            subject: Mutex::new(None),
            expires_in: Mutex::new(chrono::Duration::hours(1)),
            fail_fetch: AtomicBool::new(false),
            fail_revoke: AtomicBool::new(false),
            hold_fetch: AtomicBool::new(false),
            release: Notify::new(),
            hold_revoke: AtomicBool::new(false),
            revoke_release: Notify::new(),
            queries: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            revokes: AtomicUsize::new(0),
        }
    }

    pub fn set_subject(&self, subject: Option<&str>) {
        *self.subject.lock().unwrap() = subject.map(str::to_string);
    }

    pub fn set_expires_in(&self, expires_in: chrono::Duration) {
        *self.expires_in.lock().unwrap() = expires_in;
    }

    pub fn queries(&self) -> usize {
        self.queries.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn revokes(&self) -> usize {
        self.revokes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SessionOracle for ScriptedOracle {
    async fn current_session(&self) -> Result<Option<Session>, ProviderError> {
        self.queries.fetch_add(1, Ordering::SeqCst);
        let now_in_flight = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now_in_flight, Ordering::SeqCst);

        if self.hold_fetch.load(Ordering::SeqCst) {
            self.release.notified().await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if self.fail_fetch.load(Ordering::SeqCst) {
            return Err(ProviderError::Transport("connection refused".to_string()));
        }
        let now = self.clock.now();
        let expires_in = *self.expires_in.lock().unwrap();
        Ok(self.subject.lock().unwrap().clone().map(|subject_id| Session {
            subject_id,
            expires_at: now + expires_in,
            fetched_at: now,
        }))
    }

    async fn revoke_session(&self) -> Result<(), ProviderError> {
        self.revokes.fetch_add(1, Ordering::SeqCst);
        if self.hold_revoke.load(Ordering::SeqCst) {
            self.revoke_release.notified().await;
        }
        if self.fail_revoke.load(Ordering::SeqCst) {
            return Err(ProviderError::Timeout);
        }
        *self.subject.lock().unwrap() = None;
        Ok(())
    }
}

#[derive(Default)]
pub(crate) struct CountingReloader {
    reloads: AtomicUsize,
}

impl CountingReloader {
    pub fn reloads(&self) -> usize {
        self.reloads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Reloader for CountingReloader {
    async fn reload(&self) {
        self.reloads.fetch_add(1, Ordering::SeqCst);
    }
}

pub(crate) struct Harness {
    pub guard: SessionGuard,
    pub oracle: Arc<ScriptedOracle>,
    pub clock: ManualClock,
    pub reloader: Arc<CountingReloader>,
    pub ephemeral: MemoryStore,
    pub durable: MemoryStore,
    pub ambient: MemoryStore,
    pub events: Arc<Mutex<Vec<SignOutEvent>>>,
}

impl Harness {
    pub async fn new() -> Self {
        Self::with_settings(GuardSettings::default()).await
    }

    pub async fn with_settings(settings: GuardSettings) -> Self {
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap());
        let oracle = Arc::new(ScriptedOracle::new(clock.clone()));
        let reloader = Arc::new(CountingReloader::default());

        let ephemeral = MemoryStore::new("ephemeral");
        ephemeral.set("auth.access_token", "tok").await;
        ephemeral.set("recipes.draft", "{}").await;
        let durable = MemoryStore::new("durable");
        durable.set("auth.refresh_token", "ref").await;
        durable.set("habits.order", "[1,2,3]").await;
        let ambient = MemoryStore::new("ambient");
        ambient.set("session.cookie", "c").await;

        let cascade = CleanupCascade::new(
            oracle.clone(),
            Arc::new(ephemeral.clone()),
            Arc::new(durable.clone()),
            Arc::new(ambient.clone()),
            reloader.clone(),
            vec!["auth.".to_string(), "session.".to_string()],
        );
        let guard = SessionGuard::new(settings, oracle.clone(), cascade, Arc::new(clock.clone()));

        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        guard.on_forced_sign_out(move |event| sink.lock().unwrap().push(event.clone()));

        Self {
            guard,
            oracle,
            clock,
            reloader,
            ephemeral,
            durable,
            ambient,
            events,
        }
    }

    pub fn events(&self) -> Vec<SignOutEvent> {
        self.events.lock().unwrap().clone()
    }
}
