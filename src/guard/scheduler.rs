use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::debug;

use super::{SubjectSource, WeakSessionGuard};

/// Owns the recurring validation task. Dropping the handle cancels it.
#[derive(Debug)]
pub struct SchedulerHandle {
    handle: Option<JoinHandle<()>>,
}

impl SchedulerHandle {
    /// Cancel the schedule. Idempotent.
    pub fn stop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }
}

impl Drop for SchedulerHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

fn jittered(interval: Duration, jitter: Duration) -> Duration {
    if jitter.is_zero() {
        return interval;
    }
    // Keep the rng out of the async state so the future stays Send.
    let extra_ms = {
        use rand::Rng;
        rand::thread_rng().gen_range(0..=jitter.as_millis() as u64)
    };
    interval + Duration::from_millis(extra_ms)
}

/// Validate immediately, then once per `interval` (+ up to `jitter`).
///
/// Each iteration feeds the source's believed subject into the guard and
/// awaits a full tick before sleeping, so ticks are strictly serialized.
/// The task holds only a weak reference and exits once the guard is gone.
pub fn spawn_validation_loop(
    guard: WeakSessionGuard,
    source: Arc<dyn SubjectSource>,
    interval: Duration,
    jitter: Duration,
) -> SchedulerHandle {
    let handle = tokio::spawn(async move {
        loop {
            let Some(active) = guard.upgrade() else {
                debug!("session guard dropped, validation loop exiting");
                break;
            };

            let believed = source.believed_subject().await;
            active.observe(believed.as_deref()).await;
            let result = active.validate().await;
            debug!(result = ?result, "validation tick finished");
            drop(active);

            sleep(jittered(interval, jitter)).await;
        }
    });

    SchedulerHandle {
        handle: Some(handle),
    }
}
