use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// Identifies one Idle → Running → Idle cycle of a background component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RunId(u64);

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "run-{}", self.0)
    }
}

struct ActiveRun {
    id: RunId,
    token: CancellationToken,
    tracker: TaskTracker,
}

type Slot = Arc<Mutex<Option<ActiveRun>>>;

fn clear_if_current(slot: &Slot, id: RunId) -> bool {
    let mut run = slot.lock().unwrap_or_else(PoisonError::into_inner);
    if run.as_ref().is_some_and(|r| r.id == id) {
        *run = None;
        return true;
    }
    false
}

/// Idempotent start/stop for a cancellable background loop.
///
/// Each run gets a child of the caller's token and its own task tracker. The
/// loop returns to Idle on its own when the parent token is cancelled.
pub(crate) struct Lifecycle {
    name: &'static str,
    slot: Slot,
    next_id: AtomicU64,
}

impl Lifecycle {
    pub(crate) fn new(name: &'static str) -> Self {
        Self {
            name,
            slot: Arc::new(Mutex::new(None)),
            next_id: AtomicU64::new(0),
        }
    }

    /// Spawn `body` unless a run is already active, in which case that run's
    /// id is returned and nothing changes.
    pub(crate) fn start<F, Fut>(&self, parent: &CancellationToken, body: F) -> RunId
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut guard = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(run) = guard.as_ref() {
            if !run.token.is_cancelled() {
                return run.id;
            }
        }

        let id = RunId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        let token = parent.child_token();
        let tracker = TaskTracker::new();

        let name = self.name;
        let slot = self.slot.clone();
        let run = body(token.clone());
        tracker.spawn(async move {
            run.await;
            if clear_if_current(&slot, id) {
                tracing::info!(component = name, run_id = %id, "Stopped after parent cancellation");
            }
        });

        tracing::info!(component = name, run_id = %id, "Started");
        *guard = Some(ActiveRun { id, token, tracker });
        id
    }

    /// Cancel the active run and wait for its tasks. Returns false when
    /// `deadline` elapsed first; the stragglers are left to finish alone.
    pub(crate) async fn stop(&self, deadline: Option<Duration>) -> bool {
        let run = self
            .slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(run) = run else {
            return true;
        };

        run.token.cancel();
        run.tracker.close();
        let drained = match deadline {
            Some(deadline) => tokio::time::timeout(deadline, run.tracker.wait())
                .await
                .is_ok(),
            None => {
                run.tracker.wait().await;
                true
            }
        };

        if drained {
            tracing::info!(component = self.name, run_id = %run.id, "Stopped");
        } else {
            tracing::warn!(
                component = self.name,
                run_id = %run.id,
                remaining = run.tracker.len(),
                "Stop deadline elapsed with work still in flight"
            );
        }
        drained
    }

    pub(crate) fn run_id(&self) -> Option<RunId> {
        self.slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .filter(|run| !run.token.is_cancelled())
            .map(|run| run.id)
    }

    pub(crate) fn is_running(&self) -> bool {
        self.run_id().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn idle_loop(token: CancellationToken) -> impl Future<Output = ()> + Send + 'static {
        async move { token.cancelled().await }
    }

    #[tokio::test]
    async fn start_is_idempotent() {
        let lifecycle = Lifecycle::new("test");
        let root = CancellationToken::new();
        let first = lifecycle.start(&root, idle_loop);
        let second = lifecycle.start(&root, idle_loop);
        assert_eq!(first, second);
        assert!(lifecycle.stop(Some(Duration::from_secs(1))).await);
    }

    #[tokio::test]
    async fn restart_gets_a_new_run() {
        let lifecycle = Lifecycle::new("test");
        let root = CancellationToken::new();
        let first = lifecycle.start(&root, idle_loop);
        lifecycle.stop(None).await;
        let second = lifecycle.start(&root, idle_loop);
        assert_ne!(first, second);
        lifecycle.stop(None).await;
    }

    #[tokio::test]
    async fn stop_when_idle_is_a_noop() {
        let lifecycle = Lifecycle::new("test");
        assert!(lifecycle.stop(Some(Duration::from_millis(10))).await);
        assert!(lifecycle.stop(None).await);
        assert!(!lifecycle.is_running());
    }

    #[tokio::test]
    async fn stop_returns_at_deadline() {
        let lifecycle = Lifecycle::new("test");
        let root = CancellationToken::new();
        lifecycle.start(&root, |_token| std::future::pending());

        let start = tokio::time::Instant::now();
        let drained = lifecycle.stop(Some(Duration::from_millis(50))).await;
        assert!(!drained);
        assert!(start.elapsed() < Duration::from_secs(1));
        assert!(!lifecycle.is_running());
    }

    #[tokio::test]
    async fn parent_cancellation_returns_to_idle() {
        let lifecycle = Lifecycle::new("test");
        let root = CancellationToken::new();
        lifecycle.start(&root, idle_loop);
        root.cancel();

        // The run counts as stopped immediately, and the slot is cleared
        // once the loop observes the cancellation.
        assert!(!lifecycle.is_running());
        for _ in 0..50 {
            if lifecycle
                .slot
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .is_none()
            {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("run slot was not cleared after parent cancellation");
    }
}
