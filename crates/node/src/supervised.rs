//! Supervised Tasks
//!
//! Long-lived tasks whose loss would silently cripple the agent (the
//! command processor above all) run under a supervisor: if the task
//! terminates with a panic it is logged as critical and immediately
//! respawned from its factory. A clean return or a cancellation ends
//! supervision.
//!
//! ## Guarantees
//!
//! - At most one instance of the supervised future is live at any time:
//!   the supervisor only respawns after the previous instance's join
//!   completes.
//! - `abort()` cancels the running instance and stops supervision; an
//!   aborted instance is never respawned.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, error};

pub struct SupervisedTask {
    name: String,
    outer: Mutex<Option<JoinHandle<()>>>,
    current: Arc<Mutex<Option<AbortHandle>>>,
    restarts: Arc<AtomicU64>,
}

impl SupervisedTask {
    /// Spawn `factory()` under supervision. The factory is invoked once
    /// immediately and once more after every panic of the produced future.
    pub fn spawn<F, Fut>(name: impl Into<String>, factory: F) -> Self
    where
        F: Fn() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let name = name.into();
        let current: Arc<Mutex<Option<AbortHandle>>> = Arc::new(Mutex::new(None));
        let restarts = Arc::new(AtomicU64::new(0));

        let outer = {
            let name = name.clone();
            let current = Arc::clone(&current);
            let restarts = Arc::clone(&restarts);
            tokio::spawn(async move {
                loop {
                    let inner = tokio::spawn(factory());
                    *current.lock() = Some(inner.abort_handle());
                    match inner.await {
                        Ok(()) => {
                            debug!(task = %name, "supervised task exited cleanly");
                            break;
                        }
                        Err(e) if e.is_panic() => {
                            // Losing this task permanently is worse than any
                            // single failure; respawn and keep serving.
                            error!(task = %name, "critical: supervised task crashed, respawning");
                            restarts.fetch_add(1, Ordering::AcqRel);
                        }
                        Err(_) => {
                            debug!(task = %name, "supervised task cancelled");
                            break;
                        }
                    }
                }
                current.lock().take();
            })
        };

        Self {
            name,
            outer: Mutex::new(Some(outer)),
            current,
            restarts,
        }
    }

    /// Cancel the running instance and stop supervision.
    pub fn abort(&self) {
        if let Some(handle) = self.current.lock().as_ref() {
            handle.abort();
        }
        if let Some(outer) = self.outer.lock().as_ref() {
            outer.abort();
        }
    }

    /// Wait for supervision to end (clean exit or abort). Subsequent
    /// calls return immediately.
    pub async fn join(&self) {
        let handle = self.outer.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    pub fn is_finished(&self) -> bool {
        match self.outer.lock().as_ref() {
            Some(handle) => handle.is_finished(),
            None => true,
        }
    }

    /// Number of times the task has been respawned after a crash.
    pub fn restarts(&self) -> u64 {
        self.restarts.load(Ordering::Acquire)
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::sync::Notify;
    use tokio::time::timeout;

    #[tokio::test]
    async fn clean_exit_is_not_respawned() {
        let runs = Arc::new(AtomicU64::new(0));
        let task = SupervisedTask::spawn("clean", {
            let runs = Arc::clone(&runs);
            move || {
                let runs = Arc::clone(&runs);
                async move {
                    runs.fetch_add(1, Ordering::SeqCst);
                }
            }
        });
        timeout(Duration::from_secs(1), task.join())
            .await
            .expect("join");
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(task.restarts(), 0);
        assert!(task.is_finished());
    }

    #[tokio::test]
    async fn respawns_after_panic() {
        let attempts = Arc::new(AtomicU64::new(0));
        let done = Arc::new(Notify::new());
        let task = SupervisedTask::spawn("crashy", {
            let attempts = Arc::clone(&attempts);
            let done = Arc::clone(&done);
            move || {
                let attempts = Arc::clone(&attempts);
                let done = Arc::clone(&done);
                async move {
                    let n = attempts.fetch_add(1, Ordering::SeqCst) + 1;
                    if n == 1 {
                        panic!("first instance dies");
                    }
                    done.notify_one();
                }
            }
        });
        timeout(Duration::from_secs(2), done.notified())
            .await
            .expect("second instance runs");
        timeout(Duration::from_secs(2), task.join())
            .await
            .expect("join");
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
        assert_eq!(task.restarts(), 1);
    }

    #[tokio::test]
    async fn abort_stops_a_running_instance() {
        let task = SupervisedTask::spawn("forever", || async {
            loop {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        task.abort();
        timeout(Duration::from_secs(1), task.join())
            .await
            .expect("join after abort");
        assert!(task.is_finished());
        assert_eq!(task.restarts(), 0);
    }
}
