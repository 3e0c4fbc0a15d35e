//! Worker pool: a fixed set of supervised worker slots with least-loaded
//! dispatch and per-worker queue caps.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{oneshot, watch};

use crate::config::Settings;
use crate::error::{PotatError, Result};

use super::CommandRelay;
use super::supervisor::{JobEnvelope, SlotState, spawn_supervisor};

/// A fixed-size pool of worker subprocesses.
pub struct WorkerPool {
    slots: Vec<Arc<SlotState>>,
    settings: Arc<Settings>,
    shutdown: watch::Sender<bool>,
}

impl WorkerPool {
    /// Start `maxChildProcessCount` supervisors. Workers fork and report
    /// ready asynchronously; dispatch before then fails queue-full.
    pub fn new(settings: Arc<Settings>, relay: Arc<dyn CommandRelay>) -> Self {
        let (shutdown, shutdown_rx) = watch::channel(false);

        tracing::info!(
            workers = settings.max_child_process_count,
            queue_size = settings.queue_size,
            "Initializing worker pool"
        );

        let slots = (0..settings.max_child_process_count)
            .map(|index| {
                spawn_supervisor(index, settings.clone(), relay.clone(), shutdown_rx.clone())
            })
            .collect();

        Self {
            slots,
            settings,
            shutdown,
        }
    }

    /// Assign a job to the least-loaded ready worker.
    ///
    /// The pipeline calls this from its single admission loop, so selection
    /// is serialised; waiting on the returned handle is not.
    pub fn assign(&self, code: String, msg: Option<Value>, socket: bool) -> Result<InFlight> {
        let mut best: Option<(usize, _, Arc<AtomicUsize>)> = None;
        for slot in &self.slots {
            let Some((depth, tx, queue)) = slot.candidate() else {
                continue;
            };
            if depth >= self.settings.queue_size {
                continue;
            }
            // Strict less-than keeps ties on the earliest slot.
            if best.as_ref().is_none_or(|(d, _, _)| depth < *d) {
                best = Some((depth, tx, queue));
            }
        }

        let Some((_, tx, queue)) = best else {
            return Err(PotatError::QueueFull);
        };

        queue.fetch_add(1, Ordering::SeqCst);
        let guard = QueueGuard(queue);

        let (reply, rx) = oneshot::channel();
        tx.send(JobEnvelope {
            code,
            msg,
            socket,
            reply,
        })
        .map_err(|_| PotatError::WorkerUnresponsive)?;

        Ok(InFlight {
            rx,
            _guard: guard,
            timeout: Duration::from_millis(self.settings.workers_time_out),
        })
    }

    /// Convenience: assign and wait.
    pub async fn dispatch(&self, code: String, msg: Option<Value>, socket: bool) -> Result<String> {
        self.assign(code, msg, socket)?.wait().await
    }

    /// Number of slots with a live, ready child.
    pub fn ready_count(&self) -> usize {
        self.slots.iter().filter(|s| s.is_ready()).count()
    }

    pub fn worker_count(&self) -> usize {
        self.slots.len()
    }

    /// Aggregate statistics for health reporting.
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            worker_count: self.worker_count(),
            ready: self.ready_count(),
            jobs_completed: self.slots.iter().map(|s| s.jobs_completed()).sum(),
            restarts: self.slots.iter().map(|s| s.restarts()).sum(),
        }
    }

    /// Ask every supervisor to exit its child and stop respawning.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Statistics about the worker pool.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolStats {
    pub worker_count: usize,
    pub ready: usize,
    pub jobs_completed: usize,
    pub restarts: usize,
}

/// A dispatched job awaiting its result.
#[derive(Debug)]
pub struct InFlight {
    rx: oneshot::Receiver<Result<String>>,
    _guard: QueueGuard,
    timeout: Duration,
}

impl InFlight {
    /// Wait for the worker's reply, bounded by the per-dispatch timeout.
    ///
    /// The queue counter is released whichever way this resolves.
    pub async fn wait(self) -> Result<String> {
        match tokio::time::timeout(self.timeout, self.rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(PotatError::WorkerUnresponsive),
            Err(_) => Err(PotatError::WorkerTimeout),
        }
    }
}

/// Decrements the owning generation's queue counter on drop.
#[derive(Debug)]
struct QueueGuard(Arc<AtomicUsize>);

impl Drop for QueueGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct NoRelay;

    #[async_trait::async_trait]
    impl CommandRelay for NoRelay {
        fn has_clients(&self) -> bool {
            false
        }
        async fn relay(&self, _id: &str, _name: &str, _msg: Value) -> Value {
            json!({"error": "No client connected"})
        }
    }

    // Note: pools with real workers re-exec the current binary, which in a
    // unit test is the test harness itself. Live pool behavior is covered
    // by tests/worker.rs against the actual binary; these tests stick to
    // an empty pool.

    fn test_settings() -> Arc<Settings> {
        let mut settings = Settings::default();
        settings.port = 1;
        settings.auth = "testy".into();
        settings.max_child_process_count = 0;
        Arc::new(settings)
    }

    #[tokio::test]
    async fn test_dispatch_with_no_ready_worker_is_queue_full() {
        let pool = WorkerPool::new(test_settings(), Arc::new(NoRelay));
        let err = pool.assign("1+1".into(), None, false).unwrap_err();
        assert!(matches!(err, PotatError::QueueFull));
    }

    #[tokio::test]
    async fn test_stats_shape() {
        let pool = WorkerPool::new(test_settings(), Arc::new(NoRelay));
        let stats = pool.stats();
        assert_eq!(stats.worker_count, 0);
        assert_eq!(stats.ready, 0);
        assert_eq!(stats.jobs_completed, 0);
        pool.shutdown();
    }
}
