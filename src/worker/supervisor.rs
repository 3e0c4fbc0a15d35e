//! Worker supervision.
//!
//! One supervisor per worker slot. Each runs a forever-loop: fork a child,
//! attach a request handler, route responses, and on any sign of death
//! (exit, IO error, liveness abort) tear the generation down, fail the
//! outstanding callers, wait a second, and fork again.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, oneshot, watch};

use crate::config::Settings;
use crate::error::{PotatError, Result};

use super::CommandRelay;
use super::protocol::{ChildMessage, ParentMessage};
use super::spawn::spawn_worker;

/// A request arrived but no reply has come for this long: the child is
/// presumed wedged and killed.
const LIVENESS_GAP: Duration = Duration::from_secs(60);

/// Pause between a child's death and the next fork.
const RESPAWN_DELAY: Duration = Duration::from_secs(1);

/// One queued evaluation, handed from the pool to a supervisor.
pub struct JobEnvelope {
    pub code: String,
    pub msg: Option<Value>,
    pub socket: bool,
    pub reply: oneshot::Sender<Result<String>>,
}

/// Handle to the current child generation.
///
/// A fresh counter cell is installed with every fork so late decrements
/// from a previous generation cannot corrupt the new child's accounting.
struct Generation {
    tx: mpsc::UnboundedSender<JobEnvelope>,
    queue: Arc<AtomicUsize>,
}

/// Shared view of one worker slot, owned by the pool.
pub struct SlotState {
    pub index: usize,
    ready: AtomicBool,
    generation: Mutex<Option<Generation>>,
    jobs_completed: AtomicUsize,
    restarts: AtomicUsize,
}

impl SlotState {
    fn new(index: usize) -> Self {
        Self {
            index,
            ready: AtomicBool::new(false),
            generation: Mutex::new(None),
            jobs_completed: AtomicUsize::new(0),
            restarts: AtomicUsize::new(0),
        }
    }

    /// Snapshot for dispatch: queue depth and a sender, if this slot has a
    /// live child attached.
    pub fn candidate(&self) -> Option<(usize, mpsc::UnboundedSender<JobEnvelope>, Arc<AtomicUsize>)> {
        if !self.ready.load(Ordering::SeqCst) {
            return None;
        }
        let generation = self.generation.lock().expect("slot mutex poisoned");
        generation
            .as_ref()
            .map(|g| (g.queue.load(Ordering::SeqCst), g.tx.clone(), g.queue.clone()))
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    pub fn jobs_completed(&self) -> usize {
        self.jobs_completed.load(Ordering::Relaxed)
    }

    pub fn restarts(&self) -> usize {
        self.restarts.load(Ordering::Relaxed)
    }

    fn install_generation(&self, generation: Generation) {
        *self.generation.lock().expect("slot mutex poisoned") = Some(generation);
    }

    fn drop_generation(&self) {
        self.ready.store(false, Ordering::SeqCst);
        *self.generation.lock().expect("slot mutex poisoned") = None;
    }
}

/// Spawn a supervisor task for one worker slot.
///
/// Returns the shared slot state the pool dispatches through.
pub fn spawn_supervisor(
    index: usize,
    settings: Arc<Settings>,
    relay: Arc<dyn CommandRelay>,
    mut shutdown: watch::Receiver<bool>,
) -> Arc<SlotState> {
    let slot = Arc::new(SlotState::new(index));
    let task_slot = slot.clone();

    tokio::spawn(async move {
        loop {
            if *shutdown.borrow() {
                break;
            }

            match run_generation(&task_slot, &settings, &relay, &mut shutdown).await {
                Ok(GenerationEnd::Shutdown) => break,
                Ok(GenerationEnd::ChildGone) => {
                    tracing::warn!(worker_id = index, "Worker died, respawning");
                }
                Err(e) => {
                    tracing::warn!(worker_id = index, error = %e, "Worker generation failed");
                }
            }

            task_slot.drop_generation();
            task_slot.restarts.fetch_add(1, Ordering::Relaxed);
            tokio::time::sleep(RESPAWN_DELAY).await;
        }

        task_slot.drop_generation();
        tracing::debug!(worker_id = index, "Supervisor stopped");
    });

    slot
}

enum GenerationEnd {
    ChildGone,
    Shutdown,
}

/// Run one child generation to completion.
async fn run_generation(
    slot: &Arc<SlotState>,
    settings: &Arc<Settings>,
    relay: &Arc<dyn CommandRelay>,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<GenerationEnd> {
    let mut child = spawn_worker(settings, slot.index)?;

    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| PotatError::Worker("Child stdin not captured".into()))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| PotatError::Worker("Child stdout not captured".into()))?;

    // All writes to the child funnel through one task so job dispatch and
    // command replies cannot interleave mid-line.
    let (write_tx, mut write_rx) = mpsc::unbounded_channel::<ParentMessage>();
    let writer = tokio::spawn(async move {
        let mut stdin = stdin;
        while let Some(message) = write_rx.recv().await {
            if stdin.write_all(message.to_line().as_bytes()).await.is_err() {
                break;
            }
        }
        let _ = stdin.shutdown().await;
    });

    let (job_tx, mut job_rx) = mpsc::unbounded_channel::<JobEnvelope>();
    slot.install_generation(Generation {
        tx: job_tx,
        queue: Arc::new(AtomicUsize::new(0)),
    });

    let mut lines = BufReader::new(stdout).lines();
    let mut pending: HashMap<u64, oneshot::Sender<Result<String>>> = HashMap::new();
    let mut next_id: u64 = 0;

    let started = Instant::now();
    let mut last_request_at = started;
    let mut last_response_at = started;

    let mut liveness = tokio::time::interval(Duration::from_secs(1));
    liveness.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    let end = loop {
        tokio::select! {
            envelope = job_rx.recv() => {
                let Some(envelope) = envelope else { break GenerationEnd::ChildGone };
                let id = next_id;
                next_id += 1;
                last_request_at = Instant::now();
                pending.insert(id, envelope.reply);
                let sent = write_tx.send(ParentMessage::Job {
                    id,
                    code: envelope.code,
                    msg: envelope.msg,
                    socket: envelope.socket,
                });
                if sent.is_err() {
                    break GenerationEnd::ChildGone;
                }
            }

            line = lines.next_line() => {
                let line = match line {
                    Ok(Some(line)) => line,
                    // EOF or pipe error: the child is gone.
                    _ => break GenerationEnd::ChildGone,
                };
                let message = match ChildMessage::from_line(&line) {
                    Ok(message) => message,
                    Err(e) => {
                        tracing::warn!(worker_id = slot.index, error = %e, "Invalid worker message");
                        continue;
                    }
                };
                match message {
                    ChildMessage::Ready => {
                        slot.ready.store(true, Ordering::SeqCst);
                        tracing::debug!(worker_id = slot.index, "Worker ready");
                    }
                    ChildMessage::Result { id, result } => {
                        last_response_at = Instant::now();
                        slot.jobs_completed.fetch_add(1, Ordering::Relaxed);
                        if let Some(reply) = pending.remove(&id) {
                            let _ = reply.send(Ok(result));
                        }
                    }
                    ChildMessage::Error { id, message } => {
                        last_response_at = Instant::now();
                        if let Some(reply) = pending.remove(&id) {
                            let _ = reply.send(Err(PotatError::Worker(message)));
                        }
                    }
                    ChildMessage::Command { id, name, msg } => {
                        let relay = relay.clone();
                        let write_tx = write_tx.clone();
                        tokio::spawn(async move {
                            let data = relay.relay(&id, &name, msg).await;
                            let _ = write_tx.send(ParentMessage::CommandReply { id, data });
                        });
                    }
                }
            }

            _ = liveness.tick() => {
                if last_request_at > last_response_at
                    && last_request_at.elapsed() > LIVENESS_GAP
                {
                    tracing::warn!(
                        worker_id = slot.index,
                        outstanding = pending.len(),
                        "Worker unresponsive, killing"
                    );
                    let _ = child.start_kill();
                    break GenerationEnd::ChildGone;
                }
            }

            changed = shutdown.changed() => {
                // A dropped sender means the pool is gone; treat it as
                // shutdown.
                if changed.is_err() || *shutdown.borrow() {
                    let _ = write_tx.send(ParentMessage::Exit);
                    break GenerationEnd::Shutdown;
                }
            }
        }
    };

    // Tear down: detach the handler first so the pool stops routing here.
    slot.drop_generation();
    for (_, reply) in pending.drain() {
        let _ = reply.send(Err(PotatError::WorkerUnresponsive));
    }

    match tokio::time::timeout(Duration::from_secs(5), child.wait()).await {
        Ok(Ok(status)) => {
            tracing::debug!(worker_id = slot.index, ?status, "Worker exited");
        }
        _ => {
            let _ = child.kill().await;
        }
    }

    // In-flight command relays may still hold writer senders; abort rather
    // than wait out their timeouts.
    drop(write_tx);
    writer.abort();

    Ok(end)
}
