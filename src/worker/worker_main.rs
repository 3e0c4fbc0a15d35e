//! Worker subprocess entry point.
//!
//! Runs when the binary is re-executed with the hidden `worker`
//! subcommand. Hosts the sandbox kernel on a current-thread runtime
//! (isolates are !Send) and speaks the line protocol over stdin/stdout.
//! Evaluations are strictly serialized; the IPC reader stays live alongside
//! them so `command` replies can land mid-evaluation.

use std::sync::Arc;

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;

use crate::config::Settings;
use crate::sandbox::Kernel;

use super::CommandBridge;
use super::protocol::{ChildMessage, ParentMessage};

struct Job {
    id: u64,
    code: String,
    msg: Option<Value>,
    socket: bool,
}

/// Run the worker subprocess main function. Never returns normally.
pub fn run_worker_main(settings: Settings) -> ! {
    // Pipe errors are surfaced through io::Error, not a signal.
    unsafe {
        nix::sys::signal::signal(
            nix::sys::signal::Signal::SIGPIPE,
            nix::sys::signal::SigHandler::SigIgn,
        )
        .ok();
    }

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("Worker runtime error: {e}");
            std::process::exit(1);
        }
    };

    let local = tokio::task::LocalSet::new();
    let code = local.block_on(&runtime, worker_loop(Arc::new(settings)));
    std::process::exit(code)
}

async fn worker_loop(settings: Arc<Settings>) -> i32 {
    // Single writer task: results and command frames share stdout and must
    // never interleave mid-line.
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<ChildMessage>();
    let writer = tokio::task::spawn_local(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(message) = out_rx.recv().await {
            if stdout
                .write_all(message.to_line().as_bytes())
                .await
                .is_err()
            {
                break;
            }
            if stdout.flush().await.is_err() {
                break;
            }
        }
    });

    let bridge = CommandBridge::new(out_tx.clone());

    let (job_tx, mut job_rx) = mpsc::unbounded_channel::<Job>();
    let reader_bridge = bridge.clone();
    tokio::task::spawn_local(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            match ParentMessage::from_line(&line) {
                Ok(ParentMessage::Job {
                    id,
                    code,
                    msg,
                    socket,
                }) => {
                    if job_tx
                        .send(Job {
                            id,
                            code,
                            msg,
                            socket,
                        })
                        .is_err()
                    {
                        break;
                    }
                }
                Ok(ParentMessage::CommandReply { id, data }) => {
                    reader_bridge.resolve(&id, data);
                }
                Ok(ParentMessage::Exit) => break,
                Err(e) => {
                    tracing::warn!(error = %e, "Invalid parent message");
                }
            }
        }
        // Dropping job_tx drains the main loop and ends the process.
    });

    let kernel = match Kernel::new(settings, bridge) {
        Ok(kernel) => kernel,
        Err(e) => {
            eprintln!("Worker init error: {e}");
            return 1;
        }
    };

    if out_tx.send(ChildMessage::Ready).is_err() {
        return 1;
    }

    while let Some(job) = job_rx.recv().await {
        let message = match kernel.evaluate(&job.code, job.msg.as_ref(), job.socket).await {
            Ok(result) => ChildMessage::Result {
                id: job.id,
                result,
            },
            Err(e) => ChildMessage::Error {
                id: job.id,
                message: e.to_string(),
            },
        };
        if out_tx.send(message).is_err() {
            break;
        }
    }

    drop(out_tx);
    let _ = writer.await;
    0
}
