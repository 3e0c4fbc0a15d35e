//! Submission pipeline: validation, admission, response shaping.
//!
//! Both transports feed here. Admission runs through a single loop so the
//! pick-a-worker step is serialised (FIFO) across everything the primary
//! dispatches; waiting for results stays concurrent, so completion order
//! follows worker progress, not admission order.

use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};

use crate::config::Settings;
use crate::error::Result;
use crate::sandbox::kernel::truncate_chars;
use crate::worker::CommandRelay;
use crate::worker::pool::WorkerPool;

/// Wire response shape shared by both transports.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EvalResponse {
    pub status_code: u16,
    pub data: Vec<String>,
    pub duration: f64,
    pub errors: Vec<ErrorBody>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorBody {
    pub message: String,
}

impl EvalResponse {
    pub fn error(status_code: u16, message: impl Into<String>, duration: f64) -> Self {
        Self {
            status_code,
            data: Vec::new(),
            duration,
            errors: vec![ErrorBody {
                message: message.into(),
            }],
            id: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }
}

struct Admission {
    code: String,
    msg: Option<Value>,
    socket: bool,
    reply: oneshot::Sender<Result<String>>,
}

/// Front door for evaluations.
pub struct Pipeline {
    settings: Arc<Settings>,
    relay: Arc<dyn CommandRelay>,
    admit_tx: mpsc::UnboundedSender<Admission>,
}

impl Pipeline {
    pub fn new(
        pool: Arc<WorkerPool>,
        settings: Arc<Settings>,
        relay: Arc<dyn CommandRelay>,
    ) -> Self {
        let (admit_tx, mut admit_rx) = mpsc::unbounded_channel::<Admission>();

        // The admission loop is the serialisation point: one assignment at
        // a time, in arrival order.
        tokio::spawn(async move {
            while let Some(admission) = admit_rx.recv().await {
                match pool.assign(admission.code, admission.msg, admission.socket) {
                    Ok(in_flight) => {
                        tokio::spawn(async move {
                            let _ = admission.reply.send(in_flight.wait().await);
                        });
                    }
                    Err(e) => {
                        let _ = admission.reply.send(Err(e));
                    }
                }
            }
        });

        Self {
            settings,
            relay,
            admit_tx,
        }
    }

    /// Validate, enqueue, and shape the response.
    pub async fn submit(&self, code: &Value, msg: Option<&Value>) -> EvalResponse {
        let started = Instant::now();
        // The guest only sees `command` while someone is connected to
        // answer it, whichever transport the submission came in on.
        let socket = self.relay.has_clients();

        let Some(code) = code.as_str().filter(|c| !c.is_empty()) else {
            return EvalResponse::error(
                400,
                "code must be a non-empty string",
                duration_ms(started),
            );
        };
        // JSON null counts as absent, not as a bad mapping.
        if let Some(msg) = msg
            && !msg.is_object()
            && !msg.is_null()
        {
            return EvalResponse::error(400, "msg must be an object", duration_ms(started));
        }

        let (reply, rx) = oneshot::channel();
        let admitted = self.admit_tx.send(Admission {
            code: code.to_string(),
            msg: msg.cloned(),
            socket,
            reply,
        });
        if admitted.is_err() {
            return EvalResponse::error(500, "Service is shutting down", duration_ms(started));
        }

        let outcome = match rx.await {
            Ok(outcome) => outcome,
            Err(_) => {
                return EvalResponse::error(500, "Worker is not responding", duration_ms(started));
            }
        };

        match outcome {
            Ok(result) => EvalResponse {
                status_code: 200,
                data: vec![truncate_chars(
                    &result,
                    self.settings.fetch_max_response_length,
                )],
                duration: duration_ms(started),
                errors: Vec::new(),
                id: None,
            },
            Err(e) => EvalResponse::error(500, e.to_string(), duration_ms(started)),
        }
    }
}

/// Elapsed milliseconds to four decimal places.
fn duration_ms(started: Instant) -> f64 {
    let ms = started.elapsed().as_secs_f64() * 1000.0;
    (ms * 10_000.0).round() / 10_000.0
}
