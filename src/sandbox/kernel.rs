//! Per-submission guest lifecycle.
//!
//! A fresh isolate per evaluation: no state, no JIT warmth, nothing shared
//! with the previous guest. The V8 heap is pinned at 8 MiB; hitting it
//! terminates execution through the near-heap-limit callback and fails the
//! submission (that is the catastrophic path; guest exceptions are not).

use std::rc::Rc;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use deno_core::{JsRuntime, PollEventLoopOptions, RuntimeOptions, v8};
use serde_json::Value;

use crate::config::Settings;
use crate::context;
use crate::error::{PotatError, Result};
use crate::fetch::FetchEnv;
use crate::store::{ScopedStore, StoreBackend};
use crate::worker::CommandBridge;

use super::ops::{self, EvalResult, JobContext};

/// V8 heap cap per isolate.
const ISOLATE_HEAP_LIMIT: usize = 8 * 1024 * 1024;

/// Extra wall-clock allowance on top of `vmTimeout` for marshalling.
const TIMEOUT_GRACE_MS: u64 = 1000;

static BOOTSTRAP_JS: &str = include_str!("bootstrap.js");

/// Sandbox kernel for one worker process.
///
/// Holds the capability backends shared across evaluations; the isolates
/// themselves are created and destroyed per call.
pub struct Kernel {
    settings: Arc<Settings>,
    fetch_env: Rc<FetchEnv>,
    store: Rc<ScopedStore>,
    bridge: CommandBridge,
}

impl Kernel {
    pub fn new(settings: Arc<Settings>, bridge: CommandBridge) -> Result<Self> {
        let fetch_env = FetchEnv::new(settings.fetch_timeout, settings.max_fetch_concurrency)?;
        let store = ScopedStore::new(StoreBackend::new(&settings.redis_url())?);

        Ok(Self {
            settings,
            fetch_env: Rc::new(fetch_env),
            store: Rc::new(store),
            bridge,
        })
    }

    /// Evaluate one snippet.
    ///
    /// `Ok` is the guest-visible result string, including 🚫-prefixed
    /// guest faults and timeouts. `Err` means the isolate itself failed and
    /// the submission should be a server error.
    pub async fn evaluate(&self, code: &str, msg: Option<&Value>, socket: bool) -> Result<String> {
        let msg = msg.cloned().unwrap_or(Value::Null);

        let mut runtime = JsRuntime::new(RuntimeOptions {
            extensions: vec![ops::potat_ext::init_ops()],
            create_params: Some(v8::CreateParams::default().heap_limits(0, ISOLATE_HEAP_LIMIT)),
            ..Default::default()
        });

        {
            let state = runtime.op_state();
            let mut state = state.borrow_mut();
            state.put(self.fetch_env.clone());
            state.put(self.store.clone());
            state.put(self.bridge.clone());
            state.put(JobContext { msg: msg.clone() });
            state.put(EvalResult::default());
        }

        // Heap limit hook: terminate and grant 1 MiB grace so the
        // termination can propagate instead of aborting the process.
        let heap_state = Box::new(HeapLimitState {
            handle: runtime.v8_isolate().thread_safe_handle(),
            triggered: AtomicBool::new(false),
        });
        runtime.v8_isolate().add_near_heap_limit_callback(
            near_heap_limit_callback,
            &*heap_state as *const HeapLimitState as *mut std::ffi::c_void,
        );

        let outcome = self.run_guest(&mut runtime, code, &msg, socket).await;

        let heap_hit = heap_state.triggered.load(Ordering::SeqCst);
        drop(runtime);

        if heap_hit {
            return Err(PotatError::Sandbox("isolate heap limit exceeded".into()));
        }
        outcome
    }

    async fn run_guest(
        &self,
        runtime: &mut JsRuntime,
        code: &str,
        msg: &Value,
        socket: bool,
    ) -> Result<String> {
        let max_len = self.settings.fetch_max_response_length;

        // Context constants first, then the bootstrap that consumes them.
        let msg_json = serde_json::to_string(&msg.to_string())?;
        let permissions_json = serde_json::to_string(&context::permissions_object().to_string())?;
        let context_script = format!(
            "globalThis.__msgJson = {msg_json};\n\
             globalThis.__permissionsJson = {permissions_json};\n\
             globalThis.__hasSocket = {socket};"
        );

        if let Err(e) = runtime.execute_script("[potat:context]", context_script) {
            return Err(PotatError::Sandbox(format!("context injection failed: {e}")));
        }
        if let Err(e) = runtime.execute_script("[potat:bootstrap]", BOOTSTRAP_JS) {
            return Err(PotatError::Sandbox(format!("bootstrap failed: {e}")));
        }

        let driver = build_driver(code);

        // CPU watchdog: terminates V8 when the wall clock expires, which
        // covers busy loops the event-loop timeout below cannot reach.
        let budget = Duration::from_millis(self.settings.vm_timeout + TIMEOUT_GRACE_MS);
        let watchdog_handle = runtime.v8_isolate().thread_safe_handle();
        let timed_out = Arc::new(AtomicBool::new(false));
        let watchdog_flag = timed_out.clone();
        let (cancel_tx, cancel_rx) = std::sync::mpsc::channel::<()>();
        let watchdog = std::thread::spawn(move || {
            if let Err(std::sync::mpsc::RecvTimeoutError::Timeout) = cancel_rx.recv_timeout(budget)
            {
                watchdog_flag.store(true, Ordering::SeqCst);
                watchdog_handle.terminate_execution();
            }
        });

        let exec_error = match runtime.execute_script("[potat:evaluate]", driver) {
            Ok(_) => {
                match tokio::time::timeout(
                    budget,
                    runtime.run_event_loop(PollEventLoopOptions::default()),
                )
                .await
                {
                    Ok(Ok(())) => None,
                    Ok(Err(e)) => Some(e.to_string()),
                    Err(_) => {
                        timed_out.store(true, Ordering::SeqCst);
                        None
                    }
                }
            }
            Err(e) => Some(e.to_string()),
        };

        // The watchdog must be gone before the caller drops the runtime.
        let _ = cancel_tx.send(());
        let _ = watchdog.join();

        if timed_out.load(Ordering::SeqCst) {
            return Ok(truncate_chars(
                &format!(
                    "🚫 TimeoutError: JavaScript execution timed out after {} ms",
                    self.settings.vm_timeout
                ),
                max_len,
            ));
        }

        if let Some(error) = exec_error {
            return Ok(truncate_chars(&guest_fault(&error), max_len));
        }

        let envelope = {
            let state = runtime.op_state();
            let mut state = state.borrow_mut();
            state.take::<EvalResult>().0
        };

        let Some(envelope) = envelope else {
            return Ok("🚫 Error: evaluation produced no result".to_string());
        };

        let parsed: Value = serde_json::from_str(&envelope)?;
        let text = if let Some(error) = parsed.get("error") {
            let name = error
                .get("name")
                .and_then(Value::as_str)
                .unwrap_or("Error");
            let message = error
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unknown error");
            format!("🚫 {name}: {message}")
        } else {
            parsed
                .get("ok")
                .and_then(Value::as_str)
                .unwrap_or("undefined")
                .to_string()
        };

        Ok(truncate_chars(&text, max_len))
    }
}

/// Wrap user code for evaluation and route its outcome to `__report`.
///
/// Code containing `return` or `await` is treated as an async function
/// body; everything else goes through a quoted `eval`. The detection is a
/// plain substring check, so identifiers like `returnValue` trigger the
/// async form too; that looseness is part of the evaluation contract.
fn build_driver(code: &str) -> String {
    let wrapped = if code.contains("return") || code.contains("await") {
        format!("toString((async function evaluate() {{ {code} }})())")
    } else {
        let escaped = escape_for_eval(code);
        format!("toString(eval('{escaped}'))")
    };

    format!(
        r#"(async () => {{
    try {{
        const __result = await {wrapped};
        __report(JSON.stringify({{ ok: String(__result) }}));
    }} catch (e) {{
        __report(JSON.stringify({{
            error: {{
                name: e && e.name ? String(e.name) : "Error",
                message: e && e.message !== undefined ? String(e.message) : String(e),
            }}
        }}));
    }}
}})();"#
    )
}

/// Backslash-escape `\`, `"` and `'` for embedding in a single-quoted
/// eval literal.
fn escape_for_eval(code: &str) -> String {
    code.replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\'', "\\'")
}

/// Shape a top-level script error as a guest fault string.
fn guest_fault(error: &str) -> String {
    let first_line = error.lines().next().unwrap_or(error);
    let cleaned = first_line.strip_prefix("Uncaught ").unwrap_or(first_line);
    if cleaned.contains(": ") {
        format!("🚫 {cleaned}")
    } else {
        format!("🚫 Error: {cleaned}")
    }
}

/// Truncate to at most `max` characters, on a char boundary.
pub fn truncate_chars(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((index, _)) => text[..index].to_string(),
        None => text.to_string(),
    }
}

/// State for the near-heap-limit callback.
struct HeapLimitState {
    handle: v8::IsolateHandle,
    triggered: AtomicBool,
}

/// V8 near-heap-limit callback: terminate once, then grant 1 MiB so the
/// termination exception can propagate instead of aborting the process.
extern "C" fn near_heap_limit_callback(
    data: *mut std::ffi::c_void,
    current_heap_limit: usize,
    _initial_heap_limit: usize,
) -> usize {
    // SAFETY: `data` points at the HeapLimitState boxed in `evaluate`,
    // which outlives the isolate: the runtime is dropped before the box.
    let state = unsafe { &*(data as *const HeapLimitState) };
    if !state.triggered.swap(true, Ordering::SeqCst) {
        state.handle.terminate_execution();
    }
    current_heap_limit + 1024 * 1024
}
