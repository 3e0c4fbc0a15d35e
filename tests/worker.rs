//! End-to-end tests for the worker subprocess.
//!
//! Each test spawns the compiled binary in `worker` mode and speaks the
//! line protocol over stdin/stdout, the same way a supervisor does. This
//! exercises the whole sandbox kernel: bootstrap, wrapping, evaluation,
//! stringification, and fault shaping.

use std::io::{BufRead, BufReader, Write};
use std::process::{Child, ChildStdin, Command, Stdio};
use std::sync::mpsc;
use std::time::Duration;

use serde_json::{Value, json};

const READ_TIMEOUT: Duration = Duration::from_secs(60);

struct Worker {
    child: Child,
    stdin: ChildStdin,
    lines: mpsc::Receiver<String>,
}

impl Worker {
    /// Spawn a worker with the given settings and wait for its ready
    /// signal.
    fn spawn(settings: Value) -> Self {
        let bin = assert_cmd::cargo::cargo_bin("potat-eval");
        let mut child = Command::new(bin)
            .arg("worker")
            .arg("--settings")
            .arg(settings.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .expect("failed to spawn worker");

        let stdin = child.stdin.take().expect("no stdin");
        let stdout = child.stdout.take().expect("no stdout");

        let (tx, lines) = mpsc::channel();
        std::thread::spawn(move || {
            for line in BufReader::new(stdout).lines() {
                match line {
                    Ok(line) => {
                        if tx.send(line).is_err() {
                            break;
                        }
                    }
                    Err(_) => break,
                }
            }
        });

        let mut worker = Self {
            child,
            stdin,
            lines,
        };

        let ready = worker.read_message();
        assert_eq!(ready["type"], "ready", "worker never became ready");
        worker
    }

    fn default_settings() -> Value {
        json!({
            "port": 1,
            "auth": "testy",
            "vmTimeout": 3000,
        })
    }

    fn read_message(&mut self) -> Value {
        let line = self
            .lines
            .recv_timeout(READ_TIMEOUT)
            .expect("timed out waiting for worker output");
        serde_json::from_str(&line).expect("worker emitted invalid JSON")
    }

    fn send(&mut self, message: Value) {
        let mut line = message.to_string();
        line.push('\n');
        self.stdin
            .write_all(line.as_bytes())
            .expect("failed to write to worker");
    }

    /// Send a job and wait for its result line.
    fn evaluate(&mut self, id: u64, code: &str, msg: Value) -> Value {
        self.send(json!({
            "type": "job",
            "id": id,
            "code": code,
            "msg": msg,
            "socket": false,
        }));
        self.read_message()
    }

    fn send_exit(&mut self) -> std::io::Result<()> {
        self.stdin.write_all(b"{\"type\":\"exit\"}\n")
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        let _ = self.send_exit();
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

#[test]
fn evaluates_simple_expression() {
    let mut worker = Worker::spawn(Worker::default_settings());
    let response = worker.evaluate(1, "1+1", Value::Null);
    assert_eq!(response["type"], "result");
    assert_eq!(response["id"], 1);
    assert_eq!(response["result"], "2");
}

#[test]
fn async_form_yields_same_result() {
    let mut worker = Worker::spawn(Worker::default_settings());
    let response = worker.evaluate(1, "return 2+2", Value::Null);
    assert_eq!(response["result"], "4");
}

#[test]
fn arrays_are_comma_joined() {
    let mut worker = Worker::spawn(Worker::default_settings());
    let response = worker.evaluate(1, "[1,2,3]", Value::Null);
    assert_eq!(response["result"], "1,2,3");
}

#[test]
fn objects_are_json_stringified() {
    let mut worker = Worker::spawn(Worker::default_settings());
    let response = worker.evaluate(1, "({a: 1})", Value::Null);
    assert_eq!(response["result"], "{\"a\":1}");
}

#[test]
fn guest_errors_become_flagged_strings() {
    let mut worker = Worker::spawn(Worker::default_settings());
    let response = worker.evaluate(1, "definitelyNotDefined", Value::Null);
    let result = response["result"].as_str().unwrap();
    assert!(result.starts_with("🚫"), "{result}");
    assert!(result.contains("ReferenceError"), "{result}");
}

#[test]
fn msg_constant_is_exposed() {
    let mut worker = Worker::spawn(Worker::default_settings());
    let response = worker.evaluate(
        1,
        "msg.user.id",
        json!({"user": {"id": "u123"}}),
    );
    assert_eq!(response["result"], "u123");
}

#[test]
fn command_is_absent_without_socket_client() {
    let mut worker = Worker::spawn(Worker::default_settings());
    let response = worker.evaluate(1, "typeof command", Value::Null);
    assert_eq!(response["result"], "undefined");
}

#[test]
fn process_exit_is_neutered() {
    let mut worker = Worker::spawn(Worker::default_settings());
    let response = worker.evaluate(1, "process.exit(0)", Value::Null);
    let result = response["result"].as_str().unwrap();
    assert!(result.starts_with("🚫"), "{result}");
    // The worker is still alive and serving.
    let follow_up = worker.evaluate(2, "40+2", Value::Null);
    assert_eq!(follow_up["result"], "42");
}

#[test]
fn frozen_capabilities_cannot_be_replaced() {
    let mut worker = Worker::spawn(Worker::default_settings());
    // Reassignment silently fails (non-writable): fetch stays a function.
    let response = worker.evaluate(1, "fetch = 5; typeof fetch", Value::Null);
    assert_eq!(response["result"], "function");
}

#[test]
fn utilities_are_injected() {
    let mut worker = Worker::spawn(Worker::default_settings());
    assert_eq!(
        worker.evaluate(1, "btoa('hello')", Value::Null)["result"],
        "aGVsbG8="
    );
    assert_eq!(
        worker.evaluate(2, "atob('aGVsbG8=')", Value::Null)["result"],
        "hello"
    );
    assert_eq!(
        worker.evaluate(3, "humanizeDuration(61000)", Value::Null)["result"],
        "1m 1s"
    );
    let shuffled = worker.evaluate(4, "shuffleString('aaaa')", Value::Null);
    assert_eq!(shuffled["result"], "aaaa");
    let n = worker.evaluate(5, "randomInt(3, 3)", Value::Null);
    assert_eq!(n["result"], "3");
    let s = worker.evaluate(6, "randomString(8).length", Value::Null);
    assert_eq!(s["result"], "8");
}

#[test]
fn busy_loop_is_terminated_within_budget() {
    let mut worker = Worker::spawn(json!({
        "port": 1,
        "auth": "testy",
        "vmTimeout": 1000,
    }));

    let started = std::time::Instant::now();
    let response = worker.evaluate(1, "for(;;){}", Value::Null);
    let elapsed = started.elapsed();

    let result = response["result"].as_str().unwrap();
    assert!(result.starts_with("🚫"), "{result}");
    assert!(result.contains("TimeoutError"), "{result}");
    // vmTimeout + 1000ms grace, plus scheduling slack.
    assert!(elapsed < Duration::from_secs(10), "took {elapsed:?}");
}

#[test]
fn results_are_truncated_to_the_response_cap() {
    let mut worker = Worker::spawn(json!({
        "port": 1,
        "auth": "testy",
        "vmTimeout": 3000,
        "fetchMaxResponseLength": 16,
    }));

    let response = worker.evaluate(1, "'x'.repeat(5000)", Value::Null);
    assert_eq!(response["result"].as_str().unwrap().len(), 16);
}

#[test]
fn evaluations_are_serialized_in_order() {
    let mut worker = Worker::spawn(Worker::default_settings());
    worker.send(json!({"type": "job", "id": 10, "code": "'a'", "msg": null, "socket": false}));
    worker.send(json!({"type": "job", "id": 11, "code": "'b'", "msg": null, "socket": false}));

    let first = worker.read_message();
    let second = worker.read_message();
    assert_eq!(first["id"], 10);
    assert_eq!(first["result"], "a");
    assert_eq!(second["id"], 11);
    assert_eq!(second["result"], "b");
}
