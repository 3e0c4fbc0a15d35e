//! Service configuration.
//!
//! Settings are loaded from a JSON file. Only `port` and `auth` are
//! required; everything else has a default. The same structure is
//! serialized and handed to worker subprocesses on their command line so
//! parent and child agree on every limit.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{PotatError, Result};

/// Runtime settings for the service and its workers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Settings {
    /// Port the HTTP/WebSocket server listens on.
    pub port: u16,
    /// Shared secret for both transports.
    pub auth: String,
    /// Maximum queued jobs per worker.
    pub queue_size: usize,
    /// Wall-clock cap for a single outbound fetch (ms).
    pub fetch_timeout: u64,
    /// Truncation length for evaluation results and fetch bodies (chars).
    pub fetch_max_response_length: usize,
    /// Cap on concurrent outbound fetches per process.
    pub max_fetch_concurrency: usize,
    /// Per-dispatch timeout before a job is failed (ms).
    pub workers_time_out: u64,
    /// Reserved isolate memory setting (MiB). The kernel pins isolates at
    /// 8 MiB regardless; this key is parsed for config compatibility.
    pub vm_memory_limit: usize,
    /// Guest evaluation budget (ms). The kernel allows an extra second on
    /// top for marshalling.
    pub vm_timeout: u64,
    /// Number of worker processes.
    pub max_child_process_count: usize,
    /// Redis host for the key-value backend.
    pub redis_host: String,
    /// Redis port for the key-value backend.
    pub redis_port: u16,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            port: 0,
            auth: String::new(),
            queue_size: 20,
            fetch_timeout: 15_000,
            fetch_max_response_length: 10_000,
            max_fetch_concurrency: 5,
            workers_time_out: 600_000,
            vm_memory_limit: 32,
            vm_timeout: 14_000,
            max_child_process_count: default_worker_count(),
            redis_host: "127.0.0.1".to_string(),
            redis_port: 6379,
        }
    }
}

/// Default worker count: one per logical CPU.
fn default_worker_count() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

impl Settings {
    /// Load settings from a JSON file, validating required fields.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let settings: Settings = serde_json::from_str(&raw)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Check required fields.
    pub fn validate(&self) -> Result<()> {
        if self.port == 0 {
            return Err(PotatError::Config("port is required".into()));
        }
        if self.auth.is_empty() {
            return Err(PotatError::Config("auth is required".into()));
        }
        if self.max_child_process_count == 0 {
            return Err(PotatError::Config(
                "maxChildProcessCount must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// Redis connection URL for the KV backend.
    pub fn redis_url(&self) -> String {
        format!("redis://{}:{}/", self.redis_host, self.redis_port)
    }

    /// Serialize for the worker subprocess command line.
    pub fn to_worker_arg(&self) -> String {
        serde_json::to_string(self).expect("Settings serialization failed")
    }

    /// Parse the blob handed over by the parent process.
    pub fn from_worker_arg(raw: &str) -> Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let s = Settings::default();
        assert_eq!(s.queue_size, 20);
        assert_eq!(s.fetch_timeout, 15_000);
        assert_eq!(s.fetch_max_response_length, 10_000);
        assert_eq!(s.max_fetch_concurrency, 5);
        assert_eq!(s.workers_time_out, 600_000);
        assert_eq!(s.vm_timeout, 14_000);
        assert_eq!(s.redis_port, 6379);
        assert!(s.max_child_process_count >= 1);
    }

    #[test]
    fn test_load_minimal_config() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"port": 3000, "auth": "hunter2"}}"#).unwrap();

        let s = Settings::load(file.path()).unwrap();
        assert_eq!(s.port, 3000);
        assert_eq!(s.auth, "hunter2");
        // Everything else falls back to defaults.
        assert_eq!(s.vm_timeout, 14_000);
    }

    #[test]
    fn test_load_rejects_missing_auth() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"port": 3000}}"#).unwrap();

        assert!(Settings::load(file.path()).is_err());
    }

    #[test]
    fn test_camel_case_keys() {
        let s: Settings = serde_json::from_str(
            r#"{"port": 1, "auth": "x", "vmTimeout": 5000, "maxFetchConcurrency": 2}"#,
        )
        .unwrap();
        assert_eq!(s.vm_timeout, 5000);
        assert_eq!(s.max_fetch_concurrency, 2);
    }

    #[test]
    fn test_worker_arg_roundtrip() {
        let mut s = Settings::default();
        s.port = 8080;
        s.auth = "token".into();
        let blob = s.to_worker_arg();
        let back = Settings::from_worker_arg(&blob).unwrap();
        assert_eq!(back.port, 8080);
        assert_eq!(back.auth, "token");
    }

    #[test]
    fn test_redis_url() {
        let mut s = Settings::default();
        s.redis_host = "cache.internal".into();
        s.redis_port = 6380;
        assert_eq!(s.redis_url(), "redis://cache.internal:6380/");
    }
}
