//! Guest-visible scoped key-value store.
//!
//! Every operation resolves the caller's scoped key from the submission
//! context and a scope bitfield (see [`crate::context::derive_scoped_key`]),
//! then hits one field of the backing Redis hash. Hashes are capped at 100
//! fields and 10,000 characters per serialised value so a guest cannot turn
//! the backend into bulk storage.

pub mod backend;

pub use backend::StoreBackend;

use serde_json::Value;

/// Per-hash field cap.
pub const MAX_ENTRIES: i64 = 100;

/// Per-value serialised length cap (characters).
pub const MAX_VALUE_LENGTH: usize = 10_000;

/// Scoped facade over the hash backend.
///
/// Errors are strings because they surface as thrown exceptions inside the
/// guest, not as host failures.
pub struct ScopedStore {
    backend: StoreBackend,
}

impl ScopedStore {
    pub fn new(backend: StoreBackend) -> Self {
        Self { backend }
    }

    fn key(&self, msg: &Value, flag: Option<f64>) -> Result<String, String> {
        crate::context::derive_scoped_key(msg, flag)
    }

    /// Read one field. Values that parse as JSON come back structured.
    pub async fn get(&self, msg: &Value, field: &str, flag: Option<f64>) -> Result<Value, String> {
        let key = self.key(msg, flag)?;
        let raw = self
            .backend
            .hget(&key, field)
            .await
            .map_err(|e| e.to_string())?;

        Ok(match raw {
            None => Value::Null,
            Some(text) => serde_json::from_str(&text).unwrap_or(Value::String(text)),
        })
    }

    /// Write one field, JSON-encoding non-string values.
    ///
    /// Refused when the serialised value is over [`MAX_VALUE_LENGTH`], or
    /// when the write would grow the hash past [`MAX_ENTRIES`]. With
    /// `ex > 0`, a TTL is applied to the field (NX mode).
    pub async fn set(
        &self,
        msg: &Value,
        field: &str,
        value: &Value,
        flag: Option<f64>,
        ex: Option<f64>,
    ) -> Result<Value, String> {
        let key = self.key(msg, flag)?;

        let serialised = match value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        if serialised.chars().count() > MAX_VALUE_LENGTH {
            return Err(format!(
                "Value exceeds the maximum length of {MAX_VALUE_LENGTH} characters"
            ));
        }

        let len = self.backend.hlen(&key).await.map_err(|e| e.to_string())?;
        if len >= MAX_ENTRIES
            && !self
                .backend
                .hexists(&key, field)
                .await
                .map_err(|e| e.to_string())?
        {
            return Err(format!("Store is full ({MAX_ENTRIES} entries max)"));
        }

        let added = self
            .backend
            .hset(&key, field, &serialised)
            .await
            .map_err(|e| e.to_string())?;

        if let Some(ex) = ex
            && ex > 0.0
        {
            self.backend
                .hexpire(&key, ex as i64, field)
                .await
                .map_err(|e| e.to_string())?;
        }

        Ok(Value::from(added))
    }

    /// Delete one field, returning the number of fields removed.
    pub async fn del(&self, msg: &Value, field: &str, flag: Option<f64>) -> Result<Value, String> {
        let key = self.key(msg, flag)?;
        let removed = self
            .backend
            .hdel(&key, field)
            .await
            .map_err(|e| e.to_string())?;
        Ok(Value::from(removed))
    }

    /// Number of fields currently stored under the scoped key.
    pub async fn len(&self, msg: &Value, flag: Option<f64>) -> Result<Value, String> {
        let key = self.key(msg, flag)?;
        let len = self.backend.hlen(&key).await.map_err(|e| e.to_string())?;
        Ok(Value::from(len))
    }

    /// Apply a TTL to one field (NX mode), returning the server status.
    pub async fn ex(
        &self,
        msg: &Value,
        field: &str,
        seconds: f64,
        flag: Option<f64>,
    ) -> Result<Value, String> {
        let key = self.key(msg, flag)?;
        let status = self
            .backend
            .hexpire(&key, seconds as i64, field)
            .await
            .map_err(|e| e.to_string())?;
        Ok(Value::from(status))
    }
}
