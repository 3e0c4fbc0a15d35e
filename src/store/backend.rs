//! Redis hash backend for the scoped KV store.
//!
//! One hash per scoped key, one field per guest-visible entry. Field TTLs
//! use `HEXPIRE` (`FIELDS 1 <field>`), NX mode by default so an existing
//! TTL is never silently replaced.

use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use tokio::sync::OnceCell;

use crate::error::Result;

/// Lazily-connected handle to the Redis backend.
///
/// The connection manager reconnects on its own; laziness keeps worker
/// startup independent of backend availability.
pub struct StoreBackend {
    client: redis::Client,
    manager: OnceCell<ConnectionManager>,
}

impl StoreBackend {
    pub fn new(url: &str) -> Result<Self> {
        Ok(Self {
            client: redis::Client::open(url)?,
            manager: OnceCell::new(),
        })
    }

    async fn conn(&self) -> Result<ConnectionManager> {
        let manager = self
            .manager
            .get_or_try_init(|| ConnectionManager::new(self.client.clone()))
            .await?;
        Ok(manager.clone())
    }

    pub async fn hget(&self, key: &str, field: &str) -> Result<Option<String>> {
        let mut conn = self.conn().await?;
        Ok(conn.hget(key, field).await?)
    }

    pub async fn hset(&self, key: &str, field: &str, value: &str) -> Result<i64> {
        let mut conn = self.conn().await?;
        Ok(conn.hset(key, field, value).await?)
    }

    pub async fn hdel(&self, key: &str, field: &str) -> Result<i64> {
        let mut conn = self.conn().await?;
        Ok(conn.hdel(key, field).await?)
    }

    pub async fn hlen(&self, key: &str) -> Result<i64> {
        let mut conn = self.conn().await?;
        Ok(conn.hlen(key).await?)
    }

    pub async fn hexists(&self, key: &str, field: &str) -> Result<bool> {
        let mut conn = self.conn().await?;
        Ok(conn.hexists(key, field).await?)
    }

    /// Set a TTL on a single hash field. NX mode: only applies when the
    /// field has no TTL yet. Returns the per-field status code reported by
    /// the server (1 applied, 0 skipped, -2 no such field).
    pub async fn hexpire(&self, key: &str, seconds: i64, field: &str) -> Result<i64> {
        let mut conn = self.conn().await?;
        let statuses: Vec<i64> = redis::cmd("HEXPIRE")
            .arg(key)
            .arg(seconds)
            .arg("NX")
            .arg("FIELDS")
            .arg(1)
            .arg(field)
            .query_async(&mut conn)
            .await?;
        Ok(statuses.first().copied().unwrap_or(-2))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Backend tests need a live Redis; run with `cargo test -- --ignored`
    // against a local instance.

    fn backend() -> StoreBackend {
        StoreBackend::new("redis://127.0.0.1:6379/").unwrap()
    }

    #[tokio::test]
    #[ignore]
    async fn test_hash_roundtrip() {
        let b = backend();
        let key = "potat-eval:test:roundtrip";
        b.hdel(key, "field").await.unwrap();

        b.hset(key, "field", "value").await.unwrap();
        assert_eq!(b.hget(key, "field").await.unwrap().as_deref(), Some("value"));
        assert_eq!(b.hlen(key).await.unwrap(), 1);
        assert!(b.hexists(key, "field").await.unwrap());

        b.hdel(key, "field").await.unwrap();
        assert_eq!(b.hget(key, "field").await.unwrap(), None);
    }

    #[tokio::test]
    #[ignore]
    async fn test_field_ttl_nx() {
        let b = backend();
        let key = "potat-eval:test:ttl";
        b.hset(key, "field", "value").await.unwrap();

        assert_eq!(b.hexpire(key, 100, "field").await.unwrap(), 1);
        // NX: second expiry attempt is skipped.
        assert_eq!(b.hexpire(key, 200, "field").await.unwrap(), 0);

        b.hdel(key, "field").await.unwrap();
    }
}
