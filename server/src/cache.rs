//! Ephemeral cache for heartbeat records, timeout counters, and the
//! scheduler leader lease
//!
//! Two backends sit behind one handle: an in-process memory map for
//! single-node deployments and tests, and redis for clusters where the
//! leader lease has to hold across processes. Key spaces are disjoint per
//! concern: `hb:` for heartbeat records, `timeout:` for reconciler strike
//! counters, `backoff:` for scheduler backoff state, and `scheduler:leader`
//! for the lease.

use anyhow::{Context, Result};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::debug;

/// Cache key of the scheduler leader lease
pub const LEADER_KEY: &str = "scheduler:leader";

/// Heartbeat record key for an execution
pub fn hb_key(execution_id: &str) -> String {
    format!("hb:{}", execution_id)
}

/// Heartbeat timeout strike counter key for an execution
pub fn timeout_key(execution_id: &str) -> String {
    format!("timeout:{}", execution_id)
}

/// Scheduler backoff counter key for a task
pub fn backoff_key(task_id: &str) -> String {
    format!("backoff:{}", task_id)
}

/// Shared cache handle, cheap to clone
#[derive(Clone)]
pub struct Cache {
    backend: Backend,
}

#[derive(Clone)]
enum Backend {
    Memory(MemoryCache),
    Redis(RedisCache),
}

impl Cache {
    /// Connect the configured backend. "memory" needs no connection; a
    /// redis:// URL is dialled eagerly so a bad address fails at startup.
    pub async fn connect(cache_url: &str) -> Result<Self> {
        if cache_url == "memory" {
            debug!("Using in-process memory cache");
            return Ok(Self {
                backend: Backend::Memory(MemoryCache::new()),
            });
        }

        let client = redis::Client::open(cache_url)
            .with_context(|| format!("Invalid redis URL: {}", cache_url))?;
        let manager = client
            .get_connection_manager()
            .await
            .with_context(|| format!("Failed to connect to redis at {}", cache_url))?;
        debug!("Connected to redis cache");
        Ok(Self {
            backend: Backend::Redis(RedisCache { manager }),
        })
    }

    /// In-process memory cache, used directly by tests
    pub fn memory() -> Self {
        Self {
            backend: Backend::Memory(MemoryCache::new()),
        }
    }

    /// Store a value under `key` for `ttl`
    pub async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        match &self.backend {
            Backend::Memory(m) => {
                m.set(key, value, ttl).await;
                Ok(())
            }
            Backend::Redis(r) => r.set_with_ttl(key, value, ttl).await,
        }
    }

    /// Fetch a value; expired entries read as absent
    pub async fn get(&self, key: &str) -> Result<Option<String>> {
        match &self.backend {
            Backend::Memory(m) => Ok(m.get(key).await),
            Backend::Redis(r) => r.get(key).await,
        }
    }

    /// Delete a key; deleting an absent key is a no-op
    pub async fn delete(&self, key: &str) -> Result<()> {
        match &self.backend {
            Backend::Memory(m) => {
                m.delete(key).await;
                Ok(())
            }
            Backend::Redis(r) => r.delete(key).await,
        }
    }

    /// Increment a counter, refreshing its TTL; returns the new value
    pub async fn incr_with_ttl(&self, key: &str, ttl: Duration) -> Result<i64> {
        match &self.backend {
            Backend::Memory(m) => Ok(m.incr(key, ttl).await),
            Backend::Redis(r) => r.incr_with_ttl(key, ttl).await,
        }
    }

    /// Try to acquire (or refresh) a lease on `key` for `holder`
    ///
    /// Returns true when `holder` owns the lease after the call. A held
    /// lease is refreshed to the full TTL; a lease held by someone else is
    /// left untouched.
    pub async fn acquire_lease(&self, key: &str, holder: &str, ttl: Duration) -> Result<bool> {
        match &self.backend {
            Backend::Memory(m) => Ok(m.acquire_lease(key, holder, ttl).await),
            Backend::Redis(r) => r.acquire_lease(key, holder, ttl).await,
        }
    }

    /// Release a lease if `holder` still owns it
    pub async fn release_lease(&self, key: &str, holder: &str) -> Result<()> {
        match &self.backend {
            Backend::Memory(m) => {
                m.release_lease(key, holder).await;
                Ok(())
            }
            Backend::Redis(r) => r.release_lease(key, holder).await,
        }
    }
}

/// TTL map guarded by an async RwLock
#[derive(Clone)]
struct MemoryCache {
    entries: Arc<RwLock<HashMap<String, Entry>>>,
}

struct Entry {
    value: String,
    expires_at: Instant,
}

impl Entry {
    fn live(&self) -> bool {
        Instant::now() < self.expires_at
    }
}

impl MemoryCache {
    fn new() -> Self {
        Self {
            entries: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) {
        let mut entries = self.entries.write().await;
        // Opportunistic sweep keeps the map from accumulating dead entries.
        entries.retain(|_, e| e.live());
        entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: Instant::now() + ttl,
            },
        );
    }

    async fn get(&self, key: &str) -> Option<String> {
        let entries = self.entries.read().await;
        entries
            .get(key)
            .filter(|e| e.live())
            .map(|e| e.value.clone())
    }

    async fn delete(&self, key: &str) {
        self.entries.write().await.remove(key);
    }

    async fn incr(&self, key: &str, ttl: Duration) -> i64 {
        let mut entries = self.entries.write().await;
        let current = entries
            .get(key)
            .filter(|e| e.live())
            .and_then(|e| e.value.parse::<i64>().ok())
            .unwrap_or(0);
        let next = current + 1;
        entries.insert(
            key.to_string(),
            Entry {
                value: next.to_string(),
                expires_at: Instant::now() + ttl,
            },
        );
        next
    }

    async fn acquire_lease(&self, key: &str, holder: &str, ttl: Duration) -> bool {
        let mut entries = self.entries.write().await;
        match entries.get(key) {
            Some(e) if e.live() && e.value != holder => false,
            _ => {
                entries.insert(
                    key.to_string(),
                    Entry {
                        value: holder.to_string(),
                        expires_at: Instant::now() + ttl,
                    },
                );
                true
            }
        }
    }

    async fn release_lease(&self, key: &str, holder: &str) {
        let mut entries = self.entries.write().await;
        if entries.get(key).map(|e| e.value.as_str()) == Some(holder) {
            entries.remove(key);
        }
    }
}

/// Redis backend over a multiplexed connection manager
#[derive(Clone)]
struct RedisCache {
    manager: redis::aio::ConnectionManager,
}

impl RedisCache {
    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        use redis::AsyncCommands;
        let mut con = self.manager.clone();
        let _: () = con
            .set_ex(key, value, ttl.as_secs().max(1))
            .await
            .context("redis SETEX failed")?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        use redis::AsyncCommands;
        let mut con = self.manager.clone();
        let value: Option<String> = con.get(key).await.context("redis GET failed")?;
        Ok(value)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        use redis::AsyncCommands;
        let mut con = self.manager.clone();
        let _: () = con.del(key).await.context("redis DEL failed")?;
        Ok(())
    }

    async fn incr_with_ttl(&self, key: &str, ttl: Duration) -> Result<i64> {
        use redis::AsyncCommands;
        let mut con = self.manager.clone();
        let value: i64 = con.incr(key, 1).await.context("redis INCR failed")?;
        let _: bool = con
            .expire(key, ttl.as_secs().max(1) as i64)
            .await
            .context("redis EXPIRE failed")?;
        Ok(value)
    }

    async fn acquire_lease(&self, key: &str, holder: &str, ttl: Duration) -> Result<bool> {
        let mut con = self.manager.clone();
        // SET NX EX takes the lease only when free.
        let taken: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(holder)
            .arg("NX")
            .arg("EX")
            .arg(ttl.as_secs().max(1))
            .query_async(&mut con)
            .await
            .context("redis SET NX failed")?;
        if taken.is_some() {
            return Ok(true);
        }

        // Lease exists: refresh it only if we are the holder.
        use redis::AsyncCommands;
        let current: Option<String> = con.get(key).await.context("redis GET failed")?;
        if current.as_deref() == Some(holder) {
            let _: () = con
                .set_ex(key, holder, ttl.as_secs().max(1))
                .await
                .context("redis SETEX failed")?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    async fn release_lease(&self, key: &str, holder: &str) -> Result<()> {
        use redis::AsyncCommands;
        let mut con = self.manager.clone();
        let current: Option<String> = con.get(key).await.context("redis GET failed")?;
        if current.as_deref() == Some(holder) {
            let _: () = con.del(key).await.context("redis DEL failed")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_set_get_delete() {
        let cache = Cache::memory();
        cache
            .set_with_ttl("hb:abc", "payload", Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(cache.get("hb:abc").await.unwrap().as_deref(), Some("payload"));

        cache.delete("hb:abc").await.unwrap();
        assert_eq!(cache.get("hb:abc").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_entries_expire() {
        let cache = Cache::memory();
        cache
            .set_with_ttl("hb:xyz", "payload", Duration::from_millis(20))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(cache.get("hb:xyz").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_incr_counts_up_and_expires() {
        let cache = Cache::memory();
        let key = timeout_key("e1");
        assert_eq!(
            cache.incr_with_ttl(&key, Duration::from_secs(60)).await.unwrap(),
            1
        );
        assert_eq!(
            cache.incr_with_ttl(&key, Duration::from_secs(60)).await.unwrap(),
            2
        );

        cache
            .incr_with_ttl("timeout:e2", Duration::from_millis(10))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(
            cache
                .incr_with_ttl("timeout:e2", Duration::from_secs(60))
                .await
                .unwrap(),
            1
        );
    }

    #[tokio::test]
    async fn test_lease_is_single_holder() {
        let cache = Cache::memory();
        let ttl = Duration::from_secs(60);
        assert!(cache.acquire_lease(LEADER_KEY, "node-a", ttl).await.unwrap());
        // Holder can refresh, a rival cannot take it.
        assert!(cache.acquire_lease(LEADER_KEY, "node-a", ttl).await.unwrap());
        assert!(!cache.acquire_lease(LEADER_KEY, "node-b", ttl).await.unwrap());

        cache.release_lease(LEADER_KEY, "node-a").await.unwrap();
        assert!(cache.acquire_lease(LEADER_KEY, "node-b", ttl).await.unwrap());
    }

    #[tokio::test]
    async fn test_expired_lease_can_be_taken() {
        let cache = Cache::memory();
        assert!(cache
            .acquire_lease(LEADER_KEY, "node-a", Duration::from_millis(10))
            .await
            .unwrap());
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(cache
            .acquire_lease(LEADER_KEY, "node-b", Duration::from_secs(60))
            .await
            .unwrap());
    }
}
