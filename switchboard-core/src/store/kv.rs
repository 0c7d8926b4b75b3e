//! Key/value store adapter: TTL strings, atomic set-if-absent, counters,
//! and a fire-and-forget publish channel.
//!
//! Two backends: `RedisKv` over a pooled connection manager for
//! production, and `MemoryKv` for tests and Redis-less deployments. The
//! trait is the only thing the rest of the crate sees.

use std::time::Duration;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use redis::aio::ConnectionManager;
use tokio::sync::broadcast;
use tokio::time::Instant;

use crate::error::{Result, SwitchboardError};

/// Minimal KV contract the switchboard needs.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Fetch a string value, `None` when absent or expired.
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Set a value with a TTL, overwriting any existing value.
    async fn set_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<()>;

    /// Atomically set the value only if the key is absent, with a TTL.
    /// Returns `true` when this call claimed the key.
    async fn set_nx_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<bool>;

    /// Delete a key. Missing keys are not an error.
    async fn delete(&self, key: &str) -> Result<()>;

    /// Increment an integer counter, applying `ttl` when the key is new.
    async fn incr_by(&self, key: &str, delta: i64, ttl: Duration) -> Result<i64>;

    /// Increment a float counter, applying `ttl` when the key is new.
    async fn incr_by_float(&self, key: &str, delta: f64, ttl: Duration) -> Result<f64>;

    /// Remaining TTL for a key, `None` when the key is absent or persistent.
    async fn ttl_remaining(&self, key: &str) -> Result<Option<Duration>>;

    /// Fire-and-forget publish onto a named channel.
    async fn publish(&self, channel: &str, payload: &str) -> Result<()>;
}

// ─────────────────────────────────────────────────────────────────────────────
// Redis backend
// ─────────────────────────────────────────────────────────────────────────────

/// Redis-backed KV store. `ConnectionManager` multiplexes and reconnects;
/// clones are cheap handles onto the same connection.
pub struct RedisKv {
    conn: ConnectionManager,
}

impl RedisKv {
    /// Connect to Redis at `url`.
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url).map_err(storage_err)?;
        let conn = ConnectionManager::new(client).await.map_err(storage_err)?;
        Ok(Self { conn })
    }
}

fn storage_err(err: redis::RedisError) -> SwitchboardError {
    SwitchboardError::Storage(err.to_string())
}

#[async_trait]
impl KvStore for RedisKv {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        redis::cmd("GET")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(storage_err)
    }

    async fn set_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("EX")
            .arg(ttl.as_secs().max(1))
            .query_async(&mut conn)
            .await
            .map_err(storage_err)?;
        Ok(())
    }

    async fn set_nx_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        let mut conn = self.conn.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("EX")
            .arg(ttl.as_secs().max(1))
            .query_async(&mut conn)
            .await
            .map_err(storage_err)?;
        Ok(reply.is_some())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = redis::cmd("DEL")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(storage_err)?;
        Ok(())
    }

    async fn incr_by(&self, key: &str, delta: i64, ttl: Duration) -> Result<i64> {
        let mut conn = self.conn.clone();
        let value: i64 = redis::cmd("INCRBY")
            .arg(key)
            .arg(delta)
            .query_async(&mut conn)
            .await
            .map_err(storage_err)?;
        // EXPIRE NX only applies when the key has no TTL yet, i.e. on first write.
        let _: std::result::Result<i64, _> = redis::cmd("EXPIRE")
            .arg(key)
            .arg(ttl.as_secs().max(1))
            .arg("NX")
            .query_async(&mut conn)
            .await;
        Ok(value)
    }

    async fn incr_by_float(&self, key: &str, delta: f64, ttl: Duration) -> Result<f64> {
        let mut conn = self.conn.clone();
        let value: f64 = redis::cmd("INCRBYFLOAT")
            .arg(key)
            .arg(delta)
            .query_async(&mut conn)
            .await
            .map_err(storage_err)?;
        let _: std::result::Result<i64, _> = redis::cmd("EXPIRE")
            .arg(key)
            .arg(ttl.as_secs().max(1))
            .arg("NX")
            .query_async(&mut conn)
            .await;
        Ok(value)
    }

    async fn ttl_remaining(&self, key: &str) -> Result<Option<Duration>> {
        let mut conn = self.conn.clone();
        let millis: i64 = redis::cmd("PTTL")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(storage_err)?;
        if millis < 0 {
            Ok(None)
        } else {
            Ok(Some(Duration::from_millis(millis as u64)))
        }
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: i64 = redis::cmd("PUBLISH")
            .arg(channel)
            .arg(payload)
            .query_async(&mut conn)
            .await
            .map_err(storage_err)?;
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// In-memory backend
// ─────────────────────────────────────────────────────────────────────────────

struct MemoryEntry {
    value: String,
    expires_at: Option<Instant>,
}

impl MemoryEntry {
    fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|at| Instant::now() >= at)
    }
}

/// In-memory KV store with per-entry expiry. Pub/sub is a process-local
/// broadcast channel.
pub struct MemoryKv {
    entries: DashMap<String, MemoryEntry>,
    channel: broadcast::Sender<(String, String)>,
}

impl Default for MemoryKv {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryKv {
    pub fn new() -> Self {
        let (channel, _) = broadcast::channel(256);
        Self {
            entries: DashMap::new(),
            channel,
        }
    }

    /// Subscribe to published messages as `(channel, payload)` pairs.
    pub fn subscribe(&self) -> broadcast::Receiver<(String, String)> {
        self.channel.subscribe()
    }

    fn live_value(&self, key: &str) -> Option<String> {
        let expired = match self.entries.get(key) {
            Some(entry) if !entry.is_expired() => return Some(entry.value.clone()),
            Some(_) => true,
            None => false,
        };
        // The read guard is gone here; lazily evict the expired entry.
        if expired {
            self.entries.remove_if(key, |_, entry| entry.is_expired());
        }
        None
    }
}

#[async_trait]
impl KvStore for MemoryKv {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.live_value(key))
    }

    async fn set_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        self.entries.insert(
            key.to_string(),
            MemoryEntry {
                value: value.to_string(),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn set_nx_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        // The entry API holds the shard lock across the check-then-insert,
        // which is what makes this atomic.
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().is_expired() {
                    occupied.insert(MemoryEntry {
                        value: value.to_string(),
                        expires_at: Some(Instant::now() + ttl),
                    });
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(MemoryEntry {
                    value: value.to_string(),
                    expires_at: Some(Instant::now() + ttl),
                });
                Ok(true)
            }
        }
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.entries.remove(key);
        Ok(())
    }

    async fn incr_by(&self, key: &str, delta: i64, ttl: Duration) -> Result<i64> {
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().is_expired() {
                    occupied.insert(MemoryEntry {
                        value: delta.to_string(),
                        expires_at: Some(Instant::now() + ttl),
                    });
                    Ok(delta)
                } else {
                    let current: i64 = occupied.get().value.parse().unwrap_or(0);
                    let next = current + delta;
                    occupied.get_mut().value = next.to_string();
                    Ok(next)
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(MemoryEntry {
                    value: delta.to_string(),
                    expires_at: Some(Instant::now() + ttl),
                });
                Ok(delta)
            }
        }
    }

    async fn incr_by_float(&self, key: &str, delta: f64, ttl: Duration) -> Result<f64> {
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().is_expired() {
                    occupied.insert(MemoryEntry {
                        value: delta.to_string(),
                        expires_at: Some(Instant::now() + ttl),
                    });
                    Ok(delta)
                } else {
                    let current: f64 = occupied.get().value.parse().unwrap_or(0.0);
                    let next = current + delta;
                    occupied.get_mut().value = next.to_string();
                    Ok(next)
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(MemoryEntry {
                    value: delta.to_string(),
                    expires_at: Some(Instant::now() + ttl),
                });
                Ok(delta)
            }
        }
    }

    async fn ttl_remaining(&self, key: &str) -> Result<Option<Duration>> {
        match self.entries.get(key) {
            Some(entry) if !entry.is_expired() => Ok(entry
                .expires_at
                .map(|at| at.saturating_duration_since(Instant::now()))),
            _ => Ok(None),
        }
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<()> {
        // No subscribers is fine: publish is fire-and-forget.
        let _ = self
            .channel
            .send((channel.to_string(), payload.to_string()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_set_get_roundtrip() {
        let kv = MemoryKv::new();
        kv.set_ttl("k", "v", Duration::from_secs(60)).await.unwrap();
        assert_eq!(kv.get("k").await.unwrap().as_deref(), Some("v"));
        kv.delete("k").await.unwrap();
        assert_eq!(kv.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_expired_entries_are_invisible() {
        let kv = MemoryKv::new();
        kv.set_ttl("k", "v", Duration::from_millis(10))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(25)).await;
        assert_eq!(kv.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_set_nx_claims_once() {
        let kv = MemoryKv::new();
        assert!(kv
            .set_nx_ttl("lock", "agent_a", Duration::from_secs(30))
            .await
            .unwrap());
        assert!(!kv
            .set_nx_ttl("lock", "agent_b", Duration::from_secs(30))
            .await
            .unwrap());
        // The original holder's value survives the failed claim.
        assert_eq!(kv.get("lock").await.unwrap().as_deref(), Some("agent_a"));
    }

    #[tokio::test]
    async fn test_set_nx_reclaims_after_expiry() {
        let kv = MemoryKv::new();
        assert!(kv
            .set_nx_ttl("lock", "agent_a", Duration::from_millis(10))
            .await
            .unwrap());
        tokio::time::sleep(Duration::from_millis(25)).await;
        assert!(kv
            .set_nx_ttl("lock", "agent_b", Duration::from_secs(30))
            .await
            .unwrap());
        assert_eq!(kv.get("lock").await.unwrap().as_deref(), Some("agent_b"));
    }

    #[tokio::test]
    async fn test_counters_accumulate() {
        let kv = MemoryKv::new();
        assert_eq!(kv.incr_by("n", 2, Duration::from_secs(60)).await.unwrap(), 2);
        assert_eq!(kv.incr_by("n", 3, Duration::from_secs(60)).await.unwrap(), 5);
        let cost = kv
            .incr_by_float("cost", 0.5, Duration::from_secs(60))
            .await
            .unwrap();
        assert!((cost - 0.5).abs() < 1e-9);
        let cost = kv
            .incr_by_float("cost", 0.25, Duration::from_secs(60))
            .await
            .unwrap();
        assert!((cost - 0.75).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_ttl_remaining_reports_freshness() {
        let kv = MemoryKv::new();
        kv.set_ttl("k", "v", Duration::from_secs(30)).await.unwrap();
        let remaining = kv.ttl_remaining("k").await.unwrap().unwrap();
        assert!(remaining <= Duration::from_secs(30));
        assert!(remaining > Duration::from_secs(25));
        assert_eq!(kv.ttl_remaining("missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_publish_reaches_subscribers() {
        let kv = MemoryKv::new();
        let mut rx = kv.subscribe();
        kv.publish("events", "hello").await.unwrap();
        let (channel, payload) = rx.recv().await.unwrap();
        assert_eq!(channel, "events");
        assert_eq!(payload, "hello");
    }
}
