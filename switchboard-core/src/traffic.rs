//! The traffic controller: distributed resource locking with conflict
//! resolution, plus the process-wide emergency stop.
//!
//! A logical resource is identified by the first 16 hex characters of
//! SHA-256 over `"type:path"`. Locks are claimed with an atomic
//! set-if-absent carrying the lock TTL; expiry is authoritative, so a
//! crashed holder can stall writers for at most one TTL.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::error::Result;
use crate::store::KvStore;

/// A writer blocked on a lock expiring within this window queues instead
/// of being rejected.
const QUEUE_WINDOW: Duration = Duration::from_secs(5);
/// Padding added to the remaining TTL when quoting a queue wait.
const QUEUE_PADDING_MS: u64 = 100;

/// How a lock request resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    Granted,
    Queued,
    Rejected,
}

/// A granted lock, echoed back so callers can release it.
#[derive(Debug, Clone, Serialize)]
pub struct LockInfo {
    pub resource_hash: String,
    pub holder_agent_id: String,
    pub ttl_seconds: u64,
}

/// Outcome of `request_access`.
#[derive(Debug, Clone)]
pub struct AccessOutcome {
    pub resolution: Resolution,
    pub lock: Option<LockInfo>,
    pub wait_ms: Option<u64>,
    pub reason: Option<String>,
}

/// An extracted logical resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceRef {
    pub resource_type: &'static str,
    pub path: String,
}

impl ResourceRef {
    pub fn qualified(&self) -> String {
        format!("{}:{}", self.resource_type, self.path)
    }
}

static TABLE_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:from|into|update|join|table)\s+([A-Za-z_][A-Za-z0-9_.]*)")
        .expect("table pattern must compile")
});
static FILE_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)["']?(?:file|path)["']?\s*[:=]\s*["']([^"']+)["']"#)
        .expect("file pattern must compile")
});
static ENDPOINT_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)["']?(?:url|endpoint)["']?\s*[:=]\s*["']([^"']+)["']"#)
        .expect("endpoint pattern must compile")
});

const WRITE_VERBS: &[&str] = &[
    "update", "insert", "upsert", "delete", "drop", "truncate", "write", "create", "modify",
];

/// Resource extraction over the serialised body. First match wins, in the
/// order database_table, file, api_endpoint.
pub fn extract_resource(body_text: &str) -> Option<ResourceRef> {
    if let Some(captures) = TABLE_PATTERN.captures(body_text) {
        return Some(ResourceRef {
            resource_type: "database_table",
            path: captures[1].to_lowercase(),
        });
    }
    if let Some(captures) = FILE_PATTERN.captures(body_text) {
        return Some(ResourceRef {
            resource_type: "file",
            path: captures[1].to_string(),
        });
    }
    if let Some(captures) = ENDPOINT_PATTERN.captures(body_text) {
        return Some(ResourceRef {
            resource_type: "api_endpoint",
            path: captures[1].to_string(),
        });
    }
    None
}

/// Write-intent heuristic: mutating HTTP methods always count; otherwise
/// a write verb anywhere in the lowercased body does.
pub fn is_write_operation(body_text: &str, method: &str) -> bool {
    if matches!(
        method.to_ascii_uppercase().as_str(),
        "POST" | "PUT" | "PATCH" | "DELETE"
    ) {
        return true;
    }
    let lowered = body_text.to_lowercase();
    WRITE_VERBS.iter().any(|verb| lowered.contains(verb))
}

/// First 16 hex characters of SHA-256 over `"type:path"`.
pub fn resource_hash(resource_type: &str, path: &str) -> String {
    let digest = Sha256::digest(format!("{resource_type}:{path}").as_bytes());
    let hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
    hex[..16].to_string()
}

/// Cross-agent lock arbiter backed by the KV store.
pub struct TrafficController {
    kv: Arc<dyn KvStore>,
    lock_ttl: Duration,
    max_queue_depth: u32,
    /// Writers currently sleeping on an expiring lock, per resource hash.
    queued: dashmap::DashMap<String, u32>,
    emergency_stop: AtomicBool,
}

impl TrafficController {
    pub fn new(
        kv: Arc<dyn KvStore>,
        lock_ttl: Duration,
        max_queue_depth: u32,
        emergency_stop_enabled: bool,
    ) -> Self {
        Self {
            kv,
            lock_ttl,
            max_queue_depth,
            queued: dashmap::DashMap::new(),
            emergency_stop: AtomicBool::new(emergency_stop_enabled),
        }
    }

    /// Attempt access to a logical resource on behalf of an agent.
    pub async fn request_access(
        &self,
        agent_id: &str,
        resource_type: &str,
        path: &str,
        is_write: bool,
    ) -> Result<AccessOutcome> {
        let hash = resource_hash(resource_type, path);
        let key = format!("lock:{hash}");

        // Two claim attempts: the second covers the race where the holder
        // expires between our failed claim and the holder read.
        for _ in 0..2 {
            if self.kv.set_nx_ttl(&key, agent_id, self.lock_ttl).await? {
                debug!(resource = %hash, agent = agent_id, "Lock granted");
                return Ok(AccessOutcome {
                    resolution: Resolution::Granted,
                    lock: Some(LockInfo {
                        resource_hash: hash,
                        holder_agent_id: agent_id.to_string(),
                        ttl_seconds: self.lock_ttl.as_secs(),
                    }),
                    wait_ms: None,
                    reason: None,
                });
            }

            let holder = match self.kv.get(&key).await? {
                Some(holder) => holder,
                // Lock vanished between claim and read: retry the claim.
                None => continue,
            };

            if holder == agent_id {
                // Re-entry by the current holder. No renewal on read.
                return Ok(AccessOutcome {
                    resolution: Resolution::Granted,
                    lock: Some(LockInfo {
                        resource_hash: hash,
                        holder_agent_id: holder,
                        ttl_seconds: self.lock_ttl.as_secs(),
                    }),
                    wait_ms: None,
                    reason: Some("re-entrant access".to_string()),
                });
            }

            if !is_write {
                return Ok(AccessOutcome {
                    resolution: Resolution::Granted,
                    lock: None,
                    wait_ms: None,
                    reason: Some("may see stale data".to_string()),
                });
            }

            let remaining = self
                .kv
                .ttl_remaining(&key)
                .await?
                .unwrap_or(Duration::ZERO);
            if remaining <= QUEUE_WINDOW {
                {
                    let mut depth = self.queued.entry(hash.clone()).or_insert(0);
                    if *depth >= self.max_queue_depth {
                        return Ok(AccessOutcome {
                            resolution: Resolution::Rejected,
                            lock: None,
                            wait_ms: None,
                            reason: Some(format!("queue full for resource held by {holder}")),
                        });
                    }
                    *depth += 1;
                }
                let wait_ms = remaining.as_millis() as u64 + QUEUE_PADDING_MS;
                return Ok(AccessOutcome {
                    resolution: Resolution::Queued,
                    lock: None,
                    wait_ms: Some(wait_ms),
                    reason: Some(format!("lock held by {holder}, expiring soon")),
                });
            }

            return Ok(AccessOutcome {
                resolution: Resolution::Rejected,
                lock: None,
                wait_ms: None,
                reason: Some(format!("resource locked by {holder}")),
            });
        }

        // Both claims raced out; treat as a rejection rather than looping.
        Ok(AccessOutcome {
            resolution: Resolution::Rejected,
            lock: None,
            wait_ms: None,
            reason: Some("lock contention".to_string()),
        })
    }

    /// A queued writer finished its wait; free its queue slot.
    pub fn leave_queue(&self, resource_type: &str, path: &str) {
        let hash = resource_hash(resource_type, path);
        if let Some(mut depth) = self.queued.get_mut(&hash) {
            *depth = depth.saturating_sub(1);
        }
    }

    /// Release a lock. Requires holder identity match; mismatch or a
    /// missing lock is a no-op returning `false`.
    pub async fn release_access(
        &self,
        agent_id: &str,
        resource_type: &str,
        path: &str,
    ) -> Result<bool> {
        let key = format!("lock:{}", resource_hash(resource_type, path));
        match self.kv.get(&key).await? {
            Some(holder) if holder == agent_id => {
                self.kv.delete(&key).await?;
                debug!(agent = agent_id, "Lock released");
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    // ── Emergency stop ──────────────────────────────────────────────────

    pub fn trigger_emergency_stop(&self) {
        self.emergency_stop.store(true, Ordering::SeqCst);
    }

    pub fn reset_emergency_stop(&self) {
        self.emergency_stop.store(false, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.emergency_stop.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryKv;

    fn controller(ttl: Duration) -> TrafficController {
        TrafficController::new(Arc::new(MemoryKv::new()), ttl, 5, false)
    }

    #[test]
    fn test_resource_hash_is_stable_16_hex() {
        let a = resource_hash("database_table", "accounts");
        let b = resource_hash("database_table", "accounts");
        assert_eq!(a, b);
        assert_eq!(a.len(), 16);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, resource_hash("file", "accounts"));
    }

    #[test]
    fn test_extract_resource_order() {
        // Table wins over file when both are present.
        let body = r#"{"content": "UPDATE accounts SET x=1", "file": "/tmp/x"}"#;
        let resource = extract_resource(body).unwrap();
        assert_eq!(resource.resource_type, "database_table");
        assert_eq!(resource.path, "accounts");

        let body = r#"{"path": "/data/report.csv"}"#;
        let resource = extract_resource(body).unwrap();
        assert_eq!(resource.resource_type, "file");
        assert_eq!(resource.path, "/data/report.csv");

        let body = r#"{"url": "https://api.example.com/v2/users"}"#;
        let resource = extract_resource(body).unwrap();
        assert_eq!(resource.resource_type, "api_endpoint");

        assert!(extract_resource(r#"{"content": "tell me a joke"}"#).is_none());
    }

    #[test]
    fn test_write_detection() {
        assert!(is_write_operation("anything", "POST"));
        assert!(is_write_operation("anything", "delete"));
        assert!(!is_write_operation("SELECT x FROM y", "GET"));
        assert!(is_write_operation("please update the row", "GET"));
    }

    #[tokio::test]
    async fn test_write_write_conflict_rejected() {
        let controller = controller(Duration::from_secs(30));
        let first = controller
            .request_access("agent_a", "database_table", "accounts", true)
            .await
            .unwrap();
        assert_eq!(first.resolution, Resolution::Granted);
        assert!(first.lock.is_some());

        let second = controller
            .request_access("agent_b", "database_table", "accounts", true)
            .await
            .unwrap();
        assert_eq!(second.resolution, Resolution::Rejected);
        assert!(second.reason.unwrap().contains("agent_a"));
    }

    #[tokio::test]
    async fn test_read_during_write_lock_granted_stale() {
        let controller = controller(Duration::from_secs(30));
        controller
            .request_access("agent_a", "database_table", "accounts", true)
            .await
            .unwrap();
        let read = controller
            .request_access("agent_b", "database_table", "accounts", false)
            .await
            .unwrap();
        assert_eq!(read.resolution, Resolution::Granted);
        assert!(read.lock.is_none());
        assert_eq!(read.reason.as_deref(), Some("may see stale data"));
    }

    #[tokio::test]
    async fn test_same_holder_reenters() {
        let controller = controller(Duration::from_secs(30));
        controller
            .request_access("agent_a", "file", "/tmp/x", true)
            .await
            .unwrap();
        let again = controller
            .request_access("agent_a", "file", "/tmp/x", true)
            .await
            .unwrap();
        assert_eq!(again.resolution, Resolution::Granted);
    }

    #[tokio::test]
    async fn test_expiring_lock_queues_writer() {
        let controller = controller(Duration::from_secs(3));
        controller
            .request_access("agent_a", "database_table", "accounts", true)
            .await
            .unwrap();
        let queued = controller
            .request_access("agent_b", "database_table", "accounts", true)
            .await
            .unwrap();
        assert_eq!(queued.resolution, Resolution::Queued);
        let wait = queued.wait_ms.unwrap();
        assert!(wait <= 3_100, "wait_ms = {wait}");
        assert!(wait >= QUEUE_PADDING_MS);
    }

    #[tokio::test]
    async fn test_queue_depth_is_bounded() {
        let controller =
            TrafficController::new(Arc::new(MemoryKv::new()), Duration::from_secs(3), 2, false);
        controller
            .request_access("agent_a", "database_table", "accounts", true)
            .await
            .unwrap();

        for waiter in ["agent_b", "agent_c"] {
            let outcome = controller
                .request_access(waiter, "database_table", "accounts", true)
                .await
                .unwrap();
            assert_eq!(outcome.resolution, Resolution::Queued);
        }
        // The third waiter finds the queue full.
        let overflow = controller
            .request_access("agent_d", "database_table", "accounts", true)
            .await
            .unwrap();
        assert_eq!(overflow.resolution, Resolution::Rejected);
        assert!(overflow.reason.unwrap().contains("queue full"));

        // A freed slot admits a new waiter.
        controller.leave_queue("database_table", "accounts");
        let retry = controller
            .request_access("agent_d", "database_table", "accounts", true)
            .await
            .unwrap();
        assert_eq!(retry.resolution, Resolution::Queued);
    }

    #[tokio::test]
    async fn test_release_requires_holder_match() {
        let controller = controller(Duration::from_secs(30));
        controller
            .request_access("agent_a", "file", "/tmp/x", true)
            .await
            .unwrap();
        assert!(!controller
            .release_access("agent_b", "file", "/tmp/x")
            .await
            .unwrap());
        assert!(controller
            .release_access("agent_a", "file", "/tmp/x")
            .await
            .unwrap());
        // Releasing twice is a no-op.
        assert!(!controller
            .release_access("agent_a", "file", "/tmp/x")
            .await
            .unwrap());

        // After release the resource is free again.
        let next = controller
            .request_access("agent_b", "file", "/tmp/x", true)
            .await
            .unwrap();
        assert_eq!(next.resolution, Resolution::Granted);
    }

    #[tokio::test]
    async fn test_lock_expiry_is_authoritative() {
        let controller = controller(Duration::from_millis(20));
        controller
            .request_access("agent_a", "file", "/tmp/x", true)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;
        let next = controller
            .request_access("agent_b", "file", "/tmp/x", true)
            .await
            .unwrap();
        assert_eq!(next.resolution, Resolution::Granted);
    }

    #[test]
    fn test_emergency_stop_toggles() {
        let controller = controller(Duration::from_secs(30));
        assert!(!controller.is_stopped());
        controller.trigger_emergency_stop();
        assert!(controller.is_stopped());
        controller.reset_emergency_stop();
        assert!(!controller.is_stopped());
    }
}
