//! The semantic cache: exact-hash lookup through the KV store, then
//! approximate-nearest-neighbour lookup on prompt embeddings.
//!
//! Every path here fails open: a storage or embedding error downgrades to
//! a miss (lookup) or a no-op (store, hit accounting) and the request
//! proceeds to the upstream.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::body::truncate_chars;
use crate::embedding::Embedder;
use crate::store::{KvStore, TraceStore};
use crate::types::CacheEntry;

/// Prompt text is truncated to this many characters before embedding.
const EMBED_INPUT_LIMIT: usize = 512;

/// A cache lookup result.
#[derive(Debug, Clone)]
pub struct CacheHit {
    pub cache_id: Uuid,
    pub response_text: String,
    /// 1.0 for an exact hash hit, `1 - cosine distance` for an ANN hit.
    pub similarity: f32,
}

/// Value mirrored under the KV shortcut key.
#[derive(Serialize, Deserialize)]
struct KvShortcut {
    cache_id: Uuid,
    response_text: String,
}

/// Exact + approximate prompt/response cache.
pub struct SemanticCache {
    kv: Arc<dyn KvStore>,
    store: Arc<dyn TraceStore>,
    embedder: Arc<dyn Embedder>,
    ttl: Duration,
    similarity_threshold: f32,
}

impl SemanticCache {
    pub fn new(
        kv: Arc<dyn KvStore>,
        store: Arc<dyn TraceStore>,
        embedder: Arc<dyn Embedder>,
        ttl: Duration,
        similarity_threshold: f32,
    ) -> Self {
        Self {
            kv,
            store,
            embedder,
            ttl,
            similarity_threshold,
        }
    }

    /// First 16 hex characters of SHA-256 over the prompt text.
    pub fn prompt_hash(prompt: &str) -> String {
        let digest = Sha256::digest(prompt.as_bytes());
        let hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
        hex[..16].to_string()
    }

    fn kv_key(org_id: &str, model: &str, hash: &str) -> String {
        format!("cache:{org_id}:{model}:{hash}")
    }

    /// Look up a prompt. Exact hash first, then ANN under the distance
    /// threshold. Errors degrade to a miss.
    pub async fn lookup(&self, org_id: &str, model: &str, prompt: &str) -> Option<CacheHit> {
        let hash = Self::prompt_hash(prompt);
        let key = Self::kv_key(org_id, model, &hash);

        match self.kv.get(&key).await {
            Ok(Some(raw)) => match serde_json::from_str::<KvShortcut>(&raw) {
                Ok(shortcut) => {
                    debug!(org = org_id, model, "Exact cache hit");
                    return Some(CacheHit {
                        cache_id: shortcut.cache_id,
                        response_text: shortcut.response_text,
                        similarity: 1.0,
                    });
                }
                Err(e) => warn!(error = %e, "Corrupt cache shortcut, ignoring"),
            },
            Ok(None) => {}
            Err(e) => warn!(error = %e, "Cache shortcut lookup failed, continuing"),
        }

        let embedding = match self
            .embedder
            .embed(&truncate_chars(prompt, EMBED_INPUT_LIMIT))
            .await
        {
            Ok(embedding) => embedding,
            Err(e) => {
                warn!(error = %e, "Prompt embedding failed, skipping ANN lookup");
                return None;
            }
        };

        match self.store.cache_nearest(org_id, model, &embedding).await {
            Ok(Some((entry, distance))) if distance < self.similarity_threshold => {
                debug!(org = org_id, model, distance, "ANN cache hit");
                Some(CacheHit {
                    cache_id: entry.cache_id,
                    response_text: entry.response_text,
                    similarity: 1.0 - distance,
                })
            }
            Ok(_) => None,
            Err(e) => {
                warn!(error = %e, "ANN cache lookup failed, continuing");
                None
            }
        }
    }

    /// Store a response. Writes both the KV shortcut and the durable row;
    /// both writes are best-effort.
    pub async fn store(
        &self,
        org_id: &str,
        model: &str,
        prompt: &str,
        response_text: &str,
        response_tokens: Option<i64>,
    ) {
        let embedding = match self
            .embedder
            .embed(&truncate_chars(prompt, EMBED_INPUT_LIMIT))
            .await
        {
            Ok(embedding) => embedding,
            Err(e) => {
                warn!(error = %e, "Prompt embedding failed, skipping cache store");
                return;
            }
        };

        let now = Utc::now();
        let hash = Self::prompt_hash(prompt);
        let entry = CacheEntry {
            cache_id: Uuid::new_v4(),
            org_id: org_id.to_string(),
            model: model.to_string(),
            prompt_hash: hash.clone(),
            prompt_embedding: embedding,
            prompt_text: truncate_chars(prompt, EMBED_INPUT_LIMIT),
            response_text: response_text.to_string(),
            response_tokens,
            hit_count: 0,
            cost_saved: 0.0,
            created_at: now,
            expires_at: now
                + chrono::Duration::seconds(self.ttl.as_secs().min(i64::MAX as u64) as i64),
        };

        if let Err(e) = self.store.cache_upsert(&entry).await {
            warn!(error = %e, "Durable cache write failed, continuing");
        }

        let shortcut = KvShortcut {
            cache_id: entry.cache_id,
            response_text: response_text.to_string(),
        };
        match serde_json::to_string(&shortcut) {
            Ok(json) => {
                let key = Self::kv_key(org_id, model, &hash);
                if let Err(e) = self.kv.set_ttl(&key, &json, self.ttl).await {
                    warn!(error = %e, "Cache shortcut write failed, continuing");
                }
            }
            Err(e) => warn!(error = %e, "Cache shortcut serialisation failed"),
        }
    }

    /// Best-effort hit accounting.
    pub async fn record_hit(&self, cache_id: Uuid, cost_saved: f64) {
        if let Err(e) = self.store.cache_record_hit(cache_id, cost_saved).await {
            warn!(error = %e, "Cache hit accounting failed, continuing");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::HashEmbedder;
    use crate::store::{MemoryKv, MemoryStore, TraceStore};

    fn cache_with(store: Arc<MemoryStore>) -> SemanticCache {
        SemanticCache::new(
            Arc::new(MemoryKv::new()),
            store,
            Arc::new(HashEmbedder::new()),
            Duration::from_secs(3600),
            0.10,
        )
    }

    #[test]
    fn test_prompt_hash_shape() {
        let hash = SemanticCache::prompt_hash("user:2+2?");
        assert_eq!(hash.len(), 16);
        assert!(hash.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(hash, SemanticCache::prompt_hash("user:2+2?"));
        assert_ne!(hash, SemanticCache::prompt_hash("user:2+3?"));
    }

    #[tokio::test]
    async fn test_exact_hit_after_store() {
        let store = Arc::new(MemoryStore::new());
        let cache = cache_with(store);
        cache
            .store("org_a", "gpt-3.5-turbo", "user:2+2?", "4", Some(1))
            .await;

        let hit = cache.lookup("org_a", "gpt-3.5-turbo", "user:2+2?").await;
        let hit = hit.expect("identical prompt must hit");
        assert_eq!(hit.similarity, 1.0);
        assert_eq!(hit.response_text, "4");
    }

    #[tokio::test]
    async fn test_ann_hit_for_similar_prompt() {
        let store = Arc::new(MemoryStore::new());
        let cache = cache_with(store);
        cache
            .store(
                "org_a",
                "gpt-3.5-turbo",
                "user:summarise the quarterly revenue report for me",
                "summary",
                None,
            )
            .await;

        // Same bag of words, different order: far under the threshold.
        let hit = cache
            .lookup(
                "org_a",
                "gpt-3.5-turbo",
                "user:summarise the quarterly revenue report for me now",
            )
            .await;
        let hit = hit.expect("paraphrase should hit via ANN");
        assert!(hit.similarity > 0.90);
        assert_eq!(hit.response_text, "summary");
    }

    #[tokio::test]
    async fn test_miss_for_unrelated_prompt_and_wrong_scope() {
        let store = Arc::new(MemoryStore::new());
        let cache = cache_with(store);
        cache
            .store("org_a", "gpt-3.5-turbo", "user:hello there", "hi", None)
            .await;

        assert!(cache
            .lookup("org_a", "gpt-3.5-turbo", "user:compile kernel statistics")
            .await
            .is_none());
        // Different model and different org are separate namespaces.
        assert!(cache
            .lookup("org_a", "gpt-4", "user:hello there")
            .await
            .is_none());
        assert!(cache
            .lookup("org_b", "gpt-3.5-turbo", "user:hello there")
            .await
            .is_none());
    }

    #[tokio::test]
    async fn test_record_hit_accumulates() {
        let store = Arc::new(MemoryStore::new());
        let cache = cache_with(store.clone());
        cache
            .store("org_a", "gpt-3.5-turbo", "user:2+2?", "4", None)
            .await;
        let hit = cache
            .lookup("org_a", "gpt-3.5-turbo", "user:2+2?")
            .await
            .unwrap();
        cache.record_hit(hit.cache_id, 0.002).await;
        cache.record_hit(hit.cache_id, 0.002).await;

        let stats = store.cache_stats("org_a").await.unwrap();
        assert_eq!(stats.entries, 1);
        assert_eq!(stats.total_hits, 2);
        assert!((stats.total_cost_saved - 0.004).abs() < 1e-9);
    }
}
