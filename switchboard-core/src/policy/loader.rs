//! Policy loading and hot reload.
//!
//! The active document lives behind an `ArcSwap`: readers take a cheap
//! snapshot per request, writers (file watcher, control plane) swap
//! atomically. File reload happens on change only; a document that fails
//! to parse is rejected and the previous snapshot stays active.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{PolicyDocument, PolicyUpdate};
use crate::error::{Result, SwitchboardError};
use crate::store::KvStore;

/// KV key under which the active document is mirrored for dashboards and
/// sibling instances.
const POLICY_KV_KEY: &str = "policy:default";
const POLICY_KV_TTL: Duration = Duration::from_secs(7 * 24 * 3600);

/// Holds the active policy snapshot and its reload machinery.
pub struct PolicyLoader {
    current: ArcSwap<PolicyDocument>,
    path: Option<PathBuf>,
    kv: Arc<dyn KvStore>,
}

impl PolicyLoader {
    /// Load the initial document. A missing or unreadable file falls back
    /// to the built-in default so the proxy still starts.
    pub fn new(path: Option<PathBuf>, kv: Arc<dyn KvStore>) -> Self {
        let document = match path.as_deref() {
            Some(p) => match load_from_file(p) {
                Ok(doc) => {
                    info!(path = %p.display(), policy_id = %doc.policy_id, version = doc.version, "Policy document loaded");
                    doc
                }
                Err(e) => {
                    warn!(path = %p.display(), error = %e, "Policy file unreadable, starting with defaults");
                    PolicyDocument::default()
                }
            },
            None => {
                debug!("No POLICIES_CONFIG_PATH set, starting with default policy");
                PolicyDocument::default()
            }
        };
        Self {
            current: ArcSwap::from_pointee(document),
            path,
            kv,
        }
    }

    /// The active document. Cheap; take one snapshot per request.
    pub fn snapshot(&self) -> Arc<PolicyDocument> {
        self.current.load_full()
    }

    /// Re-read the file and swap if it parses. Keeps the old snapshot on
    /// any failure.
    pub fn reload_from_file(&self) -> Result<()> {
        let path = self
            .path
            .as_deref()
            .ok_or_else(|| SwitchboardError::Config("no policy file configured".to_string()))?;
        let document = load_from_file(path)?;
        info!(policy_id = %document.policy_id, version = document.version, "Policy document reloaded");
        self.current.store(Arc::new(document));
        Ok(())
    }

    /// Apply a partial update, swap the snapshot, and mirror the merged
    /// document into the KV store. Last writer wins.
    pub async fn apply_update(&self, update: &PolicyUpdate) -> Arc<PolicyDocument> {
        let next = Arc::new(update.apply(&self.snapshot()));
        self.current.store(next.clone());
        match serde_json::to_string(next.as_ref()) {
            Ok(json) => {
                if let Err(e) = self.kv.set_ttl(POLICY_KV_KEY, &json, POLICY_KV_TTL).await {
                    warn!(error = %e, "Failed to mirror policy document into KV store");
                }
            }
            Err(e) => warn!(error = %e, "Failed to serialise policy document"),
        }
        next
    }

    /// Watch the policy file and reload on change until `shutdown` fires.
    ///
    /// The watcher lives on a blocking thread; reload itself is cheap and
    /// runs inline there.
    pub fn spawn_watcher(self: &Arc<Self>, shutdown: CancellationToken) {
        let path = match self.path.clone() {
            Some(p) => p,
            None => return,
        };
        let loader = Arc::clone(self);
        tokio::task::spawn_blocking(move || {
            let (tx, rx) = std::sync::mpsc::channel::<notify::Result<notify::Event>>();
            let mut watcher: RecommendedWatcher = match notify::recommended_watcher(tx) {
                Ok(w) => w,
                Err(e) => {
                    error!(error = %e, "Failed to create policy file watcher");
                    return;
                }
            };
            if let Err(e) = watcher.watch(&path, RecursiveMode::NonRecursive) {
                error!(path = %path.display(), error = %e, "Failed to watch policy file");
                return;
            }
            info!(path = %path.display(), "Policy file watcher started");
            loop {
                if shutdown.is_cancelled() {
                    debug!("Policy file watcher shutting down");
                    return;
                }
                match rx.recv_timeout(Duration::from_millis(500)) {
                    Ok(Ok(event)) if is_content_change(&event) => {
                        if let Err(e) = loader.reload_from_file() {
                            warn!(error = %e, "Policy reload failed, keeping previous document");
                        }
                    }
                    Ok(Ok(_)) => {}
                    Ok(Err(e)) => warn!(error = %e, "Policy watcher event error"),
                    Err(std::sync::mpsc::RecvTimeoutError::Timeout) => {}
                    Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => return,
                }
            }
        });
    }
}

fn is_content_change(event: &notify::Event) -> bool {
    use notify::EventKind;
    matches!(
        event.kind,
        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
    )
}

fn load_from_file(path: &Path) -> Result<PolicyDocument> {
    let contents = std::fs::read_to_string(path)
        .map_err(|e| SwitchboardError::Config(format!("{}: {e}", path.display())))?;
    if contents.trim().is_empty() {
        return Err(SwitchboardError::Config(format!(
            "{}: empty policy file",
            path.display()
        )));
    }
    serde_yaml::from_str(&contents)
        .map_err(|e| SwitchboardError::Config(format!("{}: {e}", path.display())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryKv;
    use crate::types::IntentCategory;
    use std::io::Write;

    fn kv() -> Arc<dyn KvStore> {
        Arc::new(MemoryKv::new())
    }

    #[tokio::test]
    async fn test_missing_file_falls_back_to_default() {
        let loader = PolicyLoader::new(Some(PathBuf::from("/nonexistent/policies.yaml")), kv());
        assert_eq!(loader.snapshot().policy_id, "default");
    }

    #[tokio::test]
    async fn test_load_and_reload_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "policy_id: from_file\nversion: 3").unwrap();
        file.flush().unwrap();

        let loader = PolicyLoader::new(Some(file.path().to_path_buf()), kv());
        assert_eq!(loader.snapshot().policy_id, "from_file");
        assert_eq!(loader.snapshot().version, 3);

        // Rewrite and reload explicitly.
        std::fs::write(file.path(), "policy_id: rewritten\nversion: 4\n").unwrap();
        loader.reload_from_file().unwrap();
        assert_eq!(loader.snapshot().policy_id, "rewritten");
    }

    #[tokio::test]
    async fn test_bad_reload_keeps_previous_snapshot() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "policy_id: good").unwrap();
        file.flush().unwrap();

        let loader = PolicyLoader::new(Some(file.path().to_path_buf()), kv());
        std::fs::write(file.path(), "{{{ not yaml").unwrap();
        assert!(loader.reload_from_file().is_err());
        assert_eq!(loader.snapshot().policy_id, "good");
    }

    #[tokio::test]
    async fn test_update_swaps_and_mirrors_to_kv() {
        let memory = Arc::new(MemoryKv::new());
        let loader = PolicyLoader::new(None, memory.clone());
        let update = PolicyUpdate {
            blocked_intents: Some(vec![IntentCategory::Destructive]),
            ..Default::default()
        };
        let next = loader.apply_update(&update).await;
        assert_eq!(next.version, 2);
        assert!(loader.snapshot().blocks_intent(IntentCategory::Destructive));

        let mirrored = memory.get(POLICY_KV_KEY).await.unwrap().unwrap();
        let parsed: PolicyDocument = serde_json::from_str(&mirrored).unwrap();
        assert_eq!(parsed.version, 2);
    }
}
