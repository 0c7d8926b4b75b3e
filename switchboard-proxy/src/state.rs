//! Shared application state: every component the handlers compose, wired
//! once at startup.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use prometheus_client::registry::Registry;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use switchboard_core::anomaly::AnomalyDetector;
use switchboard_core::cache::SemanticCache;
use switchboard_core::embedding::Embedder;
use switchboard_core::error::Result;
use switchboard_core::events::EventFanout;
use switchboard_core::firewall::waf::WafRuleSet;
use switchboard_core::firewall::SemanticFirewall;
use switchboard_core::metrics::SwitchboardMetrics;
use switchboard_core::policy::PolicyLoader;
use switchboard_core::recorder::FlightRecorder;
use switchboard_core::sandbox::WorkerSandbox;
use switchboard_core::store::{KvStore, TraceStore};
use switchboard_core::traffic::TrafficController;
use switchboard_core::SwitchboardConfig;

/// Control-plane flags outside any single component.
#[derive(Default)]
pub struct Controls {
    /// Pause-all: every agent is treated as paused while set.
    pub global_pause: AtomicBool,
    /// Agents paused individually, mirrored from the store for the hot path.
    pub paused_agents: DashMap<String, ()>,
}

impl Controls {
    pub fn is_globally_paused(&self) -> bool {
        self.global_pause.load(Ordering::SeqCst)
    }

    pub fn set_global_pause(&self, paused: bool) {
        self.global_pause.store(paused, Ordering::SeqCst);
    }

    pub fn is_agent_paused(&self, agent_id: &str) -> bool {
        self.paused_agents.contains_key(agent_id)
    }
}

/// Everything the HTTP handlers need, cheap to clone.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<SwitchboardConfig>,
    pub kv: Arc<dyn KvStore>,
    pub store: Arc<dyn TraceStore>,
    pub policy: Arc<PolicyLoader>,
    pub waf: Arc<WafRuleSet>,
    pub firewall: Arc<SemanticFirewall>,
    pub traffic: Arc<TrafficController>,
    pub cache: Arc<SemanticCache>,
    pub recorder: Arc<FlightRecorder>,
    pub sandbox: Arc<WorkerSandbox>,
    pub fanout: Arc<EventFanout>,
    pub anomaly: Arc<AnomalyDetector>,
    pub metrics: Arc<SwitchboardMetrics>,
    pub registry: Arc<Registry>,
    pub http: reqwest::Client,
    pub controls: Arc<Controls>,
    pub ready: Arc<AtomicBool>,
}

impl AppState {
    /// Wire all components over the provided backends.
    pub async fn build(
        config: SwitchboardConfig,
        kv: Arc<dyn KvStore>,
        store: Arc<dyn TraceStore>,
        embedder: Arc<dyn Embedder>,
    ) -> Result<Self> {
        let mut registry = Registry::default();
        let metrics = Arc::new(SwitchboardMetrics::new(&mut registry));
        let registry = Arc::new(registry);

        let policy = Arc::new(PolicyLoader::new(
            config.policies_config_path.clone().map(PathBuf::from),
            kv.clone(),
        ));
        let waf = Arc::new(WafRuleSet::with_default_rules());
        let firewall = Arc::new(SemanticFirewall::new(
            policy.clone(),
            waf.clone(),
            config.shadow_mode,
        ));
        let traffic = Arc::new(TrafficController::new(
            kv.clone(),
            config.lock_ttl,
            config.max_queue_depth,
            config.emergency_stop_enabled,
        ));
        let cache = Arc::new(SemanticCache::new(
            kv.clone(),
            store.clone(),
            embedder,
            config.cache_ttl,
            config.cache_similarity_threshold,
        ));
        let recorder = Arc::new(FlightRecorder::new(store.clone(), kv.clone()));
        let fanout = Arc::new(EventFanout::new());
        let anomaly = Arc::new(AnomalyDetector::new(store.clone(), fanout.clone()));

        let sandbox = Arc::new(WorkerSandbox::new());
        if let Some(ref path) = config.workers_config_path {
            match sandbox.load_file(std::path::Path::new(path)).await {
                Ok(count) => info!(count, "Worker scripts registered"),
                Err(e) => warn!(error = %e, "Worker registry unreadable, starting without workers"),
            }
        }

        let http = reqwest::Client::builder()
            .timeout(config.upstream_timeout)
            .pool_max_idle_per_host(32)
            .build()
            .map_err(|e| switchboard_core::SwitchboardError::Config(e.to_string()))?;

        Ok(Self {
            config: Arc::new(config),
            kv,
            store,
            policy,
            waf,
            firewall,
            traffic,
            cache,
            recorder,
            sandbox,
            fanout,
            anomaly,
            metrics,
            registry,
            http,
            controls: Arc::new(Controls::default()),
            ready: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Launch the background tasks: recorder flush, anomaly scan, policy
    /// file watcher.
    pub fn spawn_background(&self, shutdown: CancellationToken) {
        self.recorder.spawn_flush(shutdown.clone());
        self.anomaly.spawn(shutdown.clone());
        self.policy.spawn_watcher(shutdown);
    }

    pub fn mark_ready(&self) {
        self.ready.store(true, Ordering::SeqCst);
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    /// Emit a fan-out event and count it.
    pub fn emit_event(
        &self,
        event_type: switchboard_core::events::EventType,
        org_id: Option<&str>,
        payload: serde_json::Value,
    ) {
        self.metrics.record_event(event_type.as_str());
        self.fanout.emit(event_type, org_id, payload);
    }
}
