//! Prometheus metrics for the switchboard, exported in OpenMetrics text
//! format from the `/metrics` endpoint.
//!
//! Label values are `Cow<'static, str>` so the hot path labels (route,
//! action, outcome) never allocate.

use std::borrow::Cow;

use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
use prometheus_client::registry::Registry;

/// Labels for proxied request counters.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct RequestLabels {
    /// Terminal HTTP status class, e.g. "200", "403", "502".
    pub status: Cow<'static, str>,
}

/// Labels for firewall decision counters.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct DecisionLabels {
    /// Action taken: "allowed", "audited", "blocked", "shadow_blocked".
    pub action: Cow<'static, str>,
}

/// Labels for cache lookup counters.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct CacheLabels {
    /// "hit_exact", "hit_ann", or "miss".
    pub outcome: Cow<'static, str>,
}

/// Labels for lock resolution counters.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct LockLabels {
    /// "granted", "queued", or "rejected".
    pub resolution: Cow<'static, str>,
}

/// Labels for emitted fan-out events.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct EventLabels {
    pub event: Cow<'static, str>,
}

/// All switchboard metrics, registered once at startup.
pub struct SwitchboardMetrics {
    pub requests_total: Family<RequestLabels, Counter>,
    pub firewall_decisions_total: Family<DecisionLabels, Counter>,
    pub firewall_latency_ms: Histogram,
    pub cache_lookups_total: Family<CacheLabels, Counter>,
    pub lock_resolutions_total: Family<LockLabels, Counter>,
    pub events_emitted_total: Family<EventLabels, Counter>,
    pub recorder_buffer_depth: Gauge,
    pub upstream_requests_total: Family<RequestLabels, Counter>,
}

impl SwitchboardMetrics {
    /// Create and register every metric against `registry`.
    pub fn new(registry: &mut Registry) -> Self {
        let requests_total = Family::<RequestLabels, Counter>::default();
        registry.register(
            "switchboard_requests",
            "Proxied requests by terminal status",
            requests_total.clone(),
        );

        let firewall_decisions_total = Family::<DecisionLabels, Counter>::default();
        registry.register(
            "switchboard_firewall_decisions",
            "Firewall decisions by action",
            firewall_decisions_total.clone(),
        );

        let firewall_latency_ms =
            Histogram::new(exponential_buckets(0.05, 2.0, 12));
        registry.register(
            "switchboard_firewall_latency_ms",
            "Firewall evaluation latency in milliseconds",
            firewall_latency_ms.clone(),
        );

        let cache_lookups_total = Family::<CacheLabels, Counter>::default();
        registry.register(
            "switchboard_cache_lookups",
            "Semantic cache lookups by outcome",
            cache_lookups_total.clone(),
        );

        let lock_resolutions_total = Family::<LockLabels, Counter>::default();
        registry.register(
            "switchboard_lock_resolutions",
            "Resource lock requests by resolution",
            lock_resolutions_total.clone(),
        );

        let events_emitted_total = Family::<EventLabels, Counter>::default();
        registry.register(
            "switchboard_events_emitted",
            "Fan-out events emitted by type",
            events_emitted_total.clone(),
        );

        let recorder_buffer_depth = Gauge::default();
        registry.register(
            "switchboard_recorder_buffer_depth",
            "Traces waiting in the recorder buffer",
            recorder_buffer_depth.clone(),
        );

        let upstream_requests_total = Family::<RequestLabels, Counter>::default();
        registry.register(
            "switchboard_upstream_requests",
            "Upstream forwards by status",
            upstream_requests_total.clone(),
        );

        Self {
            requests_total,
            firewall_decisions_total,
            firewall_latency_ms,
            cache_lookups_total,
            lock_resolutions_total,
            events_emitted_total,
            recorder_buffer_depth,
            upstream_requests_total,
        }
    }

    pub fn record_request(&self, status: u16) {
        self.requests_total
            .get_or_create(&RequestLabels {
                status: Cow::Owned(status.to_string()),
            })
            .inc();
    }

    pub fn record_decision(&self, action: &'static str, latency_ms: f64) {
        self.firewall_decisions_total
            .get_or_create(&DecisionLabels {
                action: Cow::Borrowed(action),
            })
            .inc();
        self.firewall_latency_ms.observe(latency_ms);
    }

    pub fn record_cache(&self, outcome: &'static str) {
        self.cache_lookups_total
            .get_or_create(&CacheLabels {
                outcome: Cow::Borrowed(outcome),
            })
            .inc();
    }

    pub fn record_lock(&self, resolution: &'static str) {
        self.lock_resolutions_total
            .get_or_create(&LockLabels {
                resolution: Cow::Borrowed(resolution),
            })
            .inc();
    }

    pub fn record_event(&self, event: &'static str) {
        self.events_emitted_total
            .get_or_create(&EventLabels {
                event: Cow::Borrowed(event),
            })
            .inc();
    }
}
