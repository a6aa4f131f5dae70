//! Observability infrastructure for fleet orchestration
//!
//! Provides:
//! - Prometheus metrics (provisioning latency, reachable agents, failures, timeouts)
//! - Structured JSON logging with tracing

use prometheus::{
    register_histogram_vec, register_int_counter_vec, register_int_gauge_vec, HistogramVec,
    IntCounterVec, IntGaugeVec,
};
use std::sync::OnceLock;
use std::time::Duration;
use tracing::{info, warn};

/// Provisioning takes from seconds (fixed pool) to many minutes (image builds)
const PROVISIONING_BUCKETS: &[f64] = &[
    1.0, 5.0, 15.0, 30.0, 60.0, 120.0, 300.0, 600.0, 1200.0, 1800.0,
];

/// Global metrics instance (registered once)
static GLOBAL_METRICS: OnceLock<FleetMetricsInner> = OnceLock::new();

struct FleetMetricsInner {
    provisioning_seconds: HistogramVec,
    agents_reachable: IntGaugeVec,
    provisioning_failures: IntCounterVec,
    wait_timeouts: IntCounterVec,
    purged_artifacts: IntCounterVec,
}

impl FleetMetricsInner {
    fn new() -> Self {
        Self {
            provisioning_seconds: register_histogram_vec!(
                "fleet_agent_provisioning_seconds",
                "Time from provisioning start until an agent is reachable and verified",
                &["clusterable"],
                PROVISIONING_BUCKETS.to_vec()
            )
            .expect("Failed to register provisioning_seconds"),

            agents_reachable: register_int_gauge_vec!(
                "fleet_agents_reachable",
                "Load agents currently holding addresses",
                &["clusterable"]
            )
            .expect("Failed to register agents_reachable"),

            provisioning_failures: register_int_counter_vec!(
                "fleet_agent_provisioning_failures_total",
                "Agent provisioning attempts that failed",
                &["clusterable", "reason"]
            )
            .expect("Failed to register provisioning_failures"),

            wait_timeouts: register_int_counter_vec!(
                "fleet_wait_timeouts_total",
                "Bounded waits that expired",
                &["scope"]
            )
            .expect("Failed to register wait_timeouts"),

            purged_artifacts: register_int_counter_vec!(
                "fleet_purged_artifacts_total",
                "Account artifacts removed by cleanup",
                &["region", "artifact"]
            )
            .expect("Failed to register purged_artifacts"),
        }
    }
}

/// Fleet metrics for Prometheus exposition
///
/// Lightweight handle to the global metrics instance; clones share it.
#[derive(Clone)]
pub struct FleetMetrics {
    _private: (),
}

impl Default for FleetMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl FleetMetrics {
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(FleetMetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &FleetMetricsInner {
        GLOBAL_METRICS.get_or_init(FleetMetricsInner::new)
    }

    pub fn observe_provisioning(&self, clusterable: &str, elapsed: Duration) {
        self.inner()
            .provisioning_seconds
            .with_label_values(&[clusterable])
            .observe(elapsed.as_secs_f64());
    }

    pub fn set_agents_reachable(&self, clusterable: &str, count: i64) {
        self.inner()
            .agents_reachable
            .with_label_values(&[clusterable])
            .set(count);
    }

    pub fn inc_provisioning_failures(&self, clusterable: &str, reason: &str) {
        self.inner()
            .provisioning_failures
            .with_label_values(&[clusterable, reason])
            .inc();
    }

    pub fn inc_wait_timeouts(&self, scope: &str) {
        self.inner().wait_timeouts.with_label_values(&[scope]).inc();
    }

    pub fn inc_purged_artifacts(&self, region: &str, artifact: &str, count: u64) {
        self.inner()
            .purged_artifacts
            .with_label_values(&[region, artifact])
            .inc_by(count);
    }

    /// Render all registered metrics in the Prometheus text format
    pub fn render(&self) -> String {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();
        let mut buffer = Vec::new();
        if encoder.encode(&prometheus::gather(), &mut buffer).is_err() {
            return String::new();
        }
        String::from_utf8_lossy(&buffer).into_owned()
    }
}

/// Structured logger for fleet events
///
/// Provides consistent event-style records for agent lifecycle changes,
/// expired waits, account purges and execution cycles.
#[derive(Clone)]
pub struct StructuredLogger {
    project: String,
}

impl StructuredLogger {
    pub fn new(project: impl Into<String>) -> Self {
        Self {
            project: project.into(),
        }
    }

    pub fn log_agent_provisioned(
        &self,
        clusterable: &str,
        agent_id: &str,
        identifier: &str,
        address: &str,
        elapsed: Duration,
    ) {
        info!(
            event = "agent_provisioned",
            project = %self.project,
            clusterable = %clusterable,
            agent_id = %agent_id,
            identifier = %identifier,
            address = %address,
            elapsed_secs = elapsed.as_secs_f64(),
            "Load agent reachable and verified"
        );
    }

    pub fn log_agent_released(&self, clusterable: &str, agent_id: &str, retained: bool) {
        info!(
            event = "agent_released",
            project = %self.project,
            clusterable = %clusterable,
            agent_id = %agent_id,
            identifier_retained = retained,
            "Load agent released"
        );
    }

    pub fn log_wait_timeout(&self, description: &str, scope: &str, elapsed: Duration) {
        warn!(
            event = "wait_timeout",
            project = %self.project,
            description = %description,
            scope = %scope,
            elapsed_secs = elapsed.as_secs_f64(),
            "Bounded wait expired"
        );
    }

    pub fn log_account_purged(
        &self,
        region: &str,
        images: usize,
        key_pairs: usize,
        security_groups: usize,
    ) {
        info!(
            event = "account_purged",
            project = %self.project,
            region = %region,
            images = images,
            key_pairs = key_pairs,
            security_groups = security_groups,
            "Account artifacts purged"
        );
    }

    pub fn log_execution_cycle(&self, cycle_id: u64, status: &str, threads: u32) {
        info!(
            event = "execution_cycle",
            project = %self.project,
            cycle_id = cycle_id,
            status = %status,
            threads = threads,
            "Execution cycle updated"
        );
    }
}
