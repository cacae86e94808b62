//! Prometheus metrics for neuropipe.
//!
//! ## Metrics
//!
//! ### Counters
//! - `neuropipe_workflows_executed_total` - workflow executions by status
//! - `neuropipe_nodes_executed_total` - node instance outcomes by interface and status
//! - `neuropipe_cache_lookups_total` - result cache lookups by outcome (`hit` / `miss`)
//!
//! ### Histograms
//! - `neuropipe_workflow_duration_seconds` - workflow execution duration
//! - `neuropipe_node_duration_seconds` - node run duration by interface
//!
//! ### Gauges
//! - `neuropipe_active_nodes` - node instances currently running
//!
//! The CLI can dump the registry to a file after a run (`run --metrics-file`)
//! for a node-exporter textfile collector.

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;
use std::time::Duration;

use crate::error::{Error, Result};

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Install the Prometheus recorder. Later calls return the same handle.
pub fn init_metrics() -> Result<PrometheusHandle> {
    if let Some(handle) = PROMETHEUS_HANDLE.get() {
        return Ok(handle.clone());
    }
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| Error::Internal(format!("Failed to install Prometheus recorder: {}", e)))?;
    Ok(PROMETHEUS_HANDLE.get_or_init(|| handle).clone())
}

/// Render current metrics in Prometheus text format.
pub fn render_metrics() -> String {
    match PROMETHEUS_HANDLE.get() {
        Some(handle) => handle.render(),
        None => "# Metrics not initialized\n".to_string(),
    }
}

// =============================================================================
// Workflow Metrics
// =============================================================================

pub fn record_workflow_execution(status: &str) {
    counter!(
        "neuropipe_workflows_executed_total",
        "status" => status.to_string()
    )
    .increment(1);
}

pub fn record_workflow_duration(duration: Duration, workflow_name: &str) {
    histogram!(
        "neuropipe_workflow_duration_seconds",
        "workflow" => workflow_name.to_string()
    )
    .record(duration.as_secs_f64());
}

// =============================================================================
// Node Metrics
// =============================================================================

pub fn inc_active_nodes() {
    gauge!("neuropipe_active_nodes").increment(1.0);
}

pub fn dec_active_nodes() {
    gauge!("neuropipe_active_nodes").decrement(1.0);
}

/// Record the outcome of one node instance.
pub fn record_node_execution(interface: &str, status: &str) {
    counter!(
        "neuropipe_nodes_executed_total",
        "interface" => interface.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

pub fn record_node_duration(duration: Duration, interface: &str) {
    histogram!(
        "neuropipe_node_duration_seconds",
        "interface" => interface.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Record a result cache lookup.
pub fn record_cache_lookup(hit: bool) {
    counter!(
        "neuropipe_cache_lookups_total",
        "outcome" => if hit { "hit" } else { "miss" }
    )
    .increment(1);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_after_init() {
        init_metrics().unwrap();
        record_cache_lookup(true);
        record_node_execution("identity", "completed");
        let text = render_metrics();
        assert!(text.contains("neuropipe_cache_lookups_total"));
        // second init hands back the installed recorder
        assert!(init_metrics().is_ok());
    }
}
