//! Prometheus metrics for the publication pipeline and supervisor
//!
//! This module tracks:
//! - Pipeline: items fetched and emitted, duplicates by kind, failures by
//!   stage, cycle duration
//! - Resources: state saves, session refreshes, reaped tasks, deleted artifacts
//!
//! # Usage
//!
//! Call `init_metrics()` at application startup to register all metrics.
//! If initialization fails, metrics operations become no-ops.

use prometheus::{
    register_counter, register_counter_vec, register_histogram, Counter, CounterVec, Encoder,
    Histogram, TextEncoder,
};
use std::sync::OnceLock;
use std::time::Duration;

// ============================================================================
// Metrics Storage
// ============================================================================

/// Container for pipeline metrics
struct PipelineMetrics {
    items_fetched: Counter,
    items_emitted: Counter,
    duplicates: CounterVec,
    item_failures: CounterVec,
    cycle_duration: Histogram,
}

/// Container for resource lifecycle metrics
struct ResourceMetrics {
    state_saves: CounterVec,
    session_refreshes: CounterVec,
    tasks_reaped: Counter,
    artifacts_deleted: Counter,
    artifact_bytes_freed: Counter,
}

static PIPELINE_METRICS: OnceLock<PipelineMetrics> = OnceLock::new();

static RESOURCE_METRICS: OnceLock<ResourceMetrics> = OnceLock::new();

/// Flag to track if initialization was attempted
static METRICS_INIT_ATTEMPTED: OnceLock<bool> = OnceLock::new();

// ============================================================================
// Initialization
// ============================================================================

/// Initialize all Prometheus metrics
///
/// Safe to call more than once; only the first call registers.
///
/// # Example
///
/// ```ignore
/// if let Err(e) = herald::metrics::init_metrics() {
///     tracing::warn!(error = %e, "Metrics disabled");
/// }
/// ```
pub fn init_metrics() -> Result<(), Box<dyn std::error::Error>> {
    if METRICS_INIT_ATTEMPTED.get().is_some() {
        return Ok(());
    }
    METRICS_INIT_ATTEMPTED.set(true).ok();

    let pipeline = PipelineMetrics {
        items_fetched: register_counter!(
            "herald_items_fetched_total",
            "Total candidate items returned by feeds"
        )?,
        items_emitted: register_counter!(
            "herald_items_emitted_total",
            "Total items acknowledged by the channel"
        )?,
        duplicates: register_counter_vec!(
            "herald_duplicates_rejected_total",
            "Candidates rejected as already emitted",
            &["kind"]
        )?,
        item_failures: register_counter_vec!(
            "herald_item_failures_total",
            "Candidates that failed a pipeline stage",
            &["stage"]
        )?,
        cycle_duration: register_histogram!(
            "herald_cycle_duration_seconds",
            "Duration of one pipeline cycle in seconds",
            vec![0.1, 0.5, 1.0, 5.0, 10.0, 30.0, 60.0, 300.0, 900.0, 3600.0, 43200.0]
        )?,
    };

    let resources = ResourceMetrics {
        state_saves: register_counter_vec!(
            "herald_state_saves_total",
            "State file saves by result",
            &["result"]
        )?,
        session_refreshes: register_counter_vec!(
            "herald_session_refreshes_total",
            "HTTP session recreations by result",
            &["result"]
        )?,
        tasks_reaped: register_counter!(
            "herald_tasks_reaped_total",
            "Background tasks cancelled to respect the task ceiling"
        )?,
        artifacts_deleted: register_counter!(
            "herald_artifacts_deleted_total",
            "Expired media files deleted"
        )?,
        artifact_bytes_freed: register_counter!(
            "herald_artifact_bytes_freed_total",
            "Bytes freed by artifact cleanup"
        )?,
    };

    PIPELINE_METRICS
        .set(pipeline)
        .map_err(|_| "Pipeline metrics already initialized")?;
    RESOURCE_METRICS
        .set(resources)
        .map_err(|_| "Resource metrics already initialized")?;

    tracing::info!("Prometheus metrics initialized successfully");
    Ok(())
}

/// Check if metrics have been initialized
pub fn metrics_initialized() -> bool {
    PIPELINE_METRICS.get().is_some() && RESOURCE_METRICS.get().is_some()
}

// ============================================================================
// Helper Functions
// ============================================================================

/// Encode all metrics to Prometheus text format
pub fn encode_metrics() -> Result<String, Box<dyn std::error::Error>> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8(buffer)?)
}

fn result_label(ok: bool) -> &'static str {
    if ok {
        "ok"
    } else {
        "error"
    }
}

pub fn record_items_fetched(count: usize) {
    if let Some(m) = PIPELINE_METRICS.get() {
        m.items_fetched.inc_by(count as f64);
    }
}

pub fn record_item_emitted() {
    if let Some(m) = PIPELINE_METRICS.get() {
        m.items_emitted.inc();
    }
}

/// Record a rejected duplicate (`fingerprint` or `content`)
pub fn record_duplicate(kind: &str) {
    if let Some(m) = PIPELINE_METRICS.get() {
        m.duplicates.with_label_values(&[kind]).inc();
    }
}

/// Record a candidate failure at `stage` (`enhance`, `emit`)
pub fn record_item_failure(stage: &str) {
    if let Some(m) = PIPELINE_METRICS.get() {
        m.item_failures.with_label_values(&[stage]).inc();
    }
}

pub fn observe_cycle_duration(elapsed: Duration) {
    if let Some(m) = PIPELINE_METRICS.get() {
        m.cycle_duration.observe(elapsed.as_secs_f64());
    }
}

pub fn record_state_save(ok: bool) {
    if let Some(m) = RESOURCE_METRICS.get() {
        m.state_saves.with_label_values(&[result_label(ok)]).inc();
    }
}

pub fn record_session_refresh(ok: bool) {
    if let Some(m) = RESOURCE_METRICS.get() {
        m.session_refreshes.with_label_values(&[result_label(ok)]).inc();
    }
}

pub fn record_tasks_reaped(count: usize) {
    let Some(m) = RESOURCE_METRICS.get() else {
        return;
    };
    if count > 0 {
        m.tasks_reaped.inc_by(count as f64);
    }
}

pub fn record_artifacts_deleted(count: usize, bytes: u64) {
    let Some(m) = RESOURCE_METRICS.get() else {
        return;
    };
    if count > 0 {
        m.artifacts_deleted.inc_by(count as f64);
    }
    if bytes > 0 {
        m.artifact_bytes_freed.inc_by(bytes as f64);
    }
}

// ============================================================================
// Tests
// ============================================================================
