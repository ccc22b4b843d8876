//! Pipeline observability.
//!
//! Series are published through the `metrics` facade and scraped from the
//! Prometheus exporter. The two headline values (last batch confidence and
//! the detection count) are also kept in atomics so they can be read back
//! in-process.

use anyhow::{Context, Result};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::info;

pub const BATCH_AVG_CONFIDENCE: &str = "batch_avg_confidence";
pub const TARGET_SHAPES_FOUND: &str = "target_shapes_found";
pub const FRAMES_RECEIVED: &str = "frames_received_total";
pub const FRAMES_MALFORMED: &str = "frames_malformed_total";
pub const BATCHES_PROCESSED: &str = "batches_processed_total";
pub const BATCHES_FAILED: &str = "batches_failed_total";
pub const DISCOVERIES_SAVED: &str = "discoveries_saved_total";
pub const DISCOVERIES_FAILED: &str = "discoveries_failed_total";
pub const DISCOVERIES_DROPPED: &str = "discoveries_dropped_total";
pub const FILES_EVICTED: &str = "discovery_files_evicted_total";

/// Gauge and counter shared by the inference stage
#[derive(Debug, Default)]
pub struct PipelineMetrics {
    avg_confidence_bits: AtomicU64,
    detections: AtomicU64,
}

impl PipelineMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrite the gauge with the latest batch mean
    pub fn set_batch_confidence(&self, mean: f64) {
        self.avg_confidence_bits
            .store(mean.to_bits(), Ordering::Relaxed);
        metrics::gauge!(BATCH_AVG_CONFIDENCE).set(mean);
    }

    pub fn record_detection(&self) {
        self.detections.fetch_add(1, Ordering::Relaxed);
        metrics::counter!(TARGET_SHAPES_FOUND).increment(1);
    }

    /// Mean confidence of the most recent batch (0.0 before the first one)
    pub fn batch_confidence(&self) -> f64 {
        f64::from_bits(self.avg_confidence_bits.load(Ordering::Relaxed))
    }

    pub fn detections(&self) -> u64 {
        self.detections.load(Ordering::Relaxed)
    }
}

/// Install the Prometheus exporter and register series descriptions
pub fn init_metrics(port: u16) -> Result<()> {
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(([0, 0, 0, 0], port))
        .install()
        .context("Failed to install Prometheus metrics exporter")?;

    metrics::describe_gauge!(BATCH_AVG_CONFIDENCE, "Model Confidence");
    metrics::describe_counter!(TARGET_SHAPES_FOUND, "High Confidence Detections");
    metrics::describe_counter!(FRAMES_RECEIVED, "Messages pulled from the bus");
    metrics::describe_counter!(FRAMES_MALFORMED, "Messages rejected by the frame codec");
    metrics::describe_counter!(BATCHES_PROCESSED, "Batches run through the model");
    metrics::describe_counter!(BATCHES_FAILED, "Batches discarded after an error");
    metrics::describe_counter!(DISCOVERIES_SAVED, "Discoveries written to disk");
    metrics::describe_counter!(DISCOVERIES_FAILED, "Discovery saves that failed");
    metrics::describe_counter!(DISCOVERIES_DROPPED, "Discoveries dropped on a full save queue");
    metrics::describe_counter!(FILES_EVICTED, "Discovery files removed by eviction");

    info!(port = port, "Prometheus metrics exporter started");

    Ok(())
}
