//! Batch assembly and inference.
//!
//! Items are pulled from the work queue until a full batch is available; a
//! short batch is never flushed. A batch is preprocessed and predicted as a
//! unit, and any failure discards the whole batch before the loop resumes.

use crate::discovery::{DiscoverySink, Hit};
use crate::model::{preprocess, LabelTable, ModelError, ModelRunner};
use crate::queue::{DecodedItem, QueueReceiver, Received};
use crate::telemetry::{PipelineMetrics, BATCHES_FAILED, BATCHES_PROCESSED};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument};

/// Errors that abort a single batch
#[derive(Error, Debug)]
pub enum InferenceError {
    #[error(transparent)]
    Model(#[from] ModelError),

    #[error("Inference task failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("Model returned {actual} predictions for a batch of {expected}")]
    PredictionCount { expected: usize, actual: usize },

    #[error("Model predicted class {0}, which has no label")]
    UnknownClass(usize),
}

/// Accumulates queue items into fixed-size batches
#[derive(Debug)]
pub struct BatchAssembler {
    batch_size: usize,
    items: Vec<DecodedItem>,
}

impl BatchAssembler {
    /// `batch_size` of 0 is treated as 1
    pub fn new(batch_size: usize) -> Self {
        let batch_size = batch_size.max(1);
        Self {
            batch_size,
            items: Vec::with_capacity(batch_size),
        }
    }

    /// Add an item; returns the batch once exactly `batch_size` items are held
    pub fn push(&mut self, item: DecodedItem) -> Option<Vec<DecodedItem>> {
        self.items.push(item);
        if self.items.len() < self.batch_size {
            return None;
        }
        Some(std::mem::replace(
            &mut self.items,
            Vec::with_capacity(self.batch_size),
        ))
    }

    pub fn pending(&self) -> usize {
        self.items.len()
    }

    /// Drop the partial batch, returning how many items it held
    pub fn discard(&mut self) -> usize {
        let dropped = self.items.len();
        self.items.clear();
        dropped
    }
}

#[derive(Debug, Clone)]
pub struct InferenceSettings {
    pub batch_size: usize,
    /// Strictly-greater comparison; equal confidences do not qualify
    pub confidence_threshold: f32,
    pub input_size: u32,
    pub queue_timeout: Duration,
}

/// Counters reported when the inference stage stops
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct InferenceStats {
    pub batches: u64,
    pub failed_batches: u64,
    pub detections: u64,
    /// Items left in the partial batch at shutdown
    pub discarded_items: u64,
}

/// Runs full batches through the model and routes qualifying items to the
/// discovery store
pub struct InferenceStage<M: ModelRunner> {
    model: Arc<M>,
    labels: LabelTable,
    settings: InferenceSettings,
    sink: DiscoverySink,
    metrics: Arc<PipelineMetrics>,
}

impl<M: ModelRunner> InferenceStage<M> {
    /// Fails when the label table does not match the model's class count
    pub fn new(
        model: Arc<M>,
        labels: LabelTable,
        settings: InferenceSettings,
        sink: DiscoverySink,
        metrics: Arc<PipelineMetrics>,
    ) -> Result<Self, ModelError> {
        labels.validate(model.num_classes())?;
        Ok(Self {
            model,
            labels,
            settings,
            sink,
            metrics,
        })
    }

    /// Consume the queue until `cancel` fires or every producer is gone.
    ///
    /// A partial batch in progress at shutdown is discarded, not flushed.
    pub async fn run(self, mut queue: QueueReceiver, cancel: CancellationToken) -> InferenceStats {
        info!(
            batch_size = self.settings.batch_size,
            threshold = self.settings.confidence_threshold,
            "Inference started"
        );

        let mut assembler = BatchAssembler::new(self.settings.batch_size);
        let mut stats = InferenceStats::default();

        while !cancel.is_cancelled() {
            let item = match queue.get(self.settings.queue_timeout).await {
                Received::Item(item) => item,
                Received::Empty => continue,
                Received::Closed => break,
            };

            let Some(batch) = assembler.push(item) else {
                continue;
            };

            match self.process_batch(batch).await {
                Ok(hits) => {
                    stats.batches += 1;
                    stats.detections += hits;
                    metrics::counter!(BATCHES_PROCESSED).increment(1);
                }
                Err(e) => {
                    stats.failed_batches += 1;
                    metrics::counter!(BATCHES_FAILED).increment(1);
                    error!(error = %e, "Inference Error");
                }
            }
        }

        stats.discarded_items = assembler.discard() as u64;

        info!(
            batches = stats.batches,
            failed = stats.failed_batches,
            detections = stats.detections,
            discarded = stats.discarded_items,
            "Inference stopped"
        );

        stats
    }

    /// Preprocess, predict, publish metrics, and hand off hits.
    /// Returns the number of qualifying items.
    #[instrument(skip_all, fields(size = batch.len()))]
    async fn process_batch(&self, batch: Vec<DecodedItem>) -> Result<u64, InferenceError> {
        let model = self.model.clone();
        let input_size = self.settings.input_size;

        let (batch, scores) = tokio::task::spawn_blocking(move || {
            let input = preprocess(batch.iter().map(|item| &item.image), input_size)?;
            let scores = model.predict(&input)?;
            Ok::<_, ModelError>((batch, scores))
        })
        .await??;

        if scores.len() != batch.len() {
            return Err(InferenceError::PredictionCount {
                expected: batch.len(),
                actual: scores.len(),
            });
        }

        let predictions = scores
            .iter()
            .map(|score| {
                self.labels
                    .get(score.class_index)
                    .map(|label| (score.confidence, label.trim().to_string()))
                    .ok_or(InferenceError::UnknownClass(score.class_index))
            })
            .collect::<Result<Vec<_>, _>>()?;

        let mean = predictions
            .iter()
            .map(|(confidence, _)| f64::from(*confidence))
            .sum::<f64>()
            / predictions.len() as f64;
        self.metrics.set_batch_confidence(mean);

        let mut hits = 0;
        for (item, (confidence, label)) in batch.into_iter().zip(predictions) {
            if confidence > self.settings.confidence_threshold {
                info!(label = %label, confidence = format_args!("{confidence:.2}"), "MATCH");
                self.metrics.record_detection();
                hits += 1;
                self.sink.save_async(Hit {
                    image: item.image,
                    confidence,
                    label,
                    metadata: item.metadata,
                });
            }
        }

        Ok(hits)
    }
}
