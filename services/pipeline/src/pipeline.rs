//! Stage orchestration and shutdown.
//!
//! The fetch and inference stages run as separate tasks connected by the work
//! queue. Shutdown is cooperative first: a shared token is cancelled and each
//! stage gets a grace period to observe it. Anything still running after the
//! grace period is aborted.

use crate::config::Config;
use crate::discovery::{DiscoverySink, DiscoveryStore, StoreSettings};
use crate::document_store::{DocumentStore, PostgresDocumentStore};
use crate::fetch::{FetchStage, FetchStats};
use crate::inference::{InferenceSettings, InferenceStage, InferenceStats};
use crate::model::{wait_for_artifacts, LabelTable, ModelError, ModelRunner};
use crate::ort_runner::OrtModelRunner;
use crate::queue::{work_queue, QueueReceiver};
use crate::source::{KafkaSource, MessageSource};
use crate::telemetry::PipelineMetrics;
use anyhow::{Context, Result};
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::{JoinError, JoinHandle};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// What each stage reported when it stopped.
///
/// `None` means the stage never got going (inference waiting on artifacts)
/// or had to be aborted.
#[derive(Debug, Default, Clone, Copy)]
pub struct PipelineReport {
    pub fetch: Option<FetchStats>,
    pub inference: Option<InferenceStats>,
}

/// The assembled service
pub struct Pipeline {
    config: Config,
    metrics: Arc<PipelineMetrics>,
}

impl Pipeline {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            metrics: Arc::new(PipelineMetrics::new()),
        }
    }

    /// Shared gauge and counter, readable while the pipeline runs
    pub fn metrics(&self) -> Arc<PipelineMetrics> {
        self.metrics.clone()
    }

    /// Connect to Kafka and the document store, then run until `shutdown`
    /// resolves or a stage stops on its own.
    pub async fn run<F>(self, shutdown: F) -> Result<PipelineReport>
    where
        F: Future<Output = ()>,
    {
        std::fs::create_dir_all(&self.config.storage_path).with_context(|| {
            format!(
                "Failed to create storage root {}",
                self.config.storage_path.display()
            )
        })?;

        let documents = PostgresDocumentStore::connect_or_offline(
            &self.config.database_url,
            self.config.database_connect_timeout(),
        )
        .await;

        let source = KafkaSource::new(&self.config).context("Failed to start Kafka consumer")?;

        let model_path = self.config.model_path.clone();
        let classes_path = self.config.classes_path.clone();
        let input_size = self.config.input_size;
        let load_model = move || -> Result<(Arc<OrtModelRunner>, LabelTable), ModelError> {
            let runner = OrtModelRunner::load(&model_path, input_size)?;
            let labels = LabelTable::load(&classes_path)?;
            Ok((Arc::new(runner), labels))
        };

        self.run_with(source, documents, load_model, shutdown).await
    }

    /// Run the stages over an already-connected source.
    ///
    /// `load_model` is called on a blocking thread once both model artifacts
    /// exist on disk.
    pub async fn run_with<S, M, L, F>(
        self,
        source: S,
        documents: Option<Arc<dyn DocumentStore>>,
        load_model: L,
        shutdown: F,
    ) -> Result<PipelineReport>
    where
        S: MessageSource + 'static,
        M: ModelRunner,
        L: FnOnce() -> Result<(Arc<M>, LabelTable), ModelError> + Send + 'static,
        F: Future<Output = ()>,
    {
        let config = self.config;
        let cancel = CancellationToken::new();

        let store = DiscoveryStore::start(
            StoreSettings {
                root: config.storage_path.clone(),
                max_files: config.max_stored_files,
                workers: config.save_workers,
                queue_size: config.save_queue_size,
            },
            documents,
        )
        .with_context(|| {
            format!(
                "Failed to create storage root {}",
                config.storage_path.display()
            )
        })?;

        let (queue_tx, queue_rx) = work_queue(config.queue_size)?;

        let fetch = FetchStage::new(source, queue_tx, config.poll_timeout());
        let mut fetch_task = tokio::spawn(fetch.run(cancel.clone()));

        let loader = ModelLoader {
            model_path: config.model_path.clone(),
            classes_path: config.classes_path.clone(),
            poll_interval: config.artifact_poll_interval(),
            load: load_model,
        };
        let settings = InferenceSettings {
            batch_size: config.batch_size,
            confidence_threshold: config.confidence_threshold,
            input_size: config.input_size,
            queue_timeout: config.queue_timeout(),
        };
        let mut inference_task = tokio::spawn(run_inference(
            loader,
            settings,
            store.sink(),
            self.metrics.clone(),
            queue_rx,
            cancel.clone(),
        ));

        info!("Pipeline running");

        let mut fetch_done = None;
        let mut inference_done = None;
        tokio::pin!(shutdown);
        tokio::select! {
            _ = &mut shutdown => info!("Shutdown requested"),
            res = &mut fetch_task => {
                warn!("Fetch stage stopped unexpectedly");
                fetch_done = Some(res);
            }
            res = &mut inference_task => {
                warn!("Inference stage stopped unexpectedly");
                inference_done = Some(res);
            }
        }

        cancel.cancel();

        let deadline = Instant::now() + config.shutdown_grace();
        let fetch_done = match fetch_done {
            Some(res) => Some(res),
            None => join_before("fetch", &mut fetch_task, deadline).await,
        };
        let inference_done = match inference_done {
            Some(res) => Some(res),
            None => join_before("inference", &mut inference_task, deadline).await,
        };

        let remaining = deadline.saturating_duration_since(Instant::now());
        if tokio::time::timeout(remaining, store.close()).await.is_err() {
            warn!("Pending discovery saves did not finish before the deadline");
        }

        let mut report = PipelineReport::default();
        let mut failure = None;

        match fetch_done {
            Some(Ok(stats)) => report.fetch = Some(stats),
            Some(Err(e)) => failure = Some(anyhow::Error::new(e).context("Fetch stage panicked")),
            None => {}
        }
        match inference_done {
            Some(Ok(Ok(stats))) => report.inference = stats,
            Some(Ok(Err(e))) => failure = Some(e.context("Inference stage failed")),
            Some(Err(e)) => failure = Some(anyhow::Error::new(e).context("Inference stage panicked")),
            None => {}
        }

        info!(
            detections = self.metrics.detections(),
            "Pipeline stopped"
        );

        match failure {
            Some(e) => {
                error!(error = %format!("{e:#}"), "Pipeline stopped with an error");
                Err(e)
            }
            None => Ok(report),
        }
    }
}

/// Wait for `task` until `deadline`, aborting it if it is still running
async fn join_before<T>(
    stage: &str,
    task: &mut JoinHandle<T>,
    deadline: Instant,
) -> Option<Result<T, JoinError>> {
    match tokio::time::timeout_at(deadline, &mut *task).await {
        Ok(res) => Some(res),
        Err(_) => {
            warn!(stage, "Stage ignored shutdown, forcing termination");
            task.abort();
            None
        }
    }
}

struct ModelLoader<L> {
    model_path: PathBuf,
    classes_path: PathBuf,
    poll_interval: Duration,
    load: L,
}

/// Wait for the model artifacts, load them, then run the inference loop.
///
/// Returns `Ok(None)` when shutdown arrives before the artifacts do.
async fn run_inference<M, L>(
    loader: ModelLoader<L>,
    settings: InferenceSettings,
    sink: DiscoverySink,
    metrics: Arc<PipelineMetrics>,
    queue: QueueReceiver,
    cancel: CancellationToken,
) -> Result<Option<InferenceStats>>
where
    M: ModelRunner,
    L: FnOnce() -> Result<(Arc<M>, LabelTable), ModelError> + Send + 'static,
{
    let artifacts = [loader.model_path.as_path(), loader.classes_path.as_path()];
    if !wait_for_artifacts(&artifacts, loader.poll_interval, &cancel).await {
        return Ok(None);
    }

    let (model, labels) = tokio::task::spawn_blocking(loader.load)
        .await
        .context("Model loading task failed")??;

    let stage = InferenceStage::new(model, labels, settings, sink, metrics)?;
    Ok(Some(stage.run(queue, cancel).await))
}
