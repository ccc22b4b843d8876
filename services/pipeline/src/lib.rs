//! Discovery Pipeline - streaming image classification
//!
//! Consumes framed images from a Kafka topic, classifies them in fixed-size
//! batches, and keeps the high-confidence hits on disk with an optional
//! document-store index.
//!
//! ## Architecture
//!
//! ```text
//! Kafka topic          Work queue (bounded)         Save pool
//! ┌────────────┐      ┌──────────────────┐       ┌──────────────┐
//! │ framed     │      │ decoded images   │       │ hit_<id>.jpg │
//! │ images     │─────▶│ backpressure on  │       │ + eviction   │
//! └────────────┘      │ full             │       └──────────────┘
//!       │             └──────────────────┘              ▲
//!       ▼                      │                        │
//! ┌────────────┐               ▼                        │
//! │ Fetch      │      ┌──────────────────┐              │
//! │ stage      │      │ Inference stage  │──────────────┘
//! └────────────┘      │ batch -> model   │      conf > threshold
//!                     └──────────────────┘
//! ```
//!
//! # Example
//!
//! ```rust,no_run
//! use discovery_pipeline::{Config, Pipeline};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load()?;
//!     let pipeline = Pipeline::new(config);
//!     pipeline.run(async { tokio::signal::ctrl_c().await.ok(); }).await?;
//!     Ok(())
//! }
//! ```

pub mod codec;
pub mod config;
pub mod discovery;
pub mod document_store;
pub mod fetch;
pub mod inference;
pub mod model;
pub mod ort_runner;
pub mod pipeline;
pub mod queue;
pub mod source;
pub mod telemetry;

// Re-export main types
pub use codec::{decode, encode, DecodedFrame, MalformedFrame, Metadata};
pub use config::{Config, ConfigError};
pub use discovery::{DiscoverySink, DiscoveryStore, Hit, SaveError, StoreSettings};
pub use document_store::{Discovery, DocumentStore, PostgresDocumentStore, StoreError};
pub use fetch::{FetchStage, FetchStats};
pub use inference::{BatchAssembler, InferenceError, InferenceSettings, InferenceStage, InferenceStats};
pub use model::{ClassScore, LabelTable, ModelError, ModelRunner};
pub use ort_runner::OrtModelRunner;
pub use pipeline::{Pipeline, PipelineReport};
pub use queue::{work_queue, DecodedItem, QueueError, QueueReceiver, QueueSender, Received};
pub use source::{BusMessage, KafkaSource, MemorySource, MessageSource, SourceError};
pub use telemetry::PipelineMetrics;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::config::Config;
    pub use crate::document_store::{Discovery, DocumentStore, StoreError};
    pub use crate::model::{ClassScore, LabelTable, ModelError, ModelRunner};
    pub use crate::pipeline::{Pipeline, PipelineReport};
    pub use crate::source::{MemorySource, MessageSource};
    pub use crate::telemetry::PipelineMetrics;
    pub use async_trait::async_trait;
}
