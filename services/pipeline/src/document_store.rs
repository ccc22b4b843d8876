//! Discovery index.
//!
//! Each saved hit is recorded as one row in PostgreSQL. When the database
//! cannot be reached at startup the pipeline runs without an index.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::FromRow;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// Errors raised by a document store
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Failed to connect to document store: {0}")]
    Connection(#[source] sqlx::Error),

    #[error("Failed to run migrations: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Failed to insert discovery {id}: {source}")]
    Insert {
        id: Uuid,
        #[source]
        source: sqlx::Error,
    },
}

/// One persisted high-confidence classification.
///
/// Written once and never updated by the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct Discovery {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub confidence: f64,
    pub predicted_label: String,
    /// `<color_label>_<shape_label>` from the frame metadata
    pub ground_truth: String,
    pub file_path: String,
}

/// Sink for discovery records.
///
/// Implementations must accept concurrent inserts from several save workers.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn insert(&self, discovery: &Discovery) -> Result<(), StoreError>;
}

/// PostgreSQL-backed document store
pub struct PostgresDocumentStore {
    pool: PgPool,
}

impl PostgresDocumentStore {
    /// Connect and apply the embedded migrations
    pub async fn connect(url: &str, connect_timeout: Duration) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(8)
            .acquire_timeout(connect_timeout)
            .connect(url)
            .await
            .map_err(StoreError::Connection)?;

        info!("Connected to PostgreSQL document store");

        sqlx::migrate!("./migrations").run(&pool).await?;

        Ok(Self { pool })
    }

    /// Connect, or log once and return `None` so the pipeline runs offline
    pub async fn connect_or_offline(
        url: &str,
        connect_timeout: Duration,
    ) -> Option<Arc<dyn DocumentStore>> {
        match Self::connect(url, connect_timeout).await {
            Ok(store) => Some(Arc::new(store)),
            Err(e) => {
                warn!(error = %e, "Document store unavailable, running in offline mode");
                None
            }
        }
    }
}

#[async_trait]
impl DocumentStore for PostgresDocumentStore {
    #[instrument(skip(self, discovery), fields(id = %discovery.id))]
    async fn insert(&self, discovery: &Discovery) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO discoveries (
                id, timestamp, confidence, predicted_label, ground_truth, file_path
            ) VALUES (
                $1, $2, $3, $4, $5, $6
            )
            "#,
        )
        .bind(discovery.id)
        .bind(discovery.timestamp)
        .bind(discovery.confidence)
        .bind(&discovery.predicted_label)
        .bind(&discovery.ground_truth)
        .bind(&discovery.file_path)
        .execute(&self.pool)
        .await
        .map_err(|source| StoreError::Insert {
            id: discovery.id,
            source,
        })?;

        debug!(label = %discovery.predicted_label, "Discovery indexed");

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_discovery_serializes_all_fields() {
        let discovery = Discovery {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            confidence: 0.97,
            predicted_label: "red_circle".to_string(),
            ground_truth: "red_circle".to_string(),
            file_path: "./discoveries/hit_x.jpg".to_string(),
        };

        let json = serde_json::to_value(&discovery).unwrap();
        for key in [
            "id",
            "timestamp",
            "confidence",
            "predicted_label",
            "ground_truth",
            "file_path",
        ] {
            assert!(json.get(key).is_some(), "missing {key}");
        }
    }

    #[tokio::test]
    async fn test_unreachable_store_degrades_to_offline() {
        // Nothing listens on port 1; the connect fails fast.
        let store = PostgresDocumentStore::connect_or_offline(
            "postgres://discovery@127.0.0.1:1/none",
            Duration::from_millis(200),
        )
        .await;
        assert!(store.is_none());
    }
}
