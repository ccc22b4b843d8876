//! Persistence of high-confidence detections.
//!
//! Hits are handed to a fixed pool of save workers through a bounded task
//! queue, so the inference loop never waits on disk or database I/O. Each
//! save writes a JPEG under the storage root, trims the root back to the
//! configured file count, and indexes the record when a document store is
//! connected.

use crate::codec::Metadata;
use crate::document_store::{Discovery, DocumentStore, StoreError};
use crate::telemetry::{DISCOVERIES_DROPPED, DISCOVERIES_FAILED, DISCOVERIES_SAVED, FILES_EVICTED};
use chrono::Utc;
use image::{ImageFormat, RgbImage};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

pub const FILE_PREFIX: &str = "hit_";
pub const FILE_EXTENSION: &str = ".jpg";

/// Errors from a single save task
#[derive(Error, Debug)]
pub enum SaveError {
    #[error("Failed to write discovery image: {0}")]
    Image(#[from] image::ImageError),

    #[error("Save task panicked or was cancelled: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// A qualifying prediction waiting to be persisted
#[derive(Debug, Clone)]
pub struct Hit {
    pub image: RgbImage,
    pub confidence: f32,
    pub label: String,
    pub metadata: Metadata,
}

/// Discovery store settings
#[derive(Debug, Clone)]
pub struct StoreSettings {
    pub root: PathBuf,
    pub max_files: usize,
    pub workers: usize,
    pub queue_size: usize,
}

/// Cheap handle used by the inference stage to submit hits
#[derive(Debug, Clone)]
pub struct DiscoverySink {
    tx: mpsc::Sender<Hit>,
}

impl DiscoverySink {
    /// Wrap a raw channel; hits go to whoever owns the receiver
    pub fn from_sender(tx: mpsc::Sender<Hit>) -> Self {
        Self { tx }
    }

    /// Queue a hit for saving without waiting. Returns `false` if it was
    /// dropped because the save queue is full or shut down.
    pub fn save_async(&self, hit: Hit) -> bool {
        match self.tx.try_send(hit) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(hit)) => {
                metrics::counter!(DISCOVERIES_DROPPED).increment(1);
                warn!(label = %hit.label, "Save queue full, dropping discovery");
                false
            }
            Err(mpsc::error::TrySendError::Closed(hit)) => {
                warn!(label = %hit.label, "Discovery store closed, dropping discovery");
                false
            }
        }
    }
}

struct SaveContext {
    root: PathBuf,
    max_files: usize,
    documents: Option<Arc<dyn DocumentStore>>,
}

/// Fixed pool of save workers sharing one task queue
pub struct DiscoveryStore {
    sink: DiscoverySink,
    workers: Vec<JoinHandle<()>>,
}

impl DiscoveryStore {
    /// Create the storage root and spawn the workers.
    ///
    /// `documents == None` runs the store offline: files are still written
    /// and evicted, nothing is indexed.
    pub fn start(
        settings: StoreSettings,
        documents: Option<Arc<dyn DocumentStore>>,
    ) -> io::Result<Self> {
        std::fs::create_dir_all(&settings.root)?;

        if documents.is_none() {
            info!(root = %settings.root.display(), "Discovery store running offline");
        }

        let (tx, rx) = mpsc::channel(settings.queue_size.max(1));
        let rx = Arc::new(Mutex::new(rx));
        let ctx = Arc::new(SaveContext {
            root: settings.root.clone(),
            max_files: settings.max_files,
            documents,
        });

        let workers = (0..settings.workers.max(1))
            .map(|worker| {
                let rx = rx.clone();
                let ctx = ctx.clone();
                tokio::spawn(async move {
                    debug!(worker, "Save worker started");
                    loop {
                        let next = rx.lock().await.recv().await;
                        let Some(hit) = next else { break };
                        if let Err(e) = save_discovery(&ctx, hit).await {
                            metrics::counter!(DISCOVERIES_FAILED).increment(1);
                            error!(error = %e, "Save Error");
                        }
                    }
                    debug!(worker, "Save worker stopped");
                })
            })
            .collect();

        Ok(Self {
            sink: DiscoverySink { tx },
            workers,
        })
    }

    pub fn sink(&self) -> DiscoverySink {
        self.sink.clone()
    }

    /// Stop accepting hits and wait for queued saves to finish.
    ///
    /// Completes once every outstanding [`DiscoverySink`] has been dropped.
    pub async fn close(self) {
        let Self { sink, workers } = self;
        drop(sink);
        for result in futures::future::join_all(workers).await {
            if let Err(e) = result {
                error!(error = %e, "Save worker ended abnormally");
            }
        }
    }
}

#[instrument(skip_all, fields(label = %hit.label, confidence = hit.confidence))]
async fn save_discovery(ctx: &SaveContext, hit: Hit) -> Result<Uuid, SaveError> {
    let id = Uuid::new_v4();
    let path = ctx.root.join(format!("{FILE_PREFIX}{id}{FILE_EXTENSION}"));
    let ground_truth = hit.metadata.ground_truth();

    let evicted = {
        let path = path.clone();
        let root = ctx.root.clone();
        let max_files = ctx.max_files;
        let image = hit.image;
        tokio::task::spawn_blocking(move || -> Result<usize, image::ImageError> {
            image.save_with_format(&path, ImageFormat::Jpeg)?;
            Ok(evict_oldest(&root, max_files))
        })
        .await??
    };
    metrics::counter!(DISCOVERIES_SAVED).increment(1);
    debug!(path = %path.display(), evicted, "Discovery written");

    if let Some(documents) = &ctx.documents {
        let discovery = Discovery {
            id,
            timestamp: Utc::now(),
            confidence: f64::from(hit.confidence),
            predicted_label: hit.label.clone(),
            ground_truth,
            file_path: path.to_string_lossy().into_owned(),
        };
        documents.insert(&discovery).await?;
        info!(label = %hit.label, "Saved to database");
    }

    Ok(id)
}

/// Whether `name` looks like a file this store wrote
pub fn is_discovery_file(name: &str) -> bool {
    name.starts_with(FILE_PREFIX) && name.ends_with(FILE_EXTENSION)
}

/// Remove the oldest discovery files until at most `max_files` remain.
///
/// Age is creation time (modification time where the filesystem does not
/// record creation), ties broken by file name. Files that vanish between
/// listing and removal are skipped. Never fails; returns how many files
/// this call removed.
pub fn evict_oldest(root: &Path, max_files: usize) -> usize {
    let entries = match std::fs::read_dir(root) {
        Ok(entries) => entries,
        Err(e) => {
            warn!(error = %e, root = %root.display(), "Eviction could not list storage root");
            return 0;
        }
    };

    let mut files: Vec<(SystemTime, String, PathBuf)> = entries
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| {
            let name = entry.file_name().into_string().ok()?;
            if !is_discovery_file(&name) {
                return None;
            }
            let meta = entry.metadata().ok()?;
            if !meta.is_file() {
                return None;
            }
            let created = meta.created().or_else(|_| meta.modified()).ok()?;
            Some((created, name, entry.path()))
        })
        .collect();

    if files.len() <= max_files {
        return 0;
    }

    files.sort();
    let excess = files.len() - max_files;

    let mut removed = 0;
    for (_, _, path) in files.into_iter().take(excess) {
        match std::fs::remove_file(&path) {
            Ok(()) => removed += 1,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!(error = %e, path = %path.display(), "Failed to evict discovery file"),
        }
    }

    metrics::counter!(FILES_EVICTED).increment(removed as u64);
    removed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document_store::MockDocumentStore;
    use image::Rgb;
    use std::time::Duration;

    fn hit(confidence: f32) -> Hit {
        Hit {
            image: RgbImage::from_pixel(8, 8, Rgb([200, 10, 10])),
            confidence,
            label: "red_circle".to_string(),
            metadata: Metadata::new()
                .with("color_label", "red")
                .with("shape_label", "circle"),
        }
    }

    fn settings(root: &Path, max_files: usize, workers: usize) -> StoreSettings {
        StoreSettings {
            root: root.to_path_buf(),
            max_files,
            workers,
            queue_size: 64,
        }
    }

    fn discovery_files(root: &Path) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(root)
            .unwrap()
            .filter_map(|e| e.ok())
            .filter_map(|e| e.file_name().into_string().ok())
            .filter(|n| is_discovery_file(n))
            .collect();
        names.sort();
        names
    }

    #[test]
    fn test_evict_keeps_most_recent() {
        let dir = tempfile::tempdir().unwrap();
        let mut created = Vec::new();
        for i in 0..6 {
            let name = format!("{FILE_PREFIX}{i:02}{FILE_EXTENSION}");
            std::fs::write(dir.path().join(&name), b"x").unwrap();
            created.push(name);
            std::thread::sleep(Duration::from_millis(25));
        }
        std::fs::write(dir.path().join("notes.txt"), b"keep me").unwrap();

        assert_eq!(evict_oldest(dir.path(), 4), 2);
        assert_eq!(discovery_files(dir.path()), created[2..].to_vec());
        assert!(dir.path().join("notes.txt").exists());

        assert_eq!(evict_oldest(dir.path(), 4), 0);
    }

    #[test]
    fn test_evict_missing_root_is_not_an_error() {
        assert_eq!(evict_oldest(Path::new("/nonexistent/discoveries"), 1), 0);
    }

    #[tokio::test]
    async fn test_offline_saves_write_and_evict() {
        let dir = tempfile::tempdir().unwrap();
        let store = DiscoveryStore::start(settings(dir.path(), 3, 1), None).unwrap();
        let sink = store.sink();

        for _ in 0..5 {
            assert!(sink.save_async(hit(0.95)));
        }
        drop(sink);
        store.close().await;

        assert_eq!(discovery_files(dir.path()).len(), 3);
    }

    #[tokio::test]
    async fn test_saves_are_indexed() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().to_path_buf();

        let mut documents = MockDocumentStore::new();
        documents
            .expect_insert()
            .times(2)
            .withf(move |d| {
                d.ground_truth == "red_circle"
                    && d.predicted_label == "red_circle"
                    && (d.confidence - 0.95).abs() < 1e-6
                    && d.file_path.ends_with(&format!("{FILE_PREFIX}{}{FILE_EXTENSION}", d.id))
                    && Path::new(&d.file_path).starts_with(&root)
            })
            .returning(|_| Ok(()));

        let store =
            DiscoveryStore::start(settings(dir.path(), 10, 2), Some(Arc::new(documents))).unwrap();
        let sink = store.sink();
        sink.save_async(hit(0.95));
        sink.save_async(hit(0.95));
        drop(sink);
        store.close().await;

        assert_eq!(discovery_files(dir.path()).len(), 2);
    }

    #[tokio::test]
    async fn test_failed_insert_does_not_stop_workers() {
        let dir = tempfile::tempdir().unwrap();

        let mut documents = MockDocumentStore::new();
        documents.expect_insert().times(3).returning(|d| {
            Err(StoreError::Insert {
                id: d.id,
                source: sqlx::Error::PoolTimedOut,
            })
        });

        let store =
            DiscoveryStore::start(settings(dir.path(), 10, 1), Some(Arc::new(documents))).unwrap();
        let sink = store.sink();
        for _ in 0..3 {
            sink.save_async(hit(0.99));
        }
        drop(sink);
        store.close().await;

        // Files land on disk before the insert is attempted
        assert_eq!(discovery_files(dir.path()).len(), 3);
    }

    #[tokio::test]
    async fn test_full_queue_drops_instead_of_blocking() {
        let (tx, rx) = mpsc::channel(1);
        let sink = DiscoverySink { tx };

        assert!(sink.save_async(hit(0.95)));
        assert!(!sink.save_async(hit(0.95)));

        drop(rx);
        assert!(!sink.save_async(hit(0.95)));
    }
}
