//! Model runner interface, label table, and input preparation.
//!
//! The inference stage depends only on [`ModelRunner`]; concrete backends
//! live in their own modules.

use image::imageops::FilterType;
use image::RgbImage;
use ndarray::{Array4, ArrayView2, Axis};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Errors from model loading, preprocessing, and prediction
#[derive(Error, Debug)]
pub enum ModelError {
    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Invalid label table: {0}")]
    InvalidLabelTable(String),

    #[error("Label table has {labels} entries but the model outputs {classes} classes")]
    CardinalityMismatch { labels: usize, classes: usize },

    #[error("Image {index} in batch has zero width or height")]
    EmptyImage { index: usize },

    #[error("Model runtime error: {0}")]
    Runtime(String),

    #[error("Unexpected model output shape: {0}")]
    OutputShape(String),
}

/// Top-1 result for one batch item
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClassScore {
    pub confidence: f32,
    pub class_index: usize,
}

/// A batched classifier.
///
/// `predict` receives an `N x 3 x H x W` tensor and must return exactly `N`
/// scores, in input order.
pub trait ModelRunner: Send + Sync + 'static {
    /// Number of classes the model distinguishes
    fn num_classes(&self) -> usize;

    fn predict(&self, batch: &Array4<f32>) -> Result<Vec<ClassScore>, ModelError>;
}

/// Softmax each row of `logits` and keep the most probable class
pub fn top1(logits: ArrayView2<f32>) -> Vec<ClassScore> {
    logits
        .axis_iter(Axis(0))
        .map(|row| {
            let max = row.iter().copied().fold(f32::NEG_INFINITY, f32::max);
            let denom: f32 = row.iter().map(|v| (v - max).exp()).sum();
            let (class_index, best) = row
                .iter()
                .copied()
                .enumerate()
                .fold((0, f32::NEG_INFINITY), |acc, (i, v)| {
                    if v > acc.1 {
                        (i, v)
                    } else {
                        acc
                    }
                });
            ClassScore {
                confidence: (best - max).exp() / denom,
                class_index,
            }
        })
        .collect()
}

/// Resize every image to `size x size` and pack them as a CHW float batch
/// scaled to `[0, 1]`.
///
/// One unusable image fails the whole batch.
pub fn preprocess<'a, I>(images: I, size: u32) -> Result<Array4<f32>, ModelError>
where
    I: ExactSizeIterator<Item = &'a RgbImage>,
{
    let edge = size as usize;
    let mut input = Array4::<f32>::zeros((images.len(), 3, edge, edge));

    for (n, img) in images.enumerate() {
        if img.width() == 0 || img.height() == 0 {
            return Err(ModelError::EmptyImage { index: n });
        }

        let resized = image::imageops::resize(img, size, size, FilterType::Triangle);
        for (x, y, pixel) in resized.enumerate_pixels() {
            let (x, y) = (x as usize, y as usize);
            let [r, g, b] = pixel.0;
            input[[n, 0, y, x]] = (r as f32) / 255.;
            input[[n, 1, y, x]] = (g as f32) / 255.;
            input[[n, 2, y, x]] = (b as f32) / 255.;
        }
    }

    Ok(input)
}

/// Class index -> label mapping loaded from a JSON object such as
/// `{"0": "red_circle", "1": "blue_square"}`.
#[derive(Debug, Clone, PartialEq)]
pub struct LabelTable {
    labels: Vec<String>,
}

impl LabelTable {
    pub fn load(path: &Path) -> Result<Self, ModelError> {
        let raw = std::fs::read(path).map_err(|source| ModelError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&raw)
    }

    pub fn from_json(raw: &[u8]) -> Result<Self, ModelError> {
        let entries: HashMap<String, String> = serde_json::from_slice(raw)
            .map_err(|e| ModelError::InvalidLabelTable(e.to_string()))?;

        let mut indexed = entries
            .into_iter()
            .map(|(key, label)| {
                key.trim()
                    .parse::<usize>()
                    .map(|index| (index, label))
                    .map_err(|_| ModelError::InvalidLabelTable(format!("non-integer key {key:?}")))
            })
            .collect::<Result<Vec<_>, _>>()?;
        indexed.sort_by_key(|(index, _)| *index);

        for (expected, (index, _)) in indexed.iter().enumerate() {
            if *index != expected {
                return Err(ModelError::InvalidLabelTable(format!(
                    "class indices must be contiguous from 0, missing {expected}"
                )));
            }
        }

        Ok(Self {
            labels: indexed.into_iter().map(|(_, label)| label).collect(),
        })
    }

    pub fn from_labels(labels: Vec<String>) -> Self {
        Self { labels }
    }

    /// Fail fast when the table and the model disagree on cardinality
    pub fn validate(&self, num_classes: usize) -> Result<(), ModelError> {
        if self.labels.len() != num_classes {
            return Err(ModelError::CardinalityMismatch {
                labels: self.labels.len(),
                classes: num_classes,
            });
        }
        Ok(())
    }

    pub fn get(&self, index: usize) -> Option<&str> {
        self.labels.get(index).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }
}

/// Wait until every path exists. Returns `false` if cancelled first.
///
/// Model artifacts may be produced by a training job running alongside the
/// service, so their absence at startup is not an error.
pub async fn wait_for_artifacts(
    paths: &[&Path],
    interval: Duration,
    cancel: &CancellationToken,
) -> bool {
    let missing = |paths: &[&Path]| paths.iter().any(|p| !p.exists());

    if !missing(paths) {
        return true;
    }

    warn!(?paths, "Model/labels not found, waiting for training to complete");

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return false,
            _ = tokio::time::sleep(interval) => {}
        }
        if !missing(paths) {
            info!("Model artifacts available");
            return true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;
    use ndarray::array;

    #[test]
    fn test_top1_softmax() {
        let logits = array![[1.0f32, 3.0, 0.5], [0.0, 0.0, 0.0]];
        let scores = top1(logits.view());

        assert_eq!(scores.len(), 2);
        assert_eq!(scores[0].class_index, 1);
        let expected = 3.0f32.exp() / (1.0f32.exp() + 3.0f32.exp() + 0.5f32.exp());
        assert!((scores[0].confidence - expected).abs() < 1e-6);

        assert_eq!(scores[1].class_index, 0);
        assert!((scores[1].confidence - 1.0 / 3.0).abs() < 1e-6);
    }

    #[test]
    fn test_preprocess_layout() {
        let red = RgbImage::from_pixel(10, 20, Rgb([255, 0, 0]));
        let blue = RgbImage::from_pixel(40, 40, Rgb([0, 0, 255]));
        let input = preprocess([&red, &blue].into_iter(), 8).unwrap();

        assert_eq!(input.shape(), &[2, 3, 8, 8]);
        assert_eq!(input[[0, 0, 4, 4]], 1.0);
        assert_eq!(input[[0, 2, 4, 4]], 0.0);
        assert_eq!(input[[1, 2, 0, 7]], 1.0);
    }

    #[test]
    fn test_preprocess_rejects_empty_image() {
        let good = RgbImage::from_pixel(4, 4, Rgb([1, 1, 1]));
        let empty = RgbImage::new(0, 0);
        assert!(matches!(
            preprocess([&good, &empty].into_iter(), 8),
            Err(ModelError::EmptyImage { index: 1 })
        ));
    }

    #[test]
    fn test_label_table_parse_and_validate() {
        let table = LabelTable::from_json(br#"{"1": "blue_square", "0": " red_circle "}"#).unwrap();
        assert_eq!(table.len(), 2);
        assert_eq!(table.get(0), Some(" red_circle "));
        assert_eq!(table.get(1), Some("blue_square"));
        assert_eq!(table.get(2), None);

        assert!(table.validate(2).is_ok());
        assert!(matches!(
            table.validate(3),
            Err(ModelError::CardinalityMismatch { labels: 2, classes: 3 })
        ));
    }

    #[test]
    fn test_label_table_rejects_gaps_and_bad_keys() {
        assert!(LabelTable::from_json(br#"{"0": "a", "2": "c"}"#).is_err());
        assert!(LabelTable::from_json(br#"{"zero": "a"}"#).is_err());
        assert!(LabelTable::from_json(b"[]").is_err());
    }

    #[tokio::test]
    async fn test_wait_for_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        let model = dir.path().join("model.onnx");
        let cancel = CancellationToken::new();

        let waiter = {
            let model = model.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                wait_for_artifacts(&[model.as_path()], Duration::from_millis(10), &cancel).await
            })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!waiter.is_finished());

        std::fs::write(&model, b"onnx").unwrap();
        assert!(tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap());
    }

    #[tokio::test]
    async fn test_wait_for_artifacts_cancelled() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let missing = Path::new("/nonexistent/classes.json");
        assert!(!wait_for_artifacts(&[missing], Duration::from_millis(10), &cancel).await);
    }
}
