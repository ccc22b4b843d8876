//! Bounded hand-off between the fetch stage and the inference stage.
//!
//! `put` waits while the queue is full, which is the only thing that keeps
//! ingestion from outrunning inference. `get` waits at most a bounded timeout
//! so the consumer can re-check the shutdown token between items.

use crate::codec::{DecodedFrame, Metadata};
use image::RgbImage;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Errors surfaced by the work queue
#[derive(Error, Debug, PartialEq, Eq)]
pub enum QueueError {
    #[error("Work queue capacity must be at least 1")]
    ZeroCapacity,

    #[error("Work queue closed")]
    Closed,

    #[error("Put cancelled by shutdown")]
    Cancelled,
}

/// A decoded image travelling from fetch to inference.
///
/// Ownership moves through the queue; nothing is shared between stages.
#[derive(Debug, Clone)]
pub struct DecodedItem {
    pub image: RgbImage,
    pub metadata: Metadata,
}

impl From<DecodedFrame> for DecodedItem {
    fn from(frame: DecodedFrame) -> Self {
        Self {
            image: frame.image,
            metadata: frame.metadata,
        }
    }
}

/// Outcome of a bounded wait on the queue
#[derive(Debug)]
pub enum Received {
    Item(DecodedItem),
    /// Nothing arrived within the timeout
    Empty,
    /// Every sender is gone and the queue is drained
    Closed,
}

/// Producer side of the work queue
#[derive(Debug, Clone)]
pub struct QueueSender {
    tx: mpsc::Sender<DecodedItem>,
}

/// Consumer side of the work queue
#[derive(Debug)]
pub struct QueueReceiver {
    rx: mpsc::Receiver<DecodedItem>,
}

/// Create a work queue holding at most `capacity` items
pub fn work_queue(capacity: usize) -> Result<(QueueSender, QueueReceiver), QueueError> {
    if capacity == 0 {
        return Err(QueueError::ZeroCapacity);
    }
    let (tx, rx) = mpsc::channel(capacity);
    Ok((QueueSender { tx }, QueueReceiver { rx }))
}

impl QueueSender {
    /// Enqueue an item, waiting for space. Returns promptly once `cancel`
    /// fires; the item is dropped in that case.
    pub async fn put(
        &self,
        item: DecodedItem,
        cancel: &CancellationToken,
    ) -> Result<(), QueueError> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(QueueError::Cancelled),
            sent = self.tx.send(item) => sent.map_err(|_| QueueError::Closed),
        }
    }

    /// Free slots remaining
    pub fn available(&self) -> usize {
        self.tx.capacity()
    }
}

impl QueueReceiver {
    /// Wait up to `timeout` for the next item
    pub async fn get(&mut self, timeout: Duration) -> Received {
        match tokio::time::timeout(timeout, self.rx.recv()).await {
            Ok(Some(item)) => Received::Item(item),
            Ok(None) => Received::Closed,
            Err(_) => Received::Empty,
        }
    }

    /// Items currently buffered
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    fn item(tag: &str) -> DecodedItem {
        DecodedItem {
            image: RgbImage::from_pixel(2, 2, Rgb([1, 2, 3])),
            metadata: Metadata::new().with("tag", tag),
        }
    }

    #[test]
    fn test_zero_capacity_rejected() {
        assert_eq!(work_queue(0).unwrap_err(), QueueError::ZeroCapacity);
    }

    #[tokio::test]
    async fn test_put_blocks_when_full() {
        let cancel = CancellationToken::new();
        for capacity in [1usize, 3, 8] {
            let (tx, mut rx) = work_queue(capacity).unwrap();
            for i in 0..capacity {
                tx.put(item(&i.to_string()), &cancel).await.unwrap();
            }
            assert_eq!(tx.available(), 0);

            let blocked =
                tokio::time::timeout(Duration::from_millis(50), tx.put(item("extra"), &cancel))
                    .await;
            assert!(blocked.is_err(), "put returned on a full queue (C={capacity})");

            assert!(matches!(
                rx.get(Duration::from_millis(50)).await,
                Received::Item(_)
            ));
            tokio::time::timeout(Duration::from_millis(500), tx.put(item("extra"), &cancel))
                .await
                .expect("put should complete after a get")
                .unwrap();
            assert_eq!(rx.len(), capacity);
        }
    }

    #[tokio::test]
    async fn test_put_returns_on_cancel() {
        let cancel = CancellationToken::new();
        let (tx, _rx) = work_queue(1).unwrap();
        tx.put(item("a"), &cancel).await.unwrap();

        let waiter = {
            let tx = tx.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { tx.put(item("b"), &cancel).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();

        let result = tokio::time::timeout(Duration::from_millis(500), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result, Err(QueueError::Cancelled));
    }

    #[tokio::test]
    async fn test_fifo_without_loss() {
        let cancel = CancellationToken::new();
        let (tx, mut rx) = work_queue(4).unwrap();
        for tag in ["a", "b", "c"] {
            tx.put(item(tag), &cancel).await.unwrap();
        }
        drop(tx);

        let mut seen = Vec::new();
        loop {
            match rx.get(Duration::from_millis(50)).await {
                Received::Item(i) => seen.push(i.metadata.label("tag")),
                Received::Closed => break,
                Received::Empty => panic!("queue reported empty with items pending"),
            }
        }
        assert_eq!(seen, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_get_times_out_when_empty() {
        let (_tx, mut rx) = work_queue(2).unwrap();
        assert!(matches!(
            rx.get(Duration::from_millis(10)).await,
            Received::Empty
        ));
        assert!(rx.is_empty());
    }
}
