//! Fetch stage: bus -> frame codec -> work queue.

use crate::codec;
use crate::queue::{QueueError, QueueSender};
use crate::source::{BusMessage, MessageSource};
use crate::telemetry::{FRAMES_MALFORMED, FRAMES_RECEIVED};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Counters reported when the fetch stage stops
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FetchStats {
    pub received: u64,
    pub enqueued: u64,
    pub malformed: u64,
    pub transport_errors: u64,
}

/// Pulls payloads from a message source and feeds decoded items to the queue
pub struct FetchStage<S: MessageSource> {
    source: S,
    queue: QueueSender,
    poll_timeout: Duration,
}

impl<S: MessageSource> FetchStage<S> {
    pub fn new(source: S, queue: QueueSender, poll_timeout: Duration) -> Self {
        Self {
            source,
            queue,
            poll_timeout,
        }
    }

    /// Run until `cancel` fires, then close the source.
    ///
    /// Frames are decoded on the blocking pool. A malformed frame is logged
    /// and skipped; it never stops the loop.
    pub async fn run(mut self, cancel: CancellationToken) -> FetchStats {
        info!("Network fetcher started");
        let mut stats = FetchStats::default();

        while !cancel.is_cancelled() {
            let message = match self.source.poll(self.poll_timeout).await {
                Ok(Some(message)) => message,
                Ok(None) => continue,
                Err(e) => {
                    stats.transport_errors += 1;
                    debug!(error = %e, "Bus poll error");
                    continue;
                }
            };

            stats.received += 1;
            metrics::counter!(FRAMES_RECEIVED).increment(1);

            let BusMessage {
                payload,
                partition,
                offset,
            } = message;
            let decoded = tokio::task::spawn_blocking(move || codec::decode(&payload)).await;

            let frame = match decoded {
                Ok(Ok(frame)) => frame,
                Err(e) => {
                    error!(error = %e, partition, offset, "Frame decode task failed");
                    continue;
                }
                Ok(Err(e)) => {
                    stats.malformed += 1;
                    metrics::counter!(FRAMES_MALFORMED).increment(1);
                    warn!(
                        error = %e,
                        partition,
                        offset,
                        "Discarding malformed frame"
                    );
                    continue;
                }
            };

            match self.queue.put(frame.into(), &cancel).await {
                Ok(()) => stats.enqueued += 1,
                Err(QueueError::Cancelled) => break,
                Err(e) => {
                    warn!(error = %e, "Work queue unavailable, stopping fetcher");
                    break;
                }
            }
        }

        self.source.close().await;

        info!(
            received = stats.received,
            enqueued = stats.enqueued,
            malformed = stats.malformed,
            "Network fetcher stopped"
        );

        stats
    }
}
