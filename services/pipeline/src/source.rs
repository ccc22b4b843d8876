//! Message bus access for the fetch stage.
//!
//! The pipeline only needs a bounded `poll` and a `close`; reconnects and
//! retries belong to the bus client itself.

use crate::config::Config;
use async_trait::async_trait;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::message::Message as KafkaMessage;
use std::collections::VecDeque;
use std::time::Duration;
use thiserror::Error;
use tracing::info;

/// Errors that can occur while talking to the bus
#[derive(Error, Debug)]
pub enum SourceError {
    #[error("Failed to create consumer: {0}")]
    CreationError(String),

    #[error("Failed to subscribe to topics: {0}")]
    SubscriptionError(String),

    #[error("Transport error: {0}")]
    Transport(String),
}

/// A raw payload pulled from the bus
#[derive(Debug, Clone)]
pub struct BusMessage {
    pub payload: Vec<u8>,
    pub partition: i32,
    pub offset: i64,
}

/// Poll-style access to a topic
#[async_trait]
pub trait MessageSource: Send {
    /// Wait up to `timeout` for the next message
    async fn poll(&mut self, timeout: Duration) -> Result<Option<BusMessage>, SourceError>;

    /// Release the underlying client
    async fn close(&mut self);
}

/// Kafka-backed message source
pub struct KafkaSource {
    consumer: StreamConsumer,
    topic: String,
}

impl KafkaSource {
    /// Create a consumer and subscribe it to the configured topic
    pub fn new(config: &Config) -> Result<Self, SourceError> {
        info!(
            brokers = %config.kafka_bootstrap_server,
            group = %config.kafka_consumer_group,
            "Creating Kafka consumer"
        );

        let consumer: StreamConsumer = config
            .build_consumer_config()
            .create()
            .map_err(|e| SourceError::CreationError(e.to_string()))?;

        consumer
            .subscribe(&[config.kafka_topic.as_str()])
            .map_err(|e| SourceError::SubscriptionError(e.to_string()))?;

        info!(topic = %config.kafka_topic, "Subscribed to Kafka topic");

        Ok(Self {
            consumer,
            topic: config.kafka_topic.clone(),
        })
    }
}

#[async_trait]
impl MessageSource for KafkaSource {
    async fn poll(&mut self, timeout: Duration) -> Result<Option<BusMessage>, SourceError> {
        match tokio::time::timeout(timeout, self.consumer.recv()).await {
            Err(_) => Ok(None),
            Ok(Err(e)) => Err(SourceError::Transport(e.to_string())),
            Ok(Ok(msg)) => Ok(Some(BusMessage {
                payload: msg.payload().unwrap_or(&[]).to_vec(),
                partition: msg.partition(),
                offset: msg.offset(),
            })),
        }
    }

    async fn close(&mut self) {
        info!(topic = %self.topic, "Closing Kafka consumer");
        self.consumer.unsubscribe();
    }
}

/// In-memory source replaying a fixed list of payloads.
///
/// Once drained it behaves like an idle topic: every poll waits out its
/// timeout and returns nothing.
#[derive(Debug, Default)]
pub struct MemorySource {
    pending: VecDeque<Vec<u8>>,
    next_offset: i64,
    closed: bool,
}

impl MemorySource {
    pub fn new(payloads: impl IntoIterator<Item = Vec<u8>>) -> Self {
        Self {
            pending: payloads.into_iter().collect(),
            next_offset: 0,
            closed: false,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn remaining(&self) -> usize {
        self.pending.len()
    }
}

#[async_trait]
impl MessageSource for MemorySource {
    async fn poll(&mut self, timeout: Duration) -> Result<Option<BusMessage>, SourceError> {
        match self.pending.pop_front() {
            Some(payload) => {
                let offset = self.next_offset;
                self.next_offset += 1;
                Ok(Some(BusMessage {
                    payload,
                    partition: 0,
                    offset,
                }))
            }
            None => {
                tokio::time::sleep(timeout).await;
                Ok(None)
            }
        }
    }

    async fn close(&mut self) {
        self.closed = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_source_replays_in_order() {
        let mut source = MemorySource::new(vec![b"a".to_vec(), b"b".to_vec()]);

        assert_eq!(source.remaining(), 2);
        let first = source.poll(Duration::from_millis(5)).await.unwrap().unwrap();
        assert_eq!(source.remaining(), 1);
        let second = source.poll(Duration::from_millis(5)).await.unwrap().unwrap();
        assert_eq!(first.payload, b"a");
        assert_eq!((first.offset, second.offset), (0, 1));
        assert_eq!(source.remaining(), 0);
        assert!(source.poll(Duration::from_millis(5)).await.unwrap().is_none());

        source.close().await;
        assert!(source.is_closed());
    }
}
