use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::Message;
use rdkafka::{Offset, TopicPartitionList};
use tokio_util::sync::CancellationToken;

use super::{decode_job_message, BrokerError, ConsumedMessage, JobConsumer};
use crate::config::BrokerConfig;

/// Kafka consumer with auto-commit disabled.
pub struct KafkaJobConsumer {
    consumer: Arc<StreamConsumer>,
    topic: String,
    closed: AtomicBool,
}

impl KafkaJobConsumer {
    pub fn new(config: &BrokerConfig) -> Result<Self, BrokerError> {
        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", &config.servers)
            .set("group.id", &config.group_id)
            .set("client.id", &config.client_id)
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", "earliest")
            .create()?;

        Ok(Self {
            consumer: Arc::new(consumer),
            topic: config.topic.clone(),
            closed: AtomicBool::new(false),
        })
    }
}

#[async_trait]
impl JobConsumer for KafkaJobConsumer {
    fn subscribe(&self) -> Result<(), BrokerError> {
        self.consumer.subscribe(&[self.topic.as_str()])?;
        tracing::info!(topic = %self.topic, "Subscribed to topic");
        Ok(())
    }

    async fn consume(&self, cancel: &CancellationToken) -> Result<ConsumedMessage, BrokerError> {
        let message = tokio::select! {
            received = self.consumer.recv() => received?,
            _ = cancel.cancelled() => return Err(BrokerError::Cancelled),
        };

        let job_id = decode_job_message(message.key(), message.payload())?;
        tracing::info!(
            job_id = %job_id,
            partition = message.partition(),
            offset = message.offset(),
            "Consumed message"
        );

        Ok(ConsumedMessage {
            job_id,
            partition: message.partition(),
            offset: message.offset(),
        })
    }

    async fn commit(&self, message: &ConsumedMessage) -> Result<(), BrokerError> {
        let mut offsets = TopicPartitionList::new();
        offsets.add_partition_offset(
            &self.topic,
            message.partition,
            Offset::Offset(message.offset + 1),
        )?;
        // Synchronous commits block on the broker round trip.
        let consumer = self.consumer.clone();
        tokio::task::spawn_blocking(move || consumer.commit(&offsets, CommitMode::Sync))
            .await
            .map_err(|e| BrokerError::Unavailable(format!("commit task failed: {e}")))??;
        tracing::info!(
            job_id = %message.job_id,
            partition = message.partition,
            offset = message.offset,
            "Committed message"
        );
        Ok(())
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.consumer.unsubscribe();
            tracing::info!(topic = %self.topic, "Consumer closed");
        }
    }
}
