use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::{decode_job_message, encode_job_id, BrokerError, ConsumedMessage, JobConsumer};

#[derive(Debug, Clone)]
struct RawMessage {
    key: Option<Vec<u8>>,
    value: Option<Vec<u8>>,
}

#[derive(Debug, Default)]
struct TopicState {
    log: Vec<RawMessage>,
    /// Offset of the next message handed out by `consume`
    position: usize,
    /// Next offset to read after a restart (Kafka commit semantics)
    committed: Option<i64>,
}

/// Single-partition in-process topic with manual commits.
#[derive(Debug, Default)]
pub struct InMemoryBroker {
    state: Mutex<TopicState>,
    available: Notify,
    subscribed: AtomicBool,
    closed: AtomicBool,
    consume_calls: AtomicUsize,
    commit_calls: AtomicUsize,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publishes a job announcement.
    pub async fn publish(&self, id: Uuid) {
        let bytes = encode_job_id(id).to_vec();
        self.publish_raw(Some(bytes.clone()), Some(bytes)).await;
    }

    /// Publishes arbitrary key/value bytes.
    pub async fn publish_raw(&self, key: Option<Vec<u8>>, value: Option<Vec<u8>>) {
        self.state.lock().await.log.push(RawMessage { key, value });
        self.available.notify_waiters();
    }

    pub async fn committed_offset(&self) -> Option<i64> {
        self.state.lock().await.committed
    }

    /// Messages not yet handed out by `consume`.
    pub async fn pending(&self) -> usize {
        let state = self.state.lock().await;
        state.log.len() - state.position
    }

    pub fn consume_calls(&self) -> usize {
        self.consume_calls.load(Ordering::SeqCst)
    }

    pub fn commit_calls(&self) -> usize {
        self.commit_calls.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl JobConsumer for InMemoryBroker {
    fn subscribe(&self) -> Result<(), BrokerError> {
        if self.is_closed() {
            return Err(BrokerError::Unavailable("consumer is closed".to_string()));
        }
        self.subscribed.store(true, Ordering::SeqCst);
        tracing::info!(topic = "memory", "Subscribed to topic");
        Ok(())
    }

    async fn consume(&self, cancel: &CancellationToken) -> Result<ConsumedMessage, BrokerError> {
        self.consume_calls.fetch_add(1, Ordering::SeqCst);
        if !self.subscribed.load(Ordering::SeqCst) || self.is_closed() {
            return Err(BrokerError::Unavailable("consumer is not subscribed".to_string()));
        }

        loop {
            let notified = self.available.notified();
            {
                let mut state = self.state.lock().await;
                if state.position < state.log.len() {
                    let offset = state.position;
                    state.position += 1;
                    let raw = &state.log[offset];
                    let job_id = decode_job_message(raw.key.as_deref(), raw.value.as_deref())?;
                    tracing::info!(job_id = %job_id, offset, "Consumed message");
                    return Ok(ConsumedMessage {
                        job_id,
                        partition: 0,
                        offset: offset as i64,
                    });
                }
            }

            tokio::select! {
                _ = notified => {}
                _ = cancel.cancelled() => return Err(BrokerError::Cancelled),
            }
        }
    }

    async fn commit(&self, message: &ConsumedMessage) -> Result<(), BrokerError> {
        self.commit_calls.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock().await;
        let next = message.offset + 1;
        if state.committed.map_or(true, |committed| committed < next) {
            state.committed = Some(next);
        }
        tracing::info!(job_id = %message.job_id, offset = message.offset, "Committed message");
        Ok(())
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.available.notify_waiters();
            tracing::info!("Consumer closed");
        }
    }
}
