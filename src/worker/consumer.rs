use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::engine::JobExecutionEngine;
use crate::broker::{BrokerError, ConsumedMessage, JobConsumer};
use crate::config::ConsumerConfig;
use crate::error::Result;
use crate::resources::AdmissionGate;
use crate::store::{JobStore, StoreError};

/// What one loop iteration did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsumeOutcome {
    /// Admission denied; the broker was not touched.
    Denied,
    /// The poll was cancelled by shutdown.
    Cancelled,
    /// The poll failed; nothing was cached or committed.
    PollFailed,
    /// The message was processed and its offset committed.
    Committed { job_id: Uuid, started: bool },
    /// Processing failed; the message is kept for the next iteration.
    Retained { job_id: Uuid },
}

/// Pulls job messages one at a time and hands admitted jobs to the engine.
///
/// A message is committed only after the job has been handed off and marked
/// running. Until then it stays cached and is retried on the next iteration,
/// so delivery is at-least-once.
pub struct ConsumerWorker {
    consumer: Arc<dyn JobConsumer>,
    store: Arc<dyn JobStore>,
    engine: JobExecutionEngine,
    admission: Arc<dyn AdmissionGate>,
    config: ConsumerConfig,
    last_consumed: Option<ConsumedMessage>,
}

impl ConsumerWorker {
    pub fn new(
        consumer: Arc<dyn JobConsumer>,
        store: Arc<dyn JobStore>,
        engine: JobExecutionEngine,
        admission: Arc<dyn AdmissionGate>,
        config: ConsumerConfig,
    ) -> Self {
        Self {
            consumer,
            store,
            engine,
            admission,
            config,
            last_consumed: None,
        }
    }

    /// Message kept from a failed processing attempt, if any.
    pub fn pending_message(&self) -> Option<&ConsumedMessage> {
        self.last_consumed.as_ref()
    }

    /// One loop iteration: admission check, then at most one message.
    pub async fn iterate(&mut self, cancel: &CancellationToken) -> ConsumeOutcome {
        if !self.admission.can_admit_new_job().await {
            return ConsumeOutcome::Denied;
        }
        self.consume_once(cancel).await
    }

    pub async fn consume_once(&mut self, cancel: &CancellationToken) -> ConsumeOutcome {
        let message = if let Some(message) = self.last_consumed.clone() {
            tracing::info!(
                job_id = %message.job_id,
                offset = message.offset,
                "Retrying uncommitted message"
            );
            message
        } else {
            match self.consumer.consume(cancel).await {
                Ok(message) => {
                    tracing::info!(
                        job_id = %message.job_id,
                        partition = message.partition,
                        offset = message.offset,
                        "Message consumed"
                    );
                    self.last_consumed = Some(message.clone());
                    message
                }
                Err(BrokerError::Cancelled) => return ConsumeOutcome::Cancelled,
                Err(e) => {
                    tracing::error!(error = %e, "Failed to consume message");
                    return ConsumeOutcome::PollFailed;
                }
            }
        };

        match self.process(&message).await {
            Ok(started) => {
                self.last_consumed = None;
                ConsumeOutcome::Committed {
                    job_id: message.job_id,
                    started,
                }
            }
            Err(e) => {
                tracing::error!(
                    job_id = %message.job_id,
                    error = %e,
                    "Failed to process message, it will be retried"
                );
                ConsumeOutcome::Retained {
                    job_id: message.job_id,
                }
            }
        }
    }

    async fn process(&self, message: &ConsumedMessage) -> Result<bool> {
        let id = message.job_id;
        let started = match self.store.fetch_new_job(id).await? {
            None => {
                tracing::info!(job_id = %id, "Job is not new, skipping");
                false
            }
            Some(definition) => {
                let started = match self.engine.run_job(definition) {
                    Ok(started) => started,
                    Err(e) => {
                        tracing::error!(job_id = %id, error = %e, "Failed to start job");
                        false
                    }
                };

                match self.store.mark_running(id).await {
                    Ok(()) => {}
                    Err(StoreError::AlreadyFinished(_)) => {
                        tracing::warn!(job_id = %id, "Job finished before it was marked running");
                    }
                    Err(e) => return Err(e.into()),
                }
                started
            }
        };

        self.consumer.commit(message).await?;
        tracing::debug!(job_id = %id, offset = message.offset, "Message committed");
        Ok(started)
    }

    async fn run(mut self, cancel: CancellationToken) {
        tracing::info!("Consumption loop started");
        while !cancel.is_cancelled() {
            self.iterate(&cancel).await;

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.config.iteration_delay) => {}
            }
        }
        tracing::info!("Consumption loop stopped");
    }
}

/// Handle to the background consumption task.
pub struct ConsumptionLoop {
    cancel: CancellationToken,
    task: JoinHandle<()>,
    consumer: Arc<dyn JobConsumer>,
    engine: JobExecutionEngine,
}

impl ConsumptionLoop {
    /// Subscribes to the topic and spawns the loop.
    pub fn start(worker: ConsumerWorker) -> Result<Self> {
        worker.consumer.subscribe()?;

        let cancel = CancellationToken::new();
        let consumer = worker.consumer.clone();
        let engine = worker.engine.clone();
        let task = tokio::spawn(worker.run(cancel.clone()));

        Ok(Self {
            cancel,
            task,
            consumer,
            engine,
        })
    }

    /// Stops polling, then waits for in-flight jobs. Running jobs are not cancelled.
    pub async fn stop(self) {
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            tracing::error!(error = %e, "Consumption loop task failed");
        }
        self.consumer.close();
        self.engine.wait_for_all_jobs().await;
        tracing::info!("Worker stopped");
    }
}
