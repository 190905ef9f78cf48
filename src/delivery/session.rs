//! One delivery session: the loop that drives a delta stream through the
//! chunker and scheduler until the answer is fully on screen.

use crate::config::DeliveryConfig;
use crate::delivery::chunker::ChunkAccumulator;
use crate::delivery::scheduler::{ScheduleError, Scheduler};
use crate::delivery::{DeltaStream, MessageSink, cancelled};
use crate::error::DeliveryError;
use crate::ChatId;

use futures::StreamExt;
use tokio::sync::watch;
use tokio::time::Instant;
use uuid::Uuid;

/// Session lifecycle. Transitions are logged; terminal states are final.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Streaming,
    Flushing,
    Completed,
    Cancelled,
    Failed,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled | Self::Failed)
    }

    fn can_transition(self, next: SessionState) -> bool {
        use SessionState::*;
        match (self, next) {
            (Idle, Streaming) => true,
            (Streaming, Flushing) | (Flushing, Streaming) => true,
            (Streaming | Flushing, Completed | Cancelled | Failed) => true,
            (Idle, Cancelled | Failed) => true,
            _ => false,
        }
    }
}

/// Successful result of a delivery session.
#[derive(Debug, Clone)]
pub struct DeliveryOutcome {
    pub chat_id: ChatId,
    /// The complete generated text, as assembled from the stream. Empty when
    /// the stream produced nothing and only the fallback notice was sent.
    pub final_text: String,
    /// Total sink operations issued (sends plus edits).
    pub operations: usize,
    /// Messages created on the transport.
    pub messages: usize,
}

pub struct Session<'a, S> {
    id: Uuid,
    chat_id: ChatId,
    sink: &'a S,
    config: &'a DeliveryConfig,
    cancel: watch::Receiver<bool>,
    state: SessionState,
}

impl<'a, S: MessageSink> Session<'a, S> {
    pub fn new(
        chat_id: ChatId,
        sink: &'a S,
        config: &'a DeliveryConfig,
        cancel: watch::Receiver<bool>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            chat_id,
            sink,
            config,
            cancel,
            state: SessionState::Idle,
        }
    }

    fn transition(&mut self, next: SessionState) {
        debug_assert!(
            self.state.can_transition(next),
            "invalid session transition {:?} -> {:?}",
            self.state,
            next
        );
        tracing::trace!(from = ?self.state, to = ?next, "session transition");
        self.state = next;
    }

    /// Drive the stream to completion. On failure after partial output, a
    /// best-effort failure notice is appended so the user is not left with a
    /// silently truncated answer.
    #[tracing::instrument(
        skip(self, stream),
        fields(chat_id = %self.chat_id, session_id = %self.id)
    )]
    pub async fn run(mut self, mut stream: DeltaStream) -> Result<DeliveryOutcome, DeliveryError> {
        self.transition(SessionState::Streaming);

        let mut accumulator = ChunkAccumulator::new(self.config.max_payload);
        let mut scheduler =
            Scheduler::new(self.sink, self.config, self.chat_id, self.cancel.clone());
        let mut full_text = String::new();
        let mut produced_any = false;

        let result = loop {
            let deadline = scheduler.next_deadline();
            let mut cancel = self.cancel.clone();
            tokio::select! {
                biased;
                _ = cancelled(&mut cancel) => {
                    break Err(ScheduleError::Cancelled);
                }
                _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)),
                    if deadline.is_some() =>
                {
                    self.transition(SessionState::Flushing);
                    if let Err(error) = scheduler.flush_pending().await {
                        break Err(error);
                    }
                    self.transition(SessionState::Streaming);
                }
                next = stream.next() => match next {
                    Some(Ok(delta)) => {
                        full_text.push_str(&delta);
                        let flushes = accumulator.ingest(&delta);
                        if !flushes.is_empty() {
                            produced_any = true;
                        }
                        if let Err(error) = Self::submit(&mut scheduler, flushes).await {
                            break Err(error);
                        }
                    }
                    Some(Err(error)) => {
                        tracing::warn!(%error, "generation stream failed");
                        self.transition(SessionState::Failed);
                        let failure = DeliveryError::Source {
                            chat_id: self.chat_id,
                            delivered: scheduler.delivered_len(),
                            message: error.to_string(),
                        };
                        return self.fail(scheduler, failure).await;
                    }
                    None => break Ok(()),
                },
            }
        };

        match result {
            Ok(()) => {
                self.transition(SessionState::Flushing);
                match Self::finish(&mut scheduler, &mut accumulator, produced_any, self.config)
                    .await
                {
                    Ok(()) => {
                        self.transition(SessionState::Completed);
                        tracing::debug!(
                            operations = scheduler.operations(),
                            messages = scheduler.messages(),
                            total_len = full_text.len(),
                            "delivery completed"
                        );
                        Ok(DeliveryOutcome {
                            chat_id: self.chat_id,
                            final_text: full_text,
                            operations: scheduler.operations(),
                            messages: scheduler.messages(),
                        })
                    }
                    Err(error) => self.classify_and_fail(scheduler, error).await,
                }
            }
            Err(error) => self.classify_and_fail(scheduler, error).await,
        }
    }

    async fn submit(
        scheduler: &mut Scheduler<'_, S>,
        flushes: Vec<String>,
    ) -> Result<(), ScheduleError> {
        for chunk in flushes {
            scheduler.append_chunk(&chunk).await?;
        }
        Ok(())
    }

    /// Finish after the stream ends: flush the residual buffer, drain the
    /// pending edit, and cover the nothing-produced case with the fallback.
    async fn finish(
        scheduler: &mut Scheduler<'_, S>,
        accumulator: &mut ChunkAccumulator,
        produced_any: bool,
        config: &DeliveryConfig,
    ) -> Result<(), ScheduleError> {
        let mut produced_any = produced_any;
        if let Some(residual) = accumulator.finalize() {
            produced_any = true;
            scheduler.append_chunk(&residual).await?;
        }
        scheduler.flush_pending().await?;

        if !produced_any {
            scheduler.append_chunk(&config.empty_fallback).await?;
            scheduler.flush_pending().await?;
        }
        Ok(())
    }

    async fn classify_and_fail(
        mut self,
        scheduler: Scheduler<'_, S>,
        error: ScheduleError,
    ) -> Result<DeliveryOutcome, DeliveryError> {
        match error {
            ScheduleError::Cancelled => {
                self.transition(SessionState::Cancelled);
                tracing::debug!(
                    delivered = scheduler.delivered_len(),
                    "delivery cancelled"
                );
                // Cancellation suppresses all further sink operations,
                // including the failure notice.
                Err(DeliveryError::Cancelled(self.chat_id))
            }
            ScheduleError::Sink(source) => {
                self.transition(SessionState::Failed);
                let failure = DeliveryError::Sink {
                    chat_id: self.chat_id,
                    delivered: scheduler.delivered_len(),
                    source,
                };
                self.fail(scheduler, failure).await
            }
        }
    }

    /// Terminal failure path: when partial output already reached the user,
    /// append a notice so the truncation is visible. The notice is a single
    /// unretried attempt; its own failure is only logged.
    async fn fail(
        self,
        scheduler: Scheduler<'_, S>,
        failure: DeliveryError,
    ) -> Result<DeliveryOutcome, DeliveryError> {
        if scheduler.has_delivered() {
            if let Err(error) = self
                .sink
                .send(self.chat_id, &self.config.failure_notice)
                .await
            {
                tracing::warn!(%error, "failed to deliver failure notice");
            }
        }
        Err(failure)
    }
}
