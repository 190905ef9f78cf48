//! Pacing, edit budgets, and coalescing of outbound operations.
//!
//! The scheduler owns one session's view of the transport: the current
//! message handle, its cumulative text, and the single-slot cell holding
//! the most recent un-issued edit. Chunks grow the current message through
//! edits; when the per-message edit budget is spent, the next chunk starts
//! a fresh message. Edits that become eligible while a pacing wait is
//! outstanding overwrite the slot, so only the newest cumulative text is
//! ever sent — superseded intermediate states are dropped without data
//! loss, since every later edit carries the superset text.

use crate::config::DeliveryConfig;
use crate::delivery::{DeliveryOperation, MessageSink, cancelled};
use crate::error::SinkError;
use crate::{ChatId, MessageRef};

use rand::Rng as _;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

/// Scheduling failure, before session-level context is attached.
#[derive(Debug, thiserror::Error)]
pub enum ScheduleError {
    #[error("delivery cancelled")]
    Cancelled,

    #[error(transparent)]
    Sink(#[from] SinkError),
}

pub struct Scheduler<'a, S> {
    sink: &'a S,
    config: &'a DeliveryConfig,
    chat_id: ChatId,
    cancel: watch::Receiver<bool>,

    handle: Option<MessageRef>,
    /// Cumulative text of the current message, including un-issued chunks.
    handle_text: String,
    edit_count: u32,
    last_op_at: Option<Instant>,
    /// Single-slot cell: the most recent cumulative text awaiting an edit.
    pending_edit: Option<String>,

    /// Bytes confirmed by the sink for retired messages.
    delivered_prior: usize,
    /// Bytes confirmed by the sink for the current message.
    delivered_current: usize,
    operations: usize,
    messages: usize,
}

impl<'a, S: MessageSink> Scheduler<'a, S> {
    pub fn new(
        sink: &'a S,
        config: &'a DeliveryConfig,
        chat_id: ChatId,
        cancel: watch::Receiver<bool>,
    ) -> Self {
        Self {
            sink,
            config,
            chat_id,
            cancel,
            handle: None,
            handle_text: String::new(),
            edit_count: 0,
            last_op_at: None,
            pending_edit: None,
            delivered_prior: 0,
            delivered_current: 0,
            operations: 0,
            messages: 0,
        }
    }

    /// Bytes of text the sink has acknowledged so far.
    pub fn delivered_len(&self) -> usize {
        self.delivered_prior + self.delivered_current
    }

    pub fn operations(&self) -> usize {
        self.operations
    }

    pub fn messages(&self) -> usize {
        self.messages
    }

    /// Whether at least one sink operation has succeeded this session.
    pub fn has_delivered(&self) -> bool {
        self.operations > 0
    }

    /// Instant at which the pending edit becomes eligible, if one is queued.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending_edit.as_ref()?;
        Some(match self.last_op_at {
            Some(at) => at + self.config.edit_interval,
            None => Instant::now(),
        })
    }

    /// Submit one flush decision.
    ///
    /// Ordinarily the chunk extends the current message: the cumulative
    /// text lands in the pending slot and is issued once pacing allows.
    /// With no message yet, or with the edit budget spent, the pending edit
    /// is drained first (it carries content for the retiring message) and
    /// the chunk opens a fresh message via `SendNew`.
    pub async fn append_chunk(&mut self, chunk: &str) -> Result<(), ScheduleError> {
        let rollover = match self.handle {
            None => true,
            Some(_) => self.edit_count >= self.config.max_edits_per_message,
        };

        if rollover {
            self.flush_pending().await?;
            let handle = self.issue_send(chunk).await?;
            self.handle = Some(handle);
            self.handle_text = chunk.to_string();
            self.edit_count = 0;
        } else {
            self.handle_text.push_str(chunk);
            self.pending_edit = Some(self.handle_text.clone());
        }
        Ok(())
    }

    /// Issue the pending edit, waiting out the pacing interval first.
    /// No-op when nothing is pending.
    pub async fn flush_pending(&mut self) -> Result<(), ScheduleError> {
        if self.pending_edit.is_none() {
            return Ok(());
        }
        self.wait_until_eligible().await?;
        if let Some(text) = self.pending_edit.take() {
            self.issue_edit(&text).await?;
        }
        Ok(())
    }

    async fn wait_until_eligible(&mut self) -> Result<(), ScheduleError> {
        if let Some(last) = self.last_op_at {
            let eligible_at = last + self.config.edit_interval;
            if eligible_at > Instant::now() {
                let cancel = &mut self.cancel;
                tokio::select! {
                    biased;
                    _ = cancelled(cancel) => return Err(ScheduleError::Cancelled),
                    _ = tokio::time::sleep_until(eligible_at) => {}
                }
            }
        }
        Ok(())
    }

    async fn issue_send(&mut self, text: &str) -> Result<MessageRef, ScheduleError> {
        let mut attempt = 0u32;
        loop {
            let sink = self.sink;
            let chat_id = self.chat_id;
            let cancel = &mut self.cancel;
            let result = tokio::select! {
                biased;
                _ = cancelled(cancel) => return Err(ScheduleError::Cancelled),
                result = sink.send(chat_id, text) => result,
            };
            match result {
                Ok(handle) => {
                    self.record_op(DeliveryOperation::SendNew(text.to_string()));
                    self.delivered_prior += self.delivered_current;
                    self.delivered_current = text.len();
                    self.messages += 1;
                    return Ok(handle);
                }
                Err(error) => self.backoff_or_fail(error, &mut attempt).await?,
            }
        }
    }

    async fn issue_edit(&mut self, text: &str) -> Result<(), ScheduleError> {
        let handle = match self.handle {
            Some(handle) => handle,
            // A pending edit without a handle cannot exist; nothing to do.
            None => return Ok(()),
        };
        let mut attempt = 0u32;
        loop {
            let sink = self.sink;
            let cancel = &mut self.cancel;
            let result = tokio::select! {
                biased;
                _ = cancelled(cancel) => return Err(ScheduleError::Cancelled),
                result = sink.edit(handle, text) => result,
            };
            match result {
                Ok(()) => {
                    self.record_op(DeliveryOperation::EditExisting(handle, text.to_string()));
                    self.delivered_current = text.len();
                    self.edit_count += 1;
                    return Ok(());
                }
                Err(error) => self.backoff_or_fail(error, &mut attempt).await?,
            }
        }
    }

    fn record_op(&mut self, operation: DeliveryOperation) {
        self.last_op_at = Some(Instant::now());
        self.operations += 1;
        match operation {
            DeliveryOperation::SendNew(text) => {
                tracing::debug!(chat_id = self.chat_id, len = text.len(), "sent new message");
            }
            DeliveryOperation::EditExisting(handle, text) => {
                tracing::trace!(
                    chat_id = self.chat_id,
                    message_id = handle.message_id,
                    len = text.len(),
                    edit = self.edit_count + 1,
                    "edited message"
                );
            }
        }
    }

    /// Sleep before the next attempt, or give up: terminal errors and
    /// exhausted budgets escalate immediately. Throttling honors the
    /// transport's advisory delay; other transient failures back off
    /// exponentially with jitter.
    async fn backoff_or_fail(
        &mut self,
        error: SinkError,
        attempt: &mut u32,
    ) -> Result<(), ScheduleError> {
        *attempt += 1;
        if !error.is_retryable() || *attempt >= self.config.sink_attempts {
            return Err(ScheduleError::Sink(error));
        }

        let wait = match &error {
            SinkError::Throttled {
                retry_after: Some(seconds),
            } => Duration::from_secs(*seconds),
            _ => {
                let base = self.config.retry_backoff;
                let scaled = base * 2u32.saturating_pow(*attempt - 1);
                let jitter_ms = rand::thread_rng().gen_range(0..=base.as_millis() as u64 / 4);
                scaled + Duration::from_millis(jitter_ms)
            }
        };

        tracing::warn!(
            chat_id = self.chat_id,
            attempt = *attempt,
            wait_ms = wait.as_millis() as u64,
            %error,
            "sink operation failed, retrying"
        );

        let cancel = &mut self.cancel;
        tokio::select! {
            biased;
            _ = cancelled(cancel) => Err(ScheduleError::Cancelled),
            _ = tokio::time::sleep(wait) => Ok(()),
        }
    }
}
