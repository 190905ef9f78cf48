//! Streaming response delivery engine.
//!
//! Turns an incrementally produced text stream into a correctly ordered,
//! correctly chunked, rate-limited sequence of send/edit operations against
//! a messaging transport, serialized per conversation. The engine decides
//! how to deliver an already-producing stream, never what to generate.
//!
//! Pipeline: deltas are buffered by the [`chunker::ChunkAccumulator`] until
//! a chunk is ready; each chunk is handed to the [`scheduler::Scheduler`],
//! which grows the current outbound message through paced edits and rolls
//! over to a fresh message when the edit budget is spent. One
//! [`session::Session`] drives the pipeline per request, under a per-chat
//! lock from [`locks::KeyedLocks`].

pub mod chunker;
pub mod locks;
pub mod scheduler;
pub mod session;

use crate::config::DeliveryConfig;
use crate::error::{DeliveryError, SinkError, SourceError};
use crate::{ChatId, MessageRef};

use futures::Stream;
use locks::AcquireRejected;
use session::Session;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::watch;

pub use session::{DeliveryOutcome, SessionState};

/// A lazy, finite sequence of text deltas from a generation backend.
/// Dropping the stream cancels the underlying request.
pub type DeltaStream = Pin<Box<dyn Stream<Item = Result<String, SourceError>> + Send>>;

/// The messaging transport's send/edit primitives. The engine depends only
/// on this contract; errors must be classified retryable vs terminal via
/// [`SinkError`].
pub trait MessageSink: Send + Sync {
    fn send(
        &self,
        chat_id: ChatId,
        text: &str,
    ) -> impl std::future::Future<Output = Result<MessageRef, SinkError>> + Send;

    fn edit(
        &self,
        message: MessageRef,
        text: &str,
    ) -> impl std::future::Future<Output = Result<(), SinkError>> + Send;
}

/// One outbound operation, identified only by its position in the
/// per-session sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOperation {
    SendNew(String),
    EditExisting(MessageRef, String),
}

/// The delivery engine: per-conversation locks plus the configuration every
/// session runs under. Cheap to share behind an `Arc`.
pub struct DeliveryEngine<S> {
    sink: Arc<S>,
    locks: locks::KeyedLocks,
    config: DeliveryConfig,
}

impl<S: MessageSink> DeliveryEngine<S> {
    pub fn new(sink: Arc<S>, config: DeliveryConfig) -> Self {
        let locks = locks::KeyedLocks::new(config.max_queue_depth);
        Self {
            sink,
            locks,
            config,
        }
    }

    pub fn config(&self) -> &DeliveryConfig {
        &self.config
    }

    /// Run one delivery session: acquire the conversation lock, drive the
    /// stream to completion, release the lock. Returns the final assembled
    /// text for the caller to persist.
    ///
    /// A second request for the same chat queues behind the active one up to
    /// the configured depth; beyond that it fails fast with
    /// [`DeliveryError::ConversationBusy`]. Flipping `cancel` to true
    /// unblocks every suspension point and stops all further sink
    /// operations.
    pub async fn deliver(
        &self,
        chat_id: ChatId,
        stream: DeltaStream,
        cancel: watch::Receiver<bool>,
    ) -> Result<DeliveryOutcome, DeliveryError> {
        let _permit = match self.locks.acquire(chat_id, cancel.clone()).await {
            Ok(permit) => permit,
            Err(AcquireRejected::Busy) => return Err(DeliveryError::ConversationBusy(chat_id)),
            Err(AcquireRejected::Cancelled) => return Err(DeliveryError::Cancelled(chat_id)),
        };

        let session = Session::new(chat_id, &*self.sink, &self.config, cancel);
        session.run(stream).await
        // _permit drops here: the lock is released on success, failure, and
        // cancellation alike.
    }
}

/// Resolve once the cancellation flag flips to true. A closed channel means
/// the controller went away without cancelling; pend forever in that case so
/// select loops fall through to their other branches.
pub(crate) async fn cancelled(cancel: &mut watch::Receiver<bool>) {
    if cancel.wait_for(|flag| *flag).await.is_err() {
        std::future::pending::<()>().await;
    }
}
