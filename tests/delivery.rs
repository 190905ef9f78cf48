//! End-to-end tests for the delivery engine against a recording sink.

use arcanum::config::DeliveryConfig;
use arcanum::delivery::{DeliveryEngine, DeliveryOperation, DeltaStream, MessageSink};
use arcanum::error::{DeliveryError, SinkError, SourceError};
use arcanum::{ChatId, MessageRef};

use futures::StreamExt as _;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

/// In-memory transport that records every successful operation with its
/// timestamp and can be pre-loaded with per-call failures.
#[derive(Default)]
struct RecordingSink {
    ops: Mutex<Vec<(Instant, DeliveryOperation)>>,
    /// Raw invocations, including failed ones.
    calls: AtomicUsize,
    next_message_id: AtomicI64,
    /// One entry consumed per call while non-empty: `Some` fails the call,
    /// `None` lets it through.
    plan: Mutex<VecDeque<Option<SinkError>>>,
}

impl RecordingSink {
    fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn with_plan(plan: Vec<Option<SinkError>>) -> Arc<Self> {
        let sink = Self::default();
        *sink.plan.lock().unwrap() = plan.into();
        Arc::new(sink)
    }

    fn operations(&self) -> Vec<DeliveryOperation> {
        self.ops.lock().unwrap().iter().map(|(_, op)| op.clone()).collect()
    }

    fn timestamps(&self) -> Vec<Instant> {
        self.ops.lock().unwrap().iter().map(|(at, _)| *at).collect()
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn planned_failure(&self) -> Option<SinkError> {
        self.plan.lock().unwrap().pop_front().flatten()
    }
}

impl MessageSink for RecordingSink {
    async fn send(&self, chat_id: ChatId, text: &str) -> Result<MessageRef, SinkError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = self.planned_failure() {
            return Err(error);
        }
        let message_id = self.next_message_id.fetch_add(1, Ordering::SeqCst) + 1;
        let reference = MessageRef { chat_id, message_id };
        self.ops
            .lock()
            .unwrap()
            .push((Instant::now(), DeliveryOperation::SendNew(text.to_string())));
        Ok(reference)
    }

    async fn edit(&self, message: MessageRef, text: &str) -> Result<(), SinkError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = self.planned_failure() {
            return Err(error);
        }
        self.ops.lock().unwrap().push((
            Instant::now(),
            DeliveryOperation::EditExisting(message, text.to_string()),
        ));
        Ok(())
    }
}

fn test_config(max_payload: usize) -> DeliveryConfig {
    DeliveryConfig {
        max_payload,
        edit_interval: Duration::from_millis(100),
        retry_backoff: Duration::from_millis(50),
        ..DeliveryConfig::default()
    }
}

fn never_cancel() -> watch::Receiver<bool> {
    let (_tx, rx) = watch::channel(false);
    rx
}

fn delta_stream(deltas: &[&str]) -> DeltaStream {
    let items: Vec<Result<String, SourceError>> =
        deltas.iter().map(|delta| Ok(delta.to_string())).collect();
    Box::pin(futures::stream::iter(items))
}

/// Stream that sleeps `gap` before yielding each delta, so pacing deadlines
/// fire between deltas under the paused clock.
fn gapped_stream(deltas: &[&str], gap: Duration) -> DeltaStream {
    let items: Vec<String> = deltas.iter().map(|delta| delta.to_string()).collect();
    Box::pin(futures::stream::unfold(
        items.into_iter(),
        move |mut iter| async move {
            let next = iter.next()?;
            tokio::time::sleep(gap).await;
            Some((Ok(next), iter))
        },
    ))
}

fn op_text(op: &DeliveryOperation) -> &str {
    match op {
        DeliveryOperation::SendNew(text) => text,
        DeliveryOperation::EditExisting(_, text) => text,
    }
}

#[tokio::test(start_paused = true)]
async fn grows_one_message_through_edits() {
    let sink = RecordingSink::new();
    let engine = DeliveryEngine::new(sink.clone(), test_config(8));

    let outcome = engine
        .deliver(1, delta_stream(&["Hel", "lo ", "world"]), never_cancel())
        .await
        .unwrap();

    let ops = sink.operations();
    assert_eq!(ops.len(), 2);
    assert!(matches!(&ops[0], DeliveryOperation::SendNew(text) if text == "Hello wo"));
    assert!(
        matches!(&ops[1], DeliveryOperation::EditExisting(message, text)
            if text == "Hello world" && message.message_id == 1)
    );
    assert_eq!(outcome.final_text, "Hello world");
    assert_eq!(outcome.messages, 1);
    assert_eq!(outcome.operations, 2);
}

#[tokio::test(start_paused = true)]
async fn coalesces_backlogged_chunks_into_one_edit() {
    let sink = RecordingSink::new();
    let engine = DeliveryEngine::new(sink.clone(), test_config(8));

    let text = "a".repeat(20);
    let outcome = engine
        .deliver(1, delta_stream(&[&text]), never_cancel())
        .await
        .unwrap();

    // Three chunks become ready at once; the intermediate cumulative state
    // is superseded before it can be issued, leaving one send and one edit.
    let ops = sink.operations();
    assert_eq!(ops.len(), 2);
    assert!(matches!(&ops[0], DeliveryOperation::SendNew(text) if text.len() == 8));
    assert!(matches!(&ops[1], DeliveryOperation::EditExisting(_, text) if text.len() == 20));
    assert_eq!(outcome.final_text, text);
}

#[tokio::test(start_paused = true)]
async fn empty_stream_sends_fallback() {
    let sink = RecordingSink::new();
    let config = test_config(100);
    let fallback = config.empty_fallback.clone();
    let engine = DeliveryEngine::new(sink.clone(), config);

    let outcome = engine.deliver(1, delta_stream(&[]), never_cancel()).await.unwrap();

    let ops = sink.operations();
    assert_eq!(ops.len(), 1);
    assert!(matches!(&ops[0], DeliveryOperation::SendNew(text) if *text == fallback));
    assert!(outcome.final_text.is_empty());
}

#[tokio::test(start_paused = true)]
async fn retries_transient_failures_with_backoff() {
    let sink = RecordingSink::with_plan(vec![
        Some(SinkError::Transient("502".into())),
        Some(SinkError::Transient("502".into())),
    ]);
    let engine = DeliveryEngine::new(sink.clone(), test_config(100));

    let outcome = engine
        .deliver(1, delta_stream(&["short answer"]), never_cancel())
        .await
        .unwrap();

    // Two failures, one success: three raw calls, one recorded operation.
    assert_eq!(sink.calls(), 3);
    let ops = sink.operations();
    assert_eq!(ops.len(), 1);
    assert!(matches!(&ops[0], DeliveryOperation::SendNew(text) if text == "short answer"));
    assert_eq!(outcome.final_text, "short answer");
}

#[tokio::test(start_paused = true)]
async fn honors_throttle_retry_after() {
    let sink = RecordingSink::with_plan(vec![Some(SinkError::Throttled {
        retry_after: Some(2),
    })]);
    let engine = DeliveryEngine::new(sink.clone(), test_config(100));

    let started = Instant::now();
    engine
        .deliver(1, delta_stream(&["hi"]), never_cancel())
        .await
        .unwrap();

    assert!(started.elapsed() >= Duration::from_secs(2));
    assert_eq!(sink.calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn terminal_failure_before_any_output_sends_no_notice() {
    let sink = RecordingSink::with_plan(vec![Some(SinkError::Terminal("chat not found".into()))]);
    let engine = DeliveryEngine::new(sink.clone(), test_config(100));

    let error = engine
        .deliver(1, delta_stream(&["hello"]), never_cancel())
        .await
        .unwrap_err();

    assert!(matches!(error, DeliveryError::Sink { delivered: 0, .. }));
    assert_eq!(sink.calls(), 1);
    assert!(sink.operations().is_empty());
}

#[tokio::test(start_paused = true)]
async fn terminal_failure_after_partial_output_appends_notice() {
    // First call (the send) succeeds, second (the edit) fails terminally.
    let sink = RecordingSink::with_plan(vec![
        None,
        Some(SinkError::Terminal("message to edit not found".into())),
    ]);
    let config = test_config(8);
    let notice = config.failure_notice.clone();
    let engine = DeliveryEngine::new(sink.clone(), config);

    let error = engine
        .deliver(1, delta_stream(&["Hel", "lo ", "world"]), never_cancel())
        .await
        .unwrap_err();

    assert!(matches!(error, DeliveryError::Sink { delivered: 8, .. }));
    let ops = sink.operations();
    assert_eq!(ops.len(), 2);
    assert!(matches!(&ops[0], DeliveryOperation::SendNew(text) if text == "Hello wo"));
    assert!(matches!(&ops[1], DeliveryOperation::SendNew(text) if *text == notice));
}

#[tokio::test(start_paused = true)]
async fn source_failure_after_partial_output_appends_notice() {
    let sink = RecordingSink::new();
    let config = test_config(8);
    let notice = config.failure_notice.clone();
    let engine = DeliveryEngine::new(sink.clone(), config);

    let stream: DeltaStream = Box::pin(futures::stream::iter(vec![
        Ok("aaaaaaaaaa".to_string()),
        Err(SourceError("model overloaded".to_string())),
    ]));
    let error = engine.deliver(1, stream, never_cancel()).await.unwrap_err();

    assert!(matches!(error, DeliveryError::Source { delivered: 8, .. }));
    let ops = sink.operations();
    assert_eq!(ops.len(), 2);
    assert!(matches!(&ops[1], DeliveryOperation::SendNew(text) if *text == notice));
}

#[tokio::test(start_paused = true)]
async fn edit_budget_rolls_over_to_new_message() {
    let sink = RecordingSink::new();
    let config = DeliveryConfig {
        max_payload: 4,
        max_edits_per_message: 2,
        edit_interval: Duration::from_millis(100),
        ..DeliveryConfig::default()
    };
    let interval = config.edit_interval;
    let engine = DeliveryEngine::new(sink.clone(), config);

    let outcome = engine
        .deliver(
            1,
            gapped_stream(&["abcdefgh", "ijklmnop", "qrstuvwx"], Duration::from_secs(1)),
            never_cancel(),
        )
        .await
        .unwrap();

    let ops = sink.operations();
    let shapes: Vec<(bool, usize)> = ops
        .iter()
        .map(|op| (matches!(op, DeliveryOperation::SendNew(_)), op_text(op).len()))
        .collect();
    assert_eq!(
        shapes,
        vec![(true, 4), (false, 8), (false, 16), (true, 4), (false, 8)]
    );

    // No message receives more edits than its budget.
    let mut edits_per_message = std::collections::HashMap::new();
    for op in &ops {
        if let DeliveryOperation::EditExisting(message, _) = op {
            *edits_per_message.entry(message.message_id).or_insert(0u32) += 1;
        }
    }
    assert!(edits_per_message.values().all(|count| *count <= 2));

    // The final text of each message, concatenated in creation order,
    // reproduces the full answer.
    let mut final_texts: Vec<(i64, String)> = Vec::new();
    for op in &ops {
        match op {
            DeliveryOperation::SendNew(text) => {
                let id = final_texts.len() as i64 + 1;
                final_texts.push((id, text.clone()));
            }
            DeliveryOperation::EditExisting(message, text) => {
                let slot = final_texts
                    .iter_mut()
                    .find(|(id, _)| *id == message.message_id)
                    .expect("edit targets a sent message");
                slot.1 = text.clone();
            }
        }
    }
    let assembled: String = final_texts.into_iter().map(|(_, text)| text).collect();
    assert_eq!(assembled, "abcdefghijklmnopqrstuvwx");
    assert_eq!(assembled, outcome.final_text);
    assert_eq!(outcome.messages, 2);

    // Every edit respects the pacing interval relative to the previous
    // operation.
    let timestamps = sink.timestamps();
    for (index, op) in ops.iter().enumerate().skip(1) {
        if matches!(op, DeliveryOperation::EditExisting(..)) {
            assert!(timestamps[index] - timestamps[index - 1] >= interval);
        }
    }
}

#[tokio::test(start_paused = true)]
async fn cancellation_stops_all_sink_operations() {
    let sink = RecordingSink::new();
    let engine = Arc::new(DeliveryEngine::new(sink.clone(), test_config(8)));
    let (cancel_tx, cancel_rx) = watch::channel(false);

    let stream: DeltaStream = Box::pin(
        futures::stream::iter(vec![
            Ok("Hel".to_string()),
            Ok("lo ".to_string()),
            Ok("world".to_string()),
        ])
        .chain(futures::stream::pending()),
    );

    let task = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.deliver(1, stream, cancel_rx).await })
    };

    // Let the session drain the ready deltas, then cancel mid-stream.
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(sink.operations().len(), 1);
    cancel_tx.send(true).unwrap();

    let result = task.await.unwrap();
    assert!(matches!(result, Err(DeliveryError::Cancelled(1))));

    // No notice, no further edits: the operation log is frozen.
    assert_eq!(sink.operations().len(), 1);

    // The conversation lock was released; a fresh delivery goes through.
    let outcome = engine.deliver(1, delta_stream(&["again"]), never_cancel()).await;
    assert!(outcome.is_ok());
}

#[tokio::test(start_paused = true)]
async fn rejects_concurrent_delivery_beyond_queue_depth() {
    let sink = RecordingSink::new();
    let config = DeliveryConfig {
        max_queue_depth: 0,
        ..test_config(8)
    };
    let engine = Arc::new(DeliveryEngine::new(sink.clone(), config));
    let (cancel_tx, cancel_rx) = watch::channel(false);

    let blocked: DeltaStream = Box::pin(futures::stream::pending());
    let task = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.deliver(7, blocked, cancel_rx).await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;

    // Same chat: rejected. Different chat: runs independently.
    let busy = engine.deliver(7, delta_stream(&["x"]), never_cancel()).await;
    assert!(matches!(busy, Err(DeliveryError::ConversationBusy(7))));
    let other = engine.deliver(8, delta_stream(&["y"]), never_cancel()).await;
    assert!(other.is_ok());

    cancel_tx.send(true).unwrap();
    let result = task.await.unwrap();
    assert!(matches!(result, Err(DeliveryError::Cancelled(7))));
}

#[tokio::test(start_paused = true)]
async fn queued_delivery_runs_after_the_active_one() {
    let sink = RecordingSink::new();
    let config = DeliveryConfig {
        max_queue_depth: 1,
        ..test_config(100)
    };
    let engine = Arc::new(DeliveryEngine::new(sink.clone(), config));
    let (cancel_tx, cancel_rx) = watch::channel(false);

    let blocked: DeltaStream = Box::pin(futures::stream::pending());
    let first = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.deliver(3, blocked, cancel_rx).await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;

    let second = {
        let engine = engine.clone();
        tokio::spawn(async move {
            engine.deliver(3, delta_stream(&["queued answer"]), never_cancel()).await
        })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;

    // The queued session holds no lock yet and has sent nothing.
    assert!(sink.operations().is_empty());

    cancel_tx.send(true).unwrap();
    assert!(matches!(
        first.await.unwrap(),
        Err(DeliveryError::Cancelled(3))
    ));

    let outcome = second.await.unwrap().unwrap();
    assert_eq!(outcome.final_text, "queued answer");
    let ops = sink.operations();
    assert_eq!(ops.len(), 1);
    assert!(matches!(&ops[0], DeliveryOperation::SendNew(text) if text == "queued answer"));
}

#[tokio::test(start_paused = true)]
async fn multibyte_text_is_delivered_without_loss() {
    let sink = RecordingSink::new();
    let engine = DeliveryEngine::new(sink.clone(), test_config(10));

    let deltas = ["Привет, ", "мир! ", "Это ", "длинный ", "ответ ", "по-русски."];
    let full: String = deltas.concat();
    let outcome = engine
        .deliver(1, gapped_stream(&deltas, Duration::from_millis(500)), never_cancel())
        .await
        .unwrap();
    assert_eq!(outcome.final_text, full);

    let ops = sink.operations();
    for op in &ops {
        if let DeliveryOperation::SendNew(text) = op {
            assert!(text.len() <= 10, "initial chunk exceeds payload ceiling");
        }
    }

    let mut final_texts: Vec<(i64, String)> = Vec::new();
    for op in &ops {
        match op {
            DeliveryOperation::SendNew(text) => {
                let id = final_texts.len() as i64 + 1;
                final_texts.push((id, text.clone()));
            }
            DeliveryOperation::EditExisting(message, text) => {
                let slot = final_texts
                    .iter_mut()
                    .find(|(id, _)| *id == message.message_id)
                    .expect("edit targets a sent message");
                slot.1 = text.clone();
            }
        }
    }
    let assembled: String = final_texts.into_iter().map(|(_, text)| text).collect();
    assert_eq!(assembled, full);
}
