//! Outbound debounce queues.
//!
//! Incremental updates (streamed text above all) arrive far faster than
//! the other side needs them. Each message kind gets a trailing-edge
//! debounce queue: every arrival extends the timer, and batchable kinds
//! merge their buffered payloads into one outbound message on flush.
//! Nothing is dropped — every enqueued message carries a completion
//! receipt that resolves once its flush finishes, even when the send
//! itself fails.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::oneshot;

use crate::clock::Clock;
use crate::config::DebounceConfig;
use crate::protocol::WireMessage;

/// Outbound channel seam. One bad send never halts the pipeline — the
/// debouncer logs the error and keeps flushing subsequent batches.
#[async_trait]
pub trait OutboundSink: Send + Sync {
    async fn send(&self, message: WireMessage) -> anyhow::Result<()>;
}

// ── Policy ──────────────────────────────────────────────────────

/// How buffered payloads of one kind are merged on a batch flush.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum MergeStrategy {
    /// Concatenate the string under `field` across payloads; lossless for
    /// incremental text kinds.
    Concat { field: String },
    /// Wrap the payload array as one `{kind}/batch` message with start and
    /// end timestamps.
    #[default]
    Wrap,
}

/// Per-kind debounce policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DebouncePolicy {
    /// Trailing-edge delay; 0 bypasses buffering entirely.
    pub debounce_ms: u64,
    /// Whether multiple buffered messages may merge into one send.
    pub batchable: bool,
    /// A batchable queue flushes immediately at this size, overriding the
    /// trailing-edge delay.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_batch_size: Option<usize>,
    /// Serialize flushes of this kind so sends leave in arrival order.
    pub preserve_order: bool,
    pub merge: MergeStrategy,
}

impl Default for DebouncePolicy {
    fn default() -> Self {
        Self {
            debounce_ms: 100,
            batchable: false,
            max_batch_size: None,
            preserve_order: true,
            merge: MergeStrategy::Wrap,
        }
    }
}

// ── Receipts ────────────────────────────────────────────────────

/// Resolves once the enqueued message's flush has finished. Dropping the
/// receipt is fine — delivery does not depend on anyone waiting.
#[derive(Debug)]
pub struct FlushReceipt(oneshot::Receiver<()>);

impl FlushReceipt {
    /// Wait for the flush. Returns immediately if it already happened.
    pub async fn wait(self) {
        let _ = self.0.await;
    }
}

struct Buffered {
    payload: Option<Value>,
    timestamp: u64,
    receipt: oneshot::Sender<()>,
}

#[derive(Default)]
struct QueueState {
    buffer: Vec<Buffered>,
    /// Bumped on every arrival and every flush; a sleeping timer task
    /// only flushes when its generation is still current.
    generation: u64,
}

struct DebouncerInner {
    sink: Arc<dyn OutboundSink>,
    clock: Arc<dyn Clock>,
    default_policy: DebouncePolicy,
    policies: HashMap<String, DebouncePolicy>,
    queues: Mutex<HashMap<String, QueueState>>,
    send_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    shut_down: AtomicBool,
}

/// Per-kind trailing-edge debounce in front of the outbound channel.
pub struct Debouncer {
    inner: Arc<DebouncerInner>,
}

impl Debouncer {
    pub fn new(config: &DebounceConfig, sink: Arc<dyn OutboundSink>, clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Arc::new(DebouncerInner {
                sink,
                clock,
                default_policy: config.default.clone(),
                policies: config.kinds.clone(),
                queues: Mutex::new(HashMap::new()),
                send_locks: Mutex::new(HashMap::new()),
                shut_down: AtomicBool::new(false),
            }),
        }
    }

    /// The effective policy for a kind.
    pub fn policy_for(&self, kind: &str) -> &DebouncePolicy {
        self.inner
            .policies
            .get(kind)
            .unwrap_or(&self.inner.default_policy)
    }

    /// Buffer a message for debounced delivery. Returns `None` after
    /// shutdown — the message is dropped with a logged warning and no
    /// receipt is created.
    pub fn enqueue(&self, kind: &str, payload: Option<Value>) -> Option<FlushReceipt> {
        self.enqueue_inner(kind, payload, false)
    }

    /// Send right away, bypassing the buffer. Messages already buffered
    /// for the kind stay buffered.
    pub fn enqueue_immediate(&self, kind: &str, payload: Option<Value>) -> Option<FlushReceipt> {
        self.enqueue_inner(kind, payload, true)
    }

    fn enqueue_inner(
        &self,
        kind: &str,
        payload: Option<Value>,
        immediate: bool,
    ) -> Option<FlushReceipt> {
        if self.inner.shut_down.load(Ordering::Relaxed) {
            tracing::warn!(kind, "enqueue after shutdown — message dropped");
            return None;
        }

        let policy = self.policy_for(kind).clone();
        let (tx, rx) = oneshot::channel();
        let buffered = Buffered {
            payload,
            timestamp: self.inner.clock.now_ms(),
            receipt: tx,
        };

        if immediate || policy.debounce_ms == 0 {
            let inner = self.inner.clone();
            let kind = kind.to_string();
            tokio::spawn(async move {
                inner.deliver(&kind, vec![buffered], &policy).await;
            });
            return Some(FlushReceipt(rx));
        }

        let generation = {
            let mut queues = self.inner.queues.lock();
            let queue = queues.entry(kind.to_string()).or_default();
            queue.buffer.push(buffered);
            queue.generation += 1;

            let at_capacity = policy.batchable
                && policy
                    .max_batch_size
                    .is_some_and(|max| queue.buffer.len() >= max);
            if at_capacity {
                // Capacity ceiling beats the trailing-edge delay.
                let batch = std::mem::take(&mut queue.buffer);
                queue.generation += 1;
                drop(queues);
                let inner = self.inner.clone();
                let kind = kind.to_string();
                tokio::spawn(async move {
                    inner.deliver(&kind, batch, &policy).await;
                });
                return Some(FlushReceipt(rx));
            }
            queue.generation
        };

        let inner = self.inner.clone();
        let kind = kind.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(policy.debounce_ms)).await;
            let batch = {
                let mut queues = inner.queues.lock();
                match queues.get_mut(&kind) {
                    // A newer arrival or an explicit flush superseded this
                    // timer.
                    Some(queue) if queue.generation == generation && !queue.buffer.is_empty() => {
                        queue.generation += 1;
                        std::mem::take(&mut queue.buffer)
                    }
                    _ => return,
                }
            };
            inner.deliver(&kind, batch, &policy).await;
        });

        Some(FlushReceipt(rx))
    }

    /// Force-flush the given kinds, awaiting their sends.
    pub async fn flush_kinds(&self, kinds: &[&str]) {
        for kind in kinds {
            let batch = {
                let mut queues = self.inner.queues.lock();
                match queues.get_mut(*kind) {
                    Some(queue) if !queue.buffer.is_empty() => {
                        queue.generation += 1;
                        std::mem::take(&mut queue.buffer)
                    }
                    _ => continue,
                }
            };
            let policy = self.policy_for(kind).clone();
            self.inner.deliver(kind, batch, &policy).await;
        }
    }

    /// Force-flush every pending queue (shutdown or explicit barrier).
    pub async fn flush_all(&self) {
        let kinds: Vec<String> = {
            let queues = self.inner.queues.lock();
            queues
                .iter()
                .filter(|(_, q)| !q.buffer.is_empty())
                .map(|(k, _)| k.clone())
                .collect()
        };
        let refs: Vec<&str> = kinds.iter().map(String::as_str).collect();
        self.flush_kinds(&refs).await;
    }

    /// Discard all pending buffers without sending. Receipts still
    /// resolve — a caller is never left hanging.
    pub fn clear(&self) {
        let mut queues = self.inner.queues.lock();
        let mut dropped = 0usize;
        for queue in queues.values_mut() {
            queue.generation += 1;
            for buffered in queue.buffer.drain(..) {
                let _ = buffered.receipt.send(());
                dropped += 1;
            }
        }
        if dropped > 0 {
            tracing::debug!(dropped, "cleared pending debounce buffers");
        }
    }

    /// Flush everything, then refuse further enqueues permanently.
    pub async fn shutdown(&self) {
        self.inner.shut_down.store(true, Ordering::Relaxed);
        self.flush_all().await;
        tracing::debug!("debouncer shut down");
    }

    /// Total buffered messages across all kinds.
    pub fn pending_count(&self) -> usize {
        self.inner
            .queues
            .lock()
            .values()
            .map(|q| q.buffer.len())
            .sum()
    }
}

impl DebouncerInner {
    async fn deliver(&self, kind: &str, batch: Vec<Buffered>, policy: &DebouncePolicy) {
        let _order_guard = if policy.preserve_order {
            let lock = {
                let mut locks = self.send_locks.lock();
                locks
                    .entry(kind.to_string())
                    .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                    .clone()
            };
            Some(lock.lock_owned().await)
        } else {
            None
        };

        if !policy.batchable || batch.len() == 1 {
            for buffered in batch {
                let message = WireMessage::new(kind, buffered.payload);
                if let Err(error) = self.sink.send(message).await {
                    tracing::warn!(kind, error = %error, "outbound send failed");
                }
                let _ = buffered.receipt.send(());
            }
            return;
        }

        let (message, receipts) = merge_batch(kind, batch, &policy.merge);
        if let Err(error) = self.sink.send(message).await {
            tracing::warn!(kind, error = %error, "outbound batch send failed");
        }
        for receipt in receipts {
            let _ = receipt.send(());
        }
    }
}

/// Merge a multi-message batch into one outbound message.
fn merge_batch(
    kind: &str,
    batch: Vec<Buffered>,
    strategy: &MergeStrategy,
) -> (WireMessage, Vec<oneshot::Sender<()>>) {
    let batch_count = batch.len();

    if let MergeStrategy::Concat { field } = strategy {
        let concatenable = batch
            .iter()
            .all(|b| b.payload.as_ref().and_then(|p| p.get(field)).map(Value::is_string)
                == Some(true));
        if concatenable {
            let mut text = String::new();
            let mut receipts = Vec::with_capacity(batch_count);
            for buffered in batch {
                if let Some(fragment) = buffered
                    .payload
                    .as_ref()
                    .and_then(|p| p.get(field))
                    .and_then(Value::as_str)
                {
                    text.push_str(fragment);
                }
                receipts.push(buffered.receipt);
            }
            let mut payload = serde_json::Map::new();
            payload.insert(field.clone(), Value::String(text));
            payload.insert("is_batched".into(), Value::Bool(true));
            payload.insert("batch_count".into(), json!(batch_count));
            return (
                WireMessage::new(kind, Some(Value::Object(payload))),
                receipts,
            );
        }
        // Shape mismatch: concatenation would be lossy, wrap instead.
        tracing::debug!(kind, field = %field, "concat merge shape mismatch, wrapping batch");
        return merge_wrap(kind, batch);
    }

    merge_wrap(kind, batch)
}

fn merge_wrap(kind: &str, batch: Vec<Buffered>) -> (WireMessage, Vec<oneshot::Sender<()>>) {
    let batch_count = batch.len();
    let batch_start = batch.first().map(|b| b.timestamp).unwrap_or(0);
    let batch_end = batch.last().map(|b| b.timestamp).unwrap_or(0);

    let mut items = Vec::with_capacity(batch_count);
    let mut receipts = Vec::with_capacity(batch_count);
    for buffered in batch {
        items.push(buffered.payload.unwrap_or(Value::Null));
        receipts.push(buffered.receipt);
    }

    let payload = json!({
        "items": items,
        "batch_count": batch_count,
        "batch_start": batch_start,
        "batch_end": batch_end,
    });
    (
        WireMessage::new(format!("{kind}/batch"), Some(payload)),
        receipts,
    )
}

// ── Tests ───────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::protocol::kinds;
    use parking_lot::Mutex as PlMutex;

    #[derive(Default)]
    struct RecordingSink {
        sent: PlMutex<Vec<WireMessage>>,
    }

    impl RecordingSink {
        fn messages(&self) -> Vec<WireMessage> {
            self.sent.lock().clone()
        }
    }

    #[async_trait]
    impl OutboundSink for RecordingSink {
        async fn send(&self, message: WireMessage) -> anyhow::Result<()> {
            self.sent.lock().push(message);
            Ok(())
        }
    }

    struct FailingSink;

    #[async_trait]
    impl OutboundSink for FailingSink {
        async fn send(&self, _message: WireMessage) -> anyhow::Result<()> {
            anyhow::bail!("channel closed")
        }
    }

    fn delta_config() -> DebounceConfig {
        let mut config = DebounceConfig::default();
        config.kinds.insert(
            kinds::THINKING_DELTA.to_string(),
            DebouncePolicy {
                debounce_ms: 100,
                batchable: true,
                max_batch_size: Some(10),
                preserve_order: true,
                merge: MergeStrategy::Concat {
                    field: "content".into(),
                },
            },
        );
        config
    }

    fn make_debouncer(config: DebounceConfig, sink: Arc<dyn OutboundSink>) -> Debouncer {
        Debouncer::new(&config, sink, Arc::new(ManualClock::new(1_000)))
    }

    #[tokio::test(start_paused = true)]
    async fn streamed_fragments_coalesce_into_one_message() {
        let sink = Arc::new(RecordingSink::default());
        let debouncer = make_debouncer(delta_config(), sink.clone());

        let receipts: Vec<_> = ["Hel", "lo", "!"]
            .iter()
            .map(|fragment| {
                debouncer
                    .enqueue(kinds::THINKING_DELTA, Some(json!({ "content": fragment })))
                    .expect("accepting enqueues")
            })
            .collect();

        for receipt in receipts {
            receipt.wait().await;
        }

        let sent = sink.messages();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].kind, kinds::THINKING_DELTA);
        let payload = sent[0].payload.as_ref().unwrap();
        assert_eq!(payload["content"], "Hello!");
        assert_eq!(payload["is_batched"], true);
        assert_eq!(payload["batch_count"], 3);
    }

    #[tokio::test(start_paused = true)]
    async fn batch_capacity_flushes_without_waiting() {
        let sink = Arc::new(RecordingSink::default());
        let debouncer = make_debouncer(delta_config(), sink.clone());

        let receipts: Vec<_> = (0..10)
            .map(|i| {
                debouncer
                    .enqueue(kinds::THINKING_DELTA, Some(json!({ "content": format!("f{i}") })))
                    .unwrap()
            })
            .collect();

        for receipt in receipts {
            receipt.wait().await;
        }

        let sent = sink.messages();
        assert_eq!(sent.len(), 1);
        let payload = sent[0].payload.as_ref().unwrap();
        assert_eq!(payload["batch_count"], 10);
        assert_eq!(payload["content"], "f0f1f2f3f4f5f6f7f8f9");
    }

    #[tokio::test(start_paused = true)]
    async fn non_batchable_kinds_fan_out_individually_in_order() {
        let sink = Arc::new(RecordingSink::default());
        let debouncer = make_debouncer(DebounceConfig::default(), sink.clone());

        let receipts: Vec<_> = (0..5)
            .map(|i| {
                debouncer
                    .enqueue(kinds::SESSION_UPDATE, Some(json!({ "revision": i })))
                    .unwrap()
            })
            .collect();

        for receipt in receipts {
            receipt.wait().await;
        }

        let sent = sink.messages();
        assert_eq!(sent.len(), 5);
        for (i, message) in sent.iter().enumerate() {
            assert_eq!(message.kind, kinds::SESSION_UPDATE);
            assert_eq!(message.payload.as_ref().unwrap()["revision"], i);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn trailing_edge_extends_on_every_arrival() {
        let sink = Arc::new(RecordingSink::default());
        let mut config = DebounceConfig::default();
        config.kinds.insert(
            "burst".into(),
            DebouncePolicy {
                debounce_ms: 100,
                batchable: true,
                max_batch_size: None,
                preserve_order: true,
                merge: MergeStrategy::Wrap,
            },
        );
        let debouncer = make_debouncer(config, sink.clone());

        let first = debouncer.enqueue("burst", Some(json!(1))).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        // Second arrival before the first timer fires: the pending flush
        // is superseded and both messages leave together.
        let second = debouncer.enqueue("burst", Some(json!(2))).unwrap();

        first.wait().await;
        second.wait().await;

        let sent = sink.messages();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].kind, "burst/batch");
        let payload = sent[0].payload.as_ref().unwrap();
        assert_eq!(payload["batch_count"], 2);
        assert_eq!(payload["items"][0], 1);
        assert_eq!(payload["items"][1], 2);
    }

    #[tokio::test(start_paused = true)]
    async fn generic_batches_carry_timestamps() {
        let sink = Arc::new(RecordingSink::default());
        let clock = Arc::new(ManualClock::new(5_000));
        let mut config = DebounceConfig::default();
        config.kinds.insert(
            "metrics".into(),
            DebouncePolicy {
                debounce_ms: 50,
                batchable: true,
                ..DebouncePolicy::default()
            },
        );
        let debouncer = Debouncer::new(&config, sink.clone(), clock.clone());

        let a = debouncer.enqueue("metrics", Some(json!({"v": 1}))).unwrap();
        clock.advance(20);
        let b = debouncer.enqueue("metrics", Some(json!({"v": 2}))).unwrap();
        a.wait().await;
        b.wait().await;

        let sent = sink.messages();
        assert_eq!(sent.len(), 1);
        let payload = sent[0].payload.as_ref().unwrap();
        assert_eq!(payload["batch_start"], 5_000);
        assert_eq!(payload["batch_end"], 5_020);
    }

    #[tokio::test(start_paused = true)]
    async fn immediate_bypasses_buffering() {
        let sink = Arc::new(RecordingSink::default());
        let debouncer = make_debouncer(delta_config(), sink.clone());

        let buffered = debouncer
            .enqueue(kinds::THINKING_DELTA, Some(json!({"content": "later"})))
            .unwrap();
        let urgent = debouncer
            .enqueue_immediate(kinds::THINKING_DELTA, Some(json!({"content": "now"})))
            .unwrap();

        urgent.wait().await;
        assert_eq!(sink.messages().len(), 1);
        assert_eq!(
            sink.messages()[0].payload.as_ref().unwrap()["content"],
            "now"
        );

        buffered.wait().await;
        assert_eq!(sink.messages().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn zero_delay_policy_sends_straight_through() {
        let sink = Arc::new(RecordingSink::default());
        let mut config = DebounceConfig::default();
        config.kinds.insert(
            "urgent".into(),
            DebouncePolicy {
                debounce_ms: 0,
                ..DebouncePolicy::default()
            },
        );
        let debouncer = make_debouncer(config, sink.clone());

        debouncer
            .enqueue("urgent", Some(json!(1)))
            .unwrap()
            .wait()
            .await;
        assert_eq!(sink.messages().len(), 1);
        assert_eq!(debouncer.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn flush_all_forces_pending_sends() {
        let sink = Arc::new(RecordingSink::default());
        let debouncer = make_debouncer(DebounceConfig::default(), sink.clone());

        let a = debouncer.enqueue("kind_a", Some(json!(1))).unwrap();
        let b = debouncer.enqueue("kind_b", Some(json!(2))).unwrap();
        assert_eq!(debouncer.pending_count(), 2);

        debouncer.flush_all().await;
        a.wait().await;
        b.wait().await;

        assert_eq!(sink.messages().len(), 2);
        assert_eq!(debouncer.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn clear_discards_but_resolves_receipts() {
        let sink = Arc::new(RecordingSink::default());
        let debouncer = make_debouncer(DebounceConfig::default(), sink.clone());

        let receipt = debouncer.enqueue("kind_a", Some(json!(1))).unwrap();
        debouncer.clear();

        // The receipt resolves even though nothing was sent.
        receipt.wait().await;
        assert!(sink.messages().is_empty());

        // The superseded timer must not resurrect the cleared buffer.
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(sink.messages().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_flushes_then_drops_new_messages() {
        let sink = Arc::new(RecordingSink::default());
        let debouncer = make_debouncer(DebounceConfig::default(), sink.clone());

        let pending = debouncer.enqueue("kind_a", Some(json!(1))).unwrap();
        debouncer.shutdown().await;
        pending.wait().await;
        assert_eq!(sink.messages().len(), 1);

        // Post-shutdown submissions are dropped without a receipt.
        assert!(debouncer.enqueue("kind_a", Some(json!(2))).is_none());
        assert!(debouncer
            .enqueue_immediate("kind_a", Some(json!(3)))
            .is_none());
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(sink.messages().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn send_failure_still_resolves_receipts() {
        let debouncer = make_debouncer(DebounceConfig::default(), Arc::new(FailingSink));

        let receipt = debouncer
            .enqueue_immediate("kind_a", Some(json!(1)))
            .unwrap();
        // Must not hang even though the sink errored.
        receipt.wait().await;

        // The pipeline keeps processing after a failure.
        let next = debouncer.enqueue("kind_a", Some(json!(2))).unwrap();
        next.wait().await;
    }

    #[tokio::test(start_paused = true)]
    async fn concat_falls_back_to_wrap_on_shape_mismatch() {
        let sink = Arc::new(RecordingSink::default());
        let debouncer = make_debouncer(delta_config(), sink.clone());

        let a = debouncer
            .enqueue(kinds::THINKING_DELTA, Some(json!({"content": "text"})))
            .unwrap();
        let b = debouncer
            .enqueue(kinds::THINKING_DELTA, Some(json!({"levels": [1, 2]})))
            .unwrap();
        a.wait().await;
        b.wait().await;

        let sent = sink.messages();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].kind, format!("{}/batch", kinds::THINKING_DELTA));
        assert_eq!(sent[0].payload.as_ref().unwrap()["batch_count"], 2);
    }

    #[test]
    fn policy_defaults_match_documented_values() {
        let policy = DebouncePolicy::default();
        assert_eq!(policy.debounce_ms, 100);
        assert!(!policy.batchable);
        assert!(policy.max_batch_size.is_none());
        assert!(policy.preserve_order);
        assert_eq!(policy.merge, MergeStrategy::Wrap);
    }
}
