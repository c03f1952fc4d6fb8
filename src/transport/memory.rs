//! In-memory broker for tests and single-process development
//!
//! Implements both [`CoreTransport`] and [`DurableTransport`]:
//! - Core subjects with `*`/`>` wildcards and round-robin queue groups
//! - Work-queue streams with a dedup window keyed on the message ID
//! - Durable consumers shared by every `consume` call on the same name
//! - Redelivery on nak or ack-wait expiry, bounded by max-deliver; settling a
//!   delivery cancels its ack-wait timer
//!
//! ```
//! use nats_streambus::transport::{memory::MemoryBroker, DurableTransport, Envelope, StreamSpec};
//! use nats_streambus::config::StreamPolicy;
//! use bytes::Bytes;
//!
//! # tokio_test_block_on(async {
//! let broker = MemoryBroker::new();
//! let stream = StreamSpec::new("REWARDS", vec!["kit.>".to_string()], &StreamPolicy::default());
//! broker.ensure_stream(&stream).await.unwrap();
//!
//! let envelope = Envelope::deduplicated("kit.granted", Bytes::from_static(b"{}"));
//! broker.publish(envelope.clone()).await.unwrap();
//! broker.publish(envelope).await.unwrap();
//!
//! assert_eq!(broker.stored_count("REWARDS"), 1);
//! # });
//! # fn tokio_test_block_on<F: std::future::Future>(f: F) -> F::Output {
//! #     tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(f)
//! # }
//! ```

use super::{
    subject_matches, Acknowledger, ConsumerSpec, CoreMessage, CoreSubscription, CoreTransport,
    Delivery, DeliveryStream, DurableTransport, Envelope, StreamSpec,
};
use crate::error::{MessagingError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;
use tokio::sync::{mpsc, Notify};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::sync::CancellationToken;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// In-memory broker
#[derive(Clone, Default)]
pub struct MemoryBroker {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    core: Mutex<CoreState>,
    durable: Mutex<DurableState>,
    ack_timers: AtomicUsize,
}

#[derive(Default)]
struct CoreState {
    subscriptions: Vec<CoreSub>,
    round_robin: usize,
}

struct CoreSub {
    subject: String,
    group: Option<String>,
    sender: mpsc::UnboundedSender<CoreMessage>,
}

#[derive(Default)]
struct DurableState {
    streams: HashMap<String, MemStream>,
    consumers: HashMap<(String, String), Arc<MemConsumer>>,
}

struct MemStream {
    spec: StreamSpec,
    messages: BTreeMap<u64, StoredMessage>,
    seen_ids: HashMap<String, Instant>,
    unique_ids: Vec<String>,
    duplicates: usize,
    next_seq: u64,
}

#[derive(Clone)]
struct StoredMessage {
    seq: u64,
    subject: String,
    payload: Bytes,
}

struct MemConsumer {
    spec: ConsumerSpec,
    queue: Mutex<VecDeque<Pending>>,
    notify: Notify,
}

#[derive(Clone)]
struct Pending {
    message: StoredMessage,
    deliveries: i64,
}

impl MemConsumer {
    fn push(&self, pending: Pending) {
        lock(&self.queue).push_back(pending);
        self.notify.notify_one();
    }

    async fn next_pending(&self) -> Pending {
        loop {
            let popped = lock(&self.queue).pop_front();
            if let Some(pending) = popped {
                return pending;
            }
            self.notify.notified().await;
        }
    }
}

impl MemoryBroker {
    /// Create an empty broker
    pub fn new() -> Self {
        Self::default()
    }

    /// Messages currently stored in a stream (published and not yet acked)
    pub fn stored_count(&self, stream: &str) -> usize {
        lock(&self.inner.durable)
            .streams
            .get(stream)
            .map(|s| s.messages.len())
            .unwrap_or(0)
    }

    /// Distinct message IDs ever accepted by a stream, in arrival order
    pub fn unique_message_ids(&self, stream: &str) -> Vec<String> {
        lock(&self.inner.durable)
            .streams
            .get(stream)
            .map(|s| s.unique_ids.clone())
            .unwrap_or_default()
    }

    /// Publishes discarded as duplicates by a stream
    pub fn duplicates_suppressed(&self, stream: &str) -> usize {
        lock(&self.inner.durable)
            .streams
            .get(stream)
            .map(|s| s.duplicates)
            .unwrap_or(0)
    }

    /// Whether a stream has been created
    pub fn has_stream(&self, stream: &str) -> bool {
        lock(&self.inner.durable).streams.contains_key(stream)
    }

    /// Whether a consumer has been created
    pub fn has_consumer(&self, stream: &str, consumer: &str) -> bool {
        lock(&self.inner.durable)
            .consumers
            .contains_key(&(stream.to_string(), consumer.to_string()))
    }

    /// Ack-wait timers still running for unsettled deliveries
    pub fn pending_ack_timers(&self) -> usize {
        self.inner.ack_timers.load(Ordering::SeqCst)
    }

    /// Live core-bus subscriptions on a subject pattern
    pub fn core_subscribers(&self, subject: &str) -> usize {
        let mut core = lock(&self.inner.core);
        core.subscriptions.retain(|s| !s.sender.is_closed());
        core.subscriptions
            .iter()
            .filter(|s| s.subject == subject)
            .count()
    }

    /// Live core-bus subscriptions across all subjects
    pub fn core_subscription_count(&self) -> usize {
        let mut core = lock(&self.inner.core);
        core.subscriptions.retain(|s| !s.sender.is_closed());
        core.subscriptions.len()
    }

    fn add_core_subscription(&self, subject: &str, group: Option<&str>) -> CoreSubscription {
        let (sender, receiver) = mpsc::unbounded_channel();
        lock(&self.inner.core).subscriptions.push(CoreSub {
            subject: subject.to_string(),
            group: group.map(str::to_string),
            sender,
        });
        UnboundedReceiverStream::new(receiver).boxed()
    }

    fn route_core(&self, message: CoreMessage) {
        let mut core = lock(&self.inner.core);
        core.subscriptions.retain(|s| !s.sender.is_closed());

        let mut groups: BTreeMap<String, Vec<usize>> = BTreeMap::new();
        let mut targets = Vec::new();
        for (index, sub) in core.subscriptions.iter().enumerate() {
            if !subject_matches(&sub.subject, &message.subject) {
                continue;
            }
            match &sub.group {
                Some(group) => groups.entry(group.clone()).or_default().push(index),
                None => targets.push(index),
            }
        }

        let pick = core.round_robin;
        core.round_robin = core.round_robin.wrapping_add(1);
        for members in groups.values() {
            targets.push(members[pick % members.len()]);
        }

        for index in targets {
            let _ = core.subscriptions[index].sender.send(message.clone());
        }
    }

    fn settle_ack(inner: &Inner, consumer: &MemConsumer, seq: u64) {
        let mut durable = lock(&inner.durable);
        if let Some(stream) = durable.streams.get_mut(&consumer.spec.stream) {
            stream.messages.remove(&seq);
        }
    }

    fn settle_retry(inner: &Inner, consumer: &MemConsumer, pending: Pending) {
        if pending.deliveries < consumer.spec.max_deliver {
            consumer.push(pending);
            return;
        }

        tracing::warn!(
            consumer = %consumer.spec.consumer_name(),
            subject = %pending.message.subject,
            deliveries = pending.deliveries,
            "Max deliveries reached, dropping message"
        );
        Self::settle_ack(inner, consumer, pending.message.seq);
    }

    fn deliver(inner: Arc<Inner>, consumer: Arc<MemConsumer>, mut pending: Pending) -> Delivery {
        pending.deliveries += 1;
        let settled = Arc::new(AtomicBool::new(false));
        let timer = CancellationToken::new();

        let ack_wait = consumer.spec.ack_wait;
        inner.ack_timers.fetch_add(1, Ordering::SeqCst);
        let expiry = {
            let inner = Arc::clone(&inner);
            let consumer = Arc::clone(&consumer);
            let settled = Arc::clone(&settled);
            let timer = timer.clone();
            let pending = pending.clone();
            async move {
                tokio::select! {
                    _ = timer.cancelled() => {}
                    _ = tokio::time::sleep(ack_wait) => {
                        if !settled.swap(true, Ordering::SeqCst) {
                            Self::settle_retry(&inner, &consumer, pending);
                        }
                    }
                }
                inner.ack_timers.fetch_sub(1, Ordering::SeqCst);
            }
        };
        tokio::spawn(expiry);

        Delivery::new(
            pending.message.subject.clone(),
            pending.message.payload.clone(),
            pending.deliveries,
            Box::new(MemoryAcker {
                inner,
                consumer,
                pending,
                settled,
                timer,
            }),
        )
    }
}

struct MemoryAcker {
    inner: Arc<Inner>,
    consumer: Arc<MemConsumer>,
    pending: Pending,
    settled: Arc<AtomicBool>,
    timer: CancellationToken,
}

#[async_trait]
impl Acknowledger for MemoryAcker {
    async fn ack(&self) -> Result<()> {
        if !self.settled.swap(true, Ordering::SeqCst) {
            self.timer.cancel();
            MemoryBroker::settle_ack(&self.inner, &self.consumer, self.pending.message.seq);
        }
        Ok(())
    }

    async fn nak(&self) -> Result<()> {
        if !self.settled.swap(true, Ordering::SeqCst) {
            self.timer.cancel();
            MemoryBroker::settle_retry(&self.inner, &self.consumer, self.pending.clone());
        }
        Ok(())
    }
}

#[async_trait]
impl CoreTransport for MemoryBroker {
    async fn publish(&self, subject: &str, payload: Bytes) -> Result<()> {
        self.route_core(CoreMessage {
            subject: subject.to_string(),
            reply: None,
            payload,
        });
        Ok(())
    }

    async fn publish_with_reply(&self, subject: &str, reply: &str, payload: Bytes) -> Result<()> {
        self.route_core(CoreMessage {
            subject: subject.to_string(),
            reply: Some(reply.to_string()),
            payload,
        });
        Ok(())
    }

    async fn subscribe(&self, subject: &str) -> Result<CoreSubscription> {
        Ok(self.add_core_subscription(subject, None))
    }

    async fn queue_subscribe(&self, subject: &str, group: &str) -> Result<CoreSubscription> {
        Ok(self.add_core_subscription(subject, Some(group)))
    }

    fn new_inbox(&self) -> String {
        format!("_INBOX.{}", uuid::Uuid::new_v4().simple())
    }
}

#[async_trait]
impl DurableTransport for MemoryBroker {
    async fn ensure_stream(&self, spec: &StreamSpec) -> Result<()> {
        let mut durable = lock(&self.inner.durable);
        durable
            .streams
            .entry(spec.name.clone())
            .or_insert_with(|| MemStream {
                spec: spec.clone(),
                messages: BTreeMap::new(),
                seen_ids: HashMap::new(),
                unique_ids: Vec::new(),
                duplicates: 0,
                next_seq: 1,
            });
        Ok(())
    }

    async fn ensure_consumer(&self, spec: &ConsumerSpec) -> Result<()> {
        let mut durable = lock(&self.inner.durable);
        let key = (spec.stream.clone(), spec.consumer_name());
        if durable.consumers.contains_key(&key) {
            return Ok(());
        }

        let stream = durable.streams.get(&spec.stream).ok_or_else(|| {
            MessagingError::Provisioning(format!("Stream '{}' not found", spec.stream))
        })?;

        let backlog: VecDeque<Pending> = stream
            .messages
            .values()
            .filter(|m| subject_matches(&spec.filter_subject, &m.subject))
            .map(|m| Pending {
                message: m.clone(),
                deliveries: 0,
            })
            .collect();

        let consumer = Arc::new(MemConsumer {
            spec: spec.clone(),
            queue: Mutex::new(backlog),
            notify: Notify::new(),
        });
        durable.consumers.insert(key, consumer);
        Ok(())
    }

    async fn publish(&self, envelope: Envelope) -> Result<()> {
        let mut durable = lock(&self.inner.durable);
        let DurableState { streams, consumers } = &mut *durable;

        let stream = streams
            .values_mut()
            .find(|s| s.spec.subjects.iter().any(|p| subject_matches(p, &envelope.subject)))
            .ok_or_else(|| {
                MessagingError::Publish(format!("No stream captures subject '{}'", envelope.subject))
            })?;

        if let Some(key) = &envelope.dedup_key {
            let window = stream.spec.duplicate_window;
            let now = Instant::now();
            stream.seen_ids.retain(|_, seen| now.duration_since(*seen) < window);
            if stream.seen_ids.contains_key(key) {
                stream.duplicates += 1;
                return Ok(());
            }
            stream.seen_ids.insert(key.clone(), now);
            stream.unique_ids.push(key.clone());
        }

        let message = StoredMessage {
            seq: stream.next_seq,
            subject: envelope.subject,
            payload: envelope.payload,
        };
        stream.next_seq += 1;
        stream.messages.insert(message.seq, message.clone());

        for ((stream_name, _), consumer) in consumers.iter() {
            if *stream_name == stream.spec.name
                && subject_matches(&consumer.spec.filter_subject, &message.subject)
            {
                consumer.push(Pending {
                    message: message.clone(),
                    deliveries: 0,
                });
            }
        }

        Ok(())
    }

    async fn consume(&self, spec: &ConsumerSpec) -> Result<DeliveryStream> {
        let consumer = lock(&self.inner.durable)
            .consumers
            .get(&(spec.stream.clone(), spec.consumer_name()))
            .cloned()
            .ok_or_else(|| {
                MessagingError::Subscribe(format!("Consumer '{}' not found", spec.consumer_name()))
            })?;

        let inner = Arc::clone(&self.inner);
        let deliveries = futures::stream::unfold((inner, consumer), |(inner, consumer)| async move {
            let pending = consumer.next_pending().await;
            let delivery = MemoryBroker::deliver(Arc::clone(&inner), Arc::clone(&consumer), pending);
            Some((Ok(delivery), (inner, consumer)))
        });

        Ok(deliveries.boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConsumerPolicy, StreamPolicy};
    use std::time::Duration;

    fn stream() -> StreamSpec {
        StreamSpec::new("REWARDS", vec!["kit.>".to_string()], &StreamPolicy::default())
    }

    fn consumer(group: Option<&str>) -> ConsumerSpec {
        ConsumerSpec::new(
            "REWARDS",
            "grant-kit",
            "kit.granted",
            group.map(str::to_string),
            &ConsumerPolicy {
                ack_wait: Duration::from_secs(30),
                max_deliver: 3,
            },
        )
    }

    async fn provisioned(group: Option<&str>) -> MemoryBroker {
        let broker = MemoryBroker::new();
        broker.ensure_stream(&stream()).await.unwrap();
        broker.ensure_consumer(&consumer(group)).await.unwrap();
        broker
    }

    #[tokio::test]
    async fn test_dedup_by_message_id() {
        let broker = provisioned(None).await;
        let envelope = Envelope::deduplicated("kit.granted", Bytes::from_static(b"{\"kit\":1}"));

        DurableTransport::publish(&broker, envelope.clone()).await.unwrap();
        DurableTransport::publish(&broker, envelope).await.unwrap();

        assert_eq!(broker.stored_count("REWARDS"), 1);
        assert_eq!(broker.unique_message_ids("REWARDS").len(), 1);
        assert_eq!(broker.duplicates_suppressed("REWARDS"), 1);
    }

    #[tokio::test]
    async fn test_publish_without_stream_fails() {
        let broker = MemoryBroker::new();
        let result =
            DurableTransport::publish(&broker, Envelope::new("kit.granted", Bytes::new())).await;
        assert!(matches!(result, Err(MessagingError::Publish(_))));
    }

    #[tokio::test]
    async fn test_consumer_requires_stream() {
        let broker = MemoryBroker::new();
        let result = broker.ensure_consumer(&consumer(None)).await;
        assert!(matches!(result, Err(MessagingError::Provisioning(_))));
    }

    #[tokio::test]
    async fn test_ack_removes_message() {
        let broker = provisioned(None).await;
        DurableTransport::publish(&broker, Envelope::new("kit.granted", Bytes::from_static(b"a")))
            .await
            .unwrap();

        let mut deliveries = broker.consume(&consumer(None)).await.unwrap();
        let delivery = deliveries.next().await.unwrap().unwrap();
        assert_eq!(delivery.attempt, 1);
        delivery.ack().await.unwrap();

        assert_eq!(broker.stored_count("REWARDS"), 0);
    }

    #[tokio::test]
    async fn test_nak_redelivers_until_max_deliver() {
        let broker = provisioned(None).await;
        DurableTransport::publish(&broker, Envelope::new("kit.granted", Bytes::from_static(b"a")))
            .await
            .unwrap();

        let mut deliveries = broker.consume(&consumer(None)).await.unwrap();
        for expected in 1..=3 {
            let delivery = deliveries.next().await.unwrap().unwrap();
            assert_eq!(delivery.attempt, expected);
            delivery.nak().await.unwrap();
        }

        assert_eq!(broker.stored_count("REWARDS"), 0);
        let next = tokio::time::timeout(Duration::from_millis(50), deliveries.next()).await;
        assert!(next.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_ack_wait_expiry_redelivers() {
        let broker = provisioned(None).await;
        DurableTransport::publish(&broker, Envelope::new("kit.granted", Bytes::from_static(b"a")))
            .await
            .unwrap();

        let mut deliveries = broker.consume(&consumer(None)).await.unwrap();
        let first = deliveries.next().await.unwrap().unwrap();
        assert_eq!(first.attempt, 1);

        let second = deliveries.next().await.unwrap().unwrap();
        assert_eq!(second.attempt, 2);

        // The expired delivery can no longer settle the message.
        first.ack().await.unwrap();
        assert_eq!(broker.stored_count("REWARDS"), 1);
        second.ack().await.unwrap();
        assert_eq!(broker.stored_count("REWARDS"), 0);
    }

    async fn timers_drained(broker: &MemoryBroker) {
        tokio::time::timeout(Duration::from_secs(1), async {
            while broker.pending_ack_timers() > 0 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("ack-wait timers still running");
    }

    #[tokio::test]
    async fn test_settling_cancels_ack_wait_timer() {
        let broker = provisioned(None).await;
        for payload in [&b"a"[..], &b"b"[..]] {
            DurableTransport::publish(
                &broker,
                Envelope::new("kit.granted", Bytes::copy_from_slice(payload)),
            )
            .await
            .unwrap();
        }

        let mut deliveries = broker.consume(&consumer(None)).await.unwrap();
        let acked = deliveries.next().await.unwrap().unwrap();
        assert_eq!(broker.pending_ack_timers(), 1);
        acked.ack().await.unwrap();
        timers_drained(&broker).await;

        let naked = deliveries.next().await.unwrap().unwrap();
        naked.nak().await.unwrap();
        timers_drained(&broker).await;
        let redelivered = deliveries.next().await.unwrap().unwrap();
        assert_eq!(redelivered.attempt, 2);
        assert_eq!(broker.pending_ack_timers(), 1);

        redelivered.ack().await.unwrap();
        timers_drained(&broker).await;
        assert_eq!(broker.stored_count("REWARDS"), 0);
    }

    #[tokio::test]
    async fn test_backlog_replayed_to_new_consumer() {
        let broker = MemoryBroker::new();
        broker.ensure_stream(&stream()).await.unwrap();
        DurableTransport::publish(&broker, Envelope::new("kit.granted", Bytes::from_static(b"a")))
            .await
            .unwrap();

        broker.ensure_consumer(&consumer(None)).await.unwrap();
        let mut deliveries = broker.consume(&consumer(None)).await.unwrap();
        let delivery = deliveries.next().await.unwrap().unwrap();
        assert_eq!(delivery.payload, Bytes::from_static(b"a"));
    }

    #[tokio::test]
    async fn test_group_members_share_deliveries() {
        let broker = provisioned(Some("workers")).await;
        let mut first = broker.consume(&consumer(Some("workers"))).await.unwrap();
        let mut second = broker.consume(&consumer(Some("workers"))).await.unwrap();

        for payload in [&b"a"[..], &b"b"[..]] {
            DurableTransport::publish(
                &broker,
                Envelope::new("kit.granted", Bytes::copy_from_slice(payload)),
            )
            .await
            .unwrap();
        }

        let a = first.next().await.unwrap().unwrap();
        let b = second.next().await.unwrap().unwrap();
        assert_ne!(a.payload, b.payload);
    }

    #[tokio::test]
    async fn test_core_queue_group_delivers_once() {
        let broker = MemoryBroker::new();
        let mut a = broker.queue_subscribe("rpc.get", "responders").await.unwrap();
        let mut b = broker.queue_subscribe("rpc.get", "responders").await.unwrap();
        let mut plain = broker.subscribe("rpc.*").await.unwrap();

        CoreTransport::publish(&broker, "rpc.get", Bytes::from_static(b"x"))
            .await
            .unwrap();

        assert!(plain.next().await.is_some());
        let got_a = tokio::time::timeout(Duration::from_millis(20), a.next()).await.is_ok();
        let got_b = tokio::time::timeout(Duration::from_millis(20), b.next()).await.is_ok();
        assert!(got_a ^ got_b);
    }

    #[tokio::test]
    async fn test_dropped_core_subscription_is_pruned() {
        let broker = MemoryBroker::new();
        let sub = broker.subscribe("players.online").await.unwrap();
        assert_eq!(broker.core_subscribers("players.online"), 1);

        drop(sub);
        assert_eq!(broker.core_subscribers("players.online"), 0);
    }

    #[test]
    fn test_inbox_unique() {
        let broker = MemoryBroker::new();
        assert_ne!(broker.new_inbox(), broker.new_inbox());
        assert!(broker.new_inbox().starts_with("_INBOX."));
    }
}
