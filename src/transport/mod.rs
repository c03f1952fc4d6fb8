//! Byte-oriented transports
//!
//! Two broker shapes sit under the typed facade:
//!
//! - [`CoreTransport`]: fire-and-forget publish, queue-grouped subscribe and
//!   reply addressing (plain NATS).
//! - [`DurableTransport`]: named streams, durable consumers, explicit
//!   acknowledgement and idempotent publish (JetStream).
//!
//! Both are implemented for NATS ([`nats`], [`jetstream`]) and by the
//! in-memory [`memory::MemoryBroker`].

pub mod jetstream;
pub mod memory;
pub mod nats;

use crate::config::{ConsumerPolicy, StreamPolicy};
use crate::error::Result;
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use std::fmt;
use std::time::Duration;

/// A message addressed to a subject
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    /// Dot-separated subject, e.g. `kit.granted`
    pub subject: String,

    /// Encoded payload
    pub payload: Bytes,

    /// Broker deduplication key; only set for durable-log publishes
    pub dedup_key: Option<String>,
}

impl Envelope {
    /// Envelope without a dedup key
    pub fn new(subject: impl Into<String>, payload: Bytes) -> Self {
        Self {
            subject: subject.into(),
            payload,
            dedup_key: None,
        }
    }

    /// Envelope whose dedup key is derived from the subject and payload bytes
    pub fn deduplicated(subject: impl Into<String>, payload: Bytes) -> Self {
        let subject = subject.into();
        let key = crate::codec::message_id(&subject, &payload);
        Self {
            subject,
            payload,
            dedup_key: Some(key),
        }
    }
}

/// A message received from the core bus
#[derive(Debug, Clone)]
pub struct CoreMessage {
    /// Subject the message was published to
    pub subject: String,

    /// Reply address, set for requests
    pub reply: Option<String>,

    /// Encoded payload
    pub payload: Bytes,
}

/// Stream of core-bus messages. Dropping it unsubscribes.
pub type CoreSubscription = BoxStream<'static, CoreMessage>;

/// Plain publish/subscribe transport
#[async_trait]
pub trait CoreTransport: Send + Sync + 'static {
    /// Publish without waiting for any acknowledgement
    async fn publish(&self, subject: &str, payload: Bytes) -> Result<()>;

    /// Publish carrying a reply address
    async fn publish_with_reply(&self, subject: &str, reply: &str, payload: Bytes) -> Result<()>;

    /// Subscribe to a subject; every subscriber receives every message
    async fn subscribe(&self, subject: &str) -> Result<CoreSubscription>;

    /// Subscribe as a member of a queue group; each message goes to one member
    async fn queue_subscribe(&self, subject: &str, group: &str) -> Result<CoreSubscription>;

    /// A fresh, never reused reply subject
    fn new_inbox(&self) -> String;
}

/// Settles a delivered durable message with the broker
#[async_trait]
pub trait Acknowledger: Send + Sync {
    /// Processing succeeded; remove the message
    async fn ack(&self) -> Result<()>;

    /// Processing failed; ask for redelivery
    async fn nak(&self) -> Result<()>;
}

/// A message delivered from a durable consumer
pub struct Delivery {
    /// Subject the message was stored under
    pub subject: String,

    /// Encoded payload
    pub payload: Bytes,

    /// 1-based delivery attempt
    pub attempt: i64,

    acker: Box<dyn Acknowledger>,
}

impl Delivery {
    /// Wrap a broker message with its acknowledger
    pub fn new(
        subject: impl Into<String>,
        payload: Bytes,
        attempt: i64,
        acker: Box<dyn Acknowledger>,
    ) -> Self {
        Self {
            subject: subject.into(),
            payload,
            attempt,
            acker,
        }
    }

    /// Acknowledge the message
    pub async fn ack(&self) -> Result<()> {
        self.acker.ack().await
    }

    /// Negatively acknowledge the message
    pub async fn nak(&self) -> Result<()> {
        self.acker.nak().await
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("subject", &self.subject)
            .field("payload_size", &self.payload.len())
            .field("attempt", &self.attempt)
            .finish()
    }
}

/// Stream of deliveries from a durable consumer
pub type DeliveryStream = BoxStream<'static, Result<Delivery>>;

/// A named, durably retained stream restricted to a subject set
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamSpec {
    /// Stream name, e.g. `REWARDS`
    pub name: String,

    /// Subjects captured by the stream
    pub subjects: Vec<String>,

    /// Maximum message age
    pub max_age: Duration,

    /// Dedup window
    pub duplicate_window: Duration,
}

impl StreamSpec {
    /// Stream spec using the given retention policy
    pub fn new(name: impl Into<String>, subjects: Vec<String>, policy: &StreamPolicy) -> Self {
        Self {
            name: name.into(),
            subjects,
            max_age: policy.max_age,
            duplicate_window: policy.duplicate_window,
        }
    }
}

/// A named durable cursor over a stream, scoped to one subject
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerSpec {
    /// Stream the consumer reads from
    pub stream: String,

    /// Durable name of the subscriber role
    pub durable_name: String,

    /// Subject filter
    pub filter_subject: String,

    /// Group shared by horizontally scaled instances of the role
    pub group: Option<String>,

    /// Ack wait before redelivery
    pub ack_wait: Duration,

    /// Deliveries after which the message is dropped
    pub max_deliver: i64,
}

impl ConsumerSpec {
    /// Consumer spec using the given acknowledgement policy
    pub fn new(
        stream: impl Into<String>,
        durable_name: impl Into<String>,
        filter_subject: impl Into<String>,
        group: Option<String>,
        policy: &ConsumerPolicy,
    ) -> Self {
        Self {
            stream: stream.into(),
            durable_name: durable_name.into(),
            filter_subject: filter_subject.into(),
            group,
            ack_wait: policy.ack_wait,
            max_deliver: policy.max_deliver,
        }
    }

    /// Name of the consumer on the broker.
    ///
    /// All members of a group bind the same consumer and share its
    /// deliveries; the name is stable across restarts.
    pub fn consumer_name(&self) -> String {
        match &self.group {
            Some(group) => format!("{}_{}", self.durable_name, group),
            None => self.durable_name.clone(),
        }
    }
}

/// Persistent, replayable transport
#[async_trait]
pub trait DurableTransport: Send + Sync + 'static {
    /// Create the stream if it does not exist
    async fn ensure_stream(&self, spec: &StreamSpec) -> Result<()>;

    /// Create the consumer if it does not exist
    async fn ensure_consumer(&self, spec: &ConsumerSpec) -> Result<()>;

    /// Store an envelope; a repeated dedup key is a no-op at the broker
    async fn publish(&self, envelope: Envelope) -> Result<()>;

    /// Start receiving deliveries for an existing consumer
    async fn consume(&self, spec: &ConsumerSpec) -> Result<DeliveryStream>;
}

/// NATS subject matching with `*` (one token) and `>` (one or more tokens).
pub fn subject_matches(pattern: &str, subject: &str) -> bool {
    let mut pattern_tokens = pattern.split('.');
    let mut subject_tokens = subject.split('.');

    loop {
        match (pattern_tokens.next(), subject_tokens.next()) {
            (Some(">"), Some(_)) => return true,
            (Some("*"), Some(_)) => continue,
            (Some(p), Some(s)) if p == s => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}
