//! JetStream durable-log transport
//!
//! Manages streams, durable pull consumers, idempotent publish and
//! explicit acknowledgement.

use super::{
    Acknowledger, ConsumerSpec, Delivery, DeliveryStream, DurableTransport, Envelope, StreamSpec,
};
use crate::error::{MessagingError, Result};
use crate::NatsConfig;
use async_nats::jetstream::consumer::{pull, AckPolicy, DeliverPolicy};
use async_nats::jetstream::context::{CreateStreamErrorKind, GetStreamErrorKind};
use async_nats::jetstream::stream::{ConsumerErrorKind, RetentionPolicy, StorageType};
use async_nats::jetstream::{self, AckKind, ErrorCode};
use async_nats::{header, HeaderMap};
use async_trait::async_trait;
use futures::StreamExt;

/// JetStream transport
#[derive(Clone)]
pub struct JetStreamTransport {
    context: jetstream::Context,
}

impl JetStreamTransport {
    /// Connect to NATS and open a JetStream context
    pub async fn connect(config: &NatsConfig) -> Result<Self> {
        let client = super::nats::connect(config).await?;
        Ok(Self::from_client(client))
    }

    /// JetStream context over an existing connection
    pub fn from_client(client: async_nats::Client) -> Self {
        Self {
            context: jetstream::new(client),
        }
    }

    /// Get a reference to the JetStream context
    pub fn context(&self) -> &jetstream::Context {
        &self.context
    }

    async fn create_stream(&self, spec: &StreamSpec) -> Result<()> {
        tracing::info!(stream = %spec.name, "Creating new JetStream stream");

        match self.context.create_stream(stream_config(spec)).await {
            Ok(_) => {
                tracing::info!(
                    stream = %spec.name,
                    subjects = ?spec.subjects,
                    "Stream created successfully"
                );
                Ok(())
            }
            Err(e) => match e.kind() {
                CreateStreamErrorKind::JetStream(err)
                    if err.error_code() == ErrorCode::STREAM_NAME_EXIST =>
                {
                    tracing::debug!(stream = %spec.name, "Stream created concurrently");
                    Ok(())
                }
                _ => Err(MessagingError::Provisioning(format!(
                    "Failed to create stream '{}': {}",
                    spec.name, e
                ))),
            },
        }
    }

    async fn stream(&self, name: &str) -> Result<jetstream::stream::Stream> {
        self.context
            .get_stream(name)
            .await
            .map_err(|e| MessagingError::Subscribe(format!("Stream '{}' not found: {}", name, e)))
    }
}

/// A consumer lookup error other than "not found" reported by the server.
///
/// Transport-level failures fall through to the create call, which reports
/// its own error.
fn blocks_consumer_creation(err: &async_nats::Error) -> bool {
    err.downcast_ref::<jetstream::Error>()
        .is_some_and(|e| e.error_code() != ErrorCode::CONSUMER_NOT_FOUND)
}

/// JetStream stream configuration for a stream spec
///
/// Work-queue retention: a message is removed once a consumer acks it.
pub fn stream_config(spec: &StreamSpec) -> jetstream::stream::Config {
    jetstream::stream::Config {
        name: spec.name.clone(),
        subjects: spec.subjects.clone(),
        retention: RetentionPolicy::WorkQueue,
        storage: StorageType::File,
        max_age: spec.max_age,
        duplicate_window: spec.duplicate_window,
        ..Default::default()
    }
}

/// JetStream pull consumer configuration for a consumer spec
pub fn consumer_config(spec: &ConsumerSpec) -> pull::Config {
    pull::Config {
        durable_name: Some(spec.consumer_name()),
        filter_subject: spec.filter_subject.clone(),
        ack_policy: AckPolicy::Explicit,
        ack_wait: spec.ack_wait,
        max_deliver: spec.max_deliver,
        deliver_policy: DeliverPolicy::All,
        ..Default::default()
    }
}

#[async_trait]
impl DurableTransport for JetStreamTransport {
    async fn ensure_stream(&self, spec: &StreamSpec) -> Result<()> {
        tracing::debug!(
            stream = %spec.name,
            subjects = ?spec.subjects,
            "Ensuring JetStream stream exists"
        );

        match self.context.get_stream(&spec.name).await {
            Ok(_) => {
                tracing::info!(stream = %spec.name, "Stream already exists");
                Ok(())
            }
            Err(e) => match e.kind() {
                GetStreamErrorKind::JetStream(err)
                    if err.error_code() == ErrorCode::STREAM_NOT_FOUND =>
                {
                    self.create_stream(spec).await
                }
                _ => Err(MessagingError::Provisioning(format!(
                    "Failed to look up stream '{}': {}",
                    spec.name, e
                ))),
            },
        }
    }

    async fn ensure_consumer(&self, spec: &ConsumerSpec) -> Result<()> {
        let name = spec.consumer_name();
        let stream = self.stream(&spec.stream).await.map_err(|e| {
            MessagingError::Provisioning(format!("Consumer '{}': {}", name, e))
        })?;

        match stream.get_consumer::<pull::Config>(&name).await {
            Ok(_) => {
                tracing::info!(stream = %spec.stream, consumer = %name, "Consumer already exists");
                return Ok(());
            }
            Err(e) if blocks_consumer_creation(&e) => {
                return Err(MessagingError::Provisioning(format!(
                    "Failed to look up consumer '{}': {}",
                    name, e
                )));
            }
            Err(e) => {
                tracing::debug!(consumer = %name, error = %e, "Consumer lookup failed, creating");
            }
        }

        match stream.create_consumer(consumer_config(spec)).await {
            Ok(_) => {
                tracing::info!(
                    stream = %spec.stream,
                    consumer = %name,
                    subject = %spec.filter_subject,
                    "Durable consumer created successfully"
                );
                Ok(())
            }
            Err(e) => match e.kind() {
                ConsumerErrorKind::JetStream(err)
                    if err.error_code() == ErrorCode::CONSUMER_NAME_EXIST =>
                {
                    tracing::debug!(consumer = %name, "Consumer created concurrently");
                    Ok(())
                }
                _ => Err(MessagingError::Provisioning(format!(
                    "Failed to create consumer '{}': {}",
                    name, e
                ))),
            },
        }
    }

    async fn publish(&self, envelope: Envelope) -> Result<()> {
        tracing::debug!(
            subject = %envelope.subject,
            payload_size = envelope.payload.len(),
            "Publishing message to JetStream"
        );

        let mut headers = HeaderMap::new();
        if let Some(key) = &envelope.dedup_key {
            headers.insert(header::NATS_MESSAGE_ID, key.as_str());
        }

        let ack = self
            .context
            .publish_with_headers(envelope.subject.clone(), headers, envelope.payload)
            .await
            .map_err(|e| MessagingError::Publish(format!("Failed to publish: {}", e)))?;

        let ack = ack
            .await
            .map_err(|e| MessagingError::Publish(format!("Failed to get ack: {}", e)))?;

        if ack.duplicate {
            tracing::debug!(subject = %envelope.subject, "Duplicate publish suppressed by broker");
        } else {
            tracing::debug!(
                subject = %envelope.subject,
                sequence = ack.sequence,
                "Message published and acknowledged"
            );
        }

        Ok(())
    }

    async fn consume(&self, spec: &ConsumerSpec) -> Result<DeliveryStream> {
        let name = spec.consumer_name();
        let stream = self.stream(&spec.stream).await?;

        let consumer = stream
            .get_consumer::<pull::Config>(&name)
            .await
            .map_err(|e| MessagingError::Subscribe(format!("Consumer '{}' not found: {}", name, e)))?;

        let messages = consumer
            .messages()
            .await
            .map_err(|e| MessagingError::Subscribe(format!("Failed to get message stream: {}", e)))?;

        let deliveries = messages.map(|item| -> Result<Delivery> {
            let message =
                item.map_err(|e| MessagingError::JetStream(format!("Error receiving message: {}", e)))?;
            let attempt = message.info().map(|info| info.delivered).unwrap_or(1);
            let subject = message.subject.to_string();
            let payload = message.payload.clone();
            Ok(Delivery::new(
                subject,
                payload,
                attempt,
                Box::new(JetStreamAcker { message }),
            ))
        });

        Ok(deliveries.boxed())
    }
}

struct JetStreamAcker {
    message: jetstream::Message,
}

#[async_trait]
impl Acknowledger for JetStreamAcker {
    async fn ack(&self) -> Result<()> {
        self.message
            .ack()
            .await
            .map_err(|e| MessagingError::JetStream(format!("Failed to ack: {}", e)))
    }

    async fn nak(&self) -> Result<()> {
        self.message
            .ack_with(AckKind::Nak(None))
            .await
            .map_err(|e| MessagingError::JetStream(format!("Failed to nak: {}", e)))
    }
}
