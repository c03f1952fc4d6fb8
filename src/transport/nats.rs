//! Core NATS transport
//!
//! Fire-and-forget publish, queue-grouped subscribe and inbox-based reply
//! addressing over a plain NATS connection.

use super::{CoreMessage, CoreSubscription, CoreTransport};
use crate::error::{MessagingError, Result};
use crate::NatsConfig;
use async_nats::{Client, ConnectOptions};
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;

/// Connect to the NATS server named in the configuration
pub async fn connect(config: &NatsConfig) -> Result<Client> {
    config.validate()?;

    let mut options = ConnectOptions::new();
    if let Some(name) = &config.client_name {
        options = options.name(name.clone());
    }

    let client = options
        .connect(config.url.as_str())
        .await
        .map_err(|e| MessagingError::Connection(e.to_string()))?;

    tracing::info!(url = %config.url, "Connected to NATS server");

    Ok(client)
}

/// Core NATS transport
#[derive(Clone)]
pub struct NatsCoreTransport {
    client: Client,
}

impl NatsCoreTransport {
    /// Connect to NATS
    pub async fn connect(config: &NatsConfig) -> Result<Self> {
        Ok(Self::new(connect(config).await?))
    }

    /// Core transport over an existing connection
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Get a reference to the underlying NATS client
    pub fn client(&self) -> &Client {
        &self.client
    }
}

fn into_core_stream(subscriber: async_nats::Subscriber) -> CoreSubscription {
    subscriber
        .map(|message| CoreMessage {
            subject: message.subject.to_string(),
            reply: message.reply.map(|reply| reply.to_string()),
            payload: message.payload,
        })
        .boxed()
}

#[async_trait]
impl CoreTransport for NatsCoreTransport {
    async fn publish(&self, subject: &str, payload: Bytes) -> Result<()> {
        tracing::debug!(subject = %subject, payload_size = payload.len(), "Publishing message");

        self.client
            .publish(subject.to_string(), payload)
            .await
            .map_err(|e| MessagingError::Publish(format!("Failed to publish: {}", e)))
    }

    async fn publish_with_reply(&self, subject: &str, reply: &str, payload: Bytes) -> Result<()> {
        self.client
            .publish_with_reply(subject.to_string(), reply.to_string(), payload)
            .await
            .map_err(|e| MessagingError::Publish(format!("Failed to publish request: {}", e)))?;

        // Requests wait on the reply, so push the write out now.
        self.client
            .flush()
            .await
            .map_err(|e| MessagingError::Publish(format!("Failed to flush: {}", e)))
    }

    async fn subscribe(&self, subject: &str) -> Result<CoreSubscription> {
        let subscriber = self
            .client
            .subscribe(subject.to_string())
            .await
            .map_err(|e| MessagingError::Subscribe(format!("Failed to subscribe: {}", e)))?;

        tracing::debug!(subject = %subject, "Subscribed");
        Ok(into_core_stream(subscriber))
    }

    async fn queue_subscribe(&self, subject: &str, group: &str) -> Result<CoreSubscription> {
        let subscriber = self
            .client
            .queue_subscribe(subject.to_string(), group.to_string())
            .await
            .map_err(|e| MessagingError::Subscribe(format!("Failed to queue subscribe: {}", e)))?;

        tracing::debug!(subject = %subject, group = %group, "Queue subscribed");
        Ok(into_core_stream(subscriber))
    }

    fn new_inbox(&self) -> String {
        self.client.new_inbox()
    }
}
