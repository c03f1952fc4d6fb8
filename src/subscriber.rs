//! Typed subscriber
//!
//! Runs a consume loop on a background task and feeds decoded payloads to a
//! [`Handler`]. Failures inside the loop are logged, never returned to the
//! caller of [`Subscriber::subscribe`].
//!
//! Durable-log settlement:
//!
//! | outcome        | action                                              |
//! |----------------|-----------------------------------------------------|
//! | decoded + ok   | ack                                                 |
//! | decode failure | nak                                                 |
//! | handler error  | nak (or park on the dead-letter subject when final) |
//!
//! On the core bus there is nothing to settle: failed messages are dropped.

use crate::codec::{Codec, JsonCodec};
use crate::error::{MessagingError, Result};
use crate::handler::Handler;
use crate::transport::{
    ConsumerSpec, CoreSubscription, CoreTransport, Delivery, DeliveryStream, DurableTransport,
    Envelope,
};
use futures::StreamExt;
use std::marker::PhantomData;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

enum Source {
    Durable {
        transport: Arc<dyn DurableTransport>,
        consumer: ConsumerSpec,
    },
    Core {
        transport: Arc<dyn CoreTransport>,
        subject: String,
        group: Option<String>,
    },
}

impl Source {
    fn subject(&self) -> &str {
        match self {
            Source::Durable { consumer, .. } => &consumer.filter_subject,
            Source::Core { subject, .. } => subject,
        }
    }
}

/// A spawned consume loop and the token that stops it
pub(crate) struct Running {
    pub(crate) cancel: CancellationToken,
    pub(crate) task: JoinHandle<()>,
}

impl Drop for Running {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Subscribes a handler to payloads of type `T`
pub struct Subscriber<T, C = JsonCodec> {
    source: Source,
    codec: Arc<C>,
    dead_letter: Option<String>,
    running: Mutex<Option<Running>>,
    _payload: PhantomData<fn() -> T>,
}

impl<T> Subscriber<T, JsonCodec> {
    /// Subscriber bound to a provisioned durable consumer
    pub fn durable(transport: Arc<dyn DurableTransport>, consumer: ConsumerSpec) -> Self {
        Self::from_source(Source::Durable {
            transport,
            consumer,
        })
    }

    /// Subscriber on the core bus, optionally in a queue group
    pub fn core(
        transport: Arc<dyn CoreTransport>,
        subject: impl Into<String>,
        group: Option<&str>,
    ) -> Self {
        Self::from_source(Source::Core {
            transport,
            subject: subject.into(),
            group: group.map(str::to_string),
        })
    }

    fn from_source(source: Source) -> Self {
        Self {
            source,
            codec: Arc::new(JsonCodec),
            dead_letter: None,
            running: Mutex::new(None),
            _payload: PhantomData,
        }
    }
}

impl<T, C> Subscriber<T, C>
where
    T: Send + 'static,
    C: Codec<T>,
{
    /// Replace the payload codec
    pub fn with_codec<C2: Codec<T>>(self, codec: C2) -> Subscriber<T, C2> {
        Subscriber {
            source: self.source,
            codec: Arc::new(codec),
            dead_letter: self.dead_letter,
            running: Mutex::new(None),
            _payload: PhantomData,
        }
    }

    /// Park messages that fail on their final delivery attempt on `subject`
    /// instead of letting the broker drop them. Durable subscribers only;
    /// `subject` must be captured by a provisioned stream.
    pub fn with_dead_letter(mut self, subject: impl Into<String>) -> Self {
        self.dead_letter = Some(subject.into());
        self
    }

    /// Start the consume loop.
    ///
    /// Returns once the broker subscription is established. Errors from
    /// individual messages are logged by the loop.
    pub async fn subscribe<H>(&self, handler: H) -> Result<()>
    where
        H: Handler<T>,
    {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Err(MessagingError::Subscribe(format!(
                "Already subscribed to '{}'",
                self.source.subject()
            )));
        }

        let cancel = CancellationToken::new();
        let task = match &self.source {
            Source::Durable {
                transport,
                consumer,
            } => {
                let deliveries = transport.consume(consumer).await?;
                let settle = Settle {
                    transport: Arc::clone(transport),
                    max_deliver: consumer.max_deliver,
                    dead_letter: self.dead_letter.clone(),
                };
                tokio::spawn(durable_loop(
                    deliveries,
                    Arc::clone(&self.codec),
                    handler,
                    settle,
                    cancel.clone(),
                ))
            }
            Source::Core {
                transport,
                subject,
                group,
            } => {
                let messages = match group {
                    Some(group) => transport.queue_subscribe(subject, group).await?,
                    None => transport.subscribe(subject).await?,
                };
                tokio::spawn(core_loop(
                    messages,
                    Arc::clone(&self.codec),
                    handler,
                    cancel.clone(),
                ))
            }
        };

        tracing::info!(subject = %self.source.subject(), "Subscribed");
        *running = Some(Running { cancel, task });
        Ok(())
    }

    /// Stop the consume loop.
    ///
    /// A message already being handled is finished first. Safe to call when
    /// never subscribed, and more than once.
    pub async fn unsubscribe(&self) -> Result<()> {
        let Some(mut running) = self.running.lock().await.take() else {
            return Ok(());
        };

        running.cancel.cancel();
        if let Err(e) = (&mut running.task).await {
            tracing::error!(error = %e, subject = %self.source.subject(), "Consume loop ended abnormally");
        }

        tracing::info!(subject = %self.source.subject(), "Unsubscribed");
        Ok(())
    }

    /// Whether a consume loop is running
    pub async fn is_subscribed(&self) -> bool {
        self.running.lock().await.is_some()
    }
}

struct Settle {
    transport: Arc<dyn DurableTransport>,
    max_deliver: i64,
    dead_letter: Option<String>,
}

impl Settle {
    async fn failure(&self, delivery: &Delivery) {
        let exhausted = delivery.attempt >= self.max_deliver;

        if exhausted {
            if let Some(subject) = &self.dead_letter {
                let envelope = Envelope::deduplicated(subject.clone(), delivery.payload.clone());
                match self.transport.publish(envelope).await {
                    Ok(()) => {
                        tracing::warn!(
                            subject = %delivery.subject,
                            dead_letter = %subject,
                            attempts = delivery.attempt,
                            "Message parked on dead-letter subject"
                        );
                        self.ack(delivery).await;
                        return;
                    }
                    Err(e) => {
                        tracing::error!(
                            error = %e,
                            dead_letter = %subject,
                            "Failed to park message on dead-letter subject"
                        );
                    }
                }
            } else {
                tracing::error!(
                    subject = %delivery.subject,
                    attempts = delivery.attempt,
                    "Message exhausted redelivery and will be dropped"
                );
            }
        }

        if let Err(e) = delivery.nak().await {
            tracing::error!(error = %e, subject = %delivery.subject, "Failed to nak message");
        }
    }

    async fn ack(&self, delivery: &Delivery) {
        if let Err(e) = delivery.ack().await {
            tracing::error!(error = %e, subject = %delivery.subject, "Failed to ack message");
        }
    }
}

async fn durable_loop<T, C, H>(
    mut deliveries: DeliveryStream,
    codec: Arc<C>,
    handler: H,
    settle: Settle,
    cancel: CancellationToken,
) where
    T: Send + 'static,
    C: Codec<T>,
    H: Handler<T>,
{
    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => break,
            next = deliveries.next() => next,
        };

        let delivery = match next {
            Some(Ok(delivery)) => delivery,
            Some(Err(e)) => {
                tracing::error!(error = %e, "Error receiving message");
                continue;
            }
            None => {
                tracing::debug!("Delivery stream closed");
                break;
            }
        };

        let message = match codec.decode(&delivery.payload) {
            Ok(message) => message,
            Err(e) => {
                tracing::error!(
                    error = %e,
                    subject = %delivery.subject,
                    attempt = delivery.attempt,
                    "Failed to decode message"
                );
                settle.failure(&delivery).await;
                continue;
            }
        };

        match handler.handle(message).await {
            Ok(()) => settle.ack(&delivery).await,
            Err(e) => {
                tracing::error!(
                    error = %e,
                    subject = %delivery.subject,
                    attempt = delivery.attempt,
                    "Failed to process message"
                );
                settle.failure(&delivery).await;
            }
        }
    }
}

async fn core_loop<T, C, H>(
    mut messages: CoreSubscription,
    codec: Arc<C>,
    handler: H,
    cancel: CancellationToken,
) where
    T: Send + 'static,
    C: Codec<T>,
    H: Handler<T>,
{
    loop {
        let message = tokio::select! {
            _ = cancel.cancelled() => break,
            next = messages.next() => match next {
                Some(message) => message,
                None => break,
            },
        };

        let decoded = match codec.decode(&message.payload) {
            Ok(decoded) => decoded,
            Err(e) => {
                tracing::warn!(error = %e, subject = %message.subject, "Dropping undecodable message");
                continue;
            }
        };

        if let Err(e) = handler.handle(decoded).await {
            tracing::error!(error = %e, subject = %message.subject, "Failed to process message");
        }
    }
}
