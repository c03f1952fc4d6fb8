//! Typed publisher
//!
//! Encodes a payload with a [`Codec`] and hands the bytes to one of the two
//! transports. Durable publishes carry a content-derived dedup key so that
//! re-publishing identical content stores a single message.

use crate::codec::{Codec, JsonCodec};
use crate::error::Result;
use crate::transport::{CoreTransport, DurableTransport, Envelope};
use std::marker::PhantomData;
use std::sync::Arc;

#[derive(Clone)]
enum Target {
    Durable(Arc<dyn DurableTransport>),
    Core(Arc<dyn CoreTransport>),
}

/// Publishes payloads of type `T` to one subject
pub struct Publisher<T, C = JsonCodec> {
    target: Target,
    subject: String,
    codec: C,
    _payload: PhantomData<fn(&T)>,
}

impl<T> Publisher<T, JsonCodec> {
    /// Publisher storing into the durable log
    pub fn durable(transport: Arc<dyn DurableTransport>, subject: impl Into<String>) -> Self {
        Self {
            target: Target::Durable(transport),
            subject: subject.into(),
            codec: JsonCodec,
            _payload: PhantomData,
        }
    }

    /// Fire-and-forget publisher on the core bus
    pub fn core(transport: Arc<dyn CoreTransport>, subject: impl Into<String>) -> Self {
        Self {
            target: Target::Core(transport),
            subject: subject.into(),
            codec: JsonCodec,
            _payload: PhantomData,
        }
    }
}

impl<T, C> Publisher<T, C>
where
    C: Codec<T>,
{
    /// Replace the payload codec
    pub fn with_codec<C2: Codec<T>>(self, codec: C2) -> Publisher<T, C2> {
        Publisher {
            target: self.target,
            subject: self.subject,
            codec,
            _payload: PhantomData,
        }
    }

    /// Subject this publisher writes to
    pub fn subject(&self) -> &str {
        &self.subject
    }

    /// Publish one payload.
    ///
    /// Transport errors are returned unchanged; retrying is the caller's
    /// decision.
    pub async fn publish(&self, event: &T) -> Result<()> {
        let payload = self.codec.encode(event)?;

        match &self.target {
            Target::Durable(transport) => {
                let envelope = Envelope::deduplicated(self.subject.clone(), payload);
                tracing::debug!(
                    subject = %self.subject,
                    dedup_key = envelope.dedup_key.as_deref().unwrap_or_default(),
                    "Publishing to durable log"
                );
                transport.publish(envelope).await
            }
            Target::Core(transport) => transport.publish(&self.subject, payload).await,
        }
    }
}

impl<T, C: Clone> Clone for Publisher<T, C> {
    fn clone(&self) -> Self {
        Self {
            target: self.target.clone(),
            subject: self.subject.clone(),
            codec: self.codec.clone(),
            _payload: PhantomData,
        }
    }
}
