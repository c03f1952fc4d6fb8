//! Request/reply over the core bus
//!
//! [`RpcRequester`] sends each request with a fresh inbox as its reply
//! address and waits for the first reply. [`RpcResponder`] serves a subject
//! from a queue group, so a request is answered by exactly one member.
//!
//! A responder that cannot answer (undecodable request, handler error)
//! drops the request; the requester sees a timeout.

use crate::codec::{Codec, JsonCodec};
use crate::error::{MessagingError, Result};
use crate::handler::RequestHandler;
use crate::subscriber::Running;
use crate::transport::{CoreSubscription, CoreTransport};
use futures::StreamExt;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

/// Sends `Req` and waits for `Resp`
pub struct RpcRequester<Req, Resp, C = JsonCodec> {
    transport: Arc<dyn CoreTransport>,
    subject: String,
    timeout: Duration,
    codec: C,
    _types: PhantomData<fn(&Req) -> Resp>,
}

impl<Req, Resp> RpcRequester<Req, Resp, JsonCodec> {
    /// Requester for `subject` with a default deadline
    pub fn new(
        transport: Arc<dyn CoreTransport>,
        subject: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            transport,
            subject: subject.into(),
            timeout,
            codec: JsonCodec,
            _types: PhantomData,
        }
    }
}

impl<Req, Resp, C> RpcRequester<Req, Resp, C>
where
    C: Codec<Req> + Codec<Resp>,
{
    /// Replace the payload codec
    pub fn with_codec<C2>(self, codec: C2) -> RpcRequester<Req, Resp, C2>
    where
        C2: Codec<Req> + Codec<Resp>,
    {
        RpcRequester {
            transport: self.transport,
            subject: self.subject,
            timeout: self.timeout,
            codec,
            _types: PhantomData,
        }
    }

    /// Send a request and wait for the reply within the default deadline.
    ///
    /// Dropping the returned future abandons the request.
    pub async fn request(&self, request: &Req) -> Result<Resp> {
        self.request_with_timeout(request, self.timeout).await
    }

    /// Send a request and wait for the reply within `timeout`
    pub async fn request_with_timeout(&self, request: &Req, timeout: Duration) -> Result<Resp> {
        let payload = <C as Codec<Req>>::encode(&self.codec, request)?;

        // Subscribe before publishing so a fast reply is not missed.
        let inbox = self.transport.new_inbox();
        let mut replies = self.transport.subscribe(&inbox).await?;

        tracing::debug!(subject = %self.subject, inbox = %inbox, "Sending request");
        self.transport
            .publish_with_reply(&self.subject, &inbox, payload)
            .await?;

        let reply = tokio::time::timeout(timeout, replies.next())
            .await
            .map_err(|_| MessagingError::Timeout {
                subject: self.subject.clone(),
            })?
            .ok_or_else(|| {
                MessagingError::Request(format!(
                    "Reply subscription for '{}' closed",
                    self.subject
                ))
            })?;

        <C as Codec<Resp>>::decode(&self.codec, &reply.payload)
    }
}

/// Answers `Req` with `Resp`
pub struct RpcResponder<Req, Resp, C = JsonCodec> {
    transport: Arc<dyn CoreTransport>,
    subject: String,
    group: Option<String>,
    codec: Arc<C>,
    running: Mutex<Option<Running>>,
    _types: PhantomData<fn(Req) -> Resp>,
}

impl<Req, Resp> RpcResponder<Req, Resp, JsonCodec> {
    /// Responder for `subject`; responders sharing `group` split the load
    pub fn new(
        transport: Arc<dyn CoreTransport>,
        subject: impl Into<String>,
        group: Option<&str>,
    ) -> Self {
        Self {
            transport,
            subject: subject.into(),
            group: group.map(str::to_string),
            codec: Arc::new(JsonCodec),
            running: Mutex::new(None),
            _types: PhantomData,
        }
    }
}

impl<Req, Resp, C> RpcResponder<Req, Resp, C>
where
    Req: Send + 'static,
    Resp: Send + 'static,
    C: Codec<Req> + Codec<Resp>,
{
    /// Replace the payload codec
    pub fn with_codec<C2>(self, codec: C2) -> RpcResponder<Req, Resp, C2>
    where
        C2: Codec<Req> + Codec<Resp>,
    {
        RpcResponder {
            transport: Arc::clone(&self.transport),
            subject: self.subject.clone(),
            group: self.group.clone(),
            codec: Arc::new(codec),
            running: Mutex::new(None),
            _types: PhantomData,
        }
    }

    /// Start answering requests
    pub async fn respond<H>(&self, handler: H) -> Result<()>
    where
        H: RequestHandler<Req, Resp>,
    {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Err(MessagingError::Subscribe(format!(
                "Already responding on '{}'",
                self.subject
            )));
        }

        let requests = match &self.group {
            Some(group) => self.transport.queue_subscribe(&self.subject, group).await?,
            None => self.transport.subscribe(&self.subject).await?,
        };

        let cancel = CancellationToken::new();
        let task = tokio::spawn(respond_loop(
            requests,
            Arc::clone(&self.transport),
            Arc::clone(&self.codec),
            handler,
            cancel.clone(),
        ));

        tracing::info!(subject = %self.subject, group = ?self.group, "Responding to requests");
        *running = Some(Running { cancel, task });
        Ok(())
    }

    /// Stop answering requests. Safe to call when not responding.
    pub async fn unsubscribe(&self) -> Result<()> {
        let Some(mut running) = self.running.lock().await.take() else {
            return Ok(());
        };

        running.cancel.cancel();
        if let Err(e) = (&mut running.task).await {
            tracing::error!(error = %e, subject = %self.subject, "Responder loop ended abnormally");
        }
        Ok(())
    }
}

async fn respond_loop<Req, Resp, C, H>(
    mut requests: CoreSubscription,
    transport: Arc<dyn CoreTransport>,
    codec: Arc<C>,
    handler: H,
    cancel: CancellationToken,
) where
    Req: Send + 'static,
    Resp: Send + 'static,
    C: Codec<Req> + Codec<Resp>,
    H: RequestHandler<Req, Resp>,
{
    loop {
        let message = tokio::select! {
            _ = cancel.cancelled() => break,
            next = requests.next() => match next {
                Some(message) => message,
                None => break,
            },
        };

        let Some(reply) = message.reply else {
            tracing::warn!(subject = %message.subject, "Dropping request without reply address");
            continue;
        };

        let request = match <C as Codec<Req>>::decode(&codec, &message.payload) {
            Ok(request) => request,
            Err(e) => {
                tracing::warn!(error = %e, subject = %message.subject, "Dropping undecodable request");
                continue;
            }
        };

        let response = match handler.handle(request).await {
            Ok(response) => response,
            Err(e) => {
                tracing::error!(error = %e, subject = %message.subject, "Request handler failed");
                continue;
            }
        };

        let payload = match <C as Codec<Resp>>::encode(&codec, &response) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::error!(error = %e, subject = %message.subject, "Failed to encode response");
                continue;
            }
        };

        if let Err(e) = transport.publish(&reply, payload).await {
            tracing::error!(error = %e, subject = %message.subject, "Failed to publish reply");
        }
    }
}
