//! Handler traits for delivered messages and requests
//!
//! Both traits have blanket implementations for async closures, so a
//! handler can be a struct holding collaborators or just
//! `|event| async move { ... }`.

use crate::error::BoxError;
use async_trait::async_trait;
use std::future::Future;

/// Processes one delivered message
#[async_trait]
pub trait Handler<T>: Send + Sync + 'static {
    /// Handle a decoded message. An error requests redelivery.
    async fn handle(&self, message: T) -> Result<(), BoxError>;
}

#[async_trait]
impl<T, F, Fut> Handler<T> for F
where
    T: Send + 'static,
    F: Fn(T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
{
    async fn handle(&self, message: T) -> Result<(), BoxError> {
        (self)(message).await
    }
}

/// Answers one request
#[async_trait]
pub trait RequestHandler<Req, Resp>: Send + Sync + 'static {
    /// Produce the response for a decoded request
    async fn handle(&self, request: Req) -> Result<Resp, BoxError>;
}

#[async_trait]
impl<Req, Resp, F, Fut> RequestHandler<Req, Resp> for F
where
    Req: Send + 'static,
    Resp: Send + 'static,
    F: Fn(Req) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Resp, BoxError>> + Send + 'static,
{
    async fn handle(&self, request: Req) -> Result<Resp, BoxError> {
        (self)(request).await
    }
}
