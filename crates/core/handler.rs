//! Handler abstraction invoked by consumers.

use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;

use crate::message::{HandlerResponse, Message};

/// Error a handler may raise. The consumer turns it into a retry.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Result type for handlers.
pub type HandlerResult = std::result::Result<HandlerResponse, HandlerError>;

/// Processes messages delivered to a subscription.
///
/// Any `Fn(Message) -> impl Future<Output = HandlerResult>` closure or async
/// function is a handler.
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    async fn handle(&self, message: Message) -> HandlerResult;
}

#[async_trait]
impl<F, Fut> Handler for F
where
    F: Fn(Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    async fn handle(&self, message: Message) -> HandlerResult {
        (self)(message).await
    }
}

/// A type-erased handler shared between consumers.
pub type SharedHandler = Arc<dyn Handler>;

/// Wrap a handler for `subscribe`.
pub fn shared<H: Handler>(handler: H) -> SharedHandler {
    Arc::new(handler)
}
