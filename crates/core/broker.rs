//! Broker abstraction implemented by every backend.
//!
//! Callers depend only on the [`Broker`] trait; the in-process and the durable
//! backend are picked at construction time and can be swapped behind a
//! [`SharedBroker`].

use async_trait::async_trait;
use std::sync::Arc;

use crate::error::{Result, WaitqError};
use crate::handler::SharedHandler;
use crate::message::Message;

/// Options for a single subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscribeParams {
    /// Maximum unacknowledged messages the consumer may hold at once. Must be
    /// at least 1; AMQP would read 0 as "unlimited".
    pub prefetch: u16,
}

impl Default for SubscribeParams {
    fn default() -> Self {
        Self { prefetch: 1 }
    }
}

impl SubscribeParams {
    /// Set the prefetch limit.
    pub fn prefetch(mut self, prefetch: u16) -> Self {
        self.prefetch = prefetch;
        self
    }

    /// Reject a zero prefetch.
    pub fn validate(&self) -> Result<()> {
        if self.prefetch == 0 {
            return Err(WaitqError::Config(
                "prefetch must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Queue broker capability set.
///
/// A broker is constructed stopped. `start` provisions the required queues and
/// marks it running; every other operation fails with
/// [`WaitqError::BrokerNotRunning`](crate::WaitqError::BrokerNotRunning) until
/// then.
#[async_trait]
pub trait Broker: Send + Sync {
    // ========== Lifecycle ==========

    /// Provision `required_queues` and mark the broker running.
    ///
    /// Fails with `AlreadyRunning` if called twice.
    async fn start(&self, required_queues: &[String]) -> Result<()>;

    /// Stop one consumer per recorded listener on every known queue, forget
    /// the queues and mark the broker stopped. Stopping a stopped broker is a
    /// no-op.
    ///
    /// What happens to undelivered messages depends on the backend: the
    /// in-process broker purges its buffers, the durable broker leaves its
    /// broker-side queues and their messages in place for the next `start`.
    async fn stop(&self) -> Result<()>;

    /// Whether the broker is running.
    fn is_running(&self) -> bool;

    // ========== Queue Operations ==========

    /// Provision `name` (and its wait queues, where the backend has them).
    ///
    /// Idempotent: an existing queue keeps its messages and listeners.
    async fn create_queue(&self, name: &str) -> Result<()>;

    /// Enqueue `message` on `name`.
    ///
    /// Returns the broker's acceptance. Backends with publisher confirms block
    /// until the broker answers; others return a best-effort `true`.
    async fn publish(&self, name: &str, message: &Message) -> Result<bool>;

    /// Start one more consumer on `name` running `handler`.
    ///
    /// Returns as soon as the consumer is registered, without waiting for it
    /// to process anything. Fails with `Config` when `params` has a zero
    /// prefetch.
    async fn subscribe(
        &self,
        name: &str,
        handler: SharedHandler,
        params: SubscribeParams,
    ) -> Result<()>;

    /// Number of undelivered messages on `name`. Advisory only.
    async fn message_count(&self, name: &str) -> Result<usize>;

    /// Drop all undelivered messages on `name` and its wait queues.
    async fn purge_queue(&self, name: &str) -> Result<()>;

    /// Remove `name` and its wait queues, then send one `quit` sentinel per
    /// listener recorded at the moment of removal.
    async fn delete_queue(&self, name: &str) -> Result<()>;
}

/// A type-erased broker that can be shared across threads.
pub type DynBroker = Arc<dyn Broker>;

/// Wrapper around Arc<dyn Broker> for convenience.
#[derive(Clone)]
pub struct SharedBroker {
    inner: DynBroker,
}

impl SharedBroker {
    /// Create a new SharedBroker from any Broker implementation.
    pub fn new<B: Broker + 'static>(broker: B) -> Self {
        Self {
            inner: Arc::new(broker),
        }
    }

    /// Get a reference to the inner broker.
    pub fn inner(&self) -> &DynBroker {
        &self.inner
    }
}

#[async_trait]
impl Broker for SharedBroker {
    async fn start(&self, required_queues: &[String]) -> Result<()> {
        self.inner.start(required_queues).await
    }

    async fn stop(&self) -> Result<()> {
        self.inner.stop().await
    }

    fn is_running(&self) -> bool {
        self.inner.is_running()
    }

    async fn create_queue(&self, name: &str) -> Result<()> {
        self.inner.create_queue(name).await
    }

    async fn publish(&self, name: &str, message: &Message) -> Result<bool> {
        self.inner.publish(name, message).await
    }

    async fn subscribe(
        &self,
        name: &str,
        handler: SharedHandler,
        params: SubscribeParams,
    ) -> Result<()> {
        self.inner.subscribe(name, handler, params).await
    }

    async fn message_count(&self, name: &str) -> Result<usize> {
        self.inner.message_count(name).await
    }

    async fn purge_queue(&self, name: &str) -> Result<()> {
        self.inner.purge_queue(name).await
    }

    async fn delete_queue(&self, name: &str) -> Result<()> {
        self.inner.delete_queue(name).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subscribe_params_default_prefetch() {
        assert_eq!(SubscribeParams::default().prefetch, 1);
        assert_eq!(SubscribeParams::default().prefetch(8).prefetch, 8);
    }

    #[test]
    fn test_subscribe_params_rejects_zero_prefetch() {
        assert!(SubscribeParams::default().validate().is_ok());
        assert!(matches!(
            SubscribeParams::default().prefetch(0).validate(),
            Err(WaitqError::Config(_))
        ));
    }
}
