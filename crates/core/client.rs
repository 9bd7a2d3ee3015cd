//! Client for publishing messages.

use serde::Serialize;
use serde_json::Value;

use crate::broker::{Broker, SharedBroker};
use crate::error::{Result, WaitqError};
use crate::message::Message;

/// Publishing front end over any broker.
#[derive(Clone)]
pub struct Client<B: Broker + Clone = SharedBroker> {
    broker: B,
}

impl Client<SharedBroker> {
    /// Create a new client with a shared broker.
    pub fn new(broker: impl Broker + 'static) -> Self {
        Self {
            broker: SharedBroker::new(broker),
        }
    }
}

impl<B: Broker + Clone> Client<B> {
    /// Create a new client with a specific broker.
    pub fn with_broker(broker: B) -> Self {
        Self { broker }
    }

    /// Get the underlying broker.
    pub fn broker(&self) -> &B {
        &self.broker
    }

    /// Publish a pre-built message.
    pub async fn publish(&self, queue: &str, message: &Message) -> Result<bool> {
        let accepted = self.broker.publish(queue, message).await?;
        if accepted {
            tracing::debug!(queue = %queue, action = %message.action, "Message published");
        } else {
            tracing::warn!(queue = %queue, action = %message.action, "Publish not confirmed");
        }
        Ok(accepted)
    }

    /// Publish `action` with the fields of `payload`.
    ///
    /// `payload` must serialize to a JSON object (or unit, for no fields).
    /// An `action` or `repeat_count` field in it is ignored.
    pub async fn publish_action<T>(&self, queue: &str, action: &str, payload: T) -> Result<bool>
    where
        T: Serialize,
    {
        let message = build_message(action, payload)?;
        self.publish(queue, &message).await
    }

    /// Get the number of undelivered messages on `queue`.
    pub async fn message_count(&self, queue: &str) -> Result<usize> {
        self.broker.message_count(queue).await
    }
}

/// Build a message from an action and a serializable payload.
pub fn build_message<T: Serialize>(action: &str, payload: T) -> Result<Message> {
    let mut message = Message::new(action);
    match serde_json::to_value(payload)? {
        Value::Object(mut fields) => {
            fields.remove("action");
            fields.remove("repeat_count");
            message.payload = fields;
        }
        Value::Null => {}
        other => {
            return Err(WaitqError::InvalidPayload(format!(
                "expected a JSON object, got {}",
                other
            )))
        }
    }
    Ok(message)
}
