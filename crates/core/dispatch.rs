//! Consumer dispatch loop.
//!
//! Each subscription runs one [`Consumer`]. It waits for a delivery, hands the
//! message to the handler and settles the delivery according to the response:
//!
//! - `ok`: acknowledge.
//! - `retry`: bump `repeat_count` and hand the copy to the backend for
//!   redelivery through the tier's wait queue, then acknowledge the original.
//!   Past `max_retries` the message is dropped (still acknowledged).
//! - `fail`: reject without requeue.
//!
//! The `quit` sentinel stops the consumer without reaching the handler.
//! Backends plug in through [`DeliverySource`].

use async_trait::async_trait;
use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::time::Duration;
use tokio::task::JoinHandle;

use crate::backoff::{wait_queue_name, Backoff};
use crate::error::Result;
use crate::handler::SharedHandler;
use crate::message::{HandlerResponse, Message, Status};

/// A retried copy of a message and where it has to wait.
#[derive(Debug, Clone, PartialEq)]
pub struct Retry {
    /// The message with `repeat_count` already incremented.
    pub message: Message,
    /// Retry tier, equal to the new `repeat_count`.
    pub tier: u32,
    /// Queue the message was consumed from.
    pub queue: String,
    /// Wait queue of this tier.
    pub wait_queue: String,
    /// Time to spend in the wait queue.
    pub ttl: Duration,
}

/// What a consumer did with one delivery.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// Quit sentinel received; the consumer stops.
    Stopped,
    /// Handler reported `ok`.
    Acked,
    /// Handler asked for a retry within budget.
    Requeued(Retry),
    /// Handler asked for a retry but the budget is spent; dropped.
    Exhausted {
        /// Retries already made when the budget ran out.
        repeat_count: u32,
    },
    /// Handler reported `fail`; dropped without retry.
    Rejected,
    /// Payload could not be decoded; dropped.
    Malformed,
}

/// Why a consumer loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// Observed its `quit` sentinel.
    Quit,
    /// The delivery source closed under it.
    Closed,
}

/// A delivery pulled from a source.
#[derive(Debug)]
pub enum Received<T> {
    /// A decoded message and the token used to settle it.
    Message(T, Message),
    /// A payload that is not a valid message.
    Malformed(T, String),
}

/// Backend side of a consumer: where deliveries come from and how they are
/// settled.
#[async_trait]
pub trait DeliverySource: Send {
    /// Handle used to acknowledge or reject one delivery.
    type Token: Send;

    /// Wait for the next delivery. `None` once the source is closed.
    async fn receive(&mut self) -> Option<Received<Self::Token>>;

    /// Mark the delivery as processed.
    async fn ack(&mut self, token: Self::Token) -> Result<()>;

    /// Drop the delivery without requeueing it.
    async fn reject(&mut self, token: Self::Token) -> Result<()>;

    /// Arrange for `retry.message` to be delivered again.
    async fn requeue(&mut self, retry: &Retry) -> Result<()>;

    /// Settle the quit sentinel and release the subscription.
    async fn finish(&mut self, token: Self::Token) -> Result<()>;
}

/// Handler invocation and the retry decision, independent of any backend.
#[derive(Clone)]
pub struct Dispatcher {
    queue: String,
    handler: SharedHandler,
    backoff: Backoff,
}

impl Dispatcher {
    pub fn new(queue: impl Into<String>, handler: SharedHandler, backoff: Backoff) -> Self {
        Self {
            queue: queue.into(),
            handler,
            backoff,
        }
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Run the handler. Errors and panics become `retry` responses carrying
    /// the error text.
    pub async fn invoke(&self, message: Message) -> HandlerResponse {
        match AssertUnwindSafe(self.handler.handle(message))
            .catch_unwind()
            .await
        {
            Ok(Ok(response)) => response,
            Ok(Err(err)) => HandlerResponse::retry(err.to_string()),
            Err(panic) => HandlerResponse::retry(format!(
                "handler panicked: {}",
                panic_message(panic.as_ref())
            )),
        }
    }

    /// Decide what to do with `message` given the handler's `response`.
    pub fn decide(&self, message: &Message, response: &HandlerResponse) -> Outcome {
        match response.status {
            Status::Ok => Outcome::Acked,
            Status::Fail => Outcome::Rejected,
            Status::Retry => match self.backoff.next_tier(message.repeat_count) {
                Some(tier) => Outcome::Requeued(Retry {
                    message: message.for_tier(tier),
                    tier,
                    queue: self.queue.clone(),
                    wait_queue: wait_queue_name(&self.queue, tier),
                    ttl: self.backoff.wait_queue_ttl(tier),
                }),
                None => Outcome::Exhausted {
                    repeat_count: message.repeat_count,
                },
            },
        }
    }

    /// Invoke the handler (unless `message` is the quit sentinel) and decide.
    pub async fn dispatch(&self, message: Message) -> Outcome {
        if message.is_quit() {
            return Outcome::Stopped;
        }
        let response = self.invoke(message.clone()).await;
        if let Some(note) = &response.message {
            tracing::debug!(
                queue = %self.queue,
                status = ?response.status,
                note = %note,
                "Handler responded"
            );
        }
        self.decide(&message, &response)
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// A single subscription's worker.
pub struct Consumer<S: DeliverySource> {
    tag: String,
    dispatcher: Dispatcher,
    source: S,
}

impl<S: DeliverySource> Consumer<S> {
    pub fn new(tag: impl Into<String>, dispatcher: Dispatcher, source: S) -> Self {
        Self {
            tag: tag.into(),
            dispatcher,
            source,
        }
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    /// Run until the quit sentinel arrives or the source closes.
    pub async fn run(mut self) -> StopReason {
        tracing::debug!(
            queue = %self.dispatcher.queue(),
            consumer = %self.tag,
            "Consumer started"
        );

        let reason = loop {
            match self.process_next().await {
                Some(Outcome::Stopped) => break StopReason::Quit,
                Some(_) => {}
                None => break StopReason::Closed,
            }
        };

        tracing::debug!(
            queue = %self.dispatcher.queue(),
            consumer = %self.tag,
            reason = ?reason,
            "Consumer stopped"
        );
        reason
    }

    /// Wait for one delivery and settle it. `None` when the source is closed.
    pub async fn process_next(&mut self) -> Option<Outcome> {
        let (token, message) = match self.source.receive().await? {
            Received::Message(token, message) => (token, message),
            Received::Malformed(token, error) => {
                tracing::error!(
                    queue = %self.dispatcher.queue(),
                    consumer = %self.tag,
                    error = %error,
                    "Failed to decode message, rejecting"
                );
                let settled = self.source.reject(token).await;
                self.log_settlement(settled);
                return Some(Outcome::Malformed);
            }
        };

        let repeat_count = message.repeat_count;
        let outcome = self.dispatcher.dispatch(message).await;

        let settled = match &outcome {
            Outcome::Stopped => self.source.finish(token).await,
            Outcome::Acked => {
                tracing::debug!(
                    queue = %self.dispatcher.queue(),
                    consumer = %self.tag,
                    repeat_count,
                    "Message processed"
                );
                self.source.ack(token).await
            }
            Outcome::Requeued(retry) => {
                match self.source.requeue(retry).await {
                    Ok(()) => tracing::debug!(
                        queue = %self.dispatcher.queue(),
                        consumer = %self.tag,
                        tier = retry.tier,
                        wait_queue = %retry.wait_queue,
                        ttl_ms = retry.ttl.as_millis() as u64,
                        "Message scheduled for retry"
                    ),
                    Err(e) => tracing::error!(
                        queue = %self.dispatcher.queue(),
                        consumer = %self.tag,
                        tier = retry.tier,
                        error = %e,
                        "Failed to requeue message"
                    ),
                }
                // The original is never redelivered in place.
                self.source.ack(token).await
            }
            Outcome::Exhausted { repeat_count } => {
                tracing::warn!(
                    queue = %self.dispatcher.queue(),
                    consumer = %self.tag,
                    repeat_count = *repeat_count,
                    "Retries exhausted, dropping message"
                );
                self.source.ack(token).await
            }
            Outcome::Rejected => {
                tracing::warn!(
                    queue = %self.dispatcher.queue(),
                    consumer = %self.tag,
                    repeat_count,
                    "Handler rejected message, dropping"
                );
                self.source.reject(token).await
            }
            Outcome::Malformed => Ok(()),
        };
        self.log_settlement(settled);

        Some(outcome)
    }

    fn log_settlement(&self, result: Result<()>) {
        if let Err(e) = result {
            tracing::error!(
                queue = %self.dispatcher.queue(),
                consumer = %self.tag,
                error = %e,
                "Failed to settle delivery"
            );
        }
    }
}

/// Generate a unique consumer tag for `queue`.
pub fn consumer_tag(queue: &str) -> String {
    let host = hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "unknown".to_string());
    let pid = std::process::id();
    format!("{}-{}-{}-{}", queue, host, pid, uuid::Uuid::new_v4().simple())
}

/// Wait for consumer tasks to stop, up to `timeout` overall.
///
/// Returns the stop reasons of the consumers that finished in time. Tasks
/// still running at the deadline are left detached; nothing is aborted.
pub async fn join_consumers(
    handles: Vec<JoinHandle<StopReason>>,
    timeout: Duration,
) -> Vec<StopReason> {
    let deadline = tokio::time::Instant::now() + timeout;
    let total = handles.len();
    let mut reasons = Vec::with_capacity(total);

    for handle in handles {
        match tokio::time::timeout_at(deadline, handle).await {
            Ok(Ok(reason)) => reasons.push(reason),
            Ok(Err(e)) => tracing::error!(error = %e, "Consumer task panicked"),
            Err(_) => {
                tracing::warn!(
                    stopped = reasons.len(),
                    total,
                    "Shutdown timeout reached, leaving remaining consumers running"
                );
                break;
            }
        }
    }

    reasons
}
