//! In-process backend for waitq.
//!
//! Every queue is a bounded FIFO buffer shared by publishers and consumers.
//! Intended for tests and single-node use.
//!
//! ## Differences from the durable backend
//!
//! - `publish` never waits for room. When the buffer is full the message is
//!   handed to a background task that stores it once a consumer frees a slot,
//!   and `publish` returns `true` before the message is actually queued. Use
//!   [`MemoryBroker::publish_wait`] to block the caller instead.
//! - There are no wait queues and no timers: a retried message goes straight
//!   back onto its origin queue with its `repeat_count` incremented. Backoff
//!   timing is not honored.
//! - `prefetch` is ignored; a consumer holds at most one message at a time.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use waitq_core::{Broker, BrokerConfig, Message};
//! use waitq_memory::MemoryBroker;
//!
//! #[tokio::main]
//! async fn main() -> waitq_core::Result<()> {
//!     let broker = MemoryBroker::new(BrokerConfig::default())?;
//!     broker.start(&["orders".to_string()]).await?;
//!     broker.publish("orders", &Message::new("charge")).await?;
//!     Ok(())
//! }
//! ```

use async_trait::async_trait;
use flume::{Receiver, Sender, TrySendError};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;
use waitq_core::{
    consumer_tag, join_consumers, Backoff, Broker, BrokerConfig, Consumer, DeliverySource,
    Dispatcher, Message, Received, Result, Retry, SharedHandler, StopReason, SubscribeParams,
    WaitqError,
};

/// A queue buffer and the consumers draining it.
struct QueueRecord {
    sender: Sender<Message>,
    receiver: Receiver<Message>,
    listeners: usize,
    consumers: Vec<JoinHandle<StopReason>>,
}

impl QueueRecord {
    fn new(capacity: usize) -> Self {
        let (sender, receiver) = flume::bounded(capacity);
        Self {
            sender,
            receiver,
            listeners: 0,
            consumers: Vec::new(),
        }
    }
}

/// In-process broker.
pub struct MemoryBroker {
    config: BrokerConfig,
    backoff: Backoff,
    running: AtomicBool,
    queues: Mutex<HashMap<String, QueueRecord>>,
}

impl MemoryBroker {
    /// Create a stopped broker.
    pub fn new(config: BrokerConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            backoff: config.backoff(),
            config,
            running: AtomicBool::new(false),
            queues: Mutex::new(HashMap::new()),
        })
    }

    /// Enqueue `message`, waiting in the caller for room in the buffer.
    ///
    /// Unlike [`Broker::publish`], the message is stored when this returns.
    pub async fn publish_wait(&self, name: &str, message: &Message) -> Result<bool> {
        self.ensure_running()?;
        let sender = self.sender(name)?;
        sender
            .send_async(message.clone())
            .await
            .map_err(|_| WaitqError::QueueNotFound(name.to_string()))?;
        Ok(true)
    }

    /// Delete `name` like [`Broker::delete_queue`], then wait up to `timeout`
    /// for its consumers to stop. Returns how each of them stopped.
    pub async fn delete_queue_and_wait(
        &self,
        name: &str,
        timeout: Duration,
    ) -> Result<Vec<StopReason>> {
        self.ensure_running()?;
        let consumers = self.remove_and_signal(name, false).await;
        Ok(join_consumers(consumers, timeout).await)
    }

    /// Number of active listeners on `name`, if the queue exists.
    pub fn listener_count(&self, name: &str) -> Option<usize> {
        self.lock().get(name).map(|record| record.listeners)
    }

    /// Names of all registered queues.
    pub fn queue_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.lock().keys().cloned().collect();
        names.sort();
        names
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, QueueRecord>> {
        self.queues.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn ensure_running(&self) -> Result<()> {
        if self.running.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(WaitqError::BrokerNotRunning)
        }
    }

    fn declare(&self, name: &str) {
        let capacity = self.config.queue_capacity;
        let mut queues = self.lock();
        if !queues.contains_key(name) {
            queues.insert(name.to_string(), QueueRecord::new(capacity));
            tracing::debug!(queue = %name, capacity, "Queue created");
        }
    }

    fn sender(&self, name: &str) -> Result<Sender<Message>> {
        self.lock()
            .get(name)
            .map(|record| record.sender.clone())
            .ok_or_else(|| WaitqError::QueueNotFound(name.to_string()))
    }

    fn receiver(&self, name: &str) -> Result<Receiver<Message>> {
        self.lock()
            .get(name)
            .map(|record| record.receiver.clone())
            .ok_or_else(|| WaitqError::QueueNotFound(name.to_string()))
    }

    /// Detach `name` from the table and queue one sentinel per listener
    /// recorded at removal. Returns the listeners' task handles.
    async fn remove_and_signal(&self, name: &str, purge: bool) -> Vec<JoinHandle<StopReason>> {
        let record = self.lock().remove(name);
        let Some(record) = record else {
            tracing::debug!(queue = %name, "Queue already deleted");
            return Vec::new();
        };

        if purge {
            let dropped = discard(&record.receiver);
            tracing::debug!(queue = %name, dropped, "Queue purged");
        }

        for _ in 0..record.listeners {
            if record.sender.send_async(Message::quit()).await.is_err() {
                tracing::warn!(
                    queue = %name,
                    "Queue closed before all listeners were signalled"
                );
                break;
            }
        }

        tracing::info!(queue = %name, listeners = record.listeners, "Queue deleted");
        record.consumers
    }
}

/// Drop everything stored in the buffer along with sends still waiting for
/// room, which receiving pulls in one by one.
fn discard(receiver: &Receiver<Message>) -> usize {
    let mut dropped = 0;
    while receiver.try_recv().is_ok() {
        dropped += 1;
    }
    dropped
}

/// Store `message` without blocking the caller.
///
/// When the buffer is full the send is moved onto a background task that
/// completes once a consumer frees a slot.
fn enqueue(sender: &Sender<Message>, message: Message, queue: &str) -> Result<()> {
    match sender.try_send(message) {
        Ok(()) => Ok(()),
        Err(TrySendError::Full(message)) => {
            tracing::debug!(queue = %queue, "Queue full, deferring enqueue");
            let sender = sender.clone();
            let queue = queue.to_string();
            tokio::spawn(async move {
                if sender.send_async(message).await.is_err() {
                    tracing::warn!(
                        queue = %queue,
                        "Queue deleted before deferred message was stored"
                    );
                }
            });
            Ok(())
        }
        Err(TrySendError::Disconnected(_)) => Err(WaitqError::QueueNotFound(queue.to_string())),
    }
}

/// Consumer side of an in-process queue.
struct MemoryInbox {
    queue: String,
    sender: Sender<Message>,
    receiver: Receiver<Message>,
}

#[async_trait]
impl DeliverySource for MemoryInbox {
    type Token = ();

    async fn receive(&mut self) -> Option<Received<()>> {
        self.receiver
            .recv_async()
            .await
            .ok()
            .map(|message| Received::Message((), message))
    }

    async fn ack(&mut self, _token: ()) -> Result<()> {
        Ok(())
    }

    async fn reject(&mut self, _token: ()) -> Result<()> {
        Ok(())
    }

    async fn requeue(&mut self, retry: &Retry) -> Result<()> {
        enqueue(&self.sender, retry.message.clone(), &self.queue)
    }

    async fn finish(&mut self, _token: ()) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn start(&self, required_queues: &[String]) -> Result<()> {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(WaitqError::AlreadyRunning);
        }

        for name in required_queues {
            self.declare(name);
        }

        tracing::info!(queues = required_queues.len(), "Memory broker started");
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        if !self.running.load(Ordering::SeqCst) {
            tracing::debug!("Memory broker already stopped");
            return Ok(());
        }

        let names: Vec<String> = self.lock().keys().cloned().collect();
        let mut consumers = Vec::new();
        for name in &names {
            consumers.extend(self.remove_and_signal(name, true).await);
        }

        self.running.store(false, Ordering::SeqCst);

        let total = consumers.len();
        let stopped = join_consumers(consumers, self.config.shutdown_timeout).await;
        tracing::info!(
            queues = names.len(),
            consumers = total,
            stopped = stopped.len(),
            "Memory broker stopped"
        );
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    async fn create_queue(&self, name: &str) -> Result<()> {
        self.ensure_running()?;
        self.declare(name);
        Ok(())
    }

    /// Returns `true` once the message is stored or handed to a background
    /// send; see the crate docs.
    async fn publish(&self, name: &str, message: &Message) -> Result<bool> {
        self.ensure_running()?;
        let sender = self.sender(name)?;
        enqueue(&sender, message.clone(), name)?;
        Ok(true)
    }

    async fn subscribe(
        &self,
        name: &str,
        handler: SharedHandler,
        params: SubscribeParams,
    ) -> Result<()> {
        self.ensure_running()?;
        // Checked for parity with the durable broker; the value is unused here.
        params.validate()?;

        let mut queues = self.lock();
        let record = queues
            .get_mut(name)
            .ok_or_else(|| WaitqError::QueueNotFound(name.to_string()))?;

        let inbox = MemoryInbox {
            queue: name.to_string(),
            sender: record.sender.clone(),
            receiver: record.receiver.clone(),
        };
        let consumer = Consumer::new(
            consumer_tag(name),
            Dispatcher::new(name, handler, self.backoff),
            inbox,
        );

        // Registered under the table lock, so a concurrent delete either sees
        // this listener or makes the lookup above fail.
        record.consumers.push(tokio::spawn(consumer.run()));
        record.listeners += 1;

        tracing::info!(queue = %name, listeners = record.listeners, "Subscribed");
        Ok(())
    }

    async fn message_count(&self, name: &str) -> Result<usize> {
        self.ensure_running()?;
        Ok(self.sender(name)?.len())
    }

    async fn purge_queue(&self, name: &str) -> Result<()> {
        self.ensure_running()?;
        let dropped = discard(&self.receiver(name)?);
        tracing::debug!(queue = %name, dropped, "Queue purged");
        Ok(())
    }

    async fn delete_queue(&self, name: &str) -> Result<()> {
        self.ensure_running()?;
        // Consumers stop on their own once they reach their sentinel.
        drop(self.remove_and_signal(name, false).await);
        Ok(())
    }
}
