//! AMQP backend for waitq.
//!
//! Queues live on an AMQP 0-9-1 broker (RabbitMQ) and survive restarts. Every
//! queue `q` gets one wait queue per retry tier, `q_wait_1..=q_wait_N`. A wait
//! queue has no consumers: its messages expire after the tier's TTL and are
//! dead-lettered back onto `q` through the default exchange.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use waitq_amqp::AmqpBroker;
//! use waitq_core::{Broker, BrokerConfig, Message};
//!
//! #[tokio::main]
//! async fn main() -> waitq_core::Result<()> {
//!     let broker = AmqpBroker::new(BrokerConfig::from_env()?)?;
//!     broker.start(&["orders".to_string()]).await?;
//!     broker.publish("orders", &Message::new("charge")).await?;
//!     broker.stop().await
//! }
//! ```

use async_trait::async_trait;
use futures::StreamExt;
use lapin::acker::Acker;
use lapin::options::{
    BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions,
    BasicPublishOptions, BasicQosOptions, ConfirmSelectOptions, QueueDeclareOptions,
    QueueDeleteOptions, QueuePurgeOptions,
};
use lapin::types::{AMQPValue, FieldTable, LongString};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use waitq_core::{
    consumer_tag, join_consumers, Backoff, Broker, BrokerConfig, Consumer, DeliverySource,
    Dispatcher, Message, Received, Result, Retry, SharedHandler, StopReason, SubscribeParams,
    WaitqError,
};

/// Content type stamped on every published message.
pub const CONTENT_TYPE: &str = "application/json";

/// AMQP delivery mode for persistent messages.
const PERSISTENT: u8 = 2;

/// Reply code for a normal channel or connection close.
const REPLY_SUCCESS: u16 = 200;

fn backend_error(e: lapin::Error) -> WaitqError {
    WaitqError::Backend(e.to_string())
}

/// Names and arguments of the queues backing one logical queue.
#[derive(Debug, Clone)]
pub struct QueueTopology {
    queue: String,
    backoff: Backoff,
}

impl QueueTopology {
    /// Create the topology of `queue` under `backoff`.
    pub fn new(queue: impl Into<String>, backoff: Backoff) -> Self {
        Self {
            queue: queue.into(),
            backoff,
        }
    }

    /// The main queue.
    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Wait queue names, tier 1 first.
    pub fn wait_queues(&self) -> Vec<String> {
        self.backoff.wait_queues(&self.queue)
    }

    /// Declare arguments of the tier `tier` wait queue: expire after the
    /// tier's TTL and dead-letter back onto the main queue.
    pub fn wait_queue_args(&self, tier: u32) -> FieldTable {
        let ttl = self.backoff.wait_queue_ttl(tier).as_millis();
        let mut args = FieldTable::default();
        args.insert(
            "x-dead-letter-exchange".into(),
            AMQPValue::LongString(LongString::from("")),
        );
        args.insert(
            "x-dead-letter-routing-key".into(),
            AMQPValue::LongString(LongString::from(self.queue.as_str())),
        );
        args.insert(
            "x-message-ttl".into(),
            AMQPValue::LongLongInt(i64::try_from(ttl).unwrap_or(i64::MAX)),
        );
        args
    }

    /// Every queue name, main queue first.
    pub fn all(&self) -> Vec<String> {
        let mut names = vec![self.queue.clone()];
        names.extend(self.wait_queues());
        names
    }
}

fn durable() -> QueueDeclareOptions {
    QueueDeclareOptions {
        durable: true,
        exclusive: false,
        auto_delete: false,
        ..QueueDeclareOptions::default()
    }
}

/// Publish `message` persistently to `queue` through the default exchange
/// and wait for the broker's confirm.
async fn publish_confirmed(channel: &Channel, queue: &str, message: &Message) -> Result<bool> {
    let payload = message.to_bytes()?;
    let properties = BasicProperties::default()
        .with_delivery_mode(PERSISTENT)
        .with_content_type(CONTENT_TYPE.into());
    let confirmation = channel
        .basic_publish(
            "",
            queue,
            BasicPublishOptions::default(),
            &payload,
            properties,
        )
        .await
        .map_err(backend_error)?
        .await
        .map_err(backend_error)?;
    Ok(confirmation.is_ack())
}

async fn close_quietly(channel: &Channel) {
    if let Err(e) = channel.close(REPLY_SUCCESS, "OK").await {
        tracing::debug!(error = %e, "Channel already closed");
    }
}

/// An open connection and its publisher-confirm channel.
struct Session {
    connection: Connection,
    publisher: Channel,
}

impl Session {
    async fn open_channel(&self) -> Result<Channel> {
        self.connection
            .create_channel()
            .await
            .map_err(backend_error)
    }
}

/// Consumers started on one queue by this broker.
#[derive(Default)]
struct QueueRecord {
    listeners: usize,
    consumers: Vec<JoinHandle<StopReason>>,
}

/// Durable broker over an AMQP connection.
pub struct AmqpBroker {
    config: BrokerConfig,
    backoff: Backoff,
    running: AtomicBool,
    session: Mutex<Option<Arc<Session>>>,
    queues: tokio::sync::Mutex<HashMap<String, QueueRecord>>,
}

impl AmqpBroker {
    /// Create a stopped broker. No connection is made until `start`.
    pub fn new(config: BrokerConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            backoff: config.backoff(),
            config,
            running: AtomicBool::new(false),
            session: Mutex::new(None),
            queues: tokio::sync::Mutex::new(HashMap::new()),
        })
    }

    /// Topology of `name` under this broker's backoff.
    pub fn topology(&self, name: &str) -> QueueTopology {
        QueueTopology::new(name, self.backoff)
    }

    /// Number of consumers this broker runs on `name`, if it knows the queue.
    pub async fn listener_count(&self, name: &str) -> Option<usize> {
        self.queues.lock().await.get(name).map(|record| record.listeners)
    }

    fn session(&self) -> Result<Arc<Session>> {
        if !self.running.load(Ordering::SeqCst) {
            return Err(WaitqError::BrokerNotRunning);
        }
        self.session
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or(WaitqError::BrokerNotRunning)
    }

    async fn connect(&self) -> Result<Arc<Session>> {
        let properties = ConnectionProperties::default();
        let connection = Connection::connect(&self.config.amqp_url, properties)
            .await
            .map_err(backend_error)?;
        let publisher = connection.create_channel().await.map_err(backend_error)?;
        publisher
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(backend_error)?;
        Ok(Arc::new(Session {
            connection,
            publisher,
        }))
    }

    async fn disconnect(session: &Session) {
        close_quietly(&session.publisher).await;
        if let Err(e) = session.connection.close(REPLY_SUCCESS, "OK").await {
            tracing::warn!(error = %e, "Failed to close AMQP connection");
        }
    }

    /// Declare `name` and its wait queues, each on a short-lived channel.
    async fn declare(&self, session: &Session, name: &str) -> Result<()> {
        let topology = self.topology(name);
        let channel = session.open_channel().await?;
        let result = declare_topology(&channel, &topology).await;
        close_quietly(&channel).await;
        result?;

        self.queues.lock().await.entry(name.to_string()).or_default();
        tracing::debug!(
            queue = %name,
            wait_queues = topology.wait_queues().len(),
            "Queue declared"
        );
        Ok(())
    }

    /// Send one quit sentinel per listener of `record` and wait for them.
    async fn signal_and_join(
        &self,
        session: &Session,
        name: &str,
        record: QueueRecord,
    ) -> Vec<StopReason> {
        for _ in 0..record.listeners {
            match publish_confirmed(&session.publisher, name, &Message::quit()).await {
                Ok(true) => {}
                Ok(false) => tracing::warn!(queue = %name, "Quit sentinel not confirmed"),
                Err(e) => {
                    tracing::warn!(queue = %name, error = %e, "Failed to publish quit sentinel");
                    break;
                }
            }
        }
        join_consumers(record.consumers, self.config.shutdown_timeout).await
    }
}

async fn declare_topology(channel: &Channel, topology: &QueueTopology) -> Result<()> {
    channel
        .queue_declare(topology.queue(), durable(), FieldTable::default())
        .await
        .map_err(backend_error)?;
    for (tier, wait_queue) in (1..).zip(topology.wait_queues()) {
        channel
            .queue_declare(&wait_queue, durable(), topology.wait_queue_args(tier))
            .await
            .map_err(backend_error)?;
    }
    Ok(())
}

/// Apply `prefetch` to `channel` and start consuming `queue` on it. The
/// channel is closed when either step fails.
async fn start_consuming(
    channel: &Channel,
    queue: &str,
    tag: &str,
    prefetch: u16,
) -> Result<lapin::Consumer> {
    let consuming = async {
        channel.basic_qos(prefetch, BasicQosOptions::default()).await?;
        let deliveries = channel
            .basic_consume(
                queue,
                tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await?;
        Ok::<_, lapin::Error>(deliveries)
    };
    match consuming.await {
        Ok(deliveries) => Ok(deliveries),
        Err(e) => {
            close_quietly(channel).await;
            Err(backend_error(e))
        }
    }
}

/// Consumer side of an AMQP queue.
struct AmqpInbox {
    queue: String,
    tag: String,
    channel: Channel,
    publisher: Channel,
    deliveries: lapin::Consumer,
}

#[async_trait]
impl DeliverySource for AmqpInbox {
    type Token = Acker;

    async fn receive(&mut self) -> Option<Received<Acker>> {
        match self.deliveries.next().await? {
            Ok(delivery) => Some(match Message::from_bytes(&delivery.data) {
                Ok(message) => Received::Message(delivery.acker, message),
                Err(e) => Received::Malformed(delivery.acker, e.to_string()),
            }),
            Err(e) => {
                tracing::warn!(
                    queue = %self.queue,
                    consumer = %self.tag,
                    error = %e,
                    "Delivery stream failed"
                );
                None
            }
        }
    }

    async fn ack(&mut self, acker: Acker) -> Result<()> {
        acker
            .ack(BasicAckOptions::default())
            .await
            .map_err(backend_error)
    }

    async fn reject(&mut self, acker: Acker) -> Result<()> {
        acker
            .nack(BasicNackOptions {
                requeue: false,
                ..BasicNackOptions::default()
            })
            .await
            .map_err(backend_error)
    }

    async fn requeue(&mut self, retry: &Retry) -> Result<()> {
        if publish_confirmed(&self.publisher, &retry.wait_queue, &retry.message).await? {
            Ok(())
        } else {
            Err(WaitqError::Backend(format!(
                "publish to {} not confirmed",
                retry.wait_queue
            )))
        }
    }

    async fn finish(&mut self, acker: Acker) -> Result<()> {
        let cancelled = self
            .channel
            .basic_cancel(&self.tag, BasicCancelOptions::default())
            .await
            .map_err(backend_error);
        if let Err(e) = &cancelled {
            tracing::warn!(
                queue = %self.queue,
                consumer = %self.tag,
                error = %e,
                "Failed to cancel consumer"
            );
        }
        let acked = self.ack(acker).await;
        // Prefetched deliveries still unacked go back to the queue here.
        close_quietly(&self.channel).await;
        cancelled.and(acked)
    }
}

#[async_trait]
impl Broker for AmqpBroker {
    async fn start(&self, required_queues: &[String]) -> Result<()> {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(WaitqError::AlreadyRunning);
        }

        let session = match self.connect().await {
            Ok(session) => session,
            Err(e) => {
                self.running.store(false, Ordering::SeqCst);
                return Err(e);
            }
        };

        for name in required_queues {
            if let Err(e) = self.declare(&session, name).await {
                tracing::error!(queue = %name, error = %e, "Failed to provision queue");
                Self::disconnect(&session).await;
                self.queues.lock().await.clear();
                self.running.store(false, Ordering::SeqCst);
                return Err(e);
            }
        }

        *self.session.lock().unwrap_or_else(|e| e.into_inner()) = Some(session);
        tracing::info!(
            url = %self.config.amqp_url,
            queues = required_queues.len(),
            "AMQP broker started"
        );
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        let session = match self.session() {
            Ok(session) => session,
            Err(_) => {
                tracing::debug!("AMQP broker already stopped");
                return Ok(());
            }
        };
        if self
            .running
            .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Ok(());
        }

        let records: Vec<(String, QueueRecord)> = self.queues.lock().await.drain().collect();
        let queues = records.len();
        let mut stopped = 0;
        for (name, record) in records {
            stopped += self.signal_and_join(&session, &name, record).await.len();
        }

        self.session.lock().unwrap_or_else(|e| e.into_inner()).take();
        Self::disconnect(&session).await;
        tracing::info!(queues, consumers_stopped = stopped, "AMQP broker stopped");
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    async fn create_queue(&self, name: &str) -> Result<()> {
        let session = self.session()?;
        self.declare(&session, name).await
    }

    async fn publish(&self, name: &str, message: &Message) -> Result<bool> {
        let session = self.session()?;
        publish_confirmed(&session.publisher, name, message).await
    }

    async fn subscribe(
        &self,
        name: &str,
        handler: SharedHandler,
        params: SubscribeParams,
    ) -> Result<()> {
        params.validate()?;
        let session = self.session()?;

        let mut queues = self.queues.lock().await;
        let record = queues
            .get_mut(name)
            .ok_or_else(|| WaitqError::QueueNotFound(name.to_string()))?;

        let channel = session.open_channel().await?;
        let tag = consumer_tag(name);
        let deliveries = start_consuming(&channel, name, &tag, params.prefetch).await?;

        let inbox = AmqpInbox {
            queue: name.to_string(),
            tag: tag.clone(),
            channel,
            publisher: session.publisher.clone(),
            deliveries,
        };
        let consumer = Consumer::new(
            tag.clone(),
            Dispatcher::new(name, handler, self.backoff),
            inbox,
        );

        record.consumers.push(tokio::spawn(consumer.run()));
        record.listeners += 1;
        tracing::info!(
            queue = %name,
            consumer = %tag,
            prefetch = params.prefetch,
            listeners = record.listeners,
            "Subscribed"
        );
        Ok(())
    }

    async fn message_count(&self, name: &str) -> Result<usize> {
        let session = self.session()?;
        let channel = session.open_channel().await?;
        let declared = channel
            .queue_declare(
                name,
                QueueDeclareOptions {
                    passive: true,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await;
        close_quietly(&channel).await;
        let queue = declared.map_err(|_| WaitqError::QueueNotFound(name.to_string()))?;
        Ok(queue.message_count() as usize)
    }

    async fn purge_queue(&self, name: &str) -> Result<()> {
        let session = self.session()?;
        let channel = session.open_channel().await?;
        let mut dropped = 0;
        let mut result = Ok(());
        for queue in self.topology(name).all() {
            match channel.queue_purge(&queue, QueuePurgeOptions::default()).await {
                Ok(count) => dropped += count,
                Err(e) => {
                    result = Err(backend_error(e));
                    break;
                }
            }
        }
        close_quietly(&channel).await;
        result?;
        tracing::debug!(queue = %name, dropped, "Queue purged");
        Ok(())
    }

    async fn delete_queue(&self, name: &str) -> Result<()> {
        let session = self.session()?;

        let record = self.queues.lock().await.remove(name).unwrap_or_default();
        let listeners = record.listeners;
        let stopped = self.signal_and_join(&session, name, record).await;

        let channel = session.open_channel().await?;
        let mut result = Ok(());
        for queue in self.topology(name).all() {
            if let Err(e) = channel.queue_delete(&queue, QueueDeleteOptions::default()).await {
                result = Err(backend_error(e));
                break;
            }
        }
        close_quietly(&channel).await;
        result?;

        tracing::info!(queue = %name, listeners, stopped = stopped.len(), "Queue deleted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lapin::types::ShortString;
    use std::time::Duration;

    fn ttl_of(args: &FieldTable) -> Option<&AMQPValue> {
        args.inner().get(&ShortString::from("x-message-ttl"))
    }

    #[test]
    fn test_topology_names() {
        let topology = QueueTopology::new("orders", Backoff::new(Duration::from_millis(100), 3));
        assert_eq!(topology.queue(), "orders");
        assert_eq!(
            topology.wait_queues(),
            vec!["orders_wait_1", "orders_wait_2", "orders_wait_3"]
        );
        assert_eq!(topology.all().len(), 4);
        assert_eq!(topology.all()[0], "orders");
    }

    #[test]
    fn test_wait_queue_args_dead_letter_to_main_queue() {
        let topology = QueueTopology::new("orders", Backoff::new(Duration::from_millis(100), 3));
        let args = topology.wait_queue_args(2);
        let inner = args.inner();
        assert_eq!(
            inner.get(&ShortString::from("x-dead-letter-exchange")),
            Some(&AMQPValue::LongString(LongString::from("")))
        );
        assert_eq!(
            inner.get(&ShortString::from("x-dead-letter-routing-key")),
            Some(&AMQPValue::LongString(LongString::from("orders")))
        );
        assert_eq!(inner.len(), 3);
    }

    #[test]
    fn test_wait_queue_ttl_grows_per_tier() {
        let topology = QueueTopology::new("orders", Backoff::new(Duration::from_millis(100), 3));
        assert_eq!(
            ttl_of(&topology.wait_queue_args(1)),
            Some(&AMQPValue::LongLongInt(100))
        );
        assert_eq!(
            ttl_of(&topology.wait_queue_args(2)),
            Some(&AMQPValue::LongLongInt(400))
        );
        assert_eq!(
            ttl_of(&topology.wait_queue_args(3)),
            Some(&AMQPValue::LongLongInt(1600))
        );
    }

    #[test]
    fn test_no_wait_queues_without_retries() {
        let topology = QueueTopology::new("orders", Backoff::new(Duration::from_millis(100), 0));
        assert!(topology.wait_queues().is_empty());
        assert_eq!(topology.all(), vec!["orders"]);
    }

    #[test]
    fn test_rejects_zero_capacity() {
        let config = BrokerConfig::builder().queue_capacity(0).build();
        assert!(matches!(AmqpBroker::new(config), Err(WaitqError::Config(_))));
    }

    #[tokio::test]
    async fn test_operations_fail_while_stopped() {
        let broker = AmqpBroker::new(BrokerConfig::default()).unwrap();
        assert!(!broker.is_running());
        assert!(matches!(
            broker.publish("orders", &Message::new("charge")).await,
            Err(WaitqError::BrokerNotRunning)
        ));
        assert!(matches!(
            broker.create_queue("orders").await,
            Err(WaitqError::BrokerNotRunning)
        ));
        assert!(matches!(
            broker.message_count("orders").await,
            Err(WaitqError::BrokerNotRunning)
        ));
        assert!(matches!(
            broker.delete_queue("orders").await,
            Err(WaitqError::BrokerNotRunning)
        ));
        let handler = waitq_core::handler::shared(|_msg: Message| async {
            Ok::<_, waitq_core::HandlerError>(waitq_core::HandlerResponse::ok())
        });
        assert!(matches!(
            broker
                .subscribe("orders", handler, SubscribeParams::default())
                .await,
            Err(WaitqError::BrokerNotRunning)
        ));
        // Stopping a stopped broker is a no-op.
        broker.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_subscribe_rejects_zero_prefetch() {
        let broker = AmqpBroker::new(BrokerConfig::default()).unwrap();
        let handler = waitq_core::handler::shared(|_msg: Message| async {
            Ok::<_, waitq_core::HandlerError>(waitq_core::HandlerResponse::ok())
        });
        assert!(matches!(
            broker
                .subscribe("orders", handler, SubscribeParams::default().prefetch(0))
                .await,
            Err(WaitqError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_start_fails_without_server() {
        let config = BrokerConfig::builder()
            .amqp_url("amqp://127.0.0.1:1/%2f")
            .build();
        let broker = AmqpBroker::new(config).unwrap();
        assert!(matches!(
            broker.start(&["orders".to_string()]).await,
            Err(WaitqError::Backend(_))
        ));
        assert!(!broker.is_running());
    }
}

#[cfg(test)]
mod integration_tests {
    use super::*;
    use std::sync::Mutex as StdMutex;
    use std::time::{Duration, SystemTime, UNIX_EPOCH};
    use waitq_core::handler::shared;
    use waitq_core::{HandlerError, HandlerResponse};

    fn amqp_url() -> String {
        std::env::var("AMQP_URL").unwrap_or_else(|_| "amqp://127.0.0.1:5672/%2f".to_string())
    }

    fn test_queue() -> String {
        let ts = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        format!("waitq_test_{}", ts)
    }

    fn config() -> BrokerConfig {
        BrokerConfig::builder()
            .amqp_url(amqp_url())
            .ttl_base(Duration::from_millis(100))
            .max_retries(3)
            .shutdown_timeout(Duration::from_secs(5))
            .build()
    }

    async fn started(queue: &str) -> AmqpBroker {
        let broker = AmqpBroker::new(config()).unwrap();
        broker.start(&[queue.to_string()]).await.unwrap();
        broker
    }

    async fn wait_for_len(seen: &Arc<StdMutex<Vec<u32>>>, len: usize, within: Duration) {
        let deadline = tokio::time::Instant::now() + within;
        while seen.lock().unwrap().len() < len && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    #[tokio::test]
    #[ignore = "requires running RabbitMQ server"]
    async fn test_start_declares_wait_queues() {
        let queue = test_queue();
        let broker = started(&queue).await;

        for wait_queue in broker.topology(&queue).wait_queues() {
            assert_eq!(broker.message_count(&wait_queue).await.unwrap(), 0);
        }
        assert_eq!(broker.listener_count(&queue).await, Some(0));

        broker.delete_queue(&queue).await.unwrap();
        broker.stop().await.unwrap();
    }

    #[tokio::test]
    #[ignore = "requires running RabbitMQ server"]
    async fn test_publish_confirmed_and_counted() {
        let queue = test_queue();
        let broker = started(&queue).await;

        assert!(broker.publish(&queue, &Message::new("charge")).await.unwrap());
        assert!(broker.publish(&queue, &Message::new("charge")).await.unwrap());
        assert_eq!(broker.message_count(&queue).await.unwrap(), 2);

        broker.purge_queue(&queue).await.unwrap();
        assert_eq!(broker.message_count(&queue).await.unwrap(), 0);

        broker.delete_queue(&queue).await.unwrap();
        broker.stop().await.unwrap();
    }

    #[tokio::test]
    #[ignore = "requires running RabbitMQ server"]
    async fn test_retry_through_wait_queues_then_ok() {
        let queue = test_queue();
        let broker = started(&queue).await;

        let seen = Arc::new(StdMutex::new(Vec::new()));
        let log = seen.clone();
        let handler = shared(move |msg: Message| {
            let log = log.clone();
            async move {
                log.lock().unwrap().push(msg.repeat_count);
                if msg.repeat_count < 3 {
                    Ok::<_, HandlerError>(HandlerResponse::retry("gateway timeout"))
                } else {
                    Ok(HandlerResponse::ok())
                }
            }
        });
        broker
            .subscribe(&queue, handler, SubscribeParams::default())
            .await
            .unwrap();
        broker
            .publish(&queue, &Message::new("charge").with_field("order_id", "O1"))
            .await
            .unwrap();

        // Routed through wait queues at tiers 1, 2 and 3: 100 + 400 + 1600ms.
        wait_for_len(&seen, 4, Duration::from_secs(8)).await;
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(*seen.lock().unwrap(), vec![0, 1, 2, 3]);
        assert_eq!(broker.message_count(&queue).await.unwrap(), 0);

        broker.delete_queue(&queue).await.unwrap();
        broker.stop().await.unwrap();
    }

    #[tokio::test]
    #[ignore = "requires running RabbitMQ server"]
    async fn test_always_retry_is_delivered_four_times() {
        let queue = test_queue();
        let broker = started(&queue).await;

        let seen = Arc::new(StdMutex::new(Vec::new()));
        let log = seen.clone();
        let handler = shared(move |msg: Message| {
            let log = log.clone();
            async move {
                log.lock().unwrap().push(msg.repeat_count);
                Ok::<_, HandlerError>(HandlerResponse::retry("still down"))
            }
        });
        broker
            .subscribe(&queue, handler, SubscribeParams::default())
            .await
            .unwrap();
        broker.publish(&queue, &Message::new("charge")).await.unwrap();

        // 100 + 400 + 1600ms of waiting.
        wait_for_len(&seen, 4, Duration::from_secs(8)).await;
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(*seen.lock().unwrap(), vec![0, 1, 2, 3]);
        assert_eq!(broker.message_count(&queue).await.unwrap(), 0);

        broker.delete_queue(&queue).await.unwrap();
        broker.stop().await.unwrap();
    }

    #[tokio::test]
    #[ignore = "requires running RabbitMQ server"]
    async fn test_fail_and_malformed_are_dropped() {
        let queue = test_queue();
        let broker = started(&queue).await;

        let seen = Arc::new(StdMutex::new(Vec::new()));
        let log = seen.clone();
        let handler = shared(move |msg: Message| {
            let log = log.clone();
            async move {
                log.lock().unwrap().push(msg.repeat_count);
                Ok::<_, HandlerError>(HandlerResponse::fail("card declined"))
            }
        });
        broker
            .subscribe(&queue, handler, SubscribeParams::default())
            .await
            .unwrap();

        let session = broker.session().unwrap();
        session
            .publisher
            .basic_publish(
                "",
                &queue,
                BasicPublishOptions::default(),
                b"not json",
                BasicProperties::default(),
            )
            .await
            .unwrap()
            .await
            .unwrap();
        broker.publish(&queue, &Message::new("charge")).await.unwrap();

        wait_for_len(&seen, 1, Duration::from_secs(2)).await;
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(*seen.lock().unwrap(), vec![0]);
        assert_eq!(broker.message_count(&queue).await.unwrap(), 0);

        broker.delete_queue(&queue).await.unwrap();
        broker.stop().await.unwrap();
    }

    #[tokio::test]
    #[ignore = "requires running RabbitMQ server"]
    async fn test_failed_consume_closes_channel() {
        let queue = test_queue();
        let broker = started(&queue).await;
        let session = broker.session().unwrap();

        let channel = session.open_channel().await.unwrap();
        let missing = test_queue();
        assert!(matches!(
            start_consuming(&channel, &missing, "waitq-test", 1).await,
            Err(WaitqError::Backend(_))
        ));
        assert!(!channel.status().connected());

        // The shared publishing channel is unaffected.
        assert!(broker.publish(&queue, &Message::new("charge")).await.unwrap());

        broker.delete_queue(&queue).await.unwrap();
        broker.stop().await.unwrap();
    }

    #[tokio::test]
    #[ignore = "requires running RabbitMQ server"]
    async fn test_finish_settles_after_cancel_fails() {
        let queue = test_queue();
        let broker = started(&queue).await;
        let session = broker.session().unwrap();

        let channel = session.open_channel().await.unwrap();
        let tag = consumer_tag(&queue);
        let deliveries = start_consuming(&channel, &queue, &tag, 1).await.unwrap();
        let mut inbox = AmqpInbox {
            queue: queue.clone(),
            tag,
            channel,
            publisher: session.publisher.clone(),
            deliveries,
        };

        broker.publish(&queue, &Message::quit()).await.unwrap();
        let acker = match inbox.receive().await {
            Some(Received::Message(acker, message)) => {
                assert!(message.is_quit());
                acker
            }
            other => panic!("expected the quit sentinel, got {:?}", other.is_some()),
        };

        // Every settlement step now fails; finish must still run them all.
        inbox.channel.close(REPLY_SUCCESS, "OK").await.unwrap();
        assert!(matches!(
            inbox.finish(acker).await,
            Err(WaitqError::Backend(_))
        ));
        assert!(!inbox.channel.status().connected());

        // The unacked sentinel returns to the queue with the closed channel.
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(broker.message_count(&queue).await.unwrap(), 1);

        broker.delete_queue(&queue).await.unwrap();
        broker.stop().await.unwrap();
    }

    #[tokio::test]
    #[ignore = "requires running RabbitMQ server"]
    async fn test_delete_stops_every_listener() {
        let queue = test_queue();
        let broker = started(&queue).await;

        let handler = shared(|_msg: Message| async {
            Ok::<_, HandlerError>(HandlerResponse::ok())
        });
        for _ in 0..3 {
            broker
                .subscribe(&queue, handler.clone(), SubscribeParams::default().prefetch(4))
                .await
                .unwrap();
        }
        assert_eq!(broker.listener_count(&queue).await, Some(3));

        broker.delete_queue(&queue).await.unwrap();
        assert_eq!(broker.listener_count(&queue).await, None);
        assert!(matches!(
            broker
                .subscribe(&queue, handler, SubscribeParams::default())
                .await,
            Err(WaitqError::QueueNotFound(_))
        ));

        broker.stop().await.unwrap();
    }

    #[tokio::test]
    #[ignore = "requires running RabbitMQ server"]
    async fn test_stop_keeps_durable_queue() {
        let queue = test_queue();
        let broker = started(&queue).await;
        broker.publish(&queue, &Message::new("charge")).await.unwrap();
        broker.stop().await.unwrap();
        assert!(!broker.is_running());

        broker.start(&[queue.clone()]).await.unwrap();
        assert_eq!(broker.message_count(&queue).await.unwrap(), 1);

        broker.delete_queue(&queue).await.unwrap();
        broker.stop().await.unwrap();
    }
}
