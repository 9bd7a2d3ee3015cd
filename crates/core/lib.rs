//! # waitq-core - Core types and traits for the waitq broker abstraction
//!
//! This crate provides the pieces shared by every waitq backend:
//! - `Broker` trait and `SharedBroker` for backend-agnostic callers
//! - `Message` envelope and `HandlerResponse`
//! - `Backoff` schedule computing wait queue names and TTLs per retry tier
//! - `Consumer` dispatch loop driving ack/retry/drop decisions
//! - `BrokerConfig` and error types
//!
//! ## Retries
//!
//! A handler answering `retry` gets its message back after a delay that grows
//! by a factor of 4 per attempt (`ttl_base`, `4 * ttl_base`, `16 * ttl_base`, ...)
//! until `max_retries` is spent, after which the message is dropped. A `fail`
//! answer drops the message immediately.
//!
//! ```rust,ignore
//! use waitq_core::{handler, Broker, HandlerResponse, Message, SubscribeParams};
//! use waitq_memory::MemoryBroker;
//!
//! #[tokio::main]
//! async fn main() -> waitq_core::Result<()> {
//!     let broker = MemoryBroker::new(Default::default())?;
//!     broker.start(&["orders".to_string()]).await?;
//!
//!     broker
//!         .subscribe(
//!             "orders",
//!             handler::shared(|msg: Message| async move {
//!                 println!("charging {:?}", msg.field("order_id"));
//!                 Ok(HandlerResponse::ok())
//!             }),
//!             SubscribeParams::default(),
//!         )
//!         .await?;
//!
//!     broker
//!         .publish("orders", &Message::new("charge").with_field("order_id", "O1"))
//!         .await?;
//!     Ok(())
//! }
//! ```

pub mod backoff;
mod broker;
mod client;
pub mod config;
pub mod dispatch;
mod error;
pub mod handler;
mod message;

// Re-export main types
pub use backoff::{wait_queue_name, Backoff};
pub use broker::{Broker, DynBroker, SharedBroker, SubscribeParams};
pub use client::{build_message, Client};
pub use config::{BrokerConfig, BrokerConfigBuilder};
pub use dispatch::{
    consumer_tag, join_consumers, Consumer, DeliverySource, Dispatcher, Outcome, Received, Retry,
    StopReason,
};
pub use error::{Result, WaitqError};
pub use handler::{Handler, HandlerError, HandlerResult, SharedHandler};
pub use message::{HandlerResponse, Message, Status, QUIT_ACTION};
