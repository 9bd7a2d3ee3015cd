//! Basic demo using the in-process broker.
//!
//! This demo:
//! - Starts an in-process broker with an `orders` queue
//! - Subscribes two consumers running an order handler
//! - Publishes orders, one of which fails twice before it goes through
//!
//! Run with: `cargo run -p demo-basic` (set `RUST_LOG=debug` for retry
//! details).

use serde::Serialize;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;
use waitq_core::handler::shared;
use waitq_core::{
    Broker, BrokerConfig, Client, HandlerResponse, HandlerResult, Message, SharedBroker,
    SubscribeParams,
};
use waitq_memory::MemoryBroker;

/// Order charge payload.
#[derive(Debug, Clone, Serialize)]
struct ChargeOrder {
    order_id: String,
    amount_cents: u64,
}

/// Charge an order. Order `O2` hits a flaky gateway on its first two tries.
async fn charge(message: Message, gateway_calls: Arc<AtomicU32>) -> HandlerResult {
    let order_id = message
        .field("order_id")
        .and_then(|v| v.as_str())
        .unwrap_or("?")
        .to_string();
    println!("[orders] charging {} (attempt {})", order_id, message.repeat_count + 1);

    tokio::time::sleep(Duration::from_millis(50)).await;

    if order_id == "O2" && gateway_calls.fetch_add(1, Ordering::SeqCst) < 2 {
        println!("[orders] gateway timeout for {}\n", order_id);
        return Ok(HandlerResponse::retry("gateway timeout"));
    }

    println!("[orders] charged {}\n", order_id);
    Ok(HandlerResponse::ok())
}

#[tokio::main]
async fn main() -> waitq_core::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    println!("waitq demo\n");

    let config = BrokerConfig::from_env()?;
    let broker = SharedBroker::new(MemoryBroker::new(config)?);
    broker.start(&["orders".to_string()]).await?;

    let gateway_calls = Arc::new(AtomicU32::new(0));
    let handler = shared(move |message: Message| charge(message, gateway_calls.clone()));
    for _ in 0..2 {
        broker
            .subscribe("orders", handler.clone(), SubscribeParams::default())
            .await?;
    }

    let client = Client::with_broker(broker.clone());
    let orders = vec![
        ChargeOrder {
            order_id: "O1".to_string(),
            amount_cents: 1200,
        },
        ChargeOrder {
            order_id: "O2".to_string(),
            amount_cents: 4999,
        },
        ChargeOrder {
            order_id: "O3".to_string(),
            amount_cents: 150,
        },
    ];

    println!("Publishing {} orders...\n", orders.len());
    for order in orders {
        client.publish_action("orders", "charge", order).await?;
    }

    tokio::time::sleep(Duration::from_secs(1)).await;
    println!("Queue length: {}", client.message_count("orders").await?);

    broker.stop().await?;
    println!("Broker stopped");
    Ok(())
}
