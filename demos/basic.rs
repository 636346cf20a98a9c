use std::time::Duration;

use webhook_delivery::{EngineConfig, Event, EventDispatcher, LedgerQuery};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let mut dispatcher = EventDispatcher::new(EngineConfig::default())?;

    let subscription = dispatcher
        .registry()
        .register("https://example.com/webhook", ["order.created"], "supersecret")
        .await?;

    let receipt = dispatcher
        .dispatch(Event::new("evt_123", "order.created", serde_json::json!({ "id": 123 })))
        .await?;
    println!("queued {} deliveries for {}", receipt.len(), receipt.event_id);

    tokio::time::sleep(Duration::from_secs(2)).await;

    let page = dispatcher
        .ledger()
        .query(&LedgerQuery::new().for_subscription(subscription.id))
        .await?;
    for attempt in page.attempts {
        println!(
            "attempt {} of {}: {} ({:?})",
            attempt.attempt_number, attempt.delivery_id, attempt.outcome, attempt.failure
        );
    }

    dispatcher.shutdown().await;
    Ok(())
}
