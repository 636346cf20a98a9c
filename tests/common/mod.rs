#![allow(dead_code)]

use std::time::Duration;

use webhook_delivery::{
    DeliveryAttempt, DeliveryLedger, EngineConfig, EventDispatcher, LedgerQuery, RetryPolicy,
};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Small pool and fast retries so tests finish quickly.
pub fn test_config() -> EngineConfig {
    EngineConfig::default()
        .with_worker_count(2)
        .with_queue_capacity(64)
        .with_http_timeout(Duration::from_secs(2))
        .with_retry(RetryPolicy::new(
            Duration::from_millis(50),
            Duration::from_millis(200),
            3,
        ))
}

pub async fn attempts(dispatcher: &EventDispatcher, query: LedgerQuery) -> Vec<DeliveryAttempt> {
    dispatcher
        .ledger()
        .query(&query)
        .await
        .expect("ledger query")
        .attempts
}

/// Poll the ledger until `done` holds for the matching attempts.
pub async fn wait_for_attempts<F>(
    dispatcher: &EventDispatcher,
    query: LedgerQuery,
    done: F,
) -> Vec<DeliveryAttempt>
where
    F: Fn(&[DeliveryAttempt]) -> bool,
{
    let ledger = dispatcher.ledger();
    let poll = async {
        loop {
            let page = ledger.query(&query).await.expect("ledger query");
            if done(&page.attempts) {
                return page.attempts;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    };

    tokio::time::timeout(Duration::from_secs(5), poll)
        .await
        .expect("timed out waiting for ledger records")
}

pub async fn wait_until_idle(dispatcher: &EventDispatcher) {
    let poll = async {
        while dispatcher.pending_jobs().await > 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    };
    tokio::time::timeout(Duration::from_secs(5), poll)
        .await
        .expect("timed out waiting for deliveries to finish");
}
