mod common;

use std::time::Duration;

use serde_json::json;
use webhook_delivery::{
    verify_webhook_request, AttemptOutcome, DeliveryFailure, DispatchError, EngineConfig,
    EngineError, Event, EventDispatcher, LedgerQuery, RateLimitConfig, RetryPolicy,
    DELIVERY_ID_HEADER, EVENT_TYPE_HEADER,
};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use common::{attempts, init_tracing, test_config, wait_for_attempts, wait_until_idle};

const SECRET: &str = "whsec_test";

async fn mock_endpoint(status: u16, expected_calls: u64) -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/hook"))
        .respond_with(ResponseTemplate::new(status))
        .expect(expected_calls)
        .mount(&server)
        .await;
    server
}

#[tokio::test]
async fn delivers_event_to_subscriber() {
    init_tracing();
    let server = mock_endpoint(200, 1).await;
    let dispatcher = EventDispatcher::new(test_config()).unwrap();

    let subscription = dispatcher
        .registry()
        .register(&format!("{}/hook", server.uri()), ["invoice.created"], SECRET)
        .await
        .unwrap();

    let receipt = dispatcher
        .dispatch(Event::new("evt_1", "invoice.created", json!({"order_id": 42})))
        .await
        .unwrap();
    assert_eq!(receipt.len(), 1);

    let records = wait_for_attempts(&dispatcher, LedgerQuery::new().for_event("evt_1"), |a| {
        !a.is_empty()
    })
    .await;

    assert_eq!(records.len(), 1);
    let record = &records[0];
    assert_eq!(record.outcome, AttemptOutcome::Success);
    assert_eq!(record.attempt_number, 1);
    assert_eq!(record.http_status, Some(200));
    assert_eq!(record.subscription_id, subscription.id);
    assert_eq!(record.delivery_id, receipt.delivery_ids[0]);

    wait_until_idle(&dispatcher).await;
    server.verify().await;
}

#[tokio::test]
async fn delivery_is_signed_and_verifiable() {
    init_tracing();
    let server = mock_endpoint(200, 1).await;
    let dispatcher = EventDispatcher::new(test_config()).unwrap();
    dispatcher
        .registry()
        .register(&format!("{}/hook", server.uri()), ["invoice.created"], SECRET)
        .await
        .unwrap();

    let receipt = dispatcher
        .dispatch(Event::new("evt_sig", "invoice.created", json!({"total": "9.99"})))
        .await
        .unwrap();
    wait_for_attempts(&dispatcher, LedgerQuery::new().for_event("evt_sig"), |a| !a.is_empty()).await;

    let requests = server.received_requests().await.unwrap();
    assert_eq!(requests.len(), 1);
    let request = &requests[0];

    let headers: Vec<(&str, &str)> = request
        .headers
        .iter()
        .map(|(name, value)| (name.as_str(), value.to_str().unwrap_or_default()))
        .collect();
    let now = chrono::Utc::now().timestamp();
    verify_webhook_request(headers.iter().copied(), &request.body, SECRET.as_bytes(), 300, now)
        .expect("signature should verify");

    // A different secret must not verify.
    assert!(verify_webhook_request(headers.iter().copied(), &request.body, b"other", 300, now)
        .is_err());

    let header = |name: &str| {
        headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.to_string())
    };
    assert_eq!(header(DELIVERY_ID_HEADER), Some(receipt.delivery_ids[0].to_string()));
    assert_eq!(header(EVENT_TYPE_HEADER).as_deref(), Some("invoice.created"));

    let body: serde_json::Value = serde_json::from_slice(&request.body).unwrap();
    assert_eq!(body["event_id"], "evt_sig");
    assert_eq!(body["event_type"], "invoice.created");
    assert_eq!(body["payload"], json!({"total": "9.99"}));
    assert_eq!(body["delivery_id"], receipt.delivery_ids[0].to_string());
}

#[tokio::test]
async fn client_error_abandons_without_retry() {
    init_tracing();
    let server = mock_endpoint(404, 1).await;
    let dispatcher = EventDispatcher::new(test_config()).unwrap();
    dispatcher
        .registry()
        .register(&format!("{}/hook", server.uri()), ["invoice.created"], SECRET)
        .await
        .unwrap();

    dispatcher
        .dispatch(Event::new("evt_404", "invoice.created", json!({})))
        .await
        .unwrap();

    let records =
        wait_for_attempts(&dispatcher, LedgerQuery::new().for_event("evt_404"), |a| !a.is_empty())
            .await;
    assert_eq!(records[0].outcome, AttemptOutcome::Abandoned);
    assert_eq!(records[0].failure, Some(DeliveryFailure::ClientError { status: 404 }));

    wait_until_idle(&dispatcher).await;
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(attempts(&dispatcher, LedgerQuery::new().for_event("evt_404")).await.len(), 1);
    server.verify().await;
}

#[tokio::test]
async fn transient_failure_is_retried_until_success() {
    init_tracing();
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let dispatcher = EventDispatcher::new(test_config()).unwrap();
    dispatcher
        .registry()
        .register(&format!("{}/hook", server.uri()), ["invoice.created"], SECRET)
        .await
        .unwrap();

    let receipt = dispatcher
        .dispatch(Event::new("evt_retry", "invoice.created", json!({})))
        .await
        .unwrap();

    let records = wait_for_attempts(
        &dispatcher,
        LedgerQuery::new().for_delivery(receipt.delivery_ids[0]),
        |a| a.iter().any(|r| r.outcome == AttemptOutcome::Success),
    )
    .await;

    assert_eq!(records.len(), 2);
    assert_eq!(records[0].attempt_number, 1);
    assert_eq!(records[0].outcome, AttemptOutcome::Failed);
    assert_eq!(records[0].failure, Some(DeliveryFailure::RemoteError { status: 503 }));
    assert!(records[0].next_retry_at.is_some());
    assert_eq!(records[1].attempt_number, 2);
    assert_eq!(records[1].outcome, AttemptOutcome::Success);
    // The retry never starts before the time announced by the failed attempt.
    assert!(records[1].attempted_at >= records[0].next_retry_at.unwrap());
}

#[tokio::test]
async fn gives_up_after_max_attempts() {
    init_tracing();
    let server = mock_endpoint(500, 3).await;
    let dispatcher = EventDispatcher::new(test_config()).unwrap();
    dispatcher
        .registry()
        .register(&format!("{}/hook", server.uri()), ["invoice.created"], SECRET)
        .await
        .unwrap();

    dispatcher
        .dispatch(Event::new("evt_500", "invoice.created", json!({})))
        .await
        .unwrap();

    let records = wait_for_attempts(&dispatcher, LedgerQuery::new().for_event("evt_500"), |a| {
        a.iter().any(|r| r.outcome == AttemptOutcome::Abandoned)
    })
    .await;

    let outcomes: Vec<_> = records.iter().map(|r| r.outcome).collect();
    assert_eq!(
        outcomes,
        vec![AttemptOutcome::Failed, AttemptOutcome::Failed, AttemptOutcome::Abandoned]
    );
    assert!(records.iter().all(|r| r.failure == Some(DeliveryFailure::RemoteError { status: 500 })));

    wait_until_idle(&dispatcher).await;
    server.verify().await;
}

#[tokio::test]
async fn duplicate_dispatch_returns_original_receipt() {
    init_tracing();
    let server = mock_endpoint(200, 1).await;
    let dispatcher = EventDispatcher::new(test_config()).unwrap();
    dispatcher
        .registry()
        .register(&format!("{}/hook", server.uri()), ["invoice.created"], SECRET)
        .await
        .unwrap();

    let event = Event::new("evt_dup", "invoice.created", json!({}));
    let first = dispatcher.dispatch(event.clone()).await.unwrap();
    let second = dispatcher.dispatch(event).await.unwrap();
    assert_eq!(first, second);

    wait_for_attempts(&dispatcher, LedgerQuery::new().for_event("evt_dup"), |a| !a.is_empty()).await;
    wait_until_idle(&dispatcher).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(attempts(&dispatcher, LedgerQuery::new().for_event("evt_dup")).await.len(), 1);
    server.verify().await;
}

#[tokio::test]
async fn fans_out_only_to_matching_active_subscriptions() {
    init_tracing();
    let server = mock_endpoint(200, 2).await;
    let dispatcher = EventDispatcher::new(test_config()).unwrap();
    let url = format!("{}/hook", server.uri());
    let registry = dispatcher.registry();

    let a = registry.register(&url, ["invoice.created"], SECRET).await.unwrap();
    let b = registry.register(&url, ["invoice.created", "invoice.paid"], SECRET).await.unwrap();
    let inactive = registry.register(&url, ["invoice.created"], SECRET).await.unwrap();
    registry.register(&url, ["invoice.paid"], SECRET).await.unwrap();
    registry.deactivate(inactive.id).await.unwrap();

    let receipt = dispatcher
        .dispatch(Event::new("evt_fan", "invoice.created", json!({})))
        .await
        .unwrap();
    assert_eq!(receipt.len(), 2);

    let records =
        wait_for_attempts(&dispatcher, LedgerQuery::new().for_event("evt_fan"), |a| a.len() == 2)
            .await;
    let mut delivered: Vec<_> = records.iter().map(|r| r.subscription_id).collect();
    delivered.sort();
    let mut expected = vec![a.id, b.id];
    expected.sort();
    assert_eq!(delivered, expected);

    wait_until_idle(&dispatcher).await;
    server.verify().await;
}

#[tokio::test]
async fn event_without_subscribers_creates_no_jobs() {
    init_tracing();
    let dispatcher = EventDispatcher::new(test_config()).unwrap();
    let subscription = dispatcher
        .registry()
        .register("https://example.com/hook", ["invoice.created"], SECRET)
        .await
        .unwrap();
    dispatcher.registry().deactivate(subscription.id).await.unwrap();

    let receipt = dispatcher
        .dispatch(Event::new("evt_none", "invoice.created", json!({})))
        .await
        .unwrap();
    assert!(receipt.is_empty());
    assert_eq!(dispatcher.pending_jobs().await, 0);
}

#[tokio::test]
async fn deactivation_cancels_pending_retries() {
    init_tracing();
    let server = mock_endpoint(500, 1).await;
    let config = test_config().with_retry(RetryPolicy::new(
        Duration::from_millis(400),
        Duration::from_secs(1),
        5,
    ));
    let dispatcher = EventDispatcher::new(config).unwrap();
    let subscription = dispatcher
        .registry()
        .register(&format!("{}/hook", server.uri()), ["invoice.created"], SECRET)
        .await
        .unwrap();

    dispatcher
        .dispatch(Event::new("evt_cancel", "invoice.created", json!({})))
        .await
        .unwrap();

    wait_for_attempts(&dispatcher, LedgerQuery::new().for_event("evt_cancel"), |a| !a.is_empty())
        .await;
    dispatcher.registry().deactivate(subscription.id).await.unwrap();

    let records = wait_for_attempts(&dispatcher, LedgerQuery::new().for_event("evt_cancel"), |a| {
        a.iter().any(|r| r.outcome == AttemptOutcome::Abandoned)
    })
    .await;

    assert_eq!(records.len(), 2);
    assert_eq!(records[1].attempt_number, 2);
    assert_eq!(records[1].failure, Some(DeliveryFailure::SubscriptionInactive));
    assert_eq!(records[1].http_status, None);

    // Breaker and bucket state of a deactivated subscription are released.
    assert!(dispatcher.circuit_status(subscription.id).await.is_none());
    assert!(!dispatcher.rate_limiter_stats().await.contains_key(&subscription.id));

    wait_until_idle(&dispatcher).await;
    server.verify().await;
}

#[tokio::test]
async fn redispatch_starts_a_new_delivery() {
    init_tracing();
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(410))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let dispatcher = EventDispatcher::new(test_config()).unwrap();
    dispatcher
        .registry()
        .register(&format!("{}/hook", server.uri()), ["invoice.created"], SECRET)
        .await
        .unwrap();

    let event = Event::new("evt_again", "invoice.created", json!({}));
    let first = dispatcher.dispatch(event.clone()).await.unwrap();
    wait_for_attempts(&dispatcher, LedgerQuery::new().for_event("evt_again"), |a| !a.is_empty())
        .await;
    wait_until_idle(&dispatcher).await;

    let second = dispatcher.redispatch(event.clone()).await.unwrap();
    assert_eq!(second.len(), 1);
    assert_ne!(first.delivery_ids, second.delivery_ids);

    let records = wait_for_attempts(
        &dispatcher,
        LedgerQuery::new().for_delivery(second.delivery_ids[0]),
        |a| !a.is_empty(),
    )
    .await;
    assert_eq!(records[0].attempt_number, 1);
    assert_eq!(records[0].outcome, AttemptOutcome::Success);

    // Plain dispatch now reports the latest receipt.
    assert_eq!(dispatcher.dispatch(event).await.unwrap(), second);
}

#[tokio::test]
async fn slow_endpoint_times_out() {
    init_tracing();
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(800)))
        .expect(1)
        .mount(&server)
        .await;

    let config = test_config()
        .with_http_timeout(Duration::from_millis(100))
        .with_retry(RetryPolicy::new(Duration::from_millis(50), Duration::from_millis(50), 1));
    let dispatcher = EventDispatcher::new(config).unwrap();
    dispatcher
        .registry()
        .register(&format!("{}/hook", server.uri()), ["invoice.created"], SECRET)
        .await
        .unwrap();

    dispatcher
        .dispatch(Event::new("evt_slow", "invoice.created", json!({})))
        .await
        .unwrap();

    let records =
        wait_for_attempts(&dispatcher, LedgerQuery::new().for_event("evt_slow"), |a| !a.is_empty())
            .await;
    assert_eq!(records[0].outcome, AttemptOutcome::Abandoned);
    assert_eq!(records[0].failure, Some(DeliveryFailure::Timeout));
    assert_eq!(records[0].http_status, None);

    wait_until_idle(&dispatcher).await;
    server.verify().await;
}

#[tokio::test]
async fn rate_limited_delivery_goes_out_after_retry_delay() {
    init_tracing();
    let server = mock_endpoint(200, 2).await;
    let config = test_config().with_rate_limit(RateLimitConfig {
        burst: 1,
        refill_per_sec: 5.0,
        retry_delay: Duration::from_millis(300),
    });
    let dispatcher = EventDispatcher::new(config).unwrap();
    dispatcher
        .registry()
        .register(&format!("{}/hook", server.uri()), ["invoice.created"], SECRET)
        .await
        .unwrap();

    dispatcher
        .dispatch(Event::new("evt_a", "invoice.created", json!({})))
        .await
        .unwrap();
    dispatcher
        .dispatch(Event::new("evt_b", "invoice.created", json!({})))
        .await
        .unwrap();

    let first = wait_for_attempts(&dispatcher, LedgerQuery::new().for_event("evt_a"), |a| {
        a.iter().any(|r| r.outcome == AttemptOutcome::Success)
    })
    .await;
    let second = wait_for_attempts(&dispatcher, LedgerQuery::new().for_event("evt_b"), |a| {
        a.iter().any(|r| r.outcome == AttemptOutcome::Success)
    })
    .await;

    // Whichever event lost the race for the single token was held back once.
    let (limited, immediate) = if first.len() == 2 { (first, second) } else { (second, first) };
    assert_eq!(immediate.len(), 1);
    assert_eq!(limited.len(), 2);
    assert_eq!(limited[0].failure, Some(DeliveryFailure::RateLimited));
    assert_eq!(limited[0].http_status, None);
    assert_eq!(limited[1].attempt_number, 2);
    assert_eq!(limited[1].outcome, AttemptOutcome::Success);
    assert!(limited[1].attempted_at >= limited[0].next_retry_at.unwrap());

    wait_until_idle(&dispatcher).await;
    server.verify().await;
}

#[tokio::test]
async fn shutdown_drops_queued_jobs() {
    init_tracing();
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(300)))
        .mount(&server)
        .await;

    let mut dispatcher = EventDispatcher::new(test_config().with_worker_count(1)).unwrap();
    dispatcher
        .registry()
        .register(&format!("{}/hook", server.uri()), ["invoice.created"], SECRET)
        .await
        .unwrap();

    for i in 0..4 {
        dispatcher
            .dispatch(Event::new(format!("evt_q{i}"), "invoice.created", json!({})))
            .await
            .unwrap();
    }
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(dispatcher.pending_jobs().await, 4);

    dispatcher.shutdown().await;

    assert_eq!(dispatcher.pending_jobs().await, 0);
    // Only the attempt already running when shutdown began went out.
    assert_eq!(server.received_requests().await.unwrap().len(), 1);
    let records = attempts(&dispatcher, LedgerQuery::new()).await;
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].outcome, AttemptOutcome::Success);
}

#[tokio::test]
async fn rejects_dispatch_after_shutdown() {
    init_tracing();
    let mut dispatcher = EventDispatcher::new(test_config()).unwrap();
    assert!(dispatcher.is_running());

    dispatcher.shutdown().await;
    assert!(!dispatcher.is_running());

    let result = dispatcher
        .dispatch(Event::new("evt_late", "invoice.created", json!({})))
        .await;
    assert!(matches!(result, Err(DispatchError::Shutdown)));
}

#[tokio::test]
async fn rejects_invalid_configuration() {
    let result = EventDispatcher::new(EngineConfig::default().with_worker_count(0));
    assert!(matches!(result, Err(EngineError::Config(_))));
}
