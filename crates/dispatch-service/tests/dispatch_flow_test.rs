//! 派发链路集成测试
//!
//! 使用 wiremock 模拟库存服务，内存发布器代替 Kafka，
//! 通过 OrderCreatedHandler 驱动从入站消息到出站消息的完整流程。

use std::sync::Arc;
use std::time::Duration;

use dispatch_service::consumer::{
    OrderCreatedHandler, REASON_NOT_RETRYABLE, REASON_RETRIES_EXHAUSTED,
};
use dispatch_service::processor::{DispatchService, DispatchTopics, ProcessingIdentity};
use dispatch_service::stock_client::StockServiceClient;
use dispatch_service::test_utils::{
    RecordingDeadLetterSink, RecordingPublisher, order_created_message,
};
use dispatch_shared::config::StockServiceConfig;
use dispatch_shared::events::{OrderCreated, OutboundMessage};
use dispatch_shared::kafka::Disposition;
use dispatch_shared::retry::RetryPolicy;
use uuid::Uuid;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

struct Harness {
    server: MockServer,
    publisher: Arc<RecordingPublisher>,
    dead_letters: Arc<RecordingDeadLetterSink>,
    handler: OrderCreatedHandler,
    identity: ProcessingIdentity,
}

async fn harness(max_retries: u32) -> Harness {
    let server = MockServer::start().await;
    let publisher = Arc::new(RecordingPublisher::new());
    let dead_letters = Arc::new(RecordingDeadLetterSink::new());
    let identity = ProcessingIdentity::generate();

    let oracle = StockServiceClient::new(&StockServiceConfig {
        base_url: format!("{}/api/stock", server.uri()),
        timeout_ms: 1000,
    })
    .unwrap();

    let topics = DispatchTopics {
        dispatch_tracking: "test.dispatch.tracking".to_string(),
        order_dispatched: "test.order.dispatched".to_string(),
    };
    let service = DispatchService::new(Arc::new(oracle), publisher.clone(), topics, identity);

    let policy = RetryPolicy {
        max_retries,
        initial_delay: Duration::from_millis(10),
        max_delay: Duration::from_millis(100),
        multiplier: 2.0,
    };
    let handler = OrderCreatedHandler::new(service, dead_letters.clone(), policy);

    Harness {
        server,
        publisher,
        dead_letters,
        handler,
        identity,
    }
}

fn red_order() -> OrderCreated {
    OrderCreated::new(
        Uuid::parse_str("b8e3d0c3-9241-4eeb-8a5b-7c412c3a8a24").unwrap(),
        "Red",
    )
}

#[tokio::test]
async fn test_available_order_is_dispatched_end_to_end() {
    let h = harness(3).await;

    Mock::given(method("GET"))
        .and(path("/api/stock"))
        .and(query_param("item", "Red"))
        .respond_with(ResponseTemplate::new(200).set_body_string("true"))
        .expect(1)
        .mount(&h.server)
        .await;

    let order = red_order();
    let disposition = h
        .handler
        .handle(order_created_message(&order, Some("k1"), 0, 42, 1))
        .await;

    assert_eq!(disposition, Disposition::Commit);

    let published = h.publisher.published().await;
    let routes: Vec<_> = published
        .iter()
        .map(|r| (r.topic.as_str(), r.message.message_type()))
        .collect();
    assert_eq!(
        routes,
        vec![
            ("test.dispatch.tracking", "DispatchPreparing"),
            ("test.order.dispatched", "OrderDispatched"),
            ("test.dispatch.tracking", "DispatchCompleted"),
        ]
    );
    assert!(published.iter().all(|r| r.key == "k1"));
    assert_eq!(published[1].partition, Some(0));

    let OutboundMessage::Dispatched(dispatched) = &published[1].message else {
        panic!("expected OrderDispatched");
    };
    assert_eq!(dispatched.order_id, order.order_id);
    assert_eq!(dispatched.item, "Red - dispatched");
    assert_eq!(dispatched.notes, "Dispatched: Red");
    assert_eq!(dispatched.processed_by, h.identity.as_uuid());

    let json: serde_json::Value =
        serde_json::from_slice(&published[1].message.to_json().unwrap()).unwrap();
    assert_eq!(json["orderId"], "b8e3d0c3-9241-4eeb-8a5b-7c412c3a8a24");
    assert_eq!(json["processedBy"], h.identity.to_string());

    assert!(h.dead_letters.records().await.is_empty());
}

#[tokio::test]
async fn test_unavailable_order_is_acknowledged_without_output() {
    let h = harness(3).await;

    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_string("false"))
        .mount(&h.server)
        .await;

    let disposition = h
        .handler
        .handle(order_created_message(&red_order(), Some("k1"), 0, 1, 1))
        .await;

    assert_eq!(disposition, Disposition::Commit);
    assert!(h.publisher.attempts().await.is_empty());
    assert!(h.dead_letters.records().await.is_empty());
}

#[tokio::test]
async fn test_stock_outage_is_redelivered_then_succeeds() {
    let h = harness(3).await;

    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(1)
        .mount(&h.server)
        .await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_string("true"))
        .mount(&h.server)
        .await;

    let order = red_order();

    let first = h
        .handler
        .handle(order_created_message(&order, Some("k1"), 0, 5, 1))
        .await;
    assert_eq!(
        first,
        Disposition::Redeliver {
            backoff: Duration::from_millis(10)
        }
    );
    assert!(h.publisher.attempts().await.is_empty());

    let second = h
        .handler
        .handle(order_created_message(&order, Some("k1"), 0, 5, 2))
        .await;
    assert_eq!(second, Disposition::Commit);
    assert_eq!(h.publisher.published().await.len(), 3);
    assert!(h.dead_letters.records().await.is_empty());
}

#[tokio::test]
async fn test_persistent_outage_ends_in_dead_letter() {
    let h = harness(1).await;

    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&h.server)
        .await;

    let order = red_order();

    let first = h
        .handler
        .handle(order_created_message(&order, Some("k1"), 0, 9, 1))
        .await;
    assert!(matches!(first, Disposition::Redeliver { .. }));

    let second = h
        .handler
        .handle(order_created_message(&order, Some("k1"), 0, 9, 2))
        .await;
    assert_eq!(second, Disposition::Commit);

    let records = h.dead_letters.records().await;
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].message_id, "k1");
    assert_eq!(records[0].reason, REASON_RETRIES_EXHAUSTED);
    assert!(h.publisher.attempts().await.is_empty());
}

#[tokio::test]
async fn test_client_error_is_dead_lettered_immediately() {
    let h = harness(3).await;

    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(400).set_body_string("unknown item"))
        .expect(1)
        .mount(&h.server)
        .await;

    let disposition = h
        .handler
        .handle(order_created_message(&red_order(), Some("k1"), 0, 3, 1))
        .await;

    assert_eq!(disposition, Disposition::Commit);
    let records = h.dead_letters.records().await;
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].reason, REASON_NOT_RETRYABLE);
    assert!(h.publisher.attempts().await.is_empty());
}

#[tokio::test]
async fn test_publish_failure_midway_is_redelivered_with_duplicate_tracking() {
    let h = harness(3).await;

    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_string("true"))
        .mount(&h.server)
        .await;

    h.publisher
        .fail_on("DispatchCompleted", || {
            dispatch_service::error::DispatchError::retryable("broker 不可达")
        })
        .await;

    let order = red_order();
    let first = h
        .handler
        .handle(order_created_message(&order, Some("k1"), 2, 11, 1))
        .await;
    assert!(matches!(first, Disposition::Redeliver { .. }));

    h.publisher.recover().await;
    let second = h
        .handler
        .handle(order_created_message(&order, Some("k1"), 2, 11, 2))
        .await;
    assert_eq!(second, Disposition::Commit);

    let types: Vec<_> = h
        .publisher
        .published()
        .await
        .iter()
        .map(|r| r.message.message_type())
        .collect();
    assert_eq!(
        types,
        vec![
            "DispatchPreparing",
            "OrderDispatched",
            "DispatchPreparing",
            "OrderDispatched",
            "DispatchCompleted",
        ]
    );
}
