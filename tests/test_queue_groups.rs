//! Queue-group load balancing and bus connection properties

mod test_helpers;

use bridge_agent::protocol::SubjectBuilder;
use bridge_agent::testing::{MemoryBus, MockBehavior, MockExecutor};
use bridge_agent::transport::{BrokerConnection, BrokerError, RetryPolicy};
use bytes::Bytes;
use serde_json::json;
use std::collections::HashSet;
use std::time::Duration;
use test_helpers::*;
use tokio::sync::mpsc;

const SUBJECT: &str = "agent.pool.task";

async fn drain(rx: &mut mpsc::UnboundedReceiver<bridge_agent::transport::InboundMessage>) -> Vec<Bytes> {
    let mut received = Vec::new();
    while let Ok(Some(message)) = tokio::time::timeout(Duration::from_millis(100), rx.recv()).await {
        received.push(message.payload);
    }
    received
}

#[tokio::test]
async fn test_each_message_reaches_exactly_one_group_member() {
    let bus = MemoryBus::new();
    let first = BrokerConnection::new(bus.transport());
    let second = BrokerConnection::new(bus.transport());
    first.connect("memory://test", &RetryPolicy::immediate(1)).await.unwrap();
    second.connect("memory://test", &RetryPolicy::immediate(1)).await.unwrap();

    let (first_tx, mut first_rx) = mpsc::unbounded_channel();
    let (second_tx, mut second_rx) = mpsc::unbounded_channel();
    first.subscribe(SUBJECT, first_tx, Some("workers")).await.unwrap();
    second.subscribe(SUBJECT, second_tx, Some("workers")).await.unwrap();

    for n in 0..10 {
        let deliveries = bus.inject(SUBJECT, Bytes::from(format!("m{n}")));
        assert_eq!(deliveries, 1, "message m{n} must go to one member");
    }

    let got_first = drain(&mut first_rx).await;
    let got_second = drain(&mut second_rx).await;

    assert_eq!(got_first.len() + got_second.len(), 10);
    assert!(!got_first.is_empty());
    assert!(!got_second.is_empty());

    let unique: HashSet<Bytes> = got_first.iter().chain(got_second.iter()).cloned().collect();
    assert_eq!(unique.len(), 10);

    first.close().await;
    second.close().await;
}

#[tokio::test]
async fn test_plain_subscriber_still_sees_every_message() {
    let bus = MemoryBus::new();
    let member = BrokerConnection::new(bus.transport());
    let observer = BrokerConnection::new(bus.transport());
    member.connect("memory://test", &RetryPolicy::immediate(1)).await.unwrap();
    observer.connect("memory://test", &RetryPolicy::immediate(1)).await.unwrap();

    let (member_tx, mut member_rx) = mpsc::unbounded_channel();
    let (observer_tx, mut observer_rx) = mpsc::unbounded_channel();
    member.subscribe(SUBJECT, member_tx, Some("workers")).await.unwrap();
    observer.subscribe(SUBJECT, observer_tx, None).await.unwrap();

    for n in 0..4 {
        bus.inject(SUBJECT, Bytes::from(format!("m{n}")));
    }

    assert_eq!(drain(&mut member_rx).await.len(), 4);
    assert_eq!(drain(&mut observer_rx).await.len(), 4);
}

#[tokio::test]
async fn test_queue_group_name_is_validated() {
    let bus = MemoryBus::new();
    let broker = BrokerConnection::new(bus.transport());
    broker.connect("memory://test", &RetryPolicy::immediate(1)).await.unwrap();

    let (tx, _rx) = mpsc::unbounded_channel();
    let result = broker.subscribe(SUBJECT, tx, Some("bad group/name")).await;
    assert!(matches!(result, Err(BrokerError::InvalidQueueGroup(_))));
}

#[tokio::test]
async fn test_runtimes_in_a_group_share_the_task_stream() {
    let bus = MemoryBus::new();
    let mut settings = test_settings();
    settings.queue_group = Some("bridge-agents".to_string());

    let delay = MockBehavior::Delay(Duration::from_millis(20));
    let first_executor = MockExecutor::new().with_behavior(delay.clone());
    let second_executor = MockExecutor::new().with_behavior(delay);
    let first = test_runtime_with(&bus, first_executor.clone(), settings.clone());
    let second = test_runtime_with(&bus, second_executor.clone(), settings);
    first.start().await.unwrap();
    second.start().await.unwrap();

    for n in 0..10 {
        inject_task(&bus, json!({"taskId": format!("q{n}"), "type": "code-generation"}));
    }
    for n in 0..10 {
        let results = wait_for_results(&bus, &format!("q{n}"), 1).await;
        assert!(results[0].is_completed());
    }
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(first_executor.call_count() + second_executor.call_count(), 10);
    assert!(first_executor.call_count() >= 1);
    assert!(second_executor.call_count() >= 1);
    for n in 0..10 {
        assert_eq!(
            bus.published_on(&SubjectBuilder::task_result(&format!("q{n}"))).len(),
            1
        );
    }

    first.stop().await;
    second.stop().await;
}
