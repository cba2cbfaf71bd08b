mod common;

use std::time::Duration;

use courier_core::{
    Error,
    broker::{Broker, BrokerConfig},
    buffer::{BufferLimit, OverflowPolicy},
    connection::{Connection, State},
    transport::MemoryTransport,
};

use common::*;

#[tokio::test]
async fn test_buffered_publishes_flush_in_order_after_reconnect() {
    let broker = Broker::default();
    let publisher = connect(&broker, opts()).await;
    let observer = connect(&broker, opts()).await;
    let mut sub = observer.subscribe("orders.>").await.unwrap();
    observer.flush().await.unwrap();

    knock_out(&broker, &publisher).await;
    for i in 0..5 {
        publisher
            .publish(&format!("orders.{i}"), format!("order {i}"))
            .await
            .unwrap();
    }
    assert_eq!(publisher.buffered().await, 5);

    broker.set_accepting(true);
    wait_for(&publisher, State::Connected).await;
    assert_eq!(publisher.buffered().await, 0);

    for i in 0..5 {
        let msg = next(&mut sub).await;
        assert_eq!(msg.subject, format!("orders.{i}"));
        assert_eq!(msg.payload, format!("order {i}").as_bytes());
    }
    let stats = publisher.stats();
    assert_eq!(stats.buffered, 5);
    assert_eq!(stats.flushed, 5);
    assert_eq!(stats.reconnects, 1);
}

#[tokio::test]
async fn test_entry_limit_rejects_third_publish() {
    let broker = Broker::default();
    let publisher = connect(&broker, opts().reconnect_buffer_entries(Some(2))).await;
    let observer = connect(&broker, opts()).await;
    let mut sub = observer.subscribe("x").await.unwrap();
    observer.flush().await.unwrap();

    knock_out(&broker, &publisher).await;
    publisher.publish("x", "1").await.unwrap();
    publisher.publish("x", "2").await.unwrap();
    let err = publisher.publish("x", "3").await.unwrap_err();
    assert!(matches!(
        err,
        Error::BufferFull {
            limit: BufferLimit::Entries(2)
        }
    ));

    broker.set_accepting(true);
    wait_for(&publisher, State::Connected).await;
    publisher.flush().await.unwrap();
    observer.flush().await.unwrap();

    let got: Vec<_> = drain(&mut sub).into_iter().map(|m| m.payload).collect();
    assert_eq!(got, vec!["1", "2"]);
    assert_eq!(publisher.stats().buffer_rejected, 1);
}

#[tokio::test]
async fn test_byte_limit_holds_while_reconnecting() {
    let broker = Broker::default();
    // "x" + 9 byte payload = 10 bytes per entry
    let publisher = connect(&broker, opts().reconnect_buffer_bytes(Some(25))).await;

    knock_out(&broker, &publisher).await;
    publisher.publish("x", "123456789").await.unwrap();
    publisher.publish("x", "123456789").await.unwrap();
    assert!(matches!(
        publisher.publish("x", "123456789").await,
        Err(Error::BufferFull {
            limit: BufferLimit::Bytes(25)
        })
    ));
    // a smaller publish still fits
    publisher.publish("x", "1234").await.unwrap();
    assert_eq!(publisher.buffered().await, 3);
    publisher.close().await;
}

#[tokio::test]
async fn test_drop_oldest_policy_keeps_newest() {
    let broker = Broker::default();
    let publisher = connect(
        &broker,
        opts()
            .reconnect_buffer_entries(Some(2))
            .overflow_policy(OverflowPolicy::DropOldest),
    )
    .await;
    let observer = connect(&broker, opts()).await;
    let mut sub = observer.subscribe("x").await.unwrap();
    observer.flush().await.unwrap();

    knock_out(&broker, &publisher).await;
    for n in ["1", "2", "3"] {
        publisher.publish("x", n).await.unwrap();
    }
    broker.set_accepting(true);
    wait_for(&publisher, State::Connected).await;
    publisher.flush().await.unwrap();
    observer.flush().await.unwrap();

    let got: Vec<_> = drain(&mut sub).into_iter().map(|m| m.payload).collect();
    assert_eq!(got, vec!["2", "3"]);
    assert_eq!(publisher.stats().discarded, 1);
}

#[tokio::test]
async fn test_subscriptions_survive_reconnect() {
    let broker = Broker::default();
    let conn = connect(&broker, opts()).await;
    let mut sub = conn.subscribe("events.*").await.unwrap();
    conn.flush().await.unwrap();

    knock_out(&broker, &conn).await;
    assert_eq!(broker.subscription_count(), 0);
    broker.set_accepting(true);
    wait_for(&conn, State::Connected).await;
    conn.flush().await.unwrap();
    assert_eq!(broker.subscription_count(), 1);

    let other = connect(&broker, opts()).await;
    other.publish("events.created", "id=1").await.unwrap();
    assert_eq!(next(&mut sub).await.subject, "events.created");
}

#[tokio::test]
async fn test_gives_up_after_max_reconnect_attempts() {
    let broker = Broker::default();
    let transport = CountingTransport::new(&broker);
    let conn = courier_core::Connection::connect_with(
        opts()
            .max_reconnect_attempts(Some(3))
            .reconnect_wait(Duration::from_millis(200), Duration::from_millis(200)),
        transport.clone(),
    )
    .await
    .unwrap();
    assert_eq!(transport.attempts(), 1);

    knock_out(&broker, &conn).await;
    conn.publish("x", "lost 1").await.unwrap();
    conn.publish("x", "lost 2").await.unwrap();

    let report = tokio::time::timeout(WAIT, conn.closed()).await.unwrap();
    assert!(matches!(report.reason, Some(Error::Network(_))));
    assert_eq!(report.discarded, 2);
    assert_eq!(transport.attempts(), 1 + 3);
    assert_eq!(conn.state(), State::Closed);
    assert!(matches!(conn.publish("x", "late").await, Err(Error::Closed)));
    assert_eq!(conn.stats().discarded, 2);
}

#[tokio::test]
async fn test_close_cancels_reconnect() {
    let broker = Broker::default();
    let conn = connect(
        &broker,
        opts().reconnect_wait(Duration::from_secs(30), Duration::from_secs(30)),
    )
    .await;
    let mut sub = conn.subscribe("x").await.unwrap();

    knock_out(&broker, &conn).await;
    conn.publish("x", "pending").await.unwrap();

    let report = tokio::time::timeout(Duration::from_secs(1), conn.close())
        .await
        .expect("close must not wait for the backoff");
    assert!(report.reason.is_none());
    assert_eq!(report.discarded, 1);
    assert_eq!(conn.state(), State::Closed);
    // subscriptions end with the connection
    assert!(tokio::time::timeout(WAIT, sub.next()).await.unwrap().is_none());

    // a second close reports the same outcome
    assert_eq!(conn.close().await.discarded, 1);
    assert_eq!(conn.closed().await.discarded, 1);
}

#[tokio::test]
async fn test_fails_over_to_next_server() {
    let down = Broker::default();
    down.set_accepting(false);
    let up = Broker::default();
    let transport = MemoryTransport::new(down.clone()).route("mem://b", up.clone());

    let conn = courier_core::Connection::connect_with(
        opts().servers(["mem://a", "mem://b"]),
        transport,
    )
    .await
    .unwrap();
    assert_eq!(conn.state(), State::Connected);
    assert_eq!(up.client_count(), 1);
    assert_eq!(down.client_count(), 0);
}

#[tokio::test]
async fn test_initial_connect_exhausts_retries() {
    let broker = Broker::default();
    broker.set_accepting(false);
    let transport = CountingTransport::new(&broker);
    let err = courier_core::Connection::connect_with(
        opts().servers(["mem://a", "mem://b"]).connect_retry_max(2),
        transport.clone(),
    )
    .await
    .unwrap_err();
    assert!(matches!(err, Error::Network(_)));
    assert_eq!(transport.attempts(), 2 * 3);
}

#[tokio::test]
async fn test_buffered_publish_over_new_server_limit_is_discarded() {
    let big = Broker::default();
    let small = Broker::new(BrokerConfig {
        max_payload: 16,
        ..Default::default()
    });
    small.set_accepting(false);
    let transport = MemoryTransport::new(big.clone()).route("mem://b", small.clone());
    let publisher = Connection::connect_with(opts().servers(["mem://a", "mem://b"]), transport)
        .await
        .unwrap();
    let mut sub = publisher.subscribe("orders.>").await.unwrap();
    publisher.flush().await.unwrap();

    knock_out(&big, &publisher).await;
    publisher.publish("orders.big", vec![0u8; 64]).await.unwrap();
    publisher.publish("orders.small", "ok").await.unwrap();
    assert_eq!(publisher.buffered().await, 2);

    small.set_accepting(true);
    wait_for(&publisher, State::Connected).await;
    publisher.flush().await.unwrap();

    assert_eq!(publisher.server_info().await.unwrap().max_payload, 16);
    let got: Vec<_> = drain(&mut sub).into_iter().map(|m| m.subject).collect();
    assert_eq!(got, vec!["orders.small"]);
    let stats = publisher.stats();
    assert_eq!(stats.discarded, 1);
    assert_eq!(stats.flushed, 1);
    assert_eq!(publisher.state(), State::Connected);
}
