//! Publish/subscribe contract tests.

use std::sync::Arc;
use std::time::Duration;

use edgebus::{BusContext, BusError, Envelope, Value};

use super::{await_connected, recv_data, RECV_TIMEOUT};

fn frame(index: u32) -> Envelope {
    let mut roi = std::collections::BTreeMap::new();
    roi.insert("x".to_string(), Value::from(10));
    roi.insert("y".to_string(), Value::from(20.5));

    Envelope::builder()
        .field("index", index)
        .field("camera", "cam-0")
        .field("defect", index % 2 == 0)
        .field("roi", roi)
        .field(
            "labels",
            vec![Value::from("scratch"), Value::from("dent")],
        )
        .named_blob("image", vec![0u8, 1, 2, 3, 254, 255])
        .blob(index.to_le_bytes().to_vec())
        .build()
        .expect("frame envelope")
}

pub async fn test_round_trip(ctx: &BusContext) {
    let subscriber = ctx.new_subscriber("contract.roundtrip").await.unwrap();
    let publisher = ctx.new_publisher("contract.roundtrip").await.unwrap();
    await_connected(&publisher, &subscriber).await;

    publisher.publish(&frame(1)).await.unwrap();
    let received = recv_data(&subscriber, RECV_TIMEOUT)
        .await
        .expect("frame should arrive");

    assert_eq!(received, frame(1));
    assert_eq!(
        received.blob_named("image").unwrap().data().as_ref(),
        &[0, 1, 2, 3, 254, 255]
    );
}

pub async fn test_fifo_order(ctx: &BusContext) {
    let subscriber = ctx.new_subscriber("contract.order").await.unwrap();
    let publisher = ctx.new_publisher("contract.order").await.unwrap();
    await_connected(&publisher, &subscriber).await;

    for index in 0..20 {
        publisher.publish(&frame(index)).await.unwrap();
    }
    for index in 0..20 {
        let received = recv_data(&subscriber, RECV_TIMEOUT)
            .await
            .expect("frame should arrive");
        assert_eq!(received.get("index").and_then(Value::as_f64), Some(index as f64));
    }
}

pub async fn test_topic_isolation(ctx: &BusContext) {
    let camera_sub = ctx.new_subscriber("contract.camera").await.unwrap();
    let lidar_sub = ctx.new_subscriber("contract.lidar").await.unwrap();
    let camera_pub = ctx.new_publisher("contract.camera").await.unwrap();
    let lidar_pub = ctx.new_publisher("contract.lidar").await.unwrap();
    await_connected(&camera_pub, &camera_sub).await;
    await_connected(&lidar_pub, &lidar_sub).await;

    camera_pub.publish(&frame(7)).await.unwrap();

    assert_eq!(recv_data(&camera_sub, RECV_TIMEOUT).await, Some(frame(7)));
    assert_eq!(recv_data(&lidar_sub, Duration::from_millis(100)).await, None);
}

pub async fn test_fan_out(ctx: &BusContext) {
    let first = ctx.new_subscriber("contract.fanout").await.unwrap();
    let second = ctx.new_subscriber("contract.fanout").await.unwrap();
    let publisher = ctx.new_publisher("contract.fanout").await.unwrap();
    await_connected(&publisher, &first).await;
    await_connected(&publisher, &second).await;

    publisher.publish(&frame(3)).await.unwrap();

    assert_eq!(recv_data(&first, RECV_TIMEOUT).await, Some(frame(3)));
    assert_eq!(recv_data(&second, RECV_TIMEOUT).await, Some(frame(3)));
}

pub async fn test_publish_without_subscribers(ctx: &BusContext) {
    let publisher = ctx.new_publisher("contract.nobody").await.unwrap();
    for index in 0..5 {
        publisher.publish(&frame(index)).await.unwrap();
    }
}

pub async fn test_empty_backlog(ctx: &BusContext) {
    let subscriber = ctx.new_subscriber("contract.empty").await.unwrap();

    assert!(subscriber.recv_nowait().await.unwrap().is_none());
    let started = std::time::Instant::now();
    assert!(subscriber
        .recv_timeout(Duration::from_millis(50))
        .await
        .unwrap()
        .is_none());
    assert!(started.elapsed() >= Duration::from_millis(40));
}

pub async fn test_destroy_interrupts_receive(ctx: &BusContext) {
    let subscriber = Arc::new(ctx.new_subscriber("contract.interrupt").await.unwrap());

    let waiter = {
        let subscriber = Arc::clone(&subscriber);
        tokio::spawn(async move { subscriber.recv_wait().await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    subscriber.destroy().unwrap();

    let result = tokio::time::timeout(RECV_TIMEOUT, waiter)
        .await
        .expect("destroy should wake the receiver")
        .unwrap();
    assert!(matches!(result, Err(BusError::Interrupted)));
}

/// Run all publish/subscribe contract tests against a context.
#[macro_export]
macro_rules! run_pubsub_tests {
    ($ctx:expr) => {
        use $crate::bus::pubsub_tests::*;

        test_round_trip($ctx).await;
        println!("  test_round_trip: PASSED");

        test_fifo_order($ctx).await;
        println!("  test_fifo_order: PASSED");

        test_topic_isolation($ctx).await;
        println!("  test_topic_isolation: PASSED");

        test_fan_out($ctx).await;
        println!("  test_fan_out: PASSED");

        test_publish_without_subscribers($ctx).await;
        println!("  test_publish_without_subscribers: PASSED");

        test_empty_backlog($ctx).await;
        println!("  test_empty_backlog: PASSED");

        test_destroy_interrupts_receive($ctx).await;
        println!("  test_destroy_interrupts_receive: PASSED");
    };
}
