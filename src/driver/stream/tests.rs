use super::*;
use crate::config::DEFAULT_RECV_HWM;
use std::time::Duration;

fn message(text: &'static str) -> EncodedMessage {
    EncodedMessage {
        payload: Bytes::from_static(text.as_bytes()),
        parts: vec![Bytes::from_static(b"\x00blob")],
    }
}

fn free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

fn tcp_driver(port: u16) -> StreamDriver {
    StreamDriver::open_tcp(&TcpConfig::new("127.0.0.1", port))
}

/// Publish until the subscriber sees a message; subscriptions connect in
/// the background, so early publications are legitimately lost.
async fn publish_until_received(
    driver: &StreamDriver,
    publisher: SocketId,
    subscriber: SocketId,
    text: &'static str,
) -> EncodedMessage {
    for _ in 0..100 {
        driver.send(publisher, message(text)).await.unwrap();
        let received = driver
            .recv(subscriber, RecvMode::Timed(Duration::from_millis(50)))
            .await
            .unwrap();
        if let Received::Message(m) = received {
            return m;
        }
    }
    panic!("subscriber never received a publication");
}

#[tokio::test]
async fn test_ipc_publish_subscribe() {
    let dir = tempfile::tempdir().unwrap();
    let driver = StreamDriver::open_ipc(&IpcConfig::new(dir.path())).unwrap();

    let publisher = driver.bind_publisher("camera").await.unwrap();
    assert!(dir.path().join("camera").exists());
    let subscriber = driver.bind_subscriber("camera").await.unwrap();

    let received = publish_until_received(&driver, publisher, subscriber, "frame").await;
    assert_eq!(received, message("frame"));
}

#[tokio::test]
async fn test_ipc_subscriber_before_publisher() {
    let dir = tempfile::tempdir().unwrap();
    let driver = StreamDriver::open_ipc(&IpcConfig::new(dir.path())).unwrap();

    let subscriber = driver.bind_subscriber("late").await.unwrap();
    tokio::time::sleep(Duration::from_millis(30)).await;
    let publisher = driver.bind_publisher("late").await.unwrap();

    let received = publish_until_received(&driver, publisher, subscriber, "hello").await;
    assert_eq!(received, message("hello"));
}

#[tokio::test]
async fn test_ipc_topic_bound_twice_across_drivers() {
    let dir = tempfile::tempdir().unwrap();
    let first = StreamDriver::open_ipc(&IpcConfig::new(dir.path())).unwrap();
    let second = StreamDriver::open_ipc(&IpcConfig::new(dir.path())).unwrap();

    first.bind_publisher("camera").await.unwrap();
    let err = second.bind_publisher("camera").await.unwrap_err();
    assert!(matches!(err, TransportError::AddressInUse(_)));
}

#[tokio::test]
async fn test_ipc_closing_last_socket_releases_hub() {
    let dir = tempfile::tempdir().unwrap();
    let driver = StreamDriver::open_ipc(&IpcConfig::new(dir.path())).unwrap();

    let publisher = driver.bind_publisher("camera").await.unwrap();
    driver.close_socket(publisher);
    assert!(!dir.path().join("camera").exists());

    driver.bind_publisher("camera").await.unwrap();
}

#[tokio::test]
async fn test_tcp_endpoint_rebinds_after_last_socket_closes() {
    let driver = tcp_driver(free_port());

    let publisher = driver.bind_publisher("camera").await.unwrap();
    driver.close_socket(publisher);
    let publisher = driver.bind_publisher("camera").await.unwrap();
    driver.close_socket(publisher);

    // A service on the shared endpoint binds right away too.
    let service = driver.bind_service("status").await.unwrap();
    driver.close_socket(service);
    driver.bind_service("status").await.unwrap();
}

#[tokio::test]
async fn test_tcp_topics_share_one_endpoint() {
    let driver = tcp_driver(free_port());

    let camera_pub = driver.bind_publisher("camera").await.unwrap();
    let lidar_pub = driver.bind_publisher("lidar").await.unwrap();
    let camera_sub = driver.bind_subscriber("camera").await.unwrap();
    let lidar_sub = driver.bind_subscriber("lidar").await.unwrap();

    let camera = publish_until_received(&driver, camera_pub, camera_sub, "c").await;
    let lidar = publish_until_received(&driver, lidar_pub, lidar_sub, "l").await;
    assert_eq!(camera, message("c"));
    assert_eq!(lidar, message("l"));

    // Only "l" publications went to lidar; the camera backlog holds no "l".
    while let Received::Message(m) = driver.recv(camera_sub, RecvMode::NonBlocking).await.unwrap() {
        assert_eq!(m, message("c"));
    }
}

#[tokio::test]
async fn test_tcp_request_response() {
    let driver = tcp_driver(free_port());
    let service = driver.bind_service("echo").await.unwrap();
    let client = driver.connect_client("echo").await.unwrap();

    driver.send(client, message("ping")).await.unwrap();
    let request = driver.recv(service, RecvMode::Blocking).await.unwrap();
    assert_eq!(request, Received::Message(message("ping")));

    driver.send(service, message("pong")).await.unwrap();
    let response = driver
        .recv(client, RecvMode::Timed(Duration::from_secs(2)))
        .await
        .unwrap();
    assert_eq!(response, Received::Message(message("pong")));
}

#[tokio::test]
async fn test_client_without_listener_is_unreachable() {
    let driver = tcp_driver(free_port());
    let err = driver.connect_client("echo").await.unwrap_err();
    assert!(matches!(err, TransportError::Unreachable(_)));
}

#[tokio::test]
async fn test_client_for_unbound_service_is_rejected() {
    let driver = tcp_driver(free_port());
    let _publisher = driver.bind_publisher("camera").await.unwrap();

    let err = driver.connect_client("echo").await.unwrap_err();
    assert!(matches!(err, TransportError::Rejected(_)));
}

#[tokio::test]
async fn test_duplicate_service_in_one_hub() {
    let driver = tcp_driver(free_port());
    driver.bind_service("echo").await.unwrap();
    let err = driver.bind_service("echo").await.unwrap_err();
    assert!(matches!(err, TransportError::AddressInUse(_)));
}

#[tokio::test]
async fn test_service_close_disconnects_client() {
    let driver = tcp_driver(free_port());
    let service = driver.bind_service("echo").await.unwrap();
    let keep_hub = driver.bind_publisher("keepalive").await.unwrap();
    let client = driver.connect_client("echo").await.unwrap();

    driver.close_socket(service);
    driver.send(client, message("ping")).await.unwrap();

    let result = driver
        .recv(client, RecvMode::Timed(Duration::from_secs(2)))
        .await;
    assert!(matches!(result, Err(TransportError::Disconnected)));
    driver.close_socket(keep_hub);
}

#[tokio::test]
async fn test_fieldbus_resolves_endpoint_template() {
    let port = free_port();
    let config = FieldbusConfig {
        endpoint: "opcua://127.0.0.1:{port}/edgebus".to_string(),
        port,
        recv_hwm: DEFAULT_RECV_HWM,
    };
    let driver = StreamDriver::open_fieldbus(&config).unwrap();
    assert_eq!(driver.kind(), TransportKind::Fieldbus);

    let publisher = driver.bind_publisher("sensor").await.unwrap();
    let subscriber = driver.bind_subscriber("sensor").await.unwrap();
    let received = publish_until_received(&driver, publisher, subscriber, "reading").await;
    assert_eq!(received, message("reading"));
}

#[tokio::test]
async fn test_hub_drops_closed_subscriber_peers() {
    let dir = tempfile::tempdir().unwrap();
    let driver = StreamDriver::open_ipc(&IpcConfig::new(dir.path())).unwrap();
    let publisher = driver.bind_publisher("t").await.unwrap();
    let subscriber = driver.bind_subscriber("t").await.unwrap();
    publish_until_received(&driver, publisher, subscriber, "x").await;

    let socket = driver.sockets.get(publisher).unwrap();
    let StreamSocket::Publisher { hub, .. } = socket.as_ref() else {
        panic!("expected publisher socket");
    };
    assert_eq!(hub.routes().subscriber_count("t"), 1);

    driver.close_socket(subscriber);
    for _ in 0..100 {
        if hub.routes().subscriber_count("t") == 0 {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("hub kept a closed subscriber");
}

#[tokio::test]
async fn test_closed_driver_rejects_binds() {
    let driver = tcp_driver(free_port());
    driver.close();
    driver.close();
    let err = driver.bind_publisher("t").await.unwrap_err();
    assert!(matches!(err, TransportError::DriverClosed));
}
