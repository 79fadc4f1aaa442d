use driftmq::{BrokerConfig, BrokerServer};
use driftmq_client::{ConnectionState, Message, Session, SessionOptions, SubscribeOptions};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;

async fn start_broker(
    config: BrokerConfig,
    listener: TcpListener,
) -> (Arc<BrokerServer>, JoinHandle<driftmq::Result<()>>) {
    let server = Arc::new(BrokerServer::new(config).expect("Failed to create broker"));
    let running = Arc::clone(&server);
    let handle = tokio::spawn(async move { running.serve(listener).await });
    while server.local_addr().is_none() {
        tokio::task::yield_now().await;
    }
    (server, handle)
}

async fn local_listener() -> (TcpListener, SocketAddr) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    (listener, addr)
}

fn options() -> SessionOptions {
    SessionOptions::new().with_backoff(|_| Duration::from_millis(20))
}

fn collector() -> (
    impl Fn(Message) + Send + Sync + 'static,
    mpsc::UnboundedReceiver<Message>,
) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        move |message| {
            let _ = tx.send(message);
        },
        rx,
    )
}

async fn next_message(rx: &mut mpsc::UnboundedReceiver<Message>) -> Message {
    timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("Timed out waiting for message")
        .expect("Subscription dropped")
}

#[tokio::test]
async fn test_publish_and_subscribe_end_to_end() {
    let (listener, addr) = local_listener().await;
    let (server, handle) = start_broker(BrokerConfig::default(), listener).await;

    let consumer = Session::connect(addr.to_string(), options()).unwrap();
    let (on_message, mut messages) = collector();
    consumer
        .subscribe_with("orders", SubscribeOptions::from_offset(0), on_message)
        .unwrap();

    let producer = Session::connect(addr.to_string(), options()).unwrap();
    for payload in ["foo", "bar", "car"] {
        producer.publish("orders", payload).await.unwrap().wait().await.unwrap();
    }

    let mut offsets = Vec::new();
    for expected in ["foo", "bar", "car"] {
        let message = next_message(&mut messages).await;
        assert_eq!(message.topic, "orders");
        assert_eq!(message.payload, expected);
        offsets.push(message.offset);
    }
    assert_eq!(offsets, vec![7, 14, 21]);
    assert_eq!(consumer.attachment_offset("orders"), Some(21));

    consumer.close().await.unwrap();
    producer.close().await.unwrap();
    server.shutdown();
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_new_session_resumes_from_saved_offset() {
    let (listener, addr) = local_listener().await;
    let (server, handle) = start_broker(BrokerConfig::default(), listener).await;

    let producer = Session::connect(addr.to_string(), options()).unwrap();
    for payload in ["one", "two"] {
        producer.publish("t", payload).await.unwrap().wait().await.unwrap();
    }

    let saved = {
        let consumer = Session::connect(addr.to_string(), options()).unwrap();
        let (on_message, mut messages) = collector();
        consumer
            .subscribe_with("t", SubscribeOptions::from_offset(0), on_message)
            .unwrap();
        next_message(&mut messages).await;
        let second = next_message(&mut messages).await;
        consumer.close().await.unwrap();
        second.offset
    };

    producer.publish("t", "three").await.unwrap().wait().await.unwrap();

    let consumer = Session::connect(addr.to_string(), options()).unwrap();
    let (on_message, mut messages) = collector();
    consumer
        .subscribe_with("t", SubscribeOptions::from_offset(saved), on_message)
        .unwrap();
    assert_eq!(next_message(&mut messages).await.payload, "three");
    assert!(timeout(Duration::from_millis(200), messages.recv())
        .await
        .is_err());

    server.shutdown();
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_sessions_survive_broker_restart() {
    let dir = tempfile::tempdir().unwrap();
    let config = BrokerConfig::default().with_data_dir(dir.path());
    let (listener, addr) = local_listener().await;
    let (server, handle) = start_broker(config.clone(), listener).await;

    let consumer = Session::connect(addr.to_string(), options()).unwrap();
    let (on_message, mut messages) = collector();
    consumer
        .subscribe_with("events", SubscribeOptions::from_offset(0), on_message)
        .unwrap();
    let producer = Session::connect(addr.to_string(), options()).unwrap();
    producer.publish("events", "m1").await.unwrap().wait().await.unwrap();
    assert_eq!(next_message(&mut messages).await.payload, "m1");

    server.shutdown();
    handle.await.unwrap().unwrap();
    timeout(
        Duration::from_secs(5),
        consumer.wait_for_state(ConnectionState::Disconnected),
    )
    .await
    .unwrap()
    .unwrap();

    // Published while the broker is down; sent once the producer reconnects
    let pending = producer.publish("events", "m2").await.unwrap();

    let listener = TcpListener::bind(addr).await.unwrap();
    let (server, handle) = start_broker(config, listener).await;
    timeout(Duration::from_secs(5), pending.wait())
        .await
        .unwrap()
        .unwrap();

    // The consumer reattaches after m1, so only m2 arrives
    let message = next_message(&mut messages).await;
    assert_eq!(message.payload, "m2");
    assert_eq!(message.offset, 12);
    assert!(timeout(Duration::from_millis(200), messages.recv())
        .await
        .is_err());
    assert!(consumer.metrics().connections_established >= 2);

    consumer.close().await.unwrap();
    producer.close().await.unwrap();
    server.shutdown();
    handle.await.unwrap().unwrap();
}
