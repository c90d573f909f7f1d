use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use pubwire::broker::Broker;
use pubwire::client::{Publisher, Subscriber};
use pubwire::config::{ClientSettings, Settings};
use pubwire::transport::{Message, Role, Status, Topic};
use pubwire::utils::{Error, Result};

fn settings() -> Settings {
    let mut settings = Settings::default();
    settings.server.port = 0;
    settings.broker.bind_host = "127.0.0.1".to_string();
    settings.broker.sweep_interval_ms = 50;
    settings.client = ClientSettings {
        publish_retries: 2,
        subscribe_retries: 2,
        backoff_base_ms: 10,
        keepalive_interval_ms: 50,
        poll_interval_ms: 10,
        quit_linger_ms: 20,
        ..ClientSettings::default()
    };
    settings
}

async fn start_broker(settings: &Settings) -> (Arc<Broker>, u16, JoinHandle<Result<()>>) {
    let broker = Arc::new(Broker::setup(settings).await.unwrap());
    let port = broker.local_addr().unwrap().port();
    let runner = broker.clone();
    let handle = tokio::spawn(async move { runner.run().await });
    (broker, port, handle)
}

async fn start_subscriber(
    settings: &Settings,
    port: u16,
    topic: Topic,
) -> (
    Arc<Subscriber>,
    mpsc::UnboundedReceiver<Message>,
    JoinHandle<Result<()>>,
) {
    let mut subscriber = Subscriber::new(settings.client.clone());
    subscriber.setup("127.0.0.1", port).await.unwrap();
    let subscriber = Arc::new(subscriber);

    let (tx, rx) = mpsc::unbounded_channel();
    let runner = subscriber.clone();
    let handle = tokio::spawn(async move {
        runner
            .subscribe(topic, move |msg: &Message| {
                let _ = tx.send(msg.clone());
            })
            .await
    });
    (subscriber, rx, handle)
}

async fn wait_for_subscribers(broker: &Broker, count: usize) {
    let registry = broker.registry();
    for _ in 0..100 {
        if registry.active_count(Role::Subscriber).await == count {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("expected {count} registered subscribers");
}

#[tokio::test]
async fn publish_reaches_only_the_matching_subscriber() {
    let settings = settings();
    let (broker, port, broker_task) = start_broker(&settings).await;

    let (sub_a, mut rx_a, task_a) = start_subscriber(&settings, port, Topic::from_u32(0x1234)).await;
    let (sub_b, mut rx_b, task_b) = start_subscriber(&settings, port, Topic::from_u32(0x9999)).await;
    wait_for_subscribers(&broker, 2).await;

    let mut publisher = Publisher::new(settings.client.clone());
    publisher.setup("127.0.0.1", port).await.unwrap();
    publisher
        .publish(&Topic::from_u32(0x1234), b"hello")
        .await
        .unwrap();

    let msg = tokio::time::timeout(Duration::from_secs(2), rx_a.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(msg.content, b"hello");
    assert_eq!(msg.status, Status::OK);
    assert_eq!(msg.header.topic, Topic::from_u32(0x1234));

    // exactly once, and nothing for the other topic
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(rx_a.try_recv().is_err());
    assert!(rx_b.try_recv().is_err());

    sub_a.exit();
    sub_b.exit();
    assert!(task_a.await.unwrap().is_ok());
    assert!(task_b.await.unwrap().is_ok());

    broker.exit();
    broker_task.await.unwrap().unwrap();
}

#[tokio::test]
async fn publish_with_no_subscribers_is_not_an_error() {
    let settings = settings();
    let (broker, port, broker_task) = start_broker(&settings).await;

    let mut publisher = Publisher::new(settings.client.clone());
    publisher.setup("127.0.0.1", port).await.unwrap();
    let written = publisher
        .publish(&Topic::parse("void"), b"anyone?")
        .await
        .unwrap();
    assert!(written > 0);

    broker.exit();
    broker_task.await.unwrap().unwrap();
}

#[tokio::test]
async fn subscriber_quit_leaves_the_registry() {
    let settings = settings();
    let (broker, port, broker_task) = start_broker(&settings).await;

    let (subscriber, _rx, task) = start_subscriber(&settings, port, Topic::parse("bye")).await;
    wait_for_subscribers(&broker, 1).await;

    subscriber.quit().await.unwrap();
    assert!(task.await.unwrap().is_ok());
    wait_for_subscribers(&broker, 0).await;

    broker.exit();
    broker_task.await.unwrap().unwrap();
}

#[tokio::test]
async fn clients_give_up_when_no_broker_listens() {
    let settings = settings();
    let port = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };

    let mut publisher = Publisher::new(settings.client.clone());
    let err = publisher.setup("127.0.0.1", port).await.unwrap_err();
    assert!(matches!(err, Error::ConnectExhausted { attempts: 2, .. }));

    let mut subscriber = Subscriber::new(settings.client.clone());
    assert!(subscriber.setup("127.0.0.1", port).await.is_err());
    assert!(!subscriber.keepalive_running());
}
