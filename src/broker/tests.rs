use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use socket2::SockRef;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::{
    Broker, Connection, DeliveryReport, Destination, Hook, PendingDelivery, PendingQueue, Registry,
};
use super::deliver_pending;
use crate::client::Subscriber;
use crate::config::{ClientSettings, Settings};
use crate::transport::io::{read_body, read_header, write_header, write_message};
use crate::transport::{
    Command, HEADER_SIZE, Header, Inbound, KEEP_ALIVE_MARKER, Message, Role, SessionId, Status,
    Topic,
};
use crate::utils::Result;

fn test_settings() -> Settings {
    let mut settings = Settings::default();
    settings.server.port = 0;
    settings.broker.bind_host = "127.0.0.1".to_string();
    settings.broker.sweep_interval_ms = 50;
    settings.broker.handshake_timeout_ms = 500;
    settings
}

async fn start_broker() -> (Arc<Broker>, SocketAddr, JoinHandle<Result<()>>) {
    let broker = Arc::new(Broker::setup(&test_settings()).await.unwrap());
    let addr = broker.local_addr().unwrap();
    let runner = broker.clone();
    let handle = tokio::spawn(async move { runner.run().await });
    (broker, addr, handle)
}

async fn wait_for_subscribers(registry: &Registry, count: usize) -> bool {
    for _ in 0..100 {
        if registry.active_count(Role::Subscriber).await == count {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

async fn wait_for_len(registry: &Registry, len: usize) -> bool {
    for _ in 0..100 {
        if registry.len().await == len {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

/// Connect and read the broker's handshake.
async fn raw_connect(addr: SocketAddr) -> (TcpStream, SessionId) {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let Inbound::Header(handshake) = read_header(&mut stream).await.unwrap() else {
        panic!("expected a handshake header");
    };
    assert_eq!(handshake.role, Role::Broker);
    assert_eq!(handshake.size as usize, HEADER_SIZE);
    (stream, handshake.session_id)
}

async fn raw_subscriber(addr: SocketAddr, topic: Topic) -> (TcpStream, SessionId) {
    let (mut stream, sid) = raw_connect(addr).await;
    write_header(&mut stream, &Header::announce(topic, sid))
        .await
        .unwrap();
    (stream, sid)
}

async fn raw_publish(addr: SocketAddr, topic: Topic, payload: &[u8]) {
    let (mut stream, sid) = raw_connect(addr).await;
    let header = Header {
        role: Role::Publisher,
        topic,
        session_id: sid,
        ..Header::default()
    };
    let msg = Message::new(header, Status::EMPTY, payload.to_vec());
    write_message(&mut stream, &msg).await.unwrap();
    stream.shutdown().await.unwrap();
}

/// A registered-looking connection backed by a real loopback socket.
/// Returns the record and the peer end.
async fn loopback_connection(id: u64, role: Role, topic: Topic) -> (Connection, TcpStream) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let peer = TcpStream::connect(addr).await.unwrap();
    let (accepted, peer_addr) = listener.accept().await.unwrap();
    let (_reader, writer) = accepted.into_split();

    let session_id = SessionId::from_peer(peer_addr, id as u8);
    let header = Header {
        role,
        topic,
        size: HEADER_SIZE as u32,
        session_id,
        ..Header::default()
    };
    (
        Connection::new(id, id as u8, peer_addr, session_id, header, writer),
        peer,
    )
}

/// Write into `writer` until the kernel buffers toward a peer that never
/// reads are full. Returns the number of bytes written.
async fn fill_until_blocked(writer: &OwnedWriteHalf) -> usize {
    let chunk = vec![0xAAu8; 64 * 1024];
    let mut total = 0;
    while let Ok(ready) = tokio::time::timeout(Duration::from_millis(100), writer.writable()).await {
        ready.unwrap();
        match writer.try_write(&chunk) {
            Ok(n) => total += n,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
            Err(e) => panic!("filling the send buffer failed: {e}"),
        }
    }
    total
}

fn publish_to(topic: Topic, payload: &[u8]) -> Arc<Message> {
    let header = Header {
        role: Role::Publisher,
        topic,
        ..Header::default()
    };
    Arc::new(Message::new(header, Status::EMPTY, payload.to_vec()))
}

#[test]
fn test_pending_queue_fifo() {
    let queue = PendingQueue::new();
    assert!(queue.is_empty());
    assert_eq!(queue.front(), None::<u32>);
    assert_eq!(queue.pop(), None);

    queue.push(1);
    queue.push(2);
    queue.push(3);
    assert_eq!(queue.len(), 3);
    assert_eq!(queue.front(), Some(1));
    assert_eq!(queue.pop(), Some(1));
    assert_eq!(queue.pop(), Some(2));
    assert_eq!(queue.pop(), Some(3));
    assert!(queue.is_empty());
}

#[test]
fn test_delivery_report_status() {
    let report = DeliveryReport::default();
    assert_eq!(report.status(), Status::NOTDEAL);

    let report = DeliveryReport {
        matched: 2,
        delivered: 1,
        failed: 1,
        deferred: 0,
    };
    assert_eq!(report.status(), Status::SUCCESS);

    let report = DeliveryReport {
        matched: 2,
        delivered: 0,
        failed: 1,
        deferred: 1,
    };
    assert_eq!(report.status(), Status::FAILURE);
}

#[tokio::test]
async fn test_sweep_removes_inactive_and_closes_peer() {
    let registry = Registry::new();
    let topic = Topic::parse("sweep");
    let (first, mut first_peer) = loopback_connection(1, Role::Subscriber, topic).await;
    let (second, _second_peer) = loopback_connection(2, Role::Subscriber, topic).await;
    registry.register(first).await;
    registry.register(second).await;
    assert_eq!(registry.active_count(Role::Subscriber).await, 2);

    assert!(registry.mark_inactive(1).await);
    assert!(!registry.is_active(1).await);
    assert_eq!(registry.sweep().await, 1);
    assert_eq!(registry.len().await, 1);
    assert!(registry.is_active(2).await);

    // the swept socket is shut down, so the peer sees EOF
    let mut buf = [0u8; 8];
    let n = tokio::time::timeout(Duration::from_secs(1), first_peer.read(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(n, 0);

    registry.mark_inactive(2).await;
    assert_eq!(registry.sweep().await, 1);
    assert!(!registry.has_bucket(Role::Subscriber).await);
    assert!(registry.is_empty().await);
}

#[tokio::test]
async fn test_sweep_keeps_active_records() {
    let registry = Registry::new();
    let (conn, _peer) = loopback_connection(7, Role::Subscriber, Topic::parse("a")).await;
    registry.register(conn).await;
    assert_eq!(registry.sweep().await, 0);
    assert_eq!(registry.len().await, 1);
    assert!(!registry.mark_inactive(99).await);
}

#[tokio::test]
async fn test_update_header_changes_route() {
    let registry = Registry::new();
    let (conn, _peer) = loopback_connection(3, Role::Subscriber, Topic::parse("old")).await;
    let mut header = conn.header;
    registry.register(conn).await;

    header.topic = Topic::parse("new");
    assert!(registry.update_header(3, header).await);
    let buckets = registry.lock().await;
    assert_eq!(buckets[&Role::Subscriber][0].topic(), Topic::parse("new"));
}

#[tokio::test]
async fn test_delivery_cycle_without_subscribers() {
    let registry = Registry::new();
    let pending = PendingQueue::new();
    let header = Header {
        role: Role::Publisher,
        topic: Topic::from_u32(0x42),
        ..Header::default()
    };
    let msg = Arc::new(Message::new(header, Status::EMPTY, b"nobody".to_vec()));
    pending.push(PendingDelivery::fan_out(msg.clone()));
    pending.push(PendingDelivery::retry(msg, 1234));

    let report = deliver_pending(&registry, &pending, Duration::from_millis(100)).await.total();
    assert_eq!(report.matched, 0);
    assert_eq!(report.status(), Status::NOTDEAL);
    assert!(pending.is_empty());
}

#[tokio::test]
async fn test_delivery_cycle_matches_exact_topic() {
    let registry = Registry::new();
    let pending = PendingQueue::new();
    let (hit, mut hit_peer) = loopback_connection(1, Role::Subscriber, Topic::from_u32(0x1234)).await;
    let (miss, _miss_peer) = loopback_connection(2, Role::Subscriber, Topic::from_u32(0x9999)).await;
    registry.register(hit).await;
    registry.register(miss).await;

    let header = Header {
        role: Role::Publisher,
        topic: Topic::from_u32(0x1234),
        ..Header::default()
    };
    pending.push(PendingDelivery::fan_out(Arc::new(Message::new(
        header,
        Status::EMPTY,
        b"hello".to_vec(),
    ))));

    let report = deliver_pending(&registry, &pending, Duration::from_secs(1)).await.total();
    assert_eq!(report.matched, 1);
    assert_eq!(report.delivered, 1);
    assert_eq!(report.status(), Status::SUCCESS);

    let Inbound::Header(received) = read_header(&mut hit_peer).await.unwrap() else {
        panic!("expected a header");
    };
    let (_, content) = read_body(&mut hit_peer, &received, 1 << 20).await.unwrap();
    assert_eq!(content, b"hello");
}

#[tokio::test]
async fn test_publish_reaches_matching_subscriber_only() {
    let (broker, addr, handle) = start_broker().await;
    let registry = broker.registry();

    let (mut wanted, _) = raw_subscriber(addr, Topic::parse("news")).await;
    let (mut other, _) = raw_subscriber(addr, Topic::parse("sports")).await;
    assert!(wait_for_subscribers(&registry, 2).await);

    raw_publish(addr, Topic::parse("news"), b"extra extra").await;

    let Inbound::Header(header) = read_header(&mut wanted).await.unwrap() else {
        panic!("expected a header");
    };
    assert_eq!(header.topic, Topic::parse("news"));
    let (_, content) = read_body(&mut wanted, &header, 1 << 20).await.unwrap();
    assert_eq!(content, b"extra extra");

    let mut buf = [0u8; HEADER_SIZE];
    let nothing = tokio::time::timeout(Duration::from_millis(300), other.read(&mut buf)).await;
    assert!(nothing.is_err(), "subscriber on another topic got data");

    // the single-shot publisher is swept away
    assert!(wait_for_len(&registry, 2).await);

    broker.exit();
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_heartbeats_before_announce_are_consumed() {
    let (broker, addr, handle) = start_broker().await;
    let registry = broker.registry();

    let (mut stream, sid) = raw_connect(addr).await;
    stream.write_all(KEEP_ALIVE_MARKER).await.unwrap();
    write_header(&mut stream, &Header::keep_alive(Role::Subscriber, sid))
        .await
        .unwrap();
    write_header(&mut stream, &Header::announce(Topic::parse("t"), sid))
        .await
        .unwrap();

    assert!(wait_for_subscribers(&registry, 1).await);

    broker.exit();
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_quit_removes_subscriber() {
    let (broker, addr, handle) = start_broker().await;
    let registry = broker.registry();

    let topic = Topic::parse("leaving");
    let (mut stream, sid) = raw_subscriber(addr, topic).await;
    assert!(wait_for_subscribers(&registry, 1).await);

    let quit = Header::quit(Role::Subscriber, topic, sid);
    assert_eq!(quit.command, Command::Quit);
    write_header(&mut stream, &quit).await.unwrap();

    assert!(wait_for_len(&registry, 0).await);
    assert!(!registry.has_bucket(Role::Subscriber).await);

    broker.exit();
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_wrong_session_id_is_not_registered() {
    let (broker, addr, handle) = start_broker().await;
    let registry = broker.registry();

    let (mut stream, sid) = raw_connect(addr).await;
    let forged = SessionId::from(sid.as_u64() ^ 0xffff_0000);
    write_header(&mut stream, &Header::announce(Topic::parse("x"), forged))
        .await
        .unwrap();

    let mut buf = [0u8; 8];
    let n = tokio::time::timeout(Duration::from_secs(2), stream.read(&mut buf))
        .await
        .unwrap()
        .unwrap_or(0);
    assert_eq!(n, 0, "broker should close an unmatched handshake");
    assert!(registry.is_empty().await);

    broker.exit();
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_silent_peer_times_out() {
    let (broker, addr, handle) = start_broker().await;

    let (mut stream, _) = raw_connect(addr).await;
    let mut buf = [0u8; 8];
    let n = tokio::time::timeout(Duration::from_secs(2), stream.read(&mut buf))
        .await
        .unwrap()
        .unwrap_or(0);
    assert_eq!(n, 0);
    assert!(broker.registry().is_empty().await);

    broker.exit();
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_exit_joins_live_connections() {
    let (broker, addr, handle) = start_broker().await;
    let registry = broker.registry();
    let (_stream, _) = raw_subscriber(addr, Topic::parse("stay")).await;
    assert!(wait_for_subscribers(&registry, 1).await);

    broker.exit();
    assert!(broker.shutdown_token().is_cancelled());
    tokio::time::timeout(Duration::from_secs(2), handle)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert!(registry.is_empty().await);
}

#[tokio::test]
async fn test_unwritable_subscriber_is_retried_next_cycle() {
    let registry = Registry::new();
    let pending = PendingQueue::new();
    let topic = Topic::parse("slow");
    let (conn, mut peer) = loopback_connection(1, Role::Subscriber, topic).await;
    let filler = fill_until_blocked(conn.writer().unwrap()).await;
    assert!(filler > 0);
    registry.register(conn).await;

    let message = publish_to(topic, b"later");
    pending.push(PendingDelivery::fan_out(message.clone()));
    let report = deliver_pending(&registry, &pending, Duration::from_millis(20))
        .await
        .total();
    assert_eq!(report.matched, 1);
    assert_eq!(report.deferred, 1);
    assert_eq!(report.delivered, 0);
    assert_eq!(report.status(), Status::FAILURE);
    assert!(registry.is_active(1).await);

    let retry = pending.front().unwrap();
    assert_eq!(retry.destination, Destination::Connection(1));
    assert!(Arc::ptr_eq(&retry.message, &message));

    // the peer catches up and the next cycle goes through
    let mut drained = vec![0u8; filler];
    peer.read_exact(&mut drained).await.unwrap();
    let report = deliver_pending(&registry, &pending, Duration::from_secs(1))
        .await
        .total();
    assert_eq!(report.delivered, 1);
    assert_eq!(report.deferred, 0);
    assert!(pending.is_empty());

    let Inbound::Header(received) = read_header(&mut peer).await.unwrap() else {
        panic!("expected a header");
    };
    assert_eq!(received.topic, topic);
    let (_, content) = read_body(&mut peer, &received, 1 << 20).await.unwrap();
    assert_eq!(content, b"later");
}

#[tokio::test]
async fn test_retry_for_inactive_connection_is_dropped() {
    let registry = Registry::new();
    let pending = PendingQueue::new();
    let topic = Topic::parse("gone");
    let (conn, _peer) = loopback_connection(5, Role::Subscriber, topic).await;
    registry.register(conn).await;
    assert!(registry.mark_inactive(5).await);

    let message = publish_to(topic, b"too late");
    pending.push(PendingDelivery::retry(message.clone(), 5));
    let cycle = deliver_pending(&registry, &pending, Duration::from_millis(100)).await;
    assert!(pending.is_empty());
    let report = cycle.for_message(&message).unwrap();
    assert_eq!(report.matched, 0);
    assert_eq!(report.status(), Status::NOTDEAL);
}

#[tokio::test]
async fn test_reset_peer_fails_only_its_own_delivery() {
    let registry = Registry::new();
    let pending = PendingQueue::new();
    let topic = Topic::parse("mixed");
    let (broken, broken_peer) = loopback_connection(1, Role::Subscriber, topic).await;
    let (healthy, mut healthy_peer) = loopback_connection(2, Role::Subscriber, topic).await;

    // abortive close: the broker side sees a reset instead of a FIN
    SockRef::from(&broken_peer)
        .set_linger(Some(Duration::ZERO))
        .unwrap();
    drop(broken_peer);
    tokio::time::sleep(Duration::from_millis(50)).await;

    registry.register(broken).await;
    registry.register(healthy).await;

    pending.push(PendingDelivery::fan_out(publish_to(topic, b"still here")));
    let report = deliver_pending(&registry, &pending, Duration::from_secs(1))
        .await
        .total();
    assert_eq!(report.matched, 2);
    assert_eq!(report.delivered, 1);
    assert_eq!(report.failed, 1);
    assert_eq!(report.deferred, 0);
    assert_eq!(report.status(), Status::SUCCESS);
    assert!(pending.is_empty());

    assert!(!registry.is_active(1).await);
    assert!(registry.is_active(2).await);
    assert_eq!(registry.sweep().await, 1);

    let Inbound::Header(received) = read_header(&mut healthy_peer).await.unwrap() else {
        panic!("expected a header");
    };
    let (_, content) = read_body(&mut healthy_peer, &received, 1 << 20).await.unwrap();
    assert_eq!(content, b"still here");
}

#[tokio::test]
async fn test_cycle_reports_each_message_separately() {
    let registry = Registry::new();
    let pending = PendingQueue::new();
    let (conn, _peer) = loopback_connection(1, Role::Subscriber, Topic::parse("busy")).await;
    registry.register(conn).await;

    let routed = publish_to(Topic::parse("busy"), b"one");
    let unrouted = publish_to(Topic::parse("quiet"), b"two");
    let absent = publish_to(Topic::parse("busy"), b"three");
    pending.push(PendingDelivery::fan_out(routed.clone()));
    pending.push(PendingDelivery::fan_out(unrouted.clone()));

    let cycle = deliver_pending(&registry, &pending, Duration::from_secs(1)).await;
    assert_eq!(cycle.len(), 2);
    assert_eq!(cycle.for_message(&routed).unwrap().status(), Status::SUCCESS);
    assert_eq!(cycle.for_message(&unrouted).unwrap().status(), Status::NOTDEAL);
    assert_eq!(cycle.for_message(&absent), None);

    let total = cycle.total();
    assert_eq!(total.matched, 1);
    assert_eq!(total.delivered, 1);
}

#[tokio::test]
async fn test_hooks_dedupe_and_run_in_order() {
    let (broker, addr, handle) = start_broker().await;
    let seen = Arc::new(Mutex::new(Vec::new()));

    let log = seen.clone();
    let first: Hook = Arc::new(move |conn: &Connection| {
        log.lock().unwrap().push(("first", conn.role(), conn.topic()));
    });
    let log = seen.clone();
    let second: Hook = Arc::new(move |conn: &Connection| {
        log.lock().unwrap().push(("second", conn.role(), conn.topic()));
    });

    broker.append_hook(first.clone());
    broker.append_hook(first.clone());
    assert_eq!(broker.hook_count(), 1);
    broker.append_hook(second.clone());
    assert_eq!(broker.hook_count(), 2);

    let topic = Topic::parse("hooked");
    let (_stream, _) = raw_subscriber(addr, topic).await;
    assert!(wait_for_subscribers(&broker.registry(), 1).await);
    assert_eq!(
        *seen.lock().unwrap(),
        vec![
            ("first", Role::Subscriber, topic),
            ("second", Role::Subscriber, topic),
        ]
    );

    broker.register_hook(second);
    assert_eq!(broker.hook_count(), 1);
    seen.lock().unwrap().clear();
    let (_other, _) = raw_subscriber(addr, topic).await;
    assert!(wait_for_subscribers(&broker.registry(), 2).await);
    assert_eq!(*seen.lock().unwrap(), vec![("second", Role::Subscriber, topic)]);

    broker.exit();
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_keepalives_hold_the_handshake_open() {
    let (broker, addr, handle) = start_broker().await;
    let settings = ClientSettings {
        keepalive_interval_ms: 50,
        poll_interval_ms: 10,
        ..ClientSettings::default()
    };

    let mut subscriber = Subscriber::new(settings);
    subscriber.setup("127.0.0.1", addr.port()).await.unwrap();
    // well past the 500 ms announce window, kept alive only by pings
    tokio::time::sleep(Duration::from_millis(800)).await;

    let (tx, mut rx) = mpsc::unbounded_channel();
    let subscriber = Arc::new(subscriber);
    let runner = subscriber.clone();
    let topic = Topic::parse("late");
    let task = tokio::spawn(async move {
        runner
            .subscribe(topic, move |msg: &Message| {
                let _ = tx.send(msg.clone());
            })
            .await
    });

    assert!(wait_for_subscribers(&broker.registry(), 1).await);
    raw_publish(addr, topic, b"worth the wait").await;
    let msg = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(msg.content, b"worth the wait");

    subscriber.exit();
    assert!(task.await.unwrap().is_ok());
    broker.exit();
    handle.await.unwrap().unwrap();
}
