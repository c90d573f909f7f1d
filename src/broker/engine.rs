//! Broker engine
//!
//! Every accepted socket gets its own tracked task. The task sends the
//! handshake, waits for the peer to echo its session id, registers the
//! connection and then serves it by role: a publisher's single message is
//! queued and fanned out, a subscriber is kept alive until it quits or goes
//! silent. Delivery runs under the registry lock, one cycle per publish.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use socket2::{SockRef, TcpKeepalive};
use tokio::io::AsyncReadExt;
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::broker::queue::{Destination, PendingDelivery, PendingQueue};
use crate::broker::registry::{Connection, ConnectionId, Registry, run_sweeper};
use crate::config::{BrokerSettings, Settings};
use crate::transport::io::{read_body, read_header, send_within, write_header};
use crate::transport::{
    Command, HEADER_SIZE, Header, Inbound, KEEP_ALIVE_MARKER, Message, Role, SendOutcome,
    SessionId, Status, is_keep_alive,
};
use crate::utils::{Error, Result};

const TCP_KEEPALIVE_IDLE: Duration = Duration::from_secs(60);
const PEEK_BACKOFF: Duration = Duration::from_millis(5);
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Outcome of one delivery cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliveryReport {
    /// Subscribers the cycle tried to reach.
    pub matched: usize,
    pub delivered: usize,
    pub failed: usize,
    /// Unwritable subscribers queued for the next cycle.
    pub deferred: usize,
}

impl DeliveryReport {
    pub fn status(&self) -> Status {
        if self.delivered > 0 {
            Status::SUCCESS
        } else if self.matched == 0 {
            Status::NOTDEAL
        } else {
            Status::FAILURE
        }
    }
}

/// Per-cycle results, kept per message so each publisher can tell how its
/// own message fared even when a concurrent cycle moved it.
#[derive(Debug, Clone, Default)]
pub struct CycleReport {
    entries: Vec<(Arc<Message>, DeliveryReport)>,
}

impl CycleReport {
    fn entry(&mut self, message: &Arc<Message>) -> &mut DeliveryReport {
        let pos = match self.entries.iter().position(|(m, _)| Arc::ptr_eq(m, message)) {
            Some(pos) => pos,
            None => {
                self.entries.push((message.clone(), DeliveryReport::default()));
                self.entries.len() - 1
            }
        };
        &mut self.entries[pos].1
    }

    /// Sum over every entry this cycle handled.
    pub fn total(&self) -> DeliveryReport {
        self.entries
            .iter()
            .fold(DeliveryReport::default(), |mut acc, (_, r)| {
                acc.matched += r.matched;
                acc.delivered += r.delivered;
                acc.failed += r.failed;
                acc.deferred += r.deferred;
                acc
            })
    }

    /// `None` when this cycle never saw `message`.
    pub fn for_message(&self, message: &Arc<Message>) -> Option<DeliveryReport> {
        self.entries
            .iter()
            .find(|(m, _)| Arc::ptr_eq(m, message))
            .map(|(_, r)| *r)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Called once for every connection that completes the handshake, before
/// it becomes routable.
pub type Hook = Arc<dyn Fn(&Connection) + Send + Sync>;

/// State shared by the accept loop and every connection task.
struct Shared {
    registry: Arc<Registry>,
    pending: Arc<PendingQueue<PendingDelivery>>,
    settings: BrokerSettings,
    shutdown: CancellationToken,
    next_id: AtomicU64,
    next_slot: AtomicU8,
    hooks: RwLock<Vec<Hook>>,
}

impl Shared {
    fn run_hooks(&self, connection: &Connection) {
        let hooks = self.hooks.read().unwrap_or_else(|e| e.into_inner()).clone();
        for hook in &hooks {
            hook(connection);
        }
    }
}

/// The TCP broker: accepts publishers and subscribers and routes each
/// published message to the subscribers whose topic equals its topic.
///
/// A `Broker` owns everything it needs. Several can run in one process,
/// which is how the tests drive it.
pub struct Broker {
    listener: TcpListener,
    shared: Arc<Shared>,
    tracker: TaskTracker,
}

impl Broker {
    /// Bind `broker.bind_host:server.port`. Port 0 picks an ephemeral port.
    pub async fn setup(settings: &Settings) -> Result<Self> {
        let addr = format!("{}:{}", settings.broker.bind_host, settings.server.port);
        let listener = TcpListener::bind(&addr).await?;
        info!("broker bound to {}", listener.local_addr()?);

        Ok(Self {
            listener,
            shared: Arc::new(Shared {
                registry: Arc::new(Registry::new()),
                pending: Arc::new(PendingQueue::new()),
                settings: settings.broker.clone(),
                shutdown: CancellationToken::new(),
                next_id: AtomicU64::new(1),
                next_slot: AtomicU8::new(0),
                hooks: RwLock::new(Vec::new()),
            }),
            tracker: TaskTracker::new(),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn registry(&self) -> Arc<Registry> {
        self.shared.registry.clone()
    }

    pub fn pending(&self) -> Arc<PendingQueue<PendingDelivery>> {
        self.shared.pending.clone()
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shared.shutdown.clone()
    }

    /// Replace every hook with `hook`.
    pub fn register_hook(&self, hook: Hook) {
        let mut hooks = self.shared.hooks.write().unwrap_or_else(|e| e.into_inner());
        hooks.clear();
        hooks.push(hook);
    }

    /// Add `hook` after the existing ones. Adding the same `Arc` twice is a no-op.
    pub fn append_hook(&self, hook: Hook) {
        let mut hooks = self.shared.hooks.write().unwrap_or_else(|e| e.into_inner());
        if !hooks.iter().any(|h| Arc::ptr_eq(h, &hook)) {
            hooks.push(hook);
        }
    }

    pub fn hook_count(&self) -> usize {
        self.shared.hooks.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Ask the engine to stop. [`Broker::run`] returns once every task is joined.
    pub fn exit(&self) {
        info!("broker exit requested");
        self.shared.shutdown.cancel();
    }

    /// Accept loop. Returns after [`Broker::exit`] and after every spawned
    /// task has finished.
    pub async fn run(&self) -> Result<()> {
        let shared = self.shared.clone();
        self.tracker.spawn(run_sweeper(
            shared.registry.clone(),
            shared.settings.sweep_interval(),
            shared.shutdown.clone(),
        ));

        info!("broker accepting on {}", self.local_addr()?);
        loop {
            let accepted = tokio::select! {
                _ = shared.shutdown.cancelled() => break,
                accepted = self.listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, peer)) => {
                    let shared = shared.clone();
                    self.tracker.spawn(async move {
                        if let Err(e) = handle_connection(shared, stream, peer).await {
                            if e.is_disconnect() {
                                debug!("{peer} went away: {e}");
                            } else {
                                warn!("connection {peer} ended: {e}");
                            }
                        }
                    });
                }
                Err(e) => {
                    error!("accept failed: {e}");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            }
        }

        self.tracker.close();
        self.tracker.wait().await;
        let closed = shared.registry.close_all().await;
        info!("broker stopped, closed {closed} connection(s)");
        Ok(())
    }
}

fn enable_keepalive(stream: &TcpStream) -> std::io::Result<()> {
    let keepalive = TcpKeepalive::new().with_time(TCP_KEEPALIVE_IDLE);
    SockRef::from(stream).set_tcp_keepalive(&keepalive)?;
    stream.set_nodelay(true)
}

async fn handle_connection(shared: Arc<Shared>, stream: TcpStream, peer: SocketAddr) -> Result<()> {
    if let Err(e) = enable_keepalive(&stream) {
        warn!("tcp keep-alive on {peer}: {e}");
    }

    let id = shared.next_id.fetch_add(1, Ordering::Relaxed);
    let slot = shared.next_slot.fetch_add(1, Ordering::Relaxed);
    let session_id = SessionId::from_peer(peer, slot);
    let (mut reader, mut writer) = stream.into_split();

    write_header(&mut writer, &Header::handshake(session_id)).await?;
    debug!("sent handshake {session_id} to {peer}");

    let announced = tokio::select! {
        _ = shared.shutdown.cancelled() => return Ok(()),
        r = await_announce(&mut reader, session_id, shared.settings.handshake_timeout()) => r,
    };
    let header = match announced {
        Ok(header) => header,
        Err(e) => {
            info!("dropping {peer} before registration: {e}");
            return Err(e);
        }
    };

    let connection = Connection::new(id, slot, peer, session_id, header, writer);
    let active = connection.active_flag();
    shared.run_hooks(&connection);
    shared.registry.register(connection).await;
    info!("{} {peer} registered as {session_id}", header.role);

    task_allot(shared, reader, id, slot, header, active).await
}

/// Peek until the peer's first real header arrives and check it echoes
/// `session_id`. Heartbeats sent before the announcement are consumed and
/// restart the `silence` deadline, so only a quiet peer is dropped.
async fn await_announce(
    reader: &mut OwnedReadHalf,
    session_id: SessionId,
    silence: Duration,
) -> Result<Header> {
    let timed_out = || Error::Handshake(format!("no announcement within {silence:?}"));
    let mut deadline = Instant::now() + silence;
    let mut buf = [0u8; HEADER_SIZE];
    loop {
        let n = tokio::time::timeout_at(deadline, reader.peek(&mut buf))
            .await
            .map_err(|_| timed_out())??;
        if n == 0 {
            return Err(Error::ConnectionClosed);
        }

        if n >= KEEP_ALIVE_MARKER.len() && is_keep_alive(&buf[..n]) {
            reader.read_exact(&mut buf[..KEEP_ALIVE_MARKER.len()]).await?;
            deadline = Instant::now() + silence;
            continue;
        }
        if n < HEADER_SIZE {
            if Instant::now() >= deadline {
                return Err(timed_out());
            }
            tokio::time::sleep(PEEK_BACKOFF).await;
            continue;
        }

        let header = Header::decode(&buf)?;
        match header.command {
            Command::KeepAlive => {
                reader.read_exact(&mut buf).await?;
                deadline = Instant::now() + silence;
                continue;
            }
            Command::Quit => return Err(Error::Handshake("peer quit before announcing".into())),
            Command::Normal => {}
        }
        if header.session_id != session_id {
            return Err(Error::Handshake(format!(
                "expected session {session_id}, got {}",
                header.session_id
            )));
        }
        return Ok(header);
    }
}

async fn task_allot(
    shared: Arc<Shared>,
    mut reader: OwnedReadHalf,
    id: ConnectionId,
    slot: u8,
    announced: Header,
    active: Arc<AtomicBool>,
) -> Result<()> {
    match announced.role {
        Role::Publisher => {
            let header = loop {
                match read_header(&mut reader).await {
                    Ok(Inbound::Heartbeat) => continue,
                    Ok(Inbound::Header(header)) => break header,
                    Err(e) => {
                        shared.registry.mark_inactive(id).await;
                        return Err(e);
                    }
                }
            };
            proxy_task(&shared, &mut reader, id, header).await
        }
        Role::Subscriber => {
            heartbeat_task(&shared, &mut reader, id, slot, &active).await;
            Ok(())
        }
        other => {
            warn!("unsupported role {other} on connection {id}");
            shared.registry.mark_inactive(id).await;
            Ok(())
        }
    }
}

/// Keep a subscriber's record fresh until it leaves or the broker stops.
async fn heartbeat_task(
    shared: &Shared,
    reader: &mut OwnedReadHalf,
    id: ConnectionId,
    slot: u8,
    active: &AtomicBool,
) {
    while active.load(Ordering::Acquire) {
        let inbound = tokio::select! {
            _ = shared.shutdown.cancelled() => break,
            r = read_header(reader) => r,
        };

        let header = match inbound {
            Ok(Inbound::Heartbeat) => continue,
            Ok(Inbound::Header(header)) => header,
            Err(e) => {
                debug!("subscriber {id} read failed: {e}");
                shared.registry.mark_inactive(id).await;
                break;
            }
        };

        match header.command {
            Command::KeepAlive => continue,
            Command::Quit => {
                info!("subscriber {id} quit");
                shared.registry.mark_inactive(id).await;
                break;
            }
            Command::Normal => {}
        }

        if !header.is_bare() {
            // not expected from a subscriber, but keep the stream aligned
            if let Err(e) = read_body(reader, &header, shared.settings.max_frame_size).await {
                warn!("subscriber {id} sent a bad frame: {e}");
                shared.registry.mark_inactive(id).await;
                break;
            }
        }

        if header.role == Role::Subscriber && header.session_id.matches(slot) {
            if shared.registry.update_header(id, header).await {
                debug!("subscriber {id} announced {}", header.topic);
            }
        } else {
            debug!(
                "subscriber {id} sent a foreign header ({} {}), ignored",
                header.role, header.session_id
            );
        }
    }
}

/// Read one published message, queue it and run a delivery cycle.
async fn proxy_task(
    shared: &Shared,
    reader: &mut OwnedReadHalf,
    id: ConnectionId,
    header: Header,
) -> Result<()> {
    let body = tokio::select! {
        _ = shared.shutdown.cancelled() => {
            shared.registry.mark_inactive(id).await;
            return Ok(());
        }
        r = read_body(reader, &header, shared.settings.max_frame_size) => r,
    };
    let (status, content) = match body {
        Ok(body) => body,
        Err(e) => {
            shared.registry.mark_inactive(id).await;
            return Err(e);
        }
    };

    let message = Arc::new(Message::new(header, status, content));
    debug!(
        "publisher {id} sent {} bytes on {}",
        message.len(),
        message.header.topic
    );
    shared.pending.push(PendingDelivery::fan_out(message.clone()));
    shared.registry.mark_inactive(id).await;

    let cycle = deliver_pending(
        &shared.registry,
        &shared.pending,
        shared.settings.send_timeout(),
    )
    .await;
    match cycle.for_message(&message) {
        None => debug!("message from publisher {id} was handled by another cycle"),
        Some(report) => match report.status() {
            Status::NOTDEAL => info!("no subscriber for message from publisher {id}"),
            status => info!("publisher {id} delivery {status}: {report:?}"),
        },
    }
    Ok(())
}

/// One delivery cycle: every entry queued when the registry lock is taken
/// is attempted exactly once.
pub async fn deliver_pending(
    registry: &Registry,
    pending: &PendingQueue<PendingDelivery>,
    send_timeout: Duration,
) -> CycleReport {
    let buckets = registry.lock().await;
    let mut cycle = CycleReport::default();

    for _ in 0..pending.len() {
        let Some(entry) = pending.pop() else {
            break;
        };
        let report = cycle.entry(&entry.message);

        match entry.destination {
            Destination::Topic => {
                let topic = entry.message.header.topic;
                let Some(subscribers) = buckets.get(&Role::Subscriber) else {
                    continue;
                };
                for conn in subscribers
                    .iter()
                    .filter(|c| c.is_active() && c.topic() == topic)
                {
                    report.matched += 1;
                    attempt(conn, &entry, pending, send_timeout, report).await;
                }
            }
            Destination::Connection(target) => {
                let conn = buckets
                    .values()
                    .flatten()
                    .find(|c| c.id == target && c.is_active());
                match conn {
                    Some(conn) => {
                        report.matched += 1;
                        attempt(conn, &entry, pending, send_timeout, report).await;
                    }
                    None => debug!("dropping delivery for gone connection {target}"),
                }
            }
        }
    }

    cycle
}

async fn attempt(
    conn: &Connection,
    entry: &PendingDelivery,
    pending: &PendingQueue<PendingDelivery>,
    send_timeout: Duration,
    report: &mut DeliveryReport,
) {
    let Some(writer) = conn.writer() else {
        report.failed += 1;
        return;
    };

    match send_within(writer, &entry.message, send_timeout).await {
        Ok(SendOutcome::Sent(n)) => {
            debug!("delivered {n} bytes to {} ({})", conn.peer, conn.session_id);
            report.delivered += 1;
        }
        Ok(SendOutcome::Unwritable) => {
            debug!("{} not writable, deferring", conn.peer);
            pending.push(PendingDelivery::retry(entry.message.clone(), conn.id));
            report.deferred += 1;
        }
        Err(e) => {
            warn!("delivery to {} failed: {e}", conn.peer);
            conn.deactivate();
            report.failed += 1;
        }
    }
}
