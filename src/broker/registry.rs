//! Connection registry and liveness sweeper
//!
//! The registry maps a role to the connections currently classified under
//! it. It is the one piece of shared mutable state in the broker, so every
//! insert, mark-inactive, header update and sweep-erase happens under its
//! lock. Subscriber routing is a scan of the `Subscriber` bucket.
//!
//! A connection is never removed directly. Tasks mark it inactive, and the
//! sweeper later pulls it out of its bucket and closes the write half. That
//! order keeps a socket from being closed while it is still routable, and
//! the `Option` around the writer makes a second close impossible.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::{Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::transport::{Header, Role, SessionId, Topic};

pub type ConnectionId = u64;

pub type Buckets = HashMap<Role, Vec<Connection>>;

const CLOSE_TIMEOUT: Duration = Duration::from_millis(500);

#[derive(Debug)]
pub struct Connection {
    pub id: ConnectionId,
    pub slot: u8,
    pub peer: SocketAddr,
    pub session_id: SessionId,
    /// Last header seen from the peer: role and topic snapshot.
    pub header: Header,
    active: Arc<AtomicBool>,
    writer: Option<OwnedWriteHalf>,
}

impl Connection {
    pub fn new(
        id: ConnectionId,
        slot: u8,
        peer: SocketAddr,
        session_id: SessionId,
        header: Header,
        writer: OwnedWriteHalf,
    ) -> Self {
        Self {
            id,
            slot,
            peer,
            session_id,
            header,
            active: Arc::new(AtomicBool::new(true)),
            writer: Some(writer),
        }
    }

    pub fn role(&self) -> Role {
        self.header.role
    }

    pub fn topic(&self) -> Topic {
        self.header.topic
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Flag shared with the task serving this connection.
    pub fn active_flag(&self) -> Arc<AtomicBool> {
        self.active.clone()
    }

    pub(crate) fn deactivate(&self) {
        self.active.store(false, Ordering::Release);
    }

    pub fn writer(&self) -> Option<&OwnedWriteHalf> {
        self.writer.as_ref()
    }

    async fn close(&mut self) {
        let Some(mut writer) = self.writer.take() else {
            return;
        };
        match tokio::time::timeout(CLOSE_TIMEOUT, writer.shutdown()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("close {} ({}) failed: {e}", self.peer, self.id),
            Err(_) => warn!("close {} ({}) timed out", self.peer, self.id),
        }
    }
}

#[derive(Debug, Default)]
pub struct Registry {
    buckets: Mutex<Buckets>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, connection: Connection) {
        let mut buckets = self.buckets.lock().await;
        buckets
            .entry(connection.role())
            .or_default()
            .push(connection);
    }

    /// Flag every record holding `id` as inactive. The sweeper does the rest.
    pub async fn mark_inactive(&self, id: ConnectionId) -> bool {
        let buckets = self.buckets.lock().await;
        mark_in(&buckets, id)
    }

    pub async fn update_header(&self, id: ConnectionId, header: Header) -> bool {
        let mut buckets = self.buckets.lock().await;
        for conn in buckets.values_mut().flatten() {
            if conn.id == id {
                conn.header = header;
                return true;
            }
        }
        false
    }

    pub async fn is_active(&self, id: ConnectionId) -> bool {
        let buckets = self.buckets.lock().await;
        buckets
            .values()
            .flatten()
            .any(|conn| conn.id == id && conn.is_active())
    }

    pub async fn active_count(&self, role: Role) -> usize {
        let buckets = self.buckets.lock().await;
        buckets
            .get(&role)
            .map(|conns| conns.iter().filter(|c| c.is_active()).count())
            .unwrap_or(0)
    }

    pub async fn has_bucket(&self, role: Role) -> bool {
        self.buckets.lock().await.contains_key(&role)
    }

    pub async fn len(&self) -> usize {
        self.buckets.lock().await.values().map(Vec::len).sum()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub(crate) async fn lock(&self) -> MutexGuard<'_, Buckets> {
        self.buckets.lock().await
    }

    /// Remove and close every inactive connection, then drop empty buckets.
    /// Returns how many connections were removed.
    pub async fn sweep(&self) -> usize {
        let mut buckets = self.buckets.lock().await;
        let mut removed = Vec::new();

        for conns in buckets.values_mut() {
            let (dead, live): (Vec<_>, Vec<_>) = conns.drain(..).partition(|c| !c.is_active());
            *conns = live;
            removed.extend(dead);
        }

        for conn in removed.iter_mut() {
            conn.close().await;
            info!(
                "deleted offline {} {} ({})",
                conn.role(),
                conn.peer,
                conn.session_id
            );
        }

        buckets.retain(|role, conns| {
            if conns.is_empty() {
                debug!("bucket {role} is empty, deleted");
                false
            } else {
                true
            }
        });

        removed.len()
    }

    /// Mark everything inactive and sweep. Used once the broker has stopped.
    pub async fn close_all(&self) -> usize {
        {
            let buckets = self.buckets.lock().await;
            for conn in buckets.values().flatten() {
                conn.deactivate();
            }
        }
        self.sweep().await
    }
}

pub(crate) fn mark_in(buckets: &Buckets, id: ConnectionId) -> bool {
    let mut found = false;
    for conn in buckets.values().flatten().filter(|c| c.id == id) {
        conn.deactivate();
        found = true;
    }
    found
}

/// Sweep `registry` every `interval` until `shutdown` fires.
pub async fn run_sweeper(registry: Arc<Registry>, interval: Duration, shutdown: CancellationToken) {
    info!("liveness sweeper started, interval {interval:?}");
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }
        let removed = registry.sweep().await;
        if removed > 0 {
            debug!("sweep removed {removed} connection(s)");
        }
    }
    info!("liveness sweeper stopped");
}
