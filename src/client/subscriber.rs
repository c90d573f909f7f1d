//! Long-lived subscriber
//!
//! After `setup` a background task pings the broker every keep-alive
//! interval over the shared write half. `subscribe` announces the topic and
//! then blocks in the read loop, handing every received message to a
//! dispatch task that runs the callbacks, until `exit`/`quit` is requested
//! or the connection fails.

use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::client::connect::{connect_with_backoff, read_handshake};
use crate::config::ClientSettings;
use crate::transport::io::{read_body, read_header, write_header};
use crate::transport::{Header, Inbound, Message, Role, SessionId, Status, Topic};
use crate::utils::{Error, Result};

pub type Callback = Arc<dyn Fn(&Message) + Send + Sync>;

type SharedWriter = Arc<Mutex<OwnedWriteHalf>>;

fn lock<T>(m: &StdMutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

pub struct Subscriber {
    settings: ClientSettings,
    session_id: Option<SessionId>,
    reader: Mutex<Option<OwnedReadHalf>>,
    writer: Option<SharedWriter>,
    callbacks: StdMutex<Vec<Callback>>,
    topic: StdMutex<Topic>,
    exit: CancellationToken,
    session: CancellationToken,
    keepalive: Option<JoinHandle<()>>,
}

impl Subscriber {
    pub fn new(settings: ClientSettings) -> Self {
        let exit = CancellationToken::new();
        let session = exit.child_token();
        Self {
            settings,
            session_id: None,
            reader: Mutex::new(None),
            writer: None,
            callbacks: StdMutex::new(Vec::new()),
            topic: StdMutex::new(Topic::EMPTY),
            exit,
            session,
            keepalive: None,
        }
    }

    /// Connect, complete the handshake and start the keep-alive task.
    pub async fn setup(&mut self, host: &str, port: u16) -> Result<SessionId> {
        let addr = format!("{host}:{port}");
        let mut stream = connect_with_backoff(
            &addr,
            self.settings.subscribe_retries,
            self.settings.backoff_base(),
        )
        .await?;
        let session_id = read_handshake(&mut stream).await?;
        info!("subscriber connected to {addr} as {session_id}");

        let (reader, writer) = stream.into_split();
        let writer = Arc::new(Mutex::new(writer));

        self.keepalive = Some(tokio::spawn(keepalive_task(
            writer.clone(),
            session_id,
            self.settings.keepalive_interval(),
            self.session.clone(),
        )));
        *self.reader.get_mut() = Some(reader);
        self.writer = Some(writer);
        self.session_id = Some(session_id);
        Ok(session_id)
    }

    /// Register a callback. Callbacks run in registration order.
    pub fn on_message<F>(&self, callback: F)
    where
        F: Fn(&Message) + Send + Sync + 'static,
    {
        lock(&self.callbacks).push(Arc::new(callback));
    }

    /// Announce `topic` and read messages until exit, quit or a connection
    /// failure. Callbacks registered after this call starts are not used.
    pub async fn subscribe<F>(&self, topic: Topic, callback: F) -> Result<()>
    where
        F: Fn(&Message) + Send + Sync + 'static,
    {
        let (Some(writer), Some(session_id)) = (self.writer.clone(), self.session_id) else {
            return Err(Error::NotConnected);
        };
        let Some(mut reader) = self.reader.lock().await.take() else {
            return Err(Error::NotConnected);
        };

        self.on_message(callback);
        *lock(&self.topic) = topic;
        let announce = Header::announce(topic, session_id);
        write_header(&mut *writer.lock().await, &announce).await?;
        info!("subscribed to {topic}");

        let (tx, rx) = mpsc::unbounded_channel();
        let callbacks = lock(&self.callbacks).clone();
        let dispatcher = tokio::spawn(dispatch(rx, callbacks));

        let result = self.read_loop(&mut reader, &writer, &announce, &tx).await;

        drop(tx);
        if let Err(e) = dispatcher.await {
            warn!("dispatch task failed: {e}");
        }
        self.session.cancel();
        if let Err(e) = writer.lock().await.shutdown().await {
            debug!("subscriber shutdown: {e}");
        }
        match &result {
            Ok(()) => info!("subscription to {topic} ended"),
            Err(e) => warn!("subscription to {topic} failed: {e}"),
        }
        result
    }

    async fn read_loop(
        &self,
        reader: &mut OwnedReadHalf,
        writer: &SharedWriter,
        announce: &Header,
        tx: &mpsc::UnboundedSender<Message>,
    ) -> Result<()> {
        let poll = self.settings.poll_interval();
        loop {
            tokio::select! {
                _ = self.session.cancelled() => return Ok(()),
                _ = tokio::time::sleep(poll) => {}
            }

            let header = tokio::select! {
                _ = self.session.cancelled() => return Ok(()),
                inbound = read_header(reader) => match inbound? {
                    Inbound::Heartbeat => continue,
                    Inbound::Header(header) => header,
                },
            };

            if header.is_bare() {
                // the broker asked us to say who we are again
                write_header(&mut *writer.lock().await, announce).await?;
                continue;
            }

            let (_, content) = read_body(reader, &header, self.settings.max_frame_size).await?;
            let message = Message::new(header, Status::OK, content);
            if tx.send(message).is_err() {
                return Err(Error::ConnectionClosed);
            }
        }
    }

    /// Tell the broker we are leaving, then close the connection.
    pub async fn quit(&self) -> Result<()> {
        let (Some(writer), Some(session_id)) = (&self.writer, self.session_id) else {
            return Err(Error::NotConnected);
        };
        let topic = *lock(&self.topic);
        write_header(
            &mut *writer.lock().await,
            &Header::quit(Role::Subscriber, topic, session_id),
        )
        .await?;
        self.session.cancel();

        tokio::time::sleep(self.settings.quit_linger()).await;
        if let Err(e) = writer.lock().await.shutdown().await {
            debug!("subscriber shutdown after quit: {e}");
        }
        info!("subscriber {session_id} quit");
        Ok(())
    }

    /// Stop the read loop and the keep-alive task.
    pub fn exit(&self) {
        self.exit.cancel();
    }

    pub fn exit_handle(&self) -> CancellationToken {
        self.exit.clone()
    }

    pub fn keepalive_running(&self) -> bool {
        self.keepalive.as_ref().is_some_and(|h| !h.is_finished())
    }

    pub fn session_id(&self) -> Option<SessionId> {
        self.session_id
    }
}

async fn keepalive_task(
    writer: SharedWriter,
    session_id: SessionId,
    interval: Duration,
    session: CancellationToken,
) {
    let ping = Header::keep_alive(Role::Subscriber, session_id);
    loop {
        tokio::select! {
            _ = session.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }
        let mut writer = writer.lock().await;
        if let Err(e) = write_header(&mut *writer, &ping).await {
            warn!("keep-alive failed: {e}");
            let _ = writer.shutdown().await;
            break;
        }
    }
    debug!("keep-alive task for {session_id} stopped");
}

async fn dispatch(mut rx: mpsc::UnboundedReceiver<Message>, callbacks: Vec<Callback>) {
    while let Some(message) = rx.recv().await {
        for callback in &callbacks {
            callback(&message);
        }
    }
}
