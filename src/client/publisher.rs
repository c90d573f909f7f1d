//! Single-shot publisher
//!
//! `setup` connects and reads the broker's handshake. `publish` writes one
//! frame stamped with the session id and closes the connection.

use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use crate::client::connect::{connect_with_backoff, read_handshake};
use crate::config::ClientSettings;
use crate::transport::io::write_message;
use crate::transport::{FRAME_PREFIX_SIZE, Header, Message, Role, SessionId, Status, Topic};
use crate::utils::{Error, Result};

/// Single-shot publisher: one connection carries exactly one message.
#[derive(Debug)]
pub struct Publisher {
    settings: ClientSettings,
    stream: Option<TcpStream>,
    session_id: Option<SessionId>,
}

impl Publisher {
    pub fn new(settings: ClientSettings) -> Self {
        Self {
            settings,
            stream: None,
            session_id: None,
        }
    }

    /// Connect and complete the handshake.
    pub async fn setup(&mut self, host: &str, port: u16) -> Result<SessionId> {
        let addr = format!("{host}:{port}");
        let mut stream = connect_with_backoff(
            &addr,
            self.settings.publish_retries,
            self.settings.backoff_base(),
        )
        .await?;
        let session_id = read_handshake(&mut stream).await?;
        info!("publisher connected to {addr} as {session_id}");

        self.stream = Some(stream);
        self.session_id = Some(session_id);
        Ok(session_id)
    }

    /// Send `payload` on `topic` and close the connection.
    ///
    /// An empty topic or payload is a no-op returning `Ok(0)`. A frame over
    /// `max_frame_size` fails with [`Error::InvalidSize`] and leaves the
    /// connection open. A second call fails with [`Error::NotConnected`].
    pub async fn publish(&mut self, topic: &Topic, payload: &[u8]) -> Result<usize> {
        if topic.is_empty() || payload.is_empty() {
            warn!("nothing to publish: empty topic or payload");
            return Ok(0);
        }
        let total = FRAME_PREFIX_SIZE.saturating_add(payload.len());
        if total > self.settings.max_frame_size || u32::try_from(total).is_err() {
            return Err(Error::InvalidSize {
                size: u32::try_from(total).unwrap_or(u32::MAX),
            });
        }
        let (Some(mut stream), Some(session_id)) = (self.stream.take(), self.session_id) else {
            return Err(Error::NotConnected);
        };

        let header = Header {
            role: Role::Publisher,
            topic: *topic,
            session_id,
            ..Header::default()
        };
        let message = Message::new(header, Status::EMPTY, payload.to_vec());
        let written = write_message(&mut stream, &message).await?;
        if let Err(e) = stream.shutdown().await {
            debug!("publisher shutdown: {e}");
        }
        info!("published {written} bytes on {topic}");
        Ok(written)
    }

    pub fn session_id(&self) -> Option<SessionId> {
        self.session_id
    }

    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }
}
