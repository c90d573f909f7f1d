//! Connection setup shared by the publisher and the subscriber.

use std::time::Duration;

use tokio::io::AsyncRead;
use tokio::net::TcpStream;
use tracing::{debug, warn};

use crate::transport::io::read_header;
use crate::transport::{HEADER_SIZE, Inbound, Role, SessionId};
use crate::utils::{Error, Result};

const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Retry delays: `base * 2^attempt`, counting from zero, capped at 30s.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    attempt: u32,
    max_attempts: u32,
}

impl Backoff {
    pub fn new(base: Duration, max_attempts: u32) -> Self {
        Self {
            base,
            attempt: 0,
            max_attempts,
        }
    }
}

impl Iterator for Backoff {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        if self.attempt >= self.max_attempts {
            return None;
        }
        let factor = 2u32.saturating_pow(self.attempt);
        self.attempt += 1;
        Some(self.base.saturating_mul(factor).min(MAX_BACKOFF))
    }
}

/// Connect to `addr`, retrying up to `retries` times with exponential backoff.
pub async fn connect_with_backoff(addr: &str, retries: u32, base: Duration) -> Result<TcpStream> {
    let mut delays = Backoff::new(base, retries);
    loop {
        match TcpStream::connect(addr).await {
            Ok(stream) => {
                debug!("connected to {addr}");
                return Ok(stream);
            }
            Err(source) => match delays.next() {
                Some(delay) => {
                    warn!("connect to {addr} failed: {source}, retrying in {delay:?}");
                    tokio::time::sleep(delay).await;
                }
                None => {
                    return Err(Error::ConnectExhausted {
                        addr: addr.to_string(),
                        attempts: retries,
                        source,
                    });
                }
            },
        }
    }
}

/// Read the broker's handshake and return the session id it issued.
pub async fn read_handshake<R>(reader: &mut R) -> Result<SessionId>
where
    R: AsyncRead + Unpin,
{
    let header = loop {
        match read_header(reader).await? {
            Inbound::Heartbeat => continue,
            Inbound::Header(header) => break header,
        }
    };

    if header.role != Role::Broker || header.size as usize != HEADER_SIZE {
        return Err(Error::Handshake(format!(
            "unexpected greeting: role {}, size {}",
            header.role, header.size
        )));
    }
    Ok(header.session_id)
}
