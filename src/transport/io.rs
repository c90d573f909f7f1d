//! Framed socket I/O shared by the broker and the clients.
//!
//! Readers first pull 7 bytes and check them against the keep-alive marker;
//! only when they are not a marker is the rest of the header read. A real
//! header always starts with a zero reserved byte, so the two cannot collide.

use std::io;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::time::Instant;

use crate::transport::header::{FRAME_PREFIX_SIZE, HEADER_SIZE, Header, STATUS_SIZE};
use crate::transport::message::{Message, Status};
use crate::utils::{Error, Result};

pub const KEEP_ALIVE_MARKER: &[u8; 7] = b"PWLIVE\0";
const MARKER_PREFIX_LEN: usize = 6;

/// Prefix match against the keep-alive marker.
pub fn is_keep_alive(buf: &[u8]) -> bool {
    buf.len() >= MARKER_PREFIX_LEN && buf[..MARKER_PREFIX_LEN] == KEEP_ALIVE_MARKER[..MARKER_PREFIX_LEN]
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Inbound {
    Heartbeat,
    Header(Header),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Sent(usize),
    /// Nothing could be written before the deadline; safe to retry later.
    Unwritable,
}

async fn read_full<R>(reader: &mut R, buf: &mut [u8]) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    match reader.read_exact(buf).await {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Err(Error::ConnectionClosed),
        Err(e) => Err(e.into()),
    }
}

pub async fn read_header<R>(reader: &mut R) -> Result<Inbound>
where
    R: AsyncRead + Unpin,
{
    let mut buf = [0u8; HEADER_SIZE];
    let marker_len = KEEP_ALIVE_MARKER.len();
    read_full(reader, &mut buf[..marker_len]).await?;
    if is_keep_alive(&buf[..marker_len]) {
        return Ok(Inbound::Heartbeat);
    }
    read_full(reader, &mut buf[marker_len..]).await?;
    Ok(Inbound::Header(Header::decode(&buf)?))
}

/// Read the status and content that follow `header`.
pub async fn read_body<R>(reader: &mut R, header: &Header, max_frame: usize) -> Result<(Status, Vec<u8>)>
where
    R: AsyncRead + Unpin,
{
    let size = header.size as usize;
    if size < FRAME_PREFIX_SIZE || size > max_frame {
        return Err(Error::InvalidSize { size: header.size });
    }

    let mut status = [0u8; STATUS_SIZE];
    read_full(reader, &mut status).await?;

    let remaining = size - FRAME_PREFIX_SIZE;
    let mut content = Vec::new();
    content
        .try_reserve_exact(remaining)
        .map_err(|source| Error::Allocation {
            requested: remaining,
            source,
        })?;
    content.resize(remaining, 0);
    read_full(reader, &mut content).await?;

    Ok((Status::from_bytes(status), content))
}

pub async fn write_header<W>(writer: &mut W, header: &Header) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(&header.encode()).await?;
    writer.flush().await?;
    Ok(())
}

/// Two writes: header and status first, then the content.
pub async fn write_message<W>(writer: &mut W, message: &Message) -> Result<usize>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(&message.prefix()).await?;
    writer.write_all(&message.content).await?;
    writer.flush().await?;
    Ok(message.len())
}

/// Deadline-bounded variant of [`write_message`] used for fan-out.
///
/// `WouldBlock` is retried in place until `limit` elapses. A deadline hit
/// before the first byte is [`SendOutcome::Unwritable`]; one hit mid-frame
/// is fatal because the peer's stream would be out of sync.
pub async fn send_within(writer: &OwnedWriteHalf, message: &Message, limit: Duration) -> Result<SendOutcome> {
    let prefix = message.prefix();
    let deadline = Instant::now() + limit;
    let mut sent = 0usize;

    for part in [&prefix[..], &message.content[..]] {
        let mut offset = 0;
        while offset < part.len() {
            match tokio::time::timeout_at(deadline, writer.writable()).await {
                Err(_) if sent == 0 => return Ok(SendOutcome::Unwritable),
                Err(_) => {
                    return Err(io::Error::new(io::ErrorKind::TimedOut, "frame partially written").into());
                }
                Ok(ready) => ready?,
            }
            match writer.try_write(&part[offset..]) {
                Ok(0) => return Err(io::Error::from(io::ErrorKind::WriteZero).into()),
                Ok(n) => {
                    offset += n;
                    sent += n;
                }
                Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted) => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    Ok(SendOutcome::Sent(sent))
}
