//! Fixed-size frame header
//!
//! Every frame on the wire starts with a 47-byte header:
//!
//! | offset | width | field        |
//! |-------:|------:|--------------|
//! | 0      | 1     | reserved (0) |
//! | 1      | 1     | command      |
//! | 2      | 1     | role         |
//! | 3      | 4     | size         |
//! | 7      | 32    | topic        |
//! | 39     | 8     | session id   |
//!
//! Integers are little-endian regardless of host so peers of different
//! endianness can talk to each other.

use std::fmt;

use tracing::warn;

use crate::transport::session::SessionId;
use crate::utils::{Error, Result};

pub const TOPIC_SIZE: usize = 32;
pub const HEADER_SIZE: usize = 47;
pub const STATUS_SIZE: usize = 8;
/// Header plus status: everything that precedes the content.
pub const FRAME_PREFIX_SIZE: usize = HEADER_SIZE + STATUS_SIZE;

const OFF_COMMAND: usize = 1;
const OFF_ROLE: usize = 2;
const OFF_SIZE: usize = 3;
const OFF_TOPIC: usize = 7;
const OFF_SESSION: usize = OFF_TOPIC + TOPIC_SIZE;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum Role {
    #[default]
    None = 0,
    Broker = 1,
    Publisher = 2,
    Subscriber = 3,
    Server = 4,
    Client = 5,
    Produce = 6,
    Consume = 7,
}

impl TryFrom<u8> for Role {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        Ok(match value {
            0 => Role::None,
            1 => Role::Broker,
            2 => Role::Publisher,
            3 => Role::Subscriber,
            4 => Role::Server,
            5 => Role::Client,
            6 => Role::Produce,
            7 => Role::Consume,
            other => return Err(Error::UnknownRole(other)),
        })
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Role::None => "NONE",
            Role::Broker => "BROKER",
            Role::Publisher => "PUBLISHER",
            Role::Subscriber => "SUBSCRIBER",
            Role::Server => "SERVER",
            Role::Client => "CLIENT",
            Role::Produce => "PRODUCE",
            Role::Consume => "CONSUME",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum Command {
    #[default]
    Normal = 0x00,
    KeepAlive = 0x10,
    Quit = 0xFF,
}

impl TryFrom<u8> for Command {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0x00 => Ok(Command::Normal),
            0x10 => Ok(Command::KeepAlive),
            0xFF => Ok(Command::Quit),
            other => Err(Error::UnknownCommand(other)),
        }
    }
}

/// Fixed-width routing key. Matching is plain byte equality.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Topic([u8; TOPIC_SIZE]);

impl Topic {
    pub const EMPTY: Topic = Topic([0; TOPIC_SIZE]);

    /// Build a topic from raw bytes, clipping anything past 32 bytes.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        let mut key = [0u8; TOPIC_SIZE];
        let len = if bytes.len() > TOPIC_SIZE {
            warn!(
                "topic length {} out of bounds, clipped to {TOPIC_SIZE}",
                bytes.len()
            );
            TOPIC_SIZE
        } else {
            bytes.len()
        };
        key[..len].copy_from_slice(&bytes[..len]);
        Topic(key)
    }

    /// Binary-packed integer topic, e.g. `0x1234`.
    pub fn from_u32(value: u32) -> Self {
        let mut key = [0u8; TOPIC_SIZE];
        key[..4].copy_from_slice(&value.to_le_bytes());
        Topic(key)
    }

    /// `0x`-prefixed hex that fits a `u32` becomes an integer topic,
    /// anything else is taken as a byte string.
    pub fn parse(s: &str) -> Self {
        if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
            if let Ok(value) = u32::from_str_radix(hex, 16) {
                return Topic::from_u32(value);
            }
        }
        Topic::from_bytes(s.as_bytes())
    }

    pub fn as_bytes(&self) -> &[u8; TOPIC_SIZE] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.iter().all(|b| *b == 0)
    }

    fn text(&self) -> Option<&str> {
        let end = self.0.iter().position(|b| *b == 0).unwrap_or(TOPIC_SIZE);
        if end == 0 || self.0[end..].iter().any(|b| *b != 0) {
            return None;
        }
        let s = std::str::from_utf8(&self.0[..end]).ok()?;
        s.chars().all(|c| c.is_ascii_graphic() || c == ' ').then_some(s)
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(text) = self.text() {
            return f.write_str(text);
        }
        let end = self
            .0
            .iter()
            .rposition(|b| *b != 0)
            .map(|i| i + 1)
            .unwrap_or(0);
        if end <= 4 {
            let mut word = [0u8; 4];
            word.copy_from_slice(&self.0[..4]);
            return write!(f, "{:#06x}", u32::from_le_bytes(word));
        }
        f.write_str("0x")?;
        for b in &self.0[..end] {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Topic({self})")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Header {
    pub reserved: u8,
    pub command: Command,
    pub role: Role,
    /// Total frame length: header + status + content.
    pub size: u32,
    pub topic: Topic,
    pub session_id: SessionId,
}

impl Header {
    /// Header-only frame the broker sends right after accepting a socket.
    pub fn handshake(session_id: SessionId) -> Self {
        Self {
            role: Role::Broker,
            size: HEADER_SIZE as u32,
            session_id,
            ..Self::default()
        }
    }

    /// Subscriber declaration of interest in `topic`.
    pub fn announce(topic: Topic, session_id: SessionId) -> Self {
        Self {
            role: Role::Subscriber,
            size: HEADER_SIZE as u32,
            topic,
            session_id,
            ..Self::default()
        }
    }

    pub fn keep_alive(role: Role, session_id: SessionId) -> Self {
        Self {
            command: Command::KeepAlive,
            role,
            size: HEADER_SIZE as u32,
            session_id,
            ..Self::default()
        }
    }

    pub fn quit(role: Role, topic: Topic, session_id: SessionId) -> Self {
        Self {
            command: Command::Quit,
            role,
            size: HEADER_SIZE as u32,
            topic,
            session_id,
            ..Self::default()
        }
    }

    /// True when this is the bare handshake shape, i.e. no status or content follows.
    pub fn is_bare(&self) -> bool {
        self.size as usize == HEADER_SIZE
    }

    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0] = self.reserved;
        buf[OFF_COMMAND] = self.command as u8;
        buf[OFF_ROLE] = self.role as u8;
        buf[OFF_SIZE..OFF_TOPIC].copy_from_slice(&self.size.to_le_bytes());
        buf[OFF_TOPIC..OFF_SESSION].copy_from_slice(self.topic.as_bytes());
        buf[OFF_SESSION..].copy_from_slice(&self.session_id.as_u64().to_le_bytes());
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < HEADER_SIZE {
            return Err(Error::Truncated(buf.len()));
        }
        let mut size = [0u8; 4];
        size.copy_from_slice(&buf[OFF_SIZE..OFF_TOPIC]);
        let mut session = [0u8; 8];
        session.copy_from_slice(&buf[OFF_SESSION..HEADER_SIZE]);

        Ok(Self {
            reserved: buf[0],
            command: Command::try_from(buf[OFF_COMMAND])?,
            role: Role::try_from(buf[OFF_ROLE])?,
            size: u32::from_le_bytes(size),
            topic: Topic::from_bytes(&buf[OFF_TOPIC..OFF_SESSION]),
            session_id: SessionId::from(u64::from_le_bytes(session)),
        })
    }
}
