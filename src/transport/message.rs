//! Message definitions
//!
//! A `Message` is a header, an 8-byte status field and an owned content
//! buffer. Each in-flight message owns its storage; nothing is shared
//! between concurrent deliveries.

use std::fmt;

use crate::transport::header::{FRAME_PREFIX_SIZE, Header, STATUS_SIZE};

/// NUL-padded 8-byte status string.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct Status([u8; STATUS_SIZE]);

impl Status {
    pub const EMPTY: Status = Status([0; STATUS_SIZE]);
    pub const SUCCESS: Status = Status(*b"SUCCESS\0");
    pub const FAILURE: Status = Status(*b"FAILURE\0");
    pub const NOTDEAL: Status = Status(*b"NOTDEAL\0");
    pub const NULLPTR: Status = Status(*b"NULLPTR\0");
    pub const OK: Status = Status(*b"OK\0\0\0\0\0\0");

    pub fn from_bytes(bytes: [u8; STATUS_SIZE]) -> Self {
        Status(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; STATUS_SIZE] {
        &self.0
    }

    pub fn as_str(&self) -> &str {
        let end = self.0.iter().position(|b| *b == 0).unwrap_or(STATUS_SIZE);
        std::str::from_utf8(&self.0[..end]).unwrap_or("")
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Debug for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Status({:?})", self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub header: Header,
    pub status: Status,
    pub content: Vec<u8>,
}

impl Message {
    /// Build a message and stamp `header.size` to match the content. The size
    /// saturates at `u32::MAX` for content the wire cannot describe.
    pub fn new(mut header: Header, status: Status, content: Vec<u8>) -> Self {
        header.size = u32::try_from(FRAME_PREFIX_SIZE + content.len()).unwrap_or(u32::MAX);
        Self {
            header,
            status,
            content,
        }
    }

    /// Header and status, i.e. the first of the two writes.
    pub fn prefix(&self) -> [u8; FRAME_PREFIX_SIZE] {
        let mut buf = [0u8; FRAME_PREFIX_SIZE];
        buf[..FRAME_PREFIX_SIZE - STATUS_SIZE].copy_from_slice(&self.header.encode());
        buf[FRAME_PREFIX_SIZE - STATUS_SIZE..].copy_from_slice(self.status.as_bytes());
        buf
    }

    pub fn len(&self) -> usize {
        FRAME_PREFIX_SIZE + self.content.len()
    }

    pub fn is_empty(&self) -> bool {
        self.content.is_empty()
    }
}
