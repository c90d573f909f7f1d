//! The `error` module defines the error type shared by the broker, the
//! clients and the wire codec.
//!
//! Transient socket conditions (`WouldBlock`, `Interrupted`) are retried in
//! place and never show up here. Everything else is surfaced to the caller
//! as a variant of [`Error`].

use std::collections::TryReserveError;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("connection closed by peer")]
    ConnectionClosed,

    #[error("gave up connecting to {addr} after {attempts} retries: {source}")]
    ConnectExhausted {
        addr: String,
        attempts: u32,
        #[source]
        source: std::io::Error,
    },

    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("unknown role byte {0}")]
    UnknownRole(u8),

    #[error("unknown command byte {0:#04x}")]
    UnknownCommand(u8),

    #[error("frame truncated: got {0} bytes")]
    Truncated(usize),

    #[error("declared frame size {size} is invalid")]
    InvalidSize { size: u32 },

    #[error("could not allocate {requested} bytes for frame content")]
    Allocation {
        requested: usize,
        #[source]
        source: TryReserveError,
    },

    #[error("not connected")]
    NotConnected,

    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),
}

impl Error {
    /// True for errors that mean the peer is gone rather than misbehaving.
    pub fn is_disconnect(&self) -> bool {
        match self {
            Error::ConnectionClosed => true,
            Error::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::UnexpectedEof
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::BrokenPipe
            ),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
