//! The `transport` module defines the wire protocol spoken between the
//! broker and its clients.
//!
//! It covers the fixed header layout, the status/content framing of a
//! message, the session id scheme and the socket helpers that read and
//! write frames while filtering out keep-alive markers.

pub mod header;
pub mod io;
pub mod message;
pub mod session;

pub use header::{
    Command, FRAME_PREFIX_SIZE, HEADER_SIZE, Header, Role, STATUS_SIZE, TOPIC_SIZE, Topic,
};
pub use io::{Inbound, KEEP_ALIVE_MARKER, SendOutcome, is_keep_alive};
pub use message::{Message, Status};
pub use session::SessionId;
