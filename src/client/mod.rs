//! The `client` module provides the two client roles of the protocol.
//!
//! A [`Publisher`] connects, sends one message and disconnects. A
//! [`Subscriber`] stays connected, keeps its session alive and hands every
//! message on its topic to the registered callbacks.

pub mod connect;
pub mod publisher;
pub mod subscriber;

pub use connect::{Backoff, connect_with_backoff};
pub use publisher::Publisher;
pub use subscriber::{Callback, Subscriber};
