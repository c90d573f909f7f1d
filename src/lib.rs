//! # PubWire
//!
//! `pubwire` is a lightweight publish/subscribe broker spoken over raw TCP
//! with a fixed-size binary header.
//!
//! Publishers connect, send one message and leave. Subscribers stay
//! connected, announce a topic and receive every message published on it.
//! The broker tracks each connection under a session id it hands out during
//! the handshake and sweeps away the ones that went quiet.
//!
//! ## Core Modules
//!
//! - `broker`: the accept loop, connection registry, sweeper and delivery queue.
//! - `client`: the publisher and subscriber clients.
//! - `config`: loading settings from files and the environment.
//! - `transport`: the wire format and framed socket I/O.
//! - `utils`: the shared error type and logging setup.

pub mod broker;
pub mod client;
pub mod config;
pub mod transport;
pub mod utils;
