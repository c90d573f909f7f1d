//! The `utils` module provides the shared error type and logging setup used
//! across `pubwire`.

pub mod error;
pub mod logging;

pub use error::{Error, Result};
