//! The `utils` module provides the crate-wide error type and the logging
//! bootstrap shared by the library and the `popmq` binary.

pub mod error;
pub mod logging;

pub use error::{MqError, Result};
