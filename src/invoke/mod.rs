//! Request/response correlation by trace id.

pub mod correlator;

pub use correlator::{InvokeCorrelator, PendingGuard};
