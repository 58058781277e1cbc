//! Common types for the Claude rotation proxy

mod error;
mod redact;

pub use error::{Error, Result};
pub use redact::redact;
