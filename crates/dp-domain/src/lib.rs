//! Shared domain types for all DataPilot crates.
//!
//! Everything that crosses a crate boundary lives here: the error
//! taxonomy, the wire event kinds, provider-agnostic messages and tool
//! calls, streaming types, the plan model, and configuration.

pub mod capability;
pub mod config;
pub mod envelope;
pub mod error;
pub mod event;
pub mod message;
pub mod plan;
pub mod redact;
pub mod stream;

pub use error::{Error, ErrorKind, Result};
