//! The agent runtime: the streaming ReAct loop and everything it
//! coordinates — event ordering, per-session lanes, cancellation, the
//! plan tracker, builtin tools, and the dependency-injected `Runtime`
//! facade the transport layer binds to.

pub mod bus;
pub mod cancel;
pub mod lane;
pub mod plan;
pub mod prompt;
pub mod runtime;
pub mod telemetry;
pub mod tools;
mod turn;

pub use runtime::{Runtime, RuntimeBuilder};
pub use telemetry::init_tracing;
