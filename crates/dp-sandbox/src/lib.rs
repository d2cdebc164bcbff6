//! Sandboxed execution of model-proposed code snippets.
//!
//! Three gates stand between a snippet and the host:
//! 1. a static policy scan rejecting dangerous constructs pre-dispatch,
//! 2. a per-call worker process whose namespace carries a restricted
//!    builtins table without the import primitive (the allowlist is
//!    pre-bound at bootstrap), and
//! 3. OS-level supervision: wall-clock timeout and an RSS cap.
//!
//! No state survives a call: each worker is fresh, and the only side
//! effects are explicit workspace writes.

pub mod bootstrap;
pub mod executor;
pub mod policy;
pub mod types;
mod worker;

pub use executor::{ExecPaths, SandboxExecutor};
pub use types::{ExecOutcome, ExecRequest, FailureKind, Language};
