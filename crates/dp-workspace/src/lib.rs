//! The per-session workspace: a rooted file tree holding datasets,
//! artifacts, execution records, and notes.
//!
//! Every path is validated against the session root before any I/O;
//! writes are atomic (temp + rename) behind per-path advisory locks;
//! overwrites keep a FIFO-pruned version history. Tree changes are
//! published to an injected sink — the workspace never references the
//! runtime.

pub mod bundle;
pub mod dataset;
pub mod paths;
pub mod preview;
pub mod store;

pub use dataset::DatasetProfile;

pub use paths::resolve_contained;
pub use store::{FileKind, FileMeta, SessionWorkspace, TreeDelta, UpdateSink};
