//! Context compression: keep the prompt under budget without losing
//! workspace-materialized work.
//!
//! When the prompt estimate strictly exceeds the threshold, the prefix
//! outside the recency window is compressed: bulky tool payloads are
//! replaced by reference handles pointing at workspace copies, and the
//! remaining narrative is summarized through an auxiliary model call.
//! If summarization fails or overruns its budget, a mechanical
//! truncation fallback drops the oldest blocks and flags the result
//! lossy.

pub mod engine;
pub mod estimate;
pub mod record;

pub use engine::{CompressionEngine, CompressionOutcome};
pub use estimate::{estimate_message_tokens, estimate_tokens};
pub use record::{CompressionRecord, CompressionStore};
