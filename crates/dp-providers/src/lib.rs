//! Multi-provider model access: adapters, registry, and the failover
//! router.
//!
//! Adapters translate between the internal message/stream types and
//! each provider's wire format; the router picks a binding per purpose
//! and walks the priority list on transient failure.

pub mod anthropic;
pub mod health;
pub mod openai_compat;
pub mod registry;
pub mod router;
mod sse;
pub mod traits;
mod util;

pub use registry::ProviderRegistry;
pub use router::ModelRouter;
pub use traits::{ChatRequest, ChatResponse, LlmProvider};
