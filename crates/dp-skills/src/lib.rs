//! The tool/skill catalog: builtin tools and Markdown-declared skills
//! behind one uniform contract.
//!
//! Skills are procedures the model must read before first use in a
//! session; builtins are host functions. Both validate their arguments
//! against a JSON Schema before dispatch.

pub mod loader;
pub mod manifest;
pub mod registry;
pub mod types;

pub use registry::ToolRegistry;
pub use types::{ToolEntry, ToolKind};
