//! # toolrelay Core
//!
//! Domain types, traits, and error definitions for the toolrelay
//! tool-calling runtime. This crate has **no runtime dependencies**. It
//! defines the contracts the orchestrator is written against.
//!
//! ## Design Philosophy
//!
//! Every external collaborator is a trait here:
//! - [`Provider`]: the model call (turns + tool schemas in, content or tool calls out)
//! - [`Tool`]: one capability with a JSON-schema input and an `execute` handler
//!
//! Implementations live in their respective crates, so the orchestrator can
//! be tested against scripted providers and fake catalogs.

pub mod error;
pub mod message;
pub mod provider;
pub mod tool;

// Re-export key types at crate root for ergonomics
pub use error::{Error, ProviderError, Result, ToolError};
pub use message::{Role, ToolCallRequest, Turn};
pub use provider::{Provider, ProviderRequest, ProviderResponse, ToolDefinition, Usage};
pub use tool::{Tool, ToolCatalog, ToolExecutionResult, ToolOutput};
