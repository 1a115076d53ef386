//! Built-in tool implementations for toolrelay.
//!
//! Only the reference `calculator` ships here; real deployments register
//! their own [`Tool`](toolrelay_core::Tool) implementations on the catalog.

pub mod calculator;

pub use calculator::CalculatorTool;

use toolrelay_core::{ToolCatalog, ToolError};

/// Create the default tool catalog with all built-in tools.
pub fn default_catalog() -> Result<ToolCatalog, ToolError> {
    ToolCatalog::new().with_tool(Box::new(CalculatorTool))
}
