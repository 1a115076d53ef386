//! Tool trait and the shared tool catalog.
//!
//! Tools are what give the model the ability to act: each one carries a
//! name, a description, a JSON-schema input and an `execute` handler.
//! The [`ToolCatalog`] validates arguments against that schema before any
//! handler runs, and folds every failure into a [`ToolExecutionResult`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, warn};

use crate::error::ToolError;
use crate::provider::ToolDefinition;

/// What a tool handler returns on a normal (non-throwing) run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ToolOutput {
    /// `{success: true, data}`
    Success { data: serde_json::Value },
    /// `{success: false, error}`
    Failure { error: String },
}

impl ToolOutput {
    pub fn success(data: impl Into<serde_json::Value>) -> Self {
        Self::Success { data: data.into() }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self::Failure {
            error: error.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }
}

/// The outcome of one tool call. Produced once per request and never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolExecutionResult {
    /// The call ID this result is for
    pub tool_call_id: String,

    /// The tool that was (or would have been) invoked
    pub tool_name: String,

    /// Whether the tool executed successfully
    pub success: bool,

    /// Output data on success
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,

    /// Error message on failure
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ToolExecutionResult {
    pub fn succeeded(
        tool_call_id: impl Into<String>,
        tool_name: impl Into<String>,
        data: serde_json::Value,
    ) -> Self {
        Self {
            tool_call_id: tool_call_id.into(),
            tool_name: tool_name.into(),
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn failed(
        tool_call_id: impl Into<String>,
        tool_name: impl Into<String>,
        error: impl Into<String>,
    ) -> Self {
        Self {
            tool_call_id: tool_call_id.into(),
            tool_name: tool_name.into(),
            success: false,
            data: None,
            error: Some(error.into()),
        }
    }

    /// Content for the tool turn this result feeds.
    ///
    /// Strings are passed through verbatim; other JSON is serialized.
    /// Failures become `"Error: <message>"`.
    pub fn to_turn_content(&self) -> String {
        if self.success {
            match &self.data {
                Some(serde_json::Value::String(s)) => s.clone(),
                Some(value) => value.to_string(),
                None => String::new(),
            }
        } else {
            format!("Error: {}", self.error.as_deref().unwrap_or("unknown error"))
        }
    }
}

/// The core Tool trait.
///
/// Tools are registered in a [`ToolCatalog`] that is shared by every
/// session, so implementations must tolerate concurrent `execute` calls.
#[async_trait]
pub trait Tool: Send + Sync {
    /// The unique name of this tool (e.g., "calculator").
    fn name(&self) -> &str;

    /// A description of what this tool does (sent to the model).
    fn description(&self) -> &str;

    /// JSON Schema describing this tool's parameters.
    fn parameters_schema(&self) -> serde_json::Value;

    /// Execute the tool with already-validated arguments.
    ///
    /// Return `Ok(ToolOutput::Failure)` for expected failures; `Err` means the
    /// handler itself broke.
    async fn execute(&self, arguments: serde_json::Value) -> Result<ToolOutput, ToolError>;

    /// Convert this tool into a ToolDefinition for sending to the model.
    fn to_definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name().to_string(),
            description: self.description().to_string(),
            parameters: self.parameters_schema(),
        }
    }
}

struct CatalogEntry {
    tool: Box<dyn Tool>,
    validator: jsonschema::Validator,
}

/// The registry of available tools, shared read-only across sessions.
///
/// Built once at startup and wrapped in an `Arc`; `execute` takes `&self`
/// so concurrent sessions never contend on a catalog lock.
pub struct ToolCatalog {
    tools: BTreeMap<String, CatalogEntry>,
}

impl ToolCatalog {
    pub fn new() -> Self {
        Self {
            tools: BTreeMap::new(),
        }
    }

    /// Register a tool. Replaces any existing tool with the same name.
    ///
    /// Fails if the tool's parameter schema is not a valid JSON Schema.
    pub fn register(&mut self, tool: Box<dyn Tool>) -> Result<(), ToolError> {
        let name = tool.name().to_string();
        let validator = jsonschema::validator_for(&tool.parameters_schema()).map_err(|e| {
            ToolError::InvalidSchema {
                tool_name: name.clone(),
                reason: e.to_string(),
            }
        })?;
        self.tools.insert(name, CatalogEntry { tool, validator });
        Ok(())
    }

    /// Builder-style registration.
    pub fn with_tool(mut self, tool: Box<dyn Tool>) -> Result<Self, ToolError> {
        self.register(tool)?;
        Ok(self)
    }

    /// Get a tool by name.
    pub fn get(&self, name: &str) -> Option<&dyn Tool> {
        self.tools.get(name).map(|e| e.tool.as_ref())
    }

    /// Whether a tool with this name is registered.
    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    /// All tool definitions (for sending to the model), sorted by name.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.tools.values().map(|e| e.tool.to_definition()).collect()
    }

    /// List all registered tool names, sorted.
    pub fn names(&self) -> Vec<&str> {
        self.tools.keys().map(|s| s.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Validate arguments against a tool's schema without executing it.
    pub fn validate(&self, tool_name: &str, arguments: &serde_json::Value) -> Result<(), ToolError> {
        let entry = self
            .tools
            .get(tool_name)
            .ok_or_else(|| ToolError::NotFound(tool_name.to_string()))?;

        let errors: Vec<String> = entry
            .validator
            .iter_errors(arguments)
            .map(|e| e.to_string())
            .collect();

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ToolError::InvalidArguments(errors.join("; ")))
        }
    }

    /// Validate and execute a tool call.
    ///
    /// Never returns an error: unknown tools, validation failures and
    /// handler errors all become a failed result. Validation failures never
    /// reach the handler.
    pub async fn execute(
        &self,
        tool_call_id: &str,
        tool_name: &str,
        arguments: serde_json::Value,
    ) -> ToolExecutionResult {
        if let Err(e) = self.validate(tool_name, &arguments) {
            debug!(tool = %tool_name, error = %e, "Tool call rejected before execution");
            return ToolExecutionResult::failed(tool_call_id, tool_name, e.to_string());
        }

        // validate() already proved the entry exists
        let Some(entry) = self.tools.get(tool_name) else {
            return ToolExecutionResult::failed(
                tool_call_id,
                tool_name,
                ToolError::NotFound(tool_name.to_string()).to_string(),
            );
        };

        match entry.tool.execute(arguments).await {
            Ok(ToolOutput::Success { data }) => {
                ToolExecutionResult::succeeded(tool_call_id, tool_name, data)
            }
            Ok(ToolOutput::Failure { error }) => {
                ToolExecutionResult::failed(tool_call_id, tool_name, error)
            }
            Err(e) => {
                warn!(tool = %tool_name, error = %e, "Tool handler raised an error");
                ToolExecutionResult::failed(tool_call_id, tool_name, e.to_string())
            }
        }
    }
}

impl Default for ToolCatalog {
    fn default() -> Self {
        Self::new()
    }
}
