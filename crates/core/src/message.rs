//! Conversation turn domain types.
//!
//! These are the value objects that flow through the orchestrator:
//! user sends a message → orchestrator calls the model → the model requests
//! tool calls → each result becomes a tool turn → the model answers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The role of a turn in a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// System instructions
    System,
    /// The end user
    User,
    /// The model
    Assistant,
    /// Tool execution result
    Tool,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::System => write!(f, "system"),
            Self::User => write!(f, "user"),
            Self::Assistant => write!(f, "assistant"),
            Self::Tool => write!(f, "tool"),
        }
    }
}

/// A single turn in a conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Turn {
    /// Unique turn ID
    pub id: String,

    /// Who produced this turn
    pub role: Role,

    /// The text content. Assistant turns that only carry tool calls may have none.
    #[serde(default)]
    pub content: Option<String>,

    /// Tool calls requested by the assistant (if any)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCallRequest>,

    /// If this is a tool result, which tool call it responds to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,

    /// If this is a tool result, the name of the tool that produced it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,

    /// Timestamp
    pub timestamp: DateTime<Utc>,
}

impl Turn {
    fn new(role: Role, content: Option<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            role,
            content,
            tool_calls: Vec::new(),
            tool_call_id: None,
            tool_name: None,
            timestamp: Utc::now(),
        }
    }

    /// Create a new system turn.
    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, Some(content.into()))
    }

    /// Create a new user turn.
    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, Some(content.into()))
    }

    /// Create a new assistant turn with text content.
    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, Some(content.into()))
    }

    /// Create an assistant turn that requests tool calls.
    pub fn assistant_tool_calls(content: Option<String>, tool_calls: Vec<ToolCallRequest>) -> Self {
        let mut turn = Self::new(Role::Assistant, content);
        turn.tool_calls = tool_calls;
        turn
    }

    /// Create a tool result turn.
    pub fn tool_result(
        tool_call_id: impl Into<String>,
        tool_name: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        let mut turn = Self::new(Role::Tool, Some(content.into()));
        turn.tool_call_id = Some(tool_call_id.into());
        turn.tool_name = Some(tool_name.into());
        turn
    }

    /// The content, or an empty string.
    pub fn text(&self) -> &str {
        self.content.as_deref().unwrap_or("")
    }

    /// Whether this is an assistant turn carrying tool calls.
    pub fn has_tool_calls(&self) -> bool {
        self.role == Role::Assistant && !self.tool_calls.is_empty()
    }
}

/// A structured request from the model to invoke a named tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRequest {
    /// Unique call ID (matches the model's tool_call.id)
    pub id: String,

    /// Name of the tool to invoke
    pub tool_name: String,

    /// Arguments exactly as the model produced them
    pub raw_arguments: String,

    /// Arguments after JSON parsing; `{}` when parsing failed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parsed_arguments: Option<serde_json::Value>,
}

/// Raw tool arguments that were not a valid JSON object.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("could not parse arguments for {tool_name}: {reason}")]
pub struct ArgumentParseError {
    pub tool_name: String,
    pub reason: String,
}

impl ToolCallRequest {
    /// Create an unparsed tool call request.
    pub fn new(
        id: impl Into<String>,
        tool_name: impl Into<String>,
        raw_arguments: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            tool_name: tool_name.into(),
            raw_arguments: raw_arguments.into(),
            parsed_arguments: None,
        }
    }

    /// Parse `raw_arguments` into `parsed_arguments`.
    ///
    /// Never fails hard: on a parse error (or a non-object value) the parsed
    /// arguments become `{}` and the error is returned for the caller to log.
    /// Empty input is treated as `{}` without error.
    pub fn parse_arguments(&mut self) -> Result<&serde_json::Value, ArgumentParseError> {
        let raw = self.raw_arguments.trim();
        let outcome = if raw.is_empty() {
            Ok(serde_json::json!({}))
        } else {
            match serde_json::from_str::<serde_json::Value>(raw) {
                Ok(value @ serde_json::Value::Object(_)) => Ok(value),
                Ok(other) => Err(format!("expected a JSON object, got {other}")),
                Err(e) => Err(e.to_string()),
            }
        };

        match outcome {
            Ok(value) => Ok(&*self.parsed_arguments.insert(value)),
            Err(reason) => {
                self.parsed_arguments = Some(serde_json::json!({}));
                Err(ArgumentParseError {
                    tool_name: self.tool_name.clone(),
                    reason,
                })
            }
        }
    }

    /// Parsed arguments, or `{}` if none were parsed yet.
    pub fn arguments(&self) -> serde_json::Value {
        self.parsed_arguments
            .clone()
            .unwrap_or_else(|| serde_json::json!({}))
    }
}
