//! Data model for debug events, conversation flows and aggregate stats.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

// ── Event ─────────────────────────────────────────────────────────────────

/// What a debug event records.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// The user message that opened a flow.
    UserMessage,
    /// A request about to be sent to the model.
    LlmRequest,
    /// The model's reply (content, tool calls, usage).
    LlmResponse,
    /// A tool call extracted from a model reply.
    ToolCallParsed,
    /// A tool handler invocation with its duration.
    ToolExecution,
    /// The content fed back to the model for one tool call.
    ToolResult,
    /// The final reply that sealed a flow.
    FinalResponse,
    /// Any failure worth seeing in the trace.
    Error,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::UserMessage => "user_message",
            Self::LlmRequest => "llm_request",
            Self::LlmResponse => "llm_response",
            Self::ToolCallParsed => "tool_call_parsed",
            Self::ToolExecution => "tool_execution",
            Self::ToolResult => "tool_result",
            Self::FinalResponse => "final_response",
            Self::Error => "error",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One observed step. Immutable once recorded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DebugEvent {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub kind: EventKind,
    /// Structural copy of whatever the caller passed in.
    pub payload: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    /// The flow that was open for the session when this was recorded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flow_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

impl DebugEvent {
    pub fn new(kind: EventKind, payload: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            kind,
            payload,
            duration_ms: None,
            parent_id: None,
            flow_id: None,
            session_id: None,
        }
    }

    /// Token usage carried by an `llm_response` payload, if any.
    pub fn usage(&self) -> Option<TokenTotals> {
        if self.kind != EventKind::LlmResponse {
            return None;
        }
        let usage = self.payload.get("usage")?.as_object()?;
        let field = |name: &str| usage.get(name).and_then(|v| v.as_u64()).unwrap_or(0);
        Some(TokenTotals {
            prompt_tokens: field("prompt_tokens"),
            completion_tokens: field("completion_tokens"),
            total_tokens: field("total_tokens"),
        })
    }
}

// ── Flow ──────────────────────────────────────────────────────────────────

/// All events produced while handling one user message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationFlow {
    pub id: String,
    pub session_id: String,
    pub user_message: String,
    pub timestamp: DateTime<Utc>,
    pub events: Vec<DebugEvent>,
    /// True only when sealed by a final response.
    pub is_complete: bool,
    /// Set when the flow is sealed (completed, failed or superseded).
    pub total_duration_ms: Option<u64>,
}

impl ConversationFlow {
    pub fn new(session_id: impl Into<String>, user_message: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            session_id: session_id.into(),
            user_message: user_message.into(),
            timestamp: Utc::now(),
            events: Vec::new(),
            is_complete: false,
            total_duration_ms: None,
        }
    }

    /// Close the flow, computing its duration.
    pub fn seal(&mut self, complete: bool) {
        self.is_complete = complete;
        self.total_duration_ms = Some(
            Utc::now()
                .signed_duration_since(self.timestamp)
                .num_milliseconds()
                .max(0) as u64,
        );
    }

    pub fn is_sealed(&self) -> bool {
        self.total_duration_ms.is_some()
    }

    /// Summed token usage across this flow's model responses.
    pub fn token_usage(&self) -> TokenTotals {
        self.events
            .iter()
            .filter_map(DebugEvent::usage)
            .fold(TokenTotals::default(), |acc, u| acc + u)
    }
}

// ── Stats ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenTotals {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

impl std::ops::Add for TokenTotals {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        Self {
            prompt_tokens: self.prompt_tokens + rhs.prompt_tokens,
            completion_tokens: self.completion_tokens + rhs.completion_tokens,
            total_tokens: self.total_tokens + rhs.total_tokens,
        }
    }
}

/// Aggregate counters since creation (or the last `clear`).
///
/// Counters are running totals; evicting old events from the bounded log
/// does not reduce them.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DebugStats {
    pub total_events: u64,
    pub events_by_kind: BTreeMap<EventKind, u64>,
    pub tokens: TokenTotals,
    pub flows_started: u64,
    pub flows_completed: u64,
    /// Flows sealed without a final response (failed or superseded).
    pub flows_abandoned: u64,
    pub open_flows: usize,
    pub retained_events: usize,
    pub retained_flows: usize,
}

impl DebugStats {
    pub fn count(&self, kind: EventKind) -> u64 {
        self.events_by_kind.get(&kind).copied().unwrap_or(0)
    }
}
