//! Shared test helpers for orchestrator and session tests.

use async_trait::async_trait;
use serde_json::json;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use toolrelay_core::error::{ProviderError, ToolError};
use toolrelay_core::message::{ToolCallRequest, Turn};
use toolrelay_core::provider::{Provider, ProviderRequest, ProviderResponse, Usage};
use toolrelay_core::tool::{Tool, ToolCatalog, ToolOutput};

/// A mock provider that plays back a script of responses.
///
/// Each call to `complete` pops the next entry. Running past the end of
/// the script yields an `ApiError` instead of panicking, so guard tests
/// can tell "aborted in time" from "asked the model too often".
pub struct ScriptedProvider {
    script: Mutex<VecDeque<Result<ProviderResponse, ProviderError>>>,
    requests: Mutex<Vec<ProviderRequest>>,
    calls: AtomicUsize,
    delay: Option<Duration>,
}

impl ScriptedProvider {
    pub fn new(script: Vec<Result<ProviderResponse, ProviderError>>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            requests: Mutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
            delay: None,
        }
    }

    /// Play the same response `times` times.
    pub fn repeating(response: ProviderResponse, times: usize) -> Self {
        Self::new((0..times).map(|_| Ok(response.clone())).collect())
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<ProviderRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl Provider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn complete(&self, request: ProviderRequest) -> Result<ProviderResponse, ProviderError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().unwrap().push(request);

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        self.script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| {
                Err(ProviderError::ApiError {
                    status_code: 500,
                    message: format!("script exhausted at call #{call}"),
                })
            })
    }
}

fn usage() -> Option<Usage> {
    Some(Usage {
        prompt_tokens: 10,
        completion_tokens: 5,
        total_tokens: 15,
    })
}

/// A final text answer.
pub fn text_response(text: &str) -> ProviderResponse {
    ProviderResponse {
        turn: Turn::assistant(text),
        usage: usage(),
        model: "mock-model".into(),
    }
}

/// An assistant turn requesting the given calls, with no content.
pub fn tool_call_response(calls: Vec<ToolCallRequest>) -> ProviderResponse {
    ProviderResponse {
        turn: Turn::assistant_tool_calls(None, calls),
        usage: usage(),
        model: "mock-model".into(),
    }
}

pub fn tool_call(id: &str, name: &str, args: serde_json::Value) -> ToolCallRequest {
    ToolCallRequest::new(id, name, args.to_string())
}

pub fn calculator_call(id: &str, expression: &str) -> ToolCallRequest {
    tool_call(id, "calculator", json!({ "expression": expression }))
}

/// Catalog with just the calculator.
pub fn calculator_catalog() -> ToolCatalog {
    toolrelay_tools::default_catalog().unwrap()
}

/// A tool whose handler always reports failure.
pub struct FailingTool;

#[async_trait]
impl Tool for FailingTool {
    fn name(&self) -> &str {
        "always_fails"
    }

    fn description(&self) -> &str {
        "Fails every time"
    }

    fn parameters_schema(&self) -> serde_json::Value {
        json!({ "type": "object" })
    }

    async fn execute(&self, _arguments: serde_json::Value) -> Result<ToolOutput, ToolError> {
        Err(ToolError::ExecutionFailed {
            tool_name: "always_fails".into(),
            reason: "backend unavailable".into(),
        })
    }
}
