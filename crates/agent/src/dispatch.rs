//! The dispatch step shared by both orchestration variants.
//!
//! One tool call goes through: argument parsing → loop guard → catalog
//! execution → guard bookkeeping, with a debug event at each stage.
//! The model-call wrapper (timeout + cancellation) lives here too.

use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use toolrelay_config::LoopGuardConfig;
use toolrelay_core::error::ProviderError;
use toolrelay_core::message::ToolCallRequest;
use toolrelay_core::provider::{Provider, ProviderRequest, ProviderResponse};
use toolrelay_core::tool::{ToolCatalog, ToolExecutionResult};
use toolrelay_telemetry::{DebugEventManager, EventKind};
use tracing::{debug, warn};

use crate::loop_guard::{self, AbortReason, LoopGuard};

/// What happened to a single tool call.
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchOutcome {
    /// The call ran (successfully or not) and produced a result.
    Completed(ToolExecutionResult),
    /// The loop guard refused the call; nothing was executed.
    Aborted(AbortReason),
}

/// Runs tool calls for one session, owning that session's loop guard.
pub struct ToolDispatcher {
    catalog: Arc<ToolCatalog>,
    guard: LoopGuard,
    debug: Arc<DebugEventManager>,
}

impl ToolDispatcher {
    pub fn new(
        catalog: Arc<ToolCatalog>,
        guard_config: LoopGuardConfig,
        debug: Arc<DebugEventManager>,
    ) -> Self {
        Self {
            catalog,
            guard: LoopGuard::new(guard_config),
            debug,
        }
    }

    pub fn catalog(&self) -> &Arc<ToolCatalog> {
        &self.catalog
    }

    pub fn debug(&self) -> &Arc<DebugEventManager> {
        &self.debug
    }

    pub fn guard(&self) -> &LoopGuard {
        &self.guard
    }

    /// Replace the guard, dropping its windows.
    pub fn set_guard_config(&mut self, config: LoopGuardConfig) {
        self.guard = LoopGuard::new(config);
    }

    /// Forget recent calls and errors.
    pub fn reset(&mut self) {
        self.guard.reset();
    }

    /// Parse, guard, execute and record one tool call.
    ///
    /// `parent_id` links the emitted events to the model response that
    /// requested the call.
    pub async fn dispatch(
        &mut self,
        session_id: &str,
        call: &mut ToolCallRequest,
        parent_id: Option<&str>,
    ) -> DispatchOutcome {
        if let Err(e) = call.parse_arguments() {
            warn!(session_id = %session_id, tool = %call.tool_name, error = %e, "Tool arguments did not parse, using {{}}");
            self.debug.add_event(
                session_id,
                EventKind::Error,
                json!({
                    "stage": "argument_parse",
                    "tool_call_id": call.id,
                    "tool_name": call.tool_name,
                    "raw_arguments": call.raw_arguments,
                    "message": e.to_string(),
                }),
                None,
                parent_id,
            );
        }
        let arguments = call.arguments();

        self.debug.add_event(
            session_id,
            EventKind::ToolCallParsed,
            json!({
                "tool_call_id": call.id,
                "tool_name": call.tool_name,
                "arguments": arguments,
            }),
            None,
            parent_id,
        );

        let fingerprint = loop_guard::fingerprint(&call.tool_name, &arguments);
        if let Some(reason) = self.guard.check(&call.tool_name, &fingerprint) {
            warn!(session_id = %session_id, tool = %call.tool_name, reason = %reason, "Loop guard stopped tool call");
            self.debug.add_event(
                session_id,
                EventKind::Error,
                json!({
                    "stage": "loop_guard",
                    "tool_call_id": call.id,
                    "tool_name": call.tool_name,
                    "message": reason.to_string(),
                }),
                None,
                parent_id,
            );
            return DispatchOutcome::Aborted(reason);
        }

        debug!(session_id = %session_id, tool = %call.tool_name, "Executing tool");
        let started = Instant::now();
        let result = self
            .catalog
            .execute(&call.id, &call.tool_name, arguments.clone())
            .await;
        let elapsed = started.elapsed();

        self.debug.add_event(
            session_id,
            EventKind::ToolExecution,
            json!({
                "tool_call_id": call.id,
                "tool_name": call.tool_name,
                "arguments": arguments,
                "success": result.success,
            }),
            Some(elapsed),
            parent_id,
        );

        self.guard.record_call(&call.tool_name, fingerprint);
        if let Some(error) = result.error.as_deref().filter(|_| !result.success) {
            self.guard.record_error(&call.tool_name, error);
        }

        self.debug.add_event(session_id, EventKind::ToolResult, &result, None, parent_id);

        DispatchOutcome::Completed(result)
    }
}

/// Call the model with a deadline, giving up early if `cancel` fires.
pub(crate) async fn call_model(
    provider: &dyn Provider,
    request: ProviderRequest,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<ProviderResponse, ProviderError> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(ProviderError::Cancelled),
        outcome = tokio::time::timeout(timeout, provider.complete(request)) => match outcome {
            Ok(result) => result,
            Err(_) => Err(ProviderError::Timeout {
                timeout_secs: timeout.as_secs(),
            }),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::{FailingTool, ScriptedProvider, calculator_catalog, text_response};

    fn dispatcher() -> ToolDispatcher {
        ToolDispatcher::new(
            Arc::new(calculator_catalog()),
            LoopGuardConfig::default(),
            Arc::new(DebugEventManager::default()),
        )
    }

    #[tokio::test]
    async fn dispatch_runs_tool_and_records_events() {
        let mut dispatcher = dispatcher();
        let mut call = ToolCallRequest::new("call_1", "calculator", r#"{"expression":"10 + 5"}"#);

        let outcome = dispatcher.dispatch("s1", &mut call, Some("parent")).await;
        let DispatchOutcome::Completed(result) = outcome else {
            panic!("expected a completed call");
        };
        assert!(result.success);
        assert!(result.to_turn_content().contains("15"));

        let kinds: Vec<EventKind> = dispatcher.debug().events().iter().map(|e| e.kind).collect();
        assert_eq!(
            kinds,
            vec![EventKind::ToolCallParsed, EventKind::ToolExecution, EventKind::ToolResult]
        );
        assert!(
            dispatcher
                .debug()
                .events()
                .iter()
                .all(|e| e.parent_id.as_deref() == Some("parent"))
        );
        let execution = &dispatcher.debug().events()[1];
        assert!(execution.duration_ms.is_some());
    }

    #[tokio::test]
    async fn malformed_arguments_become_empty_object() {
        let mut dispatcher = dispatcher();
        let mut call = ToolCallRequest::new("call_1", "calculator", "{not json");

        let outcome = dispatcher.dispatch("s1", &mut call, None).await;
        assert_eq!(call.parsed_arguments, Some(json!({})));

        // `{}` misses the required expression, so the catalog rejects it.
        let DispatchOutcome::Completed(result) = outcome else {
            panic!("expected a completed call");
        };
        assert!(!result.success);

        let events = dispatcher.debug().events();
        assert_eq!(events[0].kind, EventKind::Error);
        assert_eq!(events[0].payload["stage"], "argument_parse");
        assert_eq!(dispatcher.guard().recent_errors().count(), 1);
    }

    #[tokio::test]
    async fn unknown_tool_is_a_failed_result() {
        let mut dispatcher = dispatcher();
        let mut call = ToolCallRequest::new("call_1", "teleport", "{}");
        let DispatchOutcome::Completed(result) = dispatcher.dispatch("s1", &mut call, None).await
        else {
            panic!("expected a completed call");
        };
        assert!(!result.success);
        assert!(result.to_turn_content().starts_with("Error:"));
    }

    #[tokio::test]
    async fn third_identical_call_is_refused() {
        let mut dispatcher = dispatcher();
        for i in 0..2 {
            let mut call = ToolCallRequest::new(format!("c{i}"), "calculator", r#"{"expression":"2+2"}"#);
            assert!(matches!(
                dispatcher.dispatch("s1", &mut call, None).await,
                DispatchOutcome::Completed(_)
            ));
        }

        // Key order and spacing differ, fingerprint does not.
        let mut call = ToolCallRequest::new("c2", "calculator", r#"{ "expression" : "2+2" }"#);
        let outcome = dispatcher.dispatch("s1", &mut call, None).await;
        assert!(matches!(
            outcome,
            DispatchOutcome::Aborted(AbortReason::RepeatedCall { occurrences: 3, .. })
        ));
    }

    #[tokio::test]
    async fn failing_tool_trips_error_budget() {
        let mut catalog = calculator_catalog();
        catalog.register(Box::new(FailingTool)).unwrap();
        let mut dispatcher = ToolDispatcher::new(
            Arc::new(catalog),
            LoopGuardConfig::default(),
            Arc::new(DebugEventManager::default()),
        );

        for i in 0..3 {
            let mut call = ToolCallRequest::new(format!("c{i}"), "always_fails", format!(r#"{{"n":{i}}}"#));
            assert!(matches!(
                dispatcher.dispatch("s1", &mut call, None).await,
                DispatchOutcome::Completed(ToolExecutionResult { success: false, .. })
            ));
        }

        let mut call = ToolCallRequest::new("c3", "always_fails", r#"{"n":3}"#);
        assert!(matches!(
            dispatcher.dispatch("s1", &mut call, None).await,
            DispatchOutcome::Aborted(AbortReason::RepeatedFailure { failures: 3, .. })
        ));
    }

    #[tokio::test]
    async fn reset_clears_guard_windows() {
        let mut dispatcher = dispatcher();
        for i in 0..2 {
            let mut call = ToolCallRequest::new(format!("c{i}"), "calculator", r#"{"expression":"1"}"#);
            dispatcher.dispatch("s1", &mut call, None).await;
        }
        dispatcher.reset();
        let mut call = ToolCallRequest::new("c2", "calculator", r#"{"expression":"1"}"#);
        assert!(matches!(
            dispatcher.dispatch("s1", &mut call, None).await,
            DispatchOutcome::Completed(_)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn model_call_times_out() {
        let provider = ScriptedProvider::new(vec![Ok(text_response("late"))])
            .with_delay(Duration::from_secs(30));
        let request = ProviderRequest {
            model: "m".into(),
            turns: vec![],
            temperature: 0.0,
            max_tokens: None,
            tools: vec![],
        };

        let err = call_model(&provider, request, Duration::from_secs(5), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::Timeout { timeout_secs: 5 }));
    }

    #[tokio::test]
    async fn model_call_honours_cancellation() {
        let provider = ScriptedProvider::new(vec![Ok(text_response("never"))])
            .with_delay(Duration::from_secs(30));
        let cancel = CancellationToken::new();
        cancel.cancel();
        let request = ProviderRequest {
            model: "m".into(),
            turns: vec![],
            temperature: 0.0,
            max_tokens: None,
            tools: vec![],
        };

        let err = call_model(&provider, request, Duration::from_secs(60), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::Cancelled));
        assert_eq!(provider.call_count(), 0);
    }
}
