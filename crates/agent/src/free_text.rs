//! Free-text decision agent: the autonomous variant.
//!
//! Instead of native tool calls, the model answers every step with one JSON
//! decision (`use_tool`, `list_tools` or `finish`). Tool results are folded
//! into a [`BoundedExecutionContext`] that is rendered into the next prompt.
//! Tool calls go through the same [`ToolDispatcher`] as the structured
//! orchestrator, so the loop guard and debug events behave identically.
//!
//! A failed model call is answered once with a fallback `list_tools`
//! decision; a second consecutive failure ends the run.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use toolrelay_config::{ContextConfig, FreeTextConfig, LoopGuardConfig, OrchestratorConfig};
use toolrelay_core::error::ProviderError;
use toolrelay_core::message::{ToolCallRequest, Turn};
use toolrelay_core::provider::{Provider, ProviderRequest};
use toolrelay_core::tool::ToolCatalog;
use toolrelay_telemetry::{DebugEventManager, EventKind};
use tracing::{debug, info, warn};

use crate::dispatch::{DispatchOutcome, ToolDispatcher, call_model};
use crate::execution_context::BoundedExecutionContext;
use crate::loop_guard::AbortReason;
use crate::orchestrator::OrchestratorError;

/// Consecutive model failures tolerated before giving up.
const MAX_CONSECUTIVE_FAILURES: u32 = 2;

/// One step chosen by the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Decision {
    UseTool {
        tool: String,
        #[serde(default = "empty_object")]
        arguments: Value,
        #[serde(default)]
        reasoning: String,
    },
    ListTools {
        #[serde(default)]
        reasoning: String,
    },
    Finish {
        answer: String,
    },
}

fn empty_object() -> Value {
    json!({})
}

impl Decision {
    /// Parse a model reply into a decision.
    ///
    /// Tolerates code fences and prose around the JSON object. A reply with
    /// no JSON object at all is taken as the final answer.
    pub fn parse(text: &str) -> Result<Self, ProviderError> {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return Err(ProviderError::MalformedResponse("empty decision".into()));
        }

        let Some(start) = trimmed.find('{') else {
            return Ok(Self::Finish {
                answer: trimmed.to_string(),
            });
        };
        let end = trimmed
            .rfind('}')
            .filter(|&end| end > start)
            .ok_or_else(|| ProviderError::MalformedResponse("unterminated decision object".into()))?;

        serde_json::from_str(&trimmed[start..=end])
            .map_err(|e| ProviderError::MalformedResponse(format!("invalid decision: {e}")))
    }

    pub fn action(&self) -> &'static str {
        match self {
            Self::UseTool { .. } => "use_tool",
            Self::ListTools { .. } => "list_tools",
            Self::Finish { .. } => "finish",
        }
    }
}

/// The result of a completed free-text run.
#[derive(Debug, Clone)]
pub struct FreeTextOutcome {
    pub answer: String,
    /// Decisions taken, the final one included.
    pub iterations: u32,
    pub tool_calls: usize,
    /// Scratchpad at completion.
    pub context: BoundedExecutionContext,
}

pub struct FreeTextAgent {
    provider: Arc<dyn Provider>,
    dispatcher: ToolDispatcher,
    debug: Arc<DebugEventManager>,
    model: String,
    temperature: f32,
    max_tokens: Option<u32>,
    context: BoundedExecutionContext,
    max_iterations: u32,
    decision_delay: Duration,
    model_timeout: Duration,
    cancel: CancellationToken,
}

impl FreeTextAgent {
    pub fn new(
        provider: Arc<dyn Provider>,
        catalog: Arc<ToolCatalog>,
        debug: Arc<DebugEventManager>,
        model: impl Into<String>,
    ) -> Self {
        let defaults = FreeTextConfig::default();
        Self {
            provider,
            dispatcher: ToolDispatcher::new(catalog, LoopGuardConfig::default(), debug.clone()),
            debug,
            model: model.into(),
            temperature: 0.7,
            max_tokens: None,
            context: BoundedExecutionContext::default(),
            max_iterations: defaults.max_iterations,
            decision_delay: Duration::from_millis(defaults.decision_delay_ms),
            model_timeout: Duration::from_secs(OrchestratorConfig::default().model_timeout_secs),
            cancel: CancellationToken::new(),
        }
    }

    /// Apply the `[free_text]` config section.
    pub fn with_config(self, config: &FreeTextConfig) -> Self {
        self.with_max_iterations(config.max_iterations)
            .with_decision_delay(Duration::from_millis(config.decision_delay_ms))
    }

    pub fn with_context_config(mut self, config: &ContextConfig) -> Self {
        self.context = BoundedExecutionContext::from_config(config);
        self
    }

    pub fn with_max_iterations(mut self, max: u32) -> Self {
        self.max_iterations = max.max(1);
        self
    }

    pub fn with_decision_delay(mut self, delay: Duration) -> Self {
        self.decision_delay = delay;
        self
    }

    pub fn with_model_timeout(mut self, timeout: Duration) -> Self {
        self.model_timeout = timeout;
        self
    }

    pub fn with_loop_guard(mut self, config: LoopGuardConfig) -> Self {
        self.dispatcher.set_guard_config(config);
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_max_tokens(mut self, max: u32) -> Self {
        self.max_tokens = Some(max);
        self
    }

    pub fn set_cancellation(&mut self, token: CancellationToken) {
        self.cancel = token;
    }

    pub fn context(&self) -> &BoundedExecutionContext {
        &self.context
    }

    /// Work toward `goal` until the model decides to finish.
    pub async fn run(
        &mut self,
        session_id: &str,
        goal: &str,
    ) -> Result<FreeTextOutcome, OrchestratorError> {
        info!(session_id = %session_id, max_iterations = self.max_iterations, "Starting free-text run");
        self.debug.start_conversation(session_id, goal);
        self.dispatcher.reset();
        self.context.clear();

        let mut tool_calls = 0usize;
        let mut failures = 0u32;
        let mut last_tool: Option<String> = None;

        for iteration in 1..=self.max_iterations {
            if self.cancel.is_cancelled() || (iteration > 1 && self.pause().await) {
                return Err(self.cancelled(session_id));
            }

            let (decision, response_id) = match self
                .decide(session_id, goal, iteration, last_tool.as_deref())
                .await
            {
                Ok(decided) => {
                    failures = 0;
                    decided
                }
                Err(ProviderError::Cancelled) => return Err(self.cancelled(session_id)),
                Err(e) => {
                    failures += 1;
                    warn!(session_id = %session_id, iteration, error = %e, "Decision failed");
                    if failures >= MAX_CONSECUTIVE_FAILURES {
                        self.debug.fail_conversation(
                            session_id,
                            &format!("model call failed ({}): {e}", e.kind()),
                        );
                        return Err(OrchestratorError::ModelCall(e));
                    }
                    let fallback = Decision::ListTools {
                        reasoning: format!("fallback after model error: {e}"),
                    };
                    (fallback, None)
                }
            };

            debug!(session_id = %session_id, iteration, action = decision.action(), "Decision");
            self.context.update("last_action", decision.action());

            match decision {
                Decision::Finish { answer } => {
                    self.debug.complete_conversation(session_id, &answer);
                    info!(session_id = %session_id, iterations = iteration, tool_calls, "Free-text run finished");
                    return Ok(FreeTextOutcome {
                        answer,
                        iterations: iteration,
                        tool_calls,
                        context: self.context.clone(),
                    });
                }
                Decision::ListTools { .. } => {
                    let names = self.dispatcher.catalog().names();
                    self.context.update("available_tools", json!(names));
                }
                Decision::UseTool {
                    tool, arguments, ..
                } => {
                    tool_calls += 1;
                    let mut call =
                        ToolCallRequest::new(format!("step_{iteration}"), &tool, arguments.to_string());

                    match self
                        .dispatcher
                        .dispatch(session_id, &mut call, response_id.as_deref())
                        .await
                    {
                        DispatchOutcome::Completed(result) if result.success => {
                            let data = result.data.unwrap_or(Value::Null);
                            self.context
                                .update(format!("{tool}_result_{tool_calls}"), data.clone());
                            self.context.update("last_result", data);
                        }
                        DispatchOutcome::Completed(result) => {
                            let error = result.error.unwrap_or_else(|| "unknown error".into());
                            self.context.update("last_error", format!("{tool}: {error}"));
                        }
                        DispatchOutcome::Aborted(reason) => {
                            return Err(self.abort(session_id, reason));
                        }
                    }
                    last_tool = Some(tool);
                }
            }
        }

        Err(self.abort(
            session_id,
            AbortReason::IterationCap {
                limit: self.max_iterations,
            },
        ))
    }

    /// Ask the model for the next decision. Returns the decision and the
    /// id of the `llm_response` event that carried it.
    async fn decide(
        &self,
        session_id: &str,
        goal: &str,
        iteration: u32,
        hint: Option<&str>,
    ) -> Result<(Decision, Option<String>), ProviderError> {
        let request = ProviderRequest {
            model: self.model.clone(),
            turns: vec![
                Turn::system(self.instructions()),
                Turn::user(self.prompt(goal, hint)),
            ],
            temperature: self.temperature,
            max_tokens: self.max_tokens,
            tools: Vec::new(),
        };
        let request_id = self.debug.add_event(
            session_id,
            EventKind::LlmRequest,
            json!({
                "model": self.model,
                "iteration": iteration,
                "context_keys": self.context.len(),
                "request": request,
            }),
            None,
            None,
        );

        let started = Instant::now();
        let outcome = call_model(self.provider.as_ref(), request, self.model_timeout, &self.cancel).await;
        let elapsed = started.elapsed();

        let response = match outcome {
            Ok(response) => response,
            Err(e) => {
                if !matches!(e, ProviderError::Cancelled) {
                    self.debug.add_event(
                        session_id,
                        EventKind::Error,
                        json!({ "stage": "model_call", "kind": e.kind(), "message": e.to_string() }),
                        Some(elapsed),
                        Some(&request_id),
                    );
                }
                return Err(e);
            }
        };

        let text = response.turn.text().to_string();
        let parsed = Decision::parse(&text);
        let response_id = self.debug.add_event(
            session_id,
            EventKind::LlmResponse,
            json!({
                "model": response.model,
                "content": text,
                "decision": parsed.as_ref().ok(),
                "usage": response.usage,
            }),
            Some(elapsed),
            Some(&request_id),
        );

        match parsed {
            Ok(decision) => Ok((decision, Some(response_id))),
            Err(e) => {
                self.debug.add_event(
                    session_id,
                    EventKind::Error,
                    json!({ "stage": "decision_parse", "message": e.to_string() }),
                    None,
                    Some(&response_id),
                );
                Err(e)
            }
        }
    }

    fn instructions(&self) -> String {
        let mut out = String::from(
            "You are an autonomous agent working toward a goal, one step at a time.\n\
             Reply with exactly one JSON object and nothing else, using one of:\n\
             {\"action\": \"use_tool\", \"tool\": \"<name>\", \"arguments\": {...}, \"reasoning\": \"...\"}\n\
             {\"action\": \"list_tools\", \"reasoning\": \"...\"}\n\
             {\"action\": \"finish\", \"answer\": \"...\"}\n\n## Tools\n",
        );
        for def in self.dispatcher.catalog().definitions() {
            out.push_str(&format!("- {}: {} {}\n", def.name, def.description, def.parameters));
        }
        out
    }

    fn prompt(&self, goal: &str, hint: Option<&str>) -> String {
        let context = self.context.render(hint);
        if context.is_empty() {
            format!("## Goal\n{goal}\n")
        } else {
            format!("## Goal\n{goal}\n\n{context}")
        }
    }

    /// Sleep between decisions. Returns true if the run was stopped.
    async fn pause(&self) -> bool {
        if self.decision_delay.is_zero() {
            return self.cancel.is_cancelled();
        }
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => true,
            _ = tokio::time::sleep(self.decision_delay) => self.cancel.is_cancelled(),
        }
    }

    fn abort(&self, session_id: &str, reason: AbortReason) -> OrchestratorError {
        warn!(session_id = %session_id, reason = %reason, "Free-text run aborted");
        self.debug.fail_conversation(session_id, &reason.to_string());
        OrchestratorError::Aborted {
            message: reason.user_message(),
            reason,
        }
    }

    fn cancelled(&self, session_id: &str) -> OrchestratorError {
        info!(session_id = %session_id, "Free-text run cancelled");
        self.debug.fail_conversation(session_id, "cancelled");
        OrchestratorError::Cancelled
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::{ScriptedProvider, calculator_catalog, text_response};

    fn agent(provider: Arc<ScriptedProvider>) -> (FreeTextAgent, Arc<DebugEventManager>) {
        let debug = Arc::new(DebugEventManager::default());
        let agent = FreeTextAgent::new(
            provider,
            Arc::new(calculator_catalog()),
            debug.clone(),
            "mock-model",
        )
        .with_decision_delay(Duration::ZERO);
        (agent, debug)
    }

    fn use_calculator(expression: &str) -> String {
        json!({
            "action": "use_tool",
            "tool": "calculator",
            "arguments": { "expression": expression },
            "reasoning": "need arithmetic",
        })
        .to_string()
    }

    #[test]
    fn parse_tolerates_fences_and_prose() {
        let text = "Sure.\n```json\n{\"action\": \"finish\", \"answer\": \"42\"}\n```";
        assert_eq!(
            Decision::parse(text).unwrap(),
            Decision::Finish {
                answer: "42".into()
            }
        );
    }

    #[test]
    fn parse_plain_text_is_finish() {
        assert_eq!(
            Decision::parse("The answer is 4.").unwrap(),
            Decision::Finish {
                answer: "The answer is 4.".into()
            }
        );
    }

    #[test]
    fn parse_rejects_broken_json() {
        assert!(Decision::parse("{\"action\": \"use_tool\", ").is_err());
        assert!(Decision::parse("{\"action\": \"dance\"}").is_err());
        assert!(Decision::parse("   ").is_err());
    }

    #[test]
    fn use_tool_arguments_default_to_empty_object() {
        let decision = Decision::parse(r#"{"action":"use_tool","tool":"calculator"}"#).unwrap();
        assert_eq!(
            decision,
            Decision::UseTool {
                tool: "calculator".into(),
                arguments: json!({}),
                reasoning: String::new(),
            }
        );
    }

    #[tokio::test]
    async fn tool_then_finish() {
        let provider = Arc::new(ScriptedProvider::new(vec![
            Ok(text_response(&use_calculator("10 + 5"))),
            Ok(text_response(r#"{"action":"finish","answer":"15"}"#)),
        ]));
        let (mut agent, debug) = agent(provider.clone());

        let outcome = agent.run("s1", "add 10 and 5").await.unwrap();
        assert_eq!(outcome.answer, "15");
        assert_eq!(outcome.iterations, 2);
        assert_eq!(outcome.tool_calls, 1);
        assert_eq!(outcome.context.get("last_result").unwrap()["result"], 15);
        assert!(outcome.context.get("calculator_result_1").is_some());

        // The second prompt shows the model what the tool produced.
        let second = &provider.requests()[1];
        assert!(second.turns[1].text().contains("last_result"));
        assert!(debug.flows()[0].is_complete);
    }

    #[tokio::test]
    async fn failed_tool_lands_in_last_error() {
        let provider = Arc::new(ScriptedProvider::new(vec![
            Ok(text_response(&use_calculator("1 / 0"))),
            Ok(text_response(r#"{"action":"finish","answer":"cannot"}"#)),
        ]));
        let (mut agent, _) = agent(provider);
        let outcome = agent.run("s1", "divide").await.unwrap();
        assert!(outcome.context.get("last_error").is_some());
        assert!(outcome.context.get("last_result").is_none());
    }

    #[tokio::test]
    async fn model_error_falls_back_to_list_tools() {
        let provider = Arc::new(ScriptedProvider::new(vec![
            Err(ProviderError::Network("reset".into())),
            Ok(text_response(r#"{"action":"finish","answer":"ok"}"#)),
        ]));
        let (mut agent, _) = agent(provider);

        let outcome = agent.run("s1", "anything").await.unwrap();
        assert_eq!(outcome.answer, "ok");
        assert_eq!(outcome.context.get("available_tools"), Some(&json!(["calculator"])));
    }

    #[tokio::test]
    async fn two_consecutive_failures_end_the_run() {
        let provider = Arc::new(ScriptedProvider::new(vec![
            Err(ProviderError::Network("reset".into())),
            Ok(text_response("{ not json }")),
        ]));
        let (mut agent, debug) = agent(provider);

        let err = agent.run("s1", "anything").await.unwrap_err();
        assert!(matches!(
            err,
            OrchestratorError::ModelCall(ProviderError::MalformedResponse(_))
        ));
        assert!(!debug.flows()[0].is_complete);
    }

    #[tokio::test]
    async fn repeated_tool_use_is_guarded() {
        let provider = Arc::new(ScriptedProvider::repeating(
            text_response(&use_calculator("2+2")),
            10,
        ));
        let (mut agent, _) = agent(provider.clone());

        let err = agent.run("s1", "2+2").await.unwrap_err();
        assert!(matches!(
            err,
            OrchestratorError::Aborted {
                reason: AbortReason::RepeatedCall { .. },
                ..
            }
        ));
        assert_eq!(provider.call_count(), 3);
    }

    #[tokio::test]
    async fn iteration_cap_is_enforced() {
        let provider = Arc::new(ScriptedProvider::repeating(
            text_response(r#"{"action":"list_tools"}"#),
            10,
        ));
        let (agent, _) = agent(provider.clone());
        let mut agent = agent.with_max_iterations(3);

        let err = agent.run("s1", "dither").await.unwrap_err();
        assert!(matches!(
            err,
            OrchestratorError::Aborted {
                reason: AbortReason::IterationCap { limit: 3 },
                ..
            }
        ));
        assert_eq!(provider.call_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_interrupts_the_pause() {
        let provider = Arc::new(ScriptedProvider::repeating(
            text_response(r#"{"action":"list_tools"}"#),
            10,
        ));
        let (agent, _) = agent(provider.clone());
        let mut agent = agent.with_decision_delay(Duration::from_secs(10));
        let token = CancellationToken::new();
        agent.set_cancellation(token.clone());

        let stopper = async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            token.cancel();
        };
        let (result, ()) = tokio::join!(agent.run("s1", "wait"), stopper);

        assert!(matches!(result, Err(OrchestratorError::Cancelled)));
        assert_eq!(provider.call_count(), 1);
    }
}
