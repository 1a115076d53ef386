//! The tool-calling orchestrator: turns one user message into a reply.
//!
//! Each iteration sends the full conversation plus the tool schemas to the
//! model. A reply without tool calls ends the run. A reply with tool calls
//! is appended as-is, every call is dispatched in order (one tool turn per
//! call), and the loop goes round again. The loop guard or the iteration
//! cap can stop it early; the session's cancellation token stops it at the
//! next model call or between tool calls.

use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use toolrelay_config::{LoopGuardConfig, OrchestratorConfig, RunMode};
use toolrelay_core::error::ProviderError;
use toolrelay_core::message::Turn;
use toolrelay_core::provider::{Provider, ProviderRequest};
use toolrelay_core::tool::ToolCatalog;
use toolrelay_telemetry::{DebugEventManager, EventKind};
use tracing::{debug, info, warn};

use crate::conversation::ConversationState;
use crate::dispatch::{DispatchOutcome, ToolDispatcher, call_model};
use crate::loop_guard::AbortReason;

/// Reply used when the model ends a tool-using run without any text.
pub const TASK_COMPLETED: &str = "Task completed.";

/// Where the orchestrator is in its current (or last) run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrchestratorState {
    Idle,
    AwaitingModel,
    Dispatching,
    Done,
    AbortedLoop,
    AbortedErrorBudget,
    AbortedIterationCap,
    /// The model call failed.
    Failed,
    Cancelled,
}

impl OrchestratorState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Idle | Self::AwaitingModel | Self::Dispatching)
    }
}

/// Terminal failures of a run. The conversation stays usable afterwards.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("Run aborted: {reason}")]
    Aborted { reason: AbortReason, message: String },

    #[error("Model call failed: {0}")]
    ModelCall(#[from] ProviderError),

    #[error("Run cancelled")]
    Cancelled,
}

pub struct ToolCallOrchestrator {
    provider: Arc<dyn Provider>,
    dispatcher: ToolDispatcher,
    debug: Arc<DebugEventManager>,
    model: String,
    temperature: f32,
    max_tokens: Option<u32>,
    iteration_cap: Option<u32>,
    model_timeout: Duration,
    cancel: CancellationToken,
    state: OrchestratorState,
}

impl ToolCallOrchestrator {
    /// Create an interactive (uncapped, loop-guarded) orchestrator.
    pub fn new(
        provider: Arc<dyn Provider>,
        catalog: Arc<ToolCatalog>,
        debug: Arc<DebugEventManager>,
        model: impl Into<String>,
    ) -> Self {
        let defaults = OrchestratorConfig::default();
        Self {
            provider,
            dispatcher: ToolDispatcher::new(catalog, LoopGuardConfig::default(), debug.clone()),
            debug,
            model: model.into(),
            temperature: 0.7,
            max_tokens: None,
            iteration_cap: None,
            model_timeout: Duration::from_secs(defaults.model_timeout_secs),
            cancel: CancellationToken::new(),
            state: OrchestratorState::Idle,
        }
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_max_tokens(mut self, max: u32) -> Self {
        self.max_tokens = Some(max);
        self
    }

    /// `Autonomous` caps the loop at `max_iterations`; `Interactive` is uncapped.
    pub fn with_mode(mut self, mode: RunMode, max_iterations: u32) -> Self {
        self.iteration_cap = match mode {
            RunMode::Autonomous => Some(max_iterations),
            RunMode::Interactive => None,
        };
        self
    }

    pub fn with_iteration_cap(mut self, cap: Option<u32>) -> Self {
        self.iteration_cap = cap;
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

    /// Apply the `[orchestrator]` config section.
    pub fn with_config(self, config: &OrchestratorConfig) -> Self {
        self.with_iteration_cap(config.iteration_cap())
            .with_model_timeout(Duration::from_secs(config.model_timeout_secs))
    }

    /// Token checked before each model call and between tool calls.
    pub fn set_cancellation(&mut self, token: CancellationToken) {
        self.cancel = token;
    }

    pub fn state(&self) -> OrchestratorState {
        self.state
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Open a debug flow, append the user turn and run to completion.
    pub async fn process(
        &mut self,
        conversation: &mut ConversationState,
        session_id: &str,
        user_message: &str,
    ) -> Result<String, OrchestratorError> {
        self.debug.start_conversation(session_id, user_message);
        conversation.append(Turn::user(user_message));
        self.run(conversation, session_id).await
    }

    /// Drive the model/tool loop until a final answer, an abort or a failure.
    ///
    /// The last turn of `conversation` is expected to be the user's message.
    pub async fn run(
        &mut self,
        conversation: &mut ConversationState,
        session_id: &str,
    ) -> Result<String, OrchestratorError> {
        self.dispatcher.reset();
        self.state = OrchestratorState::Idle;

        let tools = self.dispatcher.catalog().definitions();
        let tool_names: Vec<&str> = tools.iter().map(|t| t.name.as_str()).collect();
        let mut iteration: u32 = 0;
        let mut used_tools = false;

        info!(
            session_id = %session_id,
            turns = conversation.len(),
            "Processing conversation"
        );

        loop {
            iteration += 1;
            if let Some(limit) = self.iteration_cap
                && iteration > limit
            {
                return Err(self.abort(conversation, session_id, AbortReason::IterationCap { limit }));
            }
            if self.cancel.is_cancelled() {
                return Err(self.cancelled(session_id));
            }

            debug!(session_id = %session_id, iteration, "Orchestrator iteration");
            self.state = OrchestratorState::AwaitingModel;

            let request = ProviderRequest {
                model: self.model.clone(),
                turns: conversation.turns().to_vec(),
                temperature: self.temperature,
                max_tokens: self.max_tokens,
                tools: tools.clone(),
            };
            let request_id = self.debug.add_event(
                session_id,
                EventKind::LlmRequest,
                json!({
                    "model": self.model,
                    "iteration": iteration,
                    "turn_count": request.turns.len(),
                    "tools": tool_names,
                    "request": request,
                }),
                None,
                None,
            );

            let started = Instant::now();
            let outcome =
                call_model(self.provider.as_ref(), request, self.model_timeout, &self.cancel).await;
            let elapsed = started.elapsed();

            let response = match outcome {
                Ok(response) => response,
                Err(ProviderError::Cancelled) => return Err(self.cancelled(session_id)),
                Err(e) => return Err(self.model_failed(conversation, session_id, e)),
            };

            let response_id = self.debug.add_event(
                session_id,
                EventKind::LlmResponse,
                json!({
                    "model": response.model,
                    "content": response.turn.content,
                    "tool_calls": response.turn.tool_calls,
                    "usage": response.usage,
                }),
                Some(elapsed),
                Some(&request_id),
            );

            let turn = response.turn;
            if turn.tool_calls.is_empty() {
                let content = match turn.content.filter(|c| !c.trim().is_empty()) {
                    Some(content) => content,
                    None if used_tools => TASK_COMPLETED.to_string(),
                    None => String::new(),
                };
                conversation.append(Turn::assistant(content.clone()));
                self.debug.complete_conversation(session_id, &content);
                self.state = OrchestratorState::Done;
                info!(session_id = %session_id, iterations = iteration, "Run finished");
                return Ok(content);
            }

            used_tools = true;
            self.state = OrchestratorState::Dispatching;
            debug!(
                session_id = %session_id,
                tool_count = turn.tool_calls.len(),
                "Dispatching tool calls"
            );

            let mut turn = turn;
            for call in &mut turn.tool_calls {
                // Errors are reported per call by the dispatcher.
                let _ = call.parse_arguments();
            }
            let mut calls = turn.tool_calls.clone();
            conversation.append(turn);

            let mut pending = calls.iter_mut();
            while let Some(call) = pending.next() {
                if self.cancel.is_cancelled() {
                    let skipped = "Error: skipped: run cancelled";
                    conversation.append(Turn::tool_result(&call.id, &call.tool_name, skipped));
                    for rest in pending {
                        conversation.append(Turn::tool_result(&rest.id, &rest.tool_name, skipped));
                    }
                    return Err(self.cancelled(session_id));
                }

                match self
                    .dispatcher
                    .dispatch(session_id, call, Some(&response_id))
                    .await
                {
                    DispatchOutcome::Completed(result) => {
                        conversation.append(Turn::tool_result(
                            &result.tool_call_id,
                            &result.tool_name,
                            result.to_turn_content(),
                        ));
                    }
                    DispatchOutcome::Aborted(reason) => {
                        let skipped = format!("Error: skipped: {reason}");
                        conversation.append(Turn::tool_result(&call.id, &call.tool_name, &skipped));
                        for rest in pending {
                            conversation.append(Turn::tool_result(&rest.id, &rest.tool_name, &skipped));
                        }
                        return Err(self.abort(conversation, session_id, reason));
                    }
                }
            }
        }
    }

    fn abort(
        &mut self,
        conversation: &mut ConversationState,
        session_id: &str,
        reason: AbortReason,
    ) -> OrchestratorError {
        self.state = match reason {
            AbortReason::RepeatedCall { .. } => OrchestratorState::AbortedLoop,
            AbortReason::RepeatedFailure { .. } => OrchestratorState::AbortedErrorBudget,
            AbortReason::IterationCap { .. } => OrchestratorState::AbortedIterationCap,
        };
        warn!(session_id = %session_id, reason = %reason, "Run aborted");

        let message = reason.user_message();
        conversation.append(Turn::assistant(message.clone()));
        self.debug.fail_conversation(session_id, &reason.to_string());
        OrchestratorError::Aborted { reason, message }
    }

    fn model_failed(
        &mut self,
        conversation: &mut ConversationState,
        session_id: &str,
        error: ProviderError,
    ) -> OrchestratorError {
        self.state = OrchestratorState::Failed;
        warn!(session_id = %session_id, kind = error.kind(), error = %error, "Model call failed");

        conversation.append(Turn::assistant(format!("Error: {error}")));
        self.debug.fail_conversation(
            session_id,
            &format!("model call failed ({}): {error}", error.kind()),
        );
        OrchestratorError::ModelCall(error)
    }

    fn cancelled(&mut self, session_id: &str) -> OrchestratorError {
        self.state = OrchestratorState::Cancelled;
        info!(session_id = %session_id, "Run cancelled");
        self.debug.fail_conversation(session_id, "cancelled");
        OrchestratorError::Cancelled
    }
}
