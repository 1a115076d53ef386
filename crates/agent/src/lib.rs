//! The tool-calling orchestration core.
//!
//! One user message becomes one reply through a **model → tools → model**
//! cycle:
//!
//! 1. **Append** the user turn to the session's [`ConversationState`]
//! 2. **Call the model** with every turn plus the tool schemas
//! 3. **If tool calls**: guard, dispatch and append one tool turn per call,
//!    then loop back to step 2
//! 4. **If text**: append it and return it to the caller
//!
//! The [`LoopGuard`] stops runaway repetition, the
//! [`SessionManager`] keeps sessions isolated from each other, and every step
//! is recorded by the shared `DebugEventManager`.

pub mod conversation;
pub mod dispatch;
pub mod execution_context;
pub mod free_text;
pub mod loop_guard;
pub mod orchestrator;
pub mod session;

#[cfg(test)]
pub(crate) mod test_helpers;

pub use conversation::ConversationState;
pub use dispatch::{DispatchOutcome, ToolDispatcher};
pub use execution_context::BoundedExecutionContext;
pub use free_text::{Decision, FreeTextAgent, FreeTextOutcome};
pub use loop_guard::{AbortReason, LoopGuard, RecentCallRecord, RecentErrorRecord, should_abort};
pub use orchestrator::{OrchestratorError, OrchestratorState, ToolCallOrchestrator};
pub use session::{
    SessionError, SessionId, SessionInfo, SessionManager, SessionSettings, SessionStats,
    SessionStatus,
};
