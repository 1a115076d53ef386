//! Debug event tracing for toolrelay.
//!
//! Records every model request/response and tool execution as a bounded,
//! append-only event log, grouped into one flow per user message, with
//! running token-usage totals. Purely observational: nothing here changes
//! how a conversation proceeds.

pub mod manager;
pub mod model;

pub use manager::{DEFAULT_MAX_EVENTS, DEFAULT_MAX_FLOWS, DebugEventManager, SubscriptionId};
pub use model::{ConversationFlow, DebugEvent, DebugStats, EventKind, TokenTotals};
