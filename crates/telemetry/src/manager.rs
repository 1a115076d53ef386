//! Thread-safe debug event manager: records every model and tool step,
//! groups them into per-message flows and keeps running totals.

use crate::model::*;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::{error, trace, warn};

pub const DEFAULT_MAX_EVENTS: usize = 1000;
pub const DEFAULT_MAX_FLOWS: usize = 20;

/// Handle returned by `on_event` / `on_flow_complete`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type EventCallback = Arc<dyn Fn(&DebugEvent) + Send + Sync>;
type FlowCallback = Arc<dyn Fn(&ConversationFlow) + Send + Sync>;

#[derive(Default)]
struct Subscribers {
    events: Vec<(SubscriptionId, EventCallback)>,
    flows: Vec<(SubscriptionId, FlowCallback)>,
}

/// Bounded log state, guarded by one lock so appends are serialized.
#[derive(Default)]
struct LogState {
    events: VecDeque<DebugEvent>,
    flows: VecDeque<ConversationFlow>,
    /// session id → id of its open flow
    open: HashMap<String, String>,
    totals: DebugStats,
}

impl LogState {
    fn flow_mut(&mut self, flow_id: &str) -> Option<&mut ConversationFlow> {
        self.flows.iter_mut().rev().find(|f| f.id == flow_id)
    }

    /// Append an event to the global log and the session's open flow.
    fn record(&mut self, max_events: usize, session_id: &str, mut event: DebugEvent) -> DebugEvent {
        event.session_id = Some(session_id.to_string());
        event.flow_id = self.open.get(session_id).cloned();

        self.totals.total_events += 1;
        *self.totals.events_by_kind.entry(event.kind).or_insert(0) += 1;
        if let Some(usage) = event.usage() {
            self.totals.tokens = self.totals.tokens + usage;
        }

        if let Some(flow_id) = event.flow_id.clone()
            && let Some(flow) = self.flow_mut(&flow_id)
        {
            flow.events.push(event.clone());
        }

        self.events.push_back(event.clone());
        while self.events.len() > max_events {
            self.events.pop_front();
        }

        event
    }

    /// Seal the session's open flow, returning a snapshot of it.
    fn seal(&mut self, session_id: &str, complete: bool) -> Option<ConversationFlow> {
        let flow_id = self.open.remove(session_id)?;
        let flow = self.flow_mut(&flow_id)?;
        flow.seal(complete);
        let snapshot = flow.clone();

        if complete {
            self.totals.flows_completed += 1;
        } else {
            self.totals.flows_abandoned += 1;
        }
        Some(snapshot)
    }
}

/// Observes orchestration without taking part in it.
///
/// Shared by every session via `Arc`; a single `RwLock` serializes appends.
/// Subscriber callbacks run after the lock is released, and a panicking
/// callback is caught and logged.
pub struct DebugEventManager {
    max_events: usize,
    max_flows: usize,
    state: RwLock<LogState>,
    subscribers: RwLock<Subscribers>,
    next_subscription: AtomicU64,
}

impl DebugEventManager {
    pub fn new(max_events: usize, max_flows: usize) -> Self {
        Self {
            max_events: max_events.max(1),
            max_flows: max_flows.max(1),
            state: RwLock::new(LogState::default()),
            subscribers: RwLock::new(Subscribers::default()),
            next_subscription: AtomicU64::new(1),
        }
    }

    fn write_state(&self) -> std::sync::RwLockWriteGuard<'_, LogState> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }

    fn read_state(&self) -> std::sync::RwLockReadGuard<'_, LogState> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    // ── Flow lifecycle ────────────────────────────────────────────────

    /// Open a flow for a user message and record the `user_message` event.
    ///
    /// An open flow left over from an earlier message is sealed first, with
    /// `is_complete == false`.
    pub fn start_conversation(&self, session_id: &str, user_message: &str) -> String {
        let (stale, flow_id, event) = {
            let mut state = self.write_state();
            let stale = state.seal(session_id, false);
            if let Some(stale) = &stale {
                warn!(session_id = %session_id, flow_id = %stale.id, "Closing stale open flow");
            }

            let flow = ConversationFlow::new(session_id, user_message);
            let flow_id = flow.id.clone();
            state.flows.push_back(flow);
            state.totals.flows_started += 1;
            while state.flows.len() > self.max_flows {
                if let Some(evicted) = state.flows.pop_front() {
                    state.open.retain(|_, id| *id != evicted.id);
                }
            }
            state.open.insert(session_id.to_string(), flow_id.clone());

            let event = DebugEvent::new(
                EventKind::UserMessage,
                serde_json::json!({ "content": user_message }),
            );
            let event = state.record(self.max_events, session_id, event);
            (stale, flow_id, event)
        };

        if let Some(stale) = stale {
            self.notify_flow(&stale);
        }
        self.notify_event(&event);
        flow_id
    }

    /// Record an event for the session. Returns the event id.
    ///
    /// The payload is converted with `serde_json::to_value`, so later changes
    /// to the caller's data never show up in the log.
    pub fn add_event(
        &self,
        session_id: &str,
        kind: EventKind,
        payload: impl Serialize,
        duration: Option<Duration>,
        parent_id: Option<&str>,
    ) -> String {
        let payload = serde_json::to_value(payload).unwrap_or_else(|e| {
            serde_json::json!({ "payload_error": e.to_string() })
        });

        let mut event = DebugEvent::new(kind, payload);
        event.duration_ms = duration.map(|d| d.as_millis() as u64);
        event.parent_id = parent_id.map(String::from);

        let event = self.write_state().record(self.max_events, session_id, event);
        trace!(session_id = %session_id, kind = %kind, event_id = %event.id, "Debug event recorded");

        let id = event.id.clone();
        self.notify_event(&event);
        id
    }

    /// Record the `final_response` event and seal the flow as complete.
    pub fn complete_conversation(&self, session_id: &str, final_text: &str) -> Option<String> {
        self.finish(
            session_id,
            EventKind::FinalResponse,
            serde_json::json!({ "content": final_text }),
            true,
        )
    }

    /// Record an `error` event and seal the flow as incomplete.
    pub fn fail_conversation(&self, session_id: &str, reason: &str) -> Option<String> {
        self.finish(
            session_id,
            EventKind::Error,
            serde_json::json!({ "message": reason, "terminal": true }),
            false,
        )
    }

    fn finish(
        &self,
        session_id: &str,
        kind: EventKind,
        payload: serde_json::Value,
        complete: bool,
    ) -> Option<String> {
        let (event, sealed) = {
            let mut state = self.write_state();
            let event = state.record(self.max_events, session_id, DebugEvent::new(kind, payload));
            let sealed = state.seal(session_id, complete);
            (event, sealed)
        };

        self.notify_event(&event);
        let sealed = sealed?;
        self.notify_flow(&sealed);
        Some(sealed.id)
    }

    // ── Queries ───────────────────────────────────────────────────────

    /// All retained events, oldest first.
    pub fn events(&self) -> Vec<DebugEvent> {
        self.read_state().events.iter().cloned().collect()
    }

    /// The last `n` retained events, oldest first.
    pub fn recent_events(&self, n: usize) -> Vec<DebugEvent> {
        let state = self.read_state();
        let skip = state.events.len().saturating_sub(n);
        state.events.iter().skip(skip).cloned().collect()
    }

    /// All retained flows, oldest first.
    pub fn flows(&self) -> Vec<ConversationFlow> {
        self.read_state().flows.iter().cloned().collect()
    }

    pub fn flow(&self, flow_id: &str) -> Option<ConversationFlow> {
        self.read_state()
            .flows
            .iter()
            .find(|f| f.id == flow_id)
            .cloned()
    }

    pub fn flows_for_session(&self, session_id: &str) -> Vec<ConversationFlow> {
        self.read_state()
            .flows
            .iter()
            .filter(|f| f.session_id == session_id)
            .cloned()
            .collect()
    }

    /// The session's open flow, if any.
    pub fn current_flow(&self, session_id: &str) -> Option<ConversationFlow> {
        let state = self.read_state();
        let flow_id = state.open.get(session_id)?;
        state.flows.iter().find(|f| &f.id == flow_id).cloned()
    }

    pub fn stats(&self) -> DebugStats {
        let state = self.read_state();
        DebugStats {
            open_flows: state.open.len(),
            retained_events: state.events.len(),
            retained_flows: state.flows.len(),
            ..state.totals.clone()
        }
    }

    /// Drop all events, flows and totals. Subscriptions are kept.
    pub fn clear(&self) {
        *self.write_state() = LogState::default();
    }

    // ── Subscribers ───────────────────────────────────────────────────

    fn next_id(&self) -> SubscriptionId {
        SubscriptionId(self.next_subscription.fetch_add(1, Ordering::Relaxed))
    }

    /// Call `callback` for every recorded event.
    pub fn on_event<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&DebugEvent) + Send + Sync + 'static,
    {
        let id = self.next_id();
        self.subscribers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .events
            .push((id, Arc::new(callback)));
        id
    }

    /// Call `callback` whenever a flow is sealed (completed, failed or superseded).
    pub fn on_flow_complete<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&ConversationFlow) + Send + Sync + 'static,
    {
        let id = self.next_id();
        self.subscribers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .flows
            .push((id, Arc::new(callback)));
        id
    }

    /// Remove a subscription. Returns false if it was not registered.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subs = self.subscribers.write().unwrap_or_else(|e| e.into_inner());
        let before = subs.events.len() + subs.flows.len();
        subs.events.retain(|(sid, _)| *sid != id);
        subs.flows.retain(|(sid, _)| *sid != id);
        subs.events.len() + subs.flows.len() < before
    }

    fn notify_event(&self, event: &DebugEvent) {
        let callbacks: Vec<EventCallback> = self
            .subscribers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .events
            .iter()
            .map(|(_, cb)| cb.clone())
            .collect();

        for callback in callbacks {
            if catch_unwind(AssertUnwindSafe(|| callback(event))).is_err() {
                error!(event_id = %event.id, kind = %event.kind, "Debug event subscriber panicked");
            }
        }
    }

    fn notify_flow(&self, flow: &ConversationFlow) {
        let callbacks: Vec<FlowCallback> = self
            .subscribers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .flows
            .iter()
            .map(|(_, cb)| cb.clone())
            .collect();

        for callback in callbacks {
            if catch_unwind(AssertUnwindSafe(|| callback(flow))).is_err() {
                error!(flow_id = %flow.id, "Flow subscriber panicked");
            }
        }
    }
}

impl Default for DebugEventManager {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_EVENTS, DEFAULT_MAX_FLOWS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn start_add_complete_yields_n_plus_two_events() {
        let manager = DebugEventManager::default();
        manager.start_conversation("s1", "Calculate 10 + 5");
        for i in 0..4 {
            manager.add_event("s1", EventKind::LlmRequest, serde_json::json!({ "i": i }), None, None);
        }
        let flow_id = manager.complete_conversation("s1", "15").unwrap();

        let flow = manager.flow(&flow_id).unwrap();
        assert_eq!(flow.events.len(), 4 + 2);
        assert_eq!(flow.events.first().unwrap().kind, EventKind::UserMessage);
        assert_eq!(flow.events.last().unwrap().kind, EventKind::FinalResponse);
        assert!(flow.is_complete);
        assert!(flow.total_duration_ms.is_some());
        assert!(manager.current_flow("s1").is_none());
    }

    #[test]
    fn payload_is_a_structural_copy() {
        #[derive(Serialize)]
        struct Payload {
            items: Vec<u32>,
        }

        let manager = DebugEventManager::default();
        let mut payload = Payload { items: vec![1, 2] };
        manager.add_event("s1", EventKind::ToolResult, &payload, None, None);
        payload.items.push(3);

        let events = manager.events();
        assert_eq!(events[0].payload["items"], serde_json::json!([1, 2]));
        assert_eq!(payload.items.len(), 3);
    }

    #[test]
    fn starting_again_closes_stale_flow() {
        let manager = DebugEventManager::default();
        let first = manager.start_conversation("s1", "one");
        let second = manager.start_conversation("s1", "two");

        let stale = manager.flow(&first).unwrap();
        assert!(!stale.is_complete);
        assert!(stale.is_sealed());
        assert_eq!(manager.current_flow("s1").unwrap().id, second);
        assert_eq!(manager.stats().flows_abandoned, 1);
    }

    #[test]
    fn flows_are_per_session() {
        let manager = DebugEventManager::default();
        manager.start_conversation("a", "hello");
        manager.start_conversation("b", "hi");
        manager.add_event("a", EventKind::LlmRequest, serde_json::json!({}), None, None);

        assert_eq!(manager.current_flow("a").unwrap().events.len(), 2);
        assert_eq!(manager.current_flow("b").unwrap().events.len(), 1);
        assert_eq!(manager.flows_for_session("a").len(), 1);
        assert_eq!(manager.stats().open_flows, 2);
    }

    #[test]
    fn fail_conversation_seals_incomplete() {
        let manager = DebugEventManager::default();
        let flow_id = manager.start_conversation("s1", "hi");
        manager.fail_conversation("s1", "model timed out");

        let flow = manager.flow(&flow_id).unwrap();
        assert!(!flow.is_complete);
        assert!(flow.is_sealed());
        assert_eq!(flow.events.last().unwrap().kind, EventKind::Error);
    }

    #[test]
    fn event_log_is_bounded_but_totals_are_not() {
        let manager = DebugEventManager::new(5, 20);
        for _ in 0..12 {
            manager.add_event(
                "s1",
                EventKind::LlmResponse,
                serde_json::json!({"usage": {"prompt_tokens": 2, "completion_tokens": 1, "total_tokens": 3}}),
                Some(Duration::from_millis(10)),
                None,
            );
        }
        assert_eq!(manager.events().len(), 5);
        let stats = manager.stats();
        assert_eq!(stats.total_events, 12);
        assert_eq!(stats.count(EventKind::LlmResponse), 12);
        assert_eq!(stats.tokens.total_tokens, 36);
        assert_eq!(stats.tokens.prompt_tokens, 24);
        assert_eq!(stats.retained_events, 5);
    }

    #[test]
    fn flow_list_is_bounded() {
        let manager = DebugEventManager::new(1000, 3);
        let mut ids = Vec::new();
        for i in 0..5 {
            let session = format!("s{i}");
            ids.push(manager.start_conversation(&session, "hi"));
            manager.complete_conversation(&session, "ok");
        }
        let flows = manager.flows();
        assert_eq!(flows.len(), 3);
        assert_eq!(flows[0].id, ids[2]);
        assert!(manager.flow(&ids[0]).is_none());
    }

    #[test]
    fn recent_events_returns_tail() {
        let manager = DebugEventManager::default();
        for i in 0..10 {
            manager.add_event("s1", EventKind::ToolResult, serde_json::json!({ "i": i }), None, None);
        }
        let recent = manager.recent_events(3);
        assert_eq!(recent.len(), 3);
        assert_eq!(recent[0].payload["i"], 7);
        assert_eq!(manager.recent_events(50).len(), 10);
    }

    #[test]
    fn parent_ids_are_kept() {
        let manager = DebugEventManager::default();
        let parent = manager.add_event("s1", EventKind::LlmResponse, serde_json::json!({}), None, None);
        manager.add_event("s1", EventKind::ToolCallParsed, serde_json::json!({}), None, Some(&parent));
        let events = manager.events();
        assert_eq!(events[1].parent_id.as_deref(), Some(parent.as_str()));
    }

    #[test]
    fn subscribers_receive_events_and_flows() {
        let manager = DebugEventManager::default();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let completed = Arc::new(AtomicUsize::new(0));

        let seen_clone = seen.clone();
        manager.on_event(move |e| seen_clone.lock().unwrap().push(e.kind));
        let completed_clone = completed.clone();
        manager.on_flow_complete(move |f| {
            assert!(f.is_sealed());
            completed_clone.fetch_add(1, Ordering::SeqCst);
        });

        manager.start_conversation("s1", "hi");
        manager.complete_conversation("s1", "done");

        assert_eq!(
            *seen.lock().unwrap(),
            vec![EventKind::UserMessage, EventKind::FinalResponse]
        );
        assert_eq!(completed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn panicking_subscriber_does_not_break_recording() {
        let manager = DebugEventManager::default();
        let calls = Arc::new(AtomicUsize::new(0));
        manager.on_event(|_| panic!("subscriber bug"));
        let calls_clone = calls.clone();
        manager.on_event(move |_| {
            calls_clone.fetch_add(1, Ordering::SeqCst);
        });

        manager.add_event("s1", EventKind::Error, serde_json::json!({}), None, None);
        manager.add_event("s1", EventKind::Error, serde_json::json!({}), None, None);

        assert_eq!(manager.events().len(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn unsubscribe_stops_callbacks() {
        let manager = DebugEventManager::default();
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();
        let id = manager.on_event(move |_| {
            calls_clone.fetch_add(1, Ordering::SeqCst);
        });

        manager.add_event("s1", EventKind::Error, serde_json::json!({}), None, None);
        assert!(manager.unsubscribe(id));
        assert!(!manager.unsubscribe(id));
        manager.add_event("s1", EventKind::Error, serde_json::json!({}), None, None);

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn clear_resets_everything() {
        let manager = DebugEventManager::default();
        manager.start_conversation("s1", "hi");
        manager.clear();
        assert!(manager.events().is_empty());
        assert!(manager.flows().is_empty());
        assert!(manager.current_flow("s1").is_none());
        assert_eq!(manager.stats().total_events, 0);
    }

    #[test]
    fn concurrent_sessions_append_safely() {
        let manager = Arc::new(DebugEventManager::default());
        let handles: Vec<_> = (0..4)
            .map(|i| {
                let manager = manager.clone();
                std::thread::spawn(move || {
                    let session = format!("s{i}");
                    manager.start_conversation(&session, "go");
                    for _ in 0..10 {
                        manager.add_event(&session, EventKind::ToolExecution, serde_json::json!({}), None, None);
                    }
                    manager.complete_conversation(&session, "done");
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let stats = manager.stats();
        assert_eq!(stats.total_events, 4 * 12);
        assert_eq!(stats.flows_completed, 4);
        for flow in manager.flows() {
            assert_eq!(flow.events.len(), 12);
        }
    }
}
