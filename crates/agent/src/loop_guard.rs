//! Loop guard: stops runaway tool-calling.
//!
//! Two triggers, either one aborts the run:
//! - the same tool with the same arguments requested `repeat_threshold`
//!   times (the current request included) within the recent-call window;
//! - `error_threshold` of the most recent `error_window` failures came
//!   from the tool about to be called.
//!
//! [`should_abort`] is the pure decision; [`LoopGuard`] owns the windows.

use serde_json::Value;
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use toolrelay_config::LoopGuardConfig;

/// Why a run was stopped before the model gave a final answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AbortReason {
    /// The same call kept coming back.
    RepeatedCall { tool_name: String, occurrences: usize },
    /// One tool kept failing.
    RepeatedFailure { tool_name: String, failures: usize },
    /// The autonomous iteration cap was hit.
    IterationCap { limit: u32 },
}

impl AbortReason {
    /// Explanation appended to the conversation as the assistant's reply.
    pub fn user_message(&self) -> String {
        match self {
            Self::RepeatedCall { tool_name, occurrences } => format!(
                "I stopped because I was calling '{tool_name}' with the same arguments \
                 repeatedly ({occurrences} times) without making progress. \
                 Please rephrase the request or give me more details."
            ),
            Self::RepeatedFailure { tool_name, failures } => format!(
                "I stopped because the '{tool_name}' tool failed {failures} times \
                 among my recent errors. Please check the input or try a different approach."
            ),
            Self::IterationCap { limit } => format!(
                "I stopped after reaching the limit of {limit} steps without finishing the task."
            ),
        }
    }
}

impl std::fmt::Display for AbortReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::RepeatedCall { tool_name, occurrences } => {
                write!(f, "repeated call to {tool_name} ({occurrences} identical requests)")
            }
            Self::RepeatedFailure { tool_name, failures } => {
                write!(f, "{tool_name} failed {failures} times")
            }
            Self::IterationCap { limit } => write!(f, "iteration cap of {limit} reached"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RecentCallRecord {
    pub tool_name: String,
    pub fingerprint: String,
    pub at: Instant,
}

#[derive(Debug, Clone)]
pub struct RecentErrorRecord {
    pub tool_name: String,
    pub message: String,
    pub at: Instant,
}

/// `tool_name:canonical-json`, insensitive to key order and whitespace.
pub fn fingerprint(tool_name: &str, arguments: &Value) -> String {
    let mut out = String::with_capacity(tool_name.len() + 32);
    out.push_str(tool_name);
    out.push(':');
    write_canonical(arguments, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(&map[key.as_str()], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

/// Decide whether the next call must not run. No I/O, no state.
pub fn should_abort<'a>(
    config: &LoopGuardConfig,
    tool_name: &str,
    fingerprint: &str,
    recent_calls: impl IntoIterator<Item = &'a RecentCallRecord>,
    recent_errors: impl DoubleEndedIterator<Item = &'a RecentErrorRecord>,
    now: Instant,
) -> Option<AbortReason> {
    let window = Duration::from_secs(config.call_window_secs);
    let identical = recent_calls
        .into_iter()
        .filter(|c| c.fingerprint == fingerprint)
        .filter(|c| now.saturating_duration_since(c.at) <= window)
        .count();

    if identical + 1 >= config.repeat_threshold {
        return Some(AbortReason::RepeatedCall {
            tool_name: tool_name.to_string(),
            occurrences: identical + 1,
        });
    }

    let failures = recent_errors
        .rev()
        .take(config.error_window)
        .filter(|e| e.tool_name == tool_name)
        .count();

    if failures >= config.error_threshold {
        return Some(AbortReason::RepeatedFailure {
            tool_name: tool_name.to_string(),
            failures,
        });
    }

    None
}

/// Stateful guard: bounded recent-call and recent-error windows.
#[derive(Debug, Clone)]
pub struct LoopGuard {
    config: LoopGuardConfig,
    calls: VecDeque<RecentCallRecord>,
    errors: VecDeque<RecentErrorRecord>,
}

impl LoopGuard {
    pub fn new(config: LoopGuardConfig) -> Self {
        Self {
            config,
            calls: VecDeque::new(),
            errors: VecDeque::new(),
        }
    }

    pub fn config(&self) -> &LoopGuardConfig {
        &self.config
    }

    pub fn check(&self, tool_name: &str, fingerprint: &str) -> Option<AbortReason> {
        self.check_at(tool_name, fingerprint, Instant::now())
    }

    pub fn check_at(&self, tool_name: &str, fingerprint: &str, now: Instant) -> Option<AbortReason> {
        should_abort(
            &self.config,
            tool_name,
            fingerprint,
            &self.calls,
            self.errors.iter(),
            now,
        )
    }

    /// Remember a call that was dispatched, whatever its outcome.
    pub fn record_call(&mut self, tool_name: &str, fingerprint: String) {
        self.record_call_at(tool_name, fingerprint, Instant::now());
    }

    pub fn record_call_at(&mut self, tool_name: &str, fingerprint: String, now: Instant) {
        let window = Duration::from_secs(self.config.call_window_secs);
        self.calls
            .retain(|c| now.saturating_duration_since(c.at) <= window);

        self.calls.push_back(RecentCallRecord {
            tool_name: tool_name.to_string(),
            fingerprint,
            at: now,
        });
        while self.calls.len() > self.config.call_window {
            self.calls.pop_front();
        }
    }

    pub fn record_error(&mut self, tool_name: &str, message: impl Into<String>) {
        self.errors.push_back(RecentErrorRecord {
            tool_name: tool_name.to_string(),
            message: message.into(),
            at: Instant::now(),
        });
        while self.errors.len() > self.config.error_window {
            self.errors.pop_front();
        }
    }

    pub fn recent_calls(&self) -> impl Iterator<Item = &RecentCallRecord> {
        self.calls.iter()
    }

    pub fn recent_errors(&self) -> impl Iterator<Item = &RecentErrorRecord> {
        self.errors.iter()
    }

    pub fn reset(&mut self) {
        self.calls.clear();
        self.errors.clear();
    }
}

impl Default for LoopGuard {
    fn default() -> Self {
        Self::new(LoopGuardConfig::default())
    }
}
