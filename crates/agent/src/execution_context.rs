//! Bounded execution context: the free-text agent's scratchpad.
//!
//! A small key → JSON store that remembers what earlier decisions produced
//! (last tool result, last error, the tool list) so the next prompt can
//! include it. Capacity is fixed; the oldest inserted key is evicted first.
//! Updating an existing key replaces its value but keeps its position.

use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use toolrelay_config::ContextConfig;

/// Keys matching any of these are always considered relevant for a hinted lookup.
const ALWAYS_RELEVANT: [&str; 3] = ["last_", "error", "result"];

#[derive(Debug, Clone)]
pub struct BoundedExecutionContext {
    capacity: usize,
    hinted_limit: usize,
    unhinted_limit: usize,
    /// Insertion order, oldest first.
    order: VecDeque<String>,
    values: HashMap<String, Value>,
}

impl BoundedExecutionContext {
    pub fn new(capacity: usize) -> Self {
        let defaults = ContextConfig::default();
        Self {
            capacity: capacity.max(1),
            hinted_limit: defaults.hinted_limit,
            unhinted_limit: defaults.unhinted_limit,
            order: VecDeque::new(),
            values: HashMap::new(),
        }
    }

    pub fn from_config(config: &ContextConfig) -> Self {
        Self {
            hinted_limit: config.hinted_limit,
            unhinted_limit: config.unhinted_limit,
            ..Self::new(config.capacity)
        }
    }

    /// Insert or replace a value. Evicts the oldest key when full.
    pub fn update(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        let key = key.into();
        let value = value.into();

        if let Some(existing) = self.values.get_mut(&key) {
            *existing = value;
            return;
        }

        if self.order.len() >= self.capacity
            && let Some(oldest) = self.order.pop_front()
        {
            self.values.remove(&oldest);
        }

        self.order.push_back(key.clone());
        self.values.insert(key, value);
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn clear(&mut self) {
        self.order.clear();
        self.values.clear();
    }

    /// Keys in insertion order, oldest first.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.order.iter().map(String::as_str)
    }

    /// Entries worth showing the model, in insertion order.
    ///
    /// With a hint: up to the last `hinted_limit` entries whose key contains
    /// the hint, `last_`, `error` or `result`. Without: the last
    /// `unhinted_limit` entries.
    pub fn relevant_context(&self, hint: Option<&str>) -> Vec<(String, Value)> {
        let matching: Vec<&String> = match hint {
            Some(hint) => self
                .order
                .iter()
                .filter(|key| {
                    (!hint.is_empty() && key.contains(hint))
                        || ALWAYS_RELEVANT.iter().any(|marker| key.contains(marker))
                })
                .collect(),
            None => self.order.iter().collect(),
        };

        let limit = if hint.is_some() {
            self.hinted_limit
        } else {
            self.unhinted_limit
        };
        let skip = matching.len().saturating_sub(limit);

        matching
            .into_iter()
            .skip(skip)
            .filter_map(|key| self.values.get(key).map(|v| (key.clone(), v.clone())))
            .collect()
    }

    /// Render the relevant entries as a prompt section. Empty when nothing applies.
    pub fn render(&self, hint: Option<&str>) -> String {
        let entries = self.relevant_context(hint);
        if entries.is_empty() {
            return String::new();
        }

        let mut out = String::from("## Execution Context\n");
        for (key, value) in entries {
            let rendered = match value {
                Value::String(s) => s,
                other => other.to_string(),
            };
            out.push_str(&format!("- {key}: {rendered}\n"));
        }
        out
    }
}

impl Default for BoundedExecutionContext {
    fn default() -> Self {
        Self::from_config(&ContextConfig::default())
    }
}
