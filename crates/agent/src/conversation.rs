//! Conversation state: the ordered turn list one session sends to the model.

use toolrelay_core::message::{Role, Turn};

/// Default number of turns kept after trimming, system turn included.
pub const DEFAULT_MAX_TURNS: usize = 20;

/// Ordered turns plus a retention limit.
///
/// Trimming keeps the most recent system turn and the most recent
/// `max_turns - 1` other turns, widened backward so an assistant turn that
/// requested tools is never separated from its tool results.
#[derive(Debug, Clone)]
pub struct ConversationState {
    turns: Vec<Turn>,
    max_turns: usize,
}

impl ConversationState {
    pub fn new(max_turns: usize) -> Self {
        Self {
            turns: Vec::new(),
            max_turns: max_turns.max(2),
        }
    }

    pub fn with_system_prompt(max_turns: usize, prompt: impl Into<String>) -> Self {
        let mut state = Self::new(max_turns);
        state.turns.push(Turn::system(prompt));
        state
    }

    /// Append a turn, trimming if the limit is exceeded.
    pub fn append(&mut self, turn: Turn) {
        self.turns.push(turn);
        if self.turns.len() > self.max_turns {
            self.trim();
        }
    }

    pub fn trim(&mut self) {
        if self.turns.len() <= self.max_turns {
            return;
        }

        let system = self
            .turns
            .iter()
            .rev()
            .find(|t| t.role == Role::System)
            .cloned();
        let rest: Vec<Turn> = self
            .turns
            .drain(..)
            .filter(|t| t.role != Role::System)
            .collect();

        let keep = self.max_turns - 1;
        let mut start = rest.len().saturating_sub(keep);
        // A tool turn must stay with the assistant turn that asked for it.
        while start > 0 && rest[start].role == Role::Tool {
            start -= 1;
        }

        self.turns = system.into_iter().chain(rest.into_iter().skip(start)).collect();
    }

    /// Drop every turn, optionally keeping the latest system turn.
    pub fn clear(&mut self, keep_system: bool) {
        let system = if keep_system {
            self.turns
                .iter()
                .rev()
                .find(|t| t.role == Role::System)
                .cloned()
        } else {
            None
        };
        self.turns.clear();
        self.turns.extend(system);
    }

    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    pub fn max_turns(&self) -> usize {
        self.max_turns
    }

    /// Content of the most recent assistant turn that has any.
    pub fn last_assistant_content(&self) -> Option<&str> {
        self.turns
            .iter()
            .rev()
            .filter(|t| t.role == Role::Assistant)
            .find_map(|t| t.content.as_deref().filter(|c| !c.is_empty()))
    }
}

impl Default for ConversationState {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_TURNS)
    }
}
