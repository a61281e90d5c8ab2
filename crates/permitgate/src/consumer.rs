//! Consumer: one permit request and its lifecycle state.
//!
//! Transitions are one-directional:
//! - `Blocked` → `Active` (promoted by the unblock cascade)
//! - `Active` → `Finished`
//!
//! Every transition is conditioned on an expected prior state. A mismatch is a
//! lost race, reported as `false`, never as an error.

use serde::{Deserialize, Serialize};

use crate::ids::ConsumerId;

/// Free-form caller data attached to a consumer.
pub type ConsumerContext = serde_json::Map<String, serde_json::Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConsumerState {
    /// Waiting for capacity. Holds no permits.
    Blocked,
    /// Holding its permits.
    Active,
    /// Released its permits. Terminal.
    Finished,
}

impl ConsumerState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finished)
    }

    pub fn can_transition_to(&self, next: ConsumerState) -> bool {
        matches!(
            (self, next),
            (Self::Blocked, Self::Active) | (Self::Active, Self::Finished)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Blocked => "BLOCKED",
            Self::Active => "ACTIVE",
            Self::Finished => "FINISHED",
        }
    }
}

impl std::fmt::Display for ConsumerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Consumer {
    pub id: ConsumerId,
    pub permits: u32,
    pub state: ConsumerState,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub context: ConsumerContext,
}

impl Consumer {
    pub fn new(
        id: ConsumerId,
        permits: u32,
        state: ConsumerState,
        context: ConsumerContext,
    ) -> Self {
        Self {
            id,
            permits,
            state,
            context,
        }
    }

    pub fn is_active(&self) -> bool {
        self.state == ConsumerState::Active
    }

    pub fn is_blocked(&self) -> bool {
        self.state == ConsumerState::Blocked
    }

    /// Compare-and-swap the state.
    ///
    /// Returns `false` without touching the consumer if the current state is
    /// not `expected` or the edge `expected → next` is not a legal transition.
    /// On success, `context` entries are merged over the existing context.
    pub fn transition(
        &mut self,
        expected: ConsumerState,
        next: ConsumerState,
        context: Option<&ConsumerContext>,
    ) -> bool {
        if self.state != expected || !expected.can_transition_to(next) {
            return false;
        }
        self.state = next;
        if let Some(extra) = context {
            for (k, v) in extra {
                self.context.insert(k.clone(), v.clone());
            }
        }
        true
    }
}

/// Sum of permits held by active consumers.
pub fn active_permits<'a>(consumers: impl IntoIterator<Item = &'a Consumer>) -> u64 {
    consumers
        .into_iter()
        .filter(|c| c.is_active())
        .map(|c| u64::from(c.permits))
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn consumer(state: ConsumerState) -> Consumer {
        Consumer::new("c1".into(), 3, state, ConsumerContext::new())
    }

    #[test]
    fn legal_transitions() {
        let mut c = consumer(ConsumerState::Blocked);
        assert!(c.transition(ConsumerState::Blocked, ConsumerState::Active, None));
        assert_eq!(c.state, ConsumerState::Active);
        assert!(c.transition(ConsumerState::Active, ConsumerState::Finished, None));
        assert!(c.state.is_terminal());
    }

    #[test]
    fn expected_state_mismatch_is_noop() {
        let mut c = consumer(ConsumerState::Active);
        assert!(!c.transition(ConsumerState::Blocked, ConsumerState::Active, None));
        assert_eq!(c.state, ConsumerState::Active);
    }

    #[test]
    fn illegal_edges_are_refused() {
        let mut finished = consumer(ConsumerState::Finished);
        assert!(!finished.transition(ConsumerState::Finished, ConsumerState::Active, None));
        assert!(!finished.transition(ConsumerState::Finished, ConsumerState::Blocked, None));

        let mut blocked = consumer(ConsumerState::Blocked);
        assert!(!blocked.transition(ConsumerState::Blocked, ConsumerState::Finished, None));
        assert_eq!(blocked.state, ConsumerState::Blocked);

        let mut active = consumer(ConsumerState::Active);
        assert!(!active.transition(ConsumerState::Active, ConsumerState::Blocked, None));
    }

    #[test]
    fn transition_merges_context() {
        let mut c = consumer(ConsumerState::Active);
        c.context.insert("pipeline".into(), serde_json::json!("p1"));

        let mut extra = ConsumerContext::new();
        extra.insert("exit_code".into(), serde_json::json!(0));
        assert!(c.transition(ConsumerState::Active, ConsumerState::Finished, Some(&extra)));

        assert_eq!(c.context.get("pipeline"), Some(&serde_json::json!("p1")));
        assert_eq!(c.context.get("exit_code"), Some(&serde_json::json!(0)));
    }

    #[test]
    fn active_permits_ignores_blocked_and_finished() {
        let consumers = vec![
            Consumer::new("a".into(), 5, ConsumerState::Active, ConsumerContext::new()),
            Consumer::new("b".into(), 4, ConsumerState::Blocked, ConsumerContext::new()),
            Consumer::new("c".into(), 2, ConsumerState::Finished, ConsumerContext::new()),
            Consumer::new("d".into(), 1, ConsumerState::Active, ConsumerContext::new()),
        ];
        assert_eq!(active_permits(&consumers), 6);
    }

    #[test]
    fn consumer_serializes_state_uppercase() {
        let c = consumer(ConsumerState::Blocked);
        insta::assert_json_snapshot!(c, @r#"
        {
          "id": "c1",
          "permits": 3,
          "state": "BLOCKED"
        }
        "#);
    }
}
