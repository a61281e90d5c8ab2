//! Admission strategies and the constraint spec.

use serde::{Deserialize, Serialize};

use crate::consumer::{Consumer, ConsumerState};
use crate::error::{ConstraintError, Result};

/// How blocked consumers are ordered against new requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Strategy {
    /// Admit whatever fits. Small requests may overtake large waiting ones.
    Asap,
    /// Strict registration order. Nothing is admitted while an earlier request waits.
    Fifo,
}

impl Strategy {
    /// Initial state for a request of `permits` against the scope's current consumers.
    pub fn admit(
        &self,
        limit: u32,
        used_permits: u64,
        permits: u32,
        consumers: &[Consumer],
    ) -> ConsumerState {
        let fits = u64::from(limit).saturating_sub(used_permits) >= u64::from(permits);
        let admitted = match self {
            Strategy::Asap => fits,
            Strategy::Fifo => fits && !consumers.iter().any(Consumer::is_blocked),
        };
        if admitted {
            ConsumerState::Active
        } else {
            ConsumerState::Blocked
        }
    }

    /// Whether the runnable walk stops at the first blocked consumer that doesn't fit.
    pub fn stops_at_first_misfit(&self) -> bool {
        match self {
            Strategy::Asap => false,
            Strategy::Fifo => true,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Strategy::Asap => "ASAP",
            Strategy::Fifo => "FIFO",
        }
    }
}

impl std::fmt::Display for Strategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Strategy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "asap" => Ok(Strategy::Asap),
            "fifo" => Ok(Strategy::Fifo),
            other => Err(format!("unknown strategy: {other} (expected asap or fifo)")),
        }
    }
}

/// Limit and strategy guarding a resource. Immutable once created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConstraintSpec {
    pub strategy: Strategy,
    /// Upper bound on concurrently active permits within any one scope.
    pub limit: u32,
}

impl ConstraintSpec {
    pub fn new(strategy: Strategy, limit: u32) -> Self {
        Self { strategy, limit }
    }

    pub fn validate(&self) -> Result<()> {
        if self.limit == 0 {
            return Err(ConstraintError::InvalidLimit(self.limit));
        }
        Ok(())
    }
}
