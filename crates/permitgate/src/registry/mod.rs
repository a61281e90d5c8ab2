//! ConstraintRegistry: the storage and concurrency port the constraint
//! algorithm depends on.
//!
//! A backing store must provide conditional writes. Every mutation is
//! conditioned on an expected prior value and reports a lost race as `false`,
//! so scope bookkeeping is never left half-updated.

mod inproc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::consumer::{Consumer, ConsumerContext, active_permits};
use crate::error::Result;
use crate::ids::{ConstraintId, ConsumerId, Scope};
use crate::retry::{RegistrationAttempt, RetryDecision};
use crate::strategy::ConstraintSpec;

pub use inproc::{InProcRegistry, OverlapFn};

/// Compare value for a conditional append.
///
/// Both fields are recomputed from the live consumer list. A concurrent
/// admission or release changes `used_permits`; a concurrent blocked
/// registration or promotion changes `blocked`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScopeSnapshot {
    pub used_permits: u64,
    pub blocked: usize,
}

impl ScopeSnapshot {
    pub fn of(consumers: &[Consumer]) -> Self {
        Self {
            used_permits: active_permits(consumers),
            blocked: consumers.iter().filter(|c| c.is_blocked()).count(),
        }
    }
}

/// Result of the composite finish-and-unblock operation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinishOutcome {
    /// False if the consumer was not active (already finished, still blocked, or unknown).
    pub finished: bool,
    /// Consumers promoted to active, in persisted order.
    pub unblocked: Vec<ConsumerId>,
}

#[async_trait]
pub trait ConstraintRegistry: Send + Sync {
    /// Persist a constraint spec. Fails with `DuplicateConstraint` if `id` exists.
    async fn save(&self, id: &ConstraintId, spec: ConstraintSpec) -> Result<()>;

    /// Fetch a constraint spec. Fails with `ConstraintNotFound` if absent.
    async fn load(&self, id: &ConstraintId) -> Result<ConstraintSpec>;

    /// All consumers in the scope, in registration order.
    async fn load_consumers(&self, scope: &Scope) -> Result<Vec<Consumer>>;

    /// Append `consumer` only if the scope's live snapshot still equals `expected`.
    ///
    /// Returns `Ok(false)` when the snapshot is stale.
    async fn register_consumer(
        &self,
        scope: &Scope,
        consumer: Consumer,
        expected: ScopeSnapshot,
    ) -> Result<bool>;

    /// `Blocked` → `Active`. Returns `Ok(false)` if the consumer was not blocked.
    async fn consumer_unblocked(
        &self,
        scope: &Scope,
        consumer_id: &ConsumerId,
        context: Option<ConsumerContext>,
    ) -> Result<bool>;

    /// `Active` → `Finished`. Returns `Ok(false)` if the consumer was not active.
    async fn consumer_finished(
        &self,
        scope: &Scope,
        consumer_id: &ConsumerId,
        context: Option<ConsumerContext>,
    ) -> Result<bool>;

    /// Whether `existing` and `candidate` must be accounted together by the
    /// pre-registration deadlock check.
    ///
    /// Returning `false` is always legal but forfeits the guarantee that a
    /// request which can never be satisfied is rejected up front. Backends
    /// that track lineage outside the consumer context may look it up here.
    async fn overlapping_scope(&self, existing: &Consumer, candidate: &Consumer) -> Result<bool>;

    /// Called after each stale registration attempt, once the client-side
    /// policy has allowed another try. Distributed backends enforce their own
    /// retry ceiling here.
    async fn adjust_register_consumer_context(
        &self,
        _scope: &Scope,
        _attempt: &RegistrationAttempt,
    ) -> RetryDecision {
        RetryDecision::Continue
    }

    /// Mark `consumer_id` finished and, in the same logical operation, promote
    /// the blocked consumers that `spec`'s strategy now finds runnable.
    async fn finish_and_unblock_consumers(
        &self,
        scope: &Scope,
        spec: ConstraintSpec,
        consumer_id: &ConsumerId,
    ) -> Result<FinishOutcome>;
}
