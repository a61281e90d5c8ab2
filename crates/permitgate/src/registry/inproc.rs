//! In-process reference registry.
//!
//! Specs and consumer lists live in DashMaps. The DashMap entry guard for a
//! scope is held across each read-compare-write, so conditional appends and
//! transitions are atomic per scope while unrelated scopes only contend on
//! shard collisions.
//!
//! Intended for single-process deployments and tests. `overlapping_scope` is
//! `false`, which disables the deadlock pre-check, unless a predicate is
//! installed with [`InProcRegistry::with_overlap`].

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use super::{ConstraintRegistry, FinishOutcome, ScopeSnapshot};
use crate::consumer::{Consumer, ConsumerContext, ConsumerState};
use crate::error::{ConstraintError, Result};
use crate::ids::{ConstraintId, ConsumerId, Scope};
use crate::runnable::RunnableConsumers;
use crate::strategy::ConstraintSpec;

/// Overlap predicate: `(existing, candidate)`.
pub type OverlapFn = Arc<dyn Fn(&Consumer, &Consumer) -> bool + Send + Sync>;

#[derive(Default)]
pub struct InProcRegistry {
    specs: DashMap<ConstraintId, ConstraintSpec>,
    scopes: DashMap<Scope, Vec<Consumer>>,
    overlap: Option<OverlapFn>,
}

impl InProcRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install an overlap predicate for the deadlock pre-check.
    pub fn with_overlap(
        mut self,
        overlap: impl Fn(&Consumer, &Consumer) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.overlap = Some(Arc::new(overlap));
        self
    }

    /// Number of scopes that have seen at least one registration.
    pub fn scope_count(&self) -> usize {
        self.scopes.len()
    }

    fn transition(
        &self,
        scope: &Scope,
        consumer_id: &ConsumerId,
        expected: ConsumerState,
        next: ConsumerState,
        context: Option<&ConsumerContext>,
    ) -> bool {
        let Some(mut consumers) = self.scopes.get_mut(scope) else {
            return false;
        };
        let changed = consumers
            .iter_mut()
            .find(|c| &c.id == consumer_id)
            .is_some_and(|c| c.transition(expected, next, context));

        if !changed {
            tracing::debug!(
                scope = %scope,
                consumer_id = %consumer_id,
                expected = %expected,
                next = %next,
                "Consumer state changed concurrently - transition skipped"
            );
        }
        changed
    }
}

impl std::fmt::Debug for InProcRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InProcRegistry")
            .field("constraints", &self.specs.len())
            .field("scopes", &self.scopes.len())
            .field("overlap", &self.overlap.is_some())
            .finish()
    }
}

#[async_trait]
impl ConstraintRegistry for InProcRegistry {
    async fn save(&self, id: &ConstraintId, spec: ConstraintSpec) -> Result<()> {
        match self.specs.entry(id.clone()) {
            Entry::Occupied(_) => Err(ConstraintError::DuplicateConstraint(id.clone())),
            Entry::Vacant(slot) => {
                slot.insert(spec);
                Ok(())
            }
        }
    }

    async fn load(&self, id: &ConstraintId) -> Result<ConstraintSpec> {
        self.specs
            .get(id)
            .map(|spec| *spec.value())
            .ok_or_else(|| ConstraintError::ConstraintNotFound(id.clone()))
    }

    async fn load_consumers(&self, scope: &Scope) -> Result<Vec<Consumer>> {
        Ok(self
            .scopes
            .get(scope)
            .map(|consumers| consumers.value().clone())
            .unwrap_or_default())
    }

    async fn register_consumer(
        &self,
        scope: &Scope,
        consumer: Consumer,
        expected: ScopeSnapshot,
    ) -> Result<bool> {
        let mut consumers = self.scopes.entry(scope.clone()).or_default();

        if consumers.iter().any(|c| c.id == consumer.id) {
            return Err(ConstraintError::DuplicateConsumer {
                scope: scope.clone(),
                consumer_id: consumer.id,
            });
        }

        let live = ScopeSnapshot::of(consumers.as_slice());
        if live != expected {
            tracing::debug!(
                scope = %scope,
                consumer_id = %consumer.id,
                expected_used = expected.used_permits,
                live_used = live.used_permits,
                expected_blocked = expected.blocked,
                live_blocked = live.blocked,
                "Stale scope snapshot - registration rejected"
            );
            return Ok(false);
        }

        consumers.push(consumer);
        Ok(true)
    }

    async fn consumer_unblocked(
        &self,
        scope: &Scope,
        consumer_id: &ConsumerId,
        context: Option<ConsumerContext>,
    ) -> Result<bool> {
        Ok(self.transition(
            scope,
            consumer_id,
            ConsumerState::Blocked,
            ConsumerState::Active,
            context.as_ref(),
        ))
    }

    async fn consumer_finished(
        &self,
        scope: &Scope,
        consumer_id: &ConsumerId,
        context: Option<ConsumerContext>,
    ) -> Result<bool> {
        Ok(self.transition(
            scope,
            consumer_id,
            ConsumerState::Active,
            ConsumerState::Finished,
            context.as_ref(),
        ))
    }

    async fn overlapping_scope(&self, existing: &Consumer, candidate: &Consumer) -> Result<bool> {
        Ok(self
            .overlap
            .as_ref()
            .is_some_and(|overlap| overlap(existing, candidate)))
    }

    async fn finish_and_unblock_consumers(
        &self,
        scope: &Scope,
        spec: ConstraintSpec,
        consumer_id: &ConsumerId,
    ) -> Result<FinishOutcome> {
        let Some(mut consumers) = self.scopes.get_mut(scope) else {
            return Ok(FinishOutcome::default());
        };

        let finished = consumers
            .iter_mut()
            .find(|c| &c.id == consumer_id)
            .is_some_and(|c| c.transition(ConsumerState::Active, ConsumerState::Finished, None));
        if !finished {
            tracing::debug!(
                scope = %scope,
                consumer_id = %consumer_id,
                "Consumer not active - nothing to finish"
            );
            return Ok(FinishOutcome::default());
        }

        let runnable = RunnableConsumers::compute(
            spec.strategy,
            spec.limit,
            consumers.as_slice(),
            &HashSet::new(),
        );
        for consumer in consumers
            .iter_mut()
            .filter(|c| runnable.consumer_ids.contains(&c.id))
        {
            consumer.transition(ConsumerState::Blocked, ConsumerState::Active, None);
        }

        if !runnable.is_empty() {
            tracing::info!(
                scope = %scope,
                finished = %consumer_id,
                promoted = runnable.consumer_ids.len(),
                "Unblocked consumers after release"
            );
        }

        Ok(FinishOutcome {
            finished: true,
            unblocked: runnable.consumer_ids,
        })
    }
}
