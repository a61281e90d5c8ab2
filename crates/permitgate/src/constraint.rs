//! Constraint: admission control over a bounded pool of permits.
//!
//! Registration is optimistic:
//! 1. Read the scope's consumers and take a [`ScopeSnapshot`]
//! 2. Decide `Active` or `Blocked` with the constraint's strategy
//! 3. Reject up front if a blocked request can never be satisfied
//! 4. Append through the registry, conditioned on the snapshot
//! 5. On a stale snapshot: jittered sleep, consult the retry policy and the
//!    registry hook, go to 1
//!
//! A blocked consumer holds nothing. It becomes active only when a release
//! runs the unblock cascade ([`Constraint::finish_and_unblock`]).

use std::collections::HashSet;
use std::sync::Arc;

use crate::consumer::{Consumer, ConsumerContext, ConsumerState, active_permits};
use crate::error::{ConstraintError, Result};
use crate::ids::{ConstraintId, ConstraintUnit, ConsumerId, Scope};
use crate::registry::{ConstraintRegistry, FinishOutcome, ScopeSnapshot};
use crate::retry::{Jitter, RandomJitter, RegistrationAttempt, RetryDecision, RetryPolicy};
use crate::runnable::RunnableConsumers;
use crate::strategy::ConstraintSpec;

#[derive(Clone)]
pub struct Constraint {
    id: ConstraintId,
    spec: ConstraintSpec,
    retry: RetryPolicy,
    jitter: Arc<dyn Jitter>,
}

impl std::fmt::Debug for Constraint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Constraint")
            .field("id", &self.id)
            .field("spec", &self.spec)
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

impl Constraint {
    fn new(id: ConstraintId, spec: ConstraintSpec) -> Self {
        Self {
            id,
            spec,
            retry: RetryPolicy::default(),
            jitter: Arc::new(RandomJitter),
        }
    }

    /// Persist a new constraint. Fails with `DuplicateConstraint` if `id` is taken.
    pub async fn create<R>(id: ConstraintId, spec: ConstraintSpec, registry: &R) -> Result<Self>
    where
        R: ConstraintRegistry + ?Sized,
    {
        spec.validate()?;
        registry.save(&id, spec).await?;
        tracing::info!(
            constraint = %id,
            strategy = %spec.strategy,
            limit = spec.limit,
            "Constraint created"
        );
        Ok(Self::new(id, spec))
    }

    /// Rehydrate a previously created constraint. Fails with `ConstraintNotFound`.
    pub async fn load<R>(id: ConstraintId, registry: &R) -> Result<Self>
    where
        R: ConstraintRegistry + ?Sized,
    {
        let spec = registry.load(&id).await?;
        Ok(Self::new(id, spec))
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_jitter(mut self, jitter: impl Jitter + 'static) -> Self {
        self.jitter = Arc::new(jitter);
        self
    }

    pub fn id(&self) -> &ConstraintId {
        &self.id
    }

    pub fn spec(&self) -> ConstraintSpec {
        self.spec
    }

    pub fn scope(&self, unit: &ConstraintUnit) -> Scope {
        Scope::new(self.id.clone(), unit.clone())
    }

    /// Request `permits` in `unit`. Returns the initial state: `Active` or `Blocked`.
    pub async fn register_consumer<R>(
        &self,
        unit: &ConstraintUnit,
        consumer_id: ConsumerId,
        permits: u32,
        context: ConsumerContext,
        registry: &R,
    ) -> Result<ConsumerState>
    where
        R: ConstraintRegistry + ?Sized,
    {
        if permits == 0 || permits > self.spec.limit {
            return Err(ConstraintError::InvalidPermits {
                permits,
                limit: self.spec.limit,
            });
        }

        let scope = self.scope(unit);
        let mut attempts = 0u32;
        loop {
            attempts += 1;

            let consumers = registry.load_consumers(&scope).await?;
            let snapshot = ScopeSnapshot::of(&consumers);
            let state = self
                .spec
                .strategy
                .admit(self.spec.limit, snapshot.used_permits, permits, &consumers);
            let consumer = Consumer::new(consumer_id.clone(), permits, state, context.clone());

            if state == ConsumerState::Blocked {
                self.check_satisfiable(&consumer, &consumers, registry)
                    .await?;
            }

            if registry.register_consumer(&scope, consumer, snapshot).await? {
                tracing::debug!(
                    scope = %scope,
                    consumer_id = %consumer_id,
                    permits,
                    used_permits = snapshot.used_permits,
                    state = %state,
                    attempts,
                    "Consumer registered"
                );
                return Ok(state);
            }

            let Some(ceiling) = self.retry.next_delay(attempts) else {
                return Err(self.exhausted(&scope, consumer_id, attempts));
            };
            tokio::time::sleep(self.jitter.jitter(ceiling)).await;

            let attempt = RegistrationAttempt {
                consumer_id: consumer_id.clone(),
                permits,
                attempt: attempts,
                observed_used_permits: snapshot.used_permits,
            };
            if registry.adjust_register_consumer_context(&scope, &attempt).await
                == RetryDecision::Exhausted
            {
                return Err(self.exhausted(&scope, consumer_id, attempts));
            }
            tracing::debug!(
                scope = %scope,
                consumer_id = %consumer_id,
                attempts,
                "Retrying registration"
            );
        }
    }

    /// Reject a blocked request whose overlapping demand alone exceeds the limit.
    ///
    /// Overlapping peers are the non-finished consumers the registry says must
    /// be accounted together with the candidate. If even they can't fit
    /// alongside it, the candidate would wait forever.
    async fn check_satisfiable<R>(
        &self,
        candidate: &Consumer,
        consumers: &[Consumer],
        registry: &R,
    ) -> Result<()>
    where
        R: ConstraintRegistry + ?Sized,
    {
        let mut demand = u64::from(candidate.permits);
        for existing in consumers.iter().filter(|c| !c.state.is_terminal()) {
            if registry.overlapping_scope(existing, candidate).await? {
                demand += u64::from(existing.permits);
            }
        }

        if demand > u64::from(self.spec.limit) {
            tracing::warn!(
                constraint = %self.id,
                consumer_id = %candidate.id,
                demand,
                limit = self.spec.limit,
                "Consumer permanently blocked by overlapping demand"
            );
            return Err(ConstraintError::PermanentlyBlocked {
                consumer_id: candidate.id.clone(),
                demand,
                limit: self.spec.limit,
            });
        }
        Ok(())
    }

    fn exhausted(&self, scope: &Scope, consumer_id: ConsumerId, attempts: u32) -> ConstraintError {
        tracing::warn!(
            scope = %scope,
            consumer_id = %consumer_id,
            attempts,
            "Registration abandoned under sustained contention"
        );
        ConstraintError::RegistrationExhausted {
            consumer_id,
            attempts,
        }
    }

    /// Live active total and the blocked consumers promotable right now.
    pub async fn runnable_consumers<R>(
        &self,
        unit: &ConstraintUnit,
        registry: &R,
    ) -> Result<RunnableConsumers>
    where
        R: ConstraintRegistry + ?Sized,
    {
        self.get_unblockable_consumers(unit, registry, &HashSet::new())
            .await
    }

    /// Like [`Self::runnable_consumers`], ignoring `exclude` entirely (e.g. a
    /// consumer that has just finished but is not yet persisted as such).
    pub async fn get_unblockable_consumers<R>(
        &self,
        unit: &ConstraintUnit,
        registry: &R,
        exclude: &HashSet<ConsumerId>,
    ) -> Result<RunnableConsumers>
    where
        R: ConstraintRegistry + ?Sized,
    {
        let consumers = registry.load_consumers(&self.scope(unit)).await?;
        Ok(RunnableConsumers::compute(
            self.spec.strategy,
            self.spec.limit,
            &consumers,
            exclude,
        ))
    }

    /// Active permits currently held in `unit`.
    pub async fn used_permits<R>(&self, unit: &ConstraintUnit, registry: &R) -> Result<u64>
    where
        R: ConstraintRegistry + ?Sized,
    {
        let consumers = registry.load_consumers(&self.scope(unit)).await?;
        Ok(active_permits(&consumers))
    }

    /// `Blocked` → `Active`. `Ok(false)` means the state already changed.
    pub async fn consumer_unblocked<R>(
        &self,
        unit: &ConstraintUnit,
        consumer_id: &ConsumerId,
        context: Option<ConsumerContext>,
        registry: &R,
    ) -> Result<bool>
    where
        R: ConstraintRegistry + ?Sized,
    {
        registry
            .consumer_unblocked(&self.scope(unit), consumer_id, context)
            .await
    }

    /// `Active` → `Finished`. `Ok(false)` means the state already changed.
    pub async fn consumer_finished<R>(
        &self,
        unit: &ConstraintUnit,
        consumer_id: &ConsumerId,
        context: Option<ConsumerContext>,
        registry: &R,
    ) -> Result<bool>
    where
        R: ConstraintRegistry + ?Sized,
    {
        registry
            .consumer_finished(&self.scope(unit), consumer_id, context)
            .await
    }

    /// Release `consumer_id` and promote whatever the strategy now allows.
    pub async fn finish_and_unblock<R>(
        &self,
        unit: &ConstraintUnit,
        consumer_id: &ConsumerId,
        registry: &R,
    ) -> Result<FinishOutcome>
    where
        R: ConstraintRegistry + ?Sized,
    {
        registry
            .finish_and_unblock_consumers(&self.scope(unit), self.spec, consumer_id)
            .await
    }
}
