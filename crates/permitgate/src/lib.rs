//! permitgate: permit-based admission control over pluggable registries.
//!
//! A [`Constraint`] bounds the permits concurrently held by [`Consumer`]s in
//! each scope. Storage and atomicity come from a [`ConstraintRegistry`];
//! [`InProcRegistry`] is the in-process reference implementation.

mod consumer;
mod constraint;
mod error;
mod ids;
mod retry;
mod runnable;
mod strategy;

pub mod registry;

pub use constraint::Constraint;
pub use consumer::{Consumer, ConsumerContext, ConsumerState, active_permits};
pub use error::{ConstraintError, Result};
pub use ids::{ConstraintId, ConstraintUnit, ConsumerId, Scope};
pub use registry::{ConstraintRegistry, FinishOutcome, InProcRegistry, ScopeSnapshot};
pub use retry::{Jitter, NoJitter, RandomJitter, RegistrationAttempt, RetryDecision, RetryPolicy};
pub use runnable::RunnableConsumers;
pub use strategy::{ConstraintSpec, Strategy};
