use thiserror::Error;

use crate::ids::{ConstraintId, ConsumerId, Scope};

#[derive(Debug, Error)]
pub enum ConstraintError {
    #[error("invalid permits {permits}: must be between 1 and the constraint limit {limit}")]
    InvalidPermits { permits: u32, limit: u32 },

    #[error("invalid limit {0}: must be positive")]
    InvalidLimit(u32),

    #[error("constraint {0} already exists")]
    DuplicateConstraint(ConstraintId),

    #[error("constraint {0} not found")]
    ConstraintNotFound(ConstraintId),

    #[error("consumer {consumer_id} is already registered in {scope}")]
    DuplicateConsumer { scope: Scope, consumer_id: ConsumerId },

    #[error(
        "consumer {consumer_id} can never be admitted: overlapping demand of {demand} permits exceeds limit {limit}"
    )]
    PermanentlyBlocked {
        consumer_id: ConsumerId,
        demand: u64,
        limit: u32,
    },

    #[error("registration of consumer {consumer_id} abandoned after {attempts} attempts under contention")]
    RegistrationExhausted { consumer_id: ConsumerId, attempts: u32 },

    #[error("registry backend failure: {0}")]
    Registry(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl ConstraintError {
    /// Whether resubmitting the same request may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::RegistrationExhausted { .. } | Self::Registry(_))
    }
}

pub type Result<T> = std::result::Result<T, ConstraintError>;
