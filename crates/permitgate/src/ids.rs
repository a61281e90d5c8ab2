//! Opaque identifiers for constraints, units, and consumers.

use serde::{Deserialize, Serialize};

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(id: &str) -> Self {
                Self(id.to_string())
            }
        }

        impl From<String> for $name {
            fn from(id: String) -> Self {
                Self(id)
            }
        }
    };
}

string_id!(
    /// Identifies a constraint (its limit and strategy).
    ConstraintId
);

string_id!(
    /// Partitions a constraint: permits are limited independently per unit.
    ConstraintUnit
);

string_id!(
    /// Identifies one permit request within a scope.
    ConsumerId
);

impl ConsumerId {
    /// Random consumer id for callers without a natural key.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

/// A `(constraint, unit)` pair. Limits are enforced per scope.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Scope {
    pub constraint_id: ConstraintId,
    pub unit: ConstraintUnit,
}

impl Scope {
    pub fn new(constraint_id: ConstraintId, unit: ConstraintUnit) -> Self {
        Self {
            constraint_id,
            unit,
        }
    }
}

impl std::fmt::Display for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.constraint_id, self.unit)
    }
}
