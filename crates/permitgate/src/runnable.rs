//! Which blocked consumers can be promoted right now.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::consumer::{Consumer, active_permits};
use crate::ids::ConsumerId;
use crate::strategy::Strategy;

/// Query result: the live active total and the promotable blocked consumers,
/// in persisted order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunnableConsumers {
    pub used_permits: u64,
    pub consumer_ids: Vec<ConsumerId>,
}

impl RunnableConsumers {
    /// Walk the blocked consumers in order, tentatively admitting each that fits.
    ///
    /// FIFO stops at the first consumer that doesn't fit; ASAP skips it and
    /// keeps going. Consumers in `exclude` count neither as candidates nor
    /// toward the used total.
    pub fn compute(
        strategy: Strategy,
        limit: u32,
        consumers: &[Consumer],
        exclude: &HashSet<ConsumerId>,
    ) -> Self {
        let considered = || consumers.iter().filter(|c| !exclude.contains(&c.id));

        let used_permits = active_permits(considered());
        let mut available = u64::from(limit).saturating_sub(used_permits);
        let mut consumer_ids = Vec::new();

        for consumer in considered().filter(|c| c.is_blocked()) {
            let permits = u64::from(consumer.permits);
            if permits <= available {
                available -= permits;
                consumer_ids.push(consumer.id.clone());
            } else if strategy.stops_at_first_misfit() {
                break;
            }
        }

        Self {
            used_permits,
            consumer_ids,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.consumer_ids.is_empty()
    }
}
