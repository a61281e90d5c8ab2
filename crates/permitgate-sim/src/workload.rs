//! Concurrent workload against one constraint in the in-process registry.
//!
//! Every simulated consumer is a task. Active consumers hold their permits for
//! a random time, then release through the unblock cascade. Blocked consumers
//! park on a `Notify` until a cascade promotes them.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use anyhow::{Context, bail};
use dashmap::DashMap;
use rand::Rng;
use serde::Serialize;
use tokio::sync::Notify;

use permitgate::{
    Constraint, ConstraintError, ConstraintRegistry, ConstraintSpec, ConstraintUnit,
    ConsumerContext, ConsumerId, ConsumerState, InProcRegistry, Strategy,
};

#[derive(Debug, Clone)]
pub struct SimConfig {
    pub strategy: Strategy,
    pub limit: u32,
    pub consumers: u32,
    pub max_permits: u32,
    pub hold: Duration,
    pub units: u32,
    pub timeout: Duration,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            strategy: Strategy::Asap,
            limit: 10,
            consumers: 200,
            max_permits: 4,
            hold: Duration::from_millis(5),
            units: 2,
            timeout: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct SimReport {
    pub strategy: Strategy,
    pub limit: u32,
    pub consumers: u32,
    pub admitted_on_register: u64,
    pub blocked_on_register: u64,
    pub promoted: u64,
    pub exhausted: u64,
    pub permanently_blocked: u64,
    /// Observations where a scope held more than `limit` active permits. Always 0.
    pub violations: u64,
    pub peak_active_permits: BTreeMap<String, u64>,
    pub elapsed_ms: u128,
}

#[derive(Default)]
struct Stats {
    admitted: AtomicU64,
    blocked: AtomicU64,
    promoted: AtomicU64,
    exhausted: AtomicU64,
    permanently_blocked: AtomicU64,
    violations: AtomicU64,
    peaks: DashMap<ConstraintUnit, u64>,
}

struct Workload {
    constraint: Constraint,
    registry: Arc<InProcRegistry>,
    waiters: DashMap<ConsumerId, Arc<Notify>>,
    stats: Stats,
    hold: Duration,
}

impl Workload {
    async fn run_consumer(
        &self,
        unit: ConstraintUnit,
        index: u32,
        permits: u32,
    ) -> anyhow::Result<()> {
        let id = ConsumerId::generate();
        let wake = Arc::new(Notify::new());
        // Registered before the request so a promotion can't race past us.
        self.waiters.insert(id.clone(), Arc::clone(&wake));

        let mut context = ConsumerContext::new();
        context.insert("index".into(), serde_json::json!(index));

        let registered = self
            .constraint
            .register_consumer(&unit, id.clone(), permits, context, self.registry.as_ref())
            .await;

        match registered {
            Ok(ConsumerState::Active) => {
                self.stats.admitted.fetch_add(1, Ordering::Relaxed);
            }
            Ok(ConsumerState::Blocked) => {
                self.stats.blocked.fetch_add(1, Ordering::Relaxed);
                wake.notified().await;
            }
            Ok(ConsumerState::Finished) => bail!("consumer {id} registered as finished"),
            Err(ConstraintError::RegistrationExhausted { .. }) => {
                self.stats.exhausted.fetch_add(1, Ordering::Relaxed);
                self.waiters.remove(&id);
                return Ok(());
            }
            Err(ConstraintError::PermanentlyBlocked { .. }) => {
                self.stats.permanently_blocked.fetch_add(1, Ordering::Relaxed);
                self.waiters.remove(&id);
                return Ok(());
            }
            Err(e) => return Err(e).with_context(|| format!("registering consumer {id}")),
        }
        self.waiters.remove(&id);
        self.observe(&unit).await?;

        let hold_us = u64::try_from(self.hold.as_micros()).unwrap_or(u64::MAX);
        let held = Duration::from_micros(rand::rng().random_range(0..=hold_us));
        tokio::time::sleep(held).await;

        let outcome = self
            .constraint
            .finish_and_unblock(&unit, &id, self.registry.as_ref())
            .await
            .with_context(|| format!("releasing consumer {id}"))?;
        if !outcome.finished {
            bail!("consumer {id} was not active at release");
        }

        for promoted in &outcome.unblocked {
            self.stats.promoted.fetch_add(1, Ordering::Relaxed);
            match self.waiters.get(promoted) {
                Some(waiter) => waiter.notify_one(),
                None => tracing::warn!(consumer_id = %promoted, "Promoted consumer has no waiter"),
            }
        }
        self.observe(&unit).await
    }

    async fn observe(&self, unit: &ConstraintUnit) -> anyhow::Result<()> {
        let consumers = self
            .registry
            .load_consumers(&self.constraint.scope(unit))
            .await?;
        let used = permitgate::active_permits(&consumers);

        if used > u64::from(self.constraint.spec().limit) {
            self.stats.violations.fetch_add(1, Ordering::Relaxed);
            tracing::error!(unit = %unit, used, "Scope oversubscribed");
        }
        let mut peak = self.stats.peaks.entry(unit.clone()).or_insert(0);
        *peak = (*peak).max(used);
        Ok(())
    }
}

pub async fn run(config: SimConfig) -> anyhow::Result<SimReport> {
    if config.max_permits == 0 || config.max_permits > config.limit {
        bail!(
            "--max-permits must be between 1 and --limit ({}), got {}",
            config.limit,
            config.max_permits
        );
    }
    if config.units == 0 {
        bail!("--units must be at least 1");
    }

    let registry = Arc::new(InProcRegistry::new());
    let constraint = Constraint::create(
        "sim".into(),
        ConstraintSpec::new(config.strategy, config.limit),
        registry.as_ref(),
    )
    .await?;

    let workload = Arc::new(Workload {
        constraint,
        registry,
        waiters: DashMap::new(),
        stats: Stats::default(),
        hold: config.hold,
    });

    let started = Instant::now();
    let tasks: Vec<_> = (0..config.consumers)
        .map(|index| {
            let workload = Arc::clone(&workload);
            let unit = ConstraintUnit::new(format!("unit-{}", index % config.units));
            let permits = rand::rng().random_range(1..=config.max_permits);
            tokio::spawn(async move { workload.run_consumer(unit, index, permits).await })
        })
        .collect();

    let joined = tokio::time::timeout(config.timeout, futures::future::join_all(tasks))
        .await
        .context("workload did not drain before the timeout")?;
    for result in joined {
        result.context("consumer task panicked")??;
    }

    let stats = &workload.stats;
    let report = SimReport {
        strategy: config.strategy,
        limit: config.limit,
        consumers: config.consumers,
        admitted_on_register: stats.admitted.load(Ordering::Relaxed),
        blocked_on_register: stats.blocked.load(Ordering::Relaxed),
        promoted: stats.promoted.load(Ordering::Relaxed),
        exhausted: stats.exhausted.load(Ordering::Relaxed),
        permanently_blocked: stats.permanently_blocked.load(Ordering::Relaxed),
        violations: stats.violations.load(Ordering::Relaxed),
        peak_active_permits: stats
            .peaks
            .iter()
            .map(|entry| (entry.key().to_string(), *entry.value()))
            .collect(),
        elapsed_ms: started.elapsed().as_millis(),
    };
    tracing::info!(
        admitted = report.admitted_on_register,
        blocked = report.blocked_on_register,
        promoted = report.promoted,
        elapsed_ms = report.elapsed_ms,
        "Workload drained"
    );
    Ok(report)
}
