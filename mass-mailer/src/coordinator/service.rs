//! The liveness coordinator service.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::balance::compute_balance_factor;
use super::owned::{OwnedRangeSet, SharedRangeSet};
use crate::Result;
use crate::database::time::now_ms;
use crate::registry::{ClaimOutcome, HashRange, WorkerId, WorkerRecord, WorkerRegistry, WorkerState};

/// Default heartbeat period in milliseconds.
pub const DEFAULT_PERIOD_MS: u64 = 5_000;

/// Default number of periods without a heartbeat before a peer counts as non-working.
pub const DEFAULT_SYNCHRONIZING_ROUND: u32 = 5;

/// Coordinator configuration.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Heartbeat period in milliseconds.
    pub period_ms: u64,
    /// Dead-worker resolution runs every `synchronizing_round` ticks, and a
    /// heartbeat older than `synchronizing_round * period` is stale.
    pub synchronizing_round: u32,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            period_ms: DEFAULT_PERIOD_MS,
            synchronizing_round: DEFAULT_SYNCHRONIZING_ROUND,
        }
    }
}

impl CoordinatorConfig {
    pub fn period(&self) -> Duration {
        Duration::from_millis(self.period_ms)
    }

    pub fn stale_after_ms(&self) -> i64 {
        (self.period_ms as i64).saturating_mul(i64::from(self.synchronizing_round))
    }
}

/// What a tick left the worker doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    Continued,
    /// The worker found its own record substituted and dropped every range.
    Demoted,
}

/// Snapshot of the registry as seen from one worker.
struct RegistryView {
    non_working: Vec<WorkerRecord>,
    working: usize,
    /// Records substituted by this worker, by id.
    mine: BTreeMap<WorkerId, HashRange>,
}

impl RegistryView {
    fn new(workers: Vec<WorkerRecord>, me: WorkerId, now: i64, stale_after_ms: i64) -> Self {
        let total = workers.len();
        let mine = workers
            .iter()
            .filter(|w| w.substitute == Some(me))
            .map(|w| (w.id, w.range()))
            .collect();
        let non_working: Vec<WorkerRecord> = workers
            .into_iter()
            .filter(|w| w.id != me && w.is_non_working(now, stale_after_ms))
            .collect();
        Self {
            working: total - non_working.len(),
            non_working,
            mine,
        }
    }

    fn balance_factor(&self) -> i64 {
        compute_balance_factor(self.non_working.len(), self.working, self.mine.len())
    }
}

/// Per-worker liveness and substitution coordinator.
pub struct LivenessCoordinator {
    worker_id: WorkerId,
    registry: Arc<dyn WorkerRegistry>,
    owned: SharedRangeSet,
    config: CoordinatorConfig,
    ticks: AtomicU64,
}

impl LivenessCoordinator {
    pub fn new(
        worker_id: WorkerId,
        own_range: HashRange,
        registry: Arc<dyn WorkerRegistry>,
        config: CoordinatorConfig,
    ) -> Self {
        Self {
            worker_id,
            registry,
            owned: OwnedRangeSet::shared(own_range),
            config,
            ticks: AtomicU64::new(0),
        }
    }

    pub fn worker_id(&self) -> WorkerId {
        self.worker_id
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    /// Handle to the ranges this worker currently drains.
    pub fn owned_ranges(&self) -> SharedRangeSet {
        self.owned.clone()
    }

    /// Snapshot of the ranges to drain in the next sender iteration.
    pub fn active_ranges(&self) -> Vec<HashRange> {
        self.owned.read().ranges()
    }

    async fn view(&self, now: i64) -> Result<RegistryView> {
        let workers = self.registry.list_workers().await?;
        Ok(RegistryView::new(
            workers,
            self.worker_id,
            now,
            self.config.stale_after_ms(),
        ))
    }

    /// Announce this worker and wait until no peer substitutes it.
    ///
    /// Returns `false` if cancelled before the worker became WORKING.
    pub async fn start(&self, cancel: &CancellationToken) -> Result<bool> {
        self.registry.report_alive(self.worker_id, now_ms()).await?;
        self.registry
            .set_state(self.worker_id, WorkerState::Synchronizing)
            .await?;
        info!(worker_id = self.worker_id, "Worker synchronizing");
        Ok(self.wait_until_unsubstituted(cancel).await)
    }

    /// Poll until the own record has no substitute, then become WORKING.
    ///
    /// While waiting the deadlock-break check runs every
    /// `synchronizing_round` polls. Returns `false` if cancelled.
    pub async fn wait_until_unsubstituted(&self, cancel: &CancellationToken) -> bool {
        let mut polls: u64 = 0;
        loop {
            match self.poll_startup(polls).await {
                Ok(true) => return true,
                Ok(false) => {}
                Err(e) => warn!(
                    worker_id = self.worker_id,
                    error = %e,
                    "Startup poll failed, retrying"
                ),
            }
            polls += 1;

            tokio::select! {
                _ = cancel.cancelled() => return false,
                _ = tokio::time::sleep(self.config.period()) => {}
            }
        }
    }

    async fn poll_startup(&self, polls: u64) -> Result<bool> {
        let now = now_ms();
        self.registry.report_alive(self.worker_id, now).await?;
        let me = self.registry.get_worker(self.worker_id).await?;

        match me.substitute {
            None => {
                self.registry
                    .set_state(self.worker_id, WorkerState::Working)
                    .await?;
                self.owned.write().activate_own();
                info!(
                    worker_id = self.worker_id,
                    range = %me.range(),
                    "Worker is now WORKING"
                );
                Ok(true)
            }
            Some(substitute) => {
                debug!(
                    worker_id = self.worker_id,
                    substitute, "Waiting for substitute to release own range"
                );
                let round = u64::from(self.config.synchronizing_round.max(1));
                if polls > 0 && polls % round == 0 {
                    return self.break_deadlock_if_needed(now).await;
                }
                Ok(false)
            }
        }
    }

    /// Run the registry deadlock break; on success this worker is WORKING
    /// with no substitutions.
    pub async fn break_deadlock_if_needed(&self, now: i64) -> Result<bool> {
        let reset = self
            .registry
            .break_deadlock(self.worker_id, now, self.config.stale_after_ms())
            .await?;
        if reset {
            let mut owned = self.owned.write();
            owned.clear_substitutes();
            owned.activate_own();
        }
        Ok(reset)
    }

    /// One heartbeat period.
    pub async fn tick(&self, now: i64) -> Result<TickOutcome> {
        self.registry.report_alive(self.worker_id, now).await?;
        let me = self.registry.get_worker(self.worker_id).await?;

        if let Some(substitute) = me.substitute {
            self.demote(substitute).await?;
            return Ok(TickOutcome::Demoted);
        }

        let state = me.worker_state();
        if state != Some(WorkerState::Working) {
            self.rejoin(state).await?;
        }

        let tick = self.ticks.fetch_add(1, Ordering::SeqCst) + 1;
        let round = u64::from(self.config.synchronizing_round.max(1));
        if tick % round == 0 {
            if let Err(e) = self.resolve_dead_workers(now).await {
                warn!(worker_id = self.worker_id, error = %e, "Failed to resolve dead workers");
            }
        }

        if let Err(e) = self.release_redundant_substitutions(now).await {
            warn!(worker_id = self.worker_id, error = %e, "Failed to release redundant substitutions");
        }

        if let Err(e) = self.reconcile().await {
            warn!(worker_id = self.worker_id, error = %e, "Failed to reconcile owned ranges");
        }

        Ok(TickOutcome::Continued)
    }

    /// Claim up to a fair share of unsubstituted non-working peers.
    ///
    /// Returns the number of ranges taken over.
    pub async fn resolve_dead_workers(&self, now: i64) -> Result<usize> {
        let view = self.view(now).await?;
        if view.non_working.is_empty() {
            return Ok(0);
        }

        let mut balance = view.balance_factor();
        let pool_size = (view.non_working.len() + view.working) as i64;
        let mut candidates: Vec<&WorkerRecord> = view
            .non_working
            .iter()
            .filter(|w| w.substitute.is_none())
            .collect();
        // Start after our own slot so concurrent claimers spread out.
        candidates.sort_by_key(|w| (w.id - self.worker_id).rem_euclid(pool_size.max(1)));

        let mut claimed = 0;
        for candidate in candidates {
            if balance <= 0 {
                break;
            }
            match self.registry.try_claim(candidate, self.worker_id).await {
                Ok(ClaimOutcome::Claimed { range, freed }) => {
                    self.owned.write().add_substitute(candidate.id, range);
                    balance -= 1;
                    claimed += 1;
                    info!(
                        worker_id = self.worker_id,
                        substituted = candidate.id,
                        range = %range,
                        freed,
                        "Took over range of non-working worker"
                    );
                }
                Ok(ClaimOutcome::Lost) => {
                    debug!(
                        worker_id = self.worker_id,
                        candidate = candidate.id,
                        "Claim race lost, skipping"
                    );
                }
                Err(e) => {
                    warn!(
                        worker_id = self.worker_id,
                        candidate = candidate.id,
                        error = %e,
                        "Claim failed"
                    );
                }
            }
        }
        Ok(claimed)
    }

    /// Give back substitutions beyond the fair share.
    ///
    /// Returns the number of ranges released.
    pub async fn release_redundant_substitutions(&self, now: i64) -> Result<usize> {
        let view = self.view(now).await?;
        let balance = view.balance_factor();
        if balance >= 0 {
            return Ok(0);
        }

        let excess = balance.unsigned_abs() as usize;
        let ids: Vec<WorkerId> = view.mine.keys().rev().take(excess).copied().collect();
        self.release(&ids, "Released redundant substitution").await
    }

    /// Release every substituted record whose owner is back and SYNCHRONIZING.
    pub async fn release_synchronizing_workers(&self) -> Result<usize> {
        let workers = self.registry.list_workers().await?;
        let ids: Vec<WorkerId> = workers
            .iter()
            .filter(|w| {
                w.substitute == Some(self.worker_id)
                    && w.worker_state() == Some(WorkerState::Synchronizing)
            })
            .map(|w| w.id)
            .collect();
        self.release(&ids, "Released range to synchronizing worker").await
    }

    async fn release(&self, ids: &[WorkerId], message: &'static str) -> Result<usize> {
        if ids.is_empty() {
            return Ok(0);
        }
        self.registry.release(ids, self.worker_id).await?;

        let mut owned = self.owned.write();
        for id in ids {
            if let Some(range) = owned.remove_substitute(*id) {
                info!(worker_id = self.worker_id, released = *id, range = %range, "{}", message);
            }
        }
        Ok(ids.len())
    }

    /// Align the in-memory substitutions with the registry.
    ///
    /// Entries whose record no longer names this worker are dropped; records
    /// naming this worker that are missing in memory (left by a previous run
    /// of the same worker id) are adopted.
    pub async fn reconcile(&self) -> Result<()> {
        let workers = self.registry.list_workers().await?;
        let in_registry: BTreeMap<WorkerId, HashRange> = workers
            .iter()
            .filter(|w| w.substitute == Some(self.worker_id))
            .map(|w| (w.id, w.range()))
            .collect();

        let mut owned = self.owned.write();
        if !owned.is_own_active() {
            return Ok(());
        }

        for id in owned.substitute_ids() {
            if !in_registry.contains_key(&id) {
                owned.remove_substitute(id);
                info!(
                    worker_id = self.worker_id,
                    dropped = id,
                    "Dropped range no longer substituted by this worker"
                );
            }
        }
        for (id, range) in in_registry {
            if owned.add_substitute(id, range) {
                info!(
                    worker_id = self.worker_id,
                    adopted = id,
                    range = %range,
                    "Adopted substitution recorded in registry"
                );
            }
        }
        Ok(())
    }

    /// Own record is unsubstituted but not WORKING, e.g. after a peer's
    /// deadlock break forced it DEAD.
    async fn rejoin(&self, state: Option<WorkerState>) -> Result<()> {
        self.registry
            .set_state(self.worker_id, WorkerState::Working)
            .await?;
        self.owned.write().activate_own();
        warn!(
            worker_id = self.worker_id,
            previous = ?state,
            "Own record was not WORKING without a substitute, rejoined as WORKING"
        );
        Ok(())
    }

    /// A peer presumed this worker dead: stop draining and wait for release.
    async fn demote(&self, substitute: WorkerId) -> Result<()> {
        self.owned.write().deactivate();
        warn!(
            worker_id = self.worker_id,
            substitute, "Own range was taken over, demoting to SYNCHRONIZING"
        );

        let workers = self.registry.list_workers().await?;
        let leftover: Vec<WorkerId> = workers
            .iter()
            .filter(|w| w.substitute == Some(self.worker_id))
            .map(|w| w.id)
            .collect();
        if !leftover.is_empty() {
            if let Err(e) = self.registry.release(&leftover, self.worker_id).await {
                warn!(worker_id = self.worker_id, error = %e, "Failed to release leftover substitutions");
            }
        }

        self.registry
            .set_state(self.worker_id, WorkerState::Synchronizing)
            .await
    }

    /// Heartbeat loop until cancelled.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.config.period());
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(
            worker_id = self.worker_id,
            period_ms = self.config.period_ms,
            "Liveness coordinator started"
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {}
            }

            match self.tick(now_ms()).await {
                Ok(TickOutcome::Continued) => {}
                Ok(TickOutcome::Demoted) => {
                    if !self.wait_until_unsubstituted(&cancel).await {
                        break;
                    }
                }
                Err(e) => warn!(worker_id = self.worker_id, error = %e, "Liveness tick failed"),
            }
        }

        info!(worker_id = self.worker_id, "Liveness coordinator stopped");
    }
}
