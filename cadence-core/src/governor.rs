//! The governor tick: reap, plan, claim, fetch, score.
//!
//! A tick holds no state between runs. Concurrent or redundant ticks are
//! safe because every transition goes through a conditional update on the
//! queue store.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::adapter::GovernedUnit;
use crate::backfill::{BackfillPlan, BackfillPolicy, plan_next_window};
use crate::config::GovernorConfig;
use crate::error::Result;
use crate::executor::{BatchOutcome, FetchExecutor};
use crate::lease::{LeaseManager, ReviveOutcome};
use crate::scoring::{ScoreTrigger, ScoringCollaborator, TriggerOutcome};
use crate::store::{EnqueueOutcome, GovernorStore};
use crate::types::{QueueCounts, QueueItem, QueueStatus};

/// Summary of one tick, logged and returned to the caller.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct TickReport {
    pub started_at: Option<DateTime<Utc>>,
    /// `max_concurrent - running` after reaping. Zero or negative means the
    /// tick claimed nothing.
    pub capacity: i64,
    pub reaped: usize,
    pub enqueued: usize,
    pub claimed: usize,
    pub lost_claims: usize,
    pub completed: usize,
    pub fetch_failures: usize,
    pub poisoned: usize,
    /// Units skipped because they already had a running item.
    pub busy_units: usize,
    /// Units whose history already reaches the retention horizon.
    pub idle_units: usize,
    pub stored: usize,
    pub duplicates: usize,
    pub scores_written: usize,
    pub scoring_failures: usize,
}

/// What happened to one claimed item.
struct ItemRun {
    batch: Option<BatchOutcome>,
    scores_written: usize,
    scoring_failures: usize,
}

/// Where a unit stands before claiming.
enum UnitState {
    Claimable(QueueItem),
    Busy,
    Idle,
    Contended,
}

pub struct Governor<S> {
    store: Arc<S>,
    config: GovernorConfig,
    units: Vec<GovernedUnit>,
    leases: LeaseManager<S>,
    executor: FetchExecutor<S>,
    scoring: Option<ScoreTrigger<S>>,
}

impl<S> std::fmt::Debug for Governor<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Governor")
            .field("units", &self.units.len())
            .field("config", &self.config)
            .field("scoring", &self.scoring.is_some())
            .finish()
    }
}

impl<S: GovernorStore> Governor<S> {
    pub fn new(
        store: Arc<S>,
        config: GovernorConfig,
        units: Vec<GovernedUnit>,
        scorer: Option<Arc<dyn ScoringCollaborator>>,
    ) -> Self {
        let scoring = scorer
            .filter(|_| config.scoring.enabled)
            .map(|scorer| {
                ScoreTrigger::new(Arc::clone(&store), scorer, config.scoring.clone())
            });
        Self {
            leases: LeaseManager::new(Arc::clone(&store)),
            executor: FetchExecutor::new(Arc::clone(&store), config.queue.page_size),
            store,
            config,
            units,
            scoring,
        }
    }

    pub fn config(&self) -> &GovernorConfig {
        &self.config
    }

    pub fn units(&self) -> &[GovernedUnit] {
        &self.units
    }

    pub async fn status_counts(&self) -> Result<QueueCounts> {
        self.store.status_counts().await
    }

    /// Run one tick against the wall clock.
    pub async fn tick(&self) -> Result<TickReport> {
        self.tick_at(Utc::now()).await
    }

    /// Run one tick as of `now`.
    pub async fn tick_at(&self, now: DateTime<Utc>) -> Result<TickReport> {
        let mut report = TickReport {
            started_at: Some(now),
            ..TickReport::default()
        };

        report.reaped = self
            .leases
            .reap_expired(self.config.lease.timeout(), now)
            .await?
            .len();

        report.capacity = self
            .leases
            .available_capacity(self.config.queue.max_concurrent)
            .await?;
        let capacity = usize::try_from(report.capacity).unwrap_or(0);
        if capacity == 0 {
            info!(
                capacity = report.capacity,
                reaped = report.reaped,
                "queue saturated; no new claims this tick"
            );
            return Ok(report);
        }

        let policy = BackfillPolicy::from_config(&self.config.backfill, now);
        let mut claimed: Vec<(QueueItem, GovernedUnit)> = Vec::new();
        for (unit, items) in self.units_by_last_served().await? {
            if claimed.len() >= capacity {
                break;
            }

            match self
                .prepare_unit(unit, items, &policy, now, &mut report)
                .await?
            {
                UnitState::Claimable(item) => {
                    if self.leases.claim(item.id, now).await? {
                        report.claimed += 1;
                        let mut item = item;
                        item.status = QueueStatus::Running;
                        item.started_at = Some(now);
                        claimed.push((item, unit.clone()));
                    } else {
                        report.lost_claims += 1;
                    }
                }
                UnitState::Busy => report.busy_units += 1,
                UnitState::Idle => report.idle_units += 1,
                UnitState::Contended => report.lost_claims += 1,
            }
        }

        let runs: Vec<ItemRun> = futures::stream::iter(claimed)
            .map(|(item, unit)| self.run_item(item, unit, now))
            .buffer_unordered(capacity)
            .collect()
            .await;

        for run in runs {
            match run.batch {
                Some(batch) => {
                    if batch.completed {
                        report.completed += 1;
                    }
                    report.stored += batch.stored;
                    report.duplicates += batch.duplicates;
                }
                None => report.fetch_failures += 1,
            }
            report.scores_written += run.scores_written;
            report.scoring_failures += run.scoring_failures;
        }

        info!(
            reaped = report.reaped,
            capacity = report.capacity,
            enqueued = report.enqueued,
            claimed = report.claimed,
            completed = report.completed,
            fetch_failures = report.fetch_failures,
            poisoned = report.poisoned,
            stored = report.stored,
            scores_written = report.scores_written,
            "governor tick finished"
        );
        Ok(report)
    }

    /// Units paired with their queue items, least recently served first, so
    /// that units take turns when capacity is below the unit count.
    async fn units_by_last_served(&self) -> Result<Vec<(&GovernedUnit, Vec<QueueItem>)>> {
        let mut ordered = Vec::with_capacity(self.units.len());
        for unit in &self.units {
            let items = self.store.items_for_unit(&unit.key()).await?;
            let last_served = items
                .iter()
                .map(|item| item.started_at.unwrap_or(item.created_at))
                .max();
            ordered.push((last_served, unit, items));
        }
        // Stable: ties keep configuration order.
        ordered.sort_by_key(|(last_served, _, _)| *last_served);
        Ok(ordered
            .into_iter()
            .map(|(_, unit, items)| (unit, items))
            .collect())
    }

    /// Find or create the pending item a unit should work on next.
    async fn prepare_unit(
        &self,
        unit: &GovernedUnit,
        items: Vec<QueueItem>,
        policy: &BackfillPolicy,
        now: DateTime<Utc>,
        report: &mut TickReport,
    ) -> Result<UnitState> {
        let key = unit.key();

        if items.iter().any(|item| item.status == QueueStatus::Running) {
            debug!(unit = %key, "unit already has a running item");
            return Ok(UnitState::Busy);
        }

        let mut pending = items
            .iter()
            .find(|item| item.status == QueueStatus::Pending)
            .cloned();

        for errored in items.iter().filter(|item| item.status == QueueStatus::Error) {
            match self
                .leases
                .revive_errored(errored, self.config.lease.max_attempts)
                .await?
            {
                // Stays in `error`; the planner treats it as a backfill floor.
                ReviveOutcome::Poisoned => report.poisoned += 1,
                ReviveOutcome::Revived if pending.is_none() => {
                    let mut revived = errored.clone();
                    revived.status = QueueStatus::Pending;
                    revived.started_at = None;
                    pending = Some(revived);
                }
                ReviveOutcome::Revived | ReviveOutcome::NotErrored => {}
            }
        }

        if let Some(item) = pending {
            return Ok(UnitState::Claimable(item));
        }

        // Errored items below the attempt ceiling were just revived by this or
        // a concurrent tick; only poisoned ones constrain planning.
        let max_attempts = self.config.lease.max_attempts;
        let items: Vec<QueueItem> = items
            .into_iter()
            .filter(|item| {
                item.status != QueueStatus::Error || item.attempts >= max_attempts
            })
            .collect();

        let BackfillPlan::Fetch {
            newest,
            floor,
            reason,
        } = plan_next_window(&items, policy, now)
        else {
            debug!(unit = %key, "history reaches retention horizon");
            return Ok(UnitState::Idle);
        };

        let item = QueueItem::pending(key.clone(), newest, now);
        match self.store.insert_pending(&item).await? {
            EnqueueOutcome::Inserted(_) => {
                report.enqueued += 1;
                debug!(
                    unit = %key,
                    item_id = %item.id,
                    newest = %item.newest_cursor,
                    floor = ?floor.as_ref().map(ToString::to_string),
                    ?reason,
                    "enqueued window"
                );
                Ok(UnitState::Claimable(item))
            }
            EnqueueOutcome::Existing(id) => Ok(self
                .store
                .get(id)
                .await?
                .filter(|existing| existing.status == QueueStatus::Pending)
                .map_or(UnitState::Contended, UnitState::Claimable)),
            EnqueueOutcome::Contended => Ok(UnitState::Contended),
        }
    }

    async fn run_item(
        &self,
        item: QueueItem,
        unit: GovernedUnit,
        now: DateTime<Utc>,
    ) -> ItemRun {
        let batch = match self.executor.execute(&item, &unit, now).await {
            Ok(batch) => batch,
            Err(err) => {
                warn!(
                    item_id = %item.id,
                    unit = %item.unit,
                    error = %err,
                    "fetch failed; item left running for the lease reaper"
                );
                return ItemRun {
                    batch: None,
                    scores_written: 0,
                    scoring_failures: 0,
                };
            }
        };

        let mut scores_written = 0;
        let mut scoring_failures = 0;
        if let Some(trigger) = &self.scoring {
            let scope = &unit.context.scope;
            for author in &batch.authors {
                match trigger.evaluate(scope, author).await {
                    Ok(TriggerOutcome::Scored { .. }) => scores_written += 1,
                    Ok(TriggerOutcome::Failed { .. }) => scoring_failures += 1,
                    Ok(TriggerOutcome::NotDue | TriggerOutcome::NoActivity) => {}
                    Err(err) => {
                        warn!(author = %author, error = %err, "score recompute aborted");
                        scoring_failures += 1;
                    }
                }
            }
        }

        ItemRun {
            batch: Some(batch),
            scores_written,
            scoring_failures,
        }
    }
}
