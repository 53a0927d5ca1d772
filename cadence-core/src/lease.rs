//! Lease manager: reaps expired leases, bounds in-flight work, and claims
//! pending items.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::error::Result;
use crate::store::QueueStore;
use crate::types::{QueueItem, QueueItemId, QueueStatus};

/// Outcome of trying to bring an errored item back into the queue.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ReviveOutcome {
    /// Moved back to `pending`.
    Revived,
    /// Hit the attempt ceiling; left in `error` for an operator.
    Poisoned,
    /// The item was no longer in `error` (another tick got there first).
    NotErrored,
}

#[derive(Debug)]
pub struct LeaseManager<S> {
    store: Arc<S>,
}

impl<S> Clone for LeaseManager<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
        }
    }
}

impl<S: QueueStore> LeaseManager<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    /// Moves running items whose lease started more than `timeout` before
    /// `now` to `error`, incrementing their attempts. Items already in
    /// `error` are untouched, so repeated passes never double count.
    pub async fn reap_expired(
        &self,
        timeout: chrono::Duration,
        now: DateTime<Utc>,
    ) -> Result<Vec<QueueItem>> {
        let reaped = self.store.reap_expired(now - timeout).await?;
        for item in &reaped {
            warn!(
                item_id = %item.id,
                unit = %item.unit,
                attempts = item.attempts,
                started_at = ?item.started_at,
                "reaped expired lease"
            );
        }
        Ok(reaped)
    }

    /// `max_concurrent - running`. Callers must stop claiming when this is
    /// zero or negative.
    pub async fn available_capacity(&self, max_concurrent: usize) -> Result<i64> {
        let running = self.store.count_running().await?;
        let max = i64::try_from(max_concurrent).unwrap_or(i64::MAX);
        let running = i64::try_from(running).unwrap_or(i64::MAX);
        Ok(max - running)
    }

    /// Compare-and-swap `pending -> running`. A `false` return is a lost race,
    /// not an error.
    pub async fn claim(&self, id: QueueItemId, now: DateTime<Utc>) -> Result<bool> {
        let claimed = self.store.claim_pending(id, now).await?;
        if !claimed {
            debug!(item_id = %id, "claim lost to a concurrent tick");
        }
        Ok(claimed)
    }

    /// Separate step before claiming an errored item: `error -> pending`
    /// while `attempts < max_attempts`.
    pub async fn revive_errored(
        &self,
        item: &QueueItem,
        max_attempts: u32,
    ) -> Result<ReviveOutcome> {
        if item.status != QueueStatus::Error {
            return Ok(ReviveOutcome::NotErrored);
        }

        if item.attempts >= max_attempts {
            warn!(
                item_id = %item.id,
                unit = %item.unit,
                attempts = item.attempts,
                max_attempts,
                "queue item exceeded max attempts; skipping until an operator intervenes"
            );
            return Ok(ReviveOutcome::Poisoned);
        }

        if self.store.reset_errored(item.id, max_attempts).await? {
            debug!(item_id = %item.id, attempts = item.attempts, "revived errored item");
            Ok(ReviveOutcome::Revived)
        } else {
            Ok(ReviveOutcome::NotErrored)
        }
    }
}
