//! Refills a region queue from the persistent backlog.
use anyhow::Result;
use chrono::Utc;
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument};

use super::region::RegionState;
use super::retry::RetryPolicy;
use crate::config::IdRange;
use crate::database_ops::backlog::{ClaimUpdate, EligibilityFilter};
use crate::database_ops::{SkipReason, Stores};

/// Refills are suppressed this long after the backlog ran dry.
pub const COOLDOWN_WINDOW: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefillReport {
    /// Eligible claims in the region when the refill started.
    pub total: u64,
    pub priority: u64,
    pub queued: usize,
    pub abandoned: usize,
    /// Fewer eligible claims than requested; the region went into cooldown.
    pub exhausted: bool,
}

pub struct BacklogFetcher {
    stores: Stores,
    policy: RetryPolicy,
    cooldown: Duration,
}

impl BacklogFetcher {
    pub fn new(stores: Stores) -> Self {
        Self {
            stores,
            policy: RetryPolicy::default(),
            cooldown: COOLDOWN_WINDOW,
        }
    }

    /// Takes up to `limit` eligible claims into the region queue.
    ///
    /// Returns `Ok(None)` without touching the backlog when another refill
    /// holds the region, or when it is cooling down with work still queued.
    /// On error the region is released so the next tick can try again.
    #[instrument(skip_all, fields(region = %state.region(), limit = limit))]
    pub async fn refill(
        &self,
        state: &Arc<RegionState>,
        id_ranges: &[IdRange],
        limit: usize,
    ) -> Result<Option<RefillReport>> {
        if !state.try_begin_fetch() {
            debug!(fetch_state = ?state.fetch_state(), "refill skipped");
            return Ok(None);
        }
        info!(region = %state.region(), "Fetching queue");

        let report = match self.fill(state, id_ranges, limit).await {
            Ok(report) => report,
            Err(e) => {
                state.finish_fetch();
                return Err(e);
            }
        };
        if report.exhausted {
            self.start_cooldown(state, report.total);
        } else {
            state.finish_fetch();
        }
        Ok(Some(report))
    }

    async fn fill(
        &self,
        state: &RegionState,
        id_ranges: &[IdRange],
        limit: usize,
    ) -> Result<RefillReport> {
        let now = Utc::now().timestamp_millis();
        let filter = EligibilityFilter::new(id_ranges.to_vec(), now);
        let priority_filter = filter.priority_only();
        let backlog = &self.stores.backlog;

        let (total, priority) = futures::try_join!(
            backlog.count_eligible(&filter),
            backlog.count_eligible(&priority_filter)
        )?;

        let mut updates = Vec::new();
        let mut abandoned = Vec::new();
        let mut claims = backlog.query_eligible(&filter, limit);
        while let Some(claim) = claims.next().await {
            let claim = claim?;
            if self.policy.should_abandon(claim.retry) {
                abandoned.push(claim.id);
                continue;
            }
            let retry = claim.retry + 1;
            let delay = i64::try_from(self.policy.next_delay(retry).as_millis()).unwrap_or(i64::MAX);
            updates.push(ClaimUpdate {
                id: claim.id,
                retry,
                postponed: now.saturating_add(delay),
                ts: now,
                priority: claim.priority,
            });
            // Queued before the claim write lands; a lost write only means a re-fetch.
            state.push(claim.id);
        }
        drop(claims);

        let abandonments = futures::future::try_join_all(
            abandoned
                .iter()
                .map(|id| self.stores.skip_update(*id, SkipReason::TooManyRetries)),
        );
        futures::try_join!(backlog.claim_batch(&updates), abandonments)?;

        info!(
            region = %state.region(),
            queue = state.queue_len(),
            total,
            priority,
            abandoned = abandoned.len(),
            "{} queue length {} (total claims {}, priority {})",
            state.region(),
            state.queue_len(),
            total,
            priority
        );
        Ok(RefillReport {
            total,
            priority,
            queued: updates.len(),
            abandoned: abandoned.len(),
            exhausted: total < limit as u64,
        })
    }

    fn start_cooldown(&self, state: &Arc<RegionState>, total: u64) {
        let epoch = state.enter_cooldown();
        let window = self.cooldown;
        info!(
            region = %state.region(),
            total,
            "No more update claims for {}.... Cooldown {}s",
            state.region(),
            window.as_secs()
        );
        let state = Arc::clone(state);
        tokio::spawn(async move {
            tokio::time::sleep(window).await;
            if state.end_cooldown(epoch) {
                info!(region = %state.region(), "Cooldown end for {}", state.region());
            }
        });
    }
}
