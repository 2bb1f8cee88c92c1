//! Persistent backlog of update claims ("players due for a refresh").
use anyhow::{Context, Result};
use futures::stream::{BoxStream, StreamExt};
use serde_json::Value;
use sqlx::postgres::PgRow;
use sqlx::Row;
use tracing::instrument;

use crate::config::IdRange;
use crate::database_ops::db::Db;
use crate::models::PlayerId;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Claim {
    pub id: PlayerId,
    pub retry: u32,
    /// Epoch ms before which the claim is not eligible. `None` = eligible now.
    pub postponed: Option<i64>,
    pub priority: bool,
    pub ts: i64,
    /// Claims of clan-tracked players are refreshed elsewhere.
    pub clan: Option<bool>,
    pub reason: Option<Value>,
}

impl Claim {
    pub fn is_clan(&self) -> bool {
        self.clan == Some(true)
    }
}

/// Selects claims a server may take: inside its id ranges, not clan-tracked,
/// and not postponed past `now`.
#[derive(Debug, Clone)]
pub struct EligibilityFilter {
    pub id_ranges: Vec<IdRange>,
    pub now: i64,
    pub priority_only: bool,
}

impl EligibilityFilter {
    pub fn new(id_ranges: Vec<IdRange>, now: i64) -> Self {
        Self {
            id_ranges,
            now,
            priority_only: false,
        }
    }

    pub fn priority_only(&self) -> Self {
        Self {
            priority_only: true,
            ..self.clone()
        }
    }

    pub fn matches(&self, claim: &Claim) -> bool {
        self.id_ranges.iter().any(|r| r.contains(claim.id))
            && !claim.is_clan()
            && claim.postponed.map_or(true, |p| p < self.now)
            && (!self.priority_only || claim.priority)
    }

    fn bounds(&self) -> (Vec<i64>, Vec<i64>) {
        self.id_ranges.iter().map(|r| (r.min, r.max)).unzip()
    }
}

/// Fields written when a claim is taken into a region queue.
#[derive(Debug, Clone, PartialEq)]
pub struct ClaimUpdate {
    pub id: PlayerId,
    pub retry: u32,
    pub postponed: i64,
    pub ts: i64,
    pub priority: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoveScope {
    Any,
    /// Leave the claim in place when it belongs to a clan-tracked player.
    UnlessClan,
}

#[async_trait::async_trait]
pub trait BacklogStore: Send + Sync {
    async fn count_eligible(&self, filter: &EligibilityFilter) -> Result<u64>;

    /// Eligible claims, priority first, then oldest `ts` first.
    fn query_eligible<'a>(
        &'a self,
        filter: &'a EligibilityFilter,
        limit: usize,
    ) -> BoxStream<'a, Result<Claim>>;

    /// Applies all updates as one write.
    async fn claim_batch(&self, updates: &[ClaimUpdate]) -> Result<()>;

    async fn remove(&self, id: PlayerId, scope: RemoveScope) -> Result<()>;

    /// Abandoned claims leave the backlog for good; the reason is recorded on
    /// the player row by the caller.
    async fn mark_abandoned(&self, id: PlayerId, _reason: &str) -> Result<()> {
        self.remove(id, RemoveScope::Any).await
    }

    /// Upserts the claim carrying `reason`.
    async fn mark_problem(&self, id: PlayerId, reason: &Value) -> Result<()>;
}

#[derive(Clone)]
pub struct PgBacklogStore {
    db: Db,
}

impl PgBacklogStore {
    pub fn new(db: Db) -> Self {
        Self { db }
    }
}

macro_rules! eligible_where {
    () => {
        "(clan IS NULL OR clan = false)
         AND (postponed IS NULL OR postponed < $1)
         AND EXISTS (
             SELECT 1 FROM UNNEST($2::bigint[], $3::bigint[]) AS r(lo, hi)
             WHERE id >= r.lo AND id < r.hi
         )
         AND ($4 = false OR priority)"
    };
}

const COUNT_ELIGIBLE: &str = concat!("SELECT COUNT(*) FROM update_claims WHERE ", eligible_where!());

const SELECT_ELIGIBLE: &str = concat!(
    "SELECT id, retry, postponed, priority, ts, clan, reason FROM update_claims WHERE ",
    eligible_where!(),
    " ORDER BY priority DESC, ts ASC LIMIT $5"
);

fn claim_from_row(row: PgRow) -> Result<Claim> {
    let retry: i32 = row.try_get("retry")?;
    Ok(Claim {
        id: row.try_get("id")?,
        retry: retry.max(0) as u32,
        postponed: row.try_get("postponed")?,
        priority: row.try_get::<Option<bool>, _>("priority")?.unwrap_or(false),
        ts: row.try_get("ts")?,
        clan: row.try_get("clan")?,
        reason: row.try_get("reason")?,
    })
}

#[async_trait::async_trait]
impl BacklogStore for PgBacklogStore {
    #[instrument(skip(self, filter), fields(priority_only = filter.priority_only))]
    async fn count_eligible(&self, filter: &EligibilityFilter) -> Result<u64> {
        let (lo, hi) = filter.bounds();
        let count: i64 = sqlx::query_scalar(COUNT_ELIGIBLE)
            .bind(filter.now)
            .bind(lo)
            .bind(hi)
            .bind(filter.priority_only)
            .fetch_one(&self.db.pool)
            .await
            .context("count eligible claims")?;
        Ok(count.max(0) as u64)
    }

    fn query_eligible<'a>(
        &'a self,
        filter: &'a EligibilityFilter,
        limit: usize,
    ) -> BoxStream<'a, Result<Claim>> {
        let (lo, hi) = filter.bounds();
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        sqlx::query(SELECT_ELIGIBLE)
            .bind(filter.now)
            .bind(lo)
            .bind(hi)
            .bind(filter.priority_only)
            .bind(limit)
            .fetch(&self.db.pool)
            .map(|row| {
                row.context("query eligible claims")
                    .and_then(claim_from_row)
            })
            .boxed()
    }

    #[instrument(skip(self, updates), fields(count = updates.len()))]
    async fn claim_batch(&self, updates: &[ClaimUpdate]) -> Result<()> {
        if updates.is_empty() {
            return Ok(());
        }
        let ids: Vec<i64> = updates.iter().map(|u| u.id).collect();
        let retries: Vec<i32> = updates.iter().map(|u| u.retry as i32).collect();
        let postponed: Vec<i64> = updates.iter().map(|u| u.postponed).collect();
        let ts: Vec<i64> = updates.iter().map(|u| u.ts).collect();
        let priority: Vec<bool> = updates.iter().map(|u| u.priority).collect();
        sqlx::query(
            "UPDATE update_claims AS c
             SET retry = u.retry, postponed = u.postponed, ts = u.ts, priority = u.priority
             FROM UNNEST($1::bigint[], $2::int[], $3::bigint[], $4::bigint[], $5::bool[])
                  AS u(id, retry, postponed, ts, priority)
             WHERE c.id = u.id",
        )
        .bind(ids)
        .bind(retries)
        .bind(postponed)
        .bind(ts)
        .bind(priority)
        .execute(&self.db.pool)
        .await
        .context("claim batch update")?;
        Ok(())
    }

    async fn remove(&self, id: PlayerId, scope: RemoveScope) -> Result<()> {
        let sql = match scope {
            RemoveScope::Any => "DELETE FROM update_claims WHERE id = $1",
            RemoveScope::UnlessClan => {
                "DELETE FROM update_claims WHERE id = $1 AND (clan IS NULL OR clan = false)"
            }
        };
        sqlx::query(sql)
            .bind(id)
            .execute(&self.db.pool)
            .await
            .with_context(|| format!("remove claim {id}"))?;
        Ok(())
    }

    async fn mark_problem(&self, id: PlayerId, reason: &Value) -> Result<()> {
        sqlx::query(
            "INSERT INTO update_claims (id, reason) VALUES ($1, $2)
             ON CONFLICT (id) DO UPDATE SET reason = EXCLUDED.reason",
        )
        .bind(id)
        .bind(reason)
        .execute(&self.db.pool)
        .await
        .with_context(|| format!("mark problem claim {id}"))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn claim(id: PlayerId) -> Claim {
        Claim {
            id,
            ..Default::default()
        }
    }

    #[test]
    fn filter_respects_ranges_clan_and_postponement() {
        let filter = EligibilityFilter::new(vec![IdRange::new(100, 200)], 1_000);
        assert!(filter.matches(&claim(150)));
        assert!(!filter.matches(&claim(200)));
        assert!(!filter.matches(&Claim {
            clan: Some(true),
            ..claim(150)
        }));
        assert!(filter.matches(&Claim {
            clan: Some(false),
            ..claim(150)
        }));
        assert!(filter.matches(&Claim {
            postponed: Some(999),
            ..claim(150)
        }));
        assert!(!filter.matches(&Claim {
            postponed: Some(1_000),
            ..claim(150)
        }));
    }

    #[test]
    fn priority_only_filter() {
        let filter = EligibilityFilter::new(vec![IdRange::new(0, 10)], 0).priority_only();
        assert!(!filter.matches(&claim(1)));
        assert!(filter.matches(&Claim {
            priority: true,
            ..claim(1)
        }));
    }
}
