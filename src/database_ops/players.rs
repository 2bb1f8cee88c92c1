use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::Row;
use tracing::{instrument, warn};

use crate::database_ops::db::Db;
use crate::models::{PlayerId, PlayerRecord, TokenRecord, TokenServices};

#[async_trait::async_trait]
pub trait PlayerStore: Send + Sync {
    /// Current records for `ids`, without per-vehicle stats. Ids with no row are omitted.
    async fn find_many(&self, ids: &[PlayerId]) -> Result<Vec<PlayerRecord>>;
    async fn upsert(&self, record: &PlayerRecord) -> Result<()>;
    /// Stamps `reason` and the update time on the row, creating a stub row if needed.
    async fn mark_skipped(&self, id: PlayerId, reason: &str, at: DateTime<Utc>) -> Result<()>;
    /// Returns whether a row was deleted.
    async fn delete(&self, id: PlayerId) -> Result<bool>;
}

#[async_trait::async_trait]
pub trait TokenStore: Send + Sync {
    async fn find(&self, id: PlayerId) -> Result<Option<TokenRecord>>;
}

/// Registered (tracked) users. Only existence matters.
#[async_trait::async_trait]
pub trait UserRegistry: Send + Sync {
    async fn is_tracked(&self, id: PlayerId) -> Result<bool>;
}

/// Side table flagging players whose stats are hidden from the public API.
#[async_trait::async_trait]
pub trait HiddenStats: Send + Sync {
    /// Insert-if-absent.
    async fn flag_hidden(&self, id: PlayerId) -> Result<()>;
    /// Removes only the flag this service owns.
    async fn clear_hidden(&self, id: PlayerId) -> Result<()>;
}

#[derive(Clone)]
pub struct PgPlayerStore {
    db: Db,
}

impl PgPlayerStore {
    pub fn new(db: Db) -> Self {
        Self { db }
    }
}

#[async_trait::async_trait]
impl PlayerStore for PgPlayerStore {
    #[instrument(skip(self, ids), fields(count = ids.len()))]
    async fn find_many(&self, ids: &[PlayerId]) -> Result<Vec<PlayerRecord>> {
        let rows = sqlx::query(
            "SELECT id, battles, doc - 'v' AS doc, ts, reason FROM players WHERE id = ANY($1)",
        )
        .bind(ids)
        .fetch_all(&self.db.pool)
        .await
        .context("read players")?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let id: i64 = row.try_get("id")?;
            let doc: Option<Json<PlayerRecord>> = match row.try_get("doc") {
                Ok(doc) => doc,
                Err(e) => {
                    warn!(player_id = id, error = %e, "unreadable player document; treating as stub");
                    None
                }
            };
            let mut record = doc.map(|d| d.0).unwrap_or_default();
            // Columns are authoritative over the document copy.
            record.id = id;
            record.battle_count = row.try_get("battles")?;
            record.last_update_ts = row.try_get("ts")?;
            record.reason = row.try_get("reason")?;
            out.push(record);
        }
        Ok(out)
    }

    async fn upsert(&self, record: &PlayerRecord) -> Result<()> {
        let status: Option<i16> = record.status.map(|s| u8::from(s) as i16);
        sqlx::query(
            "INSERT INTO players (id, battles, doc, status, ts, dt, reason)
             VALUES ($1, $2, $3, $4, $5, now(), NULL)
             ON CONFLICT (id) DO UPDATE SET
                battles = EXCLUDED.battles, doc = EXCLUDED.doc, status = EXCLUDED.status,
                ts = EXCLUDED.ts, dt = EXCLUDED.dt, reason = NULL",
        )
        .bind(record.id)
        .bind(record.battle_count)
        .bind(Json(record))
        .bind(status)
        .bind(record.last_update_ts)
        .execute(&self.db.pool)
        .await
        .with_context(|| format!("upsert player {}", record.id))?;
        Ok(())
    }

    async fn mark_skipped(&self, id: PlayerId, reason: &str, at: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            "INSERT INTO players (id, ts, dt, reason) VALUES ($1, $2, $3, $4)
             ON CONFLICT (id) DO UPDATE SET ts = EXCLUDED.ts, dt = EXCLUDED.dt, reason = EXCLUDED.reason",
        )
        .bind(id)
        .bind(at.timestamp_millis())
        .bind(at)
        .bind(reason)
        .execute(&self.db.pool)
        .await
        .with_context(|| format!("mark player {id} skipped"))?;
        Ok(())
    }

    async fn delete(&self, id: PlayerId) -> Result<bool> {
        let res = sqlx::query("DELETE FROM players WHERE id = $1")
            .bind(id)
            .execute(&self.db.pool)
            .await
            .with_context(|| format!("delete player {id}"))?;
        Ok(res.rows_affected() > 0)
    }
}

#[derive(Clone)]
pub struct PgTokenStore {
    db: Db,
}

impl PgTokenStore {
    pub fn new(db: Db) -> Self {
        Self { db }
    }
}

#[async_trait::async_trait]
impl TokenStore for PgTokenStore {
    async fn find(&self, id: PlayerId) -> Result<Option<TokenRecord>> {
        let row = sqlx::query("SELECT expires_at, services FROM tokens WHERE player_id = $1")
            .bind(id)
            .fetch_optional(&self.db.pool)
            .await
            .with_context(|| format!("read token {id}"))?;
        let Some(row) = row else {
            return Ok(None);
        };
        let services: Option<Json<TokenServices>> = row.try_get("services")?;
        Ok(Some(TokenRecord {
            player_id: id,
            expires_at: row.try_get("expires_at")?,
            services: services.map(|s| s.0),
        }))
    }
}

#[derive(Clone)]
pub struct PgUserRegistry {
    db: Db,
}

impl PgUserRegistry {
    pub fn new(db: Db) -> Self {
        Self { db }
    }
}

#[async_trait::async_trait]
impl UserRegistry for PgUserRegistry {
    async fn is_tracked(&self, id: PlayerId) -> Result<bool> {
        let exists: bool =
            sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM users_common WHERE id = $1)")
                .bind(id)
                .fetch_one(&self.db.pool)
                .await
                .with_context(|| format!("lookup registered user {id}"))?;
        Ok(exists)
    }
}

#[derive(Clone)]
pub struct PgHiddenStats {
    db: Db,
}

impl PgHiddenStats {
    pub fn new(db: Db) -> Self {
        Self { db }
    }
}

#[async_trait::async_trait]
impl HiddenStats for PgHiddenStats {
    async fn flag_hidden(&self, id: PlayerId) -> Result<()> {
        sqlx::query(
            "INSERT INTO xvm.hidestat (player_id, reason, comment)
             VALUES ($1, 'gdpr_papi', 'added by player updater')
             ON CONFLICT DO NOTHING",
        )
        .bind(id)
        .execute(&self.db.pool)
        .await
        .with_context(|| format!("flag hidden stat {id}"))?;
        Ok(())
    }

    async fn clear_hidden(&self, id: PlayerId) -> Result<()> {
        sqlx::query("DELETE FROM xvm.hidestat WHERE player_id = $1 AND reason = 'gdpr_papi'")
            .bind(id)
            .execute(&self.db.pool)
            .await
            .with_context(|| format!("clear hidden stat {id}"))?;
        Ok(())
    }
}
