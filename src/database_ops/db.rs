use anyhow::{Context, Result};
use sqlx::{
    postgres::{PgConnectOptions, PgPoolOptions, PgSslMode},
    PgPool,
};
use std::str::FromStr;
use std::time::Duration;
use tracing::{info, instrument};

use crate::util::env::env_flag;

#[derive(Clone)]
pub struct Db {
    pub pool: PgPool,
}

impl Db {
    // SECURITY: never include raw DSNs in tracing spans (they may contain credentials).
    #[instrument(skip(database_url))]
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self> {
        let mut connect_options = PgConnectOptions::from_str(database_url)?;
        if database_url.contains("sslmode=require") {
            connect_options = connect_options.ssl_mode(PgSslMode::Require);
        }
        if !env_flag("USE_PREPARED", false) {
            // PgBouncer txn mode safe
            connect_options = connect_options.statement_cache_capacity(0);
        }

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(10))
            .idle_timeout(Duration::from_secs(600))
            .connect_with(connect_options)
            .await?;
        info!("connected to db");
        Ok(Self { pool })
    }

    /// Create the backlog and player tables when they are missing.
    /// Tokens, registered users and the hidden-stat table are owned by other
    /// services; they are only created here so a fresh database is usable.
    pub async fn ensure_schema(&self) -> Result<()> {
        const STATEMENTS: &[&str] = &[
            "CREATE TABLE IF NOT EXISTS update_claims (
                id BIGINT PRIMARY KEY,
                retry INT NOT NULL DEFAULT 0,
                postponed BIGINT,
                priority BOOLEAN NOT NULL DEFAULT false,
                ts BIGINT NOT NULL DEFAULT 0,
                clan BOOLEAN,
                reason JSONB
            )",
            "CREATE INDEX IF NOT EXISTS update_claims_order_idx
                ON update_claims (priority DESC, ts ASC)",
            "CREATE TABLE IF NOT EXISTS players (
                id BIGINT PRIMARY KEY,
                battles BIGINT NOT NULL DEFAULT 0,
                doc JSONB,
                status SMALLINT,
                ts BIGINT NOT NULL DEFAULT 0,
                dt TIMESTAMPTZ,
                reason TEXT
            )",
            "CREATE TABLE IF NOT EXISTS tokens (
                player_id BIGINT PRIMARY KEY,
                expires_at BIGINT NOT NULL,
                services JSONB
            )",
            "CREATE TABLE IF NOT EXISTS users_common (id BIGINT PRIMARY KEY)",
            "CREATE SCHEMA IF NOT EXISTS xvm",
            "CREATE TABLE IF NOT EXISTS xvm.hidestat (
                player_id BIGINT NOT NULL,
                reason TEXT NOT NULL,
                comment TEXT,
                PRIMARY KEY (player_id, reason)
            )",
        ];
        for stmt in STATEMENTS {
            sqlx::raw_sql(stmt)
                .execute(&self.pool)
                .await
                .with_context(|| format!("schema statement failed: {}", first_line(stmt)))?;
        }
        info!("schema ensured");
        Ok(())
    }
}

fn first_line(sql: &str) -> &str {
    sql.lines().next().unwrap_or(sql).trim()
}
