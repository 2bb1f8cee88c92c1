use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::{error, info};

use player_updater::config::UpdaterConfig;
use player_updater::database_ops::db::Db;
use player_updater::database_ops::Stores;
use player_updater::stat_api::reference::ReferenceCache;
use player_updater::stat_api::wargaming::WargamingApi;
use player_updater::updater::{BacklogFetcher, BatchUpdater, RegionScheduler};
use player_updater::util::env as env_util;

#[tokio::main]
async fn main() -> Result<()> {
    env_util::init_env();
    player_updater::tracing::init_tracing("info,sqlx=warn")?;

    if let Err(e) = run().await {
        error!(error = %format!("{e:#}"), "player updater stopped");
        return Err(e);
    }
    Ok(())
}

async fn run() -> Result<()> {
    env_util::preflight_check(
        "player_updater",
        &["WG_APPLICATION_ID"],
        &[
            "DATABASE_URL",
            "WG_APPLICATION_ID",
            "UPDATER_SERVERS",
            "UPDATER_POOL_SIZE",
            "UPDATER_FETCH_THRESHOLD",
            "UPDATER_HTTP_BATCH_SIZE",
            "BATTLES_TRASH_HOLD",
            "WN8_EXPECTED_URL",
        ],
    )?;
    let config = UpdaterConfig::from_env().context("updater config")?;
    let database_url = env_util::db_url()?;
    let max_conns: u32 = env_util::env_parse("DB_MAX_CONNS", 10);

    let api = Arc::new(WargamingApi::from_env()?);
    let reference = Arc::new(ReferenceCache::new(api.clone()));

    // Nothing is scheduled until the store and the reference data are both up.
    let (db, ()) = futures::try_join!(
        async {
            Db::connect(&database_url, max_conns)
                .await
                .context("connect database")
        },
        async { reference.refresh().await.context("initial reference data load") },
    )?;
    info!(max_conns, "database connected");
    if env_util::env_flag("AUTO_MIGRATE", false) {
        db.ensure_schema().await.context("ensure schema")?;
    }

    let stores = Stores::postgres(&db);
    let updater = Arc::new(BatchUpdater::new(
        stores.clone(),
        api,
        reference.clone(),
        config.battles_trash_hold,
    ));
    let fetcher = Arc::new(BacklogFetcher::new(stores));
    let scheduler = RegionScheduler::new(&config, updater, fetcher);

    let mut tasks = scheduler.start();
    tasks.push(reference.spawn_refresher(config.reference_refresh));
    info!(
        servers = config.servers.len(),
        pool_size = config.pool_size,
        fetch_threshold = config.fetch_threshold,
        batch_size = config.http_batch_size,
        "player updater started; press Ctrl+C to stop"
    );

    tokio::signal::ctrl_c().await.context("listen for Ctrl+C")?;
    info!("shutdown: Ctrl+C received, stopping {} task(s)", tasks.len());
    for task in tasks {
        task.abort();
    }
    Ok(())
}
