//! Per-server periodic ticks that drain region queues and trigger refills.
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info};

use super::batch::BatchUpdater;
use super::fetcher::BacklogFetcher;
use super::region::RegionState;
use crate::config::{Region, ServerConfig, UpdaterConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// Previous tick of this server still held the guard.
    Dropped,
    Ran {
        dispatched: usize,
        refill_started: bool,
        /// Region stats were logged and reset by this tick.
        reported: bool,
    },
}

/// Releases the tick guard however the tick exits.
struct TickGuard<'a>(&'a AtomicBool);

impl Drop for TickGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct ServerRunner {
    server: ServerConfig,
    state: Arc<RegionState>,
    updater: Arc<BatchUpdater>,
    fetcher: Arc<BacklogFetcher>,
    busy: AtomicBool,
    batch_size: usize,
    fetch_threshold: usize,
    pool_size: usize,
}

impl ServerRunner {
    /// Hands the next batch to the updater and, on a master server with a
    /// short queue, starts a refill. Both run as detached tasks; the guard is
    /// released once they are dispatched.
    pub fn tick(&self) -> TickOutcome {
        if self
            .busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!(server = %self.server.name, "tick dropped");
            return TickOutcome::Dropped;
        }
        let _guard = TickGuard(&self.busy);

        let ids = self.state.take_batch(self.batch_size);
        let dispatched = ids.len();
        if !ids.is_empty() {
            let updater = Arc::clone(&self.updater);
            let state = Arc::clone(&self.state);
            let server = self.server.clone();
            tokio::spawn(async move {
                updater.process(&server, &state, ids).await;
            });
        }

        let mut refill_started = false;
        let mut reported = false;
        if self.server.master
            && self.state.queue_len() < self.fetch_threshold
            && self.state.refill_allowed()
        {
            if let Some(report) = self.state.take_report() {
                report.log(self.server.region);
                reported = true;
            }
            let limit = self.pool_size.saturating_sub(self.state.queue_len());
            let fetcher = Arc::clone(&self.fetcher);
            let state = Arc::clone(&self.state);
            let ranges = self.server.id_ranges.clone();
            tokio::spawn(async move {
                if let Err(e) = fetcher.refill(&state, &ranges, limit).await {
                    error!(region = %state.region(), error = %format!("{e:#}"), "Fetching queue FAILED");
                }
            });
            refill_started = true;
        }

        TickOutcome::Ran {
            dispatched,
            refill_started,
            reported,
        }
    }

    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let period = self.server.tick_interval();
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            info!(
                server = %self.server.name,
                region = %self.server.region,
                master = self.server.master,
                period_ms = period.as_millis() as u64,
                "server started"
            );
            loop {
                ticker.tick().await;
                self.tick();
            }
        })
    }
}

/// Owns one `RegionState` per configured region and a runner per server.
pub struct RegionScheduler {
    regions: BTreeMap<Region, Arc<RegionState>>,
    runners: Vec<Arc<ServerRunner>>,
}

impl RegionScheduler {
    pub fn new(
        config: &UpdaterConfig,
        updater: Arc<BatchUpdater>,
        fetcher: Arc<BacklogFetcher>,
    ) -> Self {
        let mut regions = BTreeMap::new();
        let runners = config
            .servers
            .iter()
            .map(|server| {
                let state = regions
                    .entry(server.region)
                    .or_insert_with(|| Arc::new(RegionState::new(server.region)))
                    .clone();
                Arc::new(ServerRunner {
                    server: server.clone(),
                    state,
                    updater: Arc::clone(&updater),
                    fetcher: Arc::clone(&fetcher),
                    busy: AtomicBool::new(false),
                    batch_size: config.http_batch_size,
                    fetch_threshold: config.fetch_threshold,
                    pool_size: config.pool_size,
                })
            })
            .collect();
        Self { regions, runners }
    }

    pub fn region(&self, region: Region) -> Option<&Arc<RegionState>> {
        self.regions.get(&region)
    }

    pub fn runners(&self) -> &[Arc<ServerRunner>] {
        &self.runners
    }

    pub fn start(&self) -> Vec<JoinHandle<()>> {
        self.runners.iter().map(|r| Arc::clone(r).spawn()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database_ops::backlog::Claim;
    use crate::models::PlayerRecord;
    use crate::stat_api::reference::{ReferenceCache, ReferenceSource};
    use crate::stat_api::{PlayerSnapshot, StatBatch};
    use crate::updater::region::FetchState;
    use crate::updater::testing::{MemoryStores, ScriptedApi};
    use anyhow::Result;
    use std::collections::HashMap;
    use std::time::Duration;

    struct NoReference;

    #[async_trait::async_trait]
    impl ReferenceSource for NoReference {
        async fn load_tanks(&self) -> Result<HashMap<i64, crate::stat_api::reference::TankInfo>> {
            Ok(HashMap::new())
        }

        async fn load_expected(
            &self,
        ) -> Result<HashMap<i64, crate::stat_api::reference::ExpectedValues>> {
            Ok(HashMap::new())
        }
    }

    fn scheduler(servers: &str) -> (MemoryStores, Arc<ScriptedApi>, RegionScheduler) {
        let mem = MemoryStores::default();
        let api = Arc::new(ScriptedApi::default());
        let reference = Arc::new(ReferenceCache::new(Arc::new(NoReference)));
        let updater = Arc::new(BatchUpdater::new(mem.stores(), api.clone(), reference, 100));
        let fetcher = Arc::new(BacklogFetcher::new(mem.stores()));
        let config = UpdaterConfig {
            servers: crate::config::parse_servers(servers).unwrap(),
            pool_size: 10,
            fetch_threshold: 3,
            http_batch_size: 2,
            ..UpdaterConfig::default()
        };
        (mem, api, RegionScheduler::new(&config, updater, fetcher))
    }

    async fn settle() {
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn servers_of_a_region_share_state() {
        let (_, _, sched) = scheduler("EU:master:1,EU::1,NA:master:1");
        assert_eq!(sched.runners().len(), 3);
        let eu = sched.region(Region::Eu).unwrap();
        assert!(Arc::ptr_eq(eu, &sched.runners()[1].state));
        assert!(sched.region(Region::Ru).is_none());
    }

    #[tokio::test]
    async fn master_tick_refills_an_empty_queue() {
        let (mem, _, sched) = scheduler("EU:master:1");
        for id in 0..5 {
            mem.backlog.insert(Claim {
                id: 500_000_000 + id,
                ..Default::default()
            });
        }
        let runner = &sched.runners()[0];
        assert_eq!(
            runner.tick(),
            TickOutcome::Ran {
                dispatched: 0,
                refill_started: true,
                reported: false
            }
        );
        settle().await;
        let eu = sched.region(Region::Eu).unwrap();
        assert_eq!(eu.queue_len(), 5);
        // Fewer claims than the pool size: the region cools down.
        assert_eq!(eu.fetch_state(), FetchState::Cooldown);

        assert_eq!(
            runner.tick(),
            TickOutcome::Ran {
                dispatched: 2,
                refill_started: false,
                reported: false
            }
        );
    }

    #[tokio::test]
    async fn slave_servers_never_refill() {
        let (mem, _, sched) = scheduler("EU::1");
        mem.backlog.insert(Claim {
            id: 500_000_001,
            ..Default::default()
        });
        assert_eq!(
            sched.runners()[0].tick(),
            TickOutcome::Ran {
                dispatched: 0,
                refill_started: false,
                reported: false
            }
        );
        settle().await;
        assert_eq!(sched.region(Region::Eu).unwrap().queue_len(), 0);
    }

    #[tokio::test]
    async fn overlapping_tick_is_dropped() {
        let (_, _, sched) = scheduler("EU:master:1");
        let runner = &sched.runners()[0];
        runner.busy.store(true, Ordering::SeqCst);
        assert_eq!(runner.tick(), TickOutcome::Dropped);
        runner.busy.store(false, Ordering::SeqCst);
        assert!(matches!(runner.tick(), TickOutcome::Ran { .. }));
        assert!(!runner.busy.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn dispatched_batch_reports_to_region_stats() {
        let (mem, api, sched) = scheduler("EU::1");
        let eu = sched.region(Region::Eu).unwrap();
        for id in [500_000_001, 500_000_002, 500_000_003] {
            mem.players.insert(PlayerRecord {
                id,
                battle_count: 10,
                ..Default::default()
            });
            eu.push(id);
        }
        let unchanged = PlayerSnapshot {
            info: Some(crate::models::PlayerInfo {
                battles: 10,
                ..Default::default()
            }),
            ..Default::default()
        };
        api.respond(StatBatch {
            players: [(500_000_001, unchanged.clone()), (500_000_002, unchanged)]
                .into_iter()
                .collect(),
        });

        sched.runners()[0].tick();
        settle().await;
        assert_eq!(eu.queue_len(), 1);
        assert_eq!(eu.counts(), (2, 0));
    }

    #[tokio::test]
    async fn master_tick_reports_and_resets_region_stats() {
        let (_, _, sched) = scheduler("EU:master:1");
        let eu = sched.region(Region::Eu).unwrap();
        let runner = &sched.runners()[0];

        // No activity yet: nothing to report.
        assert!(matches!(
            runner.tick(),
            TickOutcome::Ran { reported: false, .. }
        ));
        settle().await;

        // Empty backlog left the region cooling down with an empty queue,
        // which still allows a refill and therefore a report.
        eu.record_success();
        eu.record_failure(serde_json::json!({"message": "No vehicles", "playerId": 7}));
        assert_eq!(eu.counts(), (1, 1));
        assert!(matches!(
            runner.tick(),
            TickOutcome::Ran { reported: true, refill_started: true, .. }
        ));
        assert_eq!(eu.counts(), (0, 0));
        settle().await;

        assert!(matches!(
            runner.tick(),
            TickOutcome::Ran { reported: false, .. }
        ));
    }

    #[tokio::test]
    async fn slave_tick_never_reports() {
        let (_, _, sched) = scheduler("EU::1");
        let eu = sched.region(Region::Eu).unwrap();
        eu.record_success();
        assert!(matches!(
            sched.runners()[0].tick(),
            TickOutcome::Ran { reported: false, .. }
        ));
        assert_eq!(eu.counts(), (1, 0));
    }

    #[tokio::test(start_paused = true)]
    async fn started_servers_tick_on_their_interval() {
        let (_, api, sched) = scheduler("EU::2");
        let eu = sched.region(Region::Eu).unwrap();
        for id in 0..6 {
            eu.push(500_000_000 + id);
        }
        let handles = sched.start();
        // Ticks at 0ms, 500ms and 1000ms drain two ids each.
        tokio::time::sleep(Duration::from_millis(1_100)).await;
        assert_eq!(eu.queue_len(), 0);
        assert_eq!(api.calls.load(std::sync::atomic::Ordering::SeqCst), 3);
        for h in handles {
            h.abort();
        }
    }
}
