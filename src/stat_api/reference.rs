//! Vehicle catalogue and WN8 expected values, loaded at startup and refreshed
//! hourly. Documents are built against whatever snapshot is current.
use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{error, info};

use crate::models::VehicleStats;

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct TankInfo {
    pub tier: u8,
}

/// Per-vehicle expected averages, as published in the WN8 expected-values table.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct ExpectedValues {
    #[serde(rename = "expDamage")]
    pub damage: f64,
    #[serde(rename = "expFrag")]
    pub frag: f64,
    #[serde(rename = "expSpot")]
    pub spot: f64,
    #[serde(rename = "expDef")]
    pub def: f64,
    /// Percent.
    #[serde(rename = "expWinRate")]
    pub win_rate: f64,
}

#[derive(Debug, Clone, Default)]
pub struct ReferenceData {
    pub tanks: HashMap<i64, TankInfo>,
    pub expected: HashMap<i64, ExpectedValues>,
}

impl ReferenceData {
    /// Drops vehicles missing from the catalogue. An empty catalogue keeps everything.
    pub fn known_vehicles(&self, vehicles: Vec<VehicleStats>) -> Vec<VehicleStats> {
        if self.tanks.is_empty() {
            return vehicles;
        }
        vehicles
            .into_iter()
            .filter(|v| self.tanks.contains_key(&v.tank_id))
            .collect()
    }

    /// Battle-weighted average tier.
    pub fn avg_tier(&self, vehicles: &[VehicleStats]) -> Option<f64> {
        let (weighted, battles) = vehicles
            .iter()
            .filter_map(|v| self.tanks.get(&v.tank_id).map(|t| (t.tier as f64, v.battles)))
            .filter(|(_, b)| *b > 0)
            .fold((0.0, 0i64), |(w, n), (tier, b)| (w + tier * b as f64, n + b));
        (battles > 0).then(|| weighted / battles as f64)
    }

    /// Account WN8 over the vehicles that have expected values.
    pub fn wn8(&self, vehicles: &[VehicleStats]) -> Option<f64> {
        let mut actual = Totals::default();
        let mut expected = Totals::default();
        for v in vehicles.iter().filter(|v| v.battles > 0) {
            let Some(exp) = self.expected.get(&v.tank_id) else {
                continue;
            };
            let n = v.battles as f64;
            actual.damage += v.damage_dealt as f64;
            actual.frag += v.frags as f64;
            actual.spot += v.spotted as f64;
            actual.def += v.dropped_capture_points as f64;
            actual.win += v.wins as f64 * 100.0;
            expected.damage += exp.damage * n;
            expected.frag += exp.frag * n;
            expected.spot += exp.spot * n;
            expected.def += exp.def * n;
            expected.win += exp.win_rate * n;
        }
        if expected.damage <= 0.0 || expected.win <= 0.0 {
            return None;
        }
        Some(wn8_from_ratios(
            actual.damage / expected.damage,
            ratio(actual.frag, expected.frag),
            ratio(actual.spot, expected.spot),
            ratio(actual.def, expected.def),
            actual.win / expected.win,
        ))
    }
}

#[derive(Default)]
struct Totals {
    damage: f64,
    frag: f64,
    spot: f64,
    def: f64,
    win: f64,
}

fn ratio(actual: f64, expected: f64) -> f64 {
    if expected > 0.0 {
        actual / expected
    } else {
        0.0
    }
}

fn wn8_from_ratios(r_damage: f64, r_frag: f64, r_spot: f64, r_def: f64, r_win: f64) -> f64 {
    let damage_c = ((r_damage - 0.22) / (1.0 - 0.22)).max(0.0);
    let frag_c = ((r_frag - 0.12) / (1.0 - 0.12)).min(damage_c + 0.2).max(0.0);
    let spot_c = ((r_spot - 0.38) / (1.0 - 0.38)).min(damage_c + 0.1).max(0.0);
    let def_c = ((r_def - 0.10) / (1.0 - 0.10)).min(damage_c + 0.1).max(0.0);
    let win_c = ((r_win - 0.71) / (1.0 - 0.71)).max(0.0);
    980.0 * damage_c
        + 210.0 * damage_c * frag_c
        + 155.0 * frag_c * spot_c
        + 75.0 * def_c * frag_c
        + 145.0 * win_c.min(1.8)
}

#[async_trait::async_trait]
pub trait ReferenceSource: Send + Sync {
    async fn load_tanks(&self) -> Result<HashMap<i64, TankInfo>>;
    async fn load_expected(&self) -> Result<HashMap<i64, ExpectedValues>>;
}

pub struct ReferenceCache {
    source: Arc<dyn ReferenceSource>,
    current: RwLock<Arc<ReferenceData>>,
}

impl ReferenceCache {
    pub fn new(source: Arc<dyn ReferenceSource>) -> Self {
        Self {
            source,
            current: RwLock::new(Arc::new(ReferenceData::default())),
        }
    }

    pub fn snapshot(&self) -> Arc<ReferenceData> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Loads both tables; the current snapshot is only replaced when both succeed.
    pub async fn refresh(&self) -> Result<()> {
        let (tanks, expected) = futures::try_join!(
            async { self.source.load_tanks().await.context("load vehicle catalogue") },
            async { self.source.load_expected().await.context("load wn8 expected values") },
        )?;
        info!(tanks = tanks.len(), expected = expected.len(), "reference data updated");
        *self.current.write().unwrap_or_else(PoisonError::into_inner) =
            Arc::new(ReferenceData { tanks, expected });
        Ok(())
    }

    pub fn spawn_refresher(self: Arc<Self>, every: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // First tick completes immediately; bootstrap already loaded once.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(e) = self.refresh().await {
                    error!(error = %format!("{e:#}"), "reference data update FAILED");
                }
            }
        })
    }
}
