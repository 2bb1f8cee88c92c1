//! Boundary to the external game-statistics API.
pub mod reference;
pub mod wargaming;

use anyhow::Result;
use serde_json::Value;
use std::collections::BTreeMap;

use crate::config::ServerConfig;
use crate::models::{MembershipEntry, PlayerId, PlayerInfo, PlayerRecord, VehicleStats};

/// Everything the API returned for one player id.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PlayerSnapshot {
    /// `None` when the API answered with null (closed or hidden profile).
    pub info: Option<PlayerInfo>,
    /// `None` when no vehicle payload came back.
    pub vehicles: Option<Vec<VehicleStats>>,
    pub achievements: BTreeMap<String, i64>,
    /// New membership entries only; merged into the stored history by the caller.
    pub membership: Vec<MembershipEntry>,
    pub account_rating: Option<f64>,
    pub tanks_rating: Option<Value>,
}

/// Response for one batch. Ids the API did not mention are absent and mean "no data".
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatBatch {
    pub players: BTreeMap<PlayerId, PlayerSnapshot>,
}

impl StatBatch {
    pub fn len(&self) -> usize {
        self.players.len()
    }

    pub fn is_empty(&self) -> bool {
        self.players.is_empty()
    }
}

#[async_trait::async_trait]
pub trait StatApi: Send + Sync {
    /// Fetches fresh stats for `ids` from the server's region. `current` are
    /// the stored records, available for delta requests.
    async fn fetch_players(
        &self,
        server: &ServerConfig,
        ids: &[PlayerId],
        current: &[PlayerRecord],
    ) -> Result<StatBatch>;
}
