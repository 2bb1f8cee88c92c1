use anyhow::Result;
use chrono::Utc;
use futures::future::join_all;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, error, instrument, warn};

use super::merge::{build_record, resolve_locale, resolve_status, triage, Triage};
use super::region::RegionState;
use crate::config::ServerConfig;
use crate::database_ops::backlog::RemoveScope;
use crate::database_ops::{SkipReason, Stores};
use crate::models::{PlayerId, PlayerRecord};
use crate::stat_api::reference::{ReferenceCache, ReferenceData};
use crate::stat_api::{PlayerSnapshot, StatApi};

/// What happened to one player of a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayerOutcome {
    Hidden,
    Unchanged,
    UnchangedAfterMerge,
    NoVehicles,
    /// Nothing returned for the player; claim left as is.
    NoData,
    Upserted,
    /// Upsert failed and was logged; the claim is still closed.
    UpsertFailed,
    /// Fell below the battle threshold and was not tracked; stored record deleted.
    Dropped,
    /// Below the threshold with nothing stored.
    Ignored,
}

pub struct BatchUpdater {
    stores: Stores,
    api: Arc<dyn StatApi>,
    reference: Arc<ReferenceCache>,
    battles_trash_hold: i64,
}

impl BatchUpdater {
    pub fn new(
        stores: Stores,
        api: Arc<dyn StatApi>,
        reference: Arc<ReferenceCache>,
        battles_trash_hold: i64,
    ) -> Self {
        Self {
            stores,
            api,
            reference,
            battles_trash_hold,
        }
    }

    /// Refreshes one batch of players. Never fails: a batch-level error marks
    /// every id as a problem claim and counts as a single failure.
    #[instrument(skip_all, fields(region = %server.region, server = %server.name, batch = ids.len()))]
    pub async fn process(
        &self,
        server: &ServerConfig,
        state: &RegionState,
        ids: Vec<PlayerId>,
    ) -> Vec<(PlayerId, PlayerOutcome)> {
        if ids.is_empty() {
            debug!("empty batch");
            return Vec::new();
        }
        match self.try_process(server, state, &ids).await {
            Ok(outcomes) => outcomes,
            Err(e) => {
                self.fail_batch(server, state, &ids, e).await;
                Vec::new()
            }
        }
    }

    async fn try_process(
        &self,
        server: &ServerConfig,
        state: &RegionState,
        ids: &[PlayerId],
    ) -> Result<Vec<(PlayerId, PlayerOutcome)>> {
        let current = self.stores.players.find_many(ids).await?;
        let batch = self.api.fetch_players(server, ids, &current).await?;
        let stored: HashMap<PlayerId, PlayerRecord> =
            current.into_iter().map(|r| (r.id, r)).collect();
        let reference = self.reference.snapshot();

        let mut outcomes = Vec::with_capacity(batch.len());
        // Sequential on purpose: token and registry lookups stay ordered per player.
        for (id, snapshot) in batch.players {
            let outcome = self
                .process_player(server, id, snapshot, stored.get(&id), &reference)
                .await?;
            match outcome {
                PlayerOutcome::NoData => {}
                PlayerOutcome::NoVehicles => state.record_failure(json!({
                    "message": SkipReason::NoVehicles.as_str(),
                    "playerId": id,
                })),
                _ => state.record_success(),
            }
            outcomes.push((id, outcome));
        }
        Ok(outcomes)
    }

    async fn process_player(
        &self,
        server: &ServerConfig,
        id: PlayerId,
        snapshot: PlayerSnapshot,
        stored: Option<&PlayerRecord>,
        reference: &ReferenceData,
    ) -> Result<PlayerOutcome> {
        let stores = &self.stores;
        let stored_battles = stored.map_or(0, |r| r.battle_count);

        let fresh = match triage(snapshot, stored_battles) {
            Triage::Hidden => {
                stores.hidden.flag_hidden(id).await?;
                stores.skip_update(id, SkipReason::StatHidden).await?;
                return Ok(PlayerOutcome::Hidden);
            }
            Triage::Unchanged => {
                stores.skip_update(id, SkipReason::NoBattleChange).await?;
                return Ok(PlayerOutcome::Unchanged);
            }
            Triage::NoVehicles => {
                stores.skip_update(id, SkipReason::NoVehicles).await?;
                return Ok(PlayerOutcome::NoVehicles);
            }
            Triage::NoData => return Ok(PlayerOutcome::NoData),
            Triage::Refresh(fresh) => fresh,
        };

        stores.hidden.clear_hidden(id).await?;
        let now = Utc::now().timestamp_millis();
        let fresh_battles = fresh.info.battles;
        let mut record = build_record(id, fresh, stored, reference, now);
        if record.battle_count == stored_battles {
            stores
                .skip_update(id, SkipReason::NoBattleChangeAfterMerge)
                .await?;
            return Ok(PlayerOutcome::UnchangedAfterMerge);
        }

        let tracked = stores.users.is_tracked(id).await?;
        let outcome = if fresh_battles > self.battles_trash_hold || tracked {
            let token = stores.tokens.find(id).await?.filter(|t| t.is_valid_at(now));
            resolve_locale(
                &mut record,
                token.as_ref().and_then(|t| t.services.as_ref()),
                server.region,
            );
            record.status = resolve_status(token.as_ref(), tracked);
            match stores.players.upsert(&record).await {
                Ok(()) => PlayerOutcome::Upserted,
                Err(e) => {
                    error!(player_id = id, error = %format!("{e:#}"), "player update failed");
                    PlayerOutcome::UpsertFailed
                }
            }
        } else if stored_battles > 0 {
            stores.players.delete(id).await?;
            PlayerOutcome::Dropped
        } else {
            PlayerOutcome::Ignored
        };

        stores.backlog.remove(id, RemoveScope::UnlessClan).await?;
        Ok(outcome)
    }

    async fn fail_batch(
        &self,
        server: &ServerConfig,
        state: &RegionState,
        ids: &[PlayerId],
        err: anyhow::Error,
    ) {
        let message = format!("{err:#}");
        error!(
            region = %server.region,
            error = %message,
            player_ids = ?ids,
            "{} something went wrong during batch update",
            server.region
        );
        state.record_failure(json!({ "error": message, "player_ids": ids }));

        let reason = json!({ "error": message });
        let marks = ids
            .iter()
            .map(|id| self.stores.backlog.mark_problem(*id, &reason));
        for (id, res) in ids.iter().zip(join_all(marks).await) {
            if let Err(e) = res {
                warn!(player_id = *id, error = %format!("{e:#}"), "mark problem claim failed");
            }
        }
    }
}
