//! In-memory stores and a scripted stat API for updater tests.
use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use futures::stream::{self, BoxStream, StreamExt};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::config::ServerConfig;
use crate::database_ops::backlog::{BacklogStore, Claim, ClaimUpdate, EligibilityFilter, RemoveScope};
use crate::database_ops::players::{HiddenStats, PlayerStore, TokenStore, UserRegistry};
use crate::database_ops::Stores;
use crate::models::{PlayerId, PlayerRecord, TokenRecord};
use crate::stat_api::{StatApi, StatBatch};

#[derive(Default)]
pub struct MemoryBacklog {
    pub claims: Mutex<BTreeMap<PlayerId, Claim>>,
    pub fail_count: AtomicBool,
    pub fail_claim: AtomicBool,
}

impl MemoryBacklog {
    pub fn insert(&self, claim: Claim) {
        self.claims.lock().unwrap().insert(claim.id, claim);
    }

    pub fn get(&self, id: PlayerId) -> Option<Claim> {
        self.claims.lock().unwrap().get(&id).cloned()
    }

    fn eligible(&self, filter: &EligibilityFilter) -> Vec<Claim> {
        let mut out: Vec<Claim> = self
            .claims
            .lock()
            .unwrap()
            .values()
            .filter(|c| filter.matches(c))
            .cloned()
            .collect();
        out.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.ts.cmp(&b.ts)));
        out
    }
}

#[async_trait::async_trait]
impl BacklogStore for MemoryBacklog {
    async fn count_eligible(&self, filter: &EligibilityFilter) -> Result<u64> {
        if self.fail_count.load(Ordering::SeqCst) {
            bail!("backlog unavailable");
        }
        Ok(self.eligible(filter).len() as u64)
    }

    fn query_eligible<'a>(
        &'a self,
        filter: &'a EligibilityFilter,
        limit: usize,
    ) -> BoxStream<'a, Result<Claim>> {
        let claims: Vec<Result<Claim>> = self.eligible(filter).into_iter().take(limit).map(Ok).collect();
        stream::iter(claims).boxed()
    }

    async fn claim_batch(&self, updates: &[ClaimUpdate]) -> Result<()> {
        if self.fail_claim.load(Ordering::SeqCst) {
            bail!("claim write rejected");
        }
        let mut claims = self.claims.lock().unwrap();
        for u in updates {
            if let Some(c) = claims.get_mut(&u.id) {
                c.retry = u.retry;
                c.postponed = Some(u.postponed);
                c.ts = u.ts;
                c.priority = u.priority;
            }
        }
        Ok(())
    }

    async fn remove(&self, id: PlayerId, scope: RemoveScope) -> Result<()> {
        let mut claims = self.claims.lock().unwrap();
        let keep = scope == RemoveScope::UnlessClan && claims.get(&id).is_some_and(Claim::is_clan);
        if !keep {
            claims.remove(&id);
        }
        Ok(())
    }

    async fn mark_problem(&self, id: PlayerId, reason: &Value) -> Result<()> {
        self.claims
            .lock()
            .unwrap()
            .entry(id)
            .or_insert_with(|| Claim {
                id,
                ..Default::default()
            })
            .reason = Some(reason.clone());
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryPlayers {
    pub records: Mutex<BTreeMap<PlayerId, PlayerRecord>>,
    pub upserts: AtomicUsize,
    pub fail_find: AtomicBool,
    pub fail_upsert: AtomicBool,
}

impl MemoryPlayers {
    pub fn insert(&self, record: PlayerRecord) {
        self.records.lock().unwrap().insert(record.id, record);
    }

    pub fn get(&self, id: PlayerId) -> Option<PlayerRecord> {
        self.records.lock().unwrap().get(&id).cloned()
    }
}

#[async_trait::async_trait]
impl PlayerStore for MemoryPlayers {
    async fn find_many(&self, ids: &[PlayerId]) -> Result<Vec<PlayerRecord>> {
        if self.fail_find.load(Ordering::SeqCst) {
            bail!("players unavailable");
        }
        let records = self.records.lock().unwrap();
        Ok(ids
            .iter()
            .filter_map(|id| records.get(id))
            .map(|r| PlayerRecord {
                vehicles: Vec::new(),
                ..r.clone()
            })
            .collect())
    }

    async fn upsert(&self, record: &PlayerRecord) -> Result<()> {
        if self.fail_upsert.load(Ordering::SeqCst) {
            bail!("write conflict");
        }
        self.upserts.fetch_add(1, Ordering::SeqCst);
        self.insert(record.clone());
        Ok(())
    }

    async fn mark_skipped(&self, id: PlayerId, reason: &str, at: DateTime<Utc>) -> Result<()> {
        let mut records = self.records.lock().unwrap();
        let record = records.entry(id).or_insert_with(|| PlayerRecord {
            id,
            ..Default::default()
        });
        record.last_update_ts = at.timestamp_millis();
        record.reason = Some(reason.to_string());
        Ok(())
    }

    async fn delete(&self, id: PlayerId) -> Result<bool> {
        Ok(self.records.lock().unwrap().remove(&id).is_some())
    }
}

#[derive(Default)]
pub struct MemoryTokens {
    pub tokens: Mutex<HashMap<PlayerId, TokenRecord>>,
}

#[async_trait::async_trait]
impl TokenStore for MemoryTokens {
    async fn find(&self, id: PlayerId) -> Result<Option<TokenRecord>> {
        Ok(self.tokens.lock().unwrap().get(&id).cloned())
    }
}

#[derive(Default)]
pub struct MemoryUsers {
    pub ids: Mutex<HashSet<PlayerId>>,
}

#[async_trait::async_trait]
impl UserRegistry for MemoryUsers {
    async fn is_tracked(&self, id: PlayerId) -> Result<bool> {
        Ok(self.ids.lock().unwrap().contains(&id))
    }
}

#[derive(Default)]
pub struct MemoryHidden {
    pub flagged: Mutex<HashSet<PlayerId>>,
    pub cleared: Mutex<Vec<PlayerId>>,
}

#[async_trait::async_trait]
impl HiddenStats for MemoryHidden {
    async fn flag_hidden(&self, id: PlayerId) -> Result<()> {
        self.flagged.lock().unwrap().insert(id);
        Ok(())
    }

    async fn clear_hidden(&self, id: PlayerId) -> Result<()> {
        self.flagged.lock().unwrap().remove(&id);
        self.cleared.lock().unwrap().push(id);
        Ok(())
    }
}

/// Keeps typed handles next to the trait objects handed to the updater.
#[derive(Default, Clone)]
pub struct MemoryStores {
    pub backlog: Arc<MemoryBacklog>,
    pub players: Arc<MemoryPlayers>,
    pub tokens: Arc<MemoryTokens>,
    pub users: Arc<MemoryUsers>,
    pub hidden: Arc<MemoryHidden>,
}

impl MemoryStores {
    pub fn stores(&self) -> Stores {
        Stores {
            backlog: self.backlog.clone(),
            players: self.players.clone(),
            tokens: self.tokens.clone(),
            users: self.users.clone(),
            hidden: self.hidden.clone(),
        }
    }
}

/// Answers every request with the same scripted batch, or an error.
#[derive(Default)]
pub struct ScriptedApi {
    pub response: Mutex<StatBatch>,
    pub error: Mutex<Option<String>>,
    pub calls: AtomicUsize,
    /// Ids of the stored records passed along with the last request.
    pub last_current: Mutex<Vec<PlayerId>>,
}

impl ScriptedApi {
    pub fn respond(&self, batch: StatBatch) {
        *self.response.lock().unwrap() = batch;
    }

    pub fn fail(&self, message: &str) {
        *self.error.lock().unwrap() = Some(message.to_string());
    }
}

#[async_trait::async_trait]
impl StatApi for ScriptedApi {
    async fn fetch_players(
        &self,
        _server: &ServerConfig,
        _ids: &[PlayerId],
        current: &[PlayerRecord],
    ) -> Result<StatBatch> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.last_current.lock().unwrap() = current.iter().map(|r| r.id).collect();
        if let Some(message) = self.error.lock().unwrap().clone() {
            bail!(message);
        }
        Ok(self.response.lock().unwrap().clone())
    }
}
