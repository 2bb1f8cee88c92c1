pub mod backlog;
pub mod db;
pub mod players;

use anyhow::Result;
use chrono::Utc;
use std::fmt;
use std::sync::Arc;

use backlog::{BacklogStore, PgBacklogStore, RemoveScope};
use db::Db;
use players::{
    HiddenStats, PgHiddenStats, PgPlayerStore, PgTokenStore, PgUserRegistry, PlayerStore,
    TokenStore, UserRegistry,
};

use crate::models::PlayerId;

/// Why a claim was closed without writing a fresh player document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    TooManyRetries,
    StatHidden,
    NoBattleChange,
    NoBattleChangeAfterMerge,
    NoVehicles,
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SkipReason::TooManyRetries => "Too many retries",
            SkipReason::StatHidden => "Maybe stat is hidden",
            SkipReason::NoBattleChange => "No battle count changed - common check",
            SkipReason::NoBattleChangeAfterMerge => "No battle count changed - vehicles check",
            SkipReason::NoVehicles => "No vehicles",
        }
    }
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Every store the updater touches.
#[derive(Clone)]
pub struct Stores {
    pub backlog: Arc<dyn BacklogStore>,
    pub players: Arc<dyn PlayerStore>,
    pub tokens: Arc<dyn TokenStore>,
    pub users: Arc<dyn UserRegistry>,
    pub hidden: Arc<dyn HiddenStats>,
}

impl Stores {
    pub fn postgres(db: &Db) -> Self {
        Self {
            backlog: Arc::new(PgBacklogStore::new(db.clone())),
            players: Arc::new(PgPlayerStore::new(db.clone())),
            tokens: Arc::new(PgTokenStore::new(db.clone())),
            users: Arc::new(PgUserRegistry::new(db.clone())),
            hidden: Arc::new(PgHiddenStats::new(db.clone())),
        }
    }

    /// Drops the claim and stamps the player row with `reason`. Both writes are
    /// idempotent, so concurrent regions may repeat them safely.
    pub async fn skip_update(&self, id: PlayerId, reason: SkipReason) -> Result<()> {
        let now = Utc::now();
        let drop_claim = async {
            match reason {
                SkipReason::TooManyRetries => {
                    self.backlog.mark_abandoned(id, reason.as_str()).await
                }
                _ => self.backlog.remove(id, RemoveScope::Any).await,
            }
        };
        futures::try_join!(
            drop_claim,
            self.players.mark_skipped(id, reason.as_str(), now)
        )?;
        Ok(())
    }
}
