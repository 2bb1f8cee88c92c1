use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Player (account) identifier. Ids span several billion, so always 64-bit.
pub type PlayerId = i64;

/// Per-vehicle random battle totals.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VehicleStats {
    pub tank_id: i64,
    pub battles: i64,
    #[serde(default)]
    pub wins: i64,
    #[serde(default)]
    pub damage_dealt: i64,
    #[serde(default)]
    pub frags: i64,
    #[serde(default)]
    pub spotted: i64,
    #[serde(default)]
    pub dropped_capture_points: i64,
}

/// One clan membership period, keyed by the time the player joined.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MembershipEntry {
    pub joined_at: i64,
    pub clan_id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clan_tag: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
}

/// Tracking status of a player record.
///
/// Absent status means the player is not a registered user at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum PlayerStatus {
    /// Registered user who hides their battle stats.
    NoStat = 0,
    /// Registered user with stat visibility.
    Stat = 1,
}

impl From<PlayerStatus> for u8 {
    fn from(status: PlayerStatus) -> u8 {
        status as u8
    }
}

impl TryFrom<u8> for PlayerStatus {
    type Error = String;

    fn try_from(raw: u8) -> Result<Self, Self::Error> {
        match raw {
            0 => Ok(PlayerStatus::NoStat),
            1 => Ok(PlayerStatus::Stat),
            other => Err(format!("invalid player status {other}")),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlayerRecord {
    pub id: PlayerId,
    #[serde(default)]
    pub nickname: Option<String>,
    #[serde(rename = "b", default)]
    pub battle_count: i64,
    #[serde(rename = "v", default)]
    pub vehicles: Vec<VehicleStats>,
    #[serde(default)]
    pub achievements: BTreeMap<String, i64>,
    #[serde(default)]
    pub account_rating: Option<f64>,
    #[serde(default)]
    pub tanks_rating: Option<Value>,
    #[serde(rename = "memberhistory", default)]
    pub membership_history: Vec<MembershipEntry>,
    #[serde(rename = "lang", default)]
    pub language: Option<String>,
    #[serde(default)]
    pub flag: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<PlayerStatus>,
    #[serde(default)]
    pub clan_id: Option<i64>,
    #[serde(default)]
    pub avg_tier: Option<f64>,
    #[serde(default)]
    pub wn8: Option<f64>,
    #[serde(default)]
    pub last_battle_time: Option<i64>,
    #[serde(rename = "ts", default)]
    pub last_update_ts: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Account summary as returned by the stat API.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlayerInfo {
    pub nickname: Option<String>,
    /// Random battles played.
    pub battles: i64,
    pub client_language: Option<String>,
    pub clan_id: Option<i64>,
    pub last_battle_time: Option<i64>,
}

/// Per-player preferences a registered user sets through the auth service.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TokenServices {
    #[serde(default)]
    pub flag: Option<String>,
    #[serde(rename = "statBattle", default)]
    pub stat_battle: Option<bool>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TokenRecord {
    pub player_id: PlayerId,
    /// Epoch milliseconds.
    pub expires_at: i64,
    pub services: Option<TokenServices>,
}

impl TokenRecord {
    pub fn is_valid_at(&self, now_ms: i64) -> bool {
        self.expires_at > now_ms
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_serializes_as_integer() {
        let record = PlayerRecord {
            id: 7,
            status: Some(PlayerStatus::NoStat),
            ..Default::default()
        };
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["status"], 0);
        let back: PlayerRecord = serde_json::from_value(json).unwrap();
        assert_eq!(back.status, Some(PlayerStatus::NoStat));
    }

    #[test]
    fn untracked_status_is_omitted() {
        let json = serde_json::to_value(PlayerRecord::default()).unwrap();
        assert!(json.get("status").is_none());
        assert!(serde_json::from_value::<PlayerStatus>(serde_json::json!(3)).is_err());
    }
}
