use anyhow::{anyhow, Context, Result};
use itertools::Itertools;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use tracing::{debug, instrument};

use super::reference::{ExpectedValues, ReferenceSource, TankInfo};
use super::{PlayerSnapshot, StatApi, StatBatch};
use crate::config::{Region, ServerConfig};
use crate::models::{MembershipEntry, PlayerId, PlayerInfo, PlayerRecord, VehicleStats};
use crate::util::env::{env_opt, env_parse, env_req};

const DEFAULT_WN8_EXPECTED_URL: &str = "https://static.modxvm.com/wn8-data-exp/json/wn8exp.json";

/// Public stat API client (one application id, all regions).
#[derive(Debug, Clone)]
pub struct WargamingApi {
    http: Client,
    application_id: String,
    expected_url: String,
    reference_region: Region,
}

#[derive(Debug, Deserialize)]
#[serde(bound(deserialize = "T: Deserialize<'de>"))]
struct Envelope<T> {
    status: String,
    #[serde(default)]
    data: Option<T>,
    #[serde(default)]
    meta: Option<Meta>,
    #[serde(default)]
    error: Option<Value>,
}

#[derive(Debug, Default, Deserialize)]
struct Meta {
    #[serde(default)]
    page_total: Option<u32>,
}

type ById<T> = HashMap<String, Option<T>>;

#[derive(Debug, Deserialize)]
struct InfoRow {
    nickname: Option<String>,
    client_language: Option<String>,
    clan_id: Option<i64>,
    last_battle_time: Option<i64>,
    #[serde(default)]
    statistics: Option<InfoStatistics>,
}

#[derive(Debug, Deserialize)]
struct InfoStatistics {
    #[serde(default)]
    random: Option<BattlesBlock>,
}

#[derive(Debug, Deserialize)]
struct BattlesBlock {
    #[serde(default)]
    battles: i64,
}

#[derive(Debug, Deserialize)]
struct TankRow {
    tank_id: i64,
    #[serde(default)]
    random: Option<TankBlock>,
}

#[derive(Debug, Default, Deserialize)]
struct TankBlock {
    #[serde(default)]
    battles: i64,
    #[serde(default)]
    wins: i64,
    #[serde(default)]
    damage_dealt: i64,
    #[serde(default)]
    frags: i64,
    #[serde(default)]
    spotted: i64,
    #[serde(default)]
    dropped_capture_points: i64,
}

#[derive(Debug, Deserialize)]
struct AchievementsRow {
    #[serde(default)]
    achievements: BTreeMap<String, i64>,
}

#[derive(Debug, Deserialize)]
struct ClanMemberRow {
    joined_at: i64,
    #[serde(default)]
    role: Option<String>,
    clan: Option<ClanRef>,
}

#[derive(Debug, Deserialize)]
struct ClanRef {
    clan_id: i64,
    #[serde(default)]
    tag: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ExpectedRow {
    #[serde(rename = "IDNum")]
    id: i64,
    #[serde(flatten)]
    values: ExpectedValues,
}

#[derive(Debug, Deserialize)]
struct ExpectedFile {
    data: Vec<ExpectedRow>,
}

impl WargamingApi {
    pub fn new(application_id: String, timeout: Duration) -> Result<Self> {
        let http = Client::builder()
            .user_agent("player-updater/0.1")
            .timeout(timeout)
            .build()
            .context("build http client")?;
        Ok(Self {
            http,
            application_id,
            expected_url: DEFAULT_WN8_EXPECTED_URL.to_string(),
            reference_region: Region::Eu,
        })
    }

    /// Env: WG_APPLICATION_ID (required), WG_API_TIMEOUT_SECS, WN8_EXPECTED_URL, WG_REFERENCE_REGION
    pub fn from_env() -> Result<Self> {
        let mut api = Self::new(
            env_req("WG_APPLICATION_ID")?,
            Duration::from_secs(env_parse("WG_API_TIMEOUT_SECS", 15u64)),
        )?;
        if let Some(url) = env_opt("WN8_EXPECTED_URL") {
            api.expected_url = url;
        }
        if let Some(region) = env_opt("WG_REFERENCE_REGION") {
            api.reference_region = region.parse()?;
        }
        Ok(api)
    }

    async fn get<T: DeserializeOwned>(
        &self,
        region: Region,
        path: &str,
        params: &[(&str, &str)],
    ) -> Result<(T, Meta)> {
        let url = format!("https://{}/wot/{}/", region.api_host(), path);
        let resp = self
            .http
            .get(&url)
            .query(&[("application_id", self.application_id.as_str())])
            .query(params)
            .send()
            .await
            .with_context(|| format!("GET {path} ({region})"))?
            .error_for_status()
            .with_context(|| format!("GET {path} ({region})"))?;
        let envelope: Envelope<T> = resp
            .json()
            .await
            .with_context(|| format!("decode {path} ({region})"))?;
        unwrap_envelope(path, envelope)
    }
}

fn unwrap_envelope<T>(path: &str, envelope: Envelope<T>) -> Result<(T, Meta)> {
    if envelope.status != "ok" {
        return Err(anyhow!(
            "{path}: api error {}",
            envelope.error.unwrap_or(Value::Null)
        ));
    }
    let data = envelope
        .data
        .ok_or_else(|| anyhow!("{path}: response without data"))?;
    Ok((data, envelope.meta.unwrap_or_default()))
}

/// Joins the per-endpoint maps into one snapshot per id listed by `account/info`.
fn assemble(
    info: ById<InfoRow>,
    mut tanks: ById<Vec<TankRow>>,
    mut achievements: ById<AchievementsRow>,
    mut clans: ById<ClanMemberRow>,
    mut ratings: ById<Value>,
) -> StatBatch {
    let mut batch = StatBatch::default();
    for (key, row) in info {
        let Ok(id) = key.parse::<PlayerId>() else {
            debug!(key = %key, "skipping non-numeric account key");
            continue;
        };
        let info = row.map(|r| PlayerInfo {
            nickname: r.nickname,
            battles: r
                .statistics
                .and_then(|s| s.random)
                .map(|b| b.battles)
                .unwrap_or(0),
            client_language: r.client_language,
            clan_id: r.clan_id,
            last_battle_time: r.last_battle_time,
        });
        let vehicles = tanks.remove(&key).flatten().map(|rows| {
            rows.into_iter()
                .map(|t| {
                    let b = t.random.unwrap_or_default();
                    VehicleStats {
                        tank_id: t.tank_id,
                        battles: b.battles,
                        wins: b.wins,
                        damage_dealt: b.damage_dealt,
                        frags: b.frags,
                        spotted: b.spotted,
                        dropped_capture_points: b.dropped_capture_points,
                    }
                })
                .collect()
        });
        let membership = clans
            .remove(&key)
            .flatten()
            .and_then(|m| {
                m.clan.map(|c| MembershipEntry {
                    joined_at: m.joined_at,
                    clan_id: c.clan_id,
                    clan_tag: c.tag,
                    role: m.role,
                })
            })
            .into_iter()
            .collect();
        let rating = ratings.remove(&key).flatten();
        let account_rating = rating
            .as_ref()
            .and_then(|r| r.pointer("/global_rating/value"))
            .and_then(Value::as_f64);
        batch.players.insert(
            id,
            PlayerSnapshot {
                info,
                vehicles,
                achievements: achievements
                    .remove(&key)
                    .flatten()
                    .map(|a| a.achievements)
                    .unwrap_or_default(),
                membership,
                account_rating,
                tanks_rating: rating,
            },
        );
    }
    batch
}

#[async_trait::async_trait]
impl StatApi for WargamingApi {
    #[instrument(skip(self, server, ids, _current), fields(region = %server.region, count = ids.len()))]
    async fn fetch_players(
        &self,
        server: &ServerConfig,
        ids: &[PlayerId],
        _current: &[PlayerRecord],
    ) -> Result<StatBatch> {
        if ids.is_empty() {
            return Ok(StatBatch::default());
        }
        let region = server.region;
        let account_id = ids.iter().join(",");
        let account_id = account_id.as_str();
        let info_params = [
            ("account_id", account_id),
            ("extra", "statistics.random"),
            (
                "fields",
                "nickname,client_language,clan_id,last_battle_time,statistics.random.battles",
            ),
        ];
        let tank_params = [
            ("account_id", account_id),
            ("extra", "random"),
            ("fields", "tank_id,random"),
        ];
        let achievement_params = [("account_id", account_id), ("fields", "achievements")];
        let clan_params = [("account_id", account_id)];
        let rating_params = [("account_id", account_id), ("type", "all")];

        let (info, tanks, achievements, clans, ratings) = futures::try_join!(
            self.get::<ById<InfoRow>>(region, "account/info", &info_params),
            self.get::<ById<Vec<TankRow>>>(region, "tanks/stats", &tank_params),
            self.get::<ById<AchievementsRow>>(region, "account/achievements", &achievement_params),
            self.get::<ById<ClanMemberRow>>(region, "clans/accountinfo", &clan_params),
            self.get::<ById<Value>>(region, "ratings/accounts", &rating_params),
        )?;
        Ok(assemble(info.0, tanks.0, achievements.0, clans.0, ratings.0))
    }
}

#[async_trait::async_trait]
impl ReferenceSource for WargamingApi {
    async fn load_tanks(&self) -> Result<HashMap<i64, TankInfo>> {
        let mut out = HashMap::new();
        let mut page = 1u32;
        loop {
            let page_no = page.to_string();
            let (rows, meta) = self
                .get::<ById<TankInfo>>(
                    self.reference_region,
                    "encyclopedia/vehicles",
                    &[("fields", "tier"), ("page_no", page_no.as_str())],
                )
                .await?;
            for (key, info) in rows {
                if let (Ok(id), Some(info)) = (key.parse::<i64>(), info) {
                    out.insert(id, info);
                }
            }
            if page >= meta.page_total.unwrap_or(1) {
                break;
            }
            page += 1;
        }
        Ok(out)
    }

    async fn load_expected(&self) -> Result<HashMap<i64, ExpectedValues>> {
        let file: ExpectedFile = self
            .http
            .get(&self.expected_url)
            .send()
            .await
            .context("GET wn8 expected values")?
            .error_for_status()?
            .json()
            .await
            .context("decode wn8 expected values")?;
        Ok(file.data.into_iter().map(|r| (r.id, r.values)).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn by_id<T: DeserializeOwned>(v: Value) -> ById<T> {
        serde_json::from_value(v).unwrap()
    }

    #[test]
    fn assembles_snapshots_from_endpoint_maps() {
        let info = by_id(json!({
            "10": {"nickname": "a", "client_language": "ru", "clan_id": 5, "last_battle_time": 1,
                   "statistics": {"random": {"battles": 150}}},
            "11": null
        }));
        let tanks = by_id(json!({
            "10": [{"tank_id": 1, "random": {"battles": 100, "wins": 60}},
                   {"tank_id": 2, "random": {"battles": 50}}],
            "11": null
        }));
        let achievements = by_id(json!({"10": {"achievements": {"medalKay": 2}}}));
        let clans = by_id(json!({
            "10": {"joined_at": 77, "role": "private", "clan": {"clan_id": 5, "tag": "ABC"}}
        }));
        let ratings = by_id(json!({"10": {"global_rating": {"value": 4321.0}}}));

        let batch = assemble(info, tanks, achievements, clans, ratings);
        assert_eq!(batch.len(), 2);

        let p = &batch.players[&10];
        let info = p.info.as_ref().unwrap();
        assert_eq!(info.battles, 150);
        assert_eq!(info.client_language.as_deref(), Some("ru"));
        let vehicles = p.vehicles.as_ref().unwrap();
        assert_eq!(vehicles.len(), 2);
        assert_eq!(vehicles[0].wins, 60);
        assert_eq!(p.achievements["medalKay"], 2);
        assert_eq!(p.membership[0].joined_at, 77);
        assert_eq!(p.membership[0].clan_tag.as_deref(), Some("ABC"));
        assert_eq!(p.account_rating, Some(4321.0));

        let hidden = &batch.players[&11];
        assert!(hidden.info.is_none());
        assert!(hidden.vehicles.is_none());
        assert!(hidden.membership.is_empty());
    }

    #[test]
    fn error_envelope_is_an_error() {
        let envelope: Envelope<ById<Value>> = serde_json::from_value(json!({
            "status": "error",
            "error": {"code": 407, "message": "REQUEST_LIMIT_EXCEEDED"}
        }))
        .unwrap();
        let err = unwrap_envelope("account/info", envelope).unwrap_err();
        assert!(err.to_string().contains("REQUEST_LIMIT_EXCEEDED"));
    }

    #[test]
    fn parses_expected_values_file() {
        let file: ExpectedFile = serde_json::from_value(json!({
            "header": {"version": 1},
            "data": [{"IDNum": 1, "expDef": 0.9, "expFrag": 1.1, "expSpot": 1.3,
                      "expDamage": 900.5, "expWinRate": 52.1}]
        }))
        .unwrap();
        assert_eq!(file.data[0].id, 1);
        assert_eq!(file.data[0].values.damage, 900.5);
    }
}
