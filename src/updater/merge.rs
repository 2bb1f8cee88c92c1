//! Decisions that reconcile a fresh API snapshot with the stored record.
//!
//! Everything here is pure; `batch` owns the side effects.
use std::collections::BTreeMap;

use serde_json::Value;

use crate::config::Region;
use crate::models::{
    MembershipEntry, PlayerId, PlayerInfo, PlayerRecord, PlayerStatus, TokenRecord, TokenServices,
    VehicleStats,
};
use crate::stat_api::reference::ReferenceData;
use crate::stat_api::PlayerSnapshot;

/// Language and flag value meaning "use the region's default locale".
pub const DEFAULT_LOCALE: &str = "default";

/// Snapshot that passed triage: info and vehicles are both present.
#[derive(Debug, Clone, PartialEq)]
pub struct FreshPlayer {
    pub info: PlayerInfo,
    pub vehicles: Vec<VehicleStats>,
    pub achievements: BTreeMap<String, i64>,
    pub membership: Vec<MembershipEntry>,
    pub account_rating: Option<f64>,
    pub tanks_rating: Option<Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Triage {
    /// Null info for a player we know has battles.
    Hidden,
    /// Battle count matches the stored one.
    Unchanged,
    NoVehicles,
    /// Null info and nothing else to act on.
    NoData,
    Refresh(FreshPlayer),
}

/// Checks run in order; the first that matches decides.
pub fn triage(snapshot: PlayerSnapshot, stored_battles: i64) -> Triage {
    let PlayerSnapshot {
        info,
        vehicles,
        achievements,
        membership,
        account_rating,
        tanks_rating,
    } = snapshot;

    if info.is_none() && stored_battles > 0 {
        return Triage::Hidden;
    }
    if info.as_ref().map_or(0, |i| i.battles) == stored_battles {
        return Triage::Unchanged;
    }
    let Some(vehicles) = vehicles else {
        return Triage::NoVehicles;
    };
    let Some(info) = info else {
        return Triage::NoData;
    };
    Triage::Refresh(FreshPlayer {
        info,
        vehicles,
        achievements,
        membership,
        account_rating,
        tanks_rating,
    })
}

/// Union of both histories keyed by `joined_at`; on a shared key the fresh
/// entry replaces the stored one. Result is ordered by `joined_at`.
pub fn merge_membership(
    stored: &[MembershipEntry],
    fresh: Vec<MembershipEntry>,
) -> Vec<MembershipEntry> {
    let mut by_join: BTreeMap<i64, MembershipEntry> = stored
        .iter()
        .map(|e| (e.joined_at, e.clone()))
        .collect();
    by_join.extend(fresh.into_iter().map(|e| (e.joined_at, e)));
    by_join.into_values().collect()
}

/// Builds the document to store for a refreshed player. Locale and status are
/// resolved separately once token and registry lookups are done.
pub fn build_record(
    id: PlayerId,
    fresh: FreshPlayer,
    stored: Option<&PlayerRecord>,
    reference: &ReferenceData,
    now_ms: i64,
) -> PlayerRecord {
    let vehicles = reference.known_vehicles(fresh.vehicles);
    let vehicle_battles: i64 = vehicles.iter().map(|v| v.battles).sum();
    let battle_count = if vehicle_battles > 0 {
        vehicle_battles
    } else {
        fresh.info.battles
    };
    let history = stored.map_or(&[][..], |s| s.membership_history.as_slice());

    PlayerRecord {
        id,
        nickname: fresh.info.nickname,
        battle_count,
        avg_tier: reference.avg_tier(&vehicles),
        wn8: reference.wn8(&vehicles),
        vehicles,
        achievements: fresh.achievements,
        account_rating: fresh.account_rating,
        tanks_rating: fresh.tanks_rating,
        membership_history: merge_membership(history, fresh.membership),
        language: fresh.info.client_language,
        flag: None,
        status: None,
        clan_id: fresh.info.clan_id,
        last_battle_time: fresh.info.last_battle_time,
        last_update_ts: now_ms,
        reason: None,
    }
}

/// Sets `language` and `flag`. A valid token's explicit country flag wins;
/// otherwise the region's native language collapses to the default locale and
/// anything else gets the flag of its language.
pub fn resolve_locale(record: &mut PlayerRecord, token: Option<&TokenServices>, region: Region) {
    let token_flag = token
        .and_then(|s| s.flag.as_deref())
        .filter(|f| *f != DEFAULT_LOCALE && is_country_code(f));
    if let Some(flag) = token_flag {
        record.language = Some(flag.to_string());
        record.flag = Some(flag.to_string());
        return;
    }

    let native = matches!(
        (record.language.as_deref(), region),
        (Some("ru"), Region::Ru) | (Some("en"), Region::Na | Region::Eu | Region::Asia)
    );
    if native {
        record.language = Some(DEFAULT_LOCALE.to_string());
        record.flag = Some(DEFAULT_LOCALE.to_string());
    } else {
        record.flag = Some(flag_for_language(record.language.as_deref()).to_string());
    }
}

/// `valid_token` must already be filtered by expiry.
pub fn resolve_status(valid_token: Option<&TokenRecord>, tracked: bool) -> Option<PlayerStatus> {
    match valid_token {
        Some(token) => match token.services.as_ref().and_then(|s| s.stat_battle) {
            Some(false) => Some(PlayerStatus::NoStat),
            Some(true) | None => Some(PlayerStatus::Stat),
        },
        None if tracked => Some(PlayerStatus::NoStat),
        None => None,
    }
}

const COUNTRY_CODES: &str = "\
    ad ae af ag ai al am ao aq ar as at au aw ax az \
    ba bb bd be bf bg bh bi bj bl bm bn bo bq br bs bt bv bw by bz \
    ca cc cd cf cg ch ci ck cl cm cn co cr cu cv cw cx cy cz \
    de dj dk dm do dz ec ee eg eh er es et fi fj fk fm fo fr \
    ga gb gd ge gf gg gh gi gl gm gn gp gq gr gs gt gu gw gy \
    hk hm hn hr ht hu id ie il im in io iq ir is it je jm jo jp \
    ke kg kh ki km kn kp kr kw ky kz la lb lc li lk lr ls lt lu lv ly \
    ma mc md me mf mg mh mk ml mm mn mo mp mq mr ms mt mu mv mw mx my mz \
    na nc ne nf ng ni nl no np nr nu nz om \
    pa pe pf pg ph pk pl pm pn pr ps pt pw py qa re ro rs ru rw \
    sa sb sc sd se sg sh si sj sk sl sm sn so sr ss st sv sx sy sz \
    tc td tf tg th tj tk tl tm tn to tr tt tv tw tz \
    ua ug um us uy uz va vc ve vg vi vn vu wf ws ye yt za zm zw";

/// ISO 3166-1 alpha-2, lowercase.
pub fn is_country_code(code: &str) -> bool {
    code.len() == 2 && COUNTRY_CODES.split_whitespace().any(|c| c == code)
}

/// Country flag for a client language, `default` when there is no sensible one.
pub fn flag_for_language(language: Option<&str>) -> &str {
    let Some(lang) = language else {
        return DEFAULT_LOCALE;
    };
    match lang {
        "en" => "gb",
        "cs" => "cz",
        "uk" => "ua",
        "be" => "by",
        "kk" => "kz",
        "ja" => "jp",
        "ko" => "kr",
        "vi" => "vn",
        "el" => "gr",
        "sv" => "se",
        "da" => "dk",
        "et" => "ee",
        "sr" => "rs",
        "zh-cn" | "zh" => "cn",
        "zh-tw" => "tw",
        "pt-br" => "br",
        other if is_country_code(other) => other,
        _ => DEFAULT_LOCALE,
    }
}
