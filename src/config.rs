//! Updater configuration: regional servers, queue thresholds and the id-space
//! partition each region owns. Values come from the environment (see
//! `util::env`), with defaults matching the production deployment.
use anyhow::{anyhow, bail, Result};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

use crate::util::env::{env_opt, env_parse};

/// Intensity used when a server entry omits one (or gives a non-positive value).
pub const DEFAULT_INTENSITY: f64 = 0.25;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Region {
    Ru,
    Eu,
    Na,
    Asia,
}

impl Region {
    pub const ALL: [Region; 4] = [Region::Ru, Region::Eu, Region::Na, Region::Asia];

    pub fn as_str(&self) -> &'static str {
        match self {
            Region::Ru => "RU",
            Region::Eu => "EU",
            Region::Na => "NA",
            Region::Asia => "ASIA",
        }
    }

    /// Host of the regional public stat API.
    pub fn api_host(&self) -> &'static str {
        match self {
            Region::Ru => "api.worldoftanks.ru",
            Region::Eu => "api.worldoftanks.eu",
            Region::Na => "api.worldoftanks.com",
            Region::Asia => "api.worldoftanks.asia",
        }
    }

    /// Account id ranges allocated to the region.
    pub fn default_id_ranges(&self) -> Vec<IdRange> {
        match self {
            Region::Ru => vec![
                IdRange::new(0, 500_000_000),
                IdRange::new(3_000_000_000, 4_000_000_000),
            ],
            Region::Eu => vec![IdRange::new(500_000_000, 1_000_000_000)],
            Region::Na => vec![IdRange::new(1_000_000_000, 2_000_000_000)],
            Region::Asia => vec![IdRange::new(2_000_000_000, 3_000_000_000)],
        }
    }
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Region {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "RU" => Ok(Region::Ru),
            "EU" => Ok(Region::Eu),
            "NA" | "COM" => Ok(Region::Na),
            "ASIA" => Ok(Region::Asia),
            other => Err(anyhow!("unknown region {other:?}")),
        }
    }
}

/// Half-open `[min, max)` slice of the global player id space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdRange {
    pub min: i64,
    pub max: i64,
}

impl IdRange {
    pub const fn new(min: i64, max: i64) -> Self {
        Self { min, max }
    }

    pub fn contains(&self, id: i64) -> bool {
        id >= self.min && id < self.max
    }
}

impl FromStr for IdRange {
    type Err = anyhow::Error;

    /// `min-max`, half-open.
    fn from_str(s: &str) -> Result<Self> {
        let (min, max) = s
            .trim()
            .split_once('-')
            .ok_or_else(|| anyhow!("id range {s:?} is not min-max"))?;
        let min: i64 = min
            .trim()
            .parse()
            .map_err(|e| anyhow!("id range {s:?}: bad min: {e}"))?;
        let max: i64 = max
            .trim()
            .parse()
            .map_err(|e| anyhow!("id range {s:?}: bad max: {e}"))?;
        if min < 0 || max <= min {
            bail!("id range {s:?} is empty or negative");
        }
        Ok(Self::new(min, max))
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub name: String,
    pub region: Region,
    /// Only master servers refill the region queue from the backlog.
    pub master: bool,
    /// Target batches per second.
    pub intensity: f64,
    pub id_ranges: Vec<IdRange>,
}

impl ServerConfig {
    pub fn new(region: Region, master: bool, intensity: f64) -> Self {
        Self {
            name: region.as_str().to_ascii_lowercase(),
            region,
            master,
            intensity,
            id_ranges: region.default_id_ranges(),
        }
    }

    /// `ceil(1000 / intensity)` milliseconds between ticks.
    pub fn tick_interval(&self) -> Duration {
        let intensity = if self.intensity.is_finite() && self.intensity > 0.0 {
            self.intensity
        } else {
            DEFAULT_INTENSITY
        };
        Duration::from_millis((1000.0 / intensity).ceil() as u64)
    }
}

/// Parses one `REGION[:master][:intensity][:ranges]` entry of `UPDATER_SERVERS`.
/// `ranges` is `min-max` joined by `+` and replaces the region's default id
/// ranges, so several masters of one region can split its id space.
fn parse_server(entry: &str, index: usize) -> Result<ServerConfig> {
    let mut parts = entry.split(':').map(str::trim);
    let region: Region = parts
        .next()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| anyhow!("empty server entry at position {index}"))?
        .parse()?;
    let master = match parts.next() {
        None | Some("") | Some("slave") => false,
        Some("master") => true,
        Some(other) => bail!("server {index}: expected 'master' or empty role, got {other:?}"),
    };
    let intensity = match parts.next() {
        None | Some("") => DEFAULT_INTENSITY,
        Some(raw) => raw
            .parse::<f64>()
            .map_err(|e| anyhow!("server {index}: bad intensity {raw:?}: {e}"))?,
    };
    let mut server = ServerConfig::new(region, master, intensity);
    if let Some(raw) = parts.next().filter(|s| !s.is_empty()) {
        server.id_ranges = raw
            .split('+')
            .map(str::parse)
            .collect::<Result<Vec<IdRange>>>()
            .map_err(|e| anyhow!("server {index}: {e:#}"))?;
    }
    if let Some(extra) = parts.next() {
        bail!("server {index}: unexpected trailing segment {extra:?}");
    }
    server.name = format!("{}-{index}", server.name);
    Ok(server)
}

pub fn parse_servers(raw: &str) -> Result<Vec<ServerConfig>> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .enumerate()
        .map(|(i, entry)| parse_server(entry, i))
        .collect()
}

#[derive(Debug, Clone)]
pub struct UpdaterConfig {
    pub servers: Vec<ServerConfig>,
    /// Target size of a region queue after a refill.
    pub pool_size: usize,
    /// Master servers refill once the queue drops below this length.
    pub fetch_threshold: usize,
    /// Player ids handed to one batch update.
    pub http_batch_size: usize,
    /// Players at or below this battle count are only kept when tracked.
    pub battles_trash_hold: i64,
    pub reference_refresh: Duration,
}

impl Default for UpdaterConfig {
    fn default() -> Self {
        Self {
            servers: Region::ALL
                .iter()
                .map(|r| ServerConfig::new(*r, true, DEFAULT_INTENSITY))
                .collect(),
            pool_size: 500,
            fetch_threshold: 100,
            http_batch_size: 100,
            battles_trash_hold: 100,
            reference_refresh: Duration::from_secs(3600),
        }
    }
}

impl UpdaterConfig {
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();
        let servers = match env_opt("UPDATER_SERVERS") {
            Some(raw) => parse_servers(&raw)?,
            None => defaults.servers,
        };
        if servers.is_empty() {
            bail!("UPDATER_SERVERS did not contain any server");
        }
        if !servers.iter().any(|s| s.master) {
            warn!("no master server configured; backlog will never be refilled");
        }
        let config = Self {
            servers,
            pool_size: env_parse("UPDATER_POOL_SIZE", defaults.pool_size),
            fetch_threshold: env_parse("UPDATER_FETCH_THRESHOLD", defaults.fetch_threshold),
            http_batch_size: env_parse("UPDATER_HTTP_BATCH_SIZE", defaults.http_batch_size).max(1),
            battles_trash_hold: env_parse("BATTLES_TRASH_HOLD", defaults.battles_trash_hold),
            reference_refresh: Duration::from_secs(env_parse("REFERENCE_REFRESH_SECS", 3600u64)),
        };
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_server_list() {
        let servers = parse_servers("RU:master:4, EU::2.5,na").unwrap();
        assert_eq!(servers.len(), 3);
        assert_eq!(servers[0].region, Region::Ru);
        assert!(servers[0].master);
        assert_eq!(servers[0].intensity, 4.0);
        assert!(!servers[1].master);
        assert_eq!(servers[2].region, Region::Na);
        assert_eq!(servers[2].intensity, DEFAULT_INTENSITY);
        assert_eq!(servers[2].name, "na-2");
    }

    #[test]
    fn server_entry_overrides_id_ranges() {
        let raw = "EU:master:1:500000000-750000000,\
                   EU:master:1:750000000-800000000+900000000-1000000000,\
                   EU";
        let servers = parse_servers(raw).unwrap();
        assert_eq!(servers[0].id_ranges, vec![IdRange::new(500_000_000, 750_000_000)]);
        assert_eq!(
            servers[1].id_ranges,
            vec![
                IdRange::new(750_000_000, 800_000_000),
                IdRange::new(900_000_000, 1_000_000_000)
            ]
        );
        assert_eq!(servers[2].id_ranges, Region::Eu.default_id_ranges());
    }

    #[test]
    fn rejects_malformed_id_ranges() {
        assert!(parse_servers("EU:master:1:10").is_err());
        assert!(parse_servers("EU:master:1:20-10").is_err());
        assert!(parse_servers("EU:master:1:0-10:extra").is_err());
    }

    #[test]
    fn rejects_unknown_role() {
        assert!(parse_servers("EU:leader").is_err());
        assert!(parse_servers("MARS:master").is_err());
    }

    #[test]
    fn tick_interval_rounds_up() {
        assert_eq!(
            ServerConfig::new(Region::Eu, true, 3.0).tick_interval(),
            Duration::from_millis(334)
        );
        assert_eq!(
            ServerConfig::new(Region::Eu, true, 0.0).tick_interval(),
            Duration::from_millis(4000)
        );
    }

    #[test]
    fn ru_owns_two_ranges() {
        let ranges = Region::Ru.default_id_ranges();
        assert!(ranges.iter().any(|r| r.contains(3_500_000_000)));
        assert!(!ranges.iter().any(|r| r.contains(500_000_000)));
    }
}
