//! Gateway configuration
//!
//! Loaded from a TOML file with `STALKER_GATEWAY_*` environment overrides
//! via figment. Durations are humantime strings ("30s", "12h"); they are
//! parsed strictly once during [`Config::validate`] so a bad value fails at
//! startup instead of mid-refresh.

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::time::Duration;

use crate::errors::{AppError, AppResult};
use crate::models::{DownstreamUser, Portal};
use crate::proxy::ProxyDescriptor;
use crate::utils::normalize_mac;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub web: WebConfig,
    #[serde(default)]
    pub streaming: StreamingConfig,
    #[serde(default)]
    pub refresh: RefreshConfig,
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub epg: EpgConfig,
    #[serde(default)]
    pub tunnel: TunnelConfig,
    #[serde(default)]
    pub portals: Vec<PortalEntry>,
    #[serde(default)]
    pub users: Vec<UserEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Externally visible base URL; derived from the request when unset
    pub base_url: Option<String>,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    8001
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            base_url: None,
        }
    }
}

/// How resolved upstream links are handed to the player.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamingMode {
    /// 302 to the upstream link; cheapest, exposes the upstream URL
    Redirect,
    /// ffmpeg copy-remux to MPEG-TS piped through the response
    Remux,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamingConfig {
    #[serde(default = "default_streaming_mode")]
    pub mode: StreamingMode,
    #[serde(default = "default_ffmpeg_path")]
    pub ffmpeg_path: String,
    #[serde(default = "default_ffprobe_path")]
    pub ffprobe_path: String,
    /// ffmpeg argv template; `<url>`, `<proxy>` and `<timeout>` are replaced
    #[serde(default = "default_ffmpeg_command")]
    pub ffmpeg_command: String,
    /// ffprobe the resolved link before answering the player
    #[serde(default)]
    pub test_streams: bool,
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout: String,
}

fn default_streaming_mode() -> StreamingMode {
    StreamingMode::Redirect
}
fn default_ffmpeg_path() -> String {
    "ffmpeg".to_string()
}
fn default_ffprobe_path() -> String {
    "ffprobe".to_string()
}
fn default_ffmpeg_command() -> String {
    "-re -http_proxy <proxy> -timeout <timeout> -i <url> -map 0 -codec copy -f mpegts \
     -flush_packets 0 -fflags +nobuffer -flags low_delay -analyzeduration 0 -probesize 32 \
     -copyts pipe:"
        .to_string()
}
fn default_probe_timeout() -> String {
    "5s".to_string()
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            mode: default_streaming_mode(),
            ffmpeg_path: default_ffmpeg_path(),
            ffprobe_path: default_ffprobe_path(),
            ffmpeg_command: default_ffmpeg_command(),
            test_streams: false,
            probe_timeout: default_probe_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefreshConfig {
    #[serde(default = "default_catalog_interval")]
    pub catalog_interval: String,
    #[serde(default = "default_epg_interval")]
    pub epg_interval: String,
    #[serde(default = "default_watchdog_interval")]
    pub watchdog_interval: String,
    /// EPG merge window requested from portals, in hours
    #[serde(default = "default_epg_window_hours")]
    pub epg_window_hours: u32,
}

fn default_catalog_interval() -> String {
    "12h".to_string()
}
fn default_epg_interval() -> String {
    "30m".to_string()
}
fn default_watchdog_interval() -> String {
    "30s".to_string()
}
fn default_epg_window_hours() -> u32 {
    24
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            catalog_interval: default_catalog_interval(),
            epg_interval: default_epg_interval(),
            watchdog_interval: default_watchdog_interval(),
            epg_window_hours: default_epg_window_hours(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Consecutive failures before a MAC is marked unreachable
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// How long an unreachable MAC stays excluded before being retried
    #[serde(default = "default_mac_cooldown")]
    pub mac_cooldown: String,
    /// A leased MAC without liveness for this long is force-released
    #[serde(default = "default_liveness_timeout")]
    pub liveness_timeout: String,
}

fn default_failure_threshold() -> u32 {
    3
}
fn default_mac_cooldown() -> String {
    "5m".to_string()
}
fn default_liveness_timeout() -> String {
    "60s".to_string()
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            mac_cooldown: default_mac_cooldown(),
            liveness_timeout: default_liveness_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EpgConfig {
    #[serde(default)]
    pub fallback_enabled: bool,
    /// Country codes selecting fallback feed files, e.g. ["DE", "UK"]
    #[serde(default)]
    pub fallback_countries: Vec<String>,
    /// Minimum short/long length ratio for the substring match tier
    #[serde(default = "default_substring_min_ratio")]
    pub substring_min_ratio: f64,
    /// Word-overlap matching; off by default, produces false positives
    #[serde(default)]
    pub fuzzy_matching: bool,
    #[serde(default = "default_feed_base_url")]
    pub feed_base_url: String,
}

fn default_substring_min_ratio() -> f64 {
    0.8
}
fn default_feed_base_url() -> String {
    "https://epgshare01.online/epgshare01/".to_string()
}

impl Default for EpgConfig {
    fn default() -> Self {
        Self {
            fallback_enabled: false,
            fallback_countries: Vec::new(),
            substring_min_ratio: default_substring_min_ratio(),
            fuzzy_matching: false,
            feed_base_url: default_feed_base_url(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelConfig {
    /// External binary spawned for Shadowsocks bridges
    #[serde(default = "default_ss_local_bin")]
    pub ss_local_bin: String,
    /// Fetched through a fresh bridge to verify it actually proxies traffic
    #[serde(default = "default_probe_url")]
    pub probe_url: String,
}

fn default_ss_local_bin() -> String {
    "ss-local".to_string()
}
fn default_probe_url() -> String {
    "https://api.ipify.org".to_string()
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            ss_local_bin: default_ss_local_bin(),
            probe_url: default_probe_url(),
        }
    }
}

/// One `[[portals]]` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortalEntry {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    pub url: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub proxy: Option<String>,
    #[serde(default = "default_streams_per_mac")]
    pub streams_per_mac: u32,
    #[serde(default)]
    pub epg_offset_hours: i64,
    pub macs: Vec<String>,
    #[serde(default)]
    pub enabled_channels: Vec<String>,
    #[serde(default)]
    pub custom_names: HashMap<String, String>,
    #[serde(default)]
    pub custom_numbers: HashMap<String, String>,
    #[serde(default)]
    pub custom_genres: HashMap<String, String>,
    #[serde(default)]
    pub custom_epg_ids: HashMap<String, String>,
}

fn default_true() -> bool {
    true
}
fn default_streams_per_mac() -> u32 {
    1
}

/// One `[[users]]` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserEntry {
    pub username: String,
    pub password: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    #[serde(default)]
    pub allowed_portals: Vec<String>,
    #[serde(default)]
    pub expires_at: Option<chrono::NaiveDate>,
}

fn default_max_connections() -> u32 {
    1
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let config: Config = Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("STALKER_GATEWAY_").split("__"))
            .extract()
            .map_err(|e| AppError::configuration(format!("failed to load config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Strict validation of everything that would otherwise fail mid-flight.
    pub fn validate(&self) -> AppResult<()> {
        for field in [
            &self.refresh.catalog_interval,
            &self.refresh.epg_interval,
            &self.refresh.watchdog_interval,
            &self.pool.mac_cooldown,
            &self.pool.liveness_timeout,
            &self.streaming.probe_timeout,
        ] {
            parse_duration(field)?;
        }
        if !(0.0..=1.0).contains(&self.epg.substring_min_ratio) {
            return Err(AppError::configuration(format!(
                "epg.substring_min_ratio must be within 0..=1, got {}",
                self.epg.substring_min_ratio
            )));
        }
        let mut seen_portals = HashSet::new();
        for portal in &self.portals {
            if !seen_portals.insert(&portal.id) {
                return Err(AppError::configuration(format!(
                    "duplicate portal id '{}'",
                    portal.id
                )));
            }
            if let Some(proxy) = portal.proxy.as_deref().filter(|p| !p.is_empty()) {
                proxy.parse::<ProxyDescriptor>().map_err(|e| {
                    AppError::configuration(format!("portal '{}': {e}", portal.id))
                })?;
            }
            for mac in &portal.macs {
                if normalize_mac(mac).is_none() {
                    return Err(AppError::configuration(format!(
                        "portal '{}': invalid MAC address '{mac}'",
                        portal.id
                    )));
                }
            }
        }
        let mut seen_users = HashSet::new();
        for user in &self.users {
            if !seen_users.insert(&user.username) {
                return Err(AppError::configuration(format!(
                    "duplicate username '{}'",
                    user.username
                )));
            }
        }
        Ok(())
    }

    /// Materialize runtime portal records (MACs normalized, name defaulted).
    pub fn resolve_portals(&self) -> Vec<Portal> {
        self.portals
            .iter()
            .map(|entry| Portal {
                id: entry.id.clone(),
                name: entry.name.clone().unwrap_or_else(|| entry.id.clone()),
                url: entry.url.clone(),
                enabled: entry.enabled,
                proxy: entry.proxy.clone().filter(|p| !p.is_empty()),
                streams_per_mac: entry.streams_per_mac,
                epg_offset_hours: entry.epg_offset_hours,
                macs: entry
                    .macs
                    .iter()
                    .filter_map(|m| normalize_mac(m))
                    .collect(),
                enabled_channels: entry.enabled_channels.iter().cloned().collect(),
                custom_names: entry.custom_names.clone(),
                custom_numbers: entry.custom_numbers.clone(),
                custom_genres: entry.custom_genres.clone(),
                custom_epg_ids: entry.custom_epg_ids.clone(),
            })
            .collect()
    }

    pub fn resolve_users(&self) -> Vec<DownstreamUser> {
        self.users
            .iter()
            .map(|entry| DownstreamUser {
                username: entry.username.clone(),
                password: entry.password.clone(),
                enabled: entry.enabled,
                max_connections: entry.max_connections,
                allowed_portals: entry.allowed_portals.clone(),
                expires_at: entry.expires_at,
                created_at: None,
            })
            .collect()
    }

    pub fn catalog_interval(&self) -> Duration {
        parse_duration(&self.refresh.catalog_interval).unwrap_or(Duration::from_secs(12 * 3600))
    }

    pub fn epg_interval(&self) -> Duration {
        parse_duration(&self.refresh.epg_interval).unwrap_or(Duration::from_secs(1800))
    }

    pub fn watchdog_interval(&self) -> Duration {
        parse_duration(&self.refresh.watchdog_interval).unwrap_or(Duration::from_secs(30))
    }

    pub fn mac_cooldown(&self) -> Duration {
        parse_duration(&self.pool.mac_cooldown).unwrap_or(Duration::from_secs(300))
    }

    pub fn liveness_timeout(&self) -> Duration {
        parse_duration(&self.pool.liveness_timeout).unwrap_or(Duration::from_secs(60))
    }

    pub fn probe_timeout(&self) -> Duration {
        parse_duration(&self.streaming.probe_timeout).unwrap_or(Duration::from_secs(5))
    }
}

fn parse_duration(value: &str) -> AppResult<Duration> {
    humantime::parse_duration(value)
        .map_err(|e| AppError::configuration(format!("invalid duration '{value}': {e}")))
}
