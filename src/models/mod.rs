//! Shared data model for the portal gateway
//!
//! These types flow between the merge engines, the MAC pool and the web
//! layer. Catalog entries carry post-override values: custom names, numbers,
//! genres and EPG ids are applied once during merge, so readers never have
//! to consult the override maps again.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};

/// One upstream legacy portal, as resolved from configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Portal {
    pub id: String,
    pub name: String,
    pub url: String,
    pub enabled: bool,
    /// Proxy descriptor string (see `proxy::descriptor`), empty = direct
    pub proxy: Option<String>,
    /// Concurrent streams allowed per MAC; 0 means unlimited
    pub streams_per_mac: u32,
    /// Hour offset applied to portal-sourced EPG times
    pub epg_offset_hours: i64,
    /// Normalized MAC identities owned by this portal, in configured order
    pub macs: Vec<String>,
    /// Upstream channel ids visible downstream; empty set = everything
    pub enabled_channels: HashSet<String>,
    pub custom_names: HashMap<String, String>,
    pub custom_numbers: HashMap<String, String>,
    pub custom_genres: HashMap<String, String>,
    pub custom_epg_ids: HashMap<String, String>,
}

impl Portal {
    pub fn channel_enabled(&self, channel_id: &str) -> bool {
        self.enabled_channels.is_empty() || self.enabled_channels.contains(channel_id)
    }
}

/// Derived availability of a MAC identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MacState {
    /// Never handshaken since startup
    Unknown,
    /// Recent handshake succeeded, no stream in flight
    Available,
    /// Streams in flight, below the per-MAC limit
    Busy,
    /// In-use counter has reached the per-MAC limit
    Active,
    /// Account expiry date has passed
    Expired,
    /// Consecutive failures exceeded the threshold; excluded for a cooldown
    Unreachable,
}

/// Lifecycle state of one (portal, MAC) credential.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MacIdentity {
    pub portal_id: String,
    pub mac: String,
    pub expires_at: Option<NaiveDate>,
    pub last_handshake: Option<DateTime<Utc>>,
    #[serde(skip_serializing)]
    pub token: Option<String>,
    pub in_use: u32,
    pub consecutive_failures: u32,
    pub cooldown_until: Option<DateTime<Utc>>,
}

impl MacIdentity {
    pub fn new(portal_id: &str, mac: &str) -> Self {
        Self {
            portal_id: portal_id.to_string(),
            mac: mac.to_string(),
            expires_at: None,
            last_handshake: None,
            token: None,
            in_use: 0,
            consecutive_failures: 0,
            cooldown_until: None,
        }
    }
}

/// Stable identity of a channel across refreshes: (portal, upstream-id).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StreamKey {
    pub portal_id: String,
    pub channel_id: String,
}

impl StreamKey {
    pub fn new<P: Into<String>, C: Into<String>>(portal_id: P, channel_id: C) -> Self {
        Self {
            portal_id: portal_id.into(),
            channel_id: channel_id.into(),
        }
    }

    /// Internal string form, also exposed as `custom_sid` for reverse lookup.
    pub fn as_sid(&self) -> String {
        format!("{}_{}", self.portal_id, self.channel_id)
    }

    /// Deterministic numeric stream id: first four bytes of SHA-256 over the
    /// sid, masked to 31 bits so players always see a small non-negative
    /// integer. Stable across refreshes for the same (portal, channel).
    pub fn numeric_id(&self) -> u32 {
        let digest = Sha256::digest(self.as_sid().as_bytes());
        u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]) & 0x7fff_ffff
    }
}

/// A live channel in the merged catalog, with overrides already applied.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Channel {
    pub key: StreamKey,
    pub name: String,
    pub number: u32,
    /// Upstream genre id; category id downstream is `"{portal_id}_{genre}"`
    pub genre_id: String,
    pub logo: Option<String>,
    /// Raw stalker command used to resolve a playable link
    pub cmd: String,
    pub enabled: bool,
    /// XMLTV channel id; custom override wins, fallback match second
    pub epg_id: Option<String>,
}

impl Channel {
    pub fn category_id(&self) -> String {
        format!("{}_{}", self.key.portal_id, self.genre_id)
    }
}

/// A VOD entry in the merged catalog.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VodItem {
    pub key: StreamKey,
    pub name: String,
    pub category_id: String,
    pub logo: Option<String>,
    pub cmd: String,
    pub enabled: bool,
}

/// A series entry in the merged catalog.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeriesItem {
    pub key: StreamKey,
    pub name: String,
    pub category_id: String,
    pub cover: Option<String>,
    pub enabled: bool,
}

/// Kind of catalog category, mirrors the XC API's three listing families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CategoryKind {
    Live,
    Vod,
    Series,
}

/// A downstream-visible category.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Category {
    pub id: String,
    pub name: String,
    pub kind: CategoryKind,
    pub portal_id: String,
}

/// Where a programme entry came from. Portal-sourced entries are never
/// overwritten by fallback data for the same channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgrammeSource {
    Portal,
    Fallback,
}

/// One guide entry for a channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EpgProgramme {
    pub start: DateTime<Utc>,
    pub stop: DateTime<Utc>,
    pub title: String,
    pub description: Option<String>,
    pub source: ProgrammeSource,
}

/// A downstream API credential.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DownstreamUser {
    pub username: String,
    #[serde(skip_serializing)]
    pub password: String,
    pub enabled: bool,
    pub max_connections: u32,
    /// Portal ids this user may reach; empty = all portals
    pub allowed_portals: Vec<String>,
    pub expires_at: Option<NaiveDate>,
    pub created_at: Option<DateTime<Utc>>,
}

impl DownstreamUser {
    pub fn portal_allowed(&self, portal_id: &str) -> bool {
        self.allowed_portals.is_empty() || self.allowed_portals.iter().any(|p| p == portal_id)
    }
}

/// An in-flight downstream playback session.
#[derive(Debug, Clone, Serialize)]
pub struct ActiveConnection {
    pub username: String,
    pub stream_id: u32,
    pub device_id: String,
    pub client_ip: String,
    pub started_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_id_is_stable_and_non_negative() {
        let key = StreamKey::new("hotbird", "1044");
        let a = key.numeric_id();
        let b = StreamKey::new("hotbird", "1044").numeric_id();
        assert_eq!(a, b);
        assert!(a <= i32::MAX as u32);
    }

    #[test]
    fn numeric_id_distinguishes_portals() {
        let a = StreamKey::new("p1", "7").numeric_id();
        let b = StreamKey::new("p2", "7").numeric_id();
        assert_ne!(a, b);
    }

    #[test]
    fn category_id_binds_portal_and_genre() {
        let ch = Channel {
            key: StreamKey::new("hotbird", "12"),
            name: "Example".into(),
            number: 12,
            genre_id: "3".into(),
            logo: None,
            cmd: "ffmpeg http://localhost/ch/12".into(),
            enabled: true,
            epg_id: None,
        };
        assert_eq!(ch.category_id(), "hotbird_3");
    }

    #[test]
    fn empty_enabled_set_means_everything_visible() {
        let portal = Portal {
            id: "p".into(),
            name: "P".into(),
            url: "http://portal.example".into(),
            enabled: true,
            proxy: None,
            streams_per_mac: 1,
            epg_offset_hours: 0,
            macs: vec![],
            enabled_channels: HashSet::new(),
            custom_names: HashMap::new(),
            custom_numbers: HashMap::new(),
            custom_genres: HashMap::new(),
            custom_epg_ids: HashMap::new(),
        };
        assert!(portal.channel_enabled("anything"));
    }
}
