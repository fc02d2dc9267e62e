//! Guide merge
//!
//! Portal EPG comes back per MAC, and the variants differ: some MACs get a
//! fuller guide than others. The merge keeps, per channel, the variant with
//! the most programmes. Fallback data is only admitted for channels that
//! ended up with no portal programmes at all, so upstream guide data is
//! never shadowed by a web feed. The one exception is an operator-pinned
//! guide id, which replaces portal data outright.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, TimeZone, Utc};
use tokio::sync::RwLock;

use crate::models::{EpgProgramme, Portal, ProgrammeSource, StreamKey};
use crate::portal::wire::EpgPayload;

pub struct EpgSnapshot {
    pub generated_at: DateTime<Utc>,
    programmes: HashMap<StreamKey, Vec<EpgProgramme>>,
}

impl EpgSnapshot {
    pub fn empty() -> Self {
        Self {
            generated_at: Utc::now(),
            programmes: HashMap::new(),
        }
    }

    pub fn programmes(&self, key: &StreamKey) -> &[EpgProgramme] {
        self.programmes.get(key).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn channel_count(&self) -> usize {
        self.programmes.len()
    }
}

/// Accumulates per-MAC guide variants and fallback entries into a snapshot.
#[derive(Default)]
pub struct EpgBuilder {
    programmes: HashMap<StreamKey, Vec<EpgProgramme>>,
}

impl EpgBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// One MAC's guide for a portal. Per channel, the richest variant seen
    /// so far wins outright; variants are never interleaved.
    pub fn add_portal_variant(&mut self, portal: &Portal, payload: &EpgPayload) {
        let offset = Duration::hours(portal.epg_offset_hours);
        for (channel_id, raw_programmes) in payload {
            let key = StreamKey::new(portal.id.clone(), channel_id.clone());
            let mut converted: Vec<EpgProgramme> = raw_programmes
                .iter()
                .filter_map(|raw| {
                    let start = Utc.timestamp_opt(raw.start_timestamp?, 0).single()?;
                    let stop = Utc.timestamp_opt(raw.stop_timestamp?, 0).single()?;
                    Some(EpgProgramme {
                        start: start + offset,
                        stop: stop + offset,
                        title: raw.name.clone(),
                        description: raw.descr.clone().filter(|d| !d.is_empty()),
                        source: ProgrammeSource::Portal,
                    })
                })
                .collect();
            converted.sort_by_key(|p| p.start);
            let existing = self.programmes.entry(key).or_default();
            if converted.len() > existing.len() {
                *existing = converted;
            }
        }
    }

    /// Fallback programmes for one channel. Ignored when the portal already
    /// supplied anything for that channel.
    pub fn add_fallback(&mut self, key: StreamKey, mut programmes: Vec<EpgProgramme>) {
        let entry = self.programmes.entry(key).or_default();
        if entry.is_empty() {
            programmes.sort_by_key(|p| p.start);
            *entry = programmes;
        }
    }

    /// Operator-pinned guide data for one channel, replacing whatever the
    /// portal supplied. A pinned guide id is an explicit statement that the
    /// portal's own grid is wrong for this channel.
    pub fn replace_programmes(&mut self, key: StreamKey, mut programmes: Vec<EpgProgramme>) {
        programmes.sort_by_key(|p| p.start);
        self.programmes.insert(key, programmes);
    }

    pub fn has_portal_programmes(&self, key: &StreamKey) -> bool {
        self.programmes.get(key).is_some_and(|p| !p.is_empty())
    }

    /// Trim everything already over or beyond the horizon and freeze.
    pub fn finish(mut self, horizon_hours: i64) -> EpgSnapshot {
        let now = Utc::now();
        let horizon = now + Duration::hours(horizon_hours);
        self.programmes.retain(|_, programmes| {
            programmes.retain(|p| p.stop > now && p.start < horizon);
            !programmes.is_empty()
        });
        EpgSnapshot {
            generated_at: now,
            programmes: self.programmes,
        }
    }
}

/// Shared handle to the current guide snapshot.
pub struct EpgStore {
    current: RwLock<Arc<EpgSnapshot>>,
}

impl EpgStore {
    pub fn new() -> Self {
        Self {
            current: RwLock::new(Arc::new(EpgSnapshot::empty())),
        }
    }

    pub async fn current(&self) -> Arc<EpgSnapshot> {
        Arc::clone(&*self.current.read().await)
    }

    pub async fn replace(&self, snapshot: EpgSnapshot) {
        *self.current.write().await = Arc::new(snapshot);
    }
}

impl Default for EpgStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::portal::wire::RawProgramme;

    fn test_portal(offset_hours: i64) -> Portal {
        Portal {
            id: "hb".into(),
            name: "Hotbird".into(),
            url: "http://portal.example".into(),
            enabled: true,
            proxy: None,
            streams_per_mac: 1,
            epg_offset_hours: offset_hours,
            macs: vec![],
            enabled_channels: Default::default(),
            custom_names: Default::default(),
            custom_numbers: Default::default(),
            custom_genres: Default::default(),
            custom_epg_ids: Default::default(),
        }
    }

    fn raw(start: i64, stop: i64, name: &str) -> RawProgramme {
        serde_json::from_value(serde_json::json!({
            "name": name,
            "descr": "",
            "start_timestamp": start,
            "stop_timestamp": stop,
        }))
        .unwrap()
    }

    fn payload(channel: &str, programmes: Vec<RawProgramme>) -> EpgPayload {
        let mut map = EpgPayload::new();
        map.insert(channel.to_string(), programmes);
        map
    }

    #[test]
    fn richest_mac_variant_wins() {
        let portal = test_portal(0);
        let now = Utc::now().timestamp();
        let mut builder = EpgBuilder::new();
        builder.add_portal_variant(
            &portal,
            &payload("7", vec![raw(now, now + 3600, "Only one")]),
        );
        builder.add_portal_variant(
            &portal,
            &payload(
                "7",
                vec![
                    raw(now, now + 3600, "First"),
                    raw(now + 3600, now + 7200, "Second"),
                ],
            ),
        );
        // A later, thinner variant must not replace the richer one.
        builder.add_portal_variant(
            &portal,
            &payload("7", vec![raw(now, now + 3600, "Thin again")]),
        );
        let snapshot = builder.finish(48);
        let programmes = snapshot.programmes(&StreamKey::new("hb", "7"));
        assert_eq!(programmes.len(), 2);
        assert_eq!(programmes[0].title, "First");
    }

    #[test]
    fn fallback_never_replaces_portal_programmes() {
        let portal = test_portal(0);
        let now = Utc::now().timestamp();
        let mut builder = EpgBuilder::new();
        builder.add_portal_variant(
            &portal,
            &payload("7", vec![raw(now, now + 3600, "From portal")]),
        );
        builder.add_fallback(
            StreamKey::new("hb", "7"),
            vec![EpgProgramme {
                start: Utc::now(),
                stop: Utc::now() + Duration::hours(1),
                title: "From feed".into(),
                description: None,
                source: ProgrammeSource::Fallback,
            }],
        );
        let snapshot = builder.finish(48);
        let programmes = snapshot.programmes(&StreamKey::new("hb", "7"));
        assert_eq!(programmes.len(), 1);
        assert_eq!(programmes[0].title, "From portal");
        assert_eq!(programmes[0].source, ProgrammeSource::Portal);
    }

    #[test]
    fn replace_programmes_overrides_portal_data() {
        let portal = test_portal(0);
        let now = Utc::now().timestamp();
        let mut builder = EpgBuilder::new();
        builder.add_portal_variant(
            &portal,
            &payload("7", vec![raw(now, now + 3600, "From portal")]),
        );
        builder.replace_programmes(
            StreamKey::new("hb", "7"),
            vec![EpgProgramme {
                start: Utc::now(),
                stop: Utc::now() + Duration::hours(1),
                title: "Pinned".into(),
                description: None,
                source: ProgrammeSource::Fallback,
            }],
        );
        let snapshot = builder.finish(48);
        let programmes = snapshot.programmes(&StreamKey::new("hb", "7"));
        assert_eq!(programmes.len(), 1);
        assert_eq!(programmes[0].title, "Pinned");
    }

    #[test]
    fn offset_shifts_programme_times() {
        let portal = test_portal(2);
        let now = Utc::now().timestamp();
        let mut builder = EpgBuilder::new();
        builder.add_portal_variant(&portal, &payload("7", vec![raw(now, now + 3600, "Shifted")]));
        let snapshot = builder.finish(48);
        let programmes = snapshot.programmes(&StreamKey::new("hb", "7"));
        let expected = Utc.timestamp_opt(now, 0).single().unwrap() + Duration::hours(2);
        assert_eq!(programmes[0].start, expected);
    }

    #[test]
    fn finish_trims_past_and_far_future_entries() {
        let portal = test_portal(0);
        let now = Utc::now().timestamp();
        let mut builder = EpgBuilder::new();
        builder.add_portal_variant(
            &portal,
            &payload(
                "7",
                vec![
                    raw(now - 7200, now - 3600, "Over"),
                    raw(now, now + 3600, "Current"),
                    raw(now + 80 * 3600, now + 81 * 3600, "Too far"),
                ],
            ),
        );
        let snapshot = builder.finish(48);
        let programmes = snapshot.programmes(&StreamKey::new("hb", "7"));
        assert_eq!(programmes.len(), 1);
        assert_eq!(programmes[0].title, "Current");
    }
}
