//! Immutable catalog snapshots
//!
//! Readers clone an `Arc` to the current snapshot and keep working on it
//! while a refresh builds the next one; the swap is a single pointer store,
//! so a reader never observes a half-written catalog.
//!
//! The numeric stream-id table is part of the snapshot: ids are assigned
//! once at build time (deterministically, in sorted key order) and looked
//! up afterwards, never recomputed ad hoc.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::models::{Category, Channel, SeriesItem, StreamKey, VodItem};

pub struct CatalogSnapshot {
    pub generated_at: DateTime<Utc>,
    pub channels: Vec<Channel>,
    pub categories: Vec<Category>,
    pub vod_items: Vec<VodItem>,
    pub series: Vec<SeriesItem>,
    ids_to_keys: HashMap<u32, StreamKey>,
    keys_to_ids: HashMap<StreamKey, u32>,
    channel_index: HashMap<StreamKey, usize>,
    vod_index: HashMap<StreamKey, usize>,
}

impl CatalogSnapshot {
    pub fn empty() -> Self {
        Self::build(Vec::new(), Vec::new(), Vec::new(), Vec::new())
    }

    pub fn build(
        mut channels: Vec<Channel>,
        categories: Vec<Category>,
        mut vod_items: Vec<VodItem>,
        mut series: Vec<SeriesItem>,
    ) -> Self {
        // Deterministic order so id assignment (and collision probing) is
        // reproducible for an unchanged upstream catalog.
        channels.sort_by(|a, b| a.key.as_sid().cmp(&b.key.as_sid()));
        vod_items.sort_by(|a, b| a.key.as_sid().cmp(&b.key.as_sid()));
        series.sort_by(|a, b| a.key.as_sid().cmp(&b.key.as_sid()));

        let mut ids_to_keys = HashMap::new();
        let mut keys_to_ids = HashMap::new();
        let all_keys = channels
            .iter()
            .map(|c| &c.key)
            .chain(vod_items.iter().map(|v| &v.key))
            .chain(series.iter().map(|s| &s.key));
        for key in all_keys {
            let mut id = key.numeric_id();
            // Linear probe on (astronomically unlikely) 31-bit collisions.
            while ids_to_keys
                .get(&id)
                .is_some_and(|existing: &StreamKey| existing != key)
            {
                id = (id + 1) & 0x7fff_ffff;
            }
            ids_to_keys.insert(id, key.clone());
            keys_to_ids.insert(key.clone(), id);
        }

        let channel_index = channels
            .iter()
            .enumerate()
            .map(|(i, c)| (c.key.clone(), i))
            .collect();
        let vod_index = vod_items
            .iter()
            .enumerate()
            .map(|(i, v)| (v.key.clone(), i))
            .collect();

        Self {
            generated_at: Utc::now(),
            channels,
            categories,
            vod_items,
            series,
            ids_to_keys,
            keys_to_ids,
            channel_index,
            vod_index,
        }
    }

    pub fn key_for(&self, stream_id: u32) -> Option<&StreamKey> {
        self.ids_to_keys.get(&stream_id)
    }

    pub fn stream_id_for(&self, key: &StreamKey) -> Option<u32> {
        self.keys_to_ids.get(key).copied()
    }

    pub fn channel(&self, key: &StreamKey) -> Option<&Channel> {
        self.channel_index.get(key).map(|&i| &self.channels[i])
    }

    pub fn channel_by_stream_id(&self, stream_id: u32) -> Option<&Channel> {
        self.key_for(stream_id).and_then(|key| self.channel(key))
    }

    pub fn vod_item(&self, key: &StreamKey) -> Option<&VodItem> {
        self.vod_index.get(key).map(|&i| &self.vod_items[i])
    }

    pub fn enabled_channels(&self) -> impl Iterator<Item = &Channel> {
        self.channels.iter().filter(|c| c.enabled)
    }
}

/// Shared handle to the current snapshot: read-shared, single writer.
pub struct CatalogStore {
    current: RwLock<Arc<CatalogSnapshot>>,
}

impl CatalogStore {
    pub fn new() -> Self {
        Self {
            current: RwLock::new(Arc::new(CatalogSnapshot::empty())),
        }
    }

    pub async fn current(&self) -> Arc<CatalogSnapshot> {
        Arc::clone(&*self.current.read().await)
    }

    pub async fn replace(&self, snapshot: CatalogSnapshot) {
        *self.current.write().await = Arc::new(snapshot);
    }
}

impl Default for CatalogStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channel(portal: &str, id: &str, name: &str) -> Channel {
        Channel {
            key: StreamKey::new(portal, id),
            name: name.into(),
            number: 1,
            genre_id: "1".into(),
            logo: None,
            cmd: format!("ffmpeg http://localhost/ch/{id}"),
            enabled: true,
            epg_id: None,
        }
    }

    #[test]
    fn rebuilding_from_identical_input_yields_identical_ids() {
        let input = || {
            vec![
                channel("p1", "10", "Ten"),
                channel("p1", "11", "Eleven"),
                channel("p2", "10", "OtherTen"),
            ]
        };
        let a = CatalogSnapshot::build(input(), vec![], vec![], vec![]);
        let b = CatalogSnapshot::build(input(), vec![], vec![], vec![]);
        for ch in &a.channels {
            assert_eq!(a.stream_id_for(&ch.key), b.stream_id_for(&ch.key));
        }
    }

    #[test]
    fn id_table_round_trips() {
        let snapshot =
            CatalogSnapshot::build(vec![channel("p1", "10", "Ten")], vec![], vec![], vec![]);
        let key = StreamKey::new("p1", "10");
        let id = snapshot.stream_id_for(&key).unwrap();
        assert_eq!(snapshot.key_for(id), Some(&key));
        assert_eq!(snapshot.channel_by_stream_id(id).unwrap().name, "Ten");
    }

    #[tokio::test]
    async fn readers_hold_the_old_snapshot_across_a_swap() {
        let store = CatalogStore::new();
        store
            .replace(CatalogSnapshot::build(
                vec![channel("p1", "1", "Old")],
                vec![],
                vec![],
                vec![],
            ))
            .await;
        let before = store.current().await;
        store
            .replace(CatalogSnapshot::build(
                vec![channel("p1", "2", "New")],
                vec![],
                vec![],
                vec![],
            ))
            .await;
        // The reader's view is entirely the old snapshot.
        assert_eq!(before.channels.len(), 1);
        assert_eq!(before.channels[0].name, "Old");
        let after = store.current().await;
        assert_eq!(after.channels[0].name, "New");
    }
}
