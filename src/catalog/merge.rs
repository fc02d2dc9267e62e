//! Catalog merge
//!
//! Different MACs on the same portal can expose different content sets, so
//! a refresh queries every MAC and merges by union, deduplicating on the
//! upstream id. Operator overrides (name, number, genre, EPG id) always win
//! over upstream values, and category ids keep the
//! `"{portal_id}_{genre}"` binding the translation layer relies on.

use std::collections::HashMap;

use crate::models::{Category, CategoryKind, Channel, Portal, SeriesItem, StreamKey, VodItem};
use crate::portal::wire::{RawChannel, RawGenre, RawSeriesItem, RawVodItem};

/// Everything one MAC reported during a refresh.
#[derive(Debug, Default)]
pub struct PortalFetch {
    pub channels: Vec<RawChannel>,
    pub genres: Vec<RawGenre>,
    pub vod_categories: Vec<RawGenre>,
    /// (upstream category id, item)
    pub vod_items: Vec<(String, RawVodItem)>,
    pub series_categories: Vec<RawGenre>,
    pub series: Vec<RawSeriesItem>,
}

/// Merged per-portal catalog, ready to be combined into a snapshot.
#[derive(Debug, Default)]
pub struct PortalCatalog {
    pub channels: Vec<Channel>,
    pub categories: Vec<Category>,
    pub vod_items: Vec<VodItem>,
    pub series: Vec<SeriesItem>,
}

/// Union-merge all MAC fetches for one portal and apply overrides.
pub fn merge_portal(portal: &Portal, fetches: &[PortalFetch]) -> PortalCatalog {
    let mut genres: HashMap<String, String> = HashMap::new();
    for fetch in fetches {
        for genre in &fetch.genres {
            genres.entry(genre.id.clone()).or_insert_with(|| genre.title.clone());
        }
    }

    // First MAC to report a channel id wins; later duplicates are dropped.
    let mut seen = HashMap::new();
    for fetch in fetches {
        for raw in &fetch.channels {
            if raw.id.is_empty() {
                continue;
            }
            seen.entry(raw.id.clone()).or_insert_with(|| raw.clone());
        }
    }

    let mut channels: Vec<Channel> = Vec::with_capacity(seen.len());
    // Custom genres materialize their own category per portal.
    let mut custom_categories: HashMap<String, String> = HashMap::new();
    for (id, raw) in seen {
        let name = portal
            .custom_names
            .get(&id)
            .cloned()
            .unwrap_or_else(|| raw.name.clone());
        let number = portal
            .custom_numbers
            .get(&id)
            .cloned()
            .or_else(|| raw.number.clone())
            .and_then(|n| n.parse::<u32>().ok())
            .unwrap_or(0);
        let genre_id = match portal.custom_genres.get(&id) {
            Some(custom) => {
                let slug = slugify(custom);
                custom_categories.insert(slug.clone(), custom.clone());
                slug
            }
            None => raw.tv_genre_id.clone().unwrap_or_else(|| "0".to_string()),
        };
        let epg_id = portal.custom_epg_ids.get(&id).cloned();
        channels.push(Channel {
            key: StreamKey::new(portal.id.clone(), id.clone()),
            name,
            number,
            genre_id,
            logo: raw.logo.clone().filter(|l| !l.is_empty()),
            cmd: raw.cmd.clone(),
            enabled: portal.channel_enabled(&id),
            epg_id,
        });
    }

    let mut categories: Vec<Category> = Vec::new();
    let mut used_genres: Vec<&str> = channels
        .iter()
        .filter(|c| c.enabled)
        .map(|c| c.genre_id.as_str())
        .collect();
    used_genres.sort_unstable();
    used_genres.dedup();
    for genre_id in used_genres {
        let title = custom_categories
            .get(genre_id)
            .or_else(|| genres.get(genre_id))
            .cloned()
            .unwrap_or_else(|| "Unknown".to_string());
        categories.push(Category {
            id: format!("{}_{genre_id}", portal.id),
            name: format!("{} - {title}", portal.name),
            kind: CategoryKind::Live,
            portal_id: portal.id.clone(),
        });
    }

    let mut vod_items: Vec<VodItem> = Vec::new();
    let mut seen_vod = HashMap::new();
    for fetch in fetches {
        for (category, raw) in &fetch.vod_items {
            if raw.id.is_empty() || seen_vod.contains_key(&raw.id) {
                continue;
            }
            seen_vod.insert(raw.id.clone(), ());
            vod_items.push(VodItem {
                key: StreamKey::new(portal.id.clone(), format!("vod:{}", raw.id)),
                name: raw.name.clone(),
                category_id: format!("{}_vod_{category}", portal.id),
                logo: raw.screenshot_uri.clone().filter(|l| !l.is_empty()),
                cmd: raw.cmd.clone(),
                enabled: true,
            });
        }
    }
    let mut vod_category_titles: HashMap<String, String> = HashMap::new();
    for fetch in fetches {
        for cat in &fetch.vod_categories {
            vod_category_titles
                .entry(cat.id.clone())
                .or_insert_with(|| cat.title.clone());
        }
    }
    let mut used_vod: Vec<&str> = vod_items
        .iter()
        .filter_map(|v| v.category_id.strip_prefix(&format!("{}_vod_", portal.id)))
        .collect();
    used_vod.sort_unstable();
    used_vod.dedup();
    for cat_id in used_vod {
        let title = vod_category_titles
            .get(cat_id)
            .cloned()
            .unwrap_or_else(|| "Movies".to_string());
        categories.push(Category {
            id: format!("{}_vod_{cat_id}", portal.id),
            name: format!("{} - {title}", portal.name),
            kind: CategoryKind::Vod,
            portal_id: portal.id.clone(),
        });
    }

    let mut series: Vec<SeriesItem> = Vec::new();
    let mut seen_series = HashMap::new();
    let mut series_category_titles: HashMap<String, String> = HashMap::new();
    for fetch in fetches {
        for cat in &fetch.series_categories {
            series_category_titles
                .entry(cat.id.clone())
                .or_insert_with(|| cat.title.clone());
        }
        for raw in &fetch.series {
            if raw.id.is_empty() || seen_series.contains_key(&raw.id) {
                continue;
            }
            seen_series.insert(raw.id.clone(), ());
            let cat = raw.category_id.clone().unwrap_or_else(|| "0".to_string());
            series.push(SeriesItem {
                key: StreamKey::new(portal.id.clone(), format!("series:{}", raw.id)),
                name: raw.name.clone(),
                category_id: format!("{}_series_{cat}", portal.id),
                cover: raw.screenshot_uri.clone().filter(|l| !l.is_empty()),
                enabled: true,
            });
        }
    }
    let mut used_series: Vec<&str> = series
        .iter()
        .filter_map(|s| s.category_id.strip_prefix(&format!("{}_series_", portal.id)))
        .collect();
    used_series.sort_unstable();
    used_series.dedup();
    for cat_id in used_series {
        let title = series_category_titles
            .get(cat_id)
            .cloned()
            .unwrap_or_else(|| "Series".to_string());
        categories.push(Category {
            id: format!("{}_series_{cat_id}", portal.id),
            name: format!("{} - {title}", portal.name),
            kind: CategoryKind::Series,
            portal_id: portal.id.clone(),
        });
    }

    PortalCatalog {
        channels,
        categories,
        vod_items,
        series,
    }
}

/// Combine the per-portal catalogs into one snapshot.
pub fn build_snapshot(portals: Vec<PortalCatalog>) -> crate::catalog::CatalogSnapshot {
    let mut channels = Vec::new();
    let mut categories = Vec::new();
    let mut vod_items = Vec::new();
    let mut series = Vec::new();
    for portal in portals {
        channels.extend(portal.channels);
        categories.extend(portal.categories);
        vod_items.extend(portal.vod_items);
        series.extend(portal.series);
    }
    crate::catalog::CatalogSnapshot::build(channels, categories, vod_items, series)
}

/// Stable category key for an operator-supplied genre name.
fn slugify(name: &str) -> String {
    let mut out: String = name
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { '-' })
        .collect();
    while out.contains("--") {
        out = out.replace("--", "-");
    }
    out.trim_matches('-').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn raw_channel(id: &str, name: &str, genre: &str) -> RawChannel {
        serde_json::from_value(serde_json::json!({
            "id": id,
            "name": name,
            "number": "7",
            "tv_genre_id": genre,
            "logo": "http://logo.example/x.png",
            "cmd": format!("ffmpeg http://localhost/ch/{id}"),
        }))
        .unwrap()
    }

    fn raw_genre(id: &str, title: &str) -> RawGenre {
        serde_json::from_value(serde_json::json!({"id": id, "title": title})).unwrap()
    }

    fn test_portal() -> Portal {
        Portal {
            id: "hb".into(),
            name: "Hotbird".into(),
            url: "http://portal.example".into(),
            enabled: true,
            proxy: None,
            streams_per_mac: 1,
            epg_offset_hours: 0,
            macs: vec![],
            enabled_channels: Default::default(),
            custom_names: Default::default(),
            custom_numbers: Default::default(),
            custom_genres: Default::default(),
            custom_epg_ids: Default::default(),
        }
    }

    #[test]
    fn union_across_macs_deduplicates_on_upstream_id() {
        let portal = test_portal();
        let fetches = vec![
            PortalFetch {
                channels: vec![raw_channel("1", "One", "5"), raw_channel("2", "Two", "5")],
                genres: vec![raw_genre("5", "News")],
                ..Default::default()
            },
            PortalFetch {
                // Second MAC sees channel 2 plus an extra channel 3.
                channels: vec![raw_channel("2", "Two", "5"), raw_channel("3", "Three", "5")],
                genres: vec![raw_genre("5", "News")],
                ..Default::default()
            },
        ];
        let merged = merge_portal(&portal, &fetches);
        let ids: HashSet<&str> = merged
            .channels
            .iter()
            .map(|c| c.key.channel_id.as_str())
            .collect();
        assert_eq!(ids, HashSet::from(["1", "2", "3"]));
    }

    #[test]
    fn overrides_always_win() {
        let mut portal = test_portal();
        portal.custom_names.insert("1".into(), "Renamed".into());
        portal.custom_numbers.insert("1".into(), "42".into());
        portal.custom_epg_ids.insert("1".into(), "renamed.guide".into());
        let fetches = vec![PortalFetch {
            channels: vec![raw_channel("1", "Upstream Name", "5")],
            genres: vec![raw_genre("5", "News")],
            ..Default::default()
        }];
        let merged = merge_portal(&portal, &fetches);
        let ch = &merged.channels[0];
        assert_eq!(ch.name, "Renamed");
        assert_eq!(ch.number, 42);
        assert_eq!(ch.epg_id.as_deref(), Some("renamed.guide"));
    }

    #[test]
    fn category_binding_holds_for_custom_genres() {
        let mut portal = test_portal();
        portal.custom_genres.insert("1".into(), "My Sports".into());
        let fetches = vec![PortalFetch {
            channels: vec![raw_channel("1", "One", "5")],
            genres: vec![raw_genre("5", "News")],
            ..Default::default()
        }];
        let merged = merge_portal(&portal, &fetches);
        let ch = &merged.channels[0];
        let category_ids: HashSet<String> =
            merged.categories.iter().map(|c| c.id.clone()).collect();
        assert!(
            category_ids.contains(&ch.category_id()),
            "channel category {} missing from category list {category_ids:?}",
            ch.category_id()
        );
    }

    #[test]
    fn disabled_channels_are_kept_but_flagged() {
        let mut portal = test_portal();
        portal.enabled_channels.insert("1".into());
        let fetches = vec![PortalFetch {
            channels: vec![raw_channel("1", "One", "5"), raw_channel("2", "Two", "6")],
            genres: vec![raw_genre("5", "News"), raw_genre("6", "Sports")],
            ..Default::default()
        }];
        let merged = merge_portal(&portal, &fetches);
        let by_id: HashMap<&str, &Channel> = merged
            .channels
            .iter()
            .map(|c| (c.key.channel_id.as_str(), c))
            .collect();
        assert!(by_id["1"].enabled);
        assert!(!by_id["2"].enabled);
        // Categories only cover enabled channels.
        assert_eq!(merged.categories.len(), 1);
        assert_eq!(merged.categories[0].id, "hb_5");
    }
}
