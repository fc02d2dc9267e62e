//! Catalog and guide refresh
//!
//! A refresh walks every enabled portal and queries every configured MAC,
//! because different MACs on the same portal often see different content.
//! One portal failing (or sitting in cooldown) never aborts the cycle: its
//! previous catalog entries are carried over from the current snapshot and
//! the cycle moves on.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use rand::{rng, Rng};
use tracing::{debug, info, warn};

use crate::catalog::{self, CatalogStore, PortalCatalog, PortalFetch};
use crate::config::Config;
use crate::epg::{fetch_feeds, EpgBuilder, EpgStore, FallbackEpg, MatchPolicy};
use crate::jobs::progress::ProgressTracker;
use crate::models::Portal;
use crate::pool::MacPoolManager;
use crate::portal::PortalClient;
use crate::proxy::TunnelFactory;

const COOLDOWN_BASE: Duration = Duration::from_secs(60);
const COOLDOWN_CAP: Duration = Duration::from_secs(15 * 60);

struct Cooldown {
    failures: u32,
    until: Instant,
}

/// Exponential portal backoff with jitter so portals sharing an upstream
/// outage do not all retry in lockstep.
fn backoff_delay(failures: u32) -> Duration {
    let exp = failures.saturating_sub(1).min(10);
    let base = COOLDOWN_BASE
        .saturating_mul(1u32 << exp)
        .min(COOLDOWN_CAP);
    base.mul_f64(rng().random_range(0.85..1.15))
}

pub struct RefreshService {
    config: Arc<Config>,
    portals: Vec<Portal>,
    catalog: Arc<CatalogStore>,
    epg: Arc<EpgStore>,
    pool: Arc<MacPoolManager>,
    tunnels: Arc<TunnelFactory>,
    progress: Arc<ProgressTracker>,
    cooldowns: Mutex<HashMap<String, Cooldown>>,
    feed_client: reqwest::Client,
}

impl RefreshService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Arc<Config>,
        portals: Vec<Portal>,
        catalog: Arc<CatalogStore>,
        epg: Arc<EpgStore>,
        pool: Arc<MacPoolManager>,
        tunnels: Arc<TunnelFactory>,
        progress: Arc<ProgressTracker>,
    ) -> Self {
        Self {
            config,
            portals,
            catalog,
            epg,
            pool,
            tunnels,
            progress,
            cooldowns: Mutex::new(HashMap::new()),
            feed_client: reqwest::Client::new(),
        }
    }

    /// Rebuild the full catalog snapshot from every reachable portal.
    pub async fn refresh_catalog(&self) {
        let enabled: Vec<&Portal> = self.portals.iter().filter(|p| p.enabled).collect();
        self.progress.begin(enabled.len());
        info!(portals = enabled.len(), "catalog refresh started");
        let started = Instant::now();

        let previous = self.catalog.current().await;
        let mut merged: Vec<PortalCatalog> = Vec::with_capacity(enabled.len());
        for portal in enabled {
            self.progress.set_step(Some(&portal.id), "catalog");
            if self.portal_cooled(&portal.id) {
                debug!(portal = %portal.id, "portal in cooldown, carrying previous catalog");
                merged.push(retained_catalog(&previous, &portal.id));
                self.progress.portal_done();
                continue;
            }
            match self.fetch_portal_catalog(portal).await {
                Some(catalog) => {
                    self.clear_cooldown(&portal.id);
                    info!(
                        portal = %portal.id,
                        channels = catalog.channels.len(),
                        vod = catalog.vod_items.len(),
                        series = catalog.series.len(),
                        "portal catalog refreshed"
                    );
                    merged.push(catalog);
                }
                None => {
                    self.record_portal_failure(&portal.id);
                    merged.push(retained_catalog(&previous, &portal.id));
                }
            }
            self.progress.portal_done();
        }

        let snapshot = catalog::build_snapshot(merged);
        let channels = snapshot.channels.len();
        self.catalog.replace(snapshot).await;
        self.progress.finish();
        info!(
            channels,
            elapsed = ?started.elapsed(),
            "catalog refresh finished"
        );
    }

    async fn fetch_portal_catalog(&self, portal: &Portal) -> Option<PortalCatalog> {
        let tunnel = match self.tunnels.open(portal.proxy.as_deref()).await {
            Ok(tunnel) => tunnel,
            Err(err) => {
                warn!(portal = %portal.id, error = %err, "tunnel unavailable, skipping portal");
                return None;
            }
        };

        let mut fetches: Vec<PortalFetch> = Vec::new();
        for mac in &portal.macs {
            let client = match PortalClient::new(portal, mac, Arc::clone(&tunnel)) {
                Ok(client) => client,
                Err(err) => {
                    warn!(portal = %portal.id, mac = %mac, error = %err, "client build failed");
                    continue;
                }
            };
            match self.fetch_one_mac(portal, &client).await {
                Some(fetch) => {
                    self.pool.record_success(&portal.id, mac);
                    fetches.push(fetch);
                }
                None => self.pool.record_failure(&portal.id, mac),
            }
        }
        if fetches.is_empty() {
            warn!(portal = %portal.id, "no MAC produced a catalog, portal skipped");
            return None;
        }
        Some(catalog::merge_portal(portal, &fetches))
    }

    /// Everything one MAC can tell us. Listing errors after a good
    /// handshake degrade to a partial fetch instead of discarding the MAC.
    async fn fetch_one_mac(&self, portal: &Portal, client: &PortalClient) -> Option<PortalFetch> {
        if let Err(err) = client.handshake().await {
            warn!(portal = %portal.id, mac = %client.mac(), error = %err, "handshake failed");
            return None;
        }
        // Some portals only fully register the device once the profile is
        // pulled; the payload itself is not interesting.
        if let Err(err) = client.get_profile().await {
            debug!(portal = %portal.id, mac = %client.mac(), error = %err, "profile fetch failed");
        }
        match client.get_account_expiry().await {
            Ok(expires) => self.pool.record_expiry(&portal.id, client.mac(), expires),
            Err(err) => {
                debug!(portal = %portal.id, mac = %client.mac(), error = %err, "account info unavailable");
            }
        }

        let mut fetch = PortalFetch::default();
        match client.list_channels().await {
            Ok(channels) => fetch.channels = channels,
            Err(err) => {
                warn!(portal = %portal.id, mac = %client.mac(), error = %err, "channel listing failed");
                return None;
            }
        }
        match client.list_genres().await {
            Ok(genres) => fetch.genres = genres,
            Err(err) => {
                debug!(portal = %portal.id, mac = %client.mac(), error = %err, "genre listing failed");
            }
        }
        match client.list_vod_categories().await {
            Ok(categories) => {
                for category in &categories {
                    match client.list_vod_items(&category.id).await {
                        Ok(items) => fetch
                            .vod_items
                            .extend(items.into_iter().map(|i| (category.id.clone(), i))),
                        Err(err) => {
                            debug!(portal = %portal.id, category = %category.id, error = %err, "vod listing failed");
                        }
                    }
                }
                fetch.vod_categories = categories;
            }
            Err(err) => {
                debug!(portal = %portal.id, error = %err, "vod categories unavailable");
            }
        }
        match client.list_series_categories().await {
            Ok(categories) => fetch.series_categories = categories,
            Err(err) => {
                debug!(portal = %portal.id, error = %err, "series categories unavailable");
            }
        }
        match client.list_series().await {
            Ok(series) => fetch.series = series,
            Err(err) => {
                debug!(portal = %portal.id, error = %err, "series listing failed");
            }
        }
        Some(fetch)
    }

    /// Rebuild the guide snapshot: portal EPG from every MAC, then web
    /// feeds for channels the portals left blank.
    pub async fn refresh_epg(&self) {
        let window = self.config.refresh.epg_window_hours;
        let started = Instant::now();
        let mut builder = EpgBuilder::new();

        for portal in self.portals.iter().filter(|p| p.enabled) {
            if self.portal_cooled(&portal.id) {
                continue;
            }
            let tunnel = match self.tunnels.open(portal.proxy.as_deref()).await {
                Ok(tunnel) => tunnel,
                Err(err) => {
                    warn!(portal = %portal.id, error = %err, "tunnel unavailable for guide fetch");
                    continue;
                }
            };
            for mac in &portal.macs {
                let Ok(client) = PortalClient::new(portal, mac, Arc::clone(&tunnel)) else {
                    continue;
                };
                match client.get_epg(window).await {
                    Ok(payload) => {
                        debug!(portal = %portal.id, mac = %mac, channels = payload.len(), "guide variant fetched");
                        builder.add_portal_variant(portal, &payload);
                    }
                    Err(err) => {
                        warn!(portal = %portal.id, mac = %mac, error = %err, "guide fetch failed");
                    }
                }
            }
        }

        if self.config.epg.fallback_enabled {
            match fetch_feeds(&self.feed_client, &self.config.epg).await {
                Ok(feed) if !feed.is_empty() => self.apply_fallback(&mut builder, &feed).await,
                Ok(_) => debug!("no fallback feed data available"),
                Err(err) => warn!(error = %err, "fallback feed fetch failed"),
            }
        }

        let snapshot = builder.finish(48);
        let channels = snapshot.channel_count();
        self.epg.replace(snapshot).await;
        info!(channels, elapsed = ?started.elapsed(), "guide refresh finished");
    }

    async fn apply_fallback(&self, builder: &mut EpgBuilder, feed: &FallbackEpg) {
        let policy = MatchPolicy::from_config(&self.config.epg);
        let catalog = self.catalog.current().await;
        let mut filled = 0usize;
        for channel in catalog.enabled_channels() {
            // A pinned guide id wins even over portal programmes.
            if let Some(pinned) = channel
                .epg_id
                .as_deref()
                .and_then(|id| feed.get_by_epg_id(id))
            {
                builder.replace_programmes(channel.key.clone(), pinned.programmes.clone());
                filled += 1;
                continue;
            }
            if builder.has_portal_programmes(&channel.key) {
                continue;
            }
            if let Some(fallback) = policy.find(&channel.name, feed) {
                builder.add_fallback(channel.key.clone(), fallback.programmes.clone());
                filled += 1;
            }
        }
        debug!(filled, "fallback guide entries applied");
    }

    fn portal_cooled(&self, portal_id: &str) -> bool {
        self.cooldowns
            .lock()
            .expect("cooldown lock poisoned")
            .get(portal_id)
            .is_some_and(|c| c.until > Instant::now())
    }

    fn record_portal_failure(&self, portal_id: &str) {
        let mut cooldowns = self.cooldowns.lock().expect("cooldown lock poisoned");
        let entry = cooldowns.entry(portal_id.to_string()).or_insert(Cooldown {
            failures: 0,
            until: Instant::now(),
        });
        entry.failures += 1;
        let delay = backoff_delay(entry.failures);
        entry.until = Instant::now() + delay;
        warn!(portal = %portal_id, failures = entry.failures, cooldown = ?delay, "portal refresh failed, backing off");
    }

    fn clear_cooldown(&self, portal_id: &str) {
        self.cooldowns
            .lock()
            .expect("cooldown lock poisoned")
            .remove(portal_id);
    }
}

/// Carry a failing portal's entries over from the previous snapshot.
fn retained_catalog(
    previous: &crate::catalog::CatalogSnapshot,
    portal_id: &str,
) -> PortalCatalog {
    PortalCatalog {
        channels: previous
            .channels
            .iter()
            .filter(|c| c.key.portal_id == portal_id)
            .cloned()
            .collect(),
        categories: previous
            .categories
            .iter()
            .filter(|c| c.portal_id == portal_id)
            .cloned()
            .collect(),
        vod_items: previous
            .vod_items
            .iter()
            .filter(|v| v.key.portal_id == portal_id)
            .cloned()
            .collect(),
        series: previous
            .series
            .iter()
            .filter(|s| s.key.portal_id == portal_id)
            .cloned()
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::CatalogSnapshot;
    use crate::models::{Channel, StreamKey};

    #[test]
    fn backoff_grows_and_caps() {
        let first = backoff_delay(1);
        assert!(first >= Duration::from_secs(51) && first <= Duration::from_secs(69));
        let fourth = backoff_delay(4);
        assert!(fourth >= Duration::from_secs(408) && fourth <= Duration::from_secs(552));
        let huge = backoff_delay(30);
        assert!(huge <= COOLDOWN_CAP.mul_f64(1.15));
    }

    #[test]
    fn retained_catalog_filters_by_portal() {
        let mk = |portal: &str, id: &str| Channel {
            key: StreamKey::new(portal, id),
            name: id.into(),
            number: 1,
            genre_id: "1".into(),
            logo: None,
            cmd: String::new(),
            enabled: true,
            epg_id: None,
        };
        let snapshot = CatalogSnapshot::build(
            vec![mk("a", "1"), mk("b", "2"), mk("a", "3")],
            vec![],
            vec![],
            vec![],
        );
        let retained = retained_catalog(&snapshot, "a");
        assert_eq!(retained.channels.len(), 2);
        assert!(retained.channels.iter().all(|c| c.key.portal_id == "a"));
    }
}
