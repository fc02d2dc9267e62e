//! MAC pool management
//!
//! Owns all MAC identity state. Other components never touch counters
//! directly; they get a [`MacLease`] from [`MacPoolManager::select`] and the
//! counter is released when the lease drops. A watchdog force-releases
//! leases whose holder stopped reporting liveness, so a player that vanished
//! mid-stream cannot pin a MAC forever.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::PoolConfig;
use crate::errors::GatewayError;
use crate::models::{MacIdentity, MacState, Portal};

struct LeaseInfo {
    last_seen: Instant,
}

struct MacSlot {
    identity: MacIdentity,
    leases: HashMap<Uuid, LeaseInfo>,
}

impl MacSlot {
    fn state(&self, streams_per_mac: u32, now: DateTime<Utc>) -> MacState {
        if let Some(expiry) = self.identity.expires_at {
            if expiry < now.date_naive() {
                return MacState::Expired;
            }
        }
        if let Some(until) = self.identity.cooldown_until {
            if until > now {
                return MacState::Unreachable;
            }
        }
        if streams_per_mac > 0 && self.leases.len() as u32 >= streams_per_mac {
            return MacState::Active;
        }
        if !self.leases.is_empty() {
            return MacState::Busy;
        }
        if self.identity.last_handshake.is_none() {
            return MacState::Unknown;
        }
        MacState::Available
    }

    fn selectable(&self, streams_per_mac: u32, now: DateTime<Utc>) -> bool {
        matches!(
            self.state(streams_per_mac, now),
            // Unknown is admitted so a fresh pool can bootstrap itself
            MacState::Available | MacState::Busy | MacState::Unknown
        )
    }
}

struct PortalPool {
    portal_id: String,
    streams_per_mac: u32,
    slots: Mutex<HashMap<String, MacSlot>>,
}

/// Reported state of one MAC, for the status surface.
#[derive(Debug, Clone, Serialize)]
pub struct MacStatus {
    pub portal_id: String,
    pub mac: String,
    pub state: MacState,
    pub in_use: u32,
    pub last_handshake: Option<DateTime<Utc>>,
    pub expires_at: Option<NaiveDate>,
    pub consecutive_failures: u32,
}

/// RAII lease over one MAC. Dropping it releases the in-use slot.
pub struct MacLease {
    pool: Arc<PortalPool>,
    mac: String,
    lease_id: Uuid,
}

impl MacLease {
    pub fn mac(&self) -> &str {
        &self.mac
    }

    pub fn portal_id(&self) -> &str {
        &self.pool.portal_id
    }

    /// Liveness ping; streaming wrappers call this while bytes flow.
    pub fn touch(&self) {
        let mut slots = self.pool.slots.lock().expect("mac pool lock poisoned");
        if let Some(slot) = slots.get_mut(&self.mac) {
            if let Some(lease) = slot.leases.get_mut(&self.lease_id) {
                lease.last_seen = Instant::now();
            }
        }
    }
}

impl Drop for MacLease {
    fn drop(&mut self) {
        let mut slots = self.pool.slots.lock().expect("mac pool lock poisoned");
        if let Some(slot) = slots.get_mut(&self.mac) {
            if slot.leases.remove(&self.lease_id).is_some() {
                slot.identity.in_use = slot.leases.len() as u32;
                debug!(
                    portal_id = %self.pool.portal_id,
                    mac = %self.mac,
                    in_use = slot.identity.in_use,
                    "released MAC lease"
                );
            }
        }
    }
}

pub struct MacPoolManager {
    portals: HashMap<String, Arc<PortalPool>>,
    failure_threshold: u32,
    cooldown: Duration,
}

impl MacPoolManager {
    pub fn new(portals: &[Portal], config: &PoolConfig, cooldown: Duration) -> Self {
        let pools = portals
            .iter()
            .map(|portal| {
                let slots = portal
                    .macs
                    .iter()
                    .map(|mac| {
                        (
                            mac.clone(),
                            MacSlot {
                                identity: MacIdentity::new(&portal.id, mac),
                                leases: HashMap::new(),
                            },
                        )
                    })
                    .collect();
                (
                    portal.id.clone(),
                    Arc::new(PortalPool {
                        portal_id: portal.id.clone(),
                        streams_per_mac: portal.streams_per_mac,
                        slots: Mutex::new(slots),
                    }),
                )
            })
            .collect();
        Self {
            portals: pools,
            failure_threshold: config.failure_threshold,
            cooldown,
        }
    }

    /// Pick the least-loaded usable MAC for a new stream; ties go to the
    /// most recently successful handshake.
    pub fn select(&self, portal_id: &str) -> Result<MacLease, GatewayError> {
        self.select_excluding(portal_id, None)
    }

    /// Like [`select`](Self::select), but never returns `exclude`. Retries
    /// after a resolution failure use this so the second attempt lands on a
    /// different MAC than the one that just failed.
    pub fn select_excluding(
        &self,
        portal_id: &str,
        exclude: Option<&str>,
    ) -> Result<MacLease, GatewayError> {
        let pool = self
            .portals
            .get(portal_id)
            .ok_or_else(|| GatewayError::NoMacAvailable {
                portal_id: portal_id.to_string(),
            })?;
        let now = Utc::now();
        let mut slots = pool.slots.lock().expect("mac pool lock poisoned");

        let chosen = slots
            .values()
            .filter(|slot| exclude != Some(slot.identity.mac.as_str()))
            .filter(|slot| slot.selectable(pool.streams_per_mac, now))
            .min_by(|a, b| {
                a.leases
                    .len()
                    .cmp(&b.leases.len())
                    .then_with(|| b.identity.last_handshake.cmp(&a.identity.last_handshake))
            })
            .map(|slot| slot.identity.mac.clone());

        let mac = chosen.ok_or_else(|| GatewayError::NoMacAvailable {
            portal_id: portal_id.to_string(),
        })?;
        let lease_id = Uuid::new_v4();
        let slot = slots.get_mut(&mac).expect("selected mac exists");
        slot.leases.insert(
            lease_id,
            LeaseInfo {
                last_seen: Instant::now(),
            },
        );
        slot.identity.in_use = slot.leases.len() as u32;
        debug!(portal_id, mac = %mac, in_use = slot.identity.in_use, "leased MAC");
        Ok(MacLease {
            pool: Arc::clone(pool),
            mac,
            lease_id,
        })
    }

    /// Record a successful handshake/resolve for a MAC.
    pub fn record_success(&self, portal_id: &str, mac: &str) {
        self.with_slot(portal_id, mac, |slot| {
            slot.identity.last_handshake = Some(Utc::now());
            slot.identity.consecutive_failures = 0;
            slot.identity.cooldown_until = None;
        });
    }

    /// Record a failed handshake/resolve; past the threshold the MAC goes
    /// unreachable for the cooldown window.
    pub fn record_failure(&self, portal_id: &str, mac: &str) {
        let (threshold, cooldown) = (self.failure_threshold, self.cooldown);
        self.with_slot(portal_id, mac, |slot| {
            slot.identity.consecutive_failures += 1;
            if slot.identity.consecutive_failures >= threshold {
                let until = Utc::now() + chrono::Duration::from_std(cooldown).unwrap_or_default();
                slot.identity.cooldown_until = Some(until);
                warn!(
                    portal_id = %slot.identity.portal_id,
                    mac = %slot.identity.mac,
                    failures = slot.identity.consecutive_failures,
                    "MAC marked unreachable"
                );
            }
        });
    }

    /// Update the account expiry learned during a handshake.
    pub fn record_expiry(&self, portal_id: &str, mac: &str, expires_at: Option<NaiveDate>) {
        self.with_slot(portal_id, mac, |slot| {
            slot.identity.expires_at = expires_at;
        });
    }

    /// Watchdog sweep: drop leases whose holder has not reported liveness
    /// within `timeout`. Returns the number of force-released leases.
    pub fn force_release_stale(&self, timeout: Duration) -> usize {
        let mut released = 0;
        for pool in self.portals.values() {
            let mut slots = pool.slots.lock().expect("mac pool lock poisoned");
            for slot in slots.values_mut() {
                let before = slot.leases.len();
                slot.leases
                    .retain(|_, lease| lease.last_seen.elapsed() < timeout);
                let dropped = before - slot.leases.len();
                if dropped > 0 {
                    slot.identity.in_use = slot.leases.len() as u32;
                    released += dropped;
                    info!(
                        portal_id = %pool.portal_id,
                        mac = %slot.identity.mac,
                        dropped,
                        "force-released stale MAC leases"
                    );
                }
            }
        }
        released
    }

    /// Point-in-time view of every MAC, for the status surface.
    pub fn statuses(&self) -> Vec<MacStatus> {
        let now = Utc::now();
        let mut out = Vec::new();
        for pool in self.portals.values() {
            let slots = pool.slots.lock().expect("mac pool lock poisoned");
            for slot in slots.values() {
                out.push(MacStatus {
                    portal_id: slot.identity.portal_id.clone(),
                    mac: slot.identity.mac.clone(),
                    state: slot.state(pool.streams_per_mac, now),
                    in_use: slot.leases.len() as u32,
                    last_handshake: slot.identity.last_handshake,
                    expires_at: slot.identity.expires_at,
                    consecutive_failures: slot.identity.consecutive_failures,
                });
            }
        }
        out.sort_by(|a, b| (&a.portal_id, &a.mac).cmp(&(&b.portal_id, &b.mac)));
        out
    }

    fn with_slot<F: FnOnce(&mut MacSlot)>(&self, portal_id: &str, mac: &str, f: F) {
        if let Some(pool) = self.portals.get(portal_id) {
            let mut slots = pool.slots.lock().expect("mac pool lock poisoned");
            if let Some(slot) = slots.get_mut(mac) {
                f(slot);
            }
        }
    }
}
