//! Downstream sessions
//!
//! Authenticates API users and enforces per-user connection limits. A
//! playback handler holds a [`ConnectionGuard`] for the lifetime of the
//! stream; dropping it (normal end, client disconnect, handler panic)
//! releases the slot. Clients that reconnect from the same device replace
//! their old session instead of tripping the limit, which is what zappers
//! and players that re-open the stream on every channel change need.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use sha2::{Digest, Sha256};
use tracing::debug;
use uuid::Uuid;

use crate::errors::GatewayError;
use crate::models::{ActiveConnection, DownstreamUser};

/// Why a credential pair was rejected. Downstream this always renders as
/// the same negative auth body; the distinction is for logs only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthFailure {
    UnknownUser,
    BadPassword,
    Disabled,
    Expired,
}

impl fmt::Display for AuthFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownUser => write!(f, "unknown user"),
            Self::BadPassword => write!(f, "bad password"),
            Self::Disabled => write!(f, "account disabled"),
            Self::Expired => write!(f, "account expired"),
        }
    }
}

pub struct SessionBroker {
    users: HashMap<String, DownstreamUser>,
    connections: Arc<Mutex<HashMap<Uuid, ActiveConnection>>>,
    liveness_timeout: Duration,
}

impl SessionBroker {
    pub fn new(users: Vec<DownstreamUser>, liveness_timeout: Duration) -> Self {
        Self {
            users: users
                .into_iter()
                .map(|u| (u.username.clone(), u))
                .collect(),
            connections: Arc::new(Mutex::new(HashMap::new())),
            liveness_timeout,
        }
    }

    pub fn authenticate(
        &self,
        username: &str,
        password: &str,
    ) -> Result<&DownstreamUser, AuthFailure> {
        let user = self.users.get(username).ok_or(AuthFailure::UnknownUser)?;
        if user.password != password {
            return Err(AuthFailure::BadPassword);
        }
        if !user.enabled {
            return Err(AuthFailure::Disabled);
        }
        if let Some(expires) = user.expires_at {
            if Utc::now().date_naive() > expires {
                return Err(AuthFailure::Expired);
            }
        }
        Ok(user)
    }

    pub fn user(&self, username: &str) -> Option<&DownstreamUser> {
        self.users.get(username)
    }

    /// Claim a playback slot. `max_connections == 0` means unlimited.
    pub fn admit(
        &self,
        user: &DownstreamUser,
        stream_id: u32,
        device_id: &str,
        client_ip: &str,
    ) -> Result<ConnectionGuard, GatewayError> {
        let mut connections = self.connections.lock().expect("session lock poisoned");

        let now = Utc::now();
        let cutoff = now - chrono::Duration::from_std(self.liveness_timeout).unwrap_or_default();
        connections.retain(|_, conn| conn.last_seen >= cutoff);

        // Same device re-tuning replaces its old session.
        connections
            .retain(|_, conn| !(conn.username == user.username && conn.device_id == device_id));

        let active = connections
            .values()
            .filter(|conn| conn.username == user.username)
            .count();
        if user.max_connections > 0 && active >= user.max_connections as usize {
            return Err(GatewayError::AdmissionDenied {
                username: user.username.clone(),
                max: user.max_connections,
            });
        }

        let id = Uuid::new_v4();
        connections.insert(
            id,
            ActiveConnection {
                username: user.username.clone(),
                stream_id,
                device_id: device_id.to_string(),
                client_ip: client_ip.to_string(),
                started_at: now,
                last_seen: now,
            },
        );
        debug!(username = %user.username, stream_id, device = %device_id, "session admitted");
        Ok(ConnectionGuard {
            connections: Arc::clone(&self.connections),
            id,
        })
    }

    pub fn active_count(&self, username: &str) -> usize {
        self.connections
            .lock()
            .expect("session lock poisoned")
            .values()
            .filter(|conn| conn.username == username)
            .count()
    }

    /// Drop sessions whose guard stopped touching them. Returns how many
    /// were reaped.
    pub fn prune_stale(&self) -> usize {
        let cutoff =
            Utc::now() - chrono::Duration::from_std(self.liveness_timeout).unwrap_or_default();
        let mut connections = self.connections.lock().expect("session lock poisoned");
        let before = connections.len();
        connections.retain(|_, conn| conn.last_seen >= cutoff);
        before - connections.len()
    }

    pub fn connections(&self) -> Vec<ActiveConnection> {
        let mut list: Vec<ActiveConnection> = self
            .connections
            .lock()
            .expect("session lock poisoned")
            .values()
            .cloned()
            .collect();
        list.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        list
    }
}

/// Stable per-client identity for the same-device replacement rule.
pub fn device_fingerprint(client_ip: &str, user_agent: &str) -> String {
    let digest = Sha256::digest(format!("{client_ip}|{user_agent}").as_bytes());
    hex::encode(&digest[..8])
}

/// RAII playback slot; dropping it frees the slot immediately.
pub struct ConnectionGuard {
    connections: Arc<Mutex<HashMap<Uuid, ActiveConnection>>>,
    id: Uuid,
}

impl ConnectionGuard {
    /// Mark the session as live; called while bytes are flowing.
    pub fn touch(&self) {
        if let Ok(mut connections) = self.connections.lock() {
            if let Some(conn) = connections.get_mut(&self.id) {
                conn.last_seen = Utc::now();
            }
        }
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        if let Ok(mut connections) = self.connections.lock() {
            connections.remove(&self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(max: u32) -> DownstreamUser {
        DownstreamUser {
            username: "alice".into(),
            password: "secret".into(),
            enabled: true,
            max_connections: max,
            allowed_portals: vec![],
            expires_at: None,
            created_at: None,
        }
    }

    fn broker(max: u32) -> SessionBroker {
        SessionBroker::new(vec![user(max)], Duration::from_secs(60))
    }

    #[test]
    fn authenticate_distinguishes_failure_reasons() {
        let mut expired = user(1);
        expired.username = "bob".into();
        expired.expires_at = Some(Utc::now().date_naive() - chrono::Duration::days(1));
        let mut disabled = user(1);
        disabled.username = "carol".into();
        disabled.enabled = false;
        let broker = SessionBroker::new(
            vec![user(1), expired, disabled],
            Duration::from_secs(60),
        );
        assert!(broker.authenticate("alice", "secret").is_ok());
        assert_eq!(
            broker.authenticate("nobody", "x"),
            Err(AuthFailure::UnknownUser)
        );
        assert_eq!(
            broker.authenticate("alice", "wrong"),
            Err(AuthFailure::BadPassword)
        );
        assert_eq!(
            broker.authenticate("bob", "secret"),
            Err(AuthFailure::Expired)
        );
        assert_eq!(
            broker.authenticate("carol", "secret"),
            Err(AuthFailure::Disabled)
        );
    }

    #[test]
    fn limit_blocks_extra_connections_and_drop_frees_the_slot() {
        let broker = broker(1);
        let user = broker.user("alice").unwrap().clone();
        let guard = broker.admit(&user, 100, "device-a", "10.0.0.1").unwrap();
        let denied = broker.admit(&user, 101, "device-b", "10.0.0.2");
        assert!(matches!(
            denied,
            Err(GatewayError::AdmissionDenied { max: 1, .. })
        ));
        drop(guard);
        assert!(broker.admit(&user, 101, "device-b", "10.0.0.2").is_ok());
    }

    #[test]
    fn same_device_replaces_its_old_session() {
        let broker = broker(1);
        let user = broker.user("alice").unwrap().clone();
        let _first = broker.admit(&user, 100, "device-a", "10.0.0.1").unwrap();
        // A channel change from the same player must not be rejected.
        let second = broker.admit(&user, 101, "device-a", "10.0.0.1");
        assert!(second.is_ok());
        assert_eq!(broker.active_count("alice"), 1);
    }

    #[test]
    fn zero_limit_means_unlimited() {
        let broker = broker(0);
        let user = broker.user("alice").unwrap().clone();
        let _guards: Vec<_> = (0..5)
            .map(|i| {
                broker
                    .admit(&user, 100 + i, &format!("device-{i}"), "10.0.0.1")
                    .unwrap()
            })
            .collect();
        assert_eq!(broker.active_count("alice"), 5);
    }

    #[test]
    fn stale_sessions_are_pruned() {
        let broker = SessionBroker::new(vec![user(1)], Duration::from_secs(0));
        let user = broker.user("alice").unwrap().clone();
        let guard = broker.admit(&user, 100, "device-a", "10.0.0.1").unwrap();
        std::mem::forget(guard); // simulate a handler that never cleaned up
        std::thread::sleep(Duration::from_millis(10));
        assert_eq!(broker.prune_stale(), 1);
        assert_eq!(broker.active_count("alice"), 0);
    }

    #[test]
    fn fingerprint_is_stable_per_client() {
        let a = device_fingerprint("10.0.0.1", "VLC/3.0.20");
        let b = device_fingerprint("10.0.0.1", "VLC/3.0.20");
        let c = device_fingerprint("10.0.0.2", "VLC/3.0.20");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
