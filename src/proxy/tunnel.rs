//! Tunnel factory
//!
//! Resolves a proxy descriptor into a ready outbound transport. HTTP and
//! SOCKS descriptors map straight onto the HTTP client's proxy support.
//! Shadowsocks descriptors spawn a local `ss-local` SOCKS5 bridge on an
//! ephemeral port; the bridge is pre-flighted, verified end to end and torn
//! down when the last session holding the tunnel drops it.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::TunnelConfig;
use crate::errors::TunnelError;
use crate::proxy::descriptor::ProxyDescriptor;

const PREFLIGHT_TIMEOUT: Duration = Duration::from_secs(10);
const VERIFY_TIMEOUT: Duration = Duration::from_secs(10);
const BRIDGE_SPAWN_ATTEMPTS: u32 = 3;
const BRIDGE_SPAWN_BACKOFF: Duration = Duration::from_millis(500);
/// Grace period for ss-local to bind its listener before verification
const BRIDGE_SETTLE: Duration = Duration::from_millis(300);

/// A resolved outbound transport.
///
/// Holding the `Arc<Tunnel>` keeps any underlying bridge process alive;
/// dropping the last reference kills it (`kill_on_drop`).
pub struct Tunnel {
    proxy_url: Option<String>,
    _bridge: Option<ShadowsocksBridge>,
}

impl Tunnel {
    pub fn direct() -> Self {
        Self {
            proxy_url: None,
            _bridge: None,
        }
    }

    /// Proxy URL for the HTTP client, `None` for direct connections.
    pub fn proxy_url(&self) -> Option<&str> {
        self.proxy_url.as_deref()
    }
}

struct ShadowsocksBridge {
    // Killed on drop; field is only held for its lifetime.
    _child: Child,
    local_port: u16,
}

impl ShadowsocksBridge {
    fn socks_url(&self) -> String {
        format!("socks5://127.0.0.1:{}", self.local_port)
    }
}

/// Resolves descriptors to tunnels, caching live tunnels per descriptor so
/// concurrent sessions against the same portal share one bridge.
pub struct TunnelFactory {
    config: TunnelConfig,
    live: Mutex<HashMap<String, Weak<Tunnel>>>,
}

impl TunnelFactory {
    pub fn new(config: TunnelConfig) -> Self {
        Self {
            config,
            live: Mutex::new(HashMap::new()),
        }
    }

    /// Resolve `descriptor` into a usable tunnel. `None` or empty means a
    /// direct connection. Failures surface to the caller; there is no
    /// silent downgrade to direct.
    pub async fn open(&self, descriptor: Option<&str>) -> Result<Arc<Tunnel>, TunnelError> {
        let raw = match descriptor.map(str::trim).filter(|d| !d.is_empty()) {
            Some(raw) => raw,
            None => return Ok(Arc::new(Tunnel::direct())),
        };

        let mut live = self.live.lock().await;
        live.retain(|_, weak| weak.strong_count() > 0);
        if let Some(existing) = live.get(raw).and_then(Weak::upgrade) {
            return Ok(existing);
        }

        let parsed: ProxyDescriptor = raw.parse()?;
        let tunnel = match &parsed {
            ProxyDescriptor::Shadowsocks { cipher, .. } => {
                if cipher.is_deprecated() {
                    warn!(cipher = cipher.as_str(), "using deprecated shadowsocks cipher");
                }
                let bridge = self.start_bridge(&parsed).await?;
                info!(port = bridge.local_port, "shadowsocks bridge ready");
                Tunnel {
                    proxy_url: Some(bridge.socks_url()),
                    _bridge: Some(bridge),
                }
            }
            other => Tunnel {
                // proxy_url is always Some for non-shadowsocks descriptors
                proxy_url: other.proxy_url(),
                _bridge: None,
            },
        };

        let tunnel = Arc::new(tunnel);
        live.insert(raw.to_string(), Arc::downgrade(&tunnel));
        Ok(tunnel)
    }

    async fn start_bridge(
        &self,
        descriptor: &ProxyDescriptor,
    ) -> Result<ShadowsocksBridge, TunnelError> {
        let ProxyDescriptor::Shadowsocks {
            cipher,
            password,
            host,
            port,
        } = descriptor
        else {
            return Err(TunnelError::BridgeStartupFailed {
                reason: "not a shadowsocks descriptor".into(),
            });
        };

        // Pre-flight the remote endpoint before spawning anything locally.
        let endpoint = format!("{host}:{port}");
        tokio::time::timeout(PREFLIGHT_TIMEOUT, TcpStream::connect(&endpoint))
            .await
            .map_err(|_| TunnelError::ProxyUnreachable {
                endpoint: endpoint.clone(),
                reason: "connect timed out".into(),
            })?
            .map_err(|e| TunnelError::ProxyUnreachable {
                endpoint: endpoint.clone(),
                reason: e.to_string(),
            })?;

        let mut last_error = String::new();
        for attempt in 0..BRIDGE_SPAWN_ATTEMPTS {
            if attempt > 0 {
                tokio::time::sleep(BRIDGE_SPAWN_BACKOFF * 2u32.pow(attempt - 1)).await;
            }

            let local_port = allocate_local_port().await.map_err(|e| {
                TunnelError::BridgeStartupFailed {
                    reason: format!("no local port available: {e}"),
                }
            })?;

            debug!(
                attempt,
                local_port,
                remote = %endpoint,
                "spawning shadowsocks bridge"
            );
            let child = Command::new(&self.config.ss_local_bin)
                .args(["-s", host])
                .args(["-p", &port.to_string()])
                .args(["-k", password])
                .args(["-m", cipher.as_str()])
                .args(["-b", "127.0.0.1"])
                .args(["-l", &local_port.to_string()])
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .kill_on_drop(true)
                .spawn();

            let mut child = match child {
                Ok(child) => child,
                Err(e) => {
                    last_error = format!("spawn failed: {e}");
                    continue;
                }
            };

            tokio::time::sleep(BRIDGE_SETTLE).await;
            if let Ok(Some(status)) = child.try_wait() {
                last_error = format!("bridge exited immediately with {status}");
                continue;
            }

            let bridge = ShadowsocksBridge {
                _child: child,
                local_port,
            };
            match self.verify_bridge(&bridge).await {
                Ok(()) => return Ok(bridge),
                Err(reason) => {
                    warn!(attempt, local_port, %reason, "bridge verification failed");
                    last_error = reason;
                    // bridge (and child) dropped here, killing the process
                }
            }
        }

        Err(TunnelError::BridgeStartupFailed { reason: last_error })
    }

    /// Fetch an external probe URL through the bridge; a bridge that listens
    /// but cannot move traffic is useless and must not be handed out.
    async fn verify_bridge(&self, bridge: &ShadowsocksBridge) -> Result<(), String> {
        let proxy = reqwest::Proxy::all(bridge.socks_url()).map_err(|e| e.to_string())?;
        let client = reqwest::Client::builder()
            .proxy(proxy)
            .timeout(VERIFY_TIMEOUT)
            .build()
            .map_err(|e| e.to_string())?;
        let response = client
            .get(&self.config.probe_url)
            .send()
            .await
            .map_err(|e| format!("probe request failed: {e}"))?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(format!("probe returned {}", response.status()))
        }
    }
}

async fn allocate_local_port() -> std::io::Result<u16> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    Ok(listener.local_addr()?.port())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn direct_tunnel_for_empty_descriptor() {
        let factory = TunnelFactory::new(TunnelConfig::default());
        let tunnel = factory.open(None).await.unwrap();
        assert!(tunnel.proxy_url().is_none());
        let tunnel = factory.open(Some("  ")).await.unwrap();
        assert!(tunnel.proxy_url().is_none());
    }

    #[tokio::test]
    async fn plain_proxies_map_to_proxy_urls() {
        let factory = TunnelFactory::new(TunnelConfig::default());
        let tunnel = factory.open(Some("socks5://10.1.2.3:1080")).await.unwrap();
        assert_eq!(tunnel.proxy_url(), Some("socks5://10.1.2.3:1080"));
    }

    #[tokio::test]
    async fn live_tunnels_are_shared_per_descriptor() {
        let factory = TunnelFactory::new(TunnelConfig::default());
        let a = factory.open(Some("http://proxy.example:3128")).await.unwrap();
        let b = factory.open(Some("http://proxy.example:3128")).await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[tokio::test]
    async fn malformed_descriptor_surfaces_parse_error() {
        let factory = TunnelFactory::new(TunnelConfig::default());
        match factory.open(Some("socks5://")).await {
            Err(TunnelError::InvalidProxyFormat { .. }) => {}
            other => panic!("expected InvalidProxyFormat, got {:?}", other.err()),
        }
    }

    #[tokio::test]
    async fn unreachable_shadowsocks_endpoint_fails_preflight() {
        // Grab a port that is closed by the time we connect to it.
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };
        let factory = TunnelFactory::new(TunnelConfig::default());
        let descriptor = format!("ss://aes-256-gcm:pw@127.0.0.1:{port}");
        match factory.open(Some(&descriptor)).await {
            Err(TunnelError::ProxyUnreachable { .. }) => {}
            other => panic!("expected ProxyUnreachable, got {:?}", other.err()),
        }
    }
}
