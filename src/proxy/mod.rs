//! Outbound proxy tunnels
//!
//! Portals are frequently reachable only through an operator-supplied proxy.
//! [`descriptor`] defines the parsing contract for proxy descriptor strings;
//! [`tunnel`] resolves a descriptor into an outbound transport, spawning and
//! supervising a local Shadowsocks bridge where needed.

pub mod descriptor;
pub mod tunnel;

pub use descriptor::{ProxyDescriptor, SsCipher};
pub use tunnel::{Tunnel, TunnelFactory};
