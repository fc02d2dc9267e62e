//! Legacy Stalker/MAC portal protocol
//!
//! One [`client::PortalClient`] speaks the upstream protocol for a single
//! (portal, MAC) pair: endpoint discovery, handshake/token lifecycle, catalog
//! and EPG retrieval, and stream-link resolution.

pub mod client;
pub mod endpoints;
pub mod wire;

pub use client::PortalClient;
