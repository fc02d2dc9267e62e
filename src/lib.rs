//! stalker-gateway
//!
//! Exposes legacy Stalker/MAC set-top-box portals through an
//! Xtream-Codes-compatible API. Upstream portals are queried across a pool
//! of MAC identities (optionally via HTTP/SOCKS/Shadowsocks proxies), the
//! results merged into one deduplicated catalog and guide, and served to
//! ordinary IPTV players with per-user credentials and connection limits.

pub mod catalog;
pub mod config;
pub mod epg;
pub mod errors;
pub mod jobs;
pub mod models;
pub mod pool;
pub mod portal;
pub mod proxy;
pub mod session;
pub mod utils;
pub mod web;
