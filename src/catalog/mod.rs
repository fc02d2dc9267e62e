//! Merged catalog
//!
//! [`merge`] turns per-MAC raw listings into one deduplicated, override-
//! applied catalog per portal; [`snapshot`] holds the immutable result and
//! the deterministic numeric stream-id table, swapped atomically by the
//! refresh cycle.

pub mod merge;
pub mod snapshot;

pub use merge::{build_snapshot, merge_portal, PortalCatalog, PortalFetch};
pub use snapshot::{CatalogSnapshot, CatalogStore};
