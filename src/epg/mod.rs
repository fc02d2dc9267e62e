//! Electronic programme guide
//!
//! [`merge`] combines per-MAC portal guide variants (richest wins) with
//! fallback web feeds (gap-fill only), [`fallback`] fetches and matches the
//! feeds, and [`xmltv`] renders the result for downstream players.

pub mod fallback;
pub mod merge;
pub mod xmltv;

pub use fallback::{fetch_feeds, FallbackEpg, MatchPolicy};
pub use merge::{EpgBuilder, EpgSnapshot, EpgStore};
pub use xmltv::render_xmltv;
