//! Small shared helpers

pub mod mac;
pub mod names;

pub use mac::{normalize_mac, validate_mac};
pub use names::{normalize_channel_name, strip_quality_tokens};
