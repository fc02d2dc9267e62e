//! Channel name normalization for EPG fallback matching
//!
//! Normalization lowercases, strips bracketed decorations and collapses
//! punctuation to spaces, but keeps quality suffixes intact: "ARD HD" and
//! "ARD" must stay distinguishable so the matcher can judge how much of a
//! name is actually shared. Quality tokens are only dropped by
//! [`strip_quality_tokens`], which the substring tier applies to both sides
//! at once.

const QUALITY_TOKENS: &[&str] = &[
    "hd", "sd", "fhd", "uhd", "4k", "8k", "hevc", "h265", "h264", "raw", "vip",
];

/// Lowercase, strip bracketed noise, collapse spaces. Quality suffixes stay.
pub fn normalize_channel_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut depth = 0usize;
    for c in name.chars() {
        match c {
            '(' | '[' | '{' => depth += 1,
            ')' | ']' | '}' => depth = depth.saturating_sub(1),
            _ if depth > 0 => {}
            c if c.is_alphanumeric() => out.extend(c.to_lowercase()),
            _ => out.push(' '),
        }
    }
    out.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Drop quality tokens from an already-normalized name.
pub fn strip_quality_tokens(normalized: &str) -> String {
    normalized
        .split_whitespace()
        .filter(|word| !QUALITY_TOKENS.contains(word))
        .collect::<Vec<_>>()
        .join(" ")
}
