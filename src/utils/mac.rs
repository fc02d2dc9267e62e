//! MAC address validation and normalization
//!
//! Portals identify devices by MAC address. Operators paste these in a
//! variety of separator styles; everything is normalized to the canonical
//! uppercase colon form (`00:1A:79:XX:XX:XX`) at configuration load.

/// Accepts `AA:BB:CC:DD:EE:FF`, `AA-BB-CC-DD-EE-FF` and bare `AABBCCDDEEFF`.
pub fn validate_mac(mac: &str) -> bool {
    let cleaned: String = mac
        .trim()
        .chars()
        .filter(|c| *c != ':' && *c != '-')
        .collect();
    cleaned.len() == 12 && cleaned.chars().all(|c| c.is_ascii_hexdigit())
}

/// Normalize to `XX:XX:XX:XX:XX:XX` (uppercase). Returns `None` when the
/// input is not a valid MAC in any accepted form.
pub fn normalize_mac(mac: &str) -> Option<String> {
    if !validate_mac(mac) {
        return None;
    }
    let cleaned: String = mac
        .trim()
        .chars()
        .filter(|c| *c != ':' && *c != '-')
        .map(|c| c.to_ascii_uppercase())
        .collect();
    let pairs: Vec<&str> = (0..6).map(|i| &cleaned[i * 2..i * 2 + 2]).collect();
    Some(pairs.join(":"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("00:1A:79:12:34:56")]
    #[case("00-1a-79-12-34-56")]
    #[case("001a79123456")]
    fn accepts_all_documented_forms(#[case] input: &str) {
        assert!(validate_mac(input));
        assert_eq!(normalize_mac(input).as_deref(), Some("00:1A:79:12:34:56"));
    }

    #[rstest]
    #[case("")]
    #[case("00:1A:79:12:34")]
    #[case("00:1A:79:12:34:5G")]
    #[case("not a mac")]
    fn rejects_malformed(#[case] input: &str) {
        assert!(!validate_mac(input));
        assert_eq!(normalize_mac(input), None);
    }
}
