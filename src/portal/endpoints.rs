//! Portal endpoint discovery
//!
//! Portals hide their load handler behind a handful of historical paths.
//! Discovery tries a fixed candidate list first and falls back to probing
//! for `xpcom.common.js` under the client prefixes the MAG firmware uses;
//! finding the script under a prefix implies which load handler the portal
//! runs. The first endpoint that completes a handshake is cached for the
//! rest of the session.

use url::Url;

/// Handler paths tried in order, relative to the portal host.
pub const HANDSHAKE_PATHS: &[&str] = &[
    "/portal.php",
    "/stalker_portal/server/load.php",
    "/server/load.php",
    "/c/portal.php",
];

/// (probe path, implied handler path) pairs for dynamic detection.
pub const XPCOM_PROBES: &[(&str, &str)] = &[
    ("/c/xpcom.common.js", "/portal.php"),
    ("/client/xpcom.common.js", "/portal.php"),
    ("/c_/xpcom.common.js", "/portal.php"),
    ("/stalker_portal/c/xpcom.common.js", "/stalker_portal/server/load.php"),
    ("/portal/c/xpcom.common.js", "/portal/server/load.php"),
];

/// Absolute candidate endpoint URLs for a portal base URL, in trial order.
/// A base URL carrying its own path contributes path-local candidates first,
/// since an operator who typed a path usually knew something.
pub fn candidate_endpoints(base: &Url) -> Vec<String> {
    let origin = origin_of(base);
    let mut candidates = Vec::new();

    let path = base.path().trim_end_matches('/');
    if !path.is_empty() {
        candidates.push(format!("{origin}{path}/portal.php"));
        candidates.push(format!("{origin}{path}/server/load.php"));
        candidates.push(format!("{origin}{path}"));
    }
    for handler in HANDSHAKE_PATHS {
        let url = format!("{origin}{handler}");
        if !candidates.contains(&url) {
            candidates.push(url);
        }
    }
    candidates
}

/// `scheme://host[:port]` with no trailing slash.
pub fn origin_of(base: &Url) -> String {
    let mut origin = format!(
        "{}://{}",
        base.scheme(),
        base.host_str().unwrap_or_default()
    );
    if let Some(port) = base.port() {
        origin.push_str(&format!(":{port}"));
    }
    origin
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_host_yields_standard_paths() {
        let base = Url::parse("http://portal.example").unwrap();
        let candidates = candidate_endpoints(&base);
        assert_eq!(candidates[0], "http://portal.example/portal.php");
        assert!(candidates
            .contains(&"http://portal.example/stalker_portal/server/load.php".to_string()));
        assert!(candidates.contains(&"http://portal.example/c/portal.php".to_string()));
    }

    #[test]
    fn configured_path_is_tried_first() {
        let base = Url::parse("http://portal.example:8080/stalker_portal/c/").unwrap();
        let candidates = candidate_endpoints(&base);
        assert_eq!(
            candidates[0],
            "http://portal.example:8080/stalker_portal/c/portal.php"
        );
        assert!(candidates.contains(&"http://portal.example:8080/portal.php".to_string()));
    }

    #[test]
    fn origin_keeps_explicit_port() {
        let base = Url::parse("https://portal.example:8443/c/").unwrap();
        assert_eq!(origin_of(&base), "https://portal.example:8443");
    }
}
