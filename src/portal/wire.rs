//! Stalker portal wire format
//!
//! Every response wraps its payload in a `js` envelope. Portals are sloppy
//! about types: numeric ids arrive as numbers or strings depending on the
//! middleware version, so scalar fields use lenient deserializers.

use serde::{Deserialize, Deserializer};
use std::collections::HashMap;

/// The universal `{"js": ...}` envelope.
#[derive(Debug, Deserialize)]
pub struct JsEnvelope<T> {
    pub js: T,
}

/// Payloads that nest one level deeper under `js.data`.
#[derive(Debug, Deserialize)]
pub struct DataEnvelope<T> {
    #[serde(default = "Option::default")]
    pub data: Option<T>,
}

#[derive(Debug, Deserialize)]
pub struct HandshakePayload {
    #[serde(default)]
    pub token: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct AccountInfoPayload {
    /// Expiry date, in the portal's free-text "phone" field
    #[serde(default)]
    pub phone: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawChannel {
    #[serde(deserialize_with = "string_or_number")]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default, deserialize_with = "opt_string_or_number")]
    pub number: Option<String>,
    #[serde(default, deserialize_with = "opt_string_or_number")]
    pub tv_genre_id: Option<String>,
    #[serde(default)]
    pub logo: Option<String>,
    #[serde(default)]
    pub cmd: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawGenre {
    #[serde(deserialize_with = "string_or_number")]
    pub id: String,
    #[serde(default)]
    pub title: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawVodItem {
    #[serde(deserialize_with = "string_or_number")]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub screenshot_uri: Option<String>,
    #[serde(default)]
    pub cmd: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawSeriesItem {
    #[serde(deserialize_with = "string_or_number")]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default, deserialize_with = "opt_string_or_number")]
    pub category_id: Option<String>,
    #[serde(default)]
    pub screenshot_uri: Option<String>,
}

/// Paged `get_ordered_list` responses carry the page payload plus totals.
#[derive(Debug, Deserialize)]
pub struct OrderedListPayload<T> {
    #[serde(default = "Vec::new")]
    pub data: Vec<T>,
    #[serde(default, deserialize_with = "opt_number_i64")]
    pub total_items: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawProgramme {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub descr: Option<String>,
    #[serde(default, deserialize_with = "opt_number_i64")]
    pub start_timestamp: Option<i64>,
    #[serde(default, deserialize_with = "opt_number_i64")]
    pub stop_timestamp: Option<i64>,
}

/// `js` payload of `create_link`.
#[derive(Debug, Deserialize)]
pub struct CreateLinkPayload {
    #[serde(default)]
    pub cmd: String,
}

/// Per-channel programme lists keyed by upstream channel id.
pub type EpgPayload = HashMap<String, Vec<RawProgramme>>;

fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    Ok(scalar_to_string(&value).unwrap_or_default())
}

fn opt_string_or_number<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(value.as_ref().and_then(scalar_to_string))
}

fn opt_number_i64<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(value.as_ref().and_then(|v| match v {
        serde_json::Value::Number(n) => n.as_i64(),
        serde_json::Value::String(s) => s.parse::<i64>().ok(),
        _ => None,
    }))
}

fn scalar_to_string(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        serde_json::Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_ids_accept_numbers_and_strings() {
        let body = r#"{"js":{"data":[
            {"id": 42, "name": "One", "number": 1, "tv_genre_id": 3, "cmd": "ffmpeg http://localhost/ch/42"},
            {"id": "43", "name": "Two", "number": "2", "tv_genre_id": "3", "cmd": "ffmpeg http://example/ts/43"}
        ]}}"#;
        let parsed: JsEnvelope<DataEnvelope<Vec<RawChannel>>> = serde_json::from_str(body).unwrap();
        let channels = parsed.js.data.unwrap();
        assert_eq!(channels[0].id, "42");
        assert_eq!(channels[1].id, "43");
        assert_eq!(channels[0].tv_genre_id.as_deref(), Some("3"));
        assert_eq!(channels[1].number.as_deref(), Some("2"));
    }

    #[test]
    fn programme_timestamps_accept_strings() {
        let body = r#"{"js":{"data":{"42":[
            {"name": "News", "descr": "daily", "start_timestamp": "1700000000", "stop_timestamp": 1700003600}
        ]}}}"#;
        let parsed: JsEnvelope<DataEnvelope<EpgPayload>> = serde_json::from_str(body).unwrap();
        let epg = parsed.js.data.unwrap();
        let programme = &epg["42"][0];
        assert_eq!(programme.start_timestamp, Some(1_700_000_000));
        assert_eq!(programme.stop_timestamp, Some(1_700_003_600));
    }

    #[test]
    fn handshake_token_is_optional() {
        let parsed: JsEnvelope<HandshakePayload> =
            serde_json::from_str(r#"{"js":{"token":"abc"}}"#).unwrap();
        assert_eq!(parsed.js.token.as_deref(), Some("abc"));
        let parsed: JsEnvelope<HandshakePayload> = serde_json::from_str(r#"{"js":{}}"#).unwrap();
        assert!(parsed.js.token.is_none());
    }
}
