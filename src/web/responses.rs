//! Xtream-Codes response shapes
//!
//! Downstream players parse these bodies strictly: numbers often travel as
//! strings, a failed login is HTTP 200 with `"auth": 0`, and missing fields
//! make some players bail out of the whole playlist. Shapes here follow
//! what the common player implementations actually check.

use chrono::Utc;
use serde::Serialize;
use serde_json::{json, Value};

use crate::config::Config;
use crate::models::{Category, Channel, DownstreamUser, SeriesItem, VodItem};

/// Negative auth body. Always HTTP 200; players key off `auth` alone.
pub fn auth_failed(username: &str) -> Value {
    json!({
        "user_info": {
            "username": username,
            "auth": 0,
            "status": "Disabled",
        }
    })
}

pub fn user_and_server_info(
    config: &Config,
    user: &DownstreamUser,
    password: &str,
    active_cons: usize,
) -> Value {
    let exp_date = user
        .expires_at
        .and_then(|d| d.and_hms_opt(23, 59, 59))
        .map(|dt| dt.and_utc().timestamp().to_string());
    let created_at = user
        .created_at
        .map(|dt| dt.timestamp().to_string())
        .unwrap_or_else(|| "0".to_string());
    let now = Utc::now();
    json!({
        "user_info": {
            "username": user.username,
            "password": password,
            "message": "",
            "auth": 1,
            "status": "Active",
            "exp_date": exp_date,
            "is_trial": "0",
            "active_cons": active_cons.to_string(),
            "created_at": created_at,
            "max_connections": user.max_connections.to_string(),
            "allowed_output_formats": ["ts", "m3u8"],
        },
        "server_info": {
            "url": config.web.host,
            "port": config.web.port.to_string(),
            "https_port": "",
            "server_protocol": "http",
            "rtmp_port": "",
            "timezone": "UTC",
            "timestamp_now": now.timestamp(),
            "time_now": now.format("%Y-%m-%d %H:%M:%S").to_string(),
        }
    })
}

#[derive(Debug, Serialize)]
pub struct XcCategory {
    pub category_id: String,
    pub category_name: String,
    pub parent_id: u32,
}

impl From<&Category> for XcCategory {
    fn from(category: &Category) -> Self {
        Self {
            category_id: category.id.clone(),
            category_name: category.name.clone(),
            parent_id: 0,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct XcLiveStream {
    pub num: u32,
    pub name: String,
    pub stream_type: &'static str,
    pub stream_id: u32,
    pub stream_icon: String,
    pub epg_channel_id: String,
    pub added: String,
    pub category_id: String,
    pub custom_sid: String,
    pub tv_archive: u8,
    pub direct_source: String,
    pub tv_archive_duration: u8,
}

impl XcLiveStream {
    pub fn new(channel: &Channel, stream_id: u32) -> Self {
        Self {
            num: channel.number,
            name: channel.name.clone(),
            stream_type: "live",
            stream_id,
            stream_icon: channel.logo.clone().unwrap_or_default(),
            // Must agree with the channel ids in the XMLTV output.
            epg_channel_id: stream_id.to_string(),
            added: "0".to_string(),
            category_id: channel.category_id(),
            custom_sid: channel.key.as_sid(),
            tv_archive: 0,
            direct_source: String::new(),
            tv_archive_duration: 0,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct XcVodStream {
    pub num: u32,
    pub name: String,
    pub stream_type: &'static str,
    pub stream_id: u32,
    pub stream_icon: String,
    pub added: String,
    pub category_id: String,
    pub custom_sid: String,
    pub container_extension: &'static str,
    pub direct_source: String,
}

impl XcVodStream {
    pub fn new(item: &VodItem, stream_id: u32, num: u32) -> Self {
        Self {
            num,
            name: item.name.clone(),
            stream_type: "movie",
            stream_id,
            stream_icon: item.logo.clone().unwrap_or_default(),
            added: "0".to_string(),
            category_id: item.category_id.clone(),
            custom_sid: item.key.as_sid(),
            container_extension: "ts",
            direct_source: String::new(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct XcSeries {
    pub num: u32,
    pub name: String,
    pub series_id: u32,
    pub cover: String,
    pub category_id: String,
    pub plot: String,
    pub last_modified: String,
}

impl XcSeries {
    pub fn new(item: &SeriesItem, series_id: u32, num: u32) -> Self {
        Self {
            num,
            name: item.name.clone(),
            series_id,
            cover: item.cover.clone().unwrap_or_default(),
            category_id: item.category_id.clone(),
            plot: String::new(),
            last_modified: "0".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn negative_auth_keeps_the_expected_shape() {
        let body = auth_failed("alice");
        assert_eq!(body["user_info"]["auth"], 0);
        assert_eq!(body["user_info"]["username"], "alice");
    }

    #[test]
    fn user_info_renders_numbers_as_strings() {
        let config = Config::default();
        let user = DownstreamUser {
            username: "alice".into(),
            password: "secret".into(),
            enabled: true,
            max_connections: 2,
            allowed_portals: vec![],
            expires_at: None,
            created_at: None,
        };
        let body = user_and_server_info(&config, &user, "secret", 1);
        assert_eq!(body["user_info"]["auth"], 1);
        assert_eq!(body["user_info"]["max_connections"], "2");
        assert_eq!(body["user_info"]["active_cons"], "1");
        assert!(body["user_info"]["exp_date"].is_null());
        assert_eq!(body["server_info"]["timezone"], "UTC");
    }
}
