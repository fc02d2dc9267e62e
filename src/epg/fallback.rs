//! Fallback guide feeds
//!
//! Public XMLTV dumps (gzipped, one file per country) fill guide gaps for
//! channels whose portal returns no EPG. Matching is deliberately cautious:
//! a wrong programme grid on the right channel is worse than an empty one,
//! so only exact normalized-name matches and high-confidence substring
//! matches are accepted, and fuzzy matching stays off unless the operator
//! opts in.

use std::collections::HashMap;
use std::io::Read;

use chrono::{DateTime, Utc};
use flate2::read::GzDecoder;
use quick_xml::events::Event;
use quick_xml::Reader;
use tracing::{debug, warn};

use crate::config::EpgConfig;
use crate::errors::{AppError, AppResult};
use crate::models::{EpgProgramme, ProgrammeSource};
use crate::utils::{normalize_channel_name, strip_quality_tokens};

/// Country code to feed file, epgshare naming scheme.
const COUNTRY_FILES: &[(&str, &str)] = &[
    ("al", "epg_ripper_AL1.xml.gz"),
    ("ar", "epg_ripper_AR1.xml.gz"),
    ("at", "epg_ripper_AT1.xml.gz"),
    ("au", "epg_ripper_AU1.xml.gz"),
    ("be", "epg_ripper_BE1.xml.gz"),
    ("br", "epg_ripper_BR1.xml.gz"),
    ("ca", "epg_ripper_CA1.xml.gz"),
    ("ch", "epg_ripper_CH1.xml.gz"),
    ("cz", "epg_ripper_CZ1.xml.gz"),
    ("de", "epg_ripper_DE1.xml.gz"),
    ("dk", "epg_ripper_DK1.xml.gz"),
    ("es", "epg_ripper_ES1.xml.gz"),
    ("fr", "epg_ripper_FR1.xml.gz"),
    ("gr", "epg_ripper_GR1.xml.gz"),
    ("hr", "epg_ripper_HR1.xml.gz"),
    ("hu", "epg_ripper_HU1.xml.gz"),
    ("it", "epg_ripper_IT1.xml.gz"),
    ("nl", "epg_ripper_NL1.xml.gz"),
    ("no", "epg_ripper_NO1.xml.gz"),
    ("pl", "epg_ripper_PL1.xml.gz"),
    ("pt", "epg_ripper_PT1.xml.gz"),
    ("ro", "epg_ripper_RO1.xml.gz"),
    ("rs", "epg_ripper_RS1.xml.gz"),
    ("se", "epg_ripper_SE1.xml.gz"),
    ("tr", "epg_ripper_TR1.xml.gz"),
    ("uk", "epg_ripper_UK1.xml.gz"),
    ("us", "epg_ripper_US1.xml.gz"),
];

#[derive(Debug, Clone)]
pub struct FallbackChannel {
    pub epg_id: String,
    pub display_name: String,
    pub programmes: Vec<EpgProgramme>,
}

/// Parsed fallback feeds, indexed by normalized display name.
#[derive(Debug, Default)]
pub struct FallbackEpg {
    channels: HashMap<String, FallbackChannel>,
}

impl FallbackEpg {
    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// Merge another feed in; first feed to claim a name keeps it.
    pub fn absorb(&mut self, other: FallbackEpg) {
        for (name, channel) in other.channels {
            self.channels.entry(name).or_insert(channel);
        }
    }

    pub fn get_exact(&self, normalized_name: &str) -> Option<&FallbackChannel> {
        self.channels.get(normalized_name)
    }

    /// Direct lookup for operator-pinned guide ids.
    pub fn get_by_epg_id(&self, epg_id: &str) -> Option<&FallbackChannel> {
        self.channels.values().find(|c| c.epg_id == epg_id)
    }

    fn iter(&self) -> impl Iterator<Item = (&String, &FallbackChannel)> {
        self.channels.iter()
    }
}

/// How far name matching is allowed to reach.
#[derive(Debug, Clone)]
pub struct MatchPolicy {
    pub substring_min_ratio: f64,
    pub fuzzy: bool,
}

impl MatchPolicy {
    pub fn from_config(config: &EpgConfig) -> Self {
        Self {
            substring_min_ratio: config.substring_min_ratio,
            fuzzy: config.fuzzy_matching,
        }
    }

    /// Resolve a portal channel name against the feed index.
    ///
    /// Tiers, strictest first: exact normalized match, then substring
    /// containment judged with quality suffixes stripped from both sides
    /// but with the length ratio taken over the full names, so "ARD HD"
    /// against a feed's "ARD" scores 50% shared and is rejected. Then
    /// (opt-in) fuzzy. No tier matched means no guide, the safe answer.
    pub fn find<'a>(&self, channel_name: &str, feed: &'a FallbackEpg) -> Option<&'a FallbackChannel> {
        let needle = normalize_channel_name(channel_name);
        if needle.is_empty() {
            return None;
        }
        if let Some(hit) = feed.get_exact(&needle) {
            return Some(hit);
        }

        let stripped_needle = strip_quality_tokens(&needle);
        let mut best: Option<(f64, &FallbackChannel)> = None;
        for (name, channel) in feed.iter() {
            let stripped_name = strip_quality_tokens(name);
            let (short, long) = if stripped_needle.len() <= stripped_name.len() {
                (stripped_needle.as_str(), stripped_name.as_str())
            } else {
                (stripped_name.as_str(), stripped_needle.as_str())
            };
            if short.is_empty() || !long.contains(short) {
                continue;
            }
            let ratio =
                needle.len().min(name.len()) as f64 / needle.len().max(name.len()) as f64;
            if ratio >= self.substring_min_ratio
                && best.as_ref().is_none_or(|(r, _)| ratio > *r)
            {
                best = Some((ratio, channel));
            }
        }
        if let Some((_, hit)) = best {
            return Some(hit);
        }

        if self.fuzzy {
            let mut best: Option<(f64, &FallbackChannel)> = None;
            for (name, channel) in feed.iter() {
                let score = similarity(&needle, name);
                if score >= 0.85 && best.as_ref().is_none_or(|(s, _)| score > *s) {
                    best = Some((score, channel));
                }
            }
            return best.map(|(_, hit)| hit);
        }
        None
    }
}

/// Normalized Levenshtein similarity in `0.0..=1.0`.
fn similarity(a: &str, b: &str) -> f64 {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    let longest = a.len().max(b.len());
    if longest == 0 {
        return 1.0;
    }
    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut current = vec![0usize; b.len() + 1];
    for (i, ca) in a.iter().enumerate() {
        current[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let cost = usize::from(ca != cb);
            current[j + 1] = (prev[j + 1] + 1).min(current[j] + 1).min(prev[j] + cost);
        }
        std::mem::swap(&mut prev, &mut current);
    }
    1.0 - prev[b.len()] as f64 / longest as f64
}

/// Download and parse the configured country feeds into one index.
pub async fn fetch_feeds(
    client: &reqwest::Client,
    config: &EpgConfig,
) -> AppResult<FallbackEpg> {
    let mut merged = FallbackEpg::default();
    for country in &config.fallback_countries {
        let Some((_, file)) = COUNTRY_FILES
            .iter()
            .find(|(code, _)| code.eq_ignore_ascii_case(country))
        else {
            warn!(country = %country, "no fallback feed known for country, skipping");
            continue;
        };
        let url = format!("{}{file}", config.feed_base_url);
        match fetch_one(client, &url).await {
            Ok(feed) => {
                debug!(country = %country, channels = feed.channel_count(), "fallback feed loaded");
                merged.absorb(feed);
            }
            Err(err) => {
                warn!(country = %country, url = %url, error = %err, "fallback feed failed, continuing without it");
            }
        }
    }
    Ok(merged)
}

async fn fetch_one(client: &reqwest::Client, url: &str) -> AppResult<FallbackEpg> {
    let body = client.get(url).send().await?.error_for_status()?.bytes().await?;
    let mut xml = String::new();
    GzDecoder::new(body.as_ref()).read_to_string(&mut xml)?;
    parse_xmltv(&xml)
}

/// XMLTV timestamps look like `20240101180000 +0000`.
fn parse_xmltv_time(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_str(raw.trim(), "%Y%m%d%H%M%S %z")
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

pub fn parse_xmltv(xml: &str) -> AppResult<FallbackEpg> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    // epg id -> display name, then programmes re-keyed onto names at the end
    let mut display_names: HashMap<String, String> = HashMap::new();
    let mut programmes: HashMap<String, Vec<EpgProgramme>> = HashMap::new();

    let mut current_channel: Option<String> = None;
    let mut current_programme: Option<(String, Option<DateTime<Utc>>, Option<DateTime<Utc>>)> = None;
    let mut title = String::new();
    let mut desc = String::new();
    let mut in_title = false;
    let mut in_desc = false;
    let mut in_display_name = false;

    loop {
        match reader.read_event() {
            Ok(Event::Start(ref e)) | Ok(Event::Empty(ref e)) => match e.name().as_ref() {
                b"channel" => {
                    current_channel = attr(e, b"id");
                }
                b"display-name" => in_display_name = current_channel.is_some(),
                b"programme" => {
                    let channel = attr(e, b"channel").unwrap_or_default();
                    let start = attr(e, b"start").and_then(|s| parse_xmltv_time(&s));
                    let stop = attr(e, b"stop").and_then(|s| parse_xmltv_time(&s));
                    current_programme = Some((channel, start, stop));
                    title.clear();
                    desc.clear();
                }
                b"title" => in_title = current_programme.is_some(),
                b"desc" => in_desc = current_programme.is_some(),
                _ => {}
            },
            Ok(Event::Text(e)) => {
                let text = e.xml_content().unwrap_or_default();
                if in_display_name {
                    if let Some(id) = &current_channel {
                        display_names
                            .entry(id.clone())
                            .or_insert_with(|| text.to_string());
                    }
                } else if in_title {
                    title.push_str(&text);
                } else if in_desc {
                    desc.push_str(&text);
                }
            }
            Ok(Event::End(ref e)) => match e.name().as_ref() {
                b"channel" => current_channel = None,
                b"display-name" => in_display_name = false,
                b"title" => in_title = false,
                b"desc" => in_desc = false,
                b"programme" => {
                    if let Some((channel, Some(start), Some(stop))) = current_programme.take() {
                        programmes.entry(channel).or_default().push(EpgProgramme {
                            start,
                            stop,
                            title: title.clone(),
                            description: (!desc.is_empty()).then(|| desc.clone()),
                            source: ProgrammeSource::Fallback,
                        });
                    }
                }
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(err) => {
                return Err(AppError::internal(format!(
                    "malformed fallback feed: {err}"
                )));
            }
            _ => {}
        }
    }

    let mut channels = HashMap::new();
    for (epg_id, display_name) in display_names {
        let normalized = normalize_channel_name(&display_name);
        if normalized.is_empty() {
            continue;
        }
        let entries = programmes.remove(&epg_id).unwrap_or_default();
        channels.entry(normalized).or_insert(FallbackChannel {
            epg_id,
            display_name,
            programmes: entries,
        });
    }
    Ok(FallbackEpg { channels })
}

fn attr(e: &quick_xml::events::BytesStart<'_>, name: &[u8]) -> Option<String> {
    e.attributes()
        .flatten()
        .find(|a| a.key.as_ref() == name)
        .and_then(|a| a.unescape_value().ok())
        .map(|v| v.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<tv>
  <channel id="ard.de"><display-name>ARD</display-name></channel>
  <channel id="zdf.de"><display-name>ZDF HD</display-name></channel>
  <channel id="skysport.de"><display-name>Sky Sport News</display-name></channel>
  <programme start="20260825180000 +0000" stop="20260825190000 +0000" channel="ard.de">
    <title>Tagesschau</title>
    <desc>News of the day</desc>
  </programme>
  <programme start="20260825190000 +0000" stop="20260825200000 +0000" channel="ard.de">
    <title>Evening film</title>
  </programme>
</tv>"#;

    fn policy() -> MatchPolicy {
        MatchPolicy {
            substring_min_ratio: 0.8,
            fuzzy: false,
        }
    }

    #[test]
    fn parses_channels_and_programmes() {
        let feed = parse_xmltv(SAMPLE).unwrap();
        assert_eq!(feed.channel_count(), 3);
        let ard = feed.get_exact("ard").unwrap();
        assert_eq!(ard.epg_id, "ard.de");
        assert_eq!(ard.programmes.len(), 2);
        assert_eq!(ard.programmes[0].title, "Tagesschau");
        assert_eq!(
            ard.programmes[0].description.as_deref(),
            Some("News of the day")
        );
        assert_eq!(ard.programmes[0].source, ProgrammeSource::Fallback);
    }

    #[test]
    fn exact_match_requires_the_same_name() {
        let feed = parse_xmltv(SAMPLE).unwrap();
        let hit = policy().find("ARD", &feed).unwrap();
        assert_eq!(hit.epg_id, "ard.de");
        let hit = policy().find("ZDF HD", &feed).unwrap();
        assert_eq!(hit.epg_id, "zdf.de");
    }

    #[test]
    fn quality_suffix_alone_is_not_a_match() {
        let feed = parse_xmltv(SAMPLE).unwrap();
        // "ard hd" shares only 3 of 6 characters with the feed's "ard";
        // guessing here would hand the wrong grid to every regional variant.
        assert!(policy().find("ARD HD", &feed).is_none());
        assert!(policy().find("ZDF", &feed).is_none());
    }

    #[test]
    fn short_substring_is_rejected() {
        let feed = parse_xmltv(SAMPLE).unwrap();
        // "sky" is contained in "sky sport news" but covers far less than
        // 80% of it; a guess here would be wrong more often than right.
        assert!(policy().find("Sky", &feed).is_none());
    }

    #[test]
    fn high_coverage_substring_is_accepted() {
        let feed = parse_xmltv(SAMPLE).unwrap();
        // "sky sport news" vs "sky sport news 24" style containment.
        let hit = policy().find("Sky Sport News HD", &feed).unwrap();
        assert_eq!(hit.epg_id, "skysport.de");
    }

    #[test]
    fn fuzzy_stays_off_by_default() {
        let feed = parse_xmltv(SAMPLE).unwrap();
        assert!(policy().find("Skie Sporrt News", &feed).is_none());
        let fuzzy = MatchPolicy {
            substring_min_ratio: 0.8,
            fuzzy: true,
        };
        assert!(fuzzy.find("Sky Sport Newz", &feed).is_some());
    }

    #[test]
    fn unknown_name_matches_nothing() {
        let feed = parse_xmltv(SAMPLE).unwrap();
        assert!(policy().find("Completely Different", &feed).is_none());
    }
}
