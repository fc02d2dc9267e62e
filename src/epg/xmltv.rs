//! XMLTV output
//!
//! Renders the merged guide for every enabled channel. Channels without any
//! guide data get a single synthetic all-day programme carrying the channel
//! name, which keeps players from collapsing the row entirely.

use chrono::{Duration, Utc};
use quick_xml::escape::escape;

use crate::catalog::CatalogSnapshot;
use crate::epg::EpgSnapshot;

const TIME_FORMAT: &str = "%Y%m%d%H%M%S +0000";

pub fn render_xmltv(catalog: &CatalogSnapshot, epg: &EpgSnapshot) -> String {
    let mut out = String::with_capacity(64 * 1024);
    out.push_str("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n");
    out.push_str("<!DOCTYPE tv SYSTEM \"xmltv.dtd\">\n");
    out.push_str("<tv generator-info-name=\"stalker-gateway\">\n");

    for channel in catalog.enabled_channels() {
        let Some(stream_id) = catalog.stream_id_for(&channel.key) else {
            continue;
        };
        out.push_str(&format!("  <channel id=\"{stream_id}\">\n"));
        out.push_str(&format!(
            "    <display-name>{}</display-name>\n",
            escape(&channel.name)
        ));
        if let Some(logo) = channel.logo.as_deref().filter(|l| !l.is_empty()) {
            out.push_str(&format!("    <icon src=\"{}\"/>\n", escape(logo)));
        }
        out.push_str("  </channel>\n");
    }

    for channel in catalog.enabled_channels() {
        let Some(stream_id) = catalog.stream_id_for(&channel.key) else {
            continue;
        };
        let programmes = epg.programmes(&channel.key);
        if programmes.is_empty() {
            // Synthetic 24h placeholder so the channel row is not blank.
            let start = Utc::now();
            let stop = start + Duration::hours(24);
            out.push_str(&format!(
                "  <programme start=\"{}\" stop=\"{}\" channel=\"{stream_id}\">\n",
                start.format(TIME_FORMAT),
                stop.format(TIME_FORMAT)
            ));
            out.push_str(&format!("    <title>{}</title>\n", escape(&channel.name)));
            out.push_str("  </programme>\n");
            continue;
        }
        for programme in programmes {
            out.push_str(&format!(
                "  <programme start=\"{}\" stop=\"{}\" channel=\"{stream_id}\">\n",
                programme.start.format(TIME_FORMAT),
                programme.stop.format(TIME_FORMAT)
            ));
            out.push_str(&format!(
                "    <title>{}</title>\n",
                escape(&programme.title)
            ));
            if let Some(desc) = programme.description.as_deref().filter(|d| !d.is_empty()) {
                out.push_str(&format!("    <desc>{}</desc>\n", escape(desc)));
            }
            out.push_str("  </programme>\n");
        }
    }

    out.push_str("</tv>\n");
    out
}
