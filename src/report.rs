// src/report.rs

//! HTML report of recorded sessions, rendered with Handlebars.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local, Utc};
use handlebars::{Handlebars, Helper, HelperResult, Output, RenderContext};
use log::info;
use serde::Serialize;

use crate::error::Result;
use crate::store::{SessionRecord, SessionSource};

/// Rows beyond this many, oldest first, are left out of the page
pub const MAX_ROWS: usize = 500;
pub const REPORT_FILE: &str = "report.html";

#[derive(Debug, Clone, Serialize)]
struct ReportRow {
    id: u64,
    #[serde(with = "chrono::serde::ts_seconds")]
    timestamp: DateTime<Utc>,
    source: SessionSource,
    method: String,
    url: String,
    /// Blank for flows, which have no status
    status: String,
    content_type: String,
    size_bytes: u64,
    duration_ms: u64,
    rule: Option<String>,
    applied: bool,
    error: Option<String>,
}

impl From<&SessionRecord> for ReportRow {
    fn from(record: &SessionRecord) -> Self {
        let entry = &record.entry;
        ReportRow {
            id: record.id,
            timestamp: record.timestamp,
            source: entry.source,
            method: entry.method.clone(),
            url: entry.url.clone(),
            status: match entry.status {
                0 => String::new(),
                status => status.to_string(),
            },
            content_type: entry.content_type.clone(),
            size_bytes: entry.size_bytes,
            duration_ms: entry.duration_ms,
            rule: entry.matched_rule_id.clone(),
            applied: entry.applied,
            error: entry.error.clone(),
        }
    }
}

#[derive(Debug, Serialize)]
struct ReportData {
    start_time: String,
    duration: String,
    session_count: usize,
    proxy_count: usize,
    tunnel_count: usize,
    flow_count: usize,
    modified_count: usize,
    total_bytes: u64,
    sessions: Vec<ReportRow>,
}

impl ReportData {
    fn new(sessions: &[SessionRecord], started: DateTime<Utc>, now: DateTime<Utc>) -> Self {
        let count = |source: SessionSource| sessions.iter().filter(|s| s.entry.source == source).count();
        ReportData {
            start_time: started.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S").to_string(),
            duration: format_duration((now - started).num_seconds()),
            session_count: sessions.len(),
            proxy_count: count(SessionSource::Proxy),
            tunnel_count: count(SessionSource::Tunnel),
            flow_count: count(SessionSource::Flow),
            modified_count: sessions.iter().filter(|s| s.entry.applied).count(),
            total_bytes: sessions.iter().map(|s| s.entry.size_bytes).sum(),
            // newest first
            sessions: sessions.iter().rev().take(MAX_ROWS).map(ReportRow::from).collect(),
        }
    }
}

fn format_duration(seconds: i64) -> String {
    let seconds = seconds.max(0);
    match (seconds / 3600, (seconds % 3600) / 60, seconds % 60) {
        (0, 0, s) => format!("{}s", s),
        (0, m, s) => format!("{}m {}s", m, s),
        (h, m, s) => format!("{}h {}m {}s", h, m, s),
    }
}

/// Human-readable byte count.
///
/// # Examples
///
/// ```
/// use packet_forge::report::format_bytes;
///
/// assert_eq!(format_bytes(512), "512 B");
/// assert_eq!(format_bytes(1536), "1.5 KiB");
/// assert_eq!(format_bytes(3 * 1024 * 1024), "3.0 MiB");
/// ```
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["KiB", "MiB", "GiB", "TiB"];
    if bytes < 1024 {
        return format!("{} B", bytes);
    }
    let mut value = bytes as f64 / 1024.0;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{:.1} {}", value, UNITS[unit])
}

fn registry() -> Result<Handlebars<'static>> {
    let mut handlebars = Handlebars::new();

    handlebars.register_helper(
        "format_timestamp",
        Box::new(
            |h: &Helper,
             _: &Handlebars,
             _: &handlebars::Context,
             _: &mut RenderContext,
             out: &mut dyn Output|
             -> HelperResult {
                let timestamp = h.param(0).and_then(|v| v.value().as_i64()).unwrap_or(0);
                let dt = DateTime::<Utc>::from_timestamp(timestamp, 0)
                    .unwrap_or_default()
                    .with_timezone(&Local);
                out.write(&dt.format("%H:%M:%S").to_string())?;
                Ok(())
            },
        ),
    );

    handlebars.register_helper(
        "format_bytes",
        Box::new(
            |h: &Helper,
             _: &Handlebars,
             _: &handlebars::Context,
             _: &mut RenderContext,
             out: &mut dyn Output|
             -> HelperResult {
                let bytes = h.param(0).and_then(|v| v.value().as_u64()).unwrap_or(0);
                out.write(&format_bytes(bytes))?;
                Ok(())
            },
        ),
    );

    handlebars.register_template_string("report", include_str!("templates/report.html"))?;
    Ok(handlebars)
}

/// Renders the report page for `sessions`, oldest first as stored.
pub fn render(sessions: &[SessionRecord], started: DateTime<Utc>) -> Result<String> {
    let data = ReportData::new(sessions, started, Utc::now());
    Ok(registry()?.render("report", &data)?)
}

/// Writes `report.html` into `dir`, creating the directory if needed.
pub fn write_report(dir: &Path, sessions: &[SessionRecord], started: DateTime<Utc>) -> Result<PathBuf> {
    fs::create_dir_all(dir)?;
    let html = render(sessions, started)?;
    let path = dir.join(REPORT_FILE);
    fs::write(&path, html)?;
    info!("Updated report at: {}", path.display());
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryStore, SessionEntry, SessionSink};

    fn sessions() -> Vec<SessionRecord> {
        let store = MemoryStore::new();
        store.add(SessionEntry {
            url: "http://example.com/<script>".into(),
            method: "GET".into(),
            status: 200,
            content_type: "text/html".into(),
            size_bytes: 2048,
            matched_rule_id: Some("inject".into()),
            applied: true,
            ..Default::default()
        });
        store.add(SessionEntry {
            url: "udp://dns.example:53".into(),
            method: "UDP".into(),
            content_type: "udp".into(),
            size_bytes: 120,
            source: SessionSource::Flow,
            ..Default::default()
        });
        store.sessions()
    }

    #[test]
    fn test_report_data_counts() {
        let sessions = sessions();
        let started = Utc::now() - chrono::Duration::seconds(75);
        let data = ReportData::new(&sessions, started, Utc::now());
        assert_eq!(data.session_count, 2);
        assert_eq!(data.proxy_count, 1);
        assert_eq!(data.flow_count, 1);
        assert_eq!(data.tunnel_count, 0);
        assert_eq!(data.modified_count, 1);
        assert_eq!(data.total_bytes, 2168);
        assert_eq!(data.duration, "1m 15s");
        // newest first
        assert_eq!(data.sessions[0].method, "UDP");
        assert_eq!(data.sessions[0].status, "");
        assert_eq!(data.sessions[1].status, "200");
    }

    #[test]
    fn test_render_escapes_urls() {
        let html = render(&sessions(), Utc::now()).unwrap();
        assert!(html.contains("http://example.com/&lt;script&gt;"));
        assert!(!html.contains("<script>"));
        assert!(html.contains("inject (applied)"));
        assert!(html.contains("2.0 KiB"));
    }

    #[test]
    fn test_render_empty() {
        let html = render(&[], Utc::now()).unwrap();
        assert!(html.contains("No sessions recorded yet."));
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(5), "5s");
        assert_eq!(format_duration(3725), "1h 2m 5s");
        assert_eq!(format_duration(-3), "0s");
    }

    #[test]
    fn test_write_report() {
        let dir = std::env::temp_dir().join(format!("pf-report-{}", std::process::id()));
        let path = write_report(&dir, &sessions(), Utc::now()).unwrap();
        assert!(path.ends_with(REPORT_FILE));
        assert!(fs::read_to_string(&path).unwrap().contains("Packet Forge Sessions"));
        let _ = fs::remove_dir_all(dir);
    }
}
