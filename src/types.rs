use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Seconds since the unix epoch, the unit of Sentry span timestamps.
pub type TimePoint = f64;

pub const MILLISECONDS_PER_SECOND: f64 = 1000.0;

pub fn time_point_from_unix_nano(unix_nano: u64) -> TimePoint {
    unix_nano as f64 / 1_000_000_000.0
}

pub fn time_point_to_utc_string(time: TimePoint) -> String {
    let date_time = chrono::DateTime::from_timestamp_nanos((time * 1e9) as i64);
    date_time.format("%Y-%m-%d %H:%M:%S%.3f").to_string()
}

/// One span as reported by instrumentation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawSpan {
    pub span_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_span_id: Option<String>,
    #[serde(default)]
    pub trace_id: String,
    /// Operation name, e.g. `http`, `db`, `pageload`.
    #[serde(default)]
    pub op: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub start_timestamp: TimePoint,
    /// End of the span.
    pub timestamp: TimePoint,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tags: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub data: BTreeMap<String, serde_json::Value>,
}

impl RawSpan {
    /// Span duration in seconds, zero for spans with reversed timestamps.
    pub fn duration(&self) -> TimePoint {
        (self.timestamp - self.start_timestamp).max(0.0)
    }

    pub fn http_status_code(&self) -> Option<&str> {
        self.tags.get("http.status_code").map(String::as_str)
    }

    /// Key used to decide whether adjacent siblings look the same.
    pub fn grouping_key(&self) -> (&str, Option<&str>) {
        (self.op.as_str(), self.description.as_deref())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TraceContext {
    #[serde(default)]
    pub trace_id: String,
    #[serde(default)]
    pub span_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_span_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub op: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventContexts {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace: Option<TraceContext>,
}

/// An entry of an event payload. Only `spans` entries are interpreted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEntry {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

impl EventEntry {
    pub const SPANS: &'static str = "spans";

    pub fn spans(spans: &[RawSpan]) -> serde_json::Result<EventEntry> {
        Ok(EventEntry {
            kind: Self::SPANS.to_string(),
            data: serde_json::to_value(spans)?,
        })
    }
}

/// A transaction event, the unit that is loaded at the top level and fetched for embedded
/// transactions alike.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TraceEvent {
    #[serde(rename = "eventID", default)]
    pub event_id: String,
    #[serde(default)]
    pub title: String,
    #[serde(rename = "projectSlug", default, skip_serializing_if = "Option::is_none")]
    pub project_slug: Option<String>,
    #[serde(rename = "startTimestamp")]
    pub start_timestamp: TimePoint,
    #[serde(rename = "endTimestamp")]
    pub end_timestamp: TimePoint,
    #[serde(default)]
    pub entries: Vec<EventEntry>,
    #[serde(default)]
    pub contexts: EventContexts,
}

impl TraceEvent {
    /// All spans of all `spans` entries, in payload order.
    pub fn spans(&self) -> serde_json::Result<Vec<RawSpan>> {
        let mut spans = Vec::new();
        for entry in &self.entries {
            if entry.kind != EventEntry::SPANS || entry.data.is_null() {
                continue;
            }
            let entry_spans: Vec<RawSpan> = serde_json::from_value(entry.data.clone())?;
            spans.extend(entry_spans);
        }
        Ok(spans)
    }

    pub fn trace_context(&self) -> Option<&TraceContext> {
        self.contexts.trace.as_ref()
    }
}
