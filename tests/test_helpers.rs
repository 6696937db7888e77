use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;

use spantree::bounds::TraceBounds;
use spantree::fetch::EventTraceFetcher;
use spantree::span_tree::{SpanKey, TraceBoundsListener};
use spantree::types::{EventContexts, EventEntry, RawSpan, TimePoint, TraceContext, TraceEvent};
use spantree::FetchError;

pub const TRACE_ID: &str = "trace-1";

/// Helper to create a span with minimal required fields
#[allow(dead_code)]
pub fn span(
    span_id: &str,
    parent_span_id: Option<&str>,
    op: &str,
    description: Option<&str>,
    start_timestamp: TimePoint,
    timestamp: TimePoint,
) -> RawSpan {
    RawSpan {
        span_id: span_id.to_string(),
        parent_span_id: parent_span_id.map(str::to_string),
        trace_id: TRACE_ID.to_string(),
        op: op.to_string(),
        description: description.map(str::to_string),
        start_timestamp,
        timestamp,
        status: None,
        tags: BTreeMap::new(),
        data: BTreeMap::new(),
    }
}

/// Helper to create a transaction event whose root span is `root_span_id`
#[allow(dead_code)]
pub fn event(
    event_id: &str,
    root_span_id: &str,
    op: &str,
    start_timestamp: TimePoint,
    end_timestamp: TimePoint,
    spans: &[RawSpan],
) -> TraceEvent {
    TraceEvent {
        event_id: event_id.to_string(),
        title: format!("{op} {event_id}"),
        project_slug: Some("project".to_string()),
        start_timestamp,
        end_timestamp,
        entries: vec![EventEntry::spans(spans).unwrap()],
        contexts: EventContexts {
            trace: Some(TraceContext {
                trace_id: TRACE_ID.to_string(),
                span_id: Some(root_span_id.to_string()),
                parent_span_id: None,
                op: Some(op.to_string()),
                status: Some("ok".to_string()),
                description: None,
            }),
        },
    }
}

/// Same as [event], for a transaction embedded under `parent_span_id`
#[allow(dead_code)]
pub fn embedded_event(
    event_id: &str,
    root_span_id: &str,
    parent_span_id: &str,
    start_timestamp: TimePoint,
    end_timestamp: TimePoint,
    spans: &[RawSpan],
) -> TraceEvent {
    let mut event = event(
        event_id,
        root_span_id,
        "http.server",
        start_timestamp,
        end_timestamp,
        spans,
    );
    if let Some(context) = event.contexts.trace.as_mut() {
        context.parent_span_id = Some(parent_span_id.to_string());
    }
    event
}

/// pageload root `a` with children `b` (http) and `c` (http), and `d` (resource.link) under `b`
#[allow(dead_code)]
pub fn pageload_event() -> TraceEvent {
    event(
        "event-a",
        "a",
        "pageload",
        0.0,
        10.0,
        &[
            span("b", Some("a"), "http", Some("GET /api"), 1.0, 4.0),
            span("c", Some("a"), "http", Some("GET /users"), 5.0, 9.0),
            span("d", Some("b"), "resource.link", Some("style.css"), 2.0, 3.0),
        ],
    )
}

/// Root `root` with `count` identical db children, 1s each, starting at 1.0
#[allow(dead_code)]
pub fn repeated_children(op: &str, description: &str, count: usize) -> Vec<RawSpan> {
    (0..count)
        .map(|i| {
            let start = 1.0 + i as f64;
            span(
                &format!("{op}-{i}"),
                Some("root"),
                op,
                Some(description),
                start,
                start + 1.0,
            )
        })
        .collect()
}

/// Serves events from memory. Unknown slugs fail with status 500.
#[allow(dead_code)]
#[derive(Default)]
pub struct MockFetcher {
    pub events: HashMap<String, TraceEvent>,
}

#[allow(dead_code)]
impl MockFetcher {
    pub fn with_events(events: &[TraceEvent]) -> MockFetcher {
        MockFetcher {
            events: events
                .iter()
                .map(|event| (event.event_id.clone(), event.clone()))
                .collect(),
        }
    }
}

#[async_trait]
impl EventTraceFetcher for MockFetcher {
    async fn fetch_event_trace(
        &self,
        _org_slug: &str,
        event_slug: &str,
    ) -> Result<TraceEvent, FetchError> {
        self.events
            .get(event_slug)
            .cloned()
            .ok_or(FetchError::Status(500))
    }
}

/// Records every bounds change it is told about.
#[allow(dead_code)]
#[derive(Debug, Default)]
pub struct RecordingListener {
    pub added: Vec<(SpanKey, TraceBounds)>,
    pub removed: Vec<SpanKey>,
}

#[allow(dead_code)]
impl RecordingListener {
    pub fn removed_span_ids(&self) -> Vec<&str> {
        self.removed.iter().map(|key| key.span_id.as_str()).collect()
    }
}

impl TraceBoundsListener for RecordingListener {
    fn add_trace_bounds(&mut self, key: &SpanKey, bounds: TraceBounds) {
        self.added.push((key.clone(), bounds));
    }

    fn remove_trace_bounds(&mut self, key: &SpanKey) {
        self.removed.push(key.clone());
    }
}

/// Move an event and all of its spans into another trace
#[allow(dead_code)]
pub fn in_trace(mut event: TraceEvent, trace_id: &str) -> TraceEvent {
    let mut spans = event.spans().unwrap();
    for span in &mut spans {
        span.trace_id = trace_id.to_string();
    }
    event.entries = vec![EventEntry::spans(&spans).unwrap()];
    if let Some(context) = event.contexts.trace.as_mut() {
        context.trace_id = trace_id.to_string();
    }
    event
}
