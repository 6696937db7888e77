//! Conversion of OpenTelemetry trace exports into transaction events.

use std::collections::BTreeMap;

use anyhow::Result;
use opentelemetry_proto::tonic::collector::trace::v1::ExportTraceServiceRequest;
use opentelemetry_proto::tonic::common::v1::any_value::Value;
use opentelemetry_proto::tonic::common::v1::KeyValue;
use opentelemetry_proto::tonic::trace::v1::status::StatusCode;
use tracing::debug;

use crate::task_timer::TaskTimer;
use crate::types::{
    time_point_from_unix_nano, EventContexts, EventEntry, RawSpan, TraceContext, TraceEvent,
};

/// One event per trace id. The root of a trace is its earliest span without a parent in the
/// export; the remaining spans go into the `spans` entry.
pub fn events_from_otlp(requests: &[ExportTraceServiceRequest]) -> Result<Vec<TraceEvent>> {
    let t = TaskTimer::new("Converting OTLP spans");

    let mut spans_by_trace: BTreeMap<String, Vec<RawSpan>> = BTreeMap::new();
    for request in requests {
        for rs in &request.resource_spans {
            let service_name = rs
                .resource
                .as_ref()
                .and_then(|resource| {
                    resource
                        .attributes
                        .iter()
                        .find(|attribute| attribute.key == "service.name")
                })
                .and_then(attribute_value)
                .map(|value| value_to_text(&value))
                .unwrap_or_else(|| "unknown".to_string());

            for ss in &rs.scope_spans {
                for span in &ss.spans {
                    let raw_span = convert_span(span, &service_name);
                    spans_by_trace
                        .entry(raw_span.trace_id.clone())
                        .or_default()
                        .push(raw_span);
                }
            }
        }
    }

    let mut events = Vec::with_capacity(spans_by_trace.len());
    for (trace_id, spans) in spans_by_trace {
        if let Some(event) = event_from_trace(&trace_id, spans)? {
            events.push(event);
        }
    }

    debug!(traces = events.len(), "converted OTLP export");
    t.stop();
    Ok(events)
}

fn event_from_trace(trace_id: &str, mut spans: Vec<RawSpan>) -> Result<Option<TraceEvent>> {
    let root_idx = spans
        .iter()
        .enumerate()
        .filter(|(_, span)| {
            span.parent_span_id
                .as_ref()
                .map(|parent| !spans.iter().any(|other| other.span_id == *parent))
                .unwrap_or(true)
        })
        .min_by(|(_, a), (_, b)| {
            a.start_timestamp
                .partial_cmp(&b.start_timestamp)
                .unwrap_or(std::cmp::Ordering::Equal)
        })
        .map(|(idx, _)| idx);
    let Some(root_idx) = root_idx else {
        return Ok(None);
    };
    let root = spans.remove(root_idx);

    Ok(Some(TraceEvent {
        event_id: root.span_id.clone(),
        title: root
            .description
            .clone()
            .unwrap_or_else(|| root.op.clone()),
        project_slug: root.tags.get("service.name").cloned(),
        start_timestamp: root.start_timestamp,
        end_timestamp: root.timestamp,
        entries: vec![EventEntry::spans(&spans)?],
        contexts: EventContexts {
            trace: Some(TraceContext {
                trace_id: trace_id.to_string(),
                span_id: Some(root.span_id),
                parent_span_id: root.parent_span_id,
                op: Some(root.op),
                status: root.status,
                description: root.description,
            }),
        },
    }))
}

fn convert_span(
    span: &opentelemetry_proto::tonic::trace::v1::Span,
    service_name: &str,
) -> RawSpan {
    let mut attributes = BTreeMap::new();
    for attribute in &span.attributes {
        if let Some(value) = attribute_value(attribute) {
            attributes.insert(attribute.key.clone(), value);
        }
    }

    let op = attributes
        .get("sentry.op")
        .map(value_to_text)
        .or_else(|| infer_op(&attributes))
        .unwrap_or_else(|| span.name.clone());
    let description = (op != span.name).then(|| span.name.clone());

    let mut tags = BTreeMap::new();
    tags.insert("service.name".to_string(), service_name.to_string());
    if let Some(status_code) = attributes
        .get("http.response.status_code")
        .or_else(|| attributes.get("http.status_code"))
    {
        tags.insert("http.status_code".to_string(), value_to_text(status_code));
    }

    let status = span
        .status
        .as_ref()
        .and_then(|status| match StatusCode::try_from(status.code) {
            Ok(StatusCode::Ok) => Some("ok".to_string()),
            Ok(StatusCode::Error) => Some("internal_error".to_string()),
            _ => None,
        });

    RawSpan {
        span_id: hex::encode(&span.span_id),
        parent_span_id: (!span.parent_span_id.is_empty())
            .then(|| hex::encode(&span.parent_span_id)),
        trace_id: hex::encode(&span.trace_id),
        op,
        description,
        start_timestamp: time_point_from_unix_nano(span.start_time_unix_nano),
        timestamp: time_point_from_unix_nano(span.end_time_unix_nano),
        status,
        tags,
        data: attributes
            .iter()
            .map(|(key, value)| (key.clone(), value_to_json(value)))
            .collect(),
    }
}

fn infer_op(attributes: &BTreeMap<String, Value>) -> Option<String> {
    let op = if attributes.contains_key("http.request.method")
        || attributes.contains_key("http.method")
    {
        "http"
    } else if attributes.contains_key("db.system") {
        "db"
    } else if attributes.contains_key("rpc.system") {
        "rpc"
    } else if attributes.contains_key("messaging.system") {
        "queue"
    } else {
        return None;
    };
    Some(op.to_string())
}

fn attribute_value(attribute: &KeyValue) -> Option<Value> {
    attribute.value.clone().and_then(|v| v.value)
}

pub fn value_to_text(value: &Value) -> String {
    match value {
        Value::StringValue(s) => s.clone(),
        Value::BoolValue(b) => b.to_string(),
        Value::IntValue(i) => i.to_string(),
        Value::DoubleValue(d) => d.to_string(),
        Value::ArrayValue(a) => format!(
            "[{}]",
            a.values
                .iter()
                .map(|v| v.value.as_ref().map(value_to_text).unwrap_or_default())
                .collect::<Vec<_>>()
                .join(", ")
        ),
        Value::KvlistValue(kv) => format!(
            "{{{}}}",
            kv.values
                .iter()
                .map(|v| format!(
                    "{}: {}",
                    v.key,
                    v.value
                        .as_ref()
                        .and_then(|value| value.value.as_ref())
                        .map(value_to_text)
                        .unwrap_or_default()
                ))
                .collect::<Vec<_>>()
                .join(", ")
        ),
        Value::BytesValue(b) => hex::encode(b),
    }
}

fn value_to_json(value: &Value) -> serde_json::Value {
    match value {
        Value::StringValue(s) => serde_json::Value::from(s.as_str()),
        Value::BoolValue(b) => serde_json::Value::from(*b),
        Value::IntValue(i) => serde_json::Value::from(*i),
        Value::DoubleValue(d) => serde_json::Value::from(*d),
        Value::ArrayValue(a) => serde_json::Value::Array(
            a.values
                .iter()
                .map(|v| {
                    v.value
                        .as_ref()
                        .map(value_to_json)
                        .unwrap_or(serde_json::Value::Null)
                })
                .collect(),
        ),
        Value::KvlistValue(_) | Value::BytesValue(_) => {
            serde_json::Value::from(value_to_text(value))
        }
    }
}
