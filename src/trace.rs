//! Turns a transaction event payload into the root span and the flat list of its spans.

use std::collections::{BTreeMap, HashMap, HashSet};

use tracing::debug;

use crate::bounds::TraceBounds;
use crate::error::TraceError;
use crate::types::{RawSpan, TraceEvent};

#[derive(Debug, Clone, PartialEq)]
pub struct ParsedTrace {
    pub event_id: String,
    pub root_span: RawSpan,
    /// Every non-root span, in payload order. Orphans already point at the root.
    pub spans: Vec<RawSpan>,
    pub trace_bounds: TraceBounds,
    /// Re-parented span id -> the parent id it originally referenced (if any).
    pub orphan_parents: BTreeMap<String, Option<String>>,
}

impl ParsedTrace {
    pub fn from_event(event: &TraceEvent) -> Result<ParsedTrace, TraceError> {
        let trace_context = event
            .trace_context()
            .ok_or_else(|| TraceError::MissingTraceContext(event.event_id.clone()))?;
        let root_span_id = trace_context
            .span_id
            .clone()
            .ok_or_else(|| TraceError::MissingRootSpanId(event.event_id.clone()))?;

        let root_span = RawSpan {
            span_id: root_span_id.clone(),
            parent_span_id: trace_context.parent_span_id.clone(),
            trace_id: trace_context.trace_id.clone(),
            op: trace_context
                .op
                .clone()
                .unwrap_or_else(|| "default".to_string()),
            description: trace_context
                .description
                .clone()
                .or_else(|| (!event.title.is_empty()).then(|| event.title.clone())),
            start_timestamp: event.start_timestamp,
            timestamp: event.end_timestamp,
            status: trace_context.status.clone(),
            tags: BTreeMap::new(),
            data: BTreeMap::new(),
        };

        let mut spans = event.spans()?;
        spans.retain(|span| span.span_id != root_span_id);
        for span in &mut spans {
            if span.trace_id.is_empty() {
                span.trace_id = trace_context.trace_id.clone();
            }
        }

        let mut trace_bounds = TraceBounds::new(root_span.start_timestamp, root_span.timestamp);
        for span in &spans {
            trace_bounds = trace_bounds.union(&TraceBounds::new(
                span.start_timestamp,
                span.timestamp.max(span.start_timestamp),
            ));
        }

        let known_span_ids: HashSet<String> = spans
            .iter()
            .map(|span| span.span_id.clone())
            .chain(std::iter::once(root_span_id.clone()))
            .collect();

        let mut orphan_parents = BTreeMap::new();
        for span in &mut spans {
            let has_valid_parent = span
                .parent_span_id
                .as_ref()
                .map(|parent| known_span_ids.contains(parent) && *parent != span.span_id)
                .unwrap_or(false);
            if has_valid_parent {
                continue;
            }

            let original_parent = span.parent_span_id.replace(root_span_id.clone());
            orphan_parents.insert(span.span_id.clone(), original_parent);
        }
        adopt_unreachable_spans(&root_span_id, &mut spans, &mut orphan_parents);

        debug!(
            event_id = %event.event_id,
            spans = spans.len(),
            orphans = orphan_parents.len(),
            "parsed trace"
        );

        Ok(ParsedTrace {
            event_id: event.event_id.clone(),
            root_span,
            spans,
            trace_bounds,
            orphan_parents,
        })
    }

    pub fn is_orphan(&self, span_id: &str) -> bool {
        self.orphan_parents.contains_key(span_id)
    }
}

/// Spans whose parents form a cycle are not reachable from the root. The first span of each cycle,
/// in payload order, is re-parented to the root, the rest of the cycle hangs below it.
fn adopt_unreachable_spans(
    root_span_id: &str,
    spans: &mut [RawSpan],
    orphan_parents: &mut BTreeMap<String, Option<String>>,
) {
    let mut children_of: HashMap<String, Vec<usize>> = HashMap::new();
    for (idx, span) in spans.iter().enumerate() {
        if let Some(parent_span_id) = &span.parent_span_id {
            children_of
                .entry(parent_span_id.clone())
                .or_default()
                .push(idx);
        }
    }

    let mut reachable = vec![false; spans.len()];
    mark_reachable(root_span_id, &children_of, spans, &mut reachable);

    for idx in 0..spans.len() {
        if reachable[idx] {
            continue;
        }
        debug!(span_id = %spans[idx].span_id, "breaking parent cycle");
        let original_parent = spans[idx].parent_span_id.replace(root_span_id.to_string());
        orphan_parents.insert(spans[idx].span_id.clone(), original_parent);
        reachable[idx] = true;
        let span_id = spans[idx].span_id.clone();
        mark_reachable(&span_id, &children_of, spans, &mut reachable);
    }
}

fn mark_reachable(
    from_span_id: &str,
    children_of: &HashMap<String, Vec<usize>>,
    spans: &[RawSpan],
    reachable: &mut [bool],
) {
    let mut stack = vec![from_span_id.to_string()];
    while let Some(span_id) = stack.pop() {
        let Some(children) = children_of.get(&span_id) else {
            continue;
        };
        for &child in children {
            if !reachable[child] {
                reachable[child] = true;
                stack.push(spans[child].span_id.clone());
            }
        }
    }
}
