//! The span tree: nesting of spans by parent id, operation statistics and in-place expansion of
//! embedded transactions.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::bounds::TraceBounds;
use crate::error::FetchError;
use crate::fetch::EventTraceFetcher;
use crate::task_timer::TaskTimer;
use crate::trace::ParsedTrace;
use crate::types::{RawSpan, TraceEvent};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchEmbeddedChildrenState {
    #[default]
    Idle,
    LoadingEmbeddedTransactions,
    ErrorFetchingEmbeddedTransactions,
}

/// Fetch generations are unique across all nodes, so a ticket can never match a node that
/// replaced the one it was issued for.
static NEXT_FETCH_GENERATION: AtomicU64 = AtomicU64::new(1);

fn next_fetch_generation() -> u64 {
    NEXT_FETCH_GENERATION.fetch_add(1, Ordering::Relaxed)
}

/// Identifies a span across the traces shown in one waterfall. Span ids are only unique within a
/// trace, and embedded transactions may come from other traces.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SpanKey {
    pub trace_id: String,
    pub span_id: String,
}

impl SpanKey {
    pub fn of(span: &RawSpan) -> SpanKey {
        SpanKey {
            trace_id: span.trace_id.clone(),
            span_id: span.span_id.clone(),
        }
    }
}

/// Receives changes of the trace time range caused by embedded transactions being opened and
/// closed. `key` is the span the transactions are embedded under.
pub trait TraceBoundsListener {
    fn add_trace_bounds(&mut self, key: &SpanKey, bounds: TraceBounds);
    fn remove_trace_bounds(&mut self, key: &SpanKey);
}

/// Identifies one in-flight fetch of embedded transactions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchTicket {
    generation: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToggleAction {
    /// Embedded transactions were hidden.
    Collapsed,
    /// The caller has to fetch the embedded transactions and hand them to
    /// [SpanTreeNode::complete_embedded_fetch] together with this ticket.
    Fetch(FetchTicket),
    /// A fetch is already in flight, nothing was done.
    AlreadyLoading,
}

/// Position of a node below some root: at each level, an index into the visible descendants
/// (own children first, then embedded transactions when they are shown).
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodePath(pub Vec<usize>);

impl NodePath {
    pub fn root() -> NodePath {
        NodePath(Vec::new())
    }

    pub fn child(&self, index: usize) -> NodePath {
        let mut path = self.0.clone();
        path.push(index);
        NodePath(path)
    }
}

#[derive(Debug, Clone)]
pub struct SpanTreeNode {
    pub span: RawSpan,
    pub children: Vec<SpanTreeNode>,
    pub embedded_children: Vec<SpanTreeNode>,
    pub is_root: bool,
    pub is_orphan: bool,
    pub is_embedded_transaction_root: bool,

    operation_name_counts: BTreeMap<String, usize>,
    fetch_embedded_children_state: FetchEmbeddedChildrenState,
    show_embedded_children: bool,
    fetch_generation: u64,
    expanded_sibling_groups: BTreeSet<String>,
}

impl SpanTreeNode {
    /// Build the whole tree of a parsed trace, rooted at its root span.
    pub fn build(parsed_trace: &ParsedTrace) -> SpanTreeNode {
        let t = TaskTimer::new("Building span tree");

        let mut pool = parsed_trace.spans.clone();
        let mut ancestors = HashSet::new();
        let mut root = SpanTreeNode::new(
            parsed_trace.root_span.clone(),
            &mut pool,
            &mut ancestors,
            parsed_trace,
        );
        root.is_root = true;

        // Parent cycles were broken while parsing. Whatever is left was rejected by the ancestor
        // check, which takes duplicate span ids. Those spans keep their parent id and hang off
        // the root as orphans.
        let mut adopted_any = false;
        while !pool.is_empty() {
            let span = pool.remove(0);
            warn!(
                span_id = %span.span_id,
                parent_span_id = ?span.parent_span_id,
                "span is not reachable from the root, attaching it to the root"
            );
            ancestors.insert(root.span.span_id.clone());
            let mut orphan = SpanTreeNode::new(span, &mut pool, &mut ancestors, parsed_trace);
            ancestors.clear();
            orphan.is_orphan = true;
            root.children.push(orphan);
            adopted_any = true;
        }
        if adopted_any {
            sort_by_start(&mut root.children);
            root.operation_name_counts = aggregate_operation_counts(&root.span, &root.children);
        }

        t.stop();
        root
    }

    /// Build a node and, recursively, its subtree. Children are taken out of `pool`, so that each
    /// span ends up in the tree at most once.
    pub fn new(
        span: RawSpan,
        pool: &mut Vec<RawSpan>,
        ancestors: &mut HashSet<String>,
        parsed_trace: &ParsedTrace,
    ) -> SpanTreeNode {
        let inserted = ancestors.insert(span.span_id.clone());

        let mut direct_children = Vec::new();
        let mut remaining = Vec::with_capacity(pool.len());
        let mut rejected = 0;
        for candidate in pool.drain(..) {
            if candidate.parent_span_id.as_deref() != Some(span.span_id.as_str()) {
                remaining.push(candidate);
            } else if ancestors.contains(&candidate.span_id) {
                rejected += 1;
                remaining.push(candidate);
            } else {
                direct_children.push(candidate);
            }
        }
        *pool = remaining;

        if rejected > 0 {
            warn!(
                span_id = %span.span_id,
                rejected,
                "rejected child spans that would form a cycle"
            );
        }

        // Stable, ties keep the payload order.
        direct_children.sort_by(|a, b| {
            a.start_timestamp
                .partial_cmp(&b.start_timestamp)
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        let children: Vec<SpanTreeNode> = direct_children
            .into_iter()
            .map(|child| SpanTreeNode::new(child, pool, ancestors, parsed_trace))
            .collect();

        if inserted {
            ancestors.remove(&span.span_id);
        }

        let is_orphan = parsed_trace.is_orphan(&span.span_id);
        let operation_name_counts = aggregate_operation_counts(&span, &children);

        SpanTreeNode {
            span,
            children,
            embedded_children: Vec::new(),
            is_root: false,
            is_orphan,
            is_embedded_transaction_root: false,
            operation_name_counts,
            fetch_embedded_children_state: FetchEmbeddedChildrenState::Idle,
            show_embedded_children: false,
            fetch_generation: 0,
            expanded_sibling_groups: BTreeSet::new(),
        }
    }

    /// Occurrences of each operation name in this subtree, this span included.
    pub fn operation_name_counts(&self) -> &BTreeMap<String, usize> {
        &self.operation_name_counts
    }

    pub fn fetch_embedded_children_state(&self) -> FetchEmbeddedChildrenState {
        self.fetch_embedded_children_state
    }

    pub fn show_embedded_children(&self) -> bool {
        self.show_embedded_children
    }

    pub fn num_of_span_children(&self) -> usize {
        self.descendants().count()
    }

    /// Children as they are displayed: own children followed by embedded transactions.
    pub fn descendants(&self) -> impl Iterator<Item = &SpanTreeNode> {
        let embedded: &[SpanTreeNode] = if self.show_embedded_children {
            &self.embedded_children
        } else {
            &[]
        };
        self.children.iter().chain(embedded.iter())
    }

    fn descendant_mut(&mut self, index: usize) -> Option<&mut SpanTreeNode> {
        if index < self.children.len() {
            return self.children.get_mut(index);
        }
        if !self.show_embedded_children {
            return None;
        }
        self.embedded_children.get_mut(index - self.children.len())
    }

    pub fn find_node(&self, path: &NodePath) -> Option<&SpanTreeNode> {
        let mut node = self;
        for &index in &path.0 {
            node = node.descendants().nth(index)?;
        }
        Some(node)
    }

    pub fn find_node_mut(&mut self, path: &NodePath) -> Option<&mut SpanTreeNode> {
        let mut node = self;
        for &index in &path.0 {
            node = node.descendant_mut(index)?;
        }
        Some(node)
    }

    pub fn is_sibling_group_expanded(&self, group_id: &str) -> bool {
        self.expanded_sibling_groups.contains(group_id)
    }

    /// Expand or collapse a run of grouped children. `group_id` is the span id of the first span
    /// in the run. Returns whether the group is expanded now.
    pub fn toggle_sibling_group(&mut self, group_id: &str) -> bool {
        if self.expanded_sibling_groups.remove(group_id) {
            false
        } else {
            self.expanded_sibling_groups.insert(group_id.to_string());
            true
        }
    }

    /// First half of toggling embedded transactions. Collapsing happens right away, expanding
    /// hands out a ticket for the fetch.
    pub fn begin_toggle_embedded_children(
        &mut self,
        listener: &mut dyn TraceBoundsListener,
    ) -> ToggleAction {
        if self.fetch_embedded_children_state
            == FetchEmbeddedChildrenState::LoadingEmbeddedTransactions
        {
            return ToggleAction::AlreadyLoading;
        }

        if self.show_embedded_children {
            debug!(span_id = %self.span.span_id, "collapsing embedded transactions");
            for embedded_root in &self.embedded_children {
                embedded_root.release_trace_bounds(listener);
            }
            self.show_embedded_children = false;
            self.embedded_children.clear();
            self.fetch_embedded_children_state = FetchEmbeddedChildrenState::Idle;
            self.fetch_generation = next_fetch_generation();
            listener.remove_trace_bounds(&SpanKey::of(&self.span));
            return ToggleAction::Collapsed;
        }

        self.fetch_generation = next_fetch_generation();
        self.fetch_embedded_children_state =
            FetchEmbeddedChildrenState::LoadingEmbeddedTransactions;
        debug!(
            span_id = %self.span.span_id,
            generation = self.fetch_generation,
            "loading embedded transactions"
        );
        ToggleAction::Fetch(FetchTicket {
            generation: self.fetch_generation,
        })
    }

    /// Abandon the in-flight fetch, its result will be discarded when it arrives.
    pub fn cancel_embedded_fetch(&mut self) {
        if self.fetch_embedded_children_state
            == FetchEmbeddedChildrenState::LoadingEmbeddedTransactions
        {
            self.fetch_embedded_children_state = FetchEmbeddedChildrenState::Idle;
            self.fetch_generation = next_fetch_generation();
        }
    }

    /// Drop the bounds of every expanded node in this subtree, this node included.
    fn release_trace_bounds(&self, listener: &mut dyn TraceBoundsListener) {
        if self.show_embedded_children {
            listener.remove_trace_bounds(&SpanKey::of(&self.span));
        }
        for child in self.descendants() {
            child.release_trace_bounds(listener);
        }
    }

    /// Second half of expanding embedded transactions. Returns false when the result was
    /// discarded because the node moved on since the ticket was issued.
    pub fn complete_embedded_fetch(
        &mut self,
        ticket: FetchTicket,
        result: Result<Vec<TraceEvent>, FetchError>,
        listener: &mut dyn TraceBoundsListener,
    ) -> bool {
        if self.fetch_embedded_children_state
            != FetchEmbeddedChildrenState::LoadingEmbeddedTransactions
            || ticket.generation != self.fetch_generation
        {
            debug!(
                span_id = %self.span.span_id,
                ticket = ticket.generation,
                current = self.fetch_generation,
                "discarding stale embedded transactions"
            );
            return false;
        }

        match result.and_then(|events| build_embedded_roots(&events)) {
            Ok((roots, bounds)) => {
                debug!(
                    span_id = %self.span.span_id,
                    transactions = roots.len(),
                    "embedded transactions loaded"
                );
                self.embedded_children = roots;
                self.show_embedded_children = true;
                self.fetch_embedded_children_state = FetchEmbeddedChildrenState::Idle;
                if let Some(bounds) = bounds {
                    listener.add_trace_bounds(&SpanKey::of(&self.span), bounds);
                }
            }
            Err(err) => {
                warn!(
                    span_id = %self.span.span_id,
                    error = %err,
                    "failed to fetch embedded transactions"
                );
                self.fetch_embedded_children_state =
                    FetchEmbeddedChildrenState::ErrorFetchingEmbeddedTransactions;
            }
        }
        true
    }

    /// Toggle embedded transactions, fetching them one event after another when expanding.
    pub async fn toggle_embedded_children<F>(
        &mut self,
        org_slug: &str,
        event_slugs: &[String],
        fetcher: &F,
        listener: &mut dyn TraceBoundsListener,
    ) -> ToggleAction
    where
        F: EventTraceFetcher + ?Sized,
    {
        let action = self.begin_toggle_embedded_children(listener);
        let ToggleAction::Fetch(ticket) = action else {
            return action;
        };

        let mut events = Vec::with_capacity(event_slugs.len());
        let mut result = Ok(());
        for event_slug in event_slugs {
            match fetcher.fetch_event_trace(org_slug, event_slug).await {
                Ok(event) => events.push(event),
                Err(err) => {
                    result = Err(err);
                    break;
                }
            }
        }

        self.complete_embedded_fetch(ticket, result.map(|_| events), listener);
        action
    }
}

fn build_embedded_roots(
    events: &[TraceEvent],
) -> Result<(Vec<SpanTreeNode>, Option<TraceBounds>), FetchError> {
    let mut roots = Vec::with_capacity(events.len());
    let mut bounds: Option<TraceBounds> = None;
    for event in events {
        let parsed_trace = ParsedTrace::from_event(event)?;
        let mut root = SpanTreeNode::build(&parsed_trace);
        root.is_root = false;
        root.is_embedded_transaction_root = true;
        bounds = Some(match bounds {
            Some(b) => b.union(&parsed_trace.trace_bounds),
            None => parsed_trace.trace_bounds,
        });
        roots.push(root);
    }
    Ok((roots, bounds))
}

fn aggregate_operation_counts(
    span: &RawSpan,
    children: &[SpanTreeNode],
) -> BTreeMap<String, usize> {
    let mut counts = BTreeMap::new();
    counts.insert(span.op.clone(), 1);
    for child in children {
        for (op, count) in &child.operation_name_counts {
            *counts.entry(op.clone()).or_insert(0) += count;
        }
    }
    counts
}

fn sort_by_start(nodes: &mut [SpanTreeNode]) {
    nodes.sort_by(|a, b| {
        a.span
            .start_timestamp
            .partial_cmp(&b.span.start_timestamp)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
}
