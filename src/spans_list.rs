//! Flattening of the span tree into the rows of the waterfall.
//!
//! The output is a pre-order walk of the tree. Filtered out spans are skipped while their
//! descendants take their place, hidden subtrees stop the walk, and runs of identical adjacent
//! siblings are folded into a single row.

use std::collections::HashSet;
use std::ops::Range;

use serde::Serialize;

use crate::bounds::{BoundsGenerator, SpanBounds};
use crate::filter::{OperationNameFilter, SpanSearch};
use crate::span_tree::{FetchEmbeddedChildrenState, NodePath, SpanTreeNode};
use crate::task_timer::TaskTimer;
use crate::types::{RawSpan, TimePoint};

pub const DEFAULT_MIN_SIBLING_GROUP_SIZE: usize = 5;

/// Depth of an ancestor whose connector line continues past a row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "type", content = "depth", rename_all = "snake_case")]
pub enum TreeDepth {
    Regular(usize),
    /// Orphan spans are connected to the root with a different line.
    Orphan(usize),
}

impl TreeDepth {
    pub fn depth(&self) -> usize {
        match self {
            TreeDepth::Regular(depth) | TreeDepth::Orphan(depth) => *depth,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SpanEntry {
    pub span: RawSpan,
    pub node_path: NodePath,
    pub tree_depth: usize,
    pub is_last_sibling: bool,
    pub continuing_tree_depths: Vec<TreeDepth>,
    pub bounds: SpanBounds,
    pub is_root: bool,
    pub is_orphan: bool,
    pub is_embedded_transaction_root: bool,
    pub num_of_span_children: usize,
    pub show_embedded_children: bool,
    pub fetch_embedded_children_state: FetchEmbeddedChildrenState,
    pub is_sub_tree_hidden: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SiblingGroupEntry {
    pub spans: Vec<RawSpan>,
    /// Span id of the first span of the run, used to expand the group.
    pub group_id: String,
    /// Node whose children were grouped.
    pub parent_path: NodePath,
    pub tree_depth: usize,
    pub is_last_sibling: bool,
    pub continuing_tree_depths: Vec<TreeDepth>,
    pub bounds: SpanBounds,
}

impl SiblingGroupEntry {
    pub fn op(&self) -> &str {
        self.spans.first().map(|span| span.op.as_str()).unwrap_or("")
    }

    pub fn description(&self) -> Option<&str> {
        self.spans.first().and_then(|span| span.description.as_deref())
    }
}

/// Time between siblings that no span accounts for.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GapEntry {
    pub start_timestamp: TimePoint,
    pub end_timestamp: TimePoint,
    pub tree_depth: usize,
    pub continuing_tree_depths: Vec<TreeDepth>,
    pub bounds: SpanBounds,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EnhancedProcessedSpan {
    Span(SpanEntry),
    SpanGroupSiblings(SiblingGroupEntry),
    Gap(GapEntry),
}

impl EnhancedProcessedSpan {
    pub fn tree_depth(&self) -> usize {
        match self {
            EnhancedProcessedSpan::Span(entry) => entry.tree_depth,
            EnhancedProcessedSpan::SpanGroupSiblings(entry) => entry.tree_depth,
            EnhancedProcessedSpan::Gap(entry) => entry.tree_depth,
        }
    }

    pub fn bounds(&self) -> &SpanBounds {
        match self {
            EnhancedProcessedSpan::Span(entry) => &entry.bounds,
            EnhancedProcessedSpan::SpanGroupSiblings(entry) => &entry.bounds,
            EnhancedProcessedSpan::Gap(entry) => &entry.bounds,
        }
    }

    pub fn as_span(&self) -> Option<&SpanEntry> {
        match self {
            EnhancedProcessedSpan::Span(entry) => Some(entry),
            _ => None,
        }
    }

    pub fn as_sibling_group(&self) -> Option<&SiblingGroupEntry> {
        match self {
            EnhancedProcessedSpan::SpanGroupSiblings(entry) => Some(entry),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SiblingGrouping {
    /// Shortest run of identical siblings that is folded into one row.
    pub min_group_size: usize,
}

impl Default for SiblingGrouping {
    fn default() -> Self {
        SiblingGrouping {
            min_group_size: DEFAULT_MIN_SIBLING_GROUP_SIZE,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SpansListParams<'a> {
    pub operation_name_filter: &'a OperationNameFilter,
    pub search: Option<&'a SpanSearch>,
    pub generate_bounds: &'a BoundsGenerator,
    pub hidden_span_sub_trees: &'a HashSet<String>,
    pub grouping: SiblingGrouping,
    /// Report gaps longer than this many seconds. Ignored while a filter or a search is active.
    pub gap_threshold: Option<TimePoint>,
}

impl<'a> SpansListParams<'a> {
    pub fn new(
        generate_bounds: &'a BoundsGenerator,
        operation_name_filter: &'a OperationNameFilter,
        hidden_span_sub_trees: &'a HashSet<String>,
    ) -> SpansListParams<'a> {
        SpansListParams {
            operation_name_filter,
            search: None,
            generate_bounds,
            hidden_span_sub_trees,
            grouping: SiblingGrouping::default(),
            gap_threshold: None,
        }
    }

    fn passes_filters(&self, span: &RawSpan) -> bool {
        self.operation_name_filter.matches(span)
            && self.search.map(|search| search.matches(span)).unwrap_or(true)
    }

    fn gaps_enabled(&self) -> Option<TimePoint> {
        if self.search.is_some() || *self.operation_name_filter != OperationNameFilter::NoFilter {
            return None;
        }
        self.gap_threshold
    }
}

/// Where a node is rendered.
struct Placement {
    tree_depth: usize,
    is_last_sibling: bool,
    continuing_tree_depths: Vec<TreeDepth>,
    path: NodePath,
}

enum SiblingUnit {
    Single(usize),
    Group(Range<usize>),
}

impl SpanTreeNode {
    /// Rows of the waterfall for this subtree, starting at depth 0.
    pub fn get_spans_list(&self, params: &SpansListParams) -> Vec<EnhancedProcessedSpan> {
        let t = TaskTimer::new("Flattening span tree");

        let mut rows = Vec::new();
        let placement = Placement {
            tree_depth: 0,
            is_last_sibling: true,
            continuing_tree_depths: Vec::new(),
            path: NodePath::root(),
        };
        emit_node(self, placement, params, &mut rows);

        t.stop();
        rows
    }
}

fn emit_node(
    node: &SpanTreeNode,
    placement: Placement,
    params: &SpansListParams,
    rows: &mut Vec<EnhancedProcessedSpan>,
) {
    let is_sub_tree_hidden = params.hidden_span_sub_trees.contains(&node.span.span_id);

    if !params.passes_filters(&node.span) {
        if is_sub_tree_hidden {
            return;
        }
        // Descendants are promoted into the place of the filtered out span.
        emit_children(
            node,
            placement.tree_depth,
            &placement.continuing_tree_depths,
            placement.is_last_sibling,
            &placement.path,
            params,
            rows,
        );
        return;
    }

    rows.push(EnhancedProcessedSpan::Span(SpanEntry {
        span: node.span.clone(),
        node_path: placement.path.clone(),
        tree_depth: placement.tree_depth,
        is_last_sibling: placement.is_last_sibling,
        continuing_tree_depths: placement.continuing_tree_depths.clone(),
        bounds: params
            .generate_bounds
            .generate(node.span.start_timestamp, node.span.timestamp),
        is_root: node.is_root,
        is_orphan: node.is_orphan,
        is_embedded_transaction_root: node.is_embedded_transaction_root,
        num_of_span_children: node.num_of_span_children(),
        show_embedded_children: node.show_embedded_children(),
        fetch_embedded_children_state: node.fetch_embedded_children_state(),
        is_sub_tree_hidden,
    }));

    if is_sub_tree_hidden {
        return;
    }

    let mut child_continuing_depths = placement.continuing_tree_depths;
    if !placement.is_last_sibling {
        child_continuing_depths.push(if node.is_orphan {
            TreeDepth::Orphan(placement.tree_depth)
        } else {
            TreeDepth::Regular(placement.tree_depth)
        });
    }

    emit_children(
        node,
        placement.tree_depth + 1,
        &child_continuing_depths,
        true,
        &placement.path,
        params,
        rows,
    );
}

fn emit_children(
    node: &SpanTreeNode,
    tree_depth: usize,
    continuing_tree_depths: &[TreeDepth],
    trailing_is_last: bool,
    node_path: &NodePath,
    params: &SpansListParams,
    rows: &mut Vec<EnhancedProcessedSpan>,
) {
    let descendants: Vec<&SpanTreeNode> = node.descendants().collect();
    let units = sibling_units(node, &descendants, params);
    let gap_threshold = params.gaps_enabled();

    // Units that end up without rows must not keep the connector of an earlier sibling open.
    let last_emitting_unit = units
        .iter()
        .rposition(|unit| unit_emits_rows(unit, &descendants, params));

    let mut covered_until = node.span.start_timestamp;
    for (unit_idx, unit) in units.iter().enumerate() {
        let is_last_sibling = trailing_is_last && Some(unit_idx) == last_emitting_unit;
        let (unit_start, unit_end) = unit_time_range(unit, &descendants);

        if let Some(threshold) = gap_threshold {
            if unit_start - covered_until > threshold {
                rows.push(EnhancedProcessedSpan::Gap(GapEntry {
                    start_timestamp: covered_until,
                    end_timestamp: unit_start,
                    tree_depth,
                    continuing_tree_depths: continuing_tree_depths.to_vec(),
                    bounds: params.generate_bounds.generate(covered_until, unit_start),
                }));
            }
        }
        covered_until = covered_until.max(unit_end);

        match unit {
            SiblingUnit::Single(idx) => emit_node(
                descendants[*idx],
                Placement {
                    tree_depth,
                    is_last_sibling,
                    continuing_tree_depths: continuing_tree_depths.to_vec(),
                    path: node_path.child(*idx),
                },
                params,
                rows,
            ),
            SiblingUnit::Group(range) => {
                let grouped = &descendants[range.clone()];
                rows.push(EnhancedProcessedSpan::SpanGroupSiblings(SiblingGroupEntry {
                    spans: grouped.iter().map(|child| child.span.clone()).collect(),
                    group_id: grouped[0].span.span_id.clone(),
                    parent_path: node_path.clone(),
                    tree_depth,
                    is_last_sibling,
                    continuing_tree_depths: continuing_tree_depths.to_vec(),
                    bounds: params.generate_bounds.generate(unit_start, unit_end),
                }));
            }
        }
    }
}

/// Split the displayed children into single rows and folded runs. Only the node's own children
/// are grouped, embedded transactions always get their own row. A run is folded only when every
/// span in it passes the filters, otherwise its spans are walked one by one so that matching
/// descendants get promoted.
fn sibling_units(
    node: &SpanTreeNode,
    descendants: &[&SpanTreeNode],
    params: &SpansListParams,
) -> Vec<SiblingUnit> {
    let grouping = params.grouping;
    let own_children = node.children.len().min(descendants.len());
    let mut units = Vec::with_capacity(descendants.len());

    let mut run_start = 0;
    while run_start < own_children {
        let key = descendants[run_start].span.grouping_key();
        let mut run_end = run_start + 1;
        while run_end < own_children && descendants[run_end].span.grouping_key() == key {
            run_end += 1;
        }

        let group_id = &descendants[run_start].span.span_id;
        if run_end - run_start >= grouping.min_group_size.max(1)
            && run_end - run_start > 1
            && !node.is_sibling_group_expanded(group_id)
            && descendants[run_start..run_end]
                .iter()
                .all(|child| params.passes_filters(&child.span))
        {
            units.push(SiblingUnit::Group(run_start..run_end));
        } else {
            units.extend((run_start..run_end).map(SiblingUnit::Single));
        }
        run_start = run_end;
    }

    units.extend((own_children..descendants.len()).map(SiblingUnit::Single));
    units
}

fn unit_emits_rows(
    unit: &SiblingUnit,
    descendants: &[&SpanTreeNode],
    params: &SpansListParams,
) -> bool {
    match unit {
        SiblingUnit::Single(idx) => node_emits_rows(descendants[*idx], params),
        // Folded runs only exist when all of their spans pass.
        SiblingUnit::Group(_) => true,
    }
}

/// Whether the node or anything promoted in its place produces a row.
fn node_emits_rows(node: &SpanTreeNode, params: &SpansListParams) -> bool {
    if params.passes_filters(&node.span) {
        return true;
    }
    if params.hidden_span_sub_trees.contains(&node.span.span_id) {
        return false;
    }
    node.descendants()
        .any(|child| node_emits_rows(child, params))
}

fn unit_time_range(unit: &SiblingUnit, descendants: &[&SpanTreeNode]) -> (TimePoint, TimePoint) {
    match unit {
        SiblingUnit::Single(idx) => {
            let span = &descendants[*idx].span;
            (span.start_timestamp, span.timestamp)
        }
        SiblingUnit::Group(range) => descendants[range.clone()].iter().fold(
            (f64::INFINITY, f64::NEG_INFINITY),
            |(start, end), child| {
                (
                    start.min(child.span.start_timestamp),
                    end.max(child.span.timestamp),
                )
            },
        ),
    }
}
