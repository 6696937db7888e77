//! State of one waterfall view: the span tree plus everything the user toggled on it.

use std::collections::{BTreeMap, HashSet};

use tracing::debug;

use crate::bounds::{BoundsGenerator, TraceBounds, ViewWindow};
use crate::error::{FetchError, TraceError};
use crate::fetch::EventTraceFetcher;
use crate::filter::{OperationNameFilter, SpanSearch};
use crate::persistent::ViewSettings;
use crate::span_tree::{
    FetchTicket, NodePath, SpanKey, SpanTreeNode, ToggleAction, TraceBoundsListener,
};
use crate::spans_list::{EnhancedProcessedSpan, SiblingGrouping, SpansListParams};
use crate::trace::ParsedTrace;
use crate::types::TraceEvent;

/// Bounds of the loaded trace and of every expanded embedded transaction, keyed by the span the
/// transaction is embedded under.
#[derive(Debug, Clone, PartialEq)]
pub struct TraceBoundsRegistry {
    base: TraceBounds,
    embedded: BTreeMap<SpanKey, TraceBounds>,
}

impl TraceBoundsRegistry {
    pub fn new(base: TraceBounds) -> TraceBoundsRegistry {
        TraceBoundsRegistry {
            base,
            embedded: BTreeMap::new(),
        }
    }

    /// Number of expanded nodes contributing bounds.
    pub fn num_embedded(&self) -> usize {
        self.embedded.len()
    }

    pub fn trace_bounds(&self) -> TraceBounds {
        self.embedded
            .values()
            .fold(self.base, |bounds, embedded| bounds.union(embedded))
    }
}

impl TraceBoundsListener for TraceBoundsRegistry {
    fn add_trace_bounds(&mut self, key: &SpanKey, bounds: TraceBounds) {
        self.embedded.insert(key.clone(), bounds);
    }

    fn remove_trace_bounds(&mut self, key: &SpanKey) {
        self.embedded.remove(key);
    }
}

#[derive(Debug, Clone)]
pub struct WaterfallModel {
    pub root: SpanTreeNode,
    bounds_registry: TraceBoundsRegistry,
    view_window: ViewWindow,
    operation_name_filter: OperationNameFilter,
    search: Option<SpanSearch>,
    hidden_span_sub_trees: HashSet<String>,
    settings: ViewSettings,
}

impl WaterfallModel {
    pub fn from_event(event: &TraceEvent, settings: ViewSettings) -> Result<Self, TraceError> {
        let parsed_trace = ParsedTrace::from_event(event)?;
        Ok(Self::from_parsed_trace(&parsed_trace, settings))
    }

    pub fn from_parsed_trace(parsed_trace: &ParsedTrace, settings: ViewSettings) -> Self {
        WaterfallModel {
            root: SpanTreeNode::build(parsed_trace),
            bounds_registry: TraceBoundsRegistry::new(parsed_trace.trace_bounds),
            view_window: ViewWindow::default(),
            operation_name_filter: OperationNameFilter::NoFilter,
            search: None,
            hidden_span_sub_trees: HashSet::new(),
            settings,
        }
    }

    /// Time range of the trace including expanded embedded transactions.
    pub fn trace_bounds(&self) -> TraceBounds {
        self.bounds_registry.trace_bounds()
    }

    pub fn bounds_registry(&self) -> &TraceBoundsRegistry {
        &self.bounds_registry
    }

    pub fn bounds_generator(&self) -> BoundsGenerator {
        BoundsGenerator::new(self.trace_bounds(), self.view_window)
    }

    pub fn spans_list(&self) -> Vec<EnhancedProcessedSpan> {
        let generate_bounds = self.bounds_generator();
        let params = SpansListParams {
            operation_name_filter: &self.operation_name_filter,
            search: self.search.as_ref(),
            generate_bounds: &generate_bounds,
            hidden_span_sub_trees: &self.hidden_span_sub_trees,
            grouping: SiblingGrouping {
                min_group_size: self.settings.min_sibling_group_size,
            },
            gap_threshold: self.settings.gap_threshold,
        };
        self.root.get_spans_list(&params)
    }

    pub fn view_window(&self) -> ViewWindow {
        self.view_window
    }

    pub fn set_view_window(&mut self, view_window: ViewWindow) {
        self.view_window = view_window;
    }

    pub fn operation_name_filter(&self) -> &OperationNameFilter {
        &self.operation_name_filter
    }

    pub fn set_operation_name_filter(&mut self, filter: OperationNameFilter) {
        self.operation_name_filter = filter;
    }

    pub fn toggle_operation_filter(&mut self, operation: &str) {
        self.operation_name_filter.toggle(operation);
    }

    /// Apply a saved filter preset by name. Returns false if there is no such preset.
    pub fn apply_filter_preset(&mut self, name: &str) -> bool {
        let Some(preset) = self
            .settings
            .filter_presets
            .iter()
            .find(|preset| preset.name == name)
        else {
            return false;
        };
        self.operation_name_filter =
            OperationNameFilter::from_operations(preset.operations.iter().cloned());
        true
    }

    /// An empty query clears the search.
    pub fn set_search(&mut self, query: &str) -> Result<(), regex::Error> {
        self.search = if query.trim().is_empty() {
            None
        } else {
            Some(SpanSearch::new(query)?)
        };
        Ok(())
    }

    /// Returns whether the subtree is hidden now.
    pub fn toggle_span_sub_tree(&mut self, span_id: &str) -> bool {
        if self.hidden_span_sub_trees.remove(span_id) {
            false
        } else {
            self.hidden_span_sub_trees.insert(span_id.to_string());
            true
        }
    }

    /// Returns whether the group is expanded now, `None` if the path leads nowhere.
    pub fn toggle_sibling_group(&mut self, parent_path: &NodePath, group_id: &str) -> Option<bool> {
        let node = self.root.find_node_mut(parent_path)?;
        Some(node.toggle_sibling_group(group_id))
    }

    pub fn begin_toggle_embedded_children(&mut self, path: &NodePath) -> Option<ToggleAction> {
        let node = self.root.find_node_mut(path)?;
        Some(node.begin_toggle_embedded_children(&mut self.bounds_registry))
    }

    pub fn complete_embedded_fetch(
        &mut self,
        path: &NodePath,
        ticket: FetchTicket,
        result: Result<Vec<TraceEvent>, FetchError>,
    ) -> bool {
        let Some(node) = self.root.find_node_mut(path) else {
            debug!(?path, "node of the embedded fetch is gone");
            return false;
        };
        node.complete_embedded_fetch(ticket, result, &mut self.bounds_registry)
    }

    pub async fn toggle_embedded_children<F>(
        &mut self,
        path: &NodePath,
        org_slug: &str,
        event_slugs: &[String],
        fetcher: &F,
    ) -> Option<ToggleAction>
    where
        F: EventTraceFetcher + ?Sized,
    {
        let node = self.root.find_node_mut(path)?;
        Some(
            node.toggle_embedded_children(
                org_slug,
                event_slugs,
                fetcher,
                &mut self.bounds_registry,
            )
            .await,
        )
    }
}
