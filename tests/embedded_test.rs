use std::collections::HashSet;
use std::io::Write;

use approx::assert_abs_diff_eq;
use flate2::write::GzEncoder;
use flate2::Compression;

use spantree::bounds::{BoundsGenerator, TraceBounds, ViewWindow};
use spantree::fetch::{EmbeddedTransactionIndex, EventTraceFetcher, FileEventFetcher};
use spantree::filter::OperationNameFilter;
use spantree::span_tree::{NodePath, SpanTreeNode, ToggleAction};
use spantree::spans_list::{EnhancedProcessedSpan, SpansListParams};
use spantree::types::TraceEvent;
use spantree::{FetchEmbeddedChildrenState, FetchError, ParsedTrace};

mod test_helpers;
use test_helpers::*;

const ORG: &str = "org";

/// Transaction embedded under span `c` of [pageload_event], reaching past its end
fn child_event() -> TraceEvent {
    embedded_event(
        "child-event",
        "e-root",
        "c",
        6.0,
        12.0,
        &[
            span("e1", Some("e-root"), "db", Some("SELECT 1"), 7.0, 8.0),
            // Same id as the root of the outer trace
            span("a", Some("e-root"), "cache", None, 8.0, 9.0),
        ],
    )
}

fn build_pageload() -> SpanTreeNode {
    SpanTreeNode::build(&ParsedTrace::from_event(&pageload_event()).unwrap())
}

fn c_path() -> NodePath {
    NodePath(vec![1])
}

fn flatten(root: &SpanTreeNode) -> Vec<EnhancedProcessedSpan> {
    let generate_bounds =
        BoundsGenerator::new(TraceBounds::new(0.0, 10.0), ViewWindow::default());
    let filter = OperationNameFilter::NoFilter;
    let hidden = HashSet::new();
    root.get_spans_list(&SpansListParams::new(&generate_bounds, &filter, &hidden))
}

fn span_ids(rows: &[EnhancedProcessedSpan]) -> Vec<String> {
    rows.iter()
        .filter_map(|row| row.as_span())
        .map(|entry| entry.span.span_id.clone())
        .collect()
}

fn slugs() -> Vec<String> {
    vec!["child-event".to_string()]
}

#[tokio::test]
async fn test_expand_and_collapse_round_trip() {
    let mut root = build_pageload();
    let fetcher = MockFetcher::with_events(&[child_event()]);
    let mut listener = RecordingListener::default();
    let before = flatten(&root);

    let c = root.find_node_mut(&c_path()).unwrap();
    assert_eq!(c.num_of_span_children(), 0);
    let action = c
        .toggle_embedded_children(ORG, &slugs(), &fetcher, &mut listener)
        .await;
    assert!(matches!(action, ToggleAction::Fetch(_)));
    assert!(c.show_embedded_children());
    assert_eq!(c.fetch_embedded_children_state(), FetchEmbeddedChildrenState::Idle);
    assert_eq!(c.num_of_span_children(), 1);

    assert_eq!(listener.added.len(), 1);
    let (key, bounds) = &listener.added[0];
    assert_eq!(key.span_id, "c");
    assert_eq!(key.trace_id, TRACE_ID);
    assert_abs_diff_eq!(bounds.start, 6.0);
    assert_abs_diff_eq!(bounds.end, 12.0);

    let expanded = flatten(&root);
    assert_eq!(span_ids(&expanded), vec!["a", "b", "d", "c", "e-root", "e1", "a"]);
    let embedded_root = expanded[4].as_span().unwrap();
    assert!(embedded_root.is_embedded_transaction_root);
    assert!(!embedded_root.is_root);
    assert_eq!(embedded_root.tree_depth, 2);
    assert_eq!(embedded_root.node_path, NodePath(vec![1, 0]));
    assert_eq!(expanded[6].tree_depth(), 3);

    let c = root.find_node_mut(&c_path()).unwrap();
    let action = c
        .toggle_embedded_children(ORG, &slugs(), &fetcher, &mut listener)
        .await;
    assert_eq!(action, ToggleAction::Collapsed);
    assert_eq!(listener.removed_span_ids(), vec!["c"]);
    assert_eq!(flatten(&root), before);
}

#[tokio::test]
async fn test_embedded_ops_are_not_counted_in_parent() {
    let mut root = build_pageload();
    let fetcher = MockFetcher::with_events(&[child_event()]);
    let mut listener = RecordingListener::default();
    let counts_before = root.operation_name_counts().clone();

    root.find_node_mut(&c_path())
        .unwrap()
        .toggle_embedded_children(ORG, &slugs(), &fetcher, &mut listener)
        .await;

    assert_eq!(root.operation_name_counts(), &counts_before);
    let embedded_root = root.find_node(&NodePath(vec![1, 0])).unwrap();
    assert_eq!(embedded_root.operation_name_counts().get("db"), Some(&1));
}

#[tokio::test]
async fn test_fetch_failure_keeps_output() {
    let mut root = build_pageload();
    let fetcher = MockFetcher::default();
    let mut listener = RecordingListener::default();
    let before = flatten(&root);

    let c = root.find_node_mut(&c_path()).unwrap();
    c.toggle_embedded_children(ORG, &slugs(), &fetcher, &mut listener)
        .await;
    assert_eq!(
        c.fetch_embedded_children_state(),
        FetchEmbeddedChildrenState::ErrorFetchingEmbeddedTransactions
    );
    assert!(!c.show_embedded_children());
    assert!(listener.added.is_empty());

    // Only the error marker of `c` differs
    let after: Vec<EnhancedProcessedSpan> = flatten(&root)
        .into_iter()
        .map(|row| match row {
            EnhancedProcessedSpan::Span(mut entry) => {
                entry.fetch_embedded_children_state = FetchEmbeddedChildrenState::Idle;
                EnhancedProcessedSpan::Span(entry)
            }
            other => other,
        })
        .collect();
    assert_eq!(after, before);

    // A retry after the error can succeed
    let fetcher = MockFetcher::with_events(&[child_event()]);
    let c = root.find_node_mut(&c_path()).unwrap();
    c.toggle_embedded_children(ORG, &slugs(), &fetcher, &mut listener)
        .await;
    assert!(c.show_embedded_children());
    assert_eq!(c.fetch_embedded_children_state(), FetchEmbeddedChildrenState::Idle);
}

#[test]
fn test_toggle_while_loading_is_noop() {
    let mut root = build_pageload();
    let mut listener = RecordingListener::default();
    let c = root.find_node_mut(&c_path()).unwrap();

    let ToggleAction::Fetch(ticket) = c.begin_toggle_embedded_children(&mut listener) else {
        panic!("expected a fetch");
    };
    assert_eq!(
        c.fetch_embedded_children_state(),
        FetchEmbeddedChildrenState::LoadingEmbeddedTransactions
    );
    assert_eq!(
        c.begin_toggle_embedded_children(&mut listener),
        ToggleAction::AlreadyLoading
    );

    assert!(c.complete_embedded_fetch(ticket, Ok(vec![child_event()]), &mut listener));
    assert!(c.show_embedded_children());
}

#[test]
fn test_stale_fetch_result_is_discarded() {
    let mut root = build_pageload();
    let mut listener = RecordingListener::default();
    let c = root.find_node_mut(&c_path()).unwrap();

    let ToggleAction::Fetch(stale) = c.begin_toggle_embedded_children(&mut listener) else {
        panic!("expected a fetch");
    };
    c.cancel_embedded_fetch();
    assert_eq!(c.fetch_embedded_children_state(), FetchEmbeddedChildrenState::Idle);
    assert!(!c.complete_embedded_fetch(stale, Ok(vec![child_event()]), &mut listener));
    assert!(!c.show_embedded_children());

    let ToggleAction::Fetch(current) = c.begin_toggle_embedded_children(&mut listener) else {
        panic!("expected a fetch");
    };
    assert!(!c.complete_embedded_fetch(stale, Ok(vec![child_event()]), &mut listener));
    assert!(c.complete_embedded_fetch(current, Ok(vec![child_event()]), &mut listener));
    assert!(c.show_embedded_children());
    assert_eq!(listener.added.len(), 1);

    // A late failure must not clobber the loaded state
    assert!(!c.complete_embedded_fetch(current, Err(FetchError::Status(500)), &mut listener));
    assert_eq!(c.fetch_embedded_children_state(), FetchEmbeddedChildrenState::Idle);
}

#[test]
fn test_malformed_embedded_event_is_an_error() {
    let mut root = build_pageload();
    let mut listener = RecordingListener::default();
    let c = root.find_node_mut(&c_path()).unwrap();

    let mut broken = child_event();
    broken.contexts.trace = None;
    let ToggleAction::Fetch(ticket) = c.begin_toggle_embedded_children(&mut listener) else {
        panic!("expected a fetch");
    };
    assert!(c.complete_embedded_fetch(ticket, Ok(vec![broken]), &mut listener));
    assert_eq!(
        c.fetch_embedded_children_state(),
        FetchEmbeddedChildrenState::ErrorFetchingEmbeddedTransactions
    );
}

#[tokio::test]
async fn test_several_embedded_transactions() {
    let mut root = build_pageload();
    let second = embedded_event("second-event", "f-root", "c", 9.0, 11.0, &[]);
    let fetcher = MockFetcher::with_events(&[child_event(), second]);
    let mut listener = RecordingListener::default();

    let c = root.find_node_mut(&c_path()).unwrap();
    c.toggle_embedded_children(
        ORG,
        &["child-event".to_string(), "second-event".to_string()],
        &fetcher,
        &mut listener,
    )
    .await;
    assert_eq!(c.num_of_span_children(), 2);
    let (_, bounds) = &listener.added[0];
    assert_abs_diff_eq!(bounds.start, 6.0);
    assert_abs_diff_eq!(bounds.end, 12.0);
}

#[tokio::test]
async fn test_file_event_fetcher() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join("child-event.json"),
        serde_json::to_vec(&child_event()).unwrap(),
    )
    .unwrap();

    let second = embedded_event("second-event", "f-root", "b", 2.0, 3.0, &[]);
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(&serde_json::to_vec(&second).unwrap())
        .unwrap();
    std::fs::write(
        dir.path().join("second-event.json.gz"),
        encoder.finish().unwrap(),
    )
    .unwrap();

    let fetcher = FileEventFetcher::new(dir.path());
    assert_eq!(
        fetcher.fetch_event_trace(ORG, "child-event").await.unwrap(),
        child_event()
    );
    assert_eq!(
        fetcher.fetch_event_trace(ORG, "second-event").await.unwrap(),
        second
    );
    assert!(matches!(
        fetcher.fetch_event_trace(ORG, "missing").await,
        Err(FetchError::NotFound(_))
    ));

    // Only plain JSON files are indexed
    let index = EmbeddedTransactionIndex::from_dir(dir.path()).unwrap();
    assert_eq!(index.event_slugs("c"), ["child-event".to_string()]);
    assert!(index.event_slugs("b").is_empty());
}

#[test]
fn test_index_from_events() {
    let index = EmbeddedTransactionIndex::from_events(&[pageload_event(), child_event()]);
    assert_eq!(index.event_slugs("c"), ["child-event".to_string()]);
    assert!(index.event_slugs("a").is_empty());
    assert!(!index.is_empty());
}
