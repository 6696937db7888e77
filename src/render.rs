//! Plain text rendering of waterfall rows.

use crate::bounds::SpanBounds;
use crate::span_tree::FetchEmbeddedChildrenState;
use crate::spans_list::{EnhancedProcessedSpan, TreeDepth};
use crate::types::{time_point_to_utc_string, MILLISECONDS_PER_SECOND};

#[derive(Debug, Clone, Copy)]
pub struct RenderOptions {
    /// Width of the timeline bar in characters.
    pub bar_width: usize,
    pub show_timestamps: bool,
}

impl Default for RenderOptions {
    fn default() -> Self {
        RenderOptions {
            bar_width: 40,
            show_timestamps: false,
        }
    }
}

pub fn render_waterfall(rows: &[EnhancedProcessedSpan], options: &RenderOptions) -> String {
    let mut out = String::new();
    for row in rows {
        out.push_str(&render_bar(row.bounds(), options.bar_width));
        out.push(' ');
        out.push_str(&render_row(row, options));
        out.push('\n');
    }
    out
}

fn render_row(row: &EnhancedProcessedSpan, options: &RenderOptions) -> String {
    match row {
        EnhancedProcessedSpan::Span(entry) => {
            let span = &entry.span;
            let mut line = tree_prefix(
                entry.tree_depth,
                &entry.continuing_tree_depths,
                entry.is_last_sibling,
                entry.is_root,
            );
            line.push_str(&span.op);
            if let Some(description) = &span.description {
                line.push_str(" - ");
                line.push_str(description);
            }
            line.push_str(&format!(
                " ({:.3}ms)",
                span.duration() * MILLISECONDS_PER_SECOND
            ));
            if let Some(status_code) = span.http_status_code() {
                line.push_str(&format!(" [{status_code}]"));
            }
            if entry.is_sub_tree_hidden && entry.num_of_span_children > 0 {
                line.push_str(&format!(" [+{} hidden]", entry.num_of_span_children));
            }
            if entry.is_embedded_transaction_root {
                line.push_str(" <embedded>");
            }
            match entry.fetch_embedded_children_state {
                FetchEmbeddedChildrenState::Idle => {}
                FetchEmbeddedChildrenState::LoadingEmbeddedTransactions => {
                    line.push_str(" <loading>")
                }
                FetchEmbeddedChildrenState::ErrorFetchingEmbeddedTransactions => {
                    line.push_str(" <error fetching embedded transactions>")
                }
            }
            if options.show_timestamps {
                line.push_str(&format!(
                    " {} - {}",
                    time_point_to_utc_string(span.start_timestamp),
                    time_point_to_utc_string(span.timestamp)
                ));
            }
            line
        }
        EnhancedProcessedSpan::SpanGroupSiblings(entry) => {
            let mut line = tree_prefix(
                entry.tree_depth,
                &entry.continuing_tree_depths,
                entry.is_last_sibling,
                false,
            );
            line.push_str(&format!("{} x{}", entry.op(), entry.spans.len()));
            if let Some(description) = entry.description() {
                line.push_str(" - ");
                line.push_str(description);
            }
            line.push_str(" (autogrouped)");
            line
        }
        EnhancedProcessedSpan::Gap(entry) => {
            let mut line = tree_prefix(
                entry.tree_depth,
                &entry.continuing_tree_depths,
                false,
                false,
            );
            line.push_str(&format!(
                "missing instrumentation ({:.3}ms)",
                (entry.end_timestamp - entry.start_timestamp) * MILLISECONDS_PER_SECOND
            ));
            line
        }
    }
}

/// Connector lines in front of a row. Depth 0 has no connector of its own.
pub fn tree_prefix(
    tree_depth: usize,
    continuing_tree_depths: &[TreeDepth],
    is_last_sibling: bool,
    is_root: bool,
) -> String {
    if is_root || tree_depth == 0 {
        return String::new();
    }

    let mut prefix = String::new();
    for depth in 1..tree_depth {
        let continuing = continuing_tree_depths.iter().find(|d| d.depth() == depth);
        prefix.push_str(match continuing {
            Some(TreeDepth::Regular(_)) => "│  ",
            Some(TreeDepth::Orphan(_)) => "┆  ",
            None => "   ",
        });
    }
    prefix.push_str(if is_last_sibling { "└─ " } else { "├─ " });
    prefix
}

fn render_bar(bounds: &SpanBounds, width: usize) -> String {
    let width = width.max(1);
    let start = ((bounds.start * width as f64).floor() as usize).min(width - 1);
    let end = ((bounds.end * width as f64).ceil() as usize).clamp(start + 1, width);

    let mut bar = String::with_capacity(width + 2);
    bar.push('|');
    for i in 0..width {
        bar.push(if i >= start && i < end { '█' } else { ' ' });
    }
    bar.push('|');
    bar
}
