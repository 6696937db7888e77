//! Filters deciding which spans show up in the waterfall.

use std::collections::{BTreeMap, BTreeSet};

use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};

use crate::span_tree::SpanTreeNode;
use crate::types::RawSpan;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperationNameFilter {
    #[default]
    NoFilter,
    /// Only spans with one of these operation names are shown.
    ActiveFilter(BTreeSet<String>),
}

impl OperationNameFilter {
    pub fn from_operations<I, S>(operations: I) -> OperationNameFilter
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let operations: BTreeSet<String> = operations.into_iter().map(Into::into).collect();
        if operations.is_empty() {
            OperationNameFilter::NoFilter
        } else {
            OperationNameFilter::ActiveFilter(operations)
        }
    }

    pub fn matches(&self, span: &RawSpan) -> bool {
        match self {
            OperationNameFilter::NoFilter => true,
            OperationNameFilter::ActiveFilter(operations) => operations.contains(&span.op),
        }
    }

    /// Add the operation to the filter, or remove it when it's already there.
    /// Removing the last operation turns the filter off.
    pub fn toggle(&mut self, operation: &str) {
        match self {
            OperationNameFilter::NoFilter => {
                *self = OperationNameFilter::from_operations([operation]);
            }
            OperationNameFilter::ActiveFilter(operations) => {
                if !operations.remove(operation) {
                    operations.insert(operation.to_string());
                }
                if operations.is_empty() {
                    *self = OperationNameFilter::NoFilter;
                }
            }
        }
    }

    pub fn clear(&mut self) {
        *self = OperationNameFilter::NoFilter;
    }
}

/// Free text search over span id, operation and description.
#[derive(Debug, Clone)]
pub struct SpanSearch {
    query: String,
    regex: Regex,
}

impl SpanSearch {
    /// The query is matched literally and case-insensitively.
    pub fn new(query: &str) -> Result<SpanSearch, regex::Error> {
        let regex = RegexBuilder::new(&regex::escape(query.trim()))
            .case_insensitive(true)
            .build()?;
        Ok(SpanSearch {
            query: query.to_string(),
            regex,
        })
    }

    pub fn query(&self) -> &str {
        &self.query
    }

    pub fn matches(&self, span: &RawSpan) -> bool {
        self.regex.is_match(&span.span_id)
            || self.regex.is_match(&span.op)
            || span
                .description
                .as_deref()
                .map(|description| self.regex.is_match(description))
                .unwrap_or(false)
    }
}

/// Operation names of a subtree with their counts, most frequent first.
pub fn operation_breakdown(node: &SpanTreeNode) -> Vec<(String, usize)> {
    sorted_counts(node.operation_name_counts())
}

fn sorted_counts(counts: &BTreeMap<String, usize>) -> Vec<(String, usize)> {
    let mut breakdown: Vec<(String, usize)> = counts
        .iter()
        .map(|(op, count)| (op.clone(), *count))
        .collect();
    breakdown.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    breakdown
}
