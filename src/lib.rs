pub mod bounds;
pub mod error;
pub mod fetch;
pub mod filter;
pub mod load;
pub mod logging;
pub mod otlp;
pub mod persistent;
pub mod render;
pub mod span_tree;
pub mod spans_list;
pub mod task_timer;
pub mod trace;
pub mod types;
pub mod waterfall;

pub use bounds::{BoundsGenerator, SpanBounds, TraceBounds, ViewWindow};
pub use error::{FetchError, TraceError};
pub use fetch::{EventTraceFetcher, FileEventFetcher};
pub use span_tree::{
    FetchEmbeddedChildrenState, NodePath, SpanKey, SpanTreeNode, ToggleAction,
};
pub use spans_list::{EnhancedProcessedSpan, SpansListParams};
pub use trace::ParsedTrace;
pub use types::{RawSpan, TimePoint, TraceEvent};
pub use waterfall::WaterfallModel;
