//! Error types of the span tree library.

use thiserror::Error;

/// A trace payload that cannot be turned into a span tree.
#[derive(Error, Debug)]
pub enum TraceError {
    #[error("Event {0:?} has no trace context")]
    MissingTraceContext(String),

    #[error("Event {0:?} has no root span id")]
    MissingRootSpanId(String),

    #[error("Malformed spans entry: {0}")]
    MalformedSpans(#[from] serde_json::Error),
}

/// Failure of the embedded transaction fetch collaborator.
#[derive(Error, Debug)]
pub enum FetchError {
    #[error("Event {0:?} not found")]
    NotFound(String),

    #[error("Fetch failed with status {0}")]
    Status(u16),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Decode error: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("Invalid trace: {0}")]
    Trace(#[from] TraceError),
}
