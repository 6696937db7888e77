//! Loading trace files from disk.

use std::io::Read;
use std::path::Path;

use anyhow::{Context, Result};
use flate2::read::GzDecoder;
use opentelemetry_proto::tonic::collector::trace::v1::ExportTraceServiceRequest;

use crate::otlp::events_from_otlp;
use crate::task_timer::TaskTimer;
use crate::types::TraceEvent;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Read a transaction event, or an OTLP JSON export (a single request or an array of them).
/// Gzipped files are decompressed first.
pub fn load_trace_file(path: &Path) -> Result<Vec<TraceEvent>> {
    let mut file_bytes = Vec::new();
    std::fs::File::open(path)
        .with_context(|| format!("opening {}", path.display()))?
        .read_to_end(&mut file_bytes)?;

    parse_trace_file(&file_bytes).with_context(|| format!("parsing {}", path.display()))
}

pub fn parse_trace_file(file_bytes: &[u8]) -> Result<Vec<TraceEvent>> {
    let t = TaskTimer::new("Parsing trace file");

    let decompressed;
    let file_bytes = if file_bytes.starts_with(&GZIP_MAGIC) {
        let mut buf = Vec::new();
        GzDecoder::new(file_bytes).read_to_end(&mut buf)?;
        decompressed = buf;
        decompressed.as_slice()
    } else {
        file_bytes
    };

    let file_str =
        std::str::from_utf8(file_bytes).map_err(|e| anyhow::anyhow!("File is not UTF8!: {}", e))?;
    let json: serde_json::Value = serde_json::from_str(file_str)?;

    let events = if json.is_array() {
        let requests: Vec<ExportTraceServiceRequest> = serde_json::from_value(json)?;
        events_from_otlp(&requests)?
    } else if json.get("resourceSpans").is_some() || json.get("resource_spans").is_some() {
        let request: ExportTraceServiceRequest = serde_json::from_value(json)?;
        events_from_otlp(std::slice::from_ref(&request))?
    } else {
        vec![serde_json::from_value::<TraceEvent>(json)?]
    };

    t.stop();
    Ok(events)
}
