//! Fetching of embedded transactions.

use std::collections::BTreeMap;
use std::io::Read;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use flate2::read::GzDecoder;
use tracing::{debug, warn};

use crate::error::FetchError;
use crate::types::TraceEvent;

/// Supplies the full event of a transaction that is embedded under a span.
#[async_trait]
pub trait EventTraceFetcher {
    async fn fetch_event_trace(
        &self,
        org_slug: &str,
        event_slug: &str,
    ) -> Result<TraceEvent, FetchError>;
}

/// Reads events from `<dir>/<event_slug>.json` or `<dir>/<event_slug>.json.gz`.
/// The organization is not part of the lookup.
#[derive(Debug, Clone)]
pub struct FileEventFetcher {
    pub dir: PathBuf,
}

impl FileEventFetcher {
    pub fn new(dir: impl Into<PathBuf>) -> FileEventFetcher {
        FileEventFetcher { dir: dir.into() }
    }
}

#[async_trait]
impl EventTraceFetcher for FileEventFetcher {
    async fn fetch_event_trace(
        &self,
        org_slug: &str,
        event_slug: &str,
    ) -> Result<TraceEvent, FetchError> {
        debug!(org_slug, event_slug, dir = %self.dir.display(), "fetching event");

        let plain_path = self.dir.join(format!("{event_slug}.json"));
        let gz_path = self.dir.join(format!("{event_slug}.json.gz"));

        let bytes = if tokio::fs::try_exists(&plain_path).await? {
            tokio::fs::read(&plain_path).await?
        } else if tokio::fs::try_exists(&gz_path).await? {
            let compressed = tokio::fs::read(&gz_path).await?;
            let mut decompressed = Vec::new();
            GzDecoder::new(compressed.as_slice()).read_to_end(&mut decompressed)?;
            decompressed
        } else {
            return Err(FetchError::NotFound(event_slug.to_string()));
        };

        Ok(serde_json::from_slice(&bytes)?)
    }
}

/// Which transactions are embedded under which span: parent span id -> event slugs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EmbeddedTransactionIndex {
    by_parent_span: BTreeMap<String, Vec<String>>,
}

impl EmbeddedTransactionIndex {
    /// Index events by the parent span id of their trace context. Event slugs are event ids.
    pub fn from_events<'a>(events: impl IntoIterator<Item = &'a TraceEvent>) -> Self {
        let mut index = EmbeddedTransactionIndex::default();
        for event in events {
            let Some(parent_span_id) = event
                .trace_context()
                .and_then(|context| context.parent_span_id.clone())
            else {
                continue;
            };
            index.insert(&parent_span_id, &event.event_id);
        }
        index
    }

    /// Index every `*.json` event in a directory. Event slugs are file stems, so that the index
    /// can be used together with [FileEventFetcher].
    pub fn from_dir(dir: &Path) -> anyhow::Result<Self> {
        let mut index = EmbeddedTransactionIndex::default();
        let mut entries = std::fs::read_dir(dir)?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .collect::<Vec<_>>();
        entries.sort();

        for path in entries {
            let Some(file_name) = path.file_name().and_then(|name| name.to_str()) else {
                continue;
            };
            let Some(event_slug) = file_name.strip_suffix(".json") else {
                continue;
            };

            let event: TraceEvent = match std::fs::read(&path)
                .map_err(anyhow::Error::from)
                .and_then(|bytes| Ok(serde_json::from_slice(&bytes)?))
            {
                Ok(event) => event,
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "skipping unreadable event");
                    continue;
                }
            };

            if let Some(parent_span_id) = event
                .trace_context()
                .and_then(|context| context.parent_span_id.as_deref())
            {
                index.insert(parent_span_id, event_slug);
            }
        }
        Ok(index)
    }

    pub fn insert(&mut self, parent_span_id: &str, event_slug: &str) {
        self.by_parent_span
            .entry(parent_span_id.to_string())
            .or_default()
            .push(event_slug.to_string());
    }

    pub fn event_slugs(&self, span_id: &str) -> &[String] {
        self.by_parent_span
            .get(span_id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn is_empty(&self) -> bool {
        self.by_parent_span.is_empty()
    }
}
