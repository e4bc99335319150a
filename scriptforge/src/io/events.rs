//! Progress events emitted by the pipeline.
//!
//! Delivery is fire-and-forget: sinks may fail, and callers log the failure
//! and carry on. Nothing here can fail a design run.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::mpsc::Sender;

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{info, warn};

use crate::core::state::NodeKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    Started,
    Completed,
    Failed,
    Routed,
}

/// One structured progress event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineEvent {
    pub request_id: String,
    /// `None` for request-level events (final outcome).
    pub node: Option<NodeKind>,
    pub status: EventStatus,
    /// Attempt number, 1-indexed.
    pub iteration: u32,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,
}

impl PipelineEvent {
    pub fn new(
        request_id: impl Into<String>,
        node: Option<NodeKind>,
        status: EventStatus,
        iteration: u32,
    ) -> Self {
        Self {
            request_id: request_id.into(),
            node,
            status,
            iteration,
            timestamp: Utc::now(),
            metadata: Map::new(),
        }
    }

    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }
}

/// Consumer of progress events.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: &PipelineEvent) -> Result<()>;
}

/// Deliver `event`, logging instead of propagating failures.
pub fn emit_quietly(sink: &dyn EventSink, event: &PipelineEvent) {
    if let Err(err) = sink.emit(event) {
        warn!(
            err = %format!("{err:#}"),
            request_id = %event.request_id,
            status = ?event.status,
            "event delivery failed"
        );
    }
}

/// Discards every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

impl EventSink for NullSink {
    fn emit(&self, _event: &PipelineEvent) -> Result<()> {
        Ok(())
    }
}

/// Writes events as `tracing` records at info level.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: &PipelineEvent) -> Result<()> {
        let metadata = Value::Object(event.metadata.clone());
        info!(
            request_id = %event.request_id,
            node = event.node.map(NodeKind::as_str).unwrap_or("pipeline"),
            status = ?event.status,
            iteration = event.iteration,
            metadata = %metadata,
            "pipeline event"
        );
        Ok(())
    }
}

/// Appends one JSON object per line to a file, flushing after each event.
#[derive(Debug)]
pub struct JsonlSink {
    path: PathBuf,
    file: Mutex<File>,
}

impl JsonlSink {
    pub fn create(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)
                .with_context(|| format!("create event log dir {}", parent.display()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("open event log {}", path.display()))?;
        Ok(Self {
            path: path.to_path_buf(),
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl EventSink for JsonlSink {
    fn emit(&self, event: &PipelineEvent) -> Result<()> {
        let mut line = serde_json::to_string(event).context("serialize event")?;
        line.push('\n');
        let mut file = self
            .file
            .lock()
            .map_err(|_| anyhow!("event log lock poisoned"))?;
        file.write_all(line.as_bytes())
            .with_context(|| format!("write event log {}", self.path.display()))?;
        file.flush()
            .with_context(|| format!("flush event log {}", self.path.display()))
    }
}

/// Forwards events over an mpsc channel.
#[derive(Debug)]
pub struct ChannelSink {
    sender: Mutex<Sender<PipelineEvent>>,
}

impl ChannelSink {
    pub fn new(sender: Sender<PipelineEvent>) -> Self {
        Self {
            sender: Mutex::new(sender),
        }
    }
}

impl EventSink for ChannelSink {
    fn emit(&self, event: &PipelineEvent) -> Result<()> {
        self.sender
            .lock()
            .map_err(|_| anyhow!("event channel lock poisoned"))?
            .send(event.clone())
            .map_err(|_| anyhow!("event channel receiver dropped"))
    }
}

/// Delivers to every inner sink; one failing sink does not starve the others.
#[derive(Default)]
pub struct FanoutSink {
    sinks: Vec<Box<dyn EventSink>>,
}

impl FanoutSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, sink: Box<dyn EventSink>) {
        self.sinks.push(sink);
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

impl EventSink for FanoutSink {
    fn emit(&self, event: &PipelineEvent) -> Result<()> {
        let failures: Vec<String> = self
            .sinks
            .iter()
            .filter_map(|sink| sink.emit(event).err())
            .map(|err| format!("{err:#}"))
            .collect();
        if failures.is_empty() {
            Ok(())
        } else {
            Err(anyhow!("{} sink(s) failed: {}", failures.len(), failures.join("; ")))
        }
    }
}
