//! Finalized interval results and the sinks that consume them.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::tag::TagKey;

/// One output row: the merged tally for a single tag in one interval.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ResultRow {
    pub interval_ts: u32,
    /// RFC 3339 rendering of `interval_ts` for humans.
    pub timestamp: String,
    pub label: String,
    pub metric_class: &'static str,
    pub metric_value: String,
    pub src_ip_count: u32,
    pub dst_ip_count: u32,
    pub src_asn_count: u32,
    pub packet_count: u64,
    pub byte_count: u64,
    /// "class=value" cross-references recorded at tally creation.
    pub associated: Vec<String>,
}

impl ResultRow {
    /// Renders the interval timestamp for the `timestamp` field.
    pub fn format_ts(interval_ts: u32) -> String {
        DateTime::<Utc>::from_timestamp(i64::from(interval_ts), 0)
            .map(|dt| dt.to_rfc3339())
            .unwrap_or_default()
    }

    pub fn format_associated(tag: &TagKey) -> String {
        format!("{}={}", tag.class.as_str(), tag.format_value())
    }
}

/// Everything the merger produces for one finalized interval.
#[derive(Debug, Clone, Serialize)]
pub struct IntervalResult {
    pub interval_ts: u32,
    /// Messages lost on tracker inboxes during this interval.
    pub lost_messages: u64,
    pub rows: Vec<ResultRow>,
}

/// Consumes finalized interval results.
pub trait ResultSink: Send {
    /// Sink name for logging.
    fn name(&self) -> &str;

    /// Writes one finalized interval.
    fn emit(&mut self, result: &IntervalResult) -> Result<()>;

    /// Flushes buffered output; called on shutdown.
    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

enum JsonTarget {
    Stdout(std::io::Stdout),
    File(BufWriter<File>),
}

/// Writes one JSON object per row, newline-delimited.
pub struct JsonLinesSink {
    target: JsonTarget,
}

impl JsonLinesSink {
    /// Opens the sink; `-` writes to stdout.
    pub fn create(path: &str) -> Result<Self> {
        let target = if path == "-" {
            JsonTarget::Stdout(std::io::stdout())
        } else {
            let file = File::create(Path::new(path))
                .with_context(|| format!("creating result file {path}"))?;
            JsonTarget::File(BufWriter::new(file))
        };
        Ok(JsonLinesSink { target })
    }

    fn writer(&mut self) -> &mut dyn Write {
        match &mut self.target {
            JsonTarget::Stdout(out) => out,
            JsonTarget::File(file) => file,
        }
    }
}

impl ResultSink for JsonLinesSink {
    fn name(&self) -> &str {
        "jsonl"
    }

    fn emit(&mut self, result: &IntervalResult) -> Result<()> {
        let mut out = Vec::with_capacity(result.rows.len() * 160);
        for row in &result.rows {
            serde_json::to_writer(&mut out, row).context("serializing result row")?;
            out.push(b'\n');
        }
        self.writer()
            .write_all(&out)
            .context("writing result rows")?;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.writer().flush().context("flushing result sink")
    }
}

/// Collects results in memory; used by tests and the replay summary.
#[derive(Clone, Default)]
pub struct MemorySink {
    results: Arc<Mutex<Vec<IntervalResult>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn results(&self) -> Vec<IntervalResult> {
        self.results.lock().expect("sink poisoned").clone()
    }
}

impl ResultSink for MemorySink {
    fn name(&self) -> &str {
        "memory"
    }

    fn emit(&mut self, result: &IntervalResult) -> Result<()> {
        self.results
            .lock()
            .expect("sink poisoned")
            .push(result.clone());
        Ok(())
    }
}
