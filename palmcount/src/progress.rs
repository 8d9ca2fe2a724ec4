//! Line-oriented progress protocol on stdout.
//!
//! Every record is one JSON object on its own line, flushed immediately, so a
//! supervising process can parse the stream incrementally. Human-readable
//! diagnostics never go here; they go to stderr through `log`.

use anyhow::{Context, Result};
use serde::Serialize;
use std::io::Write;

/// One per processed image, plus files-mode inference milestones
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgressRecord {
    pub processed: usize,
    pub total: usize,
    pub current_file: String,
    pub status: String,
    pub abnormal_count: usize,
    pub normal_count: usize,
    pub successful: usize,
    pub failed: usize,
    /// Absent in folder mode; `null` or the absolute folder in files mode
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_folder: Option<Option<String>>,
}

/// Terminal record, emitted exactly once after every progress record
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SummaryRecord {
    pub done: bool,
    pub successful: usize,
    pub failed: usize,
    pub total: usize,
    pub total_abnormal: usize,
    pub total_normal: usize,
}

impl SummaryRecord {
    pub fn exit_code(&self) -> i32 {
        if self.successful > 0 {
            0
        } else {
            1
        }
    }
}

/// Destination for protocol records
pub trait ProgressSink {
    fn progress(&mut self, record: &ProgressRecord) -> Result<()>;
    fn summary(&mut self, record: &SummaryRecord) -> Result<()>;
}

/// Writes each record as one JSON line and flushes
pub struct JsonLineReporter<W: Write> {
    out: W,
}

impl<W: Write> JsonLineReporter<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }

    pub fn into_inner(self) -> W {
        self.out
    }

    fn emit<T: Serialize>(&mut self, record: &T) -> Result<()> {
        let line = serde_json::to_string(record)?;
        writeln!(self.out, "{line}").context("Failed to write progress record")?;
        self.out.flush().context("Failed to flush progress record")
    }
}

impl JsonLineReporter<std::io::Stdout> {
    pub fn stdout() -> Self {
        Self::new(std::io::stdout())
    }
}

impl<W: Write> ProgressSink for JsonLineReporter<W> {
    fn progress(&mut self, record: &ProgressRecord) -> Result<()> {
        self.emit(record)
    }

    fn summary(&mut self, record: &SummaryRecord) -> Result<()> {
        self.emit(record)
    }
}
