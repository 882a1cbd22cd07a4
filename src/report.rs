//! Append-only batch report and its CSV rendering.

use crate::checkpoint::write_atomic;
use crate::record::{FileRecord, RecordError};
use crate::types::StageKind;
use anyhow::Context;
use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{error, info};

/// The one contended structure: every driver hands finalized records in here
pub type SharedReport = Arc<Mutex<BatchReport>>;

/// Counts for the end-of-batch summary and the exit code
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchSummary {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Succeeded entirely from earlier artifacts
    pub fully_resumed: usize,
}

impl BatchSummary {
    /// 0 when every file succeeded, 1 otherwise
    pub fn exit_code(&self) -> u8 {
        u8::from(self.failed > 0)
    }
}

/// Finalized records in completion order, mirrored row by row to a CSV file
pub struct BatchReport {
    target_language: String,
    expected: usize,
    rows: Vec<FileRecord>,
    seen: HashSet<PathBuf>,
    csv_path: Option<PathBuf>,
    csv_file: Option<File>,
}

impl BatchReport {
    /// Report without a CSV file
    pub fn in_memory(target_language: &str, expected: usize) -> Self {
        Self {
            target_language: target_language.to_string(),
            expected,
            rows: Vec::new(),
            seen: HashSet::new(),
            csv_path: None,
            csv_file: None,
        }
    }

    /// Create the CSV file and write its header
    pub fn create(path: &Path, target_language: &str, expected: usize) -> anyhow::Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create report directory {}", parent.display()))?;
        }
        let mut file = File::create(path)
            .with_context(|| format!("Failed to create report {}", path.display()))?;
        writeln!(file, "{}", csv_line(&header()))
            .with_context(|| format!("Failed to write report header to {}", path.display()))?;
        let file = OpenOptions::new()
            .append(true)
            .open(path)
            .with_context(|| format!("Failed to reopen report {}", path.display()))?;

        let mut report = Self::in_memory(target_language, expected);
        report.csv_path = Some(path.to_path_buf());
        report.csv_file = Some(file);
        Ok(report)
    }

    pub fn shared(self) -> SharedReport {
        Arc::new(Mutex::new(self))
    }

    /// Append a finalized record; each input file may appear once
    pub fn push(&mut self, record: FileRecord) -> Result<(), RecordError> {
        if !record.is_finalized() {
            return Err(RecordError::NotFinalized(record.input_path.clone()));
        }
        if !self.seen.insert(record.input_path.clone()) {
            return Err(RecordError::Duplicate(record.input_path.clone()));
        }

        if let Some(file) = self.csv_file.as_mut() {
            let line = csv_line(&row(&record, &self.target_language));
            if let Err(e) = writeln!(file, "{line}").and_then(|_| file.flush()) {
                error!(error = %e, "Failed to append report row; the full report is rewritten at the end");
            }
        }

        self.rows.push(record);
        let summary = self.summary();
        info!(
            done = self.rows.len(),
            total = self.expected,
            succeeded = summary.succeeded,
            failed = summary.failed,
            "Progress"
        );
        Ok(())
    }

    pub fn records(&self) -> &[FileRecord] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn csv_path(&self) -> Option<&Path> {
        self.csv_path.as_deref()
    }

    pub fn summary(&self) -> BatchSummary {
        let succeeded = self.rows.iter().filter(|r| r.overall_success()).count();
        BatchSummary {
            total: self.rows.len(),
            succeeded,
            failed: self.rows.len() - succeeded,
            fully_resumed: self.rows.iter().filter(|r| r.fully_resumed()).count(),
        }
    }

    /// Rewrite the whole CSV atomically from the collected rows
    pub fn finish(&mut self) -> anyhow::Result<()> {
        self.csv_file = None;
        let Some(path) = self.csv_path.as_deref() else {
            return Ok(());
        };
        write_atomic(path, self.to_csv().as_bytes())
            .with_context(|| format!("Failed to write report {}", path.display()))?;
        info!(report = %path.display(), rows = self.rows.len(), "Report written");
        Ok(())
    }

    pub fn to_csv(&self) -> String {
        let mut out = csv_line(&header());
        out.push('\n');
        for record in &self.rows {
            out.push_str(&csv_line(&row(record, &self.target_language)));
            out.push('\n');
        }
        out
    }
}

fn header() -> Vec<String> {
    let mut columns: Vec<String> = [
        "input_path",
        "relative_path",
        "metadata_title",
        "metadata_artist",
        "metadata_album",
        "metadata_genre",
        "metadata_year",
        "metadata_track_number",
        "song_title",
        "song_artist",
        "song_language",
    ]
    .iter()
    .map(|c| c.to_string())
    .collect();
    for stage in StageKind::ALL {
        columns.push(format!("{stage}_stage"));
        columns.push(format!("{stage}_detail"));
    }
    columns.extend(
        [
            "target_language",
            "overall_success",
            "started_at",
            "finished_at",
            "duration_seconds",
            "error_message",
        ]
        .iter()
        .map(|c| c.to_string()),
    );
    columns
}

fn row(record: &FileRecord, target_language: &str) -> Vec<String> {
    let opt = |v: &Option<String>| v.clone().unwrap_or_default();
    let num = |v: Option<u32>| v.map(|n| n.to_string()).unwrap_or_default();
    let meta = &record.metadata;
    let identity = record.identity.as_ref();

    let mut fields = vec![
        record.input_path.display().to_string(),
        record.relative_path().display().to_string(),
        opt(&meta.title),
        opt(&meta.artist),
        opt(&meta.album),
        opt(&meta.genre),
        num(meta.year),
        num(meta.track_number),
        identity.map(|i| i.title.clone()).unwrap_or_default(),
        identity.map(|i| i.artist.clone()).unwrap_or_default(),
        identity.and_then(|i| i.language.clone()).unwrap_or_default(),
    ];
    for stage in StageKind::ALL {
        match record.outcome(stage) {
            Some(outcome) => {
                fields.push(outcome.label().to_string());
                fields.push(outcome.detail());
            }
            None => {
                fields.push("NotRun".to_string());
                fields.push(String::new());
            }
        }
    }
    fields.push(target_language.to_string());
    fields.push(record.overall_success().to_string());
    fields.push(record.started_at.map(|t| t.to_rfc3339()).unwrap_or_default());
    fields.push(record.finished_at.map(|t| t.to_rfc3339()).unwrap_or_default());
    fields.push(
        record
            .duration()
            .map(|d| format!("{:.3}", d.num_milliseconds() as f64 / 1000.0))
            .unwrap_or_default(),
    );
    fields.push(record.error_message.clone().unwrap_or_default());
    fields
}

fn csv_line(fields: &[String]) -> String {
    fields
        .iter()
        .map(|f| escape(f))
        .collect::<Vec<_>>()
        .join(",")
}

/// RFC 4180 quoting
fn escape(field: &str) -> String {
    if field.contains(|c: char| matches!(c, ',' | '"' | '\n' | '\r')) {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}
