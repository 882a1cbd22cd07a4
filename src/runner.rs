use crate::checkpoint;
use crate::collaborators::Collaborators;
use crate::config::Config;
use crate::discovery::discover;
use crate::error::StageError;
use crate::memory::MemoryMonitor;
use crate::paths::{ensure_directories, plan};
use crate::pipeline::Pipeline;
use crate::pools::{finalize_into, run_phase1, run_phase2};
use crate::record::FileRecord;
use crate::report::{BatchReport, SharedReport};
use crate::types::StageKind;
use anyhow::{Context, Result};
use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Runs one batch: discovery, the sequential model stages, the worker pool
/// for the network stages, then the final report.
pub struct BatchOrchestrator {
    config: Config,
    collaborators: Collaborators,
    cancel: CancellationToken,
    abort: CancellationToken,
}

impl BatchOrchestrator {
    pub fn new(config: Config, collaborators: Collaborators, cancel: CancellationToken) -> Self {
        Self {
            config,
            collaborators,
            cancel,
            abort: CancellationToken::new(),
        }
    }

    /// Token that, once cancelled, drops every in-flight stage call
    pub fn with_abort(mut self, abort: CancellationToken) -> Self {
        self.abort = abort;
        self
    }

    /// Main orchestration function
    pub async fn run(&self) -> Result<BatchReport> {
        self.config.validate()?;
        let config = Arc::new(resolve_directories(&self.config)?);

        let files = discover(
            &config.input_dir,
            &config.extensions,
            &[&config.temp_dir, &config.output_dir],
        )?;
        let report = BatchReport::create(&config.csv_output, &config.target_language, files.len())?.shared();

        if files.is_empty() {
            warn!(input = %config.input_dir.display(), "No audio files found");
            return finish(report);
        }

        info!(
            files = files.len(),
            workers = config.max_workers,
            resume = config.resume,
            "Starting batch"
        );

        let records = plan_records(&config, files, &report).await;
        let pipeline = Pipeline::new(Arc::clone(&config), self.collaborators.clone(), self.cancel.clone())
            .with_abort(self.abort.clone());

        let monitor = MemoryMonitor::new(config.memory.clone());
        let stop_monitor = self.cancel.child_token();
        let sampler = monitor.spawn(stop_monitor.clone());

        let ready = run_phase1(&pipeline, records, &report, monitor.handle()).await;

        stop_monitor.cancel();
        if let Err(e) = sampler.await {
            error!(error = %e, "Memory monitor ended abnormally");
        }

        run_phase2(&pipeline, ready, config.max_workers, &report).await;

        if self.abort.is_cancelled() {
            warn!("Batch was aborted; in-flight files are reported as cancelled");
        } else if self.cancel.is_cancelled() {
            warn!("Batch was interrupted; unfinished files are reported as cancelled");
        }
        finish(report)
    }
}

/// Canonical input, output and temp roots; output and temp are created
fn resolve_directories(config: &Config) -> Result<Config> {
    let mut resolved = config.clone();
    resolved.input_dir = canonical(&config.input_dir)?;
    for dir in [&config.output_dir, &config.temp_dir] {
        fs::create_dir_all(dir).with_context(|| format!("Failed to create directory {}", dir.display()))?;
    }
    resolved.output_dir = canonical(&config.output_dir)?;
    resolved.temp_dir = canonical(&config.temp_dir)?;
    Ok(resolved)
}

fn canonical(dir: &Path) -> Result<PathBuf> {
    dir.canonicalize()
        .with_context(|| format!("Failed to resolve directory {}", dir.display()))
}

/// Build a record per file, probing earlier artifacts. Files whose
/// directories cannot be created, or whose artifact paths are already taken
/// by an earlier file (`song.flac` and `song.mp3` side by side), fail right
/// away.
async fn plan_records(config: &Config, files: Vec<PathBuf>, report: &SharedReport) -> Vec<FileRecord> {
    let mut records = Vec::with_capacity(files.len());
    let mut claimed: HashMap<PathBuf, PathBuf> = HashMap::new();
    for input in files {
        let paths = plan(
            &input,
            &config.input_dir,
            &config.output_dir,
            &config.temp_dir,
            &config.vocals_tag,
        );

        let owner = [&paths.output_lrc, &paths.work_dir]
            .into_iter()
            .find_map(|path| claimed.get(path.as_path()).cloned());
        if let Some(owner) = owner {
            warn!(
                file = %paths.relative_path.display(),
                other = %owner.display(),
                "Artifact paths collide with another input, skipping"
            );
            let message = format!("artifact paths collide with {}", owner.display());
            let err = StageError::io(
                message.clone(),
                io::Error::new(io::ErrorKind::AlreadyExists, message),
            );
            let mut record = FileRecord::new(input, paths, BTreeSet::new());
            record.begin();
            record.fail(StageKind::Metadata, &err);
            finalize_into(report, record).await;
            continue;
        }
        claimed.insert(paths.output_lrc.clone(), input.clone());
        claimed.insert(paths.work_dir.clone(), input.clone());

        if let Err(e) = ensure_directories(&paths) {
            let mut record = FileRecord::new(input, paths, BTreeSet::new());
            record.begin();
            record.fail(StageKind::Metadata, &e);
            finalize_into(report, record).await;
            continue;
        }

        let satisfied = checkpoint::probe(&paths, config.resume);
        if !satisfied.is_empty() {
            debug!(
                file = %paths.relative_path.display(),
                stages = ?satisfied,
                "Found artifacts from an earlier run"
            );
        }
        records.push(FileRecord::new(input, paths, satisfied));
    }
    records
}

fn finish(report: SharedReport) -> Result<BatchReport> {
    let mut report = Arc::try_unwrap(report)
        .map_err(|_| anyhow::anyhow!("Report still in use after all workers finished"))?
        .into_inner();
    report.finish()?;

    let summary = report.summary();
    info!(
        total = summary.total,
        succeeded = summary.succeeded,
        failed = summary.failed,
        fully_resumed = summary.fully_resumed,
        "Processing complete"
    );
    Ok(report)
}
