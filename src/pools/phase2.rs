use super::{drive_isolated, finalize_into, Phase};
use crate::error::StageError;
use crate::pipeline::Pipeline;
use crate::record::FileRecord;
use crate::report::SharedReport;
use crate::types::StageKind;
use async_channel::{bounded, Receiver};
use tokio::task::JoinHandle;
use tracing::{error, info};

/// Run identification through translation on a bounded worker pool.
///
/// Every record is moved into exactly one worker, so no two workers can
/// touch the same file. Returns once every record is in the report.
pub async fn run_phase2(
    pipeline: &Pipeline,
    records: Vec<FileRecord>,
    max_workers: usize,
    report: &SharedReport,
) {
    if records.is_empty() {
        return;
    }
    let workers = max_workers.clamp(1, records.len());
    let (tx, rx) = bounded::<FileRecord>(workers);

    info!(files = records.len(), workers, "Starting network stages");
    let handles = spawn_phase2_pool(workers, rx, pipeline, report);

    for record in records {
        if let Err(e) = tx.send(record).await {
            let mut record = e.into_inner();
            error!(
                file = %record.relative_path().display(),
                "Worker pool closed before the file was queued"
            );
            record.cancel();
            finalize_into(report, record).await;
        }
    }
    // Close the queue so workers exit once it drains
    drop(tx);

    for handle in handles {
        if let Err(e) = handle.await {
            error!(error = %e, "Network worker ended abnormally");
        }
    }
}

/// Spawn a pool of network-stage workers
fn spawn_phase2_pool(
    workers: usize,
    rx: Receiver<FileRecord>,
    pipeline: &Pipeline,
    report: &SharedReport,
) -> Vec<JoinHandle<()>> {
    (0..workers)
        .map(|worker_id| {
            let rx = rx.clone();
            let pipeline = pipeline.clone();
            let report = report.clone();

            tokio::spawn(async move {
                phase2_worker(worker_id, rx, pipeline, report).await;
            })
        })
        .collect()
}

async fn phase2_worker(
    worker_id: usize,
    rx: Receiver<FileRecord>,
    pipeline: Pipeline,
    report: SharedReport,
) {
    while let Ok(mut record) = rx.recv().await {
        let file = record.relative_path().display().to_string();

        if let Err(e) = record.claim(worker_id) {
            error!(worker = worker_id, file = %file, error = %e, "Record already owned");
            let stage = record
                .state()
                .next_stage()
                .unwrap_or(StageKind::Identification);
            record.begin();
            record.fail(stage, &StageError::Format(e.to_string()));
            finalize_into(&report, record).await;
            continue;
        }

        info!(worker = worker_id, file = %file, "Starting network stages");
        drive_isolated(&pipeline, &mut record, Phase::Two).await;
        finalize_into(&report, record).await;
    }

    info!(worker = worker_id, "Network worker shutting down");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint;
    use crate::config::Config;
    use crate::error::ErrorKind;
    use crate::paths::{ensure_directories, plan};
    use crate::report::BatchReport;
    use crate::testing::{add_input, test_config, FileScript, ScriptedCollaborators};
    use crate::types::{PipelineState, StageKind};
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio_util::sync::CancellationToken;

    /// Records that already went through the model stages
    async fn transcribed(pipeline: &Pipeline, config: &Config, count: usize) -> Vec<FileRecord> {
        let mut out = Vec::new();
        for i in 0..count {
            let input = add_input(config, &format!("song{i:02}.flac"));
            let paths = plan(
                &input,
                &config.input_dir,
                &config.output_dir,
                &config.temp_dir,
                &config.vocals_tag,
            );
            ensure_directories(&paths).unwrap();
            let satisfied = checkpoint::probe(&paths, false);
            let mut record = FileRecord::new(input, paths, satisfied);
            pipeline.run_phase1(&mut record).await;
            assert_eq!(record.state(), PipelineState::TranscriptionDone);
            out.push(record);
        }
        out
    }

    #[tokio::test]
    async fn test_pool_bounds_concurrency_and_reports_each_file_once() {
        let dir = TempDir::new().unwrap();
        let config = Arc::new(test_config(dir.path()));
        let (fake, collaborators) = ScriptedCollaborators::new()
            .with_delay(Duration::from_millis(10))
            .into_collaborators();
        let pipeline = Pipeline::new(config.clone(), collaborators, CancellationToken::new());
        let records = transcribed(&pipeline, &config, 12).await;
        let report = BatchReport::in_memory("Traditional Chinese", 12).shared();

        run_phase2(&pipeline, records, 3, &report).await;

        let report = report.lock().await;
        assert_eq!(report.len(), 12);
        let unique: HashSet<_> = report.records().iter().map(|r| r.input_path.clone()).collect();
        assert_eq!(unique.len(), 12);
        assert!(report.records().iter().all(|r| r.overall_success()));
        assert!(report
            .records()
            .iter()
            .all(|r| r.phase2_worker().is_some_and(|w| w < 3)));
        assert!(fake.max_in_flight() <= 3);
        assert!(fake.max_in_flight() >= 1);
    }

    #[tokio::test]
    async fn test_panic_in_worker_is_isolated() {
        let dir = TempDir::new().unwrap();
        let config = Arc::new(test_config(dir.path()));
        let (_fake, collaborators) = ScriptedCollaborators::new()
            .with_script(
                "song01",
                FileScript {
                    panic_in: Some(StageKind::Verification),
                    ..Default::default()
                },
            )
            .into_collaborators();
        let pipeline = Pipeline::new(config.clone(), collaborators, CancellationToken::new());
        let records = transcribed(&pipeline, &config, 3).await;
        let report = BatchReport::in_memory("Traditional Chinese", 3).shared();

        run_phase2(&pipeline, records, 2, &report).await;

        let report = report.lock().await;
        assert_eq!(report.len(), 3);
        let summary = report.summary();
        assert_eq!(summary.succeeded, 2);
        let failed = report
            .records()
            .iter()
            .find(|r| !r.overall_success())
            .unwrap();
        assert_eq!(failed.relative_path().to_str(), Some("song01.flac"));
        assert_eq!(
            failed.state(),
            PipelineState::Failed {
                stage: StageKind::Verification,
                kind: ErrorKind::Api,
            }
        );
    }

    #[tokio::test]
    async fn test_cancelled_before_pool_fails_remaining_files() {
        let dir = TempDir::new().unwrap();
        let config = Arc::new(test_config(dir.path()));
        let (fake, collaborators) = ScriptedCollaborators::new().into_collaborators();
        let cancel = CancellationToken::new();
        let pipeline = Pipeline::new(config.clone(), collaborators, cancel.clone());
        let records = transcribed(&pipeline, &config, 4).await;
        let before = fake.total_calls();
        cancel.cancel();
        let report = BatchReport::in_memory("Traditional Chinese", 4).shared();

        run_phase2(&pipeline, records, 2, &report).await;

        assert_eq!(fake.total_calls(), before);
        let report = report.lock().await;
        assert_eq!(report.len(), 4);
        assert!(report
            .records()
            .iter()
            .all(|r| r.failure_kind() == Some(ErrorKind::Cancelled)));
    }

    #[tokio::test]
    async fn test_record_claimed_elsewhere_is_reported_failed() {
        let dir = TempDir::new().unwrap();
        let config = Arc::new(test_config(dir.path()));
        let (fake, collaborators) = ScriptedCollaborators::new().into_collaborators();
        let pipeline = Pipeline::new(config.clone(), collaborators, CancellationToken::new());
        let mut records = transcribed(&pipeline, &config, 2).await;
        records[0].claim(7).unwrap();
        let before = fake.total_calls();
        let report = BatchReport::in_memory("Traditional Chinese", 2).shared();

        run_phase2(&pipeline, records, 1, &report).await;

        let report = report.lock().await;
        assert_eq!(report.len(), 2);
        let stolen = report
            .records()
            .iter()
            .find(|r| r.relative_path().to_str() == Some("song00.flac"))
            .unwrap();
        assert_eq!(
            stolen.state(),
            PipelineState::Failed {
                stage: StageKind::Identification,
                kind: ErrorKind::Format,
            }
        );
        assert_eq!(stolen.phase2_worker(), Some(7));
        assert!(stolen.error_message.as_deref().unwrap().contains("song00.flac"));
        assert_eq!(fake.calls_for_file("song00"), 3);
        assert!(fake.total_calls() > before);
        assert_eq!(report.summary().succeeded, 1);
    }

    #[tokio::test]
    async fn test_empty_input_is_a_no_op() {
        let dir = TempDir::new().unwrap();
        let config = Arc::new(test_config(dir.path()));
        let (_fake, collaborators) = ScriptedCollaborators::new().into_collaborators();
        let pipeline = Pipeline::new(config, collaborators, CancellationToken::new());
        let report = BatchReport::in_memory("Traditional Chinese", 0).shared();

        run_phase2(&pipeline, Vec::new(), 4, &report).await;
        assert!(report.lock().await.is_empty());
    }
}
