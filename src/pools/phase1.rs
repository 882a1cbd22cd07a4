use super::{drive_isolated, finalize_into, Phase};
use crate::memory::MemoryHandle;
use crate::pipeline::Pipeline;
use crate::record::FileRecord;
use crate::report::SharedReport;
use crate::types::PipelineState;
use tracing::{debug, info, warn};

/// Run metadata, separation and transcription one file at a time.
///
/// Files that fail or are interrupted go straight to the report. The rest
/// come back in discovery order, ready for the second phase.
pub async fn run_phase1(
    pipeline: &Pipeline,
    records: Vec<FileRecord>,
    report: &SharedReport,
    memory: MemoryHandle,
) -> Vec<FileRecord> {
    let total = records.len();
    let mut ready = Vec::with_capacity(total);

    for (index, mut record) in records.into_iter().enumerate() {
        let file = record.relative_path().display().to_string();

        if !pipeline.is_cancelled() && memory.is_paused() {
            info!(file = %file, "Waiting for memory to recover");
            tokio::select! {
                _ = memory.wait_if_paused() => {}
                _ = pipeline.cancelled() => {}
            }
        }

        if pipeline.is_cancelled() {
            debug!(file = %file, "Batch cancelled before model stages");
            record.cancel();
            finalize_into(report, record).await;
            continue;
        }

        info!(file = %file, index = index + 1, total, "Model stages");
        drive_isolated(pipeline, &mut record, Phase::One).await;

        if record.state() == PipelineState::TranscriptionDone {
            ready.push(record);
        } else {
            warn!(file = %file, state = ?record.state(), "Model stages did not finish");
            finalize_into(report, record).await;
        }
    }

    ready
}
