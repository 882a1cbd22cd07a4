mod phase1;
mod phase2;

pub use phase1::run_phase1;
pub use phase2::run_phase2;

use crate::pipeline::Pipeline;
use crate::record::FileRecord;
use crate::report::SharedReport;
use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy)]
enum Phase {
    One,
    Two,
}

/// Run one phase on `record`, turning a panic into a failure of the stage
/// that was running
async fn drive_isolated(pipeline: &Pipeline, record: &mut FileRecord, phase: Phase) {
    let result = match phase {
        Phase::One => AssertUnwindSafe(pipeline.run_phase1(record)).catch_unwind().await,
        Phase::Two => AssertUnwindSafe(pipeline.run_phase2(record)).catch_unwind().await,
    };
    if let Err(payload) = result {
        let message = panic_message(payload.as_ref());
        error!(
            file = %record.relative_path().display(),
            phase = ?phase,
            panic = %message,
            "Stage panicked"
        );
        pipeline.record_panic(record, &message);
    }
}

/// Freeze the record and hand it to the report
pub async fn finalize_into(report: &SharedReport, mut record: FileRecord) {
    let file = record.relative_path().display().to_string();
    if let Err(e) = record.finalize() {
        error!(file = %file, error = %e, "Record finalized twice");
        return;
    }

    if record.overall_success() {
        info!(file = %file, "File complete");
    } else {
        warn!(
            file = %file,
            error = record.error_message.as_deref().unwrap_or("unknown"),
            "File failed"
        );
    }

    if let Err(e) = report.lock().await.push(record) {
        error!(file = %file, error = %e, "Failed to add record to report");
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
