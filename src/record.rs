use crate::error::{ErrorKind, StageError};
use crate::paths::ArtifactPaths;
use crate::types::{
    Lyrics, PipelineState, SongIdentity, SongMetadata, SongStory, StageKind, StageOutcome,
    Transcript,
};
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Violations of the record lifecycle
#[derive(Debug, Error, PartialEq)]
pub enum RecordError {
    #[error("record for {0} was already finalized")]
    AlreadyFinalized(PathBuf),

    #[error("record for {path} already claimed by worker {worker}")]
    AlreadyClaimed { path: PathBuf, worker: usize },

    #[error("record for {0} is not finalized")]
    NotFinalized(PathBuf),

    #[error("duplicate record for {0}")]
    Duplicate(PathBuf),
}

/// Per-file state and stage outcomes.
///
/// Owned by exactly one driver at a time; frozen once finalized.
#[derive(Debug, Clone)]
pub struct FileRecord {
    pub input_path: PathBuf,
    pub paths: ArtifactPaths,
    /// Stages whose artifacts were valid on disk when the batch started
    pub satisfied: BTreeSet<StageKind>,
    /// Tag metadata from the metadata stage
    pub metadata: SongMetadata,
    /// Title/artist used for the lyrics search, from tags or identification
    pub identity: Option<SongIdentity>,
    pub vocals_path: Option<PathBuf>,
    pub transcript: Option<Transcript>,
    pub lyrics: Option<Lyrics>,
    pub lrc: Option<String>,
    pub corrected_lrc: Option<String>,
    pub story: Option<SongStory>,
    pub explanation: Option<String>,
    pub error_message: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    state: PipelineState,
    outcomes: BTreeMap<StageKind, StageOutcome>,
    phase2_worker: Option<usize>,
    finalized: bool,
}

impl FileRecord {
    pub fn new(input_path: PathBuf, paths: ArtifactPaths, satisfied: BTreeSet<StageKind>) -> Self {
        Self {
            input_path,
            paths,
            satisfied,
            metadata: SongMetadata::default(),
            identity: None,
            vocals_path: None,
            transcript: None,
            lyrics: None,
            lrc: None,
            corrected_lrc: None,
            story: None,
            explanation: None,
            error_message: None,
            started_at: None,
            finished_at: None,
            state: PipelineState::Pending,
            outcomes: BTreeMap::new(),
            phase2_worker: None,
            finalized: false,
        }
    }

    pub fn relative_path(&self) -> &Path {
        &self.paths.relative_path
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    pub fn outcome(&self, stage: StageKind) -> Option<&StageOutcome> {
        self.outcomes.get(&stage)
    }

    pub fn outcomes(&self) -> &BTreeMap<StageKind, StageOutcome> {
        &self.outcomes
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    pub fn phase2_worker(&self) -> Option<usize> {
        self.phase2_worker
    }

    fn guard(&self) {
        debug_assert!(
            !self.finalized,
            "record for {} mutated after finalization",
            self.input_path.display()
        );
    }

    /// Stamp the processing start time once
    pub fn begin(&mut self) {
        self.guard();
        if self.started_at.is_none() {
            self.started_at = Some(Utc::now());
        }
    }

    /// Take exclusive ownership for a second-phase worker
    pub fn claim(&mut self, worker: usize) -> Result<(), RecordError> {
        if let Some(existing) = self.phase2_worker {
            return Err(RecordError::AlreadyClaimed {
                path: self.input_path.clone(),
                worker: existing,
            });
        }
        self.phase2_worker = Some(worker);
        Ok(())
    }

    /// Record a completed (run or resumed) stage and move to its Done state
    pub fn complete(&mut self, stage: StageKind, outcome: StageOutcome) {
        self.guard();
        debug_assert_eq!(self.state.next_stage(), Some(stage));
        debug_assert!(outcome.is_satisfied());
        self.outcomes.insert(stage, outcome);
        self.state = PipelineState::after(stage);
    }

    /// Tags named the song, so identification does not apply
    pub fn skip_identification(&mut self) {
        self.guard();
        debug_assert_eq!(self.state, PipelineState::TranscriptionDone);
        self.outcomes
            .insert(StageKind::Identification, StageOutcome::NotApplicable);
        self.state = PipelineState::IdentificationSkipped;
    }

    /// Terminal failure of `stage`
    pub fn fail(&mut self, stage: StageKind, err: &StageError) {
        self.guard();
        self.outcomes.insert(stage, StageOutcome::failed(err));
        self.state = PipelineState::Failed {
            stage,
            kind: err.kind(),
        };
        self.error_message = Some(format!("{stage} failed: {err}"));
    }

    /// Lyrics did not match the transcript; terminal but not a crash
    pub fn reject_verification(&mut self, err: &StageError) {
        self.guard();
        debug_assert_eq!(self.state, PipelineState::SearchDone);
        self.outcomes
            .insert(StageKind::Verification, StageOutcome::failed(err));
        self.state = PipelineState::VerificationFailed;
        self.error_message = Some(format!("lyrics verification failed: {err}"));
    }

    /// Mark an unfinished record as interrupted at its next stage
    pub fn cancel(&mut self) {
        if let Some(stage) = self.state.next_stage() {
            self.fail(stage, &StageError::Cancelled);
        }
    }

    /// Every required stage succeeded or was resumed; identification may also be
    /// not applicable
    pub fn overall_success(&self) -> bool {
        self.state == PipelineState::TranslationDone
            && StageKind::ALL.iter().all(|stage| match self.outcomes.get(stage) {
                Some(outcome) if outcome.is_satisfied() => true,
                Some(StageOutcome::NotApplicable) => *stage == StageKind::Identification,
                _ => false,
            })
    }

    /// Every stage came from a previous run's artifacts
    pub fn fully_resumed(&self) -> bool {
        self.overall_success()
            && self.outcomes.values().all(|o| {
                matches!(o, StageOutcome::Skipped { .. } | StageOutcome::NotApplicable)
            })
    }

    pub fn failure_kind(&self) -> Option<ErrorKind> {
        match self.state {
            PipelineState::Failed { kind, .. } => Some(kind),
            PipelineState::VerificationFailed => Some(ErrorKind::ConfidenceRejected),
            _ => None,
        }
    }

    pub fn duration(&self) -> Option<chrono::Duration> {
        Some(self.finished_at? - self.started_at?)
    }

    /// Stamp the finish time and freeze the record
    pub fn finalize(&mut self) -> Result<(), RecordError> {
        if self.finalized {
            return Err(RecordError::AlreadyFinalized(self.input_path.clone()));
        }
        if !self.state.is_terminal() {
            self.cancel();
        }
        let now = Utc::now();
        self.started_at.get_or_insert(now);
        self.finished_at = Some(now);
        // Working data is not needed once the outcome is known
        self.transcript = None;
        self.lyrics = None;
        self.lrc = None;
        self.corrected_lrc = None;
        self.story = None;
        self.explanation = None;
        self.finalized = true;
        Ok(())
    }
}
