//! Drives one file through the ordered stages.
//!
//! Each stage either restores its artifact from a previous run (recorded as
//! `Skipped`) or calls its collaborator under a timeout, writes the artifact
//! atomically and records `Success`. Any failure is terminal for the file.

use crate::checkpoint::{self, IdentificationRecord, VerificationRecord};
use crate::collaborators::Collaborators;
use crate::config::Config;
use crate::error::{ErrorKind, StageError};
use crate::gate::{ConfidenceGate, GateDecision, GatedStage};
use crate::lrc;
use crate::record::FileRecord;
use crate::types::{
    ConfidenceScore, Identification, IdentificationFeedback, PriorAttempt, SongIdentity,
    StageKind, StageMetrics, StageOutcome,
};
use std::collections::HashSet;
use std::fs;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const PHASE1_STAGES: [StageKind; 3] = [
    StageKind::Metadata,
    StageKind::Separation,
    StageKind::Transcription,
];

pub const PHASE2_STAGES: [StageKind; 8] = [
    StageKind::Identification,
    StageKind::Search,
    StageKind::Verification,
    StageKind::Generation,
    StageKind::TimestampCorrection,
    StageKind::Story,
    StageKind::Explanation,
    StageKind::Translation,
];

/// Shared, read-only machinery for driving files through their stages.
/// Cloning is cheap; each clone drives whichever record it is handed.
#[derive(Clone)]
pub struct Pipeline {
    config: Arc<Config>,
    gate: ConfidenceGate,
    collaborators: Collaborators,
    cancel: CancellationToken,
    /// Cancelled on a hard abort; drops in-flight collaborator calls
    abort: CancellationToken,
}

impl Pipeline {
    pub fn new(config: Arc<Config>, collaborators: Collaborators, cancel: CancellationToken) -> Self {
        let gate = ConfidenceGate::new(&config.gate);
        Self {
            config,
            gate,
            collaborators,
            cancel,
            abort: CancellationToken::new(),
        }
    }

    pub fn with_abort(mut self, abort: CancellationToken) -> Self {
        self.abort = abort;
        self
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled() || self.abort.is_cancelled()
    }

    /// Resolves once the batch is cancelled
    pub async fn cancelled(&self) {
        tokio::select! {
            _ = self.cancel.cancelled() => {}
            _ = self.abort.cancelled() => {}
        }
    }

    /// Metadata, separation and transcription
    pub async fn run_phase1(&self, record: &mut FileRecord) {
        record.begin();
        self.run_stages(record, &PHASE1_STAGES).await;
    }

    /// Identification through translation, for a record that finished phase 1
    pub async fn run_phase2(&self, record: &mut FileRecord) {
        record.begin();
        if let Err(e) = check_phase_boundary(record) {
            record.fail(StageKind::Identification, &e);
            return;
        }
        self.run_stages(record, &PHASE2_STAGES).await;
    }

    /// Record a panic that escaped the stage currently running
    pub fn record_panic(&self, record: &mut FileRecord, message: &str) {
        if let Some(stage) = record.state().next_stage() {
            record.fail(stage, &stage_failure(stage, format!("stage panicked: {message}")));
        }
    }

    async fn run_stages(&self, record: &mut FileRecord, stages: &[StageKind]) {
        for &stage in stages {
            if record.state().next_stage() != Some(stage) {
                break;
            }
            if self.is_cancelled() {
                record.fail(stage, &StageError::Cancelled);
                break;
            }
            self.run_stage(record, stage).await;
        }
    }

    async fn run_stage(&self, record: &mut FileRecord, stage: StageKind) {
        let file = record.relative_path().display().to_string();

        if stage == StageKind::Identification && record.identity.is_some() {
            debug!(file = %file, "Tags name the song, identification not needed");
            record.skip_identification();
            return;
        }

        if record.satisfied.contains(&stage) {
            match self.restore(record, stage) {
                Ok(()) => {
                    let artifact = record.paths.artifact(stage).display().to_string();
                    debug!(file = %file, stage = %stage, "Stage satisfied by checkpoint, skipping");
                    record.complete(
                        stage,
                        StageOutcome::Skipped {
                            reason: format!("resumed from {artifact}"),
                        },
                    );
                    return;
                }
                Err(e) => {
                    warn!(file = %file, stage = %stage, error = %e, "Checkpoint unreadable, recomputing");
                }
            }
        }

        let started = Instant::now();
        debug!(file = %file, stage = %stage, "Running stage");
        match self.execute(record, stage).await {
            Ok(mut metrics) => {
                metrics.insert("elapsed_ms", started.elapsed().as_millis().to_string());
                let artifact = record.paths.artifact(stage).to_path_buf();
                record.complete(stage, StageOutcome::success(artifact, metrics));
            }
            Err(e)
                if stage == StageKind::Verification
                    && e.kind() == ErrorKind::ConfidenceRejected =>
            {
                warn!(file = %file, error = %e, "Lyrics verification failed");
                record.reject_verification(&e);
            }
            Err(e) => {
                warn!(file = %file, stage = %stage, kind = %e.kind(), error = %e, "Stage failed");
                record.fail(stage, &e);
            }
        }
    }

    /// Load a satisfied stage's artifact into the record's working data
    fn restore(&self, record: &mut FileRecord, stage: StageKind) -> Result<(), StageError> {
        let paths = &record.paths;
        match stage {
            StageKind::Metadata => {
                let metadata = checkpoint::load_metadata(&paths.metadata_json)?;
                record.identity = metadata.identity();
                record.metadata = metadata;
            }
            StageKind::Separation => {
                checkpoint::validate_wav(&paths.vocals_wav)?;
                record.vocals_path = Some(paths.vocals_wav.clone());
            }
            StageKind::Transcription => {
                record.transcript = Some(checkpoint::load_transcript(&paths.transcript_txt)?);
            }
            StageKind::Identification => {
                let saved = checkpoint::load_identification(&paths.identification_json)?;
                record.identity = Some(SongIdentity {
                    title: saved.title,
                    artist: saved.artist,
                    language: saved.language,
                });
            }
            StageKind::Search => {
                record.lyrics = Some(checkpoint::load_lyrics(&paths.lyrics_txt)?);
            }
            StageKind::Verification => {
                let saved = checkpoint::load_verification(&paths.verification_json)?;
                if !saved.is_match || saved.confidence < self.gate.verification_threshold() {
                    return Err(StageError::Format(format!(
                        "{} does not record a passed verification",
                        paths.verification_json.display()
                    )));
                }
            }
            StageKind::Generation => {
                record.lrc = Some(checkpoint::load_lrc(&paths.lrc)?);
            }
            StageKind::TimestampCorrection => {
                record.corrected_lrc = Some(checkpoint::load_lrc(&paths.corrected_lrc)?);
            }
            StageKind::Story => {
                record.story = Some(checkpoint::load_story(&paths.song_story_json)?);
            }
            StageKind::Explanation => {
                record.explanation = Some(checkpoint::load_explanation(&paths.explanation_txt)?);
            }
            StageKind::Translation => {
                checkpoint::load_lrc(&paths.output_lrc)?;
            }
        }
        Ok(())
    }

    /// Await a collaborator call under the stage's timeout. An abort drops
    /// the call, which kills any child process it spawned.
    async fn call<T>(
        &self,
        stage: StageKind,
        fut: impl Future<Output = Result<T, StageError>>,
    ) -> Result<T, StageError> {
        let limit = self.config.timeouts.for_stage(stage);
        tokio::select! {
            biased;
            _ = self.abort.cancelled() => Err(StageError::Cancelled),
            result = tokio::time::timeout(limit, fut) => match result {
                Ok(result) => result,
                Err(_) => Err(stage_failure(
                    stage,
                    format!("{stage} timed out after {}s", limit.as_secs()),
                )),
            },
        }
    }

    async fn execute(&self, record: &mut FileRecord, stage: StageKind) -> Result<StageMetrics, StageError> {
        match stage {
            StageKind::Metadata => self.extract_metadata(record).await,
            StageKind::Separation => self.separate(record).await,
            StageKind::Transcription => self.transcribe(record).await,
            StageKind::Identification => self.identify(record).await,
            StageKind::Search => self.search(record).await,
            StageKind::Verification => self.verify(record).await,
            StageKind::Generation => self.generate(record).await,
            StageKind::TimestampCorrection => self.correct_timestamps(record).await,
            StageKind::Story => self.tell_story(record).await,
            StageKind::Explanation => self.explain(record).await,
            StageKind::Translation => self.translate(record).await,
        }
    }

    async fn extract_metadata(&self, record: &mut FileRecord) -> Result<StageMetrics, StageError> {
        let metadata = self
            .call(
                StageKind::Metadata,
                self.collaborators.metadata.extract(&record.input_path),
            )
            .await?;
        checkpoint::write_json_atomic(&record.paths.metadata_json, &metadata)?;

        let mut metrics = StageMetrics::new();
        metrics.insert("tagged", metadata.identity().is_some().to_string());
        record.identity = metadata.identity();
        record.metadata = metadata;
        Ok(metrics)
    }

    async fn separate(&self, record: &mut FileRecord) -> Result<StageMetrics, StageError> {
        let staging = record.paths.separation_staging_dir();
        if staging.exists() {
            fs::remove_dir_all(&staging).map_err(|e| {
                StageError::io(format!("Failed to clear {}", staging.display()), e)
            })?;
        }
        fs::create_dir_all(&staging)
            .map_err(|e| StageError::io(format!("Failed to create {}", staging.display()), e))?;

        let produced = self
            .call(
                StageKind::Separation,
                self.collaborators
                    .separator
                    .separate(&record.input_path, &staging),
            )
            .await?;
        checkpoint::validate_wav(&produced)
            .map_err(|e| StageError::Model(format!("separator output unusable: {e}")))?;
        checkpoint::move_into_place(&produced, &record.paths.vocals_wav)?;
        if let Err(e) = fs::remove_dir_all(&staging) {
            debug!(dir = %staging.display(), error = %e, "Could not remove separation staging directory");
        }

        let mut metrics = StageMetrics::new();
        if let Ok(meta) = fs::metadata(&record.paths.vocals_wav) {
            metrics.insert("bytes", meta.len().to_string());
        }
        record.vocals_path = Some(record.paths.vocals_wav.clone());
        Ok(metrics)
    }

    async fn transcribe(&self, record: &mut FileRecord) -> Result<StageMetrics, StageError> {
        let vocals: PathBuf = record
            .vocals_path
            .clone()
            .unwrap_or_else(|| record.paths.vocals_wav.clone());
        let transcript = self
            .call(
                StageKind::Transcription,
                self.collaborators.transcriber.transcribe(&vocals),
            )
            .await?;
        if transcript.is_empty() {
            return Err(StageError::Model("transcriber returned no text".to_string()));
        }
        let rendered = lrc::render_transcript(&transcript);
        checkpoint::write_atomic(&record.paths.transcript_txt, rendered.as_bytes())?;

        // Continue from the saved form so a resumed run sees identical data
        let transcript = lrc::parse_transcript(&rendered);
        if transcript.is_empty() {
            return Err(StageError::Model(
                "transcriber returned no usable segments".to_string(),
            ));
        }
        let mut metrics = StageMetrics::new();
        metrics.insert("segments", transcript.segments.len().to_string());
        metrics.insert("duration_s", format!("{:.1}", transcript.duration_secs()));
        record.transcript = Some(transcript);
        Ok(metrics)
    }

    /// Bounded retry loop; each attempt is seeded with what earlier ones tried
    async fn identify(&self, record: &mut FileRecord) -> Result<StageMetrics, StageError> {
        let file = record.relative_path().display().to_string();
        let transcript = record
            .transcript
            .as_ref()
            .ok_or_else(|| missing("transcript", StageKind::Identification))?;
        let max_attempts = self.gate.max_identification_attempts();
        let mut feedback = IdentificationFeedback::default();

        for attempt in 1..=max_attempts {
            if self.is_cancelled() {
                return Err(StageError::Cancelled);
            }
            let answer = self
                .call(
                    StageKind::Identification,
                    self.collaborators
                        .identifier
                        .identify(transcript, &record.metadata, &feedback),
                )
                .await
                .and_then(|answer| scored(answer, attempt));

            let (answer, score) = match answer {
                Ok(scored) => scored,
                Err(e) if is_retryable(&e) && attempt < max_attempts => {
                    warn!(file = %file, attempt, error = %e, "Identification attempt failed, retrying");
                    feedback.attempts.push(PriorAttempt {
                        attempt,
                        title: None,
                        artist: None,
                        confidence: None,
                        reasoning: format!("attempt failed: {e}"),
                        queries_used: Vec::new(),
                    });
                    continue;
                }
                Err(e) => return Err(e),
            };

            match self.gate.evaluate(&score, GatedStage::Identification, attempt) {
                GateDecision::Accept => {
                    info!(
                        file = %file,
                        attempt,
                        confidence = score.value(),
                        title = %answer.title,
                        artist = %answer.artist,
                        "Song identified"
                    );
                    let saved = IdentificationRecord {
                        title: answer.title.trim().to_string(),
                        artist: answer.artist.trim().to_string(),
                        language: answer.language.clone(),
                        confidence: score.value(),
                        queries: feedback
                            .queries()
                            .into_iter()
                            .chain(answer.queries_used.iter().cloned())
                            .collect(),
                        reasoning: answer.reasoning.clone(),
                        attempt,
                        total_attempts: max_attempts,
                    };
                    checkpoint::write_json_atomic(&record.paths.identification_json, &saved)?;

                    let mut metrics = StageMetrics::new();
                    metrics.insert("attempt", attempt.to_string());
                    metrics.insert("confidence", format!("{:.2}", score.value()));
                    record.identity = Some(SongIdentity {
                        title: saved.title,
                        artist: saved.artist,
                        language: saved.language,
                    });
                    return Ok(metrics);
                }
                GateDecision::RetryWithFeedback(reason) => {
                    debug!(file = %file, attempt, reason = %reason, "Retrying identification with feedback");
                    feedback.attempts.push(PriorAttempt {
                        attempt,
                        title: Some(answer.title),
                        artist: Some(answer.artist),
                        confidence: Some(score.value()),
                        reasoning: reason,
                        queries_used: answer.queries_used,
                    });
                }
                GateDecision::Reject(reason) => {
                    return Err(StageError::ConfidenceRejected {
                        score: score.value(),
                        reason,
                    });
                }
            }
        }

        Err(StageError::ConfidenceRejected {
            score: 0.0,
            reason: "no identification attempts allowed".to_string(),
        })
    }

    async fn search(&self, record: &mut FileRecord) -> Result<StageMetrics, StageError> {
        let identity = record
            .identity
            .clone()
            .ok_or_else(|| missing("song identity", StageKind::Search))?;
        let lyrics = self
            .call(
                StageKind::Search,
                self.collaborators
                    .searcher
                    .search(&identity.title, &identity.artist),
            )
            .await?;
        if lyrics.text.trim().is_empty() {
            return Err(StageError::NotFound(format!(
                "empty lyrics for '{}' by {}",
                identity.title, identity.artist
            )));
        }
        checkpoint::write_atomic(
            &record.paths.lyrics_txt,
            lrc::render_lyrics_file(&identity, &lyrics).as_bytes(),
        )?;

        let mut metrics = StageMetrics::new();
        metrics.insert("lines", lyrics.text.lines().count().to_string());
        metrics.insert("source", lyrics.source.clone());
        record.lyrics = Some(lyrics);
        Ok(metrics)
    }

    /// Single gated check; a mismatch or low score is terminal for the file
    async fn verify(&self, record: &mut FileRecord) -> Result<StageMetrics, StageError> {
        let lyrics = record
            .lyrics
            .as_ref()
            .ok_or_else(|| missing("lyrics", StageKind::Verification))?;
        let transcript = record
            .transcript
            .as_ref()
            .ok_or_else(|| missing("transcript", StageKind::Verification))?;
        let verdict = self
            .call(
                StageKind::Verification,
                self.collaborators.verifier.verify(&lyrics.text, transcript),
            )
            .await?;
        let score = ConfidenceScore::new(verdict.confidence, verdict.reasoning.clone(), 1)?;

        if !verdict.is_match {
            return Err(StageError::ConfidenceRejected {
                score: score.value(),
                reason: format!("lyrics do not match the transcript ({})", verdict.reasoning),
            });
        }
        match self.gate.evaluate(&score, GatedStage::Verification, 1) {
            GateDecision::Accept => {}
            GateDecision::Reject(reason) | GateDecision::RetryWithFeedback(reason) => {
                return Err(StageError::ConfidenceRejected {
                    score: score.value(),
                    reason,
                });
            }
        }

        checkpoint::write_json_atomic(
            &record.paths.verification_json,
            &VerificationRecord {
                is_match: verdict.is_match,
                confidence: score.value(),
                reasoning: verdict.reasoning,
            },
        )?;
        let mut metrics = StageMetrics::new();
        metrics.insert("confidence", format!("{:.2}", score.value()));
        Ok(metrics)
    }

    async fn generate(&self, record: &mut FileRecord) -> Result<StageMetrics, StageError> {
        let lyrics = record
            .lyrics
            .as_ref()
            .ok_or_else(|| missing("lyrics", StageKind::Generation))?;
        let transcript = record
            .transcript
            .as_ref()
            .ok_or_else(|| missing("transcript", StageKind::Generation))?;
        let generated = self
            .call(
                StageKind::Generation,
                self.collaborators.generator.generate(&lyrics.text, transcript),
            )
            .await?;
        if !lrc::has_timestamps(&generated) {
            return Err(StageError::Format(
                "generated LRC has no timestamps".to_string(),
            ));
        }

        let content = match &record.identity {
            Some(identity) => {
                lrc::with_metadata_tags(&generated, identity, record.metadata.album.as_deref())
            }
            None => generated,
        };
        checkpoint::write_atomic(&record.paths.lrc, content.as_bytes())?;

        let mut metrics = StageMetrics::new();
        metrics.insert("lines", lrc::timed_line_count(&content).to_string());
        record.lrc = Some(content);
        Ok(metrics)
    }

    /// Realign the generated LRC's timestamps against the transcript
    async fn correct_timestamps(&self, record: &mut FileRecord) -> Result<StageMetrics, StageError> {
        let source = record
            .lrc
            .as_ref()
            .ok_or_else(|| missing("LRC", StageKind::TimestampCorrection))?;
        let transcript = record
            .transcript
            .as_ref()
            .ok_or_else(|| missing("transcript", StageKind::TimestampCorrection))?;
        let corrected = self
            .call(
                StageKind::TimestampCorrection,
                self.collaborators.corrector.correct(source, transcript),
            )
            .await?;
        if !lrc::has_timestamps(&corrected) {
            return Err(StageError::Format(
                "corrected LRC has no timestamps".to_string(),
            ));
        }

        let content = match &record.identity {
            Some(identity) => {
                lrc::with_metadata_tags(&corrected, identity, record.metadata.album.as_deref())
            }
            None => corrected,
        };
        checkpoint::write_atomic(&record.paths.corrected_lrc, content.as_bytes())?;

        let before: HashSet<&str> = source.lines().map(str::trim).collect();
        let after: HashSet<&str> = content.lines().map(str::trim).collect();
        let mut metrics = StageMetrics::new();
        metrics.insert("lines", lrc::timed_line_count(&content).to_string());
        metrics.insert(
            "changed_lines",
            before.symmetric_difference(&after).count().to_string(),
        );
        record.corrected_lrc = Some(content);
        Ok(metrics)
    }

    async fn tell_story(&self, record: &mut FileRecord) -> Result<StageMetrics, StageError> {
        let identity = record
            .identity
            .clone()
            .ok_or_else(|| missing("song identity", StageKind::Story))?;
        let story = self
            .call(
                StageKind::Story,
                self.collaborators.storyteller.story(&identity),
            )
            .await?;
        if story.creation_story.trim().is_empty() {
            return Err(StageError::Format(format!(
                "no creation story for '{}' by {}",
                identity.title, identity.artist
            )));
        }
        checkpoint::write_json_atomic(&record.paths.song_story_json, &story)?;

        let mut metrics = StageMetrics::new();
        if !story.story_type.trim().is_empty() {
            metrics.insert("story_type", story.story_type.trim().to_string());
        }
        metrics.insert("sources", story.sources_used.len().to_string());
        record.story = Some(story);
        Ok(metrics)
    }

    /// Explain the lyrics in the target language, given the song's story
    async fn explain(&self, record: &mut FileRecord) -> Result<StageMetrics, StageError> {
        let source = record
            .corrected_lrc
            .as_ref()
            .ok_or_else(|| missing("corrected LRC", StageKind::Explanation))?;
        let story = record
            .story
            .as_ref()
            .ok_or_else(|| missing("song story", StageKind::Explanation))?;
        let lyrics = lrc::lyric_text(source);
        if lyrics.is_empty() {
            return Err(missing("lyric text", StageKind::Explanation));
        }
        let explanation = self
            .call(
                StageKind::Explanation,
                self.collaborators
                    .explainer
                    .explain(&lyrics, story, &self.config.target_language),
            )
            .await?;
        let explanation = explanation.trim().to_string();
        if explanation.is_empty() {
            return Err(StageError::Format("explanation is empty".to_string()));
        }
        checkpoint::write_atomic(&record.paths.explanation_txt, explanation.as_bytes())?;

        let mut metrics = StageMetrics::new();
        metrics.insert("chars", explanation.chars().count().to_string());
        metrics.insert("language", self.config.target_language.clone());
        record.explanation = Some(explanation);
        Ok(metrics)
    }

    async fn translate(&self, record: &mut FileRecord) -> Result<StageMetrics, StageError> {
        let source = record
            .corrected_lrc
            .as_ref()
            .ok_or_else(|| missing("corrected LRC", StageKind::Translation))?;
        let explanation = record
            .explanation
            .as_deref()
            .ok_or_else(|| missing("explanation", StageKind::Translation))?;
        let bilingual = self
            .call(
                StageKind::Translation,
                self.collaborators.translator.translate(
                    source,
                    &self.config.target_language,
                    explanation,
                ),
            )
            .await?;
        if !lrc::has_timestamps(&bilingual) {
            return Err(StageError::Format(
                "translated LRC has no timestamps".to_string(),
            ));
        }
        checkpoint::write_atomic(&record.paths.output_lrc, bilingual.as_bytes())?;

        let mut metrics = StageMetrics::new();
        metrics.insert("lines", lrc::timed_line_count(&bilingual).to_string());
        metrics.insert("language", self.config.target_language.clone());
        Ok(metrics)
    }
}

/// A phase 2 record must have finished phase 1 with a usable transcript
fn check_phase_boundary(record: &FileRecord) -> Result<(), StageError> {
    if record.state().next_stage() != Some(StageKind::Identification) {
        return Err(StageError::Format(format!(
            "{} entered phase 2 in state {:?}",
            record.relative_path().display(),
            record.state()
        )));
    }
    match &record.transcript {
        Some(t) if !t.is_empty() => Ok(()),
        _ => Err(missing("transcript", StageKind::Identification)),
    }
}

fn scored(answer: Identification, attempt: u32) -> Result<(Identification, ConfidenceScore), StageError> {
    let score = ConfidenceScore::new(answer.confidence, answer.reasoning.clone(), attempt)?;
    if answer.title.trim().is_empty() || answer.artist.trim().is_empty() {
        return Err(StageError::Format(
            "identification answer is missing title or artist".to_string(),
        ));
    }
    Ok((answer, score))
}

/// Identification retries transient API errors and malformed answers
fn is_retryable(err: &StageError) -> bool {
    matches!(err.kind(), ErrorKind::Api | ErrorKind::Format)
}

fn missing(what: &str, stage: StageKind) -> StageError {
    StageError::Format(format!("{what} missing before {stage}"))
}

/// Failure of the given stage's kind (timeouts, panics)
fn stage_failure(stage: StageKind, message: String) -> StageError {
    match stage.timeout_kind() {
        ErrorKind::Io => StageError::io(
            message,
            std::io::Error::new(std::io::ErrorKind::TimedOut, "stage did not complete"),
        ),
        ErrorKind::Model => StageError::Model(message),
        _ => StageError::Api(message),
    }
}
