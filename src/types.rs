use crate::error::{ErrorKind, StageError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

/// A pipeline stage, in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    Metadata,
    Separation,
    Transcription,
    Identification,
    Search,
    Verification,
    Generation,
    TimestampCorrection,
    Story,
    Explanation,
    Translation,
}

impl StageKind {
    pub const ALL: [StageKind; 11] = [
        StageKind::Metadata,
        StageKind::Separation,
        StageKind::Transcription,
        StageKind::Identification,
        StageKind::Search,
        StageKind::Verification,
        StageKind::Generation,
        StageKind::TimestampCorrection,
        StageKind::Story,
        StageKind::Explanation,
        StageKind::Translation,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Metadata => "metadata",
            Self::Separation => "separation",
            Self::Transcription => "transcription",
            Self::Identification => "identification",
            Self::Search => "search",
            Self::Verification => "verification",
            Self::Generation => "generation",
            Self::TimestampCorrection => "timestamp_correction",
            Self::Story => "story",
            Self::Explanation => "explanation",
            Self::Translation => "translation",
        }
    }

    /// Error kind used when a call into this stage's collaborator times out
    pub fn timeout_kind(&self) -> ErrorKind {
        match self {
            Self::Metadata => ErrorKind::Io,
            Self::Separation | Self::Transcription => ErrorKind::Model,
            _ => ErrorKind::Api,
        }
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Free-form per-stage measurements that end up in the report
pub type StageMetrics = BTreeMap<&'static str, String>;

/// Outcome of one stage for one file
#[derive(Debug, Clone, PartialEq)]
pub enum StageOutcome {
    /// The stage ran and produced its artifact
    Success {
        artifact: PathBuf,
        metrics: StageMetrics,
    },
    /// A valid artifact from a previous run was reused
    Skipped { reason: String },
    /// The stage failed; terminal for the file
    Failed { kind: ErrorKind, message: String },
    /// The stage does not apply to this file
    NotApplicable,
}

impl StageOutcome {
    pub fn success(artifact: impl Into<PathBuf>, metrics: StageMetrics) -> Self {
        Self::Success {
            artifact: artifact.into(),
            metrics,
        }
    }

    pub fn failed(err: &StageError) -> Self {
        Self::Failed {
            kind: err.kind(),
            message: err.to_string(),
        }
    }

    /// Success or resumed skip
    pub fn is_satisfied(&self) -> bool {
        matches!(self, Self::Success { .. } | Self::Skipped { .. })
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Success { .. } => "Success",
            Self::Skipped { .. } => "Skipped",
            Self::Failed { .. } => "Failed",
            Self::NotApplicable => "NotApplicable",
        }
    }

    /// Compact detail string for the report
    pub fn detail(&self) -> String {
        match self {
            Self::Success { metrics, .. } => metrics
                .iter()
                .map(|(k, v)| format!("{k}={v}"))
                .collect::<Vec<_>>()
                .join(";"),
            Self::Skipped { reason } => reason.clone(),
            Self::Failed { kind, message } => format!("{kind}: {message}"),
            Self::NotApplicable => String::new(),
        }
    }
}

/// Per-file pipeline state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Pending,
    MetadataDone,
    SeparationDone,
    TranscriptionDone,
    /// Tags already named the song; identification was not needed
    IdentificationSkipped,
    IdentificationDone,
    SearchDone,
    VerificationPassed,
    /// Lyrics did not match the transcript; terminal
    VerificationFailed,
    GenerationDone,
    TimestampsCorrected,
    StoryDone,
    ExplanationDone,
    /// Terminal success
    TranslationDone,
    Failed {
        stage: StageKind,
        kind: ErrorKind,
    },
}

impl PipelineState {
    /// The stage allowed to execute from this state
    pub fn next_stage(&self) -> Option<StageKind> {
        match self {
            Self::Pending => Some(StageKind::Metadata),
            Self::MetadataDone => Some(StageKind::Separation),
            Self::SeparationDone => Some(StageKind::Transcription),
            Self::TranscriptionDone => Some(StageKind::Identification),
            Self::IdentificationSkipped | Self::IdentificationDone => Some(StageKind::Search),
            Self::SearchDone => Some(StageKind::Verification),
            Self::VerificationPassed => Some(StageKind::Generation),
            Self::GenerationDone => Some(StageKind::TimestampCorrection),
            Self::TimestampsCorrected => Some(StageKind::Story),
            Self::StoryDone => Some(StageKind::Explanation),
            Self::ExplanationDone => Some(StageKind::Translation),
            Self::VerificationFailed | Self::TranslationDone | Self::Failed { .. } => None,
        }
    }

    /// The state reached once `stage` is done
    pub fn after(stage: StageKind) -> Self {
        match stage {
            StageKind::Metadata => Self::MetadataDone,
            StageKind::Separation => Self::SeparationDone,
            StageKind::Transcription => Self::TranscriptionDone,
            StageKind::Identification => Self::IdentificationDone,
            StageKind::Search => Self::SearchDone,
            StageKind::Verification => Self::VerificationPassed,
            StageKind::Generation => Self::GenerationDone,
            StageKind::TimestampCorrection => Self::TimestampsCorrected,
            StageKind::Story => Self::StoryDone,
            StageKind::Explanation => Self::ExplanationDone,
            StageKind::Translation => Self::TranslationDone,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.next_stage().is_none()
    }
}

/// A [0, 1] judgement attached to identification and verification outcomes
#[derive(Debug, Clone, PartialEq)]
pub struct ConfidenceScore {
    value: f64,
    pub reasoning: String,
    pub attempt: u32,
}

impl ConfidenceScore {
    /// Rejects scores outside [0, 1] (including NaN) as malformed collaborator output
    pub fn new(value: f64, reasoning: impl Into<String>, attempt: u32) -> Result<Self, StageError> {
        if !(0.0..=1.0).contains(&value) {
            return Err(StageError::Format(format!(
                "confidence score {value} outside [0, 1]"
            )));
        }
        Ok(Self {
            value,
            reasoning: reasoning.into(),
            attempt,
        })
    }

    pub fn value(&self) -> f64 {
        self.value
    }
}

/// Tag metadata read from the audio file
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SongMetadata {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub artist: Option<String>,
    #[serde(default)]
    pub album: Option<String>,
    #[serde(default)]
    pub genre: Option<String>,
    #[serde(default)]
    pub year: Option<u32>,
    #[serde(default)]
    pub track_number: Option<u32>,
}

impl SongMetadata {
    /// Title and artist as a searchable identity, if both tags are usable
    pub fn identity(&self) -> Option<SongIdentity> {
        let title = non_blank(self.title.as_deref())?;
        let artist = non_blank(self.artist.as_deref())?;
        Some(SongIdentity {
            title: title.to_string(),
            artist: artist.to_string(),
            language: None,
        })
    }
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

/// The resolved title/artist used for the lyrics search
#[derive(Debug, Clone, PartialEq)]
pub struct SongIdentity {
    pub title: String,
    pub artist: String,
    pub language: Option<String>,
}

/// One timestamped ASR segment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptSegment {
    pub start: f64,
    pub end: f64,
    pub text: String,
}

/// Ordered ASR output for one file
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Transcript {
    pub segments: Vec<TranscriptSegment>,
}

impl Transcript {
    pub fn new(segments: Vec<TranscriptSegment>) -> Self {
        Self { segments }
    }

    pub fn is_empty(&self) -> bool {
        self.segments.iter().all(|s| s.text.trim().is_empty())
    }

    /// Text without timestamps, one segment per line
    pub fn plain_text(&self) -> String {
        self.segments
            .iter()
            .map(|s| s.text.trim())
            .filter(|t| !t.is_empty())
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn duration_secs(&self) -> f64 {
        self.segments.last().map(|s| s.end).unwrap_or(0.0)
    }
}

/// Answer from the song identifier
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Identification {
    pub title: String,
    pub artist: String,
    #[serde(default)]
    pub language: Option<String>,
    pub confidence: f64,
    #[serde(default)]
    pub reasoning: String,
    #[serde(default)]
    pub queries_used: Vec<String>,
}

/// What earlier identification attempts tried, fed into the next attempt
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct IdentificationFeedback {
    pub attempts: Vec<PriorAttempt>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PriorAttempt {
    pub attempt: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artist: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    pub reasoning: String,
    pub queries_used: Vec<String>,
}

impl IdentificationFeedback {
    pub fn is_empty(&self) -> bool {
        self.attempts.is_empty()
    }

    /// All search queries tried so far
    pub fn queries(&self) -> Vec<String> {
        self.attempts
            .iter()
            .flat_map(|a| a.queries_used.iter().cloned())
            .collect()
    }
}

/// Answer from the lyrics verifier
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Verification {
    #[serde(rename = "match")]
    pub is_match: bool,
    pub confidence: f64,
    #[serde(default)]
    pub reasoning: String,
}

/// Lyrics returned by the searcher
#[derive(Debug, Clone, PartialEq)]
pub struct Lyrics {
    pub text: String,
    pub source: String,
}

/// Background of a song: how it was made and what it was written for
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SongStory {
    pub song_title: String,
    pub artist_name: String,
    #[serde(default)]
    pub native_language: String,
    /// What the song was written for (`anime`, `movie`, ...), empty if nothing
    #[serde(default)]
    pub story_type: String,
    pub creation_story: String,
    #[serde(default)]
    pub background_story: Option<String>,
    #[serde(default)]
    pub search_queries_used: Vec<String>,
    #[serde(default)]
    pub sources_used: Vec<String>,
    #[serde(default)]
    pub reasoning: String,
}

impl SongStory {
    /// Story text handed to the explainer
    pub fn summary(&self) -> String {
        let mut out = format!(
            "{} by {}\n{}",
            self.song_title,
            self.artist_name,
            self.creation_story.trim()
        );
        if !self.story_type.trim().is_empty() {
            out.push_str(&format!("\nWritten for: {}", self.story_type.trim()));
        }
        if let Some(background) = self
            .background_story
            .as_deref()
            .map(str::trim)
            .filter(|b| !b.is_empty())
        {
            out.push_str(&format!("\n{background}"));
        }
        out
    }
}

/// Output from running a subprocess
#[derive(Debug, Clone)]
pub struct ProcessOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}
