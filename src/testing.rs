//! Fixtures and scripted collaborators shared by unit tests.

use crate::checkpoint::{write_atomic, write_json_atomic, IdentificationRecord, VerificationRecord};
use crate::collaborators::{
    Collaborators, Explainer, Identifier, LrcGenerator, LyricsSearcher, MetadataExtractor,
    Separator, StoryTeller, TimestampCorrector, Transcriber, Translator, Verifier,
};
use crate::config::Config;
use crate::error::{ErrorKind, StageError};
use crate::lrc;
use crate::paths::ArtifactPaths;
use crate::types::{
    Identification, IdentificationFeedback, Lyrics, SongIdentity, SongMetadata, SongStory,
    StageKind, Transcript, TranscriptSegment, Verification,
};
use async_trait::async_trait;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Smallest valid PCM WAV: a 44-byte header plus two silent samples
pub fn wav_bytes() -> Vec<u8> {
    let data_len: u32 = 4;
    let mut bytes = Vec::with_capacity(48);
    bytes.extend_from_slice(b"RIFF");
    bytes.extend_from_slice(&(36 + data_len).to_le_bytes());
    bytes.extend_from_slice(b"WAVEfmt ");
    bytes.extend_from_slice(&16u32.to_le_bytes());
    bytes.extend_from_slice(&1u16.to_le_bytes()); // PCM
    bytes.extend_from_slice(&1u16.to_le_bytes()); // mono
    bytes.extend_from_slice(&16_000u32.to_le_bytes());
    bytes.extend_from_slice(&32_000u32.to_le_bytes());
    bytes.extend_from_slice(&2u16.to_le_bytes());
    bytes.extend_from_slice(&16u16.to_le_bytes());
    bytes.extend_from_slice(b"data");
    bytes.extend_from_slice(&data_len.to_le_bytes());
    bytes.extend_from_slice(&[0u8; 4]);
    bytes
}

/// Valid artifacts for every stage, as a completed earlier run leaves them
pub fn write_complete_artifacts(paths: &ArtifactPaths) {
    let identity = SongIdentity {
        title: "Gurenge".into(),
        artist: "LiSA".into(),
        language: Some("Japanese".into()),
    };
    write_json_atomic(
        &paths.metadata_json,
        &SongMetadata {
            title: Some("Gurenge".into()),
            artist: Some("LiSA".into()),
            ..Default::default()
        },
    )
    .unwrap();
    fs::write(&paths.vocals_wav, wav_bytes()).unwrap();
    write_atomic(
        &paths.transcript_txt,
        lrc::render_transcript(&transcript_for("gurenge")).as_bytes(),
    )
    .unwrap();
    write_json_atomic(
        &paths.identification_json,
        &IdentificationRecord {
            title: identity.title.clone(),
            artist: identity.artist.clone(),
            language: identity.language.clone(),
            confidence: 0.9,
            queries: vec!["gurenge lyrics".into()],
            reasoning: "chorus".into(),
            attempt: 1,
            total_attempts: 1,
        },
    )
    .unwrap();
    write_atomic(
        &paths.lyrics_txt,
        lrc::render_lyrics_file(
            &identity,
            &Lyrics {
                text: "Tsuyoku nareru riyuu wo shitta".into(),
                source: "fixture".into(),
            },
        )
        .as_bytes(),
    )
    .unwrap();
    write_json_atomic(
        &paths.verification_json,
        &VerificationRecord {
            is_match: true,
            confidence: 0.85,
            reasoning: "same song".into(),
        },
    )
    .unwrap();
    write_atomic(&paths.lrc, b"[00:00.50]Tsuyoku nareru riyuu wo shitta\n").unwrap();
    write_atomic(
        &paths.corrected_lrc,
        b"[ti:Gurenge]\n[ar:LiSA]\n\n[00:00.60]Tsuyoku nareru riyuu wo shitta\n",
    )
    .unwrap();
    write_json_atomic(&paths.song_story_json, &story_for("Gurenge", "LiSA")).unwrap();
    write_atomic(
        &paths.explanation_txt,
        "Gurenge is about finding the strength to go on.".as_bytes(),
    )
    .unwrap();
    write_atomic(
        &paths.output_lrc,
        b"[00:00.50]Tsuyoku nareru riyuu wo shitta\n[00:00.50]translated\n",
    )
    .unwrap();
}

pub fn story_for(title: &str, artist: &str) -> SongStory {
    SongStory {
        song_title: title.into(),
        artist_name: artist.into(),
        native_language: "Japanese".into(),
        story_type: "anime".into(),
        creation_story: format!("{title} was written as an opening theme."),
        background_story: None,
        search_queries_used: vec![format!("{title} {artist} story")],
        sources_used: Vec::new(),
        reasoning: "scripted".into(),
    }
}

/// Transcript whose first word is the file key, so later stages can tell
/// files apart
pub fn transcript_for(key: &str) -> Transcript {
    Transcript::new(vec![
        TranscriptSegment {
            start: 0.5,
            end: 3.0,
            text: format!("{key} tsuyoku nareru"),
        },
        TranscriptSegment {
            start: 3.0,
            end: 6.0,
            text: "riyuu wo shitta".into(),
        },
    ])
}

/// A config rooted in `root` with input/output/tmp directories and a CSV path.
/// The memory monitor never pauses.
pub fn test_config(root: &Path) -> Config {
    let input = root.join("input");
    fs::create_dir_all(&input).unwrap();
    let mut config = Config::new(input, root.join("output"), root.join("tmp"));
    config.csv_output = root.join("report.csv");
    config.memory.high_percent = 101.0;
    config.memory.check_interval = Duration::from_millis(50);
    config
}

/// Create a dummy audio file under the config's input directory
pub fn add_input(config: &Config, relative: &str) -> PathBuf {
    let path = config.input_dir.join(relative);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).unwrap();
    }
    fs::write(&path, b"not really audio").unwrap();
    path
}

/// Per-file behavior of the scripted collaborators, keyed by file stem
#[derive(Debug, Clone)]
pub struct FileScript {
    pub metadata: SongMetadata,
    pub fail_separation: bool,
    /// Identification confidence per attempt; missing attempts score 0.9
    pub identification_scores: Vec<f64>,
    /// Error returned instead of an answer, per attempt
    pub identification_errors: Vec<Option<ErrorKind>>,
    pub verification_score: f64,
    pub verification_match: bool,
    pub lyrics_missing: bool,
    /// The corrector answers with bare lyric lines
    pub correction_untimed: bool,
    pub story_missing: bool,
    pub panic_in: Option<StageKind>,
}

impl Default for FileScript {
    fn default() -> Self {
        Self {
            metadata: SongMetadata::default(),
            fail_separation: false,
            identification_scores: Vec::new(),
            identification_errors: Vec::new(),
            verification_score: 0.85,
            verification_match: true,
            lyrics_missing: false,
            correction_untimed: false,
            story_missing: false,
            panic_in: None,
        }
    }
}

impl FileScript {
    pub fn tagged(title: &str, artist: &str) -> Self {
        Self {
            metadata: SongMetadata {
                title: Some(title.into()),
                artist: Some(artist.into()),
                ..Default::default()
            },
            ..Default::default()
        }
    }
}

/// Scripted stand-in for every collaborator, counting calls per stage and file
#[derive(Default)]
pub struct ScriptedCollaborators {
    scripts: HashMap<String, FileScript>,
    default_script: FileScript,
    calls: Mutex<Vec<(StageKind, String)>>,
    identification_feedback: Mutex<Vec<IdentificationFeedback>>,
    translation_context: Mutex<HashMap<String, String>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    delay: Option<Duration>,
}

impl ScriptedCollaborators {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_script(mut self, key: &str, script: FileScript) -> Self {
        self.scripts.insert(key.to_string(), script);
        self
    }

    pub fn with_default(mut self, script: FileScript) -> Self {
        self.default_script = script;
        self
    }

    /// Hold every second-phase call open for `delay`
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn into_collaborators(self) -> (Arc<Self>, Collaborators) {
        let fake = Arc::new(self);
        let collaborators = Collaborators {
            metadata: fake.clone(),
            separator: fake.clone(),
            transcriber: fake.clone(),
            identifier: fake.clone(),
            searcher: fake.clone(),
            verifier: fake.clone(),
            generator: fake.clone(),
            corrector: fake.clone(),
            storyteller: fake.clone(),
            explainer: fake.clone(),
            translator: fake.clone(),
        };
        (fake, collaborators)
    }

    pub fn total_calls(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn calls_for(&self, stage: StageKind) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(s, _)| *s == stage)
            .count()
    }

    pub fn calls_for_file(&self, key: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, k)| k == key)
            .count()
    }

    /// Feedback handed to each identification attempt, in call order
    pub fn identification_feedback(&self) -> Vec<IdentificationFeedback> {
        self.identification_feedback.lock().unwrap().clone()
    }

    /// Explanation the translator received for a file
    pub fn translation_context(&self, key: &str) -> Option<String> {
        self.translation_context.lock().unwrap().get(key).cloned()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn script(&self, key: &str) -> &FileScript {
        self.scripts.get(key).unwrap_or(&self.default_script)
    }

    fn record(&self, stage: StageKind, key: &str) -> &FileScript {
        self.calls.lock().unwrap().push((stage, key.to_string()));
        let script = self.script(key);
        if script.panic_in == Some(stage) {
            panic!("scripted panic in {stage} for {key}");
        }
        script
    }

    async fn network_call(&self) {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        match self.delay {
            Some(delay) => tokio::time::sleep(delay).await,
            None => tokio::task::yield_now().await,
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

fn stem_key(path: &Path) -> String {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default();
    match stem.split_once("_(Vocals)") {
        Some((name, _)) => name.to_string(),
        None => stem,
    }
}

fn scripted_error(kind: ErrorKind, key: &str) -> StageError {
    let message = format!("scripted {kind} failure for {key}");
    match kind {
        ErrorKind::Io => StageError::io(message, std::io::Error::other("scripted")),
        ErrorKind::Model => StageError::Model(message),
        ErrorKind::Api => StageError::Api(message),
        ErrorKind::ConfidenceRejected => StageError::ConfidenceRejected {
            score: 0.0,
            reason: message,
        },
        ErrorKind::Format => StageError::Format(message),
        ErrorKind::NotFound => StageError::NotFound(message),
        ErrorKind::Cancelled => StageError::Cancelled,
    }
}

fn first_word(text: &str) -> String {
    text.split_whitespace().next().unwrap_or_default().to_string()
}

fn title_tag_key(lrc_text: &str) -> String {
    lrc_text
        .lines()
        .find(|l| l.starts_with("[ti:"))
        .map(|l| first_word(l.trim_start_matches("[ti:").trim_end_matches(']')))
        .unwrap_or_default()
}

fn transcript_key(transcript: &Transcript) -> String {
    transcript
        .segments
        .first()
        .and_then(|s| s.text.split_whitespace().next())
        .unwrap_or_default()
        .to_string()
}

#[async_trait]
impl MetadataExtractor for ScriptedCollaborators {
    async fn extract(&self, path: &Path) -> Result<SongMetadata, StageError> {
        let key = stem_key(path);
        Ok(self.record(StageKind::Metadata, &key).metadata.clone())
    }
}

#[async_trait]
impl Separator for ScriptedCollaborators {
    async fn separate(&self, input: &Path, output_dir: &Path) -> Result<PathBuf, StageError> {
        let key = stem_key(input);
        if self.record(StageKind::Separation, &key).fail_separation {
            return Err(StageError::Model(format!("separation model crashed on {key}")));
        }
        fs::create_dir_all(output_dir)?;
        let vocals = output_dir.join(format!("{key}_(Vocals)_fake.wav"));
        fs::write(&vocals, wav_bytes())?;
        Ok(vocals)
    }
}

#[async_trait]
impl Transcriber for ScriptedCollaborators {
    async fn transcribe(&self, vocals: &Path) -> Result<Transcript, StageError> {
        let key = stem_key(vocals);
        self.record(StageKind::Transcription, &key);
        Ok(transcript_for(&key))
    }
}

#[async_trait]
impl Identifier for ScriptedCollaborators {
    async fn identify(
        &self,
        transcript: &Transcript,
        _hints: &SongMetadata,
        feedback: &IdentificationFeedback,
    ) -> Result<Identification, StageError> {
        let key = transcript_key(transcript);
        let attempt = feedback.attempts.len();
        self.identification_feedback
            .lock()
            .unwrap()
            .push(feedback.clone());
        let script = self.record(StageKind::Identification, &key).clone();
        self.network_call().await;
        if let Some(kind) = script.identification_errors.get(attempt).copied().flatten() {
            return Err(scripted_error(kind, &key));
        }
        let confidence = script
            .identification_scores
            .get(attempt)
            .copied()
            .unwrap_or(0.9);
        Ok(Identification {
            title: format!("{key} title"),
            artist: format!("{key} artist"),
            language: Some("Japanese".into()),
            confidence,
            reasoning: format!("attempt {}", attempt + 1),
            queries_used: vec![format!("{key} query {}", attempt + 1)],
        })
    }
}

#[async_trait]
impl LyricsSearcher for ScriptedCollaborators {
    async fn search(&self, title: &str, artist: &str) -> Result<Lyrics, StageError> {
        let key = first_word(title);
        let missing = self.record(StageKind::Search, &key).lyrics_missing;
        self.network_call().await;
        if missing {
            return Err(StageError::NotFound(format!("no lyrics for '{title}'")));
        }
        Ok(Lyrics {
            text: format!("{title} by {artist}\nTsuyoku nareru riyuu wo shitta"),
            source: "scripted".into(),
        })
    }
}

#[async_trait]
impl Verifier for ScriptedCollaborators {
    async fn verify(&self, _lyrics: &str, transcript: &Transcript) -> Result<Verification, StageError> {
        let key = transcript_key(transcript);
        let script = self.record(StageKind::Verification, &key).clone();
        self.network_call().await;
        Ok(Verification {
            is_match: script.verification_match,
            confidence: script.verification_score,
            reasoning: "scripted".into(),
        })
    }
}

#[async_trait]
impl LrcGenerator for ScriptedCollaborators {
    async fn generate(&self, lyrics: &str, transcript: &Transcript) -> Result<String, StageError> {
        let key = transcript_key(transcript);
        self.record(StageKind::Generation, &key);
        self.network_call().await;
        Ok(transcript
            .segments
            .iter()
            .zip(lyrics.lines())
            .map(|(segment, line)| format!("{}{line}", lrc::format_timestamp(segment.start)))
            .collect::<Vec<_>>()
            .join("\n"))
    }
}

/// Re-times each lyric line 0.1s after its transcript segment starts
#[async_trait]
impl TimestampCorrector for ScriptedCollaborators {
    async fn correct(&self, lrc_text: &str, transcript: &Transcript) -> Result<String, StageError> {
        let key = transcript_key(transcript);
        let untimed = self.record(StageKind::TimestampCorrection, &key).correction_untimed;
        self.network_call().await;
        if untimed {
            return Ok(lrc::lyric_text(lrc_text));
        }
        let mut segments = transcript.segments.iter();
        Ok(lrc_text
            .lines()
            .map(|line| {
                if !lrc::has_timestamps(line) {
                    return line.to_string();
                }
                let text = line.rsplit_once(']').map(|(_, t)| t).unwrap_or(line);
                match segments.next() {
                    Some(segment) => format!("{}{text}", lrc::format_timestamp(segment.start + 0.1)),
                    None => line.to_string(),
                }
            })
            .collect::<Vec<_>>()
            .join("\n"))
    }
}

#[async_trait]
impl StoryTeller for ScriptedCollaborators {
    async fn story(&self, identity: &SongIdentity) -> Result<SongStory, StageError> {
        let key = first_word(&identity.title);
        let missing = self.record(StageKind::Story, &key).story_missing;
        self.network_call().await;
        let mut story = story_for(&identity.title, &identity.artist);
        if missing {
            story.creation_story = String::new();
        }
        Ok(story)
    }
}

#[async_trait]
impl Explainer for ScriptedCollaborators {
    async fn explain(
        &self,
        lyrics: &str,
        story: &SongStory,
        target_language: &str,
    ) -> Result<String, StageError> {
        let key = first_word(&story.song_title);
        self.record(StageKind::Explanation, &key);
        self.network_call().await;
        Ok(format!(
            "({target_language}) {} {}",
            story.creation_story,
            lyrics.lines().next().unwrap_or_default()
        ))
    }
}

#[async_trait]
impl Translator for ScriptedCollaborators {
    async fn translate(
        &self,
        lrc_text: &str,
        target_language: &str,
        explanation: &str,
    ) -> Result<String, StageError> {
        let key = title_tag_key(lrc_text);
        self.record(StageKind::Translation, &key);
        self.translation_context
            .lock()
            .unwrap()
            .insert(key, explanation.to_string());
        self.network_call().await;
        Ok(lrc_text
            .lines()
            .flat_map(|line| {
                let translated = match line.split_once(']') {
                    Some((tag, _)) if lrc::has_timestamps(line) => {
                        Some(format!("{tag}]({target_language})"))
                    }
                    _ => None,
                };
                std::iter::once(line.to_string()).chain(translated)
            })
            .collect::<Vec<_>>()
            .join("\n"))
    }
}
