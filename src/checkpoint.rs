use crate::error::StageError;
use crate::lrc;
use crate::paths::ArtifactPaths;
use crate::types::{Lyrics, SongMetadata, SongStory, StageKind, Transcript};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Persisted result of an accepted song identification
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdentificationRecord {
    pub title: String,
    pub artist: String,
    #[serde(default)]
    pub language: Option<String>,
    pub confidence: f64,
    #[serde(default)]
    pub queries: Vec<String>,
    #[serde(default)]
    pub reasoning: String,
    pub attempt: u32,
    pub total_attempts: u32,
}

/// Persisted result of a passed lyrics verification
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerificationRecord {
    #[serde(rename = "match")]
    pub is_match: bool,
    pub confidence: f64,
    #[serde(default)]
    pub reasoning: String,
}

/// Stages whose artifacts from a previous run are present and valid.
///
/// Always empty when resume is disabled.
pub fn probe(paths: &ArtifactPaths, resume: bool) -> BTreeSet<StageKind> {
    if !resume {
        return BTreeSet::new();
    }
    StageKind::ALL
        .into_iter()
        .filter(|stage| {
            let path = paths.artifact(*stage);
            match validate(*stage, path) {
                Ok(()) => {
                    debug!(stage = %stage, artifact = %path.display(), "Checkpoint satisfied");
                    true
                }
                Err(e) => {
                    if path.exists() {
                        debug!(stage = %stage, artifact = %path.display(), error = %e, "Ignoring invalid checkpoint");
                    }
                    false
                }
            }
        })
        .collect()
}

/// Check that the artifact for `stage` exists, is non-empty and parses
pub fn validate(stage: StageKind, path: &Path) -> Result<(), StageError> {
    match stage {
        StageKind::Metadata => load_metadata(path).map(drop),
        StageKind::Separation => validate_wav(path),
        StageKind::Transcription => load_transcript(path).map(drop),
        StageKind::Identification => load_identification(path).map(drop),
        StageKind::Search => load_lyrics(path).map(drop),
        StageKind::Verification => load_verification(path).map(drop),
        StageKind::Generation | StageKind::TimestampCorrection | StageKind::Translation => {
            load_lrc(path).map(drop)
        }
        StageKind::Story => load_story(path).map(drop),
        StageKind::Explanation => load_explanation(path).map(drop),
    }
}

fn read_non_empty(path: &Path) -> Result<String, StageError> {
    let content = fs::read_to_string(path)
        .map_err(|e| StageError::io(format!("Failed to read {}", path.display()), e))?;
    if content.trim().is_empty() {
        return Err(StageError::Format(format!("{} is empty", path.display())));
    }
    Ok(content)
}

fn load_json<T: DeserializeOwned>(path: &Path) -> Result<T, StageError> {
    let content = read_non_empty(path)?;
    serde_json::from_str(&content)
        .map_err(|e| StageError::Format(format!("{}: {e}", path.display())))
}

pub fn load_metadata(path: &Path) -> Result<SongMetadata, StageError> {
    load_json(path)
}

pub fn load_transcript(path: &Path) -> Result<Transcript, StageError> {
    let transcript = lrc::parse_transcript(&read_non_empty(path)?);
    if transcript.segments.is_empty() {
        return Err(StageError::Format(format!(
            "{} has no transcript segments",
            path.display()
        )));
    }
    Ok(transcript)
}

pub fn load_identification(path: &Path) -> Result<IdentificationRecord, StageError> {
    let record: IdentificationRecord = load_json(path)?;
    if record.title.trim().is_empty() || record.artist.trim().is_empty() {
        return Err(StageError::Format(format!(
            "{} is missing title or artist",
            path.display()
        )));
    }
    if !(0.0..=1.0).contains(&record.confidence) {
        return Err(StageError::Format(format!(
            "{} has confidence outside [0, 1]",
            path.display()
        )));
    }
    Ok(record)
}

pub fn load_lyrics(path: &Path) -> Result<Lyrics, StageError> {
    lrc::parse_lyrics_file(&read_non_empty(path)?)
        .ok_or_else(|| StageError::Format(format!("{} has no lyrics body", path.display())))
}

pub fn load_verification(path: &Path) -> Result<VerificationRecord, StageError> {
    load_json(path)
}

pub fn load_lrc(path: &Path) -> Result<String, StageError> {
    let content = read_non_empty(path)?;
    if !lrc::has_timestamps(&content) {
        return Err(StageError::Format(format!(
            "{} has no LRC timestamps",
            path.display()
        )));
    }
    Ok(content)
}

pub fn load_story(path: &Path) -> Result<SongStory, StageError> {
    let story: SongStory = load_json(path)?;
    if story.creation_story.trim().is_empty() {
        return Err(StageError::Format(format!(
            "{} has no creation story",
            path.display()
        )));
    }
    Ok(story)
}

pub fn load_explanation(path: &Path) -> Result<String, StageError> {
    Ok(read_non_empty(path)?.trim().to_string())
}

/// A WAV artifact must at least carry a complete RIFF/WAVE header
pub fn validate_wav(path: &Path) -> Result<(), StageError> {
    let mut header = [0u8; 12];
    let mut file = File::open(path)
        .map_err(|e| StageError::io(format!("Failed to open {}", path.display()), e))?;
    let len = file
        .metadata()
        .map_err(|e| StageError::io(format!("Failed to stat {}", path.display()), e))?
        .len();
    if len < 44 {
        return Err(StageError::Format(format!(
            "{} is truncated ({len} bytes)",
            path.display()
        )));
    }
    file.read_exact(&mut header)
        .map_err(|e| StageError::io(format!("Failed to read {}", path.display()), e))?;
    if &header[0..4] != b"RIFF" || &header[8..12] != b"WAVE" {
        return Err(StageError::Format(format!(
            "{} is not a WAV file",
            path.display()
        )));
    }
    Ok(())
}

/// Sibling path an artifact is written to before being renamed into place
pub fn staging_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

/// Write an artifact atomically (write to temp, then rename)
pub fn write_atomic(path: &Path, contents: &[u8]) -> Result<(), StageError> {
    let temp_path = staging_path(path);
    {
        let mut file = File::create(&temp_path).map_err(|e| {
            StageError::io(format!("Failed to create {}", temp_path.display()), e)
        })?;
        file.write_all(contents)
            .and_then(|_| file.sync_all())
            .map_err(|e| StageError::io(format!("Failed to write {}", temp_path.display()), e))?;
    }
    fs::rename(&temp_path, path)
        .map_err(|e| StageError::io(format!("Failed to rename into {}", path.display()), e))?;
    debug!(artifact = %path.display(), bytes = contents.len(), "Artifact written");
    Ok(())
}

pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<(), StageError> {
    let content = serde_json::to_string_pretty(value)?;
    write_atomic(path, content.as_bytes())
}

/// Move a file produced elsewhere onto its artifact path without ever exposing
/// a partial file at `dest`
pub fn move_into_place(src: &Path, dest: &Path) -> Result<(), StageError> {
    if fs::rename(src, dest).is_ok() {
        return Ok(());
    }
    // Different filesystem: copy beside the destination first
    let temp_path = staging_path(dest);
    fs::copy(src, &temp_path)
        .map_err(|e| StageError::io(format!("Failed to copy {}", src.display()), e))?;
    fs::rename(&temp_path, dest)
        .map_err(|e| StageError::io(format!("Failed to rename into {}", dest.display()), e))?;
    let _ = fs::remove_file(src);
    Ok(())
}
