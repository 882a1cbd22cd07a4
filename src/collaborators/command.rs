use super::{Separator, Transcriber};
use crate::error::StageError;
use crate::lrc;
use crate::process::{expand_pattern, find_matching, run_command, stderr_tail};
use crate::types::{Transcript, TranscriptSegment};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tracing::debug;

const VOCALS_GLOB: &str = "**/*(Vocals)*.wav";

/// Runs an external separation tool; `{input}` and `{output_dir}` are substituted
pub struct CommandSeparator {
    template: String,
}

impl CommandSeparator {
    pub fn new(template: &str) -> Self {
        Self {
            template: template.to_string(),
        }
    }
}

#[async_trait]
impl Separator for CommandSeparator {
    async fn separate(&self, input: &Path, output_dir: &Path) -> Result<PathBuf, StageError> {
        tokio::fs::create_dir_all(output_dir).await.map_err(|e| {
            StageError::io(format!("Failed to create {}", output_dir.display()), e)
        })?;
        let command = expand_pattern(
            &self.template,
            &[("input", input), ("output_dir", output_dir)],
        );
        debug!(command = %command, "Running separator");

        let output = run_command(&command).await?;
        if output.exit_code != 0 {
            return Err(StageError::Model(format!(
                "separator exited with {}: {}",
                output.exit_code,
                stderr_tail(&output)
            )));
        }

        find_matching(output_dir, VOCALS_GLOB)
            .into_iter()
            .next()
            .ok_or_else(|| {
                StageError::Model(format!(
                    "separator produced no vocals stem in {}",
                    output_dir.display()
                ))
            })
    }
}

/// Runs an external ASR tool; `{vocals}` is substituted.
///
/// Stdout is either a JSON array of `{start, end, text}` or the
/// `[0.92s -> 4.46s] text` transcript format.
pub struct CommandTranscriber {
    template: String,
}

impl CommandTranscriber {
    pub fn new(template: &str) -> Self {
        Self {
            template: template.to_string(),
        }
    }
}

#[async_trait]
impl Transcriber for CommandTranscriber {
    async fn transcribe(&self, vocals: &Path) -> Result<Transcript, StageError> {
        let command = expand_pattern(&self.template, &[("vocals", vocals)]);
        debug!(command = %command, "Running transcriber");

        let output = run_command(&command).await?;
        if output.exit_code != 0 {
            return Err(StageError::Model(format!(
                "transcriber exited with {}: {}",
                output.exit_code,
                stderr_tail(&output)
            )));
        }

        let transcript = parse_transcriber_output(&output.stdout);
        if transcript.segments.is_empty() {
            return Err(StageError::Model(
                "transcriber produced no timestamped segments".to_string(),
            ));
        }
        Ok(transcript)
    }
}

fn parse_transcriber_output(stdout: &str) -> Transcript {
    match serde_json::from_str::<Vec<TranscriptSegment>>(stdout.trim()) {
        Ok(segments) => Transcript::new(
            segments
                .into_iter()
                .filter(|s| s.start.is_finite() && s.end >= s.start)
                .collect(),
        ),
        Err(_) => lrc::parse_transcript(stdout),
    }
}
