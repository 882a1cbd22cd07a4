//! External collaborators behind one trait per pipeline stage.
//!
//! The pipeline only sees these traits; concrete adapters wrap external
//! commands, the audio tag reader and HTTP APIs.

mod command;
mod llm;
mod lrclib;
mod tags;

pub use command::{CommandSeparator, CommandTranscriber};
pub use llm::{
    ChatClient, LlmExplainer, LlmIdentifier, LlmLrcGenerator, LlmStoryTeller, LlmTimestampCorrector,
    LlmTranslator, LlmVerifier,
};
pub use lrclib::LrclibSearcher;
pub use tags::TagReader;

use crate::config::Config;
use crate::error::StageError;
use crate::types::{
    Identification, IdentificationFeedback, Lyrics, SongIdentity, SongMetadata, SongStory,
    Transcript, Verification,
};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[async_trait]
pub trait MetadataExtractor: Send + Sync {
    /// Tag metadata; every field optional
    async fn extract(&self, path: &Path) -> Result<SongMetadata, StageError>;
}

#[async_trait]
pub trait Separator: Send + Sync {
    /// Separate vocals into `output_dir`, returning the vocals stem path
    async fn separate(&self, input: &Path, output_dir: &Path) -> Result<PathBuf, StageError>;
}

#[async_trait]
pub trait Transcriber: Send + Sync {
    async fn transcribe(&self, vocals: &Path) -> Result<Transcript, StageError>;
}

#[async_trait]
pub trait Identifier: Send + Sync {
    /// Name the song from its transcript, seeded with partial tags and what
    /// earlier attempts tried
    async fn identify(
        &self,
        transcript: &Transcript,
        hints: &SongMetadata,
        feedback: &IdentificationFeedback,
    ) -> Result<Identification, StageError>;
}

#[async_trait]
pub trait LyricsSearcher: Send + Sync {
    /// `StageError::NotFound` when no lyrics exist for the song
    async fn search(&self, title: &str, artist: &str) -> Result<Lyrics, StageError>;
}

#[async_trait]
pub trait Verifier: Send + Sync {
    async fn verify(&self, lyrics: &str, transcript: &Transcript)
        -> Result<Verification, StageError>;
}

#[async_trait]
pub trait LrcGenerator: Send + Sync {
    async fn generate(&self, lyrics: &str, transcript: &Transcript) -> Result<String, StageError>;
}

#[async_trait]
pub trait TimestampCorrector: Send + Sync {
    /// The same LRC lines with timestamps realigned to the transcript
    async fn correct(&self, lrc: &str, transcript: &Transcript) -> Result<String, StageError>;
}

#[async_trait]
pub trait StoryTeller: Send + Sync {
    async fn story(&self, identity: &SongIdentity) -> Result<SongStory, StageError>;
}

#[async_trait]
pub trait Explainer: Send + Sync {
    /// Explanation of `lyrics` (plain text, no timestamps) in `target_language`
    async fn explain(
        &self,
        lyrics: &str,
        story: &SongStory,
        target_language: &str,
    ) -> Result<String, StageError>;
}

#[async_trait]
pub trait Translator: Send + Sync {
    /// Bilingual LRC: each original line followed by its translation.
    /// `explanation` is background the translation should stay faithful to.
    async fn translate(
        &self,
        lrc: &str,
        target_language: &str,
        explanation: &str,
    ) -> Result<String, StageError>;
}

/// One adapter per stage, shared read-only by every driver
#[derive(Clone)]
pub struct Collaborators {
    pub metadata: Arc<dyn MetadataExtractor>,
    pub separator: Arc<dyn Separator>,
    pub transcriber: Arc<dyn Transcriber>,
    pub identifier: Arc<dyn Identifier>,
    pub searcher: Arc<dyn LyricsSearcher>,
    pub verifier: Arc<dyn Verifier>,
    pub generator: Arc<dyn LrcGenerator>,
    pub corrector: Arc<dyn TimestampCorrector>,
    pub storyteller: Arc<dyn StoryTeller>,
    pub explainer: Arc<dyn Explainer>,
    pub translator: Arc<dyn Translator>,
}

impl Collaborators {
    /// Production adapters built from the run configuration
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let chat = ChatClient::new(
            config.llm.clone(),
            config.requests_per_minute,
            config.timeouts.network,
        )?;
        let translation_chat = ChatClient::new(
            config.translation_llm.clone(),
            config.requests_per_minute,
            config.timeouts.network,
        )?;

        Ok(Self {
            metadata: Arc::new(TagReader),
            separator: Arc::new(CommandSeparator::new(&config.separator_cmd)),
            transcriber: Arc::new(CommandTranscriber::new(&config.transcriber_cmd)),
            identifier: Arc::new(LlmIdentifier::new(chat.clone())),
            searcher: Arc::new(LrclibSearcher::new(
                &config.lyrics_api_url,
                config.timeouts.network,
            )?),
            verifier: Arc::new(LlmVerifier::new(chat.clone())),
            generator: Arc::new(LlmLrcGenerator::new(chat.clone())),
            corrector: Arc::new(LlmTimestampCorrector::new(chat.clone())),
            storyteller: Arc::new(LlmStoryTeller::new(chat.clone())),
            explainer: Arc::new(LlmExplainer::new(chat)),
            translator: Arc::new(LlmTranslator::new(translation_chat)),
        })
    }
}
