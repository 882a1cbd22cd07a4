use super::{Explainer, Identifier, LrcGenerator, StoryTeller, TimestampCorrector, Translator, Verifier};
use crate::config::LlmConfig;
use crate::error::StageError;
use crate::lrc;
use crate::types::{
    Identification, IdentificationFeedback, SongIdentity, SongMetadata, SongStory, Transcript,
    Verification,
};
use anyhow::Context;
use async_trait::async_trait;
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

const IDENTIFY_PROMPT: &str = "You identify songs from speech-recognition transcripts of their vocals. \
The transcript may contain recognition errors. Reply with a JSON object: \
{\"title\": string, \"artist\": string, \"language\": string, \"confidence\": number between 0 and 1, \
\"reasoning\": string, \"queries_used\": [string]}. Use the original-language title and artist name. \
Only give a high confidence when distinctive lyrics match a known song.";

const VERIFY_PROMPT: &str = "You compare published song lyrics with a speech-recognition transcript \
of the same recording and decide whether they are the same song. Ignore recognition errors, \
repeated choruses and romanisation differences. Reply with a JSON object: \
{\"match\": boolean, \"confidence\": number between 0 and 1, \"reasoning\": string}.";

const GENERATE_PROMPT: &str = "You write LRC files. Align every line of the given lyrics to the \
timestamped transcript and output only LRC lines of the form [mm:ss.xx]lyric line, in order, \
with no commentary.";

const CORRECT_PROMPT: &str = "You fix the timestamps of LRC files. Compare each LRC line with the \
timestamped transcript of the same recording and move its timestamp to where the line is actually \
sung. Keep every lyric line and its text exactly as given, in the same order. Output only LRC \
lines of the form [mm:ss.xx]lyric line, with no commentary.";

const STORY_PROMPT: &str = "You research the background of songs. Describe how the given song was \
created and what it was written for (an anime, film, drama or game theme, a campaign, a personal \
event). Only state facts you are confident about. Reply with a JSON object: \
{\"song_title\": string, \"artist_name\": string, \"native_language\": string, \
\"story_type\": string, \"creation_story\": string, \"background_story\": string or null, \
\"search_queries_used\": [string], \"sources_used\": [string], \"reasoning\": string}.";

const EXPLAIN_PROMPT: &str = "You explain song lyrics to listeners who do not speak the original \
language. Explain the meaning of the lyrics section by section, including idioms, wordplay and \
cultural references, and how they relate to the song's background. Write the whole explanation \
in the requested language.";

const TRANSLATE_PROMPT: &str = "You translate LRC lyric files. For every timestamped line output \
the original line, then a line with the same timestamp containing the translation. Keep any \
[ti:]/[ar:]/[al:] tags unchanged. Use the explanation to keep the translation faithful to the \
meaning of the song. Output only the LRC content.";

#[derive(Debug, Deserialize)]
struct ChatCompletion {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    #[serde(default)]
    content: Option<String>,
}

/// Rate-limited client for an OpenAI-compatible chat completions endpoint
#[derive(Clone)]
pub struct ChatClient {
    client: reqwest::Client,
    config: LlmConfig,
    limiter: Arc<DefaultDirectRateLimiter>,
}

impl ChatClient {
    pub fn new(config: LlmConfig, requests_per_minute: u32, timeout: Duration) -> anyhow::Result<Self> {
        let per_minute = NonZeroU32::new(requests_per_minute)
            .context("requests per minute must be at least 1")?;
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            client,
            config,
            limiter: Arc::new(RateLimiter::direct(Quota::per_minute(per_minute))),
        })
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.config.base_url.trim_end_matches('/'))
    }

    /// Send one system+user exchange and return the answer text
    pub async fn complete(&self, system: &str, user: &str, json_mode: bool) -> Result<String, StageError> {
        self.limiter.until_ready().await;

        let mut body = json!({
            "model": self.config.model,
            "temperature": 0.0,
            "messages": [
                {"role": "system", "content": system},
                {"role": "user", "content": user},
            ],
        });
        if json_mode {
            body["response_format"] = json!({"type": "json_object"});
        }

        let url = self.endpoint();
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.config.api_key)
            .json(&body)
            .send()
            .await?;
        let status = response.status();
        let text = response.text().await?;
        if !status.is_success() {
            return Err(StageError::Api(format!(
                "{url} returned {status}: {}",
                truncate(&text, 300)
            )));
        }

        let completion: ChatCompletion = serde_json::from_str(&text)
            .map_err(|e| StageError::Api(format!("unexpected response from {url}: {e}")))?;
        let content = completion
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .filter(|c| !c.trim().is_empty())
            .ok_or_else(|| StageError::Api(format!("{url} returned an empty completion")))?;
        debug!(model = %self.config.model, chars = content.len(), "Completion received");
        Ok(content)
    }

    pub async fn complete_json<T: DeserializeOwned>(&self, system: &str, user: &str) -> Result<T, StageError> {
        let answer = self.complete(system, user, true).await?;
        serde_json::from_str(strip_code_fences(&answer))
            .map_err(|e| StageError::Format(format!("unparsable model answer: {e}")))
    }
}

/// Drop a surrounding markdown code fence, if any
pub fn strip_code_fences(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    // Skip the language tag on the opening fence line
    let rest = rest.split_once('\n').map(|(_, body)| body).unwrap_or("");
    rest.trim_end().strip_suffix("```").unwrap_or(rest).trim()
}

fn truncate(text: &str, max_chars: usize) -> String {
    let mut out: String = text.chars().take(max_chars).collect();
    if text.chars().count() > max_chars {
        out.push_str("...");
    }
    out
}

fn identification_request(
    transcript: &Transcript,
    hints: &SongMetadata,
    feedback: &IdentificationFeedback,
) -> Result<String, StageError> {
    let mut request = String::new();
    for (label, value) in [
        ("Title", &hints.title),
        ("Artist", &hints.artist),
        ("Album", &hints.album),
    ] {
        if let Some(value) = value {
            request.push_str(&format!("{label}: {value}\n"));
        }
    }
    request.push_str(&format!("\nTranscript:\n{}\n", transcript.plain_text()));
    if !feedback.is_empty() {
        request.push_str(&format!(
            "\nEarlier attempts were not confident enough. Do not repeat them; try different \
             search queries than {:?}.\n{}\n",
            feedback.queries(),
            serde_json::to_string_pretty(feedback)?
        ));
    }
    Ok(request)
}

pub struct LlmIdentifier {
    chat: ChatClient,
}

impl LlmIdentifier {
    pub fn new(chat: ChatClient) -> Self {
        Self { chat }
    }
}

#[async_trait]
impl Identifier for LlmIdentifier {
    async fn identify(
        &self,
        transcript: &Transcript,
        hints: &SongMetadata,
        feedback: &IdentificationFeedback,
    ) -> Result<Identification, StageError> {
        let request = identification_request(transcript, hints, feedback)?;
        self.chat.complete_json(IDENTIFY_PROMPT, &request).await
    }
}

pub struct LlmVerifier {
    chat: ChatClient,
}

impl LlmVerifier {
    pub fn new(chat: ChatClient) -> Self {
        Self { chat }
    }
}

#[async_trait]
impl Verifier for LlmVerifier {
    async fn verify(&self, lyrics: &str, transcript: &Transcript) -> Result<Verification, StageError> {
        let request = format!(
            "Published lyrics:\n{lyrics}\n\nTranscript:\n{}",
            transcript.plain_text()
        );
        self.chat.complete_json(VERIFY_PROMPT, &request).await
    }
}

pub struct LlmLrcGenerator {
    chat: ChatClient,
}

impl LlmLrcGenerator {
    pub fn new(chat: ChatClient) -> Self {
        Self { chat }
    }
}

#[async_trait]
impl LrcGenerator for LlmLrcGenerator {
    async fn generate(&self, lyrics: &str, transcript: &Transcript) -> Result<String, StageError> {
        let request = format!(
            "Lyrics:\n{lyrics}\n\n{}",
            lrc::render_transcript(transcript)
        );
        let answer = self.chat.complete(GENERATE_PROMPT, &request, false).await?;
        Ok(strip_code_fences(&answer).to_string())
    }
}

pub struct LlmTimestampCorrector {
    chat: ChatClient,
}

impl LlmTimestampCorrector {
    pub fn new(chat: ChatClient) -> Self {
        Self { chat }
    }
}

#[async_trait]
impl TimestampCorrector for LlmTimestampCorrector {
    async fn correct(&self, lrc: &str, transcript: &Transcript) -> Result<String, StageError> {
        let request = format!(
            "LRC:\n{}\n\n{}",
            lrc.trim(),
            lrc::render_transcript(transcript)
        );
        let answer = self.chat.complete(CORRECT_PROMPT, &request, false).await?;
        Ok(strip_code_fences(&answer).to_string())
    }
}

pub struct LlmStoryTeller {
    chat: ChatClient,
}

impl LlmStoryTeller {
    pub fn new(chat: ChatClient) -> Self {
        Self { chat }
    }
}

#[async_trait]
impl StoryTeller for LlmStoryTeller {
    async fn story(&self, identity: &SongIdentity) -> Result<SongStory, StageError> {
        self.chat
            .complete_json(STORY_PROMPT, &story_request(identity))
            .await
    }
}

fn story_request(identity: &SongIdentity) -> String {
    let mut request = format!("Song: {}\nArtist: {}\n", identity.title, identity.artist);
    if let Some(language) = &identity.language {
        request.push_str(&format!("Language: {language}\n"));
    }
    request
}

pub struct LlmExplainer {
    chat: ChatClient,
}

impl LlmExplainer {
    pub fn new(chat: ChatClient) -> Self {
        Self { chat }
    }
}

#[async_trait]
impl Explainer for LlmExplainer {
    async fn explain(
        &self,
        lyrics: &str,
        story: &SongStory,
        target_language: &str,
    ) -> Result<String, StageError> {
        let request = format!(
            "Explain in: {target_language}\n\nBackground:\n{}\n\nLyrics:\n{lyrics}",
            story.summary()
        );
        let answer = self.chat.complete(EXPLAIN_PROMPT, &request, false).await?;
        Ok(answer.trim().to_string())
    }
}

pub struct LlmTranslator {
    chat: ChatClient,
}

impl LlmTranslator {
    pub fn new(chat: ChatClient) -> Self {
        Self { chat }
    }
}

#[async_trait]
impl Translator for LlmTranslator {
    async fn translate(
        &self,
        lrc: &str,
        target_language: &str,
        explanation: &str,
    ) -> Result<String, StageError> {
        let request = translation_request(lrc, target_language, explanation);
        let answer = self.chat.complete(TRANSLATE_PROMPT, &request, false).await?;
        Ok(strip_code_fences(&answer).to_string())
    }
}

fn translation_request(lrc: &str, target_language: &str, explanation: &str) -> String {
    let mut request = format!("Target language: {target_language}\n\n");
    if !explanation.trim().is_empty() {
        request.push_str(&format!("Explanation of the song:\n{}\n\n", explanation.trim()));
    }
    request.push_str("LRC:\n");
    request.push_str(lrc);
    request
}
