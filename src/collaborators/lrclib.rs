use super::LyricsSearcher;
use crate::error::StageError;
use crate::types::Lyrics;
use anyhow::Context;
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LrclibRecord {
    id: u64,
    #[serde(default)]
    instrumental: bool,
    #[serde(default)]
    plain_lyrics: Option<String>,
}

impl LrclibRecord {
    fn lyrics(self, base_url: &str) -> Option<Lyrics> {
        if self.instrumental {
            return None;
        }
        let text = self.plain_lyrics?.trim().to_string();
        if text.is_empty() {
            return None;
        }
        Some(Lyrics {
            text,
            source: format!("{base_url}/api/get/{}", self.id),
        })
    }
}

/// Plain lyrics from an LRCLIB-compatible API
pub struct LrclibSearcher {
    client: reqwest::Client,
    base_url: String,
}

impl LrclibSearcher {
    pub fn new(base_url: &str, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("lrc-batch-runner/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    /// Exact title/artist lookup; `None` on 404
    async fn get_exact(&self, title: &str, artist: &str) -> Result<Option<Lyrics>, StageError> {
        let response = self
            .client
            .get(format!("{}/api/get", self.base_url))
            .query(&[("track_name", title), ("artist_name", artist)])
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = check_status(response)?;
        let record: LrclibRecord = response.json().await?;
        Ok(record.lyrics(&self.base_url))
    }

    /// Fuzzy search; first result with plain lyrics wins
    async fn search_fuzzy(&self, title: &str, artist: &str) -> Result<Option<Lyrics>, StageError> {
        let response = self
            .client
            .get(format!("{}/api/search", self.base_url))
            .query(&[("track_name", title), ("artist_name", artist)])
            .send()
            .await?;
        let response = check_status(response)?;
        let records: Vec<LrclibRecord> = response.json().await?;
        Ok(records
            .into_iter()
            .find_map(|record| record.lyrics(&self.base_url)))
    }
}

fn check_status(response: reqwest::Response) -> Result<reqwest::Response, StageError> {
    let status = response.status();
    if status.is_success() {
        Ok(response)
    } else {
        Err(StageError::Api(format!(
            "{} returned {status}",
            response.url()
        )))
    }
}

#[async_trait]
impl LyricsSearcher for LrclibSearcher {
    async fn search(&self, title: &str, artist: &str) -> Result<Lyrics, StageError> {
        if let Some(lyrics) = self.get_exact(title, artist).await? {
            return Ok(lyrics);
        }
        debug!(title, artist, "No exact lyrics match, trying search");
        self.search_fuzzy(title, artist).await?.ok_or_else(|| {
            StageError::NotFound(format!("no lyrics for '{title}' by {artist}"))
        })
    }
}
