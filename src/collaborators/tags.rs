use super::MetadataExtractor;
use crate::error::StageError;
use crate::types::SongMetadata;
use async_trait::async_trait;
use lofty::config::ParseOptions;
use lofty::file::TaggedFileExt;
use lofty::prelude::Accessor;
use lofty::probe::Probe;
use std::borrow::Cow;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Reads ID3/Vorbis/MP4 tags with lofty
pub struct TagReader;

#[async_trait]
impl MetadataExtractor for TagReader {
    async fn extract(&self, path: &Path) -> Result<SongMetadata, StageError> {
        let path: PathBuf = path.to_path_buf();
        tokio::task::spawn_blocking(move || read_tags(&path))
            .await
            .map_err(|e| StageError::io("Tag reader task failed", std::io::Error::other(e)))?
    }
}

fn read_tags(path: &Path) -> Result<SongMetadata, StageError> {
    let probe = Probe::open(path).map_err(|e| {
        StageError::io(
            format!("Failed to open {}", path.display()),
            std::io::Error::other(e),
        )
    })?;
    let tagged = probe
        .options(ParseOptions::new().read_properties(false))
        .read()
        .map_err(|e| StageError::Format(format!("Failed to read tags from {}: {e}", path.display())))?;

    let Some(tag) = tagged.primary_tag().or_else(|| tagged.first_tag()) else {
        debug!(file = %path.display(), "No tags found");
        return Ok(SongMetadata::default());
    };

    let metadata = SongMetadata {
        title: clean(tag.title()),
        artist: clean(tag.artist()),
        album: clean(tag.album()),
        genre: clean(tag.genre()),
        year: tag.year().filter(|y| *y > 0),
        track_number: tag.track().filter(|t| *t > 0),
    };
    debug!(
        file = %path.display(),
        title = ?metadata.title,
        artist = ?metadata.artist,
        "Tags read"
    );
    Ok(metadata)
}

fn clean(value: Option<Cow<'_, str>>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}
