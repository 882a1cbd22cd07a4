use crate::error::StageError;
use crate::types::StageKind;
use std::fs;
use std::path::{Component, Path, PathBuf};
use tracing::warn;

/// Default separation model tag embedded in vocals artifact names
pub const DEFAULT_VOCALS_TAG: &str = "UVR_MDXNET_Main";

/// Every intermediate and final artifact location for one input file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactPaths {
    /// Input path relative to the input root (or just the file name)
    pub relative_path: PathBuf,
    /// Per-file temp directory holding all intermediate artifacts
    pub work_dir: PathBuf,
    pub metadata_json: PathBuf,
    pub vocals_wav: PathBuf,
    pub transcript_txt: PathBuf,
    pub identification_json: PathBuf,
    pub lyrics_txt: PathBuf,
    pub verification_json: PathBuf,
    pub lrc: PathBuf,
    /// Generated LRC after timestamp correction; the translation input
    pub corrected_lrc: PathBuf,
    pub song_story_json: PathBuf,
    pub explanation_txt: PathBuf,
    /// Final bilingual LRC, mirroring the input directory structure
    pub output_lrc: PathBuf,
}

impl ArtifactPaths {
    /// The artifact whose presence marks `stage` as complete
    pub fn artifact(&self, stage: StageKind) -> &Path {
        match stage {
            StageKind::Metadata => &self.metadata_json,
            StageKind::Separation => &self.vocals_wav,
            StageKind::Transcription => &self.transcript_txt,
            StageKind::Identification => &self.identification_json,
            StageKind::Search => &self.lyrics_txt,
            StageKind::Verification => &self.verification_json,
            StageKind::Generation => &self.lrc,
            StageKind::TimestampCorrection => &self.corrected_lrc,
            StageKind::Story => &self.song_story_json,
            StageKind::Explanation => &self.explanation_txt,
            StageKind::Translation => &self.output_lrc,
        }
    }

    /// Scratch directory the separator writes into before its stem is moved into place
    pub fn separation_staging_dir(&self) -> PathBuf {
        self.work_dir.join(".separation")
    }
}

/// Map an input file to its artifact paths.
///
/// Pure: the same arguments always yield the same paths, which is what lets a
/// rerun find the previous run's artifacts.
pub fn plan(
    input_file: &Path,
    input_root: &Path,
    output_root: &Path,
    temp_root: &Path,
    vocals_tag: &str,
) -> ArtifactPaths {
    let relative_path = relative_to_root(input_file, input_root);
    let name = relative_path
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "unnamed".to_string());
    let parent = relative_path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_default();

    let work_dir = temp_root.join(&parent).join(&name);
    let vocals_stem = format!("{name}_(Vocals)_{vocals_tag}");

    ArtifactPaths {
        metadata_json: work_dir.join(format!("{name}_metadata.json")),
        vocals_wav: work_dir.join(format!("{vocals_stem}.wav")),
        transcript_txt: work_dir.join(format!("{vocals_stem}_transcript.txt")),
        identification_json: work_dir.join(format!("{name}_song_identification.json")),
        lyrics_txt: work_dir.join(format!("{name}_lyrics.txt")),
        verification_json: work_dir.join(format!("{name}_lyrics_verification.json")),
        lrc: work_dir.join(format!("{name}.lrc")),
        corrected_lrc: work_dir.join(format!("{name}_corrected.lrc")),
        song_story_json: work_dir.join(format!("{name}_song_story.json")),
        explanation_txt: work_dir.join(format!("{name}_explanation.txt")),
        output_lrc: output_root.join(&parent).join(format!("{name}.lrc")),
        work_dir,
        relative_path,
    }
}

/// Relative path under `input_root`, or just the file name when the file lives
/// elsewhere or the relative path would climb out of the root
fn relative_to_root(input_file: &Path, input_root: &Path) -> PathBuf {
    match input_file.strip_prefix(input_root) {
        Ok(rel)
            if !rel.as_os_str().is_empty()
                && rel.components().all(|c| matches!(c, Component::Normal(_))) =>
        {
            rel.to_path_buf()
        }
        _ => {
            warn!(
                file = %input_file.display(),
                root = %input_root.display(),
                "Input file is not under the input root, using flat layout"
            );
            input_file
                .file_name()
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("unnamed"))
        }
    }
}

/// Create the per-file temp directory and the output parent directory
pub fn ensure_directories(paths: &ArtifactPaths) -> Result<(), StageError> {
    fs::create_dir_all(&paths.work_dir).map_err(|e| {
        StageError::io(
            format!("Failed to create work directory {}", paths.work_dir.display()),
            e,
        )
    })?;
    if let Some(parent) = paths.output_lrc.parent() {
        fs::create_dir_all(parent).map_err(|e| {
            StageError::io(
                format!("Failed to create output directory {}", parent.display()),
                e,
            )
        })?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn plan_default(file: &str) -> ArtifactPaths {
        plan(
            Path::new(file),
            Path::new("/music"),
            Path::new("/out"),
            Path::new("/tmp/work"),
            DEFAULT_VOCALS_TAG,
        )
    }

    #[test]
    fn test_plan_is_deterministic() {
        let a = plan_default("/music/anime/LiSA/Gurenge.flac");
        let b = plan_default("/music/anime/LiSA/Gurenge.flac");
        assert_eq!(a, b);
    }

    #[test]
    fn test_plan_mirrors_nested_structure() {
        let paths = plan_default("/music/anime/LiSA/Gurenge.flac");
        assert_eq!(paths.relative_path, PathBuf::from("anime/LiSA/Gurenge.flac"));
        assert_eq!(paths.work_dir, PathBuf::from("/tmp/work/anime/LiSA/Gurenge"));
        assert_eq!(
            paths.vocals_wav,
            PathBuf::from("/tmp/work/anime/LiSA/Gurenge/Gurenge_(Vocals)_UVR_MDXNET_Main.wav")
        );
        assert_eq!(
            paths.transcript_txt,
            PathBuf::from(
                "/tmp/work/anime/LiSA/Gurenge/Gurenge_(Vocals)_UVR_MDXNET_Main_transcript.txt"
            )
        );
        assert_eq!(
            paths.identification_json,
            PathBuf::from("/tmp/work/anime/LiSA/Gurenge/Gurenge_song_identification.json")
        );
        assert_eq!(paths.output_lrc, PathBuf::from("/out/anime/LiSA/Gurenge.lrc"));
    }

    #[test]
    fn test_plan_second_phase_artifacts() {
        let paths = plan_default("/music/anime/Gurenge.flac");
        let work = PathBuf::from("/tmp/work/anime/Gurenge");
        assert_eq!(paths.corrected_lrc, work.join("Gurenge_corrected.lrc"));
        assert_eq!(paths.song_story_json, work.join("Gurenge_song_story.json"));
        assert_eq!(paths.explanation_txt, work.join("Gurenge_explanation.txt"));
    }

    #[test]
    fn test_plan_falls_back_to_file_name_outside_root() {
        let paths = plan_default("/elsewhere/deep/Song.mp3");
        assert_eq!(paths.relative_path, PathBuf::from("Song.mp3"));
        assert_eq!(paths.work_dir, PathBuf::from("/tmp/work/Song"));
        assert_eq!(paths.output_lrc, PathBuf::from("/out/Song.lrc"));
    }

    #[test]
    fn test_plan_keeps_dotted_stems() {
        let paths = plan_default("/music/01. Intro.flac");
        assert_eq!(paths.lrc, PathBuf::from("/tmp/work/01. Intro/01. Intro.lrc"));
        assert_eq!(paths.output_lrc, PathBuf::from("/out/01. Intro.lrc"));
    }

    #[test]
    fn test_artifact_paths_are_distinct() {
        let paths = plan_default("/music/a/b.flac");
        let mut all: Vec<_> = StageKind::ALL.iter().map(|s| paths.artifact(*s)).collect();
        all.sort();
        all.dedup();
        assert_eq!(all.len(), StageKind::ALL.len());
    }

    #[test]
    fn test_ensure_directories_creates_tree() {
        let dir = TempDir::new().unwrap();
        let input_root = dir.path().join("in");
        let paths = plan(
            &input_root.join("x/y/song.flac"),
            &input_root,
            &dir.path().join("out"),
            &dir.path().join("tmp"),
            DEFAULT_VOCALS_TAG,
        );
        ensure_directories(&paths).unwrap();
        assert!(paths.work_dir.is_dir());
        assert!(paths.output_lrc.parent().unwrap().is_dir());
    }
}
