use anyhow::{Context, Result};
use glob::{glob_with, MatchOptions};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Audio files under `input_dir` with one of `extensions`, recursively.
///
/// Extension matching ignores case; hidden files and anything under
/// `excluded` (the temp and output roots) are skipped. The result is sorted
/// and free of duplicates.
pub fn discover(input_dir: &Path, extensions: &[String], excluded: &[&Path]) -> Result<Vec<PathBuf>> {
    let options = MatchOptions {
        case_sensitive: false,
        require_literal_separator: true,
        require_literal_leading_dot: true,
    };
    let root = glob::Pattern::escape(&input_dir.to_string_lossy());

    let mut files = Vec::new();
    for ext in extensions {
        let pattern = format!("{root}/**/*.{}", glob::Pattern::escape(ext));
        let entries = glob_with(&pattern, options)
            .with_context(|| format!("Invalid discovery pattern: {pattern}"))?;
        for entry in entries {
            match entry {
                Ok(path) if path.is_file() => files.push(path),
                Ok(_) => {}
                Err(e) => debug!(error = %e, "Skipping unreadable path during discovery"),
            }
        }
    }

    files.retain(|f| !excluded.iter().any(|dir| f.starts_with(dir)));
    files.sort();
    files.dedup();
    Ok(files)
}
