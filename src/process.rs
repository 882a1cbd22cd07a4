use crate::error::StageError;
use crate::types::ProcessOutput;
use glob::glob;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;

/// Quote a value for interpolation into an `sh -c` command line
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// Expand `{name}` placeholders with shell-quoted paths.
/// Placeholders without a binding are left as-is.
pub fn expand_pattern(pattern: &str, bindings: &[(&str, &Path)]) -> String {
    bindings
        .iter()
        .fold(pattern.to_string(), |expanded, (name, path)| {
            expanded.replace(
                &format!("{{{name}}}"),
                &shell_quote(&path.to_string_lossy()),
            )
        })
}

/// Run a shell command and capture output.
///
/// The child is killed if the returned future is dropped, so wrapping this in
/// a timeout never leaves an orphaned model process behind.
pub async fn run_command(command: &str) -> Result<ProcessOutput, StageError> {
    let output = Command::new("sh")
        .arg("-c")
        .arg(command)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| StageError::io(format!("Failed to execute `{command}`"), e))?;

    Ok(ProcessOutput {
        stdout: String::from_utf8_lossy(&output.stdout).to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        exit_code: output.status.code().unwrap_or(-1),
    })
}

/// Last few lines of a command's stderr, for error messages
pub fn stderr_tail(output: &ProcessOutput) -> String {
    let lines: Vec<&str> = output
        .stderr
        .lines()
        .filter(|l| !l.trim().is_empty())
        .collect();
    lines[lines.len().saturating_sub(5)..].join(" | ")
}

/// Files under `dir` matching `pattern`, sorted
pub fn find_matching(dir: &Path, pattern: &str) -> Vec<PathBuf> {
    let full = format!(
        "{}/{pattern}",
        glob::Pattern::escape(&dir.to_string_lossy())
    );
    let mut files: Vec<PathBuf> = match glob(&full) {
        Ok(paths) => paths
            .filter_map(|entry| entry.ok())
            .filter(|p| p.is_file())
            .collect(),
        Err(_) => Vec::new(),
    };
    files.sort();
    files
}
