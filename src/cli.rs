use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug, Clone)]
#[command(name = "lrc-batch-runner")]
#[command(about = "Turn a folder of audio files into synchronized, translated LRC lyrics")]
#[command(version)]
pub struct Cli {
    /// Input directory containing audio files (searched recursively)
    #[arg(default_value = "input")]
    pub input_dir: PathBuf,

    /// Output directory for final bilingual LRC files
    #[arg(short, long, default_value = "output")]
    pub output_dir: PathBuf,

    /// Directory for intermediate per-file artifacts
    #[arg(short, long, default_value = "tmp")]
    pub temp_dir: PathBuf,

    /// Reuse valid artifacts from a previous run instead of recomputing them
    #[arg(long)]
    pub resume: bool,

    /// Logging level (RUST_LOG overrides)
    #[arg(long, default_value = "info", value_parser = ["error", "warn", "info", "debug", "trace"], ignore_case = true)]
    pub log_level: String,

    /// CSV report path (default: results_<timestamp>.csv)
    #[arg(short, long)]
    pub csv_output: Option<PathBuf>,

    /// Target language for translation
    #[arg(long, default_value = "Traditional Chinese")]
    pub target_language: String,

    /// Number of concurrent workers for identification, search, generation and translation
    #[arg(short = 'w', long, default_value = "4")]
    pub max_workers: usize,

    /// Audio file extensions to process
    #[arg(long, value_delimiter = ',', default_value = "flac,mp3")]
    pub extensions: Vec<String>,

    /// Vocal separation command ({input} and {output_dir} substituted)
    #[arg(long, default_value = "audio-separator {input} --output_dir {output_dir}")]
    pub separator_cmd: String,

    /// Transcription command ({vocals} substituted); prints timestamped segments
    #[arg(long, default_value = "whisper-timestamps {vocals}")]
    pub transcriber_cmd: String,

    /// LRCLIB-compatible lyrics API base URL
    #[arg(long, default_value = "https://lrclib.net")]
    pub lyrics_api_url: String,

    /// Timeout for network stages, in seconds
    #[arg(long, default_value = "300")]
    pub network_timeout_secs: u64,

    /// Timeout for separation and transcription, in seconds
    #[arg(long, default_value = "1800")]
    pub model_timeout_secs: u64,

    /// Client-side request budget for LLM calls
    #[arg(long, default_value = "60")]
    pub requests_per_minute: u32,
}

impl Cli {
    /// Validate argument combinations clap can't express
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_workers == 0 {
            anyhow::bail!("--max-workers must be at least 1");
        }
        if self.extensions.iter().all(|e| e.trim().is_empty()) {
            anyhow::bail!("--extensions must name at least one extension");
        }
        if self.requests_per_minute == 0 {
            anyhow::bail!("--requests-per-minute must be at least 1");
        }
        if self.network_timeout_secs == 0 || self.model_timeout_secs == 0 {
            anyhow::bail!("timeouts must be at least one second");
        }
        Ok(())
    }
}
