use crate::cli::Cli;
use crate::paths::DEFAULT_VOCALS_TAG;
use crate::types::StageKind;
use anyhow::Context;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Confidence thresholds, fixed for the whole run
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GateConfig {
    /// Score an identification must exceed, per attempt (1-based order)
    pub identification_thresholds: Vec<f64>,
    /// Minimum verification score to proceed to LRC generation
    pub verification_threshold: f64,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            identification_thresholds: vec![0.7, 0.5, 0.3],
            verification_threshold: 0.6,
        }
    }
}

/// Bounded timeouts for every external call
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StageTimeouts {
    pub metadata: Duration,
    /// Separation and transcription
    pub model: Duration,
    /// Identification, search, verification, generation, translation
    pub network: Duration,
}

impl StageTimeouts {
    pub fn for_stage(&self, stage: StageKind) -> Duration {
        match stage {
            StageKind::Metadata => self.metadata,
            StageKind::Separation | StageKind::Transcription => self.model,
            _ => self.network,
        }
    }
}

impl Default for StageTimeouts {
    fn default() -> Self {
        Self {
            metadata: Duration::from_secs(60),
            model: Duration::from_secs(1800),
            network: Duration::from_secs(300),
        }
    }
}

/// OpenAI-compatible endpoint settings
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LlmConfig {
    pub base_url: String,
    #[serde(skip_serializing)]
    pub api_key: String,
    pub model: String,
}

impl LlmConfig {
    /// Read `OPENAI_BASE_URL`, `OPENAI_API_KEY` and `OPENAI_MODEL`
    pub fn from_env() -> anyhow::Result<Self> {
        Ok(Self {
            base_url: required_env("OPENAI_BASE_URL")?,
            api_key: required_env("OPENAI_API_KEY")?,
            model: required_env("OPENAI_MODEL")?,
        })
    }

    /// `TRANSLATION_*` variables override the general endpoint field by field
    pub fn translation_from_env(general: &LlmConfig) -> Self {
        Self {
            base_url: optional_env("TRANSLATION_BASE_URL").unwrap_or_else(|| general.base_url.clone()),
            api_key: optional_env("TRANSLATION_API_KEY").unwrap_or_else(|| general.api_key.clone()),
            model: optional_env("TRANSLATION_MODEL").unwrap_or_else(|| general.model.clone()),
        }
    }
}

fn optional_env(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn required_env(name: &str) -> anyhow::Result<String> {
    optional_env(name).with_context(|| format!("Missing required environment variable {name}"))
}

/// Memory-pressure thresholds for pausing model stages
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MemoryConfig {
    pub high_percent: f64,
    pub low_percent: f64,
    pub check_interval: Duration,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            high_percent: 90.0,
            low_percent: 75.0,
            check_interval: Duration::from_secs(2),
        }
    }
}

/// Configuration for one batch run, built once at startup
#[derive(Debug, Clone, Serialize)]
pub struct Config {
    pub input_dir: PathBuf,
    pub output_dir: PathBuf,
    pub temp_dir: PathBuf,
    pub csv_output: PathBuf,
    /// Reuse valid artifacts from earlier runs
    pub resume: bool,
    pub target_language: String,
    /// Worker pool size for the second phase
    pub max_workers: usize,
    /// Lower-case extensions without the dot
    pub extensions: Vec<String>,
    /// Separation model tag embedded in vocals artifact names
    pub vocals_tag: String,
    pub separator_cmd: String,
    pub transcriber_cmd: String,
    pub lyrics_api_url: String,
    pub requests_per_minute: u32,
    pub timeouts: StageTimeouts,
    pub gate: GateConfig,
    pub memory: MemoryConfig,
    pub llm: LlmConfig,
    pub translation_llm: LlmConfig,
}

impl Config {
    /// Defaults for everything except the three directories
    pub fn new(input_dir: impl Into<PathBuf>, output_dir: impl Into<PathBuf>, temp_dir: impl Into<PathBuf>) -> Self {
        let output_dir = output_dir.into();
        Self {
            input_dir: input_dir.into(),
            csv_output: default_csv_path(),
            output_dir,
            temp_dir: temp_dir.into(),
            resume: false,
            target_language: "Traditional Chinese".to_string(),
            max_workers: 4,
            extensions: vec!["flac".to_string(), "mp3".to_string()],
            vocals_tag: DEFAULT_VOCALS_TAG.to_string(),
            separator_cmd: "audio-separator {input} --output_dir {output_dir}".to_string(),
            transcriber_cmd: "whisper-timestamps {vocals}".to_string(),
            lyrics_api_url: "https://lrclib.net".to_string(),
            requests_per_minute: 60,
            timeouts: StageTimeouts::default(),
            gate: GateConfig::default(),
            memory: MemoryConfig::default(),
            llm: LlmConfig::default(),
            translation_llm: LlmConfig::default(),
        }
    }

    /// Create a config from CLI arguments and the environment
    pub fn from_cli(cli: &Cli) -> anyhow::Result<Self> {
        let llm = LlmConfig::from_env()?;
        let translation_llm = LlmConfig::translation_from_env(&llm);

        let mut config = Self::new(&cli.input_dir, &cli.output_dir, &cli.temp_dir);
        if let Some(ref csv) = cli.csv_output {
            config.csv_output = csv.clone();
        }
        config.resume = cli.resume;
        config.target_language = cli.target_language.clone();
        config.max_workers = cli.max_workers;
        config.extensions = normalize_extensions(&cli.extensions);
        config.separator_cmd = cli.separator_cmd.clone();
        config.transcriber_cmd = cli.transcriber_cmd.clone();
        config.lyrics_api_url = cli.lyrics_api_url.trim_end_matches('/').to_string();
        config.requests_per_minute = cli.requests_per_minute;
        config.timeouts.model = Duration::from_secs(cli.model_timeout_secs);
        config.timeouts.network = Duration::from_secs(cli.network_timeout_secs);
        config.llm = llm;
        config.translation_llm = translation_llm;
        Ok(config)
    }

    /// Checks that must pass before any file is touched
    pub fn validate(&self) -> anyhow::Result<()> {
        if !self.input_dir.is_dir() {
            anyhow::bail!("Input directory does not exist: {}", self.input_dir.display());
        }
        if self.max_workers == 0 {
            anyhow::bail!("max_workers must be at least 1");
        }
        if self.gate.identification_thresholds.is_empty() {
            anyhow::bail!("at least one identification threshold is required");
        }
        let in_range = |t: &f64| (0.0..=1.0).contains(t);
        if !self.gate.identification_thresholds.iter().all(in_range)
            || !in_range(&self.gate.verification_threshold)
        {
            anyhow::bail!("confidence thresholds must lie in [0, 1]");
        }
        if same_dir(&self.input_dir, &self.temp_dir) || same_dir(&self.input_dir, &self.output_dir) {
            anyhow::bail!("temp and output directories must differ from the input directory");
        }
        Ok(())
    }
}

fn same_dir(a: &Path, b: &Path) -> bool {
    match (a.canonicalize(), b.canonicalize()) {
        (Ok(a), Ok(b)) => a == b,
        _ => a == b,
    }
}

fn normalize_extensions(extensions: &[String]) -> Vec<String> {
    let mut out: Vec<String> = extensions
        .iter()
        .map(|e| e.trim().trim_start_matches('.').to_ascii_lowercase())
        .filter(|e| !e.is_empty())
        .collect();
    out.sort();
    out.dedup();
    out
}

/// `results_<YYYYmmddHHMMSS>.csv` in the current directory
pub fn default_csv_path() -> PathBuf {
    PathBuf::from(format!(
        "results_{}.csv",
        chrono::Local::now().format("%Y%m%d%H%M%S")
    ))
}
