//! Intake configuration loaded from `intake.toml`.
//!
//! [`IntakeConfig`] holds every tunable. Fields missing from the file use
//! defaults, and environment variables override the file.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::Deserialize;

use crate::document::IngestLimits;
use crate::executor::ExecutorConfig;
use crate::orchestrator::PipelineSettings;
use crate::state_machine::RetryConfig;

pub const DEFAULT_CONFIG_FILE: &str = "intake.toml";

const MIN_INPUT_CHARS: usize = 4_000;

/// Which validator runs in the VALIDATE stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValidatorMode {
    /// Deterministic policy rules, no model call.
    Rules,
    /// Anthropic model grounded on the retrieved policy chunks.
    Llm,
}

impl std::str::FromStr for ValidatorMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "rules" => Ok(ValidatorMode::Rules),
            "llm" => Ok(ValidatorMode::Llm),
            other => Err(format!("unknown validator mode `{other}` (expected rules or llm)")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Pretty,
    Json,
}

impl std::str::FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "pretty" | "text" => Ok(LogFormat::Pretty),
            "json" => Ok(LogFormat::Json),
            other => Err(format!("unknown log format `{other}` (expected pretty or json)")),
        }
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct IntakeConfig {
    /// Anthropic API key. Empty means offline mode: pattern extraction and rule validation.
    pub api_key: String,
    pub extraction_model: String,
    pub validation_model: String,
    pub llm_timeout_secs: u64,

    pub extraction_max_retries: u32,
    pub validation_max_retries: u32,
    pub retry_base_delay_ms: u64,
    pub extraction_max_input_chars: usize,
    pub max_upload_size_bytes: usize,

    /// How long a submitter waits before getting the deferred response.
    pub sync_timeout_secs: u64,
    pub pipeline_workers: usize,
    pub queue_capacity: usize,
    pub idempotency_enabled: bool,
    pub stale_job_ttl_secs: u64,
    pub result_retention_secs: u64,
    pub reaper_interval_secs: u64,

    pub retrieval_k: usize,
    pub policy_dir: PathBuf,
    pub policy_threshold: f64,
    pub confidence_threshold: f64,
    pub validator: ValidatorMode,

    pub store_path: PathBuf,
    pub log_level: String,
    pub log_format: LogFormat,
}

impl Default for IntakeConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            extraction_model: "claude-sonnet-4-5-20250929".to_string(),
            validation_model: "claude-sonnet-4-5-20250929".to_string(),
            llm_timeout_secs: 60,
            extraction_max_retries: 1,
            validation_max_retries: 1,
            retry_base_delay_ms: 250,
            extraction_max_input_chars: 24_000,
            max_upload_size_bytes: 10 * 1024 * 1024,
            sync_timeout_secs: 30,
            pipeline_workers: 4,
            queue_capacity: 32,
            idempotency_enabled: true,
            stale_job_ttl_secs: 600,
            result_retention_secs: 3600,
            reaper_interval_secs: 30,
            retrieval_k: 4,
            policy_dir: PathBuf::from("./data/policies"),
            policy_threshold: 500_000.0,
            confidence_threshold: 0.8,
            validator: ValidatorMode::Rules,
            store_path: PathBuf::from("./intake-store.json"),
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
        }
    }
}

fn parse_env<T: std::str::FromStr>(name: &str, raw: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    raw.trim()
        .parse::<T>()
        .map_err(|e| anyhow::anyhow!("invalid value for {name}: `{raw}` ({e})"))
}

fn parse_flag(name: &str, raw: &str) -> Result<bool> {
    match raw.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => bail!("invalid value for {name}: `{raw}` (expected true or false)"),
    }
}

impl IntakeConfig {
    /// Load from `path` (or `intake.toml` in the working directory) and
    /// apply environment overrides. A missing file yields the defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = path.unwrap_or_else(|| Path::new(DEFAULT_CONFIG_FILE));
        let mut config = if path.exists() {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            toml::from_str::<IntakeConfig>(&contents)
                .with_context(|| format!("parsing {}", path.display()))?
        } else {
            Self::default()
        };

        config.apply_env(|name| std::env::var(name).ok())?;
        config.clamp();
        Ok(config)
    }

    /// Override fields from environment variables looked up through `lookup`.
    /// Empty values are ignored.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        if let Some(v) = get("ANTHROPIC_API_KEY") {
            self.api_key = v;
        }
        if let Some(v) = get("EXTRACTION_MODEL") {
            self.extraction_model = v;
        }
        if let Some(v) = get("VALIDATION_MODEL") {
            self.validation_model = v;
        }
        if let Some(v) = get("LLM_TIMEOUT_SECONDS") {
            self.llm_timeout_secs = parse_env("LLM_TIMEOUT_SECONDS", &v)?;
        }
        if let Some(v) = get("EXTRACTION_MAX_RETRIES") {
            self.extraction_max_retries = parse_env("EXTRACTION_MAX_RETRIES", &v)?;
        }
        if let Some(v) = get("VALIDATION_MAX_RETRIES") {
            self.validation_max_retries = parse_env("VALIDATION_MAX_RETRIES", &v)?;
        }
        if let Some(v) = get("EXTRACTION_MAX_INPUT_CHARS") {
            self.extraction_max_input_chars = parse_env("EXTRACTION_MAX_INPUT_CHARS", &v)?;
        }
        if let Some(v) = get("MAX_UPLOAD_SIZE_BYTES") {
            self.max_upload_size_bytes = parse_env("MAX_UPLOAD_SIZE_BYTES", &v)?;
        }
        if let Some(v) = get("WEBHOOK_SYNC_TIMEOUT_SECONDS") {
            self.sync_timeout_secs = parse_env("WEBHOOK_SYNC_TIMEOUT_SECONDS", &v)?;
        }
        if let Some(v) = get("PIPELINE_WORKERS") {
            self.pipeline_workers = parse_env("PIPELINE_WORKERS", &v)?;
        }
        if let Some(v) = get("PIPELINE_QUEUE_CAPACITY") {
            self.queue_capacity = parse_env("PIPELINE_QUEUE_CAPACITY", &v)?;
        }
        if let Some(v) = get("WEBHOOK_IDEMPOTENCY_ENABLED") {
            self.idempotency_enabled = parse_flag("WEBHOOK_IDEMPOTENCY_ENABLED", &v)?;
        }
        if let Some(v) = get("STALE_JOB_TTL_SECONDS") {
            self.stale_job_ttl_secs = parse_env("STALE_JOB_TTL_SECONDS", &v)?;
        }
        if let Some(v) = get("RESULT_RETENTION_SECONDS") {
            self.result_retention_secs = parse_env("RESULT_RETENTION_SECONDS", &v)?;
        }
        if let Some(v) = get("RETRIEVAL_K") {
            self.retrieval_k = parse_env("RETRIEVAL_K", &v)?;
        }
        if let Some(v) = get("POLICY_DIR") {
            self.policy_dir = PathBuf::from(v);
        }
        if let Some(v) = get("POLICY_THRESHOLD") {
            self.policy_threshold = parse_env("POLICY_THRESHOLD", &v)?;
        }
        if let Some(v) = get("VALIDATOR_MODE") {
            self.validator = parse_env("VALIDATOR_MODE", &v)?;
        }
        if let Some(v) = get("STORE_PATH") {
            self.store_path = PathBuf::from(v);
        }
        if let Some(v) = get("LOG_LEVEL") {
            self.log_level = v;
        }
        if let Some(v) = get("LOG_FORMAT") {
            self.log_format = parse_env("LOG_FORMAT", &v)?;
        }
        Ok(())
    }

    /// Raise values below their floors.
    pub fn clamp(&mut self) {
        self.pipeline_workers = self.pipeline_workers.max(1);
        self.queue_capacity = self.queue_capacity.max(1);
        self.retrieval_k = self.retrieval_k.max(1);
        self.extraction_max_input_chars = self.extraction_max_input_chars.max(MIN_INPUT_CHARS);
    }

    pub fn has_api_key(&self) -> bool {
        !self.api_key.trim().is_empty()
    }

    pub fn pipeline_settings(&self) -> PipelineSettings {
        PipelineSettings {
            retry: RetryConfig {
                extract_max_retries: self.extraction_max_retries,
                validate_max_retries: self.validation_max_retries,
                base_delay_ms: self.retry_base_delay_ms,
            },
            ingest: IngestLimits {
                max_bytes: self.max_upload_size_bytes,
            },
            max_input_chars: self.extraction_max_input_chars,
        }
    }

    pub fn executor_config(&self) -> ExecutorConfig {
        ExecutorConfig {
            workers: self.pipeline_workers,
            queue_capacity: self.queue_capacity,
            sync_timeout: Duration::from_secs(self.sync_timeout_secs),
            stale_job_ttl: Duration::from_secs(self.stale_job_ttl_secs),
            result_retention: Duration::from_secs(self.result_retention_secs),
            reaper_interval: Duration::from_secs(self.reaper_interval_secs),
        }
    }
}
