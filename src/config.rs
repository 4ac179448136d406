use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::prompt::PromptSpec;

pub const DEFAULT_PROMPT: &str =
    "Write a long story, no less than 10,000 words, starting from a long, long time ago.";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub endpoint: EndpointConfig,
    #[serde(default)]
    pub load: LoadConfig,
    #[serde(default)]
    pub input: InputConfig,
    #[serde(default)]
    pub output: OutputConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointConfig {
    pub base_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>, // If not provided, will auto-detect from server
    #[serde(default = "default_timeout")]
    pub timeout: u64,
    #[serde(default)]
    pub health_check_timeout: u64, // Seconds to wait for server readiness (0 = disabled)
    #[serde(default = "default_health_check_interval")]
    pub health_check_interval: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadConfig {
    #[serde(default = "default_concurrency")]
    pub concurrency: Vec<usize>,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    /// One-way latency estimate in milliseconds; probed when absent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub network_latency_ms: Option<f64>,
    /// Per-worker request lifecycle bound in seconds.
    #[serde(default = "default_request_timeout")]
    pub request_timeout: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InputConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub num_words: Option<usize>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OutputConfig {
    #[serde(default)]
    pub format: OutputFormat,
    #[serde(default)]
    pub quiet: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default = "default_worker_threads")]
    pub worker_threads: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    #[serde(default = "default_log_level")]
    pub level: LogLevel,
    /// Per-module log level overrides (e.g., ["hyper=info", "h2=warn"])
    #[serde(default)]
    pub filter: Vec<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn to_level_filter(&self) -> log::LevelFilter {
        match self {
            LogLevel::Error => log::LevelFilter::Error,
            LogLevel::Warn => log::LevelFilter::Warn,
            LogLevel::Info => log::LevelFilter::Info,
            LogLevel::Debug => log::LevelFilter::Debug,
            LogLevel::Trace => log::LevelFilter::Trace,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Console,
    Json,
}

impl Default for LoadConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            max_tokens: default_max_tokens(),
            network_latency_ms: None,
            request_timeout: default_request_timeout(),
        }
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            worker_threads: default_worker_threads(),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            filter: Vec::new(),
        }
    }
}

fn default_timeout() -> u64 {
    120
}

fn default_health_check_interval() -> u64 {
    5
}

fn default_concurrency() -> Vec<usize> {
    vec![1, 2, 4, 8, 16, 32, 64, 128]
}

fn default_max_tokens() -> u32 {
    512
}

fn default_request_timeout() -> u64 {
    90
}

fn default_worker_threads() -> usize {
    num_cpus::get()
}

fn default_log_level() -> LogLevel {
    LogLevel::Info
}

impl Config {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml(&contents)
    }

    pub fn from_toml(contents: &str) -> anyhow::Result<Self> {
        let config: Config = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.endpoint.base_url.trim().is_empty() {
            anyhow::bail!("endpoint.base_url must not be empty");
        }

        if self.load.concurrency.is_empty() {
            anyhow::bail!("load.concurrency must list at least one level");
        }

        if self.load.concurrency.contains(&0) {
            anyhow::bail!("concurrency levels must be greater than 0");
        }

        if self.load.max_tokens == 0 {
            anyhow::bail!("max_tokens must be greater than 0");
        }

        if self.load.request_timeout == 0 {
            anyhow::bail!("request_timeout must be greater than 0");
        }

        if let Some(latency) = self.load.network_latency_ms {
            if !latency.is_finite() || latency < 0.0 {
                anyhow::bail!("network_latency_ms must be a non-negative number");
            }
        }

        match (&self.input.prompt, self.input.num_words) {
            (Some(_), Some(_)) => anyhow::bail!("Only one of input.prompt or input.num_words can be specified"),
            (_, Some(0)) => anyhow::bail!("num_words must be greater than 0"),
            _ => {}
        }

        if self.runtime.worker_threads == 0 {
            anyhow::bail!("worker_threads must be greater than 0");
        }

        Ok(())
    }

    /// Fixed prompt, random phrases, or the default story prompt.
    pub fn prompt_spec(&self) -> PromptSpec {
        match (&self.input.prompt, self.input.num_words) {
            (_, Some(words)) => PromptSpec::random(words),
            (Some(text), None) => PromptSpec::fixed(text.clone()),
            (None, None) => PromptSpec::fixed(DEFAULT_PROMPT),
        }
    }

    pub fn max_concurrency(&self) -> usize {
        self.load.concurrency.iter().copied().max().unwrap_or(1)
    }
}
