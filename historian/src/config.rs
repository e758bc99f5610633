//! Historian configuration
//!
//! Loaded from a TOML file where every key is optional, then overlaid with
//! environment variables for secrets and endpoints.

use crate::error::{HistorianError, HistorianResult};
use crate::fetch::FetchPolicy;
use model::{OpenAiConfig, DEFAULT_MODEL};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::debug;

pub const ENV_GITHUB_TOKEN: &str = "GITHUB_TOKEN";
pub const ENV_OPENAI_API_KEY: &str = "OPENAI_API_KEY";
pub const ENV_GITHUB_API: &str = "HISTORIAN_GITHUB_API";
pub const ENV_LLM_BASE_URL: &str = "HISTORIAN_LLM_BASE_URL";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HistorianConfig {
    pub github: GithubSection,
    pub fetch: FetchSection,
    pub batch: BatchSection,
    pub llm: LlmSection,
    pub tree: TreeSection,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GithubSection {
    pub api_base: String,
    #[serde(skip_serializing)]
    pub token: Option<String>,
    pub user_agent: String,
    pub per_page: u32,
}

impl Default for GithubSection {
    fn default() -> Self {
        Self {
            api_base: "https://api.github.com".to_string(),
            token: None,
            user_agent: concat!("git-historian/", env!("CARGO_PKG_VERSION")).to_string(),
            per_page: 100,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchSection {
    pub max_retries: u32,
    pub timeout_ms: u64,
    pub base_delay_ms: u64,
    pub server_error_cap_ms: u64,
    pub rate_limit_cap_ms: u64,
}

impl Default for FetchSection {
    fn default() -> Self {
        Self {
            max_retries: 3,
            timeout_ms: 30_000,
            base_delay_ms: 1_000,
            server_error_cap_ms: 5_000,
            rate_limit_cap_ms: 10_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchSection {
    /// Model whose tokenizer sizes the batches
    pub model: String,
    pub max_tokens: usize,
}

impl Default for BatchSection {
    fn default() -> Self {
        Self {
            model: DEFAULT_MODEL.to_string(),
            max_tokens: 8000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmSection {
    pub base_url: String,
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
    pub model: String,
    pub temperature: f32,
    pub max_tokens: Option<u32>,
    pub timeout_ms: u64,
    /// Prior conversation turns forwarded with each request
    pub history_window: usize,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".to_string(),
            api_key: None,
            model: DEFAULT_MODEL.to_string(),
            temperature: 0.7,
            max_tokens: None,
            timeout_ms: 30_000,
            history_window: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TreeSection {
    /// Glob patterns for paths left out of file-tree snapshots
    pub exclude: Vec<String>,
}

impl Default for TreeSection {
    fn default() -> Self {
        Self {
            exclude: ["node_modules", "node_modules/**", "**/node_modules", "**/node_modules/**"]
                .iter()
                .map(|p| p.to_string())
                .collect(),
        }
    }
}

impl HistorianConfig {
    pub fn from_toml_str(source: &str) -> HistorianResult<Self> {
        toml::from_str(source).map_err(|e| HistorianError::InvalidConfig {
            message: e.to_string(),
        })
    }

    /// Reads the file when it exists, applies environment overrides and
    /// validates the result.
    pub fn load(path: Option<&Path>) -> HistorianResult<Self> {
        let mut config = match path {
            Some(path) if path.exists() => {
                debug!("Loading configuration from {}", path.display());
                let source = std::fs::read_to_string(path).map_err(|e| {
                    HistorianError::InvalidConfig {
                        message: format!("{}: {}", path.display(), e),
                    }
                })?;
                Self::from_toml_str(&source)?
            }
            Some(path) => {
                debug!("No configuration at {}, using defaults", path.display());
                Self::default()
            }
            None => Self::default(),
        };

        config.apply_env();
        config
            .validate()
            .map_err(|message| HistorianError::InvalidConfig { message })?;
        Ok(config)
    }

    pub fn apply_env(&mut self) {
        if let Some(token) = non_empty_env(ENV_GITHUB_TOKEN) {
            self.github.token = Some(token);
        }
        if let Some(key) = non_empty_env(ENV_OPENAI_API_KEY) {
            self.llm.api_key = Some(key);
        }
        if let Some(api_base) = non_empty_env(ENV_GITHUB_API) {
            self.github.api_base = api_base;
        }
        if let Some(base_url) = non_empty_env(ENV_LLM_BASE_URL) {
            self.llm.base_url = base_url;
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        check_http_url("github.api_base", &self.github.api_base)?;
        check_http_url("llm.base_url", &self.llm.base_url)?;

        if self.github.per_page == 0 || self.github.per_page > 100 {
            return Err("github.per_page must be between 1 and 100".to_string());
        }
        if self.fetch.max_retries == 0 {
            return Err("fetch.max_retries must be greater than 0".to_string());
        }
        if self.fetch.timeout_ms == 0 {
            return Err("fetch.timeout_ms must be greater than 0".to_string());
        }
        if self.batch.max_tokens == 0 {
            return Err("batch.max_tokens must be greater than 0".to_string());
        }
        if self.batch.model.trim().is_empty() {
            return Err("batch.model cannot be empty".to_string());
        }
        if self.llm.timeout_ms == 0 {
            return Err("llm.timeout_ms must be greater than 0".to_string());
        }

        for pattern in &self.tree.exclude {
            glob::Pattern::new(pattern)
                .map_err(|e| format!("Invalid tree.exclude pattern '{}': {}", pattern, e))?;
        }

        self.openai_config().validate()
    }

    pub fn fetch_policy(&self) -> FetchPolicy {
        FetchPolicy {
            max_retries: self.fetch.max_retries,
            timeout: Duration::from_millis(self.fetch.timeout_ms),
            base_delay: Duration::from_millis(self.fetch.base_delay_ms),
            server_error_cap: Duration::from_millis(self.fetch.server_error_cap_ms),
            rate_limit_cap: Duration::from_millis(self.fetch.rate_limit_cap_ms),
        }
    }

    pub fn openai_config(&self) -> OpenAiConfig {
        let mut config = OpenAiConfig::new()
            .with_base_url(&self.llm.base_url)
            .with_model(&self.llm.model)
            .with_temperature(self.llm.temperature)
            .with_timeout(Duration::from_millis(self.llm.timeout_ms));
        if let Some(key) = &self.llm.api_key {
            config = config.with_api_key(key);
        }
        if let Some(max_tokens) = self.llm.max_tokens {
            config = config.with_max_tokens(max_tokens);
        }
        config
    }

    /// Compiled exclude patterns. Invalid ones are rejected by `validate`.
    pub fn exclude_patterns(&self) -> Vec<glob::Pattern> {
        self.tree
            .exclude
            .iter()
            .filter_map(|p| glob::Pattern::new(p).ok())
            .collect()
    }
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn check_http_url(field: &str, url: &str) -> Result<(), String> {
    if url.starts_with("http://") || url.starts_with("https://") {
        Ok(())
    } else {
        Err(format!("{} must start with http:// or https://", field))
    }
}
