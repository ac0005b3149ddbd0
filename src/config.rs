//! Configuration management for patchflow
//!
//! Layers, lowest to highest: built-in defaults, a TOML file
//! (`--config <path>` or `~/.config/patchflow/config.toml`), then environment
//! variables. Secrets never live here; see [`crate::credentials`].

use crate::github::{DEFAULT_API_BASE_URL, DEFAULT_BRANCH_PREFIX};
use crate::guard::ValidationLimits;
use crate::jobs::DEFAULT_JOB_RETENTION;
use crate::llm::providers::{
    DEFAULT_GEMINI_BASE_URL, DEFAULT_GEMINI_MODEL, DEFAULT_OLLAMA_HOST, DEFAULT_OLLAMA_MODEL,
    DEFAULT_OPENAI_BASE_URL, DEFAULT_OPENAI_MODEL,
};
use crate::llm::{Provider, RetryPolicy};
use crate::orchestrator::CommitMode;
use crate::verify::{default_commands, VerifyCommand, DEFAULT_MAX_RETRIES};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub generation: GenerationConfig,
    pub repository: RepositoryConfig,
    pub verification: VerificationConfig,
    pub limits: ValidationLimits,
    pub server: ServerConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationConfig {
    pub default_provider: Provider,
    /// Per-attempt limit for one model call
    pub timeout_secs: u64,
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub gemini_model: String,
    pub gemini_base_url: String,
    pub openai_model: String,
    pub openai_base_url: String,
    pub ollama_host: String,
    pub ollama_model: String,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        let retry = RetryPolicy::default();
        Self {
            default_provider: Provider::Gemini,
            timeout_secs: retry.attempt_timeout.as_secs(),
            max_attempts: retry.max_attempts,
            initial_backoff_ms: retry.initial_backoff.as_millis() as u64,
            gemini_model: DEFAULT_GEMINI_MODEL.to_string(),
            gemini_base_url: DEFAULT_GEMINI_BASE_URL.to_string(),
            openai_model: DEFAULT_OPENAI_MODEL.to_string(),
            openai_base_url: DEFAULT_OPENAI_BASE_URL.to_string(),
            ollama_host: DEFAULT_OLLAMA_HOST.to_string(),
            ollama_model: DEFAULT_OLLAMA_MODEL.to_string(),
        }
    }
}

impl GenerationConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts.max(1),
            initial_backoff: Duration::from_millis(self.initial_backoff_ms),
            attempt_timeout: Duration::from_secs(self.timeout_secs.max(1)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RepositoryConfig {
    /// `owner/repo` or a GitHub URL
    pub target: Option<String>,
    /// Local checkout whose `origin` names the target when `target` is unset
    pub path: Option<PathBuf>,
    pub api_base_url: String,
    pub branch_prefix: String,
    pub commit_mode: CommitMode,
    pub timeout_secs: u64,
    /// Best-effort cleanup of the work branch when publishing fails
    pub delete_branch_on_failure: bool,
}

impl Default for RepositoryConfig {
    fn default() -> Self {
        Self {
            target: None,
            path: None,
            api_base_url: DEFAULT_API_BASE_URL.to_string(),
            branch_prefix: DEFAULT_BRANCH_PREFIX.to_string(),
            commit_mode: CommitMode::default(),
            timeout_secs: 60,
            delete_branch_on_failure: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VerificationConfig {
    /// Remote check service; takes precedence over `local_root`
    pub preflight_url: Option<String>,
    /// Scratch checkout to run commands in locally
    pub local_root: Option<PathBuf>,
    pub max_retries: u32,
    /// Feed failures back to the model between attempts
    pub repair: bool,
    pub timeout_secs: u64,
    pub commands: Vec<VerifyCommand>,
}

impl Default for VerificationConfig {
    fn default() -> Self {
        Self {
            preflight_url: None,
            local_root: None,
            max_retries: DEFAULT_MAX_RETRIES,
            repair: true,
            timeout_secs: 120,
            commands: default_commands(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
    pub job_retention: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8787".to_string(),
            job_retention: DEFAULT_JOB_RETENTION,
        }
    }
}

impl Config {
    /// Get the config directory path
    fn config_dir() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("patchflow"))
    }

    /// Get the default config file path
    pub fn default_path() -> Option<PathBuf> {
        Self::config_dir().map(|p| p.join("config.toml"))
    }

    /// Load the file layer and then the process environment.
    ///
    /// An explicit `path` must exist and parse. The default location is
    /// optional; if it is corrupt a backup is kept and defaults are used.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::load_default_file(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    fn from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))
    }

    fn load_default_file() -> Self {
        let Some(path) = Self::default_path() else {
            return Self::default();
        };
        let Ok(content) = fs::read_to_string(&path) else {
            return Self::default();
        };
        match toml::from_str(&content) {
            Ok(config) => config,
            Err(err) => {
                preserve_corrupt_config(&path, &content);
                tracing::warn!(
                    path = %path.display(),
                    error = %err,
                    "config file was corrupted; a backup was saved and defaults were loaded"
                );
                Self::default()
            }
        }
    }

    /// Apply environment overrides read through `lookup`. Blank values are ignored.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        if let Some(provider) = get("PATCHFLOW_PROVIDER") {
            self.generation.default_provider = provider
                .parse()
                .with_context(|| format!("Invalid PATCHFLOW_PROVIDER: {}", provider))?;
        }
        if let Some(model) = get("GEMINI_MODEL") {
            self.generation.gemini_model = model;
        }
        if let Some(model) = get("OPENAI_MODEL") {
            self.generation.openai_model = model;
        }
        if let Some(url) = get("OPENAI_BASE_URL") {
            self.generation.openai_base_url = url;
        }
        if let Some(host) = get("OLLAMA_HOST") {
            self.generation.ollama_host = host;
        }
        if let Some(model) = get("OLLAMA_MODEL") {
            self.generation.ollama_model = model;
        }
        if let Some(target) = get("GITHUB_REPOSITORY") {
            self.repository.target = Some(target);
        }
        if let Some(url) = get("GITHUB_API_URL") {
            self.repository.api_base_url = url;
        }
        if let Some(url) = get("PREFLIGHT_ENDPOINT") {
            self.verification.preflight_url = Some(url);
        }
        if let Some(retries) = get("VERIFY_MAX_RETRIES") {
            self.verification.max_retries = retries
                .parse()
                .with_context(|| format!("Invalid VERIFY_MAX_RETRIES: {}", retries))?;
        }
        if let Some(bind) = get("PATCHFLOW_BIND") {
            self.server.bind = bind;
        }
        Ok(())
    }
}

fn preserve_corrupt_config(path: &Path, content: &str) {
    let corrupt_path = path.with_extension("toml.corrupt");
    if fs::rename(path, &corrupt_path).is_err() {
        let _ = fs::write(&corrupt_path, content);
    }
}
