//! Configuration: defaults, then a TOML file, then environment overrides.
//!
//! File lookup order: an explicit `--config` path, `./.codeforge.toml`,
//! then `<config dir>/codeforge/config.toml`. A missing implicit file is
//! not an error; a missing explicit one is.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::challenge::LedgerSettings;
use crate::consensus::{ConsensusSettings, NormalizerSettings};
use crate::review::{LlmProvider, LlmSettings, ReviewerKind, RunnerSettings, Severity};

/// Project-local config file name.
pub const LOCAL_CONFIG_FILE: &str = ".codeforge.toml";

const SECRET_MASK: &str = "********";

// ── Errors ───────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid severity threshold {0:?} (expected critical, high, medium, low or info)")]
    InvalidThreshold(String),

    #[error("unknown reviewer type {0:?} (expected security, correctness, performance, style or all)")]
    UnknownReviewer(String),

    #[error("no reviewers selected")]
    EmptyReviewerSet,

    #[error("invalid configuration: {0}")]
    InvalidValue(String),

    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

// ── Sections ─────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct LlmConfig {
    /// `openai` or `anthropic`.
    pub provider: String,
    /// Model name; the provider's default when unset.
    pub model: Option<String>,
    /// API key; `LLM_API_KEY` overrides.
    pub api_key: Option<String>,
    /// Override for the provider's API base URL.
    pub base_url: Option<String>,
    pub temperature: f32,
    pub max_tokens: u32,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: "openai".into(),
            model: None,
            api_key: None,
            base_url: None,
            temperature: 0.3,
            max_tokens: 4000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct RunnerConfig {
    pub reviewer_timeout_secs: u64,
    /// Extra attempts after a transient failure.
    pub max_retries: u32,
    pub retry_backoff_ms: u64,
    /// Overall budget for the whole fan-out.
    pub deadline_secs: u64,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        let d = RunnerSettings::default();
        Self {
            reviewer_timeout_secs: d.reviewer_timeout.as_secs(),
            max_retries: d.max_retries,
            retry_backoff_ms: d.retry_backoff.as_millis() as u64,
            deadline_secs: d.deadline.as_secs(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct ConsensusConfig {
    /// Lines per merge bucket.
    pub line_window: u32,
    /// Minimum title/description overlap that confirms a merge.
    pub similarity_threshold: f64,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        let d = NormalizerSettings::default();
        Self {
            line_window: d.line_window,
            similarity_threshold: d.similarity_threshold,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct ChallengesConfig {
    /// Net votes that resolve a challenge.
    pub quorum: u32,
    pub voting_window_hours: u32,
    /// Ledger database; defaults to the user data directory.
    pub db_path: Option<PathBuf>,
    /// Identities allowed to force a resolution.
    pub resolvers: Vec<String>,
}

impl Default for ChallengesConfig {
    fn default() -> Self {
        Self {
            quorum: crate::challenge::ledger::DEFAULT_QUORUM,
            voting_window_hours: crate::challenge::ledger::DEFAULT_VOTING_WINDOW_HOURS as u32,
            db_path: None,
            resolvers: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct GitHubConfig {
    /// API token; `GITHUB_TOKEN` overrides.
    pub token: Option<String>,
    pub api_base: String,
    /// Attempts after the first failed request.
    pub post_retries: u32,
}

impl Default for GitHubConfig {
    fn default() -> Self {
        Self {
            token: None,
            api_base: crate::github::DEFAULT_API_BASE.into(),
            post_retries: 3,
        }
    }
}

// ── Root ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct Config {
    /// Reviewer allow-list; `all` selects every reviewer type.
    pub reviewers: Vec<String>,
    /// Findings at or above this severity block the merge.
    pub severity_threshold: String,
    /// Per-reviewer cap on reported findings.
    pub max_findings: usize,
    pub llm: LlmConfig,
    pub runner: RunnerConfig,
    pub consensus: ConsensusConfig,
    pub challenges: ChallengesConfig,
    pub github: GitHubConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            reviewers: vec!["all".into()],
            severity_threshold: "low".into(),
            max_findings: 20,
            llm: LlmConfig::default(),
            runner: RunnerConfig::default(),
            consensus: ConsensusConfig::default(),
            challenges: ChallengesConfig::default(),
            github: GitHubConfig::default(),
        }
    }
}

impl Config {
    /// Load and validate the effective configuration.
    pub fn load(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        let path = match explicit {
            Some(p) => Some(p.to_path_buf()),
            None => discover_config_file(),
        };
        let mut config = match &path {
            Some(p) => Self::from_file(p)?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok());
        config.validate()?;
        tracing::debug!(path = ?path, "Configuration loaded");
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Apply environment overrides through `lookup`.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = get("GITHUB_TOKEN") {
            self.github.token = Some(v);
        }
        if let Some(v) = get("LLM_API_KEY") {
            self.llm.api_key = Some(v);
        }
        if let Some(v) = get("CODEFORGE_LLM_PROVIDER") {
            self.llm.provider = v;
        }
        if let Some(v) = get("CODEFORGE_LLM_MODEL") {
            self.llm.model = Some(v);
        }
        if let Some(v) = get("CODEFORGE_SEVERITY_THRESHOLD") {
            self.severity_threshold = v;
        }
        if let Some(v) = get("CODEFORGE_REVIEWERS") {
            self.reviewers = split_list(&v);
        }
    }

    /// Check every value the run depends on. Runs before any reviewer starts.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.severity_threshold()?;
        self.reviewer_kinds()?;

        let mut errors = Vec::new();
        if LlmProvider::from_id(&self.llm.provider).is_none() {
            errors.push(format!(
                "llm.provider {:?} must be openai or anthropic",
                self.llm.provider
            ));
        }
        if !(0.0..=2.0).contains(&self.llm.temperature) {
            errors.push("llm.temperature must be between 0.0 and 2.0".to_string());
        }
        if self.llm.max_tokens == 0 {
            errors.push("llm.max_tokens must be greater than 0".to_string());
        }
        if self.max_findings == 0 {
            errors.push("max_findings must be greater than 0".to_string());
        }
        if self.runner.reviewer_timeout_secs == 0 {
            errors.push("runner.reviewer_timeout_secs must be greater than 0".to_string());
        }
        if self.runner.deadline_secs == 0 {
            errors.push("runner.deadline_secs must be greater than 0".to_string());
        }
        if self.consensus.line_window == 0 {
            errors.push("consensus.line_window must be greater than 0".to_string());
        }
        let t = self.consensus.similarity_threshold;
        if !(t > 0.0 && t <= 1.0) {
            errors.push("consensus.similarity_threshold must be in (0, 1]".to_string());
        }
        if self.challenges.quorum == 0 {
            errors.push("challenges.quorum must be greater than 0".to_string());
        }
        if self.challenges.voting_window_hours == 0 {
            errors.push("challenges.voting_window_hours must be greater than 0".to_string());
        }
        if self.github.api_base.trim().is_empty() {
            errors.push("github.api_base must not be empty".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::InvalidValue(errors.join("; ")))
        }
    }

    pub fn severity_threshold(&self) -> Result<Severity, ConfigError> {
        Severity::from_id(&self.severity_threshold)
            .ok_or_else(|| ConfigError::InvalidThreshold(self.severity_threshold.clone()))
    }

    /// Selected reviewer kinds in canonical order, `all` expanded.
    pub fn reviewer_kinds(&self) -> Result<Vec<ReviewerKind>, ConfigError> {
        let mut selected = BTreeSet::new();
        for entry in &self.reviewers {
            let entry = entry.trim();
            if entry.is_empty() {
                continue;
            }
            if entry.eq_ignore_ascii_case("all") {
                selected.extend(ReviewerKind::ALL.iter().copied());
                continue;
            }
            let kind = ReviewerKind::from_id(entry)
                .ok_or_else(|| ConfigError::UnknownReviewer(entry.to_string()))?;
            selected.insert(kind);
        }
        if selected.is_empty() {
            return Err(ConfigError::EmptyReviewerSet);
        }
        Ok(ReviewerKind::ALL
            .iter()
            .copied()
            .filter(|k| selected.contains(k))
            .collect())
    }

    pub fn runner_settings(&self) -> RunnerSettings {
        RunnerSettings {
            reviewer_timeout: Duration::from_secs(self.runner.reviewer_timeout_secs),
            max_retries: self.runner.max_retries,
            retry_backoff: Duration::from_millis(self.runner.retry_backoff_ms),
            deadline: Duration::from_secs(self.runner.deadline_secs),
        }
    }

    pub fn consensus_settings(&self) -> Result<ConsensusSettings, ConfigError> {
        Ok(ConsensusSettings {
            normalizer: NormalizerSettings {
                line_window: self.consensus.line_window,
                similarity_threshold: self.consensus.similarity_threshold,
            },
            severity_threshold: self.severity_threshold()?,
        })
    }

    pub fn ledger_settings(&self) -> LedgerSettings {
        LedgerSettings {
            quorum: self.challenges.quorum,
            voting_window: chrono::Duration::hours(i64::from(self.challenges.voting_window_hours)),
            resolvers: self
                .challenges
                .resolvers
                .iter()
                .map(|r| r.trim().to_string())
                .filter(|r| !r.is_empty())
                .collect(),
        }
    }

    /// Provider settings shared by every LLM reviewer.
    pub fn llm_settings(&self) -> Result<LlmSettings, ConfigError> {
        let provider = LlmProvider::from_id(&self.llm.provider).ok_or_else(|| {
            ConfigError::InvalidValue(format!("unknown llm.provider {:?}", self.llm.provider))
        })?;
        let api_key = self
            .llm
            .api_key
            .clone()
            .filter(|k| !k.trim().is_empty())
            .ok_or_else(|| {
                ConfigError::InvalidValue("LLM API key missing (set LLM_API_KEY or llm.api_key)".into())
            })?;
        Ok(LlmSettings {
            provider,
            model: self
                .llm
                .model
                .clone()
                .unwrap_or_else(|| default_model(provider).to_string()),
            api_key,
            temperature: self.llm.temperature,
            max_tokens: self.llm.max_tokens,
            max_findings: self.max_findings,
            base_url: self.llm.base_url.clone(),
        })
    }

    /// Where the challenge ledger lives.
    pub fn ledger_path(&self) -> PathBuf {
        if let Some(path) = &self.challenges.db_path {
            return path.clone();
        }
        directories::ProjectDirs::from("dev", "codeforge", "codeforge")
            .map(|dirs| dirs.data_dir().join("challenges.db"))
            .unwrap_or_else(|| PathBuf::from(".codeforge").join("challenges.db"))
    }

    /// Copy safe to print: secrets replaced by a mask.
    pub fn masked(&self) -> Self {
        let mut copy = self.clone();
        if copy.llm.api_key.is_some() {
            copy.llm.api_key = Some(SECRET_MASK.into());
        }
        if copy.github.token.is_some() {
            copy.github.token = Some(SECRET_MASK.into());
        }
        copy
    }

    pub fn to_toml(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// JSON Schema of the configuration file.
    pub fn json_schema() -> anyhow::Result<String> {
        let schema = schemars::schema_for!(Config);
        Ok(serde_json::to_string_pretty(&schema)?)
    }
}

fn default_model(provider: LlmProvider) -> &'static str {
    match provider {
        LlmProvider::OpenAi => "gpt-4o",
        LlmProvider::Anthropic => "claude-sonnet-4-5",
    }
}

fn discover_config_file() -> Option<PathBuf> {
    let local = PathBuf::from(LOCAL_CONFIG_FILE);
    if local.is_file() {
        return Some(local);
    }
    directories::ProjectDirs::from("dev", "codeforge", "codeforge")
        .map(|dirs| dirs.config_dir().join("config.toml"))
        .filter(|p| p.is_file())
}

/// Split a comma or whitespace separated list.
pub fn split_list(raw: &str) -> Vec<String> {
    raw.split(|c: char| c == ',' || c.is_whitespace())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}
