//! Configuration.
//!
//! Secrets and endpoints come from the environment (`AppConfig`); everything
//! that shapes a run lives in a TOML `FileConfig`, validated into a
//! `RunConfig` before the controller sees it.

use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::error::LabError;
use crate::evaluator::PersonaSampling;
use crate::oracle::ResponseParsing;
use crate::retry::RetryPolicy;
use crate::types::{ComparisonPool, Persona};

// =============================================================================
// AppConfig (environment)
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LlmProvider {
    OpenAi,
    Anthropic,
}

impl std::str::FromStr for LlmProvider {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "openai" => Ok(LlmProvider::OpenAi),
            "anthropic" | "claude" => Ok(LlmProvider::Anthropic),
            other => bail!("Unknown LLM_PROVIDER '{other}' (expected openai or anthropic)"),
        }
    }
}

/// Secrets and env-specific values.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub provider: LlmProvider,
    pub openai_api_key: Option<String>,
    pub openai_api_base: Option<String>,
    pub anthropic_api_key: Option<String>,
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let provider: LlmProvider = std::env::var("LLM_PROVIDER")
            .unwrap_or_else(|_| "openai".to_string())
            .parse()?;

        let config = Self {
            provider,
            openai_api_key: non_empty_env("OPENAI_API_KEY"),
            openai_api_base: non_empty_env("OPENAI_API_BASE"),
            anthropic_api_key: non_empty_env("ANTHROPIC_API_KEY"),
        };
        config.require_provider_key()?;
        Ok(config)
    }

    fn require_provider_key(&self) -> Result<()> {
        match self.provider {
            LlmProvider::OpenAi if self.openai_api_key.is_none() => {
                bail!("OPENAI_API_KEY is required when LLM_PROVIDER=openai")
            }
            LlmProvider::Anthropic if self.anthropic_api_key.is_none() => {
                bail!("ANTHROPIC_API_KEY is required when LLM_PROVIDER=anthropic")
            }
            _ => Ok(()),
        }
    }

    pub fn log_redacted(&self) {
        fn preview(val: &Option<String>) -> String {
            match val {
                Some(v) => format!(
                    "{}...({} chars)",
                    ai_client::truncate_to_char_boundary(v, 5),
                    v.len()
                ),
                None => "<not set>".to_string(),
            }
        }

        tracing::info!("Config loaded:");
        tracing::info!("  LLM_PROVIDER: {:?}", self.provider);
        tracing::info!("  OPENAI_API_KEY: {}", preview(&self.openai_api_key));
        tracing::info!(
            "  OPENAI_API_BASE: {}",
            self.openai_api_base.as_deref().unwrap_or("<default>")
        );
        tracing::info!("  ANTHROPIC_API_KEY: {}", preview(&self.anthropic_api_key));
    }
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

// =============================================================================
// FileConfig (TOML)
// =============================================================================

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    #[serde(default)]
    pub run: RunSection,
    #[serde(default)]
    pub evaluation: EvaluationSection,
    #[serde(default)]
    pub models: ModelsSection,
    #[serde(default)]
    pub timeouts: TimeoutsSection,
    #[serde(default)]
    pub retry: RetrySection,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RunSection {
    pub rounds: u32,
    pub candidates_per_round: usize,
    pub survival_threshold: f64,
    /// Append the comparison file's `extra_titles` to the generated set.
    pub use_extra_candidates: bool,
    pub final_evaluation: bool,
    pub final_count: Option<usize>,
}

impl Default for RunSection {
    fn default() -> Self {
        Self {
            rounds: 2,
            candidates_per_round: 15,
            survival_threshold: 20.0,
            use_extra_candidates: false,
            final_evaluation: false,
            final_count: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EvaluationSection {
    pub sampling: PersonaSampling,
    pub max_concurrency: usize,
    pub refine_concurrency: usize,
    pub response_parsing: ResponseParsing,
}

impl Default for EvaluationSection {
    fn default() -> Self {
        Self {
            sampling: PersonaSampling::Random {
                trials_per_candidate: 100,
            },
            max_concurrency: 32,
            refine_concurrency: 8,
            response_parsing: ResponseParsing::Strict,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ModelsSection {
    pub judge: String,
    pub judge_temperature: f32,
    pub generation: String,
    pub refinement: String,
    /// Condense the context into a style summary before generating.
    pub style_summary: bool,
    /// Domain guidance injected into generation and refinement prompts.
    pub instructions: Option<String>,
}

impl Default for ModelsSection {
    fn default() -> Self {
        Self {
            judge: "gpt-4o-mini".to_string(),
            judge_temperature: 1.0,
            generation: "o3-mini".to_string(),
            refinement: "o3-mini".to_string(),
            style_summary: false,
            instructions: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TimeoutsSection {
    pub oracle_secs: u64,
    pub generation_secs: u64,
    pub refinement_secs: u64,
}

impl Default for TimeoutsSection {
    fn default() -> Self {
        Self {
            oracle_secs: 30,
            generation_secs: 180,
            refinement_secs: 120,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetrySection {
    pub oracle_attempts: u32,
    pub generation_attempts: u32,
    pub refinement_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter_ms: u64,
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            oracle_attempts: 3,
            generation_attempts: 2,
            refinement_attempts: 2,
            base_delay_ms: 500,
            max_delay_ms: 10_000,
            jitter_ms: 250,
        }
    }
}

impl RetrySection {
    fn policy(&self, max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay: Duration::from_millis(self.base_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            jitter: Duration::from_millis(self.jitter_ms),
        }
    }
}

/// Load and parse a TOML config file.
pub fn load_config(path: &Path) -> Result<FileConfig> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    let config: FileConfig = toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
    Ok(config)
}

// =============================================================================
// RunConfig (validated)
// =============================================================================

/// Parameters of one run, as the round controller consumes them.
#[derive(Debug, Clone, PartialEq)]
pub struct RunConfig {
    pub round_count: u32,
    pub candidates_per_round: usize,
    pub sampling: PersonaSampling,
    /// Inclusive: a candidate scoring exactly this percentage survives.
    pub survival_threshold: f64,
    pub max_concurrency: usize,
    pub refine_concurrency: usize,
    pub oracle_timeout: Duration,
    pub generation_timeout: Duration,
    pub refinement_timeout: Duration,
    pub oracle_retry: RetryPolicy,
    pub generation_retry: RetryPolicy,
    pub refinement_retry: RetryPolicy,
    /// Supplied candidates evaluated alongside the generated ones in round 1.
    pub extra_candidates: Vec<String>,
    pub final_evaluation: bool,
    pub final_count: Option<usize>,
}

impl Default for RunConfig {
    fn default() -> Self {
        let file = FileConfig::default();
        Self::from_sections(&file)
    }
}

impl RunConfig {
    fn from_sections(file: &FileConfig) -> Self {
        Self {
            round_count: file.run.rounds,
            candidates_per_round: file.run.candidates_per_round,
            sampling: file.evaluation.sampling,
            survival_threshold: file.run.survival_threshold,
            max_concurrency: file.evaluation.max_concurrency,
            refine_concurrency: file.evaluation.refine_concurrency,
            oracle_timeout: Duration::from_secs(file.timeouts.oracle_secs),
            generation_timeout: Duration::from_secs(file.timeouts.generation_secs),
            refinement_timeout: Duration::from_secs(file.timeouts.refinement_secs),
            oracle_retry: file.retry.policy(file.retry.oracle_attempts),
            generation_retry: file.retry.policy(file.retry.generation_attempts),
            refinement_retry: file.retry.policy(file.retry.refinement_attempts),
            extra_candidates: Vec::new(),
            final_evaluation: file.run.final_evaluation,
            final_count: file.run.final_count,
        }
    }

    /// Build and validate a run config from a parsed file.
    pub fn from_file(file: &FileConfig) -> Result<Self, LabError> {
        let config = Self::from_sections(file);
        config.validate()?;
        Ok(config)
    }

    pub fn with_extra_candidates(mut self, extra: Vec<String>) -> Self {
        self.extra_candidates = extra;
        self
    }

    pub fn validate(&self) -> Result<(), LabError> {
        fn invalid(msg: impl Into<String>) -> Result<(), LabError> {
            Err(LabError::InvalidConfig(msg.into()))
        }

        if self.round_count == 0 {
            return invalid("rounds must be at least 1");
        }
        if !(0.0..=100.0).contains(&self.survival_threshold) {
            return invalid(format!(
                "survival_threshold must be within 0..=100, got {}",
                self.survival_threshold
            ));
        }
        match self.sampling {
            PersonaSampling::Random {
                trials_per_candidate: 0,
            } => return invalid("trials_per_candidate must be at least 1"),
            PersonaSampling::Exhaustive {
                checks_per_persona: 0,
            } => return invalid("checks_per_persona must be at least 1"),
            _ => {}
        }
        if self.max_concurrency == 0 || self.refine_concurrency == 0 {
            return invalid("concurrency limits must be at least 1");
        }
        if self.oracle_timeout.is_zero()
            || self.generation_timeout.is_zero()
            || self.refinement_timeout.is_zero()
        {
            return invalid("timeouts must be non-zero");
        }
        for (name, policy) in [
            ("oracle", &self.oracle_retry),
            ("generation", &self.generation_retry),
            ("refinement", &self.refinement_retry),
        ] {
            if policy.max_attempts == 0 {
                return invalid(format!("{name}_attempts must be at least 1"));
            }
        }
        if self.final_count == Some(0) {
            return invalid("final_count must be at least 1 when set");
        }
        Ok(())
    }
}

// =============================================================================
// Comparison file (JSON)
// =============================================================================

/// Personas, decoy pool and optional extra candidates for a run.
#[derive(Debug, Clone, Deserialize)]
pub struct ComparisonFile {
    pub user_personas: Vec<String>,
    pub titles: Vec<String>,
    #[serde(default)]
    pub extra_titles: Vec<String>,
}

impl ComparisonFile {
    pub fn pool(&self) -> Result<ComparisonPool, LabError> {
        ComparisonPool::new(self.titles.iter().cloned())
    }

    pub fn personas(&self) -> Result<Vec<Persona>, LabError> {
        Persona::roster(self.user_personas.iter().cloned())
    }
}

pub fn load_comparison_file(path: &Path) -> Result<ComparisonFile> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read comparison file: {}", path.display()))?;
    let file: ComparisonFile = serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse comparison file: {}", path.display()))?;
    Ok(file)
}
