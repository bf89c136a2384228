//! Engine configuration resolved from the environment.
//!
//! Every recognized option has a default; `EngineConfig::from_env` reads the
//! environment once at startup and the resulting value is shared read-only by
//! the whole engine.

use std::time::Duration;

/// Runtime configuration for the orchestration kernel.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// LLM provider backend (`LLM_PROVIDER`, default "ollama").
    pub provider: String,
    /// Per-call model override (`LLM_MODEL`).
    pub model: Option<String>,
    /// Large-model fallback for evaluators (`ESCALATION_MODEL`).
    pub escalation_model: Option<String>,
    /// Base URL for the bundled Ollama adapter (`OLLAMA_BASE_URL`).
    pub ollama_base_url: String,
    /// Plan regeneration cap (`MAX_PLAN_ATTEMPTS`).
    pub max_plan_attempts: u32,
    /// Sub-query fan-out cap within one decomposition wave
    /// (`MAX_CONCURRENT_SUBQUERIES`).
    pub max_concurrent_subqueries: usize,
    /// Coverage at or above which iterative retrieval stops
    /// (`COVERAGE_THRESHOLD`).
    pub coverage_threshold: f64,
    /// Aspect confidence at or above which an aspect counts as covered
    /// (`MIN_CONFIDENCE`).
    pub min_confidence: f64,
    /// Minimum string-output length for answer extraction
    /// (`MIN_OUTPUT_LENGTH`).
    pub min_output_length: usize,
    /// Planning loop iteration cap (`PLANNER_MAX_ITERATIONS`).
    pub planner_max_iterations: u32,
    /// Runaway guard on `create_plan` calls (`CREATE_PLAN_MAX_ATTEMPTS`).
    pub create_plan_max_attempts: u32,
    /// Consecutive finalize failures before empty phases are auto-filled
    /// (`FINALIZE_AUTO_RECOVERY_THRESHOLD`).
    pub finalize_auto_recovery_threshold: u32,
    /// Per-call LLM timeout (`LLM_TIMEOUT_SECS`, default 120).
    pub llm_timeout: Duration,
    /// Default web-fetch tool timeout (`FETCH_TIMEOUT_SECS`, default 10).
    pub fetch_timeout: Duration,
    /// Soft timeout for one reflection iteration
    /// (`REFLECTION_ITERATION_TIMEOUT_SECS`, default 60).
    pub reflection_iteration_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            provider: "ollama".to_string(),
            model: None,
            escalation_model: None,
            ollama_base_url: "http://localhost:11434".to_string(),
            max_plan_attempts: 3,
            max_concurrent_subqueries: 2,
            coverage_threshold: 0.85,
            min_confidence: 0.7,
            min_output_length: 50,
            planner_max_iterations: 20,
            create_plan_max_attempts: 3,
            finalize_auto_recovery_threshold: 2,
            llm_timeout: Duration::from_secs(120),
            fetch_timeout: Duration::from_secs(10),
            reflection_iteration_timeout: Duration::from_secs(60),
        }
    }
}

impl EngineConfig {
    /// Resolve configuration from the environment, falling back to defaults
    /// for anything unset or unparseable.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            provider: env_string("LLM_PROVIDER").unwrap_or(defaults.provider),
            model: env_string("LLM_MODEL"),
            escalation_model: env_string("ESCALATION_MODEL"),
            ollama_base_url: env_string("OLLAMA_BASE_URL").unwrap_or(defaults.ollama_base_url),
            max_plan_attempts: env_parsed("MAX_PLAN_ATTEMPTS", defaults.max_plan_attempts),
            max_concurrent_subqueries: env_parsed(
                "MAX_CONCURRENT_SUBQUERIES",
                defaults.max_concurrent_subqueries,
            ),
            coverage_threshold: env_parsed("COVERAGE_THRESHOLD", defaults.coverage_threshold),
            min_confidence: env_parsed("MIN_CONFIDENCE", defaults.min_confidence),
            min_output_length: env_parsed("MIN_OUTPUT_LENGTH", defaults.min_output_length),
            planner_max_iterations: env_parsed(
                "PLANNER_MAX_ITERATIONS",
                defaults.planner_max_iterations,
            ),
            create_plan_max_attempts: env_parsed(
                "CREATE_PLAN_MAX_ATTEMPTS",
                defaults.create_plan_max_attempts,
            ),
            finalize_auto_recovery_threshold: env_parsed(
                "FINALIZE_AUTO_RECOVERY_THRESHOLD",
                defaults.finalize_auto_recovery_threshold,
            ),
            llm_timeout: env_secs("LLM_TIMEOUT_SECS", defaults.llm_timeout),
            fetch_timeout: env_secs("FETCH_TIMEOUT_SECS", defaults.fetch_timeout),
            reflection_iteration_timeout: env_secs(
                "REFLECTION_ITERATION_TIMEOUT_SECS",
                defaults.reflection_iteration_timeout,
            ),
        }
    }
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn env_parsed<T: std::str::FromStr>(key: &str, default: T) -> T {
    match std::env::var(key) {
        Ok(raw) => raw.trim().parse().unwrap_or(default),
        Err(_) => default,
    }
}

fn env_secs(key: &str, default: Duration) -> Duration {
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Duration::from_secs)
            .unwrap_or(default),
        Err(_) => default,
    }
}
