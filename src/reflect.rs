//! Reflection collaborator contract.
//!
//! The agentic pipeline hands its synthesized answer to a reflector for
//! iterative self-critique. Only the contract lives here; implementations
//! are external collaborators.

use crate::errors::LlmError;
use crate::extract::Source;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Tuning for one reflection pass.
#[derive(Debug, Clone)]
pub struct ReflectionConfig {
    pub max_iterations: u32,
    /// Stop early when an iteration improves quality by less than this.
    pub min_improvement_threshold: f64,
    /// Stop early when quality reaches this.
    pub quality_target_threshold: f64,
    /// Soft per-iteration timeout.
    pub timeout_per_iteration: Duration,
}

impl Default for ReflectionConfig {
    fn default() -> Self {
        Self {
            max_iterations: 2,
            min_improvement_threshold: 0.05,
            quality_target_threshold: 0.85,
            timeout_per_iteration: Duration::from_secs(60),
        }
    }
}

/// What a reflection pass produced.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReflectionOutcome {
    /// Improved answer, if the reflector produced one.
    pub final_answer: Option<String>,
    pub iterations: u32,
    pub total_improvement: f64,
}

#[async_trait]
pub trait Reflector: Send + Sync {
    async fn reflect(
        &self,
        query: &str,
        answer: &str,
        sources: &[Source],
        config: &ReflectionConfig,
        cancel: &CancellationToken,
    ) -> Result<ReflectionOutcome, LlmError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_matches_agentic_pipeline_settings() {
        let config = ReflectionConfig::default();
        assert_eq!(config.max_iterations, 2);
        assert_eq!(config.min_improvement_threshold, 0.05);
        assert_eq!(config.quality_target_threshold, 0.85);
        assert_eq!(config.timeout_per_iteration, Duration::from_secs(60));
    }
}
