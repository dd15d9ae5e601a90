use crate::distributor::DistributionStrategy;
use crate::health::HealthCheckConfig;
use crate::perf::PerformanceConfig;
use crate::router::RouterConfig;
use maestro_core::{MaestroError, MaestroResult};
use serde::{Deserialize, Serialize};

/// Top-level configuration for the coordination core.
///
/// Every field has a sensible default, so `OrchestratorConfig::default()`
/// is a working setup and TOML files only need to override what they
/// care about.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// How the distributor picks among eligible agents.
    pub strategy: DistributionStrategy,
    pub router: RouterConfig,
    pub health: HealthCheckConfig,
    pub performance: PerformanceConfig,
}

impl OrchestratorConfig {
    /// Parses a TOML document into a validated configuration.
    pub fn from_toml_str(input: &str) -> MaestroResult<Self> {
        let config: Self =
            toml::from_str(input).map_err(|e| MaestroError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Rejects configurations the background loops cannot run with.
    pub fn validate(&self) -> MaestroResult<()> {
        if self.router.tick_interval_ms == 0 {
            return Err(MaestroError::Config(
                "router.tick_interval_ms must be positive".to_string(),
            ));
        }
        if self.health.interval_ms == 0 {
            return Err(MaestroError::Config(
                "health.interval_ms must be positive".to_string(),
            ));
        }
        if self.performance.snapshot_interval_ms == 0 {
            return Err(MaestroError::Config(
                "performance.snapshot_interval_ms must be positive".to_string(),
            ));
        }
        if self.performance.history_cap == 0 {
            return Err(MaestroError::Config(
                "performance.history_cap must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(OrchestratorConfig::default().validate().is_ok());
    }

    #[test]
    fn test_partial_toml_overrides() {
        let config = OrchestratorConfig::from_toml_str(
            r#"
            strategy = "LEAST_LOADED"

            [router]
            max_retries = 5

            [health]
            interval_ms = 10000
            "#,
        )
        .unwrap();

        assert_eq!(config.strategy, DistributionStrategy::LeastLoaded);
        assert_eq!(config.router.max_retries, 5);
        assert_eq!(config.health.interval_ms, 10_000);
        // Untouched sections keep their defaults.
        assert_eq!(config.router.tick_interval_ms, 1_000);
        assert_eq!(config.performance.history_cap, 1_000);
    }

    #[test]
    fn test_invalid_toml_is_a_config_error() {
        let result = OrchestratorConfig::from_toml_str("strategy = ");
        assert!(matches!(result, Err(MaestroError::Config(_))));
    }

    #[test]
    fn test_zero_interval_rejected() {
        let result = OrchestratorConfig::from_toml_str(
            r#"
            [router]
            tick_interval_ms = 0
            "#,
        );
        assert!(matches!(result, Err(MaestroError::Config(_))));
    }
}
