// Configuration management

use crate::error::{OrchestratorError, Result};
use crate::units::models::UnitDefinition;
use crate::units::resilience::{BackoffStrategy, FlappingPolicy, JitterMode};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Top-level config file: orchestrator settings plus unit definitions
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub orchestrator: OrchestratorSettings,
    #[serde(default)]
    pub units: Vec<UnitDefinition>,
}

/// How the load balancer advisor ranks same-role instances
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BalanceStrategy {
    #[default]
    LeastLoaded,
    LeastRecentlyAssigned,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorSettings {
    // Lifecycle
    pub start_grace_secs: u64,
    pub stop_timeout_secs: u64,
    pub shutdown_timeout_secs: u64,
    pub allow_degraded_dependencies: bool,

    // Health monitor
    pub health_interval_secs: u64,
    pub max_concurrent_probes: usize,
    pub probe_failure_threshold: u32,
    pub unhealthy_restart_after_secs: u64,

    // Remediation
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    pub backoff_multiplier: f64,
    pub backoff_jitter: JitterMode,
    pub flapping_threshold: usize,
    pub flapping_window_secs: u64,
    pub failure_reset_after_secs: u64,

    // Resource monitor
    pub resource_interval_secs: u64,
    pub resource_warn_fraction: f64,
    pub resource_history: usize,
    pub hard_kill_on_breach: bool,

    // Forecasting
    pub forecast_interval_secs: u64,
    pub forecast_window: usize,
    pub forecast_horizon_secs: u64,
    pub forecast_warn_fraction: f64,

    // Load balancer advisor
    pub balancer_interval_secs: u64,
    pub balance_strategy: BalanceStrategy,

    // Persistence
    pub event_log_path: Option<PathBuf>,
    pub sample_log_path: Option<PathBuf>,
    pub state_path: Option<PathBuf>,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            start_grace_secs: 3,
            stop_timeout_secs: 10,
            shutdown_timeout_secs: 30,
            allow_degraded_dependencies: false,
            health_interval_secs: 30,
            max_concurrent_probes: 8,
            probe_failure_threshold: 3,
            unhealthy_restart_after_secs: 60,
            backoff_base_ms: 1_000,
            backoff_max_ms: 30_000,
            backoff_multiplier: 2.0,
            backoff_jitter: JitterMode::None,
            flapping_threshold: 5,
            flapping_window_secs: 300,
            failure_reset_after_secs: 60,
            resource_interval_secs: 5,
            resource_warn_fraction: 0.9,
            resource_history: 720,
            hard_kill_on_breach: false,
            forecast_interval_secs: 15,
            forecast_window: 30,
            forecast_horizon_secs: 300,
            forecast_warn_fraction: 0.8,
            balancer_interval_secs: 10,
            balance_strategy: BalanceStrategy::LeastLoaded,
            event_log_path: None,
            sample_log_path: None,
            state_path: None,
        }
    }
}

impl OrchestratorSettings {
    pub fn start_grace(&self) -> Duration {
        Duration::from_secs(self.start_grace_secs)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    pub fn health_interval(&self) -> Duration {
        Duration::from_secs(self.health_interval_secs.max(1))
    }

    pub fn unhealthy_restart_after(&self) -> Duration {
        Duration::from_secs(self.unhealthy_restart_after_secs)
    }

    pub fn failure_reset_after(&self) -> Duration {
        Duration::from_secs(self.failure_reset_after_secs)
    }

    pub fn resource_interval(&self) -> Duration {
        Duration::from_secs(self.resource_interval_secs.max(1))
    }

    pub fn forecast_interval(&self) -> Duration {
        Duration::from_secs(self.forecast_interval_secs.max(1))
    }

    pub fn balancer_interval(&self) -> Duration {
        Duration::from_secs(self.balancer_interval_secs.max(1))
    }

    pub fn backoff(&self) -> BackoffStrategy {
        BackoffStrategy::ExponentialBackoff {
            base_delay: Duration::from_millis(self.backoff_base_ms),
            max_delay: Duration::from_millis(self.backoff_max_ms),
            multiplier: self.backoff_multiplier,
            jitter: self.backoff_jitter,
        }
    }

    pub fn flapping(&self) -> FlappingPolicy {
        FlappingPolicy {
            threshold: self.flapping_threshold,
            window: Duration::from_secs(self.flapping_window_secs),
        }
    }
}

impl Config {
    /// Get default config path: ~/.config/procvisor/units.yaml
    pub fn default_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;
        Ok(config_dir.join("procvisor").join("units.yaml"))
    }

    /// Load config from path, falling back to defaults if not found
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let config_path = path.unwrap_or_else(|| Self::default_path().unwrap_or_default());

        if config_path.exists() {
            let contents = std::fs::read_to_string(&config_path)?;
            let config: Config = serde_yaml::from_str(&contents)?;
            config.validate()?;
            Ok(config)
        } else {
            tracing::warn!(
                "Config file {} not found, using defaults",
                config_path.display()
            );
            Ok(Self::default())
        }
    }

    /// Save config to path
    pub fn save(&self, path: PathBuf) -> Result<()> {
        // Create parent directory if it doesn't exist
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let yaml = serde_yaml::to_string(self)?;
        std::fs::write(path, yaml)?;
        Ok(())
    }

    /// Reject settings the orchestrator cannot run with
    pub fn validate(&self) -> Result<()> {
        let s = &self.orchestrator;
        let invalid = |msg: &str| -> anyhow::Error { OrchestratorError::Config(msg.to_string()).into() };

        if s.max_concurrent_probes == 0 {
            return Err(invalid("max_concurrent_probes must be at least 1"));
        }
        if s.probe_failure_threshold == 0 {
            return Err(invalid("probe_failure_threshold must be at least 1"));
        }
        if s.flapping_threshold == 0 {
            return Err(invalid("flapping_threshold must be at least 1"));
        }
        if s.backoff_multiplier < 1.0 {
            return Err(invalid("backoff_multiplier must be >= 1.0"));
        }
        if s.backoff_base_ms > s.backoff_max_ms {
            return Err(invalid("backoff_base_ms must not exceed backoff_max_ms"));
        }
        for (name, fraction) in [
            ("resource_warn_fraction", s.resource_warn_fraction),
            ("forecast_warn_fraction", s.forecast_warn_fraction),
        ] {
            if !(fraction > 0.0 && fraction <= 1.0) {
                return Err(invalid(&format!("{} must be in (0, 1]", name)));
            }
        }
        if s.forecast_window < 2 {
            return Err(invalid("forecast_window must hold at least 2 samples"));
        }
        Ok(())
    }
}
