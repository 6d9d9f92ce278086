// Error types for procvisor

use thiserror::Error;

/// Result type alias using anyhow::Error
pub type Result<T> = anyhow::Result<T>;

/// Orchestrator error taxonomy
#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("Dependency cycle detected between units: {}", units.join(" -> "))]
    DependencyCycle { units: Vec<String> },

    #[error("Unit '{unit}' depends on unknown unit '{dependency}'")]
    UnknownDependency { unit: String, dependency: String },

    #[error("Unknown unit '{0}'")]
    UnknownUnit(String),

    #[error("Unit '{unit}' cannot start: dependency '{dependency}' is not running")]
    DependencyNotReady { unit: String, dependency: String },

    #[error("Failed to spawn unit '{unit}': {message}")]
    SpawnFailure { unit: String, message: String },

    #[error("Unit '{unit}' exited during its start grace period ({exit})")]
    StartupExit { unit: String, exit: String },

    #[error("Unit '{unit}' exited unexpectedly ({exit})")]
    UnexpectedExit { unit: String, exit: String },

    #[error("Health probe for unit '{unit}' timed out after {timeout_secs}s")]
    ProbeTimeout { unit: String, timeout_secs: u64 },

    #[error("Health probe for unit '{unit}' failed: {message}")]
    ProbeFailure { unit: String, message: String },

    #[error("Unit '{unit}' exceeded its {metric} limit: {value:.1} > {limit:.1}")]
    ResourceLimitBreach {
        unit: String,
        metric: String,
        value: f64,
        limit: f64,
    },

    #[error("Unit '{unit}' is flapping: {failures} failures within {window_secs}s")]
    FlappingDetected {
        unit: String,
        failures: usize,
        window_secs: u64,
    },

    #[error("Unit '{0}' is quarantined; clear the quarantine before automatic remediation resumes")]
    UnitQuarantined(String),

    #[error("Unit '{unit}' did not stop within {timeout_secs}s")]
    ShutdownTimeout { unit: String, timeout_secs: u64 },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl OrchestratorError {
    /// Returns true for errors that abort startup before any process is spawned
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            OrchestratorError::DependencyCycle { .. }
                | OrchestratorError::UnknownDependency { .. }
                | OrchestratorError::Config(_)
        )
    }
}
