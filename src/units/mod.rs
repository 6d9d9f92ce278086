// Managed unit supervision

pub mod control;
pub mod health;
pub mod lifecycle;
pub mod metrics;
pub mod models;
pub mod process;
pub mod registry;
pub mod remediation;
pub mod resilience;
pub mod supervisor;

#[cfg(test)]
mod tests;

pub use control::ControlSurface;
pub use health::{HealthMonitor, HealthProbe, HttpProbe, ProbeOutcome};
pub use lifecycle::{LifecycleController, StartReport};
pub use metrics::{LimitLevel, ProcSampler, RawUsage, ResourceMonitor, ResourceSampler};
pub use models::{
    HealthCheckSpec, HealthStatus, Metric, Prediction, ResourceLimits, ResourceSample,
    RestartPolicy, UnitDefinition, UnitRuntimeState, UnitSnapshot, UnitStatus,
};
pub use process::{ExitInfo, OsProcessBackend, ProcessBackend, ProcessHandle, StopSignal};
pub use registry::{validate_unit_id, Registry};
pub use remediation::{Decision, RemediationEngine, RemediationTrigger};
pub use resilience::{BackoffStrategy, FailureWindow, FlappingPolicy, JitterMode};
pub use supervisor::Supervisor;

// Re-export for tests
#[cfg(test)]
pub use metrics::MockResourceSampler;
