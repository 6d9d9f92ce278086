// Managed unit data models

use crate::units::resilience::FailureWindow;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;
use tokio::time::Instant;

/// Rule governing automatic restarts after a failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RestartPolicy {
    /// Restart after every failure
    Always,
    /// Restart after failures, but never a manually stopped unit or a clean exit
    #[default]
    OnFailure,
    /// Never restart automatically
    Never,
}

impl RestartPolicy {
    pub fn label(&self) -> &'static str {
        match self {
            RestartPolicy::Always => "always",
            RestartPolicy::OnFailure => "on-failure",
            RestartPolicy::Never => "never",
        }
    }
}

/// Advisory resource limits for a unit
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceLimits {
    pub cpu_percent: Option<f64>,
    pub memory_mb: Option<f64>,
}

impl ResourceLimits {
    /// Limit configured for a metric, if any
    pub fn for_metric(&self, metric: Metric) -> Option<f64> {
        match metric {
            Metric::CpuPercent => self.cpu_percent,
            Metric::MemoryMb => self.memory_mb,
        }
    }
}

/// HTTP health check for a unit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthCheckSpec {
    pub url: String,
    #[serde(default = "default_check_interval")]
    pub interval_secs: u64,
    #[serde(default = "default_check_timeout")]
    pub timeout_secs: u64,
}

fn default_check_interval() -> u64 {
    30
}

fn default_check_timeout() -> u64 {
    5
}

impl HealthCheckSpec {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.max(1))
    }
}

/// Static definition of a managed unit, loaded once from config
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitDefinition {
    pub id: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub workdir: Option<PathBuf>,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub restart: RestartPolicy,
    #[serde(default)]
    pub limits: ResourceLimits,
    #[serde(default)]
    pub health_check: Option<HealthCheckSpec>,
    /// Logical role shared by interchangeable instances
    #[serde(default)]
    pub role: Option<String>,
}

impl UnitDefinition {
    /// Minimal definition, mostly useful for tests and programmatic setups
    pub fn new(id: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            command: command.into(),
            args: Vec::new(),
            env: HashMap::new(),
            workdir: None,
            depends_on: Vec::new(),
            restart: RestartPolicy::default(),
            limits: ResourceLimits::default(),
            health_check: None,
            role: None,
        }
    }

    pub fn depends_on<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on = deps.into_iter().map(Into::into).collect();
        self
    }

    pub fn restart(mut self, policy: RestartPolicy) -> Self {
        self.restart = policy;
        self
    }

    pub fn limits(mut self, limits: ResourceLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn health_check(mut self, spec: HealthCheckSpec) -> Self {
        self.health_check = Some(spec);
        self
    }

    pub fn role(mut self, role: impl Into<String>) -> Self {
        self.role = Some(role.into());
        self
    }
}

/// Lifecycle status of a unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum UnitStatus {
    #[default]
    Stopped,
    Starting,
    Running,
    Degraded,
    Blocked,
    Failed,
    Quarantined,
}

impl UnitStatus {
    pub fn label(&self) -> &'static str {
        match self {
            UnitStatus::Stopped => "stopped",
            UnitStatus::Starting => "starting",
            UnitStatus::Running => "running",
            UnitStatus::Degraded => "degraded",
            UnitStatus::Blocked => "blocked",
            UnitStatus::Failed => "failed",
            UnitStatus::Quarantined => "quarantined",
        }
    }

    /// Returns true while a process is (or is about to be) alive
    pub fn is_live(&self) -> bool {
        matches!(
            self,
            UnitStatus::Starting | UnitStatus::Running | UnitStatus::Degraded
        )
    }

    /// Returns true if dependents may start on top of this status
    pub fn satisfies_dependency(&self, allow_degraded: bool) -> bool {
        match self {
            UnitStatus::Running => true,
            UnitStatus::Degraded => allow_degraded,
            _ => false,
        }
    }
}

/// Health as last observed by the health monitor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum HealthStatus {
    #[default]
    Unknown,
    Healthy,
    Unhealthy,
    Unreachable,
}

impl HealthStatus {
    pub fn label(&self) -> &'static str {
        match self {
            HealthStatus::Unknown => "unknown",
            HealthStatus::Healthy => "healthy",
            HealthStatus::Unhealthy => "unhealthy",
            HealthStatus::Unreachable => "unreachable",
        }
    }

    pub fn is_bad(&self) -> bool {
        matches!(self, HealthStatus::Unhealthy | HealthStatus::Unreachable)
    }
}

/// Mutable runtime state of a unit
#[derive(Debug, Clone, Default, Serialize)]
pub struct UnitRuntimeState {
    pub status: UnitStatus,
    pub pid: Option<u32>,
    pub started_at: Option<DateTime<Utc>>,
    pub last_health_check_at: Option<DateTime<Utc>>,
    pub health: HealthStatus,
    pub restart_count: u32,
    pub consecutive_failure_count: u32,
    pub last_exit_code: Option<i32>,
    pub manually_stopped: bool,
    pub blocked_by: Option<String>,
    /// Incremented on every spawn; stale notifications carry an older value
    pub generation: u64,
    #[serde(skip)]
    pub running_since: Option<Instant>,
    #[serde(skip)]
    pub failure_window: FailureWindow,
}

impl UnitRuntimeState {
    /// Time since the current process was started
    pub fn uptime(&self) -> Option<Duration> {
        if !self.status.is_live() {
            return None;
        }
        let started = self.started_at?;
        Utc::now().signed_duration_since(started).to_std().ok()
    }
}

/// Read-only view of a unit for the control surface
#[derive(Debug, Clone, Serialize)]
pub struct UnitSnapshot {
    pub id: String,
    pub status: UnitStatus,
    pub health: HealthStatus,
    pub pid: Option<u32>,
    #[serde(with = "serde_duration_opt")]
    pub uptime: Option<Duration>,
    pub restart_count: u32,
    pub consecutive_failure_count: u32,
    pub last_exit_code: Option<i32>,
    pub blocked_by: Option<String>,
    pub role: Option<String>,
}

impl UnitSnapshot {
    pub fn from_state(def: &UnitDefinition, state: &UnitRuntimeState) -> Self {
        Self {
            id: def.id.clone(),
            status: state.status,
            health: state.health,
            pid: state.pid,
            uptime: state.uptime(),
            restart_count: state.restart_count,
            consecutive_failure_count: state.consecutive_failure_count,
            last_exit_code: state.last_exit_code,
            blocked_by: state.blocked_by.clone(),
            role: def.role.clone(),
        }
    }

    /// One-line summary for logs and the CLI
    pub fn status_summary(&self) -> String {
        let pid = self
            .pid
            .map(|p| p.to_string())
            .unwrap_or_else(|| "-".to_string());
        format!(
            "{} {} ({}) pid={} restarts={}",
            self.id,
            self.status.label(),
            self.health.label(),
            pid,
            self.restart_count
        )
    }
}

/// Resource metric tracked per unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    CpuPercent,
    MemoryMb,
}

impl Metric {
    pub const ALL: [Metric; 2] = [Metric::CpuPercent, Metric::MemoryMb];

    pub fn label(&self) -> &'static str {
        match self {
            Metric::CpuPercent => "cpu_percent",
            Metric::MemoryMb => "memory_mb",
        }
    }
}

/// One CPU/memory observation of a unit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceSample {
    pub unit_id: String,
    pub timestamp: DateTime<Utc>,
    pub cpu_percent: f64,
    pub memory_mb: f64,
}

impl ResourceSample {
    pub fn value(&self, metric: Metric) -> f64 {
        match metric {
            Metric::CpuPercent => self.cpu_percent,
            Metric::MemoryMb => self.memory_mb,
        }
    }
}

/// Advisory forecast of a unit metric
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    pub unit_id: String,
    pub metric: Metric,
    pub predicted_value: f64,
    pub confidence: f64,
    pub horizon_seconds: u64,
    pub timestamp: DateTime<Utc>,
}

// Helper module for optional Duration serialization
mod serde_duration_opt {
    use serde::{Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.map(|d| d.as_secs()).serialize(serializer)
    }
}
