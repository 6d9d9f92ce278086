// Health monitoring: periodic probes of running units

use crate::error::{OrchestratorError, Result};
use crate::events::{EventKind, EventLog, NewEvent, Severity};
use crate::units::models::{HealthCheckSpec, HealthStatus, UnitDefinition, UnitStatus};
use crate::units::registry::Registry;
use crate::units::remediation::RemediationTrigger;
use crate::units::supervisor::Supervisor;
use async_trait::async_trait;
use chrono::Utc;
use futures::stream::{self, StreamExt};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{timeout, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Result of a single probe
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    Healthy,
    Failed(String),
    TimedOut,
}

/// Checks a unit's health endpoint
#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn probe(&self, unit: &str, check: &HealthCheckSpec) -> ProbeOutcome;
}

/// HTTP GET probe; any 2xx response is healthy
pub struct HttpProbe {
    client: reqwest::Client,
}

impl HttpProbe {
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("procvisor/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl HealthProbe for HttpProbe {
    async fn probe(&self, unit: &str, check: &HealthCheckSpec) -> ProbeOutcome {
        let response = self
            .client
            .get(&check.url)
            .timeout(check.timeout())
            .send()
            .await;

        match response {
            Ok(resp) if resp.status().is_success() => ProbeOutcome::Healthy,
            Ok(resp) => ProbeOutcome::Failed(format!("HTTP {}", resp.status())),
            Err(e) if e.is_timeout() => ProbeOutcome::TimedOut,
            Err(e) => {
                tracing::debug!("Probe of {} at {} failed: {}", unit, check.url, e);
                ProbeOutcome::Failed(e.to_string())
            }
        }
    }
}

#[derive(Debug, Default)]
struct ProbeTracker {
    generation: u64,
    consecutive_failures: u32,
    last_probe: Option<Instant>,
    bad_since: Option<Instant>,
    triggered: bool,
}

/// Periodically probes Running/Degraded units.
///
/// The monitor only reports: it flips health, moves Running <-> Degraded and
/// hands sustained bad health to remediation. It never restarts anything.
pub struct HealthMonitor {
    registry: Arc<Registry>,
    supervisor: Arc<Supervisor>,
    probe: Arc<dyn HealthProbe>,
    events: Arc<EventLog>,
    remediation: mpsc::UnboundedSender<RemediationTrigger>,
    interval: Duration,
    max_concurrent: usize,
    failure_threshold: u32,
    unhealthy_restart_after: Duration,
    trackers: Mutex<HashMap<String, ProbeTracker>>,
}

impl HealthMonitor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registry: Arc<Registry>,
        supervisor: Arc<Supervisor>,
        probe: Arc<dyn HealthProbe>,
        events: Arc<EventLog>,
        remediation: mpsc::UnboundedSender<RemediationTrigger>,
        interval: Duration,
        max_concurrent: usize,
        failure_threshold: u32,
        unhealthy_restart_after: Duration,
    ) -> Self {
        Self {
            registry,
            supervisor,
            probe,
            events,
            remediation,
            interval,
            max_concurrent: max_concurrent.max(1),
            failure_threshold: failure_threshold.max(1),
            unhealthy_restart_after,
            trackers: Mutex::new(HashMap::new()),
        }
    }

    fn trackers(&self) -> std::sync::MutexGuard<'_, HashMap<String, ProbeTracker>> {
        self.trackers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Sweep on a fixed interval until cancelled
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = self.sweep() => {}
                    }
                }
            }
        }
        tracing::debug!("Health monitor stopped");
    }

    /// Check every Running/Degraded unit once; returns how many were checked.
    ///
    /// Endpoint probes run concurrently, bounded by `max_concurrent_probes`,
    /// and each result is applied as soon as it arrives.
    pub async fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut due: Vec<(Arc<UnitDefinition>, HealthCheckSpec, u64)> = Vec::new();
        let mut checked = 0;

        for def in self.registry.definitions() {
            let Ok(state) = self.registry.state(&def.id) else {
                continue;
            };
            if !matches!(state.status, UnitStatus::Running | UnitStatus::Degraded) {
                continue;
            }

            match &def.health_check {
                None => {
                    let health = if self.supervisor.is_alive(&def.id) {
                        HealthStatus::Healthy
                    } else {
                        HealthStatus::Unreachable
                    };
                    self.apply(&def.id, state.generation, Some(health), "process liveness");
                    checked += 1;
                }
                Some(check) => {
                    if self.is_due(&def.id, state.generation, check, now) {
                        due.push((def.clone(), check.clone(), state.generation));
                    }
                }
            }
        }

        let mut results = stream::iter(due)
            .map(|(def, check, generation)| async move {
                let outcome = match timeout(check.timeout(), self.probe.probe(&def.id, &check)).await {
                    Ok(outcome) => outcome,
                    Err(_) => ProbeOutcome::TimedOut,
                };
                (def, check, generation, outcome)
            })
            .buffer_unordered(self.max_concurrent);

        while let Some((def, check, generation, outcome)) = results.next().await {
            self.record_probe(&def.id, generation, &check, outcome);
            checked += 1;
        }
        checked
    }

    fn is_due(&self, unit: &str, generation: u64, check: &HealthCheckSpec, now: Instant) -> bool {
        let mut trackers = self.trackers();
        let tracker = trackers.entry(unit.to_string()).or_default();
        if tracker.generation != generation {
            *tracker = ProbeTracker {
                generation,
                ..ProbeTracker::default()
            };
        }
        match tracker.last_probe {
            Some(last) if now.duration_since(last) < check.interval() => false,
            _ => {
                tracker.last_probe = Some(now);
                true
            }
        }
    }

    fn record_probe(&self, unit: &str, generation: u64, check: &HealthCheckSpec, outcome: ProbeOutcome) {
        let (health, detail) = {
            let mut trackers = self.trackers();
            let tracker = trackers.entry(unit.to_string()).or_default();
            if tracker.generation != generation {
                return;
            }
            let err = match outcome {
                ProbeOutcome::Healthy => {
                    tracker.consecutive_failures = 0;
                    None
                }
                ProbeOutcome::TimedOut => Some(OrchestratorError::ProbeTimeout {
                    unit: unit.to_string(),
                    timeout_secs: check.timeout().as_secs(),
                }),
                ProbeOutcome::Failed(message) => Some(OrchestratorError::ProbeFailure {
                    unit: unit.to_string(),
                    message,
                }),
            };

            match err {
                None => (Some(HealthStatus::Healthy), "probe succeeded".to_string()),
                Some(err) => {
                    tracker.consecutive_failures += 1;
                    tracing::debug!(
                        "{} ({} of {})",
                        err,
                        tracker.consecutive_failures,
                        self.failure_threshold
                    );
                    let health = (tracker.consecutive_failures >= self.failure_threshold)
                        .then_some(HealthStatus::Unhealthy);
                    (
                        health,
                        format!("{} consecutive failures, last: {}", tracker.consecutive_failures, err),
                    )
                }
            }
        };

        self.apply(unit, generation, health, &detail);
    }

    // Write the observed health for `generation` and publish transitions
    fn apply(&self, unit: &str, generation: u64, health: Option<HealthStatus>, detail: &str) {
        let transition = self
            .registry
            .update(unit, |s| {
                if s.generation != generation {
                    return None;
                }
                s.last_health_check_at = Some(Utc::now());
                let next = health?;
                if next == s.health {
                    return None;
                }
                let previous = s.health;
                s.health = next;
                Some((previous, next))
            })
            .ok()
            .flatten();

        if let Some((previous, next)) = transition {
            let severity = if next.is_bad() {
                Severity::Warning
            } else {
                Severity::Info
            };
            self.events.append(
                NewEvent::new(
                    EventKind::HealthChanged,
                    severity,
                    format!("{} -> {} ({})", previous.label(), next.label(), detail),
                )
                .unit(unit),
            );
            if let Err(e) = self.supervisor.mark_degraded(unit, next.is_bad()) {
                tracing::warn!("Could not update status of {}: {}", unit, e);
            }
        }

        self.check_sustained(unit, generation);
    }

    // Hand a unit to remediation once it has been bad for long enough
    fn check_sustained(&self, unit: &str, generation: u64) {
        let Ok(state) = self.registry.state(unit) else {
            return;
        };
        if state.generation != generation {
            return;
        }

        let now = Instant::now();
        let fire = {
            let mut trackers = self.trackers();
            let tracker = trackers.entry(unit.to_string()).or_default();
            if tracker.generation != generation {
                *tracker = ProbeTracker {
                    generation,
                    ..ProbeTracker::default()
                };
            }

            if !state.health.is_bad() {
                tracker.bad_since = None;
                tracker.triggered = false;
                false
            } else {
                let since = *tracker.bad_since.get_or_insert(now);
                if !tracker.triggered && now.duration_since(since) >= self.unhealthy_restart_after {
                    tracker.triggered = true;
                    true
                } else {
                    false
                }
            }
        };

        if fire {
            tracing::warn!(
                "Unit {} has been {} for {:?}; requesting remediation",
                unit,
                state.health.label(),
                self.unhealthy_restart_after
            );
            let trigger = RemediationTrigger::Unhealthy {
                unit: unit.to_string(),
                generation,
            };
            if self.remediation.send(trigger).is_err() {
                tracing::debug!("Remediation engine is gone; {} stays unhealthy", unit);
            }
        }
    }

    /// Consecutive probe failures currently counted for a unit
    pub fn consecutive_failures(&self, unit: &str) -> u32 {
        self.trackers()
            .get(unit)
            .map(|t| t.consecutive_failures)
            .unwrap_or(0)
    }
}
