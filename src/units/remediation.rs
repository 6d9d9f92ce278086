// Remediation engine: restart policy, backoff and quarantine decisions

use crate::error::{OrchestratorError, Result};
use crate::events::{EventKind, EventLog, NewEvent, Severity};
use crate::units::lifecycle::LifecycleController;
use crate::units::models::{RestartPolicy, UnitStatus};
use crate::units::process::ExitInfo;
use crate::units::registry::Registry;
use crate::units::resilience::{BackoffStrategy, FlappingPolicy};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// Why remediation was asked to look at a unit
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemediationTrigger {
    /// The process of `generation` failed to spawn or exited unexpectedly
    Failed {
        unit: String,
        generation: u64,
        exit: Option<ExitInfo>,
    },
    /// Health stayed bad past the configured threshold
    Unhealthy { unit: String, generation: u64 },
}

impl RemediationTrigger {
    pub fn unit(&self) -> &str {
        match self {
            RemediationTrigger::Failed { unit, .. } | RemediationTrigger::Unhealthy { unit, .. } => {
                unit
            }
        }
    }

    pub fn generation(&self) -> u64 {
        match self {
            RemediationTrigger::Failed { generation, .. }
            | RemediationTrigger::Unhealthy { generation, .. } => *generation,
        }
    }
}

/// What the engine decided for one trigger
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    Restart { delay: Duration, attempt: u32 },
    Quarantine { failures: usize },
    Ignore(String),
}

/// Per-unit restart decisions with exponential backoff and flapping detection
pub struct RemediationEngine {
    registry: Arc<Registry>,
    lifecycle: Arc<LifecycleController>,
    events: Arc<EventLog>,
    backoff: BackoffStrategy,
    flapping: FlappingPolicy,
    failure_reset_after: Duration,
}

impl RemediationEngine {
    pub fn new(
        lifecycle: Arc<LifecycleController>,
        events: Arc<EventLog>,
        backoff: BackoffStrategy,
        flapping: FlappingPolicy,
        failure_reset_after: Duration,
    ) -> Self {
        Self {
            registry: lifecycle.registry().clone(),
            lifecycle,
            events,
            backoff,
            flapping,
            failure_reset_after,
        }
    }

    /// Consume triggers until cancelled; each trigger is handled in its own task
    pub async fn run(
        self: Arc<Self>,
        mut triggers: mpsc::UnboundedReceiver<RemediationTrigger>,
        cancel: CancellationToken,
    ) {
        let tracker = TaskTracker::new();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                trigger = triggers.recv() => match trigger {
                    Some(trigger) => {
                        let engine = Arc::clone(&self);
                        let token = cancel.clone();
                        tracker.spawn(async move { engine.handle(trigger, token).await });
                    }
                    None => break,
                },
            }
        }

        tracker.close();
        tracker.wait().await;
        tracing::debug!("Remediation engine stopped");
    }

    /// Decide, wait out the backoff, then restart
    pub async fn handle(&self, trigger: RemediationTrigger, cancel: CancellationToken) {
        let unit = trigger.unit().to_string();
        let decision = match self.decide(&trigger) {
            Ok(decision) => decision,
            Err(e) => {
                tracing::warn!("Remediation of {} aborted: {}", unit, e);
                return;
            }
        };

        let (delay, attempt) = match decision {
            Decision::Restart { delay, attempt } => (delay, attempt),
            Decision::Quarantine { .. } => {
                // Quarantined for bad health: its process may still be up
                match self.lifecycle.stop_quarantined(&unit).await {
                    Ok(true) => tracing::info!("Stopped the process of quarantined unit {}", unit),
                    Ok(false) => {}
                    Err(e) => tracing::warn!("Failed to stop quarantined unit {}: {}", unit, e),
                }
                return;
            }
            Decision::Ignore(reason) => {
                tracing::debug!("No remediation for {}: {}", unit, reason);
                return;
            }
        };

        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::debug!("Pending restart of {} cancelled", unit);
                return;
            }
            _ = tokio::time::sleep(delay) => {}
        }

        let policy = match self.registry.definition(&unit) {
            Ok(def) => def.restart,
            Err(_) => return,
        };
        let after_crash = matches!(trigger, RemediationTrigger::Failed { .. });
        let result = self
            .lifecycle
            .restart_for_remediation(
                &unit,
                trigger.generation(),
                |state| {
                    // An operator may have stopped or started it while we waited
                    let still_due = if after_crash {
                        state.status == UnitStatus::Failed
                    } else {
                        matches!(state.status, UnitStatus::Running | UnitStatus::Degraded)
                    };
                    still_due && !(policy == RestartPolicy::OnFailure && state.manually_stopped)
                },
                &cancel,
            )
            .await;

        match result {
            Ok(true) => {
                self.events.append(
                    NewEvent::new(
                        EventKind::Restarted,
                        Severity::Info,
                        format!("restarted after {} consecutive failures", attempt),
                    )
                    .unit(&unit)
                    .action("restart"),
                );
            }
            Ok(false) => tracing::debug!("Restart of {} skipped or did not come up", unit),
            Err(e) => tracing::warn!("Restart of {} failed: {}", unit, e),
        }
    }

    /// Apply the unit's restart policy to a trigger and record the failure
    pub fn decide(&self, trigger: &RemediationTrigger) -> Result<Decision> {
        enum Verdict {
            Ignore(String),
            CleanExit,
            Never,
            Quarantine(usize),
            Restart(u32),
        }

        let unit = trigger.unit();
        let def = self.registry.definition(unit)?;
        let policy = def.restart;
        let now = Instant::now();
        let flapping = self.flapping;
        let reset_after = self.failure_reset_after;

        let verdict = self.registry.update(unit, |s| {
            if s.generation != trigger.generation() {
                return Verdict::Ignore("stale trigger".to_string());
            }
            match trigger {
                RemediationTrigger::Failed { exit, .. } => {
                    if s.status != UnitStatus::Failed {
                        return Verdict::Ignore(format!("unit is {}", s.status.label()));
                    }
                    if policy == RestartPolicy::OnFailure && exit.is_some_and(|e| e.success()) {
                        s.status = UnitStatus::Stopped;
                        return Verdict::CleanExit;
                    }
                }
                RemediationTrigger::Unhealthy { .. } => {
                    if !s.status.is_live() {
                        return Verdict::Ignore(format!("unit is {}", s.status.label()));
                    }
                }
            }

            if policy == RestartPolicy::Never {
                return Verdict::Never;
            }
            if policy == RestartPolicy::OnFailure && s.manually_stopped {
                return Verdict::Ignore("unit was stopped manually".to_string());
            }

            // A unit that stayed up long enough starts a fresh backoff sequence
            if s
                .running_since
                .is_some_and(|since| now.duration_since(since) >= reset_after)
            {
                s.consecutive_failure_count = 0;
            }
            s.consecutive_failure_count += 1;

            let failures = s.failure_window.record(now, flapping.window);
            if flapping.is_flapping(failures) {
                s.status = UnitStatus::Quarantined;
                return Verdict::Quarantine(failures);
            }
            Verdict::Restart(s.consecutive_failure_count)
        })?;

        let decision = match verdict {
            Verdict::Ignore(reason) => Decision::Ignore(reason),
            Verdict::CleanExit => {
                self.events.append(
                    NewEvent::new(
                        EventKind::RemediationSkipped,
                        Severity::Info,
                        "clean exit under on-failure policy; unit stays stopped",
                    )
                    .unit(unit),
                );
                Decision::Ignore("clean exit".to_string())
            }
            Verdict::Never => {
                self.events.append(
                    NewEvent::new(
                        EventKind::RemediationSkipped,
                        Severity::Warning,
                        "restart policy is 'never'; waiting for an operator",
                    )
                    .unit(unit),
                );
                Decision::Ignore("restart policy is never".to_string())
            }
            Verdict::Quarantine(failures) => {
                let err = OrchestratorError::FlappingDetected {
                    unit: unit.to_string(),
                    failures,
                    window_secs: flapping.window.as_secs(),
                };
                self.events.append(
                    NewEvent::new(EventKind::Quarantined, Severity::Critical, err.to_string())
                        .unit(unit)
                        .action("quarantine"),
                );
                Decision::Quarantine { failures }
            }
            Verdict::Restart(attempt) => {
                let delay = self.backoff.delay(attempt);
                self.events.append(
                    NewEvent::new(
                        EventKind::RestartScheduled,
                        Severity::Warning,
                        format!("restart attempt {} in {}ms", attempt, delay.as_millis()),
                    )
                    .unit(unit)
                    .action("restart"),
                );
                Decision::Restart { delay, attempt }
            }
        };

        Ok(decision)
    }
}
