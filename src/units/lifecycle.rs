// Lifecycle controller: dependency-ordered start and stop of units

use crate::error::{OrchestratorError, Result};
use crate::events::{EventKind, EventLog, NewEvent, Severity};
use crate::units::models::{UnitRuntimeState, UnitStatus};
use crate::units::registry::Registry;
use crate::units::supervisor::Supervisor;
use futures::future::join_all;
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Result of a `start_all` run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StartReport {
    /// Units in the order they were considered (dependencies first)
    pub order: Vec<String>,
    pub started: Vec<String>,
    pub failed: Vec<String>,
    pub blocked: Vec<String>,
    /// Already running or quarantined
    pub skipped: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum StartOutcome {
    Started,
    AlreadyRunning,
    Quarantined,
    Blocked(String),
    Failed,
}

/// Drives start/stop of units through the supervisor in dependency order
pub struct LifecycleController {
    registry: Arc<Registry>,
    supervisor: Arc<Supervisor>,
    events: Arc<EventLog>,
    allow_degraded: bool,
}

impl LifecycleController {
    pub fn new(
        registry: Arc<Registry>,
        supervisor: Arc<Supervisor>,
        events: Arc<EventLog>,
        allow_degraded: bool,
    ) -> Self {
        Self {
            registry,
            supervisor,
            events,
            allow_degraded,
        }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn supervisor(&self) -> &Arc<Supervisor> {
        &self.supervisor
    }

    /// Start every unit, dependencies first.
    ///
    /// Units of one wave start concurrently. A cycle or unknown dependency
    /// aborts before anything is spawned.
    pub async fn start_all(&self) -> Result<StartReport> {
        let waves = match self.registry.dependency_waves() {
            Ok(waves) => waves,
            Err(e) => {
                self.events.append(NewEvent::new(
                    EventKind::DependencyError,
                    Severity::Error,
                    format!("startup aborted: {}", e),
                ));
                return Err(e);
            }
        };

        tracing::info!("Starting {} units in {} waves", self.registry.len(), waves.len());
        let mut report = StartReport::default();

        for wave in waves {
            let outcomes = join_all(wave.iter().map(|id| self.start_guarded(id))).await;
            for (id, outcome) in wave.into_iter().zip(outcomes) {
                report.order.push(id.clone());
                match outcome {
                    StartOutcome::Started => report.started.push(id),
                    StartOutcome::Failed => report.failed.push(id),
                    StartOutcome::Blocked(_) => report.blocked.push(id),
                    StartOutcome::AlreadyRunning | StartOutcome::Quarantined => {
                        report.skipped.push(id)
                    }
                }
            }
        }

        tracing::info!(
            "Startup finished: {} started, {} failed, {} blocked",
            report.started.len(),
            report.failed.len(),
            report.blocked.len()
        );
        Ok(report)
    }

    // Start one unit under its action lock, turning errors into outcomes
    async fn start_guarded(&self, id: &str) -> StartOutcome {
        let lock = match self.registry.action_lock(id) {
            Ok(lock) => lock,
            Err(e) => {
                tracing::error!("Cannot start {}: {}", id, e);
                return StartOutcome::Failed;
            }
        };
        let _guard = lock.lock().await;

        let state = match self.registry.state(id) {
            Ok(state) => state,
            Err(_) => return StartOutcome::Failed,
        };
        if state.status.is_live() {
            return StartOutcome::AlreadyRunning;
        }
        if state.status == UnitStatus::Quarantined {
            tracing::warn!("{}", OrchestratorError::UnitQuarantined(id.to_string()));
            return StartOutcome::Quarantined;
        }

        match self.registry.unmet_dependency(id, self.allow_degraded) {
            Ok(None) => {}
            Ok(Some(dep)) => {
                self.mark_blocked(id, &dep);
                return StartOutcome::Blocked(dep);
            }
            Err(e) => {
                tracing::error!("Cannot start {}: {}", id, e);
                return StartOutcome::Failed;
            }
        }

        match self.spawn_unit(id).await {
            Ok(()) => StartOutcome::Started,
            Err(e) => {
                tracing::warn!("Unit {} failed to start: {}", id, e);
                StartOutcome::Failed
            }
        }
    }

    async fn spawn_unit(&self, id: &str) -> Result<()> {
        let def = self.registry.definition(id)?;
        self.supervisor.spawn(&def).await?;
        Ok(())
    }

    fn mark_blocked(&self, id: &str, dependency: &str) {
        let changed = self
            .registry
            .update(id, |s| {
                let changed = s.status != UnitStatus::Blocked
                    || s.blocked_by.as_deref() != Some(dependency);
                s.status = UnitStatus::Blocked;
                s.blocked_by = Some(dependency.to_string());
                changed
            })
            .unwrap_or(false);

        if changed {
            let err = OrchestratorError::DependencyNotReady {
                unit: id.to_string(),
                dependency: dependency.to_string(),
            };
            self.events
                .append(NewEvent::new(EventKind::Blocked, Severity::Warning, err.to_string()).unit(id));
        }
    }

    /// Start a single unit. No-op if it is already live.
    pub async fn start_unit(&self, id: &str) -> Result<()> {
        {
            let _guard = self.registry.action_lock(id)?.lock().await;
            let state = self.registry.state(id)?;
            if state.status.is_live() {
                tracing::debug!("Unit {} already {}", id, state.status.label());
                return Ok(());
            }
            if state.status == UnitStatus::Quarantined {
                self.clear_quarantine_locked(id)?;
            }
            self.stop_tracked(id).await?;

            if let Some(dep) = self.registry.unmet_dependency(id, self.allow_degraded)? {
                self.mark_blocked(id, &dep);
                return Err(OrchestratorError::DependencyNotReady {
                    unit: id.to_string(),
                    dependency: dep,
                }
                .into());
            }
            self.spawn_unit(id).await?;
        }

        self.unblock_dependents(id).await;
        Ok(())
    }

    // Never leave a process the supervisor still tracks behind a new spawn.
    // Callers hold the unit's action lock.
    async fn stop_tracked(&self, id: &str) -> Result<()> {
        if self.supervisor.pid(id).is_some() {
            self.supervisor.stop(id, false).await?;
        }
        Ok(())
    }

    /// Manual restart; coalesces with a restart that happened concurrently
    pub async fn restart_unit(&self, id: &str) -> Result<()> {
        let observed = self.registry.state(id)?.generation;
        {
            let _guard = self.registry.action_lock(id)?.lock().await;
            let state = self.registry.state(id)?;
            if state.generation != observed && state.status.is_live() {
                tracing::info!("Unit {} was restarted while the request waited; nothing to do", id);
                return Ok(());
            }
            if state.status == UnitStatus::Quarantined {
                self.clear_quarantine_locked(id)?;
            }
            self.stop_tracked(id).await?;

            if let Some(dep) = self.registry.unmet_dependency(id, self.allow_degraded)? {
                self.mark_blocked(id, &dep);
                return Err(OrchestratorError::DependencyNotReady {
                    unit: id.to_string(),
                    dependency: dep,
                }
                .into());
            }
            self.spawn_unit(id).await?;
        }

        self.unblock_dependents(id).await;
        Ok(())
    }

    /// Restart requested by the remediation engine.
    ///
    /// Only proceeds if the unit still carries `observed_generation` and
    /// `proceed` accepts its state under the action lock. Nothing is spawned
    /// once `cancel` fires. Returns whether a process was brought up.
    pub async fn restart_for_remediation(
        &self,
        id: &str,
        observed_generation: u64,
        proceed: impl FnOnce(&UnitRuntimeState) -> bool,
        cancel: &CancellationToken,
    ) -> Result<bool> {
        let started = {
            let _guard = self.registry.action_lock(id)?.lock().await;
            let state = self.registry.state(id)?;
            if state.generation != observed_generation
                || state.status == UnitStatus::Quarantined
                || !proceed(&state)
            {
                return Ok(false);
            }

            self.stop_tracked(id).await?;
            if cancel.is_cancelled() {
                tracing::debug!("Shutdown began while {} was stopping; not respawning", id);
                return Ok(false);
            }
            if let Some(dep) = self.registry.unmet_dependency(id, self.allow_degraded)? {
                self.mark_blocked(id, &dep);
                return Ok(false);
            }

            self.registry.update(id, |s| s.restart_count += 1)?;
            match self.spawn_unit(id).await {
                Ok(()) => true,
                Err(e) => {
                    tracing::warn!("Remediation restart of {} failed: {}", id, e);
                    false
                }
            }
        };

        if started {
            self.unblock_dependents(id).await;
        }
        Ok(started)
    }

    /// Re-evaluate Blocked units downstream of `id`
    pub async fn unblock_dependents(&self, id: &str) {
        let mut queue: VecDeque<String> = self.registry.dependents(id).into();
        let mut seen = HashSet::new();

        while let Some(next) = queue.pop_front() {
            if !seen.insert(next.clone()) {
                continue;
            }
            let blocked = self
                .registry
                .state(&next)
                .map(|s| s.status == UnitStatus::Blocked)
                .unwrap_or(false);
            if !blocked {
                continue;
            }

            if self.start_guarded(&next).await == StartOutcome::Started {
                tracing::info!("Unit {} unblocked after {} came up", next, id);
                queue.extend(self.registry.dependents(&next));
            }
        }
    }

    /// Stop a unit and everything depending on it, dependents first
    pub async fn stop_unit(&self, id: &str, force: bool) -> Result<()> {
        self.registry.definition(id)?;
        let mut targets = self.registry.transitive_dependents(id);
        targets.push(id.to_string());
        self.stop_set(&targets, force).await
    }

    /// Stop every unit in reverse dependency order
    pub async fn stop_all(&self, force: bool) -> Result<()> {
        tracing::info!("Stopping all units");
        self.stop_set(&self.registry.ids(), force).await
    }

    async fn stop_set(&self, targets: &[String], force: bool) -> Result<()> {
        let waves = self.registry.dependency_waves().unwrap_or_else(|_| {
            self.registry.ids().into_iter().map(|id| vec![id]).collect()
        });

        let mut first_error = None;
        for wave in waves.into_iter().rev() {
            let batch: Vec<String> = wave.into_iter().filter(|id| targets.contains(id)).collect();
            let results = join_all(batch.iter().map(|id| self.stop_one(id, force))).await;
            for (id, result) in batch.iter().zip(results) {
                if let Err(e) = result {
                    tracing::error!("Failed to stop {}: {}", id, e);
                    first_error.get_or_insert(e);
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn stop_one(&self, id: &str, force: bool) -> Result<()> {
        let _guard = self.registry.action_lock(id)?.lock().await;
        self.registry.update(id, |s| s.manually_stopped = true)?;
        self.supervisor.stop(id, force).await?;
        Ok(())
    }

    /// Stop the process of a unit that was quarantined while still running.
    ///
    /// The unit stays Quarantined; returns false if nothing was running.
    pub async fn stop_quarantined(&self, id: &str) -> Result<bool> {
        let _guard = self.registry.action_lock(id)?.lock().await;
        if self.registry.state(id)?.status != UnitStatus::Quarantined {
            return Ok(false);
        }
        self.supervisor.stop(id, false).await
    }

    /// Operator action: release a quarantined unit (it stays stopped)
    pub async fn clear_quarantine(&self, id: &str) -> Result<bool> {
        let _guard = self.registry.action_lock(id)?.lock().await;
        self.clear_quarantine_locked(id)
    }

    fn clear_quarantine_locked(&self, id: &str) -> Result<bool> {
        let cleared = self.registry.update(id, |s| {
            if s.status != UnitStatus::Quarantined {
                return false;
            }
            s.status = UnitStatus::Stopped;
            s.consecutive_failure_count = 0;
            s.failure_window.clear();
            true
        })?;

        if cleared {
            self.events.append(
                NewEvent::new(
                    EventKind::QuarantineCleared,
                    Severity::Info,
                    "quarantine cleared by operator",
                )
                .unit(id),
            );
        }
        Ok(cleared)
    }
}
