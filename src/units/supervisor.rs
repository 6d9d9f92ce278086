// Process supervisor: owns live process handles and their watchers

use crate::error::{OrchestratorError, Result};
use crate::events::{EventKind, EventLog, NewEvent, Severity};
use crate::units::models::{HealthStatus, UnitDefinition, UnitStatus};
use crate::units::process::{ExitInfo, ProcessBackend, StopSignal};
use crate::units::registry::Registry;
use crate::units::remediation::RemediationTrigger;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{timeout, Instant};

struct LiveProcess {
    pid: u32,
    generation: u64,
    /// Set before any intentional signal so the exit is not treated as a crash
    stopping: Arc<AtomicBool>,
    exited: watch::Receiver<Option<ExitInfo>>,
}

/// Spawns units, promotes them to Running after the grace period and
/// watches each live process for exit.
///
/// State writes are tagged with the spawn generation: once a unit has been
/// respawned, late writes from an older watcher are dropped.
pub struct Supervisor {
    registry: Arc<Registry>,
    backend: Arc<dyn ProcessBackend>,
    events: Arc<EventLog>,
    remediation: mpsc::UnboundedSender<RemediationTrigger>,
    live: Mutex<HashMap<String, LiveProcess>>,
    grace_period: Duration,
    stop_timeout: Duration,
}

impl Supervisor {
    pub fn new(
        registry: Arc<Registry>,
        backend: Arc<dyn ProcessBackend>,
        events: Arc<EventLog>,
        remediation: mpsc::UnboundedSender<RemediationTrigger>,
        grace_period: Duration,
        stop_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            backend,
            events,
            remediation,
            live: Mutex::new(HashMap::new()),
            grace_period,
            stop_timeout,
        }
    }

    fn live_lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, LiveProcess>> {
        self.live.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn stop_timeout(&self) -> Duration {
        self.stop_timeout
    }

    /// Launch a unit and wait out its grace period.
    ///
    /// Callers hold the unit's action lock. Returns the pid once the unit is
    /// Running; an exit inside the grace period is a fast-fail.
    pub async fn spawn(self: &Arc<Self>, def: &UnitDefinition) -> Result<u32> {
        let unit = def.id.as_str();
        let generation = self.registry.update(unit, |s| {
            s.generation += 1;
            s.status = UnitStatus::Starting;
            s.pid = None;
            s.started_at = None;
            s.running_since = None;
            s.health = HealthStatus::Unknown;
            s.blocked_by = None;
            s.manually_stopped = false;
            s.generation
        })?;

        self.events.append(
            NewEvent::new(
                EventKind::Starting,
                Severity::Info,
                format!("launching '{}' (generation {})", def.command, generation),
            )
            .unit(unit),
        );

        let mut handle = match self.backend.spawn(def).await {
            Ok(handle) => handle,
            Err(e) => {
                let err = match e.downcast::<OrchestratorError>() {
                    Ok(typed @ OrchestratorError::SpawnFailure { .. }) => typed,
                    Ok(other) => OrchestratorError::SpawnFailure {
                        unit: unit.to_string(),
                        message: other.to_string(),
                    },
                    Err(other) => OrchestratorError::SpawnFailure {
                        unit: unit.to_string(),
                        message: other.to_string(),
                    },
                };
                self.registry.update(unit, |s| {
                    if s.generation == generation {
                        s.status = UnitStatus::Failed;
                        s.pid = None;
                        s.last_exit_code = None;
                    }
                })?;
                self.events.append(
                    NewEvent::new(EventKind::SpawnFailed, Severity::Error, err.to_string()).unit(unit),
                );
                self.notify_failure(unit, generation, None);
                return Err(err.into());
            }
        };

        let pid = handle.pid();
        let stopping = Arc::new(AtomicBool::new(false));
        let (exit_tx, exit_rx) = watch::channel(None);

        self.registry.update(unit, |s| {
            if s.generation == generation {
                s.pid = Some(pid);
            }
        })?;
        self.live_lock().insert(
            unit.to_string(),
            LiveProcess {
                pid,
                generation,
                stopping: stopping.clone(),
                exited: exit_rx,
            },
        );

        let early_exit = tokio::select! {
            res = handle.wait() => Some(res),
            _ = tokio::time::sleep(self.grace_period) => None,
        };

        if let Some(res) = early_exit {
            let exit = res.unwrap_or_else(|e| {
                tracing::warn!("Failed to collect exit status of {} (pid {}): {}", unit, pid, e);
                ExitInfo { code: None, signal: None }
            });
            self.finish(unit, generation, exit, &stopping, true);
            exit_tx.send_replace(Some(exit));

            if stopping.load(Ordering::SeqCst) {
                return Err(anyhow::anyhow!("Unit '{}' was stopped during startup", unit));
            }
            return Err(OrchestratorError::StartupExit {
                unit: unit.to_string(),
                exit: exit.to_string(),
            }
            .into());
        }

        let promoted = self.registry.update(unit, |s| {
            if s.generation == generation
                && s.status == UnitStatus::Starting
                && !stopping.load(Ordering::SeqCst)
            {
                s.status = UnitStatus::Running;
                s.started_at = Some(Utc::now());
                s.running_since = Some(Instant::now());
                true
            } else {
                false
            }
        })?;
        if promoted {
            self.events.append(
                NewEvent::new(EventKind::Started, Severity::Info, format!("running as pid {}", pid))
                    .unit(unit),
            );
        }

        let supervisor = Arc::clone(self);
        let unit_id = unit.to_string();
        tokio::spawn(async move {
            let exit = handle.wait().await.unwrap_or_else(|e| {
                tracing::warn!("Failed to collect exit status of {} (pid {}): {}", unit_id, pid, e);
                ExitInfo { code: None, signal: None }
            });
            supervisor.finish(&unit_id, generation, exit, &stopping, false);
            exit_tx.send_replace(Some(exit));
        });

        Ok(pid)
    }

    /// Record a process exit for the generation that owned it
    fn finish(
        &self,
        unit: &str,
        generation: u64,
        exit: ExitInfo,
        stopping: &AtomicBool,
        during_grace: bool,
    ) {
        {
            let mut live = self.live_lock();
            if live.get(unit).is_some_and(|p| p.generation == generation) {
                live.remove(unit);
            }
        }

        let expected = stopping.load(Ordering::SeqCst);
        let applied = self
            .registry
            .update(unit, |s| {
                if s.generation != generation {
                    return None;
                }
                // running_since is kept so remediation can tell how long it ran
                s.pid = None;
                s.last_exit_code = exit.code;
                if s.status == UnitStatus::Quarantined {
                    // Only an operator lifts a quarantine
                    s.health = HealthStatus::Unknown;
                    return Some(UnitStatus::Quarantined);
                }
                if expected {
                    s.status = UnitStatus::Stopped;
                    s.health = HealthStatus::Unknown;
                } else {
                    s.status = UnitStatus::Failed;
                }
                Some(s.status)
            })
            .unwrap_or(None);

        let Some(status) = applied else {
            tracing::debug!("Ignoring stale exit of {} generation {}", unit, generation);
            return;
        };

        if status == UnitStatus::Quarantined {
            self.events.append(
                NewEvent::new(
                    EventKind::Stopped,
                    Severity::Info,
                    format!("quarantined process ended ({})", exit),
                )
                .unit(unit),
            );
            return;
        }

        if expected {
            self.events.append(
                NewEvent::new(EventKind::Stopped, Severity::Info, format!("stopped ({})", exit))
                    .unit(unit),
            );
            return;
        }

        let (kind, err) = if during_grace {
            (
                EventKind::StartupExit,
                OrchestratorError::StartupExit {
                    unit: unit.to_string(),
                    exit: exit.to_string(),
                },
            )
        } else {
            (
                EventKind::UnexpectedExit,
                OrchestratorError::UnexpectedExit {
                    unit: unit.to_string(),
                    exit: exit.to_string(),
                },
            )
        };
        self.events
            .append(NewEvent::new(kind, Severity::Error, err.to_string()).unit(unit));
        self.notify_failure(unit, generation, Some(exit));
    }

    fn notify_failure(&self, unit: &str, generation: u64, exit: Option<ExitInfo>) {
        let trigger = RemediationTrigger::Failed {
            unit: unit.to_string(),
            generation,
            exit,
        };
        if self.remediation.send(trigger).is_err() {
            tracing::debug!("Remediation engine is gone; failure of {} not handed over", unit);
        }
    }

    /// Stop a unit's process: SIGTERM, wait, then SIGKILL.
    ///
    /// Returns false if the unit had no live process.
    pub async fn stop(&self, unit: &str, force: bool) -> Result<bool> {
        let entry = self.live_lock().get(unit).map(|p| {
            (p.pid, p.stopping.clone(), p.exited.clone())
        });

        let Some((pid, stopping, mut exited)) = entry else {
            self.registry.update(unit, |s| {
                if matches!(s.status, UnitStatus::Failed | UnitStatus::Blocked) {
                    s.status = UnitStatus::Stopped;
                    s.pid = None;
                }
            })?;
            return Ok(false);
        };

        stopping.store(true, Ordering::SeqCst);
        self.events.append(
            NewEvent::new(
                EventKind::Stopping,
                Severity::Info,
                if force {
                    format!("killing pid {}", pid)
                } else {
                    format!("terminating pid {}", pid)
                },
            )
            .unit(unit),
        );

        if !force {
            self.backend.signal(pid, StopSignal::Terminate)?;
            let exited_in_time = timeout(self.stop_timeout, exited.wait_for(|e| e.is_some()))
                .await
                .is_ok();
            if exited_in_time {
                return Ok(true);
            }

            let err = OrchestratorError::ShutdownTimeout {
                unit: unit.to_string(),
                timeout_secs: self.stop_timeout.as_secs(),
            };
            self.events.append(
                NewEvent::new(EventKind::StopEscalated, Severity::Warning, err.to_string())
                    .unit(unit)
                    .action("sigkill"),
            );
        }

        self.backend.signal(pid, StopSignal::Kill)?;
        let exited_in_time = timeout(self.stop_timeout, exited.wait_for(|e| e.is_some()))
            .await
            .is_ok();
        if exited_in_time {
            Ok(true)
        } else {
            Err(OrchestratorError::ShutdownTimeout {
                unit: unit.to_string(),
                timeout_secs: self.stop_timeout.as_secs(),
            }
            .into())
        }
    }

    /// SIGKILL a unit without marking the exit as intentional
    pub fn kill_unexpected(&self, unit: &str) -> Result<bool> {
        let pid = self.live_lock().get(unit).map(|p| p.pid);
        match pid {
            Some(pid) => {
                self.backend.signal(pid, StopSignal::Kill)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// SIGKILL every live process and wait briefly for the watchers to reap them
    pub async fn kill_all(&self, wait: Duration) -> Vec<String> {
        let targets: Vec<(String, u32, watch::Receiver<Option<ExitInfo>>)> = self
            .live_lock()
            .iter()
            .map(|(unit, p)| {
                p.stopping.store(true, Ordering::SeqCst);
                (unit.clone(), p.pid, p.exited.clone())
            })
            .collect();

        let mut killed = Vec::new();
        for (unit, pid, _) in &targets {
            if let Err(e) = self.backend.signal(*pid, StopSignal::Kill) {
                tracing::error!("Failed to kill {} (pid {}): {}", unit, pid, e);
            }
            killed.push(unit.clone());
        }

        let waits = targets.into_iter().map(|(unit, _, mut rx)| async move {
            if timeout(wait, rx.wait_for(|e| e.is_some())).await.is_err() {
                tracing::error!("Unit {} still not reaped after SIGKILL", unit);
            }
        });
        futures::future::join_all(waits).await;
        killed
    }

    /// Move Running <-> Degraded to follow health
    pub fn mark_degraded(&self, unit: &str, degraded: bool) -> Result<bool> {
        self.registry.update(unit, |s| match (degraded, s.status) {
            (true, UnitStatus::Running) => {
                s.status = UnitStatus::Degraded;
                true
            }
            (false, UnitStatus::Degraded) => {
                s.status = UnitStatus::Running;
                true
            }
            _ => false,
        })
    }

    pub fn pid(&self, unit: &str) -> Option<u32> {
        self.live_lock().get(unit).map(|p| p.pid)
    }

    /// Whether the unit's current process is still alive
    pub fn is_alive(&self, unit: &str) -> bool {
        match self.pid(unit) {
            Some(pid) => self.backend.is_alive(pid),
            None => false,
        }
    }

    /// (unit, pid) for every live process
    pub fn live_processes(&self) -> Vec<(String, u32)> {
        self.live_lock()
            .iter()
            .map(|(unit, p)| (unit.clone(), p.pid))
            .collect()
    }
}
