// Orchestrator: wires components together and owns background jobs

use crate::advisory::{Forecaster, LoadBalancerAdvisor};
use crate::config::{Config, OrchestratorSettings};
use crate::error::{OrchestratorError, Result};
use crate::events::{EventKind, EventLog, NewEvent, Severity};
use crate::units::health::{HealthMonitor, HealthProbe, HttpProbe};
use crate::units::lifecycle::{LifecycleController, StartReport};
use crate::units::metrics::{ProcSampler, ResourceMonitor, ResourceSampler};
use crate::units::models::UnitRuntimeState;
use crate::units::process::{OsProcessBackend, ProcessBackend};
use crate::units::registry::Registry;
use crate::units::remediation::{RemediationEngine, RemediationTrigger};
use crate::units::supervisor::Supervisor;
use crate::units::ControlSurface;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::future::Future;
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{timeout_at, Instant};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// How long to wait for SIGKILLed processes to be reaped once the shutdown
/// timeout has run out
const KILL_REAP_WAIT: Duration = Duration::from_secs(1);

/// Runtime state written at shutdown when `state_path` is set
#[derive(Debug, Serialize)]
pub struct StateSnapshot {
    pub taken_at: DateTime<Utc>,
    pub units: BTreeMap<String, UnitRuntimeState>,
}

/// Owns every component for one set of managed units
pub struct Orchestrator {
    settings: OrchestratorSettings,
    registry: Arc<Registry>,
    events: Arc<EventLog>,
    supervisor: Arc<Supervisor>,
    lifecycle: Arc<LifecycleController>,
    remediation: Arc<RemediationEngine>,
    health: Arc<HealthMonitor>,
    resources: Arc<ResourceMonitor>,
    forecaster: Arc<Forecaster>,
    balancer: Arc<LoadBalancerAdvisor>,
    control: ControlSurface,
    triggers: Mutex<Option<mpsc::UnboundedReceiver<RemediationTrigger>>>,
    cancel: CancellationToken,
    tasks: TaskTracker,
}

impl Orchestrator {
    /// Orchestrator managing real OS processes
    pub fn new(config: Config) -> Result<Self> {
        Self::with_components(
            config,
            Arc::new(OsProcessBackend),
            Arc::new(HttpProbe::new()?),
            Arc::new(ProcSampler::new()),
        )
    }

    /// Orchestrator with injected process, probe and sampling backends
    pub fn with_components(
        config: Config,
        backend: Arc<dyn ProcessBackend>,
        probe: Arc<dyn HealthProbe>,
        sampler: Arc<dyn ResourceSampler>,
    ) -> Result<Self> {
        config.validate()?;
        let settings = config.orchestrator;
        let registry = Arc::new(Registry::new(config.units)?);

        let events = Arc::new(match &settings.event_log_path {
            Some(path) => EventLog::with_persistence(path)?,
            None => EventLog::new(),
        });

        let (trigger_tx, trigger_rx) = mpsc::unbounded_channel();
        let supervisor = Arc::new(Supervisor::new(
            registry.clone(),
            backend,
            events.clone(),
            trigger_tx.clone(),
            settings.start_grace(),
            settings.stop_timeout(),
        ));
        let lifecycle = Arc::new(LifecycleController::new(
            registry.clone(),
            supervisor.clone(),
            events.clone(),
            settings.allow_degraded_dependencies,
        ));
        let remediation = Arc::new(RemediationEngine::new(
            lifecycle.clone(),
            events.clone(),
            settings.backoff(),
            settings.flapping(),
            settings.failure_reset_after(),
        ));
        let health = Arc::new(HealthMonitor::new(
            registry.clone(),
            supervisor.clone(),
            probe,
            events.clone(),
            trigger_tx,
            settings.health_interval(),
            settings.max_concurrent_probes,
            settings.probe_failure_threshold,
            settings.unhealthy_restart_after(),
        ));

        let forecaster = Arc::new(Forecaster::new(
            registry.clone(),
            events.clone(),
            settings.forecast_interval(),
            settings.forecast_window,
            Duration::from_secs(settings.forecast_horizon_secs),
            settings.forecast_warn_fraction,
        ));
        let mut resources = ResourceMonitor::new(
            registry.clone(),
            supervisor.clone(),
            sampler,
            events.clone(),
            settings.resource_interval(),
            settings.resource_warn_fraction,
            settings.resource_history,
            settings.hard_kill_on_breach,
        )
        .with_forecaster(forecaster.clone());
        if let Some(path) = &settings.sample_log_path {
            resources = resources.with_sample_log(path)?;
        }
        let resources = Arc::new(resources);

        let balancer = Arc::new(LoadBalancerAdvisor::new(
            registry.clone(),
            resources.clone(),
            settings.balance_strategy,
            settings.balancer_interval(),
        ));
        let control = ControlSurface::new(
            lifecycle.clone(),
            events.clone(),
            forecaster.clone(),
            balancer.clone(),
        );

        Ok(Self {
            settings,
            registry,
            events,
            supervisor,
            lifecycle,
            remediation,
            health,
            resources,
            forecaster,
            balancer,
            control,
            triggers: Mutex::new(Some(trigger_rx)),
            cancel: CancellationToken::new(),
            tasks: TaskTracker::new(),
        })
    }

    pub fn control(&self) -> &ControlSurface {
        &self.control
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn events(&self) -> &Arc<EventLog> {
        &self.events
    }

    pub fn supervisor(&self) -> &Arc<Supervisor> {
        &self.supervisor
    }

    pub fn lifecycle(&self) -> &Arc<LifecycleController> {
        &self.lifecycle
    }

    pub fn health(&self) -> &Arc<HealthMonitor> {
        &self.health
    }

    pub fn resources(&self) -> &Arc<ResourceMonitor> {
        &self.resources
    }

    pub fn settings(&self) -> &OrchestratorSettings {
        &self.settings
    }

    /// Token cancelled when shutdown begins
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Launch remediation and the interval jobs. Only the first call has an effect.
    pub fn spawn_background(&self) {
        let Some(triggers) = self
            .triggers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        else {
            return;
        };

        self.tasks
            .spawn(self.remediation.clone().run(triggers, self.cancel.clone()));
        self.tasks.spawn(self.health.clone().run(self.cancel.clone()));
        self.tasks
            .spawn(self.resources.clone().run(self.cancel.clone()));
        self.tasks
            .spawn(self.forecaster.clone().run(self.cancel.clone()));
        self.tasks
            .spawn(self.balancer.clone().run(self.cancel.clone()));
        tracing::debug!("Background jobs started");
    }

    /// Start background jobs and then every unit in dependency order
    pub async fn start(&self) -> Result<StartReport> {
        self.spawn_background();
        self.lifecycle.start_all().await
    }

    /// Start everything, supervise until `shutdown` completes, then shut down
    pub async fn run<F>(&self, shutdown: F) -> Result<StartReport>
    where
        F: Future<Output = ()>,
    {
        let report = match self.start().await {
            Ok(report) => report,
            Err(e) => {
                let structural = e
                    .downcast_ref::<OrchestratorError>()
                    .is_some_and(OrchestratorError::is_structural);
                if structural {
                    tracing::error!("Invalid unit graph, nothing was started: {}", e);
                }
                self.shutdown().await?;
                return Err(e);
            }
        };

        shutdown.await;
        self.shutdown().await?;
        Ok(report)
    }

    /// Stop all units, dependents first, within `shutdown_timeout_secs` in
    /// total; whatever is still alive afterwards is SIGKILLed.
    pub async fn shutdown(&self) -> Result<()> {
        self.events.append(NewEvent::new(
            EventKind::ShutdownStarted,
            Severity::Info,
            format!("stopping {} units", self.registry.len()),
        ));

        // One budget for the whole graceful phase
        let deadline = Instant::now() + self.settings.shutdown_timeout();

        // No restarts or probes once shutdown has begun
        self.cancel.cancel();
        self.tasks.close();
        if timeout_at(deadline, self.tasks.wait()).await.is_err() {
            tracing::warn!("Background jobs did not finish within the shutdown timeout");
        }

        let stopped = match timeout_at(deadline, self.lifecycle.stop_all(false)).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                tracing::warn!("Graceful stop incomplete: {}", e);
                false
            }
            Err(_) => false,
        };

        if !stopped || !self.supervisor.live_processes().is_empty() {
            let killed = self.supervisor.kill_all(KILL_REAP_WAIT).await;
            self.events.append(
                NewEvent::new(
                    EventKind::ShutdownTimeout,
                    Severity::Error,
                    format!(
                        "units still running after {}s: {}",
                        self.settings.shutdown_timeout_secs,
                        killed.join(", ")
                    ),
                )
                .action("sigkill"),
            );
        }

        if let Some(path) = &self.settings.state_path {
            if let Err(e) = self.write_state_snapshot(path) {
                tracing::error!("Failed to write state snapshot to {}: {}", path.display(), e);
            }
        }

        self.events.append(NewEvent::new(
            EventKind::ShutdownComplete,
            Severity::Info,
            "all units stopped",
        ));
        Ok(())
    }

    /// Current runtime state of every unit
    pub fn state_snapshot(&self) -> StateSnapshot {
        let units = self
            .registry
            .ids()
            .into_iter()
            .filter_map(|id| self.registry.state(&id).ok().map(|state| (id, state)))
            .collect();
        StateSnapshot {
            taken_at: Utc::now(),
            units,
        }
    }

    pub fn write_state_snapshot(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(&self.state_snapshot())?;
        std::fs::write(path, json)?;
        tracing::info!("State snapshot written to {}", path.display());
        Ok(())
    }
}
