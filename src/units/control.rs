// Operator control surface over the orchestrator

use crate::advisory::{Advice, Forecaster, LoadBalancerAdvisor};
use crate::error::{OrchestratorError, Result};
use crate::events::{Event, EventLog, EventQuery};
use crate::units::lifecycle::LifecycleController;
use crate::units::models::{Prediction, UnitSnapshot};
use crate::units::registry::{validate_unit_id, Registry};
use futures::{Stream, StreamExt};
use std::sync::Arc;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;

/// Status queries and manual lifecycle actions for operators
#[derive(Clone)]
pub struct ControlSurface {
    registry: Arc<Registry>,
    lifecycle: Arc<LifecycleController>,
    events: Arc<EventLog>,
    forecaster: Arc<Forecaster>,
    balancer: Arc<LoadBalancerAdvisor>,
}

impl ControlSurface {
    pub fn new(
        lifecycle: Arc<LifecycleController>,
        events: Arc<EventLog>,
        forecaster: Arc<Forecaster>,
        balancer: Arc<LoadBalancerAdvisor>,
    ) -> Self {
        Self {
            registry: lifecycle.registry().clone(),
            lifecycle,
            events,
            forecaster,
            balancer,
        }
    }

    /// Validate a unit id and check it is registered
    fn resolve(&self, id: &str) -> Result<()> {
        validate_unit_id(id)?;
        if !self.registry.contains(id) {
            return Err(OrchestratorError::UnknownUnit(id.to_string()).into());
        }
        Ok(())
    }

    /// Snapshot of every unit
    pub fn status(&self) -> Vec<UnitSnapshot> {
        self.registry.snapshots()
    }

    pub fn unit(&self, id: &str) -> Result<UnitSnapshot> {
        self.resolve(id)?;
        self.registry.snapshot(id)
    }

    /// Start a unit; a no-op if it is already live
    pub async fn start(&self, id: &str) -> Result<()> {
        self.resolve(id)?;
        tracing::info!("Operator start of {}", id);
        self.lifecycle.start_unit(id).await
    }

    /// Stop a unit and its dependents
    pub async fn stop(&self, id: &str, force: bool) -> Result<()> {
        self.resolve(id)?;
        tracing::info!("Operator stop of {} (force: {})", id, force);
        self.lifecycle.stop_unit(id, force).await
    }

    pub async fn restart(&self, id: &str) -> Result<()> {
        self.resolve(id)?;
        tracing::info!("Operator restart of {}", id);
        self.lifecycle.restart_unit(id).await
    }

    /// Release a quarantined unit; returns false if it was not quarantined
    pub async fn clear_quarantine(&self, id: &str) -> Result<bool> {
        self.resolve(id)?;
        tracing::info!("Operator clearing quarantine of {}", id);
        self.lifecycle.clear_quarantine(id).await
    }

    /// Live stream of events appended from now on.
    ///
    /// A subscriber that falls behind skips the events it missed.
    pub fn subscribe(&self) -> impl Stream<Item = Event> + Send + 'static {
        BroadcastStream::new(self.events.subscribe()).filter_map(|item| async move {
            match item {
                Ok(event) => Some(event),
                Err(BroadcastStreamRecvError::Lagged(missed)) => {
                    tracing::warn!("Event subscriber lagged, {} events skipped", missed);
                    None
                }
            }
        })
    }

    pub fn events(&self, query: &EventQuery) -> Vec<Event> {
        self.events.query(query)
    }

    pub fn predictions(&self) -> Vec<Prediction> {
        self.forecaster.predictions()
    }

    pub fn advice(&self) -> Vec<Advice> {
        self.balancer.advice()
    }
}
