// Load balancing advice across same-role units

use crate::config::BalanceStrategy;
use crate::units::metrics::ResourceMonitor;
use crate::units::models::UnitStatus;
use crate::units::registry::Registry;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// Current load of a unit, if known
pub trait LoadSource: Send + Sync {
    fn cpu_percent(&self, unit: &str) -> Option<f64>;
}

impl LoadSource for ResourceMonitor {
    fn cpu_percent(&self, unit: &str) -> Option<f64> {
        self.latest(unit).map(|s| s.cpu_percent)
    }
}

/// Read-only recommendation for one role
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Advice {
    pub role: String,
    pub strategy: BalanceStrategy,
    /// Running instances, best candidate first
    pub ranked: Vec<String>,
    pub preferred: Option<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Default)]
struct BalancerInner {
    advice: BTreeMap<String, Advice>,
    last_assigned: HashMap<String, u64>,
    tick: u64,
}

/// Ranks Running instances of each role. Never routes anything itself.
pub struct LoadBalancerAdvisor {
    registry: Arc<Registry>,
    load: Arc<dyn LoadSource>,
    strategy: BalanceStrategy,
    interval: Duration,
    inner: Mutex<BalancerInner>,
}

impl LoadBalancerAdvisor {
    pub fn new(
        registry: Arc<Registry>,
        load: Arc<dyn LoadSource>,
        strategy: BalanceStrategy,
        interval: Duration,
    ) -> Self {
        Self {
            registry,
            load,
            strategy,
            interval,
            inner: Mutex::new(BalancerInner::default()),
        }
    }

    fn inner(&self) -> std::sync::MutexGuard<'_, BalancerInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.evaluate();
                }
            }
        }
        tracing::debug!("Load balancer advisor stopped");
    }

    /// Recompute advice for every role with at least one Running instance
    pub fn evaluate(&self) -> Vec<Advice> {
        let mut roles: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for def in self.registry.definitions() {
            let Some(role) = &def.role else {
                continue;
            };
            let running = self
                .registry
                .state(&def.id)
                .map(|s| s.status == UnitStatus::Running)
                .unwrap_or(false);
            if running {
                roles.entry(role.clone()).or_default().push(def.id.clone());
            }
        }

        let now = Utc::now();
        let mut inner = self.inner();
        inner.tick += 1;
        let tick = inner.tick;

        let mut fresh = BTreeMap::new();
        for (role, instances) in roles {
            let ranked = match self.strategy {
                BalanceStrategy::LeastLoaded => self.rank_least_loaded(instances),
                BalanceStrategy::LeastRecentlyAssigned => {
                    rank_least_recently_assigned(instances, &inner.last_assigned)
                }
            };
            let preferred = ranked.first().cloned();
            if let Some(unit) = &preferred {
                inner.last_assigned.insert(unit.clone(), tick);
            }

            fresh.insert(
                role.clone(),
                Advice {
                    role,
                    strategy: self.strategy,
                    ranked,
                    preferred,
                    timestamp: now,
                },
            );
        }

        inner.advice = fresh;
        inner.advice.values().cloned().collect()
    }

    fn rank_least_loaded(&self, mut instances: Vec<String>) -> Vec<String> {
        let load: HashMap<String, f64> = instances
            .iter()
            .map(|id| (id.clone(), self.load.cpu_percent(id).unwrap_or(0.0)))
            .collect();
        instances.sort_by(|a, b| {
            load[a]
                .partial_cmp(&load[b])
                .unwrap_or(Ordering::Equal)
                .then_with(|| a.cmp(b))
        });
        instances
    }

    /// Latest advice per role
    pub fn advice(&self) -> Vec<Advice> {
        self.inner().advice.values().cloned().collect()
    }

    pub fn advice_for(&self, role: &str) -> Option<Advice> {
        self.inner().advice.get(role).cloned()
    }
}

// Never-assigned instances first, then oldest assignment
fn rank_least_recently_assigned(
    mut instances: Vec<String>,
    last_assigned: &HashMap<String, u64>,
) -> Vec<String> {
    instances.sort_by(|a, b| {
        let ta = last_assigned.get(a).copied().unwrap_or(0);
        let tb = last_assigned.get(b).copied().unwrap_or(0);
        ta.cmp(&tb).then_with(|| a.cmp(b))
    });
    instances
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::units::models::UnitDefinition;

    struct FixedLoad(HashMap<String, f64>);

    impl LoadSource for FixedLoad {
        fn cpu_percent(&self, unit: &str) -> Option<f64> {
            self.0.get(unit).copied()
        }
    }

    fn registry() -> Arc<Registry> {
        let defs = vec![
            UnitDefinition::new("api-1", "api").role("api"),
            UnitDefinition::new("api-2", "api").role("api"),
            UnitDefinition::new("api-3", "api").role("api"),
            UnitDefinition::new("worker-1", "worker").role("worker"),
            UnitDefinition::new("db", "db"),
        ];
        let registry = Arc::new(Registry::new(defs).unwrap());
        for id in ["api-1", "api-2", "api-3", "worker-1", "db"] {
            registry
                .update(id, |s| s.status = UnitStatus::Running)
                .unwrap();
        }
        registry
    }

    fn advisor(strategy: BalanceStrategy, registry: Arc<Registry>) -> LoadBalancerAdvisor {
        let load = FixedLoad(HashMap::from([
            ("api-1".to_string(), 75.0),
            ("api-2".to_string(), 10.0),
            ("api-3".to_string(), 40.0),
        ]));
        LoadBalancerAdvisor::new(registry, Arc::new(load), strategy, Duration::from_secs(10))
    }

    #[test]
    fn test_least_loaded_ranks_by_cpu() {
        let advisor = advisor(BalanceStrategy::LeastLoaded, registry());
        let advice = advisor.evaluate();

        assert_eq!(advice.len(), 2);
        let api = advisor.advice_for("api").unwrap();
        assert_eq!(api.ranked, vec!["api-2", "api-3", "api-1"]);
        assert_eq!(api.preferred.as_deref(), Some("api-2"));

        let worker = advisor.advice_for("worker").unwrap();
        assert_eq!(worker.preferred.as_deref(), Some("worker-1"));
    }

    #[test]
    fn test_least_recently_assigned_rotates() {
        let advisor = advisor(BalanceStrategy::LeastRecentlyAssigned, registry());

        let picks: Vec<String> = (0..4)
            .map(|_| {
                advisor.evaluate();
                advisor.advice_for("api").unwrap().preferred.unwrap()
            })
            .collect();
        assert_eq!(picks, vec!["api-1", "api-2", "api-3", "api-1"]);
    }

    #[test]
    fn test_only_running_instances_are_ranked() {
        let registry = registry();
        registry
            .update("api-2", |s| s.status = UnitStatus::Degraded)
            .unwrap();
        registry
            .update("worker-1", |s| s.status = UnitStatus::Failed)
            .unwrap();

        let advisor = advisor(BalanceStrategy::LeastLoaded, registry);
        advisor.evaluate();

        let api = advisor.advice_for("api").unwrap();
        assert_eq!(api.ranked, vec!["api-3", "api-1"]);
        assert!(advisor.advice_for("worker").is_none());
        assert_eq!(advisor.advice().len(), 1);
    }
}
