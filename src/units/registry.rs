// Unit registry: static definitions plus per-unit runtime state cells

use crate::error::{OrchestratorError, Result};
use crate::units::models::{UnitDefinition, UnitRuntimeState, UnitSnapshot};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::Mutex as ActionLock;

/// Catalog of managed units.
///
/// The set of units is fixed at construction. Each unit owns its own state
/// cell and action lock, so operations on independent units never contend.
pub struct Registry {
    definitions: Vec<Arc<UnitDefinition>>,
    index: HashMap<String, usize>,
    states: Vec<RwLock<UnitRuntimeState>>,
    action_locks: Vec<ActionLock<()>>,
}

impl Registry {
    /// Build a registry, rejecting invalid or duplicate unit ids
    pub fn new(definitions: Vec<UnitDefinition>) -> Result<Self> {
        let mut index = HashMap::new();
        for (i, def) in definitions.iter().enumerate() {
            validate_unit_id(&def.id)?;
            if def.command.trim().is_empty() {
                return Err(OrchestratorError::Config(format!(
                    "unit '{}' has an empty command",
                    def.id
                ))
                .into());
            }
            if index.insert(def.id.clone(), i).is_some() {
                return Err(
                    OrchestratorError::Config(format!("duplicate unit id '{}'", def.id)).into(),
                );
            }
        }

        let states = definitions
            .iter()
            .map(|_| RwLock::new(UnitRuntimeState::default()))
            .collect();
        let action_locks = definitions.iter().map(|_| ActionLock::new(())).collect();

        Ok(Self {
            definitions: definitions.into_iter().map(Arc::new).collect(),
            index,
            states,
            action_locks,
        })
    }

    pub fn len(&self) -> usize {
        self.definitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    /// Unit ids in declaration order
    pub fn ids(&self) -> Vec<String> {
        self.definitions.iter().map(|d| d.id.clone()).collect()
    }

    pub fn definitions(&self) -> &[Arc<UnitDefinition>] {
        &self.definitions
    }

    fn position(&self, id: &str) -> Result<usize> {
        self.index
            .get(id)
            .copied()
            .ok_or_else(|| OrchestratorError::UnknownUnit(id.to_string()).into())
    }

    pub fn definition(&self, id: &str) -> Result<Arc<UnitDefinition>> {
        Ok(self.definitions[self.position(id)?].clone())
    }

    /// Copy of the unit's current runtime state
    pub fn state(&self, id: &str) -> Result<UnitRuntimeState> {
        let cell = &self.states[self.position(id)?];
        Ok(cell.read().unwrap_or_else(PoisonError::into_inner).clone())
    }

    /// Mutate the unit's runtime state under its write lock
    pub fn update<R>(&self, id: &str, f: impl FnOnce(&mut UnitRuntimeState) -> R) -> Result<R> {
        let cell = &self.states[self.position(id)?];
        let mut state = cell.write().unwrap_or_else(PoisonError::into_inner);
        Ok(f(&mut state))
    }

    /// Per-unit lock serializing start/stop/restart actions
    pub fn action_lock(&self, id: &str) -> Result<&ActionLock<()>> {
        Ok(&self.action_locks[self.position(id)?])
    }

    pub fn snapshot(&self, id: &str) -> Result<UnitSnapshot> {
        let def = self.definition(id)?;
        let state = self.state(id)?;
        Ok(UnitSnapshot::from_state(&def, &state))
    }

    pub fn snapshots(&self) -> Vec<UnitSnapshot> {
        self.definitions
            .iter()
            .zip(&self.states)
            .map(|(def, cell)| {
                let state = cell.read().unwrap_or_else(PoisonError::into_inner);
                UnitSnapshot::from_state(def, &state)
            })
            .collect()
    }

    /// Units that list `id` as a direct dependency
    pub fn dependents(&self, id: &str) -> Vec<String> {
        self.definitions
            .iter()
            .filter(|d| d.depends_on.iter().any(|dep| dep == id))
            .map(|d| d.id.clone())
            .collect()
    }

    /// All units that depend on `id`, directly or through other units
    pub fn transitive_dependents(&self, id: &str) -> Vec<String> {
        let mut seen = HashSet::new();
        let mut queue = VecDeque::from(self.dependents(id));
        let mut out = Vec::new();

        while let Some(next) = queue.pop_front() {
            if seen.insert(next.clone()) {
                queue.extend(self.dependents(&next));
                out.push(next);
            }
        }
        out
    }

    /// First dependency of `id` that does not currently allow it to start
    pub fn unmet_dependency(&self, id: &str, allow_degraded: bool) -> Result<Option<String>> {
        let def = self.definition(id)?;
        for dep in &def.depends_on {
            let state = self.state(dep).map_err(|_| OrchestratorError::UnknownDependency {
                unit: id.to_string(),
                dependency: dep.clone(),
            })?;
            if !state.status.satisfies_dependency(allow_degraded) {
                return Ok(Some(dep.clone()));
            }
        }
        Ok(None)
    }

    /// Group units into start waves.
    ///
    /// Every unit in a wave depends only on units in earlier waves; order inside
    /// a wave follows declaration order. Unknown dependencies and cycles are
    /// reported before anything else happens.
    pub fn dependency_waves(&self) -> Result<Vec<Vec<String>>> {
        for def in &self.definitions {
            for dep in &def.depends_on {
                if !self.contains(dep) {
                    return Err(OrchestratorError::UnknownDependency {
                        unit: def.id.clone(),
                        dependency: dep.clone(),
                    }
                    .into());
                }
            }
        }

        let mut remaining: HashMap<&str, HashSet<&str>> = self
            .definitions
            .iter()
            .map(|d| {
                let deps = d.depends_on.iter().map(String::as_str).collect();
                (d.id.as_str(), deps)
            })
            .collect();

        let mut waves = Vec::new();
        while !remaining.is_empty() {
            let wave: Vec<String> = self
                .definitions
                .iter()
                .map(|d| d.id.as_str())
                .filter(|id| remaining.get(id).is_some_and(|deps| deps.is_empty()))
                .map(str::to_string)
                .collect();

            if wave.is_empty() {
                return Err(OrchestratorError::DependencyCycle {
                    units: self.find_cycle(&remaining),
                }
                .into());
            }

            for id in &wave {
                remaining.remove(id.as_str());
            }
            for deps in remaining.values_mut() {
                for id in &wave {
                    deps.remove(id.as_str());
                }
            }
            waves.push(wave);
        }

        Ok(waves)
    }

    // Every unresolved unit still has an unresolved dependency, so following
    // those edges from any unresolved unit must revisit a node.
    fn find_cycle(&self, remaining: &HashMap<&str, HashSet<&str>>) -> Vec<String> {
        let Some(start) = self
            .definitions
            .iter()
            .map(|d| d.id.as_str())
            .find(|id| remaining.contains_key(id))
        else {
            return Vec::new();
        };

        let mut path: Vec<&str> = Vec::new();
        let mut current = start;
        loop {
            if let Some(pos) = path.iter().position(|id| *id == current) {
                let mut cycle: Vec<String> = path[pos..].iter().map(|s| s.to_string()).collect();
                cycle.push(current.to_string());
                return cycle;
            }
            path.push(current);

            let next = remaining.get(current).and_then(|deps| {
                let def = &self.definitions[self.index[current]];
                def.depends_on
                    .iter()
                    .map(String::as_str)
                    .find(|dep| deps.contains(dep))
            });
            match next {
                Some(dep) => current = dep,
                None => return path.iter().map(|s| s.to_string()).collect(),
            }
        }
    }
}

/// Validate unit id format
pub fn validate_unit_id(id: &str) -> Result<()> {
    if id.is_empty() {
        return Err(OrchestratorError::Config("unit id cannot be empty".to_string()).into());
    }

    if id.len() > 128
        || !id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
    {
        return Err(OrchestratorError::Config(format!("invalid unit id '{}'", id)).into());
    }

    Ok(())
}
