//! Instance lifecycle states and the group map.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Instance lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceState {
    /// Name reserved, backend creation not yet confirmed.
    Creating,
    /// Instance created and reported ready by the backend.
    Running,
    /// Instance removed from the backend, awaiting purge.
    Deleted,
}

impl InstanceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Creating => "creating",
            Self::Running => "running",
            Self::Deleted => "deleted",
        }
    }
}

impl fmt::Display for InstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Mapping from instance name to lifecycle state.
///
/// Transitions go through the methods below so the lifecycle rules hold
/// everywhere: `creating` becomes `running` or disappears, `running`
/// becomes `deleted`, and `deleted` is only ever purged.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GroupState {
    instances: BTreeMap<String, InstanceState>,
}

impl GroupState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<InstanceState> {
        self.instances.get(name).copied()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.instances.contains_key(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, InstanceState)> {
        self.instances.iter().map(|(name, state)| (name.as_str(), *state))
    }

    /// Count records in the given state.
    pub fn count(&self, state: InstanceState) -> usize {
        self.instances.values().filter(|s| **s == state).count()
    }

    /// Names of records in the given state, in sorted order.
    pub fn names_in(&self, state: InstanceState) -> Vec<String> {
        self.instances
            .iter()
            .filter(|(_, s)| **s == state)
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Record a freshly reserved name as `creating`.
    ///
    /// Returns false if the name is already present.
    pub fn begin_create(&mut self, name: &str) -> bool {
        if self.instances.contains_key(name) {
            return false;
        }
        self.instances
            .insert(name.to_string(), InstanceState::Creating);
        true
    }

    /// Promote a `creating` record to `running`.
    ///
    /// Returns false, leaving the map alone, if the record is not `creating`.
    pub fn mark_running(&mut self, name: &str) -> bool {
        match self.instances.get_mut(name) {
            Some(state @ InstanceState::Creating) => {
                *state = InstanceState::Running;
                true
            }
            _ => false,
        }
    }

    /// Drop a `creating` record whose creation failed or went stale.
    pub fn abandon_create(&mut self, name: &str) -> bool {
        if self.instances.get(name) == Some(&InstanceState::Creating) {
            self.instances.remove(name);
            true
        } else {
            false
        }
    }

    /// Mark an instance as deleted, whatever its previous state.
    ///
    /// Names unknown to the map are recorded too, so a caller's next update
    /// pass observes the deletion.
    pub fn mark_deleted(&mut self, name: &str) {
        self.instances
            .insert(name.to_string(), InstanceState::Deleted);
    }

    /// Remove every `deleted` record, returning how many were purged.
    pub fn purge_deleted(&mut self) -> usize {
        let before = self.instances.len();
        self.instances
            .retain(|_, state| *state != InstanceState::Deleted);
        before - self.instances.len()
    }
}

impl FromIterator<(String, InstanceState)> for GroupState {
    fn from_iter<T: IntoIterator<Item = (String, InstanceState)>>(iter: T) -> Self {
        Self {
            instances: iter.into_iter().collect(),
        }
    }
}
