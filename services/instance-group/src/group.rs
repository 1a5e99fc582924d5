//! Instance group reconciler.
//!
//! The group turns capacity requests into backend operations and keeps the
//! local record of every instance in step with what the backend reports:
//! - `increase` reserves names, creates instances and records the outcome
//! - `decrease` deletes instances, treating already-missing ones as deleted
//! - `update` reports every record to the caller
//! - `shutdown` purges deleted records
//!
//! A single mutex guards the group map. It is held for the in-memory change
//! and the state file write that follows, never across a backend call.
//! Per-instance operations inside one request run concurrently.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures_util::future::join_all;
use tracing::{debug, error, info, warn};

use crate::backend::{BackendError, InstanceSpec, VmBackend};
use crate::config::GroupConfig;
use crate::error::{GroupError, Result};
use crate::naming::NameGenerator;
use crate::state::{GroupState, InstanceState, StateStore};

/// Attempts at drawing an unused name before giving up on one instance.
const MAX_NAME_ATTEMPTS: usize = 16;

/// State guarded by the group lock.
#[derive(Debug, Default)]
pub(crate) struct Inner {
    pub(crate) state: GroupState,
    /// Names whose creation is running in this process right now.
    pub(crate) in_flight: HashSet<String>,
}

/// A managed group of VM instances.
pub struct InstanceGroup {
    pub(crate) config: GroupConfig,
    pub(crate) backend: Arc<dyn VmBackend>,
    pub(crate) store: StateStore,
    pub(crate) names: NameGenerator,
    pub(crate) inner: Mutex<Inner>,
}

/// Marks a name as in flight until dropped.
///
/// Dropping happens on completion and on cancellation alike, so a cancelled
/// create leaves its `creating` record visible to stale detection.
struct InFlight<'a> {
    group: &'a InstanceGroup,
    name: String,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.group.lock().in_flight.remove(&self.name);
    }
}

impl InstanceGroup {
    pub(crate) fn new(
        config: GroupConfig,
        backend: Arc<dyn VmBackend>,
        store: StateStore,
        state: GroupState,
    ) -> Self {
        let names = NameGenerator::new(config.naming_scheme.clone());
        Self {
            config,
            backend,
            store,
            names,
            inner: Mutex::new(Inner {
                state,
                in_flight: HashSet::new(),
            }),
        }
    }

    pub fn config(&self) -> &GroupConfig {
        &self.config
    }

    /// Copy of the current group map.
    pub fn snapshot(&self) -> GroupState {
        self.lock().state.clone()
    }

    /// Request `delta` more instances.
    ///
    /// Instances already being created count towards the request. Returns
    /// how many instances reached `running`. Individual failures only lower
    /// that count; an error is returned only if every attempt failed.
    pub async fn increase(&self, delta: usize) -> Result<usize> {
        info!(requested = delta, "Scale up request");

        let creating = {
            let inner = self.lock();
            let creating = inner.state.count(InstanceState::Creating);
            info!(
                total = inner.state.len(),
                creating,
                requested = delta,
                will_create = delta.saturating_sub(creating),
                "State analysis"
            );
            creating
        };

        let mut to_create = delta.saturating_sub(creating);

        if creating > 0 {
            let cleaned = self.cleanup_stale_creating().await;
            if cleaned > 0 {
                to_create = delta.saturating_sub(creating.saturating_sub(cleaned));
                info!(
                    stale_removed = cleaned,
                    will_create = to_create,
                    "Recomputed scale up after cleanup"
                );
            }
        }

        if to_create == 0 {
            info!("No new instances needed");
            return Ok(0);
        }

        let outcomes = join_all((1..=to_create).map(|n| self.create_one(n, to_create))).await;

        let mut success = 0;
        let mut last_error = None;
        for outcome in outcomes {
            match outcome {
                Ok(()) => success += 1,
                Err(e) => last_error = Some(e),
            }
        }

        match last_error {
            Some(last_error) if success == 0 => {
                error!(
                    requested = delta,
                    attempted = to_create,
                    error = %last_error,
                    "Scale up failed"
                );
                Err(GroupError::CreationFailed {
                    attempted: to_create,
                    last_error,
                })
            }
            Some(_) => {
                warn!(
                    requested = delta,
                    attempted = to_create,
                    successful = success,
                    failed = to_create - success,
                    "Partial scale up"
                );
                Ok(success)
            }
            None => {
                info!(requested = delta, created = success, "Scale up completed");
                Ok(success)
            }
        }
    }

    /// Delete the named instances.
    ///
    /// Returns the names that were deleted or were already gone, in request
    /// order. Names that could not be deleted keep their previous state.
    pub async fn decrease<S: AsRef<str>>(&self, names: &[S]) -> Vec<String> {
        let total = names.len();
        info!(requested = total, "Scale down request");

        let outcomes = join_all(
            names
                .iter()
                .enumerate()
                .map(|(i, name)| self.delete_one(name.as_ref(), i + 1, total)),
        )
        .await;

        let removed: Vec<String> = names
            .iter()
            .zip(outcomes)
            .filter(|(_, removed)| *removed)
            .map(|(name, _)| name.as_ref().to_string())
            .collect();

        if removed.len() == total {
            info!(requested = total, deleted = removed.len(), "Scale down completed");
        } else if !removed.is_empty() {
            warn!(
                requested = total,
                deleted = removed.len(),
                failed = total - removed.len(),
                "Partial scale down"
            );
        } else {
            error!(requested = total, deleted = 0, "Scale down failed");
        }

        removed
    }

    /// Report every record to `report`, then persist the map.
    pub fn update(&self, mut report: impl FnMut(&str, InstanceState)) {
        let inner = self.lock();
        for (name, state) in inner.state.iter() {
            report(name, state);
        }
        self.persist(&inner.state);
    }

    /// Purge `deleted` records. Returns how many were removed.
    pub fn shutdown(&self) -> usize {
        let mut inner = self.lock();
        let purged = inner.state.purge_deleted();
        self.persist(&inner.state);
        info!(purged, remaining = inner.state.len(), "Purged deleted instances");
        purged
    }

    /// Remove `creating` records the backend no longer knows about.
    ///
    /// Records whose creation is in flight in this process are skipped, and
    /// a record whose lookup fails is kept. Returns the number removed.
    pub async fn cleanup_stale_creating(&self) -> usize {
        let candidates: Vec<String> = {
            let inner = self.lock();
            inner
                .state
                .names_in(InstanceState::Creating)
                .into_iter()
                .filter(|name| !inner.in_flight.contains(name))
                .collect()
        };

        if candidates.is_empty() {
            debug!("No stale candidates");
            return 0;
        }

        info!(to_check = candidates.len(), "Checking for stale instances");

        let lookups = join_all(candidates.iter().map(|name| async move {
            (name, self.backend.get_instance(name).await)
        }))
        .await;

        let stale: Vec<&String> = lookups
            .into_iter()
            .filter_map(|(name, lookup)| match lookup {
                Ok(None) => {
                    warn!(name = %name, "Found stale instance, not present in backend");
                    Some(name)
                }
                Ok(Some(_)) => {
                    debug!(name = %name, "Instance exists in backend");
                    None
                }
                Err(e) => {
                    warn!(name = %name, error = %e, "Could not check instance, keeping record");
                    None
                }
            })
            .collect();

        if stale.is_empty() {
            return 0;
        }

        let mut guard = self.lock();
        let inner = &mut *guard;
        let mut removed = 0;
        for name in stale {
            if inner.in_flight.contains(name) {
                continue;
            }
            if inner.state.abandon_create(name) {
                removed += 1;
            }
        }
        if removed > 0 {
            self.persist(&inner.state);
            info!(stale_removed = removed, "Removed stale instances");
        }
        removed
    }

    async fn create_one(&self, n: usize, total: usize) -> Result<(), BackendError> {
        let progress = format!("{n}/{total}");
        let reservation = self.reserve_name()?;
        let name = reservation.name.as_str();

        let spec = InstanceSpec {
            name: name.to_string(),
            size_class: self.config.instance_size.clone(),
            image: self.config.image.clone(),
            disk_size: self.config.disk_size.clone(),
            startup_timeout: self.config.startup_timeout(),
        };

        info!(
            name = %name,
            progress = %progress,
            image = %spec.image,
            size = %spec.size_class,
            disk_size = %spec.disk_size,
            "Creating instance"
        );

        let created = self.backend.create_instance(&spec).await;
        match created {
            Ok(()) => {
                let promoted = {
                    let mut inner = self.lock();
                    let promoted = inner.state.mark_running(name);
                    if promoted {
                        self.persist(&inner.state);
                    } else {
                        warn!(
                            name = %name,
                            state = ?inner.state.get(name),
                            "Instance finished creating after its record changed"
                        );
                    }
                    promoted
                };

                if promoted {
                    info!(name = %name, progress = %progress, "Instance created");
                    return Ok(());
                }

                // No record tracks this instance any more; remove it from the backend.
                if let Err(e) = self.backend.delete_instance(name).await {
                    error!(name = %name, error = %e, "Failed to remove untracked instance");
                }
                Err(BackendError::Creation {
                    name: name.to_string(),
                    message: "instance record changed while it was being created".to_string(),
                })
            }
            Err(e) => {
                error!(name = %name, progress = %progress, error = %e, "Instance creation failed");
                let mut inner = self.lock();
                inner.state.abandon_create(name);
                self.persist(&inner.state);
                Err(e)
            }
        }
    }

    async fn delete_one(&self, name: &str, n: usize, total: usize) -> bool {
        let progress = format!("{n}/{total}");
        info!(name = %name, progress = %progress, "Deleting instance");

        if self.lock().in_flight.contains(name) {
            warn!(name = %name, progress = %progress, "Instance is still being created, skipping");
            return false;
        }

        match self.backend.get_instance(name).await {
            Ok(None) => {
                info!(name = %name, "Instance not found in backend, already deleted");
                self.record_deleted(name);
                true
            }
            Ok(Some(_)) => match self.backend.delete_instance(name).await {
                Ok(()) => {
                    self.record_deleted(name);
                    info!(name = %name, progress = %progress, "Instance deleted");
                    true
                }
                Err(e) => {
                    error!(name = %name, progress = %progress, error = %e, "Instance deletion failed");
                    false
                }
            },
            Err(e) => {
                error!(name = %name, progress = %progress, error = %e, "Could not look up instance");
                false
            }
        }
    }

    /// Reserve an unused name, record it as `creating` and persist.
    fn reserve_name(&self) -> Result<InFlight<'_>, BackendError> {
        let mut inner = self.lock();
        for _ in 0..MAX_NAME_ATTEMPTS {
            let name = self.names.generate();
            if inner.state.begin_create(&name) {
                inner.in_flight.insert(name.clone());
                self.persist(&inner.state);
                return Ok(InFlight { group: self, name });
            }
            debug!(name = %name, "Generated name already in use");
        }
        Err(BackendError::Creation {
            name: self.names.template().to_string(),
            message: "could not generate an unused instance name".to_string(),
        })
    }

    fn record_deleted(&self, name: &str) {
        let mut inner = self.lock();
        inner.state.mark_deleted(name);
        self.persist(&inner.state);
    }

    /// Write the map to the state file. Failures are logged; the in-memory
    /// map stays authoritative.
    fn persist(&self, state: &GroupState) {
        if let Err(e) = self.store.save(state) {
            warn!(error = %e, "Failed to persist state");
        }
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
