//! Instance group initialization.
//!
//! Applies configuration defaults, validates the configuration, loads the
//! persisted group map and connects the backend. Any failure here is fatal;
//! there is no partially initialized group.

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::backend::VmBackend;
use crate::config::GroupConfig;
use crate::error::{GroupError, Result};
use crate::group::InstanceGroup;
use crate::naming::NameGenerator;
use crate::state::StateStore;
use crate::version::{BUILD_INFO, VERSION};

/// Provider metadata returned by initialization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProviderInfo {
    pub id: String,
    pub version: String,
    pub max_size: usize,
    pub build_info: String,
}

impl InstanceGroup {
    /// Build a ready-to-use group from configuration and a backend.
    pub async fn initialize(
        config: GroupConfig,
        backend: Arc<dyn VmBackend>,
    ) -> Result<(Self, ProviderInfo)> {
        info!("Initializing instance group");

        let config = config.with_defaults();

        if !NameGenerator::new(config.naming_scheme.as_str()).has_random_placeholder() {
            error!(naming_scheme = %config.naming_scheme, "Naming scheme has no $random placeholder");
            return Err(GroupError::Configuration(format!(
                "naming scheme {:?} must contain $random",
                config.naming_scheme
            )));
        }

        let store = StateStore::new(config.state_file_path());
        debug!(path = %store.path().display(), "Configuring state file");
        if let Err(e) = store.ensure_dir() {
            warn!(error = %e, "Could not create state directory");
        }
        let state = store.load_or_default();
        info!(existing_instances = state.len(), "State loaded");

        match &config.instance_key_path {
            None => warn!("Instance key path not configured"),
            Some(path) if !path.exists() => {
                error!(path = %path.display(), "Instance key file not found");
                return Err(GroupError::Configuration(format!(
                    "instance key file not found: {}",
                    path.display()
                )));
            }
            Some(_) => {}
        }

        info!(
            image = %config.image,
            size = %config.instance_size,
            disk_size = %config.disk_size,
            naming_scheme = %config.naming_scheme,
            max_instances = config.max_instances,
            startup_timeout_secs = config.startup_timeout_secs,
            operation_timeout_secs = config.operation_timeout_secs,
            "Configuration validated"
        );

        info!(provider = %backend.provider_id(), "Connecting to backend");
        backend.connect().await.map_err(|e| {
            error!(error = %e, "Backend connection failed");
            GroupError::BackendUnavailable(e)
        })?;

        let provider = ProviderInfo {
            id: backend.provider_id().to_string(),
            version: VERSION.to_string(),
            max_size: config.max_instances,
            build_info: BUILD_INFO.to_string(),
        };

        info!(
            provider_id = %provider.id,
            version = %provider.version,
            max_instances = provider.max_size,
            state_file = %store.path().display(),
            "Instance group ready"
        );

        Ok((InstanceGroup::new(config, backend, store, state), provider))
    }
}
