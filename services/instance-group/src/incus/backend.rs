//! `VmBackend` implementation on top of Incus virtual machines.

use std::collections::BTreeMap;
use std::future::Future;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::backend::{
    AddressFamily, AddressScope, BackendError, InstanceSpec, InstanceStatus, InterfaceAddress,
    NetworkInterface, VmBackend,
};

use super::api::{
    ApiError, ExecPost, IncusClient, InstanceFull, InstanceSource, InstancesPost, StatePut,
};

/// Interval between guest readiness checks.
pub const READY_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Command that blocks until systemd has finished booting the guest.
const READY_COMMAND: &[&str] = &["systemctl", "is-system-running", "--wait"];

/// Server message while the in-guest agent has not started yet.
const AGENT_NOT_RUNNING: &str = "VM agent isn't currently running";

/// Server message when stopping an instance that is not running.
const ALREADY_STOPPED: &str = "already stopped";

/// Incus connection settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct IncusConfig {
    /// Path to the Incus unix socket.
    pub socket_path: PathBuf,
    /// Storage pool for the root disk override.
    pub storage_pool: String,
    /// Deadline for a single API round trip.
    #[serde(skip)]
    pub operation_timeout: Duration,
}

impl Default for IncusConfig {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from("/var/lib/incus/unix.socket"),
            storage_pool: "default".to_string(),
            operation_timeout: Duration::from_secs(60),
        }
    }
}

/// Incus-backed VM backend.
pub struct IncusBackend {
    config: IncusConfig,
    client: IncusClient,
}

impl IncusBackend {
    pub fn new(config: IncusConfig) -> Self {
        let client = IncusClient::new(&config.socket_path, config.operation_timeout);
        Self { config, client }
    }

    fn instances_post(&self, spec: &InstanceSpec) -> InstancesPost {
        let root: BTreeMap<String, String> = [
            ("type", "disk"),
            ("path", "/"),
            ("pool", self.config.storage_pool.as_str()),
            ("size", spec.disk_size.as_str()),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

        InstancesPost {
            name: spec.name.clone(),
            kind: "virtual-machine".to_string(),
            instance_type: spec.size_class.clone(),
            source: InstanceSource {
                kind: "image".to_string(),
                alias: spec.image.clone(),
            },
            devices: [("root".to_string(), root)].into_iter().collect(),
            start: true,
        }
    }

    /// Run the readiness command once. Returns its exit code if reported.
    async fn ready_check(&self, name: &str, remaining: Duration) -> Result<Option<i64>, BackendError> {
        let body = ExecPost {
            command: READY_COMMAND.iter().map(|s| s.to_string()).collect(),
            wait_for_websocket: false,
            interactive: false,
            record_output: false,
        };

        let operation = self
            .client
            .exec(name, &body)
            .await
            .map_err(|e| readiness_error(name, e))?;
        let op = self
            .client
            .wait_operation(&operation, Some(remaining))
            .await
            .map_err(|e| readiness_error(name, e))?;

        Ok(op
            .metadata
            .as_ref()
            .and_then(|m| m.get("return"))
            .and_then(|v| v.as_i64()))
    }
}

#[async_trait]
impl VmBackend for IncusBackend {
    fn provider_id(&self) -> &str {
        "incus"
    }

    async fn connect(&self) -> Result<(), BackendError> {
        if !self.client.socket_exists() {
            return Err(BackendError::Unavailable(format!(
                "Incus socket not found: {}",
                self.config.socket_path.display()
            )));
        }

        let server = self
            .client
            .server_info()
            .await
            .map_err(|e| BackendError::Unavailable(format!("failed to connect to Incus: {e}")))?;

        info!(
            api_version = %server.api_version,
            auth = %server.auth,
            "Connected to Incus"
        );
        Ok(())
    }

    async fn create_instance(&self, spec: &InstanceSpec) -> Result<(), BackendError> {
        let name = spec.name.as_str();
        let deadline = deadline_after(spec.startup_timeout);

        let creation = |e: ApiError| BackendError::Creation {
            name: name.to_string(),
            message: format!("failed to create instance: {e}"),
        };

        let operation = self
            .client
            .create_instance(&self.instances_post(spec))
            .await
            .map_err(creation)?;

        let remaining = deadline.saturating_duration_since(Instant::now());
        self.client
            .wait_operation(&operation, Some(remaining))
            .await
            .map_err(creation)?;

        debug!(name = %name, "Instance created, waiting for guest boot");
        poll_until_ready(name, spec.startup_timeout, deadline, move |remaining| {
            self.ready_check(name, remaining)
        })
        .await
    }

    async fn delete_instance(&self, name: &str) -> Result<(), BackendError> {
        let deletion = |step: &str, e: ApiError| BackendError::Deletion {
            name: name.to_string(),
            message: format!("failed to {step} instance: {e}"),
        };

        let stop = StatePut {
            action: "stop".to_string(),
            timeout: -1,
            force: false,
        };
        match self.client.update_state(name, &stop).await {
            Ok(operation) => match self.client.wait_operation(&operation, None).await {
                Ok(_) => {}
                Err(e) if e.message_contains(ALREADY_STOPPED) => {}
                Err(e) => return Err(deletion("stop", e)),
            },
            Err(e) if e.message_contains(ALREADY_STOPPED) => {
                debug!(name = %name, "Instance already stopped");
            }
            Err(e) => return Err(deletion("stop", e)),
        }

        let operation = self
            .client
            .delete_instance(name)
            .await
            .map_err(|e| deletion("delete", e))?;
        self.client
            .wait_operation(&operation, Some(self.config.operation_timeout))
            .await
            .map_err(|e| deletion("delete", e))?;

        Ok(())
    }

    async fn get_instance(&self, name: &str) -> Result<Option<InstanceStatus>, BackendError> {
        match self.client.get_instance_full(name).await {
            Ok(full) => Ok(Some(instance_status(full))),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => {
                warn!(name = %name, error = %e, "Instance lookup failed");
                Err(e.into())
            }
        }
    }
}

impl From<ApiError> for BackendError {
    fn from(err: ApiError) -> Self {
        match err {
            ApiError::Api { status, message } => BackendError::Api { status, message },
            ApiError::Timeout(elapsed) => BackendError::Timeout {
                what: "Incus API request".to_string(),
                elapsed,
            },
            other => BackendError::Transport(other.to_string()),
        }
    }
}

/// `now + timeout`, clamped for timeouts too large to represent.
fn deadline_after(timeout: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(timeout)
        .unwrap_or_else(|| now + Duration::from_secs(100 * 365 * 24 * 60 * 60))
}

/// Poll the guest until `check` reports the boot finished.
///
/// `check` receives the time left before `deadline`. Only `AgentNotReady`
/// is retried. Bounded by `deadline` and by the number of poll intervals
/// that fit into `startup_timeout`.
async fn poll_until_ready<F, Fut>(
    name: &str,
    startup_timeout: Duration,
    deadline: Instant,
    mut check: F,
) -> Result<(), BackendError>
where
    F: FnMut(Duration) -> Fut,
    Fut: Future<Output = Result<Option<i64>, BackendError>>,
{
    let max_attempts =
        u32::try_from(startup_timeout.as_millis() / READY_POLL_INTERVAL.as_millis())
            .unwrap_or(u32::MAX)
            .max(1);
    let started = Instant::now();

    for attempt in 1..=max_attempts {
        tokio::time::sleep(READY_POLL_INTERVAL).await;

        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break;
        }

        match check(remaining).await {
            Ok(exit_code) => {
                debug!(name = %name, attempt, exit_code = ?exit_code, "Guest reported boot finished");
                return Ok(());
            }
            Err(BackendError::AgentNotReady) => {
                debug!(name = %name, attempt, "Guest agent not running yet");
            }
            Err(e) => return Err(e),
        }
    }

    Err(BackendError::Timeout {
        what: format!("instance {name} to become ready"),
        elapsed: started.elapsed(),
    })
}

fn readiness_error(name: &str, err: ApiError) -> BackendError {
    if err.message_contains(AGENT_NOT_RUNNING) {
        BackendError::AgentNotReady
    } else {
        BackendError::Creation {
            name: name.to_string(),
            message: format!("failed to wait for instance to start: {err}"),
        }
    }
}

/// Translate the Incus instance view into the backend-neutral status.
fn instance_status(full: InstanceFull) -> InstanceStatus {
    let active = !matches!(full.status.as_str(), "Stopped" | "Error");

    let interfaces = full
        .state
        .and_then(|state| state.network)
        .unwrap_or_default()
        .into_iter()
        .map(|(name, net)| NetworkInterface {
            name,
            loopback: net.kind == "loopback",
            addresses: net
                .addresses
                .into_iter()
                .filter_map(|addr| {
                    let family = match addr.family.as_str() {
                        "inet" => AddressFamily::Inet,
                        "inet6" => AddressFamily::Inet6,
                        _ => return None,
                    };
                    let scope = match addr.scope.as_str() {
                        "link" => AddressScope::Link,
                        "local" => AddressScope::Local,
                        _ => AddressScope::Global,
                    };
                    Some(InterfaceAddress {
                        family,
                        address: addr.address,
                        scope,
                    })
                })
                .collect(),
        })
        .collect();

    InstanceStatus { active, interfaces }
}
