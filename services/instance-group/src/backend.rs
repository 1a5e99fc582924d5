//! VM backend interface and in-memory implementation.
//!
//! The backend interface abstracts the virtualization system:
//! - Creating instances and waiting for the guest OS to come up
//! - Stopping and deleting instances
//! - Querying instance status and network addresses
//!
//! An in-memory implementation is provided for testing.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, info};

/// Errors reported by a VM backend.
#[derive(Debug, Clone, Error)]
pub enum BackendError {
    /// The backend could not be reached.
    #[error("backend unavailable: {0}")]
    Unavailable(String),

    /// The guest agent inside the VM is not running yet.
    #[error("guest agent is not running")]
    AgentNotReady,

    /// A bounded wait ran out.
    #[error("timed out after {elapsed:?} waiting for {what}")]
    Timeout { what: String, elapsed: Duration },

    /// Instance creation failed.
    #[error("failed to create instance {name}: {message}")]
    Creation { name: String, message: String },

    /// Instance deletion failed.
    #[error("failed to delete instance {name}: {message}")]
    Deletion { name: String, message: String },

    /// The backend API rejected a request.
    #[error("backend API error {status}: {message}")]
    Api { status: u16, message: String },

    /// Transport or decoding failure talking to the backend.
    #[error("backend transport error: {0}")]
    Transport(String),
}

/// Parameters for creating one instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceSpec {
    pub name: String,
    /// Backend-specific size class (e.g. `c1-m2`).
    pub size_class: String,
    /// Image reference to boot from.
    pub image: String,
    /// Root disk size (e.g. `10GiB`).
    pub disk_size: String,
    /// How long to wait for the guest OS to report readiness.
    pub startup_timeout: Duration,
}

/// Address family of an interface address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressFamily {
    Inet,
    Inet6,
}

/// Scope of an interface address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressScope {
    Global,
    Link,
    Local,
}

/// One address reported on a guest interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceAddress {
    pub family: AddressFamily,
    pub address: String,
    pub scope: AddressScope,
}

impl InterfaceAddress {
    pub fn inet(address: impl Into<String>) -> Self {
        Self {
            family: AddressFamily::Inet,
            address: address.into(),
            scope: AddressScope::Global,
        }
    }
}

/// A guest network interface as reported by the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkInterface {
    pub name: String,
    pub loopback: bool,
    pub addresses: Vec<InterfaceAddress>,
}

/// Backend view of one instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceStatus {
    /// Whether the instance is running (or otherwise not stopped/errored).
    pub active: bool,
    /// Interfaces in backend order.
    pub interfaces: Vec<NetworkInterface>,
}

impl InstanceStatus {
    /// An active instance with a single `eth0` carrying `address`.
    pub fn running_at(address: impl Into<String>) -> Self {
        Self {
            active: true,
            interfaces: vec![NetworkInterface {
                name: "eth0".to_string(),
                loopback: false,
                addresses: vec![InterfaceAddress::inet(address)],
            }],
        }
    }
}

/// VM backend interface.
#[async_trait]
pub trait VmBackend: Send + Sync {
    /// Short identifier of the provider behind this backend.
    fn provider_id(&self) -> &str;

    /// Check that the backend is reachable.
    async fn connect(&self) -> Result<(), BackendError>;

    /// Create and start an instance, waiting until the guest is ready.
    async fn create_instance(&self, spec: &InstanceSpec) -> Result<(), BackendError>;

    /// Stop and delete an instance, waiting for both to finish.
    async fn delete_instance(&self, name: &str) -> Result<(), BackendError>;

    /// Look up an instance. `Ok(None)` means the backend does not know it.
    async fn get_instance(&self, name: &str) -> Result<Option<InstanceStatus>, BackendError>;
}

/// In-memory backend for testing.
#[derive(Default)]
pub struct MockBackend {
    instances: Mutex<HashMap<String, InstanceStatus>>,

    /// 1-based create attempts that fail.
    failing_create_attempts: HashSet<usize>,
    fail_all_creates: bool,
    failing_deletes: HashSet<String>,
    failing_lookups: HashSet<String>,
    unreachable: bool,
    create_delay: Option<Duration>,

    create_calls: AtomicUsize,
    delete_calls: AtomicUsize,
    get_calls: AtomicUsize,
}

impl MockBackend {
    /// Create an empty mock backend where every operation succeeds.
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-populate an instance.
    pub fn with_instance(self, name: &str, status: InstanceStatus) -> Self {
        self.lock().insert(name.to_string(), status);
        self
    }

    /// Fail the `attempt`-th create call (1-based).
    pub fn failing_create_on(mut self, attempt: usize) -> Self {
        self.failing_create_attempts.insert(attempt);
        self
    }

    /// Fail every create call.
    pub fn failing_creates(mut self) -> Self {
        self.fail_all_creates = true;
        self
    }

    /// Fail deletion of the named instance.
    pub fn failing_delete(mut self, name: &str) -> Self {
        self.failing_deletes.insert(name.to_string());
        self
    }

    /// Fail lookups of the named instance with a transport error.
    pub fn failing_lookup(mut self, name: &str) -> Self {
        self.failing_lookups.insert(name.to_string());
        self
    }

    /// Refuse connections.
    pub fn unreachable(mut self) -> Self {
        self.unreachable = true;
        self
    }

    /// Sleep this long inside every create before registering the instance.
    pub fn with_create_delay(mut self, delay: Duration) -> Self {
        self.create_delay = Some(delay);
        self
    }

    /// Insert an instance behind the group's back.
    pub fn insert(&self, name: &str, status: InstanceStatus) {
        self.lock().insert(name.to_string(), status);
    }

    /// Remove an instance behind the group's back.
    pub fn remove(&self, name: &str) -> bool {
        self.lock().remove(name).is_some()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.lock().contains_key(name)
    }

    pub fn instance_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.lock().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn create_calls(&self) -> usize {
        self.create_calls.load(Ordering::SeqCst)
    }

    pub fn delete_calls(&self) -> usize {
        self.delete_calls.load(Ordering::SeqCst)
    }

    pub fn get_calls(&self) -> usize {
        self.get_calls.load(Ordering::SeqCst)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, InstanceStatus>> {
        self.instances
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

#[async_trait]
impl VmBackend for MockBackend {
    fn provider_id(&self) -> &str {
        "mock"
    }

    async fn connect(&self) -> Result<(), BackendError> {
        if self.unreachable {
            return Err(BackendError::Unavailable(
                "mock backend configured as unreachable".to_string(),
            ));
        }
        Ok(())
    }

    async fn create_instance(&self, spec: &InstanceSpec) -> Result<(), BackendError> {
        let attempt = self.create_calls.fetch_add(1, Ordering::SeqCst) + 1;
        info!(
            name = %spec.name,
            image = %spec.image,
            size = %spec.size_class,
            attempt,
            "[MOCK] Creating instance"
        );

        if let Some(delay) = self.create_delay {
            tokio::time::sleep(delay).await;
        }

        if self.fail_all_creates || self.failing_create_attempts.contains(&attempt) {
            return Err(BackendError::Creation {
                name: spec.name.clone(),
                message: "mock backend configured to fail".to_string(),
            });
        }

        let address = format!("10.0.0.{}", attempt % 250 + 2);
        self.lock()
            .insert(spec.name.clone(), InstanceStatus::running_at(address));

        debug!(name = %spec.name, "[MOCK] Instance ready");
        Ok(())
    }

    async fn delete_instance(&self, name: &str) -> Result<(), BackendError> {
        self.delete_calls.fetch_add(1, Ordering::SeqCst);
        info!(name = %name, "[MOCK] Deleting instance");

        if self.failing_deletes.contains(name) {
            return Err(BackendError::Deletion {
                name: name.to_string(),
                message: "mock backend configured to fail".to_string(),
            });
        }

        if self.lock().remove(name).is_none() {
            return Err(BackendError::Deletion {
                name: name.to_string(),
                message: "instance not found".to_string(),
            });
        }

        Ok(())
    }

    async fn get_instance(&self, name: &str) -> Result<Option<InstanceStatus>, BackendError> {
        self.get_calls.fetch_add(1, Ordering::SeqCst);

        if self.failing_lookups.contains(name) {
            return Err(BackendError::Transport(format!(
                "mock lookup of {name} configured to fail"
            )));
        }

        Ok(self.lock().get(name).cloned())
    }
}
