//! Connection details for instances in the group.

use serde::Serialize;
use tracing::{debug, error, info};

use crate::backend::{AddressFamily, AddressScope, InstanceStatus};
use crate::config::Protocol;
use crate::error::{GroupError, Result};
use crate::group::InstanceGroup;

/// Interface names never used for caller connections.
const IGNORED_INTERFACES: &[&str] = &["docker0"];

/// Everything a caller needs to open a session on an instance.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectInfo {
    pub name: String,
    pub os: String,
    pub arch: String,
    pub protocol: Protocol,
    pub username: String,
    pub use_static_credentials: bool,
    #[serde(skip_serializing)]
    pub key: Vec<u8>,
    pub internal_addr: String,
    pub external_addr: String,
}

/// Pick the address callers should connect to.
///
/// The first IPv4 address with global scope on a non-loopback interface
/// wins, in the order the backend reported them.
pub fn select_address(status: &InstanceStatus) -> Option<&str> {
    status
        .interfaces
        .iter()
        .filter(|iface| !iface.loopback && !IGNORED_INTERFACES.contains(&iface.name.as_str()))
        .flat_map(|iface| iface.addresses.iter())
        .find(|addr| {
            addr.family == AddressFamily::Inet
                && !matches!(addr.scope, AddressScope::Link | AddressScope::Local)
        })
        .map(|addr| addr.address.as_str())
}

impl InstanceGroup {
    /// Resolve address, protocol and credential for an instance.
    pub async fn connect_info(&self, name: &str) -> Result<ConnectInfo> {
        info!(name = %name, "Connection info request");

        let status = self.backend.get_instance(name).await?.ok_or_else(|| {
            GroupError::InstanceNotReady {
                name: name.to_string(),
                reason: "not found in backend".to_string(),
            }
        })?;

        if !status.active {
            return Err(GroupError::InstanceNotReady {
                name: name.to_string(),
                reason: "instance is not active".to_string(),
            });
        }

        let address = select_address(&status)
            .ok_or_else(|| GroupError::InstanceNotReady {
                name: name.to_string(),
                reason: "no usable IPv4 address reported".to_string(),
            })?
            .to_string();

        let key_path = self.config.instance_key_path.clone().ok_or_else(|| {
            GroupError::CredentialUnavailable {
                path: Default::default(),
                source: std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    "no instance key path configured",
                ),
            }
        })?;

        debug!(key_path = %key_path.display(), "Loading instance key");
        let key = tokio::fs::read(&key_path).await.map_err(|source| {
            error!(key_path = %key_path.display(), error = %source, "Failed to read instance key");
            GroupError::CredentialUnavailable {
                path: key_path.clone(),
                source,
            }
        })?;

        let connector = &self.config.connector;
        info!(
            name = %name,
            address = %address,
            username = %connector.username,
            "Connection info ready"
        );

        Ok(ConnectInfo {
            name: name.to_string(),
            os: connector.os.clone(),
            arch: connector.arch.clone(),
            protocol: connector.protocol,
            username: connector.username.clone(),
            use_static_credentials: connector.use_static_credentials.unwrap_or(true),
            key,
            internal_addr: address.clone(),
            external_addr: address,
        })
    }
}
