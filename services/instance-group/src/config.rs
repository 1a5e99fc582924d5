//! Configuration for the instance group.
//!
//! Every field is optional in the serialized form. Unset or zero values are
//! filled in by [`GroupConfig::with_defaults`] during initialization.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub const DEFAULT_NAMING_SCHEME: &str = "runner-$random";
pub const DEFAULT_IMAGE: &str = "runner-base";
pub const DEFAULT_INSTANCE_SIZE: &str = "c1-m2";
pub const DEFAULT_DISK_SIZE: &str = "10GiB";
pub const DEFAULT_STARTUP_TIMEOUT_SECS: u64 = 120;
pub const DEFAULT_OPERATION_TIMEOUT_SECS: u64 = 60;
pub const DEFAULT_MAX_INSTANCES: usize = 20;
pub const DEFAULT_STATE_FILE_PATH: &str = "/var/lib/vmfleet/state.json";

/// Instance group configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GroupConfig {
    /// Naming template; `$random` expands to a fresh token.
    pub naming_scheme: String,

    /// Image reference instances boot from.
    pub image: String,

    /// Backend size class.
    pub instance_size: String,

    /// Root disk size.
    pub disk_size: String,

    /// Private key handed to callers connecting to instances.
    pub instance_key_path: Option<PathBuf>,

    /// Seconds to wait for a new instance's OS to become ready.
    pub startup_timeout_secs: u64,

    /// Seconds allowed for a single backend API operation.
    pub operation_timeout_secs: u64,

    /// Largest group size reported to the caller.
    pub max_instances: usize,

    /// Location of the state file.
    pub state_file_path: Option<PathBuf>,

    /// How callers should connect to instances.
    pub connector: ConnectorConfig,
}

impl GroupConfig {
    /// Fill unset and zero fields with defaults.
    pub fn with_defaults(mut self) -> Self {
        if self.naming_scheme.is_empty() {
            self.naming_scheme = DEFAULT_NAMING_SCHEME.to_string();
        }
        if self.image.is_empty() {
            self.image = DEFAULT_IMAGE.to_string();
        }
        if self.instance_size.is_empty() {
            self.instance_size = DEFAULT_INSTANCE_SIZE.to_string();
        }
        if self.disk_size.is_empty() {
            self.disk_size = DEFAULT_DISK_SIZE.to_string();
        }
        if self.startup_timeout_secs == 0 {
            self.startup_timeout_secs = DEFAULT_STARTUP_TIMEOUT_SECS;
        }
        if self.operation_timeout_secs == 0 {
            self.operation_timeout_secs = DEFAULT_OPERATION_TIMEOUT_SECS;
        }
        if self.max_instances == 0 {
            self.max_instances = DEFAULT_MAX_INSTANCES;
        }
        if self.state_file_path.is_none() {
            self.state_file_path = Some(PathBuf::from(DEFAULT_STATE_FILE_PATH));
        }
        self.instance_key_path = self
            .instance_key_path
            .filter(|path| !path.as_os_str().is_empty());
        self.connector = self.connector.with_defaults();
        self
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_secs(self.startup_timeout_secs)
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_secs(self.operation_timeout_secs)
    }

    pub fn state_file_path(&self) -> &Path {
        self.state_file_path
            .as_deref()
            .unwrap_or_else(|| Path::new(DEFAULT_STATE_FILE_PATH))
    }
}

/// Remote access protocol offered to callers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[default]
    Ssh,
    Winrm,
}

/// Connection settings passed through to callers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectorConfig {
    pub os: String,
    pub arch: String,
    pub protocol: Protocol,
    pub username: String,
    pub use_static_credentials: Option<bool>,
}

impl ConnectorConfig {
    fn with_defaults(mut self) -> Self {
        if self.os.is_empty() {
            self.os = "linux".to_string();
        }
        if self.arch.is_empty() {
            self.arch = "amd64".to_string();
        }
        if self.username.is_empty() {
            self.username = "root".to_string();
        }
        if self.use_static_credentials.is_none() {
            self.use_static_credentials = Some(true);
        }
        self
    }
}
