//! vmfleet Instance Group
//!
//! Manages a group of ephemeral worker VMs on behalf of an autoscaling
//! caller. The caller asks for more capacity, names instances to remove,
//! polls for the state of every instance and asks for connection details;
//! the group turns those requests into backend operations and keeps a
//! persistent record of every instance's lifecycle state.
//!
//! ## Modules
//!
//! - `group`: the reconciler (increase, decrease, update, shutdown, stale
//!   `creating` repair)
//! - `state`: lifecycle states and the JSON state file
//! - `naming`: instance name generation from a `$random` template
//! - `connect`: connection details for a running instance
//! - `init`: configuration defaults, validation and startup
//! - `backend`: the `VmBackend` trait and an in-memory implementation
//! - `incus`: `VmBackend` on top of Incus virtual machines

pub mod backend;
pub mod config;
pub mod connect;
pub mod error;
pub mod group;
pub mod incus;
pub mod init;
pub mod naming;
pub mod state;
pub mod version;

pub use backend::{BackendError, MockBackend, VmBackend};
pub use config::GroupConfig;
pub use connect::ConnectInfo;
pub use error::GroupError;
pub use group::InstanceGroup;
pub use init::ProviderInfo;
pub use state::{GroupState, InstanceState};
