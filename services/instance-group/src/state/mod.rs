//! Local state persistence for the instance group.
//!
//! This module provides:
//! - The lifecycle state of each instance (`creating`, `running`, `deleted`)
//! - The group map from instance name to state
//! - A JSON file store with atomic whole-file replacement
//!
//! The state file lets the group recover after restarts and keeps track of
//! creations that were in flight when the process went away.

mod store;
mod types;

pub use store::{StateStore, StateStoreError};
pub use types::{GroupState, InstanceState};
