//! Incus virtual machine backend.
//!
//! ## Components
//!
//! - `api`: HTTP client for the Incus REST API on the local unix socket
//! - `backend`: `VmBackend` implementation (create + readiness polling,
//!   stop + delete, status lookup)

mod api;
mod backend;

pub use api::{ApiError, IncusClient};
pub use backend::{IncusBackend, IncusConfig, READY_POLL_INTERVAL};
