//! Version information reported to callers.

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Build description, injected at compile time through `VMFLEET_BUILD_INFO`.
pub const BUILD_INFO: &str = match option_env!("VMFLEET_BUILD_INFO") {
    Some(info) => info,
    None => "dev",
};
