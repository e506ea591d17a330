//! Version information exchanged on liveness probes.

use serde::{Deserialize, Serialize};

/// Bridge version from Cargo.toml.
pub const WORKBRIDGE_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Bumped on incompatible envelope changes.
pub const PROTOCOL_VERSION: u32 = 1;

/// Environment variable carrying the controller version into a spawned worker.
pub const VERSION_ENV: &str = "WORKBRIDGE_VERSION";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionInfo {
    pub bridge: String,
    pub protocol: u32,
    /// Controller version the worker was launched for, if known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker: Option<String>,
}

impl Default for VersionInfo {
    fn default() -> Self {
        Self {
            bridge: WORKBRIDGE_VERSION.to_string(),
            protocol: PROTOCOL_VERSION,
            worker: None,
        }
    }
}

impl VersionInfo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_worker(mut self, version: impl Into<String>) -> Self {
        self.worker = Some(version.into());
        self
    }

    /// Version info for a worker process, read from [`VERSION_ENV`].
    pub fn from_env() -> Self {
        match std::env::var(VERSION_ENV) {
            Ok(v) if !v.is_empty() => Self::new().with_worker(v),
            _ => Self::new(),
        }
    }

    pub fn is_compatible(&self, other: &VersionInfo) -> bool {
        self.protocol == other.protocol
    }
}
