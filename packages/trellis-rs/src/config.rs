use anyhow::{Context, Result};
use dotenvy::dotenv;
use std::env;

/// Engine configuration.
///
/// The defaults run every transition cycle to completion and honor
/// unsynchronized methods.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Maximum resolve/lifecycle rounds per call. `None` means unbounded.
    pub max_cycles: Option<usize>,
    /// Whether methods declared unsynchronized may run without the lock.
    pub unsynchronized_enabled: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_cycles: None,
            unsynchronized_enabled: true,
        }
    }
}

impl EngineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail a call once entry hooks have requested this many rounds.
    pub fn with_max_cycles(mut self, limit: usize) -> Self {
        self.max_cycles = Some(limit);
        self
    }

    /// Run every call under the instance lock.
    pub fn always_synchronized(mut self) -> Self {
        self.unsynchronized_enabled = false;
        self
    }

    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (development)
        let _ = dotenv();
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();
        Ok(Self {
            max_cycles: lookup("TRELLIS_MAX_CYCLES")
                .map(|v| v.parse())
                .transpose()
                .context("TRELLIS_MAX_CYCLES must be a valid number")?,
            unsynchronized_enabled: lookup("TRELLIS_ALLOW_UNSYNCHRONIZED")
                .map(|v| v.parse())
                .transpose()
                .context("TRELLIS_ALLOW_UNSYNCHRONIZED must be true or false")?
                .unwrap_or(defaults.unsynchronized_enabled),
        })
    }
}
