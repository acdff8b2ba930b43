//! Runtime configuration
//!
//! Options can be built in code, read from a TOML file, and overridden from
//! the environment:
//!
//! ```toml
//! [isolate]
//! trace_memory = true
//! flush_on_exit = true
//!
//! [sweeper]
//! interval_ms = 50
//! ```
//!
//! | Variable                   | Overrides                 |
//! |----------------------------|---------------------------|
//! | `TETHER_TRACE_MEM`         | `isolate.trace_memory`    |
//! | `TETHER_FLUSH_ON_EXIT`     | `isolate.flush_on_exit`   |
//! | `TETHER_SWEEP_INTERVAL_MS` | `sweeper.interval_ms`     |

use crate::error::{Error, Result};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Options for creating an isolate
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct IsolateOptions {
    /// Report handle table sizes on every mark and flush at debug level
    pub trace_memory: bool,

    /// Flush releasable handles whenever the outermost native call returns
    pub flush_on_exit: bool,

    /// Flush automatically once this many handles are releasable (0 = never)
    pub release_batch_size: usize,
}

impl IsolateOptions {
    /// Options with memory tracing enabled
    pub fn traced() -> Self {
        Self {
            trace_memory: true,
            ..Default::default()
        }
    }

    /// Options that flush on every return from native code
    pub fn eager_release() -> Self {
        Self {
            flush_on_exit: true,
            ..Default::default()
        }
    }

    /// Options that flush every `batch` releasable handles
    pub fn with_release_batch(batch: usize) -> Self {
        Self {
            release_batch_size: batch,
            ..Default::default()
        }
    }
}

/// Options for the periodic fallback sweep
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SweeperOptions {
    /// Interval between sweeps in milliseconds
    pub interval_ms: u64,
}

impl Default for SweeperOptions {
    fn default() -> Self {
        Self { interval_ms: 100 }
    }
}

impl SweeperOptions {
    /// Get the sweep interval
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms.max(1))
    }
}

/// Complete runtime configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RuntimeConfig {
    /// Isolate options
    pub isolate: IsolateOptions,
    /// Sweeper options
    pub sweeper: SweeperOptions,
}

impl RuntimeConfig {
    /// Parse configuration from TOML text
    pub fn from_toml_str(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| Error::Config(e.to_string()))
    }

    /// Read configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    /// Apply `TETHER_*` environment overrides
    pub fn apply_env(self) -> Result<Self> {
        self.apply_overrides(|name| std::env::var(name).ok())
    }

    /// Apply overrides from an arbitrary variable source
    pub fn apply_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        if let Some(v) = lookup("TETHER_TRACE_MEM") {
            self.isolate.trace_memory = parse_flag("TETHER_TRACE_MEM", &v)?;
        }
        if let Some(v) = lookup("TETHER_FLUSH_ON_EXIT") {
            self.isolate.flush_on_exit = parse_flag("TETHER_FLUSH_ON_EXIT", &v)?;
        }
        if let Some(v) = lookup("TETHER_SWEEP_INTERVAL_MS") {
            self.sweeper.interval_ms = v.trim().parse().map_err(|_| {
                Error::Config(format!("TETHER_SWEEP_INTERVAL_MS: expected integer, got {:?}", v))
            })?;
        }
        Ok(self)
    }
}

fn parse_flag(name: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        other => Err(Error::Config(format!(
            "{}: expected boolean, got {:?}",
            name, other
        ))),
    }
}
