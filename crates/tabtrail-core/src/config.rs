//! Engine configuration
//!
//! Every section deserializes with defaults, so a config file only needs the
//! values it wants to change.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub bus: BusConfig,
    pub capture: CaptureConfig,
    pub synth: SynthConfig,
    pub replay: ReplayConfig,
    pub storage: StorageConfig,
}

impl EngineConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            Error::invalid_input(format!("cannot read config {}: {}", path.display(), e))
        })?;
        serde_json::from_str(&raw).map_err(|e| {
            Error::invalid_input(format!("invalid config {}: {}", path.display(), e))
        })
    }
}

/// Message bus timing
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// How long a request waits for its response
    pub request_timeout_ms: u64,
    /// Delivery attempts before a target counts as unreachable
    pub max_delivery_attempts: u32,
    /// First retry delay; doubles on every attempt
    pub retry_base_ms: u64,
    /// Per-context inbox capacity
    pub inbox_capacity: usize,
    /// Correlation ids remembered per context for deduplication
    pub dedup_window: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: 5000,
            max_delivery_attempts: 5,
            retry_base_ms: 50,
            inbox_capacity: 1024,
            dedup_window: 512,
        }
    }
}

impl BusConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// Action capture
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Quiet period after the last keystroke before an input is committed
    pub input_debounce_ms: u64,
    /// Capacity of the page event buffer
    pub max_buffer: usize,
    /// Loop tick of the page context
    pub tick_ms: u64,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            input_debounce_ms: 300,
            max_buffer: 10000,
            tick_ms: 20,
        }
    }
}

/// Locator synthesis
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SynthConfig {
    /// Attributes treated as stable identifiers, highest priority first
    pub stable_attributes: Vec<String>,
    /// Ancestors that may be added to scope a non-unique locator
    pub max_ancestor_depth: usize,
    /// Longest text accepted as a text anchor
    pub max_text_len: usize,
    /// Classes kept per compound
    pub max_classes: usize,
}

impl Default for SynthConfig {
    fn default() -> Self {
        Self {
            stable_attributes: ["data-testid", "data-test", "data-qa", "data-cy", "id"]
                .into_iter()
                .map(String::from)
                .collect(),
            max_ancestor_depth: 4,
            max_text_len: 64,
            max_classes: 3,
        }
    }
}

/// Replay timing and retries
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplayConfig {
    /// Extra resolution attempts when no locator matches
    pub resolve_retries: u32,
    pub retry_backoff_ms: u64,
    /// The page counts as settled after this long without DOM changes
    pub settle_ms: u64,
    /// Upper bound on settling before the step times out
    pub max_settle_ms: u64,
    /// How long the coordinator waits for one step outcome
    pub step_timeout_ms: u64,
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            resolve_retries: 3,
            retry_backoff_ms: 100,
            settle_ms: 150,
            max_settle_ms: 3000,
            step_timeout_ms: 15000,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Store directory; `$HOME/.tabtrail` when unset
    pub dir: Option<PathBuf>,
}

impl StorageConfig {
    pub fn resolve_dir(&self) -> Result<PathBuf> {
        if let Some(dir) = &self.dir {
            return Ok(dir.clone());
        }
        let home = std::env::var("HOME")
            .map_err(|_| Error::storage("HOME not set and no storage dir configured"))?;
        Ok(PathBuf::from(home).join(".tabtrail"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn partial_file_keeps_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        let json = r#"{"capture": {"input_debounce_ms": 50}, "replay": {"resolve_retries": 1}}"#;
        file.write_all(json.as_bytes()).unwrap();

        let config = EngineConfig::load(file.path()).unwrap();
        assert_eq!(config.capture.input_debounce_ms, 50);
        assert_eq!(config.capture.max_buffer, 10000);
        assert_eq!(config.replay.resolve_retries, 1);
        assert_eq!(config.bus.max_delivery_attempts, 5);
        assert_eq!(config.synth.stable_attributes[0], "data-testid");
    }

    #[test]
    fn invalid_file_is_invalid_input() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "not json").unwrap();
        let err = EngineConfig::load(file.path()).unwrap_err();
        assert_eq!(err.code, crate::ErrorCode::InvalidInput);
    }
}
