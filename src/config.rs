//! Bridge configuration.
//!
//! Plain TOML with per-section defaults; values are read once at
//! construction time. There is no hot reload — the settings collaborator
//! that owns persistence hands a finished [`BridgeConfig`] to the bridge.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::debounce::DebouncePolicy;
use crate::error::BridgeError;

/// Top-level configuration for one core↔view channel pair.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub mapping: MappingConfig,
    pub coordinator: CoordinatorConfig,
    pub telemetry: TelemetryConfig,
    pub debounce: DebounceConfig,
}

impl BridgeConfig {
    /// Load from a TOML file.
    pub fn from_path(path: &Path) -> Result<Self, BridgeError> {
        let text = std::fs::read_to_string(path).map_err(|source| BridgeError::ConfigRead {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    /// Parse from a TOML document.
    pub fn from_toml_str(text: &str) -> Result<Self, BridgeError> {
        Ok(toml::from_str(text)?)
    }
}

// ── Mapping ─────────────────────────────────────────────────────

/// Action-mapper switches.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MappingConfig {
    /// Master switch; off kills translation without a redeploy.
    pub enabled: bool,
    /// Log the first sighting of each unmapped kind.
    pub log_unmapped: bool,
    /// Log every dispatched action at info level.
    pub log_transitions: bool,
}

impl Default for MappingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            log_unmapped: true,
            log_transitions: false,
        }
    }
}

// ── Coordinator ─────────────────────────────────────────────────

/// Tunable admission-control windows.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Identical content within this window is suppressed.
    pub duplicate_window_ms: u64,
    /// A directional hold older than this is reclaimed as abandoned.
    pub watchdog_timeout_ms: u64,
    /// Completions slower than this log an advisory warning.
    pub slow_sync_warn_ms: u64,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            duplicate_window_ms: 500,
            watchdog_timeout_ms: 30_000,
            slow_sync_warn_ms: 10,
        }
    }
}

// ── Telemetry ───────────────────────────────────────────────────

/// Performance-monitor sampling and health thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    /// Detail ring-buffer capacity.
    pub capacity: usize,
    /// Probability of retaining a routine sample.
    pub sample_probability: f64,
    /// Operations slower than this are always sampled.
    pub always_sample_over_ms: u64,
    /// Error rate above this flips health to false.
    pub max_error_rate: f64,
    /// Max duration above this flips health to false.
    pub unhealthy_max_ms: u64,
    /// Average duration above this flips health to false.
    pub unhealthy_average_ms: f64,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            capacity: 1_000,
            sample_probability: 0.1,
            always_sample_over_ms: 10,
            max_error_rate: 0.01,
            unhealthy_max_ms: 100,
            unhealthy_average_ms: 5.0,
        }
    }
}

// ── Debounce ────────────────────────────────────────────────────

/// Per-kind debounce policies plus the fallback for unconfigured kinds.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DebounceConfig {
    pub default: DebouncePolicy,
    pub kinds: HashMap<String, DebouncePolicy>,
}

// ── Tests ───────────────────────────────────────────────────────
