//! Engine configuration.
//!
//! An [`EngineConfig`] is supplied once at construction and never changes
//! for the engine's lifetime. It deserializes from camelCase JSON so that a
//! host can ship it alongside the rest of its settings:
//!
//! ```
//! use kestrel_engine::config::{EngineConfig, LogLevel};
//!
//! let config = EngineConfig::from_json_str(
//!     r#"{ "id": "arena-1", "logLevel": "debug", "deterministicSeed": "abc" }"#,
//! ).unwrap();
//! assert_eq!(config.log_level, LogLevel::Debug);
//! assert_eq!(config.tick_interval_ms, 0); // manual ticking by default
//! assert!(config.seed_value().is_some());
//! ```

use serde::{Deserialize, Serialize};

use crate::EngineError;

// ---------------------------------------------------------------------------
// LogLevel
// ---------------------------------------------------------------------------

/// Verbosity of the engine's `tracing` output.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Off,
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    /// Directive string understood by `EnvFilter`.
    pub fn as_str(self) -> &'static str {
        match self {
            LogLevel::Off => "off",
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

// ---------------------------------------------------------------------------
// EngineConfig
// ---------------------------------------------------------------------------

/// Construction-time configuration for one engine instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineConfig {
    /// Engine identifier, used in logs and introspection. Must be non-empty.
    pub id: String,
    #[serde(default)]
    pub log_level: LogLevel,
    /// `0` = the host calls `tick` manually; `> 0` = an internal driver
    /// calls `tick(tick_interval_ms)` every `tick_interval_ms` of wall time.
    #[serde(default)]
    pub tick_interval_ms: u64,
    /// Seed for the engine RNG. Two engines with the same seed and the same
    /// call sequence produce identical state.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deterministic_seed: Option<String>,
}

impl EngineConfig {
    /// Manual ticking, `info` logging, no seed.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            log_level: LogLevel::default(),
            tick_interval_ms: 0,
            deterministic_seed: None,
        }
    }

    #[must_use]
    pub fn with_seed(mut self, seed: impl Into<String>) -> Self {
        self.deterministic_seed = Some(seed.into());
        self
    }

    #[must_use]
    pub fn with_tick_interval_ms(mut self, interval_ms: u64) -> Self {
        self.tick_interval_ms = interval_ms;
        self
    }

    #[must_use]
    pub fn with_log_level(mut self, level: LogLevel) -> Self {
        self.log_level = level;
        self
    }

    /// Parse a camelCase JSON document and validate it.
    pub fn from_json_str(json: &str) -> Result<Self, EngineError> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| EngineError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        if self.id.trim().is_empty() {
            return Err(EngineError::InvalidConfig(
                "id must be a non-empty string".to_owned(),
            ));
        }
        Ok(())
    }

    /// The numeric RNG seed derived from `deterministic_seed`.
    ///
    /// The seed string is hashed with BLAKE3 and the first eight bytes of the
    /// digest are read little-endian, so any string maps to a stable `u64`.
    pub fn seed_value(&self) -> Option<u64> {
        self.deterministic_seed.as_deref().map(|seed| {
            let digest = blake3::hash(seed.as_bytes());
            let mut bytes = [0u8; 8];
            bytes.copy_from_slice(&digest.as_bytes()[..8]);
            u64::from_le_bytes(bytes)
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
