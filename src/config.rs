//! Engine configuration
//!
//! Everything here has a working default; YAML files only need the keys they
//! change:
//!
//! ```rust
//! use pumplink::EngineConfig;
//!
//! let config = EngineConfig::from_yaml_str("queue_capacity: 4\nassembly:\n  max_frames: 8\n").unwrap();
//! assert_eq!(config.queue_capacity, 4);
//! assert_eq!(config.assembly.max_frames, 8);
//! assert_eq!(config.default_policy.max_attempts, 3);
//! ```

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::refresh::RefreshKind;
use crate::types::RetryPolicy;
use crate::{PumpError, Result};

/// Budget for establishing a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HandshakeConfig {
    pub timeout_ms: u64,
    pub max_attempts: u32,
}

impl HandshakeConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy::new(Duration::from_millis(self.timeout_ms), self.max_attempts)
    }
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self { timeout_ms: 3_000, max_attempts: 3 }
    }
}

/// Bounds on one multi-frame response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AssemblyConfig {
    pub max_frames: usize,
    pub max_bytes: usize,
}

impl Default for AssemblyConfig {
    fn default() -> Self {
        Self { max_frames: 32, max_bytes: 8 * 1024 }
    }
}

/// Minutes between automatic refreshes, `None` disables the kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RefreshIntervals {
    pub pump_history: Option<u64>,
    pub configuration: Option<u64>,
    pub remaining_insulin: Option<u64>,
    pub battery_status: Option<u64>,
    pub pump_time: Option<u64>,
    pub pump_status: Option<u64>,
    pub temporary_basal: Option<u64>,
}

impl RefreshIntervals {
    pub fn interval(&self, kind: RefreshKind) -> Option<Duration> {
        let minutes = match kind {
            RefreshKind::PumpHistory => self.pump_history,
            RefreshKind::Configuration => self.configuration,
            RefreshKind::RemainingInsulin => self.remaining_insulin,
            RefreshKind::BatteryStatus => self.battery_status,
            RefreshKind::PumpTime => self.pump_time,
            RefreshKind::PumpStatus => self.pump_status,
            RefreshKind::TemporaryBasal => self.temporary_basal,
        };
        minutes.filter(|m| *m > 0).map(|m| Duration::from_secs(m * 60))
    }
}

impl Default for RefreshIntervals {
    fn default() -> Self {
        Self {
            pump_history: Some(5),
            configuration: Some(60),
            remaining_insulin: Some(10),
            battery_status: Some(30),
            pump_time: None,
            pump_status: Some(5),
            temporary_basal: Some(15),
        }
    }
}

/// Tunables for one [`PumpConnection`](crate::PumpConnection).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Policy for commands that do not carry their own.
    pub default_policy: RetryPolicy,
    pub handshake: HandshakeConfig,
    /// Commands allowed to wait behind the in-flight one.
    pub queue_capacity: usize,
    pub assembly: AssemblyConfig,
    pub refresh: RefreshIntervals,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_policy: RetryPolicy::default(),
            handshake: HandshakeConfig::default(),
            queue_capacity: 32,
            assembly: AssemblyConfig::default(),
            refresh: RefreshIntervals::default(),
        }
    }
}

impl EngineConfig {
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: EngineConfig = serde_yaml_ng::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let yaml = std::fs::read_to_string(path).map_err(|e| {
            PumpError::config_with_source(
                format!("cannot read engine config {}", path.display()),
                Box::new(e),
            )
        })?;
        Self::from_yaml_str(&yaml)
    }

    pub fn validate(&self) -> Result<()> {
        if self.queue_capacity == 0 {
            return Err(PumpError::config("queue_capacity must be at least 1"));
        }
        if self.default_policy.timeout_ms == 0 || self.handshake.timeout_ms == 0 {
            return Err(PumpError::config("timeouts must be greater than zero"));
        }
        if self.default_policy.max_attempts == 0 || self.handshake.max_attempts == 0 {
            return Err(PumpError::config("max_attempts must be at least 1"));
        }
        if self.assembly.max_frames == 0 || self.assembly.max_bytes == 0 {
            return Err(PumpError::config("assembly limits must be greater than zero"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_yaml_is_default() {
        let config = EngineConfig::from_yaml_str("{}").unwrap();
        assert_eq!(config, EngineConfig::default());
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let yaml = "default_policy:\n  timeout_ms: 500\n  max_attempts: 3\nrefresh:\n  pump_time: 120\n";
        let config = EngineConfig::from_yaml_str(yaml).unwrap();
        assert_eq!(config.default_policy.timeout(), Duration::from_millis(500));
        assert_eq!(config.refresh.interval(RefreshKind::PumpTime), Some(Duration::from_secs(7_200)));
        assert_eq!(config.refresh.interval(RefreshKind::PumpHistory), Some(Duration::from_secs(300)));
        assert_eq!(config.handshake, HandshakeConfig::default());
    }

    #[test]
    fn zero_interval_disables_refresh() {
        let intervals = RefreshIntervals { battery_status: Some(0), ..RefreshIntervals::default() };
        assert_eq!(intervals.interval(RefreshKind::BatteryStatus), None);
    }

    #[test]
    fn invalid_values_are_config_errors() {
        for yaml in ["queue_capacity: 0", "handshake:\n  timeout_ms: 0", "assembly:\n  max_bytes: 0"] {
            let err = EngineConfig::from_yaml_str(yaml).unwrap_err();
            assert!(matches!(err, PumpError::Config { .. }), "{yaml} gave {err}");
        }
    }

    #[test]
    fn malformed_yaml_keeps_source() {
        let err = EngineConfig::from_yaml_str("queue_capacity: [").unwrap_err();
        assert!(matches!(err, PumpError::Config { source: Some(_), .. }));
    }
}
