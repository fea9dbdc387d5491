use std::time::Duration;

use serde::Deserialize;

/// Tunables for the engine. Every field has a default, so an empty
/// `[engine]` table (or none at all) is valid.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    /// Concurrent jobs the worker pool runs.
    pub workers: usize,
    /// Jobs that may wait for a free worker before submissions are refused.
    pub queue_depth: usize,
    /// Deadline for each individual tracker call.
    pub call_timeout_ms: u64,
    /// Attempts per storage call (transient failures only).
    pub storage_retries: u32,
    /// Upper clamp for list page sizes.
    pub list_limit_max: i64,
    pub heartbeat_interval_ms: u64,
    pub heartbeat_timeout_ms: u64,
    pub reference_ttl_ms: u64,
    pub snapshot_retention_days: u32,
    pub sweep_interval_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            queue_depth: 256,
            call_timeout_ms: 10_000,
            storage_retries: 3,
            list_limit_max: 100,
            heartbeat_interval_ms: 15_000,
            heartbeat_timeout_ms: 45_000,
            reference_ttl_ms: 300_000,
            snapshot_retention_days: 30,
            sweep_interval_ms: 60_000,
        }
    }
}

impl EngineConfig {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }

    pub fn reference_ttl(&self) -> Duration {
        Duration::from_millis(self.reference_ttl_ms)
    }

    pub fn snapshot_retention(&self) -> time::Duration {
        time::Duration::days(i64::from(self.snapshot_retention_days))
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    /// Reject settings the engine cannot run with.
    pub fn validate(&self) -> Result<(), String> {
        if self.workers == 0 {
            return Err("engine.workers must be at least 1".into());
        }
        if self.queue_depth == 0 {
            return Err("engine.queue_depth must be at least 1".into());
        }
        if self.list_limit_max < 1 {
            return Err("engine.list_limit_max must be at least 1".into());
        }
        if self.call_timeout_ms == 0 || self.sweep_interval_ms == 0 {
            return Err("engine timeouts and intervals must be non-zero".into());
        }
        if self.heartbeat_interval_ms == 0 || self.heartbeat_timeout_ms < self.heartbeat_interval_ms {
            return Err(
                "engine.heartbeat_timeout_ms must be at least heartbeat_interval_ms".into(),
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        assert!(EngineConfig::default().validate().is_ok());
    }

    #[test]
    fn zero_workers_rejected() {
        let config = EngineConfig {
            workers: 0,
            ..EngineConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn heartbeat_timeout_below_interval_rejected() {
        let config = EngineConfig {
            heartbeat_interval_ms: 10_000,
            heartbeat_timeout_ms: 5_000,
            ..EngineConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
