//! Configuration types for pipelines and their components.
//!
//! All structs deserialize with per-field defaults so partial definitions
//! (e.g. a TOML table naming only `queue_max_size`) are accepted.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::bus::DEFAULT_BUS_CAPACITY;
use crate::error::{PumpError, Result};

/// Pipeline-wide settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Capacity of the lifecycle bus broadcast channel.
    #[serde(default = "default_bus_capacity")]
    pub bus_capacity: usize,
    /// How long `stop()` waits for the source task before aborting it.
    #[serde(default = "default_stop_timeout_ms")]
    pub stop_timeout_ms: u64,
}

fn default_bus_capacity() -> usize {
    DEFAULT_BUS_CAPACITY
}

fn default_stop_timeout_ms() -> u64 {
    10_000
}

impl PipelineConfig {
    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            bus_capacity: default_bus_capacity(),
            stop_timeout_ms: default_stop_timeout_ms(),
        }
    }
}

/// Settings of an [`InternalSource`](crate::internal::InternalSource).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InternalSourceConfig {
    /// Hard capacity of the queue. A capacity of 1 is raised to 2.
    #[serde(default = "default_internal_queue_size")]
    pub queue_max_size: usize,
    /// Fraction of the capacity at which backpressure is signaled.
    #[serde(default = "default_backpressure_ratio")]
    pub backpressure_ratio: f64,
}

fn default_internal_queue_size() -> usize {
    1000
}

fn default_backpressure_ratio() -> f64 {
    0.8
}

impl InternalSourceConfig {
    pub fn new(queue_max_size: usize, backpressure_ratio: f64) -> Self {
        Self {
            queue_max_size,
            backpressure_ratio,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.queue_max_size == 0 {
            return Err(PumpError::config("queue_max_size must be greater than 0"));
        }
        if !(self.backpressure_ratio > 0.0 && self.backpressure_ratio < 1.0) {
            return Err(PumpError::config(format!(
                "backpressure_ratio must be within (0, 1), got {}",
                self.backpressure_ratio
            )));
        }
        Ok(())
    }
}

impl Default for InternalSourceConfig {
    fn default() -> Self {
        Self {
            queue_max_size: default_internal_queue_size(),
            backpressure_ratio: default_backpressure_ratio(),
        }
    }
}

/// Settings of an out-of-band worker pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OobConfig {
    #[serde(default = "default_oob_queue_size")]
    pub queue_max_size: usize,
    #[serde(default = "default_oob_workers")]
    pub num_of_workers: usize,
}

fn default_oob_queue_size() -> usize {
    100
}

fn default_oob_workers() -> usize {
    10
}

impl OobConfig {
    pub fn validate(&self) -> Result<()> {
        if self.queue_max_size == 0 {
            return Err(PumpError::config("queue_max_size must be greater than 0"));
        }
        if self.num_of_workers == 0 {
            return Err(PumpError::config("num_of_workers must be greater than 0"));
        }
        Ok(())
    }
}

impl Default for OobConfig {
    fn default() -> Self {
        Self {
            queue_max_size: default_oob_queue_size(),
            num_of_workers: default_oob_workers(),
        }
    }
}

/// Settings of a latch stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LatchConfig {
    /// Events kept; `0` keeps everything.
    #[serde(default = "default_latch_size")]
    pub queue_max_size: usize,
}

fn default_latch_size() -> usize {
    50
}

impl Default for LatchConfig {
    fn default() -> Self {
        Self {
            queue_max_size: default_latch_size(),
        }
    }
}

/// Settings of the opportunistic trigger policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpportunisticConfig {
    /// Fire as soon as the policy starts.
    #[serde(default = "default_true")]
    pub run_immediately: bool,
    /// Minimum time between two fires.
    #[serde(default = "default_chilldown_ms")]
    pub chilldown_period_ms: u64,
}

fn default_true() -> bool {
    true
}

fn default_chilldown_ms() -> u64 {
    5_000
}

impl OpportunisticConfig {
    pub fn chilldown_period(&self) -> Duration {
        Duration::from_millis(self.chilldown_period_ms)
    }
}

impl Default for OpportunisticConfig {
    fn default() -> Self {
        Self {
            run_immediately: true,
            chilldown_period_ms: default_chilldown_ms(),
        }
    }
}

/// Settings of the fixed-interval trigger policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeriodicConfig {
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
    #[serde(default)]
    pub run_immediately: bool,
}

fn default_interval_ms() -> u64 {
    1_000
}

impl PeriodicConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms.max(1))
    }
}

impl Default for PeriodicConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_interval_ms(),
            run_immediately: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn partial_definitions_use_defaults() {
        let cfg: InternalSourceConfig =
            serde_json::from_value(serde_json::json!({ "queue_max_size": 10 })).unwrap();
        assert_eq!(cfg.queue_max_size, 10);
        assert_eq!(cfg.backpressure_ratio, 0.8);

        let cfg: OpportunisticConfig = serde_json::from_value(serde_json::json!({})).unwrap();
        assert!(cfg.run_immediately);
        assert_eq!(cfg.chilldown_period(), Duration::from_secs(5));
    }

    #[rstest]
    #[case(10, 0.8, true)]
    #[case(0, 0.8, false)]
    #[case(10, 0.0, false)]
    #[case(10, 1.0, false)]
    #[case(1, 0.5, true)]
    fn internal_source_validation(#[case] size: usize, #[case] ratio: f64, #[case] ok: bool) {
        assert_eq!(InternalSourceConfig::new(size, ratio).validate().is_ok(), ok);
    }

    #[test]
    fn oob_validation_rejects_zero_workers() {
        let cfg = OobConfig {
            queue_max_size: 4,
            num_of_workers: 0,
        };
        assert!(cfg.validate().is_err());
        assert!(OobConfig::default().validate().is_ok());
    }
}
