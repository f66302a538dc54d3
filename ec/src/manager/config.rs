//! Manager configuration and exit criteria

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

/// Global exit criteria; any one satisfied stops the run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ExitCriteria {
    /// Stop after this many results have been received
    #[serde(default)]
    pub max_evaluations: Option<u64>,

    /// Refuse generator sends beyond this count
    #[serde(default)]
    pub max_generator_calls: Option<u64>,

    /// Stop after this many seconds of wall-clock time
    #[serde(default)]
    pub max_wallclock_seconds: Option<f64>,

    /// Stop once a genuinely evaluated row reaches this value or lower
    #[serde(default)]
    pub target_value: Option<f64>,
}

impl ExitCriteria {
    pub fn wallclock(&self) -> Option<Duration> {
        debug!(max_wallclock_seconds = ?self.max_wallclock_seconds, "ExitCriteria::wallclock: called");
        self.max_wallclock_seconds
            .filter(|s| s.is_finite() && *s >= 0.0)
            .map(Duration::from_secs_f64)
    }

    /// True when nothing bounds the run
    pub fn is_unbounded(&self) -> bool {
        self.max_evaluations.is_none()
            && self.max_generator_calls.is_none()
            && self.max_wallclock_seconds.is_none()
            && self.target_value.is_none()
    }
}

/// Manager configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ManagerConfig {
    /// Concurrent evaluations
    #[serde(default = "default_workers")]
    pub workers: u32,

    /// Deliver in-flight results after a stop instead of aborting them
    #[serde(default)]
    pub drain_on_stop: bool,

    /// Channel buffer size for manager requests and replies
    #[serde(default = "default_channel_buffer")]
    pub channel_buffer: usize,
}

fn default_workers() -> u32 {
    debug!("default_workers: called");
    4
}

fn default_channel_buffer() -> usize {
    debug!("default_channel_buffer: called");
    256
}

impl Default for ManagerConfig {
    fn default() -> Self {
        debug!("ManagerConfig::default: called");
        Self {
            workers: default_workers(),
            drain_on_stop: false,
            channel_buffer: default_channel_buffer(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manager_config_defaults() {
        let config: ManagerConfig = serde_yaml::from_str("{}").unwrap();
        assert_eq!(config, ManagerConfig::default());
        assert_eq!(config.workers, 4);
        assert!(!config.drain_on_stop);
    }

    #[test]
    fn test_exit_criteria_kebab_keys() {
        let yaml = "max-evaluations: 10\nmax-wallclock-seconds: 1.5\ntarget-value: 0.01\n";
        let exit: ExitCriteria = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(exit.max_evaluations, Some(10));
        assert_eq!(exit.wallclock(), Some(Duration::from_millis(1500)));
        assert!(!exit.is_unbounded());
        assert!(ExitCriteria::default().is_unbounded());
    }
}
