//! Update watcher configuration
//!
//! Read from the environment:
//!
//! | Variable          | Meaning                                   | Default |
//! |-------------------|-------------------------------------------|---------|
//! | `POLL_INTERVAL`   | seconds between update checks             | 86400   |
//! | `CLEANUP`         | prune the old definition after an update  | false   |
//! | `INCLUDE_STOPPED` | also check units that are not running     | false   |
//! | `REVIVE_STOPPED`  | start stopped units after updating them   | false   |

use std::time::Duration;

use crate::units::{parse_duration, MAX_DURATION};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{var}: expected a boolean, got {value:?}")]
    InvalidBool { var: &'static str, value: String },

    #[error("POLL_INTERVAL: invalid interval {0:?}")]
    InvalidInterval(String),

    #[error("Poll interval must be greater than zero")]
    ZeroInterval,

    #[error("Poll interval {0:?} is longer than {max:?}", max = MAX_DURATION)]
    IntervalTooLong(Duration),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollConfig {
    pub interval: Duration,
    pub cleanup: bool,
    pub include_stopped: bool,
    pub revive_stopped: bool,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval: DEFAULT_POLL_INTERVAL,
            cleanup: false,
            include_stopped: false,
            revive_stopped: false,
        }
    }
}

impl PollConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Build from any variable source; unset variables keep their defaults
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(raw) = lookup("POLL_INTERVAL") {
            config.interval = parse_duration(&raw).ok_or(ConfigError::InvalidInterval(raw))?;
        }
        config.cleanup = bool_var(&lookup, "CLEANUP")?.unwrap_or(config.cleanup);
        config.include_stopped =
            bool_var(&lookup, "INCLUDE_STOPPED")?.unwrap_or(config.include_stopped);
        config.revive_stopped =
            bool_var(&lookup, "REVIVE_STOPPED")?.unwrap_or(config.revive_stopped);

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.interval.is_zero() {
            return Err(ConfigError::ZeroInterval);
        }
        if self.interval > MAX_DURATION {
            return Err(ConfigError::IntervalTooLong(self.interval));
        }
        Ok(())
    }
}

fn bool_var<F>(lookup: &F, var: &'static str) -> Result<Option<bool>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(var) {
        None => Ok(None),
        Some(value) => parse_bool(&value)
            .map(Some)
            .ok_or(ConfigError::InvalidBool { var, value }),
    }
}

pub fn parse_bool(s: &str) -> Option<bool> {
    match s.trim().to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" | "" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = PollConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, PollConfig::default());
        assert_eq!(config.interval, Duration::from_secs(86400));
    }

    #[test]
    fn test_sidecar_environment() {
        let config = PollConfig::from_lookup(lookup(&[
            ("POLL_INTERVAL", "3600"),
            ("CLEANUP", "true"),
            ("INCLUDE_STOPPED", "1"),
        ]))
        .unwrap();
        assert_eq!(config.interval, Duration::from_secs(3600));
        assert!(config.cleanup);
        assert!(config.include_stopped);
        assert!(!config.revive_stopped);
    }

    #[test]
    fn test_interval_with_unit() {
        let config = PollConfig::from_lookup(lookup(&[("POLL_INTERVAL", "5min")])).unwrap();
        assert_eq!(config.interval, Duration::from_secs(300));
    }

    #[test]
    fn test_invalid_values() {
        assert_eq!(
            PollConfig::from_lookup(lookup(&[("CLEANUP", "maybe")])).unwrap_err(),
            ConfigError::InvalidBool {
                var: "CLEANUP",
                value: "maybe".to_string()
            }
        );
        assert_eq!(
            PollConfig::from_lookup(lookup(&[("POLL_INTERVAL", "soon")])).unwrap_err(),
            ConfigError::InvalidInterval("soon".to_string())
        );
        assert_eq!(
            PollConfig::from_lookup(lookup(&[("POLL_INTERVAL", "0")])).unwrap_err(),
            ConfigError::ZeroInterval
        );
    }

    #[test]
    fn test_interval_out_of_range() {
        assert_eq!(
            PollConfig::from_lookup(lookup(&[("POLL_INTERVAL", "18446744073709551615")]))
                .unwrap_err(),
            ConfigError::InvalidInterval("18446744073709551615".to_string())
        );

        let config = PollConfig {
            interval: Duration::MAX,
            ..PollConfig::default()
        };
        assert_eq!(
            config.validate().unwrap_err(),
            ConfigError::IntervalTooLong(Duration::MAX)
        );
    }

    #[test]
    fn test_parse_bool() {
        assert_eq!(parse_bool("TRUE"), Some(true));
        assert_eq!(parse_bool("yes"), Some(true));
        assert_eq!(parse_bool("0"), Some(false));
        assert_eq!(parse_bool("off"), Some(false));
        assert_eq!(parse_bool("nah"), None);
    }
}
