//! Runtime configuration for the operator
//!
//! Values come from CLI flags or their environment variables (see `main.rs`)
//! and are validated once at startup.

use std::time::Duration;

use crate::error::{Error, Result};

/// Log output format
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Tunables for the reconcile loop
#[derive(Clone, Debug)]
pub struct OperatorConfig {
    /// Namespace to watch; `None` watches all namespaces
    pub namespace: Option<String>,
    /// Deadline for a single instance probe (connect + handshake + response)
    pub probe_timeout: Duration,
    /// Maximum probes in flight for one cluster
    pub max_concurrent_probes: usize,
    /// Safety tick between passes when no watch event arrives
    pub resync_interval: Duration,
    /// Outer deadline for one reconcile pass
    pub pass_deadline: Duration,
    /// Attempts for a resourceVersion-guarded status write
    pub status_write_attempts: u32,
    /// Validity of instance and client certificates
    pub cert_validity: Duration,
    /// Port of the read-only REST API
    pub api_port: u16,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            namespace: None,
            probe_timeout: Duration::from_secs(5),
            max_concurrent_probes: 8,
            resync_interval: Duration::from_secs(15),
            pass_deadline: Duration::from_secs(60),
            status_write_attempts: 5,
            cert_validity: Duration::from_secs(90 * 24 * 3600),
            api_port: 8080,
        }
    }
}

impl OperatorConfig {
    pub fn validate(&self) -> Result<()> {
        if self.probe_timeout.is_zero() {
            return Err(Error::ConfigError("probe timeout must be positive".into()));
        }
        if self.max_concurrent_probes == 0 {
            return Err(Error::ConfigError(
                "max concurrent probes must be at least 1".into(),
            ));
        }
        if self.resync_interval.is_zero() {
            return Err(Error::ConfigError("resync interval must be positive".into()));
        }
        if self.pass_deadline <= self.probe_timeout {
            return Err(Error::ConfigError(format!(
                "pass deadline ({:?}) must exceed probe timeout ({:?})",
                self.pass_deadline, self.probe_timeout
            )));
        }
        if self.status_write_attempts == 0 {
            return Err(Error::ConfigError(
                "status write attempts must be at least 1".into(),
            ));
        }
        if self.cert_validity < Duration::from_secs(3600) {
            return Err(Error::ConfigError(
                "certificate validity must be at least one hour".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(OperatorConfig::default().validate().is_ok());
    }

    #[test]
    fn test_pass_deadline_must_exceed_probe_timeout() {
        let config = OperatorConfig {
            probe_timeout: Duration::from_secs(10),
            pass_deadline: Duration::from_secs(10),
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(Error::ConfigError(_))));
    }

    #[test]
    fn test_zero_concurrency_rejected() {
        let config = OperatorConfig {
            max_concurrent_probes: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
