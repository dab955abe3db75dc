//! Loading primitive configuration from YAML or JSON.
//!
//! Every primitive takes its config struct explicitly; nothing is read from
//! global state. [`ToolkitConfig`] only bundles those structs so a service can
//! keep them in one document:
//!
//! ```yaml
//! permit_pool:
//!   capacity: 8
//! rate_limiter:
//!   rps: 50.0
//! circuit_breaker:
//!   failure_threshold: 3
//!   cooldown_ms: 100
//! pipeline:
//!   queue_capacity: 32
//!   error_policy: report
//! ```

use crate::pipeline::PipelineConfig;
use crate::resilience::circuit_breaker::CircuitBreakerConfig;
use crate::resilience::rate_limiter::RateLimiterConfig;
use crate::sync::PermitPoolConfig;
use crate::{Error, ErrorContext, Result};
use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ToolkitConfig {
    pub permit_pool: Option<PermitPoolConfig>,
    pub rate_limiter: Option<RateLimiterConfig>,
    pub circuit_breaker: Option<CircuitBreakerConfig>,
    pub pipeline: Option<PipelineConfig>,
}

impl ToolkitConfig {
    pub fn from_yaml_str(s: &str) -> Result<Self> {
        serde_yaml::from_str(s).map_err(|e| {
            Error::configuration_with_context(
                "invalid YAML config",
                ErrorContext::new()
                    .with_details(e.to_string())
                    .with_source("config"),
            )
        })
    }

    pub fn from_json_str(s: &str) -> Result<Self> {
        serde_json::from_str(s).map_err(|e| {
            Error::configuration_with_context(
                "invalid JSON config",
                ErrorContext::new()
                    .with_details(e.to_string())
                    .with_source("config"),
            )
        })
    }

    /// Load from a file; `.json` is parsed as JSON, anything else as YAML.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)?;
        let is_json = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.eq_ignore_ascii_case("json"))
            .unwrap_or(false);
        let cfg = if is_json {
            Self::from_json_str(&raw)
        } else {
            Self::from_yaml_str(&raw)
        };
        cfg.map_err(|e| match e {
            Error::Configuration { message, context } => Error::Configuration {
                message,
                context: context.with_field_path(path.display().to_string()),
            },
            other => other,
        })
    }
}

/// `Duration` as integer milliseconds.
pub(crate) mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> std::result::Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::ErrorPolicy;
    use std::time::Duration;

    #[test]
    fn test_yaml_config() {
        let cfg = ToolkitConfig::from_yaml_str(
            r#"
permit_pool:
  capacity: 8
rate_limiter:
  rps: 50.0
circuit_breaker:
  failure_threshold: 3
  cooldown_ms: 100
pipeline:
  queue_capacity: 32
  error_policy: report
"#,
        )
        .unwrap();

        assert_eq!(cfg.permit_pool.unwrap().capacity, 8);
        let rl = cfg.rate_limiter.unwrap();
        assert_eq!(rl.rps, 50.0);
        assert_eq!(rl.capacity(), 50);
        let cb = cfg.circuit_breaker.unwrap();
        assert_eq!(cb.failure_threshold, 3);
        assert_eq!(cb.cooldown, Duration::from_millis(100));
        assert_eq!(cb.half_open_max_probes, 1);
        let p = cfg.pipeline.unwrap();
        assert_eq!(p.queue_capacity, 32);
        assert_eq!(p.error_policy, ErrorPolicy::Report);
    }

    #[test]
    fn test_json_config_partial() {
        let cfg = ToolkitConfig::from_json_str(r#"{"permit_pool": {"capacity": 2}}"#).unwrap();
        assert!(cfg.rate_limiter.is_none());
        assert!(cfg.circuit_breaker.is_none());
        assert_eq!(cfg.permit_pool.unwrap().capacity, 2);
    }

    #[test]
    fn test_invalid_yaml_is_configuration_error() {
        let err = ToolkitConfig::from_yaml_str("permit_pool: [").unwrap_err();
        assert!(matches!(err, Error::Configuration { .. }));
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let err = ToolkitConfig::from_file("/nonexistent/flowguard.yaml").unwrap_err();
        assert!(matches!(err, Error::Io(_)));
    }
}
