use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::scheduler::Strategy;

/// Errors produced while loading or validating the balancer configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file '{path}': {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file '{path}': {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_yaml_ng::Error,
    },

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Top-level balancer configuration, loaded from a YAML file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub scheduler: SchedulerConfig,

    #[serde(default)]
    pub health_check: HealthCheckConfig,

    #[serde(default)]
    pub queue: QueueConfig,

    #[serde(default)]
    pub backends: Vec<BackendConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub debug: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            debug: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default)]
    pub strategy: Strategy,
    #[serde(default = "default_true")]
    pub prefer_idle: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            strategy: Strategy::default(),
            prefer_idle: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheckConfig {
    #[serde(default = "default_health_interval", with = "seconds")]
    pub interval: Duration,
    #[serde(default = "default_health_timeout", with = "seconds")]
    pub timeout: Duration,
    #[serde(default = "default_unhealthy_threshold")]
    pub unhealthy_threshold: u32,
    #[serde(default = "default_healthy_threshold")]
    pub healthy_threshold: u32,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            interval: default_health_interval(),
            timeout: default_health_timeout(),
            unhealthy_threshold: default_unhealthy_threshold(),
            healthy_threshold: default_healthy_threshold(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    #[serde(default = "default_max_size")]
    pub max_size: usize,
    #[serde(default = "default_retry_interval", with = "seconds")]
    pub retry_interval: Duration,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// How long `POST /prompt` blocks waiting for dispatch before returning
    /// a 202 with just the `task_id` (spec.md §4.9). Not one of spec.md
    /// §6's named `queue` keys, but it lives in the same config block
    /// since it's the same knob family (queue behaviour).
    #[serde(default = "default_submit_timeout", with = "seconds")]
    pub submit_timeout: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_size: default_max_size(),
            retry_interval: default_retry_interval(),
            max_retries: default_max_retries(),
            submit_timeout: default_submit_timeout(),
        }
    }
}

/// Static backend entry from the config file. Loaded into the registry at startup.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BackendConfig {
    pub name: String,
    pub host: String,
    pub port: u16,
    #[serde(default = "default_weight")]
    pub weight: u32,
    #[serde(default = "default_max_queue")]
    pub max_queue: u32,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    8188
}
fn default_true() -> bool {
    true
}
fn default_health_interval() -> Duration {
    Duration::from_secs(5)
}
fn default_health_timeout() -> Duration {
    Duration::from_secs(3)
}
fn default_unhealthy_threshold() -> u32 {
    3
}
fn default_healthy_threshold() -> u32 {
    1
}
fn default_max_size() -> usize {
    1000
}
fn default_retry_interval() -> Duration {
    Duration::from_secs(5)
}
fn default_max_retries() -> u32 {
    3
}
fn default_weight() -> u32 {
    1
}
fn default_max_queue() -> u32 {
    10
}
fn default_submit_timeout() -> Duration {
    Duration::from_secs(5)
}

/// Serde helper: (de)serialize a `Duration` as a plain integer number of seconds,
/// matching the config shape documented in spec.md §6 ("seconds, counts").
mod seconds {
    use super::Duration;
    use serde::{self, Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

impl Config {
    /// Read, parse, and validate a config file. Any failure here is fatal at
    /// startup (spec.md §6/§7 `ConfigInvalid`, exit code 1).
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;

        let config: Config =
            serde_yaml_ng::from_str(&raw).map_err(|source| ConfigError::Parse {
                path: path.display().to_string(),
                source,
            })?;

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = std::collections::HashSet::new();
        for backend in &self.backends {
            if !seen.insert(backend.name.clone()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate backend name '{}'",
                    backend.name
                )));
            }
            if backend.weight == 0 {
                return Err(ConfigError::Invalid(format!(
                    "backend '{}': weight must be >= 1",
                    backend.name
                )));
            }
            if backend.max_queue == 0 {
                return Err(ConfigError::Invalid(format!(
                    "backend '{}': max_queue must be >= 1",
                    backend.name
                )));
            }
        }
        if self.queue.max_size == 0 {
            return Err(ConfigError::Invalid(
                "queue.max_size must be >= 1".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_minimal_config() {
        let yaml = r#"
backends:
  - name: comfy-1
    host: 127.0.0.1
    port: 8188
"#;
        let config: Config = serde_yaml_ng::from_str(yaml).unwrap();
        assert_eq!(config.backends.len(), 1);
        let b = &config.backends[0];
        assert_eq!(b.weight, 1);
        assert_eq!(b.max_queue, 10);
        assert!(b.enabled);
    }

    #[test]
    fn test_defaults() {
        let yaml = "{}";
        let config: Config = serde_yaml_ng::from_str(yaml).unwrap();
        assert_eq!(config.server.port, 8188);
        assert_eq!(config.health_check.interval, Duration::from_secs(5));
        assert_eq!(config.health_check.unhealthy_threshold, 3);
        assert_eq!(config.health_check.healthy_threshold, 1);
        assert!(config.scheduler.prefer_idle);
        assert_eq!(config.queue.max_size, 1000);
    }

    #[test]
    fn test_validate_rejects_duplicate_backend_names() {
        let yaml = r#"
backends:
  - name: comfy-1
    host: a
    port: 1
  - name: comfy-1
    host: b
    port: 2
"#;
        let config: Config = serde_yaml_ng::from_str(yaml).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_weight() {
        let yaml = r#"
backends:
  - name: comfy-1
    host: a
    port: 1
    weight: 0
"#;
        let config: Config = serde_yaml_ng::from_str(yaml).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_scheduler_strategy_parsing() {
        let yaml = r#"
scheduler:
  strategy: weighted
  prefer_idle: false
"#;
        let config: Config = serde_yaml_ng::from_str(yaml).unwrap();
        assert_eq!(config.scheduler.strategy, Strategy::Weighted);
        assert!(!config.scheduler.prefer_idle);
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(
            &path,
            r#"
backends:
  - name: comfy-1
    host: 127.0.0.1
    port: 8188
"#,
        )
        .unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.backends.len(), 1);
    }

    #[test]
    fn test_load_missing_file() {
        let path = Path::new("/nonexistent/comfy-lb-config.yaml");
        assert!(Config::load(path).is_err());
    }
}
