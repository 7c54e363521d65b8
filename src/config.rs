use serde::Deserialize;
use std::{collections::HashSet, fs, io, path::Path, time::Duration};
use tokio::sync::Semaphore;

use crate::{ServiceConfig, ownership::CollisionPolicy};

pub const DEFAULT_BOOTSTRAP_CONCURRENCY: usize = 8;

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read { path: String, source: io::Error },
    #[error("failed to parse config file: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("duplicate service name '{0}'")]
    DuplicateService(String),
    #[error("bootstrap concurrency must be at least 1")]
    InvalidConcurrency,
    #[error("maxSockets of service '{service}' exceeds {max}")]
    TooManySockets { service: String, max: usize },
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayConfig {
    pub services: Vec<ServiceConfig>,
    #[serde(default = "default_bootstrap_concurrency")]
    pub bootstrap_concurrency: usize,
    #[serde(default)]
    pub ownership_collisions: CollisionPolicy,
    /// Deadline applied to every delegated call, in milliseconds.
    #[serde(default)]
    pub request_timeout_msecs: Option<u64>,
}

fn default_bootstrap_concurrency() -> usize {
    DEFAULT_BOOTSTRAP_CONCURRENCY
}

impl GatewayConfig {
    pub fn new(services: Vec<ServiceConfig>) -> Self {
        GatewayConfig {
            services,
            bootstrap_concurrency: DEFAULT_BOOTSTRAP_CONCURRENCY,
            ownership_collisions: CollisionPolicy::default(),
            request_timeout_msecs: None,
        }
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        tracing::debug!(path = %path.display(), "reading gateway config");

        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_yaml(&contents)
    }

    pub fn from_yaml(contents: &str) -> Result<Self, ConfigError> {
        let config: GatewayConfig = serde_yaml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.bootstrap_concurrency == 0 {
            return Err(ConfigError::InvalidConcurrency);
        }

        let mut seen = HashSet::new();
        for service in &self.services {
            if !seen.insert(service.name.as_str()) {
                return Err(ConfigError::DuplicateService(service.name.clone()));
            }
            if service.max_sockets.is_some_and(|max| max > Semaphore::MAX_PERMITS) {
                return Err(ConfigError::TooManySockets {
                    service: service.name.clone(),
                    max: Semaphore::MAX_PERMITS,
                });
            }
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout_msecs.map(Duration::from_millis)
    }
}
