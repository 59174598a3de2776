use crate::types::{OrganizationId, ProjectId};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ValidationError {
    #[error("Port cannot be 0")]
    InvalidPort,

    #[error("Worker concurrency cannot be 0")]
    InvalidConcurrency,

    #[error("Worker queue size cannot be 0")]
    InvalidQueueSize,

    #[error("Status TTL cannot be 0")]
    InvalidTtl,

    #[error("Redis URL cannot be empty")]
    EmptyRedisUrl,

    #[error("Duplicate organization: {0}")]
    DuplicateOrganization(String),

    #[error("Duplicate release {version} in organization {organization}")]
    DuplicateRelease {
        organization: OrganizationId,
        version: String,
    },

    #[error("Empty release version in organization {0}")]
    EmptyReleaseVersion(OrganizationId),

    #[error("Empty token")]
    EmptyToken,

    #[error("Token references unknown organization: {0}")]
    UnknownOrganization(OrganizationId),
}

/// Network listener configuration
#[derive(Clone, Deserialize, Debug, PartialEq)]
pub struct Listener {
    pub host: String,
    pub port: u16,
}

impl Listener {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.port == 0 {
            return Err(ValidationError::InvalidPort);
        }
        Ok(())
    }
}

impl Default for Listener {
    fn default() -> Self {
        Listener {
            host: "127.0.0.1".into(),
            port: 3000,
        }
    }
}

fn default_admin_listener() -> Listener {
    Listener {
        host: "127.0.0.1".into(),
        port: 3001,
    }
}

/// Where the assemble status registry lives. Deployments with more than one
/// process must use a backend shared by all of them.
#[derive(Clone, Deserialize, Debug, PartialEq, Default)]
#[serde(rename_all = "lowercase")]
#[serde(tag = "type")]
pub enum StatusBackend {
    #[default]
    Memory,
    Redis {
        url: String,
    },
}

#[derive(Clone, Deserialize, Debug, PartialEq)]
#[serde(default)]
pub struct StatusConfig {
    pub backend: StatusBackend,
    pub ttl_secs: u64,
    /// Only used by the memory backend
    pub max_capacity: u64,
}

impl StatusConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

impl Default for StatusConfig {
    fn default() -> Self {
        StatusConfig {
            backend: StatusBackend::default(),
            ttl_secs: crate::status::DEFAULT_TTL.as_secs(),
            max_capacity: crate::status::DEFAULT_MAX_CAPACITY,
        }
    }
}

#[derive(Clone, Deserialize, Debug, PartialEq)]
#[serde(default)]
pub struct WorkerConfig {
    /// Maximum number of bundles assembled at the same time
    pub concurrency: usize,
    /// Number of tasks that can wait for a worker before enqueueing blocks
    pub queue_size: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        WorkerConfig {
            concurrency: 4,
            queue_size: 64,
        }
    }
}

#[derive(Clone, Deserialize, Debug, PartialEq)]
#[serde(default)]
pub struct Limits {
    /// Maximum size of a single uploaded chunk in bytes
    pub max_chunk_size: usize,
    /// Maximum size of an assembled bundle in bytes
    pub max_assemble_size: u64,
}

impl Default for Limits {
    fn default() -> Self {
        Limits {
            max_chunk_size: 8 * 1024 * 1024,
            max_assemble_size: 2 * 1024 * 1024 * 1024,
        }
    }
}

#[derive(Clone, Deserialize, Debug, PartialEq, Default)]
#[serde(rename_all = "lowercase")]
#[serde(tag = "type")]
pub enum StoreConfig {
    Filesystem {
        path: PathBuf,
    },
    #[default]
    Memory,
}

#[derive(Clone, Deserialize, Debug, PartialEq)]
pub struct ReleaseConfig {
    pub version: String,
    #[serde(default)]
    pub projects: Vec<ProjectId>,
}

#[derive(Clone, Deserialize, Debug, PartialEq)]
pub struct OrganizationConfig {
    pub id: OrganizationId,
    pub slug: String,
    #[serde(default)]
    pub releases: Vec<ReleaseConfig>,
}

#[derive(Clone, Deserialize, Debug, PartialEq)]
pub struct TokenConfig {
    pub token: String,
    pub organization: OrganizationId,
    /// Restricts the token to these projects. Unset means access to the whole organization.
    pub projects: Option<Vec<ProjectId>>,
}

#[derive(Clone, Deserialize, Debug, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub listener: Listener,
    #[serde(default = "default_admin_listener")]
    pub admin_listener: Listener,
    #[serde(default)]
    pub status: StatusConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub limits: Limits,
    #[serde(default)]
    pub chunk_store: StoreConfig,
    #[serde(default)]
    pub bundle_store: StoreConfig,
    #[serde(default)]
    pub organizations: Vec<OrganizationConfig>,
    #[serde(default)]
    pub tokens: Vec<TokenConfig>,
}

impl Config {
    pub fn validate(&self) -> Result<(), ValidationError> {
        self.listener.validate()?;
        self.admin_listener.validate()?;

        if self.worker.concurrency == 0 {
            return Err(ValidationError::InvalidConcurrency);
        }
        if self.worker.queue_size == 0 {
            return Err(ValidationError::InvalidQueueSize);
        }
        if self.status.ttl_secs == 0 {
            return Err(ValidationError::InvalidTtl);
        }
        if matches!(&self.status.backend, StatusBackend::Redis { url } if url.is_empty()) {
            return Err(ValidationError::EmptyRedisUrl);
        }

        let mut ids = HashSet::new();
        let mut slugs = HashSet::new();
        for org in &self.organizations {
            if !ids.insert(org.id) {
                return Err(ValidationError::DuplicateOrganization(org.id.to_string()));
            }
            if !slugs.insert(org.slug.as_str()) {
                return Err(ValidationError::DuplicateOrganization(org.slug.clone()));
            }

            let mut versions = HashSet::new();
            for release in &org.releases {
                if release.version.is_empty() {
                    return Err(ValidationError::EmptyReleaseVersion(org.id));
                }
                if !versions.insert(release.version.as_str()) {
                    return Err(ValidationError::DuplicateRelease {
                        organization: org.id,
                        version: release.version.clone(),
                    });
                }
            }
        }

        for token in &self.tokens {
            if token.token.is_empty() {
                return Err(ValidationError::EmptyToken);
            }
            if !ids.contains(&token.organization) {
                return Err(ValidationError::UnknownOrganization(token.organization));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONFIG_YAML: &str = r#"
listener:
    host: 0.0.0.0
    port: 3000
admin_listener:
    host: 127.0.0.1
    port: 3001
status:
    ttl_secs: 300
    backend:
        type: redis
        url: redis://127.0.0.1:6379/0
worker:
    concurrency: 2
chunk_store:
    type: filesystem
    path: /var/lib/bundler/chunks
organizations:
    - id: 1
      slug: acme
      releases:
          - version: "1.0.0"
            projects: [1, 2]
          - version: "2.0.0"
tokens:
    - token: secret
      organization: 1
    - token: scoped
      organization: 1
      projects: [2]
"#;

    #[test]
    fn test_parse_valid_config() {
        let config: Config = serde_yaml::from_str(CONFIG_YAML).unwrap();
        assert!(config.validate().is_ok());

        assert_eq!(config.listener.host, "0.0.0.0");
        assert_eq!(config.status.ttl(), Duration::from_secs(300));
        assert_eq!(
            config.status.backend,
            StatusBackend::Redis {
                url: "redis://127.0.0.1:6379/0".into()
            }
        );
        assert_eq!(config.status.max_capacity, 100_000);
        assert_eq!(config.worker.concurrency, 2);
        assert_eq!(config.worker.queue_size, 64);
        assert_eq!(config.limits, Limits::default());
        assert_eq!(
            config.chunk_store,
            StoreConfig::Filesystem {
                path: "/var/lib/bundler/chunks".into()
            }
        );
        assert_eq!(config.bundle_store, StoreConfig::Memory);
        assert_eq!(config.organizations[0].releases.len(), 2);
        assert!(config.organizations[0].releases[1].projects.is_empty());
        assert_eq!(config.tokens[0].projects, None);
        assert_eq!(config.tokens[1].projects, Some(vec![2]));
    }

    #[test]
    fn test_minimal_config() {
        let config: Config = serde_yaml::from_str("{}").unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.listener, Listener::default());
        assert_eq!(config.admin_listener.port, 3001);
        assert_eq!(config.status.backend, StatusBackend::Memory);
    }

    #[test]
    fn test_validation_errors() {
        let base_config: Config = serde_yaml::from_str(CONFIG_YAML).unwrap();

        let mut config = base_config.clone();
        config.admin_listener.port = 0;
        assert!(matches!(
            config.validate().unwrap_err(),
            ValidationError::InvalidPort
        ));

        let mut config = base_config.clone();
        config.worker.concurrency = 0;
        assert!(matches!(
            config.validate().unwrap_err(),
            ValidationError::InvalidConcurrency
        ));

        let mut config = base_config.clone();
        config.worker.queue_size = 0;
        assert!(matches!(
            config.validate().unwrap_err(),
            ValidationError::InvalidQueueSize
        ));

        let mut config = base_config.clone();
        config.status.ttl_secs = 0;
        assert!(matches!(
            config.validate().unwrap_err(),
            ValidationError::InvalidTtl
        ));

        let mut config = base_config.clone();
        config.status.backend = StatusBackend::Redis { url: "".into() };
        assert!(matches!(
            config.validate().unwrap_err(),
            ValidationError::EmptyRedisUrl
        ));

        let mut config = base_config.clone();
        let mut duplicate = config.organizations[0].clone();
        duplicate.id = 2;
        config.organizations.push(duplicate);
        assert!(matches!(
            config.validate().unwrap_err(),
            ValidationError::DuplicateOrganization(slug) if slug == "acme"
        ));

        let mut config = base_config.clone();
        config.organizations[0].releases[1].version = "1.0.0".into();
        assert!(matches!(
            config.validate().unwrap_err(),
            ValidationError::DuplicateRelease { .. }
        ));

        let mut config = base_config.clone();
        config.organizations[0].releases[0].version = "".into();
        assert!(matches!(
            config.validate().unwrap_err(),
            ValidationError::EmptyReleaseVersion(1)
        ));

        let mut config = base_config.clone();
        config.tokens[0].token = "".into();
        assert!(matches!(
            config.validate().unwrap_err(),
            ValidationError::EmptyToken
        ));

        let mut config = base_config;
        config.tokens[0].organization = 42;
        assert!(matches!(
            config.validate().unwrap_err(),
            ValidationError::UnknownOrganization(42)
        ));
    }

    #[test]
    fn test_deserialization_errors() {
        assert!(serde_yaml::from_str::<Config>("chunk_store: {type: s3}").is_err());
        assert!(serde_yaml::from_str::<Config>("chunk_store: {type: filesystem}").is_err());
        assert!(serde_yaml::from_str::<Config>("listener: {host: 0.0.0.0, port: nope}").is_err());
        assert!(serde_yaml::from_str::<Config>("tokens: [{token: abc}]").is_err());
        assert!(serde_yaml::from_str::<Config>("status: {backend: {type: redis}}").is_err());
    }
}
