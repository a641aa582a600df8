//! Configuration management
//!
//! Supports loading configuration from:
//! - Default values
//! - Config file (schema-refs.toml)
//! - Environment variables (SCHEMA_REFS__*)
//! - `SCHEMA_REGISTRY_URL` and `SCHEMA_REGISTRY_BASIC_AUTH_USER_INFO` (`user:password`)
//!
//! ## Example config file (schema-refs.toml):
//! ```toml
//! [registry]
//! url = "http://localhost:8081"
//! request_timeout_ms = 10000
//! max_retries = 5
//!
//! [split]
//! policy = "shared"
//! extract = ["com.example.types.Customer"]
//! min_size = 0
//! subject_prefix = "shop-"
//!
//! [resolver]
//! resolve_timeout_ms = 30000
//! ```

use config_crate::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{Result, SchemaError};
use crate::registry::http::RetryPolicy;
use crate::split::SplitOptions;

/// Main configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SchemaRefsConfig {
    /// Registry connection settings
    #[serde(default)]
    pub registry: RegistryConfig,

    /// Splitter settings
    #[serde(default)]
    pub split: SplitOptions,

    /// Resolver settings
    #[serde(default)]
    pub resolver: ResolverConfig,
}

/// Registry connection configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// Base URL of the registry
    #[serde(default = "default_url")]
    pub url: String,

    #[serde(default)]
    pub username: Option<String>,

    #[serde(default)]
    pub password: Option<String>,

    /// Registry context; every path becomes `/contexts/{context}/...`
    #[serde(default)]
    pub context: Option<String>,

    /// Per-call timeout
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    /// Retries after the first attempt for transient failures
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,

    /// Retry registration POSTs too
    #[serde(default = "default_true")]
    pub retry_writes: bool,
}

/// Resolver configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResolverConfig {
    /// Upper bound on one `resolve` call, as seen by that caller
    #[serde(default)]
    pub resolve_timeout_ms: Option<u64>,
}

// Default value functions
fn default_url() -> String {
    "http://localhost:8081".to_string()
}

fn default_request_timeout_ms() -> u64 {
    30_000
}

fn default_max_retries() -> u32 {
    3
}

fn default_initial_backoff_ms() -> u64 {
    100
}

fn default_max_backoff_ms() -> u64 {
    5_000
}

fn default_true() -> bool {
    true
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            url: default_url(),
            username: None,
            password: None,
            context: None,
            request_timeout_ms: default_request_timeout_ms(),
            max_retries: default_max_retries(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            retry_writes: true,
        }
    }
}

impl RegistryConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            initial_backoff: Duration::from_millis(self.initial_backoff_ms),
            max_backoff: Duration::from_millis(self.max_backoff_ms),
            retry_writes: self.retry_writes,
        }
    }
}

impl ResolverConfig {
    pub fn resolve_timeout(&self) -> Option<Duration> {
        self.resolve_timeout_ms.map(Duration::from_millis)
    }
}

/// Split `user:password` as found in `SCHEMA_REGISTRY_BASIC_AUTH_USER_INFO`
fn split_user_info(user_info: &str) -> (String, Option<String>) {
    match user_info.split_once(':') {
        Some((user, password)) => (user.to_string(), Some(password.to_string())),
        None => (user_info.to_string(), None),
    }
}

impl SchemaRefsConfig {
    /// Load configuration from default locations
    pub fn load() -> Result<Self> {
        Self::load_from(None)
    }

    /// Load configuration, adding a required file at `config_path`
    pub fn load_from(config_path: Option<&str>) -> Result<Self> {
        let mut builder = Config::builder();

        let config_locations = ["schema-refs.toml", ".schema-refs.toml", "config/schema-refs.toml"];
        for location in config_locations {
            builder = builder.add_source(File::with_name(location).required(false));
        }

        // XDG config directory
        if let Some(config_dir) = directories::ProjectDirs::from("dev", "schema-refs", "schema-refs") {
            let xdg_config = config_dir.config_dir().join("schema-refs.toml");
            if xdg_config.exists() {
                builder = builder.add_source(File::from(xdg_config).required(false));
            }
        }

        if let Some(path) = config_path {
            builder = builder.add_source(File::with_name(path).required(true));
        }

        builder = builder.add_source(
            Environment::with_prefix("SCHEMA_REFS")
                .separator("__")
                .try_parsing(true),
        );

        // Variables shared with other registry tooling
        builder = builder.set_override_option("registry.url", std::env::var("SCHEMA_REGISTRY_URL").ok())?;
        if let Ok(user_info) = std::env::var("SCHEMA_REGISTRY_BASIC_AUTH_USER_INFO") {
            let (user, password) = split_user_info(&user_info);
            builder = builder
                .set_override("registry.username", user)?
                .set_override_option("registry.password", password)?;
        }

        let config = builder.build()?;
        Ok(config.try_deserialize()?)
    }

    /// Save configuration to a file
    pub fn save(&self, path: &str) -> Result<()> {
        let content = toml::to_string_pretty(self).map_err(|e| SchemaError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::split::ExtractionPolicy;

    #[test]
    fn test_default_config() {
        let config = SchemaRefsConfig::default();
        assert_eq!(config.registry.url, "http://localhost:8081");
        assert_eq!(config.registry.request_timeout(), Duration::from_secs(30));
        assert!(config.registry.retry_writes);
        assert_eq!(config.split.policy, ExtractionPolicy::Shared);
        assert!(config.resolver.resolve_timeout().is_none());
    }

    #[test]
    fn test_serialize_config() {
        let config = SchemaRefsConfig::default();
        let toml_str = toml::to_string_pretty(&config).unwrap();
        assert!(toml_str.contains("[registry]"));
        assert!(toml_str.contains("[split]"));
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let parsed: SchemaRefsConfig = toml::from_str(
            r#"
            [registry]
            url = "http://registry:8081"
            max_retries = 7

            [split]
            policy = "all"
            extract = ["com.example.types.Money"]
            "#,
        )
        .unwrap();
        assert_eq!(parsed.registry.max_retries, 7);
        assert_eq!(parsed.registry.initial_backoff_ms, 100);
        assert_eq!(parsed.split.policy, ExtractionPolicy::All);
        assert!(parsed.split.extract.contains("com.example.types.Money"));
        assert_eq!(parsed.registry.retry_policy().max_retries, 7);
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("custom.toml");
        std::fs::write(&path, "[resolver]\nresolve_timeout_ms = 2500\n").unwrap();
        let config = SchemaRefsConfig::load_from(Some(path.to_str().unwrap())).unwrap();
        assert_eq!(config.resolver.resolve_timeout(), Some(Duration::from_millis(2500)));
    }

    #[test]
    fn test_save_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("saved.toml");
        let mut config = SchemaRefsConfig::default();
        config.registry.context = Some("staging".to_string());
        config.save(path.to_str().unwrap()).unwrap();
        let loaded: SchemaRefsConfig = toml::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_user_info() {
        assert_eq!(
            split_user_info("alice:s3cr:et"),
            ("alice".to_string(), Some("s3cr:et".to_string()))
        );
        assert_eq!(split_user_info("bob"), ("bob".to_string(), None));
    }
}
