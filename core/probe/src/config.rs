// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0
//
// ConfigLoader reads the configuration file once, resolves placeholders and
// exposes cached accessors for the tracing, runtime and client sections.
// Missing sections fall back to their defaults.

use std::collections::HashSet;

use lazy_static::lazy_static;
use serde::de::DeserializeOwned;
use serde_yaml::{Mapping, Value, from_str};
use thiserror::Error;
use tracing::{debug, warn};

use crate::runtime::RuntimeConfiguration;
use probe_config::configuration::Configuration;
use probe_config::provider::ConfigResolver;
use probe_service::ClientConfiguration;
use probe_tracing::TracingConfiguration;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("invalid configuration - impossible to parse yaml")]
    InvalidYaml,
    #[error("invalid configuration - key {0} not valid")]
    InvalidKey(String),
    #[error("invalid configuration: {0}")]
    Invalid(String),
    #[error("yaml parse error: {0}")]
    YamlError(#[from] serde_yaml::Error),
    #[error("invalid configuration - unable to resolve value: {0}")]
    ResolverError(String),
}

lazy_static! {
    static ref CONFIG_KEYS: HashSet<&'static str> = {
        let mut s = HashSet::new();
        s.insert("tracing");
        s.insert("runtime");
        s.insert("client");
        s
    };
}

pub struct ConfigLoader {
    root: Value,
    tracing: Option<TracingConfiguration>,
    runtime: Option<RuntimeConfiguration>,
    client: Option<ClientConfiguration>,
}

impl std::fmt::Debug for ConfigLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let root_keys = self
            .root
            .as_mapping()
            .map(|m| {
                m.keys()
                    .filter_map(|k| k.as_str())
                    .map(|s| s.to_string())
                    .collect::<Vec<String>>()
            })
            .unwrap_or_default();

        f.debug_struct("ConfigLoader")
            .field("root_keys", &root_keys)
            .field("tracing_loaded", &self.tracing.is_some())
            .field("runtime_loaded", &self.runtime.is_some())
            .field("client_loaded", &self.client.is_some())
            .finish()
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        ConfigLoader {
            root: Value::Mapping(Mapping::new()),
            tracing: None,
            runtime: None,
            client: None,
        }
    }
}

impl ConfigLoader {
    pub fn new(file_path: &str) -> Result<Self, ConfigError> {
        let config_str =
            std::fs::read_to_string(file_path).map_err(|e| ConfigError::NotFound(e.to_string()))?;
        Self::from_yaml(&config_str)
    }

    pub fn from_yaml(config_str: &str) -> Result<Self, ConfigError> {
        let mut root: Value = from_str(config_str).map_err(|_| ConfigError::InvalidYaml)?;

        // an empty document is an empty configuration
        if root.is_null() {
            root = Value::Mapping(Mapping::new());
        }

        let mapping = root.as_mapping().ok_or(ConfigError::InvalidYaml)?;
        for key in mapping.keys() {
            let k = key.as_str().ok_or(ConfigError::InvalidYaml)?;
            if !CONFIG_KEYS.contains(k) {
                return Err(ConfigError::InvalidKey(k.to_string()));
            }
        }

        ConfigResolver::new()
            .resolve(&mut root)
            .map_err(|e| ConfigError::ResolverError(e.to_string()))?;

        Ok(Self {
            root,
            ..Default::default()
        })
    }

    fn section<T>(&self, key: &str) -> T
    where
        T: DeserializeOwned + Default + std::fmt::Debug,
    {
        let cfg = self
            .root
            .get(key)
            .cloned()
            .map(|v| {
                serde_yaml::from_value(v).unwrap_or_else(|e| {
                    warn!(error = ?e, section = key, "invalid configuration, falling back to default");
                    T::default()
                })
            })
            .unwrap_or_default();
        debug!(?cfg, section = key, "configuration loaded");
        cfg
    }

    pub fn tracing(&mut self) -> &TracingConfiguration {
        if self.tracing.is_none() {
            self.tracing = Some(self.section("tracing"));
        }
        self.tracing.get_or_insert_with(TracingConfiguration::default)
    }

    pub fn runtime(&mut self) -> &RuntimeConfiguration {
        if self.runtime.is_none() {
            self.runtime = Some(self.section("runtime"));
        }
        self.runtime.get_or_insert_with(RuntimeConfiguration::default)
    }

    /// The client section, strictly parsed and validated.
    pub fn client(&mut self) -> Result<&ClientConfiguration, ConfigError> {
        if self.client.is_none() {
            let cfg: ClientConfiguration = match self.root.get("client") {
                Some(v) => serde_yaml::from_value(v.clone())?,
                None => ClientConfiguration::default(),
            };

            cfg.validate().map_err(|e| {
                debug!(error = ?e, "client configuration validation failed");
                ConfigError::Invalid(e.to_string())
            })?;
            debug!(registries = cfg.registries().len(), "client configuration loaded");
            self.client = Some(cfg);
        }
        Ok(self.client.get_or_insert_with(ClientConfiguration::default))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tracing_test::traced_test;

    fn testdata_path() -> String {
        concat!(env!("CARGO_MANIFEST_DIR"), "/testdata").to_string()
    }

    #[test]
    #[traced_test]
    fn test_full_config() {
        let path = format!("{}/config.yaml", testdata_path());
        let mut loader = ConfigLoader::new(&path).expect("loader init should succeed");

        assert_eq!(loader.tracing().log_level(), "debug");
        assert_eq!(loader.runtime().worker_threads(), 2);
        assert_eq!(loader.runtime().drain_timeout(), Duration::from_secs(5));

        let client = loader.client().expect("client section should load");
        assert_eq!(client.registries().len(), 2);
        assert_eq!(client.connect_timeout(), Duration::from_secs(10));
        assert_eq!(client.executor().batch_timeout, Duration::from_secs(120));
    }

    #[test]
    #[traced_test]
    fn test_empty_config() {
        let path = format!("{}/config-empty.yaml", testdata_path());
        let mut loader = ConfigLoader::new(&path).unwrap();

        assert_eq!(loader.tracing(), &TracingConfiguration::default());
        assert_eq!(loader.runtime(), &RuntimeConfiguration::default());
        assert_eq!(loader.client().unwrap(), &ClientConfiguration::default());
    }

    #[test]
    fn test_unknown_key() {
        let path = format!("{}/config-invalid-key.yaml", testdata_path());
        let res = ConfigLoader::new(&path);
        assert!(matches!(res, Err(ConfigError::InvalidKey(k)) if k == "services"));
    }

    #[test]
    fn test_missing_file() {
        let res = ConfigLoader::new("/does/not/exist.yaml");
        assert!(matches!(res, Err(ConfigError::NotFound(_))));
    }

    #[test]
    #[traced_test]
    fn test_invalid_client_section() {
        let path = format!("{}/config-invalid-client.yaml", testdata_path());
        let mut loader = ConfigLoader::new(&path).unwrap();

        // other sections stay usable
        let _ = loader.tracing();
        assert!(matches!(loader.client(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_unknown_client_field() {
        let mut loader = ConfigLoader::from_yaml("client:\n  retries: 3\n").unwrap();
        assert!(matches!(loader.client(), Err(ConfigError::YamlError(_))));
    }

    #[test]
    fn test_placeholders_are_resolved() {
        // SAFETY: the variable is only read by this test
        unsafe {
            std::env::set_var("DUBBO_PROBE_TEST_REGISTRY_PASSWORD", "s3cret");
        }
        let yaml = r#"
client:
  registries:
    - address: zookeeper://127.0.0.1:2181
      username: admin
      password: ${env:DUBBO_PROBE_TEST_REGISTRY_PASSWORD}
"#;
        let mut loader = ConfigLoader::from_yaml(yaml).unwrap();
        let client = loader.client().unwrap();
        assert_eq!(
            client.registries()[0].password.as_deref(),
            Some("s3cret")
        );

        let res = ConfigLoader::from_yaml("client:\n  connect_timeout: ${env:DUBBO_PROBE_UNSET_VAR}\n");
        assert!(matches!(res, Err(ConfigError::ResolverError(_))));
    }
}
