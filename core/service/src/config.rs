// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0

use std::time::Duration;

use duration_str::deserialize_duration;
use probe_config::configuration::{Configuration, ConfigurationError};
use probe_registry::ServiceEndpoint;
use probe_telnet::TelnetOptions;
use serde::Deserialize;

fn default_connect_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_command_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_connect_wait() -> Duration {
    Duration::from_secs(3)
}

fn default_batch_timeout() -> Duration {
    Duration::from_secs(5 * 60)
}

fn default_pool_idle_timeout() -> Duration {
    Duration::from_secs(5 * 60)
}

fn default_sweep_interval() -> Duration {
    Duration::from_secs(5 * 60)
}

fn default_result_buffer() -> usize {
    64
}

fn default_max_entries() -> usize {
    20
}

/// A registry known to the client, with optional credentials.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct RegistryAddress {
    pub address: String,

    #[serde(default)]
    pub username: Option<String>,

    #[serde(default)]
    pub password: Option<String>,
}

impl RegistryAddress {
    pub fn new(address: &str) -> Self {
        RegistryAddress {
            address: address.to_string(),
            username: None,
            password: None,
        }
    }

    pub fn with_credentials(self, username: &str, password: &str) -> Self {
        RegistryAddress {
            username: Some(username.to_string()),
            password: Some(password.to_string()),
            ..self
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct IntrospectionConfig {
    /// Round trip bound of a telnet command
    #[serde(
        default = "default_command_timeout",
        deserialize_with = "deserialize_duration"
    )]
    pub command_timeout: Duration,

    /// How long an introspection waits for the provider connection
    #[serde(
        default = "default_connect_wait",
        deserialize_with = "deserialize_duration"
    )]
    pub connect_wait: Duration,
}

impl Default for IntrospectionConfig {
    fn default() -> Self {
        IntrospectionConfig {
            command_timeout: default_command_timeout(),
            connect_wait: default_connect_wait(),
        }
    }
}

impl IntrospectionConfig {
    pub fn telnet_options(&self) -> TelnetOptions {
        TelnetOptions {
            command_timeout: self.command_timeout,
            connect_wait: self.connect_wait,
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ExecutorConfig {
    /// Upper bound of a concurrent batch
    #[serde(
        default = "default_batch_timeout",
        deserialize_with = "deserialize_duration"
    )]
    pub batch_timeout: Duration,

    /// Worker pools unused for longer are shut down
    #[serde(
        default = "default_pool_idle_timeout",
        deserialize_with = "deserialize_duration"
    )]
    pub pool_idle_timeout: Duration,

    #[serde(
        default = "default_sweep_interval",
        deserialize_with = "deserialize_duration"
    )]
    pub sweep_interval: Duration,

    /// Results buffered for the consumer of a batch
    #[serde(default = "default_result_buffer")]
    pub result_buffer: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        ExecutorConfig {
            batch_timeout: default_batch_timeout(),
            pool_idle_timeout: default_pool_idle_timeout(),
            sweep_interval: default_sweep_interval(),
            result_buffer: default_result_buffer(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct HistoryConfig {
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        HistoryConfig {
            max_entries: default_max_entries(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ClientConfiguration {
    /// Known registries
    #[serde(default)]
    registries: Vec<RegistryAddress>,

    /// Bound of registry connect and subscribe. A `timeout` parameter (ms) on
    /// the registry address takes precedence.
    #[serde(
        default = "default_connect_timeout",
        deserialize_with = "deserialize_duration"
    )]
    connect_timeout: Duration,

    #[serde(default)]
    introspection: IntrospectionConfig,

    #[serde(default)]
    executor: ExecutorConfig,

    #[serde(default)]
    history: HistoryConfig,
}

impl Default for ClientConfiguration {
    fn default() -> Self {
        ClientConfiguration {
            registries: vec![],
            connect_timeout: default_connect_timeout(),
            introspection: IntrospectionConfig::default(),
            executor: ExecutorConfig::default(),
            history: HistoryConfig::default(),
        }
    }
}

impl ClientConfiguration {
    pub fn new() -> Self {
        ClientConfiguration::default()
    }

    pub fn with_registries(self, registries: Vec<RegistryAddress>) -> Self {
        ClientConfiguration { registries, ..self }
    }

    pub fn with_connect_timeout(self, connect_timeout: Duration) -> Self {
        ClientConfiguration {
            connect_timeout,
            ..self
        }
    }

    pub fn with_introspection(self, introspection: IntrospectionConfig) -> Self {
        ClientConfiguration {
            introspection,
            ..self
        }
    }

    pub fn with_executor(self, executor: ExecutorConfig) -> Self {
        ClientConfiguration { executor, ..self }
    }

    pub fn with_history(self, history: HistoryConfig) -> Self {
        ClientConfiguration { history, ..self }
    }

    pub fn registries(&self) -> &[RegistryAddress] {
        &self.registries
    }

    pub fn registry(&self, address: &str) -> Option<&RegistryAddress> {
        self.registries.iter().find(|r| r.address == address)
    }

    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    pub fn introspection(&self) -> &IntrospectionConfig {
        &self.introspection
    }

    pub fn executor(&self) -> &ExecutorConfig {
        &self.executor
    }

    pub fn history(&self) -> &HistoryConfig {
        &self.history
    }
}

fn non_zero(field: &str, d: Duration) -> Result<(), ConfigurationError> {
    if d.is_zero() {
        return Err(ConfigurationError::invalid(field, "must be greater than zero"));
    }
    Ok(())
}

impl Configuration for ClientConfiguration {
    fn validate(&self) -> Result<(), ConfigurationError> {
        for r in &self.registries {
            ServiceEndpoint::parse(&r.address)
                .map_err(|e| ConfigurationError::invalid("registries.address", e.to_string()))?;
        }

        non_zero("connect_timeout", self.connect_timeout)?;
        non_zero(
            "introspection.command_timeout",
            self.introspection.command_timeout,
        )?;
        non_zero("introspection.connect_wait", self.introspection.connect_wait)?;
        non_zero("executor.batch_timeout", self.executor.batch_timeout)?;
        non_zero("executor.pool_idle_timeout", self.executor.pool_idle_timeout)?;
        non_zero("executor.sweep_interval", self.executor.sweep_interval)?;

        if self.executor.result_buffer == 0 {
            return Err(ConfigurationError::invalid(
                "executor.result_buffer",
                "must be greater than zero",
            ));
        }
        if self.history.max_entries == 0 {
            return Err(ConfigurationError::invalid(
                "history.max_entries",
                "must be greater than zero",
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config: ClientConfiguration = serde_yaml::from_str("{}").unwrap();
        assert_eq!(config, ClientConfiguration::default());
        assert_eq!(config.connect_timeout(), Duration::from_secs(30));
        assert_eq!(config.introspection().command_timeout, Duration::from_secs(5));
        assert_eq!(config.introspection().connect_wait, Duration::from_secs(3));
        assert_eq!(config.executor().batch_timeout, Duration::from_secs(300));
        assert_eq!(config.executor().result_buffer, 64);
        assert_eq!(config.history().max_entries, 20);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_full_configuration() {
        let yaml = r#"
registries:
  - address: zookeeper://127.0.0.1:2181
    username: admin
    password: secret
  - address: multicast://224.5.6.7:1234
connect_timeout: 10s
introspection:
  command_timeout: 2s
  connect_wait: 500ms
executor:
  batch_timeout: 1m
  pool_idle_timeout: 30s
  sweep_interval: 10s
  result_buffer: 8
history:
  max_entries: 5
"#;
        let config: ClientConfiguration = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.registries().len(), 2);
        assert_eq!(
            config.registry("zookeeper://127.0.0.1:2181"),
            Some(&RegistryAddress::new("zookeeper://127.0.0.1:2181").with_credentials("admin", "secret"))
        );
        assert_eq!(config.connect_timeout(), Duration::from_secs(10));
        assert_eq!(
            config.introspection().telnet_options().connect_wait,
            Duration::from_millis(500)
        );
        assert_eq!(config.executor().pool_idle_timeout, Duration::from_secs(30));
        assert_eq!(config.history().max_entries, 5);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_unknown_field_rejected() {
        let res: Result<ClientConfiguration, _> = serde_yaml::from_str("retries: 3");
        assert!(res.is_err());
    }

    #[test]
    fn test_validation() {
        let config = ClientConfiguration::new().with_connect_timeout(Duration::ZERO);
        assert_eq!(
            config.validate(),
            Err(ConfigurationError::invalid(
                "connect_timeout",
                "must be greater than zero"
            ))
        );

        let config = ClientConfiguration::new().with_executor(ExecutorConfig {
            result_buffer: 0,
            ..Default::default()
        });
        assert!(config.validate().is_err());

        let config = ClientConfiguration::new().with_history(HistoryConfig { max_entries: 0 });
        assert!(config.validate().is_err());

        let config =
            ClientConfiguration::new().with_registries(vec![RegistryAddress::new("not an address")]);
        assert!(matches!(
            config.validate(),
            Err(ConfigurationError::InvalidValue { field, .. }) if field == "registries.address"
        ));
    }
}
