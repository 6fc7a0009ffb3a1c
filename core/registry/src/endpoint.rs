// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use url::{Url, form_urlencoded};

use crate::errors::RegistryError;

pub const APPLICATION_KEY: &str = "application";
pub const INTERFACE_KEY: &str = "interface";
pub const VERSION_KEY: &str = "version";
pub const GROUP_KEY: &str = "group";
pub const CATEGORY_KEY: &str = "category";
pub const CLASSIFIER_KEY: &str = "classifier";
pub const ENABLED_KEY: &str = "enabled";
pub const CHECK_KEY: &str = "check";
pub const TIMEOUT_KEY: &str = "timeout";
pub const RELEASE_KEY: &str = "release";
/// Version key used by providers released before the project moved to Apache
pub const LEGACY_VERSION_KEY: &str = "dubbo";

pub const PROVIDERS_CATEGORY: &str = "providers";
pub const EMPTY_PROTOCOL: &str = "empty";
pub const ANY_VALUE: &str = "*";

/// A provider (or registry, or consumer) address as published in a registry:
/// `protocol://[user[:password]@]host[:port]/path?key=value&...`
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServiceEndpoint {
    protocol: String,
    host: String,
    port: u16,
    path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    password: Option<String>,
    #[serde(default)]
    parameters: BTreeMap<String, String>,
}

impl ServiceEndpoint {
    pub fn new(protocol: &str, host: &str, port: u16, path: &str) -> Self {
        ServiceEndpoint {
            protocol: protocol.to_string(),
            host: host.to_string(),
            port,
            path: path.trim_start_matches('/').to_string(),
            username: None,
            password: None,
            parameters: BTreeMap::new(),
        }
    }

    pub fn parse(input: &str) -> Result<Self, RegistryError> {
        let input = input.trim();
        let url = Url::parse(input).map_err(|e| RegistryError::invalid_url(input, e.to_string()))?;

        let host = match url.host_str() {
            Some(h) if !h.is_empty() => h.to_string(),
            _ => return Err(RegistryError::invalid_url(input, "missing host")),
        };

        let username = match url.username() {
            "" => None,
            u => Some(u.to_string()),
        };

        let parameters = url
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();

        Ok(ServiceEndpoint {
            protocol: url.scheme().to_string(),
            host,
            port: url.port().unwrap_or(0),
            path: url.path().trim_start_matches('/').to_string(),
            username,
            password: url.password().map(|p| p.to_string()),
            parameters,
        })
    }

    pub fn with_parameter(mut self, key: &str, value: impl Into<String>) -> Self {
        self.parameters.insert(key.to_string(), value.into());
        self
    }

    pub fn with_credentials(self, username: Option<String>, password: Option<String>) -> Self {
        ServiceEndpoint {
            username: username.or(self.username),
            password: password.or(self.password),
            ..self
        }
    }

    pub fn with_port(self, port: u16) -> Self {
        ServiceEndpoint { port, ..self }
    }

    pub fn protocol(&self) -> &str {
        &self.protocol
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn username(&self) -> Option<&str> {
        self.username.as_deref()
    }

    pub fn password(&self) -> Option<&str> {
        self.password.as_deref()
    }

    pub fn parameters(&self) -> &BTreeMap<String, String> {
        &self.parameters
    }

    pub fn parameter(&self, key: &str) -> Option<&str> {
        self.parameters.get(key).map(|v| v.as_str())
    }

    pub fn parameter_or<'a>(&'a self, key: &str, default: &'a str) -> &'a str {
        self.parameter(key).unwrap_or(default)
    }

    pub fn has_parameter(&self, key: &str) -> bool {
        self.parameters.contains_key(key)
    }

    /// `host:port`, or only the host when no port is set
    pub fn address(&self) -> String {
        if self.port == 0 {
            self.host.clone()
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    pub fn application(&self) -> &str {
        self.parameter_or(APPLICATION_KEY, "")
    }

    pub fn interface_name(&self) -> &str {
        match self.parameter(INTERFACE_KEY) {
            Some(i) if !i.is_empty() => i,
            _ => &self.path,
        }
    }

    pub fn version(&self) -> &str {
        self.parameter_or(VERSION_KEY, "")
    }

    pub fn group(&self) -> Option<&str> {
        self.parameter(GROUP_KEY).filter(|g| !g.trim().is_empty())
    }

    pub fn category(&self) -> &str {
        self.parameter_or(CATEGORY_KEY, PROVIDERS_CATEGORY)
    }

    /// Release of the framework the provider runs, if it publishes it.
    pub fn release_version(&self) -> Option<&str> {
        self.parameter(RELEASE_KEY)
            .filter(|v| !v.is_empty())
            .or_else(|| self.parameter(LEGACY_VERSION_KEY).filter(|v| !v.is_empty()))
    }

    /// Marker meaning "no provider left for this interface".
    pub fn is_empty_marker(&self) -> bool {
        self.protocol.eq_ignore_ascii_case(EMPTY_PROTOCOL)
    }

    pub fn empty_marker(&self) -> ServiceEndpoint {
        let mut marker = ServiceEndpoint::new(EMPTY_PROTOCOL, &self.host, 0, self.interface_name())
            .with_parameter(INTERFACE_KEY, self.interface_name())
            .with_parameter(CATEGORY_KEY, self.category());
        if let Some(group) = self.group() {
            marker = marker.with_parameter(GROUP_KEY, group);
        }
        if !self.version().is_empty() {
            marker = marker.with_parameter(VERSION_KEY, self.version());
        }
        marker
    }

    /// Same provider instance of the same service, regardless of volatile
    /// parameters such as timestamps.
    pub fn same_instance(&self, other: &ServiceEndpoint) -> bool {
        self.address() == other.address()
            && self.interface_name() == other.interface_name()
            && self.group() == other.group()
            && self.version() == other.version()
    }

    /// Whether this provider endpoint satisfies a consumer subscription.
    pub fn is_match(&self, consumer: &ServiceEndpoint) -> bool {
        let wanted = consumer.interface_name();
        if wanted != ANY_VALUE && wanted != self.interface_name() {
            return false;
        }

        let categories = consumer.category();
        if !categories.split(',').any(|c| c.trim() == self.category()) {
            return false;
        }

        if consumer.parameter(ENABLED_KEY) != Some(ANY_VALUE)
            && self.parameter(ENABLED_KEY) == Some("false")
        {
            return false;
        }

        let group_ok = match consumer.parameter(GROUP_KEY) {
            None | Some(ANY_VALUE) => true,
            Some(g) => self.group() == Some(g),
        };
        let version_ok = match consumer.parameter(VERSION_KEY) {
            None | Some(ANY_VALUE) => true,
            Some(v) => self.version() == v,
        };

        group_ok && version_ok
    }
}

impl fmt::Display for ServiceEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://", self.protocol)?;
        if let Some(user) = &self.username {
            write!(f, "{}", user)?;
            if let Some(password) = &self.password {
                write!(f, ":{}", password)?;
            }
            write!(f, "@")?;
        }
        write!(f, "{}", self.address())?;
        if !self.path.is_empty() {
            write!(f, "/{}", self.path)?;
        }
        if !self.parameters.is_empty() {
            // same encoding `parse` decodes through `query_pairs`
            let query = form_urlencoded::Serializer::new(String::new())
                .extend_pairs(&self.parameters)
                .finish();
            write!(f, "?{}", query)?;
        }
        Ok(())
    }
}

impl FromStr for ServiceEndpoint {
    type Err = RegistryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ServiceEndpoint::parse(s)
    }
}

/// Reduce a user supplied provider address (`host:port` or a full url) to
/// `host:port`.
pub fn provider_address(input: &str) -> Result<String, RegistryError> {
    let input = input.trim();
    if input.contains("://") {
        let endpoint = ServiceEndpoint::parse(input)?;
        if endpoint.port() == 0 {
            return Err(RegistryError::invalid_url(input, "missing port"));
        }
        return Ok(endpoint.address());
    }

    match input.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() && port.parse::<u16>().is_ok() => {
            Ok(input.to_string())
        }
        _ => Err(RegistryError::invalid_url(input, "expected host:port")),
    }
}
