// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::endpoint::ServiceEndpoint;

/// Failure of a single generic call. Always returned as data inside the
/// invocation result, never raised to the caller of a batch.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum InvocationError {
    #[error("registry not connected: {0}")]
    NotConnected(String),
    #[error("no provider available for {0}")]
    NoProvider(String),
    #[error("unable to create reference: {0}")]
    Reference(String),
    #[error("rpc error: {0}")]
    Rpc(String),
    #[error("invocation cancelled")]
    Cancelled,
    #[error("invocation timed out after {0:?}")]
    Timeout(Duration),
}

/// Outcome of a successful generic call.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RpcResponse {
    pub value: Option<serde_json::Value>,
    #[serde(default)]
    pub attachments: HashMap<String, String>,
}

impl RpcResponse {
    pub fn new(value: Option<serde_json::Value>) -> Self {
        RpcResponse {
            value,
            attachments: HashMap::new(),
        }
    }

    pub fn with_attachment(mut self, key: &str, value: &str) -> Self {
        self.attachments.insert(key.to_string(), value.to_string());
        self
    }
}

/// What a reference is bound to: one interface/version/group, optionally a
/// fixed provider, plus the providers currently known for it.
#[derive(Clone, Debug, Default)]
pub struct ReferenceSpec {
    interface_name: String,
    version: String,
    group: Option<String>,
    provider: Option<String>,
    candidates: Vec<ServiceEndpoint>,
}

impl ReferenceSpec {
    pub fn new(interface_name: &str, version: &str) -> Self {
        ReferenceSpec {
            interface_name: interface_name.to_string(),
            version: version.to_string(),
            ..Default::default()
        }
    }

    pub fn with_group(mut self, group: Option<String>) -> Self {
        self.group = group.filter(|g| !g.trim().is_empty());
        self
    }

    /// Pin the reference to `host:port`
    pub fn with_provider(mut self, provider: Option<String>) -> Self {
        self.provider = provider.filter(|p| !p.trim().is_empty());
        self
    }

    pub fn with_candidates(mut self, candidates: Vec<ServiceEndpoint>) -> Self {
        self.candidates = candidates;
        self
    }

    pub fn interface_name(&self) -> &str {
        &self.interface_name
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn group(&self) -> Option<&str> {
        self.group.as_deref()
    }

    pub fn provider(&self) -> Option<&str> {
        self.provider.as_deref()
    }

    /// Known providers serving this interface, version and group.
    pub fn matching_candidates(&self) -> Vec<&ServiceEndpoint> {
        self.candidates
            .iter()
            .filter(|e| !e.is_empty_marker())
            .filter(|e| e.interface_name() == self.interface_name)
            .filter(|e| self.version.is_empty() || e.version() == self.version)
            .filter(|e| self.group.is_none() || e.group() == self.group.as_deref())
            .collect()
    }
}

impl std::fmt::Display for ReferenceSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let Some(group) = &self.group {
            write!(f, "{}/", group)?;
        }
        write!(f, "{}", self.interface_name)?;
        if !self.version.is_empty() {
            write!(f, ":{}", self.version)?;
        }
        Ok(())
    }
}

/// Handle able to perform generic calls on one service.
#[async_trait]
pub trait GenericReference: Send + Sync {
    async fn invoke(
        &self,
        method: &str,
        parameter_types: &[String],
        args: &[serde_json::Value],
    ) -> Result<RpcResponse, InvocationError>;

    /// Release the resources held by the reference. Called once.
    async fn destroy(&self);
}

#[async_trait]
pub trait ReferenceFactory: Send + Sync {
    async fn refer(
        &self,
        spec: &ReferenceSpec,
    ) -> Result<std::sync::Arc<dyn GenericReference>, InvocationError>;
}
