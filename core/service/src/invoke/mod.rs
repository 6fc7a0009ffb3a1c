// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0

pub mod engine;
pub mod pool;

use std::collections::HashMap;

use probe_registry::method::method_key;
use probe_registry::{InvocationError, RpcResponse};
use serde::{Deserialize, Serialize};

pub use engine::{ConcurrentInvocation, EngineOptions, InvocationEngine};
pub use pool::{PoolCache, WorkerPool};

/// One argument of a generic call.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Parameter {
    pub type_name: String,
    pub value: serde_json::Value,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct InvocationRequest {
    pub app_name: String,
    pub interface_name: String,
    pub method_name: String,
    #[serde(default)]
    pub parameters: Vec<Parameter>,
    #[serde(default)]
    pub version: String,
    /// Explicit provider (`host:port`), bypassing provider selection
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default)]
    pub group: Option<String>,
}

impl InvocationRequest {
    pub fn new(app_name: &str, interface_name: &str, method_name: &str, version: &str) -> Self {
        InvocationRequest {
            app_name: app_name.to_string(),
            interface_name: interface_name.to_string(),
            method_name: method_name.to_string(),
            version: version.to_string(),
            ..Default::default()
        }
    }

    pub fn with_parameter(mut self, type_name: &str, value: serde_json::Value) -> Self {
        self.parameters.push(Parameter {
            type_name: type_name.to_string(),
            value,
        });
        self
    }

    pub fn with_provider(self, provider: Option<String>) -> Self {
        InvocationRequest { provider, ..self }
    }

    pub fn with_group(self, group: Option<String>) -> Self {
        InvocationRequest { group, ..self }
    }

    pub fn parameter_types(&self) -> Vec<String> {
        self.parameters.iter().map(|p| p.type_name.clone()).collect()
    }

    pub fn arguments(&self) -> Vec<serde_json::Value> {
        self.parameters.iter().map(|p| p.value.clone()).collect()
    }

    pub fn method_key(&self) -> String {
        method_key(&self.method_name, &self.parameter_types())
    }
}

/// Outcome of one call. Failures are carried as data.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct InvocationResult {
    pub data: Option<serde_json::Value>,
    pub attachments: HashMap<String, String>,
    pub exception: Option<InvocationError>,
}

impl InvocationResult {
    pub fn failed(error: InvocationError) -> Self {
        InvocationResult {
            exception: Some(error),
            ..Default::default()
        }
    }

    pub fn is_success(&self) -> bool {
        self.exception.is_none()
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self.exception, Some(InvocationError::Cancelled))
    }
}

impl From<Result<RpcResponse, InvocationError>> for InvocationResult {
    fn from(res: Result<RpcResponse, InvocationError>) -> Self {
        match res {
            Ok(response) => InvocationResult {
                data: response.value,
                attachments: response.attachments,
                exception: None,
            },
            Err(e) => InvocationResult::failed(e),
        }
    }
}

/// Fan out of a call: `invocation_count` calls over `worker_group_size`
/// workers. [`ConcurrentSpec::NONE`] requests a plain single call.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ConcurrentSpec {
    invocation_count: usize,
    worker_group_size: usize,
    single: bool,
}

impl ConcurrentSpec {
    pub const NONE: ConcurrentSpec = ConcurrentSpec {
        invocation_count: 1,
        worker_group_size: 1,
        single: true,
    };

    /// Both values are raised to at least one.
    pub fn new(invocation_count: usize, worker_group_size: usize) -> Self {
        ConcurrentSpec {
            invocation_count: invocation_count.max(1),
            worker_group_size: worker_group_size.max(1),
            single: false,
        }
    }

    pub fn is_none(&self) -> bool {
        self.single
    }

    pub fn invocation_count(&self) -> usize {
        self.invocation_count
    }

    pub fn worker_group_size(&self) -> usize {
        self.worker_group_size
    }
}

impl Default for ConcurrentSpec {
    fn default() -> Self {
        ConcurrentSpec::NONE
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request() {
        let req = InvocationRequest::new("A", "org.demo.Echo", "echo", "1.0")
            .with_parameter("java.lang.String", json!("hi"))
            .with_parameter("java.lang.Integer", json!(3));
        assert_eq!(req.parameter_types(), vec!["java.lang.String", "java.lang.Integer"]);
        assert_eq!(req.arguments(), vec![json!("hi"), json!(3)]);
        assert_eq!(req.method_key(), "echo(String,int)");
    }

    #[test]
    fn test_result_from_response() {
        let ok: InvocationResult =
            Ok(RpcResponse::new(Some(json!(1))).with_attachment("k", "v")).into();
        assert!(ok.is_success());
        assert_eq!(ok.data, Some(json!(1)));
        assert_eq!(ok.attachments.get("k").map(String::as_str), Some("v"));

        let err: InvocationResult = Err(InvocationError::Cancelled).into();
        assert!(!err.is_success());
        assert!(err.is_cancelled());
    }

    #[test]
    fn test_concurrent_spec() {
        assert!(ConcurrentSpec::NONE.is_none());
        assert!(ConcurrentSpec::default().is_none());

        let one = ConcurrentSpec::new(1, 1);
        assert!(!one.is_none());
        assert_ne!(one, ConcurrentSpec::NONE);

        let clamped = ConcurrentSpec::new(0, 0);
        assert_eq!(clamped.invocation_count(), 1);
        assert_eq!(clamped.worker_group_size(), 1);
    }
}
