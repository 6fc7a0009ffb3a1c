// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0

use std::collections::VecDeque;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use twox_hash::XxHash64;

use crate::invoke::{InvocationRequest, Parameter};

/// Key of the calls of one method of one service version.
pub fn history_key(app: &str, iface: &str, method_key: &str, version: &str) -> u64 {
    let input = format!("{}{}{}{}", app, iface, method_key, version);
    XxHash64::oneshot(0, input.as_bytes())
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub key: u64,
    pub method_key: String,
    pub parameters: Vec<Parameter>,
    /// Milliseconds since the unix epoch
    pub timestamp: u64,
}

/// Last invocations, oldest evicted first.
#[derive(Clone, Debug)]
pub struct InvocationHistory {
    max_entries: usize,
    entries: VecDeque<HistoryEntry>,
}

impl InvocationHistory {
    pub fn new(max_entries: usize) -> Self {
        InvocationHistory {
            max_entries: max_entries.max(1),
            entries: VecDeque::new(),
        }
    }

    pub fn record(&mut self, request: &InvocationRequest) {
        let method_key = request.method_key();
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default();

        self.push(HistoryEntry {
            key: history_key(
                &request.app_name,
                &request.interface_name,
                &method_key,
                &request.version,
            ),
            method_key,
            parameters: request.parameters.clone(),
            timestamp,
        });
    }

    fn push(&mut self, entry: HistoryEntry) {
        self.entries.push_back(entry);
        while self.entries.len() > self.max_entries {
            self.entries.pop_front();
        }
    }

    /// Newest entry recorded for the given method.
    pub fn last_for(
        &self,
        app: &str,
        iface: &str,
        method_key: &str,
        version: &str,
    ) -> Option<&HistoryEntry> {
        let key = history_key(app, iface, method_key, version);
        self.entries.iter().rev().find(|e| e.key == key)
    }

    pub fn entries(&self) -> impl Iterator<Item = &HistoryEntry> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Replace the content, keeping the newest entries that fit.
    pub fn restore(&mut self, entries: Vec<HistoryEntry>) {
        self.entries.clear();
        for e in entries {
            self.push(e);
        }
    }
}

/// A registry as remembered between sessions.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryInfo {
    pub address: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

/// Everything the client hands over to persistence.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ClientSnapshot {
    #[serde(default)]
    pub registries: Vec<RegistryInfo>,
    #[serde(default)]
    pub last_registry: Option<String>,
    #[serde(default)]
    pub history: Vec<HistoryEntry>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn request(name: &str) -> InvocationRequest {
        InvocationRequest::new("A", "org.demo.Echo", "echo", "1.0")
            .with_parameter("java.lang.String", json!(name))
    }

    #[test]
    fn test_key_is_stable() {
        let a = history_key("A", "org.demo.Echo", "echo(String)", "1.0");
        let b = history_key("A", "org.demo.Echo", "echo(String)", "1.0");
        let c = history_key("A", "org.demo.Echo", "echo(String)", "2.0");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_last_for_returns_newest() {
        let mut history = InvocationHistory::new(20);
        history.record(&request("first"));
        history.record(&request("second"));
        history.record(&InvocationRequest::new("A", "org.demo.Echo", "ping", "1.0"));

        let last = history
            .last_for("A", "org.demo.Echo", "echo(String)", "1.0")
            .unwrap();
        assert_eq!(last.parameters[0].value, json!("second"));
        assert!(history.last_for("A", "org.demo.Echo", "echo(String)", "2.0").is_none());
        assert!(history.last_for("A", "org.demo.Echo", "ping()", "1.0").is_some());
    }

    #[test]
    fn test_capacity_evicts_oldest() {
        let mut history = InvocationHistory::new(3);
        for i in 0..5 {
            history.record(&request(&format!("call{}", i)));
        }
        assert_eq!(history.len(), 3);
        let values: Vec<_> = history
            .entries()
            .map(|e| e.parameters[0].value.clone())
            .collect();
        assert_eq!(values, vec![json!("call2"), json!("call3"), json!("call4")]);
    }

    #[test]
    fn test_restore_keeps_newest() {
        let mut source = InvocationHistory::new(10);
        for i in 0..4 {
            source.record(&request(&format!("call{}", i)));
        }

        let mut target = InvocationHistory::new(2);
        target.restore(source.entries().cloned().collect());
        assert_eq!(target.len(), 2);
        let last = target
            .last_for("A", "org.demo.Echo", "echo(String)", "1.0")
            .unwrap();
        assert_eq!(last.parameters[0].value, json!("call3"));
    }

    #[test]
    fn test_snapshot_serialization() {
        let mut history = InvocationHistory::new(5);
        history.record(&request("bob"));

        let snapshot = ClientSnapshot {
            registries: vec![RegistryInfo {
                address: "zookeeper://127.0.0.1:2181".to_string(),
                username: None,
                password: None,
            }],
            last_registry: Some("zookeeper://127.0.0.1:2181".to_string()),
            history: history.entries().cloned().collect(),
        };

        let text = serde_json::to_string(&snapshot).unwrap();
        assert!(!text.contains("username"));
        let back: ClientSnapshot = serde_json::from_str(&text).unwrap();
        assert_eq!(back, snapshot);

        let empty: ClientSnapshot = serde_json::from_str("{}").unwrap();
        assert_eq!(empty, ClientSnapshot::default());
    }
}
