// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0

use serde::Deserialize;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::filter::ParseError;

/// The `tracing` section. Logs go to stderr so that command output on stdout
/// stays machine readable.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct TracingConfiguration {
    /// level of every target without a more specific directive
    log_level: String,

    /// extra env-filter directives, e.g. "probe_service=debug,probe_telnet=trace"
    filter: String,

    thread_names: bool,
}

impl Default for TracingConfiguration {
    fn default() -> Self {
        TracingConfiguration {
            log_level: "info".to_string(),
            filter: String::new(),
            thread_names: false,
        }
    }
}

impl TracingConfiguration {
    pub fn with_log_level(self, log_level: &str) -> Self {
        TracingConfiguration {
            log_level: log_level.to_string(),
            ..self
        }
    }

    pub fn with_filter(self, filter: &str) -> Self {
        TracingConfiguration {
            filter: filter.to_string(),
            ..self
        }
    }

    pub fn log_level(&self) -> &str {
        &self.log_level
    }

    pub fn filter(&self) -> &str {
        &self.filter
    }

    pub fn thread_names(&self) -> bool {
        self.thread_names
    }

    /// Level first, so the per-target directives of `filter` refine it.
    pub fn directives(&self) -> String {
        match self.filter.trim() {
            "" => self.log_level.clone(),
            filter => format!("{},{}", self.log_level, filter),
        }
    }

    /// `RUST_LOG` wins over the configured directives when it is set.
    pub fn env_filter(&self) -> Result<EnvFilter, ParseError> {
        match std::env::var(EnvFilter::DEFAULT_ENV) {
            Ok(env) if !env.is_empty() => EnvFilter::try_new(env),
            _ => EnvFilter::try_new(self.directives()),
        }
    }

    /// Install the global stderr subscriber. Returns false when one was
    /// already installed.
    pub fn setup_tracing_subscriber(&self) -> Result<bool, ParseError> {
        let installed = tracing_subscriber::fmt()
            .with_env_filter(self.env_filter()?)
            .with_thread_names(self.thread_names)
            .with_writer(std::io::stderr)
            .try_init()
            .is_ok();
        Ok(installed)
    }
}
