// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0

use std::time::Duration;

use duration_str::deserialize_duration;
use serde::Deserialize;
use tokio::runtime::{Builder, Runtime};
use tracing::debug;

use probe_config::configuration::ConfigurationError;

const THREAD_NAME: &str = "dubbo-probe";

/// The `runtime` section: how many workers run the client and how long it
/// gets to release its registry sessions on exit.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct RuntimeConfiguration {
    /// 0 lets tokio start one worker per core, 1 runs on the main thread
    worker_threads: usize,

    #[serde(deserialize_with = "deserialize_duration")]
    drain_timeout: Duration,
}

impl Default for RuntimeConfiguration {
    fn default() -> Self {
        RuntimeConfiguration {
            worker_threads: 0,
            drain_timeout: Duration::from_secs(10),
        }
    }
}

impl RuntimeConfiguration {
    pub fn with_worker_threads(self, worker_threads: usize) -> Self {
        RuntimeConfiguration {
            worker_threads,
            ..self
        }
    }

    pub fn worker_threads(&self) -> usize {
        self.worker_threads
    }

    pub fn drain_timeout(&self) -> Duration {
        self.drain_timeout
    }

    pub fn build(&self) -> Result<Runtime, ConfigurationError> {
        let mut builder = match self.worker_threads {
            1 => Builder::new_current_thread(),
            n => {
                let mut builder = Builder::new_multi_thread();
                if n > 0 {
                    builder.worker_threads(n);
                }
                builder
            }
        };
        debug!(workers = self.worker_threads, "building runtime");

        builder
            .enable_all()
            .thread_name(THREAD_NAME)
            .build()
            .map_err(|e| ConfigurationError::ConfigError(format!("failed to build runtime: {}", e)))
    }
}
