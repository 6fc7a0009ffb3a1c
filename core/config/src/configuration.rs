// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0

use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigurationError {
    #[error("configuration error {0}")]
    ConfigError(String),
    #[error("invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },
    #[error("unknown error")]
    Unknown,
}

impl ConfigurationError {
    pub fn invalid(field: &str, reason: impl Into<String>) -> Self {
        ConfigurationError::InvalidValue {
            field: field.to_string(),
            reason: reason.into(),
        }
    }
}

pub trait Configuration {
    /// Validate the component configuration
    fn validate(&self) -> Result<(), ConfigurationError>;
}
