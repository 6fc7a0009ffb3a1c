// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0

use thiserror::Error;

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("invalid url {url}: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("unsupported registry protocol: {0}")]
    UnsupportedProtocol(String),
    #[error("registry not available: {0}")]
    Unavailable(String),
    #[error("error subscribing to registry: {0}")]
    SubscribeError(String),
    #[error("registry already destroyed: {0}")]
    Destroyed(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl RegistryError {
    pub(crate) fn invalid_url(url: &str, reason: impl Into<String>) -> Self {
        RegistryError::InvalidUrl {
            url: url.to_string(),
            reason: reason.into(),
        }
    }
}
