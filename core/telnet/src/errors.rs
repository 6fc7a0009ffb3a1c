// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0

use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum TelnetError {
    #[error("unable to connect to {address}: {reason}")]
    Connect { address: String, reason: String },
    #[error("telnet not connected: {0}")]
    NotConnected(String),
    #[error("no response within {0:?}")]
    Timeout(Duration),
    #[error("connection closed by provider {0}")]
    Closed(String),
    #[error("{0}")]
    NoSuchService(String),
    #[error("{0}")]
    NoSuchMethod(String),
    #[error("{0}")]
    InvokeFailed(String),
    #[error("unexpected response: {0}")]
    InvalidResponse(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl TelnetError {
    /// Errors after which the connection must not be reused.
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            TelnetError::Connect { .. }
                | TelnetError::NotConnected(_)
                | TelnetError::Timeout(_)
                | TelnetError::Closed(_)
                | TelnetError::Io(_)
        )
    }
}
