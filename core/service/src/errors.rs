// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0

use probe_registry::{InvocationError, RegistryError};
use probe_telnet::TelnetError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("configuration error {0}")]
    ConfigError(String),
    #[error("invalid registry address: {0}")]
    InvalidAddress(#[from] RegistryError),
    #[error("connection error: {0}")]
    ConnectionError(String),
    #[error("connection already in progress: {0}")]
    ConnectionInProgress(String),
    #[error("registry not connected: {0}")]
    NotConnected(String),
    #[error("endpoint no longer registered: {0}")]
    EndpointRemoved(String),
    #[error("method details unavailable: {0}")]
    Introspection(#[from] TelnetError),
    #[error("invocation error: {0}")]
    Invocation(#[from] InvocationError),
    #[error("client registry disposed")]
    Disposed,
    #[error("unknown error")]
    Unknown,
}
