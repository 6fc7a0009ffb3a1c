// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0

pub mod client;
pub mod config;
pub mod connection;
pub mod directory;
pub mod errors;
pub mod history;
pub mod invoke;

pub use client::{ClientRegistry, Execution};
pub use config::{ClientConfiguration, RegistryAddress};
pub use connection::{ConnectionListener, NoopListener, RegistryConnection, UrlState};
pub use directory::{ServiceDirectory, ServiceInfo};
pub use errors::ServiceError;
pub use history::{ClientSnapshot, HistoryEntry, InvocationHistory, RegistryInfo};
pub use invoke::{
    ConcurrentInvocation, ConcurrentSpec, InvocationEngine, InvocationRequest, InvocationResult,
    Parameter,
};
