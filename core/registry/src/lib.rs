// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0

pub mod endpoint;
pub mod errors;
pub mod method;
pub mod multicast;
pub mod reference;
pub mod registry;
pub mod state;
pub mod testutils;

pub use endpoint::ServiceEndpoint;
pub use errors::RegistryError;
pub use method::MethodInfo;
pub use reference::{
    GenericReference, InvocationError, ReferenceFactory, ReferenceSpec, RpcResponse,
};
pub use registry::{
    CachingRegistryFactory, NotifyListener, Registry, RegistryDriver, RegistryFactory,
    RegistryType,
};
pub use state::ConnectionState;
