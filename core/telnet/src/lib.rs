// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0

pub mod client;
pub mod errors;
pub mod parser;
pub mod pool;
pub mod reference;
pub mod testutils;

pub use client::TelnetClient;
pub use errors::TelnetError;
pub use pool::{TelnetOptions, TelnetPool};
pub use reference::{TelnetReference, TelnetReferenceFactory};
