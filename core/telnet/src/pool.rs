// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use probe_registry::{MethodInfo, ServiceEndpoint};
use tracing::{debug, info};

use crate::client::TelnetClient;
use crate::errors::TelnetError;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TelnetOptions {
    /// Round trip bound of a single command
    pub command_timeout: Duration,
    /// How long a caller waits for a connection to come up
    pub connect_wait: Duration,
}

impl Default for TelnetOptions {
    fn default() -> Self {
        TelnetOptions {
            command_timeout: Duration::from_secs(5),
            connect_wait: Duration::from_secs(3),
        }
    }
}

/// Introspection connections, one per provider `host:port`, created on first
/// use. A connection that failed or was closed is replaced on the next use.
pub struct TelnetPool {
    options: TelnetOptions,
    clients: Mutex<HashMap<String, Arc<TelnetClient>>>,
}

impl TelnetPool {
    pub fn new(options: TelnetOptions) -> Self {
        TelnetPool {
            options,
            clients: Mutex::new(HashMap::new()),
        }
    }

    pub fn options(&self) -> TelnetOptions {
        self.options
    }

    pub fn len(&self) -> usize {
        self.clients.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.lock().is_empty()
    }

    pub async fn acquire(&self, address: &str) -> Result<Arc<TelnetClient>, TelnetError> {
        let (client, owner) = {
            let mut clients = self.clients.lock();
            match clients.get(address) {
                Some(c) if c.state().is_connected() || c.state().is_connecting() => {
                    (c.clone(), false)
                }
                _ => {
                    let c = Arc::new(TelnetClient::new(address, self.options.command_timeout));
                    c.begin_connect();
                    clients.insert(address.to_string(), c.clone());
                    (c, true)
                }
            }
        };

        if owner {
            if let Err(e) = client.connect(self.options.connect_wait).await {
                self.forget(address, &client);
                return Err(e);
            }
            return Ok(client);
        }

        if client.wait_connected(self.options.connect_wait).await {
            Ok(client)
        } else {
            self.forget(address, &client);
            Err(TelnetError::NotConnected(address.to_string()))
        }
    }

    fn forget(&self, address: &str, client: &Arc<TelnetClient>) {
        let mut clients = self.clients.lock();
        if clients.get(address).is_some_and(|c| Arc::ptr_eq(c, client)) {
            clients.remove(address);
            debug!(%address, "telnet connection removed from pool");
        }
    }

    /// List the methods `endpoint` exposes for its interface.
    pub async fn introspect(&self, endpoint: &ServiceEndpoint) -> Result<Vec<MethodInfo>, TelnetError> {
        let address = endpoint.address();
        let client = self.acquire(&address).await?;

        let res = client
            .list_methods(endpoint.interface_name(), endpoint.release_version())
            .await;
        if let Err(e) = &res {
            if e.is_connection_error() {
                self.forget(&address, &client);
            }
        }
        res
    }

    pub async fn release(&self, address: &str) {
        let client = self.clients.lock().remove(address);
        if let Some(client) = client {
            client.close().await;
        }
    }

    pub async fn release_all(&self) {
        let clients: Vec<_> = self.clients.lock().drain().map(|(_, c)| c).collect();
        if !clients.is_empty() {
            info!(count = clients.len(), "releasing telnet connections");
        }
        for client in clients {
            client.close().await;
        }
    }
}
