// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use probe_registry::endpoint::TIMEOUT_KEY;
use probe_registry::registry::{cache_key, subscription_url};
use probe_registry::{
    ConnectionState, GenericReference, InvocationError, MethodInfo, NotifyListener,
    ReferenceFactory, ReferenceSpec, Registry, RegistryFactory, RegistryType, ServiceEndpoint,
};
use probe_telnet::{TelnetOptions, TelnetPool};
use tracing::{debug, info, warn};

use crate::config::RegistryAddress;
use crate::errors::ServiceError;
use crate::invoke::InvocationRequest;

/// Kind of change reported for a group of provider endpoints.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum UrlState {
    Add,
    Update,
    Remove,
}

/// Callbacks of a registry connection. Every method defaults to a no-op.
pub trait ConnectionListener: Send + Sync {
    fn on_connect(&self, _address: &str) {}

    fn on_connect_error(&self, _address: &str, _error: &ServiceError) {}

    fn on_disconnect(&self, _address: &str) {}

    /// Called under the notification lock of the connection, in arrival
    /// order. `Remove` carries the endpoints that left.
    fn on_url_changed(&self, _address: &str, _endpoints: &[ServiceEndpoint], _state: UrlState) {}
}

/// Listener ignoring every event.
pub struct NoopListener;

impl ConnectionListener for NoopListener {}

/// Forwards registry pushes to the connection without keeping it alive.
struct NotifyHandle {
    connection: Weak<RegistryConnection>,
}

impl NotifyListener for NotifyHandle {
    fn notify(&self, urls: Vec<ServiceEndpoint>) {
        if let Some(connection) = self.connection.upgrade() {
            connection.notify(urls);
        }
    }
}

type Partition = (String, String);

/// Subscription session against one registry address.
pub struct RegistryConnection {
    /// Address as given by the caller, used as key everywhere
    address: String,

    /// Parsed address, credentials included
    url: ServiceEndpoint,

    /// Bound of registry connect and subscribe
    connect_timeout: Duration,

    factory: Arc<dyn RegistryFactory>,
    references: Arc<dyn ReferenceFactory>,

    /// Provider connections used for introspection
    telnet: TelnetPool,

    state: RwLock<ConnectionState>,
    registry: Mutex<Option<Arc<dyn Registry>>>,

    /// Known endpoints per (application, interface)
    cache: Mutex<HashMap<Partition, Vec<ServiceEndpoint>>>,

    /// Serializes notifications, listener callbacks included
    notify_lock: Mutex<()>,

    listener: RwLock<Arc<dyn ConnectionListener>>,
}

impl RegistryConnection {
    pub fn new(
        registry: &RegistryAddress,
        connect_timeout: Duration,
        factory: Arc<dyn RegistryFactory>,
        references: Arc<dyn ReferenceFactory>,
        telnet: TelnetOptions,
    ) -> Result<Self, ServiceError> {
        let url = ServiceEndpoint::parse(&registry.address)?
            .with_credentials(registry.username.clone(), registry.password.clone());

        let connect_timeout = url
            .parameter(TIMEOUT_KEY)
            .and_then(|t| t.parse::<u64>().ok())
            .filter(|t| *t > 0)
            .map(Duration::from_millis)
            .unwrap_or(connect_timeout);

        Ok(RegistryConnection {
            address: registry.address.clone(),
            url,
            connect_timeout,
            factory,
            references,
            telnet: TelnetPool::new(telnet),
            state: RwLock::new(ConnectionState::Idle),
            registry: Mutex::new(None),
            cache: Mutex::new(HashMap::new()),
            notify_lock: Mutex::new(()),
            listener: RwLock::new(Arc::new(NoopListener)),
        })
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn url(&self) -> &ServiceEndpoint {
        &self.url
    }

    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    pub fn registry_type(&self) -> Option<RegistryType> {
        RegistryType::from_protocol(self.url.protocol())
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.read()
    }

    pub fn is_connected(&self) -> bool {
        self.state().is_connected()
    }

    pub fn telnet(&self) -> &TelnetPool {
        &self.telnet
    }

    /// Open the registry session and subscribe to every provider.
    ///
    /// A connect while another one is in flight fails with
    /// [`ServiceError::ConnectionInProgress`]; on a connected session it
    /// reports the current state. Failures leave the connection `Idle`.
    pub async fn connect(
        self: &Arc<Self>,
        listener: Arc<dyn ConnectionListener>,
    ) -> Result<ConnectionState, ServiceError> {
        {
            let mut state = self.state.write();
            match *state {
                ConnectionState::Connecting => {
                    return Err(ServiceError::ConnectionInProgress(self.address.clone()));
                }
                ConnectionState::Connected => {
                    drop(state);
                    listener.on_connect(&self.address);
                    return Ok(ConnectionState::Connected);
                }
                _ => *state = ConnectionState::Connecting,
            }
        }
        *self.listener.write() = listener.clone();

        info!(address = %self.address, timeout = ?self.connect_timeout, "connecting to registry");

        let res = match tokio::time::timeout(self.connect_timeout, self.open()).await {
            Ok(res) => res,
            Err(_) => Err(ServiceError::ConnectionError(format!(
                "{}: no answer within {:?}",
                self.address, self.connect_timeout
            ))),
        };

        let res = match res {
            Ok(registry) => self.established(registry).await,
            Err(e) => Err(e),
        };

        match res {
            Ok(()) => {
                info!(address = %self.address, "registry connected");
                listener.on_connect(&self.address);
                Ok(ConnectionState::Connected)
            }
            Err(e) => {
                warn!(address = %self.address, error = %e, "registry connection failed");
                self.factory.evict(&cache_key(&self.url));
                {
                    let mut state = self.state.write();
                    if state.is_connecting() {
                        *state = ConnectionState::Idle;
                    }
                }
                self.cache.lock().clear();
                listener.on_connect_error(&self.address, &e);
                Err(e)
            }
        }
    }

    async fn open(self: &Arc<Self>) -> Result<Arc<dyn Registry>, ServiceError> {
        let registry = self
            .factory
            .get_registry(&self.url)
            .await
            .map_err(|e| ServiceError::ConnectionError(e.to_string()))?;

        if !registry.is_available() {
            registry.destroy().await;
            return Err(ServiceError::ConnectionError(format!(
                "{}: registry unavailable",
                self.address
            )));
        }

        let handle = Arc::new(NotifyHandle {
            connection: Arc::downgrade(self),
        });
        if let Err(e) = registry.subscribe(&subscription_url(), handle).await {
            registry.destroy().await;
            return Err(ServiceError::ConnectionError(e.to_string()));
        }

        Ok(registry)
    }

    async fn established(&self, registry: Arc<dyn Registry>) -> Result<(), ServiceError> {
        {
            let mut state = self.state.write();
            if state.is_connecting() {
                *state = ConnectionState::Connected;
                *self.registry.lock() = Some(registry);
                return Ok(());
            }
        }

        // disconnected while the session was being opened
        registry.destroy().await;
        Err(ServiceError::ConnectionError(format!(
            "{}: connection aborted",
            self.address
        )))
    }

    /// Tear the session down. Calling it on an idle connection does nothing.
    pub async fn disconnect(&self) {
        let registry = {
            let mut state = self.state.write();
            let previous = *state;
            *state = ConnectionState::Idle;
            let registry = self.registry.lock().take();
            if previous == ConnectionState::Idle && registry.is_none() {
                return;
            }
            registry
        };

        if let Some(registry) = registry {
            registry.destroy().await;
        }
        self.factory.evict(&cache_key(&self.url));
        self.cache.lock().clear();
        self.telnet.release_all().await;

        info!(address = %self.address, "registry disconnected");
        let listener = self.listener.read().clone();
        listener.on_disconnect(&self.address);
    }

    /// Reconcile a registry push with the endpoint cache and report the
    /// changes per (application, interface).
    pub fn notify(&self, urls: Vec<ServiceEndpoint>) {
        let _serial = self.notify_lock.lock();

        let state = self.state();
        if !state.is_connected() && !state.is_connecting() {
            debug!(address = %self.address, %state, "notification ignored");
            return;
        }

        let mut partitions: BTreeMap<Partition, Vec<ServiceEndpoint>> = BTreeMap::new();
        for url in urls {
            partitions
                .entry((url.application().to_string(), url.interface_name().to_string()))
                .or_default()
                .push(url);
        }

        let mut changes = Vec::with_capacity(partitions.len());
        {
            let mut cache = self.cache.lock();
            for ((app, iface), endpoints) in partitions {
                if endpoints.iter().any(ServiceEndpoint::is_empty_marker) {
                    let keys: Vec<Partition> =
                        cache.keys().filter(|(_, i)| *i == iface).cloned().collect();
                    let mut removed: Vec<ServiceEndpoint> = keys
                        .iter()
                        .filter_map(|k| cache.remove(k))
                        .flatten()
                        .collect();
                    if removed.is_empty() {
                        removed = endpoints
                            .into_iter()
                            .filter(ServiceEndpoint::is_empty_marker)
                            .collect();
                    }
                    changes.push((iface, removed, UrlState::Remove));
                } else {
                    let state = match cache.insert((app, iface.clone()), endpoints.clone()) {
                        Some(_) => UrlState::Update,
                        None => UrlState::Add,
                    };
                    changes.push((iface, endpoints, state));
                }
            }
        }

        let listener = self.listener.read().clone();
        for (iface, endpoints, state) in changes {
            debug!(
                address = %self.address,
                %iface,
                count = endpoints.len(),
                ?state,
                "provider urls changed"
            );
            listener.on_url_changed(&self.address, &endpoints, state);
        }
    }

    /// Every endpoint currently known, empty markers excluded.
    pub fn endpoints(&self) -> Vec<ServiceEndpoint> {
        self.cache.lock().values().flatten().cloned().collect()
    }

    pub fn contains_endpoint(&self, endpoint: &ServiceEndpoint) -> bool {
        self.cache
            .lock()
            .values()
            .flatten()
            .any(|e| e.same_instance(endpoint))
    }

    fn ensure_connected(&self) -> Result<(), ServiceError> {
        if !self.is_connected() {
            return Err(ServiceError::NotConnected(self.address.clone()));
        }
        Ok(())
    }

    /// Ask the provider behind `endpoint` for the methods of its interface.
    pub async fn get_service_methods(
        &self,
        endpoint: &ServiceEndpoint,
    ) -> Result<Vec<MethodInfo>, ServiceError> {
        self.ensure_connected()?;
        if !self.contains_endpoint(endpoint) {
            return Err(ServiceError::EndpointRemoved(format!(
                "{}/{}",
                endpoint.address(),
                endpoint.interface_name()
            )));
        }

        let methods = self.telnet.introspect(endpoint).await?;
        debug!(
            provider = %endpoint.address(),
            iface = %endpoint.interface_name(),
            count = methods.len(),
            "methods introspected"
        );
        Ok(methods)
    }

    /// Build a reference for the service targeted by `request`.
    pub async fn refer(
        &self,
        request: &InvocationRequest,
    ) -> Result<Arc<dyn GenericReference>, InvocationError> {
        if !self.is_connected() {
            return Err(InvocationError::NotConnected(self.address.clone()));
        }

        let spec = ReferenceSpec::new(&request.interface_name, &request.version)
            .with_group(request.group.clone())
            .with_provider(request.provider.clone())
            .with_candidates(self.endpoints());
        self.references.refer(&spec).await
    }
}

impl std::fmt::Debug for RegistryConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistryConnection")
            .field("address", &self.address)
            .field("state", &self.state())
            .finish()
    }
}
