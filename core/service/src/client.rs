// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use probe_registry::{
    CachingRegistryFactory, ConnectionState, ReferenceFactory, RegistryFactory, ServiceEndpoint,
};
use probe_telnet::TelnetReferenceFactory;
use tracing::{debug, info};

use crate::config::{ClientConfiguration, RegistryAddress};
use crate::connection::{ConnectionListener, RegistryConnection, UrlState};
use crate::directory::{ServiceDirectory, ServiceInfo};
use crate::errors::ServiceError;
use crate::history::{ClientSnapshot, HistoryEntry, InvocationHistory, RegistryInfo};
use crate::invoke::{
    ConcurrentInvocation, ConcurrentSpec, EngineOptions, InvocationEngine, InvocationRequest,
    InvocationResult,
};

type ConnectionMap = Arc<Mutex<HashMap<String, Arc<RegistryConnection>>>>;

/// Outcome of [`ClientRegistry::execute`].
pub enum Execution {
    Single(InvocationResult),
    Batch(ConcurrentInvocation),
}

/// Keeps the directory and the connection map in line with a connection
/// before the caller's listener hears about it.
struct DirectoryListener {
    connection: Weak<RegistryConnection>,
    connections: ConnectionMap,
    directory: Arc<ServiceDirectory>,
    inner: Arc<dyn ConnectionListener>,
}

impl DirectoryListener {
    /// Drop the map entry of `address` if it still holds this connection.
    /// Returns false when the address was handed to a newer connection.
    fn forget(&self, address: &str) -> bool {
        let mut connections = self.connections.lock();
        let current = connections
            .get(address)
            .is_some_and(|c| Weak::ptr_eq(&Arc::downgrade(c), &self.connection));
        if current {
            connections.remove(address);
        }
        current
    }
}

impl ConnectionListener for DirectoryListener {
    fn on_connect(&self, address: &str) {
        self.inner.on_connect(address);
    }

    fn on_connect_error(&self, address: &str, error: &ServiceError) {
        if self.forget(address) {
            self.directory.remove_registry(address);
        }
        self.inner.on_connect_error(address, error);
    }

    fn on_disconnect(&self, address: &str) {
        if self.forget(address) {
            self.directory.remove_registry(address);
        }
        self.inner.on_disconnect(address);
    }

    fn on_url_changed(&self, address: &str, endpoints: &[ServiceEndpoint], state: UrlState) {
        match state {
            UrlState::Remove => {
                let interfaces: BTreeSet<&str> =
                    endpoints.iter().map(|e| e.interface_name()).collect();
                for iface in interfaces {
                    self.directory.remove_interface(address, iface);
                }
            }
            UrlState::Add | UrlState::Update => {
                self.directory.remove_by_endpoints(address, endpoints);
                self.directory.add_services(
                    endpoints
                        .iter()
                        .map(|e| ServiceInfo::from_endpoint(address, e))
                        .collect(),
                );
            }
        }
        self.inner.on_url_changed(address, endpoints, state);
    }
}

/// Entry point of the client: one registry connection per address, the
/// service directory fed by them, invocations and history.
pub struct ClientRegistry {
    config: ClientConfiguration,
    factory: Arc<dyn RegistryFactory>,
    references: Arc<dyn ReferenceFactory>,
    connections: ConnectionMap,
    directory: Arc<ServiceDirectory>,
    engine: InvocationEngine,
    history: Mutex<InvocationHistory>,
    registries: Mutex<Vec<RegistryInfo>>,
    last_registry: Mutex<Option<String>>,
    disposed: AtomicBool,
}

impl ClientRegistry {
    /// Client with the built-in registry drivers and telnet invocation.
    pub fn new(config: ClientConfiguration) -> Self {
        let references = Arc::new(TelnetReferenceFactory::new(
            config.introspection().telnet_options(),
        ));
        Self::with_factories(config, Arc::new(CachingRegistryFactory::default()), references)
    }

    pub fn with_factories(
        config: ClientConfiguration,
        factory: Arc<dyn RegistryFactory>,
        references: Arc<dyn ReferenceFactory>,
    ) -> Self {
        let registries = config
            .registries()
            .iter()
            .map(|r| RegistryInfo {
                address: r.address.clone(),
                username: r.username.clone(),
                password: r.password.clone(),
            })
            .collect();

        ClientRegistry {
            engine: InvocationEngine::new(EngineOptions::from(config.executor())),
            history: Mutex::new(InvocationHistory::new(config.history().max_entries)),
            registries: Mutex::new(registries),
            last_registry: Mutex::new(None),
            connections: Arc::new(Mutex::new(HashMap::new())),
            directory: Arc::new(ServiceDirectory::new()),
            disposed: AtomicBool::new(false),
            config,
            factory,
            references,
        }
    }

    fn ensure_alive(&self) -> Result<(), ServiceError> {
        if self.disposed.load(Ordering::Acquire) {
            return Err(ServiceError::Disposed);
        }
        Ok(())
    }

    pub fn directory(&self) -> &ServiceDirectory {
        &self.directory
    }

    pub fn engine(&self) -> &InvocationEngine {
        &self.engine
    }

    /// Registry as known from the configuration or previous sessions, with
    /// its credentials.
    pub fn known_registry(&self, address: &str) -> RegistryAddress {
        self.registries
            .lock()
            .iter()
            .find(|r| r.address == address)
            .map(|r| RegistryAddress {
                address: r.address.clone(),
                username: r.username.clone(),
                password: r.password.clone(),
            })
            .unwrap_or_else(|| RegistryAddress::new(address))
    }

    /// Connect to `registry`, reusing the connection of the address if one
    /// exists.
    pub async fn connect(
        &self,
        registry: RegistryAddress,
        listener: Arc<dyn ConnectionListener>,
    ) -> Result<ConnectionState, ServiceError> {
        self.ensure_alive()?;

        let connection = {
            let mut connections = self.connections.lock();
            match connections.get(&registry.address) {
                Some(c) => c.clone(),
                None => {
                    let c = Arc::new(RegistryConnection::new(
                        &registry,
                        self.config.connect_timeout(),
                        self.factory.clone(),
                        self.references.clone(),
                        self.config.introspection().telnet_options(),
                    )?);
                    connections.insert(registry.address.clone(), c.clone());
                    c
                }
            }
        };

        let wrapper = Arc::new(DirectoryListener {
            connection: Arc::downgrade(&connection),
            connections: self.connections.clone(),
            directory: self.directory.clone(),
            inner: listener,
        });
        let state = connection.connect(wrapper).await?;

        self.remember(&registry);
        Ok(state)
    }

    fn remember(&self, registry: &RegistryAddress) {
        let info = RegistryInfo {
            address: registry.address.clone(),
            username: registry.username.clone(),
            password: registry.password.clone(),
        };
        {
            let mut registries = self.registries.lock();
            match registries.iter_mut().find(|r| r.address == info.address) {
                Some(existing) => *existing = info,
                None => registries.push(info),
            }
        }
        *self.last_registry.lock() = Some(registry.address.clone());
    }

    pub async fn disconnect(&self, address: &str) -> Result<(), ServiceError> {
        self.ensure_alive()?;

        let connection = self.connections.lock().remove(address);
        if let Some(connection) = connection {
            connection.disconnect().await;
        }
        self.directory.remove_registry(address);
        Ok(())
    }

    pub fn state(&self, address: &str) -> ConnectionState {
        self.connections
            .lock()
            .get(address)
            .map(|c| c.state())
            .unwrap_or_default()
    }

    pub fn is_connected(&self, address: &str) -> bool {
        self.state(address).is_connected()
    }

    /// Addresses with a live or pending connection.
    pub fn addresses(&self) -> Vec<String> {
        let mut addresses: Vec<_> = self.connections.lock().keys().cloned().collect();
        addresses.sort();
        addresses
    }

    pub fn connection(&self, address: &str) -> Result<Arc<RegistryConnection>, ServiceError> {
        self.ensure_alive()?;
        self.connections
            .lock()
            .get(address)
            .cloned()
            .ok_or_else(|| ServiceError::NotConnected(address.to_string()))
    }

    pub fn services(
        &self,
        address: &str,
        app: Option<&str>,
        iface: Option<&str>,
    ) -> Result<Vec<ServiceInfo>, ServiceError> {
        self.ensure_alive()?;
        Ok(self.directory.services(address, app, iface))
    }

    /// Rebuild the directory of `address` from the endpoints the connection
    /// currently knows.
    pub fn refresh(&self, address: &str) -> Result<(), ServiceError> {
        let connection = self.connection(address)?;
        let infos = connection
            .endpoints()
            .iter()
            .map(|e| ServiceInfo::from_endpoint(address, e))
            .collect();
        self.directory.set_services(address, infos);
        Ok(())
    }

    /// The entry with its methods, introspecting the provider on first use.
    /// A failed introspection leaves the directory untouched.
    pub async fn get_service_info(&self, info: &ServiceInfo) -> Result<ServiceInfo, ServiceError> {
        self.ensure_alive()?;
        if info.methods.is_some() {
            return Ok(info.clone());
        }

        let connection = self.connection(&info.registry_address)?;
        let methods = connection.get_service_methods(&info.endpoint).await?;
        self.directory.set_methods(
            &info.registry_address,
            &info.provider_address,
            &info.interface_name,
            methods.clone(),
        );

        Ok(ServiceInfo {
            methods: Some(methods),
            ..info.clone()
        })
    }

    /// Single generic call. Rpc failures are returned in the result.
    pub async fn invoke(
        &self,
        address: &str,
        request: &InvocationRequest,
    ) -> Result<InvocationResult, ServiceError> {
        let connection = self.connection(address)?;
        if !connection.is_connected() {
            return Err(ServiceError::NotConnected(address.to_string()));
        }
        self.history.lock().record(request);
        self.engine.invoke_single(&connection, request).await
    }

    /// Single call for [`ConcurrentSpec::NONE`], a streamed batch otherwise.
    pub async fn execute(
        &self,
        address: &str,
        request: InvocationRequest,
        spec: ConcurrentSpec,
    ) -> Result<Execution, ServiceError> {
        if spec.is_none() {
            return self.invoke(address, &request).await.map(Execution::Single);
        }

        let connection = self.connection(address)?;
        if !connection.is_connected() {
            return Err(ServiceError::NotConnected(address.to_string()));
        }
        self.history.lock().record(&request);

        debug!(
            %address,
            count = spec.invocation_count(),
            workers = spec.worker_group_size(),
            "starting concurrent batch"
        );
        Ok(Execution::Batch(
            self.engine.execute_concurrent(connection, request, spec),
        ))
    }

    /// Arguments of the last call of a method.
    pub fn last_invocation(
        &self,
        app: &str,
        iface: &str,
        method_key: &str,
        version: &str,
    ) -> Option<HistoryEntry> {
        self.history
            .lock()
            .last_for(app, iface, method_key, version)
            .cloned()
    }

    pub fn snapshot(&self) -> ClientSnapshot {
        ClientSnapshot {
            registries: self.registries.lock().clone(),
            last_registry: self.last_registry.lock().clone(),
            history: self.history.lock().entries().cloned().collect(),
        }
    }

    pub fn restore(&self, snapshot: ClientSnapshot) -> Result<(), ServiceError> {
        self.ensure_alive()?;
        *self.registries.lock() = snapshot.registries;
        *self.last_registry.lock() = snapshot.last_registry;
        self.history.lock().restore(snapshot.history);
        Ok(())
    }

    pub fn last_registry(&self) -> Option<String> {
        self.last_registry.lock().clone()
    }

    /// Tear everything down. Later calls fail with [`ServiceError::Disposed`].
    pub async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }

        let connections: Vec<_> = self.connections.lock().drain().map(|(_, c)| c).collect();
        info!(count = connections.len(), "disposing client registry");

        for connection in &connections {
            connection.disconnect().await;
            self.directory.remove_registry(connection.address());
        }
        self.engine.shutdown_now();
        for connection in &connections {
            connection.telnet().release_all().await;
        }
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::NoopListener;
    use probe_registry::testutils::{MockReferenceFactory, MockRegistryDriver};
    use std::time::Duration;

    const ADDRESS: &str = "mock://127.0.0.1:2181";

    fn provider(host: &str, iface: &str) -> ServiceEndpoint {
        ServiceEndpoint::parse(&format!(
            "dubbo://{}:20880/{}?application=A&version=1.0",
            host, iface
        ))
        .unwrap()
    }

    fn client(driver: Arc<MockRegistryDriver>) -> ClientRegistry {
        ClientRegistry::with_factories(
            ClientConfiguration::new(),
            Arc::new(CachingRegistryFactory::new().with_driver(driver)),
            Arc::new(MockReferenceFactory::default()),
        )
    }

    #[tokio::test]
    async fn test_one_connection_per_address() {
        let driver = Arc::new(MockRegistryDriver::new());
        let client = client(driver.clone());

        let listener = Arc::new(NoopListener);
        client
            .connect(RegistryAddress::new(ADDRESS), listener.clone())
            .await
            .unwrap();
        let state = client
            .connect(RegistryAddress::new(ADDRESS), listener)
            .await
            .unwrap();

        assert_eq!(state, ConnectionState::Connected);
        assert_eq!(driver.created(), 1);
        assert_eq!(client.addresses(), vec![ADDRESS.to_string()]);
        assert_eq!(client.last_registry(), Some(ADDRESS.to_string()));
    }

    #[tokio::test]
    async fn test_failed_connect_is_forgotten() {
        let driver = Arc::new(MockRegistryDriver::new());
        driver.set_fail_connect(true);
        let client = client(driver.clone());

        let res = client
            .connect(RegistryAddress::new(ADDRESS), Arc::new(NoopListener))
            .await;
        assert!(matches!(res, Err(ServiceError::ConnectionError(_))));
        assert!(client.addresses().is_empty());
        assert_eq!(client.state(ADDRESS), ConnectionState::Idle);
        assert!(client.snapshot().registries.is_empty());

        driver.set_fail_connect(false);
        client
            .connect(RegistryAddress::new(ADDRESS), Arc::new(NoopListener))
            .await
            .unwrap();
        assert!(client.is_connected(ADDRESS));
    }

    #[tokio::test]
    async fn test_directory_follows_notifications() {
        let driver = Arc::new(MockRegistryDriver::new().with_initial(vec![
            provider("10.0.0.1", "org.demo.Foo"),
            provider("10.0.0.2", "org.demo.Foo"),
            provider("10.0.0.1", "org.demo.Bar"),
        ]));
        let client = client(driver.clone());
        client
            .connect(RegistryAddress::new(ADDRESS), Arc::new(NoopListener))
            .await
            .unwrap();

        assert_eq!(client.services(ADDRESS, None, None).unwrap().len(), 3);
        assert_eq!(
            client.services(ADDRESS, Some("A"), Some("org.demo.Foo")).unwrap().len(),
            2
        );

        let registry = driver.last().unwrap();
        registry.push(vec![provider("10.0.0.3", "org.demo.Foo")]);
        let foo = client.services(ADDRESS, None, Some("org.demo.Foo")).unwrap();
        assert_eq!(foo.len(), 1);
        assert_eq!(foo[0].provider_address, "10.0.0.3:20880");

        registry.push(vec![provider("10.0.0.1", "org.demo.Bar").empty_marker()]);
        assert!(client.services(ADDRESS, None, Some("org.demo.Bar")).unwrap().is_empty());
        assert_eq!(client.services(ADDRESS, None, None).unwrap().len(), 1);

        client.refresh(ADDRESS).unwrap();
        assert_eq!(client.services(ADDRESS, None, None).unwrap().len(), 1);

        client.disconnect(ADDRESS).await.unwrap();
        assert!(client.services(ADDRESS, None, None).unwrap().is_empty());
        assert!(!client.is_connected(ADDRESS));
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_failure_of_replaced_connection() {
        let driver = Arc::new(MockRegistryDriver::new().with_initial(vec![
            provider("10.0.0.1", "org.demo.Foo"),
            provider("10.0.0.2", "org.demo.Foo"),
        ]));
        driver.set_connect_delay(Some(Duration::from_secs(10)));
        let client = client(driver.clone());

        let stale = client.connect(RegistryAddress::new(ADDRESS), Arc::new(NoopListener));
        let replace = async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            client.disconnect(ADDRESS).await.unwrap();
            driver.set_connect_delay(None);
            client
                .connect(RegistryAddress::new(ADDRESS), Arc::new(NoopListener))
                .await
                .unwrap();
            assert_eq!(client.services(ADDRESS, None, None).unwrap().len(), 2);
        };
        let (stale, ()) = tokio::join!(stale, replace);

        // the first session only finishes opening after it was replaced
        assert!(matches!(stale, Err(ServiceError::ConnectionError(_))));
        assert_eq!(driver.created(), 2);
        assert_eq!(driver.last().unwrap().destroyed(), 1);

        assert!(client.is_connected(ADDRESS));
        assert_eq!(client.addresses(), vec![ADDRESS.to_string()]);
        assert_eq!(client.services(ADDRESS, None, None).unwrap().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_invoke_while_connecting() {
        let driver = Arc::new(MockRegistryDriver::new());
        driver.set_connect_delay(Some(Duration::from_secs(1)));
        let client = client(driver);
        let request = InvocationRequest::new("A", "org.demo.Foo", "ping", "1.0");

        let connect = client.connect(RegistryAddress::new(ADDRESS), Arc::new(NoopListener));
        let call = async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            assert_eq!(client.state(ADDRESS), ConnectionState::Connecting);
            client.invoke(ADDRESS, &request).await
        };
        let (connected, res) = tokio::join!(connect, call);

        assert!(connected.is_ok());
        assert!(matches!(res, Err(ServiceError::NotConnected(_))));
        assert!(client.snapshot().history.is_empty());
    }

    #[tokio::test]
    async fn test_execute_records_history() {
        let client = client(Arc::new(MockRegistryDriver::new()));
        client
            .connect(RegistryAddress::new(ADDRESS), Arc::new(NoopListener))
            .await
            .unwrap();

        let request = InvocationRequest::new("A", "org.demo.Foo", "ping", "1.0");
        match client
            .execute(ADDRESS, request.clone(), ConcurrentSpec::NONE)
            .await
            .unwrap()
        {
            Execution::Single(result) => assert!(result.is_success()),
            Execution::Batch(_) => panic!("single call expected"),
        }

        match client
            .execute(ADDRESS, request, ConcurrentSpec::new(3, 2))
            .await
            .unwrap()
        {
            Execution::Batch(batch) => assert_eq!(batch.collect().await.len(), 3),
            Execution::Single(_) => panic!("batch expected"),
        }

        assert_eq!(client.snapshot().history.len(), 2);
        assert!(client
            .last_invocation("A", "org.demo.Foo", "ping()", "1.0")
            .is_some());
    }

    #[tokio::test]
    async fn test_calls_on_unknown_registry() {
        let client = client(Arc::new(MockRegistryDriver::new()));
        let request = InvocationRequest::new("A", "org.demo.Foo", "ping", "1.0");

        let res = client.invoke(ADDRESS, &request).await;
        assert!(matches!(res, Err(ServiceError::NotConnected(_))));
        let res = client.execute(ADDRESS, request, ConcurrentSpec::new(2, 2)).await;
        assert!(matches!(res, Err(ServiceError::NotConnected(_))));
        assert!(client.snapshot().history.is_empty());
    }

    #[tokio::test]
    async fn test_snapshot_restore() {
        let client = client(Arc::new(MockRegistryDriver::new()));
        client
            .connect(
                RegistryAddress::new(ADDRESS).with_credentials("admin", "secret"),
                Arc::new(NoopListener),
            )
            .await
            .unwrap();
        let snapshot = client.snapshot();
        assert_eq!(snapshot.registries[0].username.as_deref(), Some("admin"));

        let other = ClientRegistry::with_factories(
            ClientConfiguration::new(),
            Arc::new(CachingRegistryFactory::new()),
            Arc::new(MockReferenceFactory::default()),
        );
        other.restore(snapshot.clone()).unwrap();
        assert_eq!(other.snapshot(), snapshot);
        assert_eq!(other.known_registry(ADDRESS).password.as_deref(), Some("secret"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_dispose() {
        let driver = Arc::new(
            MockRegistryDriver::new().with_initial(vec![provider("10.0.0.1", "org.demo.Foo")]),
        );
        let references =
            Arc::new(MockReferenceFactory::default().with_delay(Duration::from_secs(10)));
        let client = ClientRegistry::with_factories(
            ClientConfiguration::new(),
            Arc::new(CachingRegistryFactory::new().with_driver(driver.clone())),
            references.clone(),
        );
        client
            .connect(RegistryAddress::new(ADDRESS), Arc::new(NoopListener))
            .await
            .unwrap();

        let request = InvocationRequest::new("A", "org.demo.Foo", "ping", "1.0");
        let batch = match client
            .execute(ADDRESS, request.clone(), ConcurrentSpec::new(4, 2))
            .await
            .unwrap()
        {
            Execution::Batch(batch) => batch,
            Execution::Single(_) => panic!("batch expected"),
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(client.directory().services(ADDRESS, None, None).len(), 1);

        client.dispose().await;
        assert!(client.is_disposed());
        assert_eq!(driver.last().unwrap().destroyed(), 1);
        assert!(client.directory().services(ADDRESS, None, None).is_empty());

        let results = batch.collect().await;
        assert_eq!(results.len(), 4);
        assert!(results.iter().all(InvocationResult::is_cancelled));

        assert!(matches!(
            client.connect(RegistryAddress::new(ADDRESS), Arc::new(NoopListener)).await,
            Err(ServiceError::Disposed)
        ));
        assert!(matches!(client.invoke(ADDRESS, &request).await, Err(ServiceError::Disposed)));
        assert!(matches!(client.services(ADDRESS, None, None), Err(ServiceError::Disposed)));
        assert!(matches!(client.disconnect(ADDRESS).await, Err(ServiceError::Disposed)));
    }
}
