// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::endpoint::{
    ANY_VALUE, APPLICATION_KEY, CATEGORY_KEY, CHECK_KEY, CLASSIFIER_KEY, ENABLED_KEY, GROUP_KEY,
    INTERFACE_KEY, PROVIDERS_CATEGORY, ServiceEndpoint, VERSION_KEY,
};
use crate::errors::RegistryError;
use crate::multicast::MulticastRegistryDriver;

/// Path of the registry service, used to build registry cache keys
pub const REGISTRY_SERVICE: &str = "org.apache.dubbo.registry.RegistryService";

/// Application name announced by the consumer
pub const CONSUMER_APPLICATION: &str = "dubbo-probe";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RegistryType {
    Dubbo,
    Consul,
    Zookeeper,
    Redis,
    Multicast,
    Nacos,
}

impl RegistryType {
    pub fn protocol(&self) -> &'static str {
        match self {
            RegistryType::Dubbo => "dubbo",
            RegistryType::Consul => "consul",
            RegistryType::Zookeeper => "zookeeper",
            RegistryType::Redis => "redis",
            RegistryType::Multicast => "multicast",
            RegistryType::Nacos => "nacos",
        }
    }

    pub fn from_protocol(protocol: &str) -> Option<Self> {
        [
            RegistryType::Dubbo,
            RegistryType::Consul,
            RegistryType::Zookeeper,
            RegistryType::Redis,
            RegistryType::Multicast,
            RegistryType::Nacos,
        ]
        .into_iter()
        .find(|t| t.protocol() == protocol)
    }
}

impl std::fmt::Display for RegistryType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.protocol())
    }
}

/// Receives provider lists pushed by a registry. For a given interface the
/// list is always complete; an `empty://` endpoint means no provider is left.
pub trait NotifyListener: Send + Sync {
    fn notify(&self, urls: Vec<ServiceEndpoint>);
}

/// A live session with a registry.
#[async_trait]
pub trait Registry: Send + Sync {
    fn url(&self) -> &ServiceEndpoint;

    async fn subscribe(
        &self,
        url: &ServiceEndpoint,
        listener: Arc<dyn NotifyListener>,
    ) -> Result<(), RegistryError>;

    fn is_available(&self) -> bool;

    async fn destroy(&self);
}

/// Opens registry sessions for one protocol.
#[async_trait]
pub trait RegistryDriver: Send + Sync {
    fn protocol(&self) -> &'static str;

    async fn connect(&self, url: &ServiceEndpoint) -> Result<Arc<dyn Registry>, RegistryError>;
}

/// Hands out registry sessions. Implementations may cache sessions per
/// registry; a cached session survives `destroy`, so callers must `evict` it
/// before reconnecting to the same address.
#[async_trait]
pub trait RegistryFactory: Send + Sync {
    async fn get_registry(&self, url: &ServiceEndpoint)
    -> Result<Arc<dyn Registry>, RegistryError>;

    /// Drop the cached session stored under `key` (see [`cache_key`]).
    fn evict(&self, key: &str) -> bool;
}

/// Canonical key of a registry session:
/// `protocol://[user[:password]@]host:port/org.apache.dubbo.registry.RegistryService`
pub fn cache_key(url: &ServiceEndpoint) -> String {
    let mut key = format!("{}://", url.protocol());
    if let Some(user) = url.username() {
        key.push_str(user);
        if let Some(password) = url.password() {
            key.push(':');
            key.push_str(password);
        }
        key.push('@');
    }
    key.push_str(&url.address());
    key.push('/');
    key.push_str(REGISTRY_SERVICE);
    key
}

/// Subscription matching every provider of every interface.
pub fn subscription_url() -> ServiceEndpoint {
    ServiceEndpoint::new("consumer", "0.0.0.0", 0, ANY_VALUE)
        .with_parameter(APPLICATION_KEY, CONSUMER_APPLICATION)
        .with_parameter(INTERFACE_KEY, ANY_VALUE)
        .with_parameter(GROUP_KEY, ANY_VALUE)
        .with_parameter(VERSION_KEY, ANY_VALUE)
        .with_parameter(CLASSIFIER_KEY, ANY_VALUE)
        .with_parameter(CATEGORY_KEY, PROVIDERS_CATEGORY)
        .with_parameter(ENABLED_KEY, ANY_VALUE)
        .with_parameter(CHECK_KEY, "false")
}

/// Registry factory dispatching on the url protocol and caching one session
/// per registry.
pub struct CachingRegistryFactory {
    drivers: HashMap<&'static str, Arc<dyn RegistryDriver>>,
    registries: Mutex<HashMap<String, Arc<dyn Registry>>>,
}

impl Default for CachingRegistryFactory {
    fn default() -> Self {
        Self::new().with_driver(Arc::new(MulticastRegistryDriver))
    }
}

impl CachingRegistryFactory {
    /// Factory without any driver
    pub fn new() -> Self {
        CachingRegistryFactory {
            drivers: HashMap::new(),
            registries: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_driver(mut self, driver: Arc<dyn RegistryDriver>) -> Self {
        self.drivers.insert(driver.protocol(), driver);
        self
    }

    pub fn protocols(&self) -> Vec<&'static str> {
        let mut p: Vec<_> = self.drivers.keys().copied().collect();
        p.sort_unstable();
        p
    }

    pub fn is_cached(&self, key: &str) -> bool {
        self.registries.lock().contains_key(key)
    }
}

#[async_trait]
impl RegistryFactory for CachingRegistryFactory {
    async fn get_registry(
        &self,
        url: &ServiceEndpoint,
    ) -> Result<Arc<dyn Registry>, RegistryError> {
        let key = cache_key(url);
        if let Some(registry) = self.registries.lock().get(&key) {
            debug!(%key, "registry served from cache");
            return Ok(registry.clone());
        }

        let driver = self
            .drivers
            .get(url.protocol())
            .ok_or_else(|| RegistryError::UnsupportedProtocol(url.protocol().to_string()))?
            .clone();

        let registry = driver.connect(url).await?;

        let mut registries = self.registries.lock();
        if registries.contains_key(&key) {
            // filled by a concurrent connect, the first session stays cached
            debug!(%key, "registry session created, not cached");
            return Ok(registry);
        }
        info!(%key, "registry session created");
        registries.insert(key, registry.clone());
        Ok(registry)
    }

    fn evict(&self, key: &str) -> bool {
        let removed = self.registries.lock().remove(key).is_some();
        if removed {
            debug!(%key, "registry evicted from cache");
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutils::MockRegistryDriver;
    use std::time::Duration;
    use tracing_test::traced_test;

    #[test]
    fn test_registry_type() {
        assert_eq!(
            RegistryType::from_protocol("zookeeper"),
            Some(RegistryType::Zookeeper)
        );
        assert_eq!(
            RegistryType::from_protocol("multicast"),
            Some(RegistryType::Multicast)
        );
        assert_eq!(RegistryType::from_protocol("etcd"), None);
        assert_eq!(RegistryType::Nacos.to_string(), "nacos");
    }

    #[test]
    fn test_cache_key() {
        let url = ServiceEndpoint::parse("zookeeper://u:p@127.0.0.1:2181?timeout=3000").unwrap();
        assert_eq!(
            cache_key(&url),
            "zookeeper://u:p@127.0.0.1:2181/org.apache.dubbo.registry.RegistryService"
        );
        let url = ServiceEndpoint::parse("multicast://224.5.6.7:1234").unwrap();
        assert_eq!(
            cache_key(&url),
            "multicast://224.5.6.7:1234/org.apache.dubbo.registry.RegistryService"
        );
    }

    #[test]
    fn test_subscription_url_matches_any_provider() {
        let sub = subscription_url();
        let provider = ServiceEndpoint::parse(
            "dubbo://10.0.0.1:20880/org.demo.Echo?application=a&version=1.0&group=g",
        )
        .unwrap();
        assert!(provider.is_match(&sub));
    }

    #[tokio::test]
    #[traced_test]
    async fn test_factory_caches_until_evicted() {
        let driver = Arc::new(MockRegistryDriver::new());
        let factory = CachingRegistryFactory::new().with_driver(driver.clone());
        let url = ServiceEndpoint::parse("mock://127.0.0.1:2181").unwrap();

        let first = factory.get_registry(&url).await.unwrap();
        first.destroy().await;

        // the destroyed session is still handed out
        let second = factory.get_registry(&url).await.unwrap();
        assert!(!second.is_available());
        assert_eq!(driver.created(), 1);

        assert!(factory.evict(&cache_key(&url)));
        assert!(!factory.evict(&cache_key(&url)));

        let third = factory.get_registry(&url).await.unwrap();
        assert!(third.is_available());
        assert_eq!(driver.created(), 2);

        assert!(logs_contain("registry session created"));
        assert!(logs_contain("registry served from cache"));
        assert!(logs_contain("registry evicted from cache"));
    }

    #[tokio::test(start_paused = true)]
    #[traced_test]
    async fn test_factory_keeps_first_cached_session() {
        let driver = Arc::new(MockRegistryDriver::new().with_connect_delay(Duration::from_secs(1)));
        let factory = CachingRegistryFactory::new().with_driver(driver.clone());
        let url = ServiceEndpoint::parse("mock://127.0.0.1:2181").unwrap();

        let slow = factory.get_registry(&url);
        let fast = async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            driver.set_connect_delay(None);
            factory.get_registry(&url).await
        };
        let (slow, fast) = tokio::join!(slow, fast);
        let (slow, fast) = (slow.unwrap(), fast.unwrap());

        assert_eq!(driver.created(), 2);
        assert!(!Arc::ptr_eq(&slow, &fast));
        assert!(logs_contain("registry session created, not cached"));

        // the late session can go away without touching the cached one
        slow.destroy().await;
        let cached = factory.get_registry(&url).await.unwrap();
        assert!(Arc::ptr_eq(&cached, &fast));
        assert!(cached.is_available());
    }

    #[tokio::test]
    async fn test_unsupported_protocol() {
        let factory = CachingRegistryFactory::default();
        assert_eq!(factory.protocols(), vec!["multicast"]);

        let url = ServiceEndpoint::parse("zookeeper://127.0.0.1:2181").unwrap();
        let res = factory.get_registry(&url).await;
        assert!(matches!(res, Err(RegistryError::UnsupportedProtocol(p)) if p == "zookeeper"));
    }
}
