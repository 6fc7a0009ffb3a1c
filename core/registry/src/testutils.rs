// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0

//! In-memory registry and reference doubles used by the tests of this
//! workspace.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::endpoint::ServiceEndpoint;
use crate::errors::RegistryError;
use crate::reference::{
    GenericReference, InvocationError, ReferenceFactory, ReferenceSpec, RpcResponse,
};
use crate::registry::{NotifyListener, Registry, RegistryDriver};

pub const MOCK_PROTOCOL: &str = "mock";

pub struct MockRegistry {
    url: ServiceEndpoint,
    initial: Vec<ServiceEndpoint>,
    listeners: Mutex<Vec<Arc<dyn NotifyListener>>>,
    available: AtomicBool,
    fail_subscribe: bool,
    destroyed: AtomicUsize,
}

impl MockRegistry {
    pub fn new(url: ServiceEndpoint) -> Self {
        MockRegistry {
            url,
            initial: vec![],
            listeners: Mutex::new(vec![]),
            available: AtomicBool::new(true),
            fail_subscribe: false,
            destroyed: AtomicUsize::new(0),
        }
    }

    /// Push a provider list to every subscriber, as a registry watch would.
    pub fn push(&self, urls: Vec<ServiceEndpoint>) {
        let listeners = self.listeners.lock().clone();
        for l in listeners {
            l.notify(urls.clone());
        }
    }

    pub fn subscribers(&self) -> usize {
        self.listeners.lock().len()
    }

    pub fn destroyed(&self) -> usize {
        self.destroyed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Registry for MockRegistry {
    fn url(&self) -> &ServiceEndpoint {
        &self.url
    }

    async fn subscribe(
        &self,
        _url: &ServiceEndpoint,
        listener: Arc<dyn NotifyListener>,
    ) -> Result<(), RegistryError> {
        if self.fail_subscribe {
            return Err(RegistryError::SubscribeError("subscribe refused".to_string()));
        }
        if !self.is_available() {
            return Err(RegistryError::Destroyed(self.url.to_string()));
        }

        self.listeners.lock().push(listener.clone());
        if !self.initial.is_empty() {
            listener.notify(self.initial.clone());
        }
        Ok(())
    }

    fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    async fn destroy(&self) {
        self.available.store(false, Ordering::SeqCst);
        self.listeners.lock().clear();
        self.destroyed.fetch_add(1, Ordering::SeqCst);
    }
}

/// Driver for `mock://` addresses handing out [`MockRegistry`] sessions.
#[derive(Default)]
pub struct MockRegistryDriver {
    initial: Mutex<Vec<ServiceEndpoint>>,
    fail_connect: AtomicBool,
    fail_subscribe: AtomicBool,
    connect_delay: Mutex<Option<Duration>>,
    created: AtomicUsize,
    registries: Mutex<Vec<Arc<MockRegistry>>>,
}

impl MockRegistryDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Providers pushed to each new subscriber
    pub fn with_initial(self, urls: Vec<ServiceEndpoint>) -> Self {
        *self.initial.lock() = urls;
        self
    }

    pub fn with_connect_delay(self, delay: Duration) -> Self {
        *self.connect_delay.lock() = Some(delay);
        self
    }

    /// Delay applied to the sessions opened from now on
    pub fn set_connect_delay(&self, delay: Option<Duration>) {
        *self.connect_delay.lock() = delay;
    }

    pub fn set_fail_connect(&self, fail: bool) {
        self.fail_connect.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_subscribe(&self, fail: bool) {
        self.fail_subscribe.store(fail, Ordering::SeqCst);
    }

    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub fn last(&self) -> Option<Arc<MockRegistry>> {
        self.registries.lock().last().cloned()
    }
}

#[async_trait]
impl RegistryDriver for MockRegistryDriver {
    fn protocol(&self) -> &'static str {
        MOCK_PROTOCOL
    }

    async fn connect(&self, url: &ServiceEndpoint) -> Result<Arc<dyn Registry>, RegistryError> {
        let delay = *self.connect_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if self.fail_connect.load(Ordering::SeqCst) {
            return Err(RegistryError::Unavailable(url.address()));
        }

        let mut registry = MockRegistry::new(url.clone());
        registry.initial = self.initial.lock().clone();
        registry.fail_subscribe = self.fail_subscribe.load(Ordering::SeqCst);

        let registry = Arc::new(registry);
        self.registries.lock().push(registry.clone());
        self.created.fetch_add(1, Ordering::SeqCst);
        Ok(registry)
    }
}

type Behavior =
    dyn Fn(&str, &[serde_json::Value]) -> Result<RpcResponse, InvocationError> + Send + Sync;

#[derive(Default)]
struct Counters {
    created: AtomicUsize,
    destroyed: AtomicUsize,
    invocations: AtomicUsize,
}

/// Reference factory whose references answer through a closure, after an
/// optional delay.
pub struct MockReferenceFactory {
    behavior: Arc<Behavior>,
    delay: Duration,
    fail_refer: AtomicBool,
    counters: Arc<Counters>,
    specs: Mutex<Vec<ReferenceSpec>>,
}

impl Default for MockReferenceFactory {
    fn default() -> Self {
        Self::new(|method, _| Ok(RpcResponse::new(Some(serde_json::json!(method)))))
    }
}

impl MockReferenceFactory {
    pub fn new<F>(behavior: F) -> Self
    where
        F: Fn(&str, &[serde_json::Value]) -> Result<RpcResponse, InvocationError>
            + Send
            + Sync
            + 'static,
    {
        MockReferenceFactory {
            behavior: Arc::new(behavior),
            delay: Duration::ZERO,
            fail_refer: AtomicBool::new(false),
            counters: Arc::new(Counters::default()),
            specs: Mutex::new(vec![]),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn set_fail_refer(&self, fail: bool) {
        self.fail_refer.store(fail, Ordering::SeqCst);
    }

    pub fn created(&self) -> usize {
        self.counters.created.load(Ordering::SeqCst)
    }

    pub fn destroyed(&self) -> usize {
        self.counters.destroyed.load(Ordering::SeqCst)
    }

    pub fn invocations(&self) -> usize {
        self.counters.invocations.load(Ordering::SeqCst)
    }

    pub fn last_spec(&self) -> Option<ReferenceSpec> {
        self.specs.lock().last().cloned()
    }
}

#[async_trait]
impl ReferenceFactory for MockReferenceFactory {
    async fn refer(
        &self,
        spec: &ReferenceSpec,
    ) -> Result<Arc<dyn GenericReference>, InvocationError> {
        self.specs.lock().push(spec.clone());
        if self.fail_refer.load(Ordering::SeqCst) {
            return Err(InvocationError::Reference(format!("no reference for {}", spec)));
        }

        self.counters.created.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(MockReference {
            behavior: self.behavior.clone(),
            delay: self.delay,
            counters: self.counters.clone(),
        }))
    }
}

pub struct MockReference {
    behavior: Arc<Behavior>,
    delay: Duration,
    counters: Arc<Counters>,
}

#[async_trait]
impl GenericReference for MockReference {
    async fn invoke(
        &self,
        method: &str,
        _parameter_types: &[String],
        args: &[serde_json::Value],
    ) -> Result<RpcResponse, InvocationError> {
        self.counters.invocations.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        (self.behavior)(method, args)
    }

    async fn destroy(&self) {
        self.counters.destroyed.fetch_add(1, Ordering::SeqCst);
    }
}
