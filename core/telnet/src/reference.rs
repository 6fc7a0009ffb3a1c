// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use probe_registry::endpoint::provider_address;
use probe_registry::{
    GenericReference, InvocationError, ReferenceFactory, ReferenceSpec, RpcResponse,
};
use rand::seq::IndexedRandom;
use tracing::debug;

use crate::client::TelnetClient;
use crate::errors::TelnetError;
use crate::pool::TelnetOptions;

/// Generic invocation through the `invoke` telnet command.
pub struct TelnetReferenceFactory {
    options: TelnetOptions,
}

impl TelnetReferenceFactory {
    pub fn new(options: TelnetOptions) -> Self {
        TelnetReferenceFactory { options }
    }

    fn pick_provider(spec: &ReferenceSpec) -> Result<String, InvocationError> {
        if let Some(provider) = spec.provider() {
            return provider_address(provider).map_err(|e| InvocationError::Reference(e.to_string()));
        }

        let candidates = spec.matching_candidates();
        candidates
            .choose(&mut rand::rng())
            .map(|e| e.address())
            .ok_or_else(|| InvocationError::NoProvider(spec.to_string()))
    }
}

#[async_trait]
impl ReferenceFactory for TelnetReferenceFactory {
    async fn refer(
        &self,
        spec: &ReferenceSpec,
    ) -> Result<Arc<dyn GenericReference>, InvocationError> {
        let address = Self::pick_provider(spec)?;
        let reference = TelnetReference::new(&address, spec.interface_name(), self.options);

        // fail early on an unreachable provider
        let client = reference
            .open()
            .await
            .map_err(|e| InvocationError::Reference(e.to_string()))?;
        reference.idle.lock().push(client);

        debug!(%address, %spec, "telnet reference created");
        Ok(Arc::new(reference))
    }
}

/// Reference bound to one provider. Every in-flight call owns a connection,
/// connections are kept for reuse between calls.
pub struct TelnetReference {
    address: String,
    interface: String,
    options: TelnetOptions,
    idle: Mutex<Vec<TelnetClient>>,
    destroyed: AtomicBool,
}

impl TelnetReference {
    pub fn new(address: &str, interface: &str, options: TelnetOptions) -> Self {
        TelnetReference {
            address: address.to_string(),
            interface: interface.to_string(),
            options,
            idle: Mutex::new(vec![]),
            destroyed: AtomicBool::new(false),
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn idle_connections(&self) -> usize {
        self.idle.lock().len()
    }

    async fn open(&self) -> Result<TelnetClient, TelnetError> {
        let client = TelnetClient::new(&self.address, self.options.command_timeout);
        client.connect(self.options.connect_wait).await?;
        Ok(client)
    }

    async fn checkout(&self) -> Result<TelnetClient, TelnetError> {
        loop {
            let client = self.idle.lock().pop();
            match client {
                Some(c) if c.state().is_connected() => return Ok(c),
                Some(_) => continue,
                None => return self.open().await,
            }
        }
    }
}

#[async_trait]
impl GenericReference for TelnetReference {
    async fn invoke(
        &self,
        method: &str,
        _parameter_types: &[String],
        args: &[serde_json::Value],
    ) -> Result<RpcResponse, InvocationError> {
        if self.destroyed.load(Ordering::Acquire) {
            return Err(InvocationError::Reference(format!(
                "reference to {} destroyed",
                self.address
            )));
        }

        let client = self
            .checkout()
            .await
            .map_err(|e| InvocationError::Rpc(e.to_string()))?;

        let res = client.invoke(&self.interface, method, args).await;

        let reusable = match &res {
            Err(e) => !e.is_connection_error(),
            Ok(_) => true,
        };
        if reusable && !self.destroyed.load(Ordering::Acquire) {
            self.idle.lock().push(client);
        } else {
            client.close().await;
        }

        match res {
            Ok(value) if value.is_null() => Ok(RpcResponse::new(None)),
            Ok(value) => Ok(RpcResponse::new(Some(value))),
            Err(e) => Err(InvocationError::Rpc(e.to_string())),
        }
    }

    async fn destroy(&self) {
        self.destroyed.store(true, Ordering::Release);
        let clients: Vec<_> = self.idle.lock().drain(..).collect();
        for client in clients {
            client.close().await;
        }
        debug!(address = %self.address, interface = %self.interface, "telnet reference destroyed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutils::{FakeProvider, GREETING_SERVICE};
    use probe_registry::ServiceEndpoint;
    use serde_json::json;

    fn candidates(addresses: &[&str]) -> Vec<ServiceEndpoint> {
        addresses
            .iter()
            .map(|a| {
                ServiceEndpoint::parse(&format!("dubbo://{}/{}?version=1.0", a, GREETING_SERVICE))
                    .unwrap()
            })
            .collect()
    }

    #[test]
    fn test_pick_provider() {
        let spec = ReferenceSpec::new(GREETING_SERVICE, "1.0")
            .with_candidates(candidates(&["10.0.0.1:20880", "10.0.0.2:20880"]));
        let picked = TelnetReferenceFactory::pick_provider(&spec).unwrap();
        assert!(picked == "10.0.0.1:20880" || picked == "10.0.0.2:20880");

        let spec = spec.with_provider(Some("dubbo://10.0.0.9:20880".into()));
        assert_eq!(
            TelnetReferenceFactory::pick_provider(&spec).unwrap(),
            "10.0.0.9:20880"
        );

        let spec = ReferenceSpec::new(GREETING_SERVICE, "2.0")
            .with_candidates(candidates(&["10.0.0.1:20880"]));
        assert!(matches!(
            TelnetReferenceFactory::pick_provider(&spec),
            Err(InvocationError::NoProvider(_))
        ));
    }

    #[tokio::test]
    async fn test_invoke_through_reference() {
        let provider = FakeProvider::greeting().await.unwrap();
        let factory = TelnetReferenceFactory::new(TelnetOptions::default());
        let spec = ReferenceSpec::new(GREETING_SERVICE, "1.0")
            .with_provider(Some(provider.address().to_string()));

        let reference = factory.refer(&spec).await.unwrap();
        let response = reference
            .invoke("greet", &["java.lang.String".to_string()], &[json!("alice")])
            .await
            .unwrap();
        assert_eq!(response.value, Some(json!("hello alice")));

        let response = reference.invoke("ping", &[], &[]).await.unwrap();
        assert_eq!(response.value, None);

        let err = reference.invoke("missing", &[], &[]).await.unwrap_err();
        assert!(matches!(err, InvocationError::Rpc(m) if m.contains("No such method")));

        reference.destroy().await;
        assert!(reference.invoke("ping", &[], &[]).await.is_err());
    }

    #[tokio::test]
    async fn test_parallel_calls_open_more_connections() {
        let provider = FakeProvider::greeting().await.unwrap();
        let reference = Arc::new(TelnetReference::new(
            provider.address(),
            GREETING_SERVICE,
            TelnetOptions::default(),
        ));

        let mut handles = vec![];
        for i in 0..3 {
            let reference = reference.clone();
            handles.push(tokio::spawn(async move {
                reference
                    .invoke("greet", &[], &[json!(format!("u{}", i))])
                    .await
            }));
        }
        for h in handles {
            assert!(h.await.unwrap().is_ok());
        }

        assert!(reference.idle_connections() >= 1);
        assert_eq!(reference.idle_connections(), provider.connections());
    }

    #[tokio::test]
    async fn test_unreachable_provider() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let address = listener.local_addr().unwrap().to_string();
        drop(listener);

        let factory = TelnetReferenceFactory::new(TelnetOptions::default());
        let spec = ReferenceSpec::new(GREETING_SERVICE, "").with_provider(Some(address));
        assert!(matches!(
            factory.refer(&spec).await,
            Err(InvocationError::Reference(_))
        ));
    }
}
