// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::json;
use tracing_test::traced_test;

use probe_registry::testutils::{MockRegistry, MockRegistryDriver};
use probe_registry::{CachingRegistryFactory, ServiceEndpoint};
use probe_service::{
    ClientConfiguration, ClientRegistry, ConcurrentSpec, ConnectionListener, Execution,
    InvocationRequest, RegistryAddress, ServiceError, UrlState,
};
use probe_telnet::testutils::{FakeProvider, GREETING_SERVICE};
use probe_telnet::{TelnetError, TelnetReferenceFactory};

const REGISTRY: &str = "mock://127.0.0.1:2181";

#[derive(Default)]
struct Changes {
    seen: Mutex<Vec<(usize, UrlState)>>,
}

impl ConnectionListener for Changes {
    fn on_url_changed(&self, _address: &str, endpoints: &[ServiceEndpoint], state: UrlState) {
        self.seen.lock().push((endpoints.len(), state));
    }
}

fn endpoint(address: &str, iface: &str) -> ServiceEndpoint {
    ServiceEndpoint::parse(&format!(
        "dubbo://{}/{}?application=A&interface={}&version=1.0&release=2.7.8",
        address, iface, iface
    ))
    .unwrap()
}

async fn connected(
    initial: Vec<ServiceEndpoint>,
    listener: Arc<dyn ConnectionListener>,
) -> (ClientRegistry, Arc<MockRegistry>) {
    let config = ClientConfiguration::new();
    let driver = Arc::new(MockRegistryDriver::new().with_initial(initial));
    let references = Arc::new(TelnetReferenceFactory::new(
        config.introspection().telnet_options(),
    ));
    let client = ClientRegistry::with_factories(
        config,
        Arc::new(CachingRegistryFactory::new().with_driver(driver.clone())),
        references,
    );

    client
        .connect(RegistryAddress::new(REGISTRY), listener)
        .await
        .unwrap();
    let registry = driver.last().unwrap();
    (client, registry)
}

#[tokio::test]
async fn test_providers_listed_without_methods() {
    let changes = Arc::new(Changes::default());
    let (client, _registry) = connected(
        vec![
            endpoint("host1:20880", "org.demo.Foo"),
            endpoint("host2:20880", "org.demo.Foo"),
        ],
        changes.clone(),
    )
    .await;

    let services = client.services(REGISTRY, None, None).unwrap();
    assert_eq!(services.len(), 2);
    assert!(services.iter().all(|s| s.methods.is_none()));
    assert_eq!(
        client
            .directory()
            .provider_addresses(REGISTRY, "A", "org.demo.Foo"),
        vec!["host1:20880".to_string(), "host2:20880".to_string()]
    );
    assert_eq!(*changes.seen.lock(), vec![(2, UrlState::Add)]);
}

#[tokio::test]
async fn test_empty_marker_removes_interface() {
    let (client, registry) = connected(
        vec![
            endpoint("host1:20880", "org.demo.Foo"),
            endpoint("host2:20880", "org.demo.Foo"),
            endpoint("host1:20880", "org.demo.Bar"),
        ],
        Arc::new(Changes::default()),
    )
    .await;

    let marker = endpoint("host1:20880", "org.demo.Foo").empty_marker();
    registry.push(vec![marker.clone()]);
    assert!(client
        .services(REGISTRY, None, Some("org.demo.Foo"))
        .unwrap()
        .is_empty());

    // providers come back, then leave again
    registry.push(vec![endpoint("host3:20880", "org.demo.Foo")]);
    assert_eq!(
        client.services(REGISTRY, None, Some("org.demo.Foo")).unwrap().len(),
        1
    );
    registry.push(vec![marker]);
    assert!(client
        .services(REGISTRY, None, Some("org.demo.Foo"))
        .unwrap()
        .is_empty());

    assert_eq!(
        client.services(REGISTRY, None, Some("org.demo.Bar")).unwrap().len(),
        1
    );
}

#[tokio::test]
#[traced_test]
async fn test_introspection_fills_methods() {
    let provider = FakeProvider::greeting().await.unwrap();
    let (client, _registry) = connected(
        vec![endpoint(provider.address(), GREETING_SERVICE)],
        Arc::new(Changes::default()),
    )
    .await;

    let info = client.services(REGISTRY, None, None).unwrap().remove(0);
    let info = client.get_service_info(&info).await.unwrap();
    assert_eq!(info.methods.as_ref().map(Vec::len), Some(2));

    assert_eq!(
        client
            .directory()
            .method_keys(REGISTRY, "A", GREETING_SERVICE),
        vec!["greet(String)".to_string(), "ping()".to_string()]
    );
    let greet = client
        .directory()
        .find_method(REGISTRY, "A", GREETING_SERVICE, "greet(String)", "1.0")
        .unwrap();
    assert_eq!(greet.argument_types(), ["java.lang.String".to_string()]);

    // already introspected, no new command
    let before = provider.commands().len();
    client.get_service_info(&info).await.unwrap();
    assert_eq!(provider.commands().len(), before);
    assert!(logs_contain("methods introspected"));
}

#[tokio::test]
async fn test_no_such_service_leaves_methods_unset() {
    let provider = FakeProvider::greeting().await.unwrap();
    let (client, _registry) = connected(
        vec![endpoint(provider.address(), "org.demo.Foo")],
        Arc::new(Changes::default()),
    )
    .await;

    let info = client.services(REGISTRY, None, None).unwrap().remove(0);
    let res = client.get_service_info(&info).await;
    assert!(matches!(
        res,
        Err(ServiceError::Introspection(TelnetError::NoSuchService(_)))
    ));

    let services = client.services(REGISTRY, None, None).unwrap();
    assert_eq!(services.len(), 1);
    assert!(services[0].methods.is_none());
}

#[tokio::test]
async fn test_invoke_through_telnet() {
    let provider = FakeProvider::greeting().await.unwrap();
    let (client, _registry) = connected(
        vec![endpoint(provider.address(), GREETING_SERVICE)],
        Arc::new(Changes::default()),
    )
    .await;

    let request = InvocationRequest::new("A", GREETING_SERVICE, "greet", "1.0")
        .with_parameter("java.lang.String", json!("dave"));
    let result = client.invoke(REGISTRY, &request).await.unwrap();
    assert_eq!(result.data, Some(json!("hello dave")));

    let unknown = InvocationRequest::new("A", GREETING_SERVICE, "wave", "1.0");
    let result = client.invoke(REGISTRY, &unknown).await.unwrap();
    assert!(result.exception.is_some());

    let batch = match client
        .execute(REGISTRY, request, ConcurrentSpec::new(6, 3))
        .await
        .unwrap()
    {
        Execution::Batch(batch) => batch,
        Execution::Single(_) => panic!("batch expected"),
    };
    let results = batch.collect().await;
    assert_eq!(results.len(), 6);
    assert!(results
        .iter()
        .all(|r| r.data == Some(json!("hello dave"))));

    let history = client
        .last_invocation("A", GREETING_SERVICE, "greet(String)", "1.0")
        .unwrap();
    assert_eq!(history.parameters[0].value, json!("dave"));

    client.dispose().await;
}

#[tokio::test]
async fn test_invoke_without_provider() {
    let (client, _registry) = connected(vec![], Arc::new(Changes::default())).await;

    let request = InvocationRequest::new("A", GREETING_SERVICE, "ping", "1.0");
    let result = client.invoke(REGISTRY, &request).await.unwrap();
    assert!(matches!(
        result.exception,
        Some(probe_registry::InvocationError::NoProvider(_))
    ));
}
