// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0

use std::collections::BTreeSet;
use std::sync::Arc;

use parking_lot::RwLock;
use probe_registry::{MethodInfo, ServiceEndpoint};
use serde::{Deserialize, Serialize};
use tracing::trace;

/// One provider of one interface, as seen through one registry.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ServiceInfo {
    pub registry_address: String,
    pub app_name: String,
    pub interface_name: String,
    pub version: String,
    pub group: Option<String>,
    pub provider_address: String,
    pub protocol: String,
    /// Unset until the provider has been introspected
    pub methods: Option<Vec<MethodInfo>>,
    pub endpoint: ServiceEndpoint,
}

impl ServiceInfo {
    pub fn from_endpoint(registry_address: &str, endpoint: &ServiceEndpoint) -> Self {
        ServiceInfo {
            registry_address: registry_address.to_string(),
            app_name: endpoint.application().to_string(),
            interface_name: endpoint.interface_name().to_string(),
            version: endpoint.version().to_string(),
            group: endpoint.group().map(str::to_string),
            provider_address: endpoint.address(),
            protocol: endpoint.protocol().to_string(),
            methods: None,
            endpoint: endpoint.clone(),
        }
    }

    /// Identity used to deduplicate entries of a registry
    pub fn same_identity(&self, other: &ServiceInfo) -> bool {
        self.registry_address == other.registry_address
            && self.provider_address == other.provider_address
            && self.interface_name == other.interface_name
    }

    fn is_service(&self, registry: &str, app: &str, iface: &str) -> bool {
        self.registry_address == registry && self.app_name == app && self.interface_name == iface
    }
}

/// Queryable snapshot of the services of every registry. Readers get an
/// immutable snapshot; writers replace it.
#[derive(Default)]
pub struct ServiceDirectory {
    services: RwLock<Arc<Vec<ServiceInfo>>>,
}

impl ServiceDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> Arc<Vec<ServiceInfo>> {
        self.services.read().clone()
    }

    fn update<F>(&self, f: F)
    where
        F: FnOnce(&mut Vec<ServiceInfo>),
    {
        let mut guard = self.services.write();
        let mut next = guard.as_ref().clone();
        f(&mut next);
        trace!(before = guard.len(), after = next.len(), "directory updated");
        *guard = Arc::new(next);
    }

    pub fn services(
        &self,
        registry: &str,
        app: Option<&str>,
        iface: Option<&str>,
    ) -> Vec<ServiceInfo> {
        self.snapshot()
            .iter()
            .filter(|s| s.registry_address == registry)
            .filter(|s| app.is_none_or(|a| s.app_name == a))
            .filter(|s| iface.is_none_or(|i| s.interface_name == i))
            .cloned()
            .collect()
    }

    /// Replace every entry of `registry`. An empty set only clears.
    pub fn set_services(&self, registry: &str, infos: Vec<ServiceInfo>) {
        self.update(|services| {
            services.retain(|s| s.registry_address != registry);
            services.extend(infos);
        });
    }

    /// Insert the given entries, replacing the ones with the same identity.
    pub fn add_services(&self, infos: Vec<ServiceInfo>) {
        self.update(|services| {
            for info in infos {
                match services.iter_mut().find(|s| s.same_identity(&info)) {
                    Some(existing) => *existing = info,
                    None => services.push(info),
                }
            }
        });
    }

    /// Drop the entries of `registry` sharing application and interface with
    /// any of `endpoints`.
    pub fn remove_by_endpoints(&self, registry: &str, endpoints: &[ServiceEndpoint]) {
        self.update(|services| {
            services.retain(|s| {
                !endpoints
                    .iter()
                    .any(|e| s.is_service(registry, e.application(), e.interface_name()))
            });
        });
    }

    /// Drop every entry of `registry` for `iface`, whatever the application.
    pub fn remove_interface(&self, registry: &str, iface: &str) {
        self.update(|services| {
            services.retain(|s| !(s.registry_address == registry && s.interface_name == iface));
        });
    }

    pub fn remove_registry(&self, registry: &str) {
        self.set_services(registry, vec![]);
    }

    /// Attach introspected methods to the entry of one provider.
    pub fn set_methods(
        &self,
        registry: &str,
        provider_address: &str,
        iface: &str,
        methods: Vec<MethodInfo>,
    ) -> bool {
        let mut found = false;
        self.update(|services| {
            for s in services.iter_mut().filter(|s| {
                s.registry_address == registry
                    && s.provider_address == provider_address
                    && s.interface_name == iface
            }) {
                s.methods = Some(methods.clone());
                found = true;
            }
        });
        found
    }

    fn collect<F>(&self, registry: &str, app: &str, iface: &str, f: F) -> Vec<String>
    where
        F: Fn(&ServiceInfo) -> Vec<String>,
    {
        self.snapshot()
            .iter()
            .filter(|s| s.is_service(registry, app, iface))
            .flat_map(f)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    pub fn app_names(&self, registry: &str) -> Vec<String> {
        self.snapshot()
            .iter()
            .filter(|s| s.registry_address == registry)
            .map(|s| s.app_name.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    pub fn interface_names(&self, registry: &str, app: &str) -> Vec<String> {
        self.snapshot()
            .iter()
            .filter(|s| s.registry_address == registry && s.app_name == app)
            .map(|s| s.interface_name.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    pub fn method_keys(&self, registry: &str, app: &str, iface: &str) -> Vec<String> {
        self.collect(registry, app, iface, |s| {
            s.methods
                .iter()
                .flatten()
                .map(|m| m.key().to_string())
                .collect()
        })
    }

    pub fn versions(&self, registry: &str, app: &str, iface: &str) -> Vec<String> {
        self.collect(registry, app, iface, |s| vec![s.version.clone()])
    }

    pub fn groups(&self, registry: &str, app: &str, iface: &str) -> Vec<String> {
        self.collect(registry, app, iface, |s| s.group.iter().cloned().collect())
    }

    pub fn provider_addresses(&self, registry: &str, app: &str, iface: &str) -> Vec<String> {
        self.collect(registry, app, iface, |s| vec![s.provider_address.clone()])
    }

    /// Every method matching `method_key`. Overloads whose argument types
    /// simplify to the same names share a key and are all returned.
    pub fn find_methods(
        &self,
        registry: &str,
        app: &str,
        iface: &str,
        method_key: &str,
        version: &str,
    ) -> Vec<MethodInfo> {
        let mut found: Vec<MethodInfo> = vec![];
        for s in self
            .snapshot()
            .iter()
            .filter(|s| s.is_service(registry, app, iface) && s.version == version)
        {
            for m in s.methods.iter().flatten().filter(|m| m.key() == method_key) {
                if !found.contains(m) {
                    found.push(m.clone());
                }
            }
        }
        found
    }

    /// First method matching `method_key`, see [`ServiceDirectory::find_methods`].
    pub fn find_method(
        &self,
        registry: &str,
        app: &str,
        iface: &str,
        method_key: &str,
        version: &str,
    ) -> Option<MethodInfo> {
        self.find_methods(registry, app, iface, method_key, version)
            .into_iter()
            .next()
    }
}
