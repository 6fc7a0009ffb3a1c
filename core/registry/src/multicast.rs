// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0

//! Registry driver for `multicast://group:port` addresses.
//!
//! Providers announce themselves with `register <url>` datagrams and leave
//! with `unregister <url>`. Consumers announce `subscribe <url>`, which
//! makes live providers register again.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::endpoint::{PROVIDERS_CATEGORY, ServiceEndpoint};
use crate::errors::RegistryError;
use crate::registry::{NotifyListener, Registry, RegistryDriver};

pub const MULTICAST_PROTOCOL: &str = "multicast";
pub const DEFAULT_MULTICAST_PORT: u16 = 1234;

const REGISTER: &str = "register";
const UNREGISTER: &str = "unregister";
const SUBSCRIBE: &str = "subscribe";

const MAX_DATAGRAM: usize = 64 * 1024;

type Notification = (Arc<dyn NotifyListener>, Vec<ServiceEndpoint>);

struct Subscriber {
    url: ServiceEndpoint,
    listener: Arc<dyn NotifyListener>,
}

/// Providers seen on the group, per interface, and the local subscribers.
#[derive(Default)]
struct ProviderTable {
    providers: HashMap<String, Vec<ServiceEndpoint>>,
    subscribers: Vec<Subscriber>,
}

impl ProviderTable {
    fn register(&mut self, url: ServiceEndpoint) -> Vec<Notification> {
        if url.is_empty_marker() || url.category() != PROVIDERS_CATEGORY {
            return vec![];
        }

        let list = self
            .providers
            .entry(url.interface_name().to_string())
            .or_default();

        match list.iter_mut().find(|e| e.same_instance(&url)) {
            Some(existing) if *existing == url => return vec![],
            Some(existing) => *existing = url.clone(),
            None => list.push(url.clone()),
        }

        let list = list.clone();
        self.notifications(&url, list)
    }

    fn unregister(&mut self, url: ServiceEndpoint) -> Vec<Notification> {
        let iface = url.interface_name().to_string();
        let Some(list) = self.providers.get_mut(&iface) else {
            return vec![];
        };

        let before = list.len();
        list.retain(|e| !e.same_instance(&url));
        if list.len() == before {
            return vec![];
        }

        let pushed = if list.is_empty() {
            self.providers.remove(&iface);
            vec![url.empty_marker()]
        } else {
            list.clone()
        };

        self.notifications(&url, pushed)
    }

    fn subscribe(
        &mut self,
        url: ServiceEndpoint,
        listener: Arc<dyn NotifyListener>,
    ) -> Vec<Notification> {
        let replay = self
            .providers
            .values()
            .filter_map(|list| {
                let matching: Vec<_> = list.iter().filter(|e| e.is_match(&url)).cloned().collect();
                (!matching.is_empty()).then(|| (listener.clone(), matching))
            })
            .collect();

        self.subscribers.push(Subscriber { url, listener });
        replay
    }

    fn notifications(
        &self,
        changed: &ServiceEndpoint,
        pushed: Vec<ServiceEndpoint>,
    ) -> Vec<Notification> {
        self.subscribers
            .iter()
            .filter(|s| changed.is_match(&s.url))
            .map(|s| (s.listener.clone(), pushed.clone()))
            .collect()
    }
}

fn deliver(notifications: Vec<Notification>) {
    for (listener, urls) in notifications {
        listener.notify(urls);
    }
}

/// Apply one datagram to the table and notify the affected subscribers.
fn handle_message(table: &Mutex<ProviderTable>, msg: &str) {
    let msg = msg.trim();
    let Some((verb, rest)) = msg.split_once(char::is_whitespace) else {
        debug!(%msg, "ignoring multicast message");
        return;
    };

    let url = match ServiceEndpoint::parse(rest) {
        Ok(url) => url,
        Err(e) => {
            warn!(%msg, "invalid url in multicast message: {}", e);
            return;
        }
    };

    // listeners run without the lock held
    let notifications = match verb {
        REGISTER => table.lock().register(url),
        UNREGISTER => table.lock().unregister(url),
        SUBSCRIBE => {
            trace!(%url, "subscribe from another consumer");
            vec![]
        }
        _ => {
            debug!(%verb, "unknown multicast verb");
            vec![]
        }
    };

    deliver(notifications);
}

fn group_address(url: &ServiceEndpoint) -> Result<SocketAddr, RegistryError> {
    let ip: Ipv4Addr = url.host().parse().map_err(|_| {
        RegistryError::invalid_url(&url.to_string(), "multicast group must be an ipv4 address")
    })?;

    if !ip.is_multicast() {
        return Err(RegistryError::invalid_url(
            &url.to_string(),
            "address is not in the multicast range 224.0.0.0 - 239.255.255.255",
        ));
    }

    let port = match url.port() {
        0 => DEFAULT_MULTICAST_PORT,
        p => p,
    };

    Ok(SocketAddr::new(IpAddr::V4(ip), port))
}

fn create_socket(group: SocketAddr) -> Result<UdpSocket, RegistryError> {
    let IpAddr::V4(ip) = group.ip() else {
        return Err(RegistryError::Unavailable(
            "only ipv4 multicast groups are supported".to_string(),
        ));
    };

    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    // not available everywhere
    let _ = socket.set_reuse_port(true);
    socket.set_multicast_ttl_v4(1)?;
    socket.set_multicast_loop_v4(true)?;

    let bind = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), group.port());
    socket.bind(&bind.into())?;
    socket.join_multicast_v4(&ip, &Ipv4Addr::UNSPECIFIED)?;
    socket.set_nonblocking(true)?;

    let std_socket: std::net::UdpSocket = socket.into();
    Ok(UdpSocket::from_std(std_socket)?)
}

pub struct MulticastRegistry {
    url: ServiceEndpoint,
    group: SocketAddr,
    socket: Arc<UdpSocket>,
    table: Arc<Mutex<ProviderTable>>,
    cancel: CancellationToken,
    available: AtomicBool,
}

impl MulticastRegistry {
    async fn connect(url: &ServiceEndpoint) -> Result<Self, RegistryError> {
        let group = group_address(url)?;
        let socket = Arc::new(create_socket(group)?);
        let table = Arc::new(Mutex::new(ProviderTable::default()));
        let cancel = CancellationToken::new();

        Self::spawn_receiver(socket.clone(), table.clone(), cancel.clone());
        info!(%group, "joined multicast registry group");

        Ok(MulticastRegistry {
            url: url.clone(),
            group,
            socket,
            table,
            cancel,
            available: AtomicBool::new(true),
        })
    }

    fn spawn_receiver(
        socket: Arc<UdpSocket>,
        table: Arc<Mutex<ProviderTable>>,
        cancel: CancellationToken,
    ) {
        tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_DATAGRAM];
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("multicast receiver stopped");
                        break;
                    }
                    res = socket.recv_from(&mut buf) => {
                        match res {
                            Ok((len, src)) => {
                                let msg = String::from_utf8_lossy(&buf[..len]);
                                trace!(%src, %msg, "multicast datagram");
                                handle_message(&table, &msg);
                            }
                            Err(e) => {
                                error!("error receiving multicast datagram: {}", e);
                            }
                        }
                    }
                }
            }
        });
    }

    async fn broadcast(&self, msg: String) -> Result<(), RegistryError> {
        self.socket.send_to(msg.as_bytes(), self.group).await?;
        Ok(())
    }
}

#[async_trait]
impl Registry for MulticastRegistry {
    fn url(&self) -> &ServiceEndpoint {
        &self.url
    }

    async fn subscribe(
        &self,
        url: &ServiceEndpoint,
        listener: Arc<dyn NotifyListener>,
    ) -> Result<(), RegistryError> {
        if !self.is_available() {
            return Err(RegistryError::Destroyed(self.url.to_string()));
        }

        let replay = self.table.lock().subscribe(url.clone(), listener);

        self.broadcast(format!("{} {}", SUBSCRIBE, url))
            .await
            .map_err(|e| RegistryError::SubscribeError(e.to_string()))?;

        deliver(replay);
        Ok(())
    }

    fn is_available(&self) -> bool {
        self.available.load(Ordering::Acquire)
    }

    async fn destroy(&self) {
        if !self.available.swap(false, Ordering::AcqRel) {
            return;
        }

        self.cancel.cancel();
        if let IpAddr::V4(ip) = self.group.ip() {
            if let Err(e) = self.socket.leave_multicast_v4(ip, Ipv4Addr::UNSPECIFIED) {
                debug!(group = %self.group, "error leaving multicast group: {}", e);
            }
        }
        info!(group = %self.group, "left multicast registry group");
    }
}

impl Drop for MulticastRegistry {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

pub struct MulticastRegistryDriver;

#[async_trait]
impl RegistryDriver for MulticastRegistryDriver {
    fn protocol(&self) -> &'static str {
        MULTICAST_PROTOCOL
    }

    async fn connect(&self, url: &ServiceEndpoint) -> Result<Arc<dyn Registry>, RegistryError> {
        let registry = MulticastRegistry::connect(url).await?;
        Ok(Arc::new(registry))
    }
}
