//! Shared helpers for integration tests.

#![allow(dead_code)]

use std::net::{SocketAddr, TcpListener, UdpSocket};
use std::path::PathBuf;
use std::sync::Arc;

use portico::hub::{Hub, Overrides};
use portico::listener::{Ingress, IngressReceivers};
use portico::log::LogHandle;
use portico::manager::ListenerManager;
use portico::statistic::StatisticManager;
use portico_events::Observable;

/// A loopback port currently free for both TCP and UDP.
pub fn free_port() -> u16 {
    loop {
        let tcp = TcpListener::bind("127.0.0.1:0").expect("bind probe listener");
        let port = tcp.local_addr().expect("probe address").port();
        if UdpSocket::bind(("127.0.0.1", port)).is_ok() {
            return port;
        }
    }
}

/// True if a TCP listener can be bound on `addr` right now.
pub fn probe_bind(addr: SocketAddr) -> bool {
    TcpListener::bind(addr).is_ok()
}

/// True if a UDP socket can be bound on `addr` right now.
pub fn probe_bind_udp(addr: SocketAddr) -> bool {
    UdpSocket::bind(addr).is_ok()
}

pub fn loopback(port: u16) -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], port))
}

/// Manager with the built-in drivers. The receivers must be kept alive
/// for the ingress channels to stay open.
pub fn manager() -> (Arc<ListenerManager>, IngressReceivers) {
    let (ingress, receivers) = Ingress::channel(16);
    (Arc::new(ListenerManager::new(ingress)), receivers)
}

pub fn hub() -> (Arc<Hub>, IngressReceivers) {
    let (manager, receivers) = manager();
    let hub = Hub::new(
        manager,
        StatisticManager::new(),
        LogHandle::detached(Observable::new(16)),
        PathBuf::from("portico-test.yaml"),
        Overrides::default(),
    );
    (Arc::new(hub), receivers)
}

pub fn temp_dir(prefix: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("{prefix}-{}", uuid::Uuid::new_v4()));
    std::fs::create_dir_all(&dir).expect("create temp dir");
    dir
}
