//! Static tunnel registry.
//!
//! Tunnels are keyed by `(address, target, proxy)` per network. A spec that
//! lists both networks expands to two independent entries before diffing.
//! The registry has its own lock: tunnel and inbound changes never touch
//! the same sockets, so they do not serialize against each other.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::net::SocketAddr;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use super::ReconcileReport;
use crate::listener::{new_tcp_tunnel, new_udp_tunnel, BoxListener, Ingress, Network, Target};

/// One configured tunnel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelSpec {
    pub networks: Vec<Network>,
    pub address: String,
    pub target: String,
    pub proxy: String,
}

impl TunnelSpec {
    /// Flattened `(network, key)` entries, one per listed network.
    pub fn entries(&self) -> impl Iterator<Item = (Network, TunnelKey)> + '_ {
        self.networks.iter().map(|network| {
            (
                *network,
                TunnelKey {
                    address: self.address.clone(),
                    target: self.target.clone(),
                    proxy: self.proxy.clone(),
                },
            )
        })
    }
}

/// Identity of a tunnel within one network.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TunnelKey {
    pub address: String,
    pub target: String,
    pub proxy: String,
}

impl fmt::Display for TunnelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.address, self.target, self.proxy)
    }
}

/// A running tunnel.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct TunnelStatus {
    pub network: Network,
    pub key: TunnelKey,
    pub bound: SocketAddr,
}

#[derive(Default)]
struct TunnelSet {
    tcp: HashMap<TunnelKey, BoxListener>,
    udp: HashMap<TunnelKey, BoxListener>,
}

impl TunnelSet {
    fn map(&mut self, network: Network) -> &mut HashMap<TunnelKey, BoxListener> {
        match network {
            Network::Tcp => &mut self.tcp,
            Network::Udp => &mut self.udp,
        }
    }

    fn entries(&self) -> BTreeSet<(Network, TunnelKey)> {
        self.tcp
            .keys()
            .map(|key| (Network::Tcp, key.clone()))
            .chain(self.udp.keys().map(|key| (Network::Udp, key.clone())))
            .collect()
    }
}

/// Owner of every running tunnel listener.
pub struct TunnelRegistry {
    ingress: Ingress,
    state: Mutex<TunnelSet>,
}

impl TunnelRegistry {
    pub fn new(ingress: Ingress) -> Self {
        Self {
            ingress,
            state: Mutex::new(TunnelSet::default()),
        }
    }

    /// Converge the running tunnels onto `desired`.
    ///
    /// A tunnel that fails to open is logged and skipped; the rest of the
    /// batch still applies.
    pub async fn patch(&self, desired: &[TunnelSpec]) -> ReconcileReport<(Network, TunnelKey)> {
        let mut state = self.state.lock().await;
        let wanted: Vec<(Network, TunnelKey)> = desired.iter().flat_map(|spec| spec.entries()).collect();
        let diff = portico_reconcile::diff(state.entries(), wanted);
        let mut report = ReconcileReport::default();

        for (network, key) in diff.need_close {
            if let Some(listener) = state.map(network).remove(&key) {
                if let Err(e) = listener.close().await {
                    warn!(network = %network, tunnel = %key, error = %e, "Tunnel close failed");
                }
            }
            info!(network = %network, tunnel = %key, "Tunnel closed");
            report.closed.push((network, key));
        }

        for (network, key) in diff.need_create {
            match self.open(network, &key).await {
                Ok(listener) => {
                    info!(
                        network = %network,
                        tunnel = %key,
                        bound = %listener.bound_address(),
                        "Tunnel created"
                    );
                    state.map(network).insert(key.clone(), listener);
                    report.created.push((network, key));
                }
                Err(reason) => {
                    error!(network = %network, tunnel = %key, error = %reason, "Tunnel create failed");
                    report.failed.push(((network, key), reason));
                }
            }
        }

        report
    }

    async fn open(&self, network: Network, key: &TunnelKey) -> Result<BoxListener, String> {
        let target: Target = key.target.parse()?;
        let opened = match network {
            Network::Tcp => new_tcp_tunnel(&key.address, target, &key.proxy, self.ingress.tcp.clone()).await,
            Network::Udp => new_udp_tunnel(&key.address, target, &key.proxy, self.ingress.udp.clone()).await,
        };
        opened.map_err(|e| e.to_string())
    }

    /// Running tunnels, sorted by network then key.
    pub async fn list(&self) -> Vec<TunnelStatus> {
        let state = self.state.lock().await;
        state
            .tcp
            .iter()
            .map(|(key, l)| (Network::Tcp, key, l))
            .chain(state.udp.iter().map(|(key, l)| (Network::Udp, key, l)))
            .map(|(network, key, listener)| TunnelStatus {
                network,
                key: key.clone(),
                bound: listener.bound_address(),
            })
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(networks: &[Network], address: &str) -> TunnelSpec {
        TunnelSpec {
            networks: networks.to_vec(),
            address: address.to_string(),
            target: "example.com:443".to_string(),
            proxy: "proxyA".to_string(),
        }
    }

    #[test]
    fn test_key_format() {
        let (network, key) = spec(&[Network::Tcp], ":9000").entries().next().unwrap();
        assert_eq!(network, Network::Tcp);
        assert_eq!(key.to_string(), ":9000/example.com:443/proxyA");
    }

    #[tokio::test]
    async fn test_patch_creates_and_removes_per_network() {
        let (ingress, _rx) = Ingress::channel(4);
        let registry = TunnelRegistry::new(ingress);

        let both = spec(&[Network::Tcp, Network::Udp], "127.0.0.1:0");
        let report = registry.patch(&[both]).await;
        assert_eq!(report.created.len(), 2);
        assert_eq!(registry.list().await.len(), 2);

        let tcp_only = spec(&[Network::Tcp], "127.0.0.1:0");
        let report = registry.patch(&[tcp_only.clone()]).await;
        assert_eq!(report.closed.len(), 1);
        assert_eq!(report.closed[0].0, Network::Udp);
        assert!(report.created.is_empty());

        let report = registry.patch(&[tcp_only]).await;
        assert!(report.is_noop());

        registry.patch(&[]).await;
        assert!(registry.list().await.is_empty());
    }

    #[tokio::test]
    async fn test_bad_tunnel_does_not_block_others() {
        let (ingress, _rx) = Ingress::channel(4);
        let registry = TunnelRegistry::new(ingress);

        let mut bad = spec(&[Network::Tcp], "127.0.0.1:0");
        bad.target = "no-port".to_string();
        let good = spec(&[Network::Udp], "127.0.0.1:0");

        let report = registry.patch(&[bad, good]).await;
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.created.len(), 1);
    }
}
