//! Protocol listener set and its two reconciliation entry points.

use std::collections::{BTreeSet, HashMap};
use std::net::SocketAddr;

use tokio::sync::Mutex;
use tracing::{error, info, warn};

use super::{ReconcileReport, TunnelRegistry};
use crate::inbound::{InboundSpec, Ports, WILDCARD_HOST};
use crate::listener::{BoxListener, DriverRegistry, Ingress};

/// Host and LAN policy applied to legacy port listeners.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LegacyBinding {
    pub allow_lan: bool,
    pub bind_host: String,
}

impl Default for LegacyBinding {
    fn default() -> Self {
        Self {
            allow_lan: false,
            bind_host: WILDCARD_HOST.to_string(),
        }
    }
}

/// Live state of one inbound.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundStatus {
    pub spec: InboundSpec,
    pub tcp: Option<SocketAddr>,
    pub udp: Option<SocketAddr>,
}

#[derive(Default)]
struct ListenerSet {
    tcp: HashMap<InboundSpec, BoxListener>,
    udp: HashMap<InboundSpec, BoxListener>,
    legacy: LegacyBinding,
}

impl ListenerSet {
    /// Union of the TCP and UDP keys, in a stable order.
    fn specs(&self) -> BTreeSet<InboundSpec> {
        self.tcp.keys().chain(self.udp.keys()).cloned().collect()
    }
}

/// Owner of every protocol listener and static tunnel.
pub struct ListenerManager {
    drivers: DriverRegistry,
    ingress: Ingress,
    state: Mutex<ListenerSet>,
    tunnels: TunnelRegistry,
}

impl ListenerManager {
    /// Manager using the built-in protocol drivers.
    pub fn new(ingress: Ingress) -> Self {
        Self::with_drivers(DriverRegistry::builtin(), ingress)
    }

    pub fn with_drivers(drivers: DriverRegistry, ingress: Ingress) -> Self {
        Self {
            tunnels: TunnelRegistry::new(ingress.clone()),
            drivers,
            ingress,
            state: Mutex::new(ListenerSet::default()),
        }
    }

    pub fn tunnels(&self) -> &TunnelRegistry {
        &self.tunnels
    }

    /// Replace the explicitly configured inbounds.
    ///
    /// Running legacy port listeners are carried over into the desired set
    /// and therefore left untouched.
    pub async fn re_create_listeners(&self, desired: &[InboundSpec]) -> ReconcileReport<InboundSpec> {
        let mut state = self.state.lock().await;

        let mut target: Vec<InboundSpec> = desired.to_vec();
        target.extend(state.specs().into_iter().filter(|spec| spec.is_from_port_cfg));

        self.reconcile(&mut state, target).await
    }

    /// Replace the legacy port listeners.
    ///
    /// Running explicit inbounds are carried over into the desired set and
    /// therefore left untouched.
    pub async fn recreate_ports_listeners(&self, ports: Ports) -> ReconcileReport<InboundSpec> {
        let mut state = self.state.lock().await;

        let mut target: Vec<InboundSpec> = state
            .specs()
            .into_iter()
            .filter(|spec| !spec.is_from_port_cfg)
            .collect();
        target.extend(ports.to_inbounds(&state.legacy.bind_host, state.legacy.allow_lan));

        self.reconcile(&mut state, target).await
    }

    /// Update the host and LAN policy used by the next
    /// [`recreate_ports_listeners`](Self::recreate_ports_listeners).
    pub async fn set_legacy_binding(&self, binding: LegacyBinding) {
        self.state.lock().await.legacy = binding;
    }

    pub async fn legacy_binding(&self) -> LegacyBinding {
        self.state.lock().await.legacy.clone()
    }

    /// Explicit inbounds, sorted. Legacy port listeners are excluded.
    pub async fn inbounds(&self) -> Vec<InboundSpec> {
        let state = self.state.lock().await;
        state
            .specs()
            .into_iter()
            .filter(|spec| !spec.is_from_port_cfg)
            .collect()
    }

    /// Every running inbound, legacy ones included.
    pub async fn all_inbounds(&self) -> Vec<InboundSpec> {
        self.state.lock().await.specs().into_iter().collect()
    }

    /// Bound addresses of every running inbound.
    pub async fn status(&self) -> Vec<InboundStatus> {
        let state = self.state.lock().await;
        state
            .specs()
            .into_iter()
            .map(|spec| InboundStatus {
                tcp: state.tcp.get(&spec).map(|l| l.bound_address()),
                udp: state.udp.get(&spec).map(|l| l.bound_address()),
                spec,
            })
            .collect()
    }

    /// Close every listener and tunnel.
    pub async fn close_all(&self) {
        {
            let mut state = self.state.lock().await;
            let current: Vec<InboundSpec> = state.specs().into_iter().collect();
            for spec in &current {
                close_spec(&mut state, spec).await;
            }
        }
        self.tunnels.patch(&[]).await;
    }

    async fn reconcile(
        &self,
        state: &mut ListenerSet,
        desired: Vec<InboundSpec>,
    ) -> ReconcileReport<InboundSpec> {
        let diff = portico_reconcile::diff(state.specs(), desired);
        let mut report = ReconcileReport::default();

        // All closes complete before any create.
        for spec in diff.need_close {
            close_spec(state, &spec).await;
            info!(inbound = %spec, legacy = spec.is_from_port_cfg, "Inbound closed");
            report.closed.push(spec);
        }

        for spec in diff.need_create {
            match self.drivers.open(&spec, &self.ingress).await {
                Ok((tcp, udp)) => {
                    let bound = tcp
                        .as_ref()
                        .or(udp.as_ref())
                        .map(|l| l.bound_address().to_string())
                        .unwrap_or_default();
                    if let Some(tcp) = tcp {
                        state.tcp.insert(spec.clone(), tcp);
                    }
                    if let Some(udp) = udp {
                        state.udp.insert(spec.clone(), udp);
                    }
                    info!(inbound = %spec, bound = %bound, legacy = spec.is_from_port_cfg, "Inbound created");
                    report.created.push(spec);
                }
                Err(e) => {
                    error!(inbound = %spec, error = %e, "Inbound create failed");
                    report.failed.push((spec, e.to_string()));
                }
            }
        }

        report
    }
}

/// Close both transports of `spec` and drop the entries whatever the
/// outcome of the close.
async fn close_spec(state: &mut ListenerSet, spec: &InboundSpec) {
    if let Some(tcp) = state.tcp.remove(spec) {
        if let Err(e) = tcp.close().await {
            warn!(inbound = %spec, network = "tcp", error = %e, "Inbound close failed");
        }
    }
    if let Some(udp) = state.udp.remove(spec) {
        if let Err(e) = udp.close().await {
            warn!(inbound = %spec, network = "udp", error = %e, "Inbound close failed");
        }
    }
}
