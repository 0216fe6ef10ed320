//! Protocol listener drivers.
//!
//! This module provides:
//! - The [`ListenerHandle`] contract every bound listener implements
//! - One driver per inbound type (HTTP, SOCKS, Redir, TProxy, Mixed)
//! - Static tunnel listeners (fixed target through a named outbound)
//! - The [`DriverRegistry`] mapping inbound types to TCP/UDP drivers
//!
//! ## Architecture
//!
//! ```text
//! Client -> Driver accept loop -> Handshake -> ConnContext -> TCP ingress
//!        -> Driver recv loop   -> Decode    -> PacketAdapter -> UDP ingress
//! ```
//!
//! Constructors return as soon as the socket is bound; the accept loop runs
//! on its own task until [`ListenerHandle::close`].

mod context;
mod http;
mod mixed;
mod redir;
pub(crate) mod socks;
mod tcp;
mod tproxy;
mod tunnel;
mod udp;

use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

pub use context::{
    ConnContext, ConnType, Ingress, IngressReceivers, Metadata, Network, PacketAdapter, PacketFraming,
    PacketReply, Target, TcpIn, UdpIn, DEFAULT_INGRESS_CAPACITY,
};
pub use tunnel::{new_tcp_tunnel, new_udp_tunnel};

use crate::inbound::{split_host_port, InboundSpec, InboundType, WILDCARD_HOST};

/// Errors raised while opening or closing listeners.
#[derive(Debug, Error)]
pub enum ListenerError {
    /// The bind address has a zero, empty or unparsable port.
    #[error("invalid port in address `{0}`")]
    InvalidPort(String),

    /// No driver is registered for the inbound type.
    #[error("unsupported inbound type: {0}")]
    UnsupportedInboundType(InboundType),

    /// The bind address could not be resolved.
    #[error("invalid address `{addr}`: {reason}")]
    InvalidAddress { addr: String, reason: String },

    /// The OS refused to bind the socket.
    #[error("bind {network} `{addr}`: {source}")]
    Bind {
        network: Network,
        addr: String,
        #[source]
        source: io::Error,
    },

    /// Any other socket error.
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Per-connection protocol failures. Local to the connection.
#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("io: {0}")]
    Io(#[from] io::Error),

    #[error("protocol: {0}")]
    Protocol(String),

    #[error("ingress channel closed")]
    IngressClosed,
}

impl HandshakeError {
    pub(crate) fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }
}

/// A bound protocol listener.
#[async_trait]
pub trait ListenerHandle: Send + Sync {
    /// The address as requested, before OS resolution.
    fn configured_address(&self) -> &str;

    /// The address the OS actually bound.
    fn bound_address(&self) -> SocketAddr;

    /// Stop the accept loop and release the socket.
    ///
    /// Idempotent: closing an already closed listener returns `Ok(())`.
    /// When this returns the listening socket has been released.
    async fn close(&self) -> Result<(), ListenerError>;
}

impl std::fmt::Debug for dyn ListenerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerHandle")
            .field("configured", &self.configured_address())
            .field("bound", &self.bound_address())
            .finish()
    }
}

/// Boxed listener handle as stored by the manager.
pub type BoxListener = Box<dyn ListenerHandle>;

/// Creates the TCP form of an inbound type.
#[async_trait]
pub trait TcpDriver: Send + Sync {
    async fn listen(&self, addr: &str, tcp_in: TcpIn) -> Result<BoxListener, ListenerError>;
}

/// Creates the UDP form of an inbound type.
#[async_trait]
pub trait UdpDriver: Send + Sync {
    async fn listen(&self, addr: &str, udp_in: UdpIn) -> Result<BoxListener, ListenerError>;
}

/// Inbound type to driver table.
#[derive(Clone, Default)]
pub struct DriverRegistry {
    tcp: HashMap<InboundType, Arc<dyn TcpDriver>>,
    udp: HashMap<InboundType, Arc<dyn UdpDriver>>,
}

impl DriverRegistry {
    /// An empty registry. Every inbound type is unsupported.
    pub fn empty() -> Self {
        Self::default()
    }

    /// The built-in drivers.
    ///
    /// | type   | tcp    | udp        |
    /// |--------|--------|------------|
    /// | http   | http   | -          |
    /// | socks  | socks  | socks      |
    /// | redir  | redir  | tproxy     |
    /// | tproxy | tproxy | tproxy     |
    /// | mixed  | mixed  | socks      |
    pub fn builtin() -> Self {
        let mut registry = Self::empty();
        registry
            .register_tcp(InboundType::Http, Arc::new(http::HttpDriver))
            .register_tcp(InboundType::Socks, Arc::new(socks::SocksDriver))
            .register_tcp(InboundType::Redir, Arc::new(redir::RedirDriver))
            .register_tcp(InboundType::Tproxy, Arc::new(tproxy::TproxyDriver))
            .register_tcp(InboundType::Mixed, Arc::new(mixed::MixedDriver))
            .register_udp(InboundType::Socks, Arc::new(socks::SocksUdpDriver))
            .register_udp(InboundType::Redir, Arc::new(tproxy::TproxyUdpDriver))
            .register_udp(InboundType::Tproxy, Arc::new(tproxy::TproxyUdpDriver))
            .register_udp(InboundType::Mixed, Arc::new(socks::SocksUdpDriver));
        registry
    }

    pub fn register_tcp(&mut self, inbound_type: InboundType, driver: Arc<dyn TcpDriver>) -> &mut Self {
        self.tcp.insert(inbound_type, driver);
        self
    }

    pub fn register_udp(&mut self, inbound_type: InboundType, driver: Arc<dyn UdpDriver>) -> &mut Self {
        self.udp.insert(inbound_type, driver);
        self
    }

    /// Open the TCP and UDP listeners of `spec`.
    ///
    /// Either both configured forms are bound or neither is: when the UDP
    /// form fails after the TCP form was bound, the TCP listener is closed
    /// before the error is returned.
    pub async fn open(
        &self,
        spec: &InboundSpec,
        ingress: &Ingress,
    ) -> Result<(Option<BoxListener>, Option<BoxListener>), ListenerError> {
        if spec.port().is_none() {
            return Err(ListenerError::InvalidPort(spec.bind_address.clone()));
        }

        let tcp_driver = self.tcp.get(&spec.inbound_type);
        let udp_driver = self.udp.get(&spec.inbound_type);
        if tcp_driver.is_none() && udp_driver.is_none() {
            return Err(ListenerError::UnsupportedInboundType(spec.inbound_type));
        }

        let tcp = match tcp_driver {
            Some(driver) => Some(driver.listen(&spec.bind_address, ingress.tcp.clone()).await?),
            None => None,
        };

        let udp = match udp_driver {
            Some(driver) => match driver.listen(&spec.bind_address, ingress.udp.clone()).await {
                Ok(listener) => Some(listener),
                Err(e) => {
                    if let Some(tcp) = tcp {
                        if let Err(close_err) = tcp.close().await {
                            tracing::warn!(
                                inbound = %spec.alias(),
                                error = %close_err,
                                "Failed to roll back tcp listener"
                            );
                        }
                    }
                    return Err(e);
                }
            },
            None => None,
        };

        Ok((tcp, udp))
    }
}

/// Resolve a listen address such as `:7890`, `*:7890`, `127.0.0.1:7890`,
/// `[::1]:7890` or `localhost:7890` into a socket address.
pub async fn resolve_bind_addr(addr: &str) -> Result<SocketAddr, ListenerError> {
    let invalid = |reason: &str| ListenerError::InvalidAddress {
        addr: addr.to_string(),
        reason: reason.to_string(),
    };

    let (host, port) = split_host_port(addr).ok_or_else(|| invalid("expected host:port"))?;
    let port: u16 = port.parse().map_err(|_| invalid("bad port"))?;

    if host.is_empty() || host == WILDCARD_HOST {
        return Ok(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port));
    }
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, port));
    }

    tokio::net::lookup_host((host, port))
        .await
        .map_err(|e| invalid(&e.to_string()))?
        .next()
        .ok_or_else(|| invalid("host resolved to no addresses"))
}
