//! Accepted-connection handles pushed onto the ingress channels.

use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::{Arc, Weak};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::mpsc;
use uuid::Uuid;

use super::socks;
use crate::inbound::{split_host_port, InboundType};

/// Default capacity of the TCP and UDP ingress channels.
pub const DEFAULT_INGRESS_CAPACITY: usize = 256;

/// Transport of a connection, tunnel or packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    Tcp,
    Udp,
}

impl Network {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Tcp => "tcp",
            Self::Udp => "udp",
        }
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Network {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "tcp" => Ok(Self::Tcp),
            "udp" => Ok(Self::Udp),
            other => Err(format!("unknown network: {other}")),
        }
    }
}

/// Where a connection wants to go.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Target {
    Addr(SocketAddr),
    Domain(String, u16),
}

impl Target {
    pub fn port(&self) -> u16 {
        match self {
            Self::Addr(addr) => addr.port(),
            Self::Domain(_, port) => *port,
        }
    }

    pub fn host(&self) -> String {
        match self {
            Self::Addr(addr) => addr.ip().to_string(),
            Self::Domain(host, _) => host.clone(),
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Addr(addr) => write!(f, "{addr}"),
            Self::Domain(host, port) => write!(f, "{host}:{port}"),
        }
    }
}

impl FromStr for Target {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Ok(addr) = s.parse::<SocketAddr>() {
            return Ok(Self::Addr(addr));
        }
        let (host, port) = split_host_port(s).ok_or_else(|| format!("invalid target: {s}"))?;
        let port: u16 = port.parse().map_err(|_| format!("invalid target port: {s}"))?;
        if host.is_empty() {
            return Err(format!("missing target host: {s}"));
        }
        Ok(Self::Domain(host.to_string(), port))
    }
}

/// What accepted a connection: a protocol inbound or a static tunnel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnType {
    Inbound(InboundType),
    Tunnel,
}

impl ConnType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Inbound(inbound_type) => inbound_type.as_str(),
            Self::Tunnel => "tunnel",
        }
    }
}

impl From<InboundType> for ConnType {
    fn from(inbound_type: InboundType) -> Self {
        Self::Inbound(inbound_type)
    }
}

impl fmt::Display for ConnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for ConnType {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

/// Connection metadata handed to the dispatcher.
#[derive(Debug, Clone)]
pub struct Metadata {
    pub network: Network,
    pub conn_type: ConnType,
    pub source: SocketAddr,
    pub destination: Option<Target>,
    /// Outbound forced by a static tunnel, bypassing rule matching.
    pub special_proxy: Option<String>,
}

impl Metadata {
    pub fn new(network: Network, conn_type: impl Into<ConnType>, source: SocketAddr) -> Self {
        Self {
            network,
            conn_type: conn_type.into(),
            source,
            destination: None,
            special_proxy: None,
        }
    }

    pub fn with_destination(mut self, destination: Target) -> Self {
        self.destination = Some(destination);
        self
    }

    pub fn with_special_proxy(mut self, proxy: impl Into<String>) -> Self {
        self.special_proxy = Some(proxy.into());
        self
    }
}

/// An accepted TCP connection after the protocol handshake.
#[derive(Debug)]
pub struct ConnContext {
    pub id: Uuid,
    pub metadata: Metadata,
    pub stream: TcpStream,
    /// Client bytes already read during the handshake that belong to the
    /// payload (e.g. a plain HTTP proxy request).
    pub buffered: Bytes,
}

impl ConnContext {
    pub fn new(metadata: Metadata, stream: TcpStream) -> Self {
        Self {
            id: Uuid::new_v4(),
            metadata,
            stream,
            buffered: Bytes::new(),
        }
    }

    pub fn with_buffered(mut self, buffered: Bytes) -> Self {
        self.buffered = buffered;
        self
    }
}

/// How replies to a packet are framed on the way back to the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketFraming {
    /// Raw datagram.
    Raw,
    /// SOCKS5 UDP request header prepended.
    Socks5,
}

/// One inbound UDP datagram plus the means to answer it.
#[derive(Debug)]
pub struct PacketAdapter {
    pub metadata: Metadata,
    pub payload: Bytes,
    reply: PacketReply,
}

impl PacketAdapter {
    pub fn new(
        metadata: Metadata,
        payload: Bytes,
        socket: Arc<UdpSocket>,
        framing: PacketFraming,
    ) -> Self {
        let reply = PacketReply {
            socket: Arc::downgrade(&socket),
            client: metadata.source,
            framing,
        };
        Self {
            metadata,
            payload,
            reply,
        }
    }

    /// Handle for answering this client after the packet is consumed.
    pub fn reply(&self) -> PacketReply {
        self.reply.clone()
    }

    /// Send a reply datagram that originated from `from` back to the client.
    pub async fn write_back(&self, payload: &[u8], from: SocketAddr) -> std::io::Result<usize> {
        self.reply.write_back(payload, from).await
    }
}

/// Return path to the client of a UDP flow.
///
/// Holds the inbound socket weakly: once the listener is closed, writes
/// fail with `NotConnected` instead of keeping the port bound.
#[derive(Debug, Clone)]
pub struct PacketReply {
    socket: Weak<UdpSocket>,
    client: SocketAddr,
    framing: PacketFraming,
}

impl PacketReply {
    pub async fn write_back(&self, payload: &[u8], from: SocketAddr) -> std::io::Result<usize> {
        let socket = self.socket.upgrade().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::NotConnected, "inbound listener closed")
        })?;
        match self.framing {
            PacketFraming::Raw => socket.send_to(payload, self.client).await,
            PacketFraming::Socks5 => {
                let datagram = socks::encode_udp_datagram(&Target::Addr(from), payload);
                socket.send_to(&datagram, self.client).await
            }
        }
    }
}

/// Sender side of the TCP ingress channel.
pub type TcpIn = mpsc::Sender<ConnContext>;

/// Sender side of the UDP ingress channel.
pub type UdpIn = mpsc::Sender<PacketAdapter>;

/// The pair of ingress channels every driver writes into.
#[derive(Debug, Clone)]
pub struct Ingress {
    pub tcp: TcpIn,
    pub udp: UdpIn,
}

/// Receiver side of the ingress channels, owned by the dispatcher.
#[derive(Debug)]
pub struct IngressReceivers {
    pub tcp: mpsc::Receiver<ConnContext>,
    pub udp: mpsc::Receiver<PacketAdapter>,
}

impl Ingress {
    /// Create both ingress channels.
    pub fn channel(capacity: usize) -> (Ingress, IngressReceivers) {
        let (tcp_tx, tcp_rx) = mpsc::channel(capacity);
        let (udp_tx, udp_rx) = mpsc::channel(capacity);
        (
            Ingress {
                tcp: tcp_tx,
                udp: udp_tx,
            },
            IngressReceivers {
                tcp: tcp_rx,
                udp: udp_rx,
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_target_parse() {
        assert_eq!(
            "1.2.3.4:80".parse::<Target>().unwrap(),
            Target::Addr("1.2.3.4:80".parse().unwrap())
        );
        assert_eq!(
            "example.com:443".parse::<Target>().unwrap(),
            Target::Domain("example.com".to_string(), 443)
        );
        assert!("example.com".parse::<Target>().is_err());
        assert!(":443".parse::<Target>().is_err());
    }

    #[test]
    fn test_network_parse() {
        assert_eq!("TCP".parse::<Network>().unwrap(), Network::Tcp);
        assert!("sctp".parse::<Network>().is_err());
    }
}
