//! TPROXY inbound (iptables `-j TPROXY`).
//!
//! Sockets are bound with `IP_TRANSPARENT`, which needs `CAP_NET_ADMIN`.
//! For TCP the original destination is the local address of the accepted
//! socket. UDP packets are forwarded without a destination: recovering it
//! needs `IP_RECVORIGDSTADDR` ancillary data, which the dispatcher does not
//! consume yet.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::{TcpListener, TcpStream, UdpSocket};

use super::tcp::TcpAcceptor;
use super::udp::UdpReceiver;
use super::{
    resolve_bind_addr, BoxListener, ConnContext, HandshakeError, ListenerError, Metadata, Network,
    PacketAdapter, PacketFraming, Target, TcpDriver, TcpIn, UdpDriver, UdpIn,
};
use crate::inbound::InboundType;

const LISTEN_BACKLOG: i32 = 1024;

pub(crate) struct TproxyDriver;

#[async_trait]
impl TcpDriver for TproxyDriver {
    async fn listen(&self, addr: &str, tcp_in: TcpIn) -> Result<BoxListener, ListenerError> {
        let socket_addr = resolve_bind_addr(addr).await?;
        let listener = transparent_socket(socket_addr, Network::Tcp)
            .and_then(|socket| {
                socket.listen(LISTEN_BACKLOG)?;
                TcpListener::from_std(socket.into())
            })
            .map_err(|source| ListenerError::Bind {
                network: Network::Tcp,
                addr: addr.to_string(),
                source,
            })?;

        let acceptor = TcpAcceptor::spawn(listener, addr, InboundType::Tproxy, move |stream, peer| {
            serve(stream, peer, tcp_in.clone())
        })?;
        Ok(Box::new(acceptor))
    }
}

pub(crate) struct TproxyUdpDriver;

#[async_trait]
impl UdpDriver for TproxyUdpDriver {
    async fn listen(&self, addr: &str, udp_in: UdpIn) -> Result<BoxListener, ListenerError> {
        let socket_addr = resolve_bind_addr(addr).await?;
        let socket = transparent_socket(socket_addr, Network::Udp)
            .and_then(|socket| UdpSocket::from_std(socket.into()))
            .map_err(|source| ListenerError::Bind {
                network: Network::Udp,
                addr: addr.to_string(),
                source,
            })?;

        let receiver = UdpReceiver::spawn(socket, addr, move |socket, payload, peer| {
            forward_datagram(socket, payload, peer, udp_in.clone())
        })?;
        Ok(Box::new(receiver))
    }
}

fn transparent_socket(addr: SocketAddr, network: Network) -> std::io::Result<Socket> {
    let (ty, protocol) = match network {
        Network::Tcp => (Type::STREAM, Protocol::TCP),
        Network::Udp => (Type::DGRAM, Protocol::UDP),
    };
    let socket = Socket::new(Domain::for_address(addr), ty, Some(protocol))?;
    socket.set_reuse_address(true)?;
    #[cfg(target_os = "linux")]
    socket.set_ip_transparent(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    Ok(socket)
}

async fn serve(stream: TcpStream, peer: SocketAddr, tcp_in: TcpIn) -> Result<(), HandshakeError> {
    let destination = stream.local_addr()?;
    let metadata = Metadata::new(Network::Tcp, InboundType::Tproxy, peer)
        .with_destination(Target::Addr(destination));
    tcp_in
        .send(ConnContext::new(metadata, stream))
        .await
        .map_err(|_| HandshakeError::IngressClosed)
}

async fn forward_datagram(
    socket: Arc<UdpSocket>,
    payload: Bytes,
    peer: SocketAddr,
    udp_in: UdpIn,
) -> Result<(), HandshakeError> {
    let metadata = Metadata::new(Network::Udp, InboundType::Tproxy, peer);
    udp_in
        .send(PacketAdapter::new(metadata, payload, socket, PacketFraming::Raw))
        .await
        .map_err(|_| HandshakeError::IngressClosed)
}
