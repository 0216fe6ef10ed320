//! Static tunnel listeners: everything received on the listen address goes
//! to one fixed target through one named outbound.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use tokio::net::{TcpStream, UdpSocket};

use super::tcp::{bind_tcp, TcpAcceptor};
use super::udp::{bind_udp, UdpReceiver};
use super::{
    BoxListener, ConnContext, ConnType, HandshakeError, ListenerError, Metadata, Network,
    PacketAdapter, PacketFraming, Target, TcpIn, UdpIn,
};

/// Open a TCP tunnel on `addr` forwarding to `target` via `proxy`.
pub async fn new_tcp_tunnel(
    addr: &str,
    target: Target,
    proxy: &str,
    tcp_in: TcpIn,
) -> Result<BoxListener, ListenerError> {
    let listener = bind_tcp(addr).await?;
    let proxy = proxy.to_string();
    let acceptor = TcpAcceptor::spawn(listener, addr, ConnType::Tunnel, move |stream, peer| {
        forward_stream(stream, peer, target.clone(), proxy.clone(), tcp_in.clone())
    })?;
    Ok(Box::new(acceptor))
}

/// Open a UDP tunnel on `addr` forwarding to `target` via `proxy`.
pub async fn new_udp_tunnel(
    addr: &str,
    target: Target,
    proxy: &str,
    udp_in: UdpIn,
) -> Result<BoxListener, ListenerError> {
    let socket = bind_udp(addr).await?;
    let proxy = proxy.to_string();
    let receiver = UdpReceiver::spawn(socket, addr, move |socket, payload, peer| {
        forward_datagram(socket, payload, peer, target.clone(), proxy.clone(), udp_in.clone())
    })?;
    Ok(Box::new(receiver))
}

async fn forward_stream(
    stream: TcpStream,
    peer: SocketAddr,
    target: Target,
    proxy: String,
    tcp_in: TcpIn,
) -> Result<(), HandshakeError> {
    let metadata = Metadata::new(Network::Tcp, ConnType::Tunnel, peer)
        .with_destination(target)
        .with_special_proxy(proxy);
    tcp_in
        .send(ConnContext::new(metadata, stream))
        .await
        .map_err(|_| HandshakeError::IngressClosed)
}

async fn forward_datagram(
    socket: Arc<UdpSocket>,
    payload: Bytes,
    peer: SocketAddr,
    target: Target,
    proxy: String,
    udp_in: UdpIn,
) -> Result<(), HandshakeError> {
    let metadata = Metadata::new(Network::Udp, ConnType::Tunnel, peer)
        .with_destination(target)
        .with_special_proxy(proxy);
    udp_in
        .send(PacketAdapter::new(metadata, payload, socket, PacketFraming::Raw))
        .await
        .map_err(|_| HandshakeError::IngressClosed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::listener::{Ingress, ListenerHandle};

    #[tokio::test]
    async fn test_tcp_tunnel_tags_special_proxy() {
        let (ingress, mut rx) = Ingress::channel(4);
        let target = Target::Domain("example.com".to_string(), 443);
        let tunnel = new_tcp_tunnel("127.0.0.1:0", target.clone(), "proxyA", ingress.tcp.clone())
            .await
            .unwrap();

        let _client = TcpStream::connect(tunnel.bound_address()).await.unwrap();
        let ctx = rx.tcp.recv().await.unwrap();
        assert_eq!(ctx.metadata.conn_type, ConnType::Tunnel);
        assert_eq!(ctx.metadata.destination, Some(target));
        assert_eq!(ctx.metadata.special_proxy.as_deref(), Some("proxyA"));

        tunnel.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_udp_tunnel_forwards_raw_payload() {
        let (ingress, mut rx) = Ingress::channel(4);
        let tunnel = new_udp_tunnel(
            "127.0.0.1:0",
            Target::Addr("8.8.8.8:53".parse().unwrap()),
            "DIRECT",
            ingress.udp.clone(),
        )
        .await
        .unwrap();

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.send_to(b"raw", tunnel.bound_address()).await.unwrap();

        let packet = rx.udp.recv().await.unwrap();
        assert_eq!(&packet.payload[..], b"raw");
        assert_eq!(packet.metadata.special_proxy.as_deref(), Some("DIRECT"));

        tunnel.close().await.unwrap();
    }
}
