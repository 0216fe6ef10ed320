//! REDIRECT inbound (iptables `-j REDIRECT`).
//!
//! The destination is the pre-NAT address reported by `SO_ORIGINAL_DST`.

use std::io;
use std::net::SocketAddr;

use async_trait::async_trait;
use tokio::net::TcpStream;

use super::tcp::{bind_tcp, TcpAcceptor};
use super::{
    BoxListener, ConnContext, HandshakeError, ListenerError, Metadata, Network, Target, TcpDriver,
    TcpIn,
};
use crate::inbound::InboundType;

pub(crate) struct RedirDriver;

#[async_trait]
impl TcpDriver for RedirDriver {
    async fn listen(&self, addr: &str, tcp_in: TcpIn) -> Result<BoxListener, ListenerError> {
        let listener = bind_tcp(addr).await?;
        let acceptor = TcpAcceptor::spawn(listener, addr, InboundType::Redir, move |stream, peer| {
            serve(stream, peer, tcp_in.clone())
        })?;
        Ok(Box::new(acceptor))
    }
}

async fn serve(stream: TcpStream, peer: SocketAddr, tcp_in: TcpIn) -> Result<(), HandshakeError> {
    let destination = original_dst(&stream)?;
    let metadata = Metadata::new(Network::Tcp, InboundType::Redir, peer)
        .with_destination(Target::Addr(destination));
    tcp_in
        .send(ConnContext::new(metadata, stream))
        .await
        .map_err(|_| HandshakeError::IngressClosed)
}

#[cfg(target_os = "linux")]
fn original_dst(stream: &TcpStream) -> io::Result<SocketAddr> {
    let sock = socket2::SockRef::from(stream);
    let local = stream.local_addr()?;
    let addr = if local.is_ipv4() {
        sock.original_dst()?
    } else {
        sock.original_dst_ipv6()?
    };
    addr.as_socket()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "original destination is not an inet address"))
}

#[cfg(not(target_os = "linux"))]
fn original_dst(_stream: &TcpStream) -> io::Result<SocketAddr> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "SO_ORIGINAL_DST is only available on linux",
    ))
}
