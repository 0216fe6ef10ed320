//! SOCKS4/4a and SOCKS5 inbound.
//!
//! Only the no-auth method is offered. CONNECT produces a [`ConnContext`];
//! UDP ASSOCIATE is answered with the listener's own address and the
//! control connection is held open until the client closes it, while the
//! datagrams themselves arrive on the UDP form of the same inbound.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tracing::debug;

use super::tcp::{bind_tcp, TcpAcceptor};
use super::udp::{bind_udp, UdpReceiver};
use super::{
    BoxListener, ConnContext, HandshakeError, ListenerError, Metadata, Network, PacketAdapter,
    PacketFraming, Target, TcpDriver, TcpIn, UdpDriver, UdpIn,
};
use crate::inbound::InboundType;

pub(crate) const SOCKS4_VERSION: u8 = 0x04;
pub(crate) const SOCKS5_VERSION: u8 = 0x05;

const METHOD_NO_AUTH: u8 = 0x00;
const METHOD_NONE_ACCEPTABLE: u8 = 0xff;

const CMD_CONNECT: u8 = 0x01;
const CMD_UDP_ASSOCIATE: u8 = 0x03;

const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

const REP_SUCCEEDED: u8 = 0x00;
const REP_COMMAND_NOT_SUPPORTED: u8 = 0x07;

const SOCKS4_GRANTED: u8 = 0x5a;
const SOCKS4_REJECTED: u8 = 0x5b;

/// TCP form of the SOCKS inbound.
pub(crate) struct SocksDriver;

#[async_trait]
impl TcpDriver for SocksDriver {
    async fn listen(&self, addr: &str, tcp_in: TcpIn) -> Result<BoxListener, ListenerError> {
        let listener = bind_tcp(addr).await?;
        let acceptor = TcpAcceptor::spawn(listener, addr, InboundType::Socks, move |stream, peer| {
            serve(stream, peer, InboundType::Socks, tcp_in.clone())
        })?;
        Ok(Box::new(acceptor))
    }
}

/// UDP form of the SOCKS inbound (SOCKS5 UDP relay datagrams).
pub(crate) struct SocksUdpDriver;

#[async_trait]
impl UdpDriver for SocksUdpDriver {
    async fn listen(&self, addr: &str, udp_in: UdpIn) -> Result<BoxListener, ListenerError> {
        let socket = bind_udp(addr).await?;
        let receiver = UdpReceiver::spawn(socket, addr, move |socket, payload, peer| {
            relay_datagram(socket, payload, peer, udp_in.clone())
        })?;
        Ok(Box::new(receiver))
    }
}

/// Run a SOCKS handshake on an accepted connection and push the result to
/// the TCP ingress. The version byte is read from the stream.
pub(crate) async fn serve(
    mut stream: TcpStream,
    peer: SocketAddr,
    inbound_type: InboundType,
    tcp_in: TcpIn,
) -> Result<(), HandshakeError> {
    let version = stream.read_u8().await?;
    match version {
        SOCKS5_VERSION => serve_socks5(stream, peer, inbound_type, tcp_in).await,
        SOCKS4_VERSION => serve_socks4(stream, peer, inbound_type, tcp_in).await,
        other => Err(HandshakeError::protocol(format!("unsupported socks version {other:#04x}"))),
    }
}

async fn serve_socks5(
    mut stream: TcpStream,
    peer: SocketAddr,
    inbound_type: InboundType,
    tcp_in: TcpIn,
) -> Result<(), HandshakeError> {
    let n_methods = stream.read_u8().await? as usize;
    let mut methods = vec![0u8; n_methods];
    stream.read_exact(&mut methods).await?;

    if !methods.contains(&METHOD_NO_AUTH) {
        stream.write_all(&[SOCKS5_VERSION, METHOD_NONE_ACCEPTABLE]).await?;
        return Err(HandshakeError::protocol("client offers no acceptable auth method"));
    }
    stream.write_all(&[SOCKS5_VERSION, METHOD_NO_AUTH]).await?;

    let mut header = [0u8; 4];
    stream.read_exact(&mut header).await?;
    let [version, command, _reserved, atyp] = header;
    if version != SOCKS5_VERSION {
        return Err(HandshakeError::protocol(format!("bad request version {version:#04x}")));
    }
    let target = read_address(&mut stream, atyp).await?;
    let local = stream.local_addr()?;

    match command {
        CMD_CONNECT => {
            write_socks5_reply(&mut stream, REP_SUCCEEDED, local).await?;
            let metadata = Metadata::new(Network::Tcp, inbound_type, peer).with_destination(target);
            tcp_in
                .send(ConnContext::new(metadata, stream))
                .await
                .map_err(|_| HandshakeError::IngressClosed)
        }
        CMD_UDP_ASSOCIATE => {
            write_socks5_reply(&mut stream, REP_SUCCEEDED, local).await?;
            debug!(client = %target, "UDP associate");
            // The association lives as long as the control connection.
            let mut sink = [0u8; 256];
            while stream.read(&mut sink).await? > 0 {}
            Ok(())
        }
        other => {
            write_socks5_reply(&mut stream, REP_COMMAND_NOT_SUPPORTED, local).await?;
            Err(HandshakeError::protocol(format!("unsupported command {other:#04x}")))
        }
    }
}

async fn write_socks5_reply(
    stream: &mut TcpStream,
    reply: u8,
    bound: SocketAddr,
) -> Result<(), HandshakeError> {
    let mut buf = vec![SOCKS5_VERSION, reply, 0x00];
    encode_address(&Target::Addr(bound), &mut buf);
    stream.write_all(&buf).await?;
    Ok(())
}

async fn serve_socks4(
    mut stream: TcpStream,
    peer: SocketAddr,
    inbound_type: InboundType,
    tcp_in: TcpIn,
) -> Result<(), HandshakeError> {
    let command = stream.read_u8().await?;
    let port = stream.read_u16().await?;
    let mut ip = [0u8; 4];
    stream.read_exact(&mut ip).await?;
    let _user_id = read_nul_terminated(&mut stream).await?;

    if command != CMD_CONNECT {
        stream.write_all(&[0x00, SOCKS4_REJECTED, 0, 0, 0, 0, 0, 0]).await?;
        return Err(HandshakeError::protocol(format!("unsupported socks4 command {command:#04x}")));
    }

    // SOCKS4a: 0.0.0.x with x != 0 means a domain name follows the user id.
    let target = if ip[0] == 0 && ip[1] == 0 && ip[2] == 0 && ip[3] != 0 {
        let host = read_nul_terminated(&mut stream).await?;
        let host = String::from_utf8(host)
            .map_err(|_| HandshakeError::protocol("socks4a host is not utf-8"))?;
        Target::Domain(host, port)
    } else {
        Target::Addr(SocketAddr::new(IpAddr::V4(Ipv4Addr::from(ip)), port))
    };

    stream.write_all(&[0x00, SOCKS4_GRANTED, 0, 0, 0, 0, 0, 0]).await?;

    let metadata = Metadata::new(Network::Tcp, inbound_type, peer).with_destination(target);
    tcp_in
        .send(ConnContext::new(metadata, stream))
        .await
        .map_err(|_| HandshakeError::IngressClosed)
}

async fn read_nul_terminated<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Vec<u8>, HandshakeError> {
    let mut out = Vec::new();
    loop {
        let byte = reader.read_u8().await?;
        if byte == 0 {
            return Ok(out);
        }
        if out.len() >= 255 {
            return Err(HandshakeError::protocol("socks4 field too long"));
        }
        out.push(byte);
    }
}

/// Read a SOCKS5 address of type `atyp` followed by a big-endian port.
pub(crate) async fn read_address<R: AsyncRead + Unpin>(
    reader: &mut R,
    atyp: u8,
) -> Result<Target, HandshakeError> {
    match atyp {
        ATYP_IPV4 => {
            let mut ip = [0u8; 4];
            reader.read_exact(&mut ip).await?;
            let port = reader.read_u16().await?;
            Ok(Target::Addr(SocketAddr::new(IpAddr::V4(Ipv4Addr::from(ip)), port)))
        }
        ATYP_IPV6 => {
            let mut ip = [0u8; 16];
            reader.read_exact(&mut ip).await?;
            let port = reader.read_u16().await?;
            Ok(Target::Addr(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(ip)), port)))
        }
        ATYP_DOMAIN => {
            let len = reader.read_u8().await? as usize;
            let mut host = vec![0u8; len];
            reader.read_exact(&mut host).await?;
            let port = reader.read_u16().await?;
            let host = String::from_utf8(host)
                .map_err(|_| HandshakeError::protocol("domain is not utf-8"))?;
            Ok(Target::Domain(host, port))
        }
        other => Err(HandshakeError::protocol(format!("unknown address type {other:#04x}"))),
    }
}

/// Append the SOCKS5 encoding of `target` (ATYP, address, port).
pub(crate) fn encode_address(target: &Target, buf: &mut Vec<u8>) {
    match target {
        Target::Addr(SocketAddr::V4(addr)) => {
            buf.push(ATYP_IPV4);
            buf.extend_from_slice(&addr.ip().octets());
        }
        Target::Addr(SocketAddr::V6(addr)) => {
            buf.push(ATYP_IPV6);
            buf.extend_from_slice(&addr.ip().octets());
        }
        Target::Domain(host, _) => {
            let host = &host.as_bytes()[..host.len().min(255)];
            buf.push(ATYP_DOMAIN);
            buf.push(host.len() as u8);
            buf.extend_from_slice(host);
        }
    }
    buf.extend_from_slice(&target.port().to_be_bytes());
}

/// Build a SOCKS5 UDP datagram: RSV(2) FRAG(1) address payload.
pub(crate) fn encode_udp_datagram(target: &Target, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(payload.len() + 22);
    buf.extend_from_slice(&[0x00, 0x00, 0x00]);
    encode_address(target, &mut buf);
    buf.extend_from_slice(payload);
    buf
}

/// Split a SOCKS5 UDP datagram into its target and payload.
///
/// Fragmented datagrams are rejected.
pub(crate) fn decode_udp_datagram(datagram: &[u8]) -> Result<(Target, Bytes), HandshakeError> {
    if datagram.len() < 4 {
        return Err(HandshakeError::protocol("short socks5 datagram"));
    }
    if datagram[2] != 0 {
        return Err(HandshakeError::protocol("fragmented socks5 datagram"));
    }
    let atyp = datagram[3];
    let rest = &datagram[4..];

    let (target, consumed) = match atyp {
        ATYP_IPV4 if rest.len() >= 6 => {
            let ip = Ipv4Addr::new(rest[0], rest[1], rest[2], rest[3]);
            let port = u16::from_be_bytes([rest[4], rest[5]]);
            (Target::Addr(SocketAddr::new(IpAddr::V4(ip), port)), 6)
        }
        ATYP_IPV6 if rest.len() >= 18 => {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&rest[..16]);
            let port = u16::from_be_bytes([rest[16], rest[17]]);
            (Target::Addr(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(octets)), port)), 18)
        }
        ATYP_DOMAIN if !rest.is_empty() => {
            let len = rest[0] as usize;
            if rest.len() < 1 + len + 2 {
                return Err(HandshakeError::protocol("short socks5 domain"));
            }
            let host = std::str::from_utf8(&rest[1..1 + len])
                .map_err(|_| HandshakeError::protocol("domain is not utf-8"))?;
            let port = u16::from_be_bytes([rest[1 + len], rest[2 + len]]);
            (Target::Domain(host.to_string(), port), 1 + len + 2)
        }
        _ => return Err(HandshakeError::protocol("bad socks5 datagram address")),
    };

    Ok((target, Bytes::copy_from_slice(&rest[consumed..])))
}

async fn relay_datagram(
    socket: Arc<UdpSocket>,
    datagram: Bytes,
    peer: SocketAddr,
    udp_in: UdpIn,
) -> Result<(), HandshakeError> {
    let (target, payload) = decode_udp_datagram(&datagram)?;
    let metadata = Metadata::new(Network::Udp, InboundType::Socks, peer).with_destination(target);
    udp_in
        .send(PacketAdapter::new(metadata, payload, socket, PacketFraming::Socks5))
        .await
        .map_err(|_| HandshakeError::IngressClosed)
}
