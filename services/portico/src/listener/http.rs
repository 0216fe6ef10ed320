//! Plain HTTP proxy inbound.
//!
//! Handles `CONNECT host:port` tunnels and absolute-form requests
//! (`GET http://host/path`). For the latter the request head is rewritten to
//! origin form and carried in [`ConnContext::buffered`] so the dispatcher
//! replays it to the destination.

use std::net::SocketAddr;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use super::tcp::{bind_tcp, TcpAcceptor};
use super::{
    BoxListener, ConnContext, HandshakeError, ListenerError, Metadata, Network, Target, TcpDriver,
    TcpIn,
};
use crate::inbound::InboundType;

const MAX_HEAD: usize = 16 * 1024;

const CONNECT_ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection established\r\n\r\n";
const BAD_REQUEST: &[u8] = b"HTTP/1.1 400 Bad Request\r\nConnection: close\r\n\r\n";

pub(crate) struct HttpDriver;

#[async_trait]
impl TcpDriver for HttpDriver {
    async fn listen(&self, addr: &str, tcp_in: TcpIn) -> Result<BoxListener, ListenerError> {
        let listener = bind_tcp(addr).await?;
        let acceptor = TcpAcceptor::spawn(listener, addr, InboundType::Http, move |stream, peer| {
            serve(stream, peer, InboundType::Http, tcp_in.clone())
        })?;
        Ok(Box::new(acceptor))
    }
}

/// Parsed proxy request.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum ProxyRequest {
    Connect(Target),
    /// Absolute-form request; `head` is the rewritten origin-form head.
    Forward { target: Target, head: Vec<u8> },
}

/// Read one proxy request head and push the connection to the TCP ingress.
pub(crate) async fn serve(
    mut stream: TcpStream,
    peer: SocketAddr,
    inbound_type: InboundType,
    tcp_in: TcpIn,
) -> Result<(), HandshakeError> {
    let (head, rest) = read_head(&mut stream).await?;

    let request = match parse_request(&head) {
        Ok(request) => request,
        Err(e) => {
            let _ = stream.write_all(BAD_REQUEST).await;
            return Err(e);
        }
    };

    let (target, buffered) = match request {
        ProxyRequest::Connect(target) => {
            stream.write_all(CONNECT_ESTABLISHED).await?;
            (target, rest)
        }
        ProxyRequest::Forward { target, head } => {
            let mut replay = BytesMut::with_capacity(head.len() + rest.len());
            replay.extend_from_slice(&head);
            replay.extend_from_slice(&rest);
            (target, replay.freeze())
        }
    };

    let metadata = Metadata::new(Network::Tcp, inbound_type, peer).with_destination(target);
    tcp_in
        .send(ConnContext::new(metadata, stream).with_buffered(buffered))
        .await
        .map_err(|_| HandshakeError::IngressClosed)
}

/// Read until the end of the request head. Returns the head (including the
/// blank line) and any bytes read past it.
async fn read_head(stream: &mut TcpStream) -> Result<(Vec<u8>, Bytes), HandshakeError> {
    let mut buf = BytesMut::with_capacity(1024);
    loop {
        if let Some(end) = find_head_end(&buf) {
            let rest = buf.split_off(end);
            return Ok((buf.to_vec(), rest.freeze()));
        }
        if buf.len() >= MAX_HEAD {
            return Err(HandshakeError::protocol("request head too large"));
        }
        if stream.read_buf(&mut buf).await? == 0 {
            return Err(HandshakeError::protocol("connection closed before request head"));
        }
    }
}

fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|i| i + 4)
}

pub(crate) fn parse_request(head: &[u8]) -> Result<ProxyRequest, HandshakeError> {
    let text = std::str::from_utf8(head).map_err(|_| HandshakeError::protocol("request head is not utf-8"))?;
    let mut lines = text.split("\r\n");
    let request_line = lines.next().unwrap_or_default();
    let mut parts = request_line.split_whitespace();
    let (method, uri, version) = match (parts.next(), parts.next(), parts.next()) {
        (Some(m), Some(u), Some(v)) => (m, u, v),
        _ => return Err(HandshakeError::protocol("malformed request line")),
    };

    if method.eq_ignore_ascii_case("CONNECT") {
        let target: Target = uri.parse().map_err(HandshakeError::Protocol)?;
        return Ok(ProxyRequest::Connect(target));
    }

    let without_scheme = uri
        .strip_prefix("http://")
        .ok_or_else(|| HandshakeError::protocol(format!("not a proxy request: {uri}")))?;
    let (authority, path) = match without_scheme.find('/') {
        Some(i) => (&without_scheme[..i], &without_scheme[i..]),
        None => (without_scheme, "/"),
    };
    let target = parse_authority(authority, 80)?;

    let mut rewritten = format!("{method} {path} {version}\r\n");
    for line in lines.filter(|l| !l.is_empty()) {
        let name = line.split(':').next().unwrap_or_default().trim();
        if name.eq_ignore_ascii_case("proxy-connection") || name.eq_ignore_ascii_case("proxy-authorization") {
            continue;
        }
        rewritten.push_str(line);
        rewritten.push_str("\r\n");
    }
    rewritten.push_str("\r\n");

    Ok(ProxyRequest::Forward {
        target,
        head: rewritten.into_bytes(),
    })
}

fn parse_authority(authority: &str, default_port: u16) -> Result<Target, HandshakeError> {
    if authority.is_empty() {
        return Err(HandshakeError::protocol("empty host"));
    }
    if let Ok(target) = authority.parse::<Target>() {
        return Ok(target);
    }
    let host = authority.trim_start_matches('[').trim_end_matches(']');
    match host.parse::<std::net::IpAddr>() {
        Ok(ip) => Ok(Target::Addr(SocketAddr::new(ip, default_port))),
        Err(_) => Ok(Target::Domain(host.to_string(), default_port)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::listener::{Ingress, ListenerHandle};

    #[test]
    fn test_parse_connect() {
        let req = parse_request(b"CONNECT example.com:443 HTTP/1.1\r\nHost: example.com:443\r\n\r\n").unwrap();
        assert_eq!(
            req,
            ProxyRequest::Connect(Target::Domain("example.com".to_string(), 443))
        );
    }

    #[test]
    fn test_parse_absolute_form_rewrites_head() {
        let req = parse_request(
            b"GET http://example.com/index.html HTTP/1.1\r\nHost: example.com\r\nProxy-Connection: keep-alive\r\n\r\n",
        )
        .unwrap();
        match req {
            ProxyRequest::Forward { target, head } => {
                assert_eq!(target, Target::Domain("example.com".to_string(), 80));
                assert_eq!(
                    String::from_utf8(head).unwrap(),
                    "GET /index.html HTTP/1.1\r\nHost: example.com\r\n\r\n"
                );
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_origin_form_rejected() {
        assert!(parse_request(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n").is_err());
        assert!(parse_request(b"garbage\r\n\r\n").is_err());
    }

    #[tokio::test]
    async fn test_connect_reaches_ingress() {
        let (ingress, mut rx) = Ingress::channel(4);
        let listener = HttpDriver.listen("127.0.0.1:0", ingress.tcp.clone()).await.unwrap();

        let mut client = TcpStream::connect(listener.bound_address()).await.unwrap();
        client
            .write_all(b"CONNECT 10.1.2.3:8443 HTTP/1.1\r\n\r\n")
            .await
            .unwrap();
        let mut reply = vec![0u8; CONNECT_ESTABLISHED.len()];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, CONNECT_ESTABLISHED);

        let ctx = rx.tcp.recv().await.unwrap();
        assert_eq!(ctx.metadata.conn_type, crate::listener::ConnType::Inbound(InboundType::Http));
        assert_eq!(
            ctx.metadata.destination,
            Some(Target::Addr("10.1.2.3:8443".parse().unwrap()))
        );
        assert!(ctx.buffered.is_empty());

        listener.close().await.unwrap();
    }
}
