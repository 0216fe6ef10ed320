//! Mixed inbound: SOCKS and HTTP on one port, told apart by the first byte.

use std::net::SocketAddr;

use async_trait::async_trait;
use tokio::net::TcpStream;

use super::socks::{SOCKS4_VERSION, SOCKS5_VERSION};
use super::tcp::{bind_tcp, TcpAcceptor};
use super::{http, socks, BoxListener, HandshakeError, ListenerError, TcpDriver, TcpIn};
use crate::inbound::InboundType;

pub(crate) struct MixedDriver;

#[async_trait]
impl TcpDriver for MixedDriver {
    async fn listen(&self, addr: &str, tcp_in: TcpIn) -> Result<BoxListener, ListenerError> {
        let listener = bind_tcp(addr).await?;
        let acceptor = TcpAcceptor::spawn(listener, addr, InboundType::Mixed, move |stream, peer| {
            serve(stream, peer, tcp_in.clone())
        })?;
        Ok(Box::new(acceptor))
    }
}

async fn serve(stream: TcpStream, peer: SocketAddr, tcp_in: TcpIn) -> Result<(), HandshakeError> {
    let mut first = [0u8; 1];
    if stream.peek(&mut first).await? == 0 {
        return Err(HandshakeError::protocol("connection closed before first byte"));
    }

    match first[0] {
        SOCKS4_VERSION | SOCKS5_VERSION => socks::serve(stream, peer, InboundType::Mixed, tcp_in).await,
        _ => http::serve(stream, peer, InboundType::Mixed, tcp_in).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::listener::{Ingress, ListenerHandle, Target};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_dispatches_on_first_byte() {
        let (ingress, mut rx) = Ingress::channel(4);
        let listener = MixedDriver.listen("127.0.0.1:0", ingress.tcp.clone()).await.unwrap();
        let addr = listener.bound_address();

        let mut http_client = TcpStream::connect(addr).await.unwrap();
        http_client
            .write_all(b"CONNECT example.com:443 HTTP/1.1\r\n\r\n")
            .await
            .unwrap();
        let ctx = rx.tcp.recv().await.unwrap();
        assert_eq!(ctx.metadata.conn_type, crate::listener::ConnType::Inbound(InboundType::Mixed));
        assert_eq!(
            ctx.metadata.destination,
            Some(Target::Domain("example.com".to_string(), 443))
        );

        let mut socks_client = TcpStream::connect(addr).await.unwrap();
        socks_client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        let mut choice = [0u8; 2];
        socks_client.read_exact(&mut choice).await.unwrap();
        socks_client
            .write_all(&[0x05, 0x01, 0x00, 0x01, 10, 0, 0, 1, 0x00, 0x50])
            .await
            .unwrap();
        let ctx = rx.tcp.recv().await.unwrap();
        assert_eq!(
            ctx.metadata.destination,
            Some(Target::Addr("10.0.0.1:80".parse().unwrap()))
        );

        listener.close().await.unwrap();
    }
}
