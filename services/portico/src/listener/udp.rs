//! Shared UDP receive loop.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use super::{resolve_bind_addr, HandshakeError, ListenerError, ListenerHandle, Network};

const MAX_DATAGRAM: usize = 65_535;

/// Bind a plain UDP socket.
pub(crate) async fn bind_udp(addr: &str) -> Result<UdpSocket, ListenerError> {
    let socket_addr = resolve_bind_addr(addr).await?;
    UdpSocket::bind(socket_addr)
        .await
        .map_err(|source| ListenerError::Bind {
            network: Network::Udp,
            addr: addr.to_string(),
            source,
        })
}

/// A running receive loop over one UDP socket.
pub(crate) struct UdpReceiver {
    configured: String,
    bound: SocketAddr,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl UdpReceiver {
    /// Start receiving on `socket`, running `handler` for each datagram.
    ///
    /// Datagrams are handled in order on the loop task. A handler error
    /// drops that datagram only. The loop is the only strong owner of the
    /// socket, so it is released as soon as the loop exits.
    pub(crate) fn spawn<F, Fut>(
        socket: UdpSocket,
        configured: &str,
        handler: F,
    ) -> Result<Self, ListenerError>
    where
        F: Fn(Arc<UdpSocket>, Bytes, SocketAddr) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandshakeError>> + Send + 'static,
    {
        let bound = socket.local_addr()?;
        let socket = Arc::new(socket);
        let cancel = CancellationToken::new();

        let loop_cancel = cancel.clone();
        let task = tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_DATAGRAM];
            loop {
                let received = tokio::select! {
                    biased;
                    _ = loop_cancel.cancelled() => break,
                    received = socket.recv_from(&mut buf) => received,
                };

                match received {
                    Ok((n, peer)) => {
                        let payload = Bytes::copy_from_slice(&buf[..n]);
                        // A full ingress channel must not keep close() waiting.
                        let handled = tokio::select! {
                            biased;
                            _ = loop_cancel.cancelled() => break,
                            handled = handler(Arc::clone(&socket), payload, peer) => handled,
                        };
                        match handled {
                            Ok(()) => {}
                            Err(HandshakeError::IngressClosed) => {
                                debug!(bound = %bound, "UDP ingress closed");
                                break;
                            }
                            Err(e) => debug!(peer = %peer, error = %e, "Datagram dropped"),
                        }
                    }
                    Err(e) => {
                        if loop_cancel.is_cancelled() {
                            break;
                        }
                        error!(bound = %bound, error = %e, "UDP receive error");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                }
            }
            debug!(bound = %bound, "Receive loop stopped");
        });

        Ok(Self {
            configured: configured.to_string(),
            bound,
            cancel,
            task: Mutex::new(Some(task)),
        })
    }
}

#[async_trait]
impl ListenerHandle for UdpReceiver {
    fn configured_address(&self) -> &str {
        &self.configured
    }

    fn bound_address(&self) -> SocketAddr {
        self.bound
    }

    async fn close(&self) -> Result<(), ListenerError> {
        self.cancel.cancel();
        let task = self.task.lock().await.take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                if e.is_panic() {
                    return Err(ListenerError::Io(std::io::Error::other(
                        "receive loop panicked",
                    )));
                }
            }
        }
        Ok(())
    }
}

impl Drop for UdpReceiver {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_close_releases_socket() {
        let socket = bind_udp("127.0.0.1:0").await.unwrap();
        let receiver = UdpReceiver::spawn(socket, "127.0.0.1:0", |_, _, _| async { Ok(()) }).unwrap();
        let bound = receiver.bound_address();

        receiver.close().await.unwrap();
        receiver.close().await.unwrap();

        UdpSocket::bind(bound).await.unwrap();
    }
}
