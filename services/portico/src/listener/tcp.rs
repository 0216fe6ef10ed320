//! Shared TCP accept loop.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, Instrument};

use super::{resolve_bind_addr, ConnType, HandshakeError, ListenerError, ListenerHandle, Network};

/// Bind a plain TCP listening socket.
pub(crate) async fn bind_tcp(addr: &str) -> Result<TcpListener, ListenerError> {
    let socket_addr = resolve_bind_addr(addr).await?;
    TcpListener::bind(socket_addr)
        .await
        .map_err(|source| ListenerError::Bind {
            network: Network::Tcp,
            addr: addr.to_string(),
            source,
        })
}

/// A running accept loop over one TCP listening socket.
///
/// The socket is owned by the loop task; [`ListenerHandle::close`] cancels
/// the loop and waits for the task, so the socket is released by the time
/// `close` returns.
pub(crate) struct TcpAcceptor {
    configured: String,
    bound: SocketAddr,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl TcpAcceptor {
    /// Start accepting on `listener`, running `handler` once per connection
    /// on its own task.
    pub(crate) fn spawn<F, Fut>(
        listener: TcpListener,
        configured: &str,
        conn_type: impl Into<ConnType>,
        handler: F,
    ) -> Result<Self, ListenerError>
    where
        F: Fn(TcpStream, SocketAddr) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandshakeError>> + Send + 'static,
    {
        let bound = listener.local_addr()?;
        let conn_type = conn_type.into();
        let cancel = CancellationToken::new();
        let handler = Arc::new(handler);

        let loop_cancel = cancel.clone();
        let task = tokio::spawn(async move {
            loop {
                let accepted = tokio::select! {
                    biased;
                    _ = loop_cancel.cancelled() => break,
                    accepted = listener.accept() => accepted,
                };

                match accepted {
                    Ok((stream, peer)) => {
                        let handler = Arc::clone(&handler);
                        tokio::spawn(
                            async move {
                                if let Err(e) = handler(stream, peer).await {
                                    debug!(error = %e, "Connection dropped");
                                }
                            }
                            .instrument(tracing::info_span!(
                                "conn",
                                inbound = %conn_type,
                                peer = %peer
                            )),
                        );
                    }
                    Err(e) => {
                        if loop_cancel.is_cancelled() {
                            break;
                        }
                        error!(bound = %bound, error = %e, "Accept error");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                }
            }
            debug!(bound = %bound, "Accept loop stopped");
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
impl ListenerHandle for TcpAcceptor {
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
                        "accept loop panicked",
                    )));
                }
            }
        }
        Ok(())
    }
}

impl Drop for TcpAcceptor {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inbound::InboundType;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_close_releases_socket_and_is_idempotent() {
        let listener = bind_tcp("127.0.0.1:0").await.unwrap();
        let acceptor = TcpAcceptor::spawn(listener, "127.0.0.1:0", InboundType::Http, |_, _| async {
            Ok(())
        })
        .unwrap();
        let bound = acceptor.bound_address();

        acceptor.close().await.unwrap();
        acceptor.close().await.unwrap();

        TcpListener::bind(bound).await.unwrap();
    }

    #[tokio::test]
    async fn test_handler_runs_per_connection() {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        let listener = bind_tcp("127.0.0.1:0").await.unwrap();
        let acceptor = TcpAcceptor::spawn(listener, "127.0.0.1:0", InboundType::Http, move |_, _| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
        .unwrap();

        for _ in 0..3 {
            let _ = TcpStream::connect(acceptor.bound_address()).await.unwrap();
        }
        for _ in 0..50 {
            if hits.load(Ordering::SeqCst) == 3 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(hits.load(Ordering::SeqCst), 3);
        acceptor.close().await.unwrap();
    }
}
