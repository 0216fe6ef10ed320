//! Default consumer of the ingress channels.
//!
//! Connections are dialed directly and relayed byte for byte, with every
//! chunk counted into the [`StatisticManager`]. Rule matching and proxy
//! selection plug in here; the only outbounds known to this dispatcher are
//! `DIRECT` and `REJECT`.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn, Instrument};
use uuid::Uuid;

use crate::listener::{ConnContext, IngressReceivers, Metadata, PacketAdapter, PacketReply, Target};
use crate::statistic::{StatisticManager, TrackerGuard};

pub const DIRECT: &str = "DIRECT";
pub const REJECT: &str = "REJECT";

const DIAL_TIMEOUT: Duration = Duration::from_secs(10);
const UDP_IDLE_TIMEOUT: Duration = Duration::from_secs(60);
const RELAY_BUFFER: usize = 16 * 1024;
const FLOW_QUEUE: usize = 64;

type NatKey = (SocketAddr, Target);
type NatTable = HashMap<NatKey, mpsc::Sender<Bytes>>;

/// Direct dispatcher over the TCP and UDP ingress channels.
#[derive(Clone)]
pub struct Dispatcher {
    stats: StatisticManager,
    nat: Arc<Mutex<NatTable>>,
}

impl Dispatcher {
    pub fn new(stats: StatisticManager) -> Self {
        Self {
            stats,
            nat: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Consume both ingress channels until `shutdown` fires or every sender
    /// is gone.
    pub fn spawn(self, receivers: IngressReceivers, shutdown: CancellationToken) -> JoinHandle<()> {
        let IngressReceivers { mut tcp, mut udp } = receivers;
        tokio::spawn(async move {
            let mut tcp_open = true;
            let mut udp_open = true;
            while tcp_open || udp_open {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    conn = tcp.recv(), if tcp_open => match conn {
                        Some(conn) => self.handle_tcp(conn),
                        None => tcp_open = false,
                    },
                    packet = udp.recv(), if udp_open => match packet {
                        Some(packet) => self.handle_udp(packet),
                        None => udp_open = false,
                    },
                }
            }
            debug!("Dispatcher stopped");
        })
    }

    fn handle_tcp(&self, conn: ConnContext) {
        let stats = self.stats.clone();
        let span = tracing::info_span!(
            "relay",
            id = %conn.id,
            source = %conn.metadata.source,
            inbound = %conn.metadata.conn_type,
        );
        tokio::spawn(
            async move {
                if let Err(e) = relay_tcp(stats, conn).await {
                    debug!(error = %e, "Relay ended with error");
                }
            }
            .instrument(span),
        );
    }

    /// Route a datagram onto its flow, starting one if needed. Never
    /// waits: resolving and binding happen on the flow task, and a flow
    /// whose queue is full drops the datagram.
    fn handle_udp(&self, packet: PacketAdapter) {
        let Some(destination) = packet.metadata.destination.clone() else {
            debug!(source = %packet.metadata.source, "Datagram without destination dropped");
            return;
        };
        if outbound_of(&packet.metadata.special_proxy) != DIRECT {
            debug!(source = %packet.metadata.source, "Datagram rejected");
            return;
        }

        let reply = packet.reply();
        let PacketAdapter {
            metadata, payload, ..
        } = packet;
        let key = (metadata.source, destination);

        let mut nat = lock(&self.nat);
        let payload = match nat.get(&key) {
            Some(flow) => match flow.try_send(payload) {
                Ok(()) => return,
                Err(TrySendError::Full(_)) => {
                    debug!(destination = %key.1, "UDP flow queue full, datagram dropped");
                    return;
                }
                Err(TrySendError::Closed(payload)) => payload,
            },
            None => payload,
        };

        let (flow, packets) = mpsc::channel(FLOW_QUEUE);
        if flow.try_send(payload).is_err() {
            return;
        }
        nat.insert(key.clone(), flow);
        drop(nat);

        let span = tracing::info_span!(
            "flow",
            source = %metadata.source,
            destination = %key.1,
        );
        tokio::spawn(
            run_flow(self.stats.clone(), Arc::clone(&self.nat), key, metadata, reply, packets)
                .instrument(span),
        );
    }
}

/// One UDP NAT entry: resolve, bind an outbound socket, then relay both
/// ways until [`UDP_IDLE_TIMEOUT`] passes without traffic or the connection
/// is closed through the statistics manager.
async fn run_flow(
    stats: StatisticManager,
    nat: Arc<Mutex<NatTable>>,
    key: NatKey,
    metadata: Metadata,
    reply: PacketReply,
    mut packets: mpsc::Receiver<Bytes>,
) {
    let opened = async {
        let remote = resolve(&key.1).await?;
        let socket = UdpSocket::bind(unspecified_for(remote)).await?;
        Ok::<_, io::Error>((remote, socket))
    }
    .await;

    match opened {
        Ok((remote, socket)) => {
            let guard = stats.track(Uuid::new_v4(), &metadata, vec![DIRECT.to_string()], "MATCH");
            relay_flow(&socket, remote, &reply, &mut packets, &guard).await;
        }
        Err(e) => warn!(error = %e, "UDP flow not opened"),
    }

    // `packets` is still open here, so the entry cannot have been replaced.
    lock(&nat).remove(&key);
}

async fn relay_flow(
    socket: &UdpSocket,
    remote: SocketAddr,
    reply: &PacketReply,
    packets: &mut mpsc::Receiver<Bytes>,
    guard: &TrackerGuard,
) {
    let closed = guard.closed();
    let mut buf = vec![0u8; 65_535];
    loop {
        tokio::select! {
            _ = closed.cancelled() => break,
            payload = packets.recv() => {
                let Some(payload) = payload else { break };
                match socket.send_to(&payload, remote).await {
                    Ok(n) => guard.add_upload(n),
                    Err(e) => debug!(error = %e, "UDP send failed"),
                }
            }
            received = tokio::time::timeout(UDP_IDLE_TIMEOUT, socket.recv_from(&mut buf)) => match received {
                Ok(Ok((n, from))) => {
                    guard.add_download(n);
                    if let Err(e) = reply.write_back(&buf[..n], from).await {
                        debug!(error = %e, "UDP write back failed");
                        break;
                    }
                }
                Ok(Err(e)) => {
                    debug!(error = %e, "UDP outbound receive failed");
                    break;
                }
                Err(_) => break,
            },
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn outbound_of(special_proxy: &Option<String>) -> &str {
    special_proxy.as_deref().unwrap_or(DIRECT)
}

fn unspecified_for(remote: SocketAddr) -> SocketAddr {
    if remote.is_ipv4() {
        SocketAddr::from(([0, 0, 0, 0], 0))
    } else {
        SocketAddr::from(([0u16; 8], 0))
    }
}

async fn resolve(target: &Target) -> io::Result<SocketAddr> {
    match target {
        Target::Addr(addr) => Ok(*addr),
        Target::Domain(host, port) => tokio::net::lookup_host((host.as_str(), *port))
            .await?
            .next()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, format!("{host} has no addresses"))),
    }
}

async fn dial(target: &Target) -> io::Result<TcpStream> {
    let connect = async {
        match target {
            Target::Addr(addr) => TcpStream::connect(addr).await,
            Target::Domain(host, port) => TcpStream::connect((host.as_str(), *port)).await,
        }
    };
    tokio::time::timeout(DIAL_TIMEOUT, connect)
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "dial timeout"))?
}

async fn relay_tcp(stats: StatisticManager, conn: ConnContext) -> io::Result<()> {
    let ConnContext {
        id,
        metadata,
        stream: mut client,
        buffered,
    } = conn;

    let Some(destination) = metadata.destination.clone() else {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "connection has no destination"));
    };

    let outbound = outbound_of(&metadata.special_proxy).to_string();
    if outbound == REJECT {
        debug!(destination = %destination, "Connection rejected");
        return Ok(());
    }
    if outbound != DIRECT {
        warn!(outbound = %outbound, destination = %destination, "Unknown outbound, connection dropped");
        return Ok(());
    }

    let mut remote = dial(&destination).await?;
    let guard = stats.track(id, &metadata, vec![outbound], "MATCH");

    if !buffered.is_empty() {
        remote.write_all(&buffered).await?;
        guard.add_upload(buffered.len());
    }

    let closed = guard.closed();
    tokio::select! {
        _ = closed.cancelled() => {
            debug!(destination = %destination, "Connection closed by request");
        }
        result = relay_counted(&mut client, &mut remote, &guard) => {
            let (up, down) = result?;
            debug!(destination = %destination, up, down, "Connection finished");
        }
    }
    Ok(())
}

/// Copy both directions until both sides finish, counting each chunk as it
/// passes.
async fn relay_counted(
    client: &mut TcpStream,
    remote: &mut TcpStream,
    guard: &TrackerGuard,
) -> io::Result<(u64, u64)> {
    let (mut client_read, mut client_write) = client.split();
    let (mut remote_read, mut remote_write) = remote.split();

    let up = copy_counted(&mut client_read, &mut remote_write, |n| guard.add_upload(n));
    let down = copy_counted(&mut remote_read, &mut client_write, |n| guard.add_download(n));

    let (up, down) = tokio::join!(up, down);
    Ok((up.unwrap_or(0), down.unwrap_or(0)))
}

async fn copy_counted<R, W, F>(reader: &mut R, writer: &mut W, count: F) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
    F: Fn(usize),
{
    let mut total = 0u64;
    let mut buf = vec![0u8; RELAY_BUFFER];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        writer.write_all(&buf[..n]).await?;
        count(n);
        total += n as u64;
    }
    writer.shutdown().await?;
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inbound::InboundType;
    use crate::listener::{Ingress, Metadata, Network, PacketFraming};
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_tcp_relay_counts_bytes() {
        let echo = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let echo_addr = echo.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = echo.accept().await.unwrap();
            let mut buf = [0u8; 5];
            stream.read_exact(&mut buf).await.unwrap();
            stream.write_all(&buf).await.unwrap();
        });

        let front = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let front_addr = front.local_addr().unwrap();
        let mut client = TcpStream::connect(front_addr).await.unwrap();
        let (accepted, peer) = front.accept().await.unwrap();

        let stats = StatisticManager::new();
        let (ingress, receivers) = Ingress::channel(4);
        let shutdown = CancellationToken::new();
        let task = Dispatcher::new(stats.clone()).spawn(receivers, shutdown.clone());

        let metadata = Metadata::new(Network::Tcp, InboundType::Socks, peer)
            .with_destination(Target::Addr(echo_addr));
        ingress.tcp.send(ConnContext::new(metadata, accepted)).await.unwrap();

        client.write_all(b"hello").await.unwrap();
        let mut echoed = [0u8; 5];
        client.read_exact(&mut echoed).await.unwrap();
        assert_eq!(&echoed, b"hello");

        drop(client);
        for _ in 0..100 {
            let snapshot = stats.snapshot();
            if snapshot.connections.is_empty() && snapshot.download_total == 5 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let snapshot = stats.snapshot();
        assert_eq!(snapshot.upload_total, 5);
        assert_eq!(snapshot.download_total, 5);

        shutdown.cancel();
        task.await.unwrap();
    }
    #[tokio::test]
    async fn test_udp_flow_relays_replies() {
        let echo = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let echo_addr = echo.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 64];
            let (n, from) = echo.recv_from(&mut buf).await.unwrap();
            echo.send_to(&buf[..n], from).await.unwrap();
        });

        let inbound = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let source = client.local_addr().unwrap();

        let stats = StatisticManager::new();
        let (ingress, receivers) = Ingress::channel(4);
        let shutdown = CancellationToken::new();
        let task = Dispatcher::new(stats.clone()).spawn(receivers, shutdown.clone());

        // A flow that cannot resolve must not hold up the next one.
        let stuck = Metadata::new(Network::Udp, InboundType::Tproxy, source)
            .with_destination(Target::Domain("unresolvable.invalid".to_string(), 53));
        ingress
            .udp
            .send(PacketAdapter::new(stuck, Bytes::from_static(b"lost"), Arc::clone(&inbound), PacketFraming::Raw))
            .await
            .unwrap();

        let metadata = Metadata::new(Network::Udp, InboundType::Tproxy, source)
            .with_destination(Target::Addr(echo_addr));
        ingress
            .udp
            .send(PacketAdapter::new(metadata, Bytes::from_static(b"ping"), Arc::clone(&inbound), PacketFraming::Raw))
            .await
            .unwrap();

        let mut buf = [0u8; 64];
        let (n, from) = tokio::time::timeout(Duration::from_secs(5), client.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..n], b"ping");
        assert_eq!(from, inbound.local_addr().unwrap());
        assert_eq!(stats.snapshot().download_total, 4);

        shutdown.cancel();
        task.await.unwrap();
    }
}
