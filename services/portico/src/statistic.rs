//! Live connection tracking and traffic accounting.
//!
//! The dispatcher registers every relayed connection with
//! [`StatisticManager::track`] and reports bytes through the returned
//! [`TrackerGuard`]. A one-second ticker turns the byte counters into a
//! per-second rate and publishes it as a [`Traffic`] sample on the traffic
//! bus.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use portico_events::{Observable, Traffic, DEFAULT_SUBSCRIBER_BUFFER};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::listener::Metadata;

/// Serializable view of connection metadata.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionMetadata {
    pub network: String,
    #[serde(rename = "type")]
    pub conn_type: String,
    #[serde(rename = "sourceIP")]
    pub source_ip: String,
    pub source_port: String,
    pub host: String,
    #[serde(rename = "destinationIP")]
    pub destination_ip: String,
    pub destination_port: String,
    pub special_proxy: String,
}

impl From<&Metadata> for ConnectionMetadata {
    fn from(metadata: &Metadata) -> Self {
        let (host, destination_ip, destination_port) = match &metadata.destination {
            Some(crate::listener::Target::Addr(addr)) => {
                (String::new(), addr.ip().to_string(), addr.port().to_string())
            }
            Some(crate::listener::Target::Domain(host, port)) => {
                (host.clone(), String::new(), port.to_string())
            }
            None => (String::new(), String::new(), String::new()),
        };
        Self {
            network: metadata.network.to_string(),
            conn_type: metadata.conn_type.to_string(),
            source_ip: metadata.source.ip().to_string(),
            source_port: metadata.source.port().to_string(),
            host,
            destination_ip,
            destination_port,
            special_proxy: metadata.special_proxy.clone().unwrap_or_default(),
        }
    }
}

struct Tracker {
    id: Uuid,
    metadata: ConnectionMetadata,
    upload: AtomicU64,
    download: AtomicU64,
    start: DateTime<Utc>,
    chains: Vec<String>,
    rule: String,
    close: CancellationToken,
}

/// One tracked connection as reported to the API.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionInfo {
    pub id: Uuid,
    pub metadata: ConnectionMetadata,
    pub upload: u64,
    pub download: u64,
    pub start: DateTime<Utc>,
    pub chains: Vec<String>,
    pub rule: String,
}

/// Totals plus every live connection.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub download_total: i64,
    pub upload_total: i64,
    pub connections: Vec<ConnectionInfo>,
}

#[derive(Default)]
struct Counters {
    upload_temp: AtomicI64,
    download_temp: AtomicI64,
    upload_blip: AtomicI64,
    download_blip: AtomicI64,
    upload_total: AtomicI64,
    download_total: AtomicI64,
}

struct Inner {
    connections: Mutex<HashMap<Uuid, Arc<Tracker>>>,
    counters: Counters,
    traffic: Observable<Traffic>,
}

/// Connection registry and traffic counters.
#[derive(Clone)]
pub struct StatisticManager {
    inner: Arc<Inner>,
}

impl Default for StatisticManager {
    fn default() -> Self {
        Self::new()
    }
}

impl StatisticManager {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                connections: Mutex::new(HashMap::new()),
                counters: Counters::default(),
                traffic: Observable::new(DEFAULT_SUBSCRIBER_BUFFER),
            }),
        }
    }

    fn connections(&self) -> std::sync::MutexGuard<'_, HashMap<Uuid, Arc<Tracker>>> {
        match self.inner.connections.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Register a connection. It stays listed until the guard is dropped.
    pub fn track(&self, id: Uuid, metadata: &Metadata, chains: Vec<String>, rule: impl Into<String>) -> TrackerGuard {
        let tracker = Arc::new(Tracker {
            id,
            metadata: metadata.into(),
            upload: AtomicU64::new(0),
            download: AtomicU64::new(0),
            start: Utc::now(),
            chains,
            rule: rule.into(),
            close: CancellationToken::new(),
        });
        self.connections().insert(id, Arc::clone(&tracker));
        TrackerGuard {
            manager: self.clone(),
            tracker,
        }
    }

    /// Bytes per second over the last full second.
    pub fn now(&self) -> Traffic {
        let counters = &self.inner.counters;
        Traffic {
            up: counters.upload_blip.load(Ordering::Relaxed),
            down: counters.download_blip.load(Ordering::Relaxed),
        }
    }

    /// Bus carrying one [`Traffic`] sample per second.
    pub fn traffic(&self) -> &Observable<Traffic> {
        &self.inner.traffic
    }

    pub fn snapshot(&self) -> Snapshot {
        let mut connections: Vec<ConnectionInfo> = self
            .connections()
            .values()
            .map(|t| ConnectionInfo {
                id: t.id,
                metadata: t.metadata.clone(),
                upload: t.upload.load(Ordering::Relaxed),
                download: t.download.load(Ordering::Relaxed),
                start: t.start,
                chains: t.chains.clone(),
                rule: t.rule.clone(),
            })
            .collect();
        connections.sort_by_key(|c| c.start);

        Snapshot {
            download_total: self.inner.counters.download_total.load(Ordering::Relaxed),
            upload_total: self.inner.counters.upload_total.load(Ordering::Relaxed),
            connections,
        }
    }

    /// Ask one connection to close. Returns false if the id is unknown.
    pub fn close(&self, id: Uuid) -> bool {
        match self.connections().get(&id) {
            Some(tracker) => {
                tracker.close.cancel();
                true
            }
            None => false,
        }
    }

    /// Ask every connection to close. Returns how many were signalled.
    pub fn close_all(&self) -> usize {
        let connections = self.connections();
        for tracker in connections.values() {
            tracker.close.cancel();
        }
        connections.len()
    }

    /// Roll the per-second counters and publish a sample every second until
    /// `shutdown` fires.
    pub fn spawn_ticker(&self, shutdown: CancellationToken) -> tokio::task::JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(1));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let sample = manager.tick();
                        manager.inner.traffic.publish(sample);
                    }
                }
            }
        })
    }

    fn tick(&self) -> Traffic {
        let counters = &self.inner.counters;
        let up = counters.upload_temp.swap(0, Ordering::Relaxed);
        let down = counters.download_temp.swap(0, Ordering::Relaxed);
        counters.upload_blip.store(up, Ordering::Relaxed);
        counters.download_blip.store(down, Ordering::Relaxed);
        Traffic { up, down }
    }

    fn push_uploaded(&self, n: i64) {
        self.inner.counters.upload_temp.fetch_add(n, Ordering::Relaxed);
        self.inner.counters.upload_total.fetch_add(n, Ordering::Relaxed);
    }

    fn push_downloaded(&self, n: i64) {
        self.inner.counters.download_temp.fetch_add(n, Ordering::Relaxed);
        self.inner.counters.download_total.fetch_add(n, Ordering::Relaxed);
    }
}

/// Registration of one live connection. Dropping it unlists the connection.
pub struct TrackerGuard {
    manager: StatisticManager,
    tracker: Arc<Tracker>,
}

impl TrackerGuard {
    pub fn id(&self) -> Uuid {
        self.tracker.id
    }

    pub fn add_upload(&self, n: usize) {
        self.tracker.upload.fetch_add(n as u64, Ordering::Relaxed);
        self.manager.push_uploaded(n as i64);
    }

    pub fn add_download(&self, n: usize) {
        self.tracker.download.fetch_add(n as u64, Ordering::Relaxed);
        self.manager.push_downloaded(n as i64);
    }

    /// Fires when the connection was closed through the API.
    pub fn closed(&self) -> CancellationToken {
        self.tracker.close.clone()
    }
}

impl Drop for TrackerGuard {
    fn drop(&mut self) {
        self.manager.connections().remove(&self.tracker.id);
    }
}
