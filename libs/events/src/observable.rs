//! Multi-subscriber broadcast with per-subscriber bounded queues.
//!
//! A single producer publishes into the [`Observable`]; every live
//! [`Subscription`] owns a dedicated bounded channel. Delivery uses
//! `try_send`, so a subscriber whose buffer is full misses the event while
//! the producer and every other subscriber carry on.
//!
//! Unsubscribing takes the subscriber map lock that publishing holds while
//! it fans out, so a channel is never removed halfway through a send.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::task::{Context, Poll};

use futures_core::Stream;
use tokio::sync::mpsc;

/// Default per-subscriber buffer size.
pub const DEFAULT_SUBSCRIBER_BUFFER: usize = 1024;

struct Inner<T> {
    subscribers: Mutex<HashMap<u64, mpsc::Sender<T>>>,
    next_id: AtomicU64,
    buffer: usize,
}

impl<T> Inner<T> {
    fn remove(&self, id: u64) -> bool {
        let mut subscribers = match self.subscribers.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        subscribers.remove(&id).is_some()
    }
}

/// Fan-out broadcast bus.
pub struct Observable<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for Observable<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> std::fmt::Debug for Observable<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Observable")
            .field("buffer", &self.inner.buffer)
            .finish_non_exhaustive()
    }
}

impl<T: Clone + Send + 'static> Observable<T> {
    /// Create a bus whose subscribers each buffer up to `buffer` events.
    pub fn new(buffer: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                subscribers: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                buffer: buffer.max(1),
            }),
        }
    }

    /// Create a bus fed by `source`.
    ///
    /// Spawns a pump task on the current tokio runtime that forwards every
    /// item received on `source` to all subscribers. The task exits when
    /// every sender of `source` is dropped.
    pub fn spawn(mut source: mpsc::Receiver<T>, buffer: usize) -> Self {
        let observable = Self::new(buffer);
        let pump = observable.clone();
        tokio::spawn(async move {
            while let Some(item) = source.recv().await {
                pump.publish(item);
            }
        });
        observable
    }

    /// Deliver `item` to every subscriber without blocking.
    ///
    /// Returns the number of subscribers that accepted the event.
    pub fn publish(&self, item: T) -> usize {
        let mut subscribers = match self.inner.subscribers.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        let mut delivered = 0;
        let mut gone = Vec::new();
        for (id, tx) in subscribers.iter() {
            match tx.try_send(item.clone()) {
                Ok(()) => delivered += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {}
                Err(mpsc::error::TrySendError::Closed(_)) => gone.push(*id),
            }
        }
        for id in gone {
            subscribers.remove(&id);
        }

        delivered
    }

    /// Register a new subscriber.
    pub fn subscribe(&self) -> Subscription<T> {
        let (tx, rx) = mpsc::channel(self.inner.buffer);
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);

        let mut subscribers = match self.inner.subscribers.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        subscribers.insert(id, tx);

        Subscription {
            id,
            rx,
            bus: Arc::downgrade(&self.inner),
        }
    }

    /// Remove a subscriber and close its channel.
    pub fn unsubscribe(&self, subscription: Subscription<T>) {
        drop(subscription);
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        match self.inner.subscribers.lock() {
            Ok(guard) => guard.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }
}

/// Handle over one subscriber's channel.
///
/// Dropping the handle unsubscribes it.
pub struct Subscription<T> {
    id: u64,
    rx: mpsc::Receiver<T>,
    bus: Weak<Inner<T>>,
}

impl<T> Subscription<T> {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Wait for the next event. Returns `None` once the bus is gone.
    pub async fn recv(&mut self) -> Option<T> {
        self.rx.recv().await
    }

    /// Take an already buffered event, if any.
    pub fn try_recv(&mut self) -> Option<T> {
        self.rx.try_recv().ok()
    }
}

impl<T> Stream for Subscription<T> {
    type Item = T;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<T>> {
        self.rx.poll_recv(cx)
    }
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.remove(self.id);
        }
        self.rx.close();
    }
}

impl<T> std::fmt::Debug for Subscription<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}
