//! Bounded channel handlers.
//!
//! [`FifoChannel`] blocks the producer when the queue is full, so a slow
//! consumer applies backpressure to the delivering thread. A producer
//! blocked that way is released (and its item discarded) when the engine
//! closes the handler. [`RingChannel`] never blocks: when full, the oldest
//! queued item is evicted.
//!
//! Both hand back a [`Receiver`]; once the engine closes the handler and the
//! queue is drained, `recv` returns `None`.

use crate::handler::{DeliverySink, Handler, IntoHandler};
use parking_lot::Mutex;
use std::time::Duration;
use tracing::trace;

/// Default queue capacity of both channel kinds.
pub const DEFAULT_CAPACITY: usize = 256;

/// Receiving end of a channel handler.
#[derive(Debug)]
pub struct Receiver<T> {
    rx: flume::Receiver<T>,
}

impl<T> Receiver<T> {
    /// Block until the next item, or `None` once the handler closed and the queue is empty.
    pub fn recv(&self) -> Option<T> {
        self.rx.recv().ok()
    }

    /// Next item if one is queued.
    pub fn try_recv(&self) -> Option<T> {
        self.rx.try_recv().ok()
    }

    /// Like [`recv`](Self::recv) but gives up after `timeout`.
    pub fn recv_timeout(&self, timeout: Duration) -> Option<T> {
        self.rx.recv_timeout(timeout).ok()
    }

    pub async fn recv_async(&self) -> Option<T> {
        self.rx.recv_async().await.ok()
    }

    /// Blocking iterator ending when the handler closes.
    pub fn iter(&self) -> flume::Iter<'_, T> {
        self.rx.iter()
    }

    /// Queued items without blocking.
    pub fn try_iter(&self) -> flume::TryIter<'_, T> {
        self.rx.try_iter()
    }

    /// `true` once the handler closed (items may still be queued).
    pub fn is_closed(&self) -> bool {
        self.rx.is_disconnected()
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    /// Async stream of items, ending when the handler closes.
    pub fn stream(&self) -> impl futures::Stream<Item = T> + '_ {
        self.rx.stream()
    }

    pub fn into_stream(self) -> impl futures::Stream<Item = T>
    where
        T: 'static,
    {
        self.rx.into_stream()
    }
}

impl<'a, T> IntoIterator for &'a Receiver<T> {
    type Item = T;
    type IntoIter = flume::Iter<'a, T>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// First-in first-out bounded channel.
#[derive(Debug, Clone, Copy)]
pub struct FifoChannel {
    capacity: usize,
}

impl FifoChannel {
    /// A zero capacity is raised to one.
    pub const fn new(capacity: usize) -> Self {
        Self {
            capacity: if capacity == 0 { 1 } else { capacity },
        }
    }
}

impl Default for FifoChannel {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

struct FifoSink<T> {
    tx: flume::Sender<T>,
    // disconnected on interrupt, which wakes a blocked send
    stop_tx: Mutex<Option<flume::Sender<()>>>,
    stop_rx: flume::Receiver<()>,
}

impl<T: Send> Handler<T> for FifoSink<T> {
    fn on_event(&self, event: T) {
        if self.stop_rx.is_disconnected() {
            return;
        }
        let sent = flume::Selector::new()
            .send(&self.tx, event, |r| r.is_ok())
            .recv(&self.stop_rx, |_| false)
            .wait();
        if !sent {
            trace!("[HANDLER] fifo delivery abandoned");
        }
    }

    fn on_interrupt(&self) {
        self.stop_tx.lock().take();
    }
}

impl<T: Send + 'static> IntoHandler<T> for FifoChannel {
    type Receiver = Receiver<T>;

    fn into_handler(self) -> (DeliverySink<T>, Receiver<T>) {
        let (tx, rx) = flume::bounded(self.capacity);
        let (stop_tx, stop_rx) = flume::bounded(1);
        let sink = FifoSink {
            tx,
            stop_tx: Mutex::new(Some(stop_tx)),
            stop_rx,
        };
        (DeliverySink::new(sink), Receiver { rx })
    }
}

/// Bounded channel keeping the most recent items.
#[derive(Debug, Clone, Copy)]
pub struct RingChannel {
    capacity: usize,
}

impl RingChannel {
    /// A zero capacity is raised to one.
    pub const fn new(capacity: usize) -> Self {
        Self {
            capacity: if capacity == 0 { 1 } else { capacity },
        }
    }
}

impl Default for RingChannel {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

struct RingSink<T> {
    tx: flume::Sender<T>,
    // used only to evict the oldest item
    evict: flume::Receiver<T>,
    lock: Mutex<()>,
}

impl<T: Send> Handler<T> for RingSink<T> {
    fn on_event(&self, event: T) {
        let _guard = self.lock.lock();
        let mut event = event;
        loop {
            match self.tx.try_send(event) {
                Ok(()) => return,
                Err(flume::TrySendError::Full(back)) => {
                    let _ = self.evict.try_recv();
                    event = back;
                }
                Err(flume::TrySendError::Disconnected(_)) => return,
            }
        }
    }
}

impl<T: Send + 'static> IntoHandler<T> for RingChannel {
    type Receiver = Receiver<T>;

    fn into_handler(self) -> (DeliverySink<T>, Receiver<T>) {
        let (tx, rx) = flume::bounded(self.capacity);
        let sink = RingSink {
            tx,
            evict: rx.clone(),
            lock: Mutex::new(()),
        };
        (DeliverySink::new(sink), Receiver { rx })
    }
}
