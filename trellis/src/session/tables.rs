//! Local entity tables.
//!
//! Design:
//! - One table per entity kind, entries kept in declaration order.
//! - Matching takes a snapshot of `Arc<Entry>` under the read lock and
//!   delivers outside it, so callbacks may declare or undeclare freely.
//! - Each entry guards its sink with its own `RwLock`. Delivery holds the
//!   read side; closing takes the write side, which waits for in-flight
//!   deliveries to finish before the sink (and its drop notification) goes.
//!   Before waiting, closing interrupts the sink so a delivery blocked on a
//!   full consumer queue returns.
//! - A thread closing an entry from inside that entry's own callback cannot
//!   wait on itself: the close is deferred to the end of the outermost
//!   delivery on that thread.

use parking_lot::RwLock;
use smallvec::SmallVec;
use std::cell::RefCell;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use trellis_core::handler::DeliverySink;
use trellis_core::keyexpr::KeyExpr;
use trellis_core::message::EntityId;

thread_local! {
    // entries this thread is currently delivering to, innermost last
    static DISPATCHING: RefCell<SmallVec<[usize; 8]>> = RefCell::new(SmallVec::new());
}

struct DispatchScope(usize);

impl DispatchScope {
    fn enter(uid: usize) -> Self {
        DISPATCHING.with(|d| d.borrow_mut().push(uid));
        Self(uid)
    }
}

impl Drop for DispatchScope {
    fn drop(&mut self) {
        DISPATCHING.with(|d| {
            let mut d = d.borrow_mut();
            if let Some(pos) = d.iter().rposition(|u| *u == self.0) {
                d.remove(pos);
            }
        });
    }
}

fn is_dispatching(uid: usize) -> bool {
    DISPATCHING.with(|d| d.borrow().contains(&uid))
}

pub(crate) struct Entry<T, M> {
    pub(crate) id: EntityId,
    pub(crate) key_expr: KeyExpr,
    pub(crate) meta: M,
    alive: AtomicBool,
    sink: RwLock<Option<DeliverySink<T>>>,
}

impl<T, M> Entry<T, M> {
    pub(crate) fn new(id: EntityId, key_expr: KeyExpr, meta: M, sink: DeliverySink<T>) -> Self {
        Self {
            id,
            key_expr,
            meta,
            alive: AtomicBool::new(true),
            sink: RwLock::new(Some(sink)),
        }
    }

    fn uid(&self) -> usize {
        self as *const Self as *const () as usize
    }

    #[inline]
    pub(crate) fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    /// Deliver one event. Returns `false` if the entry is closed or the handler panicked.
    pub(crate) fn deliver(&self, event: T) -> bool {
        if !self.is_alive() {
            return false;
        }
        let uid = self.uid();
        let delivered = {
            let _scope = DispatchScope::enter(uid);
            let guard = self.sink.read_recursive();
            match guard.as_ref() {
                Some(sink) if self.is_alive() => sink.deliver(event),
                _ => false,
            }
        };
        if !self.is_alive() && !is_dispatching(uid) {
            // closed from inside the callback
            self.close_sink();
        }
        delivered
    }

    /// Stop deliveries and release the sink once in-flight deliveries end.
    pub(crate) fn close(&self) {
        self.alive.store(false, Ordering::Release);
        if is_dispatching(self.uid()) {
            return;
        }
        if let Some(sink) = self.sink.read_recursive().as_ref() {
            sink.interrupt();
        }
        self.close_sink();
    }

    fn close_sink(&self) {
        let sink = self.sink.write().take();
        drop(sink);
    }
}

pub(crate) struct EntityTable<T, M> {
    entries: RwLock<Vec<Arc<Entry<T, M>>>>,
}

impl<T, M> Default for EntityTable<T, M> {
    fn default() -> Self {
        Self {
            entries: RwLock::new(Vec::new()),
        }
    }
}

pub(crate) type Matches<E> = SmallVec<[Arc<E>; 8]>;

impl<T, M> EntityTable<T, M> {
    pub(crate) fn insert(&self, entry: Arc<Entry<T, M>>) {
        self.entries.write().push(entry);
    }

    pub(crate) fn remove(&self, id: EntityId) -> Option<Arc<Entry<T, M>>> {
        let mut entries = self.entries.write();
        let pos = entries.iter().position(|e| e.id == id)?;
        Some(entries.remove(pos))
    }

    pub(crate) fn drain(&self) -> Vec<Arc<Entry<T, M>>> {
        std::mem::take(&mut *self.entries.write())
    }

    /// Entries satisfying `pred`, in declaration order.
    pub(crate) fn select<F>(&self, pred: F) -> Matches<Entry<T, M>>
    where
        F: Fn(&Entry<T, M>) -> bool,
    {
        self.entries
            .read()
            .iter()
            .filter(|e| pred(e))
            .cloned()
            .collect()
    }

    /// Entries whose key intersects `key`.
    pub(crate) fn intersecting(&self, key: &KeyExpr) -> Matches<Entry<T, M>> {
        self.select(|e| e.key_expr.intersects(key))
    }

    pub(crate) fn any<F>(&self, pred: F) -> bool
    where
        F: Fn(&Entry<T, M>) -> bool,
    {
        self.entries.read().iter().any(|e| pred(e))
    }

    /// `(id, key_expr, meta)` of every entry.
    pub(crate) fn snapshot(&self) -> Vec<(EntityId, KeyExpr, M)>
    where
        M: Clone,
    {
        self.entries
            .read()
            .iter()
            .map(|e| (e.id, e.key_expr.clone(), e.meta.clone()))
            .collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.read().len()
    }
}
