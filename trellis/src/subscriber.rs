//! Subscribers and local/remote publication fan-out.

use crate::options::{LivelinessSubscriberOptions, SubscriberOptions};
use crate::session::tables::Entry;
use crate::session::{Session, SessionInner};
use smallvec::SmallVec;
use std::fmt;
use std::ops::Deref;
use std::sync::{Arc, Weak};
use tracing::{debug, trace};
use trellis_core::error::Result;
use trellis_core::fabric::Link;
use trellis_core::handler::IntoHandler;
use trellis_core::keyexpr::{IntoKeyExpr, KeyExpr};
use trellis_core::message::{
    Body, Declaration, EntityId, NetworkMessage, Push, QosHeader, Undeclaration,
};
use trellis_core::qos::Locality;
use trellis_core::sample::Sample;
use trellis_core::timestamp::ZenohId;

/// Does an entity restricted to `origin` accept traffic from this (`local`) or another session?
#[inline]
pub(crate) fn origin_accepts(origin: Locality, local: bool) -> bool {
    if local {
        origin.allows_local()
    } else {
        origin.allows_remote()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SubscriberKind {
    Data,
    Liveliness,
}

/// A declared subscriber.
///
/// Dereferences to the handler's receiver, so channel subscribers can be
/// drained directly (`sub.recv()`). Undeclared explicitly or on drop.
pub struct Subscriber<R> {
    session: Weak<SessionInner>,
    id: EntityId,
    key_expr: KeyExpr,
    kind: SubscriberKind,
    receiver: R,
    undeclared: bool,
}

impl<R> Subscriber<R> {
    #[inline]
    pub fn key_expr(&self) -> &KeyExpr {
        &self.key_expr
    }

    #[inline]
    pub fn handler(&self) -> &R {
        &self.receiver
    }

    /// Stop deliveries and wait for any in-flight one to finish.
    ///
    /// The handler's drop notification has fired when this returns, unless
    /// called from inside this subscriber's own callback, in which case it
    /// fires as soon as that callback returns.
    pub fn undeclare(mut self) -> Result<()> {
        self.undeclare_impl();
        Ok(())
    }

    fn undeclare_impl(&mut self) {
        if std::mem::replace(&mut self.undeclared, true) {
            return;
        }
        let Some(inner) = self.session.upgrade() else {
            return;
        };
        match self.kind {
            SubscriberKind::Data => {
                if let Some(entry) = inner.subscribers.remove(self.id) {
                    entry.close();
                    if entry.meta.allows_remote() {
                        inner.broadcast(Body::Undeclare(Undeclaration::Subscriber(self.id)));
                    }
                }
            }
            SubscriberKind::Liveliness => {
                if let Some(entry) = inner.liveliness_subscribers.remove(self.id) {
                    entry.close();
                }
            }
        }
        debug!("[SUB] {} undeclared subscriber {} on {}", inner.zid, self.id, self.key_expr);
    }
}

impl<R> Deref for Subscriber<R> {
    type Target = R;

    fn deref(&self) -> &R {
        &self.receiver
    }
}

impl<R> Drop for Subscriber<R> {
    fn drop(&mut self) {
        self.undeclare_impl();
    }
}

impl<R> fmt::Debug for Subscriber<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscriber")
            .field("id", &self.id)
            .field("key_expr", &self.key_expr)
            .field("kind", &self.kind)
            .finish()
    }
}

impl SessionInner {
    pub(crate) fn declare_subscriber_entry<H>(
        self: &Arc<Self>,
        key_expr: KeyExpr,
        handler: H,
        origin: Locality,
    ) -> (EntityId, H::Receiver)
    where
        H: IntoHandler<Sample>,
    {
        let (sink, receiver) = handler.into_handler();
        let id = self.next_entity_id();
        self.subscribers
            .insert(Arc::new(Entry::new(id, key_expr.clone(), origin, sink)));
        if origin.allows_remote() {
            self.broadcast(Body::Declare(Declaration::Subscriber {
                id,
                key_expr: key_expr.clone(),
            }));
        }
        debug!("[SUB] {} declared subscriber {} on {}", self.zid, id, key_expr);
        (id, receiver)
    }

    /// Deliver to every intersecting local subscriber accepting the origin.
    pub(crate) fn deliver_local(&self, sample: &Sample, local_origin: bool) -> usize {
        let subs = self.subscribers.select(|e| {
            origin_accepts(e.meta, local_origin) && e.key_expr.intersects(&sample.key_expr)
        });
        for s in &subs {
            s.deliver(sample.clone());
        }
        subs.len()
    }

    /// Send to every peer with an intersecting subscriber.
    ///
    /// Every peer is attempted; the first transport failure is returned. A
    /// DROP publication discarded on a full queue is not a failure.
    pub(crate) fn push_remote(&self, sample: &Sample) -> Result<()> {
        let links: SmallVec<[Link; 8]> = {
            let peers = self.peers.read();
            peers
                .subscribers
                .matching_peers(&sample.key_expr)
                .iter()
                .filter_map(|z| peers.link(z))
                .collect()
        };
        if links.is_empty() {
            return Ok(());
        }
        let push = Push {
            wire_expr: self.wire_expr(&sample.key_expr),
            kind: sample.kind,
            payload: sample.payload.clone(),
            encoding: sample.encoding.clone(),
            timestamp: sample.timestamp,
            source_info: sample.source_info,
            attachment: sample.attachment.clone(),
        };
        let qos = QosHeader {
            priority: sample.priority,
            congestion_control: sample.congestion_control,
            express: sample.express,
            reliability: sample.reliability,
        };
        let mut failure = None;
        for link in links {
            match link.send(NetworkMessage::with_qos(Body::Push(push.clone()), qos)) {
                Ok(true) => {}
                Ok(false) => debug!(
                    "[PUB] {} dropped publication on {} towards {} (queue full)",
                    self.zid,
                    sample.key_expr,
                    link.peer()
                ),
                Err(e) => {
                    debug!("[PUB] {} push to {} failed: {}", self.zid, link.peer(), e);
                    failure.get_or_insert(e);
                }
            }
        }
        failure.map_or(Ok(()), Err)
    }

    /// Local fan-out happens even when a remote push failed.
    pub(crate) fn route_sample(&self, sample: Sample, destination: Locality) -> Result<()> {
        let remote = if destination.allows_remote() {
            self.push_remote(&sample)
        } else {
            Ok(())
        };
        if destination.allows_local() {
            self.deliver_local(&sample, true);
        }
        remote
    }

    pub(crate) fn handle_push(&self, from: &ZenohId, push: Push, qos: QosHeader) {
        let Some(key_expr) = self.resolve_wire(from, &push.wire_expr) else {
            trace!("[SUB] {} unresolvable wire expr {} from {}", self.zid, push.wire_expr, from);
            return;
        };
        if let Some(ts) = &push.timestamp {
            self.clock.observe(ts);
        }
        let sample = Sample {
            key_expr,
            payload: push.payload,
            kind: push.kind,
            encoding: push.encoding,
            timestamp: push.timestamp,
            source_info: push.source_info,
            attachment: push.attachment,
            priority: qos.priority,
            congestion_control: qos.congestion_control,
            express: qos.express,
            reliability: qos.reliability,
        };
        self.deliver_local(&sample, false);
    }
}

impl Session {
    /// Declare a subscriber on `key_expr`.
    ///
    /// ```
    /// use trellis::prelude::*;
    /// use trellis::options::{PutOptions, SubscriberOptions};
    ///
    /// let session = trellis::open(Config::default()).unwrap();
    /// let sub = session
    ///     .declare_subscriber("demo/**", FifoChannel::default(), SubscriberOptions::default())
    ///     .unwrap();
    /// session.put("demo/a", "hello", PutOptions::default()).unwrap();
    /// assert_eq!(sub.recv().unwrap().payload().as_ref(), b"hello");
    /// ```
    pub fn declare_subscriber<K, H>(
        &self,
        key_expr: K,
        handler: H,
        options: SubscriberOptions,
    ) -> Result<Subscriber<H::Receiver>>
    where
        K: IntoKeyExpr,
        H: IntoHandler<Sample>,
    {
        self.inner.ensure_open()?;
        let key_expr = key_expr.into_key_expr()?;
        let (id, receiver) =
            self.inner
                .declare_subscriber_entry(key_expr.clone(), handler, options.allowed_origin);
        Ok(Subscriber {
            session: Arc::downgrade(&self.inner),
            id,
            key_expr,
            kind: SubscriberKind::Data,
            receiver,
            undeclared: false,
        })
    }

    /// Declare a callback subscriber living until the session closes.
    pub fn declare_background_subscriber<K, H>(
        &self,
        key_expr: K,
        handler: H,
        options: SubscriberOptions,
    ) -> Result<()>
    where
        K: IntoKeyExpr,
        H: IntoHandler<Sample, Receiver = ()>,
    {
        self.inner.ensure_open()?;
        let key_expr = key_expr.into_key_expr()?;
        self.inner
            .declare_subscriber_entry(key_expr, handler, options.allowed_origin);
        Ok(())
    }

    /// Declare a liveliness subscriber: a PUT for every token appearing on
    /// an intersecting key, a DELETE when it goes away.
    pub fn liveliness_declare_subscriber<K, H>(
        &self,
        key_expr: K,
        handler: H,
        options: LivelinessSubscriberOptions,
    ) -> Result<Subscriber<H::Receiver>>
    where
        K: IntoKeyExpr,
        H: IntoHandler<Sample>,
    {
        self.inner.ensure_open()?;
        self.inner.require_liveliness()?;
        let key_expr = key_expr.into_key_expr()?;
        let (id, receiver) =
            self.inner
                .declare_liveliness_subscriber_entry(key_expr.clone(), handler, options.history);
        Ok(Subscriber {
            session: Arc::downgrade(&self.inner),
            id,
            key_expr,
            kind: SubscriberKind::Liveliness,
            receiver,
            undeclared: false,
        })
    }

    /// Liveliness subscriber living until the session closes.
    pub fn liveliness_declare_background_subscriber<K, H>(
        &self,
        key_expr: K,
        handler: H,
        options: LivelinessSubscriberOptions,
    ) -> Result<()>
    where
        K: IntoKeyExpr,
        H: IntoHandler<Sample, Receiver = ()>,
    {
        self.inner.ensure_open()?;
        self.inner.require_liveliness()?;
        let key_expr = key_expr.into_key_expr()?;
        self.inner
            .declare_liveliness_subscriber_entry(key_expr, handler, options.history);
        Ok(())
    }
}
