//! Session lifecycle.
//!
//! A [`Session`] is a cheap handle on shared session state. Declared
//! entities keep a weak reference to that state, so dropping the last
//! `Session` handle closes the session even while entities are alive; their
//! operations then fail with [`TrellisError::SessionClosed`].
//!
//! Each open session runs two threads:
//! - `trellis-rx-<zid>` drains the inbound queue: peer hellos, declarations,
//!   publications, queries and replies from connected sessions
//! - `trellis-timer-<zid>` fires query deadlines

mod dispatch;
pub(crate) mod interest;
pub(crate) mod tables;

use crate::liveliness::{Replay, TokenTable};
use crate::publisher::PublisherState;
use crate::query::{self, PendingQuery, Query, TimerCmd};
use hashbrown::HashMap;
use interest::InterestIndex;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tables::EntityTable;
use tracing::{debug, trace};
use trellis_core::config::{Capabilities, Config, WhatAmI};
use trellis_core::error::{Result, TrellisError};
use trellis_core::fabric::{self, Inbox, Link};
use trellis_core::keyexpr::KeyExpr;
use trellis_core::message::{
    Body, Declaration, EntityId, Hello, NetworkMessage, QueryId, WireExpr,
};
use trellis_core::qos::Locality;
use trellis_core::registry::{Registry, ResourceId};
use trellis_core::sample::Sample;
use trellis_core::timestamp::{Clock, Timestamp, ZenohId};

const OPENING: u8 = 0;
const OPEN: u8 = 1;
const CLOSING: u8 = 2;
const CLOSED: u8 = 3;

/// Local queryable attributes.
#[derive(Debug, Clone, Copy)]
pub(crate) struct QueryableInfo {
    pub(crate) complete: bool,
    pub(crate) origin: Locality,
}

/// A connected session.
pub(crate) struct RemotePeer {
    pub(crate) hello: Hello,
    pub(crate) link: Link,
    /// Key expressions the peer declared, by its resource id
    pub(crate) keyexprs: HashMap<ResourceId, KeyExpr>,
}

#[derive(Default)]
pub(crate) struct Peers {
    pub(crate) peers: HashMap<ZenohId, RemotePeer>,
    pub(crate) subscribers: InterestIndex<()>,
    /// meta: queryable is complete
    pub(crate) queryables: InterestIndex<bool>,
}

impl Peers {
    pub(crate) fn link(&self, zid: &ZenohId) -> Option<Link> {
        self.peers.get(zid).map(|p| p.link.clone())
    }

    pub(crate) fn links_where<F>(&self, pred: F) -> Vec<Link>
    where
        F: Fn(&RemotePeer) -> bool,
    {
        self.peers
            .values()
            .filter(|p| pred(p))
            .map(|p| p.link.clone())
            .collect()
    }
}

pub(crate) struct SessionInner {
    pub(crate) zid: ZenohId,
    pub(crate) config: Config,
    pub(crate) clock: Clock,
    state: AtomicU8,
    pub(crate) registry: Registry,
    next_entity: AtomicU32,
    next_qid: AtomicU64,
    pub(crate) subscribers: EntityTable<Sample, Locality>,
    pub(crate) liveliness_subscribers: EntityTable<Sample, Replay>,
    pub(crate) queryables: EntityTable<Query, QueryableInfo>,
    pub(crate) publishers: Mutex<HashMap<EntityId, Arc<PublisherState>>>,
    /// Held while local token changes go on the wire and while declarations
    /// are synced to a new peer, so a peer never sees them out of order.
    /// Locked before `tokens`.
    pub(crate) token_announce: Mutex<()>,
    /// Locked before `liveliness_subscribers`. Never held across delivery.
    pub(crate) tokens: Mutex<TokenTable>,
    pub(crate) peers: RwLock<Peers>,
    pub(crate) queries: Mutex<HashMap<QueryId, Arc<PendingQuery>>>,
    inbox: Inbox,
    pub(crate) timer: flume::Sender<TimerCmd>,
    listening: Mutex<Vec<String>>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl SessionInner {
    #[inline]
    pub(crate) fn is_open(&self) -> bool {
        self.state.load(Ordering::Acquire) == OPEN
    }

    #[inline]
    pub(crate) fn is_closed(&self) -> bool {
        self.state.load(Ordering::Acquire) >= CLOSING
    }

    pub(crate) fn ensure_open(&self) -> Result<()> {
        if self.is_open() {
            Ok(())
        } else {
            Err(TrellisError::SessionClosed)
        }
    }

    pub(crate) fn require_queries(&self) -> Result<()> {
        if self.config.capabilities.queries {
            Ok(())
        } else {
            Err(TrellisError::Unsupported("queries"))
        }
    }

    pub(crate) fn require_liveliness(&self) -> Result<()> {
        if self.config.capabilities.liveliness {
            Ok(())
        } else {
            Err(TrellisError::Unsupported("liveliness"))
        }
    }

    pub(crate) fn next_entity_id(&self) -> EntityId {
        self.next_entity.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn next_query_id(&self) -> QueryId {
        self.next_qid.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn hello(&self) -> Hello {
        Hello {
            zid: self.zid,
            whatami: self.config.mode,
            capabilities: self.config.capabilities,
        }
    }

    /// Outgoing wire form of `key`, compact when it was declared.
    pub(crate) fn wire_expr(&self, key: &KeyExpr) -> WireExpr {
        match self.registry.id_of(key) {
            Some(id) => WireExpr::scoped(id),
            None => WireExpr::full(key),
        }
    }

    /// Key expression behind a wire expression received from `from`.
    pub(crate) fn resolve_wire(&self, from: &ZenohId, wire: &WireExpr) -> Option<KeyExpr> {
        if !wire.has_scope() {
            return KeyExpr::autocanonize(&wire.suffix).ok();
        }
        let base = self
            .peers
            .read()
            .peers
            .get(from)?
            .keyexprs
            .get(&wire.scope)?
            .clone();
        if wire.suffix.is_empty() {
            Some(base)
        } else {
            KeyExpr::autocanonize(&format!("{}{}", base, wire.suffix)).ok()
        }
    }

    /// Send a control message to every peer accepted by `pred`.
    pub(crate) fn broadcast_where<F>(&self, body: Body, pred: F)
    where
        F: Fn(&RemotePeer) -> bool,
    {
        let links = self.peers.read().links_where(pred);
        for link in links {
            if let Err(e) = link.send(NetworkMessage::control(body.clone())) {
                debug!("[SESSION] {} control send to {} failed: {}", self.zid, link.peer(), e);
            }
        }
    }

    pub(crate) fn broadcast(&self, body: Body) {
        self.broadcast_where(body, |_| true);
    }

    pub(crate) fn add_peer(&self, hello: Hello, link: Link) {
        if self.insert_peer(&hello, &link) {
            self.sync_declarations(&link, hello.capabilities);
        }
    }

    /// Register a linked peer. `false` if it was already known.
    fn insert_peer(&self, hello: &Hello, link: &Link) -> bool {
        {
            let mut peers = self.peers.write();
            if peers.peers.contains_key(&hello.zid) {
                debug!("[SESSION] {} already linked to {}, ignoring", self.zid, hello.zid);
                return false;
            }
            peers.peers.insert(
                hello.zid,
                RemotePeer {
                    hello: hello.clone(),
                    link: link.clone(),
                    keyexprs: HashMap::new(),
                },
            );
        }
        debug!(
            "[SESSION] {} peer up: {} ({})",
            self.zid, hello.zid, hello.whatami
        );
        true
    }

    /// Announce every current declaration to a freshly linked peer.
    fn sync_declarations(&self, link: &Link, remote: Capabilities) {
        let _announce = self.token_announce.lock();
        let mut decls: Vec<Declaration> = Vec::new();
        for (id, key_expr) in self.registry.entries() {
            decls.push(Declaration::KeyExpr { id, key_expr });
        }
        for (id, key_expr, origin) in self.subscribers.snapshot() {
            if origin.allows_remote() {
                decls.push(Declaration::Subscriber { id, key_expr });
            }
        }
        if remote.queries {
            for (id, key_expr, info) in self.queryables.snapshot() {
                if info.origin.allows_remote() {
                    decls.push(Declaration::Queryable {
                        id,
                        key_expr,
                        complete: info.complete,
                    });
                }
            }
        }
        if remote.liveliness {
            let tokens = self.tokens.lock().local_snapshot();
            for (id, key_expr) in tokens {
                decls.push(Declaration::Token { id, key_expr });
            }
        }
        trace!("[SESSION] {} syncing {} declarations to {}", self.zid, decls.len(), link.peer());
        for d in decls {
            if let Err(e) = link.send(NetworkMessage::control(Body::Declare(d))) {
                debug!("[SESSION] {} sync to {} failed: {}", self.zid, link.peer(), e);
                return;
            }
        }
    }

    pub(crate) fn remove_peer(&self, zid: &ZenohId) {
        let removed = {
            let mut peers = self.peers.write();
            let removed = peers.peers.remove(zid);
            peers.subscribers.remove_peer_everywhere(*zid);
            peers.queryables.remove_peer_everywhere(*zid);
            removed
        };
        if removed.is_none() {
            return;
        }
        debug!("[SESSION] {} peer down: {}", self.zid, zid);
        self.drop_remote_tokens(zid);
        let pending: Vec<_> = self.queries.lock().values().cloned().collect();
        for p in pending {
            p.remote_failed(zid, "peer disconnected");
        }
    }

    /// Query deadline reached.
    pub(crate) fn expire_query(&self, qid: QueryId) {
        let pending = self.queries.lock().remove(&qid);
        if let Some(p) = pending {
            debug!("[QUERY] {} query {} timed out", self.zid, qid);
            p.finalize(true);
        }
    }

    fn begin_close(&self) -> bool {
        let mut cur = self.state.load(Ordering::Acquire);
        loop {
            if cur >= CLOSING {
                return false;
            }
            match self
                .state
                .compare_exchange(cur, CLOSING, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return true,
                Err(actual) => cur = actual,
            }
        }
    }

    pub(crate) fn close(&self) {
        if !self.begin_close() {
            return;
        }
        debug!("[SESSION] {} closing", self.zid);

        self.undeclare_all_tokens();
        for e in self.subscribers.drain() {
            e.close();
        }
        for e in self.liveliness_subscribers.drain() {
            e.close();
        }
        for e in self.queryables.drain() {
            e.close();
        }
        for (_, p) in self.publishers.lock().drain() {
            p.kill();
        }

        let pending: Vec<_> = self.queries.lock().drain().map(|(_, p)| p).collect();
        for p in pending {
            p.finalize(false);
        }

        let links: Vec<Link> = {
            let mut peers = self.peers.write();
            let links = peers.peers.drain().map(|(_, p)| p.link).collect();
            *peers = Peers::default();
            links
        };
        for link in links {
            link.close();
        }
        for ep in self.listening.lock().drain(..) {
            fabric::unlisten(&ep);
        }
        self.registry.clear();

        let _ = self.timer.send(TimerCmd::Shutdown);
        let _ = self.inbox.try_send(fabric::LinkEvent::Shutdown);
        let me = thread::current().id();
        for handle in self.threads.lock().drain(..) {
            if handle.thread().id() == me {
                continue;
            }
            if handle.join().is_err() {
                debug!("[SESSION] {} worker thread panicked", self.zid);
            }
        }

        self.state.store(CLOSED, Ordering::Release);
        debug!("[SESSION] {} closed", self.zid);
    }
}

impl Drop for SessionInner {
    fn drop(&mut self) {
        self.close();
    }
}

/// Handle on an open session.
///
/// Cloning shares the session. The session closes on [`Session::close`] or
/// when the last handle is dropped.
#[derive(Clone)]
pub struct Session {
    pub(crate) inner: Arc<SessionInner>,
}

impl Session {
    /// Open a session: validate `config`, bind its listen endpoints, connect
    /// to its connect endpoints and start the worker threads.
    pub fn open(config: Config) -> Result<Self> {
        config.validate()?;
        let zid = config.id.unwrap_or_else(ZenohId::rand);
        let (inbox, inbox_rx) = flume::bounded(config.link_queue_size);
        let (timer_tx, timer_rx) = flume::unbounded();

        let inner = Arc::new(SessionInner {
            zid,
            clock: Clock::new(zid),
            state: AtomicU8::new(OPENING),
            registry: Registry::new(),
            next_entity: AtomicU32::new(1),
            next_qid: AtomicU64::new(1),
            subscribers: EntityTable::default(),
            liveliness_subscribers: EntityTable::default(),
            queryables: EntityTable::default(),
            publishers: Mutex::new(HashMap::new()),
            token_announce: Mutex::new(()),
            tokens: Mutex::new(TokenTable::default()),
            peers: RwLock::new(Peers::default()),
            queries: Mutex::new(HashMap::new()),
            inbox,
            timer: timer_tx,
            listening: Mutex::new(Vec::new()),
            threads: Mutex::new(Vec::new()),
            config,
        });
        // from here on, an early return drops `session`, which tears everything down
        let session = Self { inner };
        let inner = &session.inner;
        debug!("[SESSION] {} opening as {}", zid, inner.config.mode);

        let weak = Arc::downgrade(inner);
        let rx = dispatch::spawn_rx(zid, weak.clone(), inbox_rx)?;
        let timer = query::spawn_timer(zid, weak, timer_rx)?;
        inner.threads.lock().extend([rx, timer]);

        let hello = inner.hello();
        for ep in &inner.config.listen {
            fabric::listen(ep, hello.clone(), inner.inbox.clone())?;
            inner.listening.lock().push(ep.clone());
        }
        for ep in &inner.config.connect {
            let dial = fabric::dial(ep, hello.clone(), &inner.inbox)?;
            // the listener syncs its declarations as soon as it sees the open
            let fresh = inner.insert_peer(dial.remote(), dial.link());
            let (remote, link) = dial.open()?;
            if fresh {
                inner.sync_declarations(&link, remote.capabilities);
            }
        }

        inner.state.store(OPEN, Ordering::Release);
        debug!("[SESSION] {} open", zid);
        Ok(session)
    }

    /// Close the session. Idempotent.
    ///
    /// Undeclares every entity (firing drop notifications), ends pending
    /// queries and tells connected peers.
    pub fn close(&self) -> Result<()> {
        self.inner.close();
        Ok(())
    }

    /// `true` once `close` started.
    #[inline]
    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    #[inline]
    pub fn zid(&self) -> ZenohId {
        self.inner.zid
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// A fresh timestamp from the session's clock.
    pub fn new_timestamp(&self) -> Timestamp {
        self.inner.clock.new_timestamp()
    }

    /// Ids of connected sessions running as routers.
    pub fn get_routers_zid(&self) -> Vec<ZenohId> {
        self.peers_by_role(WhatAmI::Router)
    }

    /// Ids of connected sessions running as peers.
    pub fn get_peers_zid(&self) -> Vec<ZenohId> {
        self.peers_by_role(WhatAmI::Peer)
    }

    fn peers_by_role(&self, role: WhatAmI) -> Vec<ZenohId> {
        let mut out: Vec<_> = self
            .inner
            .peers
            .read()
            .peers
            .values()
            .filter(|p| p.hello.whatami == role)
            .map(|p| p.hello.zid)
            .collect();
        out.sort_unstable();
        out
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("zid", &self.inner.zid)
            .field("closed", &self.is_closed())
            .finish()
    }
}
