//! Liveliness tokens.
//!
//! A token announces that something is alive on a key expression for as
//! long as it is declared. Liveliness subscribers see a PUT when a matching
//! token appears (locally or on a connected session) and a DELETE when it is
//! undeclared, its session closes or the link to its session drops.
//!
//! The token table lock only covers bookkeeping and picking the subscribers
//! to notify; delivery happens after it is released, so a slow liveliness
//! handler never holds up other declarations. A subscriber declared with
//! history queues the changes racing with its replay and receives them
//! right after it, so it never sees a token twice or misses one.

use crate::options::LivelinessGetOptions;
use crate::query::Finalizer;
use crate::session::tables::{Entry, Matches};
use crate::session::{Session, SessionInner};
use bytes::Bytes;
use parking_lot::Mutex;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, trace};
use trellis_core::error::Result;
use trellis_core::handler::IntoHandler;
use trellis_core::keyexpr::{IntoKeyExpr, KeyExpr};
use trellis_core::message::{
    Body, Declaration, EntityId, NetworkMessage, QueryId, Undeclaration,
};
use trellis_core::qos::ConsolidationMode;
use trellis_core::sample::{EntityGlobalId, Reply, Sample};
use trellis_core::timestamp::ZenohId;

#[derive(Debug, Default)]
pub(crate) struct TokenTable {
    local: Vec<(EntityId, KeyExpr)>,
    remote: Vec<((ZenohId, EntityId), KeyExpr)>,
}

impl TokenTable {
    pub(crate) fn local_snapshot(&self) -> Vec<(EntityId, KeyExpr)> {
        self.local.clone()
    }

    fn alive_matching(&self, key: &KeyExpr) -> Vec<KeyExpr> {
        self.local
            .iter()
            .map(|(_, k)| k)
            .chain(self.remote.iter().map(|(_, k)| k))
            .filter(|k| k.intersects(key))
            .cloned()
            .collect()
    }
}

/// Liveliness subscriber state: changes held back while history replays.
#[derive(Debug, Default)]
pub(crate) struct Replay {
    backlog: Mutex<Option<Vec<Sample>>>,
}

impl Replay {
    fn replaying() -> Self {
        Self {
            backlog: Mutex::new(Some(Vec::new())),
        }
    }
}

type LivelinessSubscriber = Entry<Sample, Replay>;

/// Hand `sample` to each target, or to its backlog while it replays.
fn notify(targets: &Matches<LivelinessSubscriber>, sample: &Sample) {
    for sub in targets {
        let deferred = match sub.meta.backlog.lock().as_mut() {
            Some(queued) => {
                queued.push(sample.clone());
                true
            }
            None => false,
        };
        if !deferred {
            sub.deliver(sample.clone());
        }
    }
}

/// Deliver `history`, then whatever queued up meanwhile, then go live.
fn replay(sub: &LivelinessSubscriber, history: Vec<KeyExpr>) {
    for k in history {
        sub.deliver(Sample::put(k, Bytes::new()));
    }
    loop {
        let queued = {
            let mut backlog = sub.meta.backlog.lock();
            let queued = backlog.take().unwrap_or_default();
            if !queued.is_empty() {
                *backlog = Some(Vec::new());
            }
            queued
        };
        if queued.is_empty() {
            break;
        }
        for sample in queued {
            sub.deliver(sample);
        }
    }
}

/// A declared liveliness token; undeclared explicitly or on drop.
pub struct LivelinessToken {
    session: Weak<SessionInner>,
    id: EntityId,
    key_expr: KeyExpr,
    undeclared: bool,
}

impl LivelinessToken {
    #[inline]
    pub fn key_expr(&self) -> &KeyExpr {
        &self.key_expr
    }

    pub fn undeclare(mut self) -> Result<()> {
        self.undeclare_impl();
        Ok(())
    }

    fn undeclare_impl(&mut self) {
        if std::mem::replace(&mut self.undeclared, true) {
            return;
        }
        if let Some(inner) = self.session.upgrade() {
            inner.undeclare_token(self.id);
        }
    }
}

impl Drop for LivelinessToken {
    fn drop(&mut self) {
        self.undeclare_impl();
    }
}

impl fmt::Debug for LivelinessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LivelinessToken")
            .field("id", &self.id)
            .field("key_expr", &self.key_expr)
            .finish()
    }
}

impl SessionInner {
    fn broadcast_liveliness(&self, body: Body) {
        self.broadcast_where(body, |p| p.hello.capabilities.liveliness);
    }

    pub(crate) fn declare_token(&self, key_expr: KeyExpr) -> EntityId {
        let id = self.next_entity_id();
        let targets = {
            let _announce = self.token_announce.lock();
            let targets = {
                let mut tokens = self.tokens.lock();
                tokens.local.push((id, key_expr.clone()));
                self.liveliness_subscribers.intersecting(&key_expr)
            };
            self.broadcast_liveliness(Body::Declare(Declaration::Token {
                id,
                key_expr: key_expr.clone(),
            }));
            targets
        };
        debug!("[LIVELINESS] {} token {} up on {}", self.zid, id, key_expr);
        notify(&targets, &Sample::put(key_expr, Bytes::new()));
        id
    }

    pub(crate) fn undeclare_token(&self, id: EntityId) {
        let removed = {
            let _announce = self.token_announce.lock();
            let removed = {
                let mut tokens = self.tokens.lock();
                let pos = tokens.local.iter().position(|(tid, _)| *tid == id);
                pos.map(|pos| {
                    let key_expr = tokens.local.remove(pos).1;
                    let targets = self.liveliness_subscribers.intersecting(&key_expr);
                    (key_expr, targets)
                })
            };
            if removed.is_some() {
                self.broadcast_liveliness(Body::Undeclare(Undeclaration::Token(id)));
            }
            removed
        };
        if let Some((key_expr, targets)) = removed {
            debug!("[LIVELINESS] {} token {} down on {}", self.zid, id, key_expr);
            notify(&targets, &Sample::delete(key_expr));
        }
    }

    pub(crate) fn undeclare_all_tokens(&self) {
        let gone: Vec<_> = {
            let _announce = self.token_announce.lock();
            let gone: Vec<_> = {
                let mut tokens = self.tokens.lock();
                std::mem::take(&mut tokens.local)
                    .into_iter()
                    .map(|(id, k)| {
                        let targets = self.liveliness_subscribers.intersecting(&k);
                        (id, k, targets)
                    })
                    .collect()
            };
            for (id, _, _) in &gone {
                self.broadcast_liveliness(Body::Undeclare(Undeclaration::Token(*id)));
            }
            gone
        };
        for (_, key_expr, targets) in gone {
            notify(&targets, &Sample::delete(key_expr));
        }
    }

    pub(crate) fn remote_token_declared(&self, from: ZenohId, id: EntityId, key_expr: KeyExpr) {
        let targets = {
            let mut tokens = self.tokens.lock();
            if tokens.remote.iter().any(|(k, _)| *k == (from, id)) {
                return;
            }
            tokens.remote.push(((from, id), key_expr.clone()));
            self.liveliness_subscribers.intersecting(&key_expr)
        };
        trace!("[LIVELINESS] {} remote token {}:{} up on {}", self.zid, from, id, key_expr);
        notify(&targets, &Sample::put(key_expr, Bytes::new()));
    }

    pub(crate) fn remote_token_undeclared(&self, from: ZenohId, id: EntityId) {
        let removed = {
            let mut tokens = self.tokens.lock();
            let pos = tokens.remote.iter().position(|(k, _)| *k == (from, id));
            pos.map(|pos| {
                let key_expr = tokens.remote.remove(pos).1;
                let targets = self.liveliness_subscribers.intersecting(&key_expr);
                (key_expr, targets)
            })
        };
        if let Some((key_expr, targets)) = removed {
            trace!("[LIVELINESS] {} remote token {}:{} down on {}", self.zid, from, id, key_expr);
            notify(&targets, &Sample::delete(key_expr));
        }
    }

    /// Every token of `zid` goes away with its link.
    pub(crate) fn drop_remote_tokens(&self, zid: &ZenohId) {
        let gone: Vec<_> = {
            let mut tokens = self.tokens.lock();
            let mut gone = Vec::new();
            tokens.remote.retain(|((peer, _), k)| {
                if peer == zid {
                    gone.push(k.clone());
                    false
                } else {
                    true
                }
            });
            gone.into_iter()
                .map(|k| {
                    let targets = self.liveliness_subscribers.intersecting(&k);
                    (k, targets)
                })
                .collect()
        };
        for (key_expr, targets) in gone {
            notify(&targets, &Sample::delete(key_expr));
        }
    }

    pub(crate) fn declare_liveliness_subscriber_entry<H>(
        &self,
        key_expr: KeyExpr,
        handler: H,
        history: bool,
    ) -> (EntityId, H::Receiver)
    where
        H: IntoHandler<Sample>,
    {
        let (sink, receiver) = handler.into_handler();
        let id = self.next_entity_id();
        let meta = if history {
            Replay::replaying()
        } else {
            Replay::default()
        };
        let entry = Arc::new(Entry::new(id, key_expr.clone(), meta, sink));
        let alive = {
            let tokens = self.tokens.lock();
            self.liveliness_subscribers.insert(entry.clone());
            history.then(|| tokens.alive_matching(&key_expr))
        };
        if let Some(alive) = alive {
            trace!("[LIVELINESS] {} replaying {} token(s) on {}", self.zid, alive.len(), key_expr);
            replay(&entry, alive);
        }
        debug!("[LIVELINESS] {} declared subscriber {} on {}", self.zid, id, key_expr);
        (id, receiver)
    }

    /// Answer a peer's liveliness query with this session's own tokens.
    pub(crate) fn handle_liveliness_request(&self, from: ZenohId, qid: QueryId, key_expr: &KeyExpr) {
        let Some(link) = self.peers.read().link(&from) else {
            return;
        };
        let _final = Finalizer::Remote {
            link: link.clone(),
            qid,
        };
        if !self.config.capabilities.liveliness {
            return;
        }
        let tokens = {
            let table = self.tokens.lock();
            table
                .local
                .iter()
                .filter(|(_, k)| k.intersects(key_expr))
                .cloned()
                .collect::<Vec<_>>()
        };
        for (id, k) in tokens {
            let reply = Reply::ok(
                Sample::put(k, Bytes::new()),
                Some(EntityGlobalId {
                    zid: self.zid,
                    eid: id,
                }),
            );
            if let Err(e) = link.send(NetworkMessage::control(Body::Reply { qid, reply })) {
                debug!("[LIVELINESS] {} reply to {} failed: {}", self.zid, from, e);
                return;
            }
        }
    }
}

impl Session {
    /// Declare a liveliness token on `key_expr`.
    pub fn declare_liveliness_token<K>(&self, key_expr: K) -> Result<LivelinessToken>
    where
        K: IntoKeyExpr,
    {
        self.inner.ensure_open()?;
        self.inner.require_liveliness()?;
        let key_expr = key_expr.into_key_expr()?;
        let id = self.inner.declare_token(key_expr.clone());
        Ok(LivelinessToken {
            session: Arc::downgrade(&self.inner),
            id,
            key_expr,
            undeclared: false,
        })
    }

    /// Query currently alive tokens intersecting `key_expr`.
    ///
    /// One PUT reply per token, from this session and every connected
    /// session; the handler closes once all have answered or on timeout.
    pub fn liveliness_get<K, H>(
        &self,
        key_expr: K,
        handler: H,
        options: LivelinessGetOptions,
    ) -> Result<H::Receiver>
    where
        K: IntoKeyExpr,
        H: IntoHandler<Reply>,
    {
        let inner = &self.inner;
        inner.ensure_open()?;
        inner.require_liveliness()?;
        let key_expr = key_expr.into_key_expr()?;
        let timeout = match options.timeout_ms {
            0 => inner.config.queries_default_timeout(),
            ms => Duration::from_millis(ms),
        };
        let (sink, receiver) = handler.into_handler();
        let pending =
            inner.register_query(key_expr.clone(), ConsolidationMode::None, false, sink, timeout);
        let guard = Finalizer::Local(pending.clone());

        let own = {
            let table = inner.tokens.lock();
            table
                .local
                .iter()
                .filter(|(_, k)| k.intersects(&key_expr))
                .cloned()
                .collect::<Vec<_>>()
        };
        for (id, k) in own {
            pending.on_reply(Reply::ok(
                Sample::put(k, Bytes::new()),
                Some(EntityGlobalId {
                    zid: inner.zid,
                    eid: id,
                }),
            ));
        }

        let links = inner
            .peers
            .read()
            .links_where(|p| p.hello.capabilities.liveliness);
        for link in links {
            let peer = link.peer();
            pending.expect_remote(peer);
            let body = Body::LivelinessRequest {
                qid: pending.qid,
                key_expr: key_expr.clone(),
            };
            if let Err(e) = link.send(NetworkMessage::control(body)) {
                pending.remote_failed(&peer, &e.to_string());
            }
        }
        drop(guard);
        Ok(receiver)
    }
}
