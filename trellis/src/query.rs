//! Query/reply engine.
//!
//! A `get` registers a [`PendingQuery`] and hands a [`Query`] to every
//! selected queryable, local ones by direct delivery and remote ones through
//! a `Request`. The pending query counts what it still waits for:
//!
//! - one unit per local queryable, released when the last clone of the
//!   delivered [`Query`] is dropped
//! - one unit per remote session, released by its `ReplyFinal` (sent by that
//!   session once its own queries are dropped) or by losing the link
//! - one guard unit held for the duration of `get` itself
//!
//! At zero the query completes: buffered LATEST replies are flushed and the
//! reply handler is closed. The deadline closes it early with a
//! `Timeout` error reply.

use crate::options::{GetOptions, ReplyDelOptions, ReplyErrOptions, ReplyOptions};
use crate::session::tables::Entry;
use crate::session::{QueryableInfo, Session, SessionInner};
use bytes::Bytes;
use hashbrown::HashMap;
use parking_lot::ReentrantMutex;
use smallvec::SmallVec;
use std::cell::RefCell;
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::fmt;
use std::io;
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, trace};
use trellis_core::error::{KeyExprError, Result, TrellisError};
use trellis_core::fabric::Link;
use trellis_core::handler::{DeliverySink, IntoHandler};
use trellis_core::keyexpr::{IntoKeyExpr, KeyExpr};
use trellis_core::message::{Body, EntityId, NetworkMessage, QosHeader, QueryId, Request};
use trellis_core::qos::{CongestionControl, ConsolidationMode, QueryTarget, Reliability, ReplyKeyExpr};
use trellis_core::sample::{
    Encoding, EntityGlobalId, Reply, ReplyError, ReplyErrorKind, Sample, SampleKind,
};
use trellis_core::selector::Parameters;
use trellis_core::timestamp::{Timestamp, ZenohId};

/// AUTO resolves to NONE for time-range selectors, LATEST otherwise.
pub(crate) fn resolve_consolidation(mode: ConsolidationMode, parameters: &Parameters) -> ConsolidationMode {
    match mode {
        ConsolidationMode::Auto if parameters.has_time_range() => ConsolidationMode::None,
        ConsolidationMode::Auto => ConsolidationMode::Latest,
        other => other,
    }
}

#[derive(Default)]
struct PendingState {
    finished: bool,
    outstanding: usize,
    remotes: SmallVec<[ZenohId; 4]>,
    // MONOTONIC: newest forwarded timestamp per key
    newest: HashMap<KeyExpr, Option<Timestamp>>,
    // LATEST: one buffered reply per key, in first-seen order
    latest: Vec<Reply>,
    latest_idx: HashMap<KeyExpr, usize>,
}

pub(crate) struct PendingQuery {
    pub(crate) qid: QueryId,
    key_expr: KeyExpr,
    mode: ConsolidationMode,
    accept_any: bool,
    session: Weak<SessionInner>,
    // re-entrant: a reply callback may close the session, which finalizes this query
    state: ReentrantMutex<RefCell<PendingState>>,
    sink: Entry<Reply, ()>,
}

impl PendingQuery {
    pub(crate) fn new(
        qid: QueryId,
        key_expr: KeyExpr,
        mode: ConsolidationMode,
        accept_any: bool,
        session: Weak<SessionInner>,
        sink: DeliverySink<Reply>,
    ) -> Self {
        Self {
            qid,
            sink: Entry::new(0, key_expr.clone(), (), sink),
            key_expr,
            mode,
            accept_any,
            session,
            state: ReentrantMutex::new(RefCell::new(PendingState {
                outstanding: 1,
                ..PendingState::default()
            })),
        }
    }

    pub(crate) fn add_outstanding(&self) {
        let guard = self.state.lock();
        guard.borrow_mut().outstanding += 1;
    }

    /// Wait for a `ReplyFinal` from `zid`.
    pub(crate) fn expect_remote(&self, zid: ZenohId) {
        let guard = self.state.lock();
        let mut st = guard.borrow_mut();
        if !st.remotes.contains(&zid) {
            st.remotes.push(zid);
            st.outstanding += 1;
        }
    }

    pub(crate) fn complete_one(&self) {
        let done = {
            let guard = self.state.lock();
            let mut st = guard.borrow_mut();
            st.outstanding = st.outstanding.saturating_sub(1);
            st.outstanding == 0 && !st.finished
        };
        if done {
            self.finalize(false);
        }
    }

    fn take_remote(&self, zid: &ZenohId) -> bool {
        let guard = self.state.lock();
        let mut st = guard.borrow_mut();
        match st.remotes.iter().position(|z| z == zid) {
            Some(pos) => {
                st.remotes.swap_remove(pos);
                true
            }
            None => false,
        }
    }

    pub(crate) fn remote_final(&self, zid: &ZenohId) {
        if self.take_remote(zid) {
            self.complete_one();
        }
    }

    /// The route to `zid` failed before it finished replying.
    pub(crate) fn remote_failed(&self, zid: &ZenohId, msg: &str) {
        if self.take_remote(zid) {
            debug!("[QUERY] query {} lost {}: {}", self.qid, zid, msg);
            self.on_reply(Reply::err(
                ReplyError::new(ReplyErrorKind::Transport, format!("{zid}: {msg}")),
                None,
            ));
            self.complete_one();
        }
    }

    /// Delivery happens outside the state lock, so a reply blocked on a full
    /// handler never holds up `finalize`.
    pub(crate) fn on_reply(&self, reply: Reply) {
        let guard = self.state.lock();
        let forward = {
            let mut st = guard.borrow_mut();
            if st.finished {
                return;
            }
            match &reply.result {
                Err(_) => Some(reply),
                Ok(sample) => {
                    if !self.accept_any && !sample.key_expr.intersects(&self.key_expr) {
                        trace!(
                            "[QUERY] query {} dropping reply on {} outside {}",
                            self.qid,
                            sample.key_expr,
                            self.key_expr
                        );
                        return;
                    }
                    let key = sample.key_expr.clone();
                    let ts = sample.timestamp;
                    match self.mode {
                        ConsolidationMode::Auto | ConsolidationMode::None => Some(reply),
                        ConsolidationMode::Monotonic => match st.newest.get(&key) {
                            Some(prev) if ts <= *prev => None,
                            _ => {
                                st.newest.insert(key, ts);
                                Some(reply)
                            }
                        },
                        ConsolidationMode::Latest => {
                            match st.latest_idx.get(&key).copied() {
                                Some(idx) => {
                                    let old = st.latest[idx].sample().and_then(|s| s.timestamp);
                                    if (old.is_none() && ts.is_none()) || ts > old {
                                        st.latest[idx] = reply;
                                    }
                                }
                                None => {
                                    let idx = st.latest.len();
                                    st.latest.push(reply);
                                    st.latest_idx.insert(key, idx);
                                }
                            }
                            None
                        }
                    }
                }
            }
        };
        drop(guard);
        if let Some(reply) = forward {
            self.sink.deliver(reply);
        }
    }

    /// Flush, close the handler and forget the query. Idempotent.
    pub(crate) fn finalize(&self, timed_out: bool) {
        let guard = self.state.lock();
        let buffered = {
            let mut st = guard.borrow_mut();
            if st.finished {
                return;
            }
            st.finished = true;
            st.latest_idx.clear();
            std::mem::take(&mut st.latest)
        };
        for reply in buffered {
            self.sink.deliver(reply);
        }
        if timed_out {
            self.sink.deliver(Reply::err(
                ReplyError::new(ReplyErrorKind::Timeout, "query timed out"),
                None,
            ));
        }
        drop(guard);
        if let Some(session) = self.session.upgrade() {
            session.queries.lock().remove(&self.qid);
        }
        self.sink.close();
        trace!("[QUERY] query {} finished (timed out: {})", self.qid, timed_out);
    }
}

/// Completion of one queryable's share of a query, signalled on drop.
pub(crate) enum Finalizer {
    Local(Arc<PendingQuery>),
    Remote { link: Link, qid: QueryId },
}

impl Drop for Finalizer {
    fn drop(&mut self) {
        match self {
            Self::Local(pending) => pending.complete_one(),
            Self::Remote { link, qid } => {
                let msg = NetworkMessage::control(Body::ReplyFinal { qid: *qid });
                if let Err(e) = link.send(msg) {
                    trace!("[QUERY] final for query {} to {} not sent: {}", qid, link.peer(), e);
                }
            }
        }
    }
}

struct QueryInner {
    key_expr: KeyExpr,
    parameters: Parameters,
    payload: Option<Bytes>,
    encoding: Option<Encoding>,
    attachment: Option<Bytes>,
    accept_any: bool,
    replier: EntityGlobalId,
    session: Weak<SessionInner>,
    finalizer: Arc<Finalizer>,
}

/// A query delivered to a queryable.
///
/// Reply through it while it is alive. The querier considers this
/// queryable finished once every clone is dropped.
#[derive(Clone)]
pub struct Query {
    inner: Arc<QueryInner>,
}

impl Query {
    #[inline]
    pub fn key_expr(&self) -> &KeyExpr {
        &self.inner.key_expr
    }

    #[inline]
    pub fn parameters(&self) -> &Parameters {
        &self.inner.parameters
    }

    /// `key?parameters`, or just the key without parameters.
    pub fn selector(&self) -> String {
        if self.inner.parameters.is_empty() {
            self.inner.key_expr.to_string()
        } else {
            format!("{}?{}", self.inner.key_expr, self.inner.parameters)
        }
    }

    pub fn payload(&self) -> Option<&Bytes> {
        self.inner.payload.as_ref()
    }

    pub fn encoding(&self) -> Option<&Encoding> {
        self.inner.encoding.as_ref()
    }

    pub fn attachment(&self) -> Option<&Bytes> {
        self.inner.attachment.as_ref()
    }

    /// Whether replies on keys outside the query's key are accepted.
    pub fn accepts_any_key(&self) -> bool {
        self.inner.accept_any
    }

    /// Reply with a value on `key_expr`.
    ///
    /// Fails with `KeyExprError::ReplyOutsideQuery` if `key_expr` does not
    /// intersect the query's key and the querier did not accept any key.
    pub fn reply<K>(&self, key_expr: K, payload: impl Into<Bytes>, options: ReplyOptions) -> Result<()>
    where
        K: IntoKeyExpr,
    {
        let key_expr = self.reply_key(key_expr)?;
        let sample = Sample {
            key_expr,
            payload: payload.into(),
            kind: SampleKind::Put,
            encoding: options.encoding.unwrap_or_default(),
            timestamp: options.timestamp,
            source_info: options.source_info,
            attachment: options.attachment,
            priority: options.priority,
            congestion_control: options.congestion_control,
            express: options.is_express,
            reliability: Reliability::Reliable,
        };
        self.send(Reply::ok(sample, Some(self.inner.replier)))
    }

    /// Reply with a deletion of `key_expr`.
    pub fn reply_del<K>(&self, key_expr: K, options: ReplyDelOptions) -> Result<()>
    where
        K: IntoKeyExpr,
    {
        let key_expr = self.reply_key(key_expr)?;
        let sample = Sample {
            kind: SampleKind::Delete,
            timestamp: options.timestamp,
            source_info: options.source_info,
            attachment: options.attachment,
            priority: options.priority,
            congestion_control: options.congestion_control,
            express: options.is_express,
            reliability: Reliability::Reliable,
            ..Sample::put(key_expr, Bytes::new())
        };
        self.send(Reply::ok(sample, Some(self.inner.replier)))
    }

    /// Reply with an error.
    pub fn reply_err(&self, payload: impl Into<Bytes>, options: ReplyErrOptions) -> Result<()> {
        let error = ReplyError {
            payload: payload.into(),
            encoding: options.encoding.unwrap_or_default(),
            kind: ReplyErrorKind::Replier,
        };
        self.replier_session()?;
        self.send(Reply::err(error, Some(self.inner.replier)))
    }

    fn replier_session(&self) -> Result<Arc<SessionInner>> {
        match self.inner.session.upgrade() {
            Some(s) if s.is_open() => Ok(s),
            _ => Err(TrellisError::SessionClosed),
        }
    }

    fn reply_key<K: IntoKeyExpr>(&self, key_expr: K) -> Result<KeyExpr> {
        self.replier_session()?;
        let key_expr = key_expr.into_key_expr()?;
        if !self.inner.accept_any && !key_expr.intersects(&self.inner.key_expr) {
            return Err(KeyExprError::ReplyOutsideQuery {
                reply: key_expr.to_string(),
                query: self.inner.key_expr.to_string(),
            }
            .into());
        }
        Ok(key_expr)
    }

    fn send(&self, reply: Reply) -> Result<()> {
        match &*self.inner.finalizer {
            Finalizer::Local(pending) => {
                pending.on_reply(reply);
                Ok(())
            }
            Finalizer::Remote { link, qid } => {
                let qos = match &reply.result {
                    Ok(s) => QosHeader {
                        priority: s.priority,
                        congestion_control: s.congestion_control,
                        express: s.express,
                        reliability: Reliability::Reliable,
                    },
                    Err(_) => QosHeader {
                        congestion_control: CongestionControl::Block,
                        reliability: Reliability::Reliable,
                        ..QosHeader::default()
                    },
                };
                let body = Body::Reply { qid: *qid, reply };
                if !link.send(NetworkMessage::with_qos(body, qos))? {
                    debug!("[QUERY] reply to query {} towards {} dropped (queue full)", qid, link.peer());
                }
                Ok(())
            }
        }
    }
}

impl fmt::Debug for Query {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Query")
            .field("selector", &self.selector())
            .field("replier", &self.inner.replier)
            .finish()
    }
}

/// What a `Query` carries besides its routing.
pub(crate) struct QueryBody {
    pub(crate) key_expr: KeyExpr,
    pub(crate) parameters: Parameters,
    pub(crate) payload: Option<Bytes>,
    pub(crate) encoding: Option<Encoding>,
    pub(crate) attachment: Option<Bytes>,
    pub(crate) accept_any: bool,
}

impl SessionInner {
    fn make_query(self: &Arc<Self>, body: &QueryBody, eid: EntityId, finalizer: Arc<Finalizer>) -> Query {
        Query {
            inner: Arc::new(QueryInner {
                key_expr: body.key_expr.clone(),
                parameters: body.parameters.clone(),
                payload: body.payload.clone(),
                encoding: body.encoding.clone(),
                attachment: body.attachment.clone(),
                accept_any: body.accept_any,
                replier: EntityGlobalId {
                    zid: self.zid,
                    eid,
                },
                session: Arc::downgrade(self),
                finalizer,
            }),
        }
    }

    /// Serve a query from `from` with the local queryables it selects.
    pub(crate) fn handle_request(self: &Arc<Self>, from: ZenohId, req: Request) {
        let Some(link) = self.peers.read().link(&from) else {
            return;
        };
        let finalizer = Arc::new(Finalizer::Remote {
            link,
            qid: req.qid,
        });
        if !self.config.capabilities.queries {
            trace!("[QUERY] {} queries disabled, finishing {} from {}", self.zid, req.qid, from);
            return;
        }
        let Some(key_expr) = self.resolve_wire(&from, &req.wire_expr) else {
            trace!("[QUERY] {} unresolvable query key {} from {}", self.zid, req.wire_expr, from);
            return;
        };
        let targets = match (req.queryable, req.target) {
            (Some(eid), _) => self
                .queryables
                .select(|e| e.id == eid && e.meta.origin.allows_remote()),
            (None, QueryTarget::AllComplete) => self.queryables.select(|e| {
                e.meta.origin.allows_remote() && e.meta.complete && e.key_expr.includes(&key_expr)
            }),
            (None, _) => self
                .queryables
                .select(|e| e.meta.origin.allows_remote() && e.key_expr.intersects(&key_expr)),
        };
        trace!(
            "[QUERY] {} query {} from {} on {}: {} queryable(s)",
            self.zid,
            req.qid,
            from,
            key_expr,
            targets.len()
        );
        let body = QueryBody {
            key_expr,
            parameters: req.parameters,
            payload: req.payload,
            encoding: req.encoding,
            attachment: req.attachment,
            accept_any: req.accept_any_key,
        };
        for entry in targets {
            entry.deliver(self.make_query(&body, entry.id, finalizer.clone()));
        }
    }

    /// Register a pending query and arm its deadline.
    pub(crate) fn register_query(
        self: &Arc<Self>,
        key_expr: KeyExpr,
        mode: ConsolidationMode,
        accept_any: bool,
        sink: DeliverySink<Reply>,
        timeout: Duration,
    ) -> Arc<PendingQuery> {
        let qid = self.next_query_id();
        let pending = Arc::new(PendingQuery::new(
            qid,
            key_expr,
            mode,
            accept_any,
            Arc::downgrade(self),
            sink,
        ));
        self.queries.lock().insert(qid, pending.clone());
        let deadline = Instant::now() + timeout;
        if self.timer.send(TimerCmd::Arm { qid, deadline }).is_err() {
            debug!("[QUERY] {} timer gone, query {} has no deadline", self.zid, qid);
        }
        pending
    }
}

type QueryableEntry = Entry<Query, QueryableInfo>;

struct RemoteTarget {
    peer: ZenohId,
    queryable: Option<EntityId>,
    target: QueryTarget,
}

impl Session {
    /// Query `key_expr`. Replies go to `handler`, which is closed once the
    /// query completes or times out.
    ///
    /// ```
    /// use trellis::prelude::*;
    /// use trellis::options::{GetOptions, QueryableOptions, ReplyOptions};
    ///
    /// let session = trellis::open(Config::default()).unwrap();
    /// let _q = session
    ///     .declare_queryable(
    ///         "demo/q",
    ///         |q: Query| {
    ///             q.reply("demo/q", "42", ReplyOptions::default()).unwrap();
    ///         },
    ///         QueryableOptions::default(),
    ///     )
    ///     .unwrap();
    /// let replies = session
    ///     .get("demo/q", "", FifoChannel::default(), GetOptions::default())
    ///     .unwrap();
    /// let reply = replies.recv().unwrap();
    /// assert_eq!(reply.sample().unwrap().payload().as_ref(), b"42");
    /// assert!(replies.recv().is_none());
    /// ```
    pub fn get<K, P, H>(
        &self,
        key_expr: K,
        parameters: P,
        handler: H,
        options: GetOptions,
    ) -> Result<H::Receiver>
    where
        K: IntoKeyExpr,
        P: Into<Parameters>,
        H: IntoHandler<Reply>,
    {
        let inner = &self.inner;
        inner.ensure_open()?;
        inner.require_queries()?;
        let key_expr = key_expr.into_key_expr()?;
        let parameters = parameters.into();
        let mode = resolve_consolidation(options.consolidation, &parameters);
        let accept_any = options.accept_replies == ReplyKeyExpr::Any;
        let timeout = match options.timeout_ms {
            0 => inner.config.queries_default_timeout(),
            ms => Duration::from_millis(ms),
        };

        let (sink, receiver) = handler.into_handler();
        let pending = inner.register_query(key_expr.clone(), mode, accept_any, sink, timeout);
        let guard = Finalizer::Local(pending.clone());

        let destination = options.allowed_destination;
        let locals = if destination.allows_local() {
            inner.queryables.select(|e| {
                e.meta.origin.allows_local() && e.key_expr.intersects(&key_expr)
            })
        } else {
            SmallVec::new()
        };
        let remotes = if destination.allows_remote() {
            self.inner.peers.read().queryables.matching(&key_expr)
        } else {
            Vec::new()
        };

        let complete_including =
            |k: &KeyExpr, complete: bool| complete && k.includes(&key_expr);
        let mut local_targets: Vec<Arc<QueryableEntry>> = Vec::new();
        let mut remote_targets: SmallVec<[RemoteTarget; 4]> = SmallVec::new();
        let all = |local_targets: &mut Vec<Arc<QueryableEntry>>,
                   remote_targets: &mut SmallVec<[RemoteTarget; 4]>,
                   target: QueryTarget| {
            let complete_only = target == QueryTarget::AllComplete;
            local_targets.extend(
                locals
                    .iter()
                    .filter(|e| !complete_only || complete_including(&e.key_expr, e.meta.complete))
                    .cloned(),
            );
            for (k, h) in &remotes {
                if complete_only && !complete_including(k, h.meta) {
                    continue;
                }
                if !remote_targets.iter().any(|t| t.peer == h.peer) {
                    remote_targets.push(RemoteTarget {
                        peer: h.peer,
                        queryable: None,
                        target,
                    });
                }
            }
        };
        match options.target {
            QueryTarget::BestMatching => {
                let local_best = locals
                    .iter()
                    .filter(|e| complete_including(&e.key_expr, e.meta.complete))
                    .min_by_key(|e| e.id)
                    .cloned();
                let remote_best = remotes
                    .iter()
                    .filter(|(k, h)| complete_including(k, h.meta))
                    .min_by_key(|(_, h)| (h.id, h.peer))
                    .map(|(_, h)| *h);
                if let Some(entry) = local_best {
                    local_targets.push(entry);
                } else if let Some(h) = remote_best {
                    remote_targets.push(RemoteTarget {
                        peer: h.peer,
                        queryable: Some(h.id),
                        target: QueryTarget::BestMatching,
                    });
                } else {
                    all(&mut local_targets, &mut remote_targets, QueryTarget::All);
                }
            }
            target => all(&mut local_targets, &mut remote_targets, target),
        }
        debug!(
            "[QUERY] {} get {} on {}?{}: {} local, {} remote target(s), {:?}",
            inner.zid,
            pending.qid,
            key_expr,
            parameters,
            local_targets.len(),
            remote_targets.len(),
            mode
        );

        let body = QueryBody {
            key_expr: key_expr.clone(),
            parameters: parameters.clone(),
            payload: options.payload.clone(),
            encoding: options.encoding.clone(),
            attachment: options.attachment.clone(),
            accept_any,
        };
        for entry in local_targets {
            pending.add_outstanding();
            let query = inner.make_query(&body, entry.id, Arc::new(Finalizer::Local(pending.clone())));
            entry.deliver(query);
        }

        let qos = QosHeader {
            priority: options.priority,
            congestion_control: options.congestion_control,
            express: options.is_express,
            reliability: Reliability::Reliable,
        };
        let wire_expr = inner.wire_expr(&key_expr);
        for t in remote_targets {
            let Some(link) = inner.peers.read().link(&t.peer) else {
                continue;
            };
            pending.expect_remote(t.peer);
            let req = Request {
                qid: pending.qid,
                wire_expr: wire_expr.clone(),
                parameters: parameters.clone(),
                payload: options.payload.clone(),
                encoding: options.encoding.clone(),
                attachment: options.attachment.clone(),
                target: t.target,
                queryable: t.queryable,
                accept_any_key: accept_any,
            };
            match link.send(NetworkMessage::with_qos(Body::Request(req), qos)) {
                Ok(true) => {}
                Ok(false) => pending.remote_failed(&t.peer, "request dropped (queue full)"),
                Err(e) => pending.remote_failed(&t.peer, &e.to_string()),
            }
        }

        drop(guard);
        Ok(receiver)
    }
}

/// Commands for the deadline thread.
pub(crate) enum TimerCmd {
    Arm { qid: QueryId, deadline: Instant },
    Shutdown,
}

pub(crate) fn spawn_timer(
    zid: ZenohId,
    session: Weak<SessionInner>,
    rx: flume::Receiver<TimerCmd>,
) -> io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name(format!("trellis-timer-{zid}"))
        .spawn(move || timer_thread(session, rx))
}

fn timer_thread(session: Weak<SessionInner>, rx: flume::Receiver<TimerCmd>) {
    let mut deadlines: BinaryHeap<Reverse<(Instant, QueryId)>> = BinaryHeap::new();
    loop {
        let cmd = match deadlines.peek() {
            Some(Reverse((at, _))) => match rx.recv_deadline(*at) {
                Ok(cmd) => Some(cmd),
                Err(flume::RecvTimeoutError::Timeout) => None,
                Err(flume::RecvTimeoutError::Disconnected) => break,
            },
            None => match rx.recv() {
                Ok(cmd) => Some(cmd),
                Err(_) => break,
            },
        };
        match cmd {
            Some(TimerCmd::Arm { qid, deadline }) => deadlines.push(Reverse((deadline, qid))),
            Some(TimerCmd::Shutdown) => break,
            None => {}
        }
        let now = Instant::now();
        while let Some(&Reverse((at, qid))) = deadlines.peek() {
            if at > now {
                break;
            }
            deadlines.pop();
            let Some(inner) = session.upgrade() else {
                return;
            };
            inner.expire_query(qid);
        }
    }
    trace!("[TIMER] deadline thread exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use trellis_core::handler::Callback;
    use trellis_core::timestamp::Ntp64;

    fn collecting() -> (DeliverySink<Reply>, Arc<Mutex<Vec<Reply>>>, Arc<Mutex<bool>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let closed = Arc::new(Mutex::new(false));
        let (s, c) = (seen.clone(), closed.clone());
        let sink = DeliverySink::new(
            Callback::new(move |r: Reply| s.lock().push(r)).with_drop(move || *c.lock() = true),
        );
        (sink, seen, closed)
    }

    fn ke(s: &str) -> KeyExpr {
        KeyExpr::new(s).unwrap()
    }

    fn stamped(key: &str, payload: &'static str, t: Option<u64>) -> Reply {
        let id = ZenohId::from_bytes([1; 16]);
        let sample = Sample::put(ke(key), payload)
            .with_timestamp(t.map(|t| Timestamp::new(Ntp64(t), id)));
        Reply::ok(sample, None)
    }

    fn payloads(seen: &Mutex<Vec<Reply>>) -> Vec<String> {
        seen.lock()
            .iter()
            .map(|r| match &r.result {
                Ok(s) => String::from_utf8_lossy(s.payload()).into_owned(),
                Err(e) => format!("{:?}", e.kind),
            })
            .collect()
    }

    #[test]
    fn auto_consolidation() {
        assert_eq!(
            resolve_consolidation(ConsolidationMode::Auto, &Parameters::from("_time=[..]")),
            ConsolidationMode::None
        );
        assert_eq!(
            resolve_consolidation(ConsolidationMode::Auto, &Parameters::from("x=1")),
            ConsolidationMode::Latest
        );
        assert_eq!(
            resolve_consolidation(ConsolidationMode::Monotonic, &Parameters::empty()),
            ConsolidationMode::Monotonic
        );
    }

    #[test]
    fn latest_keeps_newest_per_key_until_completion() {
        let (sink, seen, closed) = collecting();
        let p = PendingQuery::new(1, ke("a/*"), ConsolidationMode::Latest, false, Weak::new(), sink);
        p.on_reply(stamped("a/x", "x1", Some(5)));
        p.on_reply(stamped("a/y", "y1", None));
        p.on_reply(stamped("a/x", "x0", Some(3)));
        p.on_reply(stamped("a/x", "x2", Some(9)));
        p.on_reply(stamped("a/y", "y2", None));
        assert!(seen.lock().is_empty());
        p.complete_one();
        assert_eq!(payloads(&seen), vec!["x2", "y2"]);
        assert!(*closed.lock());
    }

    #[test]
    fn monotonic_forwards_strictly_newer() {
        let (sink, seen, _closed) = collecting();
        let p = PendingQuery::new(1, ke("a/*"), ConsolidationMode::Monotonic, false, Weak::new(), sink);
        p.on_reply(stamped("a/x", "1", Some(2)));
        p.on_reply(stamped("a/x", "2", Some(2)));
        p.on_reply(stamped("a/x", "3", Some(1)));
        p.on_reply(stamped("a/x", "4", Some(7)));
        p.on_reply(stamped("a/y", "5", None));
        assert_eq!(payloads(&seen), vec!["1", "4", "5"]);
    }

    #[test]
    fn replies_outside_the_query_are_dropped() {
        let (sink, seen, _closed) = collecting();
        let p = PendingQuery::new(1, ke("a/*"), ConsolidationMode::None, false, Weak::new(), sink);
        p.on_reply(stamped("b/x", "out", None));
        p.on_reply(stamped("a/x", "in", None));
        assert_eq!(payloads(&seen), vec!["in"]);

        let (sink, seen, _closed) = collecting();
        let p = PendingQuery::new(2, ke("a/*"), ConsolidationMode::None, true, Weak::new(), sink);
        p.on_reply(stamped("b/x", "out", None));
        assert_eq!(payloads(&seen), vec!["out"]);
    }

    #[test]
    fn remote_accounting() {
        let (sink, seen, closed) = collecting();
        let p = PendingQuery::new(1, ke("a"), ConsolidationMode::None, false, Weak::new(), sink);
        let (z1, z2) = (ZenohId::from_bytes([1; 16]), ZenohId::from_bytes([2; 16]));
        p.expect_remote(z1);
        p.expect_remote(z2);
        p.expect_remote(z2);
        p.complete_one();
        p.remote_final(&z1);
        // duplicate finals are ignored
        p.remote_final(&z1);
        assert!(!*closed.lock());
        p.remote_failed(&z2, "link down");
        assert!(*closed.lock());
        assert_eq!(payloads(&seen), vec!["Transport"]);
    }

    #[test]
    fn timeout_adds_error_and_ignores_late_replies() {
        let (sink, seen, closed) = collecting();
        let p = PendingQuery::new(1, ke("a"), ConsolidationMode::Latest, false, Weak::new(), sink);
        p.on_reply(stamped("a", "v", None));
        p.finalize(true);
        p.finalize(false);
        p.on_reply(stamped("a", "late", None));
        assert_eq!(payloads(&seen), vec!["v", "Timeout"]);
        assert!(*closed.lock());
    }
}
