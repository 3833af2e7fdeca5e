//! Inbound delivery thread.

use super::SessionInner;
use std::io;
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use tracing::trace;
use trellis_core::fabric::LinkEvent;
use trellis_core::message::{Body, Declaration, NetworkMessage, Undeclaration};
use trellis_core::timestamp::ZenohId;

pub(super) fn spawn_rx(
    zid: ZenohId,
    session: Weak<SessionInner>,
    rx: flume::Receiver<LinkEvent>,
) -> io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name(format!("trellis-rx-{zid}"))
        .spawn(move || rx_thread(session, rx))
}

fn rx_thread(session: Weak<SessionInner>, rx: flume::Receiver<LinkEvent>) {
    while let Ok(event) = rx.recv() {
        if matches!(event, LinkEvent::Shutdown) {
            break;
        }
        let Some(inner) = session.upgrade() else {
            break;
        };
        if inner.is_closed() {
            break;
        }
        inner.handle_event(event);
    }
    trace!("[RX] delivery thread exiting");
}

impl SessionInner {
    fn handle_event(self: &Arc<Self>, event: LinkEvent) {
        match event {
            LinkEvent::Open { link, hello } => self.add_peer(hello, link),
            LinkEvent::Message { from, msg } => self.handle_message(from, msg),
            LinkEvent::Close { from } => self.remove_peer(&from),
            LinkEvent::Shutdown => {}
        }
    }

    fn handle_message(self: &Arc<Self>, from: ZenohId, msg: NetworkMessage) {
        trace!("[RX] {} <- {} {}", self.zid, from, msg.kind());
        match msg.body {
            Body::Hello(_) => {}
            Body::Declare(decl) => self.handle_declare(from, decl),
            Body::Undeclare(undecl) => self.handle_undeclare(from, undecl),
            Body::Push(push) => self.handle_push(&from, push, msg.qos),
            Body::Request(req) => self.handle_request(from, req),
            Body::Reply { qid, reply } => {
                let pending = self.queries.lock().get(&qid).cloned();
                match pending {
                    Some(p) => p.on_reply(reply),
                    None => trace!("[RX] late reply for query {} ignored", qid),
                }
            }
            Body::ReplyFinal { qid } => {
                let pending = self.queries.lock().get(&qid).cloned();
                if let Some(p) = pending {
                    p.remote_final(&from);
                }
            }
            Body::LivelinessRequest { qid, key_expr } => {
                self.handle_liveliness_request(from, qid, &key_expr);
            }
            Body::Close => self.remove_peer(&from),
        }
    }

    fn handle_declare(&self, from: ZenohId, decl: Declaration) {
        match decl {
            Declaration::KeyExpr { id, key_expr } => {
                if let Some(peer) = self.peers.write().peers.get_mut(&from) {
                    peer.keyexprs.insert(id, key_expr);
                }
            }
            Declaration::Subscriber { id, key_expr } => {
                let mut peers = self.peers.write();
                if peers.peers.contains_key(&from) {
                    peers.subscribers.declare(from, id, key_expr, ());
                }
            }
            Declaration::Queryable {
                id,
                key_expr,
                complete,
            } => {
                let mut peers = self.peers.write();
                if peers.peers.contains_key(&from) {
                    peers.queryables.declare(from, id, key_expr, complete);
                }
            }
            Declaration::Token { id, key_expr } => {
                if self.peers.read().peers.contains_key(&from) {
                    self.remote_token_declared(from, id, key_expr);
                }
            }
        }
    }

    fn handle_undeclare(&self, from: ZenohId, undecl: Undeclaration) {
        match undecl {
            Undeclaration::KeyExpr(id) => {
                if let Some(peer) = self.peers.write().peers.get_mut(&from) {
                    peer.keyexprs.remove(&id);
                }
            }
            Undeclaration::Subscriber(id) => {
                self.peers.write().subscribers.undeclare(from, id);
            }
            Undeclaration::Queryable(id) => {
                self.peers.write().queryables.undeclare(from, id);
            }
            Undeclaration::Token(id) => self.remote_token_undeclared(from, id),
        }
    }
}
