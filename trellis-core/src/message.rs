//! Network messages exchanged between sessions.
//!
//! Messages travel as typed values over the fabric; there is no byte-level
//! framing. Key expressions go out as a [`WireExpr`]: the numeric id of an
//! expression the sender declared earlier plus a suffix, or scope `0` and the
//! full expression.

use crate::config::{Capabilities, WhatAmI};
use crate::keyexpr::KeyExpr;
use crate::qos::{CongestionControl, Priority, QueryTarget, Reliability};
use crate::registry::ResourceId;
use crate::sample::{Encoding, Reply, SampleKind, SourceInfo};
use crate::selector::Parameters;
use crate::timestamp::{Timestamp, ZenohId};
use bytes::Bytes;
use std::fmt;

/// Identifier of an in-flight query, unique per querying session.
pub type QueryId = u64;

/// Identifier of a declared entity, unique per session.
pub type EntityId = u32;

/// Key expression as it appears on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireExpr {
    /// Sender-side resource id, `0` for none
    pub scope: ResourceId,
    /// Appended to the scope's expression with no separator added
    pub suffix: String,
}

impl WireExpr {
    /// Full expression with no scope.
    pub fn full(key_expr: &KeyExpr) -> Self {
        Self {
            scope: 0,
            suffix: key_expr.as_str().to_owned(),
        }
    }

    /// Scope only.
    pub const fn scoped(scope: ResourceId) -> Self {
        Self {
            scope,
            suffix: String::new(),
        }
    }

    #[inline]
    pub const fn has_scope(&self) -> bool {
        self.scope != 0
    }
}

impl fmt::Display for WireExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.has_scope() {
            write!(f, "{}:{}", self.scope, self.suffix)
        } else {
            f.write_str(&self.suffix)
        }
    }
}

/// Per-message QoS header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QosHeader {
    pub priority: Priority,
    pub congestion_control: CongestionControl,
    pub express: bool,
    pub reliability: Reliability,
}

/// Session introduction, sent when a link opens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hello {
    pub zid: ZenohId,
    pub whatami: WhatAmI,
    pub capabilities: Capabilities,
}

/// Entity announced to peers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Declaration {
    KeyExpr { id: ResourceId, key_expr: KeyExpr },
    Subscriber { id: EntityId, key_expr: KeyExpr },
    Queryable { id: EntityId, key_expr: KeyExpr, complete: bool },
    Token { id: EntityId, key_expr: KeyExpr },
}

/// Entity withdrawn from peers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Undeclaration {
    KeyExpr(ResourceId),
    Subscriber(EntityId),
    Queryable(EntityId),
    Token(EntityId),
}

/// PUT or DELETE publication.
#[derive(Debug, Clone)]
pub struct Push {
    pub wire_expr: WireExpr,
    pub kind: SampleKind,
    pub payload: Bytes,
    pub encoding: Encoding,
    pub timestamp: Option<Timestamp>,
    pub source_info: Option<SourceInfo>,
    pub attachment: Option<Bytes>,
}

#[derive(Debug, Clone)]
pub struct Request {
    pub qid: QueryId,
    pub wire_expr: WireExpr,
    pub parameters: Parameters,
    pub payload: Option<Bytes>,
    pub encoding: Option<Encoding>,
    pub attachment: Option<Bytes>,
    pub target: QueryTarget,
    /// When set, only this queryable of the receiving session answers.
    pub queryable: Option<EntityId>,
    /// Replies may use any key, not only keys intersecting the query.
    pub accept_any_key: bool,
}

#[derive(Debug, Clone)]
pub enum Body {
    Hello(Hello),
    Declare(Declaration),
    Undeclare(Undeclaration),
    Push(Push),
    Request(Request),
    Reply { qid: QueryId, reply: Reply },
    /// The sender will not reply to `qid` anymore.
    ReplyFinal { qid: QueryId },
    LivelinessRequest { qid: QueryId, key_expr: KeyExpr },
    Close,
}

/// Message type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Put,
    Delete,
    Query,
    Reply,
    Declare,
    Undeclare,
    Liveliness,
    ReplyFinal,
    Hello,
    Close,
}

impl MessageKind {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Put => "PUT",
            Self::Delete => "DELETE",
            Self::Query => "QUERY",
            Self::Reply => "REPLY",
            Self::Declare => "DECLARE",
            Self::Undeclare => "UNDECLARE",
            Self::Liveliness => "LIVELINESS",
            Self::ReplyFinal => "REPLY_FINAL",
            Self::Hello => "HELLO",
            Self::Close => "CLOSE",
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct NetworkMessage {
    pub qos: QosHeader,
    pub body: Body,
}

impl NetworkMessage {
    /// Message with the control QoS (BLOCK, reliable).
    pub fn control(body: Body) -> Self {
        Self {
            qos: QosHeader {
                congestion_control: CongestionControl::Block,
                reliability: Reliability::Reliable,
                ..QosHeader::default()
            },
            body,
        }
    }

    pub fn with_qos(body: Body, qos: QosHeader) -> Self {
        Self { qos, body }
    }

    pub fn kind(&self) -> MessageKind {
        match &self.body {
            Body::Hello(_) => MessageKind::Hello,
            Body::Declare(_) => MessageKind::Declare,
            Body::Undeclare(_) => MessageKind::Undeclare,
            Body::Push(p) => match p.kind {
                SampleKind::Put => MessageKind::Put,
                SampleKind::Delete => MessageKind::Delete,
            },
            Body::Request(_) => MessageKind::Query,
            Body::Reply { .. } => MessageKind::Reply,
            Body::ReplyFinal { .. } => MessageKind::ReplyFinal,
            Body::LivelinessRequest { .. } => MessageKind::Liveliness,
            Body::Close => MessageKind::Close,
        }
    }

    #[inline]
    pub const fn congestion_control(&self) -> CongestionControl {
        self.qos.congestion_control
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_tags() {
        let ke = KeyExpr::new("a/b").unwrap();
        let push = Push {
            wire_expr: WireExpr::full(&ke),
            kind: SampleKind::Delete,
            payload: Bytes::new(),
            encoding: Encoding::default(),
            timestamp: None,
            source_info: None,
            attachment: None,
        };
        let msg = NetworkMessage::with_qos(Body::Push(push), QosHeader::default());
        assert_eq!(msg.kind(), MessageKind::Delete);
        assert_eq!(msg.congestion_control(), CongestionControl::Drop);

        let ctl = NetworkMessage::control(Body::ReplyFinal { qid: 3 });
        assert_eq!(ctl.kind(), MessageKind::ReplyFinal);
        assert_eq!(ctl.congestion_control(), CongestionControl::Block);
        assert_eq!(ctl.kind().to_string(), "REPLY_FINAL");
    }

    #[test]
    fn wire_expr_display() {
        assert_eq!(WireExpr::scoped(4).to_string(), "4:");
        let full = WireExpr::full(&KeyExpr::new("x/y").unwrap());
        assert!(!full.has_scope());
        assert_eq!(full.to_string(), "x/y");
    }
}
