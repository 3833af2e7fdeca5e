//! Samples, replies and payload encodings.

use crate::keyexpr::KeyExpr;
use crate::qos::{CongestionControl, Priority, Reliability};
use crate::timestamp::{Timestamp, ZenohId};
use bytes::Bytes;
use std::borrow::Cow;
use std::fmt;

/// Payload encoding: a well-known id plus an optional schema suffix.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct Encoding {
    id: u16,
    schema: Option<Box<str>>,
}

const WELL_KNOWN: &[(u16, &str)] = &[
    (0, "zenoh/bytes"),
    (1, "zenoh/string"),
    (2, "zenoh/serialized"),
    (3, "application/octet-stream"),
    (4, "text/plain"),
    (5, "application/json"),
    (6, "text/json"),
    (7, "application/cbor"),
    (8, "application/yaml"),
    (9, "text/csv"),
];

/// Id used for MIME strings that are not in the well-known table.
const CUSTOM_ID: u16 = u16::MAX;

impl Encoding {
    pub const ZENOH_BYTES: Self = Self::from_id(0);
    pub const ZENOH_STRING: Self = Self::from_id(1);
    pub const ZENOH_SERIALIZED: Self = Self::from_id(2);
    pub const APPLICATION_OCTET_STREAM: Self = Self::from_id(3);
    pub const TEXT_PLAIN: Self = Self::from_id(4);
    pub const APPLICATION_JSON: Self = Self::from_id(5);
    pub const TEXT_JSON: Self = Self::from_id(6);
    pub const APPLICATION_CBOR: Self = Self::from_id(7);
    pub const APPLICATION_YAML: Self = Self::from_id(8);
    pub const TEXT_CSV: Self = Self::from_id(9);

    const fn from_id(id: u16) -> Self {
        Self { id, schema: None }
    }

    #[inline]
    #[must_use]
    pub const fn id(&self) -> u16 {
        self.id
    }

    pub fn schema(&self) -> Option<&str> {
        self.schema.as_deref()
    }

    /// Same encoding with `schema` attached.
    #[must_use]
    pub fn with_schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = Some(schema.into().into_boxed_str());
        self
    }

    fn prefix(&self) -> Option<&'static str> {
        WELL_KNOWN
            .iter()
            .find(|(id, _)| *id == self.id)
            .map(|(_, name)| *name)
    }

    /// MIME-style text form, e.g. `text/plain;utf-8`.
    pub fn to_mime(&self) -> Cow<'_, str> {
        match (self.prefix(), self.schema()) {
            (Some(p), None) => Cow::Borrowed(p),
            (Some(p), Some(s)) => Cow::Owned(format!("{p};{s}")),
            (None, Some(s)) => Cow::Borrowed(s),
            (None, None) => Cow::Borrowed(""),
        }
    }
}

impl From<&str> for Encoding {
    fn from(s: &str) -> Self {
        let (head, schema) = match s.split_once(';') {
            Some((h, sc)) => (h, Some(sc)),
            None => (s, None),
        };
        match WELL_KNOWN.iter().find(|(_, name)| *name == head) {
            Some((id, _)) => Self {
                id: *id,
                schema: schema.map(Into::into),
            },
            None => Self {
                id: CUSTOM_ID,
                schema: Some(s.into()),
            },
        }
    }
}

impl fmt::Display for Encoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_mime())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SampleKind {
    #[default]
    Put,
    Delete,
}

/// Identity of the declaring entity: session id plus entity id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntityGlobalId {
    pub zid: ZenohId,
    pub eid: u32,
}

/// Origin of a sample, as declared by the publisher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SourceInfo {
    pub source_id: EntityGlobalId,
    pub source_sn: u32,
}

/// One delivered value.
#[derive(Debug, Clone)]
pub struct Sample {
    pub key_expr: KeyExpr,
    pub payload: Bytes,
    pub kind: SampleKind,
    pub encoding: Encoding,
    pub timestamp: Option<Timestamp>,
    pub source_info: Option<SourceInfo>,
    pub attachment: Option<Bytes>,
    pub priority: Priority,
    pub congestion_control: CongestionControl,
    pub express: bool,
    pub reliability: Reliability,
}

impl Sample {
    /// A PUT of `payload` on `key_expr` with default QoS.
    pub fn put(key_expr: KeyExpr, payload: impl Into<Bytes>) -> Self {
        Self {
            key_expr,
            payload: payload.into(),
            kind: SampleKind::Put,
            encoding: Encoding::default(),
            timestamp: None,
            source_info: None,
            attachment: None,
            priority: Priority::default(),
            congestion_control: CongestionControl::default(),
            express: false,
            reliability: Reliability::default(),
        }
    }

    /// A DELETE on `key_expr` with default QoS.
    pub fn delete(key_expr: KeyExpr) -> Self {
        Self {
            kind: SampleKind::Delete,
            ..Self::put(key_expr, Bytes::new())
        }
    }

    #[must_use]
    pub fn with_timestamp(mut self, ts: Option<Timestamp>) -> Self {
        self.timestamp = ts;
        self
    }

    #[must_use]
    pub fn with_encoding(mut self, encoding: Encoding) -> Self {
        self.encoding = encoding;
        self
    }

    #[inline]
    pub fn key_expr(&self) -> &KeyExpr {
        &self.key_expr
    }

    #[inline]
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    #[inline]
    pub const fn kind(&self) -> SampleKind {
        self.kind
    }
}

/// Why a reply is an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReplyErrorKind {
    /// Sent by a queryable through `reply_err`
    Replier,
    /// The query deadline passed before every queryable finished
    Timeout,
    /// The route to a peer failed
    Transport,
}

#[derive(Debug, Clone)]
pub struct ReplyError {
    pub payload: Bytes,
    pub encoding: Encoding,
    pub kind: ReplyErrorKind,
}

impl ReplyError {
    pub fn new(kind: ReplyErrorKind, payload: impl Into<Bytes>) -> Self {
        Self {
            payload: payload.into(),
            encoding: Encoding::default(),
            kind,
        }
    }
}

impl fmt::Display for ReplyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:?}: {}",
            self.kind,
            String::from_utf8_lossy(&self.payload)
        )
    }
}

/// One answer to a query.
#[derive(Debug, Clone)]
pub struct Reply {
    pub result: Result<Sample, ReplyError>,
    pub replier_id: Option<EntityGlobalId>,
}

impl Reply {
    pub fn ok(sample: Sample, replier_id: Option<EntityGlobalId>) -> Self {
        Self {
            result: Ok(sample),
            replier_id,
        }
    }

    pub fn err(error: ReplyError, replier_id: Option<EntityGlobalId>) -> Self {
        Self {
            result: Err(error),
            replier_id,
        }
    }

    #[inline]
    pub fn is_ok(&self) -> bool {
        self.result.is_ok()
    }

    pub fn sample(&self) -> Option<&Sample> {
        self.result.as_ref().ok()
    }

    pub fn error(&self) -> Option<&ReplyError> {
        self.result.as_ref().err()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encoding_mime_strings() {
        assert_eq!(Encoding::default(), Encoding::ZENOH_BYTES);
        assert_eq!(Encoding::TEXT_PLAIN.to_string(), "text/plain");
        let e = Encoding::from("text/plain;utf-8");
        assert_eq!(e.id(), Encoding::TEXT_PLAIN.id());
        assert_eq!(e.schema(), Some("utf-8"));
        assert_eq!(e.to_string(), "text/plain;utf-8");
        let custom = Encoding::from("image/x-thing");
        assert_eq!(custom.to_string(), "image/x-thing");
    }

    #[test]
    fn delete_sample_has_empty_payload() {
        let s = Sample::delete(KeyExpr::new("a/b").unwrap());
        assert_eq!(s.kind(), SampleKind::Delete);
        assert!(s.payload().is_empty());
    }

    #[test]
    fn reply_accessors() {
        let r = Reply::err(ReplyError::new(ReplyErrorKind::Timeout, "late"), None);
        assert!(!r.is_ok());
        assert_eq!(r.error().map(|e| e.kind), Some(ReplyErrorKind::Timeout));
        assert!(r.sample().is_none());
    }
}
