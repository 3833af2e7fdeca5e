//! Publications: `Session::put`, `Session::delete_resource` and declared publishers.

use crate::options::{
    DeleteOptions, PublisherDeleteOptions, PublisherOptions, PublisherPutOptions, PutOptions,
};
use crate::session::{Session, SessionInner};
use bytes::Bytes;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, trace};
use trellis_core::error::{Result, TrellisError};
use trellis_core::keyexpr::{IntoKeyExpr, KeyExpr};
use trellis_core::message::EntityId;
use trellis_core::qos::{CongestionControl, Locality, Priority, Reliability};
use trellis_core::sample::{Encoding, Sample, SampleKind};

/// Shared between a [`Publisher`] and its session, which kills it on close.
#[derive(Debug)]
pub(crate) struct PublisherState {
    alive: AtomicBool,
}

impl PublisherState {
    pub(crate) fn kill(&self) {
        self.alive.store(false, Ordering::Release);
    }

    #[inline]
    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }
}

/// A publisher declared on a fixed key expression with fixed QoS.
pub struct Publisher {
    session: Weak<SessionInner>,
    id: EntityId,
    key_expr: KeyExpr,
    options: PublisherOptions,
    state: Arc<PublisherState>,
}

impl Publisher {
    #[inline]
    pub fn key_expr(&self) -> &KeyExpr {
        &self.key_expr
    }

    #[inline]
    pub fn id(&self) -> EntityId {
        self.id
    }

    pub fn congestion_control(&self) -> CongestionControl {
        self.options.congestion_control
    }

    pub fn priority(&self) -> Priority {
        self.options.priority
    }

    pub fn reliability(&self) -> Reliability {
        self.options.reliability
    }

    pub fn is_express(&self) -> bool {
        self.options.is_express
    }

    pub fn allowed_destination(&self) -> Locality {
        self.options.allowed_destination
    }

    fn session(&self) -> Result<Arc<SessionInner>> {
        if !self.state.is_alive() {
            return Err(TrellisError::SessionClosed);
        }
        match self.session.upgrade() {
            Some(inner) if inner.is_open() => Ok(inner),
            _ => Err(TrellisError::SessionClosed),
        }
    }

    fn sample(&self, kind: SampleKind, payload: Bytes) -> Sample {
        Sample {
            key_expr: self.key_expr.clone(),
            payload,
            kind,
            encoding: self.options.encoding.clone().unwrap_or_default(),
            timestamp: None,
            source_info: None,
            attachment: None,
            priority: self.options.priority,
            congestion_control: self.options.congestion_control,
            express: self.options.is_express,
            reliability: self.options.reliability,
        }
    }

    pub fn put(&self, payload: impl Into<Bytes>, options: PublisherPutOptions) -> Result<()> {
        let inner = self.session()?;
        let mut sample = self.sample(SampleKind::Put, payload.into());
        if let Some(encoding) = options.encoding {
            sample.encoding = encoding;
        }
        sample.timestamp = options.timestamp;
        sample.source_info = options.source_info;
        sample.attachment = options.attachment;
        inner.route_sample(sample, self.options.allowed_destination)
    }

    pub fn delete_resource(&self, options: PublisherDeleteOptions) -> Result<()> {
        let inner = self.session()?;
        let sample = self.sample(SampleKind::Delete, Bytes::new()).with_timestamp(options.timestamp);
        inner.route_sample(sample, self.options.allowed_destination)
    }

    /// Whether at least one subscriber (local or on a connected session)
    /// currently matches this publisher's key and destination.
    pub fn matching_status(&self) -> bool {
        let Ok(inner) = self.session() else {
            return false;
        };
        let destination = self.options.allowed_destination;
        let local = destination.allows_local()
            && inner
                .subscribers
                .any(|e| e.meta.allows_local() && e.key_expr.intersects(&self.key_expr));
        local
            || (destination.allows_remote()
                && inner.peers.read().subscribers.any_match(&self.key_expr))
    }

    pub fn undeclare(mut self) -> Result<()> {
        self.undeclare_impl();
        Ok(())
    }

    fn undeclare_impl(&mut self) {
        if !self.state.is_alive() {
            return;
        }
        self.state.kill();
        if let Some(inner) = self.session.upgrade() {
            inner.publishers.lock().remove(&self.id);
            trace!("[PUB] {} undeclared publisher {} on {}", inner.zid, self.id, self.key_expr);
        }
    }
}

impl Drop for Publisher {
    fn drop(&mut self) {
        self.undeclare_impl();
    }
}

impl fmt::Debug for Publisher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Publisher")
            .field("id", &self.id)
            .field("key_expr", &self.key_expr)
            .field("alive", &self.state.is_alive())
            .finish()
    }
}

impl Session {
    /// Publish `payload` on `key_expr`.
    ///
    /// Local subscribers are served even when sending to a connected session
    /// fails; that failure is then returned as a transport error.
    pub fn put<K>(&self, key_expr: K, payload: impl Into<Bytes>, options: PutOptions) -> Result<()>
    where
        K: IntoKeyExpr,
    {
        self.inner.ensure_open()?;
        let key_expr = key_expr.into_key_expr()?;
        let sample = Sample {
            key_expr,
            payload: payload.into(),
            kind: SampleKind::Put,
            encoding: options.encoding.unwrap_or_else(Encoding::default),
            timestamp: options.timestamp,
            source_info: options.source_info,
            attachment: options.attachment,
            priority: options.priority,
            congestion_control: options.congestion_control,
            express: options.is_express,
            reliability: options.reliability,
        };
        self.inner.route_sample(sample, options.allowed_destination)
    }

    /// Publish a deletion of `key_expr`.
    pub fn delete_resource<K>(&self, key_expr: K, options: DeleteOptions) -> Result<()>
    where
        K: IntoKeyExpr,
    {
        self.inner.ensure_open()?;
        let key_expr = key_expr.into_key_expr()?;
        let sample = Sample {
            timestamp: options.timestamp,
            priority: options.priority,
            congestion_control: options.congestion_control,
            express: options.is_express,
            reliability: options.reliability,
            ..Sample::delete(key_expr)
        };
        self.inner.route_sample(sample, options.allowed_destination)
    }

    /// Declare a publisher on `key_expr`.
    pub fn declare_publisher<K>(&self, key_expr: K, options: PublisherOptions) -> Result<Publisher>
    where
        K: IntoKeyExpr,
    {
        self.inner.ensure_open()?;
        let key_expr = key_expr.into_key_expr()?;
        let id = self.inner.next_entity_id();
        let state = Arc::new(PublisherState {
            alive: AtomicBool::new(true),
        });
        self.inner.publishers.lock().insert(id, state.clone());
        debug!("[PUB] {} declared publisher {} on {}", self.inner.zid, id, key_expr);
        Ok(Publisher {
            session: Arc::downgrade(&self.inner),
            id,
            key_expr,
            options,
            state,
        })
    }
}
