//! Queryables.

use crate::options::QueryableOptions;
use crate::query::Query;
use crate::session::tables::Entry;
use crate::session::{QueryableInfo, Session, SessionInner};
use std::fmt;
use std::ops::Deref;
use std::sync::{Arc, Weak};
use tracing::debug;
use trellis_core::error::Result;
use trellis_core::handler::IntoHandler;
use trellis_core::keyexpr::{IntoKeyExpr, KeyExpr};
use trellis_core::message::{Body, Declaration, EntityId, Undeclaration};

/// A declared queryable. Dereferences to the handler's receiver.
pub struct Queryable<R> {
    session: Weak<SessionInner>,
    id: EntityId,
    key_expr: KeyExpr,
    receiver: R,
    undeclared: bool,
}

impl<R> Queryable<R> {
    #[inline]
    pub fn key_expr(&self) -> &KeyExpr {
        &self.key_expr
    }

    #[inline]
    pub fn handler(&self) -> &R {
        &self.receiver
    }

    /// Stop receiving queries. Queries already handed out stay answerable
    /// until dropped.
    pub fn undeclare(mut self) -> Result<()> {
        self.undeclare_impl();
        Ok(())
    }

    fn undeclare_impl(&mut self) {
        if std::mem::replace(&mut self.undeclared, true) {
            return;
        }
        if let Some(inner) = self.session.upgrade() {
            inner.undeclare_queryable(self.id);
        }
    }
}

impl<R> Deref for Queryable<R> {
    type Target = R;

    fn deref(&self) -> &R {
        &self.receiver
    }
}

impl<R> Drop for Queryable<R> {
    fn drop(&mut self) {
        self.undeclare_impl();
    }
}

impl<R> fmt::Debug for Queryable<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Queryable")
            .field("id", &self.id)
            .field("key_expr", &self.key_expr)
            .finish()
    }
}

impl SessionInner {
    pub(crate) fn declare_queryable_entry<H>(
        &self,
        key_expr: KeyExpr,
        handler: H,
        options: &QueryableOptions,
    ) -> (EntityId, H::Receiver)
    where
        H: IntoHandler<Query>,
    {
        let (sink, receiver) = handler.into_handler();
        let id = self.next_entity_id();
        let info = QueryableInfo {
            complete: options.complete,
            origin: options.allowed_origin,
        };
        self.queryables
            .insert(Arc::new(Entry::new(id, key_expr.clone(), info, sink)));
        if info.origin.allows_remote() {
            let body = Body::Declare(Declaration::Queryable {
                id,
                key_expr: key_expr.clone(),
                complete: info.complete,
            });
            self.broadcast_where(body, |p| p.hello.capabilities.queries);
        }
        debug!(
            "[QUERYABLE] {} declared queryable {} on {} (complete: {})",
            self.zid, id, key_expr, info.complete
        );
        (id, receiver)
    }

    pub(crate) fn undeclare_queryable(&self, id: EntityId) {
        if let Some(entry) = self.queryables.remove(id) {
            entry.close();
            if entry.meta.origin.allows_remote() {
                self.broadcast_where(Body::Undeclare(Undeclaration::Queryable(id)), |p| {
                    p.hello.capabilities.queries
                });
            }
            debug!("[QUERYABLE] {} undeclared queryable {} on {}", self.zid, id, entry.key_expr);
        }
    }
}

impl Session {
    /// Declare a queryable on `key_expr`.
    pub fn declare_queryable<K, H>(
        &self,
        key_expr: K,
        handler: H,
        options: QueryableOptions,
    ) -> Result<Queryable<H::Receiver>>
    where
        K: IntoKeyExpr,
        H: IntoHandler<Query>,
    {
        self.inner.ensure_open()?;
        self.inner.require_queries()?;
        let key_expr = key_expr.into_key_expr()?;
        let (id, receiver) = self
            .inner
            .declare_queryable_entry(key_expr.clone(), handler, &options);
        Ok(Queryable {
            session: Arc::downgrade(&self.inner),
            id,
            key_expr,
            receiver,
            undeclared: false,
        })
    }

    /// Callback queryable living until the session closes.
    pub fn declare_background_queryable<K, H>(
        &self,
        key_expr: K,
        handler: H,
        options: QueryableOptions,
    ) -> Result<()>
    where
        K: IntoKeyExpr,
        H: IntoHandler<Query, Receiver = ()>,
    {
        self.inner.ensure_open()?;
        self.inner.require_queries()?;
        let key_expr = key_expr.into_key_expr()?;
        self.inner.declare_queryable_entry(key_expr, handler, &options);
        Ok(())
    }
}
