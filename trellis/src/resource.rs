//! Declared key expressions.
//!
//! Declaring a key expression assigns it a numeric id, announced to
//! connected sessions; later traffic on that exact key travels by id.
//! Declarations are reference counted: the id lives until as many undeclares
//! as declares happened, or the session closes.

use crate::session::{Session, SessionInner};
use std::fmt;
use std::sync::{Arc, Weak};
use tracing::debug;
use trellis_core::error::{KeyExprError, Result, TrellisError};
use trellis_core::keyexpr::{IntoKeyExpr, KeyExpr};
use trellis_core::message::{Body, Declaration, Undeclaration};
use trellis_core::registry::ResourceId;

/// A key expression declared on a session.
///
/// Usable wherever a key expression is expected.
#[derive(Clone)]
pub struct Resource {
    id: ResourceId,
    key_expr: KeyExpr,
    session: Weak<SessionInner>,
}

impl Resource {
    #[inline]
    pub fn id(&self) -> ResourceId {
        self.id
    }

    #[inline]
    pub fn key_expr(&self) -> &KeyExpr {
        &self.key_expr
    }
}

impl fmt::Debug for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Resource({}: {})", self.id, self.key_expr)
    }
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.key_expr, f)
    }
}

impl IntoKeyExpr for &Resource {
    fn into_key_expr(self) -> std::result::Result<KeyExpr, KeyExprError> {
        Ok(self.key_expr.clone())
    }
}

impl IntoKeyExpr for Resource {
    fn into_key_expr(self) -> std::result::Result<KeyExpr, KeyExprError> {
        Ok(self.key_expr)
    }
}

impl Session {
    /// Declare `key_expr`, or add a reference to its existing declaration.
    pub fn declare_keyexpr<K>(&self, key_expr: K) -> Result<Resource>
    where
        K: IntoKeyExpr,
    {
        self.inner.ensure_open()?;
        let key_expr = key_expr.into_key_expr()?;
        let (id, fresh) = self.inner.registry.declare(&key_expr);
        if fresh {
            debug!("[RESOURCE] {} declared {} as {}", self.inner.zid, key_expr, id);
            self.inner.broadcast(Body::Declare(Declaration::KeyExpr {
                id,
                key_expr: key_expr.clone(),
            }));
        }
        Ok(Resource {
            id,
            key_expr,
            session: Arc::downgrade(&self.inner),
        })
    }

    /// Drop one reference to a declared key expression.
    ///
    /// Fails with `UnknownResource` if the id is no longer declared or the
    /// resource belongs to another session.
    pub fn undeclare_keyexpr(&self, resource: Resource) -> Result<()> {
        self.inner.ensure_open()?;
        if !Weak::ptr_eq(&resource.session, &Arc::downgrade(&self.inner)) {
            return Err(TrellisError::UnknownResource(resource.id));
        }
        if let Some(key_expr) = self.inner.registry.undeclare(resource.id)? {
            debug!("[RESOURCE] {} undeclared {} ({})", self.inner.zid, key_expr, resource.id);
            self.inner
                .broadcast(Body::Undeclare(Undeclaration::KeyExpr(resource.id)));
        }
        Ok(())
    }
}
