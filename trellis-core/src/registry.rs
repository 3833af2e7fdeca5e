//! Declared key expression registry.
//!
//! Maps key expressions to compact numeric ids for the lifetime of a
//! session. Declaring an expression twice bumps a refcount and returns the
//! same id; the mapping disappears when the last declaration is undeclared
//! and the id goes back to the free list.

use crate::error::{Result, TrellisError};
use crate::keyexpr::KeyExpr;
use hashbrown::HashMap;
use parking_lot::Mutex;

/// Numeric resource id. `0` is never handed out and means "no scope" on the wire.
pub type ResourceId = u64;

#[derive(Debug)]
struct Slot {
    key_expr: KeyExpr,
    refcount: usize,
}

#[derive(Debug, Default)]
struct Tables {
    by_id: HashMap<ResourceId, Slot>,
    by_expr: HashMap<KeyExpr, ResourceId>,
    free: Vec<ResourceId>,
    next: ResourceId,
}

/// Session-scoped id table.
#[derive(Debug, Default)]
pub struct Registry {
    tables: Mutex<Tables>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare `key_expr`, returning its id and whether this call created the mapping.
    pub fn declare(&self, key_expr: &KeyExpr) -> (ResourceId, bool) {
        let mut t = self.tables.lock();
        if let Some(&id) = t.by_expr.get(key_expr) {
            if let Some(slot) = t.by_id.get_mut(&id) {
                slot.refcount += 1;
            }
            return (id, false);
        }

        let id = match t.free.pop() {
            Some(id) => id,
            None => {
                t.next += 1;
                t.next
            }
        };
        t.by_id.insert(
            id,
            Slot {
                key_expr: key_expr.clone(),
                refcount: 1,
            },
        );
        t.by_expr.insert(key_expr.clone(), id);
        (id, true)
    }

    /// Drop one declaration of `id`.
    ///
    /// Returns the expression when this was the last reference and the
    /// mapping was removed.
    pub fn undeclare(&self, id: ResourceId) -> Result<Option<KeyExpr>> {
        let mut t = self.tables.lock();
        let slot = t
            .by_id
            .get_mut(&id)
            .ok_or(TrellisError::UnknownResource(id))?;
        slot.refcount -= 1;
        if slot.refcount > 0 {
            return Ok(None);
        }

        let removed = t.by_id.remove(&id).map(|s| s.key_expr);
        if let Some(ke) = &removed {
            t.by_expr.remove(ke);
        }
        t.free.push(id);
        Ok(removed)
    }

    /// Id of a declared expression.
    pub fn id_of(&self, key_expr: &KeyExpr) -> Option<ResourceId> {
        self.tables.lock().by_expr.get(key_expr).copied()
    }

    /// Expression behind a declared id.
    pub fn resolve(&self, id: ResourceId) -> Option<KeyExpr> {
        self.tables
            .lock()
            .by_id
            .get(&id)
            .map(|s| s.key_expr.clone())
    }

    /// Current refcount of `id` (0 if unknown).
    pub fn refcount(&self, id: ResourceId) -> usize {
        self.tables.lock().by_id.get(&id).map_or(0, |s| s.refcount)
    }

    /// Number of live mappings.
    pub fn len(&self) -> usize {
        self.tables.lock().by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of every live mapping, ordered by id.
    pub fn entries(&self) -> Vec<(ResourceId, KeyExpr)> {
        let t = self.tables.lock();
        let mut out: Vec<_> = t
            .by_id
            .iter()
            .map(|(id, s)| (*id, s.key_expr.clone()))
            .collect();
        out.sort_unstable_by_key(|(id, _)| *id);
        out
    }

    /// Remove every mapping.
    pub fn clear(&self) {
        let mut t = self.tables.lock();
        t.by_id.clear();
        t.by_expr.clear();
        t.free.clear();
        t.next = 0;
    }
}
