//! Remote interest index.
//!
//! Records which connected peers declared subscribers (or queryables) on
//! which key expressions, so a publication is only sent to peers that have
//! an intersecting declaration.
//!
//! Design:
//! - Entries sorted by key expression text, one per distinct expression.
//! - Each entry lists its holders `(peer, entity id, meta)`, inline up to 4.
//! - Matching scans every entry (wildcards defeat prefix pruning) and
//!   returns deduplicated peers in a `SmallVec`.

use smallvec::SmallVec;
use trellis_core::keyexpr::KeyExpr;
use trellis_core::message::EntityId;
use trellis_core::timestamp::ZenohId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Holder<M> {
    pub(crate) peer: ZenohId,
    pub(crate) id: EntityId,
    pub(crate) meta: M,
}

#[derive(Debug, Clone)]
struct Interest<M> {
    key_expr: KeyExpr,
    holders: SmallVec<[Holder<M>; 4]>,
}

#[derive(Debug)]
pub(crate) struct InterestIndex<M> {
    entries: Vec<Interest<M>>,
}

impl<M> Default for InterestIndex<M> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
        }
    }
}

impl<M: Copy> InterestIndex<M> {
    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Record that `peer` declared entity `id` on `key_expr`. Redeclaring replaces.
    pub(crate) fn declare(&mut self, peer: ZenohId, id: EntityId, key_expr: KeyExpr, meta: M) {
        self.undeclare(peer, id);
        let holder = Holder { peer, id, meta };
        match self
            .entries
            .binary_search_by(|e| e.key_expr.cmp(&key_expr))
        {
            Ok(idx) => self.entries[idx].holders.push(holder),
            Err(idx) => {
                let mut holders = SmallVec::new();
                holders.push(holder);
                self.entries.insert(idx, Interest { key_expr, holders });
            }
        }
    }

    /// Forget entity `id` of `peer`, returning its key expression.
    pub(crate) fn undeclare(&mut self, peer: ZenohId, id: EntityId) -> Option<KeyExpr> {
        let idx = self
            .entries
            .iter()
            .position(|e| e.holders.iter().any(|h| h.peer == peer && h.id == id))?;
        let entry = &mut self.entries[idx];
        entry.holders.retain(|h| !(h.peer == peer && h.id == id));
        let key_expr = entry.key_expr.clone();
        if entry.holders.is_empty() {
            self.entries.remove(idx);
        }
        Some(key_expr)
    }

    /// Remove `peer` from every entry (used on disconnect).
    pub(crate) fn remove_peer_everywhere(&mut self, peer: ZenohId) {
        self.entries.retain_mut(|e| {
            e.holders.retain(|h| h.peer != peer);
            !e.holders.is_empty()
        });
    }

    /// Peers holding at least one declaration intersecting `key`.
    pub(crate) fn matching_peers(&self, key: &KeyExpr) -> SmallVec<[ZenohId; 16]> {
        let mut out: SmallVec<[ZenohId; 16]> = SmallVec::new();
        for e in &self.entries {
            if e.key_expr.intersects(key) {
                out.extend(e.holders.iter().map(|h| h.peer));
            }
        }
        if out.len() > 1 {
            out.sort_unstable();
            out.dedup();
        }
        out
    }

    /// Every holder whose declaration intersects `key`, with its key expression.
    pub(crate) fn matching(&self, key: &KeyExpr) -> Vec<(KeyExpr, Holder<M>)> {
        self.entries
            .iter()
            .filter(|e| e.key_expr.intersects(key))
            .flat_map(|e| e.holders.iter().map(move |h| (e.key_expr.clone(), *h)))
            .collect()
    }

    pub(crate) fn any_match(&self, key: &KeyExpr) -> bool {
        self.entries.iter().any(|e| e.key_expr.intersects(key))
    }
}
