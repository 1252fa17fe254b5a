//! The `connection_id -> handler` table. One instance per side, confined
//! to that side's single dispatcher task — no locking needed, since the
//! table is never touched from any other task.

use crate::ConnectionId;
use rand::Rng;
use std::collections::{HashMap, HashSet, VecDeque};

/// Bounded queue of recently-freed ids. New ids are never
/// drawn from this set, so an id cannot be reused immediately after the
/// frame that freed it might still be in flight for the old occupant.
const MRU_CAPACITY: usize = 512;

struct Mru {
    order: VecDeque<ConnectionId>,
    members: HashSet<ConnectionId>,
}

impl Mru {
    fn new() -> Self {
        Self {
            order: VecDeque::with_capacity(MRU_CAPACITY),
            members: HashSet::with_capacity(MRU_CAPACITY),
        }
    }

    fn contains(&self, id: ConnectionId) -> bool {
        self.members.contains(&id)
    }

    fn push(&mut self, id: ConnectionId) {
        if self.members.contains(&id) {
            return;
        }
        self.order.push_back(id);
        self.members.insert(id);
        while self.order.len() > MRU_CAPACITY {
            if let Some(oldest) = self.order.pop_front() {
                self.members.remove(&oldest);
            }
        }
    }
}

/// `connection_id -> H` for one side of the tunnel.
///
/// Invariants upheld by construction:
/// - at most one handler per id at any instant;
/// - `bind` refuses to overwrite an existing entry (a programming error,
///   which callers should treat as fatal);
/// - `unregister` of an absent id is a no-op, a legitimate race between
///   client- and server-initiated close.
pub struct ConnectionTable<H> {
    handlers: HashMap<ConnectionId, H>,
    mru: Option<Mru>,
}

impl<H> ConnectionTable<H> {
    /// A table with id allocation (client side): tracks an MRU of freed ids.
    pub fn with_allocation() -> Self {
        Self {
            handlers: HashMap::new(),
            mru: Some(Mru::new()),
        }
    }

    /// A table with no id allocation (server side): ids arrive from the
    /// client, never generated locally.
    pub fn without_allocation() -> Self {
        Self {
            handlers: HashMap::new(),
            mru: None,
        }
    }

    /// Draw a fresh id, not currently bound and not in the freed-id MRU.
    /// Only meaningful on a table built with [`Self::with_allocation`].
    pub fn allocate(&mut self) -> Option<ConnectionId> {
        let mru = self.mru.as_ref()?;
        if self.handlers.len() + mru.members.len() >= u32::MAX as usize {
            return None;
        }
        let mut rng = rand::thread_rng();
        loop {
            let candidate: ConnectionId = rng.gen();
            if mru.contains(candidate) || self.handlers.contains_key(&candidate) {
                continue;
            }
            return Some(candidate);
        }
    }

    /// Insert `handler` under `id`. Returns `false` (a programming error)
    /// if `id` is already present.
    #[must_use]
    pub fn bind(&mut self, id: ConnectionId, handler: H) -> bool {
        if self.handlers.contains_key(&id) {
            return false;
        }
        self.handlers.insert(id, handler);
        true
    }

    pub fn lookup(&self, id: ConnectionId) -> Option<&H> {
        self.handlers.get(&id)
    }

    pub fn lookup_mut(&mut self, id: ConnectionId) -> Option<&mut H> {
        self.handlers.get_mut(&id)
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.handlers.contains_key(&id)
    }

    /// Remove and return the handler for `id`, pushing it to the freed-id
    /// MRU if this table allocates ids. A no-op (`None`) for an absent id.
    pub fn unregister(&mut self, id: ConnectionId) -> Option<H> {
        let removed = self.handlers.remove(&id);
        if removed.is_some() {
            if let Some(mru) = self.mru.as_mut() {
                mru.push(id);
            }
        }
        removed
    }

    /// Remove and return every handler, used on tunnel loss.
    pub fn drain(&mut self) -> Vec<(ConnectionId, H)> {
        self.handlers.drain().collect()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = ConnectionId> + '_ {
        self.handlers.keys().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_avoids_bound_and_freed_ids() {
        let mut table: ConnectionTable<()> = ConnectionTable::with_allocation();
        let id = table.allocate().unwrap();
        assert!(table.bind(id, ()));
        let other = table.allocate().unwrap();
        assert_ne!(id, other);

        table.unregister(id);
        // id is now in the MRU; freshly allocated ids must avoid it.
        for _ in 0..64 {
            let candidate = table.allocate().unwrap();
            assert_ne!(candidate, id);
        }
    }

    #[test]
    fn bind_rejects_duplicate_ids() {
        let mut table: ConnectionTable<&str> = ConnectionTable::without_allocation();
        assert!(table.bind(1, "a"));
        assert!(!table.bind(1, "b"));
        assert_eq!(table.lookup(1), Some(&"a"));
    }

    #[test]
    fn unregister_of_absent_id_is_a_no_op() {
        let mut table: ConnectionTable<()> = ConnectionTable::without_allocation();
        assert_eq!(table.unregister(123), None);
    }

    #[test]
    fn drain_empties_the_table() {
        let mut table: ConnectionTable<i32> = ConnectionTable::without_allocation();
        table.bind(1, 10);
        table.bind(2, 20);
        let mut drained = table.drain();
        drained.sort();
        assert_eq!(drained, vec![(1, 10), (2, 20)]);
        assert!(table.is_empty());
    }

    #[test]
    fn server_side_table_never_allocates() {
        let mut table: ConnectionTable<()> = ConnectionTable::without_allocation();
        assert_eq!(table.allocate(), None);
    }
}
