//! Ordered traversal of one database within a transaction.
//!
//! A cursor borrows its transaction, so it cannot outlive it and the
//! transaction cannot finish while the cursor exists:
//!
//! ```compile_fail
//! # use lumokv::{DatabaseConfig, Environment, EnvironmentConfig, KeyOrdering};
//! # let dir = tempfile::tempdir().unwrap();
//! # let env = Environment::open(dir.path(), EnvironmentConfig::default()).unwrap();
//! let mut txn = env.begin_txn().unwrap();
//! let db = txn
//!     .open_database("db", DatabaseConfig::create(KeyOrdering::ByteLexicographic))
//!     .unwrap();
//! let cursor = txn.cursor(&db).unwrap();
//! txn.commit().unwrap();
//! drop(cursor);
//! ```

use std::collections::BTreeMap;
use std::ops::Bound;

use crate::database::KeyOrdering;
use crate::error::{Error, Result};
use crate::page::NodeRef;
use crate::transaction::Slot;

/// Where a cursor is relative to the entries of its database
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorPosition {
    /// Before the first entry; the state of a new cursor
    BeforeFirst,
    /// On an entry; [`Cursor::get_current`] succeeds
    OnEntry,
    /// Past the last entry
    AfterLast,
}

/// Entries a cursor walks over: committed nodes read through the memory
/// map, overlaid with the changes staged by the owning write transaction.
///
/// A staged change shadows the committed node with the same key, whether
/// it replaces or deletes it.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Source<'txn> {
    map: &'txn [u8],
    nodes: &'txn [NodeRef],
    changes: &'txn BTreeMap<Vec<u8>, Slot>,
    ordering: KeyOrdering,
}

static NO_CHANGES: BTreeMap<Vec<u8>, Slot> = BTreeMap::new();

#[derive(Debug, Clone, Copy)]
enum Spot<'txn> {
    /// Index of a committed node
    Node(usize),
    /// Staged entry, under its sort key; never a deletion
    Change(&'txn [u8], &'txn Slot),
}

#[derive(Debug, Clone, Copy)]
enum State<'txn> {
    BeforeFirst,
    On(Spot<'txn>),
    AfterLast,
}

impl<'txn> Source<'txn> {
    pub(crate) fn new(
        map: &'txn [u8],
        nodes: &'txn [NodeRef],
        changes: &'txn BTreeMap<Vec<u8>, Slot>,
        ordering: KeyOrdering,
    ) -> Self {
        Source {
            map,
            nodes,
            changes,
            ordering,
        }
    }

    pub(crate) fn committed(
        map: &'txn [u8],
        nodes: &'txn [NodeRef],
        ordering: KeyOrdering,
    ) -> Self {
        Self::new(map, nodes, &NO_CHANGES, ordering)
    }

    pub(crate) fn empty(ordering: KeyOrdering) -> Self {
        Self::committed(&[], &[], ordering)
    }

    fn node_key(self, i: usize) -> &'txn [u8] {
        &self.map[self.nodes[i].key()]
    }

    fn key(self, spot: Spot<'txn>) -> &'txn [u8] {
        match spot {
            Spot::Node(i) => self.node_key(i),
            Spot::Change(_, slot) => &slot.key,
        }
    }

    fn shadowed(self, i: usize) -> bool {
        !self.changes.is_empty()
            && self
                .changes
                .contains_key(&*self.ordering.sort_key(self.node_key(i)))
    }

    /// First visible node at or after index `i`
    fn node_from(self, mut i: usize) -> Option<usize> {
        while i < self.nodes.len() {
            if !self.shadowed(i) {
                return Some(i);
            }
            i += 1;
        }
        None
    }

    /// Last visible node before index `i`
    fn node_before(self, mut i: usize) -> Option<usize> {
        while i > 0 {
            i -= 1;
            if !self.shadowed(i) {
                return Some(i);
            }
        }
        None
    }

    /// Index of the first node whose key is not less than `key`
    fn lower_bound(self, key: &[u8]) -> usize {
        self.nodes
            .partition_point(|n| self.ordering.compare(&self.map[n.key()], key).is_lt())
    }

    /// Index of the first node whose key is greater than `key`
    fn upper_bound(self, key: &[u8]) -> usize {
        self.nodes
            .partition_point(|n| self.ordering.compare(&self.map[n.key()], key).is_le())
    }

    fn change_from(self, from: Bound<&[u8]>) -> Option<Spot<'txn>> {
        self.changes
            .range::<[u8], _>((from, Bound::Unbounded))
            .find(|(_, slot)| slot.value.is_some())
            .map(change_spot)
    }

    fn change_before(self, to: Bound<&[u8]>) -> Option<Spot<'txn>> {
        self.changes
            .range::<[u8], _>((Bound::Unbounded, to))
            .rev()
            .find(|(_, slot)| slot.value.is_some())
            .map(change_spot)
    }

    /// The nearer of a node and a change in the walking direction. Their
    /// keys never compare equal, since shadowed nodes are skipped.
    fn pick(
        self,
        node: Option<usize>,
        change: Option<Spot<'txn>>,
        forward: bool,
    ) -> Option<Spot<'txn>> {
        match (node, change) {
            (Some(i), Some(change)) => {
                let node_first = self
                    .ordering
                    .compare(self.node_key(i), self.key(change))
                    .is_lt();
                Some(if node_first == forward {
                    Spot::Node(i)
                } else {
                    change
                })
            }
            (Some(i), None) => Some(Spot::Node(i)),
            (None, change) => change,
        }
    }

    fn first(self) -> Option<Spot<'txn>> {
        self.pick(self.node_from(0), self.change_from(Bound::Unbounded), true)
    }

    fn last(self) -> Option<Spot<'txn>> {
        self.pick(
            self.node_before(self.nodes.len()),
            self.change_before(Bound::Unbounded),
            false,
        )
    }

    fn next(self, spot: Spot<'txn>) -> Option<Spot<'txn>> {
        let (node, change) = match spot {
            Spot::Node(i) => {
                let sort_key = self.ordering.sort_key(self.node_key(i));
                (self.node_from(i + 1), self.change_from(Bound::Excluded(&*sort_key)))
            }
            Spot::Change(sort_key, slot) => (
                self.node_from(self.upper_bound(&slot.key)),
                self.change_from(Bound::Excluded(sort_key)),
            ),
        };
        self.pick(node, change, true)
    }

    fn prev(self, spot: Spot<'txn>) -> Option<Spot<'txn>> {
        let (node, change) = match spot {
            Spot::Node(i) => {
                let sort_key = self.ordering.sort_key(self.node_key(i));
                (self.node_before(i), self.change_before(Bound::Excluded(&*sort_key)))
            }
            Spot::Change(sort_key, slot) => (
                self.node_before(self.lower_bound(&slot.key)),
                self.change_before(Bound::Excluded(sort_key)),
            ),
        };
        self.pick(node, change, false)
    }

    /// First entry whose key is not less than `key`.
    fn seek(self, key: &[u8]) -> Option<Spot<'txn>> {
        let sort_key = self.ordering.sort_key(key);
        self.pick(
            self.node_from(self.lower_bound(key)),
            self.change_from(Bound::Included(&*sort_key)),
            true,
        )
    }

    fn entry(self, spot: Spot<'txn>) -> Option<(&'txn [u8], &'txn [u8])> {
        match spot {
            Spot::Node(i) => self
                .nodes
                .get(i)
                .map(|n| (&self.map[n.key()], &self.map[n.value()])),
            Spot::Change(_, slot) => slot
                .value
                .as_deref()
                .map(|value| (slot.key.as_slice(), value)),
        }
    }

    /// Largest key visible through this source
    pub(crate) fn last_key(self) -> Option<&'txn [u8]> {
        self.last().map(|spot| self.key(spot))
    }
}

fn change_spot<'txn>((sort_key, slot): (&'txn Vec<u8>, &'txn Slot)) -> Spot<'txn> {
    Spot::Change(sort_key.as_slice(), slot)
}

/// Database cursor
///
/// Moves over the entries of one database in key order. Entries returned by
/// a cursor borrow from the transaction, not from the cursor.
#[derive(Debug)]
pub struct Cursor<'txn> {
    source: Source<'txn>,
    ordering: KeyOrdering,
    /// Integer key width of the database, if fixed
    key_width: Option<u8>,
    state: State<'txn>,
}

impl<'txn> Cursor<'txn> {
    pub(crate) fn new(source: Source<'txn>, ordering: KeyOrdering, key_width: Option<u8>) -> Self {
        Cursor {
            source,
            ordering,
            key_width,
            state: State::BeforeFirst,
        }
    }

    pub fn position(&self) -> CursorPosition {
        match self.state {
            State::BeforeFirst => CursorPosition::BeforeFirst,
            State::On(_) => CursorPosition::OnEntry,
            State::AfterLast => CursorPosition::AfterLast,
        }
    }

    /// Position at the first entry. Returns false if the database is empty.
    pub fn move_first(&mut self) -> bool {
        let spot = self.source.first();
        self.land(spot, State::AfterLast)
    }

    /// Position at the last entry. Returns false if the database is empty.
    pub fn move_last(&mut self) -> bool {
        let spot = self.source.last();
        self.land(spot, State::BeforeFirst)
    }

    /// Advance to the next entry; from before the first entry this is the
    /// first one. Returns false, leaving the cursor after the last entry,
    /// when there is none.
    pub fn move_next(&mut self) -> bool {
        let spot = match self.state {
            State::BeforeFirst => self.source.first(),
            State::On(spot) => self.source.next(spot),
            State::AfterLast => None,
        };
        self.land(spot, State::AfterLast)
    }

    /// Step back to the previous entry; from after the last entry this is
    /// the last one. Returns false, leaving the cursor before the first
    /// entry, when there is none.
    pub fn move_previous(&mut self) -> bool {
        let spot = match self.state {
            State::BeforeFirst => None,
            State::On(spot) => self.source.prev(spot),
            State::AfterLast => self.source.last(),
        };
        self.land(spot, State::BeforeFirst)
    }

    /// Position at the first entry whose key is greater than or equal to
    /// `key`. Returns false, leaving the cursor after the last entry, when
    /// no such entry exists.
    pub fn seek(&mut self, key: &[u8]) -> Result<bool> {
        self.ordering.check_key(key, self.key_width)?;
        let spot = self.source.seek(key);
        Ok(self.land(spot, State::AfterLast))
    }

    /// Key and value at the current position.
    pub fn get_current(&self) -> Result<(&'txn [u8], &'txn [u8])> {
        match self.state {
            State::On(spot) => self.source.entry(spot).ok_or(Error::CursorNotPositioned),
            _ => Err(Error::CursorNotPositioned),
        }
    }

    fn land(&mut self, spot: Option<Spot<'txn>>, otherwise: State<'txn>) -> bool {
        match spot {
            Some(spot) => {
                self.state = State::On(spot);
                true
            }
            None => {
                self.state = otherwise;
                false
            }
        }
    }
}

impl<'txn> Iterator for Cursor<'txn> {
    type Item = (&'txn [u8], &'txn [u8]);

    fn next(&mut self) -> Option<Self::Item> {
        if self.move_next() {
            self.get_current().ok()
        } else {
            None
        }
    }
}
