use std::collections::BTreeMap;
use std::sync::{Arc, MutexGuard};

use log::{debug, trace, warn};

use crate::constants::{WriteFlags, MAX_KEY_SIZE, PAGE_SIZE};
use crate::cursor::{Cursor, Source};
use crate::database::{Database, DatabaseConfig, KeyOrdering};
use crate::env::Environment;
use crate::error::{Error, Result};
use crate::page::{NodeRef, TreeImage, TreeWriter};
use crate::snapshot::{MappedDb, Snapshot};
use crate::types::{Mode, Stat, TxnState};

/// Staged change to one key. Stored under its sort key so that the map
/// order is the database order.
#[derive(Debug)]
pub(crate) struct Slot {
    pub(crate) key: Vec<u8>,
    /// New value; `None` deletes the committed entry
    pub(crate) value: Option<Vec<u8>>,
}

/// Changes a write transaction made to one database, over the committed
/// tree in its snapshot
#[derive(Debug)]
pub(crate) struct StagedDb {
    pub(crate) ordering: KeyOrdering,
    /// Integer key width, fixed by the first key
    pub(crate) key_width: Option<u8>,
    pub(crate) changes: BTreeMap<Vec<u8>, Slot>,
    /// Created by this transaction
    created: bool,
}

impl StagedDb {
    fn new(ordering: KeyOrdering) -> Self {
        StagedDb {
            ordering,
            key_width: None,
            changes: BTreeMap::new(),
            created: true,
        }
    }

    fn over(db: &MappedDb) -> Self {
        StagedDb {
            ordering: KeyOrdering::from_flags(db.record.flags),
            key_width: db.record.width(),
            changes: BTreeMap::new(),
            created: false,
        }
    }

    /// Whether committing this database has anything to write
    pub(crate) fn is_dirty(&self) -> bool {
        self.created || !self.changes.is_empty()
    }

    /// Lay out the committed tree `base` with these changes applied, as
    /// pages starting at `base_pgno`.
    ///
    /// A committed leaf whose key range holds no change is listed as is.
    /// The range of a leaf runs from its first key up to the first key of
    /// the next leaf; keys below the first leaf belong to it.
    pub(crate) fn layout(
        &self,
        snapshot: &Snapshot,
        base: Option<&MappedDb>,
        base_pgno: u64,
    ) -> Result<TreeImage> {
        let ordering = self.ordering;
        let mut writer = TreeWriter::new(base_pgno);
        let mut changes = self.changes.values().peekable();

        if let Some(base) = base {
            let index = snapshot.index(base)?;
            let map = snapshot.bytes();
            for (i, leaf) in index.leaves.iter().enumerate() {
                let next_first = index
                    .leaves
                    .get(i + 1)
                    .map(|next| index.first_key(map, next));
                let in_leaf = |slot: &&Slot| {
                    next_first.map_or(true, |first| ordering.compare(&slot.key, first).is_lt())
                };
                let mut mine = Vec::new();
                while let Some(slot) = changes.next_if(in_leaf) {
                    mine.push(slot);
                }

                let nodes = index.leaf_nodes(leaf);
                if mine.is_empty() {
                    writer.reuse_leaf(
                        leaf.pgno,
                        nodes[0].key().len(),
                        nodes.len() as u64,
                        leaf.overflow_pages,
                    );
                    continue;
                }

                let mut nodes = nodes.iter().peekable();
                for slot in mine {
                    let before = |n: &&NodeRef| ordering.compare(&map[n.key()], &slot.key).is_lt();
                    while let Some(node) = nodes.next_if(before) {
                        writer.push_node(node.key().len(), &map[node.node()], node.overflow_pages());
                    }
                    // Replaced or deleted
                    nodes.next_if(|n| ordering.compare(&map[n.key()], &slot.key).is_eq());
                    if let Some(value) = &slot.value {
                        writer.push(&slot.key, value)?;
                    }
                }
                for node in nodes {
                    writer.push_node(node.key().len(), &map[node.node()], node.overflow_pages());
                }
            }
        }

        // Past the last committed leaf, or a database with none
        for slot in changes {
            if let Some(value) = &slot.value {
                writer.push(&slot.key, value)?;
            }
        }
        Ok(writer.finish())
    }
}

/// State only a write transaction carries
#[derive(Debug)]
struct WriteState<'env> {
    /// Single-writer lock, released when the transaction finishes
    _guard: MutexGuard<'env, ()>,
    staged: BTreeMap<String, StagedDb>,
}

/// What a transaction currently sees for one database
enum View<'t> {
    Missing,
    Mapped(&'t MappedDb),
    /// Staged changes over the committed database, if there is one
    Staged(&'t StagedDb, Option<&'t MappedDb>),
}

/// Committed value of `key` in `db`
fn lookup<'a>(
    snapshot: &'a Snapshot,
    db: &'a MappedDb,
    ordering: KeyOrdering,
    key: &[u8],
) -> Result<Option<&'a [u8]>> {
    let nodes = snapshot.nodes(db)?;
    let map = snapshot.bytes();
    let idx = nodes.partition_point(|n| ordering.compare(&map[n.key()], key).is_lt());
    Ok(nodes
        .get(idx)
        .filter(|n| ordering.compare(&map[n.key()], key).is_eq())
        .map(|n| &map[n.value()]))
}

/// Value of `key` with `staged` applied over `base`
fn staged_value<'a>(
    snapshot: &'a Snapshot,
    staged: &'a StagedDb,
    base: Option<&'a MappedDb>,
    key: &[u8],
) -> Result<Option<&'a [u8]>> {
    match staged.changes.get(&*staged.ordering.sort_key(key)) {
        Some(slot) => Ok(slot.value.as_deref()),
        None => match base {
            Some(base) => lookup(snapshot, base, staged.ordering, key),
            None => Ok(None),
        },
    }
}

fn staged_source<'a>(
    snapshot: &'a Snapshot,
    staged: &'a StagedDb,
    base: Option<&'a MappedDb>,
) -> Result<Source<'a>> {
    let nodes: &[NodeRef] = match base {
        Some(base) => snapshot.nodes(base)?,
        None => &[],
    };
    Ok(Source::new(
        snapshot.bytes(),
        nodes,
        &staged.changes,
        staged.ordering,
    ))
}

/// Database transaction
///
/// A transaction reads from the snapshot that was current when it began,
/// plus, in write mode, its own staged changes. Changes become visible to
/// later transactions only after [`commit`](Transaction::commit).
///
/// Dropping an active transaction aborts it.
#[derive(Debug)]
pub struct Transaction<'env> {
    /// Reference to environment
    env: &'env Environment,
    /// Transaction ID
    id: u64,
    mode: Mode,
    state: TxnState,
    /// Snapshot this transaction reads from
    snapshot: Arc<Snapshot>,
    /// Writer lock and staged changes; `None` for read transactions and
    /// once finished
    write: Option<WriteState<'env>>,
}

impl<'env> Transaction<'env> {
    /// Create a new transaction
    pub(crate) fn new(env: &'env Environment, mode: Mode) -> Result<Self> {
        let (id, snapshot, write) = match mode {
            Mode::Read => {
                env.acquire_reader()?;
                let snapshot = env.snapshot();
                (snapshot.meta.txn_id, snapshot, None)
            }
            Mode::Write => {
                let guard = env.lock_writer();
                let snapshot = env.snapshot();
                let write = WriteState {
                    _guard: guard,
                    staged: BTreeMap::new(),
                };
                (snapshot.meta.txn_id + 1, snapshot, Some(write))
            }
        };
        env.txn_started();
        debug!("began {:?} txn {}", mode, id);

        Ok(Transaction {
            env,
            id,
            mode,
            state: TxnState::Active,
            snapshot,
            write,
        })
    }

    /// Open a named database.
    ///
    /// With `config.ordering` set, the stored ordering of an existing database
    /// must match. A missing database is created only when
    /// `config.allow_create` is set and this is a write transaction.
    pub fn open_database<C: Into<DatabaseConfig>>(
        &mut self,
        name: &str,
        config: C,
    ) -> Result<Database> {
        self.check_active()?;
        let config = config.into();
        if name.is_empty() || name.len() > MAX_KEY_SIZE {
            return Err(Error::BadValSize {
                what: "database name",
                size: name.len(),
                max: MAX_KEY_SIZE,
            });
        }

        let stored = match self.write.as_ref().and_then(|w| w.staged.get(name)) {
            Some(staged) => Some(staged.ordering),
            None => self
                .snapshot
                .db(name)
                .map(|db| KeyOrdering::from_flags(db.record.flags)),
        };

        let ordering = match (stored, config.ordering) {
            (Some(stored), Some(requested)) if stored != requested => {
                return Err(Error::IncompatibleOrdering {
                    name: name.to_owned(),
                    stored,
                    requested,
                })
            }
            (Some(stored), _) => stored,
            (None, _) if !config.allow_create => {
                return Err(Error::DatabaseNotFound(name.to_owned()))
            }
            (None, requested) => {
                let snapshot = &self.snapshot;
                let write = self.write.as_mut().ok_or(Error::TxnReadOnly)?;
                let created = write
                    .staged
                    .keys()
                    .filter(|n| snapshot.db(n).is_none())
                    .count();
                let max_dbs = self.env.max_dbs();
                if snapshot.db_count() + created >= max_dbs as usize {
                    return Err(Error::DbsFull(max_dbs));
                }
                let ordering = requested.unwrap_or_default();
                write
                    .staged
                    .insert(name.to_owned(), StagedDb::new(ordering));
                debug!("txn {}: created database `{}` ({:?})", self.id, name, ordering);
                ordering
            }
        };

        Ok(Database::new(self.env.dbi(name), name, ordering))
    }

    /// Get the value stored under `key`, or `None` if absent.
    ///
    /// The returned slice stays valid for the life of this transaction.
    pub fn get(&self, db: &Database, key: &[u8]) -> Result<Option<&[u8]>> {
        let ordering = db.ordering();
        match self.view(db)? {
            View::Missing => {
                ordering.check_key(key, None)?;
                Ok(None)
            }
            View::Mapped(mapped) => {
                ordering.check_key(key, mapped.record.width())?;
                lookup(&self.snapshot, mapped, ordering, key)
            }
            View::Staged(staged, base) => {
                ordering.check_key(key, staged.key_width)?;
                staged_value(&self.snapshot, staged, base, key)
            }
        }
    }

    /// Store `value` under `key`, replacing any existing value unless
    /// [`WriteFlags::NOOVERWRITE`] is given.
    pub fn put(&mut self, db: &Database, key: &[u8], value: &[u8], flags: WriteFlags) -> Result<()> {
        let id = self.id;
        let snapshot = Arc::clone(&self.snapshot);
        let base = snapshot.db(db.name());
        let staged = self.stage(db)?;
        staged.ordering.check_key(key, staged.key_width)?;
        if u32::try_from(value.len()).is_err() {
            return Err(Error::BadValSize {
                what: "value",
                size: value.len(),
                max: u32::MAX as usize,
            });
        }

        if flags.contains(WriteFlags::NOOVERWRITE)
            && staged_value(&snapshot, staged, base, key)?.is_some()
        {
            return Err(Error::KeyExist);
        }
        if flags.contains(WriteFlags::APPEND) {
            let last = staged_source(&snapshot, staged, base)?.last_key();
            if last.is_some_and(|last| staged.ordering.compare(last, key).is_ge()) {
                return Err(Error::KeyExist);
            }
        }
        if staged.ordering == KeyOrdering::FixedWidthInteger && staged.key_width.is_none() {
            staged.key_width = Some(key.len() as u8);
        }

        trace!("txn {}: put {} byte(s) into `{}`", id, value.len(), db.name());
        staged.changes.insert(
            staged.ordering.sort_key(key).into_owned(),
            Slot {
                key: key.to_vec(),
                value: Some(value.to_vec()),
            },
        );
        Ok(())
    }

    /// Remove `key`. Returns whether it was present.
    pub fn delete(&mut self, db: &Database, key: &[u8]) -> Result<bool> {
        let id = self.id;
        let snapshot = Arc::clone(&self.snapshot);
        let base = snapshot.db(db.name());
        let staged = self.stage(db)?;
        staged.ordering.check_key(key, staged.key_width)?;
        let removed = staged_value(&snapshot, staged, base, key)?.is_some();
        if removed {
            staged.changes.insert(
                staged.ordering.sort_key(key).into_owned(),
                Slot {
                    key: key.to_vec(),
                    value: None,
                },
            );
        }
        trace!("txn {}: delete from `{}`: {}", id, db.name(), removed);
        Ok(removed)
    }

    /// Open a cursor over `db`, positioned before the first entry.
    ///
    /// The cursor borrows the transaction, so the transaction cannot be
    /// committed, aborted or written to while the cursor is alive.
    pub fn cursor(&self, db: &Database) -> Result<Cursor<'_>> {
        let ordering = db.ordering();
        let (source, width) = match self.view(db)? {
            View::Missing => (Source::empty(ordering), None),
            View::Mapped(mapped) => (
                Source::committed(
                    self.snapshot.bytes(),
                    self.snapshot.nodes(mapped)?,
                    ordering,
                ),
                mapped.record.width(),
            ),
            View::Staged(staged, base) => (
                staged_source(&self.snapshot, staged, base)?,
                staged.key_width,
            ),
        };
        Ok(Cursor::new(source, db.ordering(), width))
    }

    /// Statistics for `db` as seen by this transaction, staged writes
    /// included.
    pub fn stat(&self, db: &Database) -> Result<Stat> {
        match self.view(db)? {
            View::Missing => Ok(Stat {
                page_size: PAGE_SIZE as u32,
                ..Stat::default()
            }),
            View::Mapped(mapped) => Ok(mapped.record.stat),
            View::Staged(staged, base) => Ok(staged.layout(&self.snapshot, base, 0)?.stat),
        }
    }

    /// Commit the transaction.
    ///
    /// On failure nothing is published and the transaction is aborted.
    pub fn commit(&mut self) -> Result<()> {
        self.check_active()?;
        let result = match &self.write {
            Some(write) if write.staged.values().any(StagedDb::is_dirty) => {
                self.env.commit(&self.snapshot, self.id, &write.staged)
            }
            _ => Ok(()),
        };

        match result {
            Ok(()) => {
                self.finish(TxnState::Committed);
                debug!("committed txn {}", self.id);
                Ok(())
            }
            Err(e) => {
                self.finish(TxnState::Aborted);
                warn!("commit of txn {} failed: {}", self.id, e);
                Err(e)
            }
        }
    }

    /// Abandon all operations of the transaction
    pub fn abort(&mut self) -> Result<()> {
        self.check_active()?;
        self.finish(TxnState::Aborted);
        debug!("aborted txn {}", self.id);
        Ok(())
    }

    /// Get transaction ID
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn state(&self) -> TxnState {
        self.state
    }

    /// Check if transaction is read-only
    pub fn is_readonly(&self) -> bool {
        self.mode == Mode::Read
    }

    /// Get environment reference
    pub fn env(&self) -> &'env Environment {
        self.env
    }

    fn check_active(&self) -> Result<()> {
        match self.state {
            TxnState::Active => Ok(()),
            state => Err(Error::TxnFinished(state)),
        }
    }

    fn check_ordering(db: &Database, stored: KeyOrdering) -> Result<()> {
        if db.ordering() != stored {
            return Err(Error::IncompatibleOrdering {
                name: db.name().to_owned(),
                stored,
                requested: db.ordering(),
            });
        }
        Ok(())
    }

    fn view(&self, db: &Database) -> Result<View<'_>> {
        self.check_active()?;
        if let Some(staged) = self.write.as_ref().and_then(|w| w.staged.get(db.name())) {
            Self::check_ordering(db, staged.ordering)?;
            return Ok(View::Staged(staged, self.snapshot.db(db.name())));
        }
        match self.snapshot.db(db.name()) {
            Some(mapped) => {
                Self::check_ordering(db, KeyOrdering::from_flags(mapped.record.flags))?;
                Ok(View::Mapped(mapped))
            }
            None => Ok(View::Missing),
        }
    }

    /// Staged changes to `db`, started on first write.
    fn stage(&mut self, db: &Database) -> Result<&mut StagedDb> {
        self.check_active()?;
        let snapshot = &self.snapshot;
        let write = self.write.as_mut().ok_or(Error::TxnReadOnly)?;
        if !write.staged.contains_key(db.name()) {
            let mapped = snapshot
                .db(db.name())
                .ok_or_else(|| Error::DatabaseNotFound(db.name().to_owned()))?;
            write
                .staged
                .insert(db.name().to_owned(), StagedDb::over(mapped));
        }
        let staged = write
            .staged
            .get_mut(db.name())
            .ok_or_else(|| Error::DatabaseNotFound(db.name().to_owned()))?;
        Self::check_ordering(db, staged.ordering)?;
        Ok(staged)
    }

    fn finish(&mut self, state: TxnState) {
        self.state = state;
        // Drops staged data and releases the writer lock
        self.write = None;
        if self.mode == Mode::Read {
            self.env.release_reader();
        }
        self.env.txn_finished();
    }
}

impl<'env> Drop for Transaction<'env> {
    fn drop(&mut self) {
        if self.state != TxnState::Active {
            return;
        }
        match &self.write {
            Some(write) if write.staged.values().any(StagedDb::is_dirty) => {
                warn!("txn {} dropped with uncommitted changes, aborting", self.id)
            }
            _ => trace!("txn {} dropped, aborting", self.id),
        }
        self.finish(TxnState::Aborted);
    }
}
