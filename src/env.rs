use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use fs2::FileExt;
use log::{debug, trace, warn};

use crate::constants::{
    EnvFlags, DATA_FILE, DEFAULT_MAP_SIZE, DEFAULT_MAX_DBS, DEFAULT_MAX_READERS, META_PAGES,
    LOCK_FILE, PAGE_SIZE, VERSION_MAJOR, VERSION_MINOR, VERSION_PATCH,
};
use crate::error::{Error, Result};
use crate::meta::{encode_catalog, DbRecord, MetaHeader};
use crate::page::pages_for;
use crate::snapshot::Snapshot;
use crate::transaction::{StagedDb, Transaction};
use crate::types::{EnvInfo, Mode};

/// Environment configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnvironmentConfig {
    /// Upper bound on the size of the data file, in bytes
    pub map_size: usize,
    /// Upper bound on the number of named databases
    pub max_databases: u32,
    /// Upper bound on concurrently active read transactions
    pub max_readers: u32,
    pub flags: EnvFlags,
}

impl Default for EnvironmentConfig {
    fn default() -> Self {
        EnvironmentConfig {
            map_size: DEFAULT_MAP_SIZE,
            max_databases: DEFAULT_MAX_DBS,
            max_readers: DEFAULT_MAX_READERS,
            flags: EnvFlags::empty(),
        }
    }
}

/// Handle over one memory-mapped store.
///
/// The environment owns the data file and publishes committed snapshots.
/// Any number of read transactions may run alongside at most one write
/// transaction; a second writer blocks in [`begin`](Environment::begin)
/// until the first commits or aborts.
#[derive(Debug)]
pub struct Environment {
    /// Path to the environment directory
    path: PathBuf,
    /// Environment flags
    flags: EnvFlags,
    /// Maximum size of the data file
    map_size: usize,
    /// Maximum number of databases
    max_dbs: u32,
    /// Maximum number of readers
    max_readers: u32,
    /// Data file
    file: File,
    /// Exclusively locked for the life of the handle
    lock_file: File,
    /// Latest committed snapshot
    current: RwLock<Arc<Snapshot>>,
    /// Held by the active write transaction
    writer: Mutex<()>,
    /// Number of active read transactions
    num_readers: AtomicU32,
    /// Number of active transactions of either mode
    active_txns: AtomicUsize,
    /// Database handle ids by name
    dbis: Mutex<HashMap<String, u32>>,
}

impl Environment {
    /// Open the environment in directory `path`, creating the directory and
    /// the data file if needed.
    ///
    /// The handle holds an exclusive lock on `lock.mdb` until it is dropped;
    /// opening the same directory again meanwhile fails with
    /// [`Error::EnvLocked`].
    pub fn open<P: AsRef<Path>>(path: P, config: EnvironmentConfig) -> Result<Self> {
        if config.map_size < META_PAGES as usize * PAGE_SIZE {
            return Err(Error::InvalidMapSize(config.map_size));
        }
        if config.max_readers == 0 {
            return Err(Error::InvalidConfig("max_readers must be at least 1"));
        }

        let path = path.as_ref().to_path_buf();
        if path.as_os_str().is_empty() || (path.exists() && !path.is_dir()) {
            return Err(Error::InvalidPath(path));
        }
        fs::create_dir_all(&path)?;

        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path.join(LOCK_FILE))?;
        if lock_file.try_lock_exclusive().is_err() {
            return Err(Error::EnvLocked(path));
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path.join(DATA_FILE))?;

        if file.metadata()?.len() == 0 {
            debug!("initializing new data file in {}", path.display());
            Self::init_meta_pages(&file, config.map_size)?;
        }
        let snapshot = Snapshot::load(&file)?;

        let file_size = file.metadata()?.len() as usize;
        let map_size = if file_size > config.map_size {
            warn!(
                "data file is {} bytes, growing map size from {}",
                file_size, config.map_size
            );
            file_size
        } else {
            config.map_size
        };

        debug!(
            "opened environment {} at txn {} ({} database(s))",
            path.display(),
            snapshot.meta.txn_id,
            snapshot.db_count()
        );

        Ok(Environment {
            path,
            flags: config.flags,
            map_size,
            max_dbs: config.max_databases,
            max_readers: config.max_readers,
            file,
            lock_file,
            current: RwLock::new(Arc::new(snapshot)),
            writer: Mutex::new(()),
            num_readers: AtomicU32::new(0),
            active_txns: AtomicUsize::new(0),
            dbis: Mutex::new(HashMap::new()),
        })
    }

    /// Write both meta pages of an empty data file
    fn init_meta_pages(file: &File, map_size: usize) -> Result<()> {
        let meta = MetaHeader::initial(map_size).encode();
        let mut pages = vec![0u8; META_PAGES as usize * PAGE_SIZE];
        for slot in 0..META_PAGES as usize {
            let off = slot * PAGE_SIZE;
            pages[off..off + meta.len()].copy_from_slice(&meta);
        }
        let mut file = file;
        file.write_all(&pages)?;
        file.sync_all()?;
        Ok(())
    }

    /// Close the environment and release the memory map.
    ///
    /// Fails if a transaction is still active, which can only happen when
    /// one was leaked rather than dropped.
    pub fn close(self) -> Result<()> {
        let active = self.active_txns.load(Ordering::SeqCst);
        if active > 0 {
            return Err(Error::EnvBusy(active));
        }
        debug!("closing environment {}", self.path.display());
        Ok(())
    }

    /// Begin a transaction in `mode`.
    ///
    /// A write transaction blocks until any other write transaction on this
    /// environment has finished. A read transaction fails with
    /// [`Error::ReadersFull`] when every reader slot is taken.
    pub fn begin(&self, mode: Mode) -> Result<Transaction<'_>> {
        Transaction::new(self, mode)
    }

    /// Begin a new write transaction
    pub fn begin_txn(&self) -> Result<Transaction<'_>> {
        self.begin(Mode::Write)
    }

    /// Begin a new read-only transaction
    pub fn begin_ro_txn(&self) -> Result<Transaction<'_>> {
        self.begin(Mode::Read)
    }

    /// Flush the data file to disk.
    ///
    /// Commits already sync unless [`EnvFlags::NOSYNC`] is set; with it,
    /// only a forced sync does anything.
    pub fn sync(&self, force: bool) -> Result<()> {
        if force || !self.flags.contains(EnvFlags::NOSYNC) {
            self.file.sync_all()?;
        }
        Ok(())
    }

    /// Get environment information
    pub fn info(&self) -> EnvInfo {
        let snapshot = self.snapshot();
        EnvInfo {
            map_size: self.map_size,
            last_pgno: snapshot.meta.next_pgno - 1,
            last_txnid: snapshot.meta.txn_id,
            max_readers: self.max_readers,
            num_readers: self.num_readers.load(Ordering::SeqCst),
        }
    }

    /// Get the path that was used in open()
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn flags(&self) -> EnvFlags {
        self.flags
    }

    /// Get the maximum number of threads/reader slots
    pub fn max_readers(&self) -> u32 {
        self.max_readers
    }

    /// Get the maximum number of named databases
    pub fn max_dbs(&self) -> u32 {
        self.max_dbs
    }

    /// Get library version
    pub fn version() -> (u32, u32, u32) {
        (VERSION_MAJOR, VERSION_MINOR, VERSION_PATCH)
    }

    /// Latest committed snapshot
    pub(crate) fn snapshot(&self) -> Arc<Snapshot> {
        Arc::clone(&self.current.read().unwrap_or_else(PoisonError::into_inner))
    }

    /// Wait for and take the writer lock
    pub(crate) fn lock_writer(&self) -> MutexGuard<'_, ()> {
        self.writer.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a reader
    pub(crate) fn acquire_reader(&self) -> Result<()> {
        self.num_readers
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (n < self.max_readers).then_some(n + 1)
            })
            .map(|_| ())
            .map_err(|_| Error::ReadersFull(self.max_readers))
    }

    /// Release a reader slot
    pub(crate) fn release_reader(&self) {
        self.num_readers.fetch_sub(1, Ordering::SeqCst);
    }

    pub(crate) fn txn_started(&self) {
        self.active_txns.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn txn_finished(&self) {
        self.active_txns.fetch_sub(1, Ordering::SeqCst);
    }

    /// Handle id for database `name`; stable for the life of the environment.
    pub(crate) fn dbi(&self, name: &str) -> u32 {
        let mut dbis = self.dbis.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(&dbi) = dbis.get(name) {
            return dbi;
        }
        let dbi = dbis.len() as u32 + 1;
        dbis.insert(name.to_owned(), dbi);
        dbi
    }

    /// Write the databases transaction `txn_id` changed on top of `base`
    /// and publish the result as the current snapshot. Leaves the
    /// transaction did not touch are shared with `base`.
    ///
    /// Must be called with the writer lock held.
    pub(crate) fn commit(
        &self,
        base: &Snapshot,
        txn_id: u64,
        staged: &BTreeMap<String, StagedDb>,
    ) -> Result<()> {
        let mut records = base.records();
        let mut rewritten = Vec::with_capacity(staged.len());
        let mut pgno = base.meta.next_pgno;
        let mut pages = Vec::new();

        for (name, db) in staged.iter().filter(|(_, db)| db.is_dirty()) {
            let image = db.layout(base, base.db(name), pgno)?;
            trace!(
                "txn {}: database `{}` -> {} page(s) at {}",
                txn_id,
                name,
                image.pages(),
                pgno
            );
            pgno += image.pages();
            pages.extend_from_slice(&image.bytes);
            records.insert(
                name.clone(),
                DbRecord {
                    flags: db.ordering.flags(),
                    key_width: db.key_width.unwrap_or(0),
                    root: image.root,
                    stat: image.stat,
                },
            );
            rewritten.push(name.as_str());
        }

        let catalog = encode_catalog(&records)?;
        let catalog_pgno = pgno;
        pgno += pages_for(catalog.len());
        pages.extend_from_slice(&catalog);
        pages.resize(pages.len().next_multiple_of(PAGE_SIZE), 0);

        let required = pgno as usize * PAGE_SIZE;
        if required > self.map_size {
            return Err(Error::MapFull {
                required,
                map_size: self.map_size,
            });
        }

        let mut file = &self.file;
        file.seek(SeekFrom::Start(base.meta.next_pgno * PAGE_SIZE as u64))?;
        file.write_all(&pages)?;
        if !self.flags.contains(EnvFlags::NOSYNC) {
            file.sync_data()?;
        }

        let meta = MetaHeader {
            txn_id,
            next_pgno: pgno,
            catalog_pgno,
            catalog_len: catalog.len() as u64,
            map_size: self.map_size as u64,
            ..base.meta
        };
        file.seek(SeekFrom::Start(meta.slot() * PAGE_SIZE as u64))?;
        file.write_all(&meta.encode())?;
        if !self
            .flags
            .intersects(EnvFlags::NOSYNC | EnvFlags::NOMETASYNC)
        {
            file.sync_data()?;
        }

        let snapshot = Snapshot::committed(&self.file, meta, base, &records, &rewritten)?;
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(snapshot);
        Ok(())
    }
}

impl Drop for Environment {
    fn drop(&mut self) {
        trace!("dropping environment {}", self.path.display());
        if let Err(e) = FileExt::unlock(&self.lock_file) {
            warn!("failed to unlock {}: {}", self.path.display(), e);
        }
    }
}
