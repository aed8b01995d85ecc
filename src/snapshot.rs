//! Committed, read-only state of an environment.

use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::sync::Arc;

use memmap2::{Mmap, MmapOptions};
use once_cell::sync::OnceCell;

use crate::constants::{META_PAGES, PAGE_SIZE};
use crate::error::{Error, Result};
use crate::meta::{decode_catalog, DbRecord, MetaHeader, META_SIZE};
use crate::page::{read_tree, NodeRef, TreeIndex};

/// A committed database inside a snapshot.
///
/// The index is built on first use and shared by every later snapshot that
/// did not rewrite this database; the data file is append-only, so the
/// offsets stay valid.
#[derive(Debug)]
pub(crate) struct MappedDb {
    pub(crate) record: DbRecord,
    index: OnceCell<TreeIndex>,
}

impl MappedDb {
    pub(crate) fn new(record: DbRecord) -> Self {
        MappedDb {
            record,
            index: OnceCell::new(),
        }
    }
}

/// Memory-mapped view of the data file as of one commit
#[derive(Debug)]
pub(crate) struct Snapshot {
    pub(crate) meta: MetaHeader,
    map: Mmap,
    dbs: HashMap<String, Arc<MappedDb>>,
}

impl Snapshot {
    /// Map `file` and load the newest valid meta page and its catalog.
    pub(crate) fn load(file: &File) -> Result<Self> {
        let map = map_file(file)?;
        if map.len() < META_PAGES as usize * PAGE_SIZE {
            return Err(Error::Invalid("file shorter than the meta pages"));
        }

        let mut newest: Option<MetaHeader> = None;
        let mut last_err = None;
        for slot in 0..META_PAGES as usize {
            let off = slot * PAGE_SIZE;
            match MetaHeader::decode(&map[off..off + META_SIZE]) {
                Ok(meta) if newest.map_or(true, |n| meta.txn_id > n.txn_id) => {
                    newest = Some(meta)
                }
                Ok(_) => {}
                Err(e) => {
                    log::warn!("meta page {} unusable: {}", slot, e);
                    last_err = Some(e);
                }
            }
        }
        let meta = match (newest, last_err) {
            (Some(meta), _) => meta,
            (None, Some(e)) => return Err(e),
            (None, None) => return Err(Error::Invalid("no meta page")),
        };

        if meta.next_pgno as usize * PAGE_SIZE > map.len() {
            return Err(Error::Corrupted(format!(
                "meta references page {} beyond end of file",
                meta.next_pgno
            )));
        }
        let start = meta.catalog_pgno as usize * PAGE_SIZE;
        let catalog = map
            .get(start..start + meta.catalog_len as usize)
            .ok_or_else(|| Error::Corrupted("catalog beyond end of file".into()))?;
        let dbs = decode_catalog(catalog)?
            .into_iter()
            .map(|(name, record)| (name, Arc::new(MappedDb::new(record))))
            .collect();

        Ok(Snapshot { meta, map, dbs })
    }

    /// Snapshot for a freshly committed meta. Databases not in `rewritten`
    /// are carried over from `base` along with any index already built.
    pub(crate) fn committed(
        file: &File,
        meta: MetaHeader,
        base: &Snapshot,
        records: &BTreeMap<String, DbRecord>,
        rewritten: &[&str],
    ) -> Result<Self> {
        let map = map_file(file)?;
        let dbs = records
            .iter()
            .map(|(name, record)| {
                let db = match base.dbs.get(name) {
                    Some(db) if !rewritten.contains(&name.as_str()) => Arc::clone(db),
                    _ => Arc::new(MappedDb::new(*record)),
                };
                (name.clone(), db)
            })
            .collect();
        Ok(Snapshot { meta, map, dbs })
    }

    pub(crate) fn db(&self, name: &str) -> Option<&MappedDb> {
        self.dbs.get(name).map(|db| db.as_ref())
    }

    pub(crate) fn db_count(&self) -> usize {
        self.dbs.len()
    }

    pub(crate) fn records(&self) -> BTreeMap<String, DbRecord> {
        self.dbs
            .iter()
            .map(|(name, db)| (name.clone(), db.record))
            .collect()
    }

    pub(crate) fn bytes(&self) -> &[u8] {
        &self.map
    }

    /// Leaf and node index of `db`, read from its pages on first call.
    pub(crate) fn index<'a>(&'a self, db: &'a MappedDb) -> Result<&'a TreeIndex> {
        db.index.get_or_try_init(|| {
            log::trace!(
                "indexing {} leaf page(s) listed at page {}",
                db.record.stat.leaf_pages,
                db.record.root
            );
            read_tree(&self.map, db.record.root, db.record.stat.leaf_pages)
        })
    }

    /// Nodes of `db` in key order
    pub(crate) fn nodes<'a>(&'a self, db: &'a MappedDb) -> Result<&'a [NodeRef]> {
        Ok(&self.index(db)?.nodes)
    }
}

fn map_file(file: &File) -> Result<Mmap> {
    // Past the meta pages the file is append-only: pages reachable from a
    // committed catalog are never rewritten while mapped. Meta pages are
    // only read during `load`.
    let map = unsafe { MmapOptions::new().map(file)? };
    Ok(map)
}
