use std::collections::BTreeMap;

use crate::constants::{DbFlags, MDB_MAGIC, MDB_VERSION, META_PAGES, PAGE_SIZE};
use crate::error::{Error, Result};
use crate::types::Stat;
use crate::value::ValueCodec;

/// Encoded size of a meta header
pub(crate) const META_SIZE: usize = 56;

/// Meta header, written to page `txn_id % 2` on every commit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct MetaHeader {
    /// Magic number identifying a data file
    pub(crate) magic: u32,
    /// Version number
    pub(crate) version: u32,
    /// Page size for this file
    pub(crate) page_size: u32,
    /// Id of the transaction that wrote this meta
    pub(crate) txn_id: u64,
    /// First page not referenced by this snapshot
    pub(crate) next_pgno: u64,
    /// First page of the database catalog
    pub(crate) catalog_pgno: u64,
    /// Catalog length in bytes; 0 when no database exists
    pub(crate) catalog_len: u64,
    /// Map size in effect when this meta was written
    pub(crate) map_size: u64,
}

impl MetaHeader {
    pub(crate) fn initial(map_size: usize) -> Self {
        MetaHeader {
            magic: MDB_MAGIC,
            version: MDB_VERSION,
            page_size: PAGE_SIZE as u32,
            txn_id: 0,
            next_pgno: META_PAGES,
            catalog_pgno: 0,
            catalog_len: 0,
            map_size: map_size as u64,
        }
    }

    /// Page slot this meta is written to.
    pub(crate) fn slot(&self) -> u64 {
        self.txn_id % META_PAGES
    }

    pub(crate) fn encode(&self) -> [u8; META_SIZE] {
        let mut out = [0u8; META_SIZE];
        out[0..4].copy_from_slice(&self.magic.to_le_bytes());
        out[4..8].copy_from_slice(&self.version.to_le_bytes());
        out[8..12].copy_from_slice(&self.page_size.to_le_bytes());
        // 12..16 reserved
        out[16..24].copy_from_slice(&self.txn_id.to_le_bytes());
        out[24..32].copy_from_slice(&self.next_pgno.to_le_bytes());
        out[32..40].copy_from_slice(&self.catalog_pgno.to_le_bytes());
        out[40..48].copy_from_slice(&self.catalog_len.to_le_bytes());
        out[48..56].copy_from_slice(&self.map_size.to_le_bytes());
        out
    }

    /// Decode and validate a meta page.
    pub(crate) fn decode(buf: &[u8]) -> Result<Self> {
        let mut r = Reader::new(buf);
        let magic = r.u32()?;
        if magic != MDB_MAGIC {
            return Err(Error::Invalid("bad magic number"));
        }
        let version = r.u32()?;
        if version != MDB_VERSION {
            return Err(Error::VersionMismatch {
                found: version,
                expected: MDB_VERSION,
            });
        }
        let page_size = r.u32()?;
        if page_size as usize != PAGE_SIZE {
            return Err(Error::Invalid("unsupported page size"));
        }
        r.u32()?;
        Ok(MetaHeader {
            magic,
            version,
            page_size,
            txn_id: r.u64()?,
            next_pgno: r.u64()?,
            catalog_pgno: r.u64()?,
            catalog_len: r.u64()?,
            map_size: r.u64()?,
        })
    }
}

/// Catalog entry describing one named database
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct DbRecord {
    pub(crate) flags: DbFlags,
    /// Integer key width; 0 until the first key is stored
    pub(crate) key_width: u8,
    /// First page of the leaf directory; 0 for an empty database
    pub(crate) root: u64,
    pub(crate) stat: Stat,
}

impl DbRecord {
    pub(crate) fn width(&self) -> Option<u8> {
        (self.key_width != 0).then_some(self.key_width)
    }
}

/// Serialize the catalog. Records are written in name order.
pub(crate) fn encode_catalog(records: &BTreeMap<String, DbRecord>) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    out.extend_from_slice(&(records.len() as u32).to_le_bytes());
    for (name, rec) in records {
        ValueCodec::encode_into(name.as_bytes(), &mut out)?;
        out.extend_from_slice(&rec.flags.bits().to_le_bytes());
        out.push(rec.key_width);
        out.extend_from_slice(&rec.root.to_le_bytes());
        out.extend_from_slice(&rec.stat.depth.to_le_bytes());
        out.extend_from_slice(&rec.stat.branch_pages.to_le_bytes());
        out.extend_from_slice(&rec.stat.leaf_pages.to_le_bytes());
        out.extend_from_slice(&rec.stat.overflow_pages.to_le_bytes());
        out.extend_from_slice(&rec.stat.entries.to_le_bytes());
    }
    Ok(out)
}

pub(crate) fn decode_catalog(buf: &[u8]) -> Result<BTreeMap<String, DbRecord>> {
    let mut records = BTreeMap::new();
    if buf.is_empty() {
        return Ok(records);
    }
    let mut r = Reader::new(buf);
    let count = r.u32()?;
    for _ in 0..count {
        let name = std::str::from_utf8(r.framed()?)
            .map_err(|_| Error::Corrupted("database name is not UTF-8".into()))?
            .to_owned();
        let flags = DbFlags::from_bits(r.u32()?)
            .ok_or_else(|| Error::Corrupted(format!("database `{name}` has unknown flags")))?;
        let key_width = r.u8()?;
        let root = r.u64()?;
        let stat = Stat {
            page_size: PAGE_SIZE as u32,
            depth: r.u32()?,
            branch_pages: r.u64()?,
            leaf_pages: r.u64()?,
            overflow_pages: r.u64()?,
            entries: r.u64()?,
        };
        records.insert(
            name,
            DbRecord {
                flags,
                key_width,
                root,
                stat,
            },
        );
    }
    Ok(records)
}

/// Little-endian field reader over a byte slice
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Reader { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let available = self.buf.len() - self.pos;
        if available < n {
            return Err(Error::Truncated {
                needed: n,
                available,
            });
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u32(&mut self) -> Result<u32> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u64(&mut self) -> Result<u64> {
        let b = self.take(8)?;
        Ok(u64::from_le_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }

    fn framed(&mut self) -> Result<&'a [u8]> {
        let (payload, used) = ValueCodec::decode(&self.buf[self.pos..])?;
        self.pos += used;
        Ok(payload)
    }
}
