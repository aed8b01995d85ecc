//! Page layout of one database.
//!
//! A database is a set of leaf pages, listed in key order by a run of
//! directory pages. Leaves hold nodes in key order:
//!
//! ```text
//! inline:  flags | varint klen | key | varint vlen | value
//! bigdata: flags | varint klen | key | overflow pgno (u64 LE) | varint vlen
//! ```
//!
//! A commit writes new leaves only for the key ranges it changed. Every
//! other leaf, and the overflow pages its nodes reference, is listed again
//! from wherever an earlier commit wrote it.
//!
//! Branch pages are not written; their count and the tree depth are derived
//! from the separator keys a B+tree over these leaves would need.

use std::ops::Range;

use crate::constants::{NodeFlags, PageFlags, MAX_NODE_SIZE, PAGE_HEADER_SIZE, PAGE_SIZE};
use crate::error::{Error, Result};
use crate::types::Stat;
use crate::value::ValueCodec;

/// Leaf page numbers held by one directory page
const DIRECTORY_ENTRIES: usize = (PAGE_SIZE - PAGE_HEADER_SIZE) / 8;

/// Location of one entry inside the mapped data file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct NodeRef {
    key_start: usize,
    key_len: u32,
    val_start: usize,
    val_len: u32,
    node_start: usize,
    node_len: u32,
    /// Overflow pages holding the value; 0 when stored inline
    overflow: u32,
}

impl NodeRef {
    pub(crate) fn key(&self) -> Range<usize> {
        self.key_start..self.key_start + self.key_len as usize
    }

    pub(crate) fn value(&self) -> Range<usize> {
        self.val_start..self.val_start + self.val_len as usize
    }

    /// The encoded node as it sits on its leaf
    pub(crate) fn node(&self) -> Range<usize> {
        self.node_start..self.node_start + self.node_len as usize
    }

    pub(crate) fn overflow_pages(&self) -> u64 {
        self.overflow as u64
    }
}

/// One committed leaf page
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct LeafRef {
    pub(crate) pgno: u64,
    /// Its nodes, as a range of [`TreeIndex::nodes`]
    pub(crate) nodes: Range<usize>,
    pub(crate) overflow_pages: u64,
}

/// Every node and leaf of a committed database, in key order
#[derive(Debug, Default)]
pub(crate) struct TreeIndex {
    pub(crate) nodes: Vec<NodeRef>,
    pub(crate) leaves: Vec<LeafRef>,
}

impl TreeIndex {
    /// Nodes stored on `leaf`
    pub(crate) fn leaf_nodes(&self, leaf: &LeafRef) -> &[NodeRef] {
        &self.nodes[leaf.nodes.clone()]
    }

    /// Smallest key on `leaf`. Leaves are never empty.
    pub(crate) fn first_key<'m>(&self, map: &'m [u8], leaf: &LeafRef) -> &'m [u8] {
        &map[self.nodes[leaf.nodes.start].key()]
    }
}

/// Pages produced for one database
#[derive(Debug)]
pub(crate) struct TreeImage {
    /// Page-aligned bytes to append at the writer's base page
    pub(crate) bytes: Vec<u8>,
    /// First directory page, or 0 for an empty tree
    pub(crate) root: u64,
    pub(crate) stat: Stat,
}

impl TreeImage {
    pub(crate) fn pages(&self) -> u64 {
        (self.bytes.len() / PAGE_SIZE) as u64
    }
}

/// Number of pages needed to hold `len` bytes.
pub(crate) fn pages_for(len: usize) -> u64 {
    len.div_ceil(PAGE_SIZE) as u64
}

fn header(flags: PageFlags, nkeys: u16, pages: u32) -> [u8; PAGE_HEADER_SIZE] {
    let mut hdr = [0u8; PAGE_HEADER_SIZE];
    hdr[0..2].copy_from_slice(&flags.bits().to_le_bytes());
    hdr[2..4].copy_from_slice(&nkeys.to_le_bytes());
    hdr[4..8].copy_from_slice(&pages.to_le_bytes());
    hdr
}

fn pad_page(bytes: &mut Vec<u8>) {
    bytes.resize(bytes.len().next_multiple_of(PAGE_SIZE), 0);
}

struct LeafPage {
    buf: Vec<u8>,
    nkeys: u16,
}

impl LeafPage {
    fn new() -> Self {
        let mut buf = Vec::with_capacity(PAGE_SIZE);
        buf.extend_from_slice(&[0u8; PAGE_HEADER_SIZE]);
        LeafPage { buf, nkeys: 0 }
    }

    fn is_empty(&self) -> bool {
        self.nkeys == 0
    }

    fn fits(&self, node_len: usize) -> bool {
        self.buf.len() + node_len <= PAGE_SIZE
    }

    fn push(&mut self, node: &[u8]) {
        self.buf.extend_from_slice(node);
        self.nkeys += 1;
    }

    fn finish(mut self, out: &mut Vec<u8>) {
        self.buf[..PAGE_HEADER_SIZE].copy_from_slice(&header(PageFlags::LEAF, self.nkeys, 1));
        self.buf.resize(PAGE_SIZE, 0);
        out.extend_from_slice(&self.buf);
    }
}

/// Lays out the pages of one database to be appended at `base_pgno`.
///
/// Entries must arrive in key order, whether they are new, copied node by
/// node from a committed leaf, or a whole committed leaf listed as is.
pub(crate) struct TreeWriter {
    base_pgno: u64,
    bytes: Vec<u8>,
    leaf: LeafPage,
    /// Page number of every leaf, in key order
    leaves: Vec<u64>,
    /// Length of the first key on each leaf
    separators: Vec<usize>,
    overflow_pages: u64,
    entries: u64,
    node: Vec<u8>,
}

impl TreeWriter {
    pub(crate) fn new(base_pgno: u64) -> Self {
        TreeWriter {
            base_pgno,
            bytes: Vec::new(),
            leaf: LeafPage::new(),
            leaves: Vec::new(),
            separators: Vec::new(),
            overflow_pages: 0,
            entries: 0,
            node: Vec::new(),
        }
    }

    fn next_pgno(&self) -> u64 {
        self.base_pgno + (self.bytes.len() / PAGE_SIZE) as u64
    }

    /// Add a new entry, moving its value to overflow pages when the node
    /// would not fit in half a leaf.
    pub(crate) fn push(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        let mut node = std::mem::take(&mut self.node);
        node.clear();
        let inline = 1
            + ValueCodec::encoded_len(key.len() as u32)
            + key.len()
            + ValueCodec::encoded_len(value.len() as u32)
            + value.len();

        let mut overflow = 0;
        if inline <= MAX_NODE_SIZE {
            node.push(0);
            ValueCodec::encode_into(key, &mut node)?;
            ValueCodec::encode_into(value, &mut node)?;
        } else {
            let too_big = || Error::BadValSize {
                what: "value",
                size: value.len(),
                max: u32::MAX as usize,
            };
            let vlen = u32::try_from(value.len()).map_err(|_| too_big())?;
            let span = pages_for(PAGE_HEADER_SIZE + value.len());
            let span32 = u32::try_from(span).map_err(|_| too_big())?;

            let ovpgno = self.next_pgno();
            self.bytes
                .extend_from_slice(&header(PageFlags::OVERFLOW, 0, span32));
            self.bytes.extend_from_slice(value);
            pad_page(&mut self.bytes);

            node.push(NodeFlags::BIGDATA.bits());
            ValueCodec::encode_into(key, &mut node)?;
            node.extend_from_slice(&ovpgno.to_le_bytes());
            ValueCodec::write_varint(vlen, &mut node);
            overflow = span;
        }

        self.push_node(key.len(), &node, overflow);
        self.node = node;
        Ok(())
    }

    /// Add a node copied verbatim from a committed leaf. Overflow pages it
    /// references stay where they are.
    pub(crate) fn push_node(&mut self, key_len: usize, node: &[u8], overflow_pages: u64) {
        if !self.leaf.fits(node.len()) {
            self.flush_leaf();
        }
        if self.leaf.is_empty() {
            self.separators.push(key_len);
        }
        self.leaf.push(node);
        self.entries += 1;
        self.overflow_pages += overflow_pages;
    }

    /// List a committed leaf without rewriting it.
    pub(crate) fn reuse_leaf(
        &mut self,
        pgno: u64,
        first_key_len: usize,
        entries: u64,
        overflow_pages: u64,
    ) {
        self.flush_leaf();
        self.leaves.push(pgno);
        self.separators.push(first_key_len);
        self.entries += entries;
        self.overflow_pages += overflow_pages;
    }

    fn flush_leaf(&mut self) {
        if self.leaf.is_empty() {
            return;
        }
        let pgno = self.next_pgno();
        std::mem::replace(&mut self.leaf, LeafPage::new()).finish(&mut self.bytes);
        self.leaves.push(pgno);
    }

    /// Write the directory pages and return the finished image.
    pub(crate) fn finish(mut self) -> TreeImage {
        self.flush_leaf();
        let root = if self.leaves.is_empty() {
            0
        } else {
            self.next_pgno()
        };
        for chunk in self.leaves.chunks(DIRECTORY_ENTRIES) {
            self.bytes
                .extend_from_slice(&header(PageFlags::DIRECTORY, chunk.len() as u16, 1));
            for pgno in chunk {
                self.bytes.extend_from_slice(&pgno.to_le_bytes());
            }
            pad_page(&mut self.bytes);
        }

        let (depth, branch_pages) = branch_levels(&self.separators);
        TreeImage {
            bytes: self.bytes,
            root,
            stat: Stat {
                page_size: PAGE_SIZE as u32,
                depth,
                branch_pages,
                leaf_pages: self.leaves.len() as u64,
                overflow_pages: self.overflow_pages,
                entries: self.entries,
            },
        }
    }
}

/// Depth and branch page count of a B+tree whose leaves start with keys of
/// the given lengths.
fn branch_levels(separators: &[usize]) -> (u32, u64) {
    if separators.is_empty() {
        return (0, 0);
    }
    let mut depth = 1;
    let mut branch_pages = 0u64;
    let mut level = separators.to_vec();
    while level.len() > 1 {
        let mut next = Vec::new();
        let mut used = PAGE_SIZE;
        for &klen in &level {
            let size = 8 + ValueCodec::encoded_len(klen as u32) + klen;
            if used + size > PAGE_SIZE {
                next.push(klen);
                used = PAGE_HEADER_SIZE;
            }
            used += size;
        }
        branch_pages += next.len() as u64;
        depth += 1;
        level = next;
    }
    (depth, branch_pages)
}

fn corrupted(pgno: u64, what: &str) -> Error {
    Error::Corrupted(format!("page {pgno}: {what}"))
}

fn page_header(map: &[u8], pgno: u64) -> Result<(PageFlags, u16, u32)> {
    let off = pgno as usize * PAGE_SIZE;
    let hdr = map
        .get(off..off + PAGE_HEADER_SIZE)
        .ok_or_else(|| corrupted(pgno, "beyond end of map"))?;
    let flags = PageFlags::from_bits(u16::from_le_bytes([hdr[0], hdr[1]]))
        .ok_or_else(|| corrupted(pgno, "unknown page flags"))?;
    let nkeys = u16::from_le_bytes([hdr[2], hdr[3]]);
    let pages = u32::from_le_bytes([hdr[4], hdr[5], hdr[6], hdr[7]]);
    Ok((flags, nkeys, pages))
}

fn read_u64(raw: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&raw[..8]);
    u64::from_le_bytes(buf)
}

/// Index the `leaf_pages` leaves listed by the directory starting at `root`.
pub(crate) fn read_tree(map: &[u8], root: u64, leaf_pages: u64) -> Result<TreeIndex> {
    let mut index = TreeIndex::default();
    let mut pgno = root;
    let mut remaining = leaf_pages;
    while remaining > 0 {
        let (flags, nkeys, _) = page_header(map, pgno)?;
        if flags != PageFlags::DIRECTORY || nkeys == 0 || nkeys as u64 > remaining {
            return Err(corrupted(pgno, "bad directory page"));
        }
        let start = pgno as usize * PAGE_SIZE + PAGE_HEADER_SIZE;
        let raw = map
            .get(start..start + nkeys as usize * 8)
            .ok_or_else(|| corrupted(pgno, "beyond end of map"))?;
        for entry in raw.chunks_exact(8) {
            read_leaf(map, read_u64(entry), &mut index)?;
        }
        remaining -= nkeys as u64;
        pgno += 1;
    }
    Ok(index)
}

fn read_leaf(map: &[u8], pgno: u64, index: &mut TreeIndex) -> Result<()> {
    let (flags, nkeys, _) = page_header(map, pgno)?;
    if flags != PageFlags::LEAF || nkeys == 0 {
        return Err(corrupted(pgno, "expected a leaf page"));
    }
    let base = pgno as usize * PAGE_SIZE;
    let page = map
        .get(base..base + PAGE_SIZE)
        .ok_or_else(|| corrupted(pgno, "beyond end of map"))?;

    let first = index.nodes.len();
    let mut leaf_overflow = 0u64;
    let mut pos = PAGE_HEADER_SIZE;
    for _ in 0..nkeys {
        let node_start = pos;
        let node_flags = page
            .get(pos)
            .copied()
            .and_then(NodeFlags::from_bits)
            .ok_or_else(|| corrupted(pgno, "bad node header"))?;
        pos += 1;

        let (key, used) = ValueCodec::decode(&page[pos..])?;
        let key_start = base + pos + used - key.len();
        let key_len = key.len() as u32;
        pos += used;

        let (val_start, val_len, overflow) = if node_flags.contains(NodeFlags::BIGDATA) {
            let raw = page
                .get(pos..pos + 8)
                .ok_or_else(|| corrupted(pgno, "truncated overflow reference"))?;
            let ovpgno = read_u64(raw);
            pos += 8;
            let (vlen, used) = ValueCodec::read_varint(&page[pos..])?;
            pos += used;

            let (ovflags, _, span) = page_header(map, ovpgno)?;
            if ovflags != PageFlags::OVERFLOW
                || (span as u64) < pages_for(PAGE_HEADER_SIZE + vlen as usize)
            {
                return Err(corrupted(ovpgno, "bad overflow page"));
            }
            let val_start = ovpgno as usize * PAGE_SIZE + PAGE_HEADER_SIZE;
            if val_start + vlen as usize > map.len() {
                return Err(corrupted(ovpgno, "overflow value beyond end of map"));
            }
            (val_start, vlen, span)
        } else {
            let (value, used) = ValueCodec::decode(&page[pos..])?;
            let val_start = base + pos + used - value.len();
            pos += used;
            (val_start, value.len() as u32, 0)
        };

        leaf_overflow += overflow as u64;
        index.nodes.push(NodeRef {
            key_start,
            key_len,
            val_start,
            val_len,
            node_start: base + node_start,
            node_len: (pos - node_start) as u32,
            overflow,
        });
    }

    index.leaves.push(LeafRef {
        pgno,
        nodes: first..index.nodes.len(),
        overflow_pages: leaf_overflow,
    });
    Ok(())
}
