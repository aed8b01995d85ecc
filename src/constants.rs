use bitflags::bitflags;

// Environment flags
bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct EnvFlags: u32 {
        /// Don't fsync data or meta pages on commit.
        const NOSYNC = 0x10000;
        /// Fsync data pages on commit but not the meta page.
        const NOMETASYNC = 0x40000;
    }
}

// Database flags
bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct DbFlags: u32 {
        /// Keys are native-endian unsigned integers of a fixed width.
        const INTEGERKEY = 0x08;
        /// Create the database if it doesn't exist.
        const CREATE = 0x40000;
    }
}

// Write operation flags
bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct WriteFlags: u32 {
        /// Fail with `KeyExist` instead of overwriting an existing key.
        const NOOVERWRITE = 0x10;
        /// The key must sort after every key already in the database.
        const APPEND = 0x20000;
    }
}

// Page flags
bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(crate) struct PageFlags: u16 {
        const LEAF = 0x01;
        /// Page numbers of a database's leaves, in key order
        const DIRECTORY = 0x02;
        const OVERFLOW = 0x04;
    }
}

// Leaf node flags
bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(crate) struct NodeFlags: u8 {
        /// Value lives in overflow pages.
        const BIGDATA = 0x01;
    }
}

// Page and version constants
pub const PAGE_SIZE: usize = 4096;
/// Page header: flags (u16), key count (u16), page span (u32)
pub(crate) const PAGE_HEADER_SIZE: usize = 8;
/// Largest node stored inline on a leaf page
pub(crate) const MAX_NODE_SIZE: usize = (PAGE_SIZE - PAGE_HEADER_SIZE) / 2;
/// Largest key accepted by any database
pub const MAX_KEY_SIZE: usize = 511;
/// Magic number for data files
pub const MDB_MAGIC: u32 = 0xBEEF_C0DE;
/// Version numbers major
pub const VERSION_MAJOR: u32 = 0;
/// Version numbers minor
pub const VERSION_MINOR: u32 = 9;
/// Version numbers patch
pub const VERSION_PATCH: u32 = 70;
/// On-disk format version
pub(crate) const MDB_VERSION: u32 = VERSION_MAJOR << 24 | VERSION_MINOR << 16 | VERSION_PATCH;
/// Number of meta pages at the start of the data file
pub(crate) const META_PAGES: u64 = 2;
/// Name of the data file inside the environment directory
pub(crate) const DATA_FILE: &str = "data.mdb";
/// Name of the lock file held by the open environment
pub(crate) const LOCK_FILE: &str = "lock.mdb";

pub const DEFAULT_MAP_SIZE: usize = 10 * 1024 * 1024;
pub const DEFAULT_MAX_DBS: u32 = 16;
pub const DEFAULT_MAX_READERS: u32 = 126;
