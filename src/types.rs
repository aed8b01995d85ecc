use std::fmt;

/// Transaction access mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Mode {
    /// Snapshot reader; never blocks and never blocks the writer.
    Read,
    /// Exclusive writer; at most one per environment.
    Write,
}

/// Transaction lifecycle state. `Committed` and `Aborted` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TxnState {
    Active,
    Committed,
    Aborted,
}

impl fmt::Display for TxnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TxnState::Active => write!(f, "active"),
            TxnState::Committed => write!(f, "committed"),
            TxnState::Aborted => write!(f, "aborted"),
        }
    }
}

/// Database statistics matching MDB_stat
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Stat {
    /// Size of a database page
    pub page_size: u32,
    /// Depth (height) of the B-tree
    pub depth: u32,
    /// Number of internal (non-leaf) pages
    pub branch_pages: u64,
    /// Number of leaf pages
    pub leaf_pages: u64,
    /// Number of overflow pages
    pub overflow_pages: u64,
    /// Number of data entries
    pub entries: u64,
}

/// Environment information matching MDB_envinfo
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnvInfo {
    /// Size of the data memory map
    pub map_size: usize,
    /// Last page number in use
    pub last_pgno: u64,
    /// Id of the last committed transaction
    pub last_txnid: u64,
    /// Maximum number of reader slots
    pub max_readers: u32,
    /// Reader slots currently in use
    pub num_readers: u32,
}
