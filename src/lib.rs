//! Transactional key/value access over a memory-mapped, copy-on-write store.
//!
//! An [`Environment`] owns one data file. [`Transaction`]s read a consistent
//! snapshot of it; a single write transaction at a time stages changes and
//! publishes them atomically on commit. Named [`Database`]s partition the
//! key space, each with a fixed [`KeyOrdering`], and [`Cursor`]s walk them
//! in key order.
//!
//! ```
//! use lumokv::{DatabaseConfig, Environment, EnvironmentConfig, KeyOrdering, WriteFlags};
//!
//! # fn main() -> lumokv::Result<()> {
//! # let dir = tempfile::tempdir()?;
//! let env = Environment::open(dir.path(), EnvironmentConfig::default())?;
//!
//! let mut txn = env.begin_txn()?;
//! let db = txn.open_database("ids", DatabaseConfig::create(KeyOrdering::FixedWidthInteger))?;
//! for id in [3u32, 1, 2] {
//!     txn.put(&db, &id.to_ne_bytes(), format!("item {id}").as_bytes(), WriteFlags::empty())?;
//! }
//! txn.commit()?;
//!
//! let txn = env.begin_ro_txn()?;
//! let values: Vec<&[u8]> = txn.cursor(&db)?.map(|(_, v)| v).collect();
//! assert_eq!(values, vec![&b"item 1"[..], &b"item 2"[..], &b"item 3"[..]]);
//! # Ok(())
//! # }
//! ```

mod constants;
mod cursor;
mod database;
mod env;
mod error;
mod meta;
mod page;
mod snapshot;
mod transaction;
mod types;
mod value;

pub mod bench;

pub use constants::{
    DbFlags, EnvFlags, WriteFlags, DEFAULT_MAP_SIZE, DEFAULT_MAX_DBS, DEFAULT_MAX_READERS,
    MAX_KEY_SIZE, PAGE_SIZE,
};
pub use cursor::{Cursor, CursorPosition};
pub use database::{Database, DatabaseConfig, KeyOrdering};
pub use env::{Environment, EnvironmentConfig};
pub use error::{Error, ErrorKind, Result};
pub use transaction::Transaction;
pub use types::{EnvInfo, Mode, Stat, TxnState};
pub use value::{ValueCodec, MAX_VARINT_LEN};
