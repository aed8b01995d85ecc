//! Write-then-read benchmark over a single database.
//!
//! Drives the public API only: one write transaction that fills database
//! [`BENCH_DB`], then one read transaction that walks it with a cursor.

use std::time::{Duration, Instant};

use log::debug;
use rand::Rng;

use crate::constants::WriteFlags;
use crate::database::{DatabaseConfig, KeyOrdering};
use crate::env::Environment;
use crate::error::{Error, Result};
use crate::types::Stat;
use crate::value::ValueCodec;

/// Name of the database the benchmark writes to
pub const BENCH_DB: &str = "test";

/// How benchmark keys are generated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyMode {
    /// `0..item_count`
    Sequential,
    /// Uniform over `0..=i32::MAX`; duplicates overwrite
    Random,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BenchConfig {
    pub item_count: usize,
    pub key_mode: KeyMode,
    pub key_ordering: KeyOrdering,
}

/// Timing of one benchmark phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhaseReport {
    pub items: usize,
    pub elapsed: Duration,
}

impl PhaseReport {
    pub fn ops_per_sec(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            self.items as f64 / secs
        } else {
            0.0
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BenchReport {
    pub write: PhaseReport,
    pub read: PhaseReport,
    /// Statistics of [`BENCH_DB`] after the write phase
    pub stat: Stat,
}

/// Run one write phase and one read phase against `env`.
///
/// Random keys are drawn from `rng`; pass a seeded generator for
/// reproducible runs.
pub fn run<R: Rng + ?Sized>(env: &Environment, config: &BenchConfig, rng: &mut R) -> Result<BenchReport> {
    debug!(
        "benchmark: {} {:?} key(s), {:?} ordering",
        config.item_count, config.key_mode, config.key_ordering
    );

    let timer = Instant::now();
    let mut txn = env.begin_txn()?;
    let db = txn.open_database(BENCH_DB, DatabaseConfig::create(config.key_ordering))?;
    for i in 0..config.item_count {
        let key = match config.key_mode {
            KeyMode::Sequential => i32::try_from(i)
                .map_err(|_| Error::InvalidConfig("item_count exceeds the i32 key space"))?,
            KeyMode::Random => rng.gen_range(0..=i32::MAX),
        };
        let text = format!("Some Text plus: 'Key' = {}", group_thousands(key));
        let value = ValueCodec::encode(text.as_bytes())?;
        txn.put(&db, &key.to_ne_bytes(), &value, WriteFlags::empty())?;
    }
    txn.commit()?;
    let write = PhaseReport {
        items: config.item_count,
        elapsed: timer.elapsed(),
    };

    let stat = env.begin_ro_txn()?.stat(&db)?;

    let timer = Instant::now();
    let mut items = 0;
    {
        let mut txn = env.begin_ro_txn()?;
        let db = txn.open_database(BENCH_DB, DatabaseConfig::default())?;
        txn.get(&db, &i32::MIN.to_ne_bytes())?;

        let mut cursor = txn.cursor(&db)?;
        while cursor.move_next() {
            let (key, value) = cursor.get_current()?;
            let key = <[u8; 4]>::try_from(key)
                .map(i32::from_ne_bytes)
                .map_err(|_| Error::KeyWidthMismatch {
                    expected: 4,
                    found: key.len(),
                })?;
            let (text, _) = ValueCodec::decode(value)?;
            std::str::from_utf8(text).map_err(|_| {
                Error::Corrupted(format!("value of key {key} is not UTF-8"))
            })?;
            items += 1;
        }
    }
    let read = PhaseReport {
        items,
        elapsed: timer.elapsed(),
    };

    debug!(
        "benchmark: wrote {} in {:?}, read {} in {:?}",
        write.items, write.elapsed, read.items, read.elapsed
    );
    Ok(BenchReport { write, read, stat })
}

/// Format `n` with `,` between groups of three digits.
pub fn group_thousands(n: i32) -> String {
    let digits = n.unsigned_abs().to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3 + 1);
    if n < 0 {
        out.push('-');
    }
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(c);
    }
    out
}
