use std::borrow::Cow;
use std::cmp::Ordering;
use std::sync::Arc;

use crate::constants::{DbFlags, MAX_KEY_SIZE};
use crate::error::{Error, Result};

/// How keys of a database are compared.
///
/// Fixed for the lifetime of the database once it has been created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum KeyOrdering {
    /// Byte-by-byte comparison; on a common prefix the shorter key is less.
    #[default]
    ByteLexicographic,
    /// Keys are native-endian unsigned integers, 4 or 8 bytes wide, all of
    /// the same width within one database.
    FixedWidthInteger,
}

impl KeyOrdering {
    /// Compare two keys under this ordering.
    ///
    /// Integer keys are expected to have been validated already; keys of
    /// different widths are compared by numeric value.
    pub fn compare(self, a: &[u8], b: &[u8]) -> Ordering {
        match self {
            KeyOrdering::ByteLexicographic => a.cmp(b),
            KeyOrdering::FixedWidthInteger => read_uint(a).cmp(&read_uint(b)),
        }
    }

    /// Bytes that sort lexicographically the same way `key` sorts under this
    /// ordering.
    pub(crate) fn sort_key(self, key: &[u8]) -> Cow<'_, [u8]> {
        match self {
            KeyOrdering::ByteLexicographic => Cow::Borrowed(key),
            KeyOrdering::FixedWidthInteger => Cow::Owned(read_uint(key).to_be_bytes().to_vec()),
        }
    }

    /// Check `key` against the size rules of this ordering. `width` is the
    /// integer width already fixed for the database, if any.
    pub(crate) fn check_key(self, key: &[u8], width: Option<u8>) -> Result<()> {
        if key.is_empty() || key.len() > MAX_KEY_SIZE {
            return Err(Error::BadValSize {
                what: "key",
                size: key.len(),
                max: MAX_KEY_SIZE,
            });
        }
        if self == KeyOrdering::FixedWidthInteger {
            match width {
                Some(w) if usize::from(w) != key.len() => {
                    return Err(Error::KeyWidthMismatch {
                        expected: usize::from(w),
                        found: key.len(),
                    })
                }
                Some(_) => {}
                None if key.len() == 4 || key.len() == 8 => {}
                None => return Err(Error::UnsupportedKeyWidth(key.len())),
            }
        }
        Ok(())
    }

    pub(crate) fn from_flags(flags: DbFlags) -> Self {
        if flags.contains(DbFlags::INTEGERKEY) {
            KeyOrdering::FixedWidthInteger
        } else {
            KeyOrdering::ByteLexicographic
        }
    }

    pub(crate) fn flags(self) -> DbFlags {
        match self {
            KeyOrdering::ByteLexicographic => DbFlags::empty(),
            KeyOrdering::FixedWidthInteger => DbFlags::INTEGERKEY,
        }
    }
}

fn read_uint(key: &[u8]) -> u64 {
    match key.len() {
        4 => u64::from(u32::from_ne_bytes([key[0], key[1], key[2], key[3]])),
        8 => u64::from_ne_bytes([
            key[0], key[1], key[2], key[3], key[4], key[5], key[6], key[7],
        ]),
        // Not reachable for validated keys; widen whatever is there.
        _ => {
            let mut buf = [0u8; 8];
            let n = key.len().min(8);
            if cfg!(target_endian = "little") {
                buf[..n].copy_from_slice(&key[..n]);
            } else {
                buf[8 - n..].copy_from_slice(&key[..n]);
            }
            u64::from_ne_bytes(buf)
        }
    }
}

/// Options for [`Transaction::open_database`](crate::Transaction::open_database).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DatabaseConfig {
    /// Required ordering. `None` attaches with whatever ordering the
    /// database was created with, and creates with `ByteLexicographic`.
    pub ordering: Option<KeyOrdering>,
    /// Create the database if it doesn't exist.
    pub allow_create: bool,
}

impl DatabaseConfig {
    /// Create if absent, requiring `ordering`.
    pub fn create(ordering: KeyOrdering) -> Self {
        DatabaseConfig {
            ordering: Some(ordering),
            allow_create: true,
        }
    }
}

impl From<DbFlags> for DatabaseConfig {
    fn from(flags: DbFlags) -> Self {
        DatabaseConfig {
            ordering: flags
                .contains(DbFlags::INTEGERKEY)
                .then_some(KeyOrdering::FixedWidthInteger),
            allow_create: flags.contains(DbFlags::CREATE),
        }
    }
}

/// Database handle
///
/// Holds only the identity and ordering of a named database; every read and
/// write goes through a [`Transaction`](crate::Transaction). Handles stay
/// valid across transactions of the environment that issued them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Database {
    /// Database identifier, unique within the environment
    dbi: u32,
    name: Arc<str>,
    ordering: KeyOrdering,
}

impl Database {
    pub(crate) fn new(dbi: u32, name: &str, ordering: KeyOrdering) -> Self {
        Database {
            dbi,
            name: Arc::from(name),
            ordering,
        }
    }

    pub fn dbi(&self) -> u32 {
        self.dbi
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn ordering(&self) -> KeyOrdering {
        self.ordering
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn int_key(n: u32) -> [u8; 4] {
        n.to_ne_bytes()
    }

    #[test]
    fn test_integer_ordering_is_numeric() {
        let ord = KeyOrdering::FixedWidthInteger;
        assert_eq!(ord.compare(&int_key(1), &int_key(256)), Ordering::Less);
        assert_eq!(ord.compare(&int_key(70000), &int_key(255)), Ordering::Greater);
        assert_eq!(ord.compare(&int_key(7), &int_key(7)), Ordering::Equal);
        assert_eq!(
            ord.compare(&u64::MAX.to_ne_bytes(), &1u64.to_ne_bytes()),
            Ordering::Greater
        );
    }

    #[test]
    #[cfg(target_endian = "little")]
    fn test_lexicographic_disagrees_on_little_endian() {
        let ord = KeyOrdering::ByteLexicographic;
        assert_eq!(ord.compare(&int_key(256), &int_key(1)), Ordering::Less);
    }

    #[test]
    fn test_lexicographic_prefix() {
        let ord = KeyOrdering::ByteLexicographic;
        assert_eq!(ord.compare(b"ab", b"abc"), Ordering::Less);
        assert_eq!(ord.compare(b"b", b"abc"), Ordering::Greater);
    }

    #[test]
    fn test_sort_key_agrees_with_compare() {
        let ord = KeyOrdering::FixedWidthInteger;
        let keys: Vec<[u8; 4]> = [0u32, 1, 255, 256, 65535, 65536, u32::MAX]
            .iter()
            .map(|&n| int_key(n))
            .collect();
        for a in &keys {
            for b in &keys {
                assert_eq!(ord.sort_key(a).cmp(&ord.sort_key(b)), ord.compare(a, b));
            }
        }
    }

    #[test]
    fn test_check_key() {
        let lex = KeyOrdering::ByteLexicographic;
        assert!(lex.check_key(b"k", None).is_ok());
        assert!(matches!(lex.check_key(b"", None), Err(Error::BadValSize { .. })));
        assert!(lex.check_key(&[0u8; MAX_KEY_SIZE + 1], None).is_err());

        let int = KeyOrdering::FixedWidthInteger;
        assert!(int.check_key(&[0u8; 4], None).is_ok());
        assert!(int.check_key(&[0u8; 8], None).is_ok());
        assert!(matches!(
            int.check_key(&[0u8; 3], None),
            Err(Error::UnsupportedKeyWidth(3))
        ));
        assert!(matches!(
            int.check_key(&[0u8; 8], Some(4)),
            Err(Error::KeyWidthMismatch {
                expected: 4,
                found: 8
            })
        ));
    }

    #[test]
    fn test_config_from_flags() {
        let config = DatabaseConfig::from(DbFlags::CREATE | DbFlags::INTEGERKEY);
        assert_eq!(config, DatabaseConfig::create(KeyOrdering::FixedWidthInteger));

        let config = DatabaseConfig::from(DbFlags::empty());
        assert_eq!(config.ordering, None);
        assert!(!config.allow_create);
    }
}
