use std::fs;

use lumokv::{
    DatabaseConfig, EnvFlags, Environment, EnvironmentConfig, Error, ErrorKind, KeyOrdering,
    WriteFlags, PAGE_SIZE,
};
use tempfile::TempDir;

fn ints() -> DatabaseConfig {
    DatabaseConfig::create(KeyOrdering::FixedWidthInteger)
}

#[test]
fn test_open_creates_directory() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("nested").join("env");
    let env = Environment::open(&path, EnvironmentConfig::default()).unwrap();
    assert_eq!(env.path(), path.as_path());
    assert!(path.join("data.mdb").is_file());

    let info = env.info();
    assert_eq!(info.map_size, lumokv::DEFAULT_MAP_SIZE);
    assert_eq!(info.last_txnid, 0);
    assert_eq!(info.last_pgno, 1);
    assert_eq!(info.max_readers, lumokv::DEFAULT_MAX_READERS);
    assert_eq!(env.max_dbs(), lumokv::DEFAULT_MAX_DBS);
    env.close().unwrap();
}

#[test]
fn test_invalid_config() {
    let dir = TempDir::new().unwrap();

    let config = EnvironmentConfig {
        map_size: PAGE_SIZE,
        ..EnvironmentConfig::default()
    };
    let err = Environment::open(dir.path(), config).unwrap_err();
    assert!(matches!(err, Error::InvalidMapSize(_)));
    assert_eq!(err.kind(), ErrorKind::Configuration);

    let config = EnvironmentConfig {
        max_readers: 0,
        ..EnvironmentConfig::default()
    };
    assert!(matches!(
        Environment::open(dir.path(), config),
        Err(Error::InvalidConfig(_))
    ));

    let file = dir.path().join("plain-file");
    fs::write(&file, b"not a directory").unwrap();
    let err = Environment::open(&file, EnvironmentConfig::default()).unwrap_err();
    assert!(matches!(err, Error::InvalidPath(_)));
    assert_eq!(err.kind(), ErrorKind::Configuration);

    assert!(Environment::open("", EnvironmentConfig::default()).is_err());
}

#[test]
fn test_foreign_data_file() {
    let dir = TempDir::new().unwrap();
    fs::write(dir.path().join("data.mdb"), vec![0xA5u8; 2 * PAGE_SIZE]).unwrap();
    let err = Environment::open(dir.path(), EnvironmentConfig::default()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::CorruptData);
}

#[test]
fn test_reopen_sees_committed_state() {
    let dir = TempDir::new().unwrap();
    {
        let env = Environment::open(dir.path(), EnvironmentConfig::default()).unwrap();
        let mut txn = env.begin_txn().unwrap();
        let db = txn.open_database("ints", ints()).unwrap();
        let names = txn
            .open_database("names", DatabaseConfig::create(KeyOrdering::ByteLexicographic))
            .unwrap();
        for i in 0..500u64 {
            txn.put(&db, &i.to_ne_bytes(), &i.to_le_bytes(), WriteFlags::empty()).unwrap();
        }
        txn.put(&names, b"alice", b"1", WriteFlags::empty()).unwrap();
        txn.commit().unwrap();
        drop(txn);

        // Second commit touches only one database
        let mut txn = env.begin_txn().unwrap();
        txn.put(&names, b"bob", b"2", WriteFlags::empty()).unwrap();
        txn.commit().unwrap();
        drop(txn);

        // Uncommitted work is lost
        let mut txn = env.begin_txn().unwrap();
        txn.put(&names, b"carol", b"3", WriteFlags::empty()).unwrap();
        drop(txn);
        env.close().unwrap();
    }

    let env = Environment::open(dir.path(), EnvironmentConfig::default()).unwrap();
    assert_eq!(env.info().last_txnid, 2);
    let mut txn = env.begin_ro_txn().unwrap();

    // Ordering and key width were persisted
    let db = txn.open_database("ints", DatabaseConfig::default()).unwrap();
    assert_eq!(db.ordering(), KeyOrdering::FixedWidthInteger);
    assert_eq!(txn.stat(&db).unwrap().entries, 500);
    assert_eq!(txn.get(&db, &499u64.to_ne_bytes()).unwrap().unwrap(), 499u64.to_le_bytes());
    assert!(matches!(
        txn.get(&db, &1u32.to_ne_bytes()),
        Err(Error::KeyWidthMismatch { expected: 8, found: 4 })
    ));

    let names = txn.open_database("names", DatabaseConfig::default()).unwrap();
    let all: Vec<&[u8]> = txn.cursor(&names).unwrap().map(|(k, _)| k).collect();
    assert_eq!(all, vec![&b"alice"[..], &b"bob"[..]]);
}

#[test]
fn test_ordering_mismatch() {
    let dir = TempDir::new().unwrap();
    let env = Environment::open(dir.path(), EnvironmentConfig::default()).unwrap();
    let mut txn = env.begin_txn().unwrap();
    let db = txn.open_database("ints", ints()).unwrap();
    txn.put(&db, &1u32.to_ne_bytes(), b"v", WriteFlags::empty()).unwrap();
    txn.commit().unwrap();

    let mut txn = env.begin_txn().unwrap();
    let err = txn
        .open_database("ints", DatabaseConfig::create(KeyOrdering::ByteLexicographic))
        .unwrap_err();
    assert!(matches!(
        err,
        Error::IncompatibleOrdering {
            stored: KeyOrdering::FixedWidthInteger,
            requested: KeyOrdering::ByteLexicographic,
            ..
        }
    ));
    assert_eq!(err.kind(), ErrorKind::Configuration);

    // Data is intact and still readable with the right ordering
    let db = txn.open_database("ints", ints()).unwrap();
    assert_eq!(txn.get(&db, &1u32.to_ne_bytes()).unwrap(), Some(&b"v"[..]));
}

#[test]
fn test_integer_key_width_rules() {
    let dir = TempDir::new().unwrap();
    let env = Environment::open(dir.path(), EnvironmentConfig::default()).unwrap();
    let mut txn = env.begin_txn().unwrap();
    let db = txn.open_database("ints", ints()).unwrap();

    let err = txn.put(&db, b"abc", b"v", WriteFlags::empty()).unwrap_err();
    assert!(matches!(err, Error::UnsupportedKeyWidth(3)));
    assert_eq!(err.kind(), ErrorKind::CorruptData);

    txn.put(&db, &7u32.to_ne_bytes(), b"v", WriteFlags::empty()).unwrap();
    let err = txn.put(&db, &7u64.to_ne_bytes(), b"v", WriteFlags::empty()).unwrap_err();
    assert!(matches!(err, Error::KeyWidthMismatch { expected: 4, found: 8 }));
}

#[test]
fn test_max_databases() {
    let dir = TempDir::new().unwrap();
    let config = EnvironmentConfig {
        max_databases: 2,
        ..EnvironmentConfig::default()
    };
    let env = Environment::open(dir.path(), config).unwrap();
    let mut txn = env.begin_txn().unwrap();
    txn.open_database("a", ints()).unwrap();
    txn.open_database("b", ints()).unwrap();
    // Reopening an existing one is fine
    txn.open_database("a", ints()).unwrap();
    let err = txn.open_database("c", ints()).unwrap_err();
    assert!(matches!(err, Error::DbsFull(2)));
    assert_eq!(err.kind(), ErrorKind::ResourceExhausted);
    txn.commit().unwrap();

    let mut txn = env.begin_txn().unwrap();
    assert!(matches!(txn.open_database("c", ints()), Err(Error::DbsFull(2))));
}

#[test]
fn test_map_full() {
    let dir = TempDir::new().unwrap();
    let config = EnvironmentConfig {
        map_size: 64 * 1024,
        ..EnvironmentConfig::default()
    };
    let env = Environment::open(dir.path(), config).unwrap();

    let mut txn = env.begin_txn().unwrap();
    let db = txn.open_database("db", ints()).unwrap();
    txn.put(&db, &0u32.to_ne_bytes(), b"small", WriteFlags::empty()).unwrap();
    txn.commit().unwrap();

    let mut txn = env.begin_txn().unwrap();
    for i in 1..40u32 {
        txn.put(&db, &i.to_ne_bytes(), &[b'x'; 4000], WriteFlags::empty()).unwrap();
    }
    let err = txn.commit().unwrap_err();
    assert!(matches!(err, Error::MapFull { .. }));
    assert_eq!(err.kind(), ErrorKind::ResourceExhausted);
    assert_eq!(txn.state(), lumokv::TxnState::Aborted);

    // Nothing was published and the writer lock is free again
    let mut txn = env.begin_txn().unwrap();
    assert_eq!(txn.stat(&db).unwrap().entries, 1);
    txn.put(&db, &1u32.to_ne_bytes(), b"fits", WriteFlags::empty()).unwrap();
    txn.commit().unwrap();
}

#[test]
fn test_file_larger_than_map_size() {
    let dir = TempDir::new().unwrap();
    {
        let env = Environment::open(dir.path(), EnvironmentConfig::default()).unwrap();
        let mut txn = env.begin_txn().unwrap();
        let db = txn.open_database("db", ints()).unwrap();
        for i in 0..20u32 {
            txn.put(&db, &i.to_ne_bytes(), &[0u8; 4000], WriteFlags::empty()).unwrap();
        }
        txn.commit().unwrap();
    }

    let config = EnvironmentConfig {
        map_size: 2 * PAGE_SIZE,
        ..EnvironmentConfig::default()
    };
    let env = Environment::open(dir.path(), config).unwrap();
    let file_len = fs::metadata(dir.path().join("data.mdb")).unwrap().len() as usize;
    assert_eq!(env.info().map_size, file_len);
    let txn = env.begin_ro_txn().unwrap();
    drop(txn);
}

#[test]
fn test_close_with_leaked_transaction() {
    let dir = TempDir::new().unwrap();
    let env = Environment::open(dir.path(), EnvironmentConfig::default()).unwrap();
    std::mem::forget(env.begin_ro_txn().unwrap());
    let err = env.close().unwrap_err();
    assert!(matches!(err, Error::EnvBusy(1)));
    assert_eq!(err.kind(), ErrorKind::InvalidState);
}

#[test]
fn test_no_sync_flags() {
    let dir = TempDir::new().unwrap();
    let config = EnvironmentConfig {
        flags: EnvFlags::NOSYNC | EnvFlags::NOMETASYNC,
        ..EnvironmentConfig::default()
    };
    let env = Environment::open(dir.path(), config).unwrap();
    assert!(env.flags().contains(EnvFlags::NOSYNC));

    let mut txn = env.begin_txn().unwrap();
    let db = txn.open_database("db", ints()).unwrap();
    txn.put(&db, &1u32.to_ne_bytes(), b"v", WriteFlags::empty()).unwrap();
    txn.commit().unwrap();
    drop(txn);
    env.sync(true).unwrap();
    env.close().unwrap();

    let env = Environment::open(dir.path(), EnvironmentConfig::default()).unwrap();
    let mut txn = env.begin_ro_txn().unwrap();
    let db = txn.open_database("db", DatabaseConfig::default()).unwrap();
    assert_eq!(txn.get(&db, &1u32.to_ne_bytes()).unwrap(), Some(&b"v"[..]));
}

#[test]
fn test_second_handle_is_locked_out() {
    let dir = TempDir::new().unwrap();
    let env = Environment::open(dir.path(), EnvironmentConfig::default()).unwrap();
    assert!(dir.path().join("lock.mdb").is_file());

    let err = Environment::open(dir.path(), EnvironmentConfig::default()).unwrap_err();
    assert!(matches!(err, Error::EnvLocked(_)));
    assert_eq!(err.kind(), ErrorKind::Io);

    // The first handle keeps working and its commit is durable
    let mut txn = env.begin_txn().unwrap();
    let db = txn.open_database("a", ints()).unwrap();
    txn.put(&db, &1u32.to_ne_bytes(), b"from a", WriteFlags::empty()).unwrap();
    txn.commit().unwrap();
    drop(txn);
    env.close().unwrap();

    // Released once the first handle is gone
    let env = Environment::open(dir.path(), EnvironmentConfig::default()).unwrap();
    let mut txn = env.begin_txn().unwrap();
    let db = txn.open_database("a", DatabaseConfig::default()).unwrap();
    assert_eq!(txn.get(&db, &1u32.to_ne_bytes()).unwrap(), Some(&b"from a"[..]));
    let other = txn.open_database("b", ints()).unwrap();
    txn.put(&other, &2u32.to_ne_bytes(), b"from b", WriteFlags::empty()).unwrap();
    txn.commit().unwrap();
}

#[test]
fn test_small_commits_append_few_pages() {
    let dir = TempDir::new().unwrap();
    let env = Environment::open(dir.path(), EnvironmentConfig::default()).unwrap();
    let mut txn = env.begin_txn().unwrap();
    let db = txn.open_database("db", ints()).unwrap();
    for i in 0..20_000u32 {
        txn.put(&db, &i.to_ne_bytes(), &[b'v'; 40], WriteFlags::empty()).unwrap();
    }
    txn.commit().unwrap();
    drop(txn);
    let loaded = env.info().last_pgno;
    assert!(loaded > 200);

    // Far more single-key commits than full copies would fit in the map
    for round in 0..100u32 {
        let before = env.info().last_pgno;
        let mut txn = env.begin_txn().unwrap();
        let key = (round * 197) % 20_000;
        txn.put(&db, &key.to_ne_bytes(), &[b'w'; 40], WriteFlags::empty()).unwrap();
        if round % 10 == 0 {
            assert!(txn.delete(&db, &(key + 1).to_ne_bytes()).unwrap());
        }
        txn.commit().unwrap();
        drop(txn);
        // Rewritten leaf, leaf directory and catalog
        let appended = env.info().last_pgno - before;
        assert!(appended <= 4, "commit {} appended {} pages", round, appended);
    }

    let txn = env.begin_ro_txn().unwrap();
    assert_eq!(txn.stat(&db).unwrap().entries, 20_000 - 10);
    let mut rewritten = 0;
    let mut count = 0;
    for (key, value) in txn.cursor(&db).unwrap() {
        let key = u32::from_ne_bytes(key.try_into().unwrap());
        let round = key / 197;
        let touched = key % 197 == 0 && round < 100;
        assert_eq!(value, if touched { [b'w'; 40] } else { [b'v'; 40] }, "key {}", key);
        rewritten += touched as u32;
        count += 1;
    }
    assert_eq!(rewritten, 100);
    assert_eq!(count, 20_000 - 10);
    drop(txn);
    env.close().unwrap();

    // Shared leaves read back the same after reopening
    let env = Environment::open(dir.path(), EnvironmentConfig::default()).unwrap();
    let mut txn = env.begin_ro_txn().unwrap();
    let db = txn.open_database("db", DatabaseConfig::default()).unwrap();
    assert_eq!(txn.cursor(&db).unwrap().count(), 20_000 - 10);
    assert_eq!(txn.get(&db, &19_999u32.to_ne_bytes()).unwrap(), Some(&[b'v'; 40][..]));
    assert!(txn.get(&db, &1u32.to_ne_bytes()).unwrap().is_none());
}
