use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use lumokv::{
    DatabaseConfig, Environment, EnvironmentConfig, Error, ErrorKind, KeyOrdering, Mode, TxnState,
    WriteFlags,
};
use tempfile::TempDir;

fn setup_test_env() -> (TempDir, Environment) {
    let temp_dir = TempDir::new().unwrap();
    let env = Environment::open(temp_dir.path(), EnvironmentConfig::default()).unwrap();
    (temp_dir, env)
}

fn lexicographic() -> DatabaseConfig {
    DatabaseConfig::create(KeyOrdering::ByteLexicographic)
}

#[test]
fn test_abort_discards_writes() {
    let (_dir, env) = setup_test_env();

    let mut txn = env.begin_txn().unwrap();
    let db = txn.open_database("db", lexicographic()).unwrap();
    txn.put(&db, b"kept", b"1", WriteFlags::empty()).unwrap();
    txn.commit().unwrap();

    let mut txn = env.begin_txn().unwrap();
    txn.put(&db, b"dropped", b"2", WriteFlags::empty()).unwrap();
    txn.delete(&db, b"kept").unwrap();
    txn.abort().unwrap();
    assert_eq!(txn.state(), TxnState::Aborted);

    let txn = env.begin_ro_txn().unwrap();
    assert_eq!(txn.get(&db, b"kept").unwrap(), Some(&b"1"[..]));
    assert!(txn.get(&db, b"dropped").unwrap().is_none());
}

#[test]
fn test_drop_aborts() {
    let (_dir, env) = setup_test_env();
    {
        let mut txn = env.begin_txn().unwrap();
        let db = txn.open_database("db", lexicographic()).unwrap();
        txn.put(&db, b"k", b"v", WriteFlags::empty()).unwrap();
    }

    // The writer lock was released and nothing was published
    let mut txn = env.begin_txn().unwrap();
    assert!(matches!(
        txn.open_database("db", DatabaseConfig::default()),
        Err(Error::DatabaseNotFound(_))
    ));
    assert_eq!(env.info().last_txnid, 0);
}

#[test]
fn test_aborted_database_creation_is_not_visible() {
    let (_dir, env) = setup_test_env();
    let mut txn = env.begin_txn().unwrap();
    let db = txn.open_database("db", lexicographic()).unwrap();
    txn.abort().unwrap();

    // A handle outliving its database reads as empty
    let txn = env.begin_ro_txn().unwrap();
    assert!(txn.get(&db, b"k").unwrap().is_none());
    assert_eq!(txn.stat(&db).unwrap().entries, 0);
    assert!(!txn.cursor(&db).unwrap().move_first());
}

#[test]
fn test_finished_transaction_rejects_operations() {
    let (_dir, env) = setup_test_env();
    let mut txn = env.begin_txn().unwrap();
    let db = txn.open_database("db", lexicographic()).unwrap();
    txn.put(&db, b"k", b"v", WriteFlags::empty()).unwrap();
    txn.commit().unwrap();
    assert_eq!(txn.state(), TxnState::Committed);

    let err = txn.commit().unwrap_err();
    assert!(matches!(err, Error::TxnFinished(TxnState::Committed)));
    assert_eq!(err.kind(), ErrorKind::TransactionState);
    assert!(txn.abort().is_err());
    assert!(txn.get(&db, b"k").is_err());
    assert!(txn.put(&db, b"k", b"v", WriteFlags::empty()).is_err());
    assert!(txn.cursor(&db).is_err());
    assert!(txn.stat(&db).is_err());
    assert!(txn.open_database("db", DatabaseConfig::default()).is_err());

    let mut txn = env.begin_ro_txn().unwrap();
    txn.abort().unwrap();
    assert!(matches!(txn.abort(), Err(Error::TxnFinished(TxnState::Aborted))));
}

#[test]
fn test_read_transaction_is_read_only() {
    let (_dir, env) = setup_test_env();
    let mut txn = env.begin_txn().unwrap();
    let db = txn.open_database("db", lexicographic()).unwrap();
    txn.commit().unwrap();

    let mut txn = env.begin_ro_txn().unwrap();
    assert_eq!(txn.mode(), Mode::Read);
    assert!(txn.is_readonly());

    let err = txn.put(&db, b"k", b"v", WriteFlags::empty()).unwrap_err();
    assert!(matches!(err, Error::TxnReadOnly));
    assert_eq!(err.kind(), ErrorKind::TransactionState);
    assert!(matches!(txn.delete(&db, b"k"), Err(Error::TxnReadOnly)));
    assert!(matches!(
        txn.open_database("other", lexicographic()),
        Err(Error::TxnReadOnly)
    ));
    assert!(matches!(
        txn.open_database("other", DatabaseConfig::default()),
        Err(Error::DatabaseNotFound(_))
    ));
    // Still usable after the rejected writes
    assert!(txn.get(&db, b"k").unwrap().is_none());
    txn.commit().unwrap();
}

#[test]
fn test_transaction_ids() {
    let (_dir, env) = setup_test_env();
    let ro = env.begin_ro_txn().unwrap();
    assert_eq!(ro.id(), 0);
    drop(ro);

    let mut txn = env.begin_txn().unwrap();
    assert_eq!(txn.id(), 1);
    let db = txn.open_database("db", lexicographic()).unwrap();
    txn.put(&db, b"k", b"v", WriteFlags::empty()).unwrap();
    txn.commit().unwrap();

    assert_eq!(env.begin_ro_txn().unwrap().id(), 1);
    assert_eq!(env.begin_txn().unwrap().id(), 2);
    assert_eq!(env.info().last_txnid, 1);
}

#[test]
fn test_snapshot_isolation() {
    let (_dir, env) = setup_test_env();
    let mut txn = env.begin_txn().unwrap();
    let db = txn.open_database("db", lexicographic()).unwrap();
    txn.put(&db, b"k", b"old", WriteFlags::empty()).unwrap();
    txn.commit().unwrap();

    let reader = env.begin_ro_txn().unwrap();
    let before = reader.get(&db, b"k").unwrap().unwrap();
    let stat_before = reader.stat(&db).unwrap();

    for i in 0..3 {
        let mut txn = env.begin_txn().unwrap();
        txn.put(&db, b"k", format!("new{}", i).as_bytes(), WriteFlags::empty()).unwrap();
        txn.put(&db, format!("extra{}", i).as_bytes(), b"x", WriteFlags::empty()).unwrap();
        txn.commit().unwrap();
    }

    // The old reader still sees its snapshot, and earlier slices stay valid
    assert_eq!(before, b"old");
    assert_eq!(reader.get(&db, b"k").unwrap().unwrap(), b"old");
    assert_eq!(reader.stat(&db).unwrap(), stat_before);
    assert_eq!(reader.cursor(&db).unwrap().count(), 1);

    let fresh = env.begin_ro_txn().unwrap();
    assert_eq!(fresh.get(&db, b"k").unwrap().unwrap(), b"new2");
    assert_eq!(fresh.stat(&db).unwrap().entries, 4);
}

#[test]
fn test_single_writer() {
    let (_dir, env) = setup_test_env();
    let mut first = env.begin_txn().unwrap();
    let db = first.open_database("db", lexicographic()).unwrap();
    first.put(&db, b"k", b"first", WriteFlags::empty()).unwrap();

    let second_started = AtomicBool::new(false);
    thread::scope(|s| {
        let handle = s.spawn(|| {
            let mut second = env.begin_txn().unwrap();
            second_started.store(true, Ordering::SeqCst);
            // Sees the first writer's commit
            assert_eq!(second.get(&db, b"k").unwrap().unwrap(), b"first");
            second.put(&db, b"k", b"second", WriteFlags::empty()).unwrap();
            second.commit().unwrap();
        });

        thread::sleep(Duration::from_millis(100));
        assert!(!second_started.load(Ordering::SeqCst));
        // Readers are not blocked by the writer
        let reader = env.begin_ro_txn().unwrap();
        assert!(reader.get(&db, b"k").unwrap().is_none());
        drop(reader);

        first.commit().unwrap();
        handle.join().unwrap();
    });

    assert!(second_started.load(Ordering::SeqCst));
    let txn = env.begin_ro_txn().unwrap();
    assert_eq!(txn.get(&db, b"k").unwrap().unwrap(), b"second");
}

#[test]
fn test_concurrent_readers() {
    let (_dir, env) = setup_test_env();
    let mut txn = env.begin_txn().unwrap();
    let db = txn.open_database("db", DatabaseConfig::create(KeyOrdering::FixedWidthInteger)).unwrap();
    for i in 0..1000u32 {
        txn.put(&db, &i.to_ne_bytes(), &i.to_be_bytes(), WriteFlags::empty()).unwrap();
    }
    txn.commit().unwrap();

    thread::scope(|s| {
        for _ in 0..4 {
            s.spawn(|| {
                let txn = env.begin_ro_txn().unwrap();
                for (n, (key, value)) in txn.cursor(&db).unwrap().enumerate() {
                    assert_eq!(key, (n as u32).to_ne_bytes());
                    assert_eq!(value, (n as u32).to_be_bytes());
                }
            });
        }
    });
}

#[test]
fn test_readers_full() {
    let dir = TempDir::new().unwrap();
    let config = EnvironmentConfig {
        max_readers: 2,
        ..EnvironmentConfig::default()
    };
    let env = Environment::open(dir.path(), config).unwrap();

    let a = env.begin_ro_txn().unwrap();
    let b = env.begin(Mode::Read).unwrap();
    let err = env.begin_ro_txn().unwrap_err();
    assert!(matches!(err, Error::ReadersFull(2)));
    assert_eq!(err.kind(), ErrorKind::ResourceExhausted);
    assert_eq!(env.info().num_readers, 2);

    // Writers don't take reader slots
    drop(env.begin_txn().unwrap());

    drop(a);
    let c = env.begin_ro_txn().unwrap();
    drop((b, c));
    assert_eq!(env.info().num_readers, 0);
}

#[test]
fn test_stats_include_staged_writes() {
    let (_dir, env) = setup_test_env();
    let mut txn = env.begin_txn().unwrap();
    let db = txn.open_database("db", DatabaseConfig::create(KeyOrdering::FixedWidthInteger)).unwrap();
    for i in 0..2000u64 {
        txn.put(&db, &i.to_ne_bytes(), b"value", WriteFlags::empty()).unwrap();
    }
    let staged = txn.stat(&db).unwrap();
    assert_eq!(staged.entries, 2000);
    assert!(staged.leaf_pages > 1);
    assert_eq!(staged.depth, 2);
    assert_eq!(staged.branch_pages, 1);
    txn.commit().unwrap();

    let txn = env.begin_ro_txn().unwrap();
    assert_eq!(txn.stat(&db).unwrap(), staged);
}
