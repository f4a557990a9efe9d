//! Transactions and crash recovery.

use hamdb::{
    DbParams, EnvFlags, EnvParams, Environment, ErrorCode, FindFlags, InsertFlags, Key, Record,
    TxnFlags,
};

fn txn_flags() -> EnvFlags {
    EnvFlags::ENABLE_TRANSACTIONS | EnvFlags::ENABLE_RECOVERY
}

#[test]
fn test_commit_makes_ops_visible() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("txn.db");
    let env = Environment::create(&path, txn_flags(), &EnvParams::default()).unwrap();
    let db = env.create_db(1, Default::default(), &DbParams::default()).unwrap();

    let mut txn = env.txn_begin(None, TxnFlags::empty()).unwrap();
    db.insert(Some(&mut txn), &Key::new(b"k"), &Record::new(b"v"), InsertFlags::empty())
        .unwrap();

    // Visible through the transaction, invisible outside it.
    let (_, r) = db.find(Some(&txn), &Key::new(b"k"), FindFlags::empty()).unwrap();
    assert_eq!(r.data, b"v");
    let err = db.find(None, &Key::new(b"k"), FindFlags::empty()).unwrap_err();
    assert_eq!(err.code(), ErrorCode::KeyNotFound);

    env.txn_commit(&mut txn, TxnFlags::empty()).unwrap();
    let (_, r) = db.find(None, &Key::new(b"k"), FindFlags::empty()).unwrap();
    assert_eq!(r.data, b"v");
    db.close().unwrap();
    env.close().unwrap();
}

#[test]
fn test_abort_discards_ops() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("abort.db");
    let env = Environment::create(&path, txn_flags(), &EnvParams::default()).unwrap();
    let db = env.create_db(1, Default::default(), &DbParams::default()).unwrap();

    db.insert(None, &Key::new(b"keep"), &Record::new(b"old"), InsertFlags::empty())
        .unwrap();

    let mut txn = env.txn_begin(None, TxnFlags::empty()).unwrap();
    db.insert(Some(&mut txn), &Key::new(b"gone"), &Record::new(b"x"), InsertFlags::empty())
        .unwrap();
    db.insert(
        Some(&mut txn),
        &Key::new(b"keep"),
        &Record::new(b"new"),
        InsertFlags::OVERWRITE,
    )
    .unwrap();
    db.erase(Some(&mut txn), &Key::new(b"keep"), Default::default()).unwrap();
    env.txn_abort(&mut txn).unwrap();

    assert!(db.find(None, &Key::new(b"gone"), FindFlags::empty()).is_err());
    let (_, r) = db.find(None, &Key::new(b"keep"), FindFlags::empty()).unwrap();
    assert_eq!(r.data, b"old");
    db.close().unwrap();
    env.close().unwrap();
}

#[test]
fn test_txn_erase_then_insert_sequence() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("seq.db");
    let env = Environment::create(&path, txn_flags(), &EnvParams::default()).unwrap();
    let db = env.create_db(1, Default::default(), &DbParams::default()).unwrap();

    let mut txn = env.txn_begin(None, TxnFlags::empty()).unwrap();
    db.insert(Some(&mut txn), &Key::new(b"k"), &Record::new(b"r1"), InsertFlags::empty())
        .unwrap();
    db.erase(Some(&mut txn), &Key::new(b"k"), Default::default()).unwrap();
    db.insert(Some(&mut txn), &Key::new(b"k"), &Record::new(b"r2"), InsertFlags::empty())
        .unwrap();
    env.txn_commit(&mut txn, TxnFlags::empty()).unwrap();

    let (_, r) = db.find(None, &Key::new(b"k"), FindFlags::empty()).unwrap();
    assert_eq!(r.data, b"r2");
    db.close().unwrap();
    env.close().unwrap();
}

#[test]
fn test_direct_write_blocked_during_txn() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("block.db");
    let env = Environment::create(&path, txn_flags(), &EnvParams::default()).unwrap();
    let db = env.create_db(1, Default::default(), &DbParams::default()).unwrap();

    let mut txn = env.txn_begin(None, TxnFlags::empty()).unwrap();
    let err = db
        .insert(None, &Key::new(b"k"), &Record::new(b"v"), InsertFlags::empty())
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::WouldBlock);
    env.txn_abort(&mut txn).unwrap();
}

#[test]
fn test_commit_refused_while_cursor_open() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("cursor.db");
    let env = Environment::create(&path, txn_flags(), &EnvParams::default()).unwrap();
    let db = env.create_db(1, Default::default(), &DbParams::default()).unwrap();

    let mut txn = env.txn_begin(None, TxnFlags::empty()).unwrap();
    db.insert(Some(&mut txn), &Key::new(b"k"), &Record::new(b"v"), InsertFlags::empty())
        .unwrap();
    let cursor = db.cursor(Some(&txn)).unwrap();

    let err = env.txn_commit(&mut txn, TxnFlags::empty()).unwrap_err();
    assert_eq!(err.code(), ErrorCode::CursorStillOpen);
    drop(cursor);

    // The transaction survived the failed commit; retrying succeeds.
    env.txn_commit(&mut txn, TxnFlags::empty()).unwrap();
    let (_, r) = db.find(None, &Key::new(b"k"), FindFlags::empty()).unwrap();
    assert_eq!(r.data, b"v");
    db.close().unwrap();
    env.close().unwrap();
}

#[test]
fn test_unclean_open_requires_recovery_flag() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("unclean.db");
    {
        let env = Environment::create(&path, txn_flags(), &EnvParams::default()).unwrap();
        let db = env.create_db(1, Default::default(), &DbParams::default()).unwrap();
        let mut txn = env.txn_begin(None, TxnFlags::empty()).unwrap();
        db.insert(Some(&mut txn), &Key::new(b"k"), &Record::new(b"v"), InsertFlags::empty())
            .unwrap();
        env.txn_commit(&mut txn, TxnFlags::empty()).unwrap();
        db.close().unwrap();
        env.simulate_crash().unwrap();
    }

    let err = Environment::open(&path, txn_flags(), &EnvParams::default()).unwrap_err();
    assert_eq!(err.code(), ErrorCode::NeedRecovery);

    let env = Environment::open(
        &path,
        txn_flags() | EnvFlags::AUTO_RECOVERY,
        &EnvParams::default(),
    )
    .unwrap();
    let db = env.open_db(1, &DbParams::default()).unwrap();
    let (_, r) = db.find(None, &Key::new(b"k"), FindFlags::empty()).unwrap();
    assert_eq!(r.data, b"v");
    db.close().unwrap();
    env.close().unwrap();
}

#[test]
fn test_crash_preserves_only_committed_batches() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("batches.db");
    const BATCH: usize = 100;
    const BATCHES: usize = 6;

    {
        let env = Environment::create(&path, txn_flags(), &EnvParams::default()).unwrap();
        let db = env.create_db(1, Default::default(), &DbParams::default()).unwrap();

        for batch in 0..BATCHES {
            let mut txn = env.txn_begin(None, TxnFlags::empty()).unwrap();
            for i in 0..BATCH {
                let key = format!("key-{:03}-{:03}", batch, i);
                db.insert(
                    Some(&mut txn),
                    &Key::new(key.as_bytes()),
                    &Record::new(key.as_bytes()),
                    InsertFlags::empty(),
                )
                .unwrap();
            }
            env.txn_commit(&mut txn, TxnFlags::WRITE_THROUGH).unwrap();
        }

        // One more transaction crashes before its commit marker lands.
        let mut txn = env.txn_begin(None, TxnFlags::empty()).unwrap();
        for i in 0..BATCH {
            let key = format!("key-lost-{:03}", i);
            db.insert(
                Some(&mut txn),
                &Key::new(key.as_bytes()),
                &Record::new(b"lost"),
                InsertFlags::empty(),
            )
            .unwrap();
        }
        drop(txn);
        db.close().unwrap();
        env.simulate_crash().unwrap();
    }

    let env = Environment::open(
        &path,
        txn_flags() | EnvFlags::AUTO_RECOVERY,
        &EnvParams::default(),
    )
    .unwrap();
    let db = env.open_db(1, &DbParams::default()).unwrap();

    let count = db.get_key_count(None, true).unwrap();
    assert_eq!(count as usize, BATCH * BATCHES);
    assert_eq!(count as usize % BATCH, 0);

    // Every committed key is findable with its record intact.
    for batch in 0..BATCHES {
        for i in 0..BATCH {
            let key = format!("key-{:03}-{:03}", batch, i);
            let (_, r) = db
                .find(None, &Key::new(key.as_bytes()), FindFlags::empty())
                .unwrap();
            assert_eq!(r.data, key.as_bytes());
        }
    }
    db.check_integrity().unwrap();
    db.close().unwrap();
    env.close().unwrap();
}

#[test]
fn test_torn_commit_marker_rolls_back() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("torn.db");

    {
        let env = Environment::create(&path, txn_flags(), &EnvParams::default()).unwrap();
        let db = env.create_db(1, Default::default(), &DbParams::default()).unwrap();

        let mut txn = env.txn_begin(None, TxnFlags::empty()).unwrap();
        db.insert(Some(&mut txn), &Key::new(b"stable"), &Record::new(b"s"), InsertFlags::empty())
            .unwrap();
        env.txn_commit(&mut txn, TxnFlags::WRITE_THROUGH).unwrap();

        let mut txn = env.txn_begin(None, TxnFlags::empty()).unwrap();
        db.insert(Some(&mut txn), &Key::new(b"victim"), &Record::new(b"v"), InsertFlags::empty())
            .unwrap();
        env.txn_commit(&mut txn, TxnFlags::WRITE_THROUGH).unwrap();
        db.close().unwrap();
        env.simulate_crash().unwrap();
    }

    // Chop the tail of the active log file: the second commit marker is
    // lost, so recovery must roll that transaction back.
    let log0 = std::path::PathBuf::from(format!("{}.log0", path.display()));
    let file = std::fs::OpenOptions::new().write(true).open(&log0).unwrap();
    let len = file.metadata().unwrap().len();
    file.set_len(len.saturating_sub(16)).unwrap();

    let env = Environment::open(
        &path,
        txn_flags() | EnvFlags::AUTO_RECOVERY,
        &EnvParams::default(),
    )
    .unwrap();
    let db = env.open_db(1, &DbParams::default()).unwrap();

    let (_, r) = db.find(None, &Key::new(b"stable"), FindFlags::empty()).unwrap();
    assert_eq!(r.data, b"s");
    let err = db.find(None, &Key::new(b"victim"), FindFlags::empty()).unwrap_err();
    assert_eq!(err.code(), ErrorCode::KeyNotFound);
    db.check_integrity().unwrap();
    db.close().unwrap();
    env.close().unwrap();
}
