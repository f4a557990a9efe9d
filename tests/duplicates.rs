//! Duplicate-key behavior: insertion order, cursor traversal, erase.

use hamdb::{
    CursorFlags, DbFlags, DbParams, EnvFlags, EnvParams, Environment, EraseFlags, ErrorCode,
    InsertFlags, Key, Record,
};

fn dupes_db() -> (Environment, hamdb::Database) {
    let env = Environment::create("ignored", EnvFlags::IN_MEMORY, &EnvParams::default()).unwrap();
    let db = env
        .create_db(1, DbFlags::ENABLE_DUPLICATES, &DbParams::default())
        .unwrap();
    (env, db)
}

#[test]
fn test_dupe_insert_first_and_last_ordering() {
    let (_env, db) = dupes_db();
    let k = Key::new(b"k");

    db.insert(None, &k, &Record::new(b"r1"), InsertFlags::empty()).unwrap();
    db.insert(
        None,
        &k,
        &Record::new(b"r2"),
        InsertFlags::DUPLICATE | InsertFlags::DUPLICATE_INSERT_LAST,
    )
    .unwrap();
    db.insert(
        None,
        &k,
        &Record::new(b"r3"),
        InsertFlags::DUPLICATE | InsertFlags::DUPLICATE_INSERT_FIRST,
    )
    .unwrap();

    // Walk the duplicates of k front to back: r3, r1, r2.
    let cursor = db.cursor(None).unwrap();
    cursor.find(&k, hamdb::FindFlags::empty()).unwrap();
    assert_eq!(cursor.get_duplicate_count().unwrap(), 3);

    let (_, r) = cursor.read().unwrap();
    assert_eq!(r.data, b"r3");
    let (_, r) = cursor
        .move_to(CursorFlags::NEXT | CursorFlags::ONLY_DUPLICATES)
        .unwrap();
    assert_eq!(r.data, b"r1");
    let (_, r) = cursor
        .move_to(CursorFlags::NEXT | CursorFlags::ONLY_DUPLICATES)
        .unwrap();
    assert_eq!(r.data, b"r2");

    let err = cursor
        .move_to(CursorFlags::NEXT | CursorFlags::ONLY_DUPLICATES)
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::KeyNotFound);
}

#[test]
fn test_skip_duplicates_iteration() {
    let (_env, db) = dupes_db();

    for key in [b"a", b"b", b"c"] {
        db.insert(None, &Key::new(key), &Record::new(b"first"), InsertFlags::empty())
            .unwrap();
        db.insert(None, &Key::new(key), &Record::new(b"second"), InsertFlags::DUPLICATE)
            .unwrap();
    }

    // With SKIP_DUPLICATES each key appears once.
    let cursor = db.cursor(None).unwrap();
    let mut seen = Vec::new();
    let mut flags = CursorFlags::FIRST;
    loop {
        match cursor.move_to(flags) {
            Ok((key, _)) => seen.push(key.data),
            Err(e) if e.code() == ErrorCode::KeyNotFound => break,
            Err(e) => panic!("unexpected error: {e}"),
        }
        flags = CursorFlags::NEXT | CursorFlags::SKIP_DUPLICATES;
    }
    assert_eq!(seen, vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]);

    // Without it, every record appears.
    let mut total = 0;
    let mut flags = CursorFlags::FIRST;
    loop {
        match cursor.move_to(flags) {
            Ok(_) => total += 1,
            Err(_) => break,
        }
        flags = CursorFlags::NEXT;
    }
    assert_eq!(total, 6);
    assert_eq!(db.get_key_count(None, false).unwrap(), 6);
    assert_eq!(db.get_key_count(None, true).unwrap(), 3);
}

#[test]
fn test_erase_single_duplicate_via_cursor() {
    let (_env, db) = dupes_db();
    let k = Key::new(b"k");

    for r in [b"r1", b"r2", b"r3"] {
        db.insert(None, &k, &Record::new(r), InsertFlags::DUPLICATE).unwrap();
    }

    let cursor = db.cursor(None).unwrap();
    cursor.find(&k, hamdb::FindFlags::empty()).unwrap();
    cursor
        .move_to(CursorFlags::NEXT | CursorFlags::ONLY_DUPLICATES)
        .unwrap();
    cursor.erase(EraseFlags::empty()).unwrap();

    // r2 is gone, the key stays with r1 and r3.
    let fresh = db.cursor(None).unwrap();
    fresh.find(&k, hamdb::FindFlags::empty()).unwrap();
    assert_eq!(fresh.get_duplicate_count().unwrap(), 2);
    let (_, r) = fresh.read().unwrap();
    assert_eq!(r.data, b"r1");
    let (_, r) = fresh
        .move_to(CursorFlags::NEXT | CursorFlags::ONLY_DUPLICATES)
        .unwrap();
    assert_eq!(r.data, b"r3");
}

#[test]
fn test_erase_all_duplicates_removes_key() {
    let (_env, db) = dupes_db();
    let k = Key::new(b"k");

    for r in [b"r1", b"r2", b"r3"] {
        db.insert(None, &k, &Record::new(r), InsertFlags::DUPLICATE).unwrap();
    }
    db.erase(None, &k, EraseFlags::ERASE_ALL_DUPLICATES).unwrap();

    let err = db.find(None, &k, hamdb::FindFlags::empty()).unwrap_err();
    assert_eq!(err.code(), ErrorCode::KeyNotFound);
    assert_eq!(db.get_key_count(None, false).unwrap(), 0);
    db.check_integrity().unwrap();
}

#[test]
fn test_duplicate_without_flag_fails() {
    let env = Environment::create("ignored", EnvFlags::IN_MEMORY, &EnvParams::default()).unwrap();
    let db = env.create_db(1, DbFlags::empty(), &DbParams::default()).unwrap();

    db.insert(None, &Key::new(b"k"), &Record::new(b"r1"), InsertFlags::empty())
        .unwrap();
    let err = db
        .insert(None, &Key::new(b"k"), &Record::new(b"r2"), InsertFlags::DUPLICATE)
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::InvalidParameter);

    let err = db
        .insert(None, &Key::new(b"k"), &Record::new(b"r2"), InsertFlags::empty())
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::DuplicateKey);
}

#[test]
fn test_sorted_duplicates() {
    let env = Environment::create("ignored", EnvFlags::IN_MEMORY, &EnvParams::default()).unwrap();
    let db = env
        .create_db(
            1,
            DbFlags::ENABLE_DUPLICATES | DbFlags::SORT_DUPLICATES,
            &DbParams::default(),
        )
        .unwrap();
    let k = Key::new(b"k");

    for r in [b"mm".as_slice(), b"aa", b"zz", b"cc"] {
        db.insert(None, &k, &Record::new(r), InsertFlags::DUPLICATE).unwrap();
    }

    let cursor = db.cursor(None).unwrap();
    cursor.find(&k, hamdb::FindFlags::empty()).unwrap();
    let mut records = vec![cursor.read().unwrap().1.data];
    while let Ok((_, r)) = cursor.move_to(CursorFlags::NEXT | CursorFlags::ONLY_DUPLICATES) {
        records.push(r.data);
    }
    assert_eq!(
        records,
        vec![b"aa".to_vec(), b"cc".to_vec(), b"mm".to_vec(), b"zz".to_vec()]
    );
}

#[test]
fn test_dupes_survive_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("dupes.db");
    {
        let env = Environment::create(&path, EnvFlags::empty(), &EnvParams::default()).unwrap();
        let db = env
            .create_db(1, DbFlags::ENABLE_DUPLICATES, &DbParams::default())
            .unwrap();
        for i in 0..10u32 {
            db.insert(
                None,
                &Key::new(b"k"),
                &Record::new(format!("rec-{i}").as_bytes()),
                InsertFlags::DUPLICATE,
            )
            .unwrap();
        }
        db.close().unwrap();
        env.close().unwrap();
    }

    let env = Environment::open(&path, EnvFlags::empty(), &EnvParams::default()).unwrap();
    let db = env.open_db(1, &DbParams::default()).unwrap();
    let cursor = db.cursor(None).unwrap();
    cursor.find(&Key::new(b"k"), hamdb::FindFlags::empty()).unwrap();
    assert_eq!(cursor.get_duplicate_count().unwrap(), 10);
    drop(cursor);
    db.close().unwrap();
    env.close().unwrap();
}
