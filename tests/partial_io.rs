//! Partial record reads and writes.

use hamdb::{
    DbFlags, DbParams, EnvFlags, EnvParams, Environment, ErrorCode, FindFlags, InsertFlags, Key,
    Record,
};

fn fresh_db() -> (Environment, hamdb::Database) {
    let env = Environment::create("ignored", EnvFlags::IN_MEMORY, &EnvParams::default()).unwrap();
    let db = env.create_db(1, Default::default(), &DbParams::default()).unwrap();
    (env, db)
}

#[test]
fn test_partial_overwrite_window() {
    let (_env, db) = fresh_db();
    let k = Key::new(b"k");

    db.insert(None, &k, &Record::new(&[0xAA; 1024]), InsertFlags::empty())
        .unwrap();
    db.insert(
        None,
        &k,
        &Record::partial(&[0xBB; 10], 100, 10),
        InsertFlags::OVERWRITE | InsertFlags::PARTIAL,
    )
    .unwrap();

    let (_, record) = db.find(None, &k, FindFlags::empty()).unwrap();
    assert_eq!(record.data.len(), 1024);
    assert!(record.data[..100].iter().all(|&b| b == 0xAA));
    assert!(record.data[100..110].iter().all(|&b| b == 0xBB));
    assert!(record.data[110..].iter().all(|&b| b == 0xAA));
}

#[test]
fn test_partial_write_roundtrip_and_preservation() {
    let (_env, db) = fresh_db();
    let k = Key::new(b"k");

    db.insert(None, &k, &Record::new(&[0x11; 300]), InsertFlags::empty())
        .unwrap();
    db.insert(
        None,
        &k,
        &Record::partial(&[0x22; 50], 200, 50),
        InsertFlags::OVERWRITE | InsertFlags::PARTIAL,
    )
    .unwrap();

    // Reading the same window returns the written bytes.
    let (_, window) = db.find_partial(None, &k, 200, 50).unwrap();
    assert_eq!(window.data, vec![0x22; 50]);
    assert_eq!(window.partial_size, 50);

    // Bytes outside the window are untouched.
    let (_, before) = db.find_partial(None, &k, 0, 200).unwrap();
    assert_eq!(before.data, vec![0x11; 200]);
    let (_, after) = db.find_partial(None, &k, 250, 50).unwrap();
    assert_eq!(after.data, vec![0x11; 50]);
}

#[test]
fn test_partial_extend_zero_fills_gap() {
    let (_env, db) = fresh_db();
    let k = Key::new(b"k");

    db.insert(None, &k, &Record::new(&[0x33; 100]), InsertFlags::empty())
        .unwrap();
    // Write past the end: [100, 200) is a zero gap, [200, 210) the data.
    db.insert(
        None,
        &k,
        &Record::partial(&[0x44; 10], 200, 10),
        InsertFlags::OVERWRITE | InsertFlags::PARTIAL,
    )
    .unwrap();

    let (_, record) = db.find(None, &k, FindFlags::empty()).unwrap();
    assert_eq!(record.data.len(), 210);
    assert!(record.data[..100].iter().all(|&b| b == 0x33));
    assert!(record.data[100..200].iter().all(|&b| b == 0));
    assert!(record.data[200..].iter().all(|&b| b == 0x44));
}

#[test]
fn test_partial_insert_fresh_key() {
    let (_env, db) = fresh_db();
    let k = Key::new(b"k");

    db.insert(
        None,
        &k,
        &Record::partial(&[0x55; 16], 48, 16),
        InsertFlags::PARTIAL,
    )
    .unwrap();

    let (_, record) = db.find(None, &k, FindFlags::empty()).unwrap();
    assert_eq!(record.data.len(), 64);
    assert!(record.data[..48].iter().all(|&b| b == 0));
    assert!(record.data[48..].iter().all(|&b| b == 0x55));
}

#[test]
fn test_partial_read_clips_to_record_size() {
    let (_env, db) = fresh_db();
    let k = Key::new(b"k");

    db.insert(None, &k, &Record::new(&[0x66; 100]), InsertFlags::empty())
        .unwrap();
    let (_, window) = db.find_partial(None, &k, 80, 50).unwrap();
    assert_eq!(window.data, vec![0x66; 20]);
    assert_eq!(window.partial_size, 20);
}

#[test]
fn test_partial_rejected_on_sorted_duplicates() {
    let env = Environment::create("ignored", EnvFlags::IN_MEMORY, &EnvParams::default()).unwrap();
    let db = env
        .create_db(
            1,
            DbFlags::ENABLE_DUPLICATES | DbFlags::SORT_DUPLICATES,
            &DbParams::default(),
        )
        .unwrap();

    let err = db
        .insert(
            None,
            &Key::new(b"k"),
            &Record::partial(&[1, 2, 3], 0, 3),
            InsertFlags::PARTIAL,
        )
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::InvalidParameter);
}

#[test]
fn test_mismatched_partial_size_rejected() {
    let (_env, db) = fresh_db();
    let err = db
        .insert(
            None,
            &Key::new(b"k"),
            &Record {
                data: vec![1, 2, 3],
                partial_offset: 0,
                partial_size: 8,
            },
            InsertFlags::PARTIAL,
        )
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::InvalidParameter);
}
