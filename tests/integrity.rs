//! Integrity checking against targeted on-disk corruption.

use std::fs::OpenOptions;
use std::io::{Read, Seek, SeekFrom, Write};

use hamdb::{
    DbParams, EnvFlags, EnvParams, Environment, ErrorCode, InsertFlags, Key, Record,
};

/// Build a small single-leaf database and return the root page address
/// read straight from the file header (slot 0's `self_rid`).
fn build_db(path: &std::path::Path) -> u64 {
    let env = Environment::create(path, EnvFlags::empty(), &EnvParams::default()).unwrap();
    let db = env.create_db(1, Default::default(), &DbParams::default()).unwrap();
    for key in [b"aaa", b"bbb", b"ccc", b"ddd"] {
        db.insert(None, &Key::new(key), &Record::new(b"r"), InsertFlags::empty())
            .unwrap();
    }
    db.check_integrity().unwrap();
    db.close().unwrap();
    env.close().unwrap();

    // Page header (12) + slot array offset (32) + self_rid offset (8).
    let mut file = OpenOptions::new().read(true).open(path).unwrap();
    file.seek(SeekFrom::Start(12 + 32 + 8)).unwrap();
    let mut buf = [0u8; 8];
    file.read_exact(&mut buf).unwrap();
    u64::from_le_bytes(buf)
}

fn patch(path: &std::path::Path, offset: u64, bytes: &[u8]) {
    let mut file = OpenOptions::new().write(true).open(path).unwrap();
    file.seek(SeekFrom::Start(offset)).unwrap();
    file.write_all(bytes).unwrap();
    file.sync_all().unwrap();
}

fn reopened_check(path: &std::path::Path) -> hamdb::Result<()> {
    let env = Environment::open(path, EnvFlags::empty(), &EnvParams::default())?;
    let db = env.open_db(1, &DbParams::default())?;
    let result = db.check_integrity();
    let _ = db.close();
    let _ = env.close();
    result
}

#[test]
fn test_clean_tree_passes() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("clean.db");
    build_db(&path);
    reopened_check(&path).unwrap();
}

#[test]
fn test_broken_key_order_detected() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("order.db");
    let root = build_db(&path);

    // First key record of the leaf: page header (12) + node header (32),
    // inline bytes start 11 into the record. Forcing the first key above
    // its successors breaks the ordering invariant.
    patch(&path, root + 12 + 32 + 11, &[0xFF, 0xFF, 0xFF]);

    let err = reopened_check(&path).unwrap_err();
    assert_eq!(err.code(), ErrorCode::IntegrityViolated);
}

#[test]
fn test_corrupt_key_count_detected() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("count.db");
    let root = build_db(&path);

    // The node's key count sits 8 bytes into the payload. Claiming far
    // more keys than the node holds must be caught, not trusted.
    patch(&path, root + 12 + 8, &0x4000u16.to_le_bytes());

    let err = reopened_check(&path).unwrap_err();
    assert_eq!(err.code(), ErrorCode::IntegrityViolated);
}

#[test]
fn test_mistyped_root_detected() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("type.db");
    let root = build_db(&path);

    // Overwrite the root page's type byte with the freelist type.
    patch(&path, root, &[0x08]);

    let env = Environment::open(&path, EnvFlags::empty(), &EnvParams::default()).unwrap();
    let db = env.open_db(1, &DbParams::default()).unwrap();
    let err = db.check_integrity().unwrap_err();
    assert_eq!(err.code(), ErrorCode::IntegrityViolated);

    // Regular operations refuse the mistyped page as well.
    let err = db
        .find(None, &Key::new(b"aaa"), hamdb::FindFlags::empty())
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::IntegrityViolated);
}
