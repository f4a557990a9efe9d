//! Cursor behavior: coupling across structural changes, cloning,
//! overwrite and erase through the cursor.

use hamdb::{
    CursorFlags, DbParams, EnvFlags, EnvParams, Environment, ErrorCode, FindFlags, InsertFlags,
    Key, Record,
};

fn fresh_db() -> (Environment, hamdb::Database) {
    let env = Environment::create("ignored", EnvFlags::IN_MEMORY, &EnvParams::default()).unwrap();
    let db = env.create_db(1, Default::default(), &DbParams::default()).unwrap();
    (env, db)
}

#[test]
fn test_cursor_survives_node_splits() {
    let (_env, db) = fresh_db();

    db.insert(None, &Key::new(b"anchor"), &Record::new(b"a"), InsertFlags::empty())
        .unwrap();
    let cursor = db.cursor(None).unwrap();
    cursor.find(&Key::new(b"anchor"), FindFlags::empty()).unwrap();

    // Enough inserts to split the leaf under the cursor several times.
    for i in 0..2000u32 {
        let key = format!("key-{:06}", i);
        db.insert(None, &Key::new(key.as_bytes()), &Record::new(b"r"), InsertFlags::empty())
            .unwrap();
    }

    // The uncoupled cursor still knows where it stands.
    let (key, record) = cursor.read().unwrap();
    assert_eq!(key.data, b"anchor");
    assert_eq!(record.data, b"a");

    // And it can keep moving from there.
    let (key, _) = cursor.move_to(CursorFlags::NEXT).unwrap();
    assert_eq!(key.data, b"key-000000");
}

#[test]
fn test_cursor_on_erased_key_steps_forward() {
    let (_env, db) = fresh_db();
    for key in [b"a", b"b", b"c"] {
        db.insert(None, &Key::new(key), &Record::new(key), InsertFlags::empty())
            .unwrap();
    }

    let cursor = db.cursor(None).unwrap();
    cursor.find(&Key::new(b"b"), FindFlags::empty()).unwrap();
    db.erase(None, &Key::new(b"b"), Default::default()).unwrap();

    // The stand-on key is gone; reading fails, NEXT lands on the
    // successor.
    assert!(cursor.read().is_err() || cursor.is_nil());
    let fresh = db.cursor(None).unwrap();
    fresh.find(&Key::new(b"a"), FindFlags::empty()).unwrap();
    let (key, _) = fresh.move_to(CursorFlags::NEXT).unwrap();
    assert_eq!(key.data, b"c");
}

#[test]
fn test_cursor_overwrite_in_place() {
    let (_env, db) = fresh_db();
    for key in [b"x", b"y", b"z"] {
        db.insert(None, &Key::new(key), &Record::new(b"old"), InsertFlags::empty())
            .unwrap();
    }

    let cursor = db.cursor(None).unwrap();
    cursor.find(&Key::new(b"y"), FindFlags::empty()).unwrap();
    cursor.overwrite(&Record::new(b"new value, longer than before")).unwrap();

    // Still standing on y with the new record.
    let (key, record) = cursor.read().unwrap();
    assert_eq!(key.data, b"y");
    assert_eq!(record.data, b"new value, longer than before");

    let (_, r) = db.find(None, &Key::new(b"x"), FindFlags::empty()).unwrap();
    assert_eq!(r.data, b"old");
}

#[test]
fn test_cursor_erase_removes_key() {
    let (_env, db) = fresh_db();
    for key in [b"1", b"2", b"3"] {
        db.insert(None, &Key::new(key), &Record::new(key), InsertFlags::empty())
            .unwrap();
    }

    let cursor = db.cursor(None).unwrap();
    cursor.find(&Key::new(b"2"), FindFlags::empty()).unwrap();
    cursor.erase(Default::default()).unwrap();
    assert!(cursor.is_nil());

    assert_eq!(
        db.find(None, &Key::new(b"2"), FindFlags::empty()).unwrap_err().code(),
        ErrorCode::KeyNotFound
    );
    assert_eq!(db.get_key_count(None, true).unwrap(), 2);
}

#[test]
fn test_cursor_clone_is_independent() {
    let (_env, db) = fresh_db();
    for key in [b"a", b"b", b"c"] {
        db.insert(None, &Key::new(key), &Record::new(key), InsertFlags::empty())
            .unwrap();
    }

    let cursor = db.cursor(None).unwrap();
    cursor.move_to(CursorFlags::FIRST).unwrap();
    let clone = cursor.try_clone().unwrap();

    // The clone starts where the original stood, then moves on its own.
    let (key, _) = clone.read().unwrap();
    assert_eq!(key.data, b"a");
    let (key, _) = clone.move_to(CursorFlags::NEXT).unwrap();
    assert_eq!(key.data, b"b");
    let (key, _) = cursor.read().unwrap();
    assert_eq!(key.data, b"a");
}

#[test]
fn test_cursor_insert_positions_cursor() {
    let (_env, db) = fresh_db();
    let cursor = db.cursor(None).unwrap();

    cursor
        .insert(&Key::new(b"planted"), &Record::new(b"r"), InsertFlags::empty())
        .unwrap();
    let (key, record) = cursor.read().unwrap();
    assert_eq!(key.data, b"planted");
    assert_eq!(record.data, b"r");
}

#[test]
fn test_cursor_find_approximate() {
    let (_env, db) = fresh_db();
    for key in [b"20", b"40"] {
        db.insert(None, &Key::new(key), &Record::new(key), InsertFlags::empty())
            .unwrap();
    }

    let cursor = db.cursor(None).unwrap();
    let record = cursor.find(&Key::new(b"30"), FindFlags::GEQ_MATCH).unwrap();
    assert_eq!(record.data, b"40");
    let (key, _) = cursor.read().unwrap();
    assert_eq!(key.data, b"40");
}

#[test]
fn test_unpositioned_cursor_errors() {
    let (_env, db) = fresh_db();
    db.insert(None, &Key::new(b"k"), &Record::new(b"r"), InsertFlags::empty())
        .unwrap();

    let cursor = db.cursor(None).unwrap();
    assert!(cursor.is_nil());
    let err = cursor.read().unwrap_err();
    assert_eq!(err.code(), ErrorCode::InvalidParameter);
    let err = cursor.move_to(CursorFlags::NEXT).unwrap_err();
    assert_eq!(err.code(), ErrorCode::InvalidParameter);
}

#[test]
fn test_empty_database_cursor() {
    let (_env, db) = fresh_db();
    let cursor = db.cursor(None).unwrap();
    assert_eq!(
        cursor.move_to(CursorFlags::FIRST).unwrap_err().code(),
        ErrorCode::KeyNotFound
    );
    assert_eq!(
        cursor.move_to(CursorFlags::LAST).unwrap_err().code(),
        ErrorCode::KeyNotFound
    );
}
