//! Databases and cursors.
//!
//! A database is one ordered index inside an environment, registered in a
//! header-page slot. The handle wires the environment's page machinery to
//! the B+tree backend and adds the transactional read/write paths on top.

use std::cell::RefCell;
use std::cmp::Ordering;
use std::rc::{Rc, Weak};

use crate::btree::check::EnumVisitor;
use crate::btree::cursor::{CursorPos, CursorState};
use crate::btree::keys::{KeyCompare, LexicalCompare, PrefixCompare, RecnoCompare};
use crate::btree::{BtreeIndex, TreeOp};
use crate::error::{Error, ErrorCode, Result};
use crate::storage::extkey::ExtKeyCache;
use crate::storage::freelist::AllocHints;
use crate::storage::PageIo;
use crate::txn::{OpKind, Transaction, TxnOp, Visibility};
use crate::types::{
    CursorFlags, Dam, DbFlags, DbName, DbParams, EraseFlags, FindFlags, InsertFlags, Key, Record,
    DBNAME_RESERVED_FIRST, MIN_KEYSIZE,
};

use super::{DbSlot, EnvInner, Environment};

// ============================================================================
// DbState
// ============================================================================

/// Shared state behind a [`Database`] handle and its cursors.
pub(crate) struct DbState {
    pub env: Rc<RefCell<EnvInner>>,
    pub name: DbName,
    pub slot_index: usize,
    pub flags: DbFlags,
    pub dam: Dam,
    pub index: BtreeIndex,
    pub recno_high: u64,
    pub cmp: Rc<dyn KeyCompare>,
    pub prefix_cmp: Option<Rc<dyn PrefixCompare>>,
    pub dupe_cmp: Option<Rc<dyn Fn(&[u8], &[u8]) -> Ordering>>,
    pub extkeys: ExtKeyCache,
    pub cursors: Vec<Weak<RefCell<CursorState>>>,
    pub closed: bool,
}

/// Run one B+tree operation against a database.
pub(crate) fn with_tree<R>(
    env_rc: &Rc<RefCell<EnvInner>>,
    db_rc: &Rc<RefCell<DbState>>,
    f: impl FnOnce(&mut TreeOp<'_>) -> Result<R>,
) -> Result<R> {
    let mut env = env_rc.borrow_mut();
    let mut db = db_rc.borrow_mut();
    if db.closed {
        return Err(Error::new(ErrorCode::NotReady));
    }

    let env: &mut EnvInner = &mut env;
    let db: &mut DbState = &mut db;
    let EnvInner {
        device,
        cache,
        freelist,
        log,
        header,
        txn_dirty,
        active_txn,
        pagesize,
        ..
    } = env;
    let DbState {
        index,
        extkeys,
        cursors,
        flags,
        dam,
        name,
        cmp,
        prefix_cmp,
        dupe_cmp,
        ..
    } = db;

    let io = PageIo {
        device: device.as_mut(),
        cache,
        log: log.as_mut(),
        txn_id: *active_txn,
        txn_dirty,
        pagesize: *pagesize,
    };
    let mut op = TreeOp {
        io,
        fl: freelist,
        header,
        extkeys,
        index,
        db_flags: *flags,
        dbname: *name,
        cmp: cmp.as_ref(),
        prefix_cmp: prefix_cmp.as_deref(),
        dupe_cmp: dupe_cmp.as_deref(),
        hints: AllocHints {
            dam: *dam,
            lower_bound: 0,
            db: *name,
            page_aligned: false,
        },
        cursors: cursors.as_slice(),
    };
    f(&mut op)
}

/// Write the database's mutable slot fields (root, recno) back to the
/// header page.
pub(crate) fn persist_db_state(
    env_rc: &Rc<RefCell<EnvInner>>,
    db_rc: &Rc<RefCell<DbState>>,
) -> Result<()> {
    let (slot_index, root, recno) = {
        let db = db_rc.borrow();
        if db.closed {
            return Ok(());
        }
        (db.slot_index, db.index.root, db.recno_high)
    };
    let mut env = env_rc.borrow_mut();
    let mut slot = env.slot(slot_index);
    if slot.self_rid == root && slot.recno == recno {
        return Ok(());
    }
    slot.self_rid = root;
    slot.recno = recno;
    env.set_slot(slot_index, &slot)
}

/// Apply one buffered transaction op against the B+tree.
pub(crate) fn apply_txn_op(
    env_rc: &Rc<RefCell<EnvInner>>,
    db_rc: &Rc<RefCell<DbState>>,
    key: &[u8],
    op: &TxnOp,
) -> Result<()> {
    match op.kind {
        OpKind::Insert | OpKind::InsertOverwrite | OpKind::InsertDuplicate => {
            let record = op.record.clone().unwrap_or_default();
            with_tree(env_rc, db_rc, |t| t.insert(key, &record, op.insert_flags))?;
        }
        OpKind::Erase => {
            with_tree(env_rc, db_rc, |t| t.erase(key, op.dup_id, op.erase_flags))?;
        }
    }
    Ok(())
}

fn check_txn<'t>(
    state: &Rc<RefCell<DbState>>,
    txn: Option<&'t Transaction>,
) -> Result<Option<&'t Transaction>> {
    if let Some(txn) = txn {
        let env = state.borrow().env.clone();
        let inner = env.borrow();
        if inner.active_txn != Some(txn.id()) {
            return Err(Error::with_message(
                ErrorCode::InvalidParameter,
                "transaction is not active on this environment",
            ));
        }
    }
    Ok(txn)
}

/// Reject direct writes while a transaction is open: their pages would
/// tangle with the transaction's before-images.
fn check_direct_write(state: &Rc<RefCell<DbState>>) -> Result<()> {
    let env = state.borrow().env.clone();
    let inner = env.borrow();
    inner.check_writable()?;
    if inner.active_txn.is_some() {
        return Err(Error::new(ErrorCode::WouldBlock));
    }
    Ok(())
}

/// True when `key` currently resolves to a record, considering both the
/// transaction's pending ops and the B+tree.
fn key_visible(
    state: &Rc<RefCell<DbState>>,
    txn: Option<&Transaction>,
    key: &[u8],
) -> Result<bool> {
    let name = state.borrow().name;
    if let Some(txn) = txn {
        if let Some(node) = txn.tree(name).and_then(|tree| tree.lookup(key)) {
            match node.visibility() {
                Visibility::Record(_) => return Ok(true),
                Visibility::Erased => return Ok(false),
                Visibility::Unknown => {}
            }
        }
    }
    let env = state.borrow().env.clone();
    with_tree(&env, state, |t| {
        Ok(t.locate(key, FindFlags::empty())?.is_some())
    })
}

fn validate_insert(state: &Rc<RefCell<DbState>>, record: &Record, flags: InsertFlags) -> Result<()> {
    let db_flags = state.borrow().flags;
    if flags.contains(InsertFlags::DUPLICATE) && !db_flags.contains(DbFlags::ENABLE_DUPLICATES) {
        return Err(Error::with_message(
            ErrorCode::InvalidParameter,
            "database was created without duplicate support",
        ));
    }
    if flags.contains(InsertFlags::DUPLICATE) && flags.contains(InsertFlags::OVERWRITE) {
        return Err(Error::new(ErrorCode::InvalidParameter));
    }
    if flags.contains(InsertFlags::PARTIAL) {
        if db_flags.contains(DbFlags::SORT_DUPLICATES) {
            return Err(Error::with_message(
                ErrorCode::InvalidParameter,
                "partial writes cannot target sorted duplicates",
            ));
        }
        if record.data.len() != record.partial_size as usize {
            return Err(Error::new(ErrorCode::InvalidParameter));
        }
    }
    Ok(())
}

/// Resolve the effective key bytes, assigning the next record number for
/// `RECNO` databases. Returns the key plus the new high-water mark to
/// commit on success.
fn resolve_recno(
    state: &Rc<RefCell<DbState>>,
    key: &Key,
    flags: InsertFlags,
) -> Result<(Vec<u8>, Option<u64>)> {
    let db = state.borrow();
    if !db.flags.contains(DbFlags::RECNO) {
        return Ok((key.data.clone(), None));
    }
    if key.data.is_empty() {
        let next = db.recno_high + 1;
        return Ok((next.to_le_bytes().to_vec(), Some(next)));
    }
    let value = key
        .as_recno()
        .ok_or_else(|| Error::new(ErrorCode::InvalidKeysize))?;
    // Existing numbers may be overwritten; inventing new ones clashes
    // with the allocator.
    if flags.contains(InsertFlags::OVERWRITE) && value <= db.recno_high {
        return Ok((key.data.clone(), None));
    }
    Err(Error::with_message(
        ErrorCode::InvalidParameter,
        "record-number keys are assigned by the database",
    ))
}

/// Shared insert path used by [`Database::insert`] and cursor inserts.
pub(crate) fn db_insert(
    state: &Rc<RefCell<DbState>>,
    txn: Option<&mut Transaction>,
    key: &Key,
    record: &Record,
    flags: InsertFlags,
) -> Result<Key> {
    validate_insert(state, record, flags)?;
    let (key_bytes, new_recno) = resolve_recno(state, key, flags)?;
    let env = state.borrow().env.clone();
    let name = state.borrow().name;

    match txn {
        Some(txn) => {
            check_txn(state, Some(txn))?;
            let exists = key_visible(state, Some(txn), &key_bytes)?;
            if exists && !flags.intersects(InsertFlags::OVERWRITE | InsertFlags::DUPLICATE) {
                return Err(Error::new(ErrorCode::DuplicateKey));
            }
            let kind = if flags.contains(InsertFlags::OVERWRITE) {
                OpKind::InsertOverwrite
            } else if flags.contains(InsertFlags::DUPLICATE) {
                OpKind::InsertDuplicate
            } else {
                OpKind::Insert
            };
            let cmp = state.borrow().cmp.clone();
            txn.tree_for(name, cmp)
                .record_insert(&key_bytes, record.clone(), kind, flags);
        }
        None => {
            check_direct_write(state)?;
            with_tree(&env, state, |t| t.insert(&key_bytes, record, flags))?;
        }
    }

    if let Some(next) = new_recno {
        state.borrow_mut().recno_high = next;
    }
    if env.borrow().active_txn.is_none() {
        persist_db_state(&env, state)?;
    }
    Ok(Key::new(&key_bytes))
}

fn build_comparators(
    flags: DbFlags,
) -> (
    Rc<dyn KeyCompare>,
    Option<Rc<dyn Fn(&[u8], &[u8]) -> Ordering>>,
) {
    let cmp: Rc<dyn KeyCompare> = if flags.contains(DbFlags::RECNO) {
        Rc::new(RecnoCompare)
    } else {
        Rc::new(LexicalCompare)
    };
    let dupe_cmp: Option<Rc<dyn Fn(&[u8], &[u8]) -> Ordering>> = flags
        .contains(DbFlags::SORT_DUPLICATES)
        .then(|| Rc::new(|a: &[u8], b: &[u8]| a.cmp(b)) as Rc<dyn Fn(&[u8], &[u8]) -> Ordering>);
    (cmp, dupe_cmp)
}

// ============================================================================
// Environment: database management
// ============================================================================

fn validate_dbname(name: DbName) -> Result<()> {
    if name == 0 || name >= DBNAME_RESERVED_FIRST {
        return Err(Error::with_message(
            ErrorCode::InvalidParameter,
            format!("database name {:#x} is reserved", name),
        ));
    }
    Ok(())
}

impl Environment {
    /// Create a database in a free index slot.
    pub fn create_db(&self, name: DbName, flags: DbFlags, params: &DbParams) -> Result<Database> {
        validate_dbname(name)?;
        let (pagesize, slot_index) = {
            let inner = self.inner.borrow();
            inner.check_writable()?;
            if inner.active_txn.is_some() {
                return Err(Error::new(ErrorCode::WouldBlock));
            }
            if inner.find_slot(name).is_some() {
                return Err(Error::with_message(
                    ErrorCode::AlreadyInitialized,
                    format!("database {} already exists", name),
                ));
            }
            let free = inner
                .find_slot(0)
                .ok_or_else(|| Error::new(ErrorCode::LimitsReached))?;
            (inner.pagesize, free)
        };

        if flags.contains(DbFlags::RECNO) && flags.contains(DbFlags::ENABLE_DUPLICATES) {
            return Err(Error::with_message(
                ErrorCode::InvalidParameter,
                "record-number databases cannot hold duplicates",
            ));
        }
        let keysize = if flags.contains(DbFlags::RECNO) {
            8
        } else {
            params.keysize
        };
        if keysize < MIN_KEYSIZE {
            return Err(Error::new(ErrorCode::KeysizeTooSmall));
        }

        let layout =
            BtreeIndex::layout_for(pagesize, keysize, flags.contains(DbFlags::FAST_INDEX))?;
        let dam = if params.dam.is_empty() {
            self.inner.borrow().dam
        } else {
            params.dam
        };
        let (cmp, dupe_cmp) = build_comparators(flags);

        let db_rc = Rc::new(RefCell::new(DbState {
            env: self.inner.clone(),
            name,
            slot_index,
            flags,
            dam,
            index: BtreeIndex {
                root: 0,
                layout,
                leftmost_leaf: None,
                rightmost_leaf: None,
            },
            recno_high: 0,
            cmp,
            prefix_cmp: None,
            dupe_cmp,
            extkeys: ExtKeyCache::default(),
            cursors: Vec::new(),
            closed: false,
        }));

        with_tree(&self.inner, &db_rc, |t| t.create_root())?;

        let root = db_rc.borrow().index.root;
        {
            let mut inner = self.inner.borrow_mut();
            inner.set_slot(
                slot_index,
                &DbSlot {
                    dbname: name,
                    max_keys: layout.max_keys,
                    keysize,
                    self_rid: root,
                    flags: (flags.bits() & 0xFFFF) | ((dam.bits() as u32) << 16),
                    recno: 0,
                },
            )?;
            inner.open_dbs.push((name, Rc::downgrade(&db_rc)));
        }
        tracing::debug!(name, keysize, max_keys = layout.max_keys, "database created");
        Ok(Database { state: db_rc })
    }

    /// Open a registered database.
    pub fn open_db(&self, name: DbName, params: &DbParams) -> Result<Database> {
        validate_dbname(name)?;
        let (slot, slot_index) = {
            let inner = self.inner.borrow();
            inner.check_open()?;
            let idx = inner.find_slot(name).ok_or_else(|| {
                Error::with_message(
                    ErrorCode::FileNotFound,
                    format!("database {} not found", name),
                )
            })?;
            if inner
                .open_dbs
                .iter()
                .any(|(n, weak)| *n == name && weak.upgrade().is_some())
            {
                return Err(Error::with_message(
                    ErrorCode::AlreadyInitialized,
                    format!("database {} is already open", name),
                ));
            }
            (inner.slot(idx), idx)
        };

        let flags = DbFlags::from_bits_truncate(slot.flags & 0xFFFF);
        let persisted_dam = Dam::from_bits_truncate((slot.flags >> 16) as u16);
        // The persisted data-access-mode is authoritative.
        if !params.dam.is_empty() && !persisted_dam.is_empty() && params.dam != persisted_dam {
            return Err(Error::with_message(
                ErrorCode::InvalidParameter,
                "data-access-mode conflicts with the persisted value",
            ));
        }
        let dam = if persisted_dam.is_empty() {
            params.dam
        } else {
            persisted_dam
        };

        let layout = BtreeIndex {
            root: slot.self_rid,
            layout: crate::btree::node::NodeLayout {
                keysize: slot.keysize,
                max_keys: slot.max_keys,
                fast_index: flags.contains(DbFlags::FAST_INDEX),
            },
            leftmost_leaf: None,
            rightmost_leaf: None,
        };
        let (cmp, dupe_cmp) = build_comparators(flags);

        let db_rc = Rc::new(RefCell::new(DbState {
            env: self.inner.clone(),
            name,
            slot_index,
            flags,
            dam,
            index: layout,
            recno_high: slot.recno,
            cmp,
            prefix_cmp: None,
            dupe_cmp,
            extkeys: ExtKeyCache::default(),
            cursors: Vec::new(),
            closed: false,
        }));

        self.inner
            .borrow_mut()
            .open_dbs
            .push((name, Rc::downgrade(&db_rc)));
        tracing::debug!(name, "database opened");
        Ok(Database { state: db_rc })
    }

    /// Delete a closed database, returning all its pages to the freelist.
    pub fn erase_db(&self, name: DbName) -> Result<()> {
        validate_dbname(name)?;
        let (slot, slot_index) = {
            let inner = self.inner.borrow();
            inner.check_writable()?;
            if inner.active_txn.is_some() {
                return Err(Error::new(ErrorCode::WouldBlock));
            }
            if inner
                .open_dbs
                .iter()
                .any(|(n, weak)| *n == name && weak.upgrade().is_some())
            {
                return Err(Error::with_message(
                    ErrorCode::CursorStillOpen,
                    "database must be closed before it can be deleted",
                ));
            }
            let idx = inner.find_slot(name).ok_or_else(|| {
                Error::with_message(
                    ErrorCode::FileNotFound,
                    format!("database {} not found", name),
                )
            })?;
            (inner.slot(idx), idx)
        };

        // A transient state drives the full tree teardown.
        let flags = DbFlags::from_bits_truncate(slot.flags & 0xFFFF);
        let (cmp, dupe_cmp) = build_comparators(flags);
        let db_rc = Rc::new(RefCell::new(DbState {
            env: self.inner.clone(),
            name,
            slot_index,
            flags,
            dam: Dam::empty(),
            index: BtreeIndex {
                root: slot.self_rid,
                layout: crate::btree::node::NodeLayout {
                    keysize: slot.keysize,
                    max_keys: slot.max_keys,
                    fast_index: flags.contains(DbFlags::FAST_INDEX),
                },
                leftmost_leaf: None,
                rightmost_leaf: None,
            },
            recno_high: slot.recno,
            cmp,
            prefix_cmp: None,
            dupe_cmp,
            extkeys: ExtKeyCache::default(),
            cursors: Vec::new(),
            closed: false,
        }));
        with_tree(&self.inner, &db_rc, |t| t.drop_tree())?;

        self.inner
            .borrow_mut()
            .set_slot(slot_index, &DbSlot::default())?;
        tracing::debug!(name, "database deleted");
        Ok(())
    }

    /// Rename a closed database.
    pub fn rename_db(&self, old: DbName, new: DbName) -> Result<()> {
        validate_dbname(old)?;
        validate_dbname(new)?;
        let mut inner = self.inner.borrow_mut();
        inner.check_writable()?;
        if inner.active_txn.is_some() {
            return Err(Error::new(ErrorCode::WouldBlock));
        }
        if inner.find_slot(new).is_some() {
            return Err(Error::new(ErrorCode::AlreadyInitialized));
        }
        if inner
            .open_dbs
            .iter()
            .any(|(n, weak)| *n == old && weak.upgrade().is_some())
        {
            return Err(Error::with_message(
                ErrorCode::CursorStillOpen,
                "database must be closed before it can be renamed",
            ));
        }
        let idx = inner
            .find_slot(old)
            .ok_or_else(|| Error::new(ErrorCode::FileNotFound))?;
        let mut slot = inner.slot(idx);
        slot.dbname = new;
        inner.set_slot(idx, &slot)
    }
}

// ============================================================================
// Database
// ============================================================================

/// One ordered key/value index.
pub struct Database {
    pub(crate) state: Rc<RefCell<DbState>>,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database").finish_non_exhaustive()
    }
}

impl Database {
    /// The database's registered name.
    pub fn name(&self) -> DbName {
        self.state.borrow().name
    }

    /// The database's flags.
    pub fn flags(&self) -> DbFlags {
        self.state.borrow().flags
    }

    /// Effective creation parameters.
    pub fn get_parameters(&self) -> Result<DbParams> {
        let db = self.state.borrow();
        Ok(DbParams {
            keysize: db.index.layout.keysize,
            dam: db.dam,
        })
    }

    /// Install a custom full-key comparator. Must happen before the first
    /// insert; keys already in the tree keep their old order otherwise.
    /// Record-number databases always compare numerically.
    pub fn set_comparator(&self, cmp: Rc<dyn KeyCompare>) -> Result<()> {
        let mut db = self.state.borrow_mut();
        if db.flags.contains(DbFlags::RECNO) {
            return Err(Error::new(ErrorCode::InvalidParameter));
        }
        db.cmp = cmp;
        Ok(())
    }

    /// Install a prefix comparator, consulted before extended keys are
    /// materialized.
    pub fn set_prefix_comparator(&self, cmp: Rc<dyn PrefixCompare>) -> Result<()> {
        self.state.borrow_mut().prefix_cmp = Some(cmp);
        Ok(())
    }

    /// Install a record comparator for sorted duplicates.
    pub fn set_duplicate_comparator(
        &self,
        cmp: Rc<dyn Fn(&[u8], &[u8]) -> Ordering>,
    ) -> Result<()> {
        let mut db = self.state.borrow_mut();
        if !db.flags.contains(DbFlags::SORT_DUPLICATES) {
            return Err(Error::new(ErrorCode::InvalidParameter));
        }
        db.dupe_cmp = Some(cmp);
        Ok(())
    }

    fn env_rc(&self) -> Rc<RefCell<EnvInner>> {
        self.state.borrow().env.clone()
    }

    fn check_txn<'t>(&self, txn: Option<&'t Transaction>) -> Result<Option<&'t Transaction>> {
        check_txn(&self.state, txn)
    }

    /// Insert or update a key. Returns the effective key (record-number
    /// databases assign it here).
    pub fn insert(
        &self,
        txn: Option<&mut Transaction>,
        key: &Key,
        record: &Record,
        flags: InsertFlags,
    ) -> Result<Key> {
        db_insert(&self.state, txn, key, record, flags)
    }

    /// Look up a key. The returned key carries the matched bytes and the
    /// approximate-match direction when LT/GT/NEAR flags were used.
    pub fn find(
        &self,
        txn: Option<&Transaction>,
        key: &Key,
        flags: FindFlags,
    ) -> Result<(Key, Record)> {
        self.find_impl(txn, key, flags, None)
    }

    /// Look up a partial window of a key's record.
    pub fn find_partial(
        &self,
        txn: Option<&Transaction>,
        key: &Key,
        offset: u32,
        size: u32,
    ) -> Result<(Key, Record)> {
        self.find_impl(txn, key, FindFlags::PARTIAL, Some((offset, size)))
    }

    fn find_impl(
        &self,
        txn: Option<&Transaction>,
        key: &Key,
        flags: FindFlags,
        partial: Option<(u32, u32)>,
    ) -> Result<(Key, Record)> {
        self.check_txn(txn)?;

        // Pending transaction ops shadow the tree for exact lookups.
        if !flags.is_approximate() {
            if let Some(txn) = txn {
                if let Some(node) = txn.tree(self.name()).and_then(|t| t.lookup(&key.data)) {
                    match node.visibility() {
                        Visibility::Erased => return Err(Error::new(ErrorCode::KeyNotFound)),
                        Visibility::Record(record) => {
                            let record = clip_partial(record, partial);
                            return Ok((Key::new(&key.data), record));
                        }
                        Visibility::Unknown => {}
                    }
                }
            }
        }

        let env = self.env_rc();
        let (matched, approx, record) =
            with_tree(&env, &self.state, |t| t.find(&key.data, flags, partial))?;
        let mut out_key = match matched {
            Some(bytes) => Key::new(&bytes),
            None => Key::new(&key.data),
        };
        out_key.approx = approx;
        Ok((out_key, record))
    }

    /// Erase a key and everything stored under it.
    pub fn erase(
        &self,
        txn: Option<&mut Transaction>,
        key: &Key,
        flags: EraseFlags,
    ) -> Result<()> {
        match txn {
            Some(txn) => {
                self.check_txn(Some(txn))?;
                if !key_visible(&self.state, Some(txn), &key.data)? {
                    return Err(Error::new(ErrorCode::KeyNotFound));
                }
                let cmp = self.state.borrow().cmp.clone();
                txn.tree_for(self.name(), cmp)
                    .record_erase(&key.data, None, flags);
                Ok(())
            }
            None => {
                check_direct_write(&self.state)?;
                let env = self.env_rc();
                with_tree(&env, &self.state, |t| t.erase(&key.data, None, flags))?;
                persist_db_state(&self.env_rc(), &self.state)
            }
        }
    }

    /// Number of keys (or records, with `distinct == false`) in the
    /// database, adjusted for the transaction's pending ops.
    pub fn get_key_count(&self, txn: Option<&Transaction>, distinct: bool) -> Result<u64> {
        self.check_txn(txn)?;
        let env = self.env_rc();
        let mut count = with_tree(&env, &self.state, |t| t.count_keys(distinct))?;

        if let Some(txn) = txn {
            if let Some(tree) = txn.tree(self.name()) {
                for (key, node) in tree.iter() {
                    let in_tree = with_tree(&env, &self.state, |t| {
                        Ok(t.locate(&key.bytes, FindFlags::empty())?.is_some())
                    })?;
                    match node.visibility() {
                        Visibility::Record(_) if !in_tree => count += 1,
                        Visibility::Erased if in_tree => count -= 1,
                        _ => {}
                    }
                }
            }
        }
        Ok(count)
    }

    /// Verify the structural invariants of the whole tree.
    pub fn check_integrity(&self) -> Result<()> {
        let env = self.env_rc();
        with_tree(&env, &self.state, |t| t.check_integrity())
    }

    /// Walk the whole tree in pre-order, feeding every node and leaf key
    /// to the visitor.
    pub fn enumerate(&self, visitor: &mut dyn EnumVisitor) -> Result<()> {
        let env = self.env_rc();
        with_tree(&env, &self.state, |t| t.enumerate(visitor))
    }

    /// Open a cursor. A cursor created under a transaction blocks that
    /// transaction's commit until it is closed.
    pub fn cursor(&self, txn: Option<&Transaction>) -> Result<Cursor> {
        self.check_txn(txn)?;
        let state = CursorState::new();
        self.state
            .borrow_mut()
            .cursors
            .push(Rc::downgrade(&state));

        let txn_counter = txn.map(|t| {
            let counter = t.cursor_counter();
            counter.set(counter.get() + 1);
            counter
        });
        Ok(Cursor {
            db: self.state.clone(),
            state,
            txn_counter,
        })
    }

    /// Persist the slot and detach the handle.
    pub fn close(self) -> Result<()> {
        {
            let db = self.state.borrow();
            if db.cursors.iter().any(|weak| weak.upgrade().is_some()) {
                return Err(Error::new(ErrorCode::CursorStillOpen));
            }
        }
        let env = self.env_rc();
        persist_db_state(&env, &self.state)?;
        let name = self.name();
        self.state.borrow_mut().closed = true;
        env.borrow_mut()
            .open_dbs
            .retain(|(n, _)| *n != name);
        tracing::debug!(name, "database closed");
        Ok(())
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        if self.state.borrow().closed {
            return;
        }
        let env = self.env_rc();
        let _ = persist_db_state(&env, &self.state);
        let name = self.state.borrow().name;
        self.state.borrow_mut().closed = true;
        let borrowed = env.try_borrow_mut();
        if let Ok(mut inner) = borrowed {
            inner.open_dbs.retain(|(n, _)| *n != name);
        }
    }
}

fn clip_partial(record: Record, partial: Option<(u32, u32)>) -> Record {
    match partial {
        None => record,
        Some((offset, size)) => {
            let start = (offset as usize).min(record.data.len());
            let end = (offset as usize + size as usize).min(record.data.len());
            Record {
                data: record.data[start..end].to_vec(),
                partial_offset: offset,
                partial_size: (end - start) as u32,
            }
        }
    }
}

// ============================================================================
// Cursor
// ============================================================================

/// A position within a database, tracking one key and one duplicate.
pub struct Cursor {
    db: Rc<RefCell<DbState>>,
    state: Rc<RefCell<CursorState>>,
    txn_counter: Option<Rc<std::cell::Cell<usize>>>,
}

impl Cursor {
    fn env_rc(&self) -> Rc<RefCell<EnvInner>> {
        self.db.borrow().env.clone()
    }

    /// Move the cursor and return the key/record it lands on.
    pub fn move_to(&self, flags: CursorFlags) -> Result<(Key, Record)> {
        let env = self.env_rc();
        let state = self.state.clone();
        let (key, record) = with_tree(&env, &self.db, |t| t.cursor_move(&state, flags))?;
        Ok((Key::new(&key), record))
    }

    /// Position the cursor on a key.
    pub fn find(&self, key: &Key, flags: FindFlags) -> Result<Record> {
        let env = self.env_rc();
        let state = self.state.clone();
        let (_key, record) = with_tree(&env, &self.db, |t| t.cursor_find(&state, &key.data, flags))?;
        Ok(record)
    }

    /// Current key and record without moving.
    pub fn read(&self) -> Result<(Key, Record)> {
        let env = self.env_rc();
        let state = self.state.clone();
        let (key, record) = with_tree(&env, &self.db, |t| t.cursor_read(&state, None))?;
        Ok((Key::new(&key), record))
    }

    /// Insert through the cursor, leaving it on the written key.
    pub fn insert(&self, key: &Key, record: &Record, flags: InsertFlags) -> Result<Key> {
        let out = db_insert(&self.db, None, key, record, flags)?;
        let env = self.env_rc();
        let state = self.state.clone();
        with_tree(&env, &self.db, |t| {
            t.cursor_find(&state, &out.data, FindFlags::empty())
        })?;
        Ok(out)
    }

    /// Replace the record under the cursor.
    pub fn overwrite(&self, record: &Record) -> Result<()> {
        check_direct_write(&self.db)?;
        let env = self.env_rc();
        let state = self.state.clone();
        with_tree(&env, &self.db, |t| t.cursor_overwrite(&state, record))
    }

    /// Erase the record under the cursor; the key disappears with its last
    /// record.
    pub fn erase(&self, flags: EraseFlags) -> Result<()> {
        check_direct_write(&self.db)?;
        let env = self.env_rc();
        let state = self.state.clone();
        let (key, dup) = with_tree(&env, &self.db, |t| {
            let (key, _) = t.cursor_read(&state, None)?;
            Ok((key, state.borrow().dup_id))
        })?;
        with_tree(&env, &self.db, |t| t.erase(&key, Some(dup), flags))?;
        persist_db_state(&env, &self.db)
    }

    /// Number of duplicates under the cursor.
    pub fn get_duplicate_count(&self) -> Result<u32> {
        let env = self.env_rc();
        let state = self.state.clone();
        with_tree(&env, &self.db, |t| t.cursor_dupe_count(&state))
    }

    /// Clone the cursor, position included.
    pub fn try_clone(&self) -> Result<Cursor> {
        let snapshot = {
            let s = self.state.borrow();
            CursorState {
                pos: s.pos.clone(),
                dup_id: s.dup_id,
            }
        };
        let state = Rc::new(RefCell::new(snapshot));
        self.db.borrow_mut().cursors.push(Rc::downgrade(&state));
        if let Some(counter) = &self.txn_counter {
            counter.set(counter.get() + 1);
        }
        Ok(Cursor {
            db: self.db.clone(),
            state,
            txn_counter: self.txn_counter.clone(),
        })
    }

    /// Explicitly close the cursor.
    pub fn close(self) {
        // Drop does the work.
    }

    /// True when the cursor is not positioned.
    pub fn is_nil(&self) -> bool {
        matches!(self.state.borrow().pos, CursorPos::Nil)
    }
}

impl Drop for Cursor {
    fn drop(&mut self) {
        if let Some(counter) = &self.txn_counter {
            counter.set(counter.get().saturating_sub(1));
        }
        if let Ok(mut db) = self.db.try_borrow_mut() {
            db.cursors.retain(|weak| weak.upgrade().is_some());
        }
    }
}
