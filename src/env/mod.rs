//! Environments: the top-level container.
//!
//! An environment owns one backing file (or heap image) holding a header
//! page, up to `max_databases` database index slots, the freelist, and all
//! data pages. It also owns the page cache, the write-ahead log and the
//! single active transaction.

pub mod db;

use std::cell::RefCell;
use std::path::{Path, PathBuf};
use std::rc::{Rc, Weak};

use byteorder::{ByteOrder, LittleEndian};

use crate::device::{device_create, Device};
use crate::error::{Error, ErrorCode, Result};
use crate::filter::{FilterChain, FilteredDevice};
use crate::log::Log;
use crate::random::random_u32;
use crate::storage::cache::Cache;
use crate::storage::freelist::Freelist;
use crate::storage::page::{Page, PageRef, PageType, PAGE_HEADER_SIZE};
use crate::storage::PageIo;
use crate::txn::Transaction;
use crate::types::{
    Dam, DbName, EnvFlags, EnvParams, Rid, TxnFlags, TxnId, DBNAME_RESERVED_FIRST, ENV_MAGIC,
    ENV_VERSION, MAX_PAGESIZE, MIN_PAGESIZE,
};

use db::DbState;

// ============================================================================
// Header Layout
// ============================================================================

/// Offset of the index-slot array within the header page payload.
const SLOTS_OFFSET: usize = 32;

/// Size of one database index slot.
const SLOT_SIZE: usize = 32;

/// Offset of the freelist root within the header page payload.
fn freelist_offset(max_databases: u16) -> usize {
    SLOTS_OFFSET + SLOT_SIZE * max_databases as usize
}

/// One database index slot.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct DbSlot {
    pub dbname: DbName,
    pub max_keys: u16,
    pub keysize: u16,
    pub self_rid: Rid,
    pub flags: u32,
    pub recno: u64,
}

fn read_slot(payload: &[u8], index: usize) -> DbSlot {
    let b = &payload[SLOTS_OFFSET + index * SLOT_SIZE..];
    DbSlot {
        dbname: LittleEndian::read_u16(&b[0..2]),
        max_keys: LittleEndian::read_u16(&b[2..4]),
        keysize: LittleEndian::read_u16(&b[4..6]),
        self_rid: LittleEndian::read_u64(&b[8..16]),
        flags: LittleEndian::read_u32(&b[16..20]),
        recno: LittleEndian::read_u64(&b[20..28]),
    }
}

fn write_slot(payload: &mut [u8], index: usize, slot: &DbSlot) {
    let b = &mut payload[SLOTS_OFFSET + index * SLOT_SIZE..];
    b[..SLOT_SIZE].fill(0);
    LittleEndian::write_u16(&mut b[0..2], slot.dbname);
    LittleEndian::write_u16(&mut b[2..4], slot.max_keys);
    LittleEndian::write_u16(&mut b[4..6], slot.keysize);
    LittleEndian::write_u64(&mut b[8..16], slot.self_rid);
    LittleEndian::write_u32(&mut b[16..20], slot.flags);
    LittleEndian::write_u64(&mut b[20..28], slot.recno);
}

struct ParsedHeader {
    serial: u32,
    pagesize: u32,
    max_databases: u16,
    flags: u16,
    dam: Dam,
    file_mode: u32,
}

fn parse_header(buf: &[u8]) -> Result<ParsedHeader> {
    if buf.len() < 32 || buf[0..4] != ENV_MAGIC {
        return Err(Error::new(ErrorCode::InvalidFileHeader));
    }
    if buf[4..6] != ENV_VERSION[0..2] {
        return Err(Error::new(ErrorCode::InvalidFileVersion));
    }
    let pagesize = LittleEndian::read_u32(&buf[12..16]);
    if !pagesize.is_power_of_two() || !(MIN_PAGESIZE..=MAX_PAGESIZE).contains(&pagesize) {
        return Err(Error::new(ErrorCode::InvalidPagesize));
    }
    Ok(ParsedHeader {
        serial: LittleEndian::read_u32(&buf[8..12]),
        pagesize,
        max_databases: LittleEndian::read_u16(&buf[16..18]),
        flags: LittleEndian::read_u16(&buf[18..20]),
        dam: Dam::from_bits_truncate(LittleEndian::read_u16(&buf[20..22])),
        file_mode: LittleEndian::read_u16(&buf[22..24]) as u32,
    })
}

fn write_header_fields(
    payload: &mut [u8],
    serial: u32,
    pagesize: u32,
    max_databases: u16,
    flags: EnvFlags,
    dam: Dam,
    file_mode: u32,
) {
    payload[0..4].copy_from_slice(&ENV_MAGIC);
    payload[4..8].copy_from_slice(&ENV_VERSION);
    LittleEndian::write_u32(&mut payload[8..12], serial);
    LittleEndian::write_u32(&mut payload[12..16], pagesize);
    LittleEndian::write_u16(&mut payload[16..18], max_databases);
    LittleEndian::write_u16(&mut payload[18..20], (flags.bits() & 0xFFFF) as u16);
    LittleEndian::write_u16(&mut payload[20..22], dam.bits());
    LittleEndian::write_u16(&mut payload[22..24], file_mode as u16);
    payload[24..32].fill(0);
}

// ============================================================================
// EnvInner
// ============================================================================

/// Shared state behind every [`Environment`] and [`Database`] handle.
pub(crate) struct EnvInner {
    pub device: Box<dyn Device>,
    pub cache: Cache,
    pub freelist: Freelist,
    pub log: Option<Log>,
    pub header: PageRef,
    pub pagesize: u32,
    pub flags: EnvFlags,
    pub dam: Dam,
    pub max_databases: u16,
    pub file_mode: u32,
    pub serial: u32,
    pub path: PathBuf,
    pub next_txn_id: TxnId,
    pub active_txn: Option<TxnId>,
    pub txn_dirty: Vec<Rid>,
    pub open_dbs: Vec<(DbName, Weak<RefCell<DbState>>)>,
    pub closed: bool,
}

impl EnvInner {
    /// Split borrows for one storage operation.
    pub(crate) fn split_io(&mut self) -> (PageIo<'_>, &mut Freelist, &PageRef) {
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
        } = self;
        (
            PageIo {
                device: device.as_mut(),
                cache,
                log: log.as_mut(),
                txn_id: *active_txn,
                txn_dirty,
                pagesize: *pagesize,
            },
            freelist,
            header,
        )
    }

    pub(crate) fn check_open(&self) -> Result<()> {
        if self.closed {
            return Err(Error::new(ErrorCode::NotReady));
        }
        Ok(())
    }

    pub(crate) fn check_writable(&self) -> Result<()> {
        self.check_open()?;
        if self.flags.contains(EnvFlags::READ_ONLY) {
            return Err(Error::new(ErrorCode::ReadOnly));
        }
        Ok(())
    }

    /// Read a database index slot.
    pub(crate) fn slot(&self, index: usize) -> DbSlot {
        read_slot(self.header.borrow().payload(), index)
    }

    /// Write a database index slot and dirty the header page.
    pub(crate) fn set_slot(&mut self, index: usize, slot: &DbSlot) -> Result<()> {
        let (mut io, _fl, header) = self.split_io();
        io.make_dirty(header)?;
        write_slot(header.borrow_mut().payload_mut(), index, slot);
        Ok(())
    }

    /// Find the slot index holding `name`.
    pub(crate) fn find_slot(&self, name: DbName) -> Option<usize> {
        let payload = self.header.borrow();
        let payload = payload.payload();
        (0..self.max_databases as usize).find(|&i| read_slot(payload, i).dbname == name)
    }

    /// Write every dirty page plus the header and sync the device. With a
    /// log, records a checkpoint afterwards.
    pub(crate) fn flush_all(&mut self) -> Result<()> {
        self.check_open()?;
        if self.flags.contains(EnvFlags::IN_MEMORY) {
            return Ok(());
        }
        if let Some(log) = &mut self.log {
            log.flush()?;
        }
        {
            let (mut io, _fl, header) = self.split_io();
            let dirty = io.cache.dirty_pages();
            for page in dirty {
                io.flush_page(&page)?;
            }
            let header = header.clone();
            io.flush_page(&header)?;
        }
        self.device.flush()?;
        if let Some(log) = &mut self.log {
            log.checkpoint()?;
        }
        Ok(())
    }
}

// ============================================================================
// Environment
// ============================================================================

/// An open environment.
pub struct Environment {
    pub(crate) inner: Rc<RefCell<EnvInner>>,
}

impl std::fmt::Debug for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Environment").finish_non_exhaustive()
    }
}

fn validate_create_params(params: &EnvParams) -> Result<()> {
    let ps = params.pagesize;
    if !ps.is_power_of_two() || ps % 512 != 0 || !(MIN_PAGESIZE..=MAX_PAGESIZE).contains(&ps) {
        return Err(Error::new(ErrorCode::InvalidPagesize));
    }
    if params.max_databases == 0 {
        return Err(Error::new(ErrorCode::InvalidParameter));
    }
    // The slot array and a usable freelist root must fit in the header
    // page payload.
    let payload = ps as usize - PAGE_HEADER_SIZE;
    let needed = freelist_offset(params.max_databases) + 512;
    if needed > payload {
        return Err(Error::with_message(
            ErrorCode::InvalidParameter,
            format!("{} databases do not fit a {} byte page", params.max_databases, ps),
        ));
    }
    Ok(())
}

impl Environment {
    /// Create a new environment file (or heap image with `IN_MEMORY`).
    pub fn create<P: AsRef<Path>>(
        path: P,
        flags: EnvFlags,
        params: &EnvParams,
    ) -> Result<Environment> {
        Self::create_with_filters(path, flags, params, FilterChain::new())
    }

    /// Create with a page filter chain installed from the start.
    pub fn create_with_filters<P: AsRef<Path>>(
        path: P,
        flags: EnvFlags,
        params: &EnvParams,
        filters: FilterChain,
    ) -> Result<Environment> {
        validate_create_params(params)?;
        let path = path.as_ref().to_path_buf();
        let in_memory = flags.contains(EnvFlags::IN_MEMORY);

        let mut device = device_create(params, flags)?;
        if !filters.is_empty() {
            device = Box::new(FilteredDevice::new(device, filters));
        }
        device.set_pagesize(params.pagesize);
        device.create(&path, flags, params.file_mode)?;
        device.alloc_page(params.pagesize)?;

        let serial = random_u32();
        let header = Rc::new(RefCell::new(Page::new(0, params.pagesize, PageType::Header)));
        write_header_fields(
            header.borrow_mut().payload_mut(),
            serial,
            params.pagesize,
            params.max_databases,
            flags,
            params.dam,
            params.file_mode,
        );

        let log = if flags.contains(EnvFlags::ENABLE_RECOVERY) && !in_memory {
            Some(Log::create(&path, params.file_mode)?)
        } else {
            None
        };

        let mut inner = EnvInner {
            device,
            cache: Cache::new(
                params.cache_pages(params.pagesize),
                flags.contains(EnvFlags::CACHE_STRICT),
                flags.contains(EnvFlags::CACHE_UNLIMITED),
            ),
            freelist: Freelist::new(
                freelist_offset(params.max_databases),
                params.dam.contains(Dam::ENFORCE_PRE110_FORMAT),
            ),
            log,
            header: header.clone(),
            pagesize: params.pagesize,
            flags,
            dam: params.dam,
            max_databases: params.max_databases,
            file_mode: params.file_mode,
            serial,
            path,
            next_txn_id: 1,
            active_txn: None,
            txn_dirty: Vec::new(),
            open_dbs: Vec::new(),
            closed: false,
        };

        {
            let (mut io, fl, header) = inner.split_io();
            fl.init_new(&mut io, header)?;
        }

        // Pre-extend the file when asked to.
        if params.initial_db_size > params.pagesize as u64 {
            let extra = params.initial_db_size.div_ceil(params.pagesize as u64)
                * params.pagesize as u64
                - params.pagesize as u64;
            let rid = inner.device.alloc(extra)?;
            let (mut io, fl, header) = inner.split_io();
            fl.mark_free(&mut io, header, rid, extra, false)?;
        }

        header.borrow_mut().set_dirty(crate::storage::page::DIRTY_NO_TXN);
        if !in_memory {
            let (mut io, _fl, header) = inner.split_io();
            let header = header.clone();
            io.flush_page(&header)?;
            inner.device.flush()?;
        }

        tracing::debug!(serial, pagesize = params.pagesize, "environment created");
        Ok(Environment {
            inner: Rc::new(RefCell::new(inner)),
        })
    }

    /// Open an existing environment file.
    pub fn open<P: AsRef<Path>>(
        path: P,
        flags: EnvFlags,
        params: &EnvParams,
    ) -> Result<Environment> {
        Self::open_with_filters(path, flags, params, FilterChain::new())
    }

    /// Open with a page filter chain installed before any page I/O.
    pub fn open_with_filters<P: AsRef<Path>>(
        path: P,
        flags: EnvFlags,
        params: &EnvParams,
        filters: FilterChain,
    ) -> Result<Environment> {
        if flags.contains(EnvFlags::IN_MEMORY) {
            return Err(Error::with_message(
                ErrorCode::InvalidParameter,
                "in-memory environments cannot be reopened",
            ));
        }
        let path = path.as_ref().to_path_buf();

        let mut device = device_create(params, flags)?;
        if !filters.is_empty() {
            device = Box::new(FilteredDevice::new(device, filters));
        }
        device.open(&path, flags)?;

        // The header prefix fits in the smallest legal page.
        let mut probe = vec![0u8; MIN_PAGESIZE as usize];
        device.read(0, &mut probe)?;
        let parsed = parse_header(&probe[PAGE_HEADER_SIZE..])?;
        device.set_pagesize(parsed.pagesize);

        // The persisted data-access-mode wins; callers may only repeat it.
        if !params.dam.is_empty() && !parsed.dam.is_empty() && params.dam != parsed.dam {
            return Err(Error::with_message(
                ErrorCode::InvalidParameter,
                "data-access-mode conflicts with the persisted value",
            ));
        }
        let dam = if parsed.dam.is_empty() {
            params.dam
        } else {
            parsed.dam
        };

        let persisted_flags = EnvFlags::from_bits_truncate(parsed.flags as u32);
        let flags = flags | (persisted_flags & EnvFlags::ENABLE_RECOVERY);

        // Recovery before anything touches the tree.
        let log = if flags.contains(EnvFlags::ENABLE_RECOVERY) {
            let (mut log, dirty) = Log::open(&path, parsed.file_mode)?;
            if dirty {
                if !flags.contains(EnvFlags::AUTO_RECOVERY) {
                    return Err(Error::new(ErrorCode::NeedRecovery));
                }
                tracing::warn!("log is unclean, recovering");
                log.recover(device.as_mut(), parsed.pagesize)?;
            }
            Some(log)
        } else {
            None
        };

        let data = device.read_page(0, parsed.pagesize)?;
        let header = Rc::new(RefCell::new(Page::from_bytes(0, data)));
        header.borrow().expect_type(PageType::Header)?;

        let mut inner = EnvInner {
            device,
            cache: Cache::new(
                params.cache_pages(parsed.pagesize),
                flags.contains(EnvFlags::CACHE_STRICT),
                flags.contains(EnvFlags::CACHE_UNLIMITED),
            ),
            freelist: Freelist::new(
                freelist_offset(parsed.max_databases),
                dam.contains(Dam::ENFORCE_PRE110_FORMAT),
            ),
            log,
            header,
            pagesize: parsed.pagesize,
            flags,
            dam,
            max_databases: parsed.max_databases,
            file_mode: parsed.file_mode,
            serial: parsed.serial,
            path,
            next_txn_id: 1,
            active_txn: None,
            txn_dirty: Vec::new(),
            open_dbs: Vec::new(),
            closed: false,
        };

        {
            let (mut io, fl, header) = inner.split_io();
            fl.load(&mut io, header)?;
        }

        tracing::debug!(serial = parsed.serial, "environment opened");
        Ok(Environment {
            inner: Rc::new(RefCell::new(inner)),
        })
    }

    /// Names of all databases registered in this environment.
    pub fn get_database_names(&self) -> Result<Vec<DbName>> {
        let inner = self.inner.borrow();
        inner.check_open()?;
        let payload = inner.header.borrow();
        let payload = payload.payload();
        let mut names = Vec::new();
        for i in 0..inner.max_databases as usize {
            let slot = read_slot(payload, i);
            if slot.dbname != 0 && slot.dbname < DBNAME_RESERVED_FIRST {
                names.push(slot.dbname);
            }
        }
        Ok(names)
    }

    /// Serial number stamped when the environment file was created.
    pub fn serial(&self) -> Result<u32> {
        let inner = self.inner.borrow();
        inner.check_open()?;
        Ok(inner.serial)
    }

    /// Environment parameters as currently effective.
    pub fn get_parameters(&self) -> Result<EnvParams> {
        let inner = self.inner.borrow();
        inner.check_open()?;
        Ok(EnvParams {
            pagesize: inner.pagesize,
            cachesize: 0,
            max_databases: inner.max_databases,
            dam: inner.dam,
            file_mode: inner.file_mode,
            initial_db_size: 0,
            custom_device: None,
        })
    }

    // ------------------------------------------------------------------
    // Transactions
    // ------------------------------------------------------------------

    /// Begin a transaction. Only one may be open at a time.
    pub fn txn_begin(&self, name: Option<&str>, flags: TxnFlags) -> Result<Transaction> {
        let mut inner = self.inner.borrow_mut();
        inner.check_writable()?;
        if !inner.flags.contains(EnvFlags::ENABLE_TRANSACTIONS) {
            return Err(Error::with_message(
                ErrorCode::InvalidParameter,
                "environment was opened without transaction support",
            ));
        }
        if inner.active_txn.is_some() {
            return Err(Error::new(ErrorCode::WouldBlock));
        }

        let id = inner.next_txn_id;
        inner.next_txn_id += 1;
        if let Some(log) = &mut inner.log {
            log.append_txn_begin(id)?;
        }
        inner.active_txn = Some(id);
        inner.txn_dirty.clear();
        tracing::debug!(id, "transaction begun");
        Ok(Transaction::new(id, name.map(str::to_owned), flags))
    }

    /// Commit a transaction: apply its ops to the B+trees, make the pages
    /// durable, then append the commit marker. On `CursorStillOpen` the
    /// transaction stays intact; close the cursors and retry.
    pub fn txn_commit(&self, txn: &mut Transaction, flags: TxnFlags) -> Result<()> {
        {
            let inner = self.inner.borrow();
            inner.check_open()?;
            if inner.active_txn != Some(txn.id()) {
                return Err(Error::new(ErrorCode::InvalidParameter));
            }
        }
        if txn.open_cursor_count() > 0 {
            return Err(Error::new(ErrorCode::CursorStillOpen));
        }

        // Apply ops db by db, in key order, in issue order per key.
        for (dbname, tree) in txn.take_trees() {
            let db_state = {
                let inner = self.inner.borrow();
                inner
                    .open_dbs
                    .iter()
                    .find(|(name, _)| *name == dbname)
                    .and_then(|(_, weak)| weak.upgrade())
                    .ok_or_else(|| {
                        Error::with_message(
                            ErrorCode::InternalError,
                            format!("database {} closed with pending operations", dbname),
                        )
                    })?
            };
            for (key, node) in tree.iter() {
                for op in &node.ops {
                    db::apply_txn_op(&self.inner, &db_state, &key.bytes, op)?;
                }
            }
            db::persist_db_state(&self.inner, &db_state)?;
        }

        let mut inner = self.inner.borrow_mut();
        let write_through = flags.contains(TxnFlags::WRITE_THROUGH)
            || txn.flags().contains(TxnFlags::WRITE_THROUGH)
            || inner.flags.contains(EnvFlags::WRITE_THROUGH);

        // Ordering: before-images durable, then the pages themselves, then
        // the commit marker.
        if inner.log.is_some() {
            if let Some(log) = &mut inner.log {
                log.flush()?;
            }
            let dirty = std::mem::take(&mut inner.txn_dirty);
            {
                let (mut io, _fl, header) = inner.split_io();
                let header = header.clone();
                for address in &dirty {
                    if let Some(page) = io.cache.get(*address) {
                        io.flush_page(&page)?;
                    }
                }
                io.flush_page(&header)?;
            }
            inner.device.flush()?;
        }

        if let Some(log) = &mut inner.log {
            log.append_txn_commit(txn.id())?;
            if write_through {
                log.flush()?;
            }
        }
        inner.active_txn = None;
        inner.txn_dirty.clear();
        tracing::debug!(id = txn.id(), "transaction committed");
        Ok(())
    }

    /// Abort a transaction, discarding its buffered ops.
    pub fn txn_abort(&self, txn: &mut Transaction) -> Result<()> {
        let mut inner = self.inner.borrow_mut();
        inner.check_open()?;
        if inner.active_txn != Some(txn.id()) {
            return Err(Error::new(ErrorCode::InvalidParameter));
        }
        txn.take_trees();
        if let Some(log) = &mut inner.log {
            log.append_txn_abort(txn.id())?;
        }
        inner.active_txn = None;
        inner.txn_dirty.clear();
        tracing::debug!(id = txn.id(), "transaction aborted");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Flush and close
    // ------------------------------------------------------------------

    /// Flush the log, every dirty page and the device.
    pub fn flush(&self) -> Result<()> {
        // Persist open databases' slots first.
        let dbs: Vec<Rc<RefCell<DbState>>> = {
            let inner = self.inner.borrow();
            inner.check_open()?;
            inner
                .open_dbs
                .iter()
                .filter_map(|(_, weak)| weak.upgrade())
                .collect()
        };
        for db in &dbs {
            db::persist_db_state(&self.inner, db)?;
        }
        self.inner.borrow_mut().flush_all()
    }

    /// Close the environment. An active transaction is aborted; everything
    /// dirty is flushed; the log is emptied.
    pub fn close(self) -> Result<()> {
        self.close_impl()
    }

    /// Tear down without flushing anything, leaving the file and the log
    /// exactly as a crash would. Test support for the recovery path.
    #[doc(hidden)]
    pub fn simulate_crash(self) -> Result<()> {
        let mut inner = self.inner.borrow_mut();
        inner.cache.clear();
        inner.active_txn = None;
        inner.txn_dirty.clear();
        inner.device.close()?;
        inner.closed = true;
        Ok(())
    }

    fn close_impl(&self) -> Result<()> {
        {
            let inner = self.inner.borrow();
            if inner.closed {
                return Ok(());
            }
        }

        // Auto-abort a transaction the caller left open.
        {
            let mut inner = self.inner.borrow_mut();
            if let Some(id) = inner.active_txn.take() {
                tracing::warn!(id, "aborting transaction left open at close");
                if let Some(log) = &mut inner.log {
                    log.append_txn_abort(id)?;
                }
                inner.txn_dirty.clear();
            }
        }

        self.flush()?;

        let mut inner = self.inner.borrow_mut();
        if let Some(log) = &mut inner.log {
            // A clean close leaves nothing to recover.
            log.clear()?;
        }
        inner.cache.clear();
        inner.device.close()?;
        inner.closed = true;
        tracing::debug!(path = %inner.path.display(), "environment closed");
        Ok(())
    }
}

impl Drop for Environment {
    fn drop(&mut self) {
        let _ = self.close_impl();
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_env_path() -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.db");
        (dir, path)
    }

    #[test]
    fn test_create_close_open_cycle() {
        let (_dir, path) = temp_env_path();
        let params = EnvParams::default();

        let env = Environment::create(&path, EnvFlags::empty(), &params).unwrap();
        env.close().unwrap();

        let env = Environment::open(&path, EnvFlags::empty(), &params).unwrap();
        assert_eq!(env.get_database_names().unwrap(), vec![]);
        env.close().unwrap();
    }

    #[test]
    fn test_open_missing_file_fails() {
        let (_dir, path) = temp_env_path();
        let err = Environment::open(&path, EnvFlags::empty(), &EnvParams::default()).unwrap_err();
        assert_eq!(err.code(), ErrorCode::FileNotFound);
    }

    #[test]
    fn test_open_garbage_fails_with_header_error() {
        let (_dir, path) = temp_env_path();
        std::fs::write(&path, vec![0u8; 8192]).unwrap();
        let err = Environment::open(&path, EnvFlags::empty(), &EnvParams::default()).unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidFileHeader);
    }

    #[test]
    fn test_bad_pagesize_rejected() {
        let (_dir, path) = temp_env_path();
        let mut params = EnvParams::default();
        params.pagesize = 3000;
        let err = Environment::create(&path, EnvFlags::empty(), &params).unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidPagesize);
    }

    #[test]
    fn test_single_transaction_limit() {
        let (_dir, path) = temp_env_path();
        let env = Environment::create(
            &path,
            EnvFlags::ENABLE_TRANSACTIONS,
            &EnvParams::default(),
        )
        .unwrap();

        let mut txn = env.txn_begin(None, TxnFlags::empty()).unwrap();
        let err = env.txn_begin(None, TxnFlags::empty()).unwrap_err();
        assert_eq!(err.code(), ErrorCode::WouldBlock);

        env.txn_abort(&mut txn).unwrap();
        let mut txn = env.txn_begin(None, TxnFlags::empty()).unwrap();
        env.txn_commit(&mut txn, TxnFlags::empty()).unwrap();
    }

    #[test]
    fn test_in_memory_env() {
        let env = Environment::create(
            "ignored",
            EnvFlags::IN_MEMORY,
            &EnvParams::default(),
        )
        .unwrap();
        env.close().unwrap();
    }

    #[test]
    fn test_dam_conflict_rejected() {
        let (_dir, path) = temp_env_path();
        let mut params = EnvParams::default();
        params.dam = Dam::SEQUENTIAL_INSERT;
        Environment::create(&path, EnvFlags::empty(), &params)
            .unwrap()
            .close()
            .unwrap();

        let mut conflicting = EnvParams::default();
        conflicting.dam = Dam::RANDOM_WRITE;
        let err = Environment::open(&path, EnvFlags::empty(), &conflicting).unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidParameter);

        // Repeating the persisted mode is fine.
        let mut matching = EnvParams::default();
        matching.dam = Dam::SEQUENTIAL_INSERT;
        Environment::open(&path, EnvFlags::empty(), &matching)
            .unwrap()
            .close()
            .unwrap();
    }
}
