//! Paged storage: pages, the bounded page cache, the freelist, the blob
//! store and the extended-key store.
//!
//! [`PageIo`] is the per-call context the storage and index layers work
//! through: it bundles the device, the cache, the log and the identity of
//! the active transaction, so that every page mutation goes through one
//! place that knows when a before-image must be written.

pub mod blob;
pub mod cache;
pub mod extkey;
pub mod freelist;
pub mod page;

use crate::device::Device;
use crate::error::{Error, ErrorCode, Result};
use crate::log::Log;
use crate::types::{Rid, TxnId};

use cache::Cache;
use page::{Page, PageRef, PageType, DIRTY_NO_TXN};

use std::cell::RefCell;
use std::rc::Rc;

// ============================================================================
// PageIo
// ============================================================================

/// Borrowed view of the environment's page machinery for one operation.
pub struct PageIo<'a> {
    /// The backing device.
    pub device: &'a mut dyn Device,
    /// The page cache.
    pub cache: &'a mut Cache,
    /// The write-ahead log, when recovery is enabled.
    pub log: Option<&'a mut Log>,
    /// Id of the transaction this operation runs under.
    pub txn_id: Option<TxnId>,
    /// Pages dirtied by the active transaction, in dirtying order.
    pub txn_dirty: &'a mut Vec<Rid>,
    /// Page size of the environment.
    pub pagesize: u32,
}

impl PageIo<'_> {
    /// Fetch a page, from the cache or the device.
    pub fn fetch(&mut self, address: Rid) -> Result<PageRef> {
        if let Some(page) = self.cache.get(address) {
            return Ok(page);
        }
        let data = self.device.read_page(address, self.pagesize)?;
        let page = Rc::new(RefCell::new(Page::from_bytes(address, data)));
        self.cache.insert(page.clone())?;
        Ok(page)
    }

    /// Fetch a page and require its type.
    pub fn fetch_typed(&mut self, address: Rid, ptype: PageType) -> Result<PageRef> {
        let page = self.fetch(address)?;
        page.borrow().expect_type(ptype)?;
        Ok(page)
    }

    /// Extend the file by one page and hand back the fresh, typed page.
    /// This bypasses the freelist; callers that can reuse space go through
    /// [`freelist::Freelist::alloc_page`] first.
    pub fn alloc_page_raw(&mut self, ptype: PageType) -> Result<PageRef> {
        let address = self.device.alloc_page(self.pagesize)?;
        let page = Rc::new(RefCell::new(Page::new(address, self.pagesize, ptype)));
        self.cache.insert(page.clone())?;
        self.make_dirty(&page)?;
        Ok(page)
    }

    /// Mark a page dirty, writing a before-image to the log the first time
    /// the active transaction touches it.
    pub fn make_dirty(&mut self, page: &PageRef) -> Result<()> {
        let mut p = page.borrow_mut();
        match self.txn_id {
            Some(txn_id) => {
                if p.dirty_txn() != Some(txn_id) {
                    if let Some(log) = self.log.as_mut() {
                        let lsn = log.append_before_image(txn_id, p.address(), p.raw())?;
                        p.set_before_img_lsn(lsn);
                    }
                    p.set_dirty(txn_id);
                    if !self.txn_dirty.contains(&p.address()) {
                        self.txn_dirty.push(p.address());
                    }
                }
            }
            None => p.set_dirty(DIRTY_NO_TXN),
        }
        Ok(())
    }

    /// Write a page through the device if it is dirty.
    pub fn flush_page(&mut self, page: &PageRef) -> Result<()> {
        let mut p = page.borrow_mut();
        if !p.is_dirty() {
            return Ok(());
        }
        self.device.write_page(p.address(), p.raw())?;
        p.set_clean();
        Ok(())
    }

    /// Drop any cached copy of a page whose space was just freed. The
    /// caller may still hold a handle; it goes stale harmlessly.
    pub fn forget_page(&mut self, address: Rid) {
        self.cache.remove(address);
    }

    /// Drop a page from the cache after its space was returned to the
    /// freelist. Fails if somebody still holds a reference to it.
    pub fn discard_page(&mut self, address: Rid) -> Result<()> {
        if let Some(page) = self.cache.remove(address) {
            if Rc::strong_count(&page) > 1 {
                self.cache.insert(page)?;
                return Err(Error::with_message(
                    ErrorCode::InternalError,
                    format!("page {:#x} freed while still referenced", address),
                ));
            }
        }
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================
