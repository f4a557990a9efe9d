//! Bounded page cache.
//!
//! Pages are kept in a map keyed by page address. Each page carries an
//! insertion counter and a hit frequency; eviction picks the unpinned,
//! clean page minimizing `counter - k * hits` where `k` depends on the page
//! type, so frequently reused index pages outlive a one-shot sequential
//! scan. A page is pinned while any [`PageRef`] besides the cache's own
//! exists.

use std::collections::HashMap;
use std::rc::Rc;

use crate::error::{Error, ErrorCode, Result};
use crate::types::Rid;

use super::page::{PageRef, PageType};

// ============================================================================
// Cache
// ============================================================================

/// Bounded in-memory set of pages.
pub struct Cache {
    capacity: usize,
    strict: bool,
    unlimited: bool,
    counter: u64,
    map: HashMap<Rid, PageRef>,
}

/// Eviction weight of the hit frequency, per page type. Index pages are
/// the expensive ones to refetch.
fn frequency_weight(ptype: Option<PageType>) -> u64 {
    match ptype {
        Some(PageType::BtreeRoot) => 64,
        Some(PageType::BtreeIndex) => 16,
        Some(PageType::Freelist) => 16,
        Some(PageType::Header) => 64,
        _ => 4,
    }
}

impl Cache {
    /// Create a cache bounded to `capacity` pages.
    pub fn new(capacity: usize, strict: bool, unlimited: bool) -> Self {
        Self {
            capacity: capacity.max(1),
            strict,
            unlimited,
            counter: 0,
            map: HashMap::new(),
        }
    }

    /// Number of cached pages.
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// True when nothing is cached.
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Look up a page, bumping its hit frequency.
    pub fn get(&mut self, address: Rid) -> Option<PageRef> {
        let page = self.map.get(&address)?.clone();
        page.borrow_mut().cache_hits += 1;
        Some(page)
    }

    /// Insert a page, evicting if the cache is over its limit. Strict mode
    /// fails with `CacheFull` when every page is pinned or dirty.
    pub fn insert(&mut self, page: PageRef) -> Result<()> {
        self.counter += 1;
        {
            let mut p = page.borrow_mut();
            p.cache_counter = self.counter;
        }
        let address = page.borrow().address();
        self.map.insert(address, page);

        if self.unlimited {
            return Ok(());
        }
        while self.map.len() > self.capacity {
            if !self.evict_one() {
                if self.strict {
                    return Err(Error::new(ErrorCode::CacheFull));
                }
                // Unpinned clean pages ran out; allow growth until the
                // next flush makes some evictable again.
                tracing::trace!(len = self.map.len(), "cache growing past its limit");
                break;
            }
        }
        Ok(())
    }

    /// Drop a page from the cache, returning the handle if it was cached.
    pub fn remove(&mut self, address: Rid) -> Option<PageRef> {
        self.map.remove(&address)
    }

    /// Evict the lowest-scoring unpinned clean page. Returns false when no
    /// page qualifies.
    fn evict_one(&mut self) -> bool {
        let mut victim: Option<(Rid, u64)> = None;
        for (addr, page) in self.map.iter() {
            // The map itself holds one reference; more means pinned.
            if Rc::strong_count(page) > 1 {
                continue;
            }
            let p = page.borrow();
            if p.is_dirty() {
                continue;
            }
            let weight = frequency_weight(p.ptype());
            let score = p.cache_counter.saturating_sub(weight.saturating_mul(p.cache_hits));
            if victim.map_or(true, |(_, best)| score < best) {
                victim = Some((*addr, score));
            }
        }
        match victim {
            Some((addr, _)) => {
                tracing::trace!(address = addr, "evicting page");
                self.map.remove(&addr);
                true
            }
            None => false,
        }
    }

    /// All currently dirty pages, in no particular order.
    pub fn dirty_pages(&self) -> Vec<PageRef> {
        self.map
            .values()
            .filter(|p| p.borrow().is_dirty())
            .cloned()
            .collect()
    }

    /// All cached pages, for close-time teardown.
    pub fn all_pages(&self) -> Vec<PageRef> {
        self.map.values().cloned().collect()
    }

    /// Drop every cached page.
    pub fn clear(&mut self) {
        self.map.clear();
    }
}

// ============================================================================
// Tests
// ============================================================================
