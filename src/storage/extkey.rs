//! Extended keys.
//!
//! Keys longer than the node's inline slot store their full bytes in an
//! *extkey blob*; the last 8 bytes of the inline slot hold the blob rid.
//! Comparisons materialize the full key, so every database keeps a small
//! LRU cache of recently loaded extended keys.

use std::collections::{HashMap, VecDeque};

use crate::error::Result;
use crate::types::{Record, Rid};

use super::blob;
use super::freelist::{AllocHints, Freelist};
use super::page::{PageRef, PageType};
use super::PageIo;

/// Default number of cached extended keys per database.
const DEFAULT_CACHE_CAPACITY: usize = 128;

/// Per-database extended-key store.
pub struct ExtKeyCache {
    map: HashMap<Rid, Vec<u8>>,
    lru: VecDeque<Rid>,
    capacity: usize,
}

impl Default for ExtKeyCache {
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_CAPACITY)
    }
}

impl ExtKeyCache {
    /// Cache bounded to `capacity` keys.
    pub fn new(capacity: usize) -> Self {
        Self {
            map: HashMap::new(),
            lru: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    fn touch(&mut self, rid: Rid) {
        if let Some(pos) = self.lru.iter().position(|&r| r == rid) {
            self.lru.remove(pos);
        }
        self.lru.push_back(rid);
    }

    fn put(&mut self, rid: Rid, key: Vec<u8>) {
        self.map.insert(rid, key);
        self.touch(rid);
        while self.map.len() > self.capacity {
            if let Some(old) = self.lru.pop_front() {
                self.map.remove(&old);
            }
        }
    }

    /// Materialize the full key stored at `rid`.
    pub fn fetch(&mut self, io: &mut PageIo<'_>, rid: Rid) -> Result<Vec<u8>> {
        if let Some(key) = self.map.get(&rid) {
            let key = key.clone();
            self.touch(rid);
            return Ok(key);
        }
        let record = blob::read(io, &blob::rid_bytes(rid), 0, None)?;
        self.put(rid, record.data.clone());
        Ok(record.data)
    }

    /// Store a full key as an extkey blob, returning its rid.
    pub fn store(
        &mut self,
        io: &mut PageIo<'_>,
        fl: &mut Freelist,
        header: &PageRef,
        key: &[u8],
        hints: &AllocHints,
    ) -> Result<Rid> {
        let (rid, _) = blob::allocate(
            io,
            fl,
            header,
            &Record::new(key),
            crate::types::InsertFlags::empty(),
            PageType::Extkey,
            hints,
        )?;
        let rid = blob::rid_value(&rid);
        self.put(rid, key.to_vec());
        Ok(rid)
    }

    /// Release an extkey blob and forget the cached copy.
    pub fn free(
        &mut self,
        io: &mut PageIo<'_>,
        fl: &mut Freelist,
        header: &PageRef,
        rid: Rid,
    ) -> Result<()> {
        self.map.remove(&rid);
        if let Some(pos) = self.lru.iter().position(|&r| r == rid) {
            self.lru.remove(pos);
        }
        blob::free(io, fl, header, &blob::rid_bytes(rid), 0)
    }

    /// Drop every cached key.
    pub fn purge(&mut self) {
        self.map.clear();
        self.lru.clear();
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{Device, InMemoryDevice};
    use crate::storage::cache::Cache;
    use crate::storage::page::Page;
    use crate::types::EnvFlags;
    use std::cell::RefCell;
    use std::path::PathBuf;
    use std::rc::Rc;

    const PAGESIZE: u32 = 1024;

    struct Fixture {
        device: Box<dyn Device>,
        cache: Cache,
        dirty: Vec<Rid>,
        header: PageRef,
        fl: Freelist,
    }

    impl Fixture {
        fn new() -> Self {
            let mut dev = InMemoryDevice::new(PAGESIZE, EnvFlags::IN_MEMORY);
            dev.create(&PathBuf::from(":memory:"), EnvFlags::IN_MEMORY, 0)
                .unwrap();
            dev.alloc_page(PAGESIZE).unwrap();
            let header = Rc::new(RefCell::new(Page::new(0, PAGESIZE, PageType::Header)));
            let mut fx = Self {
                device: Box::new(dev),
                cache: Cache::new(64, false, false),
                dirty: Vec::new(),
                header,
                fl: Freelist::new(64, false),
            };
            let header = fx.header.clone();
            let (mut io, fl) = fx.split();
            fl.init_new(&mut io, &header).unwrap();
            fx
        }

        fn split(&mut self) -> (PageIo<'_>, &mut Freelist) {
            (
                PageIo {
                    device: self.device.as_mut(),
                    cache: &mut self.cache,
                    log: None,
                    txn_id: None,
                    txn_dirty: &mut self.dirty,
                    pagesize: PAGESIZE,
                },
                &mut self.fl,
            )
        }
    }

    #[test]
    fn test_store_and_fetch() {
        let mut fx = Fixture::new();
        let header = fx.header.clone();
        let (mut io, fl) = fx.split();
        let mut cache = ExtKeyCache::default();

        let key = vec![0x5Au8; 200];
        let rid = cache
            .store(&mut io, fl, &header, &key, &AllocHints::default())
            .unwrap();
        assert_ne!(rid, 0);
        assert_eq!(cache.fetch(&mut io, rid).unwrap(), key);

        // A cold cache must still find the key on disk.
        let mut cold = ExtKeyCache::default();
        assert_eq!(cold.fetch(&mut io, rid).unwrap(), key);
    }

    #[test]
    fn test_lru_eviction() {
        let mut fx = Fixture::new();
        let header = fx.header.clone();
        let (mut io, fl) = fx.split();
        let mut cache = ExtKeyCache::new(2);

        let r1 = cache.store(&mut io, fl, &header, &[1u8; 64], &AllocHints::default()).unwrap();
        let r2 = cache.store(&mut io, fl, &header, &[2u8; 64], &AllocHints::default()).unwrap();
        let r3 = cache.store(&mut io, fl, &header, &[3u8; 64], &AllocHints::default()).unwrap();

        assert_eq!(cache.map.len(), 2);
        assert!(!cache.map.contains_key(&r1));
        // Evicted keys reload from disk transparently.
        assert_eq!(cache.fetch(&mut io, r1).unwrap(), vec![1u8; 64]);
        let _ = (r2, r3);
    }

    #[test]
    fn test_free_forgets_key() {
        let mut fx = Fixture::new();
        let header = fx.header.clone();
        let (mut io, fl) = fx.split();
        let mut cache = ExtKeyCache::default();

        let rid = cache.store(&mut io, fl, &header, &[9u8; 100], &AllocHints::default()).unwrap();
        cache.free(&mut io, fl, &header, rid).unwrap();
        assert!(cache.map.is_empty());
        assert!(cache.fetch(&mut io, rid).is_err());
    }
}
