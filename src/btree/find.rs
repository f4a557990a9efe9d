//! Lookup: exact search and approximate matching.
//!
//! A miss with LT/GT/LEQ/GEQ/NEAR flags turns into a neighbour lookup: the
//! search lands on the greatest slot below the key, steps left or right per
//! the requested direction, and escapes through the leaf sibling links when
//! the step falls off the node. NEAR prefers the less-than neighbour and
//! only falls back to greater-than at the lower edge of the key space.

use crate::error::{Error, ErrorCode, Result};
use crate::storage::page::PageRef;
use crate::types::{ApproxFlags, FindFlags, Record};

use super::node;
use super::TreeOp;

/// Position a lookup resolved to.
pub struct FoundSlot {
    /// Leaf page holding the key.
    pub page: PageRef,
    /// Slot within the leaf.
    pub slot: usize,
    /// Which side of the search key the returned key is on.
    pub approx: ApproxFlags,
}

impl TreeOp<'_> {
    /// First or last slot of the neighbouring leaf, `None` at the edge.
    fn leaf_neighbor(&mut self, page: &PageRef, toward_left: bool) -> Result<Option<(PageRef, usize)>> {
        let sibling = {
            let p = page.borrow();
            if toward_left {
                node::node_left_sibling(p.payload())
            } else {
                node::node_right_sibling(p.payload())
            }
        };
        if sibling == 0 {
            return Ok(None);
        }
        let neighbor = self.fetch_node(sibling)?;
        let count = {
            let p = neighbor.borrow();
            node::node_count(p.payload())
        };
        if count == 0 {
            return Ok(None);
        }
        let slot = if toward_left { count - 1 } else { 0 };
        Ok(Some((neighbor, slot)))
    }

    /// Resolve `key` to a leaf slot, honoring approximate-match flags.
    pub fn locate(&mut self, key: &[u8], flags: FindFlags) -> Result<Option<FoundSlot>> {
        let (leaf, _path) = self.descend_to_leaf(key)?;
        let count = {
            let p = leaf.borrow();
            node::node_count(p.payload())
        };
        if count == 0 {
            // Only an empty root leaf has no keys at all.
            return Ok(None);
        }

        let (slot, ord) = self.node_search(&leaf, key)?;

        if ord == std::cmp::Ordering::Equal && slot >= 0 {
            let slot = slot as usize;
            if !flags.is_approximate() || flags.contains(FindFlags::EXACT_MATCH) {
                return Ok(Some(FoundSlot {
                    page: leaf,
                    slot,
                    approx: ApproxFlags::empty(),
                }));
            }
            // Exact hit, but only a strict neighbour was asked for.
            if flags.contains(FindFlags::LT_MATCH) {
                if slot > 0 {
                    return Ok(Some(FoundSlot {
                        page: leaf,
                        slot: slot - 1,
                        approx: ApproxFlags::LT,
                    }));
                }
                if let Some((page, slot)) = self.leaf_neighbor(&leaf, true)? {
                    return Ok(Some(FoundSlot {
                        page,
                        slot,
                        approx: ApproxFlags::LT,
                    }));
                }
            }
            if flags.contains(FindFlags::GT_MATCH) {
                if slot + 1 < count {
                    return Ok(Some(FoundSlot {
                        page: leaf,
                        slot: slot + 1,
                        approx: ApproxFlags::GT,
                    }));
                }
                if let Some((page, slot)) = self.leaf_neighbor(&leaf, false)? {
                    return Ok(Some(FoundSlot {
                        page,
                        slot,
                        approx: ApproxFlags::GT,
                    }));
                }
            }
            return Ok(None);
        }

        // Miss: `slot` is the greatest key below the search key, -1 when
        // the whole node sorts above it.
        if !flags.is_approximate() {
            return Ok(None);
        }

        if flags.contains(FindFlags::LT_MATCH) {
            if slot >= 0 {
                return Ok(Some(FoundSlot {
                    page: leaf,
                    slot: slot as usize,
                    approx: ApproxFlags::LT,
                }));
            }
            if let Some((page, slot)) = self.leaf_neighbor(&leaf, true)? {
                return Ok(Some(FoundSlot {
                    page,
                    slot,
                    approx: ApproxFlags::LT,
                }));
            }
            // No smaller key exists anywhere; NEAR falls through to GT.
        }

        if flags.contains(FindFlags::GT_MATCH) {
            let ip = (slot + 1) as usize;
            if ip < count {
                return Ok(Some(FoundSlot {
                    page: leaf,
                    slot: ip,
                    approx: ApproxFlags::GT,
                }));
            }
            if let Some((page, slot)) = self.leaf_neighbor(&leaf, false)? {
                return Ok(Some(FoundSlot {
                    page,
                    slot,
                    approx: ApproxFlags::GT,
                }));
            }
        }

        Ok(None)
    }

    /// Full lookup: returns the record, the approximate-match direction,
    /// and the matched key bytes when they differ from the search key.
    pub fn find(
        &mut self,
        key: &[u8],
        flags: FindFlags,
        partial: Option<(u32, u32)>,
    ) -> Result<(Option<Vec<u8>>, ApproxFlags, Record)> {
        let found = self
            .locate(key, flags)?
            .ok_or_else(|| Error::new(ErrorCode::KeyNotFound))?;
        let matched_key = if found.approx.is_empty() {
            None
        } else {
            Some(self.full_key(&found.page, found.slot)?)
        };
        let record = self.read_record_at(&found.page, found.slot, 0, partial)?;
        Ok((matched_key, found.approx, record))
    }

    /// Count the keys of the whole tree by walking the leaf level.
    /// `distinct` counts duplicate groups once.
    pub fn count_keys(&mut self, distinct: bool) -> Result<u64> {
        let mut total = 0u64;
        let mut page = self.edge_leaf(false)?;
        loop {
            let (count, next) = {
                let p = page.borrow();
                (
                    node::node_count(p.payload()),
                    node::node_right_sibling(p.payload()),
                )
            };
            if distinct {
                total += count as u64;
            } else {
                for slot in 0..count {
                    total += self.record_count_at(&page, slot)? as u64;
                }
            }
            if next == 0 {
                return Ok(total);
            }
            page = self.fetch_node(next)?;
        }
    }
}
