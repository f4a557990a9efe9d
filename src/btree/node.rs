//! B+tree node layout.
//!
//! A node is the payload of a B+tree page: a 32-byte header, an optional
//! fast-index array, and `max_keys` fixed-width key records. The fast index
//! maps logical slot to physical record position so that inserting or
//! erasing in the middle moves one `u16` per key instead of a whole key
//! record; without it, records are stored in logical order directly.
//!
//! Key record: `rid[8] | keysize:u16 | flags:u8 | inline[keysize]`. For
//! extended keys the last 8 inline bytes hold the extkey blob rid.

use byteorder::{ByteOrder, LittleEndian};

use crate::types::Rid;

// ============================================================================
// Constants
// ============================================================================

/// Node header: ptr_left(8) + count(2) + flags(2) + reserved(4) +
/// left_sibling(8) + right_sibling(8).
pub const NODE_HEADER_SIZE: usize = 32;

/// Fixed part of a key record before the inline bytes.
pub const KEY_RECORD_FIXED_SIZE: usize = 11;

/// Node flag bit: this node is a leaf.
pub const NODE_FLAG_LEAF: u16 = 0x0001;

/// Key flag: inline record of up to 7 bytes (same bit as the blob store).
pub const KEY_FLAG_TINY: u8 = 0x01;
/// Key flag: inline record of exactly 8 bytes.
pub const KEY_FLAG_SMALL: u8 = 0x02;
/// Key flag: zero-byte record.
pub const KEY_FLAG_EMPTY: u8 = 0x04;
/// Key flag: key bytes continue in an extkey blob.
pub const KEY_FLAG_EXTENDED: u8 = 0x08;
/// Key flag: the rid points to a duplicate table.
pub const KEY_FLAG_HAS_DUPLICATES: u8 = 0x10;

// ============================================================================
// Layout
// ============================================================================

/// Geometry of every node in one B+tree.
#[derive(Debug, Clone, Copy)]
pub struct NodeLayout {
    /// Inline key slot width in bytes.
    pub keysize: u16,
    /// Keys per node.
    pub max_keys: u16,
    /// Whether nodes carry the fast-index array.
    pub fast_index: bool,
}

impl NodeLayout {
    /// Bytes of one key record.
    pub fn key_record_size(&self) -> usize {
        KEY_RECORD_FIXED_SIZE + self.keysize as usize
    }

    /// Bytes of the fast-index array.
    pub fn fast_index_size(&self) -> usize {
        if self.fast_index {
            self.max_keys as usize * 2
        } else {
            0
        }
    }

    /// Compute how many keys fit into a page payload of `payload_size`
    /// bytes with the given key slot width.
    pub fn compute_max_keys(payload_size: usize, keysize: u16, fast_index: bool) -> u16 {
        let avail = payload_size.saturating_sub(NODE_HEADER_SIZE);
        let per_key = KEY_RECORD_FIXED_SIZE + keysize as usize + if fast_index { 2 } else { 0 };
        let max = avail / per_key;
        max.min(u16::MAX as usize) as u16
    }

    /// Smallest legal fill of a non-root node.
    pub fn min_keys(&self) -> usize {
        (self.max_keys as usize).div_ceil(2)
    }

    fn records_offset(&self) -> usize {
        NODE_HEADER_SIZE + self.fast_index_size()
    }

    fn record_offset(&self, phys: usize) -> usize {
        self.records_offset() + phys * self.key_record_size()
    }
}

// ============================================================================
// Header Accessors
// ============================================================================

/// Initialize an empty node in `payload`.
pub fn node_init(payload: &mut [u8], leaf: bool) {
    payload[..NODE_HEADER_SIZE].fill(0);
    set_node_flags(payload, if leaf { NODE_FLAG_LEAF } else { 0 });
}

/// Number of keys in the node.
pub fn node_count(payload: &[u8]) -> usize {
    LittleEndian::read_u16(&payload[8..10]) as usize
}

fn set_node_count(payload: &mut [u8], count: usize) {
    LittleEndian::write_u16(&mut payload[8..10], count as u16);
}

/// Node flags word.
pub fn node_flags(payload: &[u8]) -> u16 {
    LittleEndian::read_u16(&payload[10..12])
}

fn set_node_flags(payload: &mut [u8], flags: u16) {
    LittleEndian::write_u16(&mut payload[10..12], flags);
}

/// True for leaf nodes.
pub fn node_is_leaf(payload: &[u8]) -> bool {
    node_flags(payload) & NODE_FLAG_LEAF != 0
}

/// Leftmost child of an internal node.
pub fn node_ptr_left(payload: &[u8]) -> Rid {
    LittleEndian::read_u64(&payload[0..8])
}

/// Set the leftmost child.
pub fn set_node_ptr_left(payload: &mut [u8], rid: Rid) {
    LittleEndian::write_u64(&mut payload[0..8], rid);
}

/// Left sibling at the same level, 0 at the edge.
pub fn node_left_sibling(payload: &[u8]) -> Rid {
    LittleEndian::read_u64(&payload[16..24])
}

/// Set the left sibling link.
pub fn set_node_left_sibling(payload: &mut [u8], rid: Rid) {
    LittleEndian::write_u64(&mut payload[16..24], rid);
}

/// Right sibling at the same level, 0 at the edge.
pub fn node_right_sibling(payload: &[u8]) -> Rid {
    LittleEndian::read_u64(&payload[24..32])
}

/// Set the right sibling link.
pub fn set_node_right_sibling(payload: &mut [u8], rid: Rid) {
    LittleEndian::write_u64(&mut payload[24..32], rid);
}

// ============================================================================
// Slot Indirection
// ============================================================================

fn fast_index_get(payload: &[u8], slot: usize) -> usize {
    LittleEndian::read_u16(&payload[NODE_HEADER_SIZE + slot * 2..]) as usize
}

fn fast_index_set(payload: &mut [u8], slot: usize, phys: usize) {
    LittleEndian::write_u16(&mut payload[NODE_HEADER_SIZE + slot * 2..], phys as u16);
}

/// Physical record position of a logical slot.
fn phys_of(payload: &[u8], layout: &NodeLayout, slot: usize) -> usize {
    if layout.fast_index {
        fast_index_get(payload, slot)
    } else {
        slot
    }
}

// ============================================================================
// Key Record Accessors
// ============================================================================

/// The 8 rid bytes of a key record.
pub fn key_rid(payload: &[u8], layout: &NodeLayout, slot: usize) -> [u8; 8] {
    let off = layout.record_offset(phys_of(payload, layout, slot));
    let mut rid = [0u8; 8];
    rid.copy_from_slice(&payload[off..off + 8]);
    rid
}

/// Replace the rid bytes of a key record.
pub fn set_key_rid(payload: &mut [u8], layout: &NodeLayout, slot: usize, rid: &[u8; 8]) {
    let off = layout.record_offset(phys_of(payload, layout, slot));
    payload[off..off + 8].copy_from_slice(rid);
}

/// The rid of a key record as a u64 (child pointer or blob address).
pub fn key_rid_value(payload: &[u8], layout: &NodeLayout, slot: usize) -> Rid {
    LittleEndian::read_u64(&key_rid(payload, layout, slot))
}

/// Store a u64 rid into a key record.
pub fn set_key_rid_value(payload: &mut [u8], layout: &NodeLayout, slot: usize, rid: Rid) {
    let mut buf = [0u8; 8];
    LittleEndian::write_u64(&mut buf, rid);
    set_key_rid(payload, layout, slot, &buf);
}

/// Real byte length of the key (may exceed the inline slot).
pub fn key_size(payload: &[u8], layout: &NodeLayout, slot: usize) -> usize {
    let off = layout.record_offset(phys_of(payload, layout, slot));
    LittleEndian::read_u16(&payload[off + 8..off + 10]) as usize
}

/// Set the real key length.
pub fn set_key_size(payload: &mut [u8], layout: &NodeLayout, slot: usize, size: usize) {
    let off = layout.record_offset(phys_of(payload, layout, slot));
    LittleEndian::write_u16(&mut payload[off + 8..off + 10], size as u16);
}

/// Key record flags.
pub fn key_flags(payload: &[u8], layout: &NodeLayout, slot: usize) -> u8 {
    let off = layout.record_offset(phys_of(payload, layout, slot));
    payload[off + 10]
}

/// Replace the key record flags.
pub fn set_key_flags(payload: &mut [u8], layout: &NodeLayout, slot: usize, flags: u8) {
    let off = layout.record_offset(phys_of(payload, layout, slot));
    payload[off + 10] = flags;
}

/// The inline key bytes (full slot width).
pub fn key_inline<'p>(payload: &'p [u8], layout: &NodeLayout, slot: usize) -> &'p [u8] {
    let off = layout.record_offset(phys_of(payload, layout, slot)) + KEY_RECORD_FIXED_SIZE;
    &payload[off..off + layout.keysize as usize]
}

/// The inline key bytes, mutable.
pub fn key_inline_mut<'p>(
    payload: &'p mut [u8],
    layout: &NodeLayout,
    slot: usize,
) -> &'p mut [u8] {
    let off = layout.record_offset(phys_of(payload, layout, slot)) + KEY_RECORD_FIXED_SIZE;
    &mut payload[off..off + layout.keysize as usize]
}

/// Extkey blob rid from the tail of an extended key's inline slot.
pub fn key_extended_rid(payload: &[u8], layout: &NodeLayout, slot: usize) -> Rid {
    let inline = key_inline(payload, layout, slot);
    LittleEndian::read_u64(&inline[layout.keysize as usize - 8..])
}

/// Copy a whole key record between (node, slot) positions.
pub fn copy_key_record(
    src_payload: &[u8],
    src_layout: &NodeLayout,
    src_slot: usize,
    dst_payload: &mut [u8],
    dst_layout: &NodeLayout,
    dst_slot: usize,
) {
    let src_off = src_layout.record_offset(phys_of(src_payload, src_layout, src_slot));
    let dst_off = dst_layout.record_offset(phys_of(dst_payload, dst_layout, dst_slot));
    let len = src_layout.key_record_size();
    let tmp = src_payload[src_off..src_off + len].to_vec();
    dst_payload[dst_off..dst_off + len].copy_from_slice(&tmp);
}

// ============================================================================
// Slot Insertion / Removal
// ============================================================================

/// Open a hole at `slot`, shifting higher slots up. The new slot's record
/// is zeroed. The caller fills it and the count is already incremented.
pub fn insert_slot(payload: &mut [u8], layout: &NodeLayout, slot: usize) {
    let count = node_count(payload);
    debug_assert!(slot <= count);
    debug_assert!(count < layout.max_keys as usize);

    if layout.fast_index {
        // New record lands at physical position `count`; only the index
        // array shifts.
        let base = NODE_HEADER_SIZE;
        payload.copy_within(base + slot * 2..base + count * 2, base + slot * 2 + 2);
        fast_index_set(payload, slot, count);
        let off = layout.record_offset(count);
        payload[off..off + layout.key_record_size()].fill(0);
    } else {
        let rec = layout.key_record_size();
        let from = layout.record_offset(slot);
        let to = layout.record_offset(count);
        payload.copy_within(from..to, from + rec);
        payload[from..from + rec].fill(0);
    }
    set_node_count(payload, count + 1);
}

/// Remove the record at `slot`, shifting higher slots down.
pub fn remove_slot(payload: &mut [u8], layout: &NodeLayout, slot: usize) {
    let count = node_count(payload);
    debug_assert!(slot < count);

    if layout.fast_index {
        let freed_phys = fast_index_get(payload, slot);
        let base = NODE_HEADER_SIZE;
        payload.copy_within(base + (slot + 1) * 2..base + count * 2, base + slot * 2);

        // Keep physical positions dense: relocate the record at the last
        // physical position into the freed one.
        let last_phys = count - 1;
        if freed_phys != last_phys {
            let rec = layout.key_record_size();
            let from = layout.record_offset(last_phys);
            let to = layout.record_offset(freed_phys);
            let tmp = payload[from..from + rec].to_vec();
            payload[to..to + rec].copy_from_slice(&tmp);
            for i in 0..count - 1 {
                if fast_index_get(payload, i) == last_phys {
                    fast_index_set(payload, i, freed_phys);
                    break;
                }
            }
        }
    } else {
        let rec = layout.key_record_size();
        let from = layout.record_offset(slot + 1);
        let to = layout.record_offset(count);
        payload.copy_within(from..to, from - rec);
    }
    set_node_count(payload, count - 1);
}

/// Force the key count; used when splitting moves a block of records.
pub fn truncate_count(payload: &mut [u8], count: usize) {
    set_node_count(payload, count);
}

/// Rebuild the physical layout so logical slot `i` sits at physical
/// position `i`. Required after bulk moves with the fast index, which
/// assume physical positions `0..count` are exactly the live records.
/// No-op without the fast index.
pub fn compact(payload: &mut [u8], layout: &NodeLayout) {
    if !layout.fast_index {
        return;
    }
    let count = node_count(payload);
    let rec = layout.key_record_size();
    let mut temp = Vec::with_capacity(count * rec);
    for slot in 0..count {
        let off = layout.record_offset(fast_index_get(payload, slot));
        temp.extend_from_slice(&payload[off..off + rec]);
    }
    for slot in 0..count {
        let off = layout.record_offset(slot);
        payload[off..off + rec].copy_from_slice(&temp[slot * rec..(slot + 1) * rec]);
        fast_index_set(payload, slot, slot);
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn layout(fast_index: bool) -> NodeLayout {
        NodeLayout {
            keysize: 16,
            max_keys: 8,
            fast_index,
        }
    }

    fn payload(layout: &NodeLayout) -> Vec<u8> {
        let size = NODE_HEADER_SIZE
            + layout.fast_index_size()
            + layout.max_keys as usize * layout.key_record_size();
        let mut p = vec![0u8; size];
        node_init(&mut p, true);
        p
    }

    fn put_key(p: &mut [u8], l: &NodeLayout, slot: usize, key: &[u8], rid: Rid) {
        insert_slot(p, l, slot);
        set_key_size(p, l, slot, key.len());
        key_inline_mut(p, l, slot)[..key.len()].copy_from_slice(key);
        set_key_rid_value(p, l, slot, rid);
    }

    fn key_at(p: &[u8], l: &NodeLayout, slot: usize) -> Vec<u8> {
        let len = key_size(p, l, slot);
        key_inline(p, l, slot)[..len].to_vec()
    }

    #[test]
    fn test_header_fields() {
        let l = layout(false);
        let mut p = payload(&l);
        assert!(node_is_leaf(&p));
        assert_eq!(node_count(&p), 0);

        set_node_ptr_left(&mut p, 0x1000);
        set_node_left_sibling(&mut p, 0x2000);
        set_node_right_sibling(&mut p, 0x3000);
        assert_eq!(node_ptr_left(&p), 0x1000);
        assert_eq!(node_left_sibling(&p), 0x2000);
        assert_eq!(node_right_sibling(&p), 0x3000);
    }

    #[test]
    fn test_insert_remove_plain() {
        let l = layout(false);
        let mut p = payload(&l);

        put_key(&mut p, &l, 0, b"bb", 2);
        put_key(&mut p, &l, 0, b"aa", 1);
        put_key(&mut p, &l, 2, b"cc", 3);
        assert_eq!(node_count(&p), 3);
        assert_eq!(key_at(&p, &l, 0), b"aa");
        assert_eq!(key_at(&p, &l, 1), b"bb");
        assert_eq!(key_at(&p, &l, 2), b"cc");
        assert_eq!(key_rid_value(&p, &l, 1), 2);

        remove_slot(&mut p, &l, 1);
        assert_eq!(node_count(&p), 2);
        assert_eq!(key_at(&p, &l, 0), b"aa");
        assert_eq!(key_at(&p, &l, 1), b"cc");
    }

    #[test]
    fn test_insert_remove_fast_index() {
        let l = layout(true);
        let mut p = payload(&l);

        // Same logical sequence as the plain test; the fast index must
        // hide the physical shuffling completely.
        put_key(&mut p, &l, 0, b"bb", 2);
        put_key(&mut p, &l, 0, b"aa", 1);
        put_key(&mut p, &l, 2, b"cc", 3);
        assert_eq!(key_at(&p, &l, 0), b"aa");
        assert_eq!(key_at(&p, &l, 1), b"bb");
        assert_eq!(key_at(&p, &l, 2), b"cc");

        remove_slot(&mut p, &l, 0);
        assert_eq!(node_count(&p), 2);
        assert_eq!(key_at(&p, &l, 0), b"bb");
        assert_eq!(key_at(&p, &l, 1), b"cc");
        assert_eq!(key_rid_value(&p, &l, 0), 2);
        assert_eq!(key_rid_value(&p, &l, 1), 3);

        // Refill to capacity to exercise physical compaction.
        put_key(&mut p, &l, 0, b"a1", 10);
        put_key(&mut p, &l, 3, b"dd", 4);
        assert_eq!(key_at(&p, &l, 0), b"a1");
        assert_eq!(key_at(&p, &l, 3), b"dd");
    }

    #[test]
    fn test_compute_max_keys() {
        // 4 KiB page minus page header: payload 4084 bytes.
        let max = NodeLayout::compute_max_keys(4084, 21, false);
        assert_eq!(max as usize, (4084 - NODE_HEADER_SIZE) / 32);

        let with_index = NodeLayout::compute_max_keys(4084, 21, true);
        assert!(with_index < max);
    }

    #[test]
    fn test_copy_key_record() {
        let l = layout(false);
        let mut src = payload(&l);
        let mut dst = payload(&l);

        put_key(&mut src, &l, 0, b"moved", 77);
        set_key_flags(&mut src, &l, 0, KEY_FLAG_TINY);

        insert_slot(&mut dst, &l, 0);
        copy_key_record(&src, &l, 0, &mut dst, &l, 0);
        assert_eq!(key_at(&dst, &l, 0), b"moved");
        assert_eq!(key_rid_value(&dst, &l, 0), 77);
        assert_eq!(key_flags(&dst, &l, 0), KEY_FLAG_TINY);
    }
}
