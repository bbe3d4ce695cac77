//! Guest runtime object layouts.
//!
//! These constants and formulas describe the AssemblyScript runtime's
//! memory model. A different guest runtime needs its own version of this
//! module.

use crate::abi::TypeNode;
use crate::memory::align_to;

/// Runtime-type id of `ArrayBuffer`, also used for array backing stores.
pub const BUF_RTID: u32 = 1;
/// Runtime-type id of `String`.
pub const STRING_RTID: u32 = 2;

/// `Array<T>` header: `[buffer, dataStart, byteLength, length]`.
pub const ARRAY_HEADER_SIZE: u32 = 16;
/// Typed array header: `[buffer, dataStart, byteLength]`.
pub const TYPED_ARRAY_HEADER_SIZE: u32 = 12;
/// `Map`/`Set` header:
/// `[buckets, bucketsMask, entries, entriesCapacity, entriesOffset, entriesCount]`.
pub const HASH_HEADER_SIZE: u32 = 24;
/// Offset of the entries pointer inside the hash header.
pub const HASH_ENTRIES_OFFSET: u32 = 8;

/// Bit set in an entry's tagged-next word when the entry was deleted.
pub const EMPTY_TAG: u32 = 1;

/// Minimum bucket count of a freshly built collection.
const INITIAL_BUCKETS: u32 = 4;

/// Layout of one `Map`/`Set` entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryLayout {
    pub key_offset: u32,
    /// `None` for sets.
    pub value_offset: Option<u32>,
    pub next_offset: u32,
    pub size: u32,
}

impl EntryLayout {
    /// `{key, value?, taggedNext}` with each member aligned to its size and
    /// the entry rounded up to the largest of those alignments.
    pub fn new(key: &TypeNode, value: Option<&TypeNode>) -> Self {
        let key_size = key.own_size();
        let mut cursor = key_size;
        let mut max_align = key_size.max(4);
        let value_offset = value.map(|v| {
            let size = v.own_size();
            max_align = max_align.max(size);
            let offset = align_to(cursor, size);
            cursor = offset + size;
            offset
        });
        let next_offset = align_to(cursor, 4);
        let size = align_to(next_offset + 4, max_align);
        EntryLayout {
            key_offset: 0,
            value_offset,
            next_offset,
            size,
        }
    }
}

/// Bucket and entry capacities for `count` entries.
pub fn hash_capacity(count: u32) -> (u32, u32) {
    let buckets = count.max(INITIAL_BUCKETS).next_power_of_two();
    (buckets, buckets.max(count))
}

const P1: u32 = 2654435761;
const P2: u32 = 2246822519;
const P3: u32 = 3266489917;
const P4: u32 = 668265263;
const P5: u32 = 374761393;

fn finish(mut h: u32) -> u32 {
    h ^= h >> 15;
    h = h.wrapping_mul(P2);
    h ^= h >> 13;
    h = h.wrapping_mul(P3);
    h ^= h >> 16;
    h
}

/// Hash of a value of 1, 2 or 4 bytes.
pub fn hash32(key: u32, len: u32) -> u32 {
    let mut h = P5.wrapping_add(len);
    h = h.wrapping_add(key.wrapping_mul(P3));
    h = h.rotate_left(17).wrapping_mul(P4);
    finish(h)
}

/// Hash of an 8-byte value.
pub fn hash64(key: u64) -> u32 {
    let mut h = P5.wrapping_add(8);
    h = h.wrapping_add((key as u32).wrapping_mul(P3));
    h = h.rotate_left(17).wrapping_mul(P4);
    h = h.wrapping_add(((key >> 32) as u32).wrapping_mul(P3));
    h = h.rotate_left(17).wrapping_mul(P4);
    finish(h)
}

/// Hash of a string's UTF-16 bytes.
pub fn hash_str(bytes: &[u8]) -> u32 {
    fn mix(h: u32, key: u32) -> u32 {
        h.wrapping_add(key.wrapping_mul(P2)).rotate_left(13).wrapping_mul(P1)
    }
    let load = |pos: usize| u32::from_le_bytes([bytes[pos], bytes[pos + 1], bytes[pos + 2], bytes[pos + 3]]);

    let len = bytes.len();
    let mut h = len as u32;
    let mut pos = 0usize;
    if len >= 16 {
        let mut s1 = P1.wrapping_add(P2);
        let mut s2 = P2;
        let mut s3 = 0u32;
        let mut s4 = 0u32.wrapping_sub(P1);
        while pos + 16 <= len {
            s1 = mix(s1, load(pos));
            s2 = mix(s2, load(pos + 4));
            s3 = mix(s3, load(pos + 8));
            s4 = mix(s4, load(pos + 12));
            pos += 16;
        }
        h = h.wrapping_add(
            s1.rotate_left(1)
                .wrapping_add(s2.rotate_left(7))
                .wrapping_add(s3.rotate_left(12))
                .wrapping_add(s4.rotate_left(18)),
        );
    } else {
        h = h.wrapping_add(P5);
    }
    while pos + 4 <= len {
        h = h.wrapping_add(load(pos).wrapping_mul(P3));
        h = h.rotate_left(17).wrapping_mul(P4);
        pos += 4;
    }
    while pos < len {
        h = h.wrapping_add(u32::from(bytes[pos]).wrapping_mul(P5));
        h = h.rotate_left(11).wrapping_mul(P1);
        pos += 1;
    }
    finish(h)
}
