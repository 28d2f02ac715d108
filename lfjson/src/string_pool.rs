// SPDX-License-Identifier: Apache-2.0

//! The interned string object and the chained hash table that
//! owns every string a document's long-string cells and object keys point
//! at.
//!
//! [`JString`] borrows its shape from `tinybytes::BytesString`'s
//! owned-vs-borrowed split (see `DESIGN.md`): a string object either copies
//! its bytes into the pool's slab or just remembers a pointer into bytes the
//! caller guarantees will outlive the pool entry. Unlike `BytesString` it
//! also carries the pool's own intrusive chain link and the sticky
//! key-used bit the invariant describes.

use core::cmp::Ordering;
use core::ptr::NonNull;

use lfjson_alloc::{Alt, CompactPtr, SlabPool};
use allocator_api2::alloc::Allocator;

/// `length` is packed into the flags word as `length << 2`, so it is capped
/// at `2^30 - 1`.
pub const MAX_STRING_LEN: usize = (1usize << 30) - 1;

const KEY_BIT: u32 = 0b10;
const OWN_BIT: u32 = 0b01;

/// A read/write view over a [`JString`] header-plus-payload record living
/// inside a [`crate::string_pool::StringPool`]'s slab. This is a borrowed
/// pointer, not an owner: dropping a `JString` does not free anything.
#[derive(Clone, Copy)]
pub(crate) struct JString {
    base: NonNull<u8>,
}

impl JString {
    /// Bytes needed to store a string object with `len` content bytes,
    /// owned or borrowed.
    pub(crate) fn total_size(owns: bool, len: usize) -> usize {
        // 4-byte flags + 4-byte next link, then either `len + 1` inline
        // bytes (owned, NUL-terminated) or an 8-byte external pointer.
        8 + if owns { len + 1 } else { 8 }
    }

    fn align() -> usize {
        8
    }

    /// Writes a fresh string object into `at` (a region at least
    /// [`JString::total_size`] bytes, suitably aligned) and returns a view
    /// over it. `bytes` must be `len` bytes; when `owns` they are copied in,
    /// otherwise `external` must point at bytes that outlive the pool entry.
    ///
    /// # Safety
    /// `at` must address a live, appropriately sized and aligned region that
    /// nothing else is concurrently reading or writing.
    pub(crate) unsafe fn write_new(
        at: NonNull<u8>,
        bytes: &[u8],
        owns: bool,
        key: bool,
        external: Option<NonNull<u8>>,
    ) -> JString {
        debug_assert!(bytes.len() <= MAX_STRING_LEN);
        let flags = ((bytes.len() as u32) << 2)
            | if key { KEY_BIT } else { 0 }
            | if owns { OWN_BIT } else { 0 };
        let base = at.as_ptr();
        base.cast::<u32>().write_unaligned(flags);
        base.add(4).cast::<u32>().write_unaligned(CompactPtr::NULL.to_bits());
        if owns {
            core::ptr::copy_nonoverlapping(bytes.as_ptr(), base.add(8), bytes.len());
            base.add(8 + bytes.len()).write(0u8);
        } else {
            let addr = external.expect("borrowed JString requires external pointer").as_ptr() as usize as u64;
            base.add(8).cast::<u64>().write_unaligned(addr);
        }
        JString { base: at }
    }

    /// # Safety
    /// `base` must address a live `JString` record.
    pub(crate) unsafe fn from_raw(base: NonNull<u8>) -> JString {
        JString { base }
    }

    pub(crate) fn as_raw(self) -> NonNull<u8> {
        self.base
    }

    fn flags(self) -> u32 {
        // SAFETY: every live `JString` begins with a 4-byte flags word.
        unsafe { self.base.as_ptr().cast::<u32>().read_unaligned() }
    }

    pub(crate) fn len(self) -> usize {
        (self.flags() >> 2) as usize
    }

    pub(crate) fn is_key(self) -> bool {
        self.flags() & KEY_BIT != 0
    }

    pub(crate) fn owns(self) -> bool {
        self.flags() & OWN_BIT != 0
    }

    /// Sticky-OR in the key-used flag.
    pub(crate) fn mark_key(self) {
        let flags = self.flags() | KEY_BIT;
        // SAFETY: same 4-byte flags word.
        unsafe { self.base.as_ptr().cast::<u32>().write_unaligned(flags) };
    }

    pub(crate) fn next(self) -> CompactPtr {
        // SAFETY: the next link always sits right after the flags word.
        let bits = unsafe { self.base.as_ptr().add(4).cast::<u32>().read_unaligned() };
        CompactPtr::from_bits(bits)
    }

    pub(crate) fn set_next(self, next: CompactPtr) {
        // SAFETY: see `next`.
        unsafe {
            self.base
                .as_ptr()
                .add(4)
                .cast::<u32>()
                .write_unaligned(next.to_bits())
        };
    }

    /// Borrows this string's bytes. For an owned string, this points into
    /// the pool's own slab; for a borrowed one, into whatever external
    /// buffer the caller supplied at `provide` time.
    pub(crate) fn bytes(self) -> &'static [u8] {
        let len = self.len();
        let ptr = if self.owns() {
            // SAFETY: the inline payload begins right after the 8-byte
            // header and is exactly `len` content bytes.
            unsafe { self.base.as_ptr().add(8) }
        } else {
            // SAFETY: an external pointer was validated at `write_new` time.
            let addr = unsafe { self.base.as_ptr().add(8).cast::<u64>().read_unaligned() };
            addr as usize as *mut u8
        };
        // SAFETY: the caller-supplied lifetime contract (see module docs):
        // the pool never outlives its own slab's chunks, and borrowed bytes
        // are guaranteed live by the `provide` caller. We erase the lifetime
        // to `'static` because this accessor is only ever used transiently
        // through `StringPool`'s own borrow-checked wrappers.
        unsafe { core::slice::from_raw_parts(ptr, len) }
    }

    /// Orders this string against an external `(ptr, len)` probe the same
    /// way the pool's chains are kept sorted: length first, then
    /// lexicographic.
    pub(crate) fn compare_external(self, probe: &[u8]) -> Ordering {
        self.len().cmp(&probe.len()).then_with(|| self.bytes().cmp(probe))
    }
}

fn align_up(size: usize, align: usize) -> usize {
    (size + align - 1) & !(align - 1)
}

#[cfg(feature = "xxhash")]
fn hash_bytes(bytes: &[u8]) -> u32 {
    (twox_hash::xxh3::hash64(bytes) & 0xFFFF_FFFF) as u32
}

#[cfg(not(feature = "xxhash"))]
fn hash_bytes(bytes: &[u8]) -> u32 {
    use core::hash::Hasher;
    let mut hasher = fnv::FnvHasher::default();
    hasher.write(bytes);
    (hasher.finish() & 0xFFFF_FFFF) as u32
}

fn fast_mod(hash: u32, bucket_count: usize) -> usize {
    if bucket_count.is_power_of_two() {
        (hash as usize) & (bucket_count - 1)
    } else {
        (hash as usize) % bucket_count
    }
}

/// A resolved reference to an interned string: a [`CompactPtr`] into the
/// owning pool's slab plus its byte length, cheap to copy and to embed in a
/// [`crate::value::Value`] `LongString` cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StrRef {
    pub(crate) ptr: CompactPtr,
    pub(crate) len: u32,
}

impl StrRef {
    pub(crate) fn into_value_payload(self) -> crate::value::LongStringRef {
        crate::value::LongStringRef {
            ptr_bits: self.ptr.to_bits(),
            len: self.len,
        }
    }
}

/// A separate-chaining hash set of interned strings, sharing its
/// allocator with its own stored payload via a [`SlabPool`] running under
/// [`Alt`] (compact-pointer) addressing.
pub struct StringPool<A: Allocator> {
    slab: SlabPool<A, Alt>,
    /// Bucket heads. Ambient bookkeeping (pointers, not document content),
    /// so — like the allocator crate's own chunk vector — it rides the
    /// ambient global allocator rather than `A`.
    buckets: std::vec::Vec<CompactPtr>,
    item_count: usize,
    max_load_factor: f64,
    growth_factor: f64,
}

impl<A: Allocator> StringPool<A> {
    /// `initial_buckets` must be `> 1`; `growth_factor` must be `> 1.0`;
    /// `max_load_factor` must be `> 0.0`.
    pub fn new_in(
        chunk_size: u16,
        initial_buckets: usize,
        growth_factor: f64,
        max_load_factor: f64,
        allocator: A,
    ) -> Self {
        debug_assert!(initial_buckets > 1);
        debug_assert!(growth_factor > 1.0);
        debug_assert!(max_load_factor > 0.0);
        Self {
            slab: SlabPool::new_in(chunk_size, 8, allocator),
            buckets: vec![CompactPtr::NULL; initial_buckets],
            item_count: 0,
            max_load_factor,
            growth_factor,
        }
    }

    pub fn len(&self) -> usize {
        self.item_count
    }

    pub fn is_empty(&self) -> bool {
        self.item_count == 0
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    fn string_at(&self, ptr: CompactPtr) -> Option<JString> {
        if ptr.is_null() {
            return None;
        }
        // SAFETY: every non-null pointer stored in a bucket or `next` link
        // was handed back by this pool's own `slab.allocate`.
        self.slab.resolve_ptr(ptr).map(|raw| unsafe { JString::from_raw(raw) })
    }

    fn maybe_rehash(&mut self) {
        let load = (self.item_count + 1) as f64 / self.buckets.len() as f64;
        if load <= self.max_load_factor {
            return;
        }
        let new_count = if self.buckets.is_empty() {
            16
        } else {
            ((self.buckets.len() as f64 * self.growth_factor).ceil() as usize).max(self.buckets.len() + 1)
        };
        self.rehash_to(new_count);
    }

    fn rehash_to(&mut self, new_count: usize) {
        let old_buckets = core::mem::replace(&mut self.buckets, vec![CompactPtr::NULL; new_count]);
        for head in old_buckets {
            let mut cursor = head;
            while let Some(s) = self.string_at(cursor) {
                let next = s.next();
                let index = fast_mod(hash_bytes(s.bytes()), new_count);
                self.insert_sorted(index, cursor, s);
                cursor = next;
            }
        }
        tracing::debug!(buckets = new_count, "string pool rehashed");
    }

    /// Inserts the string at `ptr` into bucket `index`'s chain, preserving
    /// the (length, lexicographic) sort order. `ptr` must
    /// already resolve to `s`; the caller owns picking `next` for us to
    /// overwrite, since `s` may still be linked to stale neighbors.
    fn insert_sorted(&mut self, index: usize, ptr: CompactPtr, s: JString) {
        let mut prev: Option<(CompactPtr, JString)> = None;
        let mut cursor = self.buckets[index];
        while let Some(cur) = self.string_at(cursor) {
            if cur.compare_external(s.bytes()) != Ordering::Less {
                break;
            }
            prev = Some((cursor, cur));
            cursor = cur.next();
        }
        s.set_next(cursor);
        match prev {
            Some((_, p)) => p.set_next(ptr),
            None => self.buckets[index] = ptr,
        }
    }

    /// Interns (or finds) a string. Returns the resolved reference and
    /// whether an existing entry was found.
    ///
    /// `external` must be `Some` when `owns` is `false`; the caller
    /// guarantees those bytes outlive this pool entry.
    pub fn provide(
        &mut self,
        bytes: &[u8],
        owns: bool,
        key: bool,
        external: Option<NonNull<u8>>,
    ) -> (StrRef, bool) {
        debug_assert!(bytes.len() <= MAX_STRING_LEN);
        self.maybe_rehash();

        let index = fast_mod(hash_bytes(bytes), self.buckets.len());
        let mut prev: Option<(CompactPtr, JString)> = None;
        let mut cursor = self.buckets[index];
        while let Some(cur) = self.string_at(cursor) {
            match cur.compare_external(bytes) {
                Ordering::Equal => {
                    if key {
                        cur.mark_key();
                    }
                    return (
                        StrRef {
                            ptr: cursor,
                            len: bytes.len() as u32,
                        },
                        true,
                    );
                }
                Ordering::Greater => break,
                Ordering::Less => {
                    prev = Some((cursor, cur));
                    cursor = cur.next();
                }
            }
        }

        let size = align_up(JString::total_size(owns, bytes.len()), JString::align());
        let layout = core::alloc::Layout::from_size_align(size, JString::align())
            .expect("lfjson: string allocation layout");
        let new_ptr = self.slab.allocate(layout).expect("lfjson: string pool allocation failed");
        let raw = self
            .slab
            .resolve_ptr(new_ptr)
            .expect("freshly allocated pointer always resolves");
        // SAFETY: `raw` addresses a fresh region at least `size` bytes.
        let s = unsafe { JString::write_new(raw, bytes, owns, key, external) };
        s.set_next(cursor);
        match prev {
            Some((_, p)) => p.set_next(new_ptr),
            None => self.buckets[index] = new_ptr,
        }
        self.item_count += 1;
        tracing::trace!(len = bytes.len(), owns, "string pool interned a new string");
        (
            StrRef {
                ptr: new_ptr,
                len: bytes.len() as u32,
            },
            false,
        )
    }

    /// Read-only lookup: no insertion, no key-flag update.
    pub fn get(&self, bytes: &[u8]) -> Option<StrRef> {
        if self.buckets.is_empty() {
            return None;
        }
        let index = fast_mod(hash_bytes(bytes), self.buckets.len());
        let mut cursor = self.buckets[index];
        while let Some(cur) = self.string_at(cursor) {
            match cur.compare_external(bytes) {
                Ordering::Equal => {
                    return Some(StrRef {
                        ptr: cursor,
                        len: bytes.len() as u32,
                    })
                }
                Ordering::Greater => return None,
                Ordering::Less => cursor = cur.next(),
            }
        }
        None
    }

    /// Resolves a previously provided reference back to its bytes.
    pub fn resolve(&self, r: StrRef) -> &[u8] {
        self.string_at(r.ptr)
            .map(JString::bytes)
            .expect("lfjson: dangling StrRef")
    }

    /// Resolves a reference to the raw address of its `JString` record, so
    /// callers (object member storage) can compare keys by pointer identity
    /// instead of by bytes.
    pub(crate) fn resolve_ptr_for(&self, r: StrRef) -> Option<NonNull<u8>> {
        self.string_at(r.ptr).map(JString::as_raw)
    }

    /// Unlinks and frees every non-key string; key-used strings are retained.
    pub fn release_values(&mut self) {
        for index in 0..self.buckets.len() {
            let mut prev: Option<(CompactPtr, JString)> = None;
            let mut cursor = self.buckets[index];
            while let Some(cur) = self.string_at(cursor) {
                let next = cur.next();
                if cur.is_key() {
                    prev = Some((cursor, cur));
                    cursor = next;
                    continue;
                }
                match prev {
                    Some((_, p)) => p.set_next(next),
                    None => self.buckets[index] = next,
                }
                self.free_string_at(cursor, cur);
                self.item_count -= 1;
                cursor = next;
            }
        }
        tracing::debug!(remaining = self.item_count, "string pool released non-key values");
    }

    /// Drops every string and resets the bucket array, keeping the
    /// underlying chunks allocated.
    pub fn clear(&mut self) {
        for head in self.buckets.iter_mut() {
            *head = CompactPtr::NULL;
        }
        self.item_count = 0;
    }

    /// Like [`StringPool::clear`] but also releases the backing chunks.
    pub fn release_all(&mut self) {
        self.clear();
        self.slab.shrink();
    }

    fn free_string_at(&mut self, ptr: CompactPtr, s: JString) {
        let size = align_up(JString::total_size(s.owns(), s.len()), JString::align());
        let layout = core::alloc::Layout::from_size_align(size, JString::align()).unwrap();
        self.slab.deallocate(ptr, layout);
    }

    /// Rehashes into a tighter bucket array if `rehash` is requested and the
    /// current array is oversized, then shrinks the backing slab.
    pub fn shrink(&mut self, rehash: bool) {
        if rehash {
            let target = ((self.item_count as f64 / self.max_load_factor).ceil() as usize).max(2);
            if target < self.buckets.len() {
                self.rehash_to(target);
            }
        }
        self.slab.shrink();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use allocator_api2::alloc::Global;

    fn pool() -> StringPool<Global> {
        StringPool::new_in(4096, 16, 2.0, 1.5, Global)
    }

    #[test]
    fn provide_then_get_round_trips() {
        let mut p = pool();
        let (r, found) = p.provide(b"hello world", true, false, None);
        assert!(!found);
        assert_eq!(b"hello world", p.resolve(r));
        assert_eq!(Some(r), p.get(b"hello world"));
    }

    #[test]
    fn provide_dedups() {
        let mut p = pool();
        let (a, _) = p.provide(b"dup", true, false, None);
        let (b, found) = p.provide(b"dup", true, false, None);
        assert!(found);
        assert_eq!(a, b);
        assert_eq!(1, p.len());
    }

    #[test]
    fn key_flag_is_sticky() {
        let mut p = pool();
        let (r, _) = p.provide(b"akey", true, false, None);
        assert!(!p.string_at(r.ptr).unwrap().is_key());
        p.provide(b"akey", true, true, None);
        assert!(p.string_at(r.ptr).unwrap().is_key());
    }
}
