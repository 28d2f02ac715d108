// SPDX-License-Identifier: Apache-2.0

//! The chunked slab pool: a chunk vector plus a per-chunk dead-cell freelist,
//! with a side fallback list for requests too large for a single chunk.
//!
//! [`SlabPool`] is generic over a [`PointerScheme`]: [`Nominal`] hands back a
//! raw `NonNull<u8>` and finds chunks by address (binary search over an
//! address-sorted chunk vector); [`Alt`] hands back a 4-byte [`CompactPtr`]
//! that encodes its own chunk index and never needs a search, at the cost of
//! the chunk vector only ever growing by appending.

use crate::compact::CompactPtr;
use allocator_api2::alloc::{AllocError, Allocator};
use core::alloc::Layout;
use core::marker::PhantomData;
use core::ptr::NonNull;
use std::vec::Vec;

/// Sentinel for "no dead cell" in [`ChunkRec::first_dead`]. Safe because a
/// chunk's size is capped at 65534 bytes, so no real offset reaches 65535.
const NO_DEAD: u16 = u16::MAX;

/// Smallest request a pool will hand out: dead cells are a 4-byte inline
/// `{size, next}` record, so anything recycled must be at least that big.
const MIN_ALLOC: usize = 4;

fn align_up(size: usize, align: usize) -> usize {
    debug_assert!(align.is_power_of_two());
    (size + align - 1) & !(align - 1)
}

struct ChunkRec {
    data: NonNull<u8>,
    layout: Layout,
    /// Bump cursor: bytes `[0, first_avail)` have been handed out at least
    /// once (live or dead); `[first_avail, chunk_size)` has never been
    /// touched.
    first_avail: u16,
    /// Offset of the head of this chunk's dead-cell chain, or [`NO_DEAD`].
    first_dead: u16,
    /// Sum of the sizes of all dead cells currently chained in this chunk.
    total_dead: u16,
}

struct FallbackSlot {
    /// `None` once freed — the slot itself is kept so that [`Alt`]'s
    /// position-from-head addressing never shifts.
    ptr: Option<NonNull<u8>>,
    layout: Layout,
}

/// Where a previously issued pointer resolves to, for deallocation / resize.
enum Location {
    Chunk(usize, u16),
    Fallback(usize),
    Unknown,
}

mod sealed {
    pub trait Sealed {}
    impl Sealed for super::Nominal {}
    impl Sealed for super::Alt {}
}

/// Marker type selecting [`SlabPool`]'s raw-pointer pointer scheme: chunks
/// are kept address-sorted and a deallocated pointer is found by binary
/// search. The natural choice when pointees are dereferenced through
/// ordinary Rust references most of the time.
pub struct Nominal;

/// Marker type selecting [`SlabPool`]'s compact-pointer scheme: pointers are
/// 4-byte `{chunk_index, offset}` pairs, chunks only ever grow by appending
/// (their vector position is never reordered), and lookups are O(1). The
/// natural choice for structures, like the string pool's chain links, that
/// store far more pointers than they dereference through normal references.
pub struct Alt;

/// Chooses the pointer representation and lookup strategy a [`SlabPool`]
/// uses. Sealed: [`Nominal`] and [`Alt`] are the only two allocator-shape
/// policies this crate supports.
pub trait PointerScheme: sealed::Sealed + 'static {
    /// The pointer type this scheme hands back from `allocate`.
    type Ptr: Copy + core::fmt::Debug + PartialEq;

    /// Whether a pointer's numeric value encodes chunk position. If `true`
    /// (as for [`Alt`]), the chunk vector may never reorder or partially
    /// compact — only a wholesale release (no chunks left) is safe.
    const STABLE_INDICES: bool;

    #[doc(hidden)]
    fn chunk_ptr(chunks: &[ChunkRec], index: usize, offset: u16) -> Self::Ptr;
    #[doc(hidden)]
    fn fallback_ptr(raw: NonNull<u8>, index: usize) -> Self::Ptr;
    #[doc(hidden)]
    fn resolve(
        ptr: Self::Ptr,
        chunks: &[ChunkRec],
        chunk_size: u16,
        fallback: &[FallbackSlot],
    ) -> Location;
    #[doc(hidden)]
    fn insert_chunk(chunks: &mut Vec<ChunkRec>, rec: ChunkRec) -> usize;
}

impl PointerScheme for Nominal {
    type Ptr = NonNull<u8>;
    const STABLE_INDICES: bool = false;

    fn chunk_ptr(chunks: &[ChunkRec], index: usize, offset: u16) -> NonNull<u8> {
        // SAFETY: `offset` is always < chunk_size, inside this chunk's
        // allocation.
        unsafe { NonNull::new_unchecked(chunks[index].data.as_ptr().add(offset as usize)) }
    }

    fn fallback_ptr(raw: NonNull<u8>, _index: usize) -> NonNull<u8> {
        raw
    }

    fn resolve(
        ptr: NonNull<u8>,
        chunks: &[ChunkRec],
        chunk_size: u16,
        fallback: &[FallbackSlot],
    ) -> Location {
        let addr = ptr.as_ptr() as usize;
        let pos = chunks.partition_point(|c| (c.data.as_ptr() as usize) <= addr);
        if pos > 0 {
            let start = chunks[pos - 1].data.as_ptr() as usize;
            if addr < start + chunk_size as usize {
                return Location::Chunk(pos - 1, (addr - start) as u16);
            }
        }
        match fallback.iter().position(|slot| slot.ptr == Some(ptr)) {
            Some(index) => Location::Fallback(index),
            None => Location::Unknown,
        }
    }

    fn insert_chunk(chunks: &mut Vec<ChunkRec>, rec: ChunkRec) -> usize {
        let pos = chunks.partition_point(|c| c.data.as_ptr() < rec.data.as_ptr());
        chunks.insert(pos, rec);
        pos
    }
}

impl PointerScheme for Alt {
    type Ptr = CompactPtr;
    const STABLE_INDICES: bool = true;

    fn chunk_ptr(_chunks: &[ChunkRec], index: usize, offset: u16) -> CompactPtr {
        CompactPtr::chunk(index as u16, offset)
    }

    fn fallback_ptr(_raw: NonNull<u8>, index: usize) -> CompactPtr {
        CompactPtr::fallback(index as u16)
    }

    fn resolve(
        ptr: CompactPtr,
        _chunks: &[ChunkRec],
        _chunk_size: u16,
        _fallback: &[FallbackSlot],
    ) -> Location {
        if let Some(index) = ptr.as_fallback_position() {
            return Location::Fallback(index as usize);
        }
        if let Some((chunk_index, offset)) = ptr.as_chunk() {
            return Location::Chunk(chunk_index as usize, offset);
        }
        Location::Unknown
    }

    fn insert_chunk(chunks: &mut Vec<ChunkRec>, rec: ChunkRec) -> usize {
        chunks.push(rec);
        chunks.len() - 1
    }
}

/// Snapshot of a [`SlabPool`]'s occupancy, for tests and diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlabStats {
    pub chunk_count: usize,
    pub fallback_count: usize,
    pub live_bytes: usize,
    pub reserved_bytes: usize,
}

/// A chunked slab allocator with dead-cell recycling, parameterized over the
/// base [`Allocator`] it grows from and the [`PointerScheme`] it hands
/// pointers out under.
pub struct SlabPool<A: Allocator, S: PointerScheme> {
    allocator: A,
    /// 0 means "always fall back"; otherwise every regular chunk is exactly
    /// this many bytes.
    chunk_size: u16,
    align: usize,
    chunks: Vec<ChunkRec>,
    last_used: Option<usize>,
    fallback: Vec<FallbackSlot>,
    _scheme: PhantomData<S>,
}

impl<A: Allocator, S: PointerScheme> SlabPool<A, S> {
    /// Builds a pool whose regular chunks are `chunk_size` bytes each
    /// (`0` disables chunking entirely, routing every request through the
    /// fallback list), aligning every cell to at least `align` bytes.
    pub fn new_in(chunk_size: u16, align: usize, allocator: A) -> Self {
        debug_assert!(align.is_power_of_two() && align >= 4);
        debug_assert!(chunk_size as u32 <= CompactPtr::MAX_CHUNK_INDEX as u32 + 1 || chunk_size == 0);
        Self {
            allocator,
            chunk_size,
            align: align.max(4),
            chunks: Vec::new(),
            last_used: None,
            fallback: Vec::new(),
            _scheme: PhantomData,
        }
    }

    /// Occupancy snapshot across chunks and the fallback list.
    pub fn stats(&self) -> SlabStats {
        let live_bytes: usize = self
            .chunks
            .iter()
            .map(|c| c.first_avail as usize - c.total_dead as usize)
            .sum::<usize>()
            + self
                .fallback
                .iter()
                .filter(|s| s.ptr.is_some())
                .map(|s| s.layout.size())
                .sum::<usize>();
        let reserved_bytes = self.chunks.len() * self.chunk_size as usize
            + self
                .fallback
                .iter()
                .filter(|s| s.ptr.is_some())
                .map(|s| s.layout.size())
                .sum::<usize>();
        SlabStats {
            chunk_count: self.chunks.len(),
            fallback_count: self.fallback.iter().filter(|s| s.ptr.is_some()).count(),
            live_bytes,
            reserved_bytes,
        }
    }

    /// Allocates a region honoring `layout`, recycling a dead cell when one
    /// fits before growing the pool. See the module docs for the chunk/
    /// fallback selection order.
    pub fn allocate(&mut self, layout: Layout) -> Result<S::Ptr, AllocError> {
        let align = self.align.max(layout.align());
        let size_usize = align_up(layout.size().max(1), align);
        debug_assert!(size_usize >= MIN_ALLOC);

        if self.chunk_size == 0 || size_usize > self.chunk_size as usize {
            return self.allocate_fallback(layout);
        }
        let size = size_usize as u16;

        if let Some(idx) = self.last_used {
            if let Some(off) = self.try_tail(idx, size) {
                return Ok(S::chunk_ptr(&self.chunks, idx, off));
            }
            if let Some(off) = self.try_freelist(idx, size) {
                return Ok(S::chunk_ptr(&self.chunks, idx, off));
            }
        }

        for idx in 0..self.chunks.len() {
            if Some(idx) == self.last_used {
                continue;
            }
            if let Some(off) = self.try_tail(idx, size) {
                self.last_used = Some(idx);
                return Ok(S::chunk_ptr(&self.chunks, idx, off));
            }
        }

        for idx in 0..self.chunks.len() {
            if Some(idx) == self.last_used {
                continue;
            }
            if (self.chunks[idx].total_dead as usize) < size as usize {
                continue;
            }
            if let Some(off) = self.try_freelist(idx, size) {
                return Ok(S::chunk_ptr(&self.chunks, idx, off));
            }
        }

        let idx = self.grow_chunk()?;
        let off = self
            .try_tail(idx, size)
            .expect("a freshly grown chunk always fits a within-chunk-size request");
        self.last_used = Some(idx);
        Ok(S::chunk_ptr(&self.chunks, idx, off))
    }

    /// Attempts to grow `ptr`'s allocation from `old_layout` to `new_layout`
    /// without moving it. Only the live tail of a chunk can grow in place,
    /// and only while the new size still fits inside the chunk.
    pub fn try_grow_in_place(
        &mut self,
        ptr: S::Ptr,
        old_layout: Layout,
        new_layout: Layout,
    ) -> bool {
        let align = self.align.max(old_layout.align()).max(new_layout.align());
        let old_size = match u16::try_from(align_up(old_layout.size().max(1), align)) {
            Ok(v) => v,
            Err(_) => return false,
        };
        let new_size = match u16::try_from(align_up(new_layout.size().max(1), align)) {
            Ok(v) => v,
            Err(_) => return false,
        };

        match S::resolve(ptr, &self.chunks, self.chunk_size, &self.fallback) {
            Location::Chunk(idx, offset) => {
                let chunk = &mut self.chunks[idx];
                if chunk.first_avail.checked_sub(old_size) != Some(offset) {
                    return false;
                }
                match offset.checked_add(new_size) {
                    Some(end) if end <= self.chunk_size => {
                        chunk.first_avail = end;
                        true
                    }
                    _ => false,
                }
            }
            _ => false,
        }
    }

    /// Attempts to shrink `ptr`'s allocation from `old_layout` down to
    /// `new_layout` without moving it. Only the live tail of a chunk can
    /// shrink in place; callers fall back to allocate-copy-free otherwise.
    pub fn try_shrink_in_place(
        &mut self,
        ptr: S::Ptr,
        old_layout: Layout,
        new_layout: Layout,
    ) -> bool {
        let align = self.align.max(old_layout.align()).max(new_layout.align());
        let old_size = match u16::try_from(align_up(old_layout.size().max(1), align)) {
            Ok(v) => v,
            Err(_) => return false,
        };
        let new_size = match u16::try_from(align_up(new_layout.size().max(1), align)) {
            Ok(v) => v,
            Err(_) => return false,
        };
        if new_size > old_size {
            return false;
        }

        match S::resolve(ptr, &self.chunks, self.chunk_size, &self.fallback) {
            Location::Chunk(idx, offset) => {
                let chunk = &mut self.chunks[idx];
                if chunk.first_avail.checked_sub(old_size) != Some(offset) {
                    return false;
                }
                chunk.first_avail = offset + new_size;
                true
            }
            _ => false,
        }
    }

    /// Resolves a previously issued pointer back to its raw bytes. Trivial
    /// for [`Nominal`] (the pointer already is the address); for [`Alt`] this
    /// walks the chunk vector by index, the same lookup `deallocate` uses.
    /// Returns `None` for an unknown or null pointer.
    pub fn resolve_ptr(&self, ptr: S::Ptr) -> Option<NonNull<u8>> {
        match S::resolve(ptr, &self.chunks, self.chunk_size, &self.fallback) {
            Location::Chunk(idx, offset) => {
                // SAFETY: `offset` is within this chunk's allocation.
                Some(unsafe {
                    NonNull::new_unchecked(self.chunks[idx].data.as_ptr().add(offset as usize))
                })
            }
            Location::Fallback(idx) => self.fallback.get(idx).and_then(|slot| slot.ptr),
            Location::Unknown => None,
        }
    }

    /// Releases `ptr` (allocated with `layout`) back to the pool.
    pub fn deallocate(&mut self, ptr: S::Ptr, layout: Layout) {
        let align = self.align.max(layout.align());
        let size = align_up(layout.size().max(1), align);

        match S::resolve(ptr, &self.chunks, self.chunk_size, &self.fallback) {
            Location::Chunk(idx, offset) => self.deallocate_in_chunk(idx, offset, size as u16),
            Location::Fallback(idx) => self.deallocate_fallback(idx),
            Location::Unknown => {
                debug_assert!(false, "lfjson-alloc: deallocate of an unknown pointer");
            }
        }
    }

    /// Releases every chunk that is entirely empty back to the base
    /// allocator. Under [`Alt`], a chunk's vector position is load-bearing
    /// for every live compact pointer, so partial compaction would corrupt
    /// outstanding pointers — only a wholesale release (every chunk empty)
    /// is attempted there.
    pub fn shrink(&mut self) {
        if S::STABLE_INDICES {
            if !self.chunks.is_empty() && self.chunks.iter().all(|c| c.first_avail == 0) {
                for chunk in self.chunks.drain(..) {
                    // SAFETY: `chunk.layout` is exactly what was passed to
                    // `allocate` when this chunk was grown.
                    unsafe { self.allocator.deallocate(chunk.data, chunk.layout) };
                }
                self.chunks = Vec::new();
                self.last_used = None;
                tracing::trace!("slab pool released all chunks on shrink");
            }
            return;
        }

        if self.chunks.is_empty() {
            return;
        }
        let mut kept = Vec::with_capacity(self.chunks.len());
        for chunk in self.chunks.drain(..) {
            if chunk.first_avail == 0 {
                // SAFETY: see above.
                unsafe { self.allocator.deallocate(chunk.data, chunk.layout) };
            } else {
                kept.push(chunk);
            }
        }
        self.last_used = None;
        self.chunks = if kept.is_empty() { Vec::new() } else { kept };
        tracing::trace!(remaining = self.chunks.len(), "slab pool shrink");
    }

    fn try_tail(&mut self, idx: usize, size: u16) -> Option<u16> {
        let chunk = &mut self.chunks[idx];
        let end = chunk.first_avail.checked_add(size)?;
        if end > self.chunk_size {
            return None;
        }
        let start = chunk.first_avail;
        chunk.first_avail = end;
        Some(start)
    }

    fn try_freelist(&mut self, idx: usize, size: u16) -> Option<u16> {
        let data;
        {
            let chunk = &self.chunks[idx];
            if chunk.total_dead < size {
                return None;
            }
            data = chunk.data;
        }

        let mut prev: Option<u16> = None;
        let mut cursor = self.chunks[idx].first_dead;
        let mut best: Option<(u16, u16, Option<u16>)> = None;

        while cursor != NO_DEAD {
            // SAFETY: `cursor` always names a live dead-cell record written
            // by `deallocate_in_chunk`, at least `MIN_ALLOC` bytes, inside
            // this chunk.
            let (cell_size, next) = unsafe { read_dead_cell(data, cursor) };

            if cell_size == size {
                self.unlink_dead(idx, prev, next);
                self.chunks[idx].total_dead -= cell_size;
                return Some(cursor);
            } else if cell_size as u32 >= size as u32 * 2 {
                let remainder = cell_size - size;
                let alloc_offset = cursor + remainder;
                // SAFETY: shrinking the cell in place, still >= MIN_ALLOC
                // bytes since `remainder >= size >= MIN_ALLOC` is not
                // guaranteed in general, but `remainder >= size` always
                // holds here, and `size >= MIN_ALLOC`.
                unsafe { write_dead_cell(data, cursor, remainder, next) };
                self.chunks[idx].total_dead -= size;
                return Some(alloc_offset);
            } else if cell_size > size && best.map_or(true, |(_, bsize, _)| cell_size < bsize) {
                best = Some((cursor, cell_size, prev));
            }

            prev = Some(cursor);
            cursor = next;
        }

        let (offset, cell_size, best_prev) = best?;
        // SAFETY: `offset` was read from the same chain walk above.
        let next = unsafe { read_dead_cell(data, offset) }.1;
        self.unlink_dead(idx, best_prev, next);
        self.chunks[idx].total_dead -= cell_size;
        Some(offset)
    }

    /// Rewrites `prev`'s `next` field to `next` (or, with no `prev`, the
    /// chunk's freelist head), unlinking the cell that used to sit there.
    fn unlink_dead(&mut self, idx: usize, prev: Option<u16>, next: u16) {
        match prev {
            Some(p) => {
                let data = self.chunks[idx].data;
                // SAFETY: `p` names a live dead-cell record in this chunk.
                let (prev_size, _) = unsafe { read_dead_cell(data, p) };
                unsafe { write_dead_cell(data, p, prev_size, next) };
            }
            None => self.chunks[idx].first_dead = next,
        }
    }

    fn deallocate_in_chunk(&mut self, idx: usize, offset: u16, size: u16) {
        let chunk_size = self.chunk_size;
        let became_empty;
        {
            let chunk = &mut self.chunks[idx];
            let is_tail = chunk.first_avail.checked_sub(size) == Some(offset);
            if is_tail {
                let sole_live = chunk.total_dead == 0 && offset == 0;
                if sole_live {
                    chunk.first_avail = 0;
                    chunk.first_dead = NO_DEAD;
                    chunk.total_dead = 0;
                } else {
                    chunk.first_avail = offset;
                }
                became_empty = sole_live;
            } else {
                let data = chunk.data;
                let prev_dead = chunk.first_dead;
                // SAFETY: `[offset, offset + size)` was just returned by
                // this chunk and is no longer live.
                unsafe { write_dead_cell(data, offset, size, prev_dead) };
                chunk.first_dead = offset;
                chunk.total_dead += size;
                became_empty = false;
            }
        }
        if became_empty && self.last_used == Some(idx) {
            self.last_used = self.chunks.iter().position(|c| c.first_avail < chunk_size);
        }
    }

    fn allocate_fallback(&mut self, layout: Layout) -> Result<S::Ptr, AllocError> {
        let raw = self.allocator.allocate(layout)?.cast::<u8>();
        let index = self.fallback.len();
        self.fallback.push(FallbackSlot {
            ptr: Some(raw),
            layout,
        });
        Ok(S::fallback_ptr(raw, index))
    }

    fn deallocate_fallback(&mut self, index: usize) {
        if let Some(slot) = self.fallback.get_mut(index) {
            if let Some(ptr) = slot.ptr.take() {
                // SAFETY: `slot.layout` is exactly what was passed to
                // `allocate` for this slot.
                unsafe { self.allocator.deallocate(ptr, slot.layout) };
            }
        }
    }

    fn grow_chunk(&mut self) -> Result<usize, AllocError> {
        let layout = Layout::from_size_align(self.chunk_size as usize, self.align)
            .map_err(|_| AllocError)?;
        let data = self.allocator.allocate(layout)?.cast::<u8>();
        let rec = ChunkRec {
            data,
            layout,
            first_avail: 0,
            first_dead: NO_DEAD,
            total_dead: 0,
        };
        let pos = S::insert_chunk(&mut self.chunks, rec);
        if let Some(last) = self.last_used.as_mut() {
            if pos <= *last {
                *last += 1;
            }
        }
        tracing::trace!(chunk_count = self.chunks.len(), "slab pool grew a chunk");
        Ok(pos)
    }
}

impl<A: Allocator, S: PointerScheme> Drop for SlabPool<A, S> {
    fn drop(&mut self) {
        for chunk in self.chunks.drain(..) {
            // SAFETY: `chunk.layout` is exactly what was passed to
            // `allocate` when this chunk was grown.
            unsafe { self.allocator.deallocate(chunk.data, chunk.layout) };
        }
        for slot in self.fallback.drain(..) {
            if let Some(ptr) = slot.ptr {
                // SAFETY: see `deallocate_fallback`.
                unsafe { self.allocator.deallocate(ptr, slot.layout) };
            }
        }
    }
}

unsafe fn write_dead_cell(data: NonNull<u8>, offset: u16, size: u16, next: u16) {
    let ptr = data.as_ptr().add(offset as usize);
    ptr.cast::<u16>().write_unaligned(size);
    ptr.add(2).cast::<u16>().write_unaligned(next);
}

unsafe fn read_dead_cell(data: NonNull<u8>, offset: u16) -> (u16, u16) {
    let ptr = data.as_ptr().add(offset as usize);
    let size = ptr.cast::<u16>().read_unaligned();
    let next = ptr.add(2).cast::<u16>().read_unaligned();
    (size, next)
}

#[cfg(test)]
mod tests {
    use super::*;
    use allocator_api2::alloc::Global;

    fn layout(size: usize) -> Layout {
        Layout::from_size_align(size, 8).unwrap()
    }

    #[test]
    fn nominal_allocates_within_one_chunk() {
        let mut pool: SlabPool<Global, Nominal> = SlabPool::new_in(256, 8, Global);
        let a = pool.allocate(layout(16)).unwrap();
        let b = pool.allocate(layout(16)).unwrap();
        assert_ne!(a.as_ptr(), b.as_ptr());
        assert_eq!(1, pool.stats().chunk_count);
    }

    #[test]
    fn nominal_dead_cell_is_recycled_on_exact_fit() {
        let mut pool: SlabPool<Global, Nominal> = SlabPool::new_in(256, 8, Global);
        let a = pool.allocate(layout(16)).unwrap();
        let _b = pool.allocate(layout(16)).unwrap();
        pool.deallocate(a, layout(16));
        let c = pool.allocate(layout(16)).unwrap();
        assert_eq!(a.as_ptr(), c.as_ptr());
    }

    #[test]
    fn nominal_tail_shrinks_on_dealloc_without_a_dead_cell() {
        let mut pool: SlabPool<Global, Nominal> = SlabPool::new_in(256, 8, Global);
        let a = pool.allocate(layout(16)).unwrap();
        pool.deallocate(a, layout(16));
        let b = pool.allocate(layout(16)).unwrap();
        assert_eq!(a.as_ptr(), b.as_ptr());
        assert_eq!(0, pool.chunks[0].total_dead);
    }

    #[test]
    fn nominal_freeing_sole_content_resets_the_chunk() {
        let mut pool: SlabPool<Global, Nominal> = SlabPool::new_in(256, 8, Global);
        let a = pool.allocate(layout(16)).unwrap();
        pool.deallocate(a, layout(16));
        assert_eq!(0, pool.chunks[0].first_avail);
        assert_eq!(NO_DEAD, pool.chunks[0].first_dead);
    }

    #[test]
    fn nominal_grows_a_second_chunk_when_the_first_is_full() {
        let mut pool: SlabPool<Global, Nominal> = SlabPool::new_in(32, 8, Global);
        let _a = pool.allocate(layout(24)).unwrap();
        let _b = pool.allocate(layout(24)).unwrap();
        assert_eq!(2, pool.stats().chunk_count);
    }

    #[test]
    fn oversized_request_goes_to_the_fallback_list() {
        let mut pool: SlabPool<Global, Nominal> = SlabPool::new_in(64, 8, Global);
        let big = pool.allocate(layout(4096)).unwrap();
        assert_eq!(0, pool.stats().chunk_count);
        assert_eq!(1, pool.stats().fallback_count);
        pool.deallocate(big, layout(4096));
        assert_eq!(0, pool.stats().fallback_count);
    }

    #[test]
    fn chunk_size_zero_always_falls_back() {
        let mut pool: SlabPool<Global, Nominal> = SlabPool::new_in(0, 8, Global);
        let _a = pool.allocate(layout(8)).unwrap();
        assert_eq!(0, pool.stats().chunk_count);
        assert_eq!(1, pool.stats().fallback_count);
    }

    #[test]
    fn alt_scheme_round_trips_through_compact_pointers() {
        let mut pool: SlabPool<Global, Alt> = SlabPool::new_in(256, 8, Global);
        let a = pool.allocate(layout(16)).unwrap();
        assert!(a.as_chunk().is_some());
        pool.deallocate(a, layout(16));
        let b = pool.allocate(layout(16)).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn resolve_ptr_roundtrips_for_both_schemes() {
        let mut nominal: SlabPool<Global, Nominal> = SlabPool::new_in(256, 8, Global);
        let raw = nominal.allocate(layout(16)).unwrap();
        assert_eq!(Some(raw), nominal.resolve_ptr(raw));

        let mut alt: SlabPool<Global, Alt> = SlabPool::new_in(256, 8, Global);
        let compact = alt.allocate(layout(16)).unwrap();
        let resolved = alt.resolve_ptr(compact).unwrap();
        // SAFETY: just-allocated 16-byte region.
        unsafe { resolved.as_ptr().write_bytes(0xAB, 16) };
    }

    #[test]
    fn alt_fallback_deallocation_keeps_later_indices_stable() {
        let mut pool: SlabPool<Global, Alt> = SlabPool::new_in(16, 8, Global);
        let first = pool.allocate(layout(4096)).unwrap();
        let second = pool.allocate(layout(4096)).unwrap();
        pool.deallocate(first, layout(4096));
        assert_eq!(Some(1), second.as_fallback_position());
    }

    #[test]
    fn try_grow_in_place_extends_the_live_tail() {
        let mut pool: SlabPool<Global, Nominal> = SlabPool::new_in(256, 8, Global);
        let a = pool.allocate(layout(16)).unwrap();
        assert!(pool.try_grow_in_place(a, layout(16), layout(32)));
        assert_eq!(32, pool.chunks[0].first_avail);
    }

    #[test]
    fn try_grow_in_place_fails_when_not_the_tail() {
        let mut pool: SlabPool<Global, Nominal> = SlabPool::new_in(256, 8, Global);
        let a = pool.allocate(layout(16)).unwrap();
        let _b = pool.allocate(layout(16)).unwrap();
        assert!(!pool.try_grow_in_place(a, layout(16), layout(32)));
    }

    #[test]
    fn try_shrink_in_place_retracts_the_live_tail() {
        let mut pool: SlabPool<Global, Nominal> = SlabPool::new_in(256, 8, Global);
        let a = pool.allocate(layout(32)).unwrap();
        assert!(pool.try_shrink_in_place(a, layout(32), layout(8)));
        assert_eq!(8, pool.chunks[0].first_avail);
    }

    #[test]
    fn shrink_releases_fully_empty_chunks() {
        let mut pool: SlabPool<Global, Nominal> = SlabPool::new_in(32, 8, Global);
        let a = pool.allocate(layout(16)).unwrap();
        let b = pool.allocate(layout(16)).unwrap();
        pool.deallocate(a, layout(16));
        pool.deallocate(b, layout(16));
        pool.shrink();
        assert_eq!(0, pool.stats().chunk_count);
    }

    #[test]
    fn alt_shrink_is_a_no_op_unless_every_chunk_is_empty() {
        let mut pool: SlabPool<Global, Alt> = SlabPool::new_in(32, 8, Global);
        let a = pool.allocate(layout(16)).unwrap();
        let _b = pool.allocate(layout(16)).unwrap();
        pool.deallocate(a, layout(16));
        pool.shrink();
        assert_eq!(1, pool.stats().chunk_count);
    }

    #[test]
    fn bolero_allocate_deallocate_sequences_never_double_hand_out_live_memory() {
        bolero::check!()
            .with_type::<Vec<(u8, bool)>>()
            .for_each(|ops: &Vec<(u8, bool)>| {
                let mut pool: SlabPool<Global, Nominal> = SlabPool::new_in(512, 8, Global);
                let mut live: Vec<(NonNull<u8>, Layout)> = Vec::new();
                for &(raw_size, alloc) in ops {
                    if alloc || live.is_empty() {
                        let size = (raw_size as usize % 64) + 1;
                        let l = layout(size);
                        if let Ok(ptr) = pool.allocate(l) {
                            for &(other, _) in &live {
                                assert_ne!(other, ptr, "handed out an already-live pointer");
                            }
                            live.push((ptr, l));
                        }
                    } else {
                        let (ptr, l) = live.swap_remove(raw_size as usize % live.len());
                        pool.deallocate(ptr, l);
                    }
                }
            });
    }
}
