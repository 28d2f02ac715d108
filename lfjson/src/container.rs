// SPDX-License-Identifier: Apache-2.0

//! Reserve/grow/shrink/erase/convert primitives shared by every container
//! kind, parametric over the element type (`Value`, `bool`,
//! `i64`, `f64`, `Member`). These functions only move bytes around and talk
//! to the object allocator; they never recursively free the document
//! subtrees an element might own — that is [`crate::document`]'s job,
//! performed before calling [`erase_at`], which only shifts the tail down.
//!
//! Mirrors the realloc-first, allocate-copy-free-fallback idiom
//! `libdd-alloc/src/linear.rs` uses for its own grow/shrink.

use core::alloc::Layout;
use core::ptr::NonNull;

use allocator_api2::alloc::Allocator;
use lfjson_alloc::{Nominal, SlabPool};

use crate::value::{BigHeader, ContainerPayload, BIG_SENTINEL};

type ObjAlloc<A> = SlabPool<A, Nominal>;

fn is_big(capacity: u16) -> bool {
    capacity == BIG_SENTINEL
}

/// Layout (and, for the big variant, the byte offset to the element array)
/// of the buffer a container payload with `capacity` elements of type `T`
/// currently occupies.
fn buffer_layout<T>(capacity: u32, big: bool) -> Option<(Layout, usize)> {
    if capacity == 0 && !big {
        return None;
    }
    if big {
        let header = Layout::new::<BigHeader>();
        let arr = Layout::array::<T>(capacity as usize).ok()?;
        let (combined, offset) = header.extend(arr).ok()?;
        Some((combined.pad_to_align(), offset))
    } else {
        Layout::array::<T>(capacity as usize)
            .ok()
            .map(|l| (l, 0))
    }
}

/// Where the element buffer for `payload` starts, and its real capacity
/// (resolving through the [`BigHeader`] when `capacity == BIG_SENTINEL`).
pub(crate) fn element_ptr_and_capacity<T>(payload: ContainerPayload) -> (Option<NonNull<u8>>, u32) {
    if is_big(payload.capacity) {
        match payload.data {
            None => (None, 0),
            Some(hdr) => {
                // SAFETY: a `BIG_SENTINEL` payload always addresses a live
                // `BigHeader` written by `promote_to_big` below.
                let capacity = unsafe { hdr.cast::<BigHeader>().as_ref().capacity };
                let (_, offset) = buffer_layout::<T>(capacity, true).expect("big layout");
                // SAFETY: `offset` is the header's padded size.
                let elems = unsafe { NonNull::new_unchecked(hdr.as_ptr().add(offset)) };
                (Some(elems), capacity)
            }
        }
    } else {
        (payload.data, payload.capacity as u32)
    }
}

/// Reads element `index` out of `payload`'s buffer. Caller guarantees
/// `index < payload.size`.
///
/// # Safety
/// `index` must be in bounds and `T` must match the container's actual
/// specialization.
pub(crate) unsafe fn read_elem<T: Copy>(payload: ContainerPayload, index: u32) -> T {
    let (base, _) = element_ptr_and_capacity::<T>(payload);
    base.expect("non-empty container has a buffer")
        .as_ptr()
        .cast::<T>()
        .add(index as usize)
        .read_unaligned()
}

/// Writes element `index` into `payload`'s buffer.
///
/// # Safety
/// `index` must be `< capacity` and `T` must match the specialization.
pub(crate) unsafe fn write_elem<T: Copy>(payload: ContainerPayload, index: u32, value: T) {
    let (base, _) = element_ptr_and_capacity::<T>(payload);
    base.expect("buffer exists")
        .as_ptr()
        .cast::<T>()
        .add(index as usize)
        .write_unaligned(value);
}

/// Ensures `payload` has room for at least `min_capacity` elements,
/// growing (and promoting to a [`BigHeader`] if `min_capacity` reaches the
/// sentinel) if necessary. A no-op if already large enough.
pub(crate) fn reserve<A: Allocator, T: Copy>(
    alloc: &mut ObjAlloc<A>,
    payload: ContainerPayload,
    min_capacity: u32,
) -> ContainerPayload {
    let (_, cur_cap) = element_ptr_and_capacity::<T>(payload);
    if cur_cap >= min_capacity {
        return payload;
    }
    resize_buffer::<A, T>(alloc, payload, min_capacity)
}

/// Grows `payload` by one slot's worth of headroom using the push-back
/// growth formula (`ceil(capacity * 1.5)`, or 1 from empty).
pub(crate) fn grow_for_push<A: Allocator, T: Copy>(
    alloc: &mut ObjAlloc<A>,
    payload: ContainerPayload,
) -> ContainerPayload {
    let (_, cur_cap) = element_ptr_and_capacity::<T>(payload);
    if payload.size < cur_cap {
        return payload;
    }
    let new_cap = if cur_cap == 0 {
        1
    } else {
        ((cur_cap as u64 * 3).div_ceil(2)) as u32
    };
    resize_buffer::<A, T>(alloc, payload, new_cap)
}

/// Shrinks `payload`'s buffer to exactly `payload.size` elements, demoting
/// a [`BigHeader`] back to an inline buffer when the new size drops below
/// the sentinel.
pub(crate) fn shrink_to_fit<A: Allocator, T: Copy>(
    alloc: &mut ObjAlloc<A>,
    payload: ContainerPayload,
) -> ContainerPayload {
    let (_, cur_cap) = element_ptr_and_capacity::<T>(payload);
    if cur_cap == payload.size {
        return payload;
    }
    resize_buffer::<A, T>(alloc, payload, payload.size)
}

fn resize_buffer<A: Allocator, T: Copy>(
    alloc: &mut ObjAlloc<A>,
    payload: ContainerPayload,
    new_cap: u32,
) -> ContainerPayload {
    let old_big = is_big(payload.capacity);
    let (_, old_cap) = element_ptr_and_capacity::<T>(payload);
    let new_big = new_cap >= BIG_SENTINEL as u32;

    let old_buf = if old_cap == 0 { None } else { payload.data };

    // In-place resize is only attempted when the big/small shape doesn't
    // change: a big container's live region starts at `payload.data`
    // (the header), a small one's at the element buffer directly, so
    // growing/shrinking in place means growing/shrinking that same region.
    if !old_big && !new_big {
        if let (Some((old_layout, _)), Some((new_layout, _))) = (
            buffer_layout::<T>(old_cap, false),
            buffer_layout::<T>(new_cap, false),
        ) {
            if let Some(ptr) = old_buf {
                let grew = if new_cap > old_cap {
                    alloc.try_grow_in_place(ptr, old_layout, new_layout)
                } else {
                    alloc.try_shrink_in_place(ptr, old_layout, new_layout)
                };
                if grew {
                    return ContainerPayload {
                        capacity: new_cap as u16,
                        size: payload.size,
                        data: Some(ptr),
                    };
                }
            } else if new_cap > 0 {
                let (new_layout, _) = buffer_layout::<T>(new_cap, false).unwrap();
                let fresh = alloc
                    .allocate(new_layout)
                    .expect("lfjson: object allocator exhausted");
                return ContainerPayload {
                    capacity: new_cap as u16,
                    size: payload.size,
                    data: Some(fresh),
                };
            }
        }
    }
    if old_big == new_big && old_big {
        // Both big: grow/shrink the combined (header + array) region.
        if let (Some((old_layout, _)), Some((new_layout, _))) = (
            buffer_layout::<T>(old_cap, true),
            buffer_layout::<T>(new_cap, true),
        ) {
            if let Some(ptr) = old_buf {
                let grew = if new_cap > old_cap {
                    alloc.try_grow_in_place(ptr, old_layout, new_layout)
                } else {
                    alloc.try_shrink_in_place(ptr, old_layout, new_layout)
                };
                if grew {
                    // SAFETY: `ptr` addresses a live `BigHeader`.
                    unsafe { ptr.cast::<BigHeader>().as_ptr().write(BigHeader { capacity: new_cap }) };
                    return ContainerPayload {
                        capacity: BIG_SENTINEL,
                        size: payload.size,
                        data: Some(ptr),
                    };
                }
            }
        }
    }

    // Allocate-copy-free fallback, covering big<->small transitions too.
    let copy_count = old_cap.min(new_cap).min(payload.size) as usize;

    let fresh_payload = if new_cap == 0 {
        ContainerPayload {
            capacity: 0,
            size: payload.size,
            data: None,
        }
    } else if new_big {
        let (new_layout, offset) = buffer_layout::<T>(new_cap, true).expect("big layout");
        let fresh = alloc
            .allocate(new_layout)
            .expect("lfjson: object allocator exhausted");
        // SAFETY: `fresh` addresses a region at least `new_layout.size()`.
        unsafe {
            fresh.as_ptr().cast::<BigHeader>().write(BigHeader { capacity: new_cap });
            if copy_count > 0 {
                let (old_base, _) = element_ptr_and_capacity::<T>(payload);
                core::ptr::copy_nonoverlapping(
                    old_base.unwrap().as_ptr().cast::<T>(),
                    fresh.as_ptr().add(offset).cast::<T>(),
                    copy_count,
                );
            }
        }
        ContainerPayload {
            capacity: BIG_SENTINEL,
            size: payload.size,
            data: Some(fresh),
        }
    } else {
        let (new_layout, _) = buffer_layout::<T>(new_cap, false).expect("small layout");
        let fresh = alloc
            .allocate(new_layout)
            .expect("lfjson: object allocator exhausted");
        if copy_count > 0 {
            let (old_base, _) = element_ptr_and_capacity::<T>(payload);
            // SAFETY: both regions are at least `copy_count * size_of::<T>()`.
            unsafe {
                core::ptr::copy_nonoverlapping(
                    old_base.unwrap().as_ptr().cast::<T>(),
                    fresh.as_ptr().cast::<T>(),
                    copy_count,
                )
            };
        }
        ContainerPayload {
            capacity: new_cap as u16,
            size: payload.size,
            data: Some(fresh),
        }
    };

    if let Some(ptr) = old_buf {
        if let Some((old_layout, _)) = buffer_layout::<T>(old_cap, old_big) {
            // SAFETY: `ptr`/`old_layout` are exactly what this payload was
            // last allocated or resized with.
            unsafe { alloc.deallocate(ptr, old_layout) };
        }
    }
    fresh_payload
}

/// Removes element `index`, shifting the tail left by one and decrementing
/// size. The caller must already have recursively freed whatever `index`
/// owned.
///
/// # Safety
/// `index` must be `< payload.size`.
pub(crate) unsafe fn erase_at<T: Copy>(payload: &mut ContainerPayload, index: u32) {
    let (base, _) = element_ptr_and_capacity::<T>(*payload);
    let base = base.expect("erase on a non-empty container").as_ptr().cast::<T>();
    let tail = payload.size - index - 1;
    if tail > 0 {
        core::ptr::copy(base.add(index as usize + 1), base.add(index as usize), tail as usize);
    }
    payload.size -= 1;
}

/// Inserts `value` at `index`, shifting the tail right by one. Caller must
/// have already reserved capacity `>= size + 1`.
///
/// # Safety
/// `index <= payload.size` and capacity must exceed size.
pub(crate) unsafe fn insert_at<T: Copy>(payload: &mut ContainerPayload, index: u32, value: T) {
    let (base, cap) = element_ptr_and_capacity::<T>(*payload);
    debug_assert!(payload.size < cap);
    let base = base.expect("insert into a reserved container").as_ptr().cast::<T>();
    let tail = payload.size - index;
    if tail > 0 {
        core::ptr::copy(base.add(index as usize), base.add(index as usize + 1), tail as usize);
    }
    base.add(index as usize).write_unaligned(value);
    payload.size += 1;
}

/// Frees the element buffer (and, if big, its header) entirely — used when
/// a whole container cell is retagged or dropped.
pub(crate) fn free_buffer<A: Allocator, T: Copy>(alloc: &mut ObjAlloc<A>, payload: ContainerPayload) {
    let big = is_big(payload.capacity);
    let (_, cap) = element_ptr_and_capacity::<T>(payload);
    if let Some((layout, _)) = buffer_layout::<T>(cap, big) {
        if let Some(ptr) = payload.data {
            // SAFETY: `ptr`/`layout` describe exactly this payload's buffer.
            unsafe { alloc.deallocate(ptr, layout) };
        }
    }
}

/// Converts a buffer of `From` elements into a buffer of `To` elements in
/// place where possible (same element size and the existing allocation
/// already fits `size_of::<To>() * capacity`), otherwise allocate-copy-free.
/// `widen` maps one `From` into one `To`. Used for `IArray -> DArray`
/// widening, in place when the element count and buffer size allow it.
pub(crate) fn convert_in_place<A: Allocator, From: Copy, To: Copy>(
    alloc: &mut ObjAlloc<A>,
    payload: ContainerPayload,
    extra: u32,
    widen: impl Fn(From) -> To,
) -> ContainerPayload {
    let (_, cap) = element_ptr_and_capacity::<From>(payload);
    let new_cap = cap + extra;
    // In-place widening assumes the allocator never returns a buffer
    // smaller than `size * size_of::<To>()` bytes; enforced here by only
    // taking the in-place path when the region the allocator actually
    // granted is large enough, never assumed.
    let can_widen_in_place = extra == 0
        && core::mem::size_of::<To>() >= core::mem::size_of::<From>()
        && buffer_layout::<To>(new_cap, is_big(payload.capacity))
            .map(|(l, _)| l.size())
            == buffer_layout::<From>(cap, is_big(payload.capacity)).map(|(l, _)| l.size());

    if can_widen_in_place {
        let (base, _) = element_ptr_and_capacity::<From>(payload);
        if let Some(base) = base {
            // Widen back-to-front so a larger `To` never overwrites a
            // `From` it hasn't read yet.
            for i in (0..payload.size).rev() {
                // SAFETY: reading a live `From` and writing its widened
                // `To` into the same, still-large-enough, slot.
                unsafe {
                    let from_val = base.as_ptr().cast::<From>().add(i as usize).read_unaligned();
                    let to_val = widen(from_val);
                    base.as_ptr().cast::<To>().add(i as usize).write_unaligned(to_val);
                }
            }
            return ContainerPayload {
                capacity: payload.capacity,
                size: payload.size,
                data: Some(base),
            };
        }
    }

    let mut fresh: ContainerPayload = ContainerPayload {
        capacity: 0,
        size: 0,
        data: None,
    };
    fresh = reserve::<A, To>(alloc, fresh, new_cap.max(payload.size));
    fresh.size = payload.size;
    let (from_base, _) = element_ptr_and_capacity::<From>(payload);
    let (to_base, _) = element_ptr_and_capacity::<To>(fresh);
    if let (Some(from_base), Some(to_base)) = (from_base, to_base) {
        for i in 0..payload.size {
            // SAFETY: `i < payload.size <= fresh.capacity`.
            unsafe {
                let from_val = from_base.as_ptr().cast::<From>().add(i as usize).read_unaligned();
                to_base
                    .as_ptr()
                    .cast::<To>()
                    .add(i as usize)
                    .write_unaligned(widen(from_val));
            }
        }
    }
    free_buffer::<A, From>(alloc, payload);
    fresh
}

#[cfg(test)]
mod tests {
    use super::*;
    use allocator_api2::alloc::Global;

    fn empty() -> ContainerPayload {
        ContainerPayload {
            capacity: 0,
            size: 0,
            data: None,
        }
    }

    #[test]
    fn grow_for_push_starts_at_one() {
        let mut alloc: ObjAlloc<Global> = SlabPool::new_in(4096, 8, Global);
        let p = grow_for_push::<_, i64>(&mut alloc, empty());
        assert_eq!(1, element_ptr_and_capacity::<i64>(p).1);
    }

    #[test]
    fn push_sequence_grows_and_preserves_values() {
        let mut alloc: ObjAlloc<Global> = SlabPool::new_in(4096, 8, Global);
        let mut p = empty();
        for i in 0..40i64 {
            p = grow_for_push::<_, i64>(&mut alloc, p);
            unsafe { write_elem::<i64>(p, p.size, i) };
            p.size += 1;
        }
        for i in 0..40i64 {
            assert_eq!(i, unsafe { read_elem::<i64>(p, i as u32) });
        }
    }

    #[test]
    fn erase_shifts_tail_left() {
        let mut alloc: ObjAlloc<Global> = SlabPool::new_in(4096, 8, Global);
        let mut p = empty();
        for i in 0..5i64 {
            p = grow_for_push::<_, i64>(&mut alloc, p);
            unsafe { write_elem::<i64>(p, p.size, i) };
            p.size += 1;
        }
        unsafe { erase_at::<i64>(&mut p, 2) };
        assert_eq!(4, p.size);
        let values: Vec<i64> = (0..p.size).map(|i| unsafe { read_elem::<i64>(p, i) }).collect();
        assert_eq!(vec![0, 1, 3, 4], values);
    }

    #[test]
    fn shrink_to_fit_reduces_capacity_to_size() {
        let mut alloc: ObjAlloc<Global> = SlabPool::new_in(4096, 8, Global);
        let mut p = empty();
        for i in 0..10i64 {
            p = grow_for_push::<_, i64>(&mut alloc, p);
            unsafe { write_elem::<i64>(p, p.size, i) };
            p.size += 1;
        }
        unsafe { erase_at::<i64>(&mut p, 9) };
        unsafe { erase_at::<i64>(&mut p, 8) };
        p = shrink_to_fit::<_, i64>(&mut alloc, p);
        assert_eq!(8, element_ptr_and_capacity::<i64>(p).1);
    }

    #[test]
    fn convert_i_to_d_widens_values() {
        let mut alloc: ObjAlloc<Global> = SlabPool::new_in(8192, 8, Global);
        let mut p = empty();
        for i in [0i64, 1_000_000_000, 2_000_000_000] {
            p = grow_for_push::<_, i64>(&mut alloc, p);
            unsafe { write_elem::<i64>(p, p.size, i) };
            p.size += 1;
        }
        let widened = convert_in_place::<_, i64, f64>(&mut alloc, p, 3, |v| v as f64);
        assert_eq!(3, widened.size);
        for i in 0..3u32 {
            let expected = [0i64, 1_000_000_000, 2_000_000_000][i as usize] as f64;
            assert_eq!(expected, unsafe { read_elem::<f64>(widened, i) });
        }
        assert_eq!(6, element_ptr_and_capacity::<f64>(widened).1);
    }
}
