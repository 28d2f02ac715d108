// SPDX-License-Identifier: Apache-2.0

//! Chunk-based slab allocation for `lfjson`.
//!
//! This crate has no knowledge of JSON, strings, or values: it is the base
//! allocator contract plus the chunked slab pool allocator that both the
//! string pool and the document's object allocator are built on.
//!
//! Unlike many embedded allocator crates this one is not `no_std`: the chunk
//! and fallback-slot bookkeeping vectors (a handful of pointers and `u16`s
//! per chunk, never the JSON content itself) ride on the ambient global
//! allocator via `std::vec::Vec`, which keeps [`SlabPool`] simple to read.
//! The data chunks and oversized fallback allocations that actually hold
//! document content always go through the generic `A: Allocator`.

mod base;
mod compact;
mod slab;

pub use base::{HeapAllocator, PoolStats, StackAllocator};
pub use compact::CompactPtr;
pub use slab::{Alt, Nominal, PointerScheme, SlabPool, SlabStats};

// Re-export so downstream crates don't need a direct `allocator-api2` dependency
// to name `AllocError` / `Allocator` in their own signatures.
pub use allocator_api2::alloc::{AllocError, Allocator};
