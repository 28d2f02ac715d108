// SPDX-License-Identifier: Apache-2.0

//! A memory-optimized, JSON-shaped document model: packed 16-byte tagged
//! values, an interned string pool, and a chunked slab allocator for
//! container storage, all sitting underneath a streaming build handler and
//! an editor-style cursor API.
//!
//! This crate has no parser and no serializer of its own; [`BuildHandler`]
//! is the seam a caller's own JSON (or other tree-shaped) source feeds
//! through to construct a [`Document`].

mod container;
mod document;
mod error;
mod handler;
mod string_pool;
mod value;

pub use document::{
    ConstCursor, Cursor, DocConfig, Document, GlobalDocument, SharedHeap, DEFAULT_OBJECT_CHUNK,
    DEFAULT_STRING_CHUNK,
};
pub use error::{Error, Result};
pub use handler::BuildHandler;
pub use string_pool::{StrRef, StringPool, MAX_STRING_LEN};
pub use value::{Member, Meta, Tag, Value, MAX_SHORT, PAYLOAD_LEN};

// Re-exported so downstream crates can name the allocator types this
// crate's generic `A: Allocator + Clone` parameter expects without a direct
// `lfjson-alloc` dependency.
pub use lfjson_alloc::{AllocError, Allocator, HeapAllocator, StackAllocator};
