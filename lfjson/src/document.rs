// SPDX-License-Identifier: Apache-2.0

//! The document root and its editor cursor.
//!
//! `Document` owns the root [`Value`], an object allocator, and a handle to
//! a (possibly shared) [`StringPool`]. `Cursor`/`ConstCursor` are short-lived
//! reborrows into a document's tree — the "reference carries two
//! back-references" pattern design notes call out: a cursor
//! cannot outlive the document it was built from and owns nothing itself.

use core::alloc::Layout;
use core::ptr::NonNull;
use std::cell::RefCell;
use std::rc::Rc;

use allocator_api2::alloc::{AllocError, Allocator, Global};
use lfjson_alloc::{HeapAllocator, Nominal, SlabPool};

use crate::container;
use crate::error::{Error, Result};
use crate::string_pool::StringPool;
use crate::value::{ContainerPayload, Meta, Member, Tag, Value, MAX_SHORT};

/// An [`Allocator`] over a reference-counted [`HeapAllocator`], so a
/// document's object allocator and its string pool's slab wrap the same
/// underlying instrumentation counters, keeping both coherent. `Rc`, not
/// `Arc`: the whole core is single-threaded by contract.
#[derive(Clone)]
pub struct SharedHeap(Rc<HeapAllocator>);

impl SharedHeap {
    pub fn new() -> Self {
        Self(Rc::new(HeapAllocator::new()))
    }

    pub fn stats(&self) -> lfjson_alloc::PoolStats {
        self.0.stats()
    }
}

impl Default for SharedHeap {
    fn default() -> Self {
        Self::new()
    }
}

unsafe impl Allocator for SharedHeap {
    fn allocate(&self, layout: Layout) -> core::result::Result<NonNull<[u8]>, AllocError> {
        self.0.allocate(layout)
    }

    fn allocate_zeroed(&self, layout: Layout) -> core::result::Result<NonNull<[u8]>, AllocError> {
        self.0.allocate_zeroed(layout)
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        self.0.deallocate(ptr, layout)
    }

    unsafe fn grow(
        &self,
        ptr: NonNull<u8>,
        old_layout: Layout,
        new_layout: Layout,
    ) -> core::result::Result<NonNull<[u8]>, AllocError> {
        self.0.grow(ptr, old_layout, new_layout)
    }

    unsafe fn shrink(
        &self,
        ptr: NonNull<u8>,
        old_layout: Layout,
        new_layout: Layout,
    ) -> core::result::Result<NonNull<[u8]>, AllocError> {
        self.0.shrink(ptr, old_layout, new_layout)
    }
}

/// Default per-chunk sizes.
pub const DEFAULT_STRING_CHUNK: u16 = 16 * 1024;
pub const DEFAULT_OBJECT_CHUNK: u16 = 16 * 1024;

/// Builder for a [`Document`], sizing its allocators through constructor
/// arguments rather than environment or file configuration.
#[derive(Clone, Copy)]
pub struct DocConfig {
    pub string_chunk_size: u16,
    pub object_chunk_size: u16,
    pub initial_buckets: usize,
    pub bucket_growth_factor: f64,
    pub max_load_factor: f64,
    pub capacity_hint: usize,
}

impl Default for DocConfig {
    fn default() -> Self {
        Self {
            string_chunk_size: DEFAULT_STRING_CHUNK,
            object_chunk_size: DEFAULT_OBJECT_CHUNK,
            initial_buckets: 16,
            bucket_growth_factor: 2.0,
            max_load_factor: 1.5,
            capacity_hint: 0,
        }
    }
}

impl DocConfig {
    pub fn with_string_chunk_size(mut self, v: u16) -> Self {
        self.string_chunk_size = v;
        self
    }

    pub fn with_object_chunk_size(mut self, v: u16) -> Self {
        self.object_chunk_size = v;
        self
    }

    pub fn with_max_load_factor(mut self, v: f64) -> Self {
        self.max_load_factor = v;
        self
    }

    pub fn with_capacity_hint(mut self, v: usize) -> Self {
        self.capacity_hint = v;
        self
    }
}

/// The document root: `{rootValue, sharedStringPool,
/// ownedObjectAllocator}`.
pub struct Document<A: Allocator + Clone = SharedHeap> {
    pub(crate) root: Value,
    pub(crate) pool: Rc<RefCell<StringPool<A>>>,
    pub(crate) objects: SlabPool<A, Nominal>,
}

impl Document<SharedHeap> {
    /// Builds a document with its own private string pool over the process
    /// heap, per `cfg`.
    pub fn with_config(cfg: DocConfig) -> Self {
        let heap = SharedHeap::new();
        let pool = StringPool::new_in(
            cfg.string_chunk_size,
            cfg.initial_buckets,
            cfg.bucket_growth_factor,
            cfg.max_load_factor,
            heap.clone(),
        );
        let mut objects: SlabPool<SharedHeap, Nominal> =
            SlabPool::new_in(cfg.object_chunk_size, 8, heap);
        if cfg.capacity_hint > 0 {
            // Pre-warm one chunk sized to the hint, mirroring
            // `ArenaAllocator::with_capacity`'s up-front reservation.
            let warm = Layout::from_size_align(cfg.capacity_hint.max(1), 1).unwrap();
            if let Ok(p) = objects.allocate(warm) {
                objects.deallocate(p, warm);
            }
        }
        Self {
            root: Value::null(),
            pool: Rc::new(RefCell::new(pool)),
            objects,
        }
    }

    pub fn new() -> Self {
        Self::with_config(DocConfig::default())
    }

    /// Convenience constructor pre-sizing the object allocator's first
    /// chunk for roughly-known document sizes, grounded on
    /// `ArenaAllocator::with_capacity`.
    pub fn with_capacity_hint(bytes: usize) -> Self {
        Self::with_config(DocConfig::default().with_capacity_hint(bytes))
    }

    /// Builds a document's string pool without a document around it yet, so
    /// it can be shared across several documents that should deduplicate
    /// strings against one another.
    pub fn make_shared_string_pool(cfg: DocConfig) -> Rc<RefCell<StringPool<SharedHeap>>> {
        let heap = SharedHeap::new();
        Rc::new(RefCell::new(StringPool::new_in(
            cfg.string_chunk_size,
            cfg.initial_buckets,
            cfg.bucket_growth_factor,
            cfg.max_load_factor,
            heap,
        )))
    }

    /// Builds a document around an existing shared string pool (e.g. one
    /// returned by [`Document::make_shared_string_pool`]).
    pub fn with_shared_pool(pool: Rc<RefCell<StringPool<SharedHeap>>>, cfg: DocConfig) -> Self {
        Self {
            root: Value::null(),
            pool,
            objects: SlabPool::new_in(cfg.object_chunk_size, 8, SharedHeap::new()),
        }
    }
}

impl Default for Document<SharedHeap> {
    fn default() -> Self {
        Self::new()
    }
}

/// Backing allocator with no recycling at all, handy for quick one-off
/// documents in tests where instrumentation doesn't matter.
pub type GlobalDocument = Document<Global>;

impl Document<Global> {
    pub fn with_global_alloc(cfg: DocConfig) -> Self {
        Self {
            root: Value::null(),
            pool: Rc::new(RefCell::new(StringPool::new_in(
                cfg.string_chunk_size,
                cfg.initial_buckets,
                cfg.bucket_growth_factor,
                cfg.max_load_factor,
                Global,
            ))),
            objects: SlabPool::new_in(cfg.object_chunk_size, 8, Global),
        }
    }
}

impl<A: Allocator + Clone> Document<A> {
    /// A mutable cursor at the root.
    pub fn root(&mut self) -> Cursor<'_, A> {
        let value = NonNull::from(&mut self.root);
        Cursor { doc: self, value }
    }

    /// A read-only cursor at the root.
    pub fn croot(&self) -> ConstCursor<'_, A> {
        ConstCursor {
            doc: self,
            value: &self.root,
        }
    }

    /// Recursively frees the current tree and resets the root to `Null`.
    pub fn clear(&mut self) {
        deep_free(&mut self.objects, &self.root);
        self.root = Value::null();
    }

    /// Frees every container buffer this document owns, leaving strings in
    /// the pool untouched.
    pub fn clear_objects(&mut self) {
        self.clear();
    }

    /// Releases non-key strings from the shared pool. Does not touch this
    /// document's own tree; callers that also want the tree gone should
    /// call [`Document::clear`] first.
    pub fn clear_strings(&mut self) {
        self.pool.borrow_mut().release_values();
    }

    /// Shrinks the object allocator (and, if `rehash`, the string pool's
    /// bucket array too) back down.
    pub fn shrink(&mut self, rehash: bool) {
        self.objects.shrink();
        self.pool.borrow_mut().shrink(rehash);
    }

    pub fn make_handler(&mut self, allow_int_to_double: bool) -> crate::handler::BuildHandler<'_, A> {
        crate::handler::BuildHandler::new(self, allow_int_to_double)
    }

    pub(crate) fn intern(&mut self, bytes: &[u8], key: bool) -> crate::string_pool::StrRef {
        self.pool.borrow_mut().provide(bytes, true, key, None).0
    }
}

/// Recursively frees every owned buffer reachable from `value`, using an
/// explicit worklist rather than native recursion so pathologically deep
/// trees can't blow the thread stack.
pub(crate) fn deep_free<A: Allocator>(objects: &mut SlabPool<A, Nominal>, root: &Value) {
    let mut worklist: Vec<Value> = vec![*root];
    while let Some(v) = worklist.pop() {
        match v.tag() {
            Tag::Object => {
                if let Some(payload) = v.as_container() {
                    for i in 0..payload.size {
                        // SAFETY: `i < payload.size`, buffer holds `Member`s.
                        let m: Member = unsafe { container::read_elem::<Member>(payload, i) };
                        worklist.push(m.value);
                    }
                    container::free_buffer::<A, Member>(objects, payload);
                }
            }
            Tag::Array => {
                if let Some(payload) = v.as_container() {
                    for i in 0..payload.size {
                        // SAFETY: see above.
                        let elem: Value = unsafe { container::read_elem::<Value>(payload, i) };
                        worklist.push(elem);
                    }
                    container::free_buffer::<A, Value>(objects, payload);
                }
            }
            Tag::BArray => {
                if let Some(payload) = v.as_container() {
                    container::free_buffer::<A, bool>(objects, payload);
                }
            }
            Tag::IArray => {
                if let Some(payload) = v.as_container() {
                    container::free_buffer::<A, i64>(objects, payload);
                }
            }
            Tag::DArray => {
                if let Some(payload) = v.as_container() {
                    container::free_buffer::<A, f64>(objects, payload);
                }
            }
            _ => {}
        }
    }
}

/// A mutable, short-lived reference into one document's tree. Never
/// outlives `'doc`; never owns anything.
pub struct Cursor<'doc, A: Allocator + Clone> {
    doc: &'doc mut Document<A>,
    value: NonNull<Value>,
}

/// A read-only counterpart of [`Cursor`].
pub struct ConstCursor<'doc, A: Allocator + Clone> {
    doc: &'doc Document<A>,
    value: &'doc Value,
}

impl<'doc, A: Allocator + Clone> ConstCursor<'doc, A> {
    pub fn tag(&self) -> Tag {
        self.value.tag()
    }

    pub fn meta(&self) -> Meta {
        self.value.meta()
    }

    pub fn is_null(&self) -> bool {
        self.value.is_null()
    }

    pub fn as_bool(&self) -> Option<bool> {
        self.value.as_bool()
    }

    pub fn as_i64(&self) -> Option<i64> {
        self.value.as_i64()
    }

    pub fn as_u64(&self) -> Option<u64> {
        self.value.as_u64()
    }

    pub fn as_f64(&self) -> Option<f64> {
        self.value.as_f64()
    }

    /// Borrows this cell's string bytes, resolving through the pool for
    /// `LongString` cells.
    pub fn as_str_bytes(&self) -> Option<&[u8]> {
        match self.value.tag() {
            Tag::ShortString => self.value.as_short_str_bytes(),
            Tag::LongString => {
                let r = self.value.as_long_string_ref()?;
                // SAFETY: every live `LongString` cell names a string still
                // present in this document's pool.
                let bytes = self.doc.pool.borrow().resolve(crate::string_pool::StrRef {
                    ptr: lfjson_alloc::CompactPtr::from_bits(r.ptr_bits),
                    len: r.len,
                });
                // Lifetime-erase to `'doc`: the pool outlives this document
                // by construction (it's either owned or `Rc`-shared).
                Some(unsafe { core::slice::from_raw_parts(bytes.as_ptr(), bytes.len()) })
            }
            _ => None,
        }
    }

    pub fn size(&self) -> u32 {
        self.value.size()
    }

    pub fn capacity(&self) -> u32 {
        self.value.capacity()
    }

    /// Indexed read access, bounds-checked. Only a generic `Array` has
    /// `Value`-typed elements to hand back as a cursor; specialized arrays
    /// reject this (use [`try_bool_at`](Self::try_bool_at),
    /// [`try_i64_at`](Self::try_i64_at), or [`try_f64_at`](Self::try_f64_at)
    /// instead).
    pub fn try_at(&self, index: u32) -> Result<ConstCursor<'doc, A>> {
        if self.value.tag() != Tag::Array {
            return Err(Error::WrongTag);
        }
        let payload = self.value.as_container().ok_or(Error::WrongTag)?;
        if index >= payload.size {
            return Err(Error::OutOfRange);
        }
        let (base, _) = container::element_ptr_and_capacity::<Value>(payload);
        // SAFETY: bounds-checked above.
        let ptr = unsafe { base.unwrap().as_ptr().cast::<Value>().add(index as usize) };
        Ok(ConstCursor {
            doc: self.doc,
            value: unsafe { &*ptr },
        })
    }

    /// Keyed read access into an `Object`.
    pub fn find(&self, key: &[u8]) -> Option<ConstCursor<'doc, A>> {
        if self.value.tag() != Tag::Object {
            return None;
        }
        let payload = self.value.as_container()?;
        let key_ref = self.doc.pool.borrow().get(key)?;
        let key_ptr = self.doc.pool.borrow().resolve_ptr_for(key_ref);
        let (base, _) = container::element_ptr_and_capacity::<Member>(payload);
        let base = base?;
        for i in 0..payload.size {
            // SAFETY: `i < payload.size`, buffer holds `Member`s.
            let member = unsafe { &*base.as_ptr().cast::<Member>().add(i as usize) };
            if member.key == key_ptr {
                return Some(ConstCursor {
                    doc: self.doc,
                    value: &member.value,
                });
            }
        }
        None
    }

    /// Bounds-checked element read from a `BArray`.
    pub fn try_bool_at(&self, index: u32) -> Result<bool> {
        self.specialized_at::<bool>(Tag::BArray, index)
    }

    /// Bounds-checked element read from an `IArray`.
    pub fn try_i64_at(&self, index: u32) -> Result<i64> {
        self.specialized_at::<i64>(Tag::IArray, index)
    }

    /// Bounds-checked element read from a `DArray`.
    pub fn try_f64_at(&self, index: u32) -> Result<f64> {
        self.specialized_at::<f64>(Tag::DArray, index)
    }

    fn specialized_at<T: Copy>(&self, expect: Tag, index: u32) -> Result<T> {
        if self.value.tag() != expect {
            return Err(Error::WrongTag);
        }
        let payload = self.value.as_container().ok_or(Error::WrongTag)?;
        if index >= payload.size {
            return Err(Error::OutOfRange);
        }
        // SAFETY: tag checked above names the buffer's element type; index
        // is bounds-checked against `payload.size`.
        Ok(unsafe { container::read_elem::<T>(payload, index) })
    }

    /// Forward iterator over a `BArray`'s elements.
    pub fn iter_bool(&self) -> impl Iterator<Item = bool> + '_ {
        self.specialized_iter::<bool>(Tag::BArray)
    }

    /// Forward iterator over an `IArray`'s elements.
    pub fn iter_i64(&self) -> impl Iterator<Item = i64> + '_ {
        self.specialized_iter::<i64>(Tag::IArray)
    }

    /// Forward iterator over a `DArray`'s elements.
    pub fn iter_f64(&self) -> impl Iterator<Item = f64> + '_ {
        self.specialized_iter::<f64>(Tag::DArray)
    }

    fn specialized_iter<T: Copy>(&self, expect: Tag) -> impl Iterator<Item = T> + '_ {
        let payload = self.value.as_container().filter(|_| self.value.tag() == expect);
        let size = payload.map_or(0, |p| p.size);
        (0..size).map(move |i| {
            // SAFETY: `i < size`, buffer holds `T`s matching `expect`.
            unsafe { container::read_elem::<T>(payload.unwrap(), i) }
        })
    }

    /// Forward iterator over a generic array's elements.
    pub fn iter_array(&self) -> impl Iterator<Item = ConstCursor<'doc, A>> + '_ {
        let doc = self.doc;
        let payload = self.value.as_container().filter(|_| self.value.tag() == Tag::Array);
        let (base, _) = payload.map(container::element_ptr_and_capacity::<Value>).unwrap_or((None, 0));
        let size = payload.map_or(0, |p| p.size);
        (0..size).map(move |i| {
            // SAFETY: `i < size`, buffer holds `Value`s.
            let ptr = unsafe { base.unwrap().as_ptr().cast::<Value>().add(i as usize) };
            ConstCursor {
                doc,
                value: unsafe { &*ptr },
            }
        })
    }

    /// Forward iterator over an object's `(key bytes, value cursor)` pairs.
    pub fn iter_object(&self) -> impl Iterator<Item = (&'doc [u8], ConstCursor<'doc, A>)> + '_ {
        let doc = self.doc;
        let payload = self.value.as_container().filter(|_| self.value.tag() == Tag::Object);
        let (base, _) = payload.map(container::element_ptr_and_capacity::<Member>).unwrap_or((None, 0));
        let size = payload.map_or(0, |p| p.size);
        (0..size).map(move |i| {
            // SAFETY: `i < size`, buffer holds `Member`s.
            let ptr = unsafe { base.unwrap().as_ptr().cast::<Member>().add(i as usize) };
            let member = unsafe { &*ptr };
            // SAFETY: every member key names a live pool string.
            let key_bytes = unsafe { crate::string_pool::JString::from_raw(member.key.unwrap()) }.bytes();
            (key_bytes, ConstCursor { doc, value: &member.value })
        })
    }
}

impl<'doc, A: Allocator + Clone> Cursor<'doc, A> {
    fn value(&self) -> &Value {
        // SAFETY: `self.value` always points at a live cell owned by
        // `self.doc`, which this cursor mutably borrows.
        unsafe { self.value.as_ref() }
    }

    fn value_mut(&mut self) -> &mut Value {
        // SAFETY: see `value`.
        unsafe { self.value.as_mut() }
    }

    pub fn as_const(&self) -> ConstCursor<'_, A> {
        ConstCursor {
            doc: self.doc,
            value: self.value(),
        }
    }

    pub fn tag(&self) -> Tag {
        self.value().tag()
    }

    pub fn meta(&self) -> Meta {
        self.value().meta()
    }

    pub fn is_null(&self) -> bool {
        self.value().is_null()
    }

    pub fn size(&self) -> u32 {
        self.value().size()
    }

    pub fn capacity(&self) -> u32 {
        self.value().capacity()
    }

    fn free_current(&mut self) {
        let v = *self.value();
        deep_free(&mut self.doc.objects, &v);
    }

    /// Assigns `Null`, freeing whatever the cell owned first.
    pub fn to_null(&mut self) {
        self.free_current();
        *self.value_mut() = Value::null();
    }

    pub fn set_bool(&mut self, v: bool) {
        self.free_current();
        *self.value_mut() = Value::bool(v);
    }

    pub fn set_i64(&mut self, v: i64) {
        self.free_current();
        *self.value_mut() = Value::int64(v);
    }

    pub fn set_u64(&mut self, v: u64) {
        self.free_current();
        *self.value_mut() = Value::uint64(v);
    }

    pub fn set_f64(&mut self, v: f64) {
        self.free_current();
        *self.value_mut() = Value::double(v);
    }

    /// Assigns a string, classifying it short-vs-long by length. Always
    /// copies the bytes (an "owned" string in short-vs-long terms); see
    /// [`Cursor::set_borrowed_str`] for the zero-copy path.
    pub fn set_str(&mut self, bytes: &[u8]) -> Result<()> {
        if bytes.len() > crate::string_pool::MAX_STRING_LEN {
            return Err(Error::StringTooLong);
        }
        self.free_current();
        *self.value_mut() = if bytes.len() < MAX_SHORT {
            Value::short_string(bytes)
        } else {
            let r = self.doc.pool.borrow_mut().provide(bytes, true, false, None).0;
            Value::long_string(r.into_value_payload())
        };
        Ok(())
    }

    /// Assigns a string without copying it into the pool: the caller
    /// guarantees `bytes` outlives this document.
    ///
    /// # Safety
    /// `bytes` must remain valid and unchanged for as long as this
    /// document (or anything it's been copied/shared into) can still
    /// observe this cell.
    pub unsafe fn set_borrowed_str(&mut self, bytes: &[u8]) -> Result<()> {
        if bytes.len() > crate::string_pool::MAX_STRING_LEN {
            return Err(Error::StringTooLong);
        }
        self.free_current();
        *self.value_mut() = if bytes.len() < MAX_SHORT {
            Value::short_string(bytes)
        } else {
            let external = NonNull::new(bytes.as_ptr() as *mut u8);
            let r = self
                .doc
                .pool
                .borrow_mut()
                .provide(bytes, false, false, external)
                .0;
            Value::long_string(r.into_value_payload())
        };
        Ok(())
    }

    /// Retags to an empty `Object`, freeing whatever the cell held first.
    pub fn to_object(&mut self) {
        self.free_current();
        *self.value_mut() = Value::container(
            Tag::Object,
            ContainerPayload {
                capacity: 0,
                size: 0,
                data: None,
            },
        );
    }

    pub fn to_array(&mut self) {
        self.free_current();
        *self.value_mut() = Value::container(
            Tag::Array,
            ContainerPayload {
                capacity: 0,
                size: 0,
                data: None,
            },
        );
    }

    pub fn to_barray(&mut self) {
        self.free_current();
        *self.value_mut() = Value::container(
            Tag::BArray,
            ContainerPayload {
                capacity: 0,
                size: 0,
                data: None,
            },
        );
    }

    pub fn to_iarray(&mut self) {
        self.free_current();
        *self.value_mut() = Value::container(
            Tag::IArray,
            ContainerPayload {
                capacity: 0,
                size: 0,
                data: None,
            },
        );
    }

    pub fn to_darray(&mut self) {
        self.free_current();
        *self.value_mut() = Value::container(
            Tag::DArray,
            ContainerPayload {
                capacity: 0,
                size: 0,
                data: None,
            },
        );
    }

    fn container_payload(&self) -> Result<ContainerPayload> {
        self.value().as_container().ok_or(Error::WrongTag)
    }

    /// Generic-array push.
    pub fn array_push_back(&mut self, elem: Value) -> Result<()> {
        if self.tag() != Tag::Array {
            return Err(Error::WrongTag);
        }
        let payload = self.container_payload()?;
        let grown = container::grow_for_push::<A, Value>(&mut self.doc.objects, payload);
        // SAFETY: `grown.size == payload.size < grown.capacity`.
        unsafe { container::write_elem::<Value>(grown, grown.size, elem) };
        let mut next = grown;
        next.size += 1;
        self.value_mut().set_container(next);
        Ok(())
    }

    pub fn array_pop_back(&mut self) -> Result<()> {
        if self.tag() != Tag::Array {
            return Err(Error::WrongTag);
        }
        let mut payload = self.container_payload()?;
        if payload.size == 0 {
            return Err(Error::OutOfRange);
        }
        // SAFETY: `payload.size - 1 < payload.size`.
        let popped: Value = unsafe { container::read_elem::<Value>(payload, payload.size - 1) };
        deep_free(&mut self.doc.objects, &popped);
        payload.size -= 1;
        self.value_mut().set_container(payload);
        Ok(())
    }

    /// Erases element `index`, recursively freeing what it owned first.
    pub fn array_erase(&mut self, index: u32) -> Result<()> {
        if self.tag() != Tag::Array {
            return Err(Error::WrongTag);
        }
        let mut payload = self.container_payload()?;
        if index >= payload.size {
            return Err(Error::OutOfRange);
        }
        // SAFETY: `index < payload.size`.
        let target: Value = unsafe { container::read_elem::<Value>(payload, index) };
        deep_free(&mut self.doc.objects, &target);
        // SAFETY: same bound.
        unsafe { container::erase_at::<Value>(&mut payload, index) };
        self.value_mut().set_container(payload);
        Ok(())
    }

    /// Indexed access with auto-extend-by-null ("indexed access
    /// `[i]`"): out-of-range indices append `Null` elements up to and
    /// including `index`.
    pub fn at(&mut self, index: u32) -> Result<Cursor<'_, A>> {
        if self.tag() != Tag::Array {
            return Err(Error::WrongTag);
        }
        while self.container_payload()?.size <= index {
            self.array_push_back(Value::null())?;
        }
        let payload = self.container_payload()?;
        let (base, _) = container::element_ptr_and_capacity::<Value>(payload);
        // SAFETY: just ensured `index < size <= capacity`.
        let ptr = unsafe { base.unwrap().as_ptr().cast::<Value>().add(index as usize) };
        Ok(Cursor {
            doc: self.doc,
            value: NonNull::new(ptr).unwrap(),
        })
    }

    /// Bounds-checked indexed access that never extends the array.
    pub fn try_at(&mut self, index: u32) -> Result<Cursor<'_, A>> {
        if self.tag() != Tag::Array {
            return Err(Error::WrongTag);
        }
        let payload = self.container_payload()?;
        if index >= payload.size {
            return Err(Error::OutOfRange);
        }
        let (base, _) = container::element_ptr_and_capacity::<Value>(payload);
        // SAFETY: bounds-checked above.
        let ptr = unsafe { base.unwrap().as_ptr().cast::<Value>().add(index as usize) };
        Ok(Cursor {
            doc: self.doc,
            value: NonNull::new(ptr).unwrap(),
        })
    }

    /// Keyed access with upsert semantics: a `Null` cell is retagged to
    /// `Object`; a missing key appends a new member; an existing key's
    /// value cursor is returned unchanged. Any other non-object tag is
    /// rejected rather than silently retagged — see `DESIGN.md`.
    pub fn upsert(&mut self, key: &[u8]) -> Result<Cursor<'_, A>> {
        if self.is_null() {
            self.to_object();
        }
        if self.tag() != Tag::Object {
            return Err(Error::WrongTag);
        }
        let key_ref = self.doc.intern(key, true);
        let key_ptr = {
            let pool = self.doc.pool.borrow();
            pool.resolve_ptr_for(key_ref)
        };

        let payload = self.container_payload()?;
        let (base, _) = container::element_ptr_and_capacity::<Member>(payload);
        if let Some(base) = base {
            for i in 0..payload.size {
                // SAFETY: `i < payload.size`.
                let ptr = unsafe { base.as_ptr().cast::<Member>().add(i as usize) };
                // SAFETY: same.
                let member = unsafe { &*ptr };
                if member.key == key_ptr {
                    return Ok(Cursor {
                        doc: self.doc,
                        value: NonNull::new(unsafe { &mut (*ptr).value as *mut Value }).unwrap(),
                    });
                }
            }
        }

        let payload = self.container_payload()?;
        let grown = container::grow_for_push::<A, Member>(&mut self.doc.objects, payload);
        let new_member = Member::new(key_ptr.unwrap(), Value::null());
        // SAFETY: `grown.size < grown.capacity`.
        unsafe { container::write_elem::<Member>(grown, grown.size, new_member) };
        let mut next = grown;
        next.size += 1;
        self.value_mut().set_container(next);

        let (base, _) = container::element_ptr_and_capacity::<Member>(next);
        // SAFETY: just wrote this element at `next.size - 1`.
        let ptr = unsafe { base.unwrap().as_ptr().cast::<Member>().add((next.size - 1) as usize) };
        Ok(Cursor {
            doc: self.doc,
            value: NonNull::new(unsafe { &mut (*ptr).value as *mut Value }).unwrap(),
        })
    }

    /// Read-only keyed lookup; does not upsert on miss.
    pub fn find(&mut self, key: &[u8]) -> Option<Cursor<'_, A>> {
        if self.tag() != Tag::Object {
            return None;
        }
        let key_ref = self.doc.pool.borrow().get(key)?;
        let key_ptr = self.doc.pool.borrow().resolve_ptr_for(key_ref);
        let payload = self.value().as_container()?;
        let (base, _) = container::element_ptr_and_capacity::<Member>(payload);
        let base = base?;
        for i in 0..payload.size {
            // SAFETY: `i < payload.size`.
            let ptr = unsafe { base.as_ptr().cast::<Member>().add(i as usize) };
            // SAFETY: same.
            let member = unsafe { &*ptr };
            if member.key == key_ptr {
                return Some(Cursor {
                    doc: self.doc,
                    value: NonNull::new(unsafe { &mut (*ptr).value as *mut Value }).unwrap(),
                });
            }
        }
        None
    }

    /// Erases the member named `key`, recursively freeing its value first.
    pub fn object_erase(&mut self, key: &[u8]) -> Result<()> {
        if self.tag() != Tag::Object {
            return Err(Error::WrongTag);
        }
        let key_ref = match self.doc.pool.borrow().get(key) {
            Some(r) => r,
            None => return Err(Error::OutOfRange),
        };
        let key_ptr = self.doc.pool.borrow().resolve_ptr_for(key_ref);
        let mut payload = self.container_payload()?;
        let (base, _) = container::element_ptr_and_capacity::<Member>(payload);
        let base = base.ok_or(Error::OutOfRange)?;
        for i in 0..payload.size {
            // SAFETY: `i < payload.size`.
            let ptr = unsafe { base.as_ptr().cast::<Member>().add(i as usize) };
            // SAFETY: same.
            let member = unsafe { *ptr };
            if member.key == key_ptr {
                deep_free(&mut self.doc.objects, &member.value);
                // SAFETY: `i < payload.size`.
                unsafe { container::erase_at::<Member>(&mut payload, i) };
                self.value_mut().set_container(payload);
                return Ok(());
            }
        }
        Err(Error::OutOfRange)
    }

    /// Reserves room for at least `n` more elements/members without
    /// changing `size`.
    pub fn reserve(&mut self, extra: u32) -> Result<()> {
        let payload = self.container_payload()?;
        let target = payload.size + extra;
        let grown = match self.tag() {
            Tag::Array => container::reserve::<A, Value>(&mut self.doc.objects, payload, target),
            Tag::BArray => container::reserve::<A, bool>(&mut self.doc.objects, payload, target),
            Tag::IArray => container::reserve::<A, i64>(&mut self.doc.objects, payload, target),
            Tag::DArray => container::reserve::<A, f64>(&mut self.doc.objects, payload, target),
            Tag::Object => container::reserve::<A, Member>(&mut self.doc.objects, payload, target),
            _ => return Err(Error::WrongTag),
        };
        self.value_mut().set_container(grown);
        Ok(())
    }

    /// Shrinks the container's buffer to exactly its current size, demoting
    /// a big descriptor back to inline storage when the new size drops
    /// below the sentinel.
    pub fn shrink_to_fit(&mut self) -> Result<()> {
        let payload = self.container_payload()?;
        let shrunk = match self.tag() {
            Tag::Array => container::shrink_to_fit::<A, Value>(&mut self.doc.objects, payload),
            Tag::BArray => container::shrink_to_fit::<A, bool>(&mut self.doc.objects, payload),
            Tag::IArray => container::shrink_to_fit::<A, i64>(&mut self.doc.objects, payload),
            Tag::DArray => container::shrink_to_fit::<A, f64>(&mut self.doc.objects, payload),
            Tag::Object => container::shrink_to_fit::<A, Member>(&mut self.doc.objects, payload),
            _ => return Err(Error::WrongTag),
        };
        self.value_mut().set_container(shrunk);
        Ok(())
    }

    pub fn barray_push(&mut self, v: bool) -> Result<()> {
        if self.tag() != Tag::BArray {
            return Err(Error::WrongTag);
        }
        let payload = self.container_payload()?;
        let grown = container::grow_for_push::<A, bool>(&mut self.doc.objects, payload);
        // SAFETY: room was just reserved.
        unsafe { container::write_elem::<bool>(grown, grown.size, v) };
        let mut next = grown;
        next.size += 1;
        self.value_mut().set_container(next);
        Ok(())
    }

    pub fn iarray_push(&mut self, v: i64) -> Result<()> {
        if self.tag() != Tag::IArray {
            return Err(Error::WrongTag);
        }
        let payload = self.container_payload()?;
        let grown = container::grow_for_push::<A, i64>(&mut self.doc.objects, payload);
        // SAFETY: room was just reserved.
        unsafe { container::write_elem::<i64>(grown, grown.size, v) };
        let mut next = grown;
        next.size += 1;
        self.value_mut().set_container(next);
        Ok(())
    }

    pub fn darray_push(&mut self, v: f64) -> Result<()> {
        if self.tag() != Tag::DArray {
            return Err(Error::WrongTag);
        }
        let payload = self.container_payload()?;
        let grown = container::grow_for_push::<A, f64>(&mut self.doc.objects, payload);
        // SAFETY: room was just reserved.
        unsafe { container::write_elem::<f64>(grown, grown.size, v) };
        let mut next = grown;
        next.size += 1;
        self.value_mut().set_container(next);
        Ok(())
    }

    pub fn iarray_erase(&mut self, index: u32) -> Result<()> {
        self.specialized_erase::<i64>(Tag::IArray, index)
    }

    pub fn barray_erase(&mut self, index: u32) -> Result<()> {
        self.specialized_erase::<bool>(Tag::BArray, index)
    }

    pub fn darray_erase(&mut self, index: u32) -> Result<()> {
        self.specialized_erase::<f64>(Tag::DArray, index)
    }

    fn specialized_erase<T: Copy>(&mut self, expect: Tag, index: u32) -> Result<()> {
        if self.tag() != expect {
            return Err(Error::WrongTag);
        }
        let mut payload = self.container_payload()?;
        if index >= payload.size {
            return Err(Error::OutOfRange);
        }
        // SAFETY: bounds-checked above.
        unsafe { container::erase_at::<T>(&mut payload, index) };
        self.value_mut().set_container(payload);
        Ok(())
    }

    /// Promotes a `BArray`/`IArray`/`DArray` to a generic `Array`,
    /// element-wise.
    pub fn convert_to_array(&mut self) -> Result<()> {
        let payload = self.container_payload()?;
        let converted = match self.tag() {
            Tag::BArray => {
                container::convert_in_place::<A, bool, Value>(&mut self.doc.objects, payload, 0, Value::bool)
            }
            Tag::IArray => {
                container::convert_in_place::<A, i64, Value>(&mut self.doc.objects, payload, 0, Value::int64)
            }
            Tag::DArray => {
                container::convert_in_place::<A, f64, Value>(&mut self.doc.objects, payload, 0, Value::double)
            }
            Tag::Array => return Ok(()),
            _ => return Err(Error::WrongTag),
        };
        self.value_mut()
            .retag(Tag::Array, *Value::container(Tag::Array, converted).raw_payload());
        Ok(())
    }

    /// `IArray -> DArray`, in place when the existing buffer already fits
    /// `size_of::<f64>() * capacity` bytes, otherwise allocate-copy-free.
    pub fn convert_iarray_to_darray(&mut self, reserve_for_extra: u32) -> Result<()> {
        if self.tag() != Tag::IArray {
            return Err(Error::WrongTag);
        }
        let payload = self.container_payload()?;
        let converted = container::convert_in_place::<A, i64, f64>(
            &mut self.doc.objects,
            payload,
            reserve_for_extra,
            |v| v as f64,
        );
        self.value_mut()
            .retag(Tag::DArray, *Value::container(Tag::DArray, converted).raw_payload());
        Ok(())
    }

    /// Exchanges the two 16-byte cells at `self` and `other`, rejecting the
    /// operation if they are in an ancestor/descendant relationship within
    /// the same document.
    pub fn swap(&mut self, other: &mut Cursor<'_, A>) -> Result<()> {
        let same_doc = core::ptr::eq(self.doc as *const _, other.doc as *const _);
        if same_doc
            && (would_detach(self.value(), other.value()) || would_detach(other.value(), self.value()))
        {
            return Err(Error::DetachedSwap);
        }
        core::mem::swap(self.value_mut(), other.value_mut());
        Ok(())
    }
}

/// `true` if `descendant` is reachable by walking containers starting at
/// `ancestor` — i.e. swapping them would detach a subtree.
fn would_detach(ancestor: &Value, descendant: &Value) -> bool {
    if core::ptr::eq(ancestor, descendant) {
        return true;
    }
    let Some(payload) = ancestor.as_container() else {
        return false;
    };
    match ancestor.tag() {
        Tag::Object => {
            let (base, _) = container::element_ptr_and_capacity::<Member>(payload);
            let Some(base) = base else { return false };
            for i in 0..payload.size {
                // SAFETY: `i < payload.size`, buffer holds live `Member`s.
                let member = unsafe { &*base.as_ptr().cast::<Member>().add(i as usize) };
                if would_detach(&member.value, descendant) {
                    return true;
                }
            }
            false
        }
        Tag::Array => {
            let (base, _) = container::element_ptr_and_capacity::<Value>(payload);
            let Some(base) = base else { return false };
            for i in 0..payload.size {
                // SAFETY: `i < payload.size`, buffer holds live `Value`s.
                let elem = unsafe { &*base.as_ptr().cast::<Value>().add(i as usize) };
                if would_detach(elem, descendant) {
                    return true;
                }
            }
            false
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_starts_null() {
        let mut doc = Document::with_global_alloc(DocConfig::default());
        assert!(doc.root().is_null());
    }

    #[test]
    fn assign_and_read_back_scalars() {
        let mut doc = Document::with_global_alloc(DocConfig::default());
        doc.root().set_i64(42);
        assert_eq!(Some(42), doc.croot().as_i64());
    }

    #[test]
    fn short_vs_long_string_threshold() {
        let mut doc = Document::with_global_alloc(DocConfig::default());
        doc.root().set_str(b"abcdefghijkl").unwrap();
        assert_eq!(Tag::ShortString, doc.croot().tag());
        doc.root().set_str(b"abcdefghijklmn").unwrap();
        assert_eq!(Tag::LongString, doc.croot().tag());
    }

    #[test]
    fn object_upsert_then_find() {
        let mut doc = Document::with_global_alloc(DocConfig::default());
        doc.root().to_object();
        doc.root().upsert(b"a").unwrap().set_i64(1);
        assert_eq!(Some(1), doc.root().find(b"a").unwrap().as_const().as_i64());
        assert!(doc.root().find(b"missing").is_none());
    }

    #[test]
    fn array_auto_extends_with_null() {
        let mut doc = Document::with_global_alloc(DocConfig::default());
        doc.root().to_array();
        doc.root().at(2).unwrap().set_i64(7);
        assert_eq!(3, doc.croot().size());
        assert!(doc.croot().try_at(0).unwrap().is_null());
        assert_eq!(Some(7), doc.croot().try_at(2).unwrap().as_i64());
    }

    #[test]
    fn array_erase_preserves_order() {
        let mut doc = Document::with_global_alloc(DocConfig::default());
        doc.root().to_array();
        for i in 0..5 {
            doc.root().at(i).unwrap().set_i64(i as i64);
        }
        doc.root().array_erase(2).unwrap();
        let values: Vec<i64> = doc.croot().iter_array().map(|c| c.as_i64().unwrap()).collect();
        assert_eq!(vec![0, 1, 3, 4], values);
    }

    #[test]
    fn swap_rejects_ancestor_descendant() {
        let mut doc = Document::with_global_alloc(DocConfig::default());
        doc.root().to_array();
        doc.root().at(0).unwrap().set_i64(1);

        // A copy of the root cell still carries the live buffer pointer, so
        // this reaches the actual element 0 without holding two overlapping
        // cursors into `doc` at once.
        let ancestor = *doc.root().value();
        let payload = ancestor.as_container().unwrap();
        let (base, _) = container::element_ptr_and_capacity::<Value>(payload);
        let descendant = unsafe { &*base.unwrap().as_ptr().cast::<Value>() };
        assert!(would_detach(&ancestor, descendant));
    }

    #[test]
    fn clear_resets_to_null_and_frees() {
        let mut doc = Document::with_global_alloc(DocConfig::default());
        doc.root().to_array();
        for i in 0..10 {
            doc.root().at(i).unwrap().set_i64(i as i64);
        }
        doc.clear();
        assert!(doc.croot().is_null());
    }
}
