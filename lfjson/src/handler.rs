// SPDX-License-Identifier: Apache-2.0

//! The streaming build handler: a SAX-style event sink that
//! assembles a [`Document`] tree from a sequence of `start/end/push` calls,
//! without needing a parser of its own.
//!
//! Uses a chunk-doubling growth policy for its own bookkeeping stack: an
//! initial capacity of 64 frames, doubled on exhaustion, since frames here
//! are a handful of bytes each rather than document content.

use crate::document::{Cursor, Document};
use crate::error::{Error, Result};
use crate::value::Tag;
use allocator_api2::alloc::Allocator;

/// Tracks which homogeneous specialization (if any) an in-progress array
/// has committed to. `Mixed` means the array has already been promoted to a
/// generic `Array`, or was never a scalar-only run to begin with.
#[derive(Clone, Copy, PartialEq, Eq)]
enum Specialization {
    Undetermined,
    Bool,
    Int,
    Double,
    Mixed,
}

/// The step taken from a container's parent to reach it, recorded so the
/// handler can re-descend to any open frame without holding a live borrow
/// into the document between calls.
#[derive(Clone)]
enum Step {
    Key(Vec<u8>),
    Index(u32),
}

/// One level of container currently under construction. `reached_by` is
/// `None` only for the outermost frame, whose container is the document
/// root itself.
struct Frame {
    tag: Tag,
    spec: Specialization,
    count: u32,
    reached_by: Option<Step>,
}

/// One incoming scalar value, carrying just enough to classify its array
/// specialization and to apply itself to a landed cursor.
enum Scalar<'a> {
    Null,
    Bool(bool),
    Int(i64),
    UInt(u64),
    Double(f64),
    Str(&'a [u8]),
}

impl<'a> Scalar<'a> {
    fn specialization(&self) -> Specialization {
        match self {
            Scalar::Bool(_) => Specialization::Bool,
            Scalar::Int(_) => Specialization::Int,
            Scalar::Double(_) => Specialization::Double,
            Scalar::Null | Scalar::UInt(_) | Scalar::Str(_) => Specialization::Mixed,
        }
    }

    fn as_bool(&self) -> Option<bool> {
        match self {
            Scalar::Bool(v) => Some(*v),
            _ => None,
        }
    }

    fn as_i64(&self) -> Option<i64> {
        match self {
            Scalar::Int(v) => Some(*v),
            _ => None,
        }
    }

    /// Value for a `DArray` slot: either side of an `Int`/`Double` mix
    /// widens to `f64`.
    fn as_f64_for_double(&self) -> Option<f64> {
        match self {
            Scalar::Int(v) => Some(*v as f64),
            Scalar::Double(v) => Some(*v),
            _ => None,
        }
    }
}

/// Assigns `value` to a landed scalar slot. Infallible for every variant but
/// `Str`, which can fail on the pool's length cap.
fn assign_scalar<A: Allocator + Clone>(cursor: &mut Cursor<'_, A>, value: Scalar<'_>) -> Result<()> {
    match value {
        Scalar::Null => cursor.to_null(),
        Scalar::Bool(v) => cursor.set_bool(v),
        Scalar::Int(v) => cursor.set_i64(v),
        Scalar::UInt(v) => cursor.set_u64(v),
        Scalar::Double(v) => cursor.set_f64(v),
        Scalar::Str(bytes) => return cursor.set_str(bytes),
    }
    Ok(())
}

/// Transition table an in-progress array's specialization follows as new
/// element kinds arrive. `Undetermined` adopts whatever comes first; a
/// matching kind holds; an `Int`/`Double` mix widens to `Double` only when
/// the caller opted in; anything else falls back to `Mixed` for good.
fn combine(current: Specialization, incoming: Specialization, allow_int_to_double: bool) -> Specialization {
    match (current, incoming) {
        (Specialization::Undetermined, k) => k,
        (a, b) if a == b => a,
        (Specialization::Int, Specialization::Double) | (Specialization::Double, Specialization::Int)
            if allow_int_to_double =>
        {
            Specialization::Double
        }
        _ => Specialization::Mixed,
    }
}

/// Retags the array cell itself to match a specialization change `combine`
/// decided on. A no-op when nothing changed.
fn transition_array<A: Allocator + Clone>(
    cursor: &mut Cursor<'_, A>,
    from: Specialization,
    to: Specialization,
) -> Result<()> {
    if from == to {
        return Ok(());
    }
    match (from, to) {
        (Specialization::Undetermined, Specialization::Bool) => {
            cursor.to_barray();
            Ok(())
        }
        (Specialization::Undetermined, Specialization::Int) => {
            cursor.to_iarray();
            Ok(())
        }
        (Specialization::Undetermined, Specialization::Double) => {
            cursor.to_darray();
            Ok(())
        }
        (Specialization::Undetermined, Specialization::Mixed) => Ok(()),
        (Specialization::Int, Specialization::Double) => cursor.convert_iarray_to_darray(0),
        (_, Specialization::Mixed) => cursor.convert_to_array(),
        _ => Ok(()),
    }
}

/// Folds `kind` into `*spec` and applies whatever retagging the resulting
/// transition calls for. Takes `spec`/`allow_int_to_double` by value/plain
/// reference rather than `&mut BuildHandler` so the caller can keep a
/// `Cursor` borrowing the handler's document alive across the call.
fn apply_array_transition<A: Allocator + Clone>(
    spec: &mut Specialization,
    allow_int_to_double: bool,
    kind: Specialization,
    cursor: &mut Cursor<'_, A>,
) -> Result<Specialization> {
    let new_spec = combine(*spec, kind, allow_int_to_double);
    transition_array(cursor, *spec, new_spec)?;
    *spec = new_spec;
    Ok(new_spec)
}

/// Streaming event sink driving one [`Document`]'s construction. Each
/// `push*` call lands either directly on the document root (before any
/// `start_object`/`start_array`) or inside the currently-open container,
/// re-descending the frame stack by key/index on every call rather than
/// holding a cursor alive across calls.
pub struct BuildHandler<'doc, A: Allocator + Clone> {
    doc: &'doc mut Document<A>,
    stack: Vec<Frame>,
    pending_key: Option<Vec<u8>>,
    allow_int_to_double: bool,
}

/// Re-descends from the document root through `steps`, landing on the
/// container each step names. Takes `doc` explicitly (rather than `&mut
/// self`) so the returned cursor only borrows the document field, leaving
/// the handler's other fields free for the caller to inspect concurrently.
fn descend<'a, A: Allocator + Clone>(doc: &'a mut Document<A>, steps: &[Step]) -> Result<Cursor<'a, A>> {
    let mut cursor = doc.root();
    for step in steps {
        cursor = match step {
            Step::Key(key) => cursor.upsert(key)?,
            Step::Index(index) => cursor.at(*index)?,
        };
    }
    Ok(cursor)
}

impl<'doc, A: Allocator + Clone> BuildHandler<'doc, A> {
    pub(crate) fn new(doc: &'doc mut Document<A>, allow_int_to_double: bool) -> Self {
        Self {
            doc,
            stack: Vec::with_capacity(64),
            pending_key: None,
            allow_int_to_double,
        }
    }

    fn steps_to_top(&self) -> Vec<Step> {
        self.stack[1..]
            .iter()
            .map(|f| f.reached_by.clone().expect("non-root frame always has a path"))
            .collect()
    }

    pub fn start_object(&mut self) -> Result<()> {
        self.open_container(Tag::Object)
    }

    pub fn start_array(&mut self) -> Result<()> {
        self.open_container(Tag::Array)
    }

    fn open_container(&mut self, tag: Tag) -> Result<()> {
        if self.stack.is_empty() {
            let mut root = self.doc.root();
            match tag {
                Tag::Object => root.to_object(),
                Tag::Array => root.to_array(),
                _ => unreachable!("open_container only called with Object or Array"),
            }
            self.stack.push(Frame {
                tag,
                spec: Specialization::Undetermined,
                count: 0,
                reached_by: None,
            });
            return Ok(());
        }

        let steps = self.steps_to_top();
        let mut cursor = descend(self.doc, &steps)?;
        let top_idx = self.stack.len() - 1;
        let parent_tag = self.stack[top_idx].tag;
        let (mut child, step_for_new) = match parent_tag {
            Tag::Object => {
                let key = self.pending_key.take().ok_or(Error::OutOfRange)?;
                let c = cursor.upsert(&key)?;
                (c, Step::Key(key))
            }
            Tag::Array => {
                // A nested object/array can only ever live in a generic
                // `Array`; force the promotion before descending into it.
                apply_array_transition(
                    &mut self.stack[top_idx].spec,
                    self.allow_int_to_double,
                    Specialization::Mixed,
                    &mut cursor,
                )?;
                let index = self.stack[top_idx].count;
                let c = cursor.at(index)?;
                (c, Step::Index(index))
            }
            _ => return Err(Error::WrongTag),
        };
        match tag {
            Tag::Object => child.to_object(),
            Tag::Array => child.to_array(),
            _ => unreachable!("open_container only called with Object or Array"),
        }
        self.stack[top_idx].count += 1;
        self.stack.push(Frame {
            tag,
            spec: Specialization::Undetermined,
            count: 0,
            reached_by: Some(step_for_new),
        });
        Ok(())
    }

    pub fn end_object(&mut self, member_count: u32) -> Result<()> {
        self.close_container(Tag::Object, member_count)
    }

    pub fn end_array(&mut self, element_count: u32) -> Result<()> {
        self.close_container(Tag::Array, element_count)
    }

    fn close_container(&mut self, expect: Tag, expect_count: u32) -> Result<()> {
        let frame = self.stack.pop().ok_or(Error::OutOfRange)?;
        if frame.tag != expect || frame.count != expect_count {
            return Err(Error::OutOfRange);
        }
        Ok(())
    }

    pub fn push_key(&mut self, bytes: &[u8]) -> Result<()> {
        self.pending_key = Some(bytes.to_vec());
        Ok(())
    }

    /// Lands `value` on the next scalar slot — the bare root, the pending
    /// object key, or the next array index — specializing an open array's
    /// backing storage as needed along the way.
    fn push_scalar(&mut self, value: Scalar<'_>) -> Result<()> {
        if self.stack.is_empty() {
            let mut root = self.doc.root();
            return assign_scalar(&mut root, value);
        }

        let steps = self.steps_to_top();
        let mut container_cursor = descend(self.doc, &steps)?;
        let top_idx = self.stack.len() - 1;
        match self.stack[top_idx].tag {
            Tag::Object => {
                let key = self.pending_key.take().ok_or(Error::OutOfRange)?;
                let mut slot = container_cursor.upsert(&key)?;
                assign_scalar(&mut slot, value)?;
            }
            Tag::Array => {
                let kind = value.specialization();
                let new_spec = apply_array_transition(
                    &mut self.stack[top_idx].spec,
                    self.allow_int_to_double,
                    kind,
                    &mut container_cursor,
                )?;
                match new_spec {
                    Specialization::Bool => {
                        let v = value.as_bool().expect("bool-specialized array element");
                        container_cursor.barray_push(v)?;
                    }
                    Specialization::Int => {
                        let v = value.as_i64().expect("int-specialized array element");
                        container_cursor.iarray_push(v)?;
                    }
                    Specialization::Double => {
                        let v = value.as_f64_for_double().expect("double-specialized array element");
                        container_cursor.darray_push(v)?;
                    }
                    Specialization::Undetermined | Specialization::Mixed => {
                        let index = self.stack[top_idx].count;
                        let mut slot = container_cursor.at(index)?;
                        assign_scalar(&mut slot, value)?;
                    }
                }
            }
            _ => return Err(Error::WrongTag),
        }
        self.stack[top_idx].count += 1;
        Ok(())
    }

    pub fn push_null(&mut self) -> Result<()> {
        self.push_scalar(Scalar::Null)
    }

    pub fn push_bool(&mut self, v: bool) -> Result<()> {
        self.push_scalar(Scalar::Bool(v))
    }

    pub fn push_int(&mut self, v: i32) -> Result<()> {
        self.push_scalar(Scalar::Int(v as i64))
    }

    pub fn push_int64(&mut self, v: i64) -> Result<()> {
        self.push_scalar(Scalar::Int(v))
    }

    pub fn push_uint(&mut self, v: u32) -> Result<()> {
        self.push_scalar(Scalar::UInt(v as u64))
    }

    pub fn push_uint64(&mut self, v: u64) -> Result<()> {
        self.push_scalar(Scalar::UInt(v))
    }

    pub fn push_double(&mut self, v: f64) -> Result<()> {
        self.push_scalar(Scalar::Double(v))
    }

    pub fn push_string(&mut self, bytes: &[u8]) -> Result<()> {
        self.push_scalar(Scalar::Str(bytes))
    }

    /// Finalizes the document: shrinks the object allocator (and, if
    /// `rehash`, the string pool) to their tightest fit. Fails if any
    /// container was left open.
    pub fn finalize(self, shrink: bool, rehash: bool) -> Result<()> {
        if !self.stack.is_empty() {
            return Err(Error::OutOfRange);
        }
        if shrink {
            self.doc.shrink(rehash);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::GlobalDocument;
    use crate::value::Tag;

    fn doc() -> GlobalDocument {
        GlobalDocument::with_global_alloc(Default::default())
    }

    #[test]
    fn sequential_int64_pushes_form_an_iarray() {
        let mut d = doc();
        {
            let mut h = d.make_handler(true);
            h.start_array().unwrap();
            h.push_int64(1).unwrap();
            h.push_int64(2).unwrap();
            h.push_int64(3).unwrap();
            h.end_array(3).unwrap();
            h.finalize(false, false).unwrap();
        }
        let root = d.croot();
        assert_eq!(Tag::IArray, root.tag());
        assert_eq!(3, root.size());
    }

    #[test]
    fn mixed_int_and_double_promotes_to_darray_when_allowed() {
        let mut d = doc();
        {
            let mut h = d.make_handler(true);
            h.start_array().unwrap();
            h.push_int64(1).unwrap();
            h.push_double(2.5).unwrap();
            h.end_array(2).unwrap();
            h.finalize(false, false).unwrap();
        }
        let root = d.croot();
        assert_eq!(Tag::DArray, root.tag());
        assert_eq!(2, root.size());
    }

    #[test]
    fn mixed_int_and_double_falls_back_to_array_when_disallowed() {
        let mut d = doc();
        {
            let mut h = d.make_handler(false);
            h.start_array().unwrap();
            h.push_int64(1).unwrap();
            h.push_double(2.5).unwrap();
            h.end_array(2).unwrap();
            h.finalize(false, false).unwrap();
        }
        let root = d.croot();
        assert_eq!(Tag::Array, root.tag());
        assert_eq!(2, root.size());
    }

    #[test]
    fn non_bool_after_bools_converts_barray_to_array() {
        let mut d = doc();
        {
            let mut h = d.make_handler(true);
            h.start_array().unwrap();
            h.push_bool(true).unwrap();
            h.push_bool(false).unwrap();
            h.push_string(b"nope").unwrap();
            h.end_array(3).unwrap();
            h.finalize(false, false).unwrap();
        }
        let root = d.croot();
        assert_eq!(Tag::Array, root.tag());
        assert_eq!(3, root.size());
    }

    #[test]
    fn nested_container_forces_parent_array_to_generic() {
        let mut d = doc();
        {
            let mut h = d.make_handler(true);
            h.start_array().unwrap();
            h.push_int64(1).unwrap();
            h.start_object().unwrap();
            h.end_object(0).unwrap();
            h.end_array(2).unwrap();
            h.finalize(false, false).unwrap();
        }
        let root = d.croot();
        assert_eq!(Tag::Array, root.tag());
        assert_eq!(2, root.size());
        let first = root.try_at(0).unwrap();
        assert_eq!(1, first.as_i64().unwrap());
        let second = root.try_at(1).unwrap();
        assert_eq!(Tag::Object, second.tag());
    }

    #[test]
    fn object_member_round_trips() {
        let mut d = doc();
        {
            let mut h = d.make_handler(true);
            h.start_object().unwrap();
            h.push_key(b"a").unwrap();
            h.push_int64(7).unwrap();
            h.end_object(1).unwrap();
            h.finalize(false, false).unwrap();
        }
        let root = d.croot();
        assert_eq!(Tag::Object, root.tag());
        let v = root.find(b"a").unwrap();
        assert_eq!(7, v.as_i64().unwrap());
    }
}
