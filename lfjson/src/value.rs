// SPDX-License-Identifier: Apache-2.0

//! The packed tagged value cell and its member-cell sibling.
//!
//! [`Value`] is a branded 16-byte byte array rather than a Rust `enum`,
//! which is the only representation that actually gives us a fixed
//! 16-byte-total, one-tag-byte-at-offset-0 guarantee (a naive `enum` carries
//! no such promise — its layout is unspecified). The one-byte [`Tag`] sits
//! at a fixed offset; everything past it is reinterpreted according to that
//! tag by the accessors below, via unaligned reads/writes over the trailing
//! byte array.

use core::fmt;
use core::ptr::NonNull;

/// Bytes available to a value cell past its one-byte [`Tag`], on a 64-bit
/// target. Mirrors `size_of::<Value>() - size_of::<Tag>()`.
pub const PAYLOAD_LEN: usize = 15;

/// `MaxShort`: the longest string that fits inline. One byte
/// of the payload encodes `MaxShort - length`, so the inline char buffer
/// itself is `PAYLOAD_LEN - 1` bytes.
pub const MAX_SHORT: usize = PAYLOAD_LEN - 1;

/// The 13 discriminants a [`Value`] can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum Tag {
    Object = 0,
    Array = 1,
    BArray = 2,
    IArray = 3,
    DArray = 4,
    ShortString = 5,
    LongString = 6,
    Int64 = 7,
    UInt64 = 8,
    Double = 9,
    True = 10,
    False = 11,
    Null = 12,
}

impl Tag {
    const VARIANTS: [Tag; 13] = [
        Tag::Object,
        Tag::Array,
        Tag::BArray,
        Tag::IArray,
        Tag::DArray,
        Tag::ShortString,
        Tag::LongString,
        Tag::Int64,
        Tag::UInt64,
        Tag::Double,
        Tag::True,
        Tag::False,
        Tag::Null,
    ];

    fn from_u8(raw: u8) -> Tag {
        Tag::VARIANTS
            .get(raw as usize)
            .copied()
            .unwrap_or_else(|| unreachable!("lfjson: corrupt value tag byte {raw}"))
    }

    /// `true` for any of the four array tags (generic or specialized).
    pub const fn is_array(self) -> bool {
        matches!(self, Tag::Array | Tag::BArray | Tag::IArray | Tag::DArray)
    }

    /// `true` for the two string tags.
    pub const fn is_string(self) -> bool {
        matches!(self, Tag::ShortString | Tag::LongString)
    }

    /// `true` for the three numeric tags.
    pub const fn is_number(self) -> bool {
        matches!(self, Tag::Int64 | Tag::UInt64 | Tag::Double)
    }

    /// Folds the 13 tags down to the 6-way "meta classifier" view,
    /// allocation-free.
    pub const fn classify(self) -> Meta {
        match self {
            Tag::Object => Meta::Object,
            Tag::Array | Tag::BArray | Tag::IArray | Tag::DArray => Meta::Array,
            Tag::ShortString | Tag::LongString => Meta::String,
            Tag::Int64 | Tag::UInt64 | Tag::Double => Meta::Number,
            Tag::True | Tag::False => Meta::Bool,
            Tag::Null => Meta::Null,
        }
    }
}

/// The 6-way fold of [`Tag`], exposed as a public convenience since
/// "is this a number" is a routine question for callers of a document
/// model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Meta {
    Object,
    Array,
    String,
    Number,
    Bool,
    Null,
}

/// Out-of-line container descriptor, used once a container's
/// capacity reaches the 65535 sentinel. `T` is `Value`, `bool`, `i64`,
/// `f64`, or `Member` depending on which array/object kind owns it.
#[repr(C)]
pub struct BigHeader {
    pub capacity: u32,
}

/// Sentinel inline-capacity value meaning "see the [`BigHeader`] this cell's
/// pointer addresses instead". No inline buffer is ever handed out at this
/// capacity.
pub const BIG_SENTINEL: u16 = u16::MAX;

/// Container payload shared by `Object`, `Array`, `BArray`, `IArray`, and
/// `DArray`.
#[derive(Clone, Copy)]
pub(crate) struct ContainerPayload {
    pub capacity: u16,
    pub size: u32,
    /// Either the direct element buffer (`capacity < BIG_SENTINEL`) or a
    /// pointer to a [`BigHeader`] (`capacity == BIG_SENTINEL`).
    pub data: Option<NonNull<u8>>,
}

impl ContainerPayload {
    const fn empty() -> Self {
        Self {
            capacity: 0,
            size: 0,
            data: None,
        }
    }

    fn to_bytes(self) -> [u8; PAYLOAD_LEN] {
        let mut buf = [0u8; PAYLOAD_LEN];
        buf[0..2].copy_from_slice(&self.capacity.to_ne_bytes());
        buf[2..6].copy_from_slice(&self.size.to_ne_bytes());
        let addr = self.data.map_or(0usize, |p| p.as_ptr() as usize) as u64;
        buf[6..14].copy_from_slice(&addr.to_ne_bytes());
        buf
    }

    fn from_bytes(buf: &[u8; PAYLOAD_LEN]) -> Self {
        let capacity = u16::from_ne_bytes(buf[0..2].try_into().unwrap());
        let size = u32::from_ne_bytes(buf[2..6].try_into().unwrap());
        let addr = u64::from_ne_bytes(buf[6..14].try_into().unwrap()) as usize;
        let data = NonNull::new(addr as *mut u8);
        Self {
            capacity,
            size,
            data,
        }
    }
}

/// A reference to a pooled (long) string: a compact pointer into the
/// [`crate::string_pool::StringPool`]'s slab plus a cached length, so the
/// length is available without resolving the pointer.
#[derive(Clone, Copy, PartialEq, Eq)]
pub(crate) struct LongStringRef {
    pub ptr_bits: u32,
    pub len: u32,
}

impl LongStringRef {
    fn to_bytes(self) -> [u8; PAYLOAD_LEN] {
        let mut buf = [0u8; PAYLOAD_LEN];
        buf[0..4].copy_from_slice(&self.ptr_bits.to_ne_bytes());
        buf[4..8].copy_from_slice(&self.len.to_ne_bytes());
        buf
    }

    fn from_bytes(buf: &[u8; PAYLOAD_LEN]) -> Self {
        Self {
            ptr_bits: u32::from_ne_bytes(buf[0..4].try_into().unwrap()),
            len: u32::from_ne_bytes(buf[4..8].try_into().unwrap()),
        }
    }
}

/// The 16-byte packed value cell.
///
/// Layout: one [`Tag`] byte followed by [`PAYLOAD_LEN`] bytes interpreted
/// per-tag. `size_of::<Value>() == 16` is asserted in the test module
/// below, matching the invariant for 64-bit targets; a 32-bit
/// target would shrink the pointer-bearing payloads (container buffer
/// pointers, the long-string backing pointer) and the cell would shrink to
/// 12 bytes accordingly, but this crate does not carry a second code path
/// for it — see `DESIGN.md`.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct Value {
    tag: Tag,
    payload: [u8; PAYLOAD_LEN],
}

const _: () = assert!(core::mem::size_of::<Value>() == 16);

impl Value {
    /// A freshly-born `Null` cell.
    pub const fn null() -> Self {
        Self {
            tag: Tag::Null,
            payload: [0u8; PAYLOAD_LEN],
        }
    }

    pub const fn bool(v: bool) -> Self {
        Self {
            tag: if v { Tag::True } else { Tag::False },
            payload: [0u8; PAYLOAD_LEN],
        }
    }

    pub fn int64(v: i64) -> Self {
        let mut payload = [0u8; PAYLOAD_LEN];
        payload[0..8].copy_from_slice(&v.to_ne_bytes());
        Self {
            tag: Tag::Int64,
            payload,
        }
    }

    pub fn uint64(v: u64) -> Self {
        let mut payload = [0u8; PAYLOAD_LEN];
        payload[0..8].copy_from_slice(&v.to_ne_bytes());
        Self {
            tag: Tag::UInt64,
            payload,
        }
    }

    pub fn double(v: f64) -> Self {
        let mut payload = [0u8; PAYLOAD_LEN];
        payload[0..8].copy_from_slice(&v.to_ne_bytes());
        Self {
            tag: Tag::Double,
            payload,
        }
    }

    /// Builds a `ShortString` cell. Panics (debug-asserted, a programming
    /// error ) if `bytes.len() >= MAX_SHORT`; callers are
    /// expected to route longer strings through the string pool first.
    pub fn short_string(bytes: &[u8]) -> Self {
        debug_assert!(bytes.len() < MAX_SHORT, "lfjson: string too long for short form");
        let len = bytes.len().min(MAX_SHORT);
        let mut payload = [0u8; PAYLOAD_LEN];
        payload[..len].copy_from_slice(&bytes[..len]);
        payload[MAX_SHORT] = (MAX_SHORT - len) as u8;
        Self {
            tag: Tag::ShortString,
            payload,
        }
    }

    pub(crate) fn long_string(r: LongStringRef) -> Self {
        Self {
            tag: Tag::LongString,
            payload: r.to_bytes(),
        }
    }

    pub(crate) fn container(tag: Tag, c: ContainerPayload) -> Self {
        debug_assert!(tag.is_array() || matches!(tag, Tag::Object));
        Self {
            tag,
            payload: c.to_bytes(),
        }
    }

    pub const fn tag(&self) -> Tag {
        self.tag
    }

    pub const fn meta(&self) -> Meta {
        self.tag.classify()
    }

    pub const fn is_null(&self) -> bool {
        matches!(self.tag, Tag::Null)
    }

    /// Reads this cell as a `bool`. `None` unless the tag is `True`/`False`.
    pub const fn as_bool(&self) -> Option<bool> {
        match self.tag {
            Tag::True => Some(true),
            Tag::False => Some(false),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self.tag {
            Tag::Int64 => Some(i64::from_ne_bytes(self.payload[0..8].try_into().unwrap())),
            _ => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match self.tag {
            Tag::UInt64 => Some(u64::from_ne_bytes(self.payload[0..8].try_into().unwrap())),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self.tag {
            Tag::Double => Some(f64::from_ne_bytes(self.payload[0..8].try_into().unwrap())),
            _ => None,
        }
    }

    /// Length of a `ShortString` cell's inline buffer (the encoding:
    /// `MaxShort - payload[MAX_SHORT]`), or `None` for any other tag.
    pub fn short_string_len(&self) -> Option<usize> {
        match self.tag {
            Tag::ShortString => Some(MAX_SHORT - self.payload[MAX_SHORT] as usize),
            _ => None,
        }
    }

    /// Borrows the inline bytes of a `ShortString` cell.
    pub fn as_short_str_bytes(&self) -> Option<&[u8]> {
        self.short_string_len().map(|len| &self.payload[..len])
    }

    pub(crate) fn as_long_string_ref(&self) -> Option<LongStringRef> {
        match self.tag {
            Tag::LongString => Some(LongStringRef::from_bytes(&self.payload)),
            _ => None,
        }
    }

    pub(crate) fn as_container(&self) -> Option<ContainerPayload> {
        if self.tag.is_array() || matches!(self.tag, Tag::Object) {
            Some(ContainerPayload::from_bytes(&self.payload))
        } else {
            None
        }
    }

    pub(crate) fn set_container(&mut self, c: ContainerPayload) {
        debug_assert!(self.tag.is_array() || matches!(self.tag, Tag::Object));
        self.payload = c.to_bytes();
    }

    /// Retags this cell in place without touching any owned structure —
    /// callers (the document's assignment path) must have already
    /// deallocated whatever the old tag owned before calling this.
    pub(crate) fn retag(&mut self, tag: Tag, payload: [u8; PAYLOAD_LEN]) {
        self.tag = tag;
        self.payload = payload;
    }

    pub(crate) fn raw_payload(&self) -> &[u8; PAYLOAD_LEN] {
        &self.payload
    }

    /// `capacity == 0` for every non-container tag; defined so callers can
    /// ask "is this container empty" without a prior tag check.
    pub fn size(&self) -> u32 {
        self.as_container().map_or(0, |c| c.size)
    }

    pub fn capacity(&self) -> u32 {
        self.as_container().map_or(0, |c| {
            if c.capacity == BIG_SENTINEL {
                // SAFETY: see `as_container`'s caller contract — a big
                // container's pointer always addresses a live `BigHeader`.
                c.data
                    .map(|p| unsafe { p.cast::<BigHeader>().as_ref().capacity })
                    .unwrap_or(0)
            } else {
                c.capacity as u32
            }
        })
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct("Value");
        s.field("tag", &self.tag);
        match self.tag {
            Tag::Int64 => {
                s.field("value", &self.as_i64());
            }
            Tag::UInt64 => {
                s.field("value", &self.as_u64());
            }
            Tag::Double => {
                s.field("value", &self.as_f64());
            }
            Tag::ShortString => {
                s.field("len", &self.short_string_len());
            }
            _ => {}
        }
        s.finish()
    }
}

/// The 24-byte key/value pair stored inside an `Object` container. The key
/// reference is the resolved raw address of the interned
/// [`crate::string_pool::JString`], which is why object member lookup can
/// compare pointers instead of bytes.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct Member {
    pub(crate) key: Option<NonNull<u8>>,
    pub value: Value,
}

const _: () = assert!(core::mem::size_of::<Member>() == 24);

impl Member {
    pub(crate) fn new(key: NonNull<u8>, value: Value) -> Self {
        Self {
            key: Some(key),
            value,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn value_is_sixteen_bytes() {
        assert_eq!(16, core::mem::size_of::<Value>());
    }

    #[test]
    fn member_is_twenty_four_bytes() {
        assert_eq!(24, core::mem::size_of::<Member>());
    }

    #[test]
    fn short_string_round_trips_zero_length() {
        let v = Value::short_string(b"");
        assert_eq!(Some(0), v.short_string_len());
        assert_eq!(Some(&b""[..]), v.as_short_str_bytes());
    }

    #[test]
    fn short_string_round_trips_max_short_minus_one() {
        let bytes = vec![b'x'; MAX_SHORT - 1];
        let v = Value::short_string(&bytes);
        assert_eq!(Some(MAX_SHORT - 1), v.short_string_len());
        assert_eq!(Some(bytes.as_slice()), v.as_short_str_bytes());
    }

    #[test]
    fn numeric_round_trips() {
        assert_eq!(Some(-42), Value::int64(-42).as_i64());
        assert_eq!(Some(42), Value::uint64(42).as_u64());
        assert_eq!(Some(3.5), Value::double(3.5).as_f64());
    }

    #[test]
    fn meta_classifies_every_tag() {
        assert_eq!(Meta::Null, Value::null().meta());
        assert_eq!(Meta::Bool, Value::bool(true).meta());
        assert_eq!(Meta::Number, Value::int64(1).meta());
        assert_eq!(Meta::String, Value::short_string(b"hi").meta());
    }

    #[test]
    fn bool_accessors_distinguish_true_false() {
        assert_eq!(Some(true), Value::bool(true).as_bool());
        assert_eq!(Some(false), Value::bool(false).as_bool());
        assert_eq!(None, Value::null().as_bool());
    }
}
