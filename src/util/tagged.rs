//! Tagged values: the one-word representation of every slot and handle.
//!
//! The tag-bit layout is defined once here and every component (barrier, tracing,
//! weak processing, the verifier) goes through these accessors:
//!
//! | bits `[1:0]` | payload (bits `[63:2]`)        | meaning                           |
//! |--------------|--------------------------------|-----------------------------------|
//! | `00`         | zero                           | [`TaggedValue::EMPTY`] (the hole) |
//! | `00`         | object address                 | strong pointer                    |
//! | `01`         | object address                 | weak pointer                      |
//! | `10`         | special constant id            | `NULL`, `UNDEFINED`, `TRUE`, ...  |
//! | `11`         | 62-bit two's complement integer| inline integer                    |
//!
//! Object addresses are word aligned, so the low two bits of a pointer are free for the tag.
//! A cleared weak reference reads back as `EMPTY`.

use crate::util::ObjectReference;
use bytemuck::NoUninit;
use std::fmt;

/// Mask of the tag bits.
pub const TAG_MASK: u64 = 0b11;
/// Tag of strong pointers (and of `EMPTY`).
pub const TAG_POINTER: u64 = 0b00;
/// Tag of weak pointers.
pub const TAG_WEAK: u64 = 0b01;
/// Tag of special constants.
pub const TAG_SPECIAL: u64 = 0b10;
/// Tag of inline integers.
pub const TAG_INT: u64 = 0b11;
/// Shift of the payload of specials and integers.
pub const PAYLOAD_SHIFT: u32 = 2;

/// Smallest integer that can be stored inline.
pub const MIN_INLINE_INT: i64 = i64::MIN >> PAYLOAD_SHIFT;
/// Largest integer that can be stored inline.
pub const MAX_INLINE_INT: i64 = i64::MAX >> PAYLOAD_SHIFT;

/// What a tagged value holds, as far as the collector is concerned.
#[derive(Copy, Clone, Debug, PartialEq, Eq, strum_macros::Display, strum_macros::IntoStaticStr)]
pub enum ValueKind {
    /// The hole. Zero-initialized slots and cleared weak references.
    Empty,
    /// A strong reference. Traced.
    Pointer,
    /// A weak reference. Recorded while tracing, never traversed.
    Weak,
    /// An inline integer.
    Int,
    /// A special constant.
    Special,
}

impl ValueKind {
    /// Pointer or weak pointer.
    pub fn is_reference(self) -> bool {
        matches!(self, ValueKind::Pointer | ValueKind::Weak)
    }
}

#[repr(transparent)]
#[derive(Copy, Clone, PartialEq, Eq, Hash, NoUninit, Default)]
pub struct TaggedValue(u64);

impl TaggedValue {
    pub const EMPTY: TaggedValue = TaggedValue(0);
    pub const NULL: TaggedValue = TaggedValue::special(1);
    pub const UNDEFINED: TaggedValue = TaggedValue::special(2);
    pub const TRUE: TaggedValue = TaggedValue::special(3);
    pub const FALSE: TaggedValue = TaggedValue::special(4);

    const fn special(id: u64) -> TaggedValue {
        TaggedValue((id << PAYLOAD_SHIFT) | TAG_SPECIAL)
    }

    pub const fn from_raw(raw: u64) -> TaggedValue {
        TaggedValue(raw)
    }

    pub const fn raw(self) -> u64 {
        self.0
    }

    /// A strong reference to `object`.
    pub fn from_object(object: ObjectReference) -> TaggedValue {
        let raw = object.value() as u64;
        debug_assert_eq!(raw & TAG_MASK, 0, "misaligned object {}", object);
        TaggedValue(raw | TAG_POINTER)
    }

    /// A weak reference to `object`.
    pub fn weak_from_object(object: ObjectReference) -> TaggedValue {
        TaggedValue(Self::from_object(object).0 | TAG_WEAK)
    }

    /// An inline integer. Values outside the 62-bit range wrap.
    pub fn from_int(value: i64) -> TaggedValue {
        debug_assert!(
            (MIN_INLINE_INT..=MAX_INLINE_INT).contains(&value),
            "{} does not fit an inline integer",
            value
        );
        TaggedValue(((value as u64) << PAYLOAD_SHIFT) | TAG_INT)
    }

    pub fn from_bool(value: bool) -> TaggedValue {
        if value {
            Self::TRUE
        } else {
            Self::FALSE
        }
    }

    pub fn kind(self) -> ValueKind {
        match self.0 & TAG_MASK {
            TAG_POINTER if self.0 == 0 => ValueKind::Empty,
            TAG_POINTER => ValueKind::Pointer,
            TAG_WEAK => ValueKind::Weak,
            TAG_SPECIAL => ValueKind::Special,
            _ => ValueKind::Int,
        }
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn is_weak(self) -> bool {
        self.0 & TAG_MASK == TAG_WEAK
    }

    /// The referenced object of a strong or weak pointer.
    pub fn as_object(self) -> Option<ObjectReference> {
        match self.kind() {
            ValueKind::Pointer | ValueKind::Weak => {
                let addr = (self.0 & !TAG_MASK) as usize;
                // Safety: pointers are only produced from object references.
                Some(unsafe {
                    ObjectReference::from_raw_address(crate::util::Address::from_usize(addr))
                })
            }
            _ => None,
        }
    }

    pub fn as_int(self) -> Option<i64> {
        (self.0 & TAG_MASK == TAG_INT).then_some((self.0 as i64) >> PAYLOAD_SHIFT)
    }

    /// Retarget a pointer at `object`, keeping its strength.
    pub fn with_object(self, object: ObjectReference) -> TaggedValue {
        if self.is_weak() {
            Self::weak_from_object(object)
        } else {
            Self::from_object(object)
        }
    }
}

impl fmt::Debug for TaggedValue {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.kind() {
            ValueKind::Empty => write!(f, "EMPTY"),
            ValueKind::Pointer => write!(f, "ptr({:#x})", self.0),
            ValueKind::Weak => write!(f, "weak({:#x})", self.0 & !TAG_MASK),
            ValueKind::Int => write!(f, "int({})", (self.0 as i64) >> PAYLOAD_SHIFT),
            ValueKind::Special => write!(f, "special({})", self.0 >> PAYLOAD_SHIFT),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::Address;

    fn object(addr: usize) -> ObjectReference {
        unsafe { ObjectReference::from_raw_address(Address::from_usize(addr)) }
    }

    #[test]
    fn classify() {
        assert_eq!(TaggedValue::EMPTY.kind(), ValueKind::Empty);
        assert_eq!(TaggedValue::from_int(-3).kind(), ValueKind::Int);
        assert_eq!(TaggedValue::NULL.kind(), ValueKind::Special);
        assert_eq!(TaggedValue::from_object(object(0x1000)).kind(), ValueKind::Pointer);
        assert_eq!(TaggedValue::weak_from_object(object(0x1000)).kind(), ValueKind::Weak);
        assert!(!ValueKind::Int.is_reference());
    }

    #[test]
    fn weak_keeps_target() {
        let weak = TaggedValue::weak_from_object(object(0x2000));
        assert_eq!(weak.as_object(), Some(object(0x2000)));
        let moved = weak.with_object(object(0x3000));
        assert!(moved.is_weak());
        assert_eq!(moved.as_object(), Some(object(0x3000)));
    }

    #[test]
    fn inline_ints() {
        for v in [0, 1, -1, 42, MIN_INLINE_INT, MAX_INLINE_INT] {
            assert_eq!(TaggedValue::from_int(v).as_int(), Some(v));
        }
        assert_eq!(TaggedValue::TRUE.as_int(), None);
        assert_eq!(TaggedValue::from_int(5).as_object(), None);
    }
}
