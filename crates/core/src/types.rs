//! Cell type tags
//!
//! Every cell in a store carries a one-byte type tag. The tag packs the
//! kind (int/uint/float/bool/pointer/blob/string), signedness, and - for
//! fixed-width types - the size in bytes. Bit 6 marks function cells,
//! which dispatch to the store's function table instead of the buffer.
//!
//! The packing is part of the binary directory format and must not change:
//! a directory generated on one machine is parsed on another.

use bitflags::bitflags;
use std::fmt;

bitflags! {
    /// Flag bits of a [`Type`] tag. The low three bits (`MASK_SIZE`) encode
    /// `size - 1` for fixed-width types.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TypeFlags: u8 {
        const SIGNED = 0x08;
        const INT = 0x10;
        const FIXED = 0x20;
        const FUNCTION = 0x40;
    }
}

/// One-byte cell type tag.
///
/// Constructed from the constants below, or parsed from a directory byte
/// with [`Type::from_byte`]. `Type` is a plain wrapper around the packed
/// byte so that directory parsing stays a byte-level affair.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Type(u8);

impl Type {
    /// Low bits holding `size - 1` for fixed-width types.
    pub const MASK_SIZE: u8 = 0x07;

    pub const INT8: Type = Type(0x38);
    pub const INT16: Type = Type(0x39);
    pub const INT32: Type = Type(0x3b);
    pub const INT64: Type = Type(0x3f);
    pub const UINT8: Type = Type(0x30);
    pub const UINT16: Type = Type(0x31);
    pub const UINT32: Type = Type(0x33);
    pub const UINT64: Type = Type(0x37);
    pub const FLOAT: Type = Type(0x2b);
    pub const DOUBLE: Type = Type(0x2f);
    pub const BOOL: Type = Type(0x20);
    pub const POINTER32: Type = Type(0x23);
    pub const POINTER64: Type = Type(0x27);
    pub const VOID: Type = Type(0x00);
    pub const BLOB: Type = Type(0x01);
    pub const STRING: Type = Type(0x02);
    pub const INVALID: Type = Type(0xff);

    /// Wraps a raw tag byte. No validation; use [`Type::is_valid`].
    pub const fn from_byte(b: u8) -> Type {
        Type(b)
    }

    /// The packed tag byte.
    pub const fn to_byte(self) -> u8 {
        self.0
    }

    pub const fn is_valid(self) -> bool {
        self.0 != 0xff
    }

    /// Fixed-width type (known size, lives inline in the buffer).
    pub const fn is_fixed(self) -> bool {
        self.is_valid() && self.0 & TypeFlags::FIXED.bits() != 0
    }

    /// Function cell: access dispatches to the store's function table.
    pub const fn is_function(self) -> bool {
        self.is_valid() && self.0 & TypeFlags::FUNCTION.bits() != 0
    }

    pub const fn is_int(self) -> bool {
        self.is_fixed() && self.0 & TypeFlags::INT.bits() != 0
    }

    pub const fn is_signed(self) -> bool {
        self.0 & TypeFlags::SIGNED.bits() != 0
    }

    pub const fn is_float(self) -> bool {
        self.is_fixed()
            && self.0 & TypeFlags::INT.bits() == 0
            && self.0 & TypeFlags::SIGNED.bits() != 0
    }

    /// Int, uint, or float. Bool and pointers are not numeric.
    pub const fn is_numeric(self) -> bool {
        self.is_int() || self.is_float()
    }

    pub const fn is_bool(self) -> bool {
        self.strip_function().0 == Type::BOOL.0
    }

    pub const fn is_pointer(self) -> bool {
        let t = self.strip_function().0;
        t == Type::POINTER32.0 || t == Type::POINTER64.0
    }

    pub const fn is_blob(self) -> bool {
        let t = self.strip_function().0;
        t == Type::BLOB.0 || t == Type::STRING.0
    }

    pub const fn is_string(self) -> bool {
        self.strip_function().0 == Type::STRING.0
    }

    /// Size in bytes of a fixed-width type; 0 for blob/string/void, whose
    /// length is a property of the cell, not the type.
    pub const fn size(self) -> usize {
        if self.is_fixed() {
            (self.0 & Type::MASK_SIZE) as usize + 1
        } else {
            0
        }
    }

    /// The same tag with the function bit set.
    pub const fn as_function(self) -> Type {
        Type(self.0 | TypeFlags::FUNCTION.bits())
    }

    /// The same tag with the function bit cleared.
    pub const fn strip_function(self) -> Type {
        if self.0 == 0xff {
            self
        } else {
            Type(self.0 & !TypeFlags::FUNCTION.bits())
        }
    }

    /// Human-readable name, as used by diagnostics and list output.
    pub fn name(self) -> &'static str {
        match self.strip_function() {
            Type::INT8 => "int8",
            Type::INT16 => "int16",
            Type::INT32 => "int32",
            Type::INT64 => "int64",
            Type::UINT8 => "uint8",
            Type::UINT16 => "uint16",
            Type::UINT32 => "uint32",
            Type::UINT64 => "uint64",
            Type::FLOAT => "float",
            Type::DOUBLE => "double",
            Type::BOOL => "bool",
            Type::POINTER32 => "ptr32",
            Type::POINTER64 => "ptr64",
            Type::VOID => "void",
            Type::BLOB => "blob",
            Type::STRING => "string",
            _ => "invalid",
        }
    }
}

impl fmt::Debug for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_function() {
            write!(f, "Type({} fn, {:#04x})", self.name(), self.0)
        } else {
            write!(f, "Type({}, {:#04x})", self.name(), self.0)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_sizes() {
        assert_eq!(Type::INT8.size(), 1);
        assert_eq!(Type::INT16.size(), 2);
        assert_eq!(Type::INT32.size(), 4);
        assert_eq!(Type::INT64.size(), 8);
        assert_eq!(Type::UINT8.size(), 1);
        assert_eq!(Type::UINT64.size(), 8);
        assert_eq!(Type::FLOAT.size(), 4);
        assert_eq!(Type::DOUBLE.size(), 8);
        assert_eq!(Type::BOOL.size(), 1);
        assert_eq!(Type::POINTER64.size(), 8);
        assert_eq!(Type::BLOB.size(), 0);
        assert_eq!(Type::STRING.size(), 0);
    }

    #[test]
    fn test_predicates() {
        assert!(Type::INT32.is_numeric());
        assert!(Type::INT32.is_int());
        assert!(Type::INT32.is_signed());
        assert!(!Type::UINT16.is_signed());
        assert!(Type::FLOAT.is_float());
        assert!(Type::FLOAT.is_numeric());
        assert!(!Type::BOOL.is_numeric());
        assert!(!Type::POINTER32.is_numeric());
        assert!(Type::STRING.is_blob());
        assert!(!Type::STRING.is_fixed());
    }

    #[test]
    fn test_function_bit() {
        let f = Type::INT32.as_function();
        assert!(f.is_function());
        assert!(f.is_numeric());
        assert_eq!(f.size(), 4);
        assert_eq!(f.strip_function(), Type::INT32);
        assert!(!Type::INT32.is_function());
    }

    #[test]
    fn test_invalid() {
        assert!(!Type::INVALID.is_valid());
        assert!(!Type::INVALID.is_fixed());
        assert_eq!(Type::from_byte(0xff), Type::INVALID);
    }
}
