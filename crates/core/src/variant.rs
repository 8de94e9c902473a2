//! Type-erased cell handles
//!
//! A [`Variant`] is the result of a directory lookup: which slot a cell
//! occupies (a byte range in the store buffer, or an index into the
//! function table), its type tag, and its length. Variants are small,
//! copyable values; they hold no reference into the store, so they can be
//! stashed in alias tables and maps. All data access goes through the
//! owning [`Store`](crate::store::Store), which runs the hook protocol.

use crate::types::Type;

/// Where a cell lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Slot {
    /// Byte range `offset .. offset + len` in the store buffer.
    Data { offset: usize },
    /// Entry in the store's function table.
    Function { index: usize },
    /// Lookup failed.
    None,
}

/// A type-erased handle to a cell, produced by directory lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Variant {
    ty: Type,
    len: usize,
    slot: Slot,
}

impl Variant {
    /// The invalid variant, returned for failed lookups.
    pub const fn invalid() -> Variant {
        Variant {
            ty: Type::INVALID,
            len: 0,
            slot: Slot::None,
        }
    }

    /// A handle to a data cell.
    pub const fn data(ty: Type, len: usize, offset: usize) -> Variant {
        Variant {
            ty,
            len,
            slot: Slot::Data { offset },
        }
    }

    /// A handle to a function cell.
    pub const fn function(ty: Type, len: usize, index: usize) -> Variant {
        Variant {
            ty,
            len,
            slot: Slot::Function { index },
        }
    }

    pub const fn valid(&self) -> bool {
        self.ty.is_valid() && !matches!(self.slot, Slot::None)
    }

    pub const fn ty(&self) -> Type {
        self.ty
    }

    /// Cell length in bytes. For fixed types this equals `ty().size()`.
    pub const fn len(&self) -> usize {
        self.len
    }

    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub const fn slot(&self) -> Slot {
        self.slot
    }

    pub const fn is_function(&self) -> bool {
        matches!(self.slot, Slot::Function { .. })
    }

    /// Buffer offset for data cells.
    pub const fn offset(&self) -> Option<usize> {
        match self.slot {
            Slot::Data { offset } => Some(offset),
            _ => None,
        }
    }

    /// Function-table index for function cells.
    pub const fn function_index(&self) -> Option<usize> {
        match self.slot {
            Slot::Function { index } => Some(index),
            _ => None,
        }
    }

    /// Stable integer identity of the cell within a store whose buffer is
    /// `buffer_len` bytes: data cells use their offset, function cells get
    /// a disjoint range above the buffer.
    pub const fn key(&self, buffer_len: usize) -> Option<usize> {
        match self.slot {
            Slot::Data { offset } => Some(offset),
            Slot::Function { index } => Some(buffer_len + index),
            Slot::None => None,
        }
    }
}

impl Default for Variant {
    fn default() -> Self {
        Variant::invalid()
    }
}
