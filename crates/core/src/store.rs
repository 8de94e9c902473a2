//! Store runtime
//!
//! A [`Store`] owns one contiguous buffer of cell data plus the binary
//! directories describing it. Cell offsets are stable for the store's
//! lifetime. Every data access runs the hook protocol ([`crate::hooks`]);
//! function cells dispatch into the store's function table instead.
//!
//! Stores are defined at compile time by a generator; [`StoreBuilder`]
//! assembles the same artifacts (directories, initial image, function
//! slots) programmatically and is what tests and embedders without a
//! generator use.
//!
//! A store must only be touched from one thread; share it within that
//! thread as a [`StoreRef`] and across threads via message passing only.

use std::borrow::Cow;
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fmt;
use std::rc::Rc;

use crate::config::Config;
use crate::directory;
use crate::directory::builder::Cell;
use crate::hooks::{HookListener, Key};
use crate::journal::Journal;
use crate::types::Type;
use crate::util::{fnv1a, FNV_OFFSET};
use crate::value::Value;
use crate::variant::{Slot, Variant};

/// Uniform function-cell implementation: `f(set, buf)` reads into or
/// writes from `buf` and returns the number of bytes processed.
pub type CellFunction = Box<dyn FnMut(bool, &mut [u8]) -> usize>;

/// Shared handle to a store within one thread.
pub type StoreRef = Rc<RefCell<Store>>;

/// Access failures. Lookup failures are expressed as invalid variants,
/// not errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessError {
    /// The variant is invalid or does not belong to this store.
    Invalid,
    /// Buffer size does not match the cell.
    SizeMismatch,
    /// The type does not support the requested representation.
    TypeMismatch,
    /// Function cell without a registered implementation.
    NoFunction,
}

impl fmt::Display for AccessError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AccessError::Invalid => write!(f, "invalid cell handle"),
            AccessError::SizeMismatch => write!(f, "buffer size does not match cell"),
            AccessError::TypeMismatch => write!(f, "cell type does not support this access"),
            AccessError::NoFunction => write!(f, "function cell has no implementation"),
        }
    }
}

impl std::error::Error for AccessError {}

/// The compile-time artifacts a store is instantiated from. A generator
/// emits these as statics; [`StoreBuilder`] produces owned equivalents.
#[derive(Debug, Clone)]
pub struct StoreLayout {
    pub name: Cow<'static, str>,
    pub short_directory: Cow<'static, [u8]>,
    /// Equals `short_directory` when full names are disabled.
    pub long_directory: Cow<'static, [u8]>,
    /// Default-initialised buffer image; its length is the buffer length.
    pub initial: Cow<'static, [u8]>,
    /// Number of function-table slots.
    pub functions: usize,
}

pub struct Store {
    layout: StoreLayout,
    config: Config,
    buffer: Box<[u8]>,
    functions: Vec<Option<CellFunction>>,
    listeners: Vec<Box<dyn HookListener>>,
    journal: Option<Journal>,
    /// Full names and variants from the long directory, in list order.
    cells: Vec<(String, Variant)>,
    by_key: BTreeMap<Key, Variant>,
    hash: u32,
}

impl Store {
    /// Instantiates a store from its layout. Panics on a malformed layout
    /// (overlapping cells, out-of-range offsets); layouts are compile-time
    /// artifacts, so this is a programming error, not input.
    pub fn new(layout: StoreLayout, config: Config) -> Store {
        let buffer: Box<[u8]> = layout.initial.clone().into_owned().into_boxed_slice();
        let buffer_len = buffer.len();

        let mut cells = Vec::new();
        directory::list(&layout.long_directory, |name, v| {
            cells.push((name.to_string(), *v));
        });

        let mut by_key = BTreeMap::new();
        let mut ranges: Vec<(usize, usize)> = Vec::new();
        let mut max_fn = 0usize;
        for (name, v) in &cells {
            let key = v.key(buffer_len).expect("directory produced invalid leaf");
            assert!(
                by_key.insert(key, *v).is_none(),
                "cells {:?} share key {}",
                name,
                key
            );
            match v.slot() {
                Slot::Data { offset } => {
                    assert!(
                        offset + v.len() <= buffer_len,
                        "cell {:?} exceeds the buffer",
                        name
                    );
                    ranges.push((offset, offset + v.len()));
                }
                Slot::Function { index } => max_fn = max_fn.max(index + 1),
                Slot::None => unreachable!(),
            }
        }
        ranges.sort_unstable();
        for w in ranges.windows(2) {
            assert!(w[0].1 <= w[1].0, "cell byte ranges overlap");
        }
        assert!(
            max_fn <= layout.functions,
            "directory references function slot beyond the table"
        );

        let mut hash = fnv1a(FNV_OFFSET, &layout.short_directory);
        hash = fnv1a(hash, &(buffer_len as u64).to_be_bytes());

        let mut functions = Vec::with_capacity(layout.functions);
        functions.resize_with(layout.functions, || None);

        tracing::debug!(
            name = %layout.name,
            buffer = buffer_len,
            cells = cells.len(),
            functions = layout.functions,
            "store initialised"
        );

        Store {
            layout,
            config,
            buffer,
            functions,
            listeners: Vec::new(),
            journal: None,
            cells,
            by_key,
            hash,
        }
    }

    /// Wraps the store for single-threaded sharing.
    pub fn into_ref(self) -> StoreRef {
        Rc::new(RefCell::new(self))
    }

    pub fn name(&self) -> &str {
        &self.layout.name
    }

    pub fn config(&self) -> Config {
        self.config
    }

    /// Raw buffer view. Does not run hooks; hooked access goes through
    /// [`Store::get`].
    pub fn buffer(&self) -> &[u8] {
        &self.buffer
    }

    pub fn buffer_len(&self) -> usize {
        self.buffer.len()
    }

    /// Identity of the store's schema (directory plus buffer length),
    /// stable across platforms. Peers compare this before syncing.
    pub fn schema_hash(&self) -> u32 {
        self.hash
    }

    pub fn short_directory(&self) -> &[u8] {
        &self.layout.short_directory
    }

    pub fn long_directory(&self) -> &[u8] {
        &self.layout.long_directory
    }

    /// Upper bound on a single synchronizer message for this store, for
    /// sizing bounded channels: the larger of a full-buffer welcome and an
    /// every-cell update.
    pub fn max_message_size(&self) -> usize {
        let data_cells = self
            .cells
            .iter()
            .filter(|(_, v)| !v.is_function())
            .count();
        let welcome = 5 + self.buffer.len();
        let update = 3 + data_cells * 6 + self.buffer.len();
        welcome.max(update)
    }

    /// Looks `name` up in the short directory. Accepts unambiguous
    /// abbreviations; returns an invalid variant otherwise.
    pub fn find(&self, name: &str) -> Variant {
        directory::find(&self.layout.short_directory, name)
    }

    /// [`Store::find`] considering at most `max_len` characters.
    pub fn find_prefix(&self, name: &str, max_len: usize) -> Variant {
        directory::find_prefix(&self.layout.short_directory, name, max_len)
    }

    /// Invokes `f` for every cell with its full name.
    pub fn list<F>(&self, mut f: F)
    where
        F: FnMut(&str, &Variant),
    {
        for (name, v) in &self.cells {
            f(name, v);
        }
    }

    /// All cells with their full names, in list order.
    pub fn cells(&self) -> &[(String, Variant)] {
        &self.cells
    }

    pub fn key_of(&self, v: &Variant) -> Option<Key> {
        v.key(self.buffer.len())
    }

    pub fn cell_by_key(&self, key: Key) -> Option<Variant> {
        self.by_key.get(&key).copied()
    }

    /// Registers the implementation of function slot `index`.
    pub fn set_function(&mut self, index: usize, f: CellFunction) {
        self.functions[index] = Some(f);
    }

    /// Appends a hook listener. Listeners run in registration order.
    pub fn add_listener(&mut self, listener: Box<dyn HookListener>) {
        self.listeners.push(listener);
    }

    /// Starts journalling changes for synchronization.
    pub fn enable_journal(&mut self) {
        if self.journal.is_none() {
            self.journal = Some(Journal::new());
        }
    }

    pub fn journal(&self) -> Option<&Journal> {
        self.journal.as_ref()
    }

    pub fn journal_mut(&mut self) -> Option<&mut Journal> {
        self.journal.as_mut()
    }

    /// Raw cell bytes without running hooks. Used by the synchronizer to
    /// assemble update frames; everything else should call [`Store::get`].
    pub fn peek(&self, v: &Variant) -> Option<&[u8]> {
        match v.slot() {
            Slot::Data { offset } => self.buffer.get(offset..offset + v.len()),
            _ => None,
        }
    }

    /// Reads the cell into `dst`, returning the number of bytes produced.
    /// Strings report their NUL-clipped effective length.
    pub fn get(&mut self, v: &Variant, dst: &mut [u8]) -> Result<usize, AccessError> {
        if !v.valid() {
            return Err(AccessError::Invalid);
        }
        match v.slot() {
            Slot::Data { offset } => {
                let len = v.len();
                if offset + len > self.buffer.len() {
                    return Err(AccessError::Invalid);
                }
                let key = offset;
                let hooked = self.config.enable_hooks;
                if hooked {
                    for l in &mut self.listeners {
                        l.entry_ro(v.ty(), key, len);
                    }
                }
                let cell = &self.buffer[offset..offset + len];
                let n = if v.ty().is_string() {
                    let eff = cell.iter().position(|&b| b == 0).unwrap_or(len);
                    let n = eff.min(dst.len());
                    dst[..n].copy_from_slice(&cell[..n]);
                    n
                } else if v.ty().is_fixed() {
                    if dst.len() < len {
                        if hooked {
                            for l in &mut self.listeners {
                                l.exit_ro(v.ty(), key, len);
                            }
                        }
                        return Err(AccessError::SizeMismatch);
                    }
                    dst[..len].copy_from_slice(cell);
                    len
                } else {
                    let n = len.min(dst.len());
                    dst[..n].copy_from_slice(&cell[..n]);
                    n
                };
                if hooked {
                    for l in &mut self.listeners {
                        l.exit_ro(v.ty(), key, len);
                    }
                }
                Ok(n)
            }
            Slot::Function { index } => self.call_function(index, v, false, dst),
            Slot::None => Err(AccessError::Invalid),
        }
    }

    /// Writes `src` into the cell, returning the number of bytes taken.
    /// Fixed-width cells require an exact-size `src`; strings clip at the
    /// first NUL and zero-fill the remainder of the cell.
    pub fn set(&mut self, v: &Variant, src: &[u8]) -> Result<usize, AccessError> {
        if !v.valid() {
            return Err(AccessError::Invalid);
        }
        match v.slot() {
            Slot::Data { offset } => {
                let len = v.len();
                if offset + len > self.buffer.len() {
                    return Err(AccessError::Invalid);
                }
                if v.ty().is_fixed() && src.len() != len {
                    return Err(AccessError::SizeMismatch);
                }
                let key = offset;
                let hooked = self.config.enable_hooks;
                if hooked {
                    for l in &mut self.listeners {
                        l.entry_x(v.ty(), key, len);
                    }
                }

                let cell = &mut self.buffer[offset..offset + len];
                let (taken, differ) = if v.ty().is_string() {
                    let eff = src
                        .iter()
                        .position(|&b| b == 0)
                        .unwrap_or(src.len())
                        .min(len);
                    let differ = cell[..eff] != src[..eff] || cell[eff..].iter().any(|&b| b != 0);
                    cell[..eff].copy_from_slice(&src[..eff]);
                    cell[eff..].fill(0);
                    (eff, differ)
                } else {
                    let n = src.len().min(len);
                    let differ = cell[..n] != src[..n];
                    cell[..n].copy_from_slice(&src[..n]);
                    (n, differ)
                };

                let changed = if self.config.hook_set_on_change_only {
                    differ
                } else {
                    true
                };
                if hooked {
                    for l in &mut self.listeners {
                        l.exit_x(v.ty(), key, len, changed);
                    }
                    if changed {
                        let bytes = &self.buffer[offset..offset + len];
                        for l in &mut self.listeners {
                            l.changed(v.ty(), key, bytes);
                        }
                    }
                }
                // The journal tracks real byte changes regardless of the
                // hook flag; idempotent re-applies must not re-propagate.
                if differ {
                    if let Some(j) = self.journal.as_mut() {
                        j.record(key, len);
                    }
                }
                Ok(taken)
            }
            Slot::Function { index } => {
                let mut buf = src.to_vec();
                self.call_function(index, v, true, &mut buf)
            }
            Slot::None => Err(AccessError::Invalid),
        }
    }

    fn call_function(
        &mut self,
        index: usize,
        v: &Variant,
        set: bool,
        buf: &mut [u8],
    ) -> Result<usize, AccessError> {
        let size = v.ty().size();
        if size != 0 && buf.len() < size {
            return Err(AccessError::SizeMismatch);
        }
        let f = self
            .functions
            .get_mut(index)
            .and_then(|f| f.as_mut())
            .ok_or(AccessError::NoFunction)?;
        if size != 0 {
            Ok(f(set, &mut buf[..size]))
        } else {
            Ok(f(set, buf))
        }
    }

    /// Reads the cell as a canonical [`Value`]. Numeric and bool cells
    /// only.
    pub fn value(&mut self, v: &Variant) -> Result<Value, AccessError> {
        let size = v.ty().size();
        if size == 0 {
            return Err(AccessError::TypeMismatch);
        }
        let mut buf = [0u8; 8];
        self.get(v, &mut buf[..size])?;
        Value::decode(v.ty(), &buf[..size]).ok_or(AccessError::TypeMismatch)
    }

    /// Writes a [`Value`] into the cell, saturating into its width.
    pub fn set_value(&mut self, v: &Variant, value: Value) -> Result<(), AccessError> {
        let size = v.ty().size();
        if size == 0 {
            return Err(AccessError::TypeMismatch);
        }
        let mut buf = [0u8; 8];
        value
            .encode(v.ty(), &mut buf[..size])
            .ok_or(AccessError::TypeMismatch)?;
        self.set(v, &buf[..size])?;
        Ok(())
    }

    /// Applies bytes to the cell identified by `key`, as the synchronizer
    /// does for incoming updates. Hooks fire like any other write.
    pub fn set_by_key(&mut self, key: Key, bytes: &[u8]) -> Result<usize, AccessError> {
        let v = self.cell_by_key(key).ok_or(AccessError::Invalid)?;
        if v.is_function() {
            return Err(AccessError::Invalid);
        }
        self.set(&v, bytes)
    }
}

impl fmt::Debug for Store {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Store")
            .field("name", &self.name())
            .field("buffer_len", &self.buffer.len())
            .field("cells", &self.cells.len())
            .field("functions", &self.functions.len())
            .finish()
    }
}

/// Assembles a [`StoreLayout`] the way a generator would: cells get
/// naturally aligned offsets in declaration order, function cells get
/// table slots, and both directories are built from the final table.
#[derive(Debug, Default)]
pub struct StoreBuilder {
    name: String,
    cells: Vec<BuilderCell>,
    functions: usize,
}

#[derive(Debug)]
struct BuilderCell {
    name: String,
    ty: Type,
    len: usize,
    init: Option<Vec<u8>>,
    function: bool,
}

impl StoreBuilder {
    pub fn new(name: &str) -> StoreBuilder {
        StoreBuilder {
            name: name.to_string(),
            cells: Vec::new(),
            functions: 0,
        }
    }

    /// A zero-initialised fixed-width data cell.
    pub fn cell(self, name: &str, ty: Type) -> Self {
        assert!(ty.is_fixed(), "use blob()/string() for variable-size cells");
        self.push(name, ty, ty.size(), None, false)
    }

    /// A fixed-width data cell with an initial value image.
    pub fn cell_init(self, name: &str, ty: Type, init: &[u8]) -> Self {
        assert!(ty.is_fixed() && init.len() == ty.size());
        self.push(name, ty, ty.size(), Some(init.to_vec()), false)
    }

    pub fn blob(self, name: &str, len: usize) -> Self {
        self.push(name, Type::BLOB, len, None, false)
    }

    pub fn string(self, name: &str, len: usize) -> Self {
        self.push(name, Type::STRING, len, None, false)
    }

    /// A function cell; its implementation is registered on the store
    /// afterwards with [`Store::set_function`], in declaration order.
    pub fn function(self, name: &str, ty: Type) -> Self {
        self.push(name, ty.as_function(), ty.size(), None, true)
    }

    /// A blob-like function cell of the given buffer size.
    pub fn function_blob(self, name: &str, len: usize) -> Self {
        self.push(name, Type::BLOB.as_function(), len, None, true)
    }

    fn push(mut self, name: &str, ty: Type, len: usize, init: Option<Vec<u8>>, function: bool) -> Self {
        self.cells.push(BuilderCell {
            name: name.to_string(),
            ty,
            len,
            init,
            function,
        });
        if function {
            self.functions += 1;
        }
        self
    }

    pub fn layout(self) -> StoreLayout {
        let mut offset = 0usize;
        let mut fn_index = 0usize;
        let mut initial = Vec::new();
        let mut defs: Vec<(String, Type, usize, usize)> = Vec::new();
        for c in &self.cells {
            if c.function {
                defs.push((c.name.clone(), c.ty, c.len, fn_index));
                fn_index += 1;
                continue;
            }
            // Natural alignment for fixed cells, byte alignment for the
            // rest.
            let align = if c.ty.is_fixed() { c.len.max(1) } else { 1 };
            offset = (offset + align - 1) / align * align;
            if initial.len() < offset + c.len {
                initial.resize(offset + c.len, 0);
            }
            if let Some(init) = &c.init {
                initial[offset..offset + c.len].copy_from_slice(init);
            }
            defs.push((c.name.clone(), c.ty, c.len, offset));
            offset += c.len;
        }

        let table: Vec<Cell> = defs
            .iter()
            .map(|(name, ty, len, off)| Cell::new(name, *ty, *len, *off))
            .collect();
        let short = directory::builder::short_directory(&table);
        let long = directory::builder::long_directory(&table);

        StoreLayout {
            name: Cow::Owned(self.name),
            short_directory: Cow::Owned(short),
            long_directory: Cow::Owned(long),
            initial: Cow::Owned(initial),
            functions: self.functions,
        }
    }

    pub fn build(self, config: Config) -> Store {
        let mut layout = self.layout();
        if !config.full_names {
            layout.long_directory = layout.short_directory.clone();
        }
        Store::new(layout, config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_store(config: Config) -> Store {
        StoreBuilder::new("TestStore")
            .cell("/default int8", Type::INT8)
            .cell("/default int16", Type::INT16)
            .cell("/default int32", Type::INT32)
            .cell("/default int64", Type::INT64)
            .cell("/default uint8", Type::UINT8)
            .cell("/default uint16", Type::UINT16)
            .cell("/default uint32", Type::UINT32)
            .cell("/default uint64", Type::UINT64)
            .cell("/default float", Type::FLOAT)
            .cell("/default double", Type::DOUBLE)
            .cell("/default bool", Type::BOOL)
            .blob("/default blob", 4)
            .string("/default string", 8)
            .cell_init("/init decimal 42", Type::UINT16, &42u16.to_ne_bytes())
            .function("/f read/write", Type::DOUBLE)
            .build(config)
    }

    #[test]
    fn test_scalar_roundtrips() {
        let mut s = test_store(Config::DEFAULT);
        let cases: Vec<(&str, Value)> = vec![
            ("/default int8", Value::Int(42)),
            ("/default int16", Value::Int(0x1234)),
            ("/default int32", Value::Int(0x7abcdef0)),
            ("/default int64", Value::Int(0x0123456789abcdef)),
            ("/default uint8", Value::Uint(42)),
            ("/default uint16", Value::Uint(0x1234)),
            ("/default uint32", Value::Uint(0x8abcdef0)),
            ("/default uint64", Value::Uint(0xf123456789abcdef)),
            ("/default float", Value::Float(3.14f32 as f64)),
            ("/default double", Value::Float(3.14)),
            ("/default bool", Value::Bool(true)),
        ];
        for (name, value) in cases {
            let v = s.find(name);
            assert!(v.valid(), "missing {:?}", name);
            match s.value(&v).unwrap() {
                Value::Int(n) => assert_eq!(n, 0, "{:?} not default-zero", name),
                Value::Uint(n) => assert_eq!(n, if name.ends_with("decimal 42") { 42 } else { 0 }),
                Value::Float(f) => assert_eq!(f, 0.0),
                Value::Bool(b) => assert!(!b),
            }
            s.set_value(&v, value).unwrap();
            assert_eq!(s.value(&v).unwrap(), value, "{:?} roundtrip", name);
        }
    }

    #[test]
    fn test_initial_image() {
        let mut s = test_store(Config::DEFAULT);
        let v = s.find("/init decimal 42");
        assert_eq!(s.value(&v).unwrap(), Value::Uint(42));
    }

    #[test]
    fn test_blob_roundtrip() {
        let mut s = test_store(Config::DEFAULT);
        let v = s.find("/default blob");
        assert_eq!(v.len(), 4);
        let mut out = [0u8; 4];
        assert_eq!(s.get(&v, &mut out).unwrap(), 4);
        assert_eq!(out, [0; 4]);
        assert_eq!(s.set(&v, &[1, 2, 3, 4]).unwrap(), 4);
        s.get(&v, &mut out).unwrap();
        assert_eq!(out, [1, 2, 3, 4]);
    }

    #[test]
    fn test_string_clips_at_nul() {
        let mut s = test_store(Config::DEFAULT);
        let v = s.find("/default string");
        let mut out = [0u8; 8];
        assert_eq!(s.get(&v, &mut out).unwrap(), 0);

        assert_eq!(s.set(&v, b"aaaaaaaa").unwrap(), 8);
        assert_eq!(s.get(&v, &mut out).unwrap(), 8);
        assert_eq!(&out, b"aaaaaaaa");

        assert_eq!(s.set(&v, b"a\0b\0").unwrap(), 1);
        assert_eq!(s.get(&v, &mut out).unwrap(), 1);
        assert_eq!(out[0], b'a');
        // The remainder of the cell is zeroed.
        assert!(s.peek(&v).unwrap()[1..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_fixed_size_is_strict() {
        let mut s = test_store(Config::DEFAULT);
        let v = s.find("/default int32");
        assert_eq!(s.set(&v, &[1, 2]), Err(AccessError::SizeMismatch));
        let mut small = [0u8; 2];
        assert_eq!(s.get(&v, &mut small), Err(AccessError::SizeMismatch));
    }

    #[test]
    fn test_function_cell() {
        let mut s = test_store(Config::DEFAULT);
        let state = Rc::new(RefCell::new(4.0f64));
        let state2 = state.clone();
        s.set_function(
            0,
            Box::new(move |set, buf| {
                if set {
                    *state2.borrow_mut() = f64::from_ne_bytes(buf.try_into().unwrap());
                } else {
                    buf.copy_from_slice(&state2.borrow().to_ne_bytes());
                }
                buf.len()
            }),
        );
        let v = s.find("/f read/write");
        assert!(v.valid() && v.is_function());
        assert_eq!(s.value(&v).unwrap(), Value::Float(4.0));
        s.set_value(&v, Value::Float(5.0)).unwrap();
        assert_eq!(s.value(&v).unwrap(), Value::Float(5.0));
        assert_eq!(*state.borrow(), 5.0);
    }

    #[test]
    fn test_unregistered_function() {
        let mut s = test_store(Config::DEFAULT);
        let v = s.find("/f read/write");
        assert_eq!(s.value(&v), Err(AccessError::NoFunction));
    }

    #[derive(Default)]
    struct Counter {
        entry_ro: usize,
        exit_ro: usize,
        entry_x: usize,
        exit_x: usize,
        changed: usize,
    }

    struct CountListener(Rc<RefCell<Counter>>);

    impl HookListener for CountListener {
        fn entry_ro(&mut self, _: Type, _: Key, _: usize) {
            self.0.borrow_mut().entry_ro += 1;
        }
        fn exit_ro(&mut self, _: Type, _: Key, _: usize) {
            self.0.borrow_mut().exit_ro += 1;
        }
        fn entry_x(&mut self, _: Type, _: Key, _: usize) {
            self.0.borrow_mut().entry_x += 1;
        }
        fn exit_x(&mut self, _: Type, _: Key, _: usize, _: bool) {
            self.0.borrow_mut().exit_x += 1;
        }
        fn changed(&mut self, _: Type, _: Key, _: &[u8]) {
            self.0.borrow_mut().changed += 1;
        }
    }

    #[test]
    fn test_hooks_bracket_every_access() {
        let mut s = test_store(Config::DEFAULT);
        let counter = Rc::new(RefCell::new(Counter::default()));
        s.add_listener(Box::new(CountListener(counter.clone())));

        let v = s.find("/default int32");
        let mut buf = [0u8; 4];
        s.get(&v, &mut buf).unwrap();
        assert_eq!(counter.borrow().entry_ro, 1);
        assert_eq!(counter.borrow().exit_ro, 1);

        s.set(&v, &[1, 0, 0, 0]).unwrap();
        assert_eq!(counter.borrow().entry_x, 1);
        assert_eq!(counter.borrow().exit_x, 1);
        assert_eq!(counter.borrow().changed, 1);

        // Hooks stay paired on failing accesses too.
        let mut small = [0u8; 2];
        let _ = s.get(&v, &mut small);
        assert_eq!(counter.borrow().entry_ro, 2);
        assert_eq!(counter.borrow().exit_ro, 2);
    }

    #[test]
    fn test_change_only_mode() {
        let mut config = Config::DEFAULT;
        config.hook_set_on_change_only = true;
        let mut s = test_store(config);
        let counter = Rc::new(RefCell::new(Counter::default()));
        s.add_listener(Box::new(CountListener(counter.clone())));

        let v = s.find("/default int16");
        s.set(&v, &[7, 0]).unwrap();
        s.set(&v, &[7, 0]).unwrap();
        assert_eq!(counter.borrow().changed, 1);

        // Default mode fires on every write.
        let mut s = test_store(Config::DEFAULT);
        let counter = Rc::new(RefCell::new(Counter::default()));
        s.add_listener(Box::new(CountListener(counter.clone())));
        let v = s.find("/default int16");
        s.set(&v, &[7, 0]).unwrap();
        s.set(&v, &[7, 0]).unwrap();
        assert_eq!(counter.borrow().changed, 2);
    }

    #[test]
    fn test_function_access_fires_no_hooks() {
        let mut s = test_store(Config::DEFAULT);
        s.set_function(0, Box::new(|_, buf| buf.len()));
        let counter = Rc::new(RefCell::new(Counter::default()));
        s.add_listener(Box::new(CountListener(counter.clone())));
        let v = s.find("/f read/write");
        let _ = s.value(&v);
        let _ = s.set_value(&v, Value::Float(1.0));
        let c = counter.borrow();
        assert_eq!(c.entry_ro + c.exit_ro + c.entry_x + c.exit_x + c.changed, 0);
    }

    #[test]
    fn test_journal_records_real_changes_only() {
        let mut s = test_store(Config::DEFAULT);
        s.enable_journal();
        let v = s.find("/default int32");
        s.set(&v, &[1, 2, 3, 4]).unwrap();
        assert_eq!(s.journal().unwrap().changes_since(0).count(), 1);
        let seq = s.journal().unwrap().seq();
        s.journal_mut().unwrap().bump();
        // Identical bytes do not re-journal, independent of hook config.
        s.set(&v, &[1, 2, 3, 4]).unwrap();
        assert!(!s.journal().unwrap().has_changes_since(seq));
    }

    #[test]
    fn test_keys_stable_and_unique() {
        let s = test_store(Config::DEFAULT);
        let mut keys = Vec::new();
        s.list(|name, v| {
            let k = s.key_of(v).unwrap();
            assert_eq!(s.cell_by_key(k), Some(*v), "key lookup for {:?}", name);
            keys.push(k);
        });
        let n = keys.len();
        keys.sort_unstable();
        keys.dedup();
        assert_eq!(keys.len(), n);
    }

    #[test]
    fn test_disabled_hooks() {
        let mut config = Config::DEFAULT;
        config.enable_hooks = false;
        let mut s = test_store(config);
        let counter = Rc::new(RefCell::new(Counter::default()));
        s.add_listener(Box::new(CountListener(counter.clone())));
        let v = s.find("/default int8");
        s.set(&v, &[1]).unwrap();
        let c = counter.borrow();
        assert_eq!(c.entry_x + c.exit_x + c.changed, 0);
    }
}
