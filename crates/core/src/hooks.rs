//! The cell access hook protocol
//!
//! Every data-cell access is bracketed by hook calls: `entry_ro`/`exit_ro`
//! around reads, `entry_x`/`exit_x` around writes, and `changed` after an
//! exclusive access that modified the cell. The store guarantees that
//! every `entry_*` is paired with exactly one `exit_*`, and that `changed`
//! fires after `exit_x` has returned.
//!
//! Listeners form a chain on the store; this is the single extension point
//! used for change signalling and by the synchronizer's journal. Function
//! cells bypass the hook protocol entirely.

use crate::types::Type;

/// Stable cell identity within one store: the buffer offset for data
/// cells, `buffer_len + index` for function cells.
pub type Key = usize;

/// A hook chain member. All methods default to no-ops so listeners
/// implement only what they observe.
pub trait HookListener {
    fn entry_ro(&mut self, _ty: Type, _key: Key, _len: usize) {}

    fn exit_ro(&mut self, _ty: Type, _key: Key, _len: usize) {}

    fn entry_x(&mut self, _ty: Type, _key: Key, _len: usize) {}

    /// `changed` reports whether the write modified the cell, subject to
    /// `Config::hook_set_on_change_only`.
    fn exit_x(&mut self, _ty: Type, _key: Key, _len: usize, _changed: bool) {}

    /// Fired after `exit_x` reported a change; `bytes` is the new cell
    /// content.
    fn changed(&mut self, _ty: Type, _key: Key, _bytes: &[u8]) {}
}
