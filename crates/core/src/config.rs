//! Static configuration
//!
//! All knobs are decided at construction time and never change afterwards,
//! mirroring a compile-time configuration on embedded targets. `Config` is
//! `Copy` and const-constructible so a target can keep one in a `const`.

/// Store and debugger configuration with embedded-friendly defaults.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Config {
    /// Keep human-readable names: the store carries a long directory next
    /// to the short one, and list output reproduces full names.
    pub full_names: bool,
    /// Run the hook chain on cell access.
    pub enable_hooks: bool,
    /// Fire the `changed` hook only when the written bytes differ.
    /// When off, every exclusive access counts as a change.
    pub hook_set_on_change_only: bool,

    pub debugger_read: bool,
    pub debugger_write: bool,
    pub debugger_echo: bool,
    pub debugger_list: bool,
    pub debugger_identification: bool,
    pub debugger_version: bool,
    pub debugger_read_mem: bool,
    pub debugger_write_mem: bool,
    /// Maximum number of aliases; 0 disables the `a` command.
    pub debugger_alias: usize,
    /// Total byte budget for macro definitions; 0 disables `m`.
    pub debugger_macro: usize,
    /// Number of streams; 0 disables `s`.
    pub debugger_streams: usize,
    /// Buffer bytes per stream.
    pub debugger_stream_buffer: usize,

    /// Pre-reserve working buffers so the steady state does not allocate.
    pub avoid_dynamic_memory: bool,
}

impl Config {
    pub const DEFAULT: Config = Config {
        full_names: true,
        enable_hooks: true,
        hook_set_on_change_only: false,
        debugger_read: true,
        debugger_write: true,
        debugger_echo: true,
        debugger_list: true,
        debugger_identification: true,
        debugger_version: true,
        debugger_read_mem: false,
        debugger_write_mem: false,
        debugger_alias: 0x100,
        debugger_macro: 0x1000,
        debugger_streams: 1,
        debugger_stream_buffer: 1024,
        avoid_dynamic_memory: true,
    };
}

impl Default for Config {
    fn default() -> Self {
        Config::DEFAULT
    }
}
