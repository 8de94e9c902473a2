//! cellar-debugger: the embedded-debugger command interpreter
//!
//! Maps one or more stores under name prefixes and answers the embedded
//! debugger wire protocol: reads and writes by (abbreviated) name, cell
//! listing, aliases, macros, echo, streams, and - feature-gated - raw
//! memory access. Attach it on top of a [`cellar_proto::Stack`] with
//! [`Debugger::pump`].

pub mod debugger;

pub use debugger::{CommandExtension, DebugVariant, Debugger};
