//! Embedded-debugger command interpreter
//!
//! Processes one framed request byte string at a time and writes one
//! response byte string, usually via a [`Stack`]. One leading ASCII byte
//! selects the command:
//!
//! | Cmd | Meaning                                      |
//! |-----|----------------------------------------------|
//! | `?` | capabilities                                 |
//! | `i` | identification string                        |
//! | `v` | protocol (and application) versions          |
//! | `r` | read a cell, hex response                    |
//! | `w` | write hex bytes to a cell                    |
//! | `l` | list all cells                               |
//! | `a` | define/remove a one-character alias          |
//! | `m` | define/remove a macro                        |
//! | `e` | echo                                         |
//! | `s` | stream read                                  |
//! | `R`/`W` | raw memory access (`raw-memory` feature) |
//!
//! Any command that cannot produce a valid result answers `?`; commands
//! without a data response acknowledge with `!`. Values travel as
//! lowercase big-endian hex.

use std::collections::HashMap;

use cellar_core::store::StoreRef;
use cellar_core::util::to_wire_order;
use cellar_core::{Config, Variant};
use cellar_proto::Stack;
use tracing::debug;

/// Protocol version advertised by `v`.
const PROTOCOL_VERSION: &str = "2";

/// Command bytes that aliases and macros may not shadow.
const BUILTIN_COMMANDS: &[u8] = b"?ivrwelamstRW";

const MACRO_DEPTH_LIMIT: usize = 8;

/// A store-qualified [`Variant`], the debugger's currency: which mapped
/// store, and which cell within it. Small and copyable like the variant
/// itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DebugVariant {
    pub store: usize,
    pub variant: Variant,
}

impl DebugVariant {
    pub fn valid(&self) -> bool {
        self.variant.valid()
    }
}

/// Adds application commands on top of the built-in set.
pub trait CommandExtension {
    /// Extra capability bytes to advertise.
    fn capabilities(&self) -> &[u8];

    /// Handles a frame; return false to fall through to the built-ins.
    fn process(&mut self, frame: &[u8], response: &mut Vec<u8>) -> bool;
}

struct Mapped {
    prefix: String,
    store: StoreRef,
}

pub struct Debugger {
    config: Config,
    identification: Option<String>,
    versions: String,
    stores: Vec<Mapped>,
    aliases: HashMap<u8, DebugVariant>,
    macros: HashMap<u8, Vec<u8>>,
    macro_bytes: usize,
    streams: HashMap<u8, Vec<u8>>,
    extension: Option<Box<dyn CommandExtension>>,
}

impl Debugger {
    pub fn new(config: Config) -> Debugger {
        let mut aliases = HashMap::new();
        let mut macros = HashMap::new();
        let mut streams = HashMap::new();
        if config.avoid_dynamic_memory {
            aliases.reserve(config.debugger_alias.min(64));
            macros.reserve(16);
            streams.reserve(config.debugger_streams);
        }
        Debugger {
            config,
            identification: None,
            versions: String::new(),
            stores: Vec::new(),
            aliases,
            macros,
            macro_bytes: 0,
            streams,
            extension: None,
        }
    }

    /// Creates a debugger with an identification string.
    pub fn with_identification(config: Config, identification: &str) -> Debugger {
        let mut d = Debugger::new(config);
        d.identification = Some(identification.to_string());
        d
    }

    pub fn set_identification(&mut self, identification: &str) {
        self.identification = Some(identification.to_string());
    }

    /// Application version(s), reported by `v` after the protocol
    /// version.
    pub fn set_versions(&mut self, versions: &str) {
        self.versions = versions.to_string();
    }

    pub fn set_extension(&mut self, extension: Box<dyn CommandExtension>) {
        self.extension = Some(extension);
    }

    /// Maps a store under `/<store name>`.
    pub fn map(&mut self, store: StoreRef) {
        let prefix = format!("/{}", store.borrow().name());
        self.map_as(store, &prefix);
    }

    /// Maps a store under an explicit prefix.
    pub fn map_as(&mut self, store: StoreRef, prefix: &str) {
        assert!(prefix.starts_with('/') && prefix.len() > 1);
        self.stores.push(Mapped {
            prefix: prefix.to_string(),
            store,
        });
    }

    /// Resolves a (possibly prefixed, possibly abbreviated) name. The
    /// longest matching prefix selects the store; with exactly one store
    /// mapped, unprefixed names resolve directly against it.
    pub fn find(&self, name: &str) -> DebugVariant {
        let mut best: Option<(usize, usize)> = None;
        for (i, m) in self.stores.iter().enumerate() {
            if let Some(rest) = name.strip_prefix(m.prefix.as_str()) {
                if rest.starts_with('/') && best.map_or(true, |(_, l)| m.prefix.len() > l) {
                    best = Some((i, m.prefix.len()));
                }
            }
        }
        if let Some((i, plen)) = best {
            let v = self.stores[i].store.borrow().find(&name[plen..]);
            if v.valid() {
                return DebugVariant {
                    store: i,
                    variant: v,
                };
            }
        }
        if self.stores.len() == 1 {
            let v = self.stores[0].store.borrow().find(name);
            return DebugVariant {
                store: 0,
                variant: v,
            };
        }
        DebugVariant {
            store: 0,
            variant: Variant::invalid(),
        }
    }

    /// Appends `data` to stream `name`, honoring the stream budget.
    /// Returns the number of bytes accepted.
    pub fn stream(&mut self, name: u8, data: &[u8]) -> usize {
        if self.config.debugger_streams == 0 {
            return 0;
        }
        if !self.streams.contains_key(&name) && self.streams.len() >= self.config.debugger_streams {
            return 0;
        }
        let reserve = if self.config.avoid_dynamic_memory {
            self.config.debugger_stream_buffer
        } else {
            0
        };
        let buf = self
            .streams
            .entry(name)
            .or_insert_with(|| Vec::with_capacity(reserve));
        let room = self.config.debugger_stream_buffer.saturating_sub(buf.len());
        let n = room.min(data.len());
        buf.extend_from_slice(&data[..n]);
        n
    }

    /// The capability bytes advertised by `?`.
    pub fn capabilities(&self) -> Vec<u8> {
        let mut caps = vec![b'?'];
        let c = &self.config;
        if c.debugger_identification {
            caps.push(b'i');
        }
        if c.debugger_version {
            caps.push(b'v');
        }
        if c.debugger_read {
            caps.push(b'r');
        }
        if c.debugger_write {
            caps.push(b'w');
        }
        if c.debugger_echo {
            caps.push(b'e');
        }
        if c.debugger_list {
            caps.push(b'l');
        }
        if c.debugger_alias > 0 {
            caps.push(b'a');
        }
        if c.debugger_macro > 0 {
            caps.push(b'm');
        }
        if c.debugger_streams > 0 {
            caps.push(b's');
        }
        #[cfg(feature = "raw-memory")]
        {
            if c.debugger_read_mem {
                caps.push(b'R');
            }
            if c.debugger_write_mem {
                caps.push(b'W');
            }
        }
        if let Some(ext) = &self.extension {
            caps.extend_from_slice(ext.capabilities());
        }
        caps
    }

    /// Processes one request frame into `response` (cleared first).
    pub fn process(&mut self, frame: &[u8], response: &mut Vec<u8>) {
        response.clear();
        self.process_inner(frame, response, 0);
    }

    /// Drains requests from the stack and encodes the responses.
    pub fn pump(&mut self, stack: &mut Stack) {
        let mut response = Vec::new();
        while let Some(frame) = stack.poll_receive() {
            self.process(&frame, &mut response);
            stack.encode(&response);
        }
    }

    fn process_inner(&mut self, frame: &[u8], response: &mut Vec<u8>, depth: usize) {
        let Some(&cmd) = frame.first() else {
            response.push(b'?');
            return;
        };

        if let Some(mut ext) = self.extension.take() {
            let handled = ext.process(frame, response);
            self.extension = Some(ext);
            if handled {
                return;
            }
        }

        let args = &frame[1..];
        match cmd {
            b'?' => response.extend_from_slice(&self.capabilities()),
            b'i' if self.config.debugger_identification => match &self.identification {
                Some(id) => response.extend_from_slice(id.as_bytes()),
                None => response.push(b'?'),
            },
            b'v' if self.config.debugger_version => {
                response.extend_from_slice(PROTOCOL_VERSION.as_bytes());
                if !self.versions.is_empty() {
                    response.push(b' ');
                    response.extend_from_slice(self.versions.as_bytes());
                }
            }
            b'r' if self.config.debugger_read => self.cmd_read(args, response),
            b'w' if self.config.debugger_write => self.cmd_write(args, response),
            b'e' if self.config.debugger_echo => response.extend_from_slice(args),
            b'l' if self.config.debugger_list => self.cmd_list(response),
            b'a' if self.config.debugger_alias > 0 => self.cmd_alias(args, response),
            b'm' if self.config.debugger_macro > 0 => self.cmd_macro_define(args, response),
            b's' if self.config.debugger_streams > 0 => self.cmd_stream(args, response),
            #[cfg(feature = "raw-memory")]
            b'R' if self.config.debugger_read_mem => self.cmd_read_mem(args, response),
            #[cfg(feature = "raw-memory")]
            b'W' if self.config.debugger_write_mem => self.cmd_write_mem(args, response),
            c if self.macros.contains_key(&c) => self.run_macro(c, response, depth),
            _ => {
                debug!(cmd, "unknown command");
                response.push(b'?');
            }
        }
    }

    /// Resolves a read/write target: a single character is an alias,
    /// anything else a name.
    fn resolve(&self, target: &[u8]) -> Option<DebugVariant> {
        if target.len() == 1 {
            return self.aliases.get(&target[0]).copied();
        }
        let name = std::str::from_utf8(target).ok()?;
        let dv = self.find(name);
        dv.valid().then_some(dv)
    }

    fn cmd_read(&mut self, args: &[u8], response: &mut Vec<u8>) {
        let Some(dv) = self.resolve(args) else {
            response.push(b'?');
            return;
        };
        let v = dv.variant;
        let mut buf = vec![0u8; v.len()];
        let result = {
            let store = &self.stores[dv.store].store;
            let n = store.borrow_mut().get(&v, &mut buf);
            n
        };
        match result {
            Ok(n) => {
                if v.ty().is_fixed() {
                    // Full width, value (big-endian) order.
                    to_wire_order(&mut buf);
                    response.extend_from_slice(hex::encode(&buf).as_bytes());
                } else {
                    response.extend_from_slice(hex::encode(&buf[..n]).as_bytes());
                }
            }
            Err(_) => response.push(b'?'),
        }
    }

    fn cmd_write(&mut self, args: &[u8], response: &mut Vec<u8>) {
        let hex_len = args.iter().take_while(|b| b.is_ascii_hexdigit()).count();
        let (mut digits, mut target) = (&args[..hex_len], &args[hex_len..]);
        if target.is_empty() && hex_len > 0 {
            // The whole argument is hex digits; the last one may be a
            // hex-looking alias.
            let (d, t) = args.split_at(hex_len - 1);
            if self.aliases.contains_key(&t[0]) {
                digits = d;
                target = t;
            }
        }
        let Some(dv) = self.resolve(target) else {
            response.push(b'?');
            return;
        };
        let Some(bytes) = parse_hex_value(digits) else {
            response.push(b'?');
            return;
        };
        let v = dv.variant;
        let data = if v.ty().is_fixed() {
            let size = v.len();
            if bytes.len() > size {
                response.push(b'?');
                return;
            }
            // Left-pad to the cell width, then back to native order.
            let mut padded = vec![0u8; size - bytes.len()];
            padded.extend_from_slice(&bytes);
            to_wire_order(&mut padded);
            padded
        } else {
            bytes
        };
        let result = self.stores[dv.store].store.borrow_mut().set(&v, &data);
        match result {
            Ok(_) => response.push(b'!'),
            Err(_) => response.push(b'?'),
        }
    }

    fn cmd_list(&mut self, response: &mut Vec<u8>) {
        for m in &self.stores {
            let store = m.store.borrow();
            store.list(|name, v| {
                response.extend_from_slice(format!("{:02x}", v.ty().to_byte()).as_bytes());
                if !v.ty().is_fixed() {
                    response.extend_from_slice(format!("{:x}", v.len()).as_bytes());
                }
                response.extend_from_slice(m.prefix.as_bytes());
                response.extend_from_slice(name.as_bytes());
                response.push(b'\n');
            });
        }
        if response.is_empty() {
            response.push(b'?');
        }
    }

    fn cmd_alias(&mut self, args: &[u8], response: &mut Vec<u8>) {
        let Some(&alias) = args.first() else {
            response.push(b'?');
            return;
        };
        if !(0x20..0x7f).contains(&alias) || alias == b'/' || BUILTIN_COMMANDS.contains(&alias) {
            response.push(b'?');
            return;
        }
        let name = &args[1..];
        if name.is_empty() {
            self.aliases.remove(&alias);
            response.push(b'!');
            return;
        }
        let Some(dv) = self.resolve(name) else {
            response.push(b'?');
            return;
        };
        if !self.aliases.contains_key(&alias) && self.aliases.len() >= self.config.debugger_alias {
            response.push(b'?');
            return;
        }
        self.aliases.insert(alias, dv);
        response.push(b'!');
    }

    fn cmd_macro_define(&mut self, args: &[u8], response: &mut Vec<u8>) {
        let Some(&id) = args.first() else {
            response.push(b'?');
            return;
        };
        if !(0x20..0x7f).contains(&id) || BUILTIN_COMMANDS.contains(&id) {
            response.push(b'?');
            return;
        }
        let body = &args[1..];
        let old = self.macros.get(&id).map_or(0, |m| m.len());
        if body.is_empty() {
            self.macros.remove(&id);
            self.macro_bytes -= old;
            response.push(b'!');
            return;
        }
        if self.macro_bytes - old + body.len() > self.config.debugger_macro {
            response.push(b'?');
            return;
        }
        self.macros.insert(id, body.to_vec());
        self.macro_bytes = self.macro_bytes - old + body.len();
        response.push(b'!');
    }

    /// Runs each sub-command, emitting its response followed by the
    /// macro's delimiter, continuing past failures.
    fn run_macro(&mut self, id: u8, response: &mut Vec<u8>, depth: usize) {
        if depth >= MACRO_DEPTH_LIMIT {
            response.push(b'?');
            return;
        }
        let body = self.macros.get(&id).cloned().unwrap_or_default();
        let Some((&sep, cmds)) = body.split_first() else {
            return;
        };
        for cmd in cmds.split(|&b| b == sep) {
            self.process_inner(cmd, response, depth + 1);
            response.push(sep);
        }
    }

    fn cmd_stream(&mut self, args: &[u8], response: &mut Vec<u8>) {
        match args.first() {
            None => {
                let mut names: Vec<u8> = self
                    .streams
                    .iter()
                    .filter(|(_, buf)| !buf.is_empty())
                    .map(|(&n, _)| n)
                    .collect();
                if names.is_empty() {
                    response.push(b'?');
                } else {
                    names.sort_unstable();
                    response.extend_from_slice(&names);
                }
            }
            Some(&name) => match self.streams.get_mut(&name) {
                Some(buf) if !buf.is_empty() => {
                    response.extend_from_slice(buf);
                    buf.clear();
                }
                _ => response.push(b'?'),
            },
        }
    }

    #[cfg(feature = "raw-memory")]
    fn cmd_read_mem(&mut self, args: &[u8], response: &mut Vec<u8>) {
        let Some((addr, len)) = parse_mem_args(args) else {
            response.push(b'?');
            return;
        };
        let mut bytes = vec![0u8; len];
        for (i, b) in bytes.iter_mut().enumerate() {
            // Gated by config; the operator asked for exactly this.
            *b = unsafe { std::ptr::read_volatile((addr + i) as *const u8) };
        }
        to_wire_order(&mut bytes);
        response.extend_from_slice(hex::encode(&bytes).as_bytes());
    }

    #[cfg(feature = "raw-memory")]
    fn cmd_write_mem(&mut self, args: &[u8], response: &mut Vec<u8>) {
        let Some(space) = args.iter().position(|&b| b == b' ') else {
            response.push(b'?');
            return;
        };
        let (addr_hex, value_hex) = (&args[..space], &args[space + 1..]);
        let Some(addr) = parse_hex_usize(addr_hex) else {
            response.push(b'?');
            return;
        };
        let Some(mut bytes) = parse_hex_value(value_hex) else {
            response.push(b'?');
            return;
        };
        to_wire_order(&mut bytes);
        for (i, &b) in bytes.iter().enumerate() {
            unsafe { std::ptr::write_volatile((addr + i) as *mut u8, b) };
        }
        response.push(b'!');
    }
}

/// Decodes hex digits into bytes, tolerating an odd count by an implied
/// leading zero. Empty input is an empty write.
fn parse_hex_value(digits: &[u8]) -> Option<Vec<u8>> {
    let mut owned;
    let digits = if digits.len() % 2 == 1 {
        owned = Vec::with_capacity(digits.len() + 1);
        owned.push(b'0');
        owned.extend_from_slice(digits);
        &owned[..]
    } else {
        digits
    };
    hex::decode(digits).ok()
}

#[cfg(feature = "raw-memory")]
fn parse_hex_usize(digits: &[u8]) -> Option<usize> {
    usize::from_str_radix(std::str::from_utf8(digits).ok()?, 16).ok()
}

#[cfg(feature = "raw-memory")]
fn parse_mem_args(args: &[u8]) -> Option<(usize, usize)> {
    let space = args.iter().position(|&b| b == b' ')?;
    let addr = parse_hex_usize(&args[..space])?;
    let len: usize = std::str::from_utf8(&args[space + 1..]).ok()?.parse().ok()?;
    Some((addr, len))
}

#[cfg(test)]
mod tests {
    use super::*;
    use cellar_core::{StoreBuilder, Type};

    fn trace_init() {
        use tracing_subscriber::EnvFilter;
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .try_init();
    }

    fn test_store() -> StoreRef {
        StoreBuilder::new("TestStore")
            .cell("/default int8", Type::INT8)
            .cell("/default int16", Type::INT16)
            .cell("/default int32", Type::INT32)
            .cell("/default uint16", Type::UINT16)
            .blob("/blob 4", 4)
            .string("/string 8", 8)
            .build(Config::DEFAULT)
            .into_ref()
    }

    fn debugger_for(store: StoreRef) -> Debugger {
        let mut d = Debugger::with_identification(Config::DEFAULT, "cellar-test");
        d.map(store);
        d
    }

    fn ask(d: &mut Debugger, req: &[u8]) -> Vec<u8> {
        let mut resp = Vec::new();
        d.process(req, &mut resp);
        resp
    }

    #[test]
    fn test_capabilities_and_identification() {
        let mut d = debugger_for(test_store());
        let caps = ask(&mut d, b"?");
        for c in b"?ivrwelams" {
            assert!(caps.contains(c), "missing capability {}", *c as char);
        }
        assert_eq!(ask(&mut d, b"i"), b"cellar-test");
        assert_eq!(ask(&mut d, b"v"), b"2");
        d.set_versions("123");
        assert_eq!(ask(&mut d, b"v"), b"2 123");
    }

    #[test]
    fn test_read_write_roundtrip() {
        let store = test_store();
        let mut d = debugger_for(store.clone());
        {
            let mut s = store.borrow_mut();
            let v = s.find("/default int32");
            s.set_value(&v, cellar_core::Value::Int(0x7abcdef0)).unwrap();
        }
        assert_eq!(ask(&mut d, b"r/default int32"), b"7abcdef0");
        assert_eq!(ask(&mut d, b"w12345678/default int32"), b"!");
        assert_eq!(ask(&mut d, b"r/default int32"), b"12345678");
        // Short hex writes are left-padded to the cell width.
        assert_eq!(ask(&mut d, b"wf00f/default int32"), b"!");
        assert_eq!(ask(&mut d, b"r/default int32"), b"0000f00f");
    }

    #[test]
    fn test_unprefixed_names_with_single_store() {
        let mut d = debugger_for(test_store());
        assert_eq!(ask(&mut d, b"r/default int8"), b"00");
        assert_eq!(ask(&mut d, b"r/TestStore/default int8"), b"00");
    }

    #[test]
    fn test_prefix_selects_store() {
        let a = test_store();
        let b = StoreBuilder::new("Other")
            .cell("/j", Type::INT32)
            .build(Config::DEFAULT)
            .into_ref();
        let mut d = Debugger::new(Config::DEFAULT);
        d.map_as(a, "/SomeStore");
        d.map(b);
        assert_eq!(ask(&mut d, b"r/SomeStore/default int16"), b"0000");
        assert_eq!(ask(&mut d, b"r/Other/j"), b"00000000");
        // Without a prefix, two stores are ambiguous.
        assert_eq!(ask(&mut d, b"r/default int16"), b"?");
    }

    #[test]
    fn test_alias_flow() {
        let mut d = debugger_for(test_store());
        assert_eq!(ask(&mut d, b"a0/default int32"), b"!");
        assert_eq!(ask(&mut d, b"r0"), b"00000000");
        assert_eq!(ask(&mut d, b"wf00f0000/default int32"), b"!");
        assert_eq!(ask(&mut d, b"r0"), b"f00f0000");
        // Aliased write, alias being a hex digit.
        assert_eq!(ask(&mut d, b"wff0"), b"!");
        assert_eq!(ask(&mut d, b"r0"), b"000000ff");
        // Remove.
        assert_eq!(ask(&mut d, b"a0"), b"!");
        assert_eq!(ask(&mut d, b"r0"), b"?");
    }

    #[test]
    fn test_alias_capacity() {
        let mut config = Config::DEFAULT;
        config.debugger_alias = 1;
        let mut d = Debugger::new(config);
        d.map(test_store());
        assert_eq!(ask(&mut d, b"a0/default int8"), b"!");
        assert_eq!(ask(&mut d, b"a1/default int16"), b"?");
        // Redefining the existing alias is fine.
        assert_eq!(ask(&mut d, b"a0/default int16"), b"!");
    }

    #[test]
    fn test_list() {
        let mut d = debugger_for(test_store());
        let out = ask(&mut d, b"l");
        let text = String::from_utf8(out).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 6);
        assert!(lines.contains(&"3b/TestStore/default int32"));
        // Blob and string lines carry their length.
        assert!(lines.contains(&"014/TestStore/blob 4"));
        assert!(lines.contains(&"028/TestStore/string 8"));
    }

    #[test]
    fn test_echo_and_unknown() {
        let mut d = debugger_for(test_store());
        assert_eq!(ask(&mut d, b"eHello World!!1"), b"Hello World!!1");
        assert_eq!(ask(&mut d, b"z"), b"?");
        assert_eq!(ask(&mut d, b""), b"?");
    }

    #[test]
    fn test_macro_definition_and_execution() {
        let mut d = debugger_for(test_store());
        assert_eq!(ask(&mut d, b"a0/default int8"), b"!");
        assert_eq!(ask(&mut d, b"m* r0 r0"), b"!");
        assert_eq!(ask(&mut d, b"*"), b"00 00 ");
        // Redefinition replaces, removal frees the budget.
        assert_eq!(ask(&mut d, b"m*;e1;e2"), b"!");
        assert_eq!(ask(&mut d, b"*"), b"1;2;");
        assert_eq!(ask(&mut d, b"m*"), b"!");
        assert_eq!(ask(&mut d, b"*"), b"?");
    }

    #[test]
    fn test_macro_continues_past_failures() {
        let mut d = debugger_for(test_store());
        assert_eq!(ask(&mut d, b"m!;rZZ;eok"), b"!");
        assert_eq!(ask(&mut d, b"!"), b"?;ok;");
    }

    #[test]
    fn test_macro_budget() {
        let mut config = Config::DEFAULT;
        config.debugger_macro = 8;
        let mut d = Debugger::new(config);
        d.map(test_store());
        assert_eq!(ask(&mut d, b"m* e123"), b"!");
        assert_eq!(ask(&mut d, b"m+ e45678"), b"?");
        assert_eq!(ask(&mut d, b"m*"), b"!");
        assert_eq!(ask(&mut d, b"m+ e45678"), b"!");
    }

    #[test]
    fn test_macro_recursion_bounded() {
        let mut d = debugger_for(test_store());
        assert_eq!(ask(&mut d, b"m* *"), b"!");
        let out = ask(&mut d, b"*");
        assert!(out.ends_with(b"? ") || out.contains(&b'?'));
    }

    #[test]
    fn test_streams() {
        let mut d = debugger_for(test_store());
        assert_eq!(ask(&mut d, b"s"), b"?");
        assert_eq!(d.stream(b'A', b"Hello"), 5);
        assert_eq!(ask(&mut d, b"s"), b"A");
        assert_eq!(ask(&mut d, b"sA"), b"Hello");
        assert_eq!(ask(&mut d, b"sA"), b"?");
        assert_eq!(ask(&mut d, b"sB"), b"?");
    }

    #[test]
    fn test_stream_budget() {
        let mut config = Config::DEFAULT;
        config.debugger_streams = 1;
        config.debugger_stream_buffer = 4;
        let mut d = Debugger::new(config);
        d.map(test_store());
        assert_eq!(d.stream(b'A', b"123456"), 4);
        assert_eq!(d.stream(b'B', b"x"), 0);
        assert_eq!(ask(&mut d, b"sA"), b"1234");
    }

    #[test]
    fn test_blob_and_string() {
        let mut d = debugger_for(test_store());
        assert_eq!(ask(&mut d, b"w01020304/blob 4"), b"!");
        assert_eq!(ask(&mut d, b"r/blob 4"), b"01020304");
        // 68692100 decodes to "hi!\0": the string clips at the NUL.
        assert_eq!(ask(&mut d, b"w68692100/string 8"), b"!");
        assert_eq!(ask(&mut d, b"r/string 8"), b"686921");
    }

    #[test]
    fn test_disabled_commands() {
        let mut config = Config::DEFAULT;
        config.debugger_write = false;
        config.debugger_echo = false;
        let mut d = Debugger::new(config);
        d.map(test_store());
        assert_eq!(ask(&mut d, b"w01/default int8"), b"?");
        assert_eq!(ask(&mut d, b"ex"), b"?");
        let caps = ask(&mut d, b"?");
        assert!(!caps.contains(&b'w'));
        assert!(!caps.contains(&b'e'));
    }

    struct SleepExtension;

    impl CommandExtension for SleepExtension {
        fn capabilities(&self) -> &[u8] {
            b"z"
        }
        fn process(&mut self, frame: &[u8], response: &mut Vec<u8>) -> bool {
            if frame.first() == Some(&b'z') {
                response.extend_from_slice(b"Zzzz");
                true
            } else {
                false
            }
        }
    }

    #[test]
    fn test_extension() {
        let mut d = debugger_for(test_store());
        d.set_extension(Box::new(SleepExtension));
        assert!(ask(&mut d, b"?").contains(&b'z'));
        assert_eq!(ask(&mut d, b"z"), b"Zzzz");
        // Built-ins still work underneath.
        assert_eq!(ask(&mut d, b"ex"), b"x");
    }

    #[test]
    fn test_wire_request_through_full_stack() {
        use cellar_proto::{ArqConfig, ArqLayer, AsciiEscapeLayer, Crc16Layer, SegmentationLayer, TerminalLayer};

        trace_init();
        let make = || {
            Stack::new()
                .with(SegmentationLayer::new(12))
                .with(ArqLayer::new(ArqConfig::default()))
                .with(Crc16Layer::new())
                .with(AsciiEscapeLayer::new())
                .with(TerminalLayer::new())
        };
        let store = test_store();
        {
            let mut s = store.borrow_mut();
            let v = s.find("/default int32");
            s.set_value(&v, cellar_core::Value::Int(0x7abcdef0)).unwrap();
        }
        let mut d = debugger_for(store);
        let mut device = make();
        let mut host = make();

        host.encode(b"r/default int32");
        loop {
            let mut moved = false;
            while let Some(f) = host.poll_transmit() {
                device.decode(&f);
                moved = true;
            }
            d.pump(&mut device);
            while let Some(f) = device.poll_transmit() {
                host.decode(&f);
                moved = true;
            }
            if !moved {
                break;
            }
        }
        assert_eq!(host.poll_receive().as_deref(), Some(&b"7abcdef0"[..]));
    }

    #[test]
    fn test_function_cell_read() {
        let store = StoreBuilder::new("F")
            .function("/answer", Type::UINT16)
            .build(Config::DEFAULT)
            .into_ref();
        store.borrow_mut().set_function(
            0,
            Box::new(|set, buf| {
                if !set {
                    buf.copy_from_slice(&42u16.to_ne_bytes());
                }
                buf.len()
            }),
        );
        let mut d = debugger_for(store);
        assert_eq!(ask(&mut d, b"r/answer"), b"002a");
    }
}
