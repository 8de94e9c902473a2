//! Multi-node store synchronizer
//!
//! Replicates mapped stores across nodes over any protocol channel. Per
//! (store, channel) pair the synchronizer runs a small state machine:
//!
//! ```text
//!                  hello ->
//! Disconnected  ----------->  HelloSent
//!     ^                           |
//!  bye|                           |  <- welcome (full buffer)
//!     +--------  Synced  <--------+
//!                  | ^
//!       update <-  | |  -> update
//! ```
//!
//! The side that wants the authoritative copy calls
//! [`Synchronizer::sync_from`], which sends *Hello* (schema hash + its
//! store id). The peer answers *Welcome* (echoed id, its own id, the full
//! buffer) and both enter Synced. From then on local writes - observed
//! through the store journal - are flushed as coalesced *Update* records
//! by [`Synchronizer::process`]. Updates applied from a channel advance
//! that channel's journal high-water mark, so they are never echoed back
//! to their origin; identical re-applies do not journal at all, which
//! makes cyclic topologies converge.
//!
//! Wire format (big-endian): `h` hash:u32 id:u16, `w` echoed:u16 id:u16
//! buffer..., `u` id:u16 (key:u32 len:u16 bytes...)*, `b` id:u16. Ids
//! address the *receiver's* store table, so each side indexes directly.

use cellar_core::store::StoreRef;
use cellar_proto::{LoopbackEnd, Stack};
use tracing::{debug, warn};

const MSG_HELLO: u8 = b'h';
const MSG_WELCOME: u8 = b'w';
const MSG_UPDATE: u8 = b'u';
const MSG_BYE: u8 = b'b';

/// Handle to a connected channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelId(usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    Disconnected,
    HelloSent,
    Synced,
}

#[derive(Debug)]
struct Pair {
    store: usize,
    state: SyncState,
    /// Id the peer uses to address this store in messages it sends us.
    local_id: u16,
    /// Id we use to address the peer's copy.
    remote_id: Option<u16>,
    /// Journal sequence this channel is known to have seen.
    last_seq: u64,
}

struct Channel {
    stack: Stack,
    pairs: Vec<Pair>,
    connected: bool,
}

#[derive(Default)]
pub struct Synchronizer {
    stores: Vec<StoreRef>,
    channels: Vec<Channel>,
    next_id: u16,
}

impl Synchronizer {
    pub fn new() -> Synchronizer {
        Synchronizer::default()
    }

    /// Registers a store for synchronization and enables its journal.
    pub fn map(&mut self, store: &StoreRef) {
        if self.store_index(store).is_none() {
            store.borrow_mut().enable_journal();
            self.stores.push(store.clone());
        }
    }

    /// Connects a protocol stack as a new channel.
    pub fn connect(&mut self, stack: Stack) -> ChannelId {
        self.channels.push(Channel {
            stack,
            pairs: Vec::new(),
            connected: true,
        });
        ChannelId(self.channels.len() - 1)
    }

    /// Requests the authoritative copy of `store` from the peer on
    /// `channel` by sending Hello.
    pub fn sync_from(&mut self, store: &StoreRef, channel: ChannelId) {
        let store_idx = self.store_index(store).expect("store not mapped");
        let local_id = self.alloc_id();
        let hash = store.borrow().schema_hash();
        let ch = &mut self.channels[channel.0];
        ch.pairs.retain(|p| p.store != store_idx);
        ch.pairs.push(Pair {
            store: store_idx,
            state: SyncState::HelloSent,
            local_id,
            remote_id: None,
            last_seq: 0,
        });
        let mut msg = Vec::with_capacity(7);
        msg.push(MSG_HELLO);
        msg.extend_from_slice(&hash.to_be_bytes());
        msg.extend_from_slice(&local_id.to_be_bytes());
        ch.stack.encode(&msg);
        debug!(hash, local_id, "hello sent");
    }

    /// The state of (store, channel), mainly for tests and diagnostics.
    pub fn state(&self, store: &StoreRef, channel: ChannelId) -> SyncState {
        let Some(idx) = self.store_index(store) else {
            return SyncState::Disconnected;
        };
        self.channels[channel.0]
            .pairs
            .iter()
            .find(|p| p.store == idx)
            .map_or(SyncState::Disconnected, |p| p.state)
    }

    /// Flushes pending changes of every mapped store.
    pub fn process(&mut self) {
        for i in 0..self.stores.len() {
            self.process_index(i);
        }
    }

    /// Flushes pending changes of one store. Emits at most one message
    /// per channel.
    pub fn process_store(&mut self, store: &StoreRef) {
        if let Some(idx) = self.store_index(store) {
            self.process_index(idx);
        }
    }

    fn process_index(&mut self, store_idx: usize) {
        let store = self.stores[store_idx].clone();
        for ch in &mut self.channels {
            if !ch.connected {
                continue;
            }
            let Some(pair) = ch
                .pairs
                .iter_mut()
                .find(|p| p.store == store_idx && p.state == SyncState::Synced)
            else {
                continue;
            };
            let Some(remote_id) = pair.remote_id else {
                continue;
            };
            let mut s = store.borrow_mut();
            let Some(journal) = s.journal() else {
                continue;
            };
            if !journal.has_changes_since(pair.last_seq) {
                continue;
            }
            let mut msg = Vec::new();
            msg.push(MSG_UPDATE);
            msg.extend_from_slice(&remote_id.to_be_bytes());
            let changes: Vec<_> = journal.changes_since(pair.last_seq).collect();
            for c in changes {
                let Some(v) = s.cell_by_key(c.key) else {
                    continue;
                };
                let Some(bytes) = s.peek(&v) else {
                    continue;
                };
                msg.extend_from_slice(&(c.key as u32).to_be_bytes());
                msg.extend_from_slice(&(bytes.len() as u16).to_be_bytes());
                msg.extend_from_slice(bytes);
            }
            pair.last_seq = s.journal().expect("journal enabled").seq();
            s.journal_mut().expect("journal enabled").bump();
            drop(s);
            ch.stack.encode(&msg);
        }
    }

    /// Sends Bye for `store` on `channel` and forgets the pairing.
    pub fn disconnect_store(&mut self, store: &StoreRef, channel: ChannelId) {
        let Some(idx) = self.store_index(store) else {
            return;
        };
        let ch = &mut self.channels[channel.0];
        if let Some(pos) = ch.pairs.iter().position(|p| p.store == idx) {
            let pair = ch.pairs.remove(pos);
            if let Some(remote_id) = pair.remote_id {
                let mut msg = vec![MSG_BYE];
                msg.extend_from_slice(&remote_id.to_be_bytes());
                ch.stack.encode(&msg);
            }
        }
    }

    /// Sends Bye for every synced store on `channel` and drops the
    /// channel's pairings.
    pub fn disconnect(&mut self, channel: ChannelId) {
        let ch = &mut self.channels[channel.0];
        for pair in ch.pairs.drain(..) {
            if let Some(remote_id) = pair.remote_id {
                let mut msg = vec![MSG_BYE];
                msg.extend_from_slice(&remote_id.to_be_bytes());
                ch.stack.encode(&msg);
            }
        }
        ch.connected = false;
    }

    /// Feeds transport bytes received on `channel` and handles any
    /// complete synchronizer messages.
    pub fn decode(&mut self, channel: ChannelId, raw: &[u8]) {
        self.channels[channel.0].stack.decode(raw);
        self.drain(channel);
    }

    /// Advances the channel's retransmission timer.
    pub fn tick(&mut self, channel: ChannelId) {
        self.channels[channel.0].stack.tick();
        self.drain(channel);
    }

    /// Next wire datagram to transmit on `channel`.
    pub fn poll_transmit(&mut self, channel: ChannelId) -> Option<Vec<u8>> {
        self.channels[channel.0].stack.poll_transmit()
    }

    /// Pops one message from a loopback endpoint into this channel.
    pub fn recv<const N: usize>(&mut self, channel: ChannelId, end: &LoopbackEnd<'_, N>) -> bool {
        let mut msg = Vec::new();
        if !end.recv_into(&mut msg) {
            return false;
        }
        self.decode(channel, &msg);
        true
    }

    /// Drains a loopback endpoint into this channel; returns the number
    /// of messages handled.
    pub fn recv_all<const N: usize>(
        &mut self,
        channel: ChannelId,
        end: &LoopbackEnd<'_, N>,
    ) -> usize {
        let mut n = 0;
        while self.recv(channel, end) {
            n += 1;
        }
        n
    }

    /// Pushes everything this channel wants transmitted into a loopback
    /// endpoint.
    pub fn pump<const N: usize>(&mut self, channel: ChannelId, end: &LoopbackEnd<'_, N>) -> usize {
        let mut n = 0;
        while let Some(frame) = self.poll_transmit(channel) {
            n += end.send(&frame);
        }
        n
    }

    fn drain(&mut self, channel: ChannelId) {
        loop {
            let frame = self.channels[channel.0].stack.poll_receive();
            match frame {
                Some(msg) => self.handle_message(channel, &msg),
                None => break,
            }
        }
        let ch = &mut self.channels[channel.0];
        if ch.stack.is_closed() && ch.connected {
            warn!(channel = channel.0, "channel closed; dropping pairings");
            ch.pairs.clear();
            ch.connected = false;
        }
    }

    fn handle_message(&mut self, channel: ChannelId, msg: &[u8]) {
        let Some(&kind) = msg.first() else {
            return;
        };
        let body = &msg[1..];
        match kind {
            MSG_HELLO => self.on_hello(channel, body),
            MSG_WELCOME => self.on_welcome(channel, body),
            MSG_UPDATE => self.on_update(channel, body),
            MSG_BYE => self.on_bye(channel, body),
            _ => debug!(kind, "unknown synchronizer message"),
        }
    }

    fn on_hello(&mut self, channel: ChannelId, body: &[u8]) {
        if body.len() < 6 {
            return;
        }
        let hash = u32::from_be_bytes(body[..4].try_into().unwrap());
        let their_id = u16::from_be_bytes(body[4..6].try_into().unwrap());
        let taken: Vec<usize> = self.channels[channel.0]
            .pairs
            .iter()
            .map(|p| p.store)
            .collect();
        let Some(store_idx) = self
            .stores
            .iter()
            .enumerate()
            .position(|(i, s)| s.borrow().schema_hash() == hash && !taken.contains(&i))
        else {
            debug!(hash, "hello for unknown store");
            return;
        };
        let local_id = self.alloc_id();
        let store = self.stores[store_idx].clone();
        let mut msg = Vec::new();
        msg.push(MSG_WELCOME);
        msg.extend_from_slice(&their_id.to_be_bytes());
        msg.extend_from_slice(&local_id.to_be_bytes());
        let last_seq;
        {
            let mut s = store.borrow_mut();
            msg.extend_from_slice(s.buffer());
            last_seq = s.journal().expect("mapped store journals").seq();
            s.journal_mut().expect("mapped store journals").bump();
        }
        let ch = &mut self.channels[channel.0];
        ch.pairs.push(Pair {
            store: store_idx,
            state: SyncState::Synced,
            local_id,
            remote_id: Some(their_id),
            last_seq,
        });
        ch.stack.encode(&msg);
        debug!(hash, their_id, local_id, "welcomed peer");
    }

    fn on_welcome(&mut self, channel: ChannelId, body: &[u8]) {
        if body.len() < 4 {
            return;
        }
        let echoed = u16::from_be_bytes(body[..2].try_into().unwrap());
        let their_id = u16::from_be_bytes(body[2..4].try_into().unwrap());
        let buffer = &body[4..];
        let ch = &mut self.channels[channel.0];
        let Some(pair) = ch
            .pairs
            .iter_mut()
            .find(|p| p.local_id == echoed && p.state == SyncState::HelloSent)
        else {
            debug!(echoed, "welcome without matching hello");
            return;
        };
        let store = self.stores[pair.store].clone();
        {
            let mut s = store.borrow_mut();
            if buffer.len() != s.buffer_len() {
                warn!(
                    got = buffer.len(),
                    want = s.buffer_len(),
                    "welcome buffer size mismatch"
                );
                return;
            }
            // Cell-wise application: hooks fire for cells that actually
            // differ from the authoritative copy.
            let cells: Vec<_> = s
                .cells()
                .iter()
                .filter(|(_, v)| !v.is_function())
                .map(|(_, v)| *v)
                .collect();
            for v in cells {
                let offset = v.offset().expect("data cell");
                let incoming = &buffer[offset..offset + v.len()];
                if s.peek(&v) != Some(incoming) {
                    let incoming = incoming.to_vec();
                    let _ = s.set(&v, &incoming);
                }
            }
            pair.last_seq = s.journal().expect("mapped store journals").seq();
            s.journal_mut().expect("mapped store journals").bump();
        }
        pair.remote_id = Some(their_id);
        pair.state = SyncState::Synced;
        debug!(echoed, their_id, "synced from welcome");
    }

    fn on_update(&mut self, channel: ChannelId, body: &[u8]) {
        if body.len() < 2 {
            return;
        }
        let id = u16::from_be_bytes(body[..2].try_into().unwrap());
        let ch = &mut self.channels[channel.0];
        let Some(pair) = ch
            .pairs
            .iter_mut()
            .find(|p| p.local_id == id && p.state == SyncState::Synced)
        else {
            debug!(id, "update for unknown pairing");
            return;
        };
        let store = self.stores[pair.store].clone();
        let mut s = store.borrow_mut();
        let mut rest = &body[2..];
        while rest.len() >= 6 {
            let key = u32::from_be_bytes(rest[..4].try_into().unwrap()) as usize;
            let len = u16::from_be_bytes(rest[4..6].try_into().unwrap()) as usize;
            rest = &rest[6..];
            if rest.len() < len {
                debug!(key, len, "truncated update record");
                break;
            }
            let (bytes, tail) = rest.split_at(len);
            if s.set_by_key(key, bytes).is_err() {
                debug!(key, "update for unknown cell");
            }
            rest = tail;
        }
        // Attribute the applied records to this channel so they are not
        // echoed back to their origin.
        pair.last_seq = s.journal().expect("mapped store journals").seq();
        s.journal_mut().expect("mapped store journals").bump();
    }

    fn on_bye(&mut self, channel: ChannelId, body: &[u8]) {
        if body.len() < 2 {
            return;
        }
        let id = u16::from_be_bytes(body[..2].try_into().unwrap());
        let ch = &mut self.channels[channel.0];
        if let Some(pos) = ch.pairs.iter().position(|p| p.local_id == id) {
            ch.pairs.remove(pos);
            debug!(id, "peer said bye");
        }
    }

    fn store_index(&self, store: &StoreRef) -> Option<usize> {
        self.stores
            .iter()
            .position(|s| std::rc::Rc::ptr_eq(s, store))
    }

    fn alloc_id(&mut self) -> u16 {
        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1);
        id
    }
}
