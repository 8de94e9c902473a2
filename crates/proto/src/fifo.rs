//! Lock-free SPSC message FIFOs and the bidirectional loopback.
//!
//! [`Fifo`] is a single-producer/single-consumer byte ring with a
//! compile-time capacity. Each push records a length prefix, so the ring
//! is message-framed: `recv` pops exactly one message. Indices are
//! monotonic counters reduced modulo `N` on access; the consumer's index
//! is read with acquire ordering by the producer and vice versa, and each
//! side publishes its own index with release ordering. No allocation
//! happens after construction (consumers that want a borrowed view reuse
//! a scratch buffer via [`Fifo::recv_into`]).
//!
//! Two rings compose into a [`FifoLoopback`], the thread-safe
//! message-passing channel between two protocol stacks. When a ring is
//! full, the producer-side overflow handler decides between retrying
//! (`true`) and dropping the message (`false`).

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use tracing::debug;

use crate::layer::Stack;

/// Decides what a full ring does: `true` retries the push, `false` drops
/// the message.
pub type OverflowHandler = Box<dyn FnMut() -> bool + Send>;

const LEN_PREFIX: usize = 4;

/// Single-producer/single-consumer byte ring with message framing.
///
/// # Safety contract
///
/// At most one thread pushes and at most one thread pops at any time.
/// The two may be different threads; the ring synchronises between them.
pub struct Fifo<const N: usize> {
    buf: UnsafeCell<[u8; N]>,
    /// Consumer position, monotonic.
    head: AtomicUsize,
    /// Producer position, monotonic.
    tail: AtomicUsize,
    overflow: Mutex<Option<OverflowHandler>>,
}

// The producer/consumer discipline above makes concurrent access sound;
// all index handoffs are acquire/release pairs.
unsafe impl<const N: usize> Sync for Fifo<N> {}

impl<const N: usize> Default for Fifo<N> {
    fn default() -> Self {
        Fifo::new()
    }
}

impl<const N: usize> Fifo<N> {
    pub fn new() -> Fifo<N> {
        Fifo {
            buf: UnsafeCell::new([0; N]),
            head: AtomicUsize::new(0),
            tail: AtomicUsize::new(0),
            overflow: Mutex::new(None),
        }
    }

    pub const fn capacity(&self) -> usize {
        N
    }

    /// Free bytes, as seen by the producer. A message of `len` bytes
    /// needs `len + 4` free.
    pub fn space(&self) -> usize {
        let head = self.head.load(Ordering::Acquire);
        let tail = self.tail.load(Ordering::Relaxed);
        N - tail.wrapping_sub(head)
    }

    pub fn full(&self) -> bool {
        self.space() < LEN_PREFIX + 1
    }

    pub fn is_empty(&self) -> bool {
        let head = self.head.load(Ordering::Relaxed);
        let tail = self.tail.load(Ordering::Acquire);
        head == tail
    }

    /// Installs the producer-side overflow handler.
    pub fn set_overflow_handler(&self, f: OverflowHandler) {
        *self.overflow.lock().expect("overflow handler lock") = Some(f);
    }

    /// Pushes one message. Returns the number of bytes accepted: `len` on
    /// success, 0 when the ring stayed full and the handler gave up.
    pub fn push(&self, msg: &[u8]) -> usize {
        let needed = msg.len() + LEN_PREFIX;
        assert!(needed <= N, "message larger than the ring");
        loop {
            if self.space() >= needed {
                break;
            }
            let mut handler = self
                .overflow
                .lock()
                .expect("overflow handler lock")
                .take();
            let retry = match handler.as_mut() {
                Some(f) => f(),
                None => false,
            };
            if let Some(f) = handler {
                *self.overflow.lock().expect("overflow handler lock") = Some(f);
            }
            if !retry {
                debug!(len = msg.len(), "fifo full; dropping message");
                return 0;
            }
        }

        let tail = self.tail.load(Ordering::Relaxed);
        self.write_bytes(tail, &(msg.len() as u32).to_le_bytes());
        self.write_bytes(tail + LEN_PREFIX, msg);
        self.tail.store(tail + needed, Ordering::Release);
        msg.len()
    }

    /// Pops one message into `out` (cleared first). Returns false when
    /// the ring is empty.
    pub fn recv_into(&self, out: &mut Vec<u8>) -> bool {
        out.clear();
        let head = self.head.load(Ordering::Relaxed);
        let tail = self.tail.load(Ordering::Acquire);
        if head == tail {
            return false;
        }
        let mut len_bytes = [0u8; LEN_PREFIX];
        self.read_bytes(head, &mut len_bytes);
        let len = u32::from_le_bytes(len_bytes) as usize;
        out.resize(len, 0);
        self.read_bytes(head + LEN_PREFIX, out);
        self.head.store(head + LEN_PREFIX + len, Ordering::Release);
        true
    }

    /// Pops at most one message and feeds it to the stack's decode side.
    pub fn recv(&self, stack: &mut Stack) -> bool {
        let mut msg = Vec::new();
        if !self.recv_into(&mut msg) {
            return false;
        }
        stack.decode(&msg);
        true
    }

    /// Drains every pending message into the stack. Returns the count.
    pub fn recv_all(&self, stack: &mut Stack) -> usize {
        let mut n = 0;
        while self.recv(stack) {
            n += 1;
        }
        n
    }

    fn write_bytes(&self, pos: usize, src: &[u8]) {
        let buf = self.buf.get() as *mut u8;
        for (i, &b) in src.iter().enumerate() {
            unsafe {
                *buf.add((pos + i) % N) = b;
            }
        }
    }

    fn read_bytes(&self, pos: usize, dst: &mut [u8]) {
        let buf = self.buf.get() as *const u8;
        for (i, b) in dst.iter_mut().enumerate() {
            unsafe {
                *b = *buf.add((pos + i) % N);
            }
        }
    }
}

/// Two rings forming a bidirectional channel between endpoints `a` and
/// `b`. Each endpoint is used by one thread.
pub struct FifoLoopback<const N: usize> {
    a2b: Fifo<N>,
    b2a: Fifo<N>,
}

impl<const N: usize> Default for FifoLoopback<N> {
    fn default() -> Self {
        FifoLoopback::new()
    }
}

impl<const N: usize> FifoLoopback<N> {
    pub fn new() -> FifoLoopback<N> {
        FifoLoopback {
            a2b: Fifo::new(),
            b2a: Fifo::new(),
        }
    }

    pub fn a2b(&self) -> &Fifo<N> {
        &self.a2b
    }

    pub fn b2a(&self) -> &Fifo<N> {
        &self.b2a
    }

    /// The `a`-side endpoint: sends into `a2b`, receives from `b2a`.
    pub fn a(&self) -> LoopbackEnd<'_, N> {
        LoopbackEnd {
            tx: &self.a2b,
            rx: &self.b2a,
        }
    }

    /// The `b`-side endpoint.
    pub fn b(&self) -> LoopbackEnd<'_, N> {
        LoopbackEnd {
            tx: &self.b2a,
            rx: &self.a2b,
        }
    }
}

/// One side of a [`FifoLoopback`].
#[derive(Clone, Copy)]
pub struct LoopbackEnd<'f, const N: usize> {
    tx: &'f Fifo<N>,
    rx: &'f Fifo<N>,
}

impl<'f, const N: usize> LoopbackEnd<'f, N> {
    pub fn send(&self, msg: &[u8]) -> usize {
        self.tx.push(msg)
    }

    /// Free bytes in the send direction.
    pub fn space(&self) -> usize {
        self.tx.space()
    }

    pub fn full(&self) -> bool {
        self.tx.full()
    }

    pub fn recv(&self, stack: &mut Stack) -> bool {
        self.rx.recv(stack)
    }

    pub fn recv_all(&self, stack: &mut Stack) -> usize {
        self.rx.recv_all(stack)
    }

    pub fn recv_into(&self, out: &mut Vec<u8>) -> bool {
        self.rx.recv_into(out)
    }

    /// Moves everything the stack wants transmitted into the ring.
    pub fn pump(&self, stack: &mut Stack) -> usize {
        let mut n = 0;
        while let Some(frame) = stack.poll_transmit() {
            n += self.send(&frame);
        }
        n
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    #[test]
    fn test_push_pop() {
        let f: Fifo<64> = Fifo::new();
        assert!(f.is_empty());
        assert_eq!(f.push(b"hello"), 5);
        assert_eq!(f.push(b"world!"), 6);
        let mut out = Vec::new();
        assert!(f.recv_into(&mut out));
        assert_eq!(out, b"hello");
        assert!(f.recv_into(&mut out));
        assert_eq!(out, b"world!");
        assert!(!f.recv_into(&mut out));
    }

    #[test]
    fn test_wraparound() {
        let f: Fifo<32> = Fifo::new();
        let mut out = Vec::new();
        for round in 0..50u8 {
            let msg = [round, round, round];
            assert_eq!(f.push(&msg), 3);
            assert!(f.recv_into(&mut out));
            assert_eq!(out, msg);
        }
    }

    #[test]
    fn test_overflow_drops_without_handler() {
        let f: Fifo<16> = Fifo::new();
        assert_eq!(f.push(b"12345678"), 8);
        assert_eq!(f.push(b"12345678"), 0);
    }

    #[test]
    fn test_overflow_handler_gives_up() {
        let f: Fifo<16> = Fifo::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        f.set_overflow_handler(Box::new(move || {
            c.fetch_add(1, Ordering::SeqCst);
            false
        }));
        assert_eq!(f.push(b"12345678"), 8);
        assert_eq!(f.push(b"x"), 0);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_space_accounting() {
        let f: Fifo<32> = Fifo::new();
        assert_eq!(f.space(), 32);
        f.push(b"abcd");
        assert_eq!(f.space(), 32 - 8);
        let mut out = Vec::new();
        f.recv_into(&mut out);
        assert_eq!(f.space(), 32);
    }

    #[test]
    fn test_spsc_across_threads() {
        let f: Arc<Fifo<256>> = Arc::new(Fifo::new());
        let producer = {
            let f = f.clone();
            std::thread::spawn(move || {
                for i in 0..1000u32 {
                    let msg = i.to_le_bytes();
                    while f.push(&msg) == 0 {
                        std::thread::yield_now();
                    }
                }
            })
        };
        let mut out = Vec::new();
        let mut expected = 0u32;
        while expected < 1000 {
            if f.recv_into(&mut out) {
                assert_eq!(u32::from_le_bytes(out[..4].try_into().unwrap()), expected);
                expected += 1;
            } else {
                std::thread::yield_now();
            }
        }
        producer.join().unwrap();
    }

    #[test]
    fn test_loopback_directions() {
        let loop_: FifoLoopback<64> = FifoLoopback::new();
        loop_.a().send(b"to b");
        loop_.b().send(b"to a");
        let mut out = Vec::new();
        assert!(loop_.b().recv_into(&mut out));
        assert_eq!(out, b"to b");
        assert!(loop_.a().recv_into(&mut out));
        assert_eq!(out, b"to a");
    }

    #[test]
    fn test_loopback_with_stacks() {
        let loop_: FifoLoopback<128> = FifoLoopback::new();
        let mut a = Stack::new().with(crate::Crc16Layer::new());
        let mut b = Stack::new().with(crate::Crc16Layer::new());
        a.encode(b"ping");
        loop_.a().pump(&mut a);
        assert_eq!(loop_.b().recv_all(&mut b), 1);
        assert_eq!(b.poll_receive().as_deref(), Some(&b"ping"[..]));
    }
}
