//! Protocol layers and the stack driver
//!
//! A [`Layer`] sits in a duplex chain between the application (up) and the
//! transport (down). `encode` moves chunks toward the transport, with
//! `last` marking the end of a logical message; `decode` moves bytes
//! toward the application. Layers never block and never talk to their
//! neighbours directly: they emit into an [`Io`], and the [`Stack`] driver
//! shuttles those emissions to the adjacent layer. This keeps the
//! composition free of up/down reference cycles while preserving the
//! chain semantics, including a decode-side layer emitting downward (an
//! ARQ acknowledgement passes through the encode path of everything below
//! it).
//!
//! The application-facing surface is poll-based: [`Stack::encode`] and
//! [`Stack::decode`] ingest, [`Stack::poll_transmit`],
//! [`Stack::poll_receive`] and [`Stack::poll_other`] drain, and
//! [`Stack::tick`] drives the retransmission timer. Nothing here keeps
//! wall-clock time; a tick means "one retransmit interval elapsed".

use std::collections::VecDeque;

/// Emission buffers handed to a layer while it processes one chunk.
#[derive(Debug, Default)]
pub struct Io {
    down: VecDeque<(Vec<u8>, bool)>,
    up: VecDeque<Vec<u8>>,
    other: VecDeque<Vec<u8>>,
    closed: bool,
}

impl Io {
    /// Emits a chunk toward the transport; `last` terminates the message.
    pub fn push_down(&mut self, bytes: Vec<u8>, last: bool) {
        self.down.push_back((bytes, last));
    }

    /// Emits a complete frame toward the application.
    pub fn push_up(&mut self, frame: Vec<u8>) {
        self.up.push_back(frame);
    }

    /// Emits bytes that are not part of the framed conversation (the
    /// terminal layer's non-debug passthrough).
    pub fn push_other(&mut self, bytes: Vec<u8>) {
        self.other.push_back(bytes);
    }

    /// Reports a fatal channel error; the stack stays closed afterwards.
    pub fn close_channel(&mut self) {
        self.closed = true;
    }

    fn is_empty(&self) -> bool {
        self.down.is_empty() && self.up.is_empty() && self.other.is_empty()
    }
}

/// One node in the duplex chain.
pub trait Layer {
    /// Processes a chunk moving toward the transport.
    fn encode(&mut self, chunk: &[u8], last: bool, io: &mut Io);

    /// Processes bytes moving toward the application.
    fn decode(&mut self, chunk: &[u8], io: &mut Io);

    /// Maximum chunk this layer accepts per `encode`, given what the
    /// layer below accepts. 0 means unbounded.
    fn mtu(&self, below: usize) -> usize {
        below
    }

    /// One retransmit interval elapsed.
    fn tick(&mut self, _io: &mut Io) {}

    /// Pushes out anything buffered mid-message.
    fn flush(&mut self, _io: &mut Io) {}
}

enum Work {
    /// `layer == stack.layers.len()` addresses the wire sink.
    Encode {
        layer: usize,
        bytes: Vec<u8>,
        last: bool,
    },
    Decode {
        layer: usize,
        bytes: Vec<u8>,
    },
}

/// An owned composition of layers, application side first.
///
/// ```
/// use cellar_proto::layer::Stack;
/// use cellar_proto::{Crc16Layer, SegmentationLayer};
///
/// let mut stack = Stack::new()
///     .with(SegmentationLayer::new(24))
///     .with(Crc16Layer::new());
/// stack.encode(b"hello");
/// while let Some(wire) = stack.poll_transmit() {
///     // hand `wire` to the transport
///     let _ = wire;
/// }
/// ```
#[derive(Default)]
pub struct Stack {
    layers: Vec<Box<dyn Layer>>,
    rx: VecDeque<Vec<u8>>,
    tx: VecDeque<Vec<u8>>,
    other: VecDeque<Vec<u8>>,
    wire_buf: Vec<u8>,
    wire_mtu: usize,
    closed: bool,
}

impl Stack {
    pub fn new() -> Stack {
        Stack::default()
    }

    /// Appends a layer on the transport side of the chain. The first
    /// `with` is closest to the application.
    pub fn with(mut self, layer: impl Layer + 'static) -> Stack {
        self.layers.push(Box::new(layer));
        self
    }

    /// Declares the transport's own MTU, the seed of the [`Stack::mtu`]
    /// fold. 0 (the default) means unbounded.
    pub fn with_wire_mtu(mut self, mtu: usize) -> Stack {
        self.wire_mtu = mtu;
        self
    }

    /// The MTU visible to the application: each layer transforms the MTU
    /// of the layer below it, bottom up.
    pub fn mtu(&self) -> usize {
        let mut m = self.wire_mtu;
        for l in self.layers.iter().rev() {
            m = l.mtu(m);
        }
        m
    }

    /// True after a layer reported a fatal channel error (e.g. ARQ ran
    /// out of retries).
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Feeds one complete application frame down the chain.
    pub fn encode(&mut self, frame: &[u8]) {
        self.run(Work::Encode {
            layer: 0,
            bytes: frame.to_vec(),
            last: true,
        });
    }

    /// Feeds transport bytes up the chain.
    pub fn decode(&mut self, raw: &[u8]) {
        if self.layers.is_empty() {
            if !raw.is_empty() {
                self.rx.push_back(raw.to_vec());
            }
            return;
        }
        self.run(Work::Decode {
            layer: self.layers.len() - 1,
            bytes: raw.to_vec(),
        });
    }

    /// Next wire datagram to hand to the transport.
    pub fn poll_transmit(&mut self) -> Option<Vec<u8>> {
        self.tx.pop_front()
    }

    /// Next complete frame for the application.
    pub fn poll_receive(&mut self) -> Option<Vec<u8>> {
        self.rx.pop_front()
    }

    /// Next run of non-debug bytes extracted by a terminal layer.
    pub fn poll_other(&mut self) -> Option<Vec<u8>> {
        self.other.pop_front()
    }

    /// Advances the retransmission timer of every layer by one interval.
    pub fn tick(&mut self) {
        let mut queue = VecDeque::new();
        let mut io = Io::default();
        for i in 0..self.layers.len() {
            self.layers[i].tick(&mut io);
            self.route(i, &mut io, &mut queue);
        }
        self.pump(queue);
    }

    /// Flushes buffered partial messages out of every layer, top down.
    pub fn flush(&mut self) {
        let mut queue = VecDeque::new();
        let mut io = Io::default();
        for i in 0..self.layers.len() {
            self.layers[i].flush(&mut io);
            self.route(i, &mut io, &mut queue);
        }
        self.pump(queue);
    }

    fn run(&mut self, work: Work) {
        let mut queue = VecDeque::new();
        queue.push_back(work);
        self.pump(queue);
    }

    fn pump(&mut self, mut queue: VecDeque<Work>) {
        let mut io = Io::default();
        while let Some(work) = queue.pop_front() {
            match work {
                Work::Encode { layer, bytes, last } => {
                    if layer == self.layers.len() {
                        self.wire_buf.extend_from_slice(&bytes);
                        if last {
                            self.tx.push_back(std::mem::take(&mut self.wire_buf));
                        }
                        continue;
                    }
                    self.layers[layer].encode(&bytes, last, &mut io);
                    self.route(layer, &mut io, &mut queue);
                }
                Work::Decode { layer, bytes } => {
                    self.layers[layer].decode(&bytes, &mut io);
                    self.route(layer, &mut io, &mut queue);
                }
            }
            debug_assert!(io.is_empty());
        }
    }

    /// Moves a layer's emissions into the work queue: down-chunks enter
    /// the next layer's encode path, up-frames the previous layer's
    /// decode path (or the receive queue at the top).
    fn route(&mut self, layer: usize, io: &mut Io, queue: &mut VecDeque<Work>) {
        while let Some((bytes, last)) = io.down.pop_front() {
            queue.push_back(Work::Encode {
                layer: layer + 1,
                bytes,
                last,
            });
        }
        while let Some(frame) = io.up.pop_front() {
            if layer == 0 {
                self.rx.push_back(frame);
            } else {
                queue.push_back(Work::Decode {
                    layer: layer - 1,
                    bytes: frame,
                });
            }
        }
        while let Some(bytes) = io.other.pop_front() {
            self.other.push_back(bytes);
        }
        if io.closed {
            self.closed = true;
            io.closed = false;
        }
    }
}
