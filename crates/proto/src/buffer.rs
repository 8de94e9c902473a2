//! BufferLayer: coalesces a chunked encode into one downward chunk.

use crate::layer::{Io, Layer};

/// Accumulates encode chunks until `last`, then emits the whole message
/// at once. Decode passes through. Useful above transports that map one
/// `encode` to one datagram.
#[derive(Debug, Default)]
pub struct BufferLayer {
    buf: Vec<u8>,
}

impl BufferLayer {
    pub fn new() -> BufferLayer {
        BufferLayer::default()
    }
}

impl Layer for BufferLayer {
    fn encode(&mut self, chunk: &[u8], last: bool, io: &mut Io) {
        self.buf.extend_from_slice(chunk);
        if last {
            io.push_down(std::mem::take(&mut self.buf), true);
        }
    }

    fn decode(&mut self, chunk: &[u8], io: &mut Io) {
        io.push_up(chunk.to_vec());
    }

    fn flush(&mut self, io: &mut Io) {
        if !self.buf.is_empty() {
            io.push_down(std::mem::take(&mut self.buf), true);
        }
    }
}
