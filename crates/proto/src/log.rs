//! LogLayer: frame tracing for protocol debugging.
//!
//! A passthrough layer that emits every frame through the `tracing`
//! facade in printable-escaped form. Wrap any point of a stack with it to
//! watch the conversation; it changes nothing on the wire.

use cellar_core::util::printable;
use tracing::trace;

use crate::layer::{Io, Layer};

#[derive(Debug)]
pub struct LogLayer {
    name: &'static str,
}

impl LogLayer {
    pub fn new(name: &'static str) -> LogLayer {
        LogLayer { name }
    }
}

impl Layer for LogLayer {
    fn encode(&mut self, chunk: &[u8], last: bool, io: &mut Io) {
        trace!(layer = self.name, last, frame = %printable(chunk), "encode");
        io.push_down(chunk.to_vec(), last);
    }

    fn decode(&mut self, chunk: &[u8], io: &mut Io) {
        trace!(layer = self.name, frame = %printable(chunk), "decode");
        io.push_up(chunk.to_vec());
    }
}
