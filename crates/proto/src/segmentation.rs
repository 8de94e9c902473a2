//! SegmentationLayer: fits messages into a bounded MTU.
//!
//! Outbound messages are cut into segments of at most `segment_size`
//! bytes, each ending in `'C'` (continue) or `'E'` (end of message); the
//! decode side reassembles until it sees `'E'`. Each segment is a
//! complete frame for the layers below. Upward the layer advertises an
//! unbounded MTU.

use tracing::debug;

use crate::layer::{Io, Layer};

const CONTINUE: u8 = b'C';
const END: u8 = b'E';

#[derive(Debug)]
pub struct SegmentationLayer {
    /// Maximum bytes per downward segment, marker included. 0 disables
    /// splitting. Pick this from the MTU of the layers below.
    segment_size: usize,
    pending: Vec<u8>,
    reassembly: Vec<u8>,
}

impl SegmentationLayer {
    pub fn new(segment_size: usize) -> SegmentationLayer {
        assert!(
            segment_size == 0 || segment_size >= 2,
            "a segment needs room for payload and marker"
        );
        SegmentationLayer {
            segment_size,
            pending: Vec::new(),
            reassembly: Vec::new(),
        }
    }

    fn payload_per_segment(&self) -> usize {
        self.segment_size - 1
    }
}

impl Layer for SegmentationLayer {
    fn encode(&mut self, chunk: &[u8], last: bool, io: &mut Io) {
        if self.segment_size == 0 {
            // Unbounded below; a single end-marked segment per message.
            self.pending.extend_from_slice(chunk);
            if last {
                let mut seg = std::mem::take(&mut self.pending);
                seg.push(END);
                io.push_down(seg, true);
            }
            return;
        }

        self.pending.extend_from_slice(chunk);
        while self.pending.len() > self.payload_per_segment() {
            let rest = self.pending.split_off(self.payload_per_segment());
            let mut seg = std::mem::replace(&mut self.pending, rest);
            seg.push(CONTINUE);
            io.push_down(seg, true);
        }
        if last {
            let mut seg = std::mem::take(&mut self.pending);
            seg.push(END);
            io.push_down(seg, true);
        }
    }

    fn decode(&mut self, chunk: &[u8], io: &mut Io) {
        let Some((&marker, payload)) = chunk.split_last() else {
            return;
        };
        match marker {
            CONTINUE => self.reassembly.extend_from_slice(payload),
            END => {
                self.reassembly.extend_from_slice(payload);
                io.push_up(std::mem::take(&mut self.reassembly));
            }
            _ => {
                debug!(len = chunk.len(), marker, "dropping unmarked segment");
                self.reassembly.clear();
            }
        }
    }

    fn mtu(&self, _below: usize) -> usize {
        0
    }
}
