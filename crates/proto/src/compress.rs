//! CompressLayer: streaming compression for bandwidth-limited channels.
//!
//! One deflate stream per message: encode chunks feed the compressor and
//! `last` finishes and emits the stream; decode inflates incrementally
//! and passes the original bytes up once the stream end is seen. The
//! coders reset between messages so a lost frame cannot poison the next
//! one. This is a byte stream with no length bound of its own, so the
//! advertised MTU is 0; put a SegmentationLayer above it when the channel
//! needs bounded frames.

use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress, Status};
use tracing::debug;

use crate::layer::{Io, Layer};

pub struct CompressLayer {
    enc: Compress,
    dec: Decompress,
    enc_out: Vec<u8>,
    dec_out: Vec<u8>,
}

impl CompressLayer {
    pub fn new() -> CompressLayer {
        CompressLayer::with_level(Compression::default())
    }

    pub fn with_level(level: Compression) -> CompressLayer {
        CompressLayer {
            enc: Compress::new(level, false),
            dec: Decompress::new(false),
            enc_out: Vec::new(),
            dec_out: Vec::new(),
        }
    }

    /// True when no partial message sits in either coder.
    pub fn idle(&self) -> bool {
        self.enc_out.is_empty() && self.dec_out.is_empty()
    }
}

impl Default for CompressLayer {
    fn default() -> Self {
        CompressLayer::new()
    }
}

impl Layer for CompressLayer {
    fn encode(&mut self, chunk: &[u8], last: bool, io: &mut Io) {
        let mut consumed = 0;
        while consumed < chunk.len() {
            self.enc_out.reserve(chunk.len().max(128));
            let before = self.enc.total_in();
            self.enc
                .compress_vec(&chunk[consumed..], &mut self.enc_out, FlushCompress::None)
                .expect("deflate sink");
            consumed += (self.enc.total_in() - before) as usize;
        }
        if last {
            loop {
                self.enc_out.reserve(128);
                let status = self
                    .enc
                    .compress_vec(&[], &mut self.enc_out, FlushCompress::Finish)
                    .expect("deflate finish");
                if matches!(status, Status::StreamEnd) {
                    break;
                }
            }
            io.push_down(std::mem::take(&mut self.enc_out), true);
            self.enc.reset();
        }
    }

    fn decode(&mut self, chunk: &[u8], io: &mut Io) {
        let mut consumed = 0;
        loop {
            self.dec_out.reserve(chunk.len().max(128) * 2);
            let before_in = self.dec.total_in();
            let before_out = self.dec.total_out();
            let status = match self.dec.decompress_vec(
                &chunk[consumed..],
                &mut self.dec_out,
                FlushDecompress::None,
            ) {
                Ok(s) => s,
                Err(e) => {
                    debug!(error = %e, "dropping undecodable frame");
                    self.dec_out.clear();
                    self.dec.reset(false);
                    return;
                }
            };
            consumed += (self.dec.total_in() - before_in) as usize;
            let produced = (self.dec.total_out() - before_out) as usize;
            match status {
                Status::StreamEnd => {
                    io.push_up(std::mem::take(&mut self.dec_out));
                    self.dec.reset(false);
                    return;
                }
                _ if consumed >= chunk.len() && produced == 0 => return,
                _ => {}
            }
        }
    }

    fn mtu(&self, _below: usize) -> usize {
        0
    }
}
