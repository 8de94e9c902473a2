//! AsciiEscapeLayer: keeps the wire printable.
//!
//! Bytes in `{0x00..=0x1f, 0x7f}` are replaced on encode by `ESC` (0x1b)
//! followed by the byte XOR 0x40; decode inverts. The worst case doubles
//! the message, so the advertised MTU is half the layer below.

use crate::layer::{Io, Layer};

pub const ESC: u8 = 0x1b;

const fn needs_escape(b: u8) -> bool {
    b <= 0x1f || b == 0x7f
}

#[derive(Debug, Default)]
pub struct AsciiEscapeLayer {
    /// Decode saw an ESC at the end of the previous chunk.
    pending_esc: bool,
}

impl AsciiEscapeLayer {
    pub fn new() -> AsciiEscapeLayer {
        AsciiEscapeLayer::default()
    }
}

impl Layer for AsciiEscapeLayer {
    fn encode(&mut self, chunk: &[u8], last: bool, io: &mut Io) {
        let mut out = Vec::with_capacity(chunk.len() + chunk.len() / 4);
        for &b in chunk {
            if needs_escape(b) {
                out.push(ESC);
                out.push(b ^ 0x40);
            } else {
                out.push(b);
            }
        }
        io.push_down(out, last);
    }

    fn decode(&mut self, chunk: &[u8], io: &mut Io) {
        let mut out = Vec::with_capacity(chunk.len());
        for &b in chunk {
            if self.pending_esc {
                out.push(b ^ 0x40);
                self.pending_esc = false;
            } else if b == ESC {
                self.pending_esc = true;
            } else {
                out.push(b);
            }
        }
        // A trailing lone ESC waits for the next chunk; within a framed
        // stack it never spans frames, so it is dropped with its frame.
        io.push_up(out);
    }

    fn mtu(&self, below: usize) -> usize {
        if below == 0 {
            0
        } else {
            below / 2
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layer::Stack;

    #[test]
    fn test_roundtrip() {
        let msg: Vec<u8> = vec![0x00, b'A', 0x1b, 0x7f, b'z', 0x0a];
        let mut s = Stack::new().with(AsciiEscapeLayer::new());
        s.encode(&msg);
        let wire = s.poll_transmit().unwrap();
        assert!(wire.iter().all(|&b| (0x20..0x7f).contains(&b) || b == ESC));
        // ESC itself is escaped, never appears as payload.
        assert_eq!(wire, vec![ESC, 0x40, b'A', ESC, 0x5b, ESC, 0x3f, b'z', ESC, 0x4a]);

        s.decode(&wire);
        assert_eq!(s.poll_receive().unwrap(), msg);
    }

    #[test]
    fn test_escape_split_across_chunks() {
        let mut s = Stack::new().with(AsciiEscapeLayer::new());
        s.decode(&[b'a', ESC]);
        s.decode(&[0x40, b'b']);
        assert_eq!(s.poll_receive().as_deref(), Some(&b"a"[..]));
        assert_eq!(s.poll_receive().as_deref(), Some(&[0x00, b'b'][..]));
    }

    #[test]
    fn test_mtu_halves() {
        let s = Stack::new().with(AsciiEscapeLayer::new()).with_wire_mtu(16);
        assert_eq!(s.mtu(), 8);
    }
}
