//! ArqLayer: reliable, in-order delivery over a lossy frame channel.
//!
//! Stop-and-wait with 6-bit sequence numbers. Every frame starts with one
//! header byte:
//!
//! - `0x40 | seq` - control: acknowledges `seq`.
//! - `0x00..=0x3e` - data frame carrying that sequence number.
//! - `0x3f` - reset announcement; the 1-byte body is the sender's next
//!   data sequence. Sent as the first frame of a (re)connection.
//!
//! The sender keeps one frame in flight and retransmits it every
//! `retransmit_ticks` ticks until acknowledged; later messages queue
//! behind it. The receiver acknowledges every data frame, delivers the
//! expected sequence, and drops duplicates. Exhausting `max_retries`
//! closes the channel; the layer sits below nothing that could recover
//! that.
//!
//! Ticks come from outside (the layer never sleeps): one tick means one
//! retransmission interval elapsed.

use std::collections::VecDeque;

use tracing::{debug, warn};

use crate::layer::{Io, Layer};

const ACK_FLAG: u8 = 0x40;
const SEQ_MASK: u8 = 0x3f;
const RESET_SEQ: u8 = 0x3f;
/// Data sequence numbers run 0..=62; 0x3f is the reset marker.
const SEQ_MOD: u8 = 63;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArqConfig {
    /// Ticks of silence before a retransmission.
    pub retransmit_ticks: u32,
    /// Retransmissions before the channel is declared dead.
    pub max_retries: u32,
    /// Arbitrary first sequence number, announced via the reset frame.
    pub initial_seq: u8,
}

impl Default for ArqConfig {
    fn default() -> Self {
        ArqConfig {
            retransmit_ticks: 1,
            max_retries: 16,
            initial_seq: 0,
        }
    }
}

#[derive(Debug)]
struct Outstanding {
    frame: Vec<u8>,
    ticks: u32,
    retries: u32,
}

#[derive(Debug)]
pub struct ArqLayer {
    config: ArqConfig,
    encode_buf: Vec<u8>,
    next_seq: u8,
    sent_reset: bool,
    outstanding: Option<Outstanding>,
    ready: VecDeque<Vec<u8>>,
    recv_expected: Option<u8>,
    closed: bool,
}

impl ArqLayer {
    pub fn new(config: ArqConfig) -> ArqLayer {
        ArqLayer {
            next_seq: config.initial_seq % SEQ_MOD,
            config,
            encode_buf: Vec::new(),
            sent_reset: false,
            outstanding: None,
            ready: VecDeque::new(),
            recv_expected: None,
            closed: false,
        }
    }

    fn submit(&mut self, payload: Vec<u8>, io: &mut Io) {
        if !self.sent_reset {
            self.ready.push_back(vec![RESET_SEQ, self.next_seq]);
            self.sent_reset = true;
        }
        let mut frame = Vec::with_capacity(payload.len() + 1);
        frame.push(self.next_seq);
        frame.extend_from_slice(&payload);
        self.next_seq = (self.next_seq + 1) % SEQ_MOD;
        self.ready.push_back(frame);
        self.pump_send(io);
    }

    fn pump_send(&mut self, io: &mut Io) {
        if self.closed || self.outstanding.is_some() {
            return;
        }
        if let Some(frame) = self.ready.pop_front() {
            io.push_down(frame.clone(), true);
            self.outstanding = Some(Outstanding {
                frame,
                ticks: 0,
                retries: 0,
            });
        }
    }

    fn ack(&self, seq: u8, io: &mut Io) {
        io.push_down(vec![ACK_FLAG | seq], true);
    }
}

impl Layer for ArqLayer {
    fn encode(&mut self, chunk: &[u8], last: bool, io: &mut Io) {
        self.encode_buf.extend_from_slice(chunk);
        if last {
            let payload = std::mem::take(&mut self.encode_buf);
            self.submit(payload, io);
        }
    }

    fn decode(&mut self, frame: &[u8], io: &mut Io) {
        let Some(&hdr) = frame.first() else {
            return;
        };
        if hdr & ACK_FLAG != 0 {
            let acked = hdr & SEQ_MASK;
            let waiting = self
                .outstanding
                .as_ref()
                .map(|o| o.frame[0] & SEQ_MASK);
            if waiting == Some(acked) {
                self.outstanding = None;
                self.pump_send(io);
            }
            return;
        }

        let seq = hdr & SEQ_MASK;
        if seq == RESET_SEQ {
            if let Some(&initial) = frame.get(1) {
                self.recv_expected = Some(initial % SEQ_MOD);
            }
            self.ack(RESET_SEQ, io);
            return;
        }

        // Duplicates are acknowledged too: the original ACK may be the
        // thing that got lost.
        self.ack(seq, io);
        match self.recv_expected {
            Some(expected) if seq != expected => {
                debug!(seq, expected, "dropping out-of-sequence frame");
            }
            _ => {
                self.recv_expected = Some((seq + 1) % SEQ_MOD);
                io.push_up(frame[1..].to_vec());
            }
        }
    }

    fn tick(&mut self, io: &mut Io) {
        if self.closed {
            return;
        }
        let Some(o) = self.outstanding.as_mut() else {
            return;
        };
        o.ticks += 1;
        if o.ticks < self.config.retransmit_ticks {
            return;
        }
        if o.retries >= self.config.max_retries {
            warn!(
                seq = o.frame[0] & SEQ_MASK,
                retries = o.retries,
                "retransmission exhausted; closing channel"
            );
            self.outstanding = None;
            self.ready.clear();
            self.closed = true;
            io.close_channel();
            return;
        }
        o.retries += 1;
        o.ticks = 0;
        io.push_down(o.frame.clone(), true);
    }

    fn mtu(&self, below: usize) -> usize {
        if below == 0 {
            0
        } else {
            below.saturating_sub(1)
        }
    }
}
