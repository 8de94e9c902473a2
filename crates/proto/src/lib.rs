//! cellar-proto: the embedded-debugger protocol stack
//!
//! A composable duplex chain of protocol layers - framing, escaping,
//! segmentation, CRC, reliable ARQ, terminal out-of-band, optional
//! streaming compression - plus the lock-free FIFO loopback used for
//! cross-thread message passing.
//!
//! Layers are composed into a [`layer::Stack`], application side first:
//!
//! ```
//! use cellar_proto::layer::Stack;
//! use cellar_proto::{ArqConfig, ArqLayer, AsciiEscapeLayer, Crc16Layer, SegmentationLayer, TerminalLayer};
//!
//! let stack = Stack::new()
//!     .with(SegmentationLayer::new(16))
//!     .with(ArqLayer::new(ArqConfig::default()))
//!     .with(Crc16Layer::new())
//!     .with(AsciiEscapeLayer::new())
//!     .with(TerminalLayer::new());
//! # let _ = stack;
//! ```
//!
//! Nothing in this crate blocks or keeps time; retransmission is driven
//! by external [`layer::Stack::tick`] calls.

pub mod arq;
pub mod buffer;
#[cfg(feature = "compression")]
pub mod compress;
pub mod crc16;
pub mod escape;
pub mod fifo;
pub mod layer;
pub mod log;
pub mod segmentation;
pub mod terminal;


pub use arq::{ArqConfig, ArqLayer};
pub use buffer::BufferLayer;
#[cfg(feature = "compression")]
pub use compress::CompressLayer;
pub use crc16::{crc16, Crc16Layer};
pub use escape::AsciiEscapeLayer;
pub use fifo::{Fifo, FifoLoopback, LoopbackEnd, OverflowHandler};
pub use layer::{Io, Layer, Stack};
pub use log::LogLayer;
pub use segmentation::SegmentationLayer;
pub use terminal::TerminalLayer;
