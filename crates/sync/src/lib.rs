//! cellar-sync: multi-node store synchronizer
//!
//! Keeps instances of the same store schema equal across nodes (or
//! threads) connected by any [`cellar_proto`] channel. Writes are
//! captured through the store journal, coalesced into compact update
//! messages, and applied on the far side without echoing back to their
//! origin, so arbitrary topologies converge.

pub mod synchronizer;


pub use synchronizer::{ChannelId, SyncState, Synchronizer};
