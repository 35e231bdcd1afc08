//! Core identifiers for the engine
//!
//! This module defines the fundamental types used throughout the system:
//! - [`Key`]: Fixed-width record identifier; its first byte selects the shard
//! - [`Tid`]: Epoch-stamped commit id, also the unlocked form of a record's lock word
//! - [`Phase`]: Per-worker execution phase within an epoch
//! - [`SystemType`]: Concurrency strategy the engine runs with

use byteorder::{ByteOrder, LittleEndian};
use serde::{Deserialize, Serialize};

/// Number of store shards. Shard selection is `key[0]`.
pub const SHARD_COUNT: usize = 256;

/// Width of a key in bytes.
pub const KEY_LEN: usize = 16;

/// Fixed-width key
///
/// The first byte selects the shard, so encoders should place a well-mixed
/// byte there. [`Key::from_parts`] uses the little-endian entity id, whose low
/// byte spreads sequential ids over all shards.
///
/// # Examples
///
/// ```
/// use phasekv_core::Key;
///
/// let key = Key::from_parts(1042, 7);
/// assert_eq!(key.parts(), (1042, 7));
/// assert_eq!(key.shard(), (1042 % 256) as usize);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct Key([u8; KEY_LEN]);

impl Key {
    /// Create a key from raw bytes
    pub const fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Key(bytes)
    }

    /// Encode an entity id and a field tag
    ///
    /// Bytes 0..8 hold the id (little-endian), byte 8 holds the tag, the rest
    /// are zero.
    pub fn from_parts(id: u64, tag: u8) -> Self {
        let mut bytes = [0u8; KEY_LEN];
        LittleEndian::write_u64(&mut bytes[0..8], id);
        bytes[8] = tag;
        Key(bytes)
    }

    /// Decode a key built with [`Key::from_parts`]
    pub fn parts(&self) -> (u64, u8) {
        (LittleEndian::read_u64(&self.0[0..8]), self.0[8])
    }

    /// Raw bytes
    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }

    /// Shard index for this key
    #[inline]
    pub fn shard(&self) -> usize {
        self.0[0] as usize
    }
}

impl std::fmt::Display for Key {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (id, tag) = self.parts();
        write!(f, "{}:{}", id, tag)
    }
}

/// Commit id
///
/// Layout (most significant first):
///
/// ```text
/// | 63 | 62 ........ 40 | 39 ........ 16 | 15 .... 8 | 7 ..... 0 |
/// |lock|     epoch      |    sequence    | worker id | shard hint|
/// ```
///
/// Bit 63 is never set in a `Tid`; records use it as their lock bit.
/// An epoch value is a `Tid` whose low 40 bits are zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct Tid(u64);

impl Tid {
    /// Never committed
    pub const ZERO: Tid = Tid(0);

    /// Distance between two consecutive epochs
    pub const EPOCH_INCR: u64 = 1 << 40;

    /// Mask selecting the epoch bits
    pub const EPOCH_MASK: u64 = !(Self::EPOCH_INCR - 1) & !Self::LOCK_BIT;

    /// Reserved for record locks
    pub const LOCK_BIT: u64 = 1 << 63;

    /// Number of bits used by the per-epoch sequence
    pub const SEQ_BITS: u32 = 24;

    /// Wrap raw bits
    pub const fn from_raw(raw: u64) -> Self {
        Tid(raw)
    }

    /// Raw bits
    #[inline]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// The first epoch
    pub const fn first_epoch() -> Self {
        Tid(Self::EPOCH_INCR)
    }

    /// Epoch number `n` as an epoch value
    pub const fn epoch_of(n: u64) -> Self {
        Tid(n << 40)
    }

    /// Pack a commit id
    pub fn pack(epoch: Tid, seq: u64, worker: u8) -> Self {
        let seq = seq & ((1 << Self::SEQ_BITS) - 1);
        Tid(epoch.epoch().0 | (seq << 16) | ((worker as u64) << 8) | (seq % 256))
    }

    /// Epoch this id was produced in
    #[inline]
    pub fn epoch(self) -> Tid {
        Tid(self.0 & Self::EPOCH_MASK)
    }

    /// Epoch number (1 for the first epoch)
    pub fn epoch_number(self) -> u64 {
        (self.0 & Self::EPOCH_MASK) >> 40
    }

    /// Worker-local sequence
    pub fn sequence(self) -> u64 {
        (self.0 >> 16) & ((1 << Self::SEQ_BITS) - 1)
    }

    /// Id of the committing worker
    pub fn worker(self) -> u8 {
        (self.0 >> 8) as u8
    }

    /// Next epoch value
    pub fn next_epoch(self) -> Tid {
        Tid(self.epoch().0 + Self::EPOCH_INCR)
    }

    /// True for [`Tid::ZERO`]
    pub fn is_zero(self) -> bool {
        self.0 == 0
    }
}

impl std::fmt::Display for Tid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "e{}/w{}/s{}",
            self.epoch_number(),
            self.worker(),
            self.sequence()
        )
    }
}

/// Worker phase within an epoch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Phase {
    /// Normal execution. Split keys are routed to the local store.
    #[default]
    Split,
    /// Folding local deltas into the shared store.
    Merge,
    /// Replaying stashed requests with merged values visible.
    Join,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Phase::Split => f.write_str("split"),
            Phase::Merge => f.write_str("merge"),
            Phase::Join => f.write_str("join"),
        }
    }
}

/// Concurrency strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SystemType {
    /// Optimistic execution with hot keys split into per-worker aggregation
    #[default]
    Doppel,
    /// Optimistic execution only; keys are never split
    Occ,
    /// Lock-on-access pessimistic execution
    Locking,
}

impl SystemType {
    /// Whether hot-key splitting and epochs are active
    pub fn splits_keys(&self) -> bool {
        matches!(self, SystemType::Doppel)
    }

    /// Whether transactions run on the optimistic engine
    pub fn is_optimistic(&self) -> bool {
        !matches!(self, SystemType::Locking)
    }
}
