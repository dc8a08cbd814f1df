//! Document position markers.
//!
//! An [`Etag`] is a two-component version marker assigned to every
//! document mutation: a `restarts` generation counter bumped on server
//! restart and a `changes` counter that increases monotonically within
//! a generation. Etags form a strict total order and double as resume
//! cursors and staleness fingerprint inputs.

use serde::{Deserialize, Serialize};

use crate::error::TypesError;

/// Serialized width of an etag in bytes.
pub const ETAG_BYTES: usize = 16;

/// A totally ordered, monotonically increasing document position marker.
///
/// Ordering compares `restarts` first, then `changes`, so markers from
/// a later generation always sort after every marker of an earlier one.
/// Markers are never reused across generations.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Etag {
    /// Generation counter, bumped on every server restart.
    pub restarts: u64,
    /// Change counter within the generation.
    pub changes: u64,
}

impl Etag {
    /// Create an etag from its two components.
    pub fn new(restarts: u64, changes: u64) -> Self {
        Self { restarts, changes }
    }

    /// The zero marker, ordered before every real document marker.
    pub fn zero() -> Self {
        Self::default()
    }

    /// The marker immediately following this one.
    pub fn next(self) -> Self {
        self.incremented_by(1)
    }

    /// Advance the `changes` counter by `n`.
    ///
    /// Increments stay within the current generation; the `restarts`
    /// component is only ever changed by the storage engine itself, so
    /// a synthesized marker cannot collide with a real marker from
    /// another generation.
    pub fn incremented_by(self, n: u64) -> Self {
        Self {
            restarts: self.restarts,
            changes: self.changes.saturating_add(n),
        }
    }

    /// Step the `changes` counter back by `n`, saturating at zero.
    ///
    /// Never borrows from `restarts`; a decrement below the start of
    /// the generation clamps to `restarts/0`.
    pub fn decremented_by(self, n: u64) -> Self {
        Self {
            restarts: self.restarts,
            changes: self.changes.saturating_sub(n),
        }
    }

    /// Serialize to a 16-byte big-endian representation.
    ///
    /// The byte order sorts lexicographically the same way the etag
    /// sorts numerically, so serialized etags can key ordered storage.
    pub fn to_bytes(self) -> [u8; ETAG_BYTES] {
        let mut buf = [0u8; ETAG_BYTES];
        buf[..8].copy_from_slice(&self.restarts.to_be_bytes());
        buf[8..].copy_from_slice(&self.changes.to_be_bytes());
        buf
    }

    /// Parse an etag from its 16-byte representation.
    pub fn parse(bytes: &[u8]) -> Result<Self, TypesError> {
        if bytes.len() != ETAG_BYTES {
            return Err(TypesError::InvalidEtag(format!(
                "expected {} bytes, got {}",
                ETAG_BYTES,
                bytes.len()
            )));
        }
        let mut restarts = [0u8; 8];
        let mut changes = [0u8; 8];
        restarts.copy_from_slice(&bytes[..8]);
        changes.copy_from_slice(&bytes[8..]);
        Ok(Self {
            restarts: u64::from_be_bytes(restarts),
            changes: u64::from_be_bytes(changes),
        })
    }

    /// True if this marker is the zero marker.
    pub fn is_zero(self) -> bool {
        self.restarts == 0 && self.changes == 0
    }
}

impl std::fmt::Display for Etag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.restarts, self.changes)
    }
}
