use std::{cmp::Ordering, fmt};

use bytes::Bytes;
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct HeaderId([u8; 32]);

impl From<[u8; 32]> for HeaderId {
    fn from(id: [u8; 32]) -> Self {
        Self(id)
    }
}

impl From<HeaderId> for [u8; 32] {
    fn from(id: HeaderId) -> Self {
        id.0
    }
}

impl TryFrom<&[u8]> for HeaderId {
    type Error = InvalidHeaderId;

    fn try_from(slice: &[u8]) -> Result<Self, Self::Error> {
        <[u8; 32]>::try_from(slice)
            .map(Self)
            .map_err(|_| InvalidHeaderId(slice.len()))
    }
}

impl AsRef<[u8]> for HeaderId {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for HeaderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&const_hex::encode(self.0))
    }
}

#[derive(Debug, thiserror::Error)]
#[error("Header id must be 32 bytes long, got {0}")]
pub struct InvalidHeaderId(pub usize);

/// A block's place in the accepted header chain.
///
/// Positions order by height first. Two positions at the same height with
/// different ids belong to different forks and are never both part of the
/// chain the pipeline walks.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct ChainPosition {
    height: u64,
    id: HeaderId,
}

impl ChainPosition {
    #[must_use]
    pub const fn new(height: u64, id: HeaderId) -> Self {
        Self { height, id }
    }

    #[must_use]
    pub const fn height(&self) -> u64 {
        self.height
    }

    #[must_use]
    pub const fn id(&self) -> HeaderId {
        self.id
    }
}

impl PartialOrd for ChainPosition {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ChainPosition {
    fn cmp(&self, other: &Self) -> Ordering {
        self.height
            .cmp(&other.height)
            .then_with(|| self.id.cmp(&other.id))
    }
}

impl fmt::Display for ChainPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.id, self.height)
    }
}

/// A full block as far as the pipeline is concerned: something with a size
/// that can be moved around and persisted.
pub trait Payload: Clone + Send + Sync + 'static {
    /// Size in bytes this block accounts for in a batch.
    fn size_bytes(&self) -> usize;
}

impl Payload for Bytes {
    fn size_bytes(&self) -> usize {
        self.len()
    }
}

impl Payload for Vec<u8> {
    fn size_bytes(&self) -> usize {
        self.len()
    }
}

/// A block paired with the chain position it was obtained for, waiting to be
/// written to the repository.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlockUnit<B> {
    position: ChainPosition,
    payload: B,
}

impl<B: Payload> BlockUnit<B> {
    #[must_use]
    pub const fn new(position: ChainPosition, payload: B) -> Self {
        Self { position, payload }
    }

    #[must_use]
    pub const fn position(&self) -> &ChainPosition {
        &self.position
    }

    #[must_use]
    pub const fn payload(&self) -> &B {
        &self.payload
    }

    #[must_use]
    pub fn size_bytes(&self) -> usize {
        self.payload.size_bytes()
    }

    #[must_use]
    pub fn into_parts(self) -> (ChainPosition, B) {
        (self.position, self.payload)
    }
}
