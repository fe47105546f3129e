use thiserror::Error;

use crate::block::ChainPosition;

#[derive(Debug, Error)]
pub enum Error {
    /// The position a pass was asked to start from is missing or not part
    /// of the accepted chain.
    #[error("Invalid start position: {0:?}")]
    InvalidPosition(Option<ChainPosition>),

    #[error("Failed to read the store tip: {0}")]
    Storage(String),

    #[error("Chain tip notifications closed")]
    TipChannelClosed,
}

#[derive(Debug, Error)]
pub enum NetworkError {
    #[error("Request timed out")]
    Timeout,

    #[error("Peer error: {0}")]
    Peer(String),

    #[error("Request cancelled")]
    Cancelled,
}
