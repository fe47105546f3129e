use std::{error::Error, sync::Arc};

use crate::{
    block::{BlockUnit, ChainPosition, Payload},
    cancel::CancelSignal,
    errors::NetworkError,
};

/// Read access to the accepted header chain.
///
/// Answers must be stable for positions already handed out as long as the
/// chain is not reorganised.
pub trait ChainView: Send + Sync {
    /// The position immediately following `position`, or `None` at the tip.
    fn position_after(&self, position: &ChainPosition) -> Option<ChainPosition>;

    /// The position at `height` on the accepted chain.
    fn position_at(&self, height: u64) -> Option<ChainPosition>;

    fn contains(&self, position: &ChainPosition) -> bool {
        self.position_at(position.height()).as_ref() == Some(position)
    }
}

/// Blocks that can be obtained without touching the network, e.g. blocks
/// received through consensus that are not persisted yet, or blocks already
/// in the repository.
#[async_trait::async_trait]
pub trait LocalBlocks: Send + Sync {
    type Block: Payload;

    async fn try_get_local(&self, position: &ChainPosition) -> Option<Self::Block>;
}

/// Abstracts over the network protocol used to download full blocks.
#[async_trait::async_trait]
pub trait BlockFetcher: Send + Sync {
    type Block: Payload;

    /// Requests the blocks at `positions` from peers.
    ///
    /// Partial answers are allowed and blocks may come back in any order.
    /// Implementations must give up promptly once `cancel` fires.
    async fn fetch_batch(
        &self,
        positions: &[ChainPosition],
        cancel: CancelSignal,
    ) -> Result<Vec<(ChainPosition, Self::Block)>, NetworkError>;
}

/// The persistent block store.
///
/// `insert_batch` is atomic: either every unit becomes visible to readers or
/// none does. Inserting a unit twice must leave the store as if it had been
/// inserted once. The store tip only moves forward: it is the highest
/// position written so far.
#[async_trait::async_trait]
pub trait BlockRepository: Send + Sync {
    type Block: Payload;
    type Error: Error + Send + Sync + 'static;

    /// Writes `units` in one atomic batch. On failure the batch is handed
    /// back untouched.
    async fn insert_batch(
        &self,
        units: Vec<BlockUnit<Self::Block>>,
    ) -> Result<(), (Self::Error, Vec<BlockUnit<Self::Block>>)>;

    async fn get_block(&self, position: &ChainPosition)
        -> Result<Option<Self::Block>, Self::Error>;

    /// Position of the last block written by a successful batch.
    async fn store_tip(&self) -> Result<Option<ChainPosition>, Self::Error>;
}

impl<T: ChainView + ?Sized> ChainView for Arc<T> {
    fn position_after(&self, position: &ChainPosition) -> Option<ChainPosition> {
        (**self).position_after(position)
    }

    fn position_at(&self, height: u64) -> Option<ChainPosition> {
        (**self).position_at(height)
    }
}

#[async_trait::async_trait]
impl<T: LocalBlocks + ?Sized> LocalBlocks for Arc<T> {
    type Block = T::Block;

    async fn try_get_local(&self, position: &ChainPosition) -> Option<Self::Block> {
        (**self).try_get_local(position).await
    }
}

#[async_trait::async_trait]
impl<T: BlockFetcher + ?Sized> BlockFetcher for Arc<T> {
    type Block = T::Block;

    async fn fetch_batch(
        &self,
        positions: &[ChainPosition],
        cancel: CancelSignal,
    ) -> Result<Vec<(ChainPosition, Self::Block)>, NetworkError> {
        (**self).fetch_batch(positions, cancel).await
    }
}

#[async_trait::async_trait]
impl<T: BlockRepository + ?Sized> BlockRepository for Arc<T> {
    type Block = T::Block;
    type Error = T::Error;

    async fn insert_batch(
        &self,
        units: Vec<BlockUnit<Self::Block>>,
    ) -> Result<(), (Self::Error, Vec<BlockUnit<Self::Block>>)> {
        (**self).insert_batch(units).await
    }

    async fn get_block(
        &self,
        position: &ChainPosition,
    ) -> Result<Option<Self::Block>, Self::Error> {
        (**self).get_block(position).await
    }

    async fn store_tip(&self) -> Result<Option<ChainPosition>, Self::Error> {
        (**self).store_tip().await
    }
}
