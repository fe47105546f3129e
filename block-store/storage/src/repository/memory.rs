use std::{collections::BTreeMap, convert::Infallible};

use async_trait::async_trait;
use block_store_pipeline::{BlockRepository, BlockUnit, ChainPosition, Payload};
use tokio::sync::RwLock;
use tracing::trace;

use crate::LOG_TARGET;

#[derive(Debug)]
struct State<B> {
    blocks: BTreeMap<ChainPosition, B>,
    tip: Option<ChainPosition>,
}

/// Repository kept entirely in memory.
///
/// A batch is applied under a single write lock, so concurrent readers see
/// either all of it or none of it.
#[derive(Debug)]
pub struct MemoryRepository<B> {
    state: RwLock<State<B>>,
}

impl<B> Default for MemoryRepository<B> {
    fn default() -> Self {
        Self {
            state: RwLock::new(State {
                blocks: BTreeMap::new(),
                tip: None,
            }),
        }
    }
}

impl<B: Payload> MemoryRepository<B> {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.state.read().await.blocks.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.state.read().await.blocks.is_empty()
    }

    /// Heights of every stored block, lowest first.
    pub async fn heights(&self) -> Vec<u64> {
        self.state
            .read()
            .await
            .blocks
            .keys()
            .map(ChainPosition::height)
            .collect()
    }
}

#[async_trait]
impl<B: Payload> BlockRepository for MemoryRepository<B> {
    type Block = B;
    type Error = Infallible;

    async fn insert_batch(
        &self,
        units: Vec<BlockUnit<Self::Block>>,
    ) -> Result<(), (Self::Error, Vec<BlockUnit<Self::Block>>)> {
        let mut state = self.state.write().await;
        let count = units.len();
        for unit in units {
            let (position, block) = unit.into_parts();
            state.blocks.insert(position, block);
            if state.tip.is_none_or(|tip| tip.height() < position.height()) {
                state.tip = Some(position);
            }
        }
        trace!(target: LOG_TARGET, count, "Inserted batch in memory");
        Ok(())
    }

    async fn get_block(
        &self,
        position: &ChainPosition,
    ) -> Result<Option<Self::Block>, Self::Error> {
        Ok(self.state.read().await.blocks.get(position).cloned())
    }

    async fn store_tip(&self) -> Result<Option<ChainPosition>, Self::Error> {
        Ok(self.state.read().await.tip)
    }
}
