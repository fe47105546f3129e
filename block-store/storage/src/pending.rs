use std::{
    collections::{HashMap, VecDeque},
    num::NonZeroUsize,
    sync::Arc,
};

use async_trait::async_trait;
use block_store_pipeline::{BlockRepository, ChainPosition, LocalBlocks, Payload};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{trace, warn};

use crate::LOG_TARGET;

const DEFAULT_CAPACITY: usize = 1024;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PendingBlocksSettings {
    /// Maximum number of blocks held before the oldest ones are evicted.
    pub capacity: NonZeroUsize,
}

impl Default for PendingBlocksSettings {
    fn default() -> Self {
        Self {
            capacity: NonZeroUsize::new(DEFAULT_CAPACITY).unwrap_or(NonZeroUsize::MIN),
        }
    }
}

#[derive(Debug)]
struct Inner<B> {
    blocks: HashMap<ChainPosition, B>,
    arrival: VecDeque<ChainPosition>,
}

/// Blocks received through consensus that have not been persisted yet.
///
/// Bounded: once full, the block that arrived first is dropped. A dropped
/// block is simply downloaded again by the pipeline.
#[derive(Debug)]
pub struct PendingBlocks<B> {
    inner: RwLock<Inner<B>>,
    capacity: NonZeroUsize,
}

impl<B: Payload> PendingBlocks<B> {
    #[must_use]
    pub fn new(settings: &PendingBlocksSettings) -> Self {
        Self {
            inner: RwLock::new(Inner {
                blocks: HashMap::new(),
                arrival: VecDeque::new(),
            }),
            capacity: settings.capacity,
        }
    }

    pub async fn insert(&self, position: ChainPosition, block: B) {
        let mut inner = self.inner.write().await;
        if inner.blocks.insert(position, block).is_none() {
            inner.arrival.push_back(position);
        }
        while inner.arrival.len() > self.capacity.get() {
            let Some(evicted) = inner.arrival.pop_front() else {
                break;
            };
            inner.blocks.remove(&evicted);
            trace!(target: LOG_TARGET, %evicted, "Evicted pending block");
        }
    }

    pub async fn get(&self, position: &ChainPosition) -> Option<B> {
        self.inner.read().await.blocks.get(position).cloned()
    }

    pub async fn remove(&self, position: &ChainPosition) -> Option<B> {
        let mut inner = self.inner.write().await;
        let block = inner.blocks.remove(position)?;
        inner.arrival.retain(|held| held != position);
        Some(block)
    }

    /// Drops every block at or below `height`, typically once the repository
    /// tip has moved past them. Returns how many blocks were dropped.
    pub async fn prune_through(&self, height: u64) -> usize {
        let mut inner = self.inner.write().await;
        let before = inner.arrival.len();
        inner.arrival.retain(|position| position.height() > height);
        inner.blocks.retain(|position, _| position.height() > height);
        before - inner.arrival.len()
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.blocks.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.blocks.is_empty()
    }
}

/// Resolves blocks without the network: pending blocks first, then the
/// repository itself.
pub struct LocalAvailability<R: BlockRepository> {
    pending: Arc<PendingBlocks<R::Block>>,
    repository: R,
}

impl<R: BlockRepository> LocalAvailability<R> {
    pub const fn new(pending: Arc<PendingBlocks<R::Block>>, repository: R) -> Self {
        Self {
            pending,
            repository,
        }
    }

    #[must_use]
    pub const fn pending(&self) -> &Arc<PendingBlocks<R::Block>> {
        &self.pending
    }

    #[must_use]
    pub const fn repository(&self) -> &R {
        &self.repository
    }
}

#[async_trait]
impl<R: BlockRepository> LocalBlocks for LocalAvailability<R> {
    type Block = R::Block;

    async fn try_get_local(&self, position: &ChainPosition) -> Option<Self::Block> {
        if let Some(block) = self.pending.get(position).await {
            return Some(block);
        }
        match self.repository.get_block(position).await {
            Ok(block) => block,
            Err(error) => {
                // Treated as a miss, so the block gets downloaded instead.
                warn!(target: LOG_TARGET, %position, %error, "Failed to read block from repository");
                None
            }
        }
    }
}
