//! In-memory collaborators for exercising the pipeline in tests.

use std::{
    collections::{BTreeMap, HashMap, VecDeque},
    sync::{Mutex, MutexGuard, PoisonError, RwLock},
};

use bytes::Bytes;
use tokio::sync::watch;

use crate::{
    adapter::{BlockFetcher, BlockRepository, ChainView, LocalBlocks},
    block::{BlockUnit, ChainPosition, HeaderId},
    cancel::CancelSignal,
    errors::NetworkError,
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Deterministic header id for the mock chain at `height`.
#[must_use]
pub fn header_id(height: u64) -> HeaderId {
    let mut id = [0x11; 32];
    id[..8].copy_from_slice(&height.to_be_bytes());
    id.into()
}

/// A linear header chain starting at height 0 that can grow during a test.
/// Every growth is announced on the tip channel.
#[derive(Debug)]
pub struct MockChain {
    positions: RwLock<Vec<ChainPosition>>,
    tip: watch::Sender<u64>,
}

impl MockChain {
    #[must_use]
    pub fn new(len: u64) -> Self {
        let positions = (0..len)
            .map(|height| ChainPosition::new(height, header_id(height)))
            .collect();
        let (tip, _) = watch::channel(len.saturating_sub(1));
        Self {
            positions: RwLock::new(positions),
            tip,
        }
    }

    pub fn extend(&self, count: u64) {
        let tip = {
            let mut positions = self.positions.write().unwrap_or_else(PoisonError::into_inner);
            let start = positions.len() as u64;
            positions.extend(
                (start..start + count).map(|height| ChainPosition::new(height, header_id(height))),
            );
            positions.len().saturating_sub(1) as u64
        };
        self.tip.send_replace(tip);
    }

    #[must_use]
    pub fn subscribe_tip(&self) -> watch::Receiver<u64> {
        self.tip.subscribe()
    }

    #[must_use]
    pub fn len(&self) -> u64 {
        self.positions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len() as u64
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ChainView for MockChain {
    fn position_after(&self, position: &ChainPosition) -> Option<ChainPosition> {
        self.position_at(position.height().checked_add(1)?)
    }

    fn position_at(&self, height: u64) -> Option<ChainPosition> {
        let index = usize::try_from(height).ok()?;
        self.positions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(index)
            .copied()
    }
}

#[derive(Debug, Default)]
pub struct MockLocal {
    blocks: Mutex<HashMap<ChainPosition, Bytes>>,
}

impl MockLocal {
    pub fn insert(&self, position: ChainPosition, block: Bytes) {
        lock(&self.blocks).insert(position, block);
    }
}

#[async_trait::async_trait]
impl LocalBlocks for MockLocal {
    type Block = Bytes;

    async fn try_get_local(&self, position: &ChainPosition) -> Option<Self::Block> {
        lock(&self.blocks).get(position).cloned()
    }
}

/// How [`ScriptedFetcher`] answers one request.
#[derive(Debug, Clone)]
pub enum Reply {
    /// Every requested block it has.
    Serve,
    /// Like `Serve`, highest position first.
    ServeReversed,
    /// Only the first `n` requested blocks it has.
    ServeFirst(usize),
    /// An empty answer.
    Nothing,
    /// Never answers; returns only once cancelled.
    Hang,
    Fail(String),
}

/// Answers requests from a set of blocks "held by peers", following a
/// script of replies. Once the script runs out every request is served.
#[derive(Debug, Default)]
pub struct ScriptedFetcher {
    blocks: Mutex<HashMap<ChainPosition, Bytes>>,
    script: Mutex<VecDeque<Reply>>,
    requests: Mutex<Vec<Vec<ChainPosition>>>,
}

impl ScriptedFetcher {
    pub fn serve(&self, position: ChainPosition, block: Bytes) {
        lock(&self.blocks).insert(position, block);
    }

    pub fn script(&self, replies: impl IntoIterator<Item = Reply>) {
        lock(&self.script).extend(replies);
    }

    #[must_use]
    pub fn requests(&self) -> Vec<Vec<ChainPosition>> {
        lock(&self.requests).clone()
    }

    fn available(&self, positions: &[ChainPosition]) -> Vec<(ChainPosition, Bytes)> {
        let blocks = lock(&self.blocks);
        positions
            .iter()
            .filter_map(|position| {
                blocks
                    .get(position)
                    .map(|block| (*position, block.clone()))
            })
            .collect()
    }
}

#[async_trait::async_trait]
impl BlockFetcher for ScriptedFetcher {
    type Block = Bytes;

    async fn fetch_batch(
        &self,
        positions: &[ChainPosition],
        cancel: CancelSignal,
    ) -> Result<Vec<(ChainPosition, Self::Block)>, NetworkError> {
        lock(&self.requests).push(positions.to_vec());
        let reply = lock(&self.script).pop_front().unwrap_or(Reply::Serve);
        match reply {
            Reply::Serve => Ok(self.available(positions)),
            Reply::ServeReversed => {
                let mut blocks = self.available(positions);
                blocks.reverse();
                Ok(blocks)
            }
            Reply::ServeFirst(count) => {
                let mut blocks = self.available(positions);
                blocks.truncate(count);
                Ok(blocks)
            }
            Reply::Nothing => Ok(Vec::new()),
            Reply::Hang => {
                cancel.cancelled().await;
                Err(NetworkError::Cancelled)
            }
            Reply::Fail(reason) => Err(NetworkError::Peer(reason)),
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("Injected storage failure")]
pub struct MockStorageError;

#[derive(Debug, Default)]
struct RepositoryState {
    blocks: BTreeMap<ChainPosition, Bytes>,
    batches: Vec<Vec<ChainPosition>>,
    tip: Option<ChainPosition>,
    failures_left: usize,
}

/// Repository keeping everything in memory, with injectable failures.
/// Records every successful batch.
#[derive(Debug, Default)]
pub struct MockRepository {
    state: Mutex<RepositoryState>,
}

impl MockRepository {
    /// Makes the next `count` batch inserts fail.
    pub fn fail_next(&self, count: usize) {
        lock(&self.state).failures_left = count;
    }

    /// Stored blocks in chain order.
    #[must_use]
    pub fn stored(&self) -> Vec<(ChainPosition, Bytes)> {
        lock(&self.state)
            .blocks
            .iter()
            .map(|(position, block)| (*position, block.clone()))
            .collect()
    }

    #[must_use]
    pub fn batches(&self) -> Vec<Vec<ChainPosition>> {
        lock(&self.state).batches.clone()
    }

    #[must_use]
    pub fn batch_sizes(&self) -> Vec<usize> {
        lock(&self.state).batches.iter().map(Vec::len).collect()
    }

    #[must_use]
    pub fn store_tip_now(&self) -> Option<ChainPosition> {
        lock(&self.state).tip
    }
}

#[async_trait::async_trait]
impl BlockRepository for MockRepository {
    type Block = Bytes;
    type Error = MockStorageError;

    async fn insert_batch(
        &self,
        units: Vec<BlockUnit<Self::Block>>,
    ) -> Result<(), (Self::Error, Vec<BlockUnit<Self::Block>>)> {
        let mut state = lock(&self.state);
        if state.failures_left > 0 {
            state.failures_left -= 1;
            return Err((MockStorageError, units));
        }

        let mut positions = Vec::with_capacity(units.len());
        for unit in units {
            let (position, block) = unit.into_parts();
            positions.push(position);
            state.blocks.insert(position, block);
        }
        if let Some(last) = positions.iter().max_by_key(|position| position.height()) {
            if state.tip.is_none_or(|tip| tip.height() < last.height()) {
                state.tip = Some(*last);
            }
        }
        state.batches.push(positions);
        Ok(())
    }

    async fn get_block(
        &self,
        position: &ChainPosition,
    ) -> Result<Option<Self::Block>, Self::Error> {
        Ok(lock(&self.state).blocks.get(position).cloned())
    }

    async fn store_tip(&self) -> Result<Option<ChainPosition>, Self::Error> {
        Ok(lock(&self.state).tip)
    }
}
