use std::collections::{HashMap, HashSet, VecDeque};

use tracing::{debug, info};

use crate::{
    adapter::{BlockRepository, ChainView},
    block::{BlockUnit, ChainPosition, Payload},
    errors::Error,
    steps::{EnabledSteps, StepKind},
    LOG_TARGET,
};

/// Blocks obtained during a pass and not yet written to the repository.
///
/// Units are kept in chain order and `size_bytes` is always the sum of
/// their payload sizes. Blocks downloaded ahead of a missing predecessor wait
/// separately and are not part of the units until it arrives.
#[derive(Debug)]
pub struct Batch<B> {
    units: Vec<BlockUnit<B>>,
    positions: HashSet<ChainPosition>,
    size_bytes: usize,
    waiting: HashMap<ChainPosition, B>,
}

impl<B> Default for Batch<B> {
    fn default() -> Self {
        Self {
            units: Vec::new(),
            positions: HashSet::new(),
            size_bytes: 0,
            waiting: HashMap::new(),
        }
    }
}

impl<B: Payload> Batch<B> {
    fn push(&mut self, unit: BlockUnit<B>) {
        self.size_bytes += unit.size_bytes();
        self.positions.insert(*unit.position());
        self.units.push(unit);
    }

    fn take(&mut self) -> Vec<BlockUnit<B>> {
        self.positions.clear();
        self.size_bytes = 0;
        std::mem::take(&mut self.units)
    }

    fn restore(&mut self, units: Vec<BlockUnit<B>>) {
        for unit in units {
            self.push(unit);
        }
    }

    #[must_use]
    pub fn units(&self) -> &[BlockUnit<B>] {
        &self.units
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.units.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    #[must_use]
    pub const fn size_bytes(&self) -> usize {
        self.size_bytes
    }

    #[must_use]
    pub fn contains(&self, position: &ChainPosition) -> bool {
        self.positions.contains(position)
    }

    #[must_use]
    pub fn last_position(&self) -> Option<&ChainPosition> {
        self.units.last().map(BlockUnit::position)
    }

    /// Number of blocks received ahead of a missing predecessor.
    #[must_use]
    pub fn waiting(&self) -> usize {
        self.waiting.len()
    }

    #[must_use]
    pub fn is_waiting(&self, position: &ChainPosition) -> bool {
        self.waiting.contains_key(position)
    }
}

/// Working state of a single pass over the chain.
///
/// `pending` is a FIFO of consecutive chain positions still to be resolved.
/// `cursor` is the last position walked into `pending` and `lookahead` the
/// one after it, if the chain already has it.
#[derive(Debug)]
pub struct StepContext<B> {
    pending: VecDeque<ChainPosition>,
    cursor: ChainPosition,
    lookahead: Option<ChainPosition>,
    enabled: EnabledSteps,
    accumulated: Batch<B>,
    stall_count: usize,
}

impl<B: Payload> StepContext<B> {
    /// Starts a fresh pass at `start` with an empty batch and every step
    /// enabled.
    pub fn initialize<Chain>(start: Option<ChainPosition>, chain: &Chain) -> Result<Self, Error>
    where
        Chain: ChainView + ?Sized,
    {
        Self::resume(start, chain, Batch::default())
    }

    /// Starts a pass at `start` that keeps the blocks a previous pass at the
    /// same cursor obtained but could not persist. Positions already in
    /// `batch` count as resolved.
    pub fn resume<Chain>(
        start: Option<ChainPosition>,
        chain: &Chain,
        batch: Batch<B>,
    ) -> Result<Self, Error>
    where
        Chain: ChainView + ?Sized,
    {
        let start = start
            .filter(|position| chain.contains(position))
            .ok_or(Error::InvalidPosition(start))?;

        Ok(Self {
            pending: VecDeque::from([start]),
            cursor: start,
            lookahead: chain.position_after(&start),
            enabled: EnabledSteps::all(),
            accumulated: batch,
            stall_count: 0,
        })
    }

    /// Moves the cursor to the lookahead position and refreshes the
    /// lookahead. At the tip the cursor stays put; the lookahead is queried
    /// again in case the chain has grown.
    pub fn advance_cursor<Chain>(&mut self, chain: &Chain)
    where
        Chain: ChainView + ?Sized,
    {
        if let Some(next) = self
            .lookahead
            .take()
            .or_else(|| chain.position_after(&self.cursor))
        {
            self.cursor = next;
        }
        self.lookahead = chain.position_after(&self.cursor);
    }

    /// Stops looking blocks up locally for the rest of the pass.
    pub fn disable_lookup(&mut self) {
        self.enabled.disable(StepKind::FindBlocks);
    }

    pub(crate) fn disable(&mut self, step: StepKind) {
        self.enabled.disable(step);
    }

    #[must_use]
    pub fn pending(&self) -> &VecDeque<ChainPosition> {
        &self.pending
    }

    #[must_use]
    pub const fn cursor(&self) -> &ChainPosition {
        &self.cursor
    }

    #[must_use]
    pub const fn lookahead(&self) -> Option<&ChainPosition> {
        self.lookahead.as_ref()
    }

    #[must_use]
    pub const fn accumulated(&self) -> &Batch<B> {
        &self.accumulated
    }

    #[must_use]
    pub const fn accumulated_bytes(&self) -> usize {
        self.accumulated.size_bytes()
    }

    #[must_use]
    pub const fn stall_count(&self) -> usize {
        self.stall_count
    }

    #[must_use]
    pub fn is_enabled(&self, step: StepKind) -> bool {
        self.enabled.contains(step)
    }

    /// Enabled steps in execution order.
    #[must_use]
    pub fn enabled_steps(&self) -> Vec<StepKind> {
        self.enabled.iter().collect()
    }

    /// A pass with no enabled step has nothing left to do.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.enabled.is_empty()
    }

    /// Hands the unflushed batch over, blocks still waiting for a
    /// predecessor included, e.g. to resume at the same cursor after a stall.
    #[must_use]
    pub fn into_batch(self) -> Batch<B> {
        self.accumulated
    }

    /// Walks one position further along the chain and queues it. Returns
    /// `false` at the tip.
    pub(crate) fn extend_pending<Chain>(&mut self, chain: &Chain) -> bool
    where
        Chain: ChainView + ?Sized,
    {
        if self.lookahead.is_none() {
            self.lookahead = chain.position_after(&self.cursor);
        }
        if self.lookahead.is_none() {
            return false;
        }
        self.advance_cursor(chain);
        self.pending.push_back(self.cursor);
        true
    }

    /// Resolves the front of `pending` with `block`.
    pub(crate) fn resolve_front(&mut self, block: B) {
        if let Some(position) = self.pending.pop_front() {
            self.accumulated.waiting.remove(&position);
            self.accumulated.push(BlockUnit::new(position, block));
        }
    }

    /// Drops the front of `pending` because the batch already holds it.
    pub(crate) fn skip_front(&mut self) {
        self.pending.pop_front();
    }

    /// Keeps downloaded blocks for pending positions. Returns how many were
    /// new; anything not asked for is ignored.
    pub(crate) fn stash_received(
        &mut self,
        blocks: impl IntoIterator<Item = (ChainPosition, B)>,
    ) -> usize {
        let mut received = 0;
        for (position, block) in blocks {
            if self.accumulated.is_waiting(&position) || !self.pending.contains(&position) {
                continue;
            }
            self.accumulated.waiting.insert(position, block);
            received += 1;
        }
        received
    }

    /// Moves the stashed block for the front of `pending`, if it arrived,
    /// into the batch.
    pub(crate) fn accept_next_stashed(&mut self) -> bool {
        let Some(block) = self
            .pending
            .front()
            .and_then(|position| self.accumulated.waiting.remove(position))
        else {
            return false;
        };
        self.resolve_front(block);
        true
    }

    pub(crate) fn record_stall(&mut self) -> usize {
        self.stall_count += 1;
        self.stall_count
    }

    /// Writes the whole batch to `repository` in one atomic insert. On
    /// failure the batch is kept as it was for the next attempt.
    pub(crate) async fn flush<Repository>(
        &mut self,
        repository: &Repository,
    ) -> Result<(), Repository::Error>
    where
        Repository: BlockRepository<Block = B> + ?Sized,
    {
        if self.accumulated.is_empty() {
            return Ok(());
        }

        let size_bytes = self.accumulated.size_bytes();
        let units = self.accumulated.take();
        let count = units.len();
        let tip = units.last().map(|unit| *unit.position());

        match repository.insert_batch(units).await {
            Ok(()) => {
                if let Some(tip) = tip {
                    info!(
                        target: LOG_TARGET,
                        units = count,
                        bytes = size_bytes,
                        store_tip = %tip,
                        "Flushed block batch"
                    );
                }
                Ok(())
            }
            Err((error, units)) => {
                debug!(target: LOG_TARGET, units = units.len(), "Keeping batch after failed flush");
                self.accumulated.restore(units);
                Err(error)
            }
        }
    }
}
