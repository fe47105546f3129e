mod download_blocks;
mod find_blocks;

use std::{collections::BTreeSet, fmt};

use crate::{
    adapter::{BlockFetcher, BlockRepository, ChainView, LocalBlocks},
    block::Payload,
    cancel::CancelSignal,
    config::Config,
    context::StepContext,
};

/// The stages a pass is made of, declared in execution order.
///
/// New stages are added here and dispatched in [`StepKind::execute`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum StepKind {
    FindBlocks,
    DownloadBlocks,
}

impl StepKind {
    pub const ALL: [Self; 2] = [Self::FindBlocks, Self::DownloadBlocks];

    pub async fn execute<B, Chain, Local, Fetcher, Repository>(
        self,
        context: &mut StepContext<B>,
        env: &StepEnv<'_, Chain, Local, Fetcher, Repository>,
    ) -> StepResult
    where
        B: Payload,
        Chain: ChainView + ?Sized,
        Local: LocalBlocks<Block = B> + ?Sized,
        Fetcher: BlockFetcher<Block = B> + ?Sized,
        Repository: BlockRepository<Block = B> + ?Sized,
    {
        match self {
            Self::FindBlocks => find_blocks::execute(context, env).await,
            Self::DownloadBlocks => download_blocks::execute(context, env).await,
        }
    }
}

impl fmt::Display for StepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FindBlocks => f.write_str("find-blocks"),
            Self::DownloadBlocks => f.write_str("download-blocks"),
        }
    }
}

/// The steps still active in a pass. Iteration follows [`StepKind`]
/// declaration order.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EnabledSteps(BTreeSet<StepKind>);

impl EnabledSteps {
    #[must_use]
    pub fn all() -> Self {
        Self(StepKind::ALL.into_iter().collect())
    }

    pub fn disable(&mut self, step: StepKind) {
        self.0.remove(&step);
    }

    #[must_use]
    pub fn contains(&self, step: StepKind) -> bool {
        self.0.contains(&step)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = StepKind> + '_ {
        self.0.iter().copied()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StallReason {
    /// Peers did not deliver within the retry budget.
    Network,
    /// The batch could not be written at the end of the pass.
    Storage,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StepResult {
    Continue,
    Stall(StallReason),
    Cancelled,
}

/// Everything a step reads besides the context it mutates.
pub struct StepEnv<'a, Chain: ?Sized, Local: ?Sized, Fetcher: ?Sized, Repository: ?Sized> {
    pub config: &'a Config,
    pub chain: &'a Chain,
    pub local: &'a Local,
    pub fetcher: &'a Fetcher,
    pub repository: &'a Repository,
    pub cancel: &'a CancelSignal,
}
