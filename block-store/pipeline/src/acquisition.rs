use tokio::sync::watch;
use tracing::{debug, info, instrument};

use crate::{
    adapter::{BlockFetcher, BlockRepository, ChainView, LocalBlocks},
    block::ChainPosition,
    cancel::CancelSignal,
    config::Config,
    context::{Batch, StepContext},
    errors::Error,
    steps::{StallReason, StepEnv, StepResult},
    LOG_TARGET,
};

/// How a pass ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PassOutcome {
    /// Every position of the pass was resolved and persisted.
    Continue,
    /// The pass gave up; retry at the same cursor after backing off.
    Stall(StallReason),
    /// Cancellation was signalled.
    Stop,
}

/// Keeps the repository filled with the blocks of the accepted chain.
///
/// Each pass starts at a cursor position, runs the enabled steps in order
/// against a fresh [`StepContext`] and moves on to the position after the
/// last one it walked. At the chain tip the loop waits for the chain to grow.
pub struct AcquisitionLoop<Chain, Local, Fetcher, Repository> {
    config: Config,
    chain: Chain,
    local: Local,
    fetcher: Fetcher,
    repository: Repository,
}

impl<Chain, Local, Fetcher, Repository> AcquisitionLoop<Chain, Local, Fetcher, Repository>
where
    Chain: ChainView,
    Local: LocalBlocks,
    Fetcher: BlockFetcher<Block = Local::Block>,
    Repository: BlockRepository<Block = Local::Block>,
{
    pub const fn new(
        config: Config,
        chain: Chain,
        local: Local,
        fetcher: Fetcher,
        repository: Repository,
    ) -> Self {
        Self {
            config,
            chain,
            local,
            fetcher,
            repository,
        }
    }

    pub const fn config(&self) -> &Config {
        &self.config
    }

    pub const fn chain(&self) -> &Chain {
        &self.chain
    }

    pub const fn repository(&self) -> &Repository {
        &self.repository
    }

    /// Runs until `cancel` fires, starting right after the repository's store
    /// tip (or at genesis on an empty repository).
    ///
    /// Blocks gathered but not yet flushed when cancellation arrives are
    /// dropped; they are downloaded again on the next run.
    pub async fn run(
        &self,
        mut tip_updates: watch::Receiver<u64>,
        cancel: CancelSignal,
    ) -> Result<(), Error> {
        let store_tip = self
            .repository
            .store_tip()
            .await
            .map_err(|e| Error::Storage(e.to_string()))?;
        info!(
            target: LOG_TARGET,
            store_tip = ?store_tip.map(|tip| tip.height()),
            "Starting block acquisition"
        );

        // The last position known to be resolved, used to find where to
        // continue once the chain grows.
        let mut anchor = store_tip;
        let mut next = self.position_after(anchor.as_ref());
        let mut carried = Batch::default();
        let mut consecutive_stalls = 0u32;

        loop {
            if cancel.is_cancelled() {
                info!(target: LOG_TARGET, "Block acquisition cancelled");
                return Ok(());
            }

            let Some(start) = next else {
                info!(
                    target: LOG_TARGET,
                    anchor = ?anchor.map(|position| position.height()),
                    "Chain tip reached, waiting for new blocks"
                );
                if !Self::wait_for_tip(&mut tip_updates, &cancel).await? {
                    info!(target: LOG_TARGET, "Block acquisition cancelled");
                    return Ok(());
                }
                next = self.position_after(anchor.as_ref());
                continue;
            };

            let mut context =
                StepContext::resume(Some(start), &self.chain, std::mem::take(&mut carried))?;

            match self.run_pass(&mut context, &cancel).await {
                PassOutcome::Continue => {
                    consecutive_stalls = 0;
                    let last = *context.cursor();
                    context.advance_cursor(&self.chain);
                    if *context.cursor() == last {
                        anchor = Some(last);
                        next = None;
                    } else {
                        next = Some(*context.cursor());
                    }
                    carried = context.into_batch();
                }
                PassOutcome::Stall(reason) => {
                    consecutive_stalls = consecutive_stalls.saturating_add(1);
                    let delay = self.config.backoff.delay(consecutive_stalls);
                    info!(
                        target: LOG_TARGET,
                        ?reason,
                        cursor = start.height(),
                        consecutive_stalls,
                        delay_ms = delay.as_millis(),
                        "Pass stalled, backing off"
                    );
                    carried = context.into_batch();
                    tokio::select! {
                        biased;
                        () = cancel.cancelled() => {
                            info!(target: LOG_TARGET, "Block acquisition cancelled");
                            return Ok(());
                        }
                        () = tokio::time::sleep(delay) => {}
                    }
                }
                PassOutcome::Stop => {
                    info!(
                        target: LOG_TARGET,
                        discarded = context.accumulated().len(),
                        "Block acquisition cancelled"
                    );
                    return Ok(());
                }
            }
        }
    }

    /// Runs the enabled steps of `context` in order until none is left.
    #[instrument(level = "debug", skip_all, fields(cursor = context.cursor().height()))]
    pub async fn run_pass(
        &self,
        context: &mut StepContext<Local::Block>,
        cancel: &CancelSignal,
    ) -> PassOutcome {
        let env = StepEnv {
            config: &self.config,
            chain: &self.chain,
            local: &self.local,
            fetcher: &self.fetcher,
            repository: &self.repository,
            cancel,
        };

        while !context.is_finished() {
            for step in context.enabled_steps() {
                // An earlier step of this round may have disabled it.
                if !context.is_enabled(step) {
                    continue;
                }
                debug!(target: LOG_TARGET, %step, "Executing step");
                match step.execute(context, &env).await {
                    StepResult::Continue => {}
                    StepResult::Stall(reason) => return PassOutcome::Stall(reason),
                    StepResult::Cancelled => return PassOutcome::Stop,
                }
            }
        }

        PassOutcome::Continue
    }

    fn position_after(&self, anchor: Option<&ChainPosition>) -> Option<ChainPosition> {
        anchor.map_or_else(
            || self.chain.position_at(0),
            |anchor| self.chain.position_after(anchor),
        )
    }

    /// Returns `false` if cancelled while waiting.
    async fn wait_for_tip(
        tip_updates: &mut watch::Receiver<u64>,
        cancel: &CancelSignal,
    ) -> Result<bool, Error> {
        tokio::select! {
            biased;
            () = cancel.cancelled() => Ok(false),
            changed = tip_updates.changed() => changed
                .map(|()| true)
                .map_err(|_| Error::TipChannelClosed),
        }
    }
}
