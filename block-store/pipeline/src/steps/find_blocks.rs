use tracing::{debug, info, trace};

use super::{StepEnv, StepResult};
use crate::{
    adapter::{BlockFetcher, BlockRepository, ChainView, LocalBlocks},
    block::{ChainPosition, Payload},
    context::StepContext,
    LOG_TARGET,
};

/// Resolves pending positions from local sources, walking the chain for as
/// long as blocks keep being available and the batch is below the flush
/// threshold.
///
/// Local availability is contiguous from the cursor, so the first miss ends
/// the lookup for the whole pass: the remaining request window is queued for
/// download and the step disables itself.
pub(super) async fn execute<B, Chain, Local, Fetcher, Repository>(
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
    let threshold = env.config.flush_threshold_bytes.get();
    let mut resolved = 0usize;
    let mut skipped = 0usize;
    let mut missing = None;
    let mut cancelled = false;

    while let Some(position) = context.pending().front().copied() {
        // Carried over from a stalled attempt at this cursor. Walk past the
        // whole carried run before the threshold is considered.
        if context.accumulated().contains(&position) {
            context.skip_front();
            skipped += 1;
            if !context.extend_pending(env.chain) {
                break;
            }
            continue;
        }

        let block = tokio::select! {
            biased;
            () = env.cancel.cancelled() => {
                cancelled = true;
                break;
            }
            block = env.local.try_get_local(&position) => block,
        };
        let Some(block) = block else {
            missing = Some(position);
            break;
        };
        trace!(target: LOG_TARGET, height = position.height(), "Block found locally");
        context.resolve_front(block);
        resolved += 1;

        if context.accumulated_bytes() >= threshold || !context.extend_pending(env.chain) {
            break;
        }
    }

    if cancelled {
        info!(
            target: LOG_TARGET,
            resolved,
            at = context.pending().front().map(ChainPosition::height),
            "Local lookup cancelled"
        );
    } else if let Some(position) = missing {
        let window = env.config.max_request_size.get();
        while context.pending().len() < window && context.extend_pending(env.chain) {}
        debug!(
            target: LOG_TARGET,
            resolved,
            skipped,
            first_missing = position.height(),
            queued = context.pending().len(),
            "Local blocks exhausted, switching to download"
        );
    } else {
        debug!(target: LOG_TARGET, resolved, skipped, "Local lookup finished");
    }

    context.disable_lookup();
    StepResult::Continue
}

#[cfg(test)]
mod tests {
    use std::num::NonZeroUsize;

    use bytes::Bytes;

    use super::*;
    use crate::{
        cancel::{cancel_pair, CancelSignal},
        config::Config,
        mock::{MockChain, MockLocal, MockRepository, ScriptedFetcher},
        steps::StepKind,
    };

    struct Fixture {
        chain: MockChain,
        local: MockLocal,
        fetcher: ScriptedFetcher,
        repository: MockRepository,
        config: Config,
    }

    impl Fixture {
        fn new(chain_len: u64) -> Self {
            Self {
                chain: MockChain::new(chain_len),
                local: MockLocal::default(),
                fetcher: ScriptedFetcher::default(),
                repository: MockRepository::default(),
                config: Config {
                    max_request_size: NonZeroUsize::new(4).unwrap(),
                    ..Config::default()
                },
            }
        }

        fn make_local(&self, heights: impl IntoIterator<Item = u64>, size: usize) {
            for height in heights {
                self.local
                    .insert(self.chain.position_at(height).unwrap(), Bytes::from(vec![1; size]));
            }
        }

        async fn execute(&self, context: &mut StepContext<Bytes>, cancel: &CancelSignal) {
            let env = StepEnv {
                config: &self.config,
                chain: &self.chain,
                local: &self.local,
                fetcher: &self.fetcher,
                repository: &self.repository,
                cancel,
            };
            let result = StepKind::FindBlocks.execute(context, &env).await;
            assert_eq!(result, StepResult::Continue);
        }

        async fn run(&self, start: u64) -> StepContext<Bytes> {
            let (_handle, cancel) = cancel_pair();
            let mut context =
                StepContext::initialize(self.chain.position_at(start), &self.chain).unwrap();
            self.execute(&mut context, &cancel).await;
            context
        }
    }

    fn heights(positions: impl IntoIterator<Item = u64>) -> Vec<u64> {
        positions.into_iter().collect()
    }

    #[tokio::test]
    async fn stops_at_first_missing_block() {
        let fixture = Fixture::new(20);
        fixture.make_local([10, 11, 13], 10);

        let context = fixture.run(10).await;

        let accumulated: Vec<_> = context
            .accumulated()
            .units()
            .iter()
            .map(|unit| unit.position().height())
            .collect();
        assert_eq!(accumulated, heights([10, 11]));
        let pending: Vec<_> = context.pending().iter().map(|p| p.height()).collect();
        assert_eq!(pending, heights([12, 13, 14, 15]));
        assert!(!context.is_enabled(StepKind::FindBlocks));
        assert!(context.is_enabled(StepKind::DownloadBlocks));
    }

    #[tokio::test]
    async fn everything_before_pending_is_accumulated() {
        let fixture = Fixture::new(30);
        fixture.make_local(5..9, 3);

        let context = fixture.run(5).await;

        let first_pending = context.pending().front().unwrap().height();
        let accumulated: Vec<_> = context
            .accumulated()
            .units()
            .iter()
            .map(|unit| unit.position().height())
            .collect();
        assert_eq!(accumulated, (5..first_pending).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn walks_to_the_tip_when_everything_is_local() {
        let fixture = Fixture::new(6);
        fixture.make_local(0..6, 1);

        let context = fixture.run(2).await;

        assert!(context.pending().is_empty());
        assert_eq!(context.accumulated().len(), 4);
        assert_eq!(context.cursor().height(), 5);
        assert!(context.lookahead().is_none());
        assert!(!context.is_enabled(StepKind::FindBlocks));
    }

    #[tokio::test]
    async fn stops_walking_once_threshold_is_reached() {
        let mut fixture = Fixture::new(50);
        fixture.config.flush_threshold_bytes = NonZeroUsize::new(25).unwrap();
        fixture.make_local(0..50, 10);

        let context = fixture.run(0).await;

        assert!(context.pending().is_empty());
        assert_eq!(context.accumulated().len(), 3);
        assert_eq!(context.accumulated_bytes(), 30);
        assert_eq!(context.cursor().height(), 2);
    }

    #[tokio::test]
    async fn nothing_local_queues_a_request_window() {
        let fixture = Fixture::new(3);

        let context = fixture.run(0).await;

        assert!(context.accumulated().is_empty());
        let pending: Vec<_> = context.pending().iter().map(|p| p.height()).collect();
        assert_eq!(pending, heights([0, 1, 2]));
    }

    #[tokio::test]
    async fn carried_run_is_skipped_even_above_threshold() {
        let mut fixture = Fixture::new(20);
        fixture.config.flush_threshold_bytes = NonZeroUsize::new(250).unwrap();
        let mut stalled =
            StepContext::initialize(fixture.chain.position_at(0), &fixture.chain).unwrap();
        for _ in 0..3 {
            stalled.resolve_front(Bytes::from(vec![2; 100]));
            stalled.extend_pending(&fixture.chain);
        }

        let mut context = StepContext::resume(
            fixture.chain.position_at(0),
            &fixture.chain,
            stalled.into_batch(),
        )
        .unwrap();
        let (_handle, cancel) = cancel_pair();
        fixture.execute(&mut context, &cancel).await;

        assert_eq!(context.accumulated().len(), 3);
        assert_eq!(context.accumulated_bytes(), 300);
        let pending: Vec<_> = context.pending().iter().map(|p| p.height()).collect();
        assert_eq!(pending, heights([3, 4, 5, 6]));
    }

    #[tokio::test]
    async fn cancelled_lookup_resolves_nothing() {
        let fixture = Fixture::new(10);
        fixture.make_local(0..10, 1);
        let (handle, cancel) = cancel_pair();
        handle.cancel();

        let mut context =
            StepContext::initialize(fixture.chain.position_at(0), &fixture.chain).unwrap();
        fixture.execute(&mut context, &cancel).await;

        assert!(context.accumulated().is_empty());
        let pending: Vec<_> = context.pending().iter().map(|p| p.height()).collect();
        assert_eq!(pending, heights([0]));
        assert!(!context.is_enabled(StepKind::FindBlocks));
    }
}
