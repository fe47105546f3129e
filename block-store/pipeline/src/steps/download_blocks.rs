use tracing::{debug, info, trace, warn};

use super::{StallReason, StepEnv, StepKind, StepResult};
use crate::{
    adapter::{BlockFetcher, BlockRepository, ChainView, LocalBlocks},
    block::{ChainPosition, Payload},
    context::StepContext,
    LOG_TARGET,
};

/// Downloads every pending position, flushing the batch to the repository
/// each time it reaches the flush threshold.
///
/// Each round asks peers for the whole pending window at once and waits at
/// most `request_timeout`. Blocks join the batch strictly in chain order. A
/// round that brings nothing new counts as a stall; once the stall count
/// exceeds the budget the pass gives up with everything gathered so far left
/// in the context. When nothing is pending the remaining batch is flushed and
/// the step disables itself.
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
    let budget = env.config.stall_budget.get();

    loop {
        while context.accept_next_stashed() {
            if context.accumulated_bytes() >= threshold {
                if let Err(error) = context.flush(env.repository).await {
                    warn!(
                        target: LOG_TARGET,
                        %error,
                        unflushed = context.accumulated().len(),
                        "Failed to flush block batch, keeping it for the next attempt"
                    );
                }
            }
        }
        if context.pending().is_empty() {
            break;
        }

        // Blocks already waiting for a predecessor are not asked for again.
        let request: Vec<ChainPosition> = context
            .pending()
            .iter()
            .filter(|position| !context.accumulated().is_waiting(position))
            .take(env.config.max_request_size.get())
            .copied()
            .collect();
        trace!(
            target: LOG_TARGET,
            from = request.first().map(ChainPosition::height),
            count = request.len(),
            "Requesting blocks"
        );

        let response = tokio::select! {
            biased;
            () = env.cancel.cancelled() => {
                info!(target: LOG_TARGET, "Download cancelled");
                return StepResult::Cancelled;
            }
            response = tokio::time::timeout(
                env.config.request_timeout,
                env.fetcher.fetch_batch(&request, env.cancel.clone()),
            ) => response,
        };

        let received = match response {
            Ok(Ok(blocks)) => context.stash_received(blocks),
            Ok(Err(error)) => {
                debug!(target: LOG_TARGET, %error, "Block request failed");
                0
            }
            Err(_elapsed) => {
                debug!(target: LOG_TARGET, "Block request timed out");
                0
            }
        };

        if received == 0 {
            let stalls = context.record_stall();
            debug!(target: LOG_TARGET, stalls, budget, "No download progress");
            if stalls > budget {
                warn!(
                    target: LOG_TARGET,
                    stalls,
                    pending = context.pending().len(),
                    unflushed = context.accumulated().len(),
                    waiting = context.accumulated().waiting(),
                    "Download stalled"
                );
                return StepResult::Stall(StallReason::Network);
            }
        }
    }

    if let Err(error) = context.flush(env.repository).await {
        warn!(
            target: LOG_TARGET,
            %error,
            unflushed = context.accumulated().len(),
            "Failed to flush final block batch"
        );
        return StepResult::Stall(StallReason::Storage);
    }

    context.disable(StepKind::DownloadBlocks);
    StepResult::Continue
}
