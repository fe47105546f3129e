//! Block acquisition for the block store: walks the accepted header chain,
//! resolves every block either locally or from peers, and writes them to the
//! repository in size-bounded atomic batches.

pub mod acquisition;
pub mod adapter;
pub mod block;
pub mod cancel;
pub mod config;
pub mod context;
pub mod errors;
#[cfg(any(test, feature = "mock"))]
pub mod mock;
pub mod steps;

pub use acquisition::{AcquisitionLoop, PassOutcome};
pub use adapter::{BlockFetcher, BlockRepository, ChainView, LocalBlocks};
pub use block::{BlockUnit, ChainPosition, HeaderId, Payload};
pub use cancel::{cancel_pair, CancelHandle, CancelSignal};
pub use config::{BackoffConfig, Config};
pub use context::{Batch, StepContext};
pub use errors::{Error, NetworkError};
pub use steps::{StallReason, StepKind, StepResult};

pub(crate) const LOG_TARGET: &str = "block_store::pipeline";
