//! In-memory controller state
//!
//! - [`SharedState`]: node slots, pod/claim index and per-volume indexes
//! - [`OperationQueues`]: per-resource FIFO of pending transitions with a single holder
//! - [`RetryTracker`]: consecutive failures and capped exponential backoff

pub mod operation_queue;
pub mod retry;
pub mod shared_state;

pub use operation_queue::{
    OperationKind, OperationQueues, OperationRequest, QueueStatsSnapshot,
};
pub use retry::{BackoffPolicy, RetryDecision, RetryRecord, RetryTracker};
pub use shared_state::{NodeSlots, SharedState};
