//! # Batch Anchor Scheduler
//!
//! Engine for large, dependency-ordered edits over a 2D tile grid. A run
//! expands an origin tile into a set of overlapping 3x3 anchor edits,
//! executes them center-outward in overlap-safe waves, and asynchronously
//! rebuilds the pyramid of coarser parent tiles as leaves change.
//!
//! ## Core Components
//!
//! - **Planner** ([`plan`]): pure expansion of origin + fan-out radius into
//!   the anchor set, its dependency tree, and a deterministic priority order
//! - **Anchor Scheduler** ([`scheduler`]): readiness, overlap-safe wave
//!   selection under the parallelism cap, and BLOCKED propagation
//! - **Anchor Runner** ([`runner`]): per-anchor retry with exponential
//!   backoff, `retry_after` hints, and prompt cancellation
//! - **Review Queue** ([`review_queue`]): optional single-consumer FIFO gate
//!   between preview generation and acceptance
//! - **Dirty-Parent Aggregator** ([`dirty_parents`]): tracks rewritten
//!   leaves and decides when to emit parent refresh batches
//! - **Parent Worker Pool** ([`parent_worker`]): drains parent jobs,
//!   cascading refreshes upward zoom-by-zoom; hard failures fail the run
//! - **Executor** ([`executor`]): the run object tying it all together and
//!   publishing deep-copied state snapshots after every transition
//!
//! The scheduler owns no I/O: generation and parent refreshing happen behind
//! the [`types::AnchorExecutor`] and [`types::ParentRefresher`] seams, which
//! keeps the whole engine hermetically testable.

pub mod dirty_parents;
pub mod executor;
pub mod parent_worker;
pub mod plan;
pub mod review_queue;
pub mod runner;
pub mod scheduler;
pub mod types;

pub use dirty_parents::{CatchUpDecision, DirtyParentAggregator};
pub use executor::{start_batch_run, BatchRunHandle, BatchRunInput};
pub use plan::{build_plan, BatchPlan, PlanBounds};
pub use review_queue::{
    PreviewExecutor, PreviewHandle, ReviewDecision, ReviewQueue, ReviewRequest,
    ReviewedAnchorExecutor,
};
pub use runner::{backoff_delay, AnchorOutcome};
pub use scheduler::{conflicts, is_ready, select_wave};
pub use types::{
    clipped_footprint, Anchor, AnchorAttempt, AnchorExecutor, AnchorPriority, AnchorStatus,
    BatchRunState, Collaborators, CoverageBounds, GenerateProgress, ModelVariant,
    ParentJobStatus, ParentProgress, ParentRefreshJob, ParentRefreshRequest, ParentRefresher,
    RunStatus, SchedulingMode, StateObserver, TileCoord, Wave,
};
