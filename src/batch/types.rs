//! # Batch Scheduler Types
//!
//! Core types shared across the batch scheduler: anchors and their lifecycle
//! statuses, wave records, parent refresh jobs, run snapshots, progress
//! aggregates, and the collaborator seams the scheduler depends on.
//!
//! Everything externally visible derives `Serialize`/`Deserialize` so
//! snapshots can be shipped over any surface without translation.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::{AnchorExecutionError, ParentRefreshError};

/// A single leaf tile position at the finest zoom level
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct TileCoord {
    pub x: u32,
    pub y: u32,
}

impl TileCoord {
    pub fn new(x: u32, y: u32) -> Self {
        Self { x, y }
    }
}

impl fmt::Display for TileCoord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.x, self.y)
    }
}

/// The 3x3 footprint of an anchor centered at `(x, y)`, clipped to the map.
///
/// Tiles are returned in row-major order, deduplicated by construction.
pub fn clipped_footprint(x: u32, y: u32, map_width: u32, map_height: u32) -> Vec<TileCoord> {
    let mut tiles = Vec::with_capacity(9);
    for dy in -1i64..=1 {
        for dx in -1i64..=1 {
            let tx = x as i64 + dx;
            let ty = y as i64 + dy;
            if tx >= 0 && ty >= 0 && (tx as u32) < map_width && (ty as u32) < map_height {
                tiles.push(TileCoord::new(tx as u32, ty as u32));
            }
        }
    }
    tiles
}

/// Lifecycle status of a single anchor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnchorStatus {
    /// Waiting for its dependency and a free slot
    Pending,
    /// An execution attempt is in flight
    Running,
    /// Generation committed
    Success,
    /// All attempts exhausted
    Failed,
    /// An ancestor failed; this anchor will never run
    Blocked,
}

impl AnchorStatus {
    /// Check if this is a terminal status (no further transitions allowed)
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Failed | Self::Blocked)
    }
}

impl fmt::Display for AnchorStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Success => write!(f, "success"),
            Self::Failed => write!(f, "failed"),
            Self::Blocked => write!(f, "blocked"),
        }
    }
}

impl std::str::FromStr for AnchorStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "success" => Ok(Self::Success),
            "failed" => Ok(Self::Failed),
            "blocked" => Ok(Self::Blocked),
            _ => Err(format!("invalid anchor status: {s}")),
        }
    }
}

/// Deterministic scheduling priority, lexicographic (smaller runs earlier).
///
/// `bucket`: 0 origin, 1 axis-X, 2 axis-Y, 3 interior. `quadrant_order` for
/// interior anchors: NE=0, NW=1, SE=2, SW=3; axes and origin use sentinel 4.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnchorPriority {
    pub distance: u32,
    pub bucket: u8,
    pub quadrant_order: u8,
}

/// One 3x3 edit centered on a leaf tile; the unit of scheduling.
///
/// Identified by its local offset `(u, v)` from the run origin, with
/// `(x, y) = (origin_x + 2u, origin_y + 2v)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Anchor {
    /// Stable identifier, formatted `"u:{u},v:{v}"`
    pub id: String,
    pub u: i32,
    pub v: i32,
    /// Center tile at leaf zoom
    pub x: u32,
    pub y: u32,
    /// Ids this anchor waits for (at most one: the next step toward origin)
    pub depends_on: Vec<String>,
    /// Reverse edges, for O(1) blocked propagation
    pub dependents: Vec<String>,
    pub priority: AnchorPriority,
    pub status: AnchorStatus,
    pub attempts: u32,
    pub wave_index: Option<u32>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Id of the failed ancestor that blocked this anchor
    pub blocked_by: Option<String>,
    pub error: Option<String>,
}

impl Anchor {
    /// Format the stable anchor id for an `(u, v)` offset
    pub fn format_id(u: i32, v: i32) -> String {
        format!("u:{u},v:{v}")
    }

    /// The anchor's 3x3 footprint clipped to the map bounds
    pub fn footprint(&self, map_width: u32, map_height: u32) -> Vec<TileCoord> {
        clipped_footprint(self.x, self.y, map_width, map_height)
    }
}

/// Wave formation strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulingMode {
    /// Start a wave, wait for every member, then form the next
    WaveBarrier,
    /// Start a new anchor whenever a slot frees; each completion records its
    /// own single-anchor wave
    RollingFill,
}

impl fmt::Display for SchedulingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::WaveBarrier => write!(f, "wave_barrier"),
            Self::RollingFill => write!(f, "rolling_fill"),
        }
    }
}

impl std::str::FromStr for SchedulingMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "wave_barrier" => Ok(Self::WaveBarrier),
            "rolling_fill" => Ok(Self::RollingFill),
            _ => Err(format!("invalid scheduling mode: {s}")),
        }
    }
}

/// Generator model variant, escalated on review rejection
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelVariant {
    #[default]
    Standard,
    Pro,
    FlashPreview,
}

impl ModelVariant {
    /// The next stronger variant; `Pro` is the ceiling.
    pub fn escalate(&self) -> Self {
        match self {
            Self::FlashPreview => Self::Standard,
            Self::Standard => Self::Pro,
            Self::Pro => Self::Pro,
        }
    }
}

impl fmt::Display for ModelVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Standard => write!(f, "standard"),
            Self::Pro => write!(f, "pro"),
            Self::FlashPreview => write!(f, "flash_preview"),
        }
    }
}

impl std::str::FromStr for ModelVariant {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "standard" => Ok(Self::Standard),
            "pro" => Ok(Self::Pro),
            "flash_preview" => Ok(Self::FlashPreview),
            _ => Err(format!("invalid model variant: {s}")),
        }
    }
}

/// Record of anchors started together and their outcomes.
///
/// Indices are monotonically increasing from 1. In `rolling_fill` mode each
/// completion event records its own single-anchor wave.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Wave {
    pub index: u32,
    pub task_ids: Vec<String>,
    pub success_ids: Vec<String>,
    pub failed_ids: Vec<String>,
    /// Anchors newly blocked by this wave's failures
    pub blocked_ids: Vec<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Wave {
    pub fn is_finished(&self) -> bool {
        self.finished_at.is_some()
    }
}

/// Lifecycle status of a parent refresh job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParentJobStatus {
    Queued,
    Running,
    Success,
    Failed,
}

impl ParentJobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Failed)
    }
}

impl fmt::Display for ParentJobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Queued => write!(f, "queued"),
            Self::Running => write!(f, "running"),
            Self::Success => write!(f, "success"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

impl std::str::FromStr for ParentJobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "running" => Ok(Self::Running),
            "success" => Ok(Self::Success),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("invalid parent job status: {s}")),
        }
    }
}

/// A unit of parent pyramid rebuild: a set of leaf tiles whose ancestors are
/// refreshed upward one zoom level at a time, up to `max_levels`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParentRefreshJob {
    pub index: u32,
    pub child_z: u32,
    pub tiles: Vec<TileCoord>,
    pub max_levels: u32,
    pub status: ParentJobStatus,
    pub attempts: u32,
    /// Zoom level currently being collapsed, while running
    pub current_level: Option<u32>,
    /// True for the once-per-run catch-up job emitted after generation ends
    pub is_catch_up: bool,
    pub error: Option<String>,
}

/// Overall run status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Idle,
    Running,
    /// Generation done; parent jobs still draining
    Completing,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Running => write!(f, "running"),
            Self::Completing => write!(f, "completing"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl std::str::FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "idle" => Ok(Self::Idle),
            "running" => Ok(Self::Running),
            "completing" => Ok(Self::Completing),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            _ => Err(format!("invalid run status: {s}")),
        }
    }
}

/// Anchor totals by status, plus completed wave count
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerateProgress {
    pub total: usize,
    pub pending: usize,
    pub running: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub blocked: usize,
    pub waves_completed: usize,
}

/// Parent job totals by status
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParentProgress {
    pub total: usize,
    pub queued: usize,
    pub running: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// `min` of the running jobs' current levels, if any job is running
    pub current_level_z: Option<u32>,
}

/// Min/max tile bounds over every anchor footprint, clipped to the map
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoverageBounds {
    pub min_x: u32,
    pub min_y: u32,
    pub max_x: u32,
    pub max_y: u32,
}

/// Immutable snapshot of the full run state.
///
/// Snapshots are deep copies; observers can hold or mutate them freely
/// without touching scheduler internals.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchRunState {
    pub run_id: uuid::Uuid,
    pub status: RunStatus,
    pub origin: TileCoord,
    pub layers: u32,
    pub max_parallel: usize,
    pub anchors: HashMap<String, Anchor>,
    pub waves: Vec<Wave>,
    pub parent_jobs: Vec<ParentRefreshJob>,
    pub generate: GenerateProgress,
    pub parents: ParentProgress,
    pub coverage: Option<CoverageBounds>,
    pub error: Option<String>,
}

impl BatchRunState {
    /// Ids of anchors that finished in a failure state
    pub fn failed_anchor_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .anchors
            .values()
            .filter(|a| a.status == AnchorStatus::Failed)
            .map(|a| a.id.clone())
            .collect();
        ids.sort();
        ids
    }
}

/// Context handed to each anchor execution attempt
#[derive(Debug, Clone)]
pub struct AnchorAttempt {
    /// 1-based attempt number
    pub attempt: u32,
    /// Generator variant the run was started with
    pub model_variant: ModelVariant,
    /// Cancellation signal the collaborator must honor
    pub signal: CancellationToken,
}

/// One step of a parent cascade: collapse `child_tiles` at `child_z` into
/// their parents at `child_z - 1`.
#[derive(Debug, Clone)]
pub struct ParentRefreshRequest {
    pub child_z: u32,
    pub child_tiles: Vec<TileCoord>,
    pub signal: CancellationToken,
}

/// Collaborator that generates one 3x3 anchor edit.
///
/// Implementations must be idempotent per `(anchor.id, attempt)` and must
/// honor `ctx.signal`.
#[async_trait]
pub trait AnchorExecutor: Send + Sync {
    async fn execute_anchor(
        &self,
        anchor: &Anchor,
        ctx: &AnchorAttempt,
    ) -> Result<(), AnchorExecutionError>;
}

/// Collaborator that collapses child tiles into parents for one zoom level.
///
/// Returns the deduplicated set of parent tiles produced; an empty result
/// terminates the cascade. Must be idempotent and honor `request.signal`.
#[async_trait]
pub trait ParentRefresher: Send + Sync {
    async fn refresh_parent_level(
        &self,
        request: ParentRefreshRequest,
    ) -> Result<Vec<TileCoord>, ParentRefreshError>;
}

/// Observer of run state snapshots.
///
/// Invoked synchronously at the scheduler's serialization point after every
/// meaningful transition. Keep it fast and do not call back into the run
/// handle from inside `on_state`.
pub trait StateObserver: Send + Sync {
    fn on_state(&self, snapshot: BatchRunState);
}

/// Blanket impl so plain closures can observe state
impl<F> StateObserver for F
where
    F: Fn(BatchRunState) + Send + Sync,
{
    fn on_state(&self, snapshot: BatchRunState) {
        self(snapshot)
    }
}

/// Shared handles to the two collaborators a run needs
#[derive(Clone, Default)]
pub struct Collaborators {
    pub execute_anchor: Option<Arc<dyn AnchorExecutor>>,
    pub refresh_parent_level: Option<Arc<dyn ParentRefresher>>,
}
