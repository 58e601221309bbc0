//! # Batch Run Executor
//!
//! The run object that owns a plan of anchor tasks and drives them to
//! completion: wave formation under the overlap rule, per-anchor runner
//! tasks, the parent worker pool, dirty-leaf aggregation, and the run
//! lifecycle state machine.
//!
//! All state mutations funnel through a single serialization point (the run
//! lock). Spawned tasks do their work asynchronously and hand results back
//! through small methods on [`RunCore`]; every meaningful transition emits a
//! deep-copied snapshot to the observer and the broadcast channel.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use tokio::sync::{broadcast, watch, Notify};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::batch::dirty_parents::{CatchUpDecision, DirtyParentAggregator};
use crate::batch::parent_worker;
use crate::batch::plan::{build_plan, PlanBounds};
use crate::batch::runner::{run_anchor_attempts, AnchorOutcome};
use crate::batch::scheduler::{block_unreachable, propagate_blocked, select_wave};
use crate::batch::types::{
    Anchor, AnchorStatus, BatchRunState, Collaborators, CoverageBounds, GenerateProgress,
    ModelVariant, ParentJobStatus, ParentProgress, ParentRefreshJob, RunStatus, SchedulingMode,
    StateObserver, TileCoord, Wave,
};
use crate::config::BatchRunConfig;
use crate::error::{MuralError, Result};

/// Capacity of the snapshot broadcast channel; laggards drop old snapshots
const SNAPSHOT_CHANNEL_CAPACITY: usize = 256;

/// Everything needed to start a batch run.
///
/// Knobs inside `config` are clamped at start; see [`BatchRunConfig`].
pub struct BatchRunInput {
    /// Origin tile at leaf zoom; must lie inside the map for a nonempty plan
    pub origin_x: i64,
    pub origin_y: i64,
    /// Leaf zoom level, used as the child zoom of parent cascades
    pub z: u32,
    pub map_width: u32,
    pub map_height: u32,
    /// Fan-out radius in anchor steps, clamped to `[0, 256]`
    pub layers: i64,
    /// Generation prompt; must be non-empty after trimming
    pub prompt: String,
    /// Generator variant threaded into every execution attempt; review
    /// gates escalate upward from it on rejection
    pub model_variant: ModelVariant,
    pub config: BatchRunConfig,
    /// External cancellation; the run derives a child token from it
    pub signal: Option<CancellationToken>,
    pub on_state: Option<Arc<dyn StateObserver>>,
    pub execute_anchor: Option<Arc<dyn crate::batch::types::AnchorExecutor>>,
    pub refresh_parent_level: Option<Arc<dyn crate::batch::types::ParentRefresher>>,
}

impl Default for BatchRunInput {
    fn default() -> Self {
        Self {
            origin_x: 0,
            origin_y: 0,
            z: 0,
            map_width: 0,
            map_height: 0,
            layers: 0,
            prompt: String::new(),
            model_variant: ModelVariant::Standard,
            config: BatchRunConfig::default(),
            signal: None,
            on_state: None,
            execute_anchor: None,
            refresh_parent_level: None,
        }
    }
}

/// Caller-facing handle to a running batch
#[derive(Clone)]
pub struct BatchRunHandle {
    core: Arc<RunCore>,
    done_rx: watch::Receiver<Option<BatchRunState>>,
}

impl BatchRunHandle {
    pub fn run_id(&self) -> Uuid {
        self.core.run_id
    }

    /// Request cooperative cancellation. Idempotent.
    pub fn cancel(&self) {
        self.core.token.cancel();
    }

    /// Deep-copied snapshot of the current run state
    pub fn state(&self) -> BatchRunState {
        let state = self.core.state.lock().expect("run lock poisoned");
        self.core.snapshot(&state)
    }

    /// Wait for the run to finish and return the final state. Idempotent;
    /// any number of callers can wait concurrently.
    pub async fn wait(&self) -> BatchRunState {
        let mut rx = self.done_rx.clone();
        loop {
            if let Some(final_state) = rx.borrow().clone() {
                return final_state;
            }
            if rx.changed().await.is_err() {
                // Sender dropped without a final state; surface whatever the
                // run state holds now.
                return self.state();
            }
        }
    }

    /// Subscribe to the snapshot stream. Slow receivers skip snapshots but
    /// never see them out of order.
    pub fn subscribe(&self) -> broadcast::Receiver<BatchRunState> {
        self.core.snapshots.subscribe()
    }
}

/// Mutable run state, guarded by the run lock
pub(crate) struct RunState {
    status: RunStatus,
    anchors: HashMap<String, Anchor>,
    /// Ids currently RUNNING, pairwise non-conflicting by the overlap rule
    running: Vec<String>,
    waves: Vec<Wave>,
    /// Index into `waves` of the barrier wave still in flight
    open_wave: Option<usize>,
    parent_jobs: Vec<ParentRefreshJob>,
    aggregator: DirtyParentAggregator,
    generation_finished: bool,
    fatal_error: Option<String>,
}

/// Shared core of one batch run; all mutations go through `state`.
pub(crate) struct RunCore {
    pub(crate) run_id: Uuid,
    config: BatchRunConfig,
    origin: TileCoord,
    layers: u32,
    model_variant: ModelVariant,
    leaf_z: u32,
    map_width: u32,
    map_height: u32,
    priority_order: Vec<String>,
    coverage: Option<CoverageBounds>,
    collaborators: Collaborators,
    token: CancellationToken,
    state: Mutex<RunState>,
    observer: Option<Arc<dyn StateObserver>>,
    snapshots: broadcast::Sender<BatchRunState>,
    driver_notify: Notify,
    done_tx: watch::Sender<Option<BatchRunState>>,
}

/// Start a batch run and return its handle.
///
/// Must be called from within a Tokio runtime. Validation failures surface
/// as `Err` before anything is spawned; an empty plan (origin out of bounds)
/// yields a handle whose run is already COMPLETED.
pub fn start_batch_run(input: BatchRunInput) -> Result<BatchRunHandle> {
    if input.prompt.trim().is_empty() {
        return Err(MuralError::InvalidInput(
            "prompt must be non-empty".to_string(),
        ));
    }
    if input.map_width == 0 || input.map_height == 0 {
        return Err(MuralError::InvalidInput(format!(
            "map dimensions must be positive, got {}x{}",
            input.map_width, input.map_height
        )));
    }

    let config = input.config.clamped(input.z);
    let layers = input.layers.clamp(0, 256) as u32;
    let plan = build_plan(PlanBounds {
        origin_x: input.origin_x,
        origin_y: input.origin_y,
        layers,
        map_width: input.map_width,
        map_height: input.map_height,
    });

    let run_id = Uuid::new_v4();
    info!(
        run_id = %run_id,
        origin_x = input.origin_x,
        origin_y = input.origin_y,
        layers,
        anchor_count = plan.anchors.len(),
        max_parallel = config.max_parallel,
        scheduling_mode = %config.scheduling_mode,
        model_variant = %input.model_variant,
        prompt_len = input.prompt.trim().len(),
        "Starting batch run"
    );

    let token = match &input.signal {
        Some(signal) => signal.child_token(),
        None => CancellationToken::new(),
    };
    let (done_tx, done_rx) = watch::channel(None);
    let (snapshots, _) = broadcast::channel(SNAPSHOT_CHANNEL_CAPACITY);

    let aggregator = DirtyParentAggregator::new(
        config.parent_debounce_ms,
        config.parent_wave_batch_size,
        config.parent_leaf_batch_size,
        config.parent_cascade_depth,
        input.z,
    );

    let plan_is_empty = plan.is_empty();
    let core = Arc::new(RunCore {
        run_id,
        origin: TileCoord::new(
            input.origin_x.clamp(0, u32::MAX as i64) as u32,
            input.origin_y.clamp(0, u32::MAX as i64) as u32,
        ),
        layers,
        model_variant: input.model_variant,
        leaf_z: input.z,
        map_width: input.map_width,
        map_height: input.map_height,
        priority_order: plan.priority_order,
        coverage: plan.coverage,
        collaborators: Collaborators {
            execute_anchor: input.execute_anchor,
            refresh_parent_level: input.refresh_parent_level,
        },
        token,
        state: Mutex::new(RunState {
            status: RunStatus::Running,
            anchors: plan.anchors,
            running: Vec::new(),
            waves: Vec::new(),
            open_wave: None,
            parent_jobs: Vec::new(),
            aggregator,
            generation_finished: false,
            fatal_error: None,
        }),
        observer: input.on_state,
        snapshots,
        driver_notify: Notify::new(),
        done_tx,
        config,
    });

    if plan_is_empty {
        // Nothing to do: the run completes before it starts.
        let mut state = core.state.lock().expect("run lock poisoned");
        state.generation_finished = true;
        state.status = RunStatus::Completed;
        core.emit(&state);
        let final_state = core.snapshot(&state);
        drop(state);
        let _ = core.done_tx.send(Some(final_state));
        return Ok(BatchRunHandle { core, done_rx });
    }

    {
        let state = core.state.lock().expect("run lock poisoned");
        core.emit(&state);
    }

    tokio::spawn(drive(Arc::clone(&core)));
    Ok(BatchRunHandle { core, done_rx })
}

/// The owner task: forms waves, spawns runners and parent workers, and
/// finalizes the run.
async fn drive(core: Arc<RunCore>) {
    let mut workers = JoinSet::new();
    for worker_idx in 0..core.config.parent_worker_concurrency {
        workers.spawn(parent_worker::run_worker(Arc::clone(&core), worker_idx));
    }

    let mut runners = JoinSet::new();
    loop {
        if core.token.is_cancelled() {
            break;
        }

        let started = core.start_ready_anchors();
        let started_any = !started.is_empty();
        for anchor in started {
            match core.collaborators.execute_anchor.clone() {
                Some(executor) => {
                    let core = Arc::clone(&core);
                    runners.spawn(async move {
                        let anchor_id = anchor.id.clone();
                        let attempt_core = Arc::clone(&core);
                        let attempt_id = anchor_id.clone();
                        let outcome = run_anchor_attempts(
                            executor,
                            anchor,
                            core.config.max_generate_retries,
                            core.model_variant,
                            core.token.clone(),
                            move |attempt| attempt_core.note_attempt(&attempt_id, attempt),
                        )
                        .await;
                        core.on_anchor_finished(&anchor_id, outcome);
                    });
                }
                None => {
                    error!(
                        run_id = %core.run_id,
                        "execute_anchor collaborator not provided, failing run"
                    );
                    core.set_fatal("execute_anchor collaborator not provided".to_string());
                    core.token.cancel();
                    break;
                }
            }
        }

        let (pending, in_flight) = core.generation_counts();
        if pending == 0 && in_flight == 0 {
            break;
        }
        if !started_any && in_flight == 0 && pending > 0 {
            // Every remaining pending anchor is unreachable; the eager
            // propagation path should have caught this already.
            core.force_block_stalled();
            continue;
        }

        tokio::select! {
            _ = core.driver_notify.notified() => {}
            _ = core.token.cancelled() => {}
        }
    }

    // Drain in-flight runners; on cancellation they abort promptly.
    while runners.join_next().await.is_some() {}

    core.finish_generation();
    while workers.join_next().await.is_some() {}
    core.finalize();
}

impl RunCore {
    pub(crate) fn cancel_token(&self) -> &CancellationToken {
        &self.token
    }

    pub(crate) fn collaborators(&self) -> &Collaborators {
        &self.collaborators
    }

    /// Assemble a deep-copied snapshot of the run state
    fn snapshot(&self, state: &RunState) -> BatchRunState {
        let mut generate = GenerateProgress {
            total: state.anchors.len(),
            ..GenerateProgress::default()
        };
        for anchor in state.anchors.values() {
            match anchor.status {
                AnchorStatus::Pending => generate.pending += 1,
                AnchorStatus::Running => generate.running += 1,
                AnchorStatus::Success => generate.succeeded += 1,
                AnchorStatus::Failed => generate.failed += 1,
                AnchorStatus::Blocked => generate.blocked += 1,
            }
        }
        generate.waves_completed = state.waves.iter().filter(|w| w.is_finished()).count();

        let mut parents = ParentProgress {
            total: state.parent_jobs.len(),
            ..ParentProgress::default()
        };
        for job in &state.parent_jobs {
            match job.status {
                ParentJobStatus::Queued => parents.queued += 1,
                ParentJobStatus::Running => {
                    parents.running += 1;
                    parents.current_level_z = match (parents.current_level_z, job.current_level)
                    {
                        (Some(a), Some(b)) => Some(a.min(b)),
                        (a, b) => a.or(b),
                    };
                }
                ParentJobStatus::Success => parents.succeeded += 1,
                ParentJobStatus::Failed => parents.failed += 1,
            }
        }

        BatchRunState {
            run_id: self.run_id,
            status: state.status,
            origin: self.origin,
            layers: self.layers,
            max_parallel: self.config.max_parallel,
            anchors: state.anchors.clone(),
            waves: state.waves.clone(),
            parent_jobs: state.parent_jobs.clone(),
            generate,
            parents,
            coverage: self.coverage,
            // Anchor errors stay on their anchors; only a fatal parent or
            // configuration failure is the run's error.
            error: state.fatal_error.clone(),
        }
    }

    /// Publish the current state to the observer and the broadcast channel.
    ///
    /// Called at the serialization point so the snapshot sequence is totally
    /// ordered.
    fn emit(&self, state: &RunState) {
        let snapshot = self.snapshot(state);
        if let Some(observer) = &self.observer {
            observer.on_state(snapshot.clone());
        }
        let _ = self.snapshots.send(snapshot);
    }

    /// Form and start the next overlap-safe set of anchors.
    ///
    /// In `wave_barrier` mode nothing starts while a wave is in flight; in
    /// `rolling_fill` mode anchors start whenever slots free up. Returns the
    /// started anchors, cloned for their runner tasks.
    fn start_ready_anchors(&self) -> Vec<Anchor> {
        let mut state = self.state.lock().expect("run lock poisoned");
        if state.status != RunStatus::Running || state.fatal_error.is_some() {
            return Vec::new();
        }

        let capacity = match self.config.scheduling_mode {
            SchedulingMode::WaveBarrier => {
                if state.running.is_empty() {
                    self.config.max_parallel
                } else {
                    0
                }
            }
            SchedulingMode::RollingFill => self
                .config
                .max_parallel
                .saturating_sub(state.running.len()),
        };
        let picked = select_wave(&state.anchors, &self.priority_order, &state.running, capacity);
        if picked.is_empty() {
            return Vec::new();
        }

        let now = Utc::now();
        let wave_index = match self.config.scheduling_mode {
            SchedulingMode::WaveBarrier => {
                let index = state.waves.len() as u32 + 1;
                state.waves.push(Wave {
                    index,
                    task_ids: picked.clone(),
                    success_ids: Vec::new(),
                    failed_ids: Vec::new(),
                    blocked_ids: Vec::new(),
                    started_at: now,
                    finished_at: None,
                });
                state.open_wave = Some(state.waves.len() - 1);
                info!(
                    run_id = %self.run_id,
                    wave = index,
                    anchors = ?picked,
                    "Starting wave"
                );
                Some(index)
            }
            SchedulingMode::RollingFill => {
                debug!(run_id = %self.run_id, anchors = ?picked, "Starting anchors");
                None
            }
        };

        let mut started = Vec::with_capacity(picked.len());
        for id in picked {
            let anchor = state.anchors.get_mut(&id).expect("picked anchor exists");
            anchor.status = AnchorStatus::Running;
            anchor.started_at = Some(now);
            anchor.wave_index = wave_index;
            let anchor_clone = anchor.clone();
            state.running.push(id);
            started.push(anchor_clone);
        }
        self.emit(&state);
        started
    }

    /// Keep the anchor's attempt counter observable mid-run
    pub(crate) fn note_attempt(&self, anchor_id: &str, attempt: u32) {
        let mut state = self.state.lock().expect("run lock poisoned");
        if let Some(anchor) = state.anchors.get_mut(anchor_id) {
            anchor.attempts = attempt;
            self.emit(&state);
        }
    }

    /// Record a runner's terminal outcome and update wave and aggregator
    /// bookkeeping.
    pub(crate) fn on_anchor_finished(&self, anchor_id: &str, outcome: AnchorOutcome) {
        let mut state = self.state.lock().expect("run lock poisoned");
        state.running.retain(|id| id != anchor_id);
        let now = Utc::now();

        if !state.anchors.contains_key(anchor_id) {
            // Unknown anchor id is a programming error, fatal to the run.
            state.fatal_error.get_or_insert_with(|| {
                format!("unknown anchor id in completion: {anchor_id}")
            });
            self.emit(&state);
            drop(state);
            self.token.cancel();
            self.driver_notify.notify_one();
            return;
        }

        let newly_blocked = match &outcome {
            AnchorOutcome::Success { attempts } => {
                let anchor = state.anchors.get_mut(anchor_id).expect("anchor present");
                anchor.status = AnchorStatus::Success;
                anchor.attempts = *attempts;
                anchor.finished_at = Some(now);
                let footprint = anchor.footprint(self.map_width, self.map_height);
                state.aggregator.mark_footprint(footprint);
                Vec::new()
            }
            AnchorOutcome::Failed { attempts, error } => {
                let anchor = state.anchors.get_mut(anchor_id).expect("anchor present");
                anchor.status = AnchorStatus::Failed;
                anchor.attempts = *attempts;
                anchor.finished_at = Some(now);
                anchor.error = Some(error.clone());
                propagate_blocked(&mut state.anchors, anchor_id)
            }
            AnchorOutcome::Cancelled => {
                // Frozen as-is; the run is on its way to CANCELLED.
                self.emit(&state);
                drop(state);
                self.driver_notify.notify_one();
                return;
            }
        };

        match self.config.scheduling_mode {
            SchedulingMode::WaveBarrier => {
                if let Some(wave_pos) = state.open_wave {
                    let wave_done = state.running.is_empty();
                    let wave = &mut state.waves[wave_pos];
                    match &outcome {
                        AnchorOutcome::Success { .. } => {
                            wave.success_ids.push(anchor_id.to_string())
                        }
                        AnchorOutcome::Failed { .. } => wave.failed_ids.push(anchor_id.to_string()),
                        AnchorOutcome::Cancelled => {}
                    }
                    wave.blocked_ids.extend(newly_blocked);
                    if wave_done {
                        wave.finished_at = Some(now);
                        let had_success = !wave.success_ids.is_empty();
                        info!(
                            run_id = %self.run_id,
                            wave = wave.index,
                            succeeded = wave.success_ids.len(),
                            failed = wave.failed_ids.len(),
                            "Wave finished"
                        );
                        state.open_wave = None;
                        if had_success {
                            state.aggregator.note_wave_success();
                        }
                    }
                }
            }
            SchedulingMode::RollingFill => {
                // Each completion records its own single-anchor wave.
                let index = state.waves.len() as u32 + 1;
                let succeeded = matches!(outcome, AnchorOutcome::Success { .. });
                state.waves.push(Wave {
                    index,
                    task_ids: vec![anchor_id.to_string()],
                    success_ids: if succeeded {
                        vec![anchor_id.to_string()]
                    } else {
                        Vec::new()
                    },
                    failed_ids: if succeeded {
                        Vec::new()
                    } else {
                        vec![anchor_id.to_string()]
                    },
                    blocked_ids: newly_blocked,
                    started_at: now,
                    finished_at: Some(now),
                });
                if let Some(anchor) = state.anchors.get_mut(anchor_id) {
                    anchor.wave_index = Some(index);
                }
                if succeeded {
                    state.aggregator.note_wave_success();
                }
            }
        }

        self.flush_if_due(&mut state);
        self.emit(&state);
        drop(state);
        self.driver_notify.notify_one();
    }

    /// (pending, running) anchor counts
    fn generation_counts(&self) -> (usize, usize) {
        let state = self.state.lock().expect("run lock poisoned");
        let pending = state
            .anchors
            .values()
            .filter(|a| a.status == AnchorStatus::Pending)
            .count();
        (pending, state.running.len())
    }

    /// Safety net: force-block pending anchors with unreachable deps
    fn force_block_stalled(&self) {
        let mut state = self.state.lock().expect("run lock poisoned");
        let blocked = block_unreachable(&mut state.anchors);
        if blocked.is_empty() {
            // Nothing to block yet the driver is stalled; bail out of the
            // generation phase rather than spin.
            warn!(run_id = %self.run_id, "Generation stalled with no blockable anchors");
            for anchor in state.anchors.values_mut() {
                if anchor.status == AnchorStatus::Pending {
                    anchor.status = AnchorStatus::Blocked;
                }
            }
        }
        self.emit(&state);
    }

    /// Close out the generation phase: flush leftovers and move to
    /// COMPLETING unless the run is already being torn down.
    fn finish_generation(&self) {
        let mut state = self.state.lock().expect("run lock poisoned");
        state.generation_finished = true;
        if self.token.is_cancelled() || state.fatal_error.is_some() {
            return;
        }
        self.flush_if_due(&mut state);
        if state.status == RunStatus::Running {
            state.status = RunStatus::Completing;
            info!(run_id = %self.run_id, "Generation finished, draining parent jobs");
            self.emit(&state);
        }
    }

    /// Resolve the final status, emit the last snapshot, and settle `wait`.
    fn finalize(&self) {
        let mut state = self.state.lock().expect("run lock poisoned");
        state.status = if let Some(fatal) = &state.fatal_error {
            error!(run_id = %self.run_id, error = %fatal, "Batch run failed");
            RunStatus::Failed
        } else if self.token.is_cancelled() {
            info!(run_id = %self.run_id, "Batch run cancelled");
            RunStatus::Cancelled
        } else {
            info!(run_id = %self.run_id, "Batch run completed");
            RunStatus::Completed
        };
        self.emit(&state);
        let final_state = self.snapshot(&state);
        drop(state);
        let _ = self.done_tx.send(Some(final_state));
    }

    pub(crate) fn set_fatal(&self, message: String) {
        let mut state = self.state.lock().expect("run lock poisoned");
        if state.fatal_error.is_none() {
            state.fatal_error = Some(message);
            self.emit(&state);
        }
    }

    /// Enqueue a parent job if any flush policy fires
    fn flush_if_due(&self, state: &mut RunState) {
        let generation_finished = state.generation_finished;
        if !state
            .aggregator
            .should_flush(tokio::time::Instant::now(), generation_finished)
        {
            return;
        }
        if let Some(tiles) = state.aggregator.take_flush() {
            self.enqueue_parent_job(state, tiles, self.config.parent_cascade_depth, false);
        }
    }

    fn enqueue_parent_job(
        &self,
        state: &mut RunState,
        tiles: Vec<TileCoord>,
        max_levels: u32,
        is_catch_up: bool,
    ) {
        let index = state.parent_jobs.len() as u32;
        info!(
            run_id = %self.run_id,
            job_index = index,
            leaf_count = tiles.len(),
            max_levels,
            is_catch_up,
            "Queueing parent refresh job"
        );
        state.parent_jobs.push(ParentRefreshJob {
            index,
            child_z: self.leaf_z,
            tiles,
            max_levels,
            status: ParentJobStatus::Queued,
            attempts: 0,
            current_level: None,
            is_catch_up,
            error: None,
        });
    }

    /// Claim the oldest queued parent job; returns its index
    pub(crate) fn claim_parent_job(&self) -> Option<u32> {
        let mut state = self.state.lock().expect("run lock poisoned");
        let job = state
            .parent_jobs
            .iter_mut()
            .find(|job| job.status == ParentJobStatus::Queued)?;
        job.status = ParentJobStatus::Running;
        job.attempts = 1;
        job.current_level = Some(job.child_z);
        let index = job.index;
        self.emit(&state);
        Some(index)
    }

    /// Work description for a claimed job: (child_z, tiles, max_levels,
    /// max_attempts)
    pub(crate) fn parent_job_work(&self, job_index: u32) -> (u32, Vec<TileCoord>, u32, u32) {
        let state = self.state.lock().expect("run lock poisoned");
        let job = &state.parent_jobs[job_index as usize];
        (
            job.child_z,
            job.tiles.clone(),
            job.max_levels,
            self.config.parent_job_retries + 1,
        )
    }

    pub(crate) fn set_parent_job_level(&self, job_index: u32, level: u32) {
        let mut state = self.state.lock().expect("run lock poisoned");
        state.parent_jobs[job_index as usize].current_level = Some(level);
        self.emit(&state);
    }

    pub(crate) fn set_parent_job_attempts(&self, job_index: u32, attempts: u32) {
        let mut state = self.state.lock().expect("run lock poisoned");
        state.parent_jobs[job_index as usize].attempts = attempts;
        self.emit(&state);
    }

    pub(crate) fn finish_parent_job(
        &self,
        job_index: u32,
        result: std::result::Result<(), String>,
    ) {
        let mut state = self.state.lock().expect("run lock poisoned");
        let job = &mut state.parent_jobs[job_index as usize];
        job.current_level = None;
        match result {
            Ok(()) => {
                job.status = ParentJobStatus::Success;
                debug!(run_id = %self.run_id, job_index, "Parent job finished");
            }
            Err(message) => {
                job.status = ParentJobStatus::Failed;
                job.error = Some(message);
            }
        }
        self.emit(&state);
    }

    /// Give the aggregator a chance to flush on its debounce window
    pub(crate) fn poll_parent_flush(&self) {
        let mut state = self.state.lock().expect("run lock poisoned");
        let before = state.parent_jobs.len();
        self.flush_if_due(&mut state);
        if state.parent_jobs.len() != before {
            self.emit(&state);
        }
    }

    /// Emit the final catch-up job once generation is done and the queue has
    /// drained
    pub(crate) fn try_emit_catch_up(&self) {
        let mut state = self.state.lock().expect("run lock poisoned");
        let queue_idle = state
            .parent_jobs
            .iter()
            .all(|job| job.status.is_terminal());
        let generation_finished = state.generation_finished;
        match state
            .aggregator
            .take_catch_up(generation_finished, queue_idle)
        {
            CatchUpDecision::Emit(tiles) => {
                self.enqueue_parent_job(&mut state, tiles, self.leaf_z, true);
                self.emit(&state);
            }
            CatchUpDecision::Skipped | CatchUpDecision::NotYet => {}
        }
    }

    /// Whether the parent phase has fully drained and workers may exit
    pub(crate) fn parent_phase_done(&self) -> bool {
        let state = self.state.lock().expect("run lock poisoned");
        state.generation_finished
            && state.aggregator.catch_up_settled()
            && state.aggregator.dirty_len() == 0
            && state
                .parent_jobs
                .iter()
                .all(|job| job.status.is_terminal())
    }
}
