//! Shared test doubles for batch run integration tests.

#![allow(dead_code)]

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;

use mural_core::batch::types::{
    Anchor, AnchorAttempt, AnchorExecutor, BatchRunState, ModelVariant, ParentRefreshRequest,
    ParentRefresher, StateObserver, TileCoord,
};
use mural_core::error::{AnchorExecutionError, ParentRefreshError};
use mural_core::BatchRunInput;

/// Executor that succeeds immediately and records every call
#[derive(Default)]
pub struct CountingExecutor {
    pub calls: Mutex<Vec<(String, u32)>>,
    /// Model variant observed on each attempt context
    pub variants: Mutex<Vec<ModelVariant>>,
    /// Anchor ids whose every attempt fails
    pub fail_ids: HashSet<String>,
}

impl CountingExecutor {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn failing(ids: impl IntoIterator<Item = &'static str>) -> Arc<Self> {
        Arc::new(Self {
            fail_ids: ids.into_iter().map(str::to_string).collect(),
            ..Self::default()
        })
    }

    pub fn started_ids(&self) -> Vec<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub fn variants_seen(&self) -> Vec<ModelVariant> {
        self.variants.lock().unwrap().clone()
    }
}

#[async_trait]
impl AnchorExecutor for CountingExecutor {
    async fn execute_anchor(
        &self,
        anchor: &Anchor,
        ctx: &AnchorAttempt,
    ) -> Result<(), AnchorExecutionError> {
        self.calls
            .lock()
            .unwrap()
            .push((anchor.id.clone(), ctx.attempt));
        self.variants.lock().unwrap().push(ctx.model_variant);
        if self.fail_ids.contains(&anchor.id) {
            return Err(AnchorExecutionError::failed(format!(
                "scripted failure for {}",
                anchor.id
            )));
        }
        Ok(())
    }
}

/// Executor whose anchors block until the test releases them by id
#[derive(Default)]
pub struct GatedExecutor {
    started: Mutex<Vec<String>>,
    gates: Mutex<HashMap<String, Arc<Notify>>>,
}

impl GatedExecutor {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn gate(&self, id: &str) -> Arc<Notify> {
        Arc::clone(
            self.gates
                .lock()
                .unwrap()
                .entry(id.to_string())
                .or_default(),
        )
    }

    /// Allow the anchor through; effective even before it starts.
    pub fn release(&self, id: &str) {
        self.gate(id).notify_one();
    }

    pub fn release_all(&self, ids: impl IntoIterator<Item = String>) {
        for id in ids {
            self.release(&id);
        }
    }

    pub fn started_ids(&self) -> Vec<String> {
        self.started.lock().unwrap().clone()
    }

    pub fn started_count(&self) -> usize {
        self.started.lock().unwrap().len()
    }

    pub fn has_started(&self, id: &str) -> bool {
        self.started.lock().unwrap().iter().any(|s| s == id)
    }
}

#[async_trait]
impl AnchorExecutor for GatedExecutor {
    async fn execute_anchor(
        &self,
        anchor: &Anchor,
        ctx: &AnchorAttempt,
    ) -> Result<(), AnchorExecutionError> {
        self.started.lock().unwrap().push(anchor.id.clone());
        let gate = self.gate(&anchor.id);
        tokio::select! {
            _ = gate.notified() => Ok(()),
            _ = ctx.signal.cancelled() => Err(AnchorExecutionError::Cancelled),
        }
    }
}

/// What the scripted refresher does with each call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshBehavior {
    /// Return no parents, terminating every cascade after one level
    Empty,
    /// Collapse child tiles into their half-resolution parents, so cascades
    /// keep climbing until the level budget or the root
    Halve,
    /// Fail the first `n` calls, then behave like `Empty`
    FailFirst(u32),
    /// Fail every call
    AlwaysFail,
}

/// Refresher recording every `(child_z, tiles)` it is asked to collapse
pub struct ScriptedRefresher {
    behavior: RefreshBehavior,
    failures_left: AtomicU32,
    pub calls: Mutex<Vec<(u32, Vec<TileCoord>)>>,
}

impl ScriptedRefresher {
    pub fn new(behavior: RefreshBehavior) -> Arc<Self> {
        let failures_left = match behavior {
            RefreshBehavior::FailFirst(n) => n,
            _ => 0,
        };
        Arc::new(Self {
            behavior,
            failures_left: AtomicU32::new(failures_left),
            calls: Mutex::new(Vec::new()),
        })
    }

    pub fn levels_called(&self) -> Vec<u32> {
        self.calls.lock().unwrap().iter().map(|(z, _)| *z).collect()
    }

    /// Union of every leaf tile handed to a `child_z == leaf_z` call
    pub fn leaf_tiles_seen(&self, leaf_z: u32) -> BTreeSet<TileCoord> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(z, _)| *z == leaf_z)
            .flat_map(|(_, tiles)| tiles.iter().copied())
            .collect()
    }
}

#[async_trait]
impl ParentRefresher for ScriptedRefresher {
    async fn refresh_parent_level(
        &self,
        request: ParentRefreshRequest,
    ) -> Result<Vec<TileCoord>, ParentRefreshError> {
        self.calls
            .lock()
            .unwrap()
            .push((request.child_z, request.child_tiles.clone()));

        let should_fail = match self.behavior {
            RefreshBehavior::AlwaysFail => true,
            RefreshBehavior::FailFirst(_) => self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| (n > 0).then(|| n - 1))
                .is_ok(),
            _ => false,
        };
        if should_fail {
            return Err(ParentRefreshError::failed("scripted refresh failure"));
        }

        match self.behavior {
            RefreshBehavior::Halve => Ok(request
                .child_tiles
                .iter()
                .map(|t| TileCoord::new(t.x / 2, t.y / 2))
                .collect::<BTreeSet<_>>()
                .into_iter()
                .collect()),
            _ => Ok(Vec::new()),
        }
    }
}

/// Observer that collects every snapshot in emission order
#[derive(Default)]
pub struct SnapshotCollector {
    pub snapshots: Mutex<Vec<BatchRunState>>,
}

impl SnapshotCollector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn collected(&self) -> Vec<BatchRunState> {
        self.snapshots.lock().unwrap().clone()
    }
}

impl StateObserver for SnapshotCollector {
    fn on_state(&self, snapshot: BatchRunState) {
        self.snapshots.lock().unwrap().push(snapshot);
    }
}

/// A reasonable baseline input: origin mid-map, collaborators wired in by
/// each test.
pub fn base_input() -> BatchRunInput {
    BatchRunInput {
        origin_x: 20,
        origin_y: 20,
        z: 6,
        map_width: 64,
        map_height: 64,
        layers: 2,
        prompt: "weathered stone bridge over a river".to_string(),
        ..BatchRunInput::default()
    }
}

/// Poll until `predicate` holds, or panic after `timeout`.
pub async fn wait_for(timeout: Duration, mut predicate: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + timeout;
    while !predicate() {
        if tokio::time::Instant::now() >= deadline {
            panic!("condition not reached within {timeout:?}");
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Every pair of anchors in the same wave must have disjoint footprints.
pub fn assert_wave_overlap_free(state: &BatchRunState) {
    for wave in &state.waves {
        for (i, a_id) in wave.task_ids.iter().enumerate() {
            for b_id in &wave.task_ids[i + 1..] {
                let a = &state.anchors[a_id];
                let b = &state.anchors[b_id];
                let dx = (a.x as i64 - b.x as i64).abs();
                let dy = (a.y as i64 - b.y as i64).abs();
                assert!(
                    dx > 2 || dy > 2,
                    "wave {} contains overlapping anchors {} and {}",
                    wave.index,
                    a_id,
                    b_id
                );
            }
        }
    }
}
