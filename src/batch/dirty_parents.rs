//! # Dirty-Parent Aggregator
//!
//! Tracks which leaf tiles have been rewritten since the last parent flush
//! and decides when to emit a parent refresh batch.
//!
//! Three flush policies are OR-combined: a time debounce since the first
//! mark of the current batch, a successful-wave count, and a dirty-leaf
//! count. When generation finishes, any outstanding dirty set flushes
//! unconditionally, and a final catch-up batch over the cumulative touched
//! set guarantees every ancestor level gets refreshed up to the root.

use std::collections::BTreeSet;

use tokio::time::Instant;
use tracing::debug;

use crate::batch::types::TileCoord;

/// Outcome of the final catch-up check
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CatchUpDecision {
    /// Conditions not met yet (generation running, jobs outstanding, or
    /// already settled)
    NotYet,
    /// Emit one last batch over the cumulative touched set
    Emit(Vec<TileCoord>),
    /// Every flush already cascaded to the root, or nothing was touched
    Skipped,
}

/// Accumulates dirty leaves and applies the flush policies.
///
/// Purely synchronous; the executor and parent workers drive it under the
/// run lock and turn emitted batches into `ParentRefreshJob`s.
#[derive(Debug)]
pub struct DirtyParentAggregator {
    debounce_ms: u64,
    wave_batch_size: u32,
    leaf_batch_size: usize,
    cascade_depth: u32,
    leaf_z: u32,
    /// Dirty since the last flush; ordered for deterministic job contents
    dirty: BTreeSet<TileCoord>,
    first_mark: Option<Instant>,
    waves_since_flush: u32,
    /// Every leaf touched over the whole run
    touched: BTreeSet<TileCoord>,
    catch_up_settled: bool,
}

impl DirtyParentAggregator {
    pub fn new(
        debounce_ms: u64,
        wave_batch_size: u32,
        leaf_batch_size: usize,
        cascade_depth: u32,
        leaf_z: u32,
    ) -> Self {
        Self {
            debounce_ms,
            wave_batch_size,
            leaf_batch_size,
            cascade_depth,
            leaf_z,
            dirty: BTreeSet::new(),
            first_mark: None,
            waves_since_flush: 0,
            touched: BTreeSet::new(),
            catch_up_settled: false,
        }
    }

    /// Record the footprint of a successful anchor.
    pub fn mark_footprint(&mut self, tiles: impl IntoIterator<Item = TileCoord>) {
        let mut marked_any = false;
        for tile in tiles {
            self.dirty.insert(tile);
            self.touched.insert(tile);
            marked_any = true;
        }
        if marked_any && self.first_mark.is_none() {
            self.first_mark = Some(Instant::now());
        }
    }

    /// Record a completed wave that contained at least one success.
    pub fn note_wave_success(&mut self) {
        self.waves_since_flush += 1;
    }

    pub fn dirty_len(&self) -> usize {
        self.dirty.len()
    }

    pub fn touched_len(&self) -> usize {
        self.touched.len()
    }

    /// Whether any flush policy fires right now.
    ///
    /// `generation_finished` makes any outstanding dirty set flush
    /// unconditionally.
    pub fn should_flush(&self, now: Instant, generation_finished: bool) -> bool {
        if self.dirty.is_empty() {
            return false;
        }
        if generation_finished {
            return true;
        }
        if self.waves_since_flush >= self.wave_batch_size {
            return true;
        }
        if self.dirty.len() >= self.leaf_batch_size {
            return true;
        }
        match self.first_mark {
            Some(first) => now.duration_since(first).as_millis() as u64 >= self.debounce_ms,
            None => false,
        }
    }

    /// Drain the dirty set for a new parent job and reset the batch state.
    ///
    /// Returns `None` when there is nothing to flush. The cumulative touched
    /// set is unaffected.
    pub fn take_flush(&mut self) -> Option<Vec<TileCoord>> {
        if self.dirty.is_empty() {
            return None;
        }
        let tiles: Vec<TileCoord> = std::mem::take(&mut self.dirty).into_iter().collect();
        self.first_mark = None;
        self.waves_since_flush = 0;
        debug!(leaf_count = tiles.len(), "Flushing dirty leaves");
        Some(tiles)
    }

    /// Decide the final catch-up once generation is done and the parent
    /// queue has drained. Settles at most once per run.
    pub fn take_catch_up(
        &mut self,
        generation_finished: bool,
        parent_queue_idle: bool,
    ) -> CatchUpDecision {
        if self.catch_up_settled || !generation_finished || !parent_queue_idle {
            return CatchUpDecision::NotYet;
        }
        if !self.dirty.is_empty() {
            // An unflushed batch still exists; flush first, catch up after.
            return CatchUpDecision::NotYet;
        }
        self.catch_up_settled = true;
        if self.cascade_depth >= self.leaf_z || self.touched.is_empty() {
            debug!("Final catch-up pre-satisfied, skipping");
            return CatchUpDecision::Skipped;
        }
        let tiles: Vec<TileCoord> = self.touched.iter().copied().collect();
        debug!(leaf_count = tiles.len(), "Emitting final catch-up batch");
        CatchUpDecision::Emit(tiles)
    }

    /// Whether the catch-up has been emitted or skipped.
    pub fn catch_up_settled(&self) -> bool {
        self.catch_up_settled
    }
}
