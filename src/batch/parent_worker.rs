//! # Parent Worker Pool
//!
//! Workers that drain queued parent refresh jobs, cascading each batch of
//! leaf tiles upward one zoom level at a time. Anchor failures are survivable;
//! a parent job that exhausts its retries is fatal to the whole run, because
//! silent parent divergence would corrupt the pyramid.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info};

use crate::batch::executor::RunCore;
use crate::batch::runner::backoff_delay;
use crate::batch::types::{ParentRefreshRequest, TileCoord};
use crate::error::ParentRefreshError;

/// Idle poll interval while waiting for work or a flush deadline
const IDLE_POLL: Duration = Duration::from_millis(25);

/// How a claimed job ended
enum JobRun {
    Completed,
    Cancelled,
    Fatal(String),
}

/// One worker's loop: claim and run queued jobs; when idle, give the
/// aggregator a chance to flush on its debounce and to emit the final
/// catch-up, then exit once the parent phase has fully drained.
pub(crate) async fn run_worker(core: Arc<RunCore>, worker_idx: usize) {
    debug!(worker_idx, "Parent worker started");
    loop {
        if core.cancel_token().is_cancelled() {
            break;
        }

        if let Some(job_index) = core.claim_parent_job() {
            match run_job(&core, job_index).await {
                JobRun::Completed => continue,
                JobRun::Cancelled => break,
                JobRun::Fatal(message) => {
                    error!(worker_idx, error = %message, "Parent job failed hard, cancelling run");
                    core.set_fatal(message);
                    core.cancel_token().cancel();
                    break;
                }
            }
        }

        core.poll_parent_flush();
        core.try_emit_catch_up();
        if core.parent_phase_done() {
            break;
        }

        tokio::select! {
            _ = tokio::time::sleep(IDLE_POLL) => {}
            _ = core.cancel_token().cancelled() => {}
        }
    }
    debug!(worker_idx, "Parent worker exiting");
}

/// Cascade one job upward, retrying the current level on failure.
///
/// An attempt spans the whole cascade; a level failure fails the attempt and
/// the retry resumes at the failed level (the refresher is idempotent, so
/// completed levels are not replayed).
async fn run_job(core: &Arc<RunCore>, job_index: u32) -> JobRun {
    let Some(refresher) = core.collaborators().refresh_parent_level.clone() else {
        core.finish_parent_job(
            job_index,
            Err("refresh_parent_level collaborator not provided".to_string()),
        );
        return JobRun::Fatal("refresh_parent_level collaborator not provided".to_string());
    };

    let (mut child_z, mut tiles, max_levels, max_attempts) = core.parent_job_work(job_index);
    let mut levels_done = 0u32;
    let mut attempts = 1u32;

    while levels_done < max_levels && child_z > 0 && !tiles.is_empty() {
        core.set_parent_job_level(job_index, child_z);
        let request = ParentRefreshRequest {
            child_z,
            child_tiles: tiles.clone(),
            signal: core.cancel_token().clone(),
        };

        let result = tokio::select! {
            result = refresher.refresh_parent_level(request) => result,
            _ = core.cancel_token().cancelled() => return JobRun::Cancelled,
        };

        match result {
            Ok(parents) => {
                debug!(
                    job_index,
                    child_z,
                    parent_count = parents.len(),
                    "Parent level refreshed"
                );
                tiles = dedup_tiles(parents);
                child_z -= 1;
                levels_done += 1;
            }
            Err(ParentRefreshError::Cancelled) => return JobRun::Cancelled,
            Err(ParentRefreshError::Failed {
                message,
                retry_after,
            }) => {
                if attempts >= max_attempts {
                    core.finish_parent_job(job_index, Err(message.clone()));
                    return JobRun::Fatal(message);
                }
                let delay = backoff_delay(attempts, retry_after);
                attempts += 1;
                core.set_parent_job_attempts(job_index, attempts);
                info!(
                    job_index,
                    child_z,
                    attempt = attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %message,
                    "Parent refresh failed, backing off"
                );
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = core.cancel_token().cancelled() => return JobRun::Cancelled,
                }
            }
        }
    }

    core.finish_parent_job(job_index, Ok(()));
    JobRun::Completed
}

fn dedup_tiles(tiles: Vec<TileCoord>) -> Vec<TileCoord> {
    tiles.into_iter().collect::<BTreeSet<_>>().into_iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dedup_sorts_and_removes_duplicates() {
        let tiles = vec![
            TileCoord::new(3, 1),
            TileCoord::new(1, 1),
            TileCoord::new(3, 1),
        ];
        assert_eq!(
            dedup_tiles(tiles),
            vec![TileCoord::new(1, 1), TileCoord::new(3, 1)]
        );
    }
}
