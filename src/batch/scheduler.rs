//! # Anchor Scheduler
//!
//! Pure selection and propagation logic over the anchor map: readiness,
//! overlap-safe wave selection under the parallelism cap, breadth-first
//! BLOCKED propagation from failures, and the terminal safety net.
//!
//! Everything here is synchronous and side-effect free apart from mutating
//! the anchor map it is handed; the async executor owns when these functions
//! run.

use std::collections::{HashMap, VecDeque};

use tracing::{debug, warn};

use crate::batch::types::{Anchor, AnchorStatus};

/// Two anchors conflict when their 3x3 footprints share any tile.
///
/// This is weaker than dependency: siblings with no dep edge between them
/// still conflict when they sit within two tiles of each other.
pub fn conflicts(a: &Anchor, b: &Anchor) -> bool {
    let dx = (a.x as i64 - b.x as i64).abs();
    let dy = (a.y as i64 - b.y as i64).abs();
    dx <= 2 && dy <= 2
}

/// An anchor is ready when it is still pending and every dependency
/// succeeded.
pub fn is_ready(anchors: &HashMap<String, Anchor>, id: &str) -> bool {
    let Some(anchor) = anchors.get(id) else {
        return false;
    };
    anchor.status == AnchorStatus::Pending
        && anchor
            .depends_on
            .iter()
            .all(|dep| matches!(anchors.get(dep), Some(d) if d.status == AnchorStatus::Success))
}

/// Greedily pick the next overlap-safe set of anchors to start.
///
/// Walks `priority_order`, picking each ready anchor unless it conflicts
/// with an already running anchor or one picked earlier in this pass, until
/// `capacity` anchors are selected. An empty result with ready anchors
/// remaining means every candidate is fenced off by an in-flight conflict;
/// the caller waits for a completion rather than violate exclusion.
pub fn select_wave(
    anchors: &HashMap<String, Anchor>,
    priority_order: &[String],
    running: &[String],
    capacity: usize,
) -> Vec<String> {
    if capacity == 0 {
        return Vec::new();
    }

    let mut picked: Vec<String> = Vec::new();
    for id in priority_order {
        if picked.len() >= capacity {
            break;
        }
        if !is_ready(anchors, id) {
            continue;
        }
        let candidate = &anchors[id];
        let blocked_by_running = running
            .iter()
            .chain(picked.iter())
            .any(|other| conflicts(candidate, &anchors[other]));
        if blocked_by_running {
            continue;
        }
        picked.push(id.clone());
    }

    if !picked.is_empty() {
        debug!(count = picked.len(), anchors = ?picked, "Selected wave");
    }
    picked
}

/// Mark every still-pending transitive dependent of `failed_id` as blocked.
///
/// Breadth-first over the reverse edges; returns the newly blocked ids in
/// traversal order. `blocked_by` always names the originating failure, even
/// across multiple hops.
pub fn propagate_blocked(
    anchors: &mut HashMap<String, Anchor>,
    failed_id: &str,
) -> Vec<String> {
    let mut newly_blocked = Vec::new();
    let mut queue: VecDeque<String> = anchors
        .get(failed_id)
        .map(|a| a.dependents.iter().cloned().collect())
        .unwrap_or_default();

    while let Some(id) = queue.pop_front() {
        let Some(anchor) = anchors.get_mut(&id) else {
            continue;
        };
        if anchor.status != AnchorStatus::Pending {
            continue;
        }
        anchor.status = AnchorStatus::Blocked;
        anchor.blocked_by = Some(failed_id.to_string());
        queue.extend(anchor.dependents.iter().cloned());
        newly_blocked.push(id);
    }

    if !newly_blocked.is_empty() {
        debug!(
            failed_id = failed_id,
            blocked = ?newly_blocked,
            "Propagated blocking to dependents"
        );
    }
    newly_blocked
}

/// Safety net for the end of generation: force-block any pending anchor
/// whose dependency chain can no longer succeed.
///
/// Eager propagation at failure time should make this unreachable; a hit
/// here indicates a propagation bug upstream.
pub fn block_unreachable(anchors: &mut HashMap<String, Anchor>) -> Vec<String> {
    let stuck: Vec<(String, Option<String>)> = anchors
        .values()
        .filter(|a| a.status == AnchorStatus::Pending)
        .map(|a| {
            let culprit = a
                .depends_on
                .iter()
                .find(|dep| {
                    matches!(
                        anchors.get(*dep).map(|d| d.status),
                        Some(AnchorStatus::Failed) | Some(AnchorStatus::Blocked) | None
                    )
                })
                .cloned();
            (a.id.clone(), culprit)
        })
        .filter(|(_, culprit)| culprit.is_some())
        .collect();

    let mut blocked = Vec::new();
    for (id, culprit) in stuck {
        if let Some(anchor) = anchors.get_mut(&id) {
            warn!(
                anchor_id = %id,
                "Force-blocking pending anchor with unreachable dependency"
            );
            anchor.status = AnchorStatus::Blocked;
            anchor.blocked_by = culprit;
            blocked.push(id);
        }
    }
    blocked
}
