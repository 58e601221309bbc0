//! # Batch Plan
//!
//! Pure planning for a batch run: expand an origin and fan-out radius into
//! the set of overlapping 3x3 anchors, wire the dependency tree, and compute
//! the deterministic priority order the scheduler consumes.
//!
//! The planner has no failure modes. An out-of-bounds origin or a zero
//! radius simply yields a plan with no anchors, which the executor turns
//! into an immediately completed run.

use std::collections::HashMap;

use tracing::debug;

use crate::batch::types::{
    clipped_footprint, Anchor, AnchorPriority, AnchorStatus, CoverageBounds, TileCoord,
};

/// Spatial extent of a plan at the leaf zoom level
#[derive(Debug, Clone, Copy)]
pub struct PlanBounds {
    pub origin_x: i64,
    pub origin_y: i64,
    pub layers: u32,
    pub map_width: u32,
    pub map_height: u32,
}

/// Output of the planner: the anchor set, its dependency tree, and the
/// deterministic execution order.
#[derive(Debug, Clone)]
pub struct BatchPlan {
    pub anchors: HashMap<String, Anchor>,
    /// Anchor ids sorted by the priority total order
    pub priority_order: Vec<String>,
    /// Min/max tile touched by any anchor footprint, if the plan is nonempty
    pub coverage: Option<CoverageBounds>,
}

impl BatchPlan {
    pub fn is_empty(&self) -> bool {
        self.anchors.is_empty()
    }
}

/// Build the plan for a batch run.
///
/// Enumerates every `(u, v)` with `|u|, |v| <= layers`, drops anchors whose
/// center falls outside the map, and wires each surviving non-origin anchor
/// to the anchor one step closer to the origin along both axes. Edges to
/// anchors that were dropped are dropped with them, so the result is always
/// a tree (or forest fragments re-rooted at the surviving anchors).
pub fn build_plan(bounds: PlanBounds) -> BatchPlan {
    let mut anchors: HashMap<String, Anchor> = HashMap::new();
    let layers = bounds.layers as i32;

    for v in -layers..=layers {
        for u in -layers..=layers {
            let x = bounds.origin_x + 2 * u as i64;
            let y = bounds.origin_y + 2 * v as i64;
            if x < 0
                || y < 0
                || x >= bounds.map_width as i64
                || y >= bounds.map_height as i64
            {
                continue;
            }
            let id = Anchor::format_id(u, v);
            anchors.insert(
                id.clone(),
                Anchor {
                    id,
                    u,
                    v,
                    x: x as u32,
                    y: y as u32,
                    depends_on: Vec::new(),
                    dependents: Vec::new(),
                    priority: priority_of(u, v),
                    status: AnchorStatus::Pending,
                    attempts: 0,
                    wave_index: None,
                    started_at: None,
                    finished_at: None,
                    blocked_by: None,
                    error: None,
                },
            );
        }
    }

    // Dependency edges: one step closer to the origin along both axes.
    let ids: Vec<String> = anchors.keys().cloned().collect();
    for id in &ids {
        let (u, v) = {
            let a = &anchors[id];
            (a.u, a.v)
        };
        if u == 0 && v == 0 {
            continue;
        }
        let dep_id = Anchor::format_id(u - u.signum(), v - v.signum());
        if anchors.contains_key(&dep_id) {
            anchors.get_mut(id).expect("anchor present").depends_on = vec![dep_id.clone()];
            anchors
                .get_mut(&dep_id)
                .expect("dep present")
                .dependents
                .push(id.clone());
        }
    }

    // Dependent lists in deterministic order, for reproducible traversal.
    for anchor in anchors.values_mut() {
        anchor.dependents.sort();
    }

    let mut priority_order: Vec<String> = anchors.keys().cloned().collect();
    priority_order.sort_by(|a, b| sort_key(&anchors[a]).cmp(&sort_key(&anchors[b])));

    let coverage = coverage_bounds(&anchors, bounds.map_width, bounds.map_height);

    debug!(
        anchor_count = anchors.len(),
        layers = bounds.layers,
        origin_x = bounds.origin_x,
        origin_y = bounds.origin_y,
        "Built batch plan"
    );

    BatchPlan {
        anchors,
        priority_order,
        coverage,
    }
}

/// Priority triple for an `(u, v)` offset
pub fn priority_of(u: i32, v: i32) -> AnchorPriority {
    AnchorPriority {
        distance: (u.unsigned_abs() + v.unsigned_abs()),
        bucket: bucket_of(u, v),
        quadrant_order: quadrant_order_of(u, v),
    }
}

fn bucket_of(u: i32, v: i32) -> u8 {
    match (u, v) {
        (0, 0) => 0,
        (_, 0) => 1,
        (0, _) => 2,
        _ => 3,
    }
}

/// Interior quadrants run NE, NW, SE, SW; north is toward smaller `y`.
/// Axes and origin use the sentinel 4.
fn quadrant_order_of(u: i32, v: i32) -> u8 {
    if u == 0 || v == 0 {
        return 4;
    }
    match (u > 0, v < 0) {
        (true, true) => 0,   // NE
        (false, true) => 1,  // NW
        (true, false) => 2,  // SE
        (false, false) => 3, // SW
    }
}

/// Full sort key realizing the priority total order.
///
/// Fields three through five only discriminate inside their own bucket, so
/// reusing the positions across buckets is safe: the bucket field has
/// already decided the comparison by the time they are reached. At equal
/// axis distance the positive side runs first. The trailing `(v, u, id)`
/// makes the order total.
fn sort_key(a: &Anchor) -> (u32, u8, u32, u32, u32, i32, i32, String) {
    let (k1, k2, k3) = match a.priority.bucket {
        0 => (0, 0, 0),
        1 => (a.u.unsigned_abs(), (a.u < 0) as u32, 0),
        2 => (a.v.unsigned_abs(), (a.v < 0) as u32, 0),
        _ => (
            a.priority.quadrant_order as u32,
            a.u.unsigned_abs().max(a.v.unsigned_abs()),
            a.u.unsigned_abs(),
        ),
    };
    (
        a.priority.distance,
        a.priority.bucket,
        k1,
        k2,
        k3,
        a.v,
        a.u,
        a.id.clone(),
    )
}

fn coverage_bounds(
    anchors: &HashMap<String, Anchor>,
    map_width: u32,
    map_height: u32,
) -> Option<CoverageBounds> {
    let mut bounds: Option<CoverageBounds> = None;
    for anchor in anchors.values() {
        for TileCoord { x, y } in clipped_footprint(anchor.x, anchor.y, map_width, map_height) {
            bounds = Some(match bounds {
                None => CoverageBounds {
                    min_x: x,
                    min_y: y,
                    max_x: x,
                    max_y: y,
                },
                Some(b) => CoverageBounds {
                    min_x: b.min_x.min(x),
                    min_y: b.min_y.min(y),
                    max_x: b.max_x.max(x),
                    max_y: b.max_y.max(y),
                },
            });
        }
    }
    bounds
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plan(origin_x: i64, origin_y: i64, layers: u32, w: u32, h: u32) -> BatchPlan {
        build_plan(PlanBounds {
            origin_x,
            origin_y,
            layers,
            map_width: w,
            map_height: h,
        })
    }

    #[test]
    fn full_plan_has_one_anchor_per_offset() {
        let plan = plan(20, 20, 2, 64, 64);
        assert_eq!(plan.anchors.len(), 25);
        for v in -2i32..=2 {
            for u in -2i32..=2 {
                let anchor = &plan.anchors[&Anchor::format_id(u, v)];
                assert_eq!(anchor.x as i64, 20 + 2 * u as i64);
                assert_eq!(anchor.y as i64, 20 + 2 * v as i64);
            }
        }
    }

    #[test]
    fn out_of_bounds_origin_yields_empty_plan() {
        assert!(plan(100, 20, 2, 64, 64).is_empty());
        assert!(plan(-1, 0, 2, 64, 64).is_empty());
    }

    #[test]
    fn edge_origin_clips_anchors_and_reroots_subtrees() {
        // Origin at x=1: every u <= -1 anchor lands at x < 0 and is dropped.
        let plan = plan(1, 20, 2, 64, 64);
        assert_eq!(plan.anchors.len(), 15);
        assert!(!plan.anchors.contains_key("u:-1,v:0"));
        // u:1,v:1 keeps its dep on the origin; the dropped column leaves
        // u:-? descendants gone entirely rather than dangling.
        let a = &plan.anchors["u:1,v:1"];
        assert_eq!(a.depends_on, vec!["u:0,v:0".to_string()]);
    }

    #[test]
    fn dependency_tree_has_one_parent_per_non_origin_anchor() {
        let plan = plan(20, 20, 2, 64, 64);
        for anchor in plan.anchors.values() {
            if anchor.u == 0 && anchor.v == 0 {
                assert!(anchor.depends_on.is_empty());
            } else {
                assert_eq!(anchor.depends_on.len(), 1, "anchor {}", anchor.id);
                let dep = &plan.anchors[&anchor.depends_on[0]];
                assert_eq!(dep.u, anchor.u - anchor.u.signum());
                assert_eq!(dep.v, anchor.v - anchor.v.signum());
                assert!(dep.dependents.contains(&anchor.id));
            }
        }
    }

    #[test]
    fn dependency_dag_is_acyclic() {
        let plan = plan(20, 20, 3, 64, 64);
        // Walking depends_on strictly decreases distance, so following the
        // single parent edge must reach the origin.
        for anchor in plan.anchors.values() {
            let mut current = anchor;
            let mut hops = 0;
            while let Some(dep_id) = current.depends_on.first() {
                current = &plan.anchors[dep_id];
                hops += 1;
                assert!(hops <= 6, "dependency chain too long from {}", anchor.id);
            }
            assert_eq!((current.u, current.v), (0, 0));
        }
    }

    #[test]
    fn priority_order_starts_at_origin_then_spreads_outward() {
        let plan = plan(20, 20, 2, 64, 64);
        let order = &plan.priority_order;
        assert_eq!(order[0], "u:0,v:0");

        // Distance-1 ring: axis-X positive first, then negative, then axis-Y.
        assert_eq!(order[1], "u:1,v:0");
        assert_eq!(order[2], "u:-1,v:0");
        assert_eq!(order[3], "u:0,v:1");
        assert_eq!(order[4], "u:0,v:-1");

        // Distance-2: axes before interior; interior runs NE, NW, SE, SW.
        assert_eq!(order[5], "u:2,v:0");
        assert_eq!(order[6], "u:-2,v:0");
        assert_eq!(order[7], "u:0,v:2");
        assert_eq!(order[8], "u:0,v:-2");
        assert_eq!(order[9], "u:1,v:-1"); // NE
        assert_eq!(order[10], "u:-1,v:-1"); // NW
        assert_eq!(order[11], "u:1,v:1"); // SE
        assert_eq!(order[12], "u:-1,v:1"); // SW

        // Distances never decrease along the order.
        let mut last_distance = 0;
        for id in order {
            let d = plan.anchors[id].priority.distance;
            assert!(d >= last_distance);
            last_distance = d;
        }
    }

    #[test]
    fn priority_order_is_deterministic() {
        let a = plan(20, 20, 3, 64, 64);
        let b = plan(20, 20, 3, 64, 64);
        assert_eq!(a.priority_order, b.priority_order);
    }

    #[test]
    fn interior_ring_orders_by_quadrant_then_ring() {
        let plan = plan(40, 40, 3, 128, 128);
        let order = &plan.priority_order;
        let pos = |id: &str| order.iter().position(|o| o == id).unwrap();

        // Same distance 3: NE ring-2 before SE ring-2, and within NE the
        // tighter ring comes first.
        assert!(pos("u:2,v:-1") < pos("u:1,v:2"));
        assert!(pos("u:2,v:-1") < pos("u:2,v:1"));
        // distance 4, NE: ring 2 (|u|=2,|v|=2) before ring 3 (|u|=3,|v|=1).
        assert!(pos("u:2,v:-2") < pos("u:3,v:-1"));
    }

    #[test]
    fn coverage_spans_all_footprints() {
        let plan = plan(20, 20, 2, 64, 64);
        let coverage = plan.coverage.expect("nonempty plan has coverage");
        // Outermost anchors sit at 20 +/- 4; footprints extend one further.
        assert_eq!(coverage.min_x, 15);
        assert_eq!(coverage.min_y, 15);
        assert_eq!(coverage.max_x, 25);
        assert_eq!(coverage.max_y, 25);
    }

    #[test]
    fn coverage_clips_at_map_edges() {
        let plan = plan(0, 0, 1, 64, 64);
        let coverage = plan.coverage.expect("nonempty plan has coverage");
        assert_eq!(coverage.min_x, 0);
        assert_eq!(coverage.min_y, 0);
        assert_eq!(coverage.max_x, 3);
        assert_eq!(coverage.max_y, 3);
    }

    #[test]
    fn zero_layers_plans_only_the_origin() {
        let plan = plan(20, 20, 0, 64, 64);
        assert_eq!(plan.anchors.len(), 1);
        assert_eq!(plan.priority_order, vec!["u:0,v:0".to_string()]);
    }
}
