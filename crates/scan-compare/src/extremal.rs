//! Extremal (diametral) pair extraction.
//!
//! Finds the two points of maximum mutual distance in a point set. Small
//! sets get the full pairwise search; large sets are first reduced to their
//! convex hull, which always contains the diametral pair, so the shortcut
//! stays exact.

use nalgebra::Point3;

use crate::error::{CompareError, CompareResult};
use crate::spatial::{ConvexHullComputer, Quickhull};

/// Below this size the full O(n²) pairwise search is cheaper than building
/// a hull.
const HULL_CUTOFF: usize = 400;

/// Find the pair of points with maximum mutual distance.
///
/// The returned pair is ordered by ascending y coordinate, which makes the
/// result deterministic for symmetric sets with several maximal pairs.
/// Fails with `DegenerateInput` if fewer than 2 distinct points are given.
pub fn extremal_pair(points: &[Point3<f64>]) -> CompareResult<(Point3<f64>, Point3<f64>)> {
    extremal_pair_with(points, &Quickhull)
}

/// [`extremal_pair`] with an explicit convex hull backend.
pub fn extremal_pair_with(
    points: &[Point3<f64>],
    hull: &dyn ConvexHullComputer,
) -> CompareResult<(Point3<f64>, Point3<f64>)> {
    if points.len() < 2 || !points[1..].iter().any(|p| p != &points[0]) {
        return Err(CompareError::degenerate_input(
            "extremal pair requires at least two distinct points",
        ));
    }

    let candidates: Vec<usize> = if points.len() < HULL_CUTOFF {
        (0..points.len()).collect()
    } else {
        let hull_vertices = hull.hull_vertices(points);
        if hull_vertices.len() < 2 {
            (0..points.len()).collect()
        } else {
            hull_vertices
        }
    };

    let mut best_d2 = -1.0f64;
    let mut best = (candidates[0], candidates[0]);
    for (a, &i) in candidates.iter().enumerate() {
        for &j in &candidates[a + 1..] {
            let d2 = (points[j] - points[i]).norm_squared();
            if d2 > best_d2 {
                best_d2 = d2;
                best = (i, j);
            }
        }
    }

    let (p1, p2) = (points[best.0], points[best.1]);
    if p1.y <= p2.y {
        Ok((p1, p2))
    } else {
        Ok((p2, p1))
    }
}
