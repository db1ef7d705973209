//! Per-point surface divergence fields.
//!
//! A divergence field assigns each query point its Euclidean distance to
//! the nearest point of a reference set. After alignment, large values mark
//! surface regions present on one input but not the other.

use nalgebra::Point3;
use rayon::prelude::*;

use crate::error::{CompareError, CompareResult};
use crate::spatial::{KdTreeIndex, NearestNeighborIndex};
use crate::types::PointSet;

/// A divergence field: one non-negative distance per query point, in query
/// order.
pub type DivergenceField = Vec<f64>;

/// Pairwise-distance estimates switch to deterministic sub-sampling above
/// this size to bound the O(n²) cost.
const PAIRWISE_SUBSAMPLE_CUTOFF: usize = 2048;

/// Compute the divergence field of `query` against `reference`.
///
/// Pure and order-preserving: result index i is the distance from
/// `query.points[i]` to its nearest reference point. Fails with
/// `EmptyReference` if the reference set is empty.
pub fn divergence_field(query: &PointSet, reference: &PointSet) -> CompareResult<DivergenceField> {
    if reference.is_empty() {
        return Err(CompareError::EmptyReference);
    }

    let index = KdTreeIndex::build(&reference.points);
    Ok(query
        .points
        .par_iter()
        .map(|p| index.nearest(p).map(|(_, d)| d).unwrap_or(0.0))
        .collect())
}

/// Mean distance over all point pairs.
///
/// This is the spacing estimate the pipeline derives its voxel size and
/// clustering radius from. Sets larger than the cutoff are sub-sampled on a
/// fixed stride, keeping the estimate deterministic.
pub fn mean_pairwise_distance(points: &[Point3<f64>]) -> f64 {
    if points.len() < 2 {
        return 0.0;
    }

    let stride = points.len().div_ceil(PAIRWISE_SUBSAMPLE_CUTOFF);
    let sampled: Vec<&Point3<f64>> = points.iter().step_by(stride).collect();

    let n = sampled.len();
    let (sum, count) = (0..n)
        .into_par_iter()
        .map(|i| {
            let mut local = 0.0;
            for j in (i + 1)..n {
                local += (sampled[j] - sampled[i]).norm();
            }
            (local, n - i - 1)
        })
        .reduce(|| (0.0, 0), |a, b| (a.0 + b.0, a.1 + b.1));

    if count == 0 { 0.0 } else { sum / count as f64 }
}
