//! Clustering of divergent surface points into reportable defects.
//!
//! Points whose divergence exceeds the tolerance are filtered for
//! statistical outliers, grouped into radius-connected components, and each
//! component is capped with a bounding sphere derived from its extremal
//! pair. The sphere is an enclosing approximation for reporting severity,
//! not a minimal bounding volume.

use nalgebra::Point3;
use tracing::debug;

use crate::divergence::DivergenceField;
use crate::extremal::extremal_pair;
use crate::spatial::{KdTreeIndex, NearestNeighborIndex};
use crate::types::PointSet;

/// A spatially connected group of divergent points, with its bounding
/// sphere.
#[derive(Debug, Clone)]
pub struct DefectCluster {
    /// The divergent points belonging to this cluster (by value).
    pub points: Vec<Point3<f64>>,

    /// Bounding sphere center: midpoint of the cluster's extremal pair.
    pub center: Point3<f64>,

    /// Bounding sphere radius: distance from the center to the extremal
    /// pair's farther point.
    pub radius: f64,
}

impl DefectCluster {
    /// Number of points in the cluster.
    #[inline]
    pub fn len(&self) -> usize {
        self.points.len()
    }

    /// A cluster is never empty.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }
}

/// Parameters for statistical outlier removal inside the clusterer.
#[derive(Debug, Clone)]
pub struct OutlierParams {
    /// Neighbors considered per point.
    pub neighbors: usize,

    /// Threshold in standard deviations above the mean neighbor distance.
    pub std_ratio: f64,
}

impl Default for OutlierParams {
    fn default() -> Self {
        Self {
            neighbors: 8,
            std_ratio: 2.0,
        }
    }
}

/// Cluster the points of `query` whose divergence strictly exceeds
/// `tolerance`.
///
/// Returns an empty vector when no point exceeds the tolerance. Clusters
/// come out in a deterministic order (seeded from the lowest retained
/// point index).
pub fn cluster_defects(
    query: &PointSet,
    field: &DivergenceField,
    tolerance: f64,
    cluster_radius: f64,
) -> Vec<DefectCluster> {
    cluster_defects_with(query, field, tolerance, cluster_radius, &OutlierParams::default())
}

/// [`cluster_defects`] with explicit outlier-removal parameters.
pub fn cluster_defects_with(
    query: &PointSet,
    field: &DivergenceField,
    tolerance: f64,
    cluster_radius: f64,
    outliers: &OutlierParams,
) -> Vec<DefectCluster> {
    debug_assert_eq!(query.len(), field.len());

    let divergent: Vec<Point3<f64>> = query
        .points
        .iter()
        .zip(field.iter())
        .filter(|&(_, &d)| d > tolerance)
        .map(|(p, _)| *p)
        .collect();

    if divergent.is_empty() {
        return Vec::new();
    }

    let retained = remove_statistical_outliers(&divergent, outliers);
    if retained.is_empty() {
        return Vec::new();
    }

    debug!(
        divergent = divergent.len(),
        retained = retained.len(),
        cluster_radius,
        "clustering divergent points"
    );

    let components = connected_components(&retained, cluster_radius);

    components
        .into_iter()
        .map(|indices| {
            let points: Vec<Point3<f64>> = indices.iter().map(|&i| retained[i]).collect();
            let (center, radius) = bounding_sphere(&points);
            DefectCluster {
                points,
                center,
                radius,
            }
        })
        .collect()
}

/// Drop points whose mean distance to their k nearest neighbors exceeds
/// `mean + std_ratio * std` over the whole set. Sets no larger than k are
/// passed through untouched.
fn remove_statistical_outliers(
    points: &[Point3<f64>],
    params: &OutlierParams,
) -> Vec<Point3<f64>> {
    let k = params.neighbors;
    if points.len() <= k {
        return points.to_vec();
    }

    let index = KdTreeIndex::build(points);
    let mut mean_distances = Vec::with_capacity(points.len());
    for p in points {
        // k + 1 because the query point matches itself.
        let neighbors = index.nearest_n(p, k + 1);
        let sum: f64 = neighbors.iter().skip(1).map(|&(_, d)| d).sum();
        mean_distances.push(sum / k as f64);
    }

    let global_mean: f64 = mean_distances.iter().sum::<f64>() / mean_distances.len() as f64;
    let variance: f64 = mean_distances
        .iter()
        .map(|d| (d - global_mean).powi(2))
        .sum::<f64>()
        / mean_distances.len() as f64;
    let threshold = global_mean + params.std_ratio * variance.sqrt();

    points
        .iter()
        .zip(mean_distances.iter())
        .filter(|&(_, &d)| d <= threshold)
        .map(|(p, _)| *p)
        .collect()
}

/// Group points into components connected by chains of hops no longer than
/// `radius`.
fn connected_components(points: &[Point3<f64>], radius: f64) -> Vec<Vec<usize>> {
    let index = KdTreeIndex::build(points);
    let mut visited = vec![false; points.len()];
    let mut components = Vec::new();

    for seed in 0..points.len() {
        if visited[seed] {
            continue;
        }
        let mut component = Vec::new();
        let mut stack = vec![seed];
        visited[seed] = true;
        while let Some(i) = stack.pop() {
            component.push(i);
            for (j, _) in index.within(&points[i], radius) {
                if !visited[j] {
                    visited[j] = true;
                    stack.push(j);
                }
            }
        }
        component.sort_unstable();
        components.push(component);
    }

    components
}

/// Bounding sphere from the extremal pair; single-point (or fully
/// coincident) clusters collapse to a zero-radius sphere.
fn bounding_sphere(points: &[Point3<f64>]) -> (Point3<f64>, f64) {
    match extremal_pair(points) {
        Ok((a, b)) => {
            let center = Point3::from((a.coords + b.coords) / 2.0);
            let radius = (b - center).norm();
            (center, radius)
        }
        Err(_) => (points[0], 0.0),
    }
}
