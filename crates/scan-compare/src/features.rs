//! Feature-based coarse rigid registration.
//!
//! Both point sets are voxel down-sampled, given PCA-estimated normals, and
//! described by fast point feature histograms (FPFH) over a radius of
//! `FEATURE_RADIUS_FACTOR × voxel_size`. Nearest-descriptor correspondences
//! then drive a deterministic RANSAC search for the rigid transform with
//! the most geometrically consistent matches. The result is a coarse
//! alignment meant only to seed refinement.

use std::collections::BTreeMap;

use nalgebra::{Matrix3, Point3, Vector3};
use rayon::prelude::*;
use tracing::{debug, warn};

use crate::error::{CompareError, CompareResult, InputSide};
use crate::rng::Lcg;
use crate::spatial::{KdTreeIndex, NearestNeighborIndex};
use crate::transform::{kabsch, RigidTransform};
use crate::types::PointSet;

/// Bins per angle feature; three angles make up the descriptor.
const ANGLE_BINS: usize = 11;

/// Descriptor length.
pub const DESCRIPTOR_LEN: usize = 3 * ANGLE_BINS;

/// A fixed-length local geometry descriptor, order-paired with its
/// down-sampled source point.
pub type FeatureDescriptor = [f64; DESCRIPTOR_LEN];

/// Parameters for coarse feature registration.
#[derive(Debug, Clone)]
pub struct FeatureParams {
    /// Neighbors used for PCA normal estimation.
    pub normal_neighbors: usize,

    /// Descriptor support radius as a multiple of the voxel size.
    pub feature_radius_factor: f64,

    /// Correspondence inlier threshold as a multiple of the voxel size.
    pub inlier_threshold_factor: f64,

    /// RANSAC iteration cap.
    pub max_iterations: usize,

    /// Minimum viable down-sampled point count on each side.
    pub min_feature_count: usize,
}

impl Default for FeatureParams {
    fn default() -> Self {
        Self {
            normal_neighbors: 30,
            feature_radius_factor: 5.0,
            inlier_threshold_factor: 0.5,
            max_iterations: 64,
            min_feature_count: 10,
        }
    }
}

impl FeatureParams {
    /// Set the RANSAC iteration cap.
    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations.max(1);
        self
    }

    /// Set the minimum down-sampled feature count.
    pub fn with_min_feature_count(mut self, count: usize) -> Self {
        self.min_feature_count = count;
        self
    }
}

/// Coarsely align `source` to `target` by feature correspondence search.
///
/// Fails with `InsufficientFeatures` if voxel down-sampling leaves fewer
/// than `params.min_feature_count` points on either side.
pub fn register_features(
    source: &PointSet,
    target: &PointSet,
    voxel_size: f64,
    params: &FeatureParams,
) -> CompareResult<RigidTransform> {
    let source_down = voxel_downsample(&source.points, voxel_size);
    let target_down = voxel_downsample(&target.points, voxel_size);

    if source_down.len() < params.min_feature_count {
        return Err(CompareError::insufficient_features(
            InputSide::Source,
            source_down.len(),
            params.min_feature_count,
        ));
    }
    if target_down.len() < params.min_feature_count {
        return Err(CompareError::insufficient_features(
            InputSide::Target,
            target_down.len(),
            params.min_feature_count,
        ));
    }

    debug!(
        source = source_down.len(),
        target = target_down.len(),
        voxel_size,
        "down-sampled point sets for feature registration"
    );

    let radius = params.feature_radius_factor * voxel_size;
    let source_normals = estimate_normals(&source_down, params.normal_neighbors);
    let target_normals = estimate_normals(&target_down, params.normal_neighbors);
    let source_features = compute_descriptors(&source_down, &source_normals, radius);
    let target_features = compute_descriptors(&target_down, &target_normals, radius);

    // One correspondence per source point: its nearest target descriptor.
    let correspondences: Vec<(usize, usize)> = source_features
        .par_iter()
        .enumerate()
        .map(|(si, sf)| {
            let mut best = 0usize;
            let mut best_d = f64::INFINITY;
            for (ti, tf) in target_features.iter().enumerate() {
                let d = descriptor_distance_sq(sf, tf);
                if d < best_d {
                    best_d = d;
                    best = ti;
                }
            }
            (si, best)
        })
        .collect();

    let threshold = params.inlier_threshold_factor * voxel_size;
    let transform = ransac_alignment(
        &source_down,
        &target_down,
        &correspondences,
        threshold,
        params.max_iterations,
    );

    Ok(transform)
}

/// Reduce a point set to one averaged representative per occupied voxel.
///
/// Voxels are visited in grid order, so the output ordering is stable.
pub fn voxel_downsample(points: &[Point3<f64>], voxel_size: f64) -> Vec<Point3<f64>> {
    if points.is_empty() || voxel_size <= 0.0 {
        return points.to_vec();
    }

    let mut min = points[0];
    for p in &points[1..] {
        min.x = min.x.min(p.x);
        min.y = min.y.min(p.y);
        min.z = min.z.min(p.z);
    }

    let mut voxels: BTreeMap<(i64, i64, i64), (Vector3<f64>, usize)> = BTreeMap::new();
    for p in points {
        let key = (
            ((p.x - min.x) / voxel_size).floor() as i64,
            ((p.y - min.y) / voxel_size).floor() as i64,
            ((p.z - min.z) / voxel_size).floor() as i64,
        );
        let entry = voxels.entry(key).or_insert((Vector3::zeros(), 0));
        entry.0 += p.coords;
        entry.1 += 1;
    }

    voxels
        .values()
        .map(|(sum, count)| Point3::from(sum / *count as f64))
        .collect()
}

/// Estimate a unit normal per point from the PCA of its k-neighborhood,
/// oriented away from the set centroid.
pub fn estimate_normals(points: &[Point3<f64>], k: usize) -> Vec<Vector3<f64>> {
    if points.is_empty() {
        return Vec::new();
    }

    let index = KdTreeIndex::build(points);
    let k = k.min(points.len());

    let centroid: Vector3<f64> =
        points.iter().map(|p| p.coords).sum::<Vector3<f64>>() / points.len() as f64;

    points
        .par_iter()
        .map(|p| {
            let neighbors = index.nearest_n(p, k);

            let local_centroid: Vector3<f64> = neighbors
                .iter()
                .map(|&(i, _)| points[i].coords)
                .sum::<Vector3<f64>>()
                / neighbors.len() as f64;

            let mut cov = Matrix3::zeros();
            for &(i, _) in &neighbors {
                let d = points[i].coords - local_centroid;
                cov += d * d.transpose();
            }

            let eig = cov.symmetric_eigen();
            let mut min_idx = 0;
            for i in 1..3 {
                if eig.eigenvalues[i] < eig.eigenvalues[min_idx] {
                    min_idx = i;
                }
            }

            let mut normal = eig.eigenvectors.column(min_idx).into_owned();
            let norm = normal.norm();
            if norm > 1e-10 {
                normal /= norm;
            } else {
                normal = Vector3::z();
            }

            // Consistent orientation: point away from the set centroid.
            if normal.dot(&(p.coords - centroid)) < 0.0 {
                normal = -normal;
            }
            normal
        })
        .collect()
}

/// Compute FPFH descriptors over the given support radius.
///
/// Each point's simplified histogram (SPFH) bins the three Darboux-frame
/// angles against its radius neighbors; the final descriptor blends in the
/// neighbors' SPFHs weighted by inverse distance, then normalizes.
pub fn compute_descriptors(
    points: &[Point3<f64>],
    normals: &[Vector3<f64>],
    radius: f64,
) -> Vec<FeatureDescriptor> {
    let index = KdTreeIndex::build(points);

    // Neighbor lists are reused by both passes.
    let neighborhoods: Vec<Vec<(usize, f64)>> = points
        .par_iter()
        .map(|p| {
            index
                .within(p, radius)
                .into_iter()
                .filter(|&(_, d)| d > 1e-12)
                .collect()
        })
        .collect();

    let spfh: Vec<FeatureDescriptor> = points
        .par_iter()
        .enumerate()
        .map(|(i, p)| {
            let mut hist = [0.0f64; DESCRIPTOR_LEN];
            let mut count = 0usize;
            for &(j, dist) in &neighborhoods[i] {
                if let Some((alpha, phi, theta)) =
                    darboux_angles(p, &normals[i], &points[j], &normals[j], dist)
                {
                    hist[bin_unit(alpha)] += 1.0;
                    hist[ANGLE_BINS + bin_unit(phi)] += 1.0;
                    hist[2 * ANGLE_BINS + bin_angle(theta)] += 1.0;
                    count += 1;
                }
            }
            if count > 0 {
                for h in &mut hist {
                    *h /= count as f64;
                }
            }
            hist
        })
        .collect();

    (0..points.len())
        .into_par_iter()
        .map(|i| {
            let mut fpfh = spfh[i];
            let k = neighborhoods[i].len();
            if k > 0 {
                for &(j, dist) in &neighborhoods[i] {
                    let weight = 1.0 / (k as f64 * dist);
                    for b in 0..DESCRIPTOR_LEN {
                        fpfh[b] += weight * spfh[j][b];
                    }
                }
            }
            let sum: f64 = fpfh.iter().sum();
            if sum > 0.0 {
                for h in &mut fpfh {
                    *h /= sum;
                }
            }
            fpfh
        })
        .collect()
}

/// The three pair angles of the Darboux frame between two oriented points.
fn darboux_angles(
    p_i: &Point3<f64>,
    n_i: &Vector3<f64>,
    p_j: &Point3<f64>,
    n_j: &Vector3<f64>,
    dist: f64,
) -> Option<(f64, f64, f64)> {
    let d = (p_j - p_i) / dist;
    let u = *n_i;
    let v = u.cross(&d);
    let v_norm = v.norm();
    if v_norm < 1e-10 {
        return None;
    }
    let v = v / v_norm;
    let w = u.cross(&v);

    let alpha = v.dot(n_j);
    let phi = u.dot(&d);
    let theta = w.dot(n_j).atan2(u.dot(n_j));
    Some((alpha, phi, theta))
}

/// Bin a value in [-1, 1].
#[inline]
fn bin_unit(value: f64) -> usize {
    (((value + 1.0) / 2.0 * ANGLE_BINS as f64) as usize).min(ANGLE_BINS - 1)
}

/// Bin an angle in [-pi, pi].
#[inline]
fn bin_angle(value: f64) -> usize {
    ((((value + std::f64::consts::PI) / (2.0 * std::f64::consts::PI)) * ANGLE_BINS as f64)
        as usize)
        .min(ANGLE_BINS - 1)
}

#[inline]
fn descriptor_distance_sq(a: &FeatureDescriptor, b: &FeatureDescriptor) -> f64 {
    let mut sum = 0.0;
    for i in 0..DESCRIPTOR_LEN {
        let d = a[i] - b[i];
        sum += d * d;
    }
    sum
}

/// Deterministic RANSAC over descriptor correspondences.
///
/// Draws 3-point samples with a fixed-seed generator, fits a rigid
/// transform to each, and keeps the one with the most correspondences
/// landing within `threshold`. The winner is refit on its inliers.
fn ransac_alignment(
    source: &[Point3<f64>],
    target: &[Point3<f64>],
    correspondences: &[(usize, usize)],
    threshold: f64,
    max_iterations: usize,
) -> RigidTransform {
    let n = correspondences.len();
    if n < 3 {
        warn!("too few correspondences for a transform sample; using direct fit");
        let (src, tgt) = gather(source, target, correspondences);
        return kabsch(&src, &tgt, false);
    }

    let mut rng = Lcg::new(0xC0A2_5E21);
    let mut best_inliers: Vec<(usize, usize)> = Vec::new();

    for _ in 0..max_iterations {
        let a = rng.next_index(n);
        let b = rng.next_index(n);
        let c = rng.next_index(n);
        if a == b || b == c || a == c {
            continue;
        }

        let sample = [correspondences[a], correspondences[b], correspondences[c]];
        let src: Vec<_> = sample.iter().map(|&(s, _)| source[s]).collect();
        let tgt: Vec<_> = sample.iter().map(|&(_, t)| target[t]).collect();

        // Nearly collinear samples give unstable rotations.
        let area = (src[1] - src[0]).cross(&(src[2] - src[0])).norm();
        if area < 1e-10 {
            continue;
        }

        let candidate = kabsch(&src, &tgt, false);

        let inliers: Vec<(usize, usize)> = correspondences
            .iter()
            .filter(|&&(s, t)| {
                (candidate.transform_point(&source[s]) - target[t]).norm() < threshold
            })
            .copied()
            .collect();

        if inliers.len() > best_inliers.len() {
            best_inliers = inliers;
        }
    }

    if best_inliers.len() >= 3 {
        debug!(
            inliers = best_inliers.len(),
            total = n,
            "coarse alignment consensus"
        );
        let (src, tgt) = gather(source, target, &best_inliers);
        kabsch(&src, &tgt, false)
    } else {
        warn!("no transform sample reached consensus; fitting all correspondences");
        let (src, tgt) = gather(source, target, correspondences);
        kabsch(&src, &tgt, false)
    }
}

fn gather(
    source: &[Point3<f64>],
    target: &[Point3<f64>],
    correspondences: &[(usize, usize)],
) -> (Vec<Point3<f64>>, Vec<Point3<f64>>) {
    correspondences
        .iter()
        .map(|&(s, t)| (source[s], target[t]))
        .unzip()
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::UnitQuaternion;

    fn grid_cloud(n: usize, spacing: f64) -> Vec<Point3<f64>> {
        // Points on the surface of an n x n x n box shell.
        let mut points = Vec::new();
        let side = (n - 1) as f64 * spacing;
        for i in 0..n {
            for j in 0..n {
                let (a, b) = (i as f64 * spacing, j as f64 * spacing);
                points.push(Point3::new(a, b, 0.0));
                points.push(Point3::new(a, b, side));
                points.push(Point3::new(a, 0.0, b));
                points.push(Point3::new(a, side, b));
                points.push(Point3::new(0.0, a, b));
                points.push(Point3::new(side, a, b));
            }
        }
        points
    }

    #[test]
    fn test_voxel_downsample_reduces_and_stays_in_bounds() {
        let points = grid_cloud(8, 1.0);
        let down = voxel_downsample(&points, 2.0);
        assert!(down.len() < points.len());
        assert!(!down.is_empty());
        for p in &down {
            assert!(p.x >= -1e-9 && p.x <= 7.0 + 1e-9);
        }
    }

    #[test]
    fn test_voxel_downsample_is_deterministic() {
        let points = grid_cloud(6, 1.0);
        let a = voxel_downsample(&points, 1.5);
        let b = voxel_downsample(&points, 1.5);
        assert_eq!(a.len(), b.len());
        for (pa, pb) in a.iter().zip(b.iter()) {
            assert_eq!(pa, pb);
        }
    }

    #[test]
    fn test_normals_on_plane_are_vertical() {
        let mut points = Vec::new();
        for i in 0..10 {
            for j in 0..10 {
                points.push(Point3::new(i as f64, j as f64, 0.0));
            }
        }
        let normals = estimate_normals(&points, 8);
        for n in &normals {
            assert!(
                n.z.abs() > 0.99,
                "plane normal should be near ±z, got {:?}",
                n
            );
        }
    }

    #[test]
    fn test_descriptor_invariance_under_rigid_motion() {
        let points = grid_cloud(6, 1.0);
        let normals = estimate_normals(&points, 12);
        let features = compute_descriptors(&points, &normals, 2.5);

        let motion = RigidTransform {
            scale: 1.0,
            rotation: UnitQuaternion::from_axis_angle(&Vector3::z_axis(), 0.8),
            translation: Vector3::new(10.0, -4.0, 2.0),
        };
        let moved: Vec<_> = points.iter().map(|p| motion.transform_point(p)).collect();
        let moved_normals = estimate_normals(&moved, 12);
        let moved_features = compute_descriptors(&moved, &moved_normals, 2.5);

        // Same point, same local geometry: descriptors should be close.
        let mut total = 0.0;
        for (f, g) in features.iter().zip(moved_features.iter()) {
            total += descriptor_distance_sq(f, g).sqrt();
        }
        let mean = total / features.len() as f64;
        assert!(mean < 0.05, "mean descriptor drift {} too large", mean);
    }

    #[test]
    fn test_register_recovers_rigid_offset() {
        let points = grid_cloud(8, 1.0);
        let source = PointSet::from_points(points.clone());

        let truth = RigidTransform {
            scale: 1.0,
            rotation: UnitQuaternion::from_axis_angle(&Vector3::z_axis(), 0.5),
            translation: Vector3::new(3.0, 1.0, -2.0),
        };
        let target = PointSet::from_points(
            points.iter().map(|p| truth.transform_point(p)).collect(),
        );

        let voxel = 0.8;
        let transform =
            register_features(&source, &target, voxel, &FeatureParams::default()).unwrap();

        // Coarse contract: after the transform, most source points should
        // lie close to SOME target point. (The box shell is symmetric, so
        // the recovered rotation may legitimately differ from `truth` by a
        // symmetry of the box.)
        let index = KdTreeIndex::build(&target.points);
        let mut close = 0usize;
        for p in &source.points {
            let aligned = transform.transform_point(p);
            if let Some((_, d)) = index.nearest(&aligned) {
                if d < voxel {
                    close += 1;
                }
            }
        }
        assert!(
            close * 2 > source.len(),
            "only {}/{} points coarsely aligned",
            close,
            source.len()
        );
    }

    #[test]
    fn test_insufficient_features_error_names_side() {
        let source = PointSet::from_points(vec![Point3::origin(); 5]);
        let target = PointSet::from_points(grid_cloud(6, 1.0));
        let result = register_features(&source, &target, 1.0, &FeatureParams::default());
        match result {
            Err(CompareError::InsufficientFeatures { side, .. }) => {
                assert_eq!(side, InputSide::Source);
            }
            _ => panic!("expected InsufficientFeatures"),
        }
    }
}
