//! Uniform surface sampling via centroidal relaxation.
//!
//! Samples are initialized by area-weighted random placement over the mesh
//! triangles, then relaxed Lloyd-style: a dense candidate pool stands in
//! for the continuous surface, each candidate is assigned to its nearest
//! sample, and every sample moves to the centroid of its cell (snapped back
//! to the nearest candidate so it stays on the surface). The relaxation
//! stops when samples settle or after a fixed number of rounds.

use nalgebra::Point3;
use tracing::debug;

use crate::error::{CompareError, CompareResult};
use crate::rng::Lcg;
use crate::spatial::{KdTreeIndex, NearestNeighborIndex};
use crate::types::{Mesh, PointSet};

/// Candidate pool density relative to the requested sample count.
const POOL_FACTOR: usize = 8;

/// Relaxation iteration cap.
const MAX_RELAXATION_ROUNDS: usize = 10;

/// Relative movement threshold (fraction of the bounding diagonal) below
/// which the relaxation is considered settled.
const SETTLE_FRACTION: f64 = 1e-3;

/// Sample `count` points approximately uniformly over the mesh surface.
///
/// The mesh is read-only. Fails with `InvalidMesh` if the mesh has no faces
/// or zero surface area.
pub fn sample_surface(mesh: &Mesh, count: usize) -> CompareResult<PointSet> {
    if count == 0 {
        return Err(CompareError::degenerate_input(
            "sample count must be at least 1",
        ));
    }
    if mesh.faces.is_empty() {
        return Err(CompareError::invalid_mesh("mesh has no faces to sample"));
    }

    let areas: Vec<f64> = mesh.triangles().map(|t| t.area()).collect();
    let total_area: f64 = areas.iter().sum();
    if total_area <= 0.0 {
        return Err(CompareError::invalid_mesh("mesh has zero surface area"));
    }

    // Cumulative area table for O(log n) triangle selection.
    let mut cumulative = Vec::with_capacity(areas.len());
    let mut acc = 0.0;
    for a in &areas {
        acc += a;
        cumulative.push(acc);
    }

    let mut rng = Lcg::new(0x5EED_0F5A_3B1E);

    let pool_size = count.saturating_mul(POOL_FACTOR).max(count + 64);
    let candidates = random_surface_points(mesh, &cumulative, total_area, pool_size, &mut rng);

    let mut samples = random_surface_points(mesh, &cumulative, total_area, count, &mut rng);

    let settle_threshold = match mesh.bounds() {
        Some((min, max)) => (max - min).norm() * SETTLE_FRACTION,
        None => return Err(CompareError::invalid_mesh("mesh has no vertices")),
    };

    let candidate_index = KdTreeIndex::build(&candidates);

    for round in 0..MAX_RELAXATION_ROUNDS {
        let sample_index = KdTreeIndex::build(&samples);

        // Accumulate each candidate into its nearest sample's cell.
        let mut sums = vec![nalgebra::Vector3::zeros(); samples.len()];
        let mut counts = vec![0usize; samples.len()];
        for c in &candidates {
            if let Some((si, _)) = sample_index.nearest(c) {
                sums[si] += c.coords;
                counts[si] += 1;
            }
        }

        let mut max_movement = 0.0f64;
        for (si, sample) in samples.iter_mut().enumerate() {
            if counts[si] == 0 {
                continue;
            }
            let centroid = Point3::from(sums[si] / counts[si] as f64);
            // Snap the centroid back onto the sampled surface.
            let snapped = match candidate_index.nearest(&centroid) {
                Some((ci, _)) => candidates[ci],
                None => centroid,
            };
            max_movement = max_movement.max((snapped - *sample).norm());
            *sample = snapped;
        }

        if max_movement < settle_threshold {
            debug!(rounds = round + 1, "surface sampling settled");
            break;
        }
    }

    Ok(PointSet::from_points(samples))
}

/// Draw `count` area-weighted random points on the mesh surface.
fn random_surface_points(
    mesh: &Mesh,
    cumulative: &[f64],
    total_area: f64,
    count: usize,
    rng: &mut Lcg,
) -> Vec<Point3<f64>> {
    let mut points = Vec::with_capacity(count);
    for _ in 0..count {
        let r = rng.next_f64() * total_area;
        let fi = cumulative.partition_point(|&c| c < r).min(mesh.faces.len() - 1);
        let [i0, i1, i2] = mesh.faces[fi];
        let tri = crate::types::Triangle::new(
            mesh.vertices[i0 as usize],
            mesh.vertices[i1 as usize],
            mesh.vertices[i2 as usize],
        );

        let mut u = rng.next_f64();
        let mut v = rng.next_f64();
        if u + v > 1.0 {
            u = 1.0 - u;
            v = 1.0 - v;
        }
        points.push(tri.point_at(u, v));
    }
    points
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quad_mesh() -> Mesh {
        // Unit square in the z=0 plane, two triangles.
        let mut mesh = Mesh::new();
        mesh.vertices.push(Point3::new(0.0, 0.0, 0.0));
        mesh.vertices.push(Point3::new(1.0, 0.0, 0.0));
        mesh.vertices.push(Point3::new(1.0, 1.0, 0.0));
        mesh.vertices.push(Point3::new(0.0, 1.0, 0.0));
        mesh.faces.push([0, 1, 2]);
        mesh.faces.push([0, 2, 3]);
        mesh
    }

    #[test]
    fn test_sample_count_and_bounds() {
        let mesh = quad_mesh();
        let samples = sample_surface(&mesh, 100).unwrap();
        assert_eq!(samples.len(), 100);
        for p in &samples.points {
            assert!((-1e-9..=1.0 + 1e-9).contains(&p.x));
            assert!((-1e-9..=1.0 + 1e-9).contains(&p.y));
            assert!(p.z.abs() < 1e-9);
        }
    }

    #[test]
    fn test_sampling_is_deterministic() {
        let mesh = quad_mesh();
        let a = sample_surface(&mesh, 50).unwrap();
        let b = sample_surface(&mesh, 50).unwrap();
        for (pa, pb) in a.points.iter().zip(b.points.iter()) {
            assert!((pa - pb).norm() < 1e-12);
        }
    }

    #[test]
    fn test_sampling_spreads_over_surface() {
        // After relaxation the samples should cover the square rather than
        // bunch up: split into quadrants, each must be populated.
        let mesh = quad_mesh();
        let samples = sample_surface(&mesh, 200).unwrap();
        let mut quadrants = [0usize; 4];
        for p in &samples.points {
            let qi = (p.x > 0.5) as usize + 2 * (p.y > 0.5) as usize;
            quadrants[qi] += 1;
        }
        for (qi, &n) in quadrants.iter().enumerate() {
            assert!(n > 10, "quadrant {} underpopulated: {}", qi, n);
        }
    }

    #[test]
    fn test_empty_mesh_fails() {
        let mesh = Mesh::new();
        assert!(matches!(
            sample_surface(&mesh, 10),
            Err(CompareError::InvalidMesh { .. })
        ));
    }

    #[test]
    fn test_zero_area_mesh_fails() {
        let mut mesh = Mesh::new();
        mesh.vertices.push(Point3::new(0.0, 0.0, 0.0));
        mesh.vertices.push(Point3::new(1.0, 0.0, 0.0));
        mesh.vertices.push(Point3::new(2.0, 0.0, 0.0));
        mesh.faces.push([0, 1, 2]);
        assert!(matches!(
            sample_surface(&mesh, 10),
            Err(CompareError::InvalidMesh { .. })
        ));
    }

    #[test]
    fn test_zero_count_fails() {
        let mesh = quad_mesh();
        assert!(matches!(
            sample_surface(&mesh, 0),
            Err(CompareError::DegenerateInput { .. })
        ));
    }

    #[test]
    fn test_area_weighting_favors_large_triangle() {
        // One tiny and one large triangle; nearly all samples should land
        // on the large one.
        let mut mesh = Mesh::new();
        mesh.vertices.push(Point3::new(0.0, 0.0, 0.0));
        mesh.vertices.push(Point3::new(0.01, 0.0, 0.0));
        mesh.vertices.push(Point3::new(0.0, 0.01, 0.0));
        mesh.vertices.push(Point3::new(10.0, 0.0, 5.0));
        mesh.vertices.push(Point3::new(20.0, 0.0, 5.0));
        mesh.vertices.push(Point3::new(10.0, 10.0, 5.0));
        mesh.faces.push([0, 1, 2]);
        mesh.faces.push([3, 4, 5]);

        let samples = sample_surface(&mesh, 100).unwrap();
        let on_large = samples
            .points
            .iter()
            .filter(|p| (p.z - 5.0).abs() < 1e-9)
            .count();
        assert!(on_large > 95, "only {} samples on the large face", on_large);
    }

    #[test]
    fn test_mesh_unchanged_by_sampling() {
        let mesh = quad_mesh();
        let before = mesh.vertices.clone();
        let _ = sample_surface(&mesh, 20).unwrap();
        for (a, b) in mesh.vertices.iter().zip(before.iter()) {
            assert_eq!(a, b);
        }
    }
}
