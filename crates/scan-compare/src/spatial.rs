//! Swappable spatial acceleration structures.
//!
//! The pipeline talks to nearest-neighbor search and convex-hull extraction
//! through the [`NearestNeighborIndex`] and [`ConvexHullComputer`] traits so
//! that a different geometry backend can be substituted without touching the
//! pipeline logic. The default implementations are a `kiddo` k-d tree and an
//! in-crate quickhull.

use nalgebra::{Point3, Vector3};

/// Nearest-neighbor queries over a fixed set of points.
///
/// All distances returned are plain Euclidean (not squared).
pub trait NearestNeighborIndex {
    /// The nearest point to `query`, as (index, distance). None if the
    /// indexed set is empty.
    fn nearest(&self, query: &Point3<f64>) -> Option<(usize, f64)>;

    /// The `n` nearest points to `query`, closest first.
    fn nearest_n(&self, query: &Point3<f64>, n: usize) -> Vec<(usize, f64)>;

    /// All points within `radius` of `query`.
    fn within(&self, query: &Point3<f64>, radius: f64) -> Vec<(usize, f64)>;
}

/// Default [`NearestNeighborIndex`] backed by a `kiddo` k-d tree.
pub struct KdTreeIndex {
    tree: kiddo::KdTree<f64, 3>,
    len: usize,
}

impl KdTreeIndex {
    /// Build an index over the given points. Query results refer back to
    /// indices into this slice.
    pub fn build(points: &[Point3<f64>]) -> Self {
        let mut tree = kiddo::KdTree::new();
        for (i, p) in points.iter().enumerate() {
            tree.add(&[p.x, p.y, p.z], i as u64);
        }
        Self {
            tree,
            len: points.len(),
        }
    }
}

impl NearestNeighborIndex for KdTreeIndex {
    fn nearest(&self, query: &Point3<f64>) -> Option<(usize, f64)> {
        if self.len == 0 {
            return None;
        }
        let hit = self
            .tree
            .nearest_one::<kiddo::SquaredEuclidean>(&[query.x, query.y, query.z]);
        Some((hit.item as usize, hit.distance.sqrt()))
    }

    fn nearest_n(&self, query: &Point3<f64>, n: usize) -> Vec<(usize, f64)> {
        self.tree
            .nearest_n::<kiddo::SquaredEuclidean>(&[query.x, query.y, query.z], n)
            .into_iter()
            .map(|hit| (hit.item as usize, hit.distance.sqrt()))
            .collect()
    }

    fn within(&self, query: &Point3<f64>, radius: f64) -> Vec<(usize, f64)> {
        self.tree
            .within::<kiddo::SquaredEuclidean>(&[query.x, query.y, query.z], radius * radius)
            .into_iter()
            .map(|hit| (hit.item as usize, hit.distance.sqrt()))
            .collect()
    }
}

/// Convex hull extraction over a point set.
pub trait ConvexHullComputer {
    /// Indices of the points lying on the convex hull of `points`.
    ///
    /// Degenerate inputs (collinear or coplanar sets) may conservatively
    /// return every index; callers that only restrict a search to the hull
    /// remain exact in that case.
    fn hull_vertices(&self, points: &[Point3<f64>]) -> Vec<usize>;
}

/// Default [`ConvexHullComputer`]: 3D quickhull.
#[derive(Debug, Default, Clone, Copy)]
pub struct Quickhull;

struct HullFace {
    verts: [usize; 3],
    normal: Vector3<f64>,
    offset: f64,
    outside: Vec<usize>,
    alive: bool,
}

impl HullFace {
    fn new(a: usize, b: usize, c: usize, points: &[Point3<f64>]) -> Self {
        let normal = (points[b] - points[a]).cross(&(points[c] - points[a]));
        let offset = normal.dot(&points[a].coords);
        Self {
            verts: [a, b, c],
            normal,
            offset,
            outside: Vec::new(),
            alive: true,
        }
    }

    #[inline]
    fn distance(&self, p: &Point3<f64>) -> f64 {
        self.normal.dot(&p.coords) - self.offset
    }
}

impl ConvexHullComputer for Quickhull {
    fn hull_vertices(&self, points: &[Point3<f64>]) -> Vec<usize> {
        let n = points.len();
        if n <= 4 {
            return (0..n).collect();
        }

        let (min, max) = bounding_box(points);
        let diag = (max - min).norm();
        let eps = 1e-9 * diag.max(1.0);

        let Some([i0, i1, i2, i3]) = initial_simplex(points, eps) else {
            // Collinear or coplanar set: every point may lie on the hull.
            return (0..n).collect();
        };

        let interior = Point3::from(
            (points[i0].coords + points[i1].coords + points[i2].coords + points[i3].coords) / 4.0,
        );

        let mut faces: Vec<HullFace> = Vec::new();
        for &(a, b, c) in &[(i0, i1, i2), (i0, i1, i3), (i0, i2, i3), (i1, i2, i3)] {
            let mut face = HullFace::new(a, b, c, points);
            if face.distance(&interior) > 0.0 {
                face = HullFace::new(a, c, b, points);
            }
            faces.push(face);
        }

        // Assign every remaining point to the first face it lies outside of.
        for idx in 0..n {
            if idx == i0 || idx == i1 || idx == i2 || idx == i3 {
                continue;
            }
            for face in faces.iter_mut() {
                if face.distance(&points[idx]) > eps {
                    face.outside.push(idx);
                    break;
                }
            }
        }

        loop {
            // Face with the farthest unclaimed outside point.
            let mut pick: Option<(usize, usize, f64)> = None;
            for (fi, face) in faces.iter().enumerate() {
                if !face.alive {
                    continue;
                }
                for &pi in &face.outside {
                    let d = face.distance(&points[pi]);
                    if pick.map_or(true, |(_, _, best)| d > best) {
                        pick = Some((fi, pi, d));
                    }
                }
            }
            let Some((_, apex, _)) = pick else { break };
            let apex_point = points[apex];

            // All alive faces visible from the apex.
            let visible: Vec<usize> = faces
                .iter()
                .enumerate()
                .filter(|(_, f)| f.alive && f.distance(&apex_point) > eps)
                .map(|(fi, _)| fi)
                .collect();

            // Horizon: directed edges of visible faces whose reverse edge is
            // not itself part of a visible face.
            let mut edges: Vec<(usize, usize)> = Vec::new();
            for &fi in &visible {
                let [a, b, c] = faces[fi].verts;
                edges.push((a, b));
                edges.push((b, c));
                edges.push((c, a));
            }
            let horizon: Vec<(usize, usize)> = edges
                .iter()
                .filter(|(u, v)| !edges.contains(&(*v, *u)))
                .copied()
                .collect();

            let mut orphaned: Vec<usize> = Vec::new();
            for &fi in &visible {
                faces[fi].alive = false;
                orphaned.append(&mut faces[fi].outside);
            }

            let first_new = faces.len();
            for (u, v) in horizon {
                faces.push(HullFace::new(u, v, apex, points));
            }

            for pi in orphaned {
                if pi == apex {
                    continue;
                }
                let p = points[pi];
                let mut claimed = false;
                for face in faces[first_new..].iter_mut() {
                    if face.distance(&p) > eps {
                        face.outside.push(pi);
                        claimed = true;
                        break;
                    }
                }
                if !claimed {
                    // The point can also still be outside a surviving face.
                    for face in faces[..first_new].iter_mut() {
                        if face.alive && face.distance(&p) > eps {
                            face.outside.push(pi);
                            break;
                        }
                    }
                }
            }
        }

        let mut on_hull = vec![false; n];
        for face in faces.iter().filter(|f| f.alive) {
            for &v in &face.verts {
                on_hull[v] = true;
            }
        }
        (0..n).filter(|&i| on_hull[i]).collect()
    }
}

fn bounding_box(points: &[Point3<f64>]) -> (Point3<f64>, Point3<f64>) {
    let mut min = points[0];
    let mut max = points[0];
    for p in &points[1..] {
        min.x = min.x.min(p.x);
        min.y = min.y.min(p.y);
        min.z = min.z.min(p.z);
        max.x = max.x.max(p.x);
        max.y = max.y.max(p.y);
        max.z = max.z.max(p.z);
    }
    (min, max)
}

/// Pick four affinely independent points, or None for degenerate sets.
fn initial_simplex(points: &[Point3<f64>], eps: f64) -> Option<[usize; 4]> {
    // Extreme pair along x (falling back to the full bounding box keeps this
    // robust enough for a seed; the iteration fixes any slack).
    let mut i0 = 0;
    let mut i1 = 0;
    for (i, p) in points.iter().enumerate() {
        if p.x < points[i0].x {
            i0 = i;
        }
        if p.x > points[i1].x {
            i1 = i;
        }
    }
    if i0 == i1 || (points[i1] - points[i0]).norm() < eps {
        // Spread may be along another axis.
        let mut best = (0usize, 0usize, 0.0f64);
        for i in 0..points.len().min(64) {
            for j in (i + 1)..points.len() {
                let d = (points[j] - points[i]).norm();
                if d > best.2 {
                    best = (i, j, d);
                }
            }
        }
        if best.2 < eps {
            return None;
        }
        i0 = best.0;
        i1 = best.1;
    }

    let line = points[i1] - points[i0];
    let mut i2 = usize::MAX;
    let mut best_area = eps;
    for (i, p) in points.iter().enumerate() {
        let area = line.cross(&(p - points[i0])).norm();
        if area > best_area {
            best_area = area;
            i2 = i;
        }
    }
    if i2 == usize::MAX {
        return None;
    }

    let normal = line.cross(&(points[i2] - points[i0]));
    let mut i3 = usize::MAX;
    let mut best_vol = eps * normal.norm().max(1.0);
    for (i, p) in points.iter().enumerate() {
        let vol = normal.dot(&(p - points[i0])).abs();
        if vol > best_vol {
            best_vol = vol;
            i3 = i;
        }
    }
    if i3 == usize::MAX {
        return None;
    }

    Some([i0, i1, i2, i3])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kdtree_nearest() {
        let points = vec![
            Point3::new(0.0, 0.0, 0.0),
            Point3::new(1.0, 0.0, 0.0),
            Point3::new(5.0, 5.0, 5.0),
        ];
        let index = KdTreeIndex::build(&points);

        let (idx, dist) = index.nearest(&Point3::new(0.9, 0.0, 0.0)).unwrap();
        assert_eq!(idx, 1);
        assert!((dist - 0.1).abs() < 1e-10);
    }

    #[test]
    fn test_kdtree_nearest_n_ordering() {
        let points = vec![
            Point3::new(0.0, 0.0, 0.0),
            Point3::new(1.0, 0.0, 0.0),
            Point3::new(2.0, 0.0, 0.0),
        ];
        let index = KdTreeIndex::build(&points);

        let hits = index.nearest_n(&Point3::new(0.1, 0.0, 0.0), 2);
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].0, 0);
        assert_eq!(hits[1].0, 1);
    }

    #[test]
    fn test_kdtree_within_radius() {
        let points = vec![
            Point3::new(0.0, 0.0, 0.0),
            Point3::new(0.5, 0.0, 0.0),
            Point3::new(3.0, 0.0, 0.0),
        ];
        let index = KdTreeIndex::build(&points);

        let hits = index.within(&Point3::origin(), 1.0);
        assert_eq!(hits.len(), 2);
        assert!(hits.iter().all(|&(i, _)| i != 2));
    }

    #[test]
    fn test_kdtree_empty() {
        let index = KdTreeIndex::build(&[]);
        assert!(index.nearest(&Point3::origin()).is_none());
    }

    #[test]
    fn test_quickhull_cube_corners() {
        // Cube corners plus interior points: only the 8 corners survive.
        let mut points: Vec<Point3<f64>> = Vec::new();
        for &x in &[0.0, 1.0] {
            for &y in &[0.0, 1.0] {
                for &z in &[0.0, 1.0] {
                    points.push(Point3::new(x, y, z));
                }
            }
        }
        let corner_count = points.len();
        points.push(Point3::new(0.5, 0.5, 0.5));
        points.push(Point3::new(0.3, 0.6, 0.4));

        let hull = Quickhull.hull_vertices(&points);
        assert_eq!(hull.len(), corner_count);
        assert!(hull.iter().all(|&i| i < corner_count));
    }

    #[test]
    fn test_quickhull_tetrahedron_interior_excluded() {
        let points = vec![
            Point3::new(0.0, 0.0, 0.0),
            Point3::new(4.0, 0.0, 0.0),
            Point3::new(0.0, 4.0, 0.0),
            Point3::new(0.0, 0.0, 4.0),
            Point3::new(0.5, 0.5, 0.5),
        ];
        let hull = Quickhull.hull_vertices(&points);
        assert_eq!(hull, vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_quickhull_coplanar_falls_back() {
        let points: Vec<Point3<f64>> = (0..10)
            .map(|i| Point3::new(i as f64, (i * 3 % 7) as f64, 0.0))
            .collect();
        let hull = Quickhull.hull_vertices(&points);
        // Conservative fallback keeps every candidate.
        assert_eq!(hull.len(), points.len());
    }

    #[test]
    fn test_quickhull_sphere_cloud_keeps_extremes() {
        // Deterministic pseudo-random points inside a ball, plus six points
        // on the axes at radius 2. The axis points must be on the hull.
        let mut points = Vec::new();
        let mut state: u64 = 12345;
        let mut next = move || {
            state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            ((state >> 33) as f64 / (1u64 << 31) as f64) - 1.0
        };
        for _ in 0..200 {
            let v = Vector3::new(next(), next(), next());
            if v.norm() <= 1.0 {
                points.push(Point3::from(v));
            }
        }
        let first_axis = points.len();
        for axis in [
            Vector3::x_axis().into_inner(),
            Vector3::y_axis().into_inner(),
            Vector3::z_axis().into_inner(),
        ] {
            points.push(Point3::from(axis * 2.0));
            points.push(Point3::from(axis * -2.0));
        }

        let hull = Quickhull.hull_vertices(&points);
        for i in first_axis..points.len() {
            assert!(hull.contains(&i), "axis extreme {} missing from hull", i);
        }
    }
}
