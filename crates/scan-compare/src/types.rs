//! Core geometry types: triangle meshes and point sets.

use nalgebra::{Point3, Vector3};

use crate::error::{CompareError, CompareResult};

/// A triangle mesh with indexed vertices and faces.
///
/// Vertex positions are only mutated wholesale via [`Mesh::set_vertices`],
/// which the comparison pipeline uses to write back aligned coordinates.
/// Units are whatever the scan was exported in; the pipeline normalizes
/// scale internally before registration.
#[derive(Debug, Clone)]
pub struct Mesh {
    /// Vertex positions.
    pub vertices: Vec<Point3<f64>>,

    /// Triangle faces as indices into the vertex array.
    pub faces: Vec<[u32; 3]>,
}

impl Mesh {
    /// Create a new empty mesh.
    pub fn new() -> Self {
        Self {
            vertices: Vec::new(),
            faces: Vec::new(),
        }
    }

    /// Create a mesh with pre-allocated capacity.
    pub fn with_capacity(vertex_count: usize, face_count: usize) -> Self {
        Self {
            vertices: Vec::with_capacity(vertex_count),
            faces: Vec::with_capacity(face_count),
        }
    }

    /// Number of vertices in the mesh.
    #[inline]
    pub fn vertex_count(&self) -> usize {
        self.vertices.len()
    }

    /// Number of faces (triangles) in the mesh.
    #[inline]
    pub fn face_count(&self) -> usize {
        self.faces.len()
    }

    /// Check if the mesh is empty (no vertices or faces).
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.vertices.is_empty() || self.faces.is_empty()
    }

    /// Replace the vertex array with new positions.
    ///
    /// This is the only sanctioned way to move a mesh after alignment: the
    /// face topology is untouched, so the replacement must have the same
    /// length as the current vertex array.
    pub fn set_vertices(&mut self, vertices: Vec<Point3<f64>>) -> CompareResult<()> {
        if vertices.len() != self.vertices.len() {
            return Err(CompareError::invalid_mesh(format!(
                "vertex replacement length {} does not match mesh vertex count {}",
                vertices.len(),
                self.vertices.len()
            )));
        }
        self.vertices = vertices;
        Ok(())
    }

    /// Compute the axis-aligned bounding box.
    /// Returns (min_corner, max_corner) or None if the mesh has no vertices.
    pub fn bounds(&self) -> Option<(Point3<f64>, Point3<f64>)> {
        if self.vertices.is_empty() {
            return None;
        }

        let mut min = self.vertices[0];
        let mut max = self.vertices[0];

        for p in &self.vertices[1..] {
            min.x = min.x.min(p.x);
            min.y = min.y.min(p.y);
            min.z = min.z.min(p.z);
            max.x = max.x.max(p.x);
            max.y = max.y.max(p.y);
            max.z = max.z.max(p.z);
        }

        Some((min, max))
    }

    /// Iterate over triangles, yielding [`Triangle`] structs with actual
    /// vertex positions.
    pub fn triangles(&self) -> impl Iterator<Item = Triangle> + '_ {
        self.faces.iter().map(|&[i0, i1, i2]| Triangle {
            v0: self.vertices[i0 as usize],
            v1: self.vertices[i1 as usize],
            v2: self.vertices[i2 as usize],
        })
    }

    /// Compute the total surface area of the mesh.
    pub fn surface_area(&self) -> f64 {
        self.triangles().map(|tri| tri.area()).sum()
    }

    /// Validate structural invariants: in-range face indices and finite
    /// coordinates.
    pub fn validate(&self) -> CompareResult<()> {
        for (vi, p) in self.vertices.iter().enumerate() {
            if !p.x.is_finite() || !p.y.is_finite() || !p.z.is_finite() {
                return Err(CompareError::invalid_mesh(format!(
                    "vertex {} has a non-finite coordinate",
                    vi
                )));
            }
        }
        let n = self.vertices.len() as u32;
        for (fi, face) in self.faces.iter().enumerate() {
            if face.iter().any(|&i| i >= n) {
                return Err(CompareError::invalid_mesh(format!(
                    "face {} references a vertex out of range (mesh has {} vertices)",
                    fi, n
                )));
            }
        }
        Ok(())
    }
}

impl Default for Mesh {
    fn default() -> Self {
        Self::new()
    }
}

/// A triangle with concrete vertex positions.
#[derive(Debug, Clone, Copy)]
pub struct Triangle {
    pub v0: Point3<f64>,
    pub v1: Point3<f64>,
    pub v2: Point3<f64>,
}

impl Triangle {
    /// Create a new triangle from three points.
    #[inline]
    pub fn new(v0: Point3<f64>, v1: Point3<f64>, v2: Point3<f64>) -> Self {
        Self { v0, v1, v2 }
    }

    /// Compute the (unnormalized) face normal via cross product.
    #[inline]
    pub fn normal_unnormalized(&self) -> Vector3<f64> {
        let e1 = self.v1 - self.v0;
        let e2 = self.v2 - self.v0;
        e1.cross(&e2)
    }

    /// Compute the area of the triangle.
    #[inline]
    pub fn area(&self) -> f64 {
        self.normal_unnormalized().norm() * 0.5
    }

    /// Compute the centroid.
    #[inline]
    pub fn centroid(&self) -> Point3<f64> {
        Point3::new(
            (self.v0.x + self.v1.x + self.v2.x) / 3.0,
            (self.v0.y + self.v1.y + self.v2.y) / 3.0,
            (self.v0.z + self.v1.z + self.v2.z) / 3.0,
        )
    }

    /// Map barycentric coordinates (u, v) onto the triangle surface.
    ///
    /// Expects u + v <= 1; the caller folds samples outside that range back
    /// into the triangle.
    #[inline]
    pub fn point_at(&self, u: f64, v: f64) -> Point3<f64> {
        let w = 1.0 - u - v;
        Point3::from(self.v0.coords * w + self.v1.coords * u + self.v2.coords * v)
    }
}

/// An ordered set of 3D points with no face structure.
///
/// Produced by sampling a [`Mesh`] surface or extracting its vertices.
/// All coordinates are finite.
#[derive(Debug, Clone)]
pub struct PointSet {
    /// The points, in a stable order.
    pub points: Vec<Point3<f64>>,
}

impl PointSet {
    /// Create an empty point set.
    pub fn new() -> Self {
        Self { points: Vec::new() }
    }

    /// Create a point set from a vector of positions.
    pub fn from_points(points: Vec<Point3<f64>>) -> Self {
        Self { points }
    }

    /// Extract the vertices of a mesh as a point set.
    pub fn from_mesh(mesh: &Mesh) -> Self {
        Self {
            points: mesh.vertices.clone(),
        }
    }

    /// Number of points.
    #[inline]
    pub fn len(&self) -> usize {
        self.points.len()
    }

    /// Check if the set is empty.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Compute the centroid, or None for an empty set.
    pub fn centroid(&self) -> Option<Point3<f64>> {
        if self.points.is_empty() {
            return None;
        }
        let sum: Vector3<f64> = self
            .points
            .iter()
            .map(|p| p.coords)
            .fold(Vector3::zeros(), |acc, v| acc + v);
        Some(Point3::from(sum / self.points.len() as f64))
    }

    /// Translate all points by the given vector.
    pub fn translate(&mut self, offset: Vector3<f64>) {
        for p in &mut self.points {
            *p += offset;
        }
    }

    /// Scale all points uniformly around the origin.
    pub fn scale(&mut self, factor: f64) {
        for p in &mut self.points {
            p.coords *= factor;
        }
    }
}

impl Default for PointSet {
    fn default() -> Self {
        Self::new()
    }
}
