//! Geometric comparison of 3D surface scans.
//!
//! This crate compares two independently produced surface representations
//! of nominally the same physical object (an as-built scan against a
//! reference design) and reports where the surfaces diverge: additions,
//! omissions, or deformations.
//!
//! # Pipeline
//!
//! 1. **Sample** both mesh surfaces into uniform point sets (centroidal
//!    relaxation).
//! 2. **Normalize scale** using each sample's extremal (diametral) pair.
//! 3. **Coarse-align** with rotation-invariant local feature descriptors
//!    and a correspondence consensus search.
//! 4. **Refine** with iterative probabilistic rigid registration,
//!    reporting per-iteration progress.
//! 5. **Measure** per-point divergence fields in both directions.
//! 6. **Cluster** divergent regions into discrete defects with bounding
//!    spheres.
//!
//! # Quick Start
//!
//! ```no_run
//! use scan_compare::{compare, load_mesh, CompareParams};
//!
//! let source = load_mesh("as_built.stl").unwrap();
//! let target = load_mesh("reference.ply").unwrap();
//!
//! let result = compare(&source, &target, 0.5, &CompareParams::default()).unwrap();
//!
//! println!(
//!     "{} added regions, {} missing regions",
//!     result.forward_clusters.len(),
//!     result.backward_clusters.len()
//! );
//! for cluster in &result.forward_clusters {
//!     println!(
//!         "defect at ({:.1}, {:.1}, {:.1}), radius {:.2}",
//!         cluster.center.x, cluster.center.y, cluster.center.z, cluster.radius
//!     );
//! }
//! ```
//!
//! # Progress reporting
//!
//! The refinement stage accepts a synchronous callback invoked between
//! iterations, which a front-end can use to redraw or report progress:
//!
//! ```no_run
//! use scan_compare::{compare_with_progress, load_mesh, CompareParams};
//!
//! let source = load_mesh("as_built.stl").unwrap();
//! let target = load_mesh("reference.stl").unwrap();
//!
//! let mut hook = |iteration: usize, _points: &[nalgebra::Point3<f64>], max: usize| {
//!     eprintln!("refining {}/{}", iteration + 1, max);
//! };
//! let result = compare_with_progress(
//!     &source,
//!     &target,
//!     0.5,
//!     &CompareParams::default(),
//!     Some(&mut hook),
//! )
//! .unwrap();
//! # let _ = result;
//! ```
//!
//! # Determinism
//!
//! Every stage is deterministic given its inputs: pseudo-random draws use
//! fixed seeds and internal parallelism never affects results. A failed
//! registration indicates unsuitable input data, not a transient
//! condition, so nothing is retried.

mod error;
mod rng;
mod transform;
mod types;

pub mod defects;
pub mod divergence;
pub mod extremal;
pub mod features;
pub mod io;
pub mod pipeline;
pub mod refine;
pub mod sample;
pub mod spatial;

// Re-export core types at the crate root.
pub use error::{CompareError, CompareResult, InputSide};
pub use transform::{kabsch, RigidTransform};
pub use types::{Mesh, PointSet, Triangle};

// Re-export the main operations.
pub use defects::{cluster_defects, cluster_defects_with, DefectCluster, OutlierParams};
pub use divergence::{divergence_field, mean_pairwise_distance, DivergenceField};
pub use extremal::{extremal_pair, extremal_pair_with};
pub use features::{
    compute_descriptors, estimate_normals, register_features, voxel_downsample,
    FeatureDescriptor, FeatureParams,
};
pub use io::{load_mesh, save_mesh, MeshFormat};
pub use pipeline::{
    compare, compare_with_progress, normalization_transform, CompareParams, ComparisonResult,
    CLUSTER_SPACING_FACTOR, VOXEL_DIVISOR,
};
pub use refine::{refine_alignment, ProgressHook, RefineParams, RefineResult};
pub use sample::sample_surface;
pub use spatial::{ConvexHullComputer, KdTreeIndex, NearestNeighborIndex, Quickhull};

// Convenience methods on Mesh.
impl Mesh {
    /// Load a mesh from a file, auto-detecting format from the extension.
    pub fn load(path: impl AsRef<std::path::Path>) -> CompareResult<Self> {
        io::load_mesh(path)
    }

    /// Save the mesh to a file, auto-detecting format from the extension.
    pub fn save(&self, path: impl AsRef<std::path::Path>) -> CompareResult<()> {
        io::save_mesh(self, path)
    }

    /// Sample the mesh surface into an approximately uniform point set.
    pub fn sample(&self, count: usize) -> CompareResult<PointSet> {
        sample::sample_surface(self, count)
    }

    /// Compare this mesh (as the as-built source) against a reference
    /// target with default parameters.
    pub fn compare_to(
        &self,
        target: &Mesh,
        tolerance: f64,
    ) -> CompareResult<pipeline::ComparisonResult> {
        pipeline::compare(self, target, tolerance, &CompareParams::default())
    }
}
