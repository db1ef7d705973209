//! The full surface comparison pipeline.
//!
//! Orchestrates the other components in a fixed sequence: sample both
//! meshes, normalize scale, coarse-align by features, refine by
//! probabilistic registration, re-sample densely, compute divergence
//! fields in both directions, and cluster defects in both directions.
//! Every `compare` call works on its own copies; the input meshes are
//! never mutated.

use nalgebra::Point3;
use tracing::info;

use crate::defects::{cluster_defects_with, DefectCluster, OutlierParams};
use crate::divergence::{divergence_field, mean_pairwise_distance, DivergenceField};
use crate::error::CompareResult;
use crate::extremal::extremal_pair;
use crate::features::{register_features, FeatureParams};
use crate::refine::{refine_alignment, ProgressHook, RefineParams};
use crate::sample::sample_surface;
use crate::transform::RigidTransform;
use crate::types::{Mesh, PointSet};

/// Voxel size divisor: the feature-search voxel edge is the mean pairwise
/// sample distance divided by this. Empirically chosen in the lineage of
/// this pipeline; overridable, not derived.
pub const VOXEL_DIVISOR: f64 = 24.0;

/// Clustering radius multiplier over the mean sample spacing. Empirical,
/// like [`VOXEL_DIVISOR`].
pub const CLUSTER_SPACING_FACTOR: f64 = 3.0;

/// The clustering radius handed to the defect clusterer is the spacing
/// product divided by this.
pub const CLUSTER_RADIUS_HALVING: f64 = 2.0;

/// Parameters for a comparison run.
#[derive(Debug, Clone)]
pub struct CompareParams {
    /// Sample count per mesh for alignment.
    pub alignment_samples: usize,

    /// Sample count per mesh for divergence computation.
    pub divergence_samples: usize,

    /// See [`VOXEL_DIVISOR`].
    pub voxel_divisor: f64,

    /// See [`CLUSTER_SPACING_FACTOR`].
    pub cluster_spacing_factor: f64,

    /// Coarse registration parameters.
    pub features: FeatureParams,

    /// Refinement registration parameters.
    pub refine: RefineParams,

    /// Statistical outlier removal inside the clusterer.
    pub outliers: OutlierParams,
}

impl Default for CompareParams {
    fn default() -> Self {
        Self {
            alignment_samples: 2000,
            divergence_samples: 6000,
            voxel_divisor: VOXEL_DIVISOR,
            cluster_spacing_factor: CLUSTER_SPACING_FACTOR,
            features: FeatureParams::default(),
            refine: RefineParams::default(),
            outliers: OutlierParams::default(),
        }
    }
}

impl CompareParams {
    /// Set the alignment sample count.
    pub fn with_alignment_samples(mut self, count: usize) -> Self {
        self.alignment_samples = count.max(1);
        self
    }

    /// Set the divergence sample count.
    pub fn with_divergence_samples(mut self, count: usize) -> Self {
        self.divergence_samples = count.max(1);
        self
    }

    /// Set the refinement parameters.
    pub fn with_refine(mut self, refine: RefineParams) -> Self {
        self.refine = refine;
        self
    }

    /// Set the coarse registration parameters.
    pub fn with_features(mut self, features: FeatureParams) -> Self {
        self.features = features;
        self
    }
}

/// Everything a presentation layer needs from one comparison run.
#[derive(Debug)]
pub struct ComparisonResult {
    /// The source mesh after alignment onto the target.
    pub aligned_source: Mesh,

    /// Divergence per aligned source vertex, against the dense target
    /// sample.
    pub forward_field: DivergenceField,

    /// Divergence per target vertex, against the dense aligned-source
    /// sample.
    pub backward_field: DivergenceField,

    /// Defects present on the source but not the target (additions).
    pub forward_clusters: Vec<DefectCluster>,

    /// Defects present on the target but not the source (omissions).
    pub backward_clusters: Vec<DefectCluster>,

    /// Composed transform mapping original source coordinates onto the
    /// target frame (normalization, coarse, and refinement).
    pub transform: RigidTransform,

    /// Source sample diameter before normalization.
    pub source_diameter: f64,

    /// Target sample diameter.
    pub target_diameter: f64,

    /// Whether refinement converged before its iteration cap.
    pub refine_converged: bool,

    /// Refinement iterations performed.
    pub refine_iterations: usize,
}

/// Compute the scale-normalization transform for a source sample set:
/// translate by the extremal-pair midpoint, then scale so the source
/// diameter matches the target diameter.
///
/// Returns the transform together with (source_diameter, target_diameter).
pub fn normalization_transform(
    source_samples: &PointSet,
    target_samples: &PointSet,
) -> CompareResult<(RigidTransform, f64, f64)> {
    let (s1, s2) = extremal_pair(&source_samples.points)?;
    let (t1, t2) = extremal_pair(&target_samples.points)?;

    let source_diameter = (s2 - s1).norm();
    let target_diameter = (t2 - t1).norm();
    let center = Point3::from((s1.coords + s2.coords) / 2.0);
    let scale = target_diameter / source_diameter;

    // p' = s * (p - center)
    let transform = RigidTransform {
        scale,
        rotation: nalgebra::UnitQuaternion::identity(),
        translation: -center.coords * scale,
    };

    Ok((transform, source_diameter, target_diameter))
}

/// Compare a source mesh against a target mesh.
///
/// `tolerance` is the divergence (in target units) above which a point
/// counts as defective. Fatal errors abort the run; a refinement that hits
/// its iteration cap proceeds with its best estimate.
pub fn compare(
    source: &Mesh,
    target: &Mesh,
    tolerance: f64,
    params: &CompareParams,
) -> CompareResult<ComparisonResult> {
    compare_with_progress(source, target, tolerance, params, None)
}

/// [`compare`] with a progress hook forwarded to the refinement stage.
pub fn compare_with_progress(
    source: &Mesh,
    target: &Mesh,
    tolerance: f64,
    params: &CompareParams,
    on_progress: Option<ProgressHook<'_>>,
) -> CompareResult<ComparisonResult> {
    source.validate()?;
    target.validate()?;

    // Working copy; the caller's meshes are never touched.
    let mut working = source.clone();

    info!(
        source_vertices = working.vertex_count(),
        target_vertices = target.vertex_count(),
        tolerance,
        "starting surface comparison"
    );

    let mut source_samples = sample_surface(&working, params.alignment_samples)?;
    let target_samples = sample_surface(target, params.alignment_samples)?;

    // Scale normalization: registration feature radii are scale-sensitive.
    let (normalize, source_diameter, target_diameter) =
        normalization_transform(&source_samples, &target_samples)?;
    normalize.transform_points(&mut source_samples.points);
    apply_to_mesh(&mut working, &normalize)?;

    let spacing = mean_pairwise_distance(&source_samples.points);
    let voxel_size = spacing / params.voxel_divisor;

    info!(
        source_diameter,
        target_diameter, spacing, voxel_size, "normalized; starting coarse alignment"
    );

    let coarse = register_features(&source_samples, &target_samples, voxel_size, &params.features)?;
    coarse.transform_points(&mut source_samples.points);
    apply_to_mesh(&mut working, &coarse)?;

    info!("coarse alignment done; refining");

    let refined = refine_alignment(&source_samples, &target_samples, &params.refine, on_progress)?;
    apply_to_mesh(&mut working, &refined.transform)?;

    info!(
        iterations = refined.iterations,
        converged = refined.converged,
        "refinement done; computing divergence"
    );

    // Dense re-sampling of the aligned surfaces for the distance fields.
    let source_dense = sample_surface(&working, params.divergence_samples)?;
    let target_dense = sample_surface(target, params.divergence_samples)?;

    let source_vertices = PointSet::from_mesh(&working);
    let target_vertices = PointSet::from_mesh(target);

    let forward_field = divergence_field(&source_vertices, &target_dense)?;
    let backward_field = divergence_field(&target_vertices, &source_dense)?;

    // Clustering radius scaled by sample spacing and the density ratio,
    // preserved from the pipeline's lineage (see DESIGN notes).
    let density_ratio = params.alignment_samples as f64
        / source_vertices.len().min(target_vertices.len()) as f64;
    let cluster_radius =
        params.cluster_spacing_factor * spacing * density_ratio / CLUSTER_RADIUS_HALVING;

    let forward_clusters = cluster_defects_with(
        &source_vertices,
        &forward_field,
        tolerance,
        cluster_radius,
        &params.outliers,
    );
    let backward_clusters = cluster_defects_with(
        &target_vertices,
        &backward_field,
        tolerance,
        cluster_radius,
        &params.outliers,
    );

    info!(
        forward = forward_clusters.len(),
        backward = backward_clusters.len(),
        "comparison complete"
    );

    let transform = normalize.then(&coarse).then(&refined.transform);

    Ok(ComparisonResult {
        aligned_source: working,
        forward_field,
        backward_field,
        forward_clusters,
        backward_clusters,
        transform,
        source_diameter,
        target_diameter,
        refine_converged: refined.converged,
        refine_iterations: refined.iterations,
    })
}

/// Replace a mesh's vertices with their transformed positions.
fn apply_to_mesh(mesh: &mut Mesh, transform: &RigidTransform) -> CompareResult<()> {
    let moved: Vec<Point3<f64>> = mesh
        .vertices
        .iter()
        .map(|p| transform.transform_point(p))
        .collect();
    mesh.set_vertices(moved)
}
