//! Probabilistic rigid refinement (coherent point drift).
//!
//! The source set is modeled as Gaussian mixture centroids drifting onto
//! the target set. Each iteration computes soft correspondences (the
//! E-step, with a uniform component absorbing outliers) and then solves the
//! rigid similarity transform maximizing the expected correspondence
//! likelihood in closed form (the M-step), shrinking the mixture variance
//! as the sets lock together. Refinement expects a coarse alignment as its
//! starting point and converges to sub-feature precision.

use nalgebra::{Matrix3, Point3, Vector3};
use rayon::prelude::*;
use tracing::{debug, warn};

use crate::error::{CompareError, CompareResult};
use crate::transform::RigidTransform;
use crate::types::PointSet;

/// Parameters for refinement registration.
#[derive(Debug, Clone)]
pub struct RefineParams {
    /// Iteration cap.
    pub max_iterations: usize,

    /// Convergence threshold on the change in mixture variance.
    pub tolerance: f64,

    /// Uniform-distribution weight absorbing outliers (0.0–1.0).
    pub outlier_weight: f64,

    /// Whether to solve for uniform scale in addition to rotation and
    /// translation.
    pub with_scale: bool,
}

impl Default for RefineParams {
    fn default() -> Self {
        Self {
            max_iterations: 60,
            tolerance: 1e-6,
            outlier_weight: 0.1,
            with_scale: true,
        }
    }
}

impl RefineParams {
    /// Set the iteration cap.
    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations.max(1);
        self
    }

    /// Set the convergence threshold.
    pub fn with_tolerance(mut self, tolerance: f64) -> Self {
        self.tolerance = tolerance;
        self
    }
}

/// Result of refinement registration.
#[derive(Debug, Clone)]
pub struct RefineResult {
    /// The aligned source points.
    pub points: PointSet,

    /// The transform mapping the original source points onto the target.
    pub transform: RigidTransform,

    /// Number of iterations performed.
    pub iterations: usize,

    /// Whether the variance change fell below the tolerance before the
    /// iteration cap. `false` is non-fatal: the best-effort transform is
    /// still returned.
    pub converged: bool,

    /// Final mixture variance.
    pub sigma2: f64,
}

/// Per-iteration progress hook: `(iteration_index, transformed_points,
/// max_iterations)`. Called synchronously between iterations; the registrar
/// does not advance until it returns.
pub type ProgressHook<'a> = &'a mut dyn FnMut(usize, &[Point3<f64>], usize);

/// Refine the alignment of `source` onto `target`.
///
/// Fails with `DegenerateInput` if either set is empty. Hitting the
/// iteration cap is reported through `RefineResult::converged` and a
/// warning, not an error.
pub fn refine_alignment(
    source: &PointSet,
    target: &PointSet,
    params: &RefineParams,
    mut on_progress: Option<ProgressHook<'_>>,
) -> CompareResult<RefineResult> {
    if source.is_empty() || target.is_empty() {
        return Err(CompareError::degenerate_input(
            "refinement requires non-empty source and target sets",
        ));
    }

    let x = &target.points; // data the mixture explains
    let y = &source.points; // mixture centroids
    let n = x.len();
    let m = y.len();
    let dim = 3.0;

    let mut sigma2 = initial_variance(x, y);
    if sigma2 <= 0.0 {
        // Source and target already coincide pointwise.
        return Ok(RefineResult {
            points: source.clone(),
            transform: RigidTransform::identity(),
            iterations: 0,
            converged: true,
            sigma2: 0.0,
        });
    }

    let w = params.outlier_weight.clamp(0.0, 0.999);
    let mut transform = RigidTransform::identity();
    let mut transformed: Vec<Point3<f64>> = y.clone();
    let mut iterations = 0;
    let mut converged = false;

    for iteration in 0..params.max_iterations {
        iterations = iteration + 1;

        // E-step: soft correspondence statistics.
        let outlier_term =
            (2.0 * std::f64::consts::PI * sigma2).powf(dim / 2.0) * w / (1.0 - w) * m as f64
                / n as f64;

        let stats = x
            .par_iter()
            .fold(|| EStep::zero(m), |mut acc, xn| {
                let mut weights = vec![0.0f64; m];
                let mut denom = outlier_term;
                for (mi, ty) in transformed.iter().enumerate() {
                    let k = (-(xn - ty).norm_squared() / (2.0 * sigma2)).exp();
                    weights[mi] = k;
                    denom += k;
                }
                if denom > 0.0 {
                    let pt1 = (denom - outlier_term) / denom;
                    acc.np += pt1;
                    acc.mu_x += xn.coords * pt1;
                    acc.x_sq += xn.coords.norm_squared() * pt1;
                    for mi in 0..m {
                        let p = weights[mi] / denom;
                        acc.p1[mi] += p;
                        acc.px[mi] += xn.coords * p;
                    }
                }
                acc
            })
            .reduce(|| EStep::zero(m), EStep::merge);

        if stats.np < 1e-12 {
            warn!("all correspondences collapsed into the outlier term");
            break;
        }

        // M-step: closed-form similarity transform.
        let mu_x = stats.mu_x / stats.np;
        let mu_y: Vector3<f64> = y
            .iter()
            .zip(stats.p1.iter())
            .map(|(p, &w)| p.coords * w)
            .sum::<Vector3<f64>>()
            / stats.np;

        let mut a = Matrix3::zeros();
        let mut y_var = 0.0;
        for mi in 0..m {
            let yc = y[mi].coords - mu_y;
            a += (stats.px[mi] - mu_x * stats.p1[mi]) * yc.transpose();
            y_var += stats.p1[mi] * yc.norm_squared();
        }

        let svd = a.svd(true, true);
        let u = svd.u.unwrap();
        let v_t = svd.v_t.unwrap();
        let det_sign = if (u * v_t).determinant() < 0.0 { -1.0 } else { 1.0 };
        let c = Vector3::new(1.0, 1.0, det_sign);
        let rotation_matrix = u * Matrix3::from_diagonal(&c) * v_t;
        let rotation = nalgebra::UnitQuaternion::from_rotation_matrix(
            &nalgebra::Rotation3::from_matrix_unchecked(rotation_matrix),
        );

        let trace_sc = svd.singular_values.dot(&c);
        let scale = if params.with_scale && y_var > 1e-12 {
            trace_sc / y_var
        } else {
            1.0
        };
        let translation = mu_x - scale * (rotation_matrix * mu_y);

        transform = RigidTransform {
            scale,
            rotation,
            translation,
        };
        for (t, p) in transformed.iter_mut().zip(y.iter()) {
            *t = transform.transform_point(p);
        }

        let x_var = stats.x_sq - 2.0 * stats.mu_x.dot(&mu_x) + stats.np * mu_x.norm_squared();
        let sigma2_new = ((x_var - scale * trace_sc) / (stats.np * dim)).max(1e-12);
        let diff = (sigma2 - sigma2_new).abs();
        sigma2 = sigma2_new;

        if let Some(hook) = on_progress.as_mut() {
            hook(iteration, &transformed, params.max_iterations);
        }

        if diff < params.tolerance {
            converged = true;
            debug!(iterations, sigma2, "refinement converged");
            break;
        }
    }

    if !converged {
        warn!(
            iterations,
            sigma2, "refinement hit its iteration cap before converging; using best estimate"
        );
    }

    Ok(RefineResult {
        points: PointSet::from_points(transformed),
        transform,
        iterations,
        converged,
        sigma2,
    })
}

/// Accumulated E-step statistics.
struct EStep {
    /// Total soft correspondence mass.
    np: f64,
    /// Pt1-weighted target coordinate sum.
    mu_x: Vector3<f64>,
    /// Pt1-weighted target squared-norm sum.
    x_sq: f64,
    /// Row sums of the posterior matrix (per source point).
    p1: Vec<f64>,
    /// Posterior-weighted target sums (per source point).
    px: Vec<Vector3<f64>>,
}

impl EStep {
    fn zero(m: usize) -> Self {
        Self {
            np: 0.0,
            mu_x: Vector3::zeros(),
            x_sq: 0.0,
            p1: vec![0.0; m],
            px: vec![Vector3::zeros(); m],
        }
    }

    fn merge(mut self, other: Self) -> Self {
        self.np += other.np;
        self.mu_x += other.mu_x;
        self.x_sq += other.x_sq;
        for (a, b) in self.p1.iter_mut().zip(other.p1.iter()) {
            *a += b;
        }
        for (a, b) in self.px.iter_mut().zip(other.px.iter()) {
            *a += b;
        }
        self
    }
}

/// Mean squared distance over all cross pairs, divided by the dimension.
fn initial_variance(x: &[Point3<f64>], y: &[Point3<f64>]) -> f64 {
    let n = x.len() as f64;
    let m = y.len() as f64;

    let sum_x: Vector3<f64> = x.iter().map(|p| p.coords).sum();
    let sum_y: Vector3<f64> = y.iter().map(|p| p.coords).sum();
    let sq_x: f64 = x.iter().map(|p| p.coords.norm_squared()).sum();
    let sq_y: f64 = y.iter().map(|p| p.coords.norm_squared()).sum();

    (m * sq_x + n * sq_y - 2.0 * sum_x.dot(&sum_y)) / (3.0 * n * m)
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::UnitQuaternion;

    fn blob() -> Vec<Point3<f64>> {
        // Deterministic asymmetric cloud.
        let mut points = Vec::new();
        let mut state: u64 = 31;
        let mut next = move || {
            state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            (state >> 33) as f64 / (1u64 << 31) as f64
        };
        for i in 0..120 {
            let stretch = 1.0 + (i % 3) as f64;
            points.push(Point3::new(next() * 4.0 * stretch, next() * 2.0, next()));
        }
        points
    }

    #[test]
    fn test_recovers_translation() {
        let source = PointSet::from_points(blob());
        let offset = Vector3::new(0.4, -0.2, 0.3);
        let target = PointSet::from_points(
            source.points.iter().map(|p| p + offset).collect(),
        );

        let result =
            refine_alignment(&source, &target, &RefineParams::default(), None).unwrap();

        for (aligned, expected) in result.points.points.iter().zip(target.points.iter()) {
            assert!(
                (aligned - expected).norm() < 0.05,
                "point drifted {} away",
                (aligned - expected).norm()
            );
        }
    }

    #[test]
    fn test_recovers_rotation_and_translation() {
        let source = PointSet::from_points(blob());
        let truth = RigidTransform {
            scale: 1.0,
            rotation: UnitQuaternion::from_axis_angle(&Vector3::z_axis(), 0.3),
            translation: Vector3::new(0.5, 0.1, -0.2),
        };
        let target = PointSet::from_points(
            source
                .points
                .iter()
                .map(|p| truth.transform_point(p))
                .collect(),
        );

        let result =
            refine_alignment(&source, &target, &RefineParams::default(), None).unwrap();

        let mean_error: f64 = result
            .points
            .points
            .iter()
            .zip(target.points.iter())
            .map(|(a, b)| (a - b).norm())
            .sum::<f64>()
            / source.len() as f64;
        assert!(mean_error < 0.05, "mean residual {} too large", mean_error);
    }

    #[test]
    fn test_identical_sets_converge_immediately() {
        let points = PointSet::from_points(blob());
        let result =
            refine_alignment(&points, &points.clone(), &RefineParams::default(), None).unwrap();
        assert!(result.converged);
    }

    #[test]
    fn test_progress_hook_called_every_iteration_in_order() {
        let source = PointSet::from_points(blob());
        let target = PointSet::from_points(
            source
                .points
                .iter()
                .map(|p| p + Vector3::new(0.3, 0.0, 0.0))
                .collect(),
        );

        let mut seen: Vec<usize> = Vec::new();
        let point_count = source.len();
        let mut hook = |iteration: usize, points: &[Point3<f64>], max: usize| {
            assert_eq!(points.len(), point_count);
            assert_eq!(max, 20);
            seen.push(iteration);
        };

        let params = RefineParams::default().with_max_iterations(20);
        let result = refine_alignment(&source, &target, &params, Some(&mut hook)).unwrap();

        assert_eq!(seen.len(), result.iterations);
        for (expected, &got) in seen.iter().enumerate().map(|(i, s)| (i, s)) {
            assert_eq!(expected, got);
        }
    }

    #[test]
    fn test_iteration_cap_is_non_fatal() {
        let source = PointSet::from_points(blob());
        let target = PointSet::from_points(
            source
                .points
                .iter()
                .map(|p| p + Vector3::new(2.0, 1.0, 0.0))
                .collect(),
        );

        // One iteration cannot converge; the call must still succeed.
        let params = RefineParams::default()
            .with_max_iterations(1)
            .with_tolerance(1e-15);
        let result = refine_alignment(&source, &target, &params, None).unwrap();
        assert!(!result.converged);
        assert_eq!(result.iterations, 1);
    }

    #[test]
    fn test_empty_input_fails() {
        let empty = PointSet::new();
        let full = PointSet::from_points(blob());
        assert!(matches!(
            refine_alignment(&empty, &full, &RefineParams::default(), None),
            Err(CompareError::DegenerateInput { .. })
        ));
    }
}
