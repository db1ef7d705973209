//! Rigid transformations with uniform scale.

use nalgebra::{Matrix3, Matrix4, Point3, Rotation3, UnitQuaternion, Vector3};

/// A similarity transformation: uniform scale, rotation, translation.
///
/// Applied to a point as `p' = s·R·p + t`.
#[derive(Debug, Clone)]
pub struct RigidTransform {
    /// Uniform scale factor (1.0 = no scaling).
    pub scale: f64,
    /// Rotation quaternion.
    pub rotation: UnitQuaternion<f64>,
    /// Translation vector.
    pub translation: Vector3<f64>,
}

impl Default for RigidTransform {
    fn default() -> Self {
        Self::identity()
    }
}

impl RigidTransform {
    /// Create an identity transformation.
    pub fn identity() -> Self {
        Self {
            scale: 1.0,
            rotation: UnitQuaternion::identity(),
            translation: Vector3::zeros(),
        }
    }

    /// Create a pure translation.
    pub fn from_translation(translation: Vector3<f64>) -> Self {
        Self {
            scale: 1.0,
            rotation: UnitQuaternion::identity(),
            translation,
        }
    }

    /// Create a pure rotation.
    pub fn from_rotation(rotation: UnitQuaternion<f64>) -> Self {
        Self {
            scale: 1.0,
            rotation,
            translation: Vector3::zeros(),
        }
    }

    /// Apply the transformation to a point.
    #[inline]
    pub fn transform_point(&self, point: &Point3<f64>) -> Point3<f64> {
        Point3::from(self.rotation * (point.coords * self.scale) + self.translation)
    }

    /// Apply the transformation to every point in a slice, in place.
    pub fn transform_points(&self, points: &mut [Point3<f64>]) {
        for p in points {
            *p = self.transform_point(p);
        }
    }

    /// Compose with another transformation (self applied first, then other).
    pub fn then(&self, other: &RigidTransform) -> RigidTransform {
        RigidTransform {
            scale: self.scale * other.scale,
            rotation: other.rotation * self.rotation,
            translation: other.rotation * (self.translation * other.scale) + other.translation,
        }
    }

    /// Get the inverse transformation.
    pub fn inverse(&self) -> RigidTransform {
        let inv_rotation = self.rotation.inverse();
        let inv_scale = 1.0 / self.scale;
        let inv_translation = inv_rotation * (-self.translation * inv_scale);
        RigidTransform {
            scale: inv_scale,
            rotation: inv_rotation,
            translation: inv_translation,
        }
    }

    /// Convert to a 4x4 homogeneous transformation matrix.
    pub fn to_matrix4(&self) -> Matrix4<f64> {
        let rotation_matrix = self.rotation.to_rotation_matrix();
        let mut result = Matrix4::identity();
        for i in 0..3 {
            for j in 0..3 {
                result[(i, j)] = rotation_matrix[(i, j)] * self.scale;
            }
            result[(i, 3)] = self.translation[i];
        }
        result
    }
}

/// Compute the optimal similarity transform between corresponded point sets.
///
/// Kabsch algorithm: SVD of the cross-covariance of the centered sets gives
/// the rotation (with a reflection fix when det < 0); scale, when requested,
/// comes from the variance ratio; translation maps the source centroid onto
/// the target centroid. Both slices must have the same length and pair up
/// index by index.
pub fn kabsch(
    source: &[Point3<f64>],
    target: &[Point3<f64>],
    with_scale: bool,
) -> RigidTransform {
    let n = source.len();
    if n == 0 {
        return RigidTransform::identity();
    }

    let source_centroid: Vector3<f64> =
        source.iter().map(|p| p.coords).sum::<Vector3<f64>>() / n as f64;
    let target_centroid: Vector3<f64> =
        target.iter().map(|p| p.coords).sum::<Vector3<f64>>() / n as f64;

    let centered_source: Vec<Vector3<f64>> =
        source.iter().map(|p| p.coords - source_centroid).collect();
    let centered_target: Vec<Vector3<f64>> =
        target.iter().map(|p| p.coords - target_centroid).collect();

    let mut h = Matrix3::zeros();
    for i in 0..n {
        h += centered_source[i] * centered_target[i].transpose();
    }

    let svd = h.svd(true, true);
    let u = svd.u.unwrap();
    let v_t = svd.v_t.unwrap();

    let mut rotation_matrix = v_t.transpose() * u.transpose();

    // Reflection case: flip the axis of least variance.
    if rotation_matrix.determinant() < 0.0 {
        let mut v_t_fixed = v_t;
        v_t_fixed.set_row(2, &(-v_t.row(2)));
        rotation_matrix = v_t_fixed.transpose() * u.transpose();
    }

    let rotation =
        UnitQuaternion::from_rotation_matrix(&Rotation3::from_matrix_unchecked(rotation_matrix));

    let scale = if with_scale {
        let source_variance: f64 = centered_source.iter().map(|v| v.norm_squared()).sum();
        let target_variance: f64 = centered_target.iter().map(|v| v.norm_squared()).sum();
        if source_variance > 1e-10 {
            (target_variance / source_variance).sqrt()
        } else {
            1.0
        }
    } else {
        1.0
    };

    let translation = target_centroid - scale * (rotation * source_centroid);

    RigidTransform {
        scale,
        rotation,
        translation,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity() {
        let t = RigidTransform::identity();
        let p = Point3::new(1.0, 2.0, 3.0);
        assert!((t.transform_point(&p) - p).norm() < 1e-12);
    }

    #[test]
    fn test_composition() {
        let t1 = RigidTransform::from_translation(Vector3::new(1.0, 0.0, 0.0));
        let t2 = RigidTransform::from_translation(Vector3::new(0.0, 2.0, 0.0));
        let composed = t1.then(&t2);

        let result = composed.transform_point(&Point3::origin());
        assert!((result.x - 1.0).abs() < 1e-10);
        assert!((result.y - 2.0).abs() < 1e-10);
    }

    #[test]
    fn test_inverse_round_trip() {
        for &scale in &[0.5, 1.0, 2.0] {
            let rotation =
                UnitQuaternion::from_axis_angle(&Vector3::z_axis(), std::f64::consts::FRAC_PI_3)
                    * UnitQuaternion::from_axis_angle(&Vector3::x_axis(), 0.7);
            let transform = RigidTransform {
                scale,
                rotation,
                translation: Vector3::new(5.0, -3.0, 1.5),
            };

            let point = Point3::new(1.0, 2.0, 3.0);
            let recovered = transform
                .inverse()
                .transform_point(&transform.transform_point(&point));
            assert!(
                (point - recovered).norm() < 1e-6,
                "round trip failed for s={}",
                scale
            );
        }
    }

    #[test]
    fn test_compose_then_inverse_is_identity() {
        let t = RigidTransform {
            scale: 1.5,
            rotation: UnitQuaternion::from_axis_angle(&Vector3::y_axis(), 0.4),
            translation: Vector3::new(-2.0, 0.5, 7.0),
        };
        let id = t.then(&t.inverse());
        let p = Point3::new(3.0, -1.0, 2.0);
        assert!((id.transform_point(&p) - p).norm() < 1e-9);
    }

    #[test]
    fn test_to_matrix4_matches_transform_point() {
        let t = RigidTransform {
            scale: 2.0,
            rotation: UnitQuaternion::from_axis_angle(
                &Vector3::z_axis(),
                std::f64::consts::FRAC_PI_2,
            ),
            translation: Vector3::new(1.0, 2.0, 3.0),
        };
        let m = t.to_matrix4();
        let p = Point3::new(1.0, 0.0, 0.0);

        let transformed = t.transform_point(&p);
        let h = m * nalgebra::Vector4::new(p.x, p.y, p.z, 1.0);
        assert!((transformed.x - h.x).abs() < 1e-10);
        assert!((transformed.y - h.y).abs() < 1e-10);
        assert!((transformed.z - h.z).abs() < 1e-10);
    }

    #[test]
    fn test_kabsch_recovers_rotation_translation() {
        let source = vec![
            Point3::new(0.0, 0.0, 0.0),
            Point3::new(1.0, 0.0, 0.0),
            Point3::new(0.0, 1.0, 0.0),
            Point3::new(0.0, 0.0, 1.0),
        ];
        let truth = RigidTransform {
            scale: 1.0,
            rotation: UnitQuaternion::from_axis_angle(&Vector3::z_axis(), 0.6),
            translation: Vector3::new(3.0, -1.0, 2.0),
        };
        let target: Vec<_> = source.iter().map(|p| truth.transform_point(p)).collect();

        let fitted = kabsch(&source, &target, false);
        for (s, t) in source.iter().zip(target.iter()) {
            assert!((fitted.transform_point(s) - t).norm() < 1e-9);
        }
    }

    #[test]
    fn test_kabsch_recovers_scale() {
        let source = vec![
            Point3::new(0.0, 0.0, 0.0),
            Point3::new(1.0, 0.0, 0.0),
            Point3::new(0.0, 2.0, 0.0),
            Point3::new(0.0, 0.0, 3.0),
        ];
        let target: Vec<_> = source
            .iter()
            .map(|p| Point3::from(p.coords * 2.5 + Vector3::new(1.0, 1.0, 1.0)))
            .collect();

        let fitted = kabsch(&source, &target, true);
        assert!((fitted.scale - 2.5).abs() < 1e-9);
        for (s, t) in source.iter().zip(target.iter()) {
            assert!((fitted.transform_point(s) - t).norm() < 1e-9);
        }
    }

    #[test]
    fn test_kabsch_empty_is_identity() {
        let fitted = kabsch(&[], &[], true);
        assert!((fitted.scale - 1.0).abs() < 1e-12);
        assert!(fitted.translation.norm() < 1e-12);
    }
}
