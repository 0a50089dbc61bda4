//! Rigid poses and the linear geometry used to initialize the optimizers.
//!
//! Poses are stored as a rotation vector (axis times angle, radians) and a
//! translation, the same six numbers the solvers optimize. The generic helpers
//! at the bottom evaluate a packed pose on any [`RealField`] so they can run on
//! the dual numbers tiny-solver differentiates with.

use nalgebra::{
    DMatrix, DVector, Isometry3, Matrix3, Matrix3x4, Point2, Point3, RealField, Translation3,
    UnitQuaternion, Vector3, Vector4,
};
use serde::{Deserialize, Serialize};

/// Number of parameters of a packed pose `[rx, ry, rz, tx, ty, tz]`.
pub const POSE_PARAMS: usize = 6;

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum GeometryError {
    #[error("need at least {required} points, got {found}")]
    NotEnoughPoints { required: usize, found: usize },
    #[error("point sets have different lengths ({0} vs {1})")]
    LengthMismatch(usize, usize),
    #[error("degenerate configuration: {0}")]
    Degenerate(String),
    #[error("svd failed")]
    SvdFailed,
}

/// A rigid transform `p' = R p + t` with `R` stored as a rotation vector.
///
/// Which frames it maps between is a property of where it is stored: camera
/// poses are camera-from-world, pairwise edges are b-from-a, board poses are
/// camera-from-board or world-from-board.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Pose {
    pub rotation: Vector3<f64>,
    pub translation: Vector3<f64>,
}

impl Default for Pose {
    fn default() -> Self {
        Self::identity()
    }
}

impl Pose {
    pub fn identity() -> Self {
        Pose {
            rotation: Vector3::zeros(),
            translation: Vector3::zeros(),
        }
    }

    pub fn from_parts(rotation: Vector3<f64>, translation: Vector3<f64>) -> Self {
        Pose {
            rotation,
            translation,
        }
    }

    pub fn from_isometry(iso: &Isometry3<f64>) -> Self {
        Pose {
            rotation: iso.rotation.scaled_axis(),
            translation: iso.translation.vector,
        }
    }

    pub fn to_isometry(&self) -> Isometry3<f64> {
        Isometry3::from_parts(
            Translation3::from(self.translation),
            UnitQuaternion::from_scaled_axis(self.rotation),
        )
    }

    /// Builds a pose from a rotation matrix that may be slightly off SO(3).
    pub fn from_rotation_matrix(rotation: &Matrix3<f64>, translation: Vector3<f64>) -> Self {
        let q = UnitQuaternion::from_matrix(rotation);
        Pose {
            rotation: q.scaled_axis(),
            translation,
        }
    }

    /// Reads a packed `[rx, ry, rz, tx, ty, tz]` vector.
    pub fn from_params(params: &DVector<f64>) -> Self {
        Pose {
            rotation: Vector3::new(params[0], params[1], params[2]),
            translation: Vector3::new(params[3], params[4], params[5]),
        }
    }

    pub fn to_params(&self) -> DVector<f64> {
        DVector::from_vec(self.to_array().to_vec())
    }

    pub fn to_array(&self) -> [f64; POSE_PARAMS] {
        [
            self.rotation.x,
            self.rotation.y,
            self.rotation.z,
            self.translation.x,
            self.translation.y,
            self.translation.z,
        ]
    }

    pub fn rotation_matrix(&self) -> Matrix3<f64> {
        UnitQuaternion::from_scaled_axis(self.rotation)
            .to_rotation_matrix()
            .into_inner()
    }

    /// `[R | t]`
    pub fn matrix3x4(&self) -> Matrix3x4<f64> {
        let mut m = Matrix3x4::zeros();
        m.fixed_view_mut::<3, 3>(0, 0)
            .copy_from(&self.rotation_matrix());
        m.set_column(3, &self.translation);
        m
    }

    pub fn transform_point(&self, point: &Point3<f64>) -> Point3<f64> {
        self.to_isometry().transform_point(point)
    }

    /// `self ∘ other`: applies `other` first, then `self`.
    pub fn compose(&self, other: &Pose) -> Pose {
        Pose::from_isometry(&(self.to_isometry() * other.to_isometry()))
    }

    pub fn inverse(&self) -> Pose {
        Pose::from_isometry(&self.to_isometry().inverse())
    }

    /// Rotation angle (radians) between two poses.
    pub fn angle_to(&self, other: &Pose) -> f64 {
        let a = UnitQuaternion::from_scaled_axis(self.rotation);
        let b = UnitQuaternion::from_scaled_axis(other.rotation);
        a.angle_to(&b)
    }

    pub fn translation_distance(&self, other: &Pose) -> f64 {
        (self.translation - other.translation).norm()
    }
}

/// Averages rigid poses.
///
/// Rotations are averaged as quaternions after flipping each one into the
/// hemisphere of the first, translations arithmetically.
///
/// # Errors
///
/// [`GeometryError::NotEnoughPoints`] for an empty input,
/// [`GeometryError::Degenerate`] if the quaternion sum vanishes.
pub fn average_poses(poses: &[Pose]) -> Result<Pose, GeometryError> {
    let Some(first) = poses.first() else {
        return Err(GeometryError::NotEnoughPoints {
            required: 1,
            found: 0,
        });
    };
    let reference = UnitQuaternion::from_scaled_axis(first.rotation);

    let mut q_sum = Vector4::zeros();
    let mut t_sum = Vector3::zeros();
    for pose in poses {
        let q = UnitQuaternion::from_scaled_axis(pose.rotation);
        let mut coords = q.coords;
        if reference.coords.dot(&coords) < 0.0 {
            coords = -coords;
        }
        q_sum += coords;
        t_sum += pose.translation;
    }

    let norm = q_sum.norm();
    if norm < 1e-12 {
        return Err(GeometryError::Degenerate(
            "rotations cancel out when averaged".to_string(),
        ));
    }
    let q_avg = UnitQuaternion::from_quaternion(nalgebra::Quaternion::from(q_sum / norm));
    Ok(Pose {
        rotation: q_avg.scaled_axis(),
        translation: t_sum / poses.len() as f64,
    })
}

/// Hartley normalization: centroid at the origin, mean distance `√2`.
///
/// Returns the normalized points and the 3x3 transform `T` with
/// `p_norm = T * p`.
pub fn normalize_points_2d(
    points: &[Point2<f64>],
) -> Result<(Vec<Point2<f64>>, Matrix3<f64>), GeometryError> {
    if points.is_empty() {
        return Err(GeometryError::NotEnoughPoints {
            required: 1,
            found: 0,
        });
    }
    let n = points.len() as f64;
    let (sx, sy) = points
        .iter()
        .fold((0.0, 0.0), |(sx, sy), p| (sx + p.x, sy + p.y));
    let (cx, cy) = (sx / n, sy / n);
    let mean_dist = points
        .iter()
        .map(|p| ((p.x - cx).powi(2) + (p.y - cy).powi(2)).sqrt())
        .sum::<f64>()
        / n;
    if mean_dist < f64::EPSILON {
        return Err(GeometryError::Degenerate(
            "all points coincide".to_string(),
        ));
    }
    let scale = std::f64::consts::SQRT_2 / mean_dist;
    let transform = Matrix3::new(scale, 0.0, -scale * cx, 0.0, scale, -scale * cy, 0.0, 0.0, 1.0);
    let normalized = points
        .iter()
        .map(|p| Point2::new(scale * (p.x - cx), scale * (p.y - cy)))
        .collect();
    Ok((normalized, transform))
}

/// Unit vector spanning the (approximate) null space of `a`.
///
/// Works through `AᵀA` so that systems with fewer rows than columns still
/// yield the right singular vector.
pub(crate) fn null_vector(a: &DMatrix<f64>) -> Result<DVector<f64>, GeometryError> {
    let ata = a.transpose() * a;
    let svd = ata.svd(false, true);
    let v_t = svd.v_t.ok_or(GeometryError::SvdFailed)?;
    let idx = svd.singular_values.imin();
    Ok(v_t.row(idx).transpose())
}

/// Estimates the homography `H` with `image ~ H * plane` by normalized DLT.
///
/// # Errors
///
/// * [`GeometryError::LengthMismatch`] if the inputs differ in length.
/// * [`GeometryError::NotEnoughPoints`] with fewer than 4 correspondences.
/// * [`GeometryError::Degenerate`] if the points are collinear or coincident.
pub fn estimate_homography(
    plane: &[Point2<f64>],
    image: &[Point2<f64>],
) -> Result<Matrix3<f64>, GeometryError> {
    if plane.len() != image.len() {
        return Err(GeometryError::LengthMismatch(plane.len(), image.len()));
    }
    let n = plane.len();
    if n < 4 {
        return Err(GeometryError::NotEnoughPoints {
            required: 4,
            found: n,
        });
    }

    let (plane_n, t_plane) = normalize_points_2d(plane)?;
    let (image_n, t_image) = normalize_points_2d(image)?;

    let mut a = DMatrix::<f64>::zeros(2 * n, 9);
    for (i, (pw, pi)) in plane_n.iter().zip(image_n.iter()).enumerate() {
        let (x, y, u, v) = (pw.x, pw.y, pi.x, pi.y);
        let r0 = 2 * i;
        let r1 = r0 + 1;
        a[(r0, 0)] = -x;
        a[(r0, 1)] = -y;
        a[(r0, 2)] = -1.0;
        a[(r0, 6)] = u * x;
        a[(r0, 7)] = u * y;
        a[(r0, 8)] = u;

        a[(r1, 3)] = -x;
        a[(r1, 4)] = -y;
        a[(r1, 5)] = -1.0;
        a[(r1, 6)] = v * x;
        a[(r1, 7)] = v * y;
        a[(r1, 8)] = v;
    }

    let h = null_vector(&a)?;
    let h_norm = Matrix3::from_row_slice(h.as_slice());

    let t_image_inv = t_image
        .try_inverse()
        .ok_or_else(|| GeometryError::Degenerate("normalization not invertible".to_string()))?;
    let mut h_mat = t_image_inv * h_norm * t_plane;

    let scale = h_mat[(2, 2)];
    if scale.abs() < f64::EPSILON {
        return Err(GeometryError::Degenerate(
            "homography maps the origin to infinity".to_string(),
        ));
    }
    h_mat /= scale;

    // A rank-deficient H means the correspondences were collinear.
    let det = h_mat.determinant();
    if !det.is_finite() || det.abs() < 1e-12 {
        return Err(GeometryError::Degenerate(
            "correspondences are collinear".to_string(),
        ));
    }
    Ok(h_mat)
}

/// Decomposes a plane-to-image homography into the camera-from-board pose.
///
/// The board is the `z = 0` plane in its own frame. The rotation is projected
/// onto SO(3) by SVD and the sign is fixed so that the board lies in front of
/// the camera.
pub fn pose_from_homography(k: &Matrix3<f64>, h: &Matrix3<f64>) -> Result<Pose, GeometryError> {
    let k_inv = k
        .try_inverse()
        .ok_or_else(|| GeometryError::Degenerate("camera matrix not invertible".to_string()))?;

    let h1 = k_inv * h.column(0);
    let h2 = k_inv * h.column(1);
    let h3 = k_inv * h.column(2);

    let norm = 0.5 * (h1.norm() + h2.norm());
    if norm < f64::EPSILON {
        return Err(GeometryError::Degenerate(
            "homography columns vanish".to_string(),
        ));
    }
    let mut lambda = 1.0 / norm;
    if h3.z * lambda < 0.0 {
        lambda = -lambda;
    }

    let r1 = h1 * lambda;
    let r2 = h2 * lambda;
    let r3 = r1.cross(&r2);
    let r = Matrix3::from_columns(&[r1, r2, r3]);

    let svd = r.svd(true, true);
    let (u, v_t) = match (svd.u, svd.v_t) {
        (Some(u), Some(v_t)) => (u, v_t),
        _ => return Err(GeometryError::SvdFailed),
    };
    let mut r_orth = u * v_t;
    if r_orth.determinant() < 0.0 {
        let mut u_flipped = u;
        u_flipped.column_mut(2).neg_mut();
        r_orth = u_flipped * v_t;
    }

    Ok(Pose::from_rotation_matrix(&r_orth, h3 * lambda))
}

/// Rotates `p` by the rotation vector `r` (Rodrigues' formula), on any
/// [`RealField`].
pub fn rotate_generic<T: RealField>(r: &[T], p: &Vector3<T>) -> Vector3<T> {
    let rv = Vector3::new(r[0].clone(), r[1].clone(), r[2].clone());
    let theta2 = rv.norm_squared();
    let eps: T = nalgebra::convert(1e-12);
    if theta2 > eps {
        let theta = theta2.sqrt();
        let k = rv / theta.clone();
        let (sin, cos) = (theta.clone().sin(), theta.cos());
        let k_cross_p = k.cross(p);
        let k_dot_p = k.dot(p);
        p * cos.clone() + k_cross_p * sin + k * (k_dot_p * (T::one() - cos))
    } else {
        p + rv.cross(p)
    }
}

/// Applies a packed `[rx, ry, rz, tx, ty, tz]` pose to a point, on any [`RealField`].
pub fn transform_generic<T: RealField>(pose: &[T], p: &Vector3<T>) -> Vector3<T> {
    rotate_generic(&pose[0..3], p)
        + Vector3::new(pose[3].clone(), pose[4].clone(), pose[5].clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn sample_pose() -> Pose {
        Pose::from_parts(Vector3::new(0.1, -0.2, 0.3), Vector3::new(0.5, -1.0, 4.0))
    }

    #[test]
    fn test_compose_with_inverse_is_identity() {
        let pose = sample_pose();
        let id = pose.compose(&pose.inverse());
        assert_relative_eq!(id.rotation, Vector3::zeros(), epsilon = 1e-12);
        assert_relative_eq!(id.translation, Vector3::zeros(), epsilon = 1e-12);
    }

    #[test]
    fn test_generic_transform_matches_isometry() {
        let pose = sample_pose();
        let p = Point3::new(0.3, 0.7, -0.2);
        let expected = pose.transform_point(&p);
        let got = transform_generic(&pose.to_array(), &p.coords);
        assert_relative_eq!(expected.coords, got, epsilon = 1e-12);

        // Small-angle branch.
        let tiny = Pose::from_parts(Vector3::new(1e-8, 0.0, 0.0), Vector3::zeros());
        let got = transform_generic(&tiny.to_array(), &p.coords);
        assert_relative_eq!(tiny.transform_point(&p).coords, got, epsilon = 1e-12);
    }

    #[test]
    fn test_average_poses_handles_hemisphere() {
        let a = Pose::from_parts(Vector3::new(0.0, 0.0, 0.1), Vector3::new(1.0, 0.0, 0.0));
        let b = Pose::from_parts(Vector3::new(0.0, 0.0, 0.3), Vector3::new(3.0, 0.0, 0.0));
        let avg = average_poses(&[a, b]).unwrap();
        assert_relative_eq!(avg.rotation.z, 0.2, epsilon = 1e-9);
        assert_relative_eq!(avg.translation.x, 2.0, epsilon = 1e-12);
        assert!(average_poses(&[]).is_err());
    }

    #[test]
    fn test_homography_and_planar_pose() {
        let k = Matrix3::new(800.0, 0.0, 320.0, 0.0, 780.0, 240.0, 0.0, 0.0, 1.0);
        let pose = Pose::from_parts(Vector3::new(0.2, -0.1, 0.05), Vector3::new(-0.1, 0.05, 1.5));
        let mut plane = Vec::new();
        let mut image = Vec::new();
        for r in 0..4 {
            for c in 0..5 {
                let p = Point3::new(c as f64 * 0.05, r as f64 * 0.05, 0.0);
                let pc = pose.transform_point(&p);
                let uvw = k * pc.coords;
                plane.push(Point2::new(p.x, p.y));
                image.push(Point2::new(uvw.x / uvw.z, uvw.y / uvw.z));
            }
        }
        let h = estimate_homography(&plane, &image).unwrap();
        let recovered = pose_from_homography(&k, &h).unwrap();
        assert_relative_eq!(recovered.rotation, pose.rotation, epsilon = 1e-6);
        assert_relative_eq!(recovered.translation, pose.translation, epsilon = 1e-6);
    }

    #[test]
    fn test_homography_rejects_too_few_points() {
        let pts = vec![Point2::new(0.0, 0.0); 3];
        assert_eq!(
            estimate_homography(&pts, &pts).unwrap_err(),
            GeometryError::NotEnoughPoints {
                required: 4,
                found: 3
            }
        );
    }
}
