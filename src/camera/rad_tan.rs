//! Implements the Radial-Tangential (RadTan) camera model.
//!
//! This module provides the [`RadTanModel`] struct, a pinhole camera with
//! Brown-Conrady radial (`k1`, `k2`, `k3`) and tangential (`p1`, `p2`) lens
//! distortion, and the generic projection helpers the optimization factors are
//! built on. It adheres to the [`CameraModel`] trait defined in the parent
//! `camera` module ([`crate::camera`]).

use crate::camera::{validation, CameraModel, CameraModelError, Intrinsics, Resolution};
use nalgebra::{DVector, Matrix2, RealField, Vector2, Vector3};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Number of parameters in the packed `[fx, fy, cx, cy, k1, k2, p1, p2, k3]` layout.
pub const RAD_TAN_PARAMS: usize = 9;

/// Represents a Radial-Tangential (RadTan) camera model.
///
/// The distortion coefficients are typically denoted as:
/// *   `k1`, `k2`, `k3`: Radial distortion coefficients.
/// *   `p1`, `p2`: Tangential distortion coefficients.
///
/// # Examples
///
/// ```rust
/// use nalgebra::DVector;
/// use capture_volume::camera::rad_tan::RadTanModel;
/// use capture_volume::camera::Resolution;
///
/// // Parameters: fx, fy, cx, cy, k1, k2, p1, p2, k3
/// let params = DVector::from_vec(vec![
///     500.0, 500.0, 320.0, 240.0, // Intrinsics
///     0.1, -0.05, 0.001, 0.001, 0.02 // Distortion (k1, k2, p1, p2, k3)
/// ]);
/// let mut rad_tan_model = RadTanModel::new(&params).unwrap();
/// // Set a resolution, as `new` initializes it to 0x0
/// rad_tan_model.resolution = Resolution { width: 640, height: 480 };
///
/// assert_eq!(rad_tan_model.intrinsics.fx, 500.0);
/// assert_eq!(rad_tan_model.distortions[0], 0.1); // k1
/// ```
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct RadTanModel {
    /// The intrinsic parameters of the camera, [`Intrinsics`] (fx, fy, cx, cy).
    pub intrinsics: Intrinsics,
    /// The resolution of the camera image, [`Resolution`] (width, height).
    pub resolution: Resolution,
    /// The 5 distortion coefficients: `[k1, k2, p1, p2, k3]`.
    pub distortions: [f64; 5],
}

impl RadTanModel {
    /// Creates a new [`RadTanModel`] from a vector of parameters.
    ///
    /// The resolution is initialized to 0x0 and should be set manually.
    ///
    /// # Arguments
    ///
    /// * `parameters` - A `&DVector<f64>` containing the camera parameters in the order
    ///   `fx, fy, cx, cy, k1, k2, p1, p2, k3`.
    ///
    /// # Errors
    ///
    /// * [`CameraModelError::InvalidParams`] if fewer than 9 parameters are given.
    /// * [`CameraModelError::FocalLengthMustBePositive`]
    /// * [`CameraModelError::PrincipalPointMustBeFinite`]
    pub fn new(parameters: &DVector<f64>) -> Result<Self, CameraModelError> {
        if parameters.len() < RAD_TAN_PARAMS {
            return Err(CameraModelError::InvalidParams(format!(
                "Expected {} parameters, found {}",
                RAD_TAN_PARAMS,
                parameters.len()
            )));
        }
        let model = RadTanModel {
            intrinsics: Intrinsics {
                fx: parameters[0],
                fy: parameters[1],
                cx: parameters[2],
                cy: parameters[3],
            },
            resolution: Resolution {
                width: 0,
                height: 0,
            },
            distortions: [
                parameters[4],
                parameters[5],
                parameters[6],
                parameters[7],
                parameters[8],
            ],
        };

        model.validate_params()?;
        Ok(model)
    }

    /// Same as [`RadTanModel::new`] with the resolution filled in.
    pub fn with_resolution(
        parameters: &DVector<f64>,
        resolution: Resolution,
    ) -> Result<Self, CameraModelError> {
        let mut model = Self::new(parameters)?;
        model.resolution = resolution;
        Ok(model)
    }

    /// Packs the model into the `[fx, fy, cx, cy, k1, k2, p1, p2, k3]` layout
    /// used by the optimizers.
    pub fn params(&self) -> DVector<f64> {
        DVector::from_vec(self.params_array().to_vec())
    }

    pub fn params_array(&self) -> [f64; RAD_TAN_PARAMS] {
        let d = &self.distortions;
        [
            self.intrinsics.fx,
            self.intrinsics.fy,
            self.intrinsics.cx,
            self.intrinsics.cy,
            d[0],
            d[1],
            d[2],
            d[3],
            d[4],
        ]
    }

    /// Whether a pixel lies inside the image.
    pub fn contains(&self, pixel: &Vector2<f64>) -> bool {
        pixel.x >= 0.0
            && pixel.y >= 0.0
            && pixel.x < self.resolution.width as f64
            && pixel.y < self.resolution.height as f64
    }

    /// Removes lens distortion from a pixel, returning normalized image
    /// coordinates `(x, y)` on the `z = 1` plane.
    ///
    /// Unlike [`CameraModel::unproject`] this does not require the pixel to
    /// lie inside the image.
    ///
    /// # Errors
    ///
    /// [`CameraModelError::NumericalError`] if the Newton iteration hits a
    /// singular Jacobian or does not converge.
    pub fn undistort(&self, pixel: &Vector2<f64>) -> Result<Vector2<f64>, CameraModelError> {
        let [k1, k2, p1, p2, k3] = self.distortions;
        let target = Vector2::new(
            (pixel.x - self.intrinsics.cx) / self.intrinsics.fx,
            (pixel.y - self.intrinsics.cy) / self.intrinsics.fy,
        );

        const EPS: f64 = 1e-10;
        const MAX_ITERATIONS: u32 = 100;

        let mut point = target;
        for _ in 0..MAX_ITERATIONS {
            let (x, y) = (point.x, point.y);
            let r2 = x * x + y * y;
            let r4 = r2 * r2;
            let r6 = r4 * r2;
            let radial = 1.0 + k1 * r2 + k2 * r4 + k3 * r6;

            let estimate = Vector2::new(
                x * radial + 2.0 * p1 * x * y + p2 * (r2 + 2.0 * x * x),
                y * radial + p1 * (r2 + 2.0 * y * y) + 2.0 * p2 * x * y,
            );
            let error = estimate - target;
            if error.norm() < EPS {
                return Ok(point);
            }

            // d(radial)/d(r2)
            let d_radial = k1 + 2.0 * k2 * r2 + 3.0 * k3 * r4;
            let j00 = radial + 2.0 * x * x * d_radial + 2.0 * p1 * y + 6.0 * p2 * x;
            let j01 = 2.0 * x * y * d_radial + 2.0 * p1 * x + 2.0 * p2 * y;
            let j10 = 2.0 * x * y * d_radial + 2.0 * p1 * x + 2.0 * p2 * y;
            let j11 = radial + 2.0 * y * y * d_radial + 6.0 * p1 * y + 2.0 * p2 * x;

            let Some(inv_jacobian) = Matrix2::new(j00, j01, j10, j11).try_inverse() else {
                return Err(CameraModelError::NumericalError(
                    "Jacobian is singular".to_string(),
                ));
            };
            let delta = inv_jacobian * error;
            point -= delta;
            if delta.norm() < EPS {
                return Ok(point);
            }
        }

        Err(CameraModelError::NumericalError(format!(
            "Undistortion did not converge after {} iterations.",
            MAX_ITERATIONS
        )))
    }
}

/// Provides a debug string representation for [`RadTanModel`].
impl fmt::Debug for RadTanModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "RadTanModel [fx: {} fy: {} cx: {} cy: {} distortions: {:?}]",
            self.intrinsics.fx,
            self.intrinsics.fy,
            self.intrinsics.cx,
            self.intrinsics.cy,
            self.distortions,
        )
    }
}

impl CameraModel for RadTanModel {
    /// Projects a 3D point from camera coordinates to 2D pixel coordinates,
    /// applying distortion.
    ///
    /// The projected pixel is returned even when it falls outside the image;
    /// use [`RadTanModel::contains`] to test that.
    ///
    /// # Errors
    ///
    /// * [`CameraModelError::PointAtCameraCenter`]: If the point is not in front of the camera.
    fn project(&self, point_3d: &Vector3<f64>) -> Result<Vector2<f64>, CameraModelError> {
        if point_3d.z < f64::EPSILON.sqrt() {
            return Err(CameraModelError::PointAtCameraCenter);
        }
        Ok(project_with_params(&self.params_array(), point_3d))
    }

    /// Unprojects a 2D image point (with distortion) to a unit-length 3D ray.
    ///
    /// # Errors
    ///
    /// * [`CameraModelError::PointIsOutSideImage`]: If the pixel is outside the image.
    /// * [`CameraModelError::NumericalError`]: If the undistortion does not converge.
    fn unproject(&self, point_2d: &Vector2<f64>) -> Result<Vector3<f64>, CameraModelError> {
        if !self.contains(point_2d) {
            return Err(CameraModelError::PointIsOutSideImage);
        }
        let normalized = self.undistort(point_2d)?;
        Ok(Vector3::new(normalized.x, normalized.y, 1.0).normalize())
    }

    fn validate_params(&self) -> Result<(), CameraModelError> {
        validation::validate_intrinsics(&self.intrinsics)?;
        if self.distortions.iter().any(|d| !d.is_finite()) {
            return Err(CameraModelError::InvalidParams(
                "Distortion coefficients must be finite".to_string(),
            ));
        }
        Ok(())
    }

    fn get_intrinsics(&self) -> Intrinsics {
        self.intrinsics
    }

    fn get_resolution(&self) -> Resolution {
        self.resolution
    }

    /// Returns the distortion coefficients as `[k1, k2, p1, p2, k3]`.
    fn get_distortion(&self) -> Vec<f64> {
        self.distortions.to_vec()
    }
}

/// Applies Brown-Conrady distortion to normalized coordinates.
///
/// `d` holds `[k1, k2, p1, p2, k3]`. Generic so it can run on dual numbers
/// inside the solver.
pub fn distort_normalized<T: RealField>(x: T, y: T, d: &[T]) -> (T, T) {
    let two: T = nalgebra::convert(2.0);
    let (k1, k2, p1, p2, k3) = (
        d[0].clone(),
        d[1].clone(),
        d[2].clone(),
        d[3].clone(),
        d[4].clone(),
    );
    let xy = x.clone() * y.clone();
    let r2 = x.clone() * x.clone() + y.clone() * y.clone();
    let r4 = r2.clone() * r2.clone();
    let r6 = r4.clone() * r2.clone();
    let radial = T::one() + k1 * r2.clone() + k2 * r4 + k3 * r6;

    let x_d = x.clone() * radial.clone()
        + two.clone() * p1.clone() * xy.clone()
        + p2.clone() * (r2.clone() + two.clone() * x.clone() * x);
    let y_d = y.clone() * radial
        + p1 * (r2 + two.clone() * y.clone() * y)
        + two * p2 * xy;
    (x_d, y_d)
}

/// Projects a camera-frame point with packed `[fx, fy, cx, cy, k1, k2, p1, p2, k3]`
/// parameters. The caller is responsible for the point being in front of the camera.
pub fn project_with_params<T: RealField>(params: &[T], point: &Vector3<T>) -> Vector2<T> {
    let x = point.x.clone() / point.z.clone();
    let y = point.y.clone() / point.z.clone();
    let (x_d, y_d) = distort_normalized(x, y, &params[4..9]);
    Vector2::new(
        params[0].clone() * x_d + params[2].clone(),
        params[1].clone() * y_d + params[3].clone(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn sample_model() -> RadTanModel {
        RadTanModel::with_resolution(
            &DVector::from_vec(vec![
                461.629, 460.152, 362.680, 246.049, -0.28340811, 0.07395907, 0.00019359,
                1.76187114e-05, 0.0,
            ]),
            Resolution {
                width: 752,
                height: 480,
            },
        )
        .unwrap()
    }

    #[test]
    fn test_radtan_rejects_bad_params() {
        let short = DVector::from_vec(vec![500.0, 500.0, 320.0]);
        assert!(matches!(
            RadTanModel::new(&short),
            Err(CameraModelError::InvalidParams(_))
        ));
        let negative_focal =
            DVector::from_vec(vec![-1.0, 500.0, 320.0, 240.0, 0.0, 0.0, 0.0, 0.0, 0.0]);
        assert_eq!(
            RadTanModel::new(&negative_focal).unwrap_err(),
            CameraModelError::FocalLengthMustBePositive
        );
    }

    #[test]
    fn test_radtan_project_unproject() {
        let model = sample_model();
        let point_3d = Vector3::new(0.5, -0.3, 2.0);
        let norm_3d = point_3d.normalize();

        let point_2d = model.project(&point_3d).unwrap();
        assert!(model.contains(&point_2d));

        let ray = model.unproject(&point_2d).unwrap();
        assert_relative_eq!(norm_3d, ray, epsilon = 1e-8);
    }

    #[test]
    fn test_radtan_multiple_points() {
        let model = sample_model();
        let test_points = [
            Vector3::new(0.0, 0.0, 1.0),
            Vector3::new(0.5, 0.0, 1.0),
            Vector3::new(-0.5, 0.0, 1.0),
            Vector3::new(0.0, 0.4, 1.0),
            Vector3::new(0.3, -0.4, 1.0),
            Vector3::new(-0.3, -0.4, 1.0),
            Vector3::new(0.1, 0.1, 2.0),
        ];

        for point in test_points.iter() {
            let pixel = model.project(point).unwrap();
            let normalized = model.undistort(&pixel).unwrap();
            assert_relative_eq!(normalized.x, point.x / point.z, epsilon = 1e-8);
            assert_relative_eq!(normalized.y, point.y / point.z, epsilon = 1e-8);
        }
    }

    #[test]
    fn test_point_behind_camera_is_rejected() {
        let model = sample_model();
        assert_eq!(
            model.project(&Vector3::new(0.0, 0.0, -1.0)).unwrap_err(),
            CameraModelError::PointAtCameraCenter
        );
    }

    #[test]
    fn test_params_round_trip() {
        let model = sample_model();
        let rebuilt = RadTanModel::with_resolution(&model.params(), model.resolution).unwrap();
        assert_eq!(model, rebuilt);
    }
}
