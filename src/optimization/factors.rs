//! Residual factors for tiny-solver.
//!
//! Every factor is generic over [`RealField`] so tiny-solver can evaluate it on
//! dual numbers for automatic differentiation. Blocks that a problem holds
//! fixed are stored in the factor as plain `f64` constants instead of being
//! passed as parameters; this is how the gauge (reference camera) and the
//! fixed intrinsics of the pose-only problems are expressed.

use nalgebra::{DVector, RealField, Vector2, Vector3};
use tiny_solver::factors::Factor;

use crate::camera::rad_tan::{project_with_params, RAD_TAN_PARAMS};
use crate::geometry::{transform_generic, POSE_PARAMS};

fn to_real<T: RealField>(values: &[f64]) -> Vec<T> {
    values.iter().map(|v| nalgebra::convert(*v)).collect()
}

/// Reprojection of board corners seen by one camera.
///
/// The chain is `pixel = project(camera, camera_pose * board_pose * X)`.
/// Parameter blocks, in order:
/// 1. `board_pose` (6), always free,
/// 2. `camera_pose` (6), unless fixed,
/// 3. `camera` (9, `[fx, fy, cx, cy, k1, k2, p1, p2, k3]`), unless fixed.
///
/// Residuals are `sqrt(weight) * (projected - observed)`, two per corner.
#[derive(Debug, Clone)]
pub struct BoardViewFactor {
    board_points: Vec<Vector3<f64>>,
    pixels: Vec<Vector2<f64>>,
    sqrt_weight: f64,
    camera_pose: Option<[f64; POSE_PARAMS]>,
    camera: Option<[f64; RAD_TAN_PARAMS]>,
}

impl BoardViewFactor {
    /// A factor with both the camera pose and the camera parameters free.
    pub fn new(board_points: Vec<Vector3<f64>>, pixels: Vec<Vector2<f64>>) -> Self {
        BoardViewFactor {
            board_points,
            pixels,
            sqrt_weight: 1.0,
            camera_pose: None,
            camera: None,
        }
    }

    pub fn with_weight(mut self, weight: f64) -> Self {
        self.sqrt_weight = weight.sqrt();
        self
    }

    pub fn with_fixed_camera_pose(mut self, pose: [f64; POSE_PARAMS]) -> Self {
        self.camera_pose = Some(pose);
        self
    }

    pub fn with_fixed_camera(mut self, camera: [f64; RAD_TAN_PARAMS]) -> Self {
        self.camera = Some(camera);
        self
    }

    pub fn residual_dim(&self) -> usize {
        2 * self.pixels.len()
    }

    pub fn has_free_camera_pose(&self) -> bool {
        self.camera_pose.is_none()
    }

    pub fn has_free_camera(&self) -> bool {
        self.camera.is_none()
    }
}

impl<T: RealField> Factor<T> for BoardViewFactor {
    fn residual_func(&self, params: &[DVector<T>]) -> DVector<T> {
        let board_pose = params[0].as_slice();
        let mut next = 1;
        let camera_pose = match &self.camera_pose {
            Some(fixed) => to_real::<T>(fixed),
            None => {
                next += 1;
                params[next - 1].as_slice().to_vec()
            }
        };
        let camera = match &self.camera {
            Some(fixed) => to_real::<T>(fixed),
            None => params[next].as_slice().to_vec(),
        };
        let sqrt_weight: T = nalgebra::convert(self.sqrt_weight);

        let mut residuals = DVector::zeros(self.residual_dim());
        for (i, (point, pixel)) in self.board_points.iter().zip(self.pixels.iter()).enumerate() {
            let x: Vector3<T> = Vector3::new(
                nalgebra::convert(point.x),
                nalgebra::convert(point.y),
                nalgebra::convert(point.z),
            );
            let p_world = transform_generic(board_pose, &x);
            let p_cam = transform_generic(&camera_pose, &p_world);
            let projected = project_with_params(&camera, &p_cam);

            let u: T = nalgebra::convert(pixel.x);
            let v: T = nalgebra::convert(pixel.y);
            residuals[2 * i] = sqrt_weight.clone() * (projected.x.clone() - u);
            residuals[2 * i + 1] = sqrt_weight.clone() * (projected.y.clone() - v);
        }
        residuals
    }
}

/// Reprojection of a single 3D point into one posed camera.
///
/// One parameter block: the point `[x, y, z]` in world coordinates.
#[derive(Debug, Clone)]
pub struct PointReprojectionFactor {
    camera: [f64; RAD_TAN_PARAMS],
    camera_pose: [f64; POSE_PARAMS],
    pixel: Vector2<f64>,
    sqrt_weight: f64,
}

impl PointReprojectionFactor {
    pub fn new(
        camera: [f64; RAD_TAN_PARAMS],
        camera_pose: [f64; POSE_PARAMS],
        pixel: Vector2<f64>,
        weight: f64,
    ) -> Self {
        PointReprojectionFactor {
            camera,
            camera_pose,
            pixel,
            sqrt_weight: weight.sqrt(),
        }
    }
}

impl<T: RealField> Factor<T> for PointReprojectionFactor {
    fn residual_func(&self, params: &[DVector<T>]) -> DVector<T> {
        let point = &params[0];
        let p = Vector3::new(point[0].clone(), point[1].clone(), point[2].clone());
        let camera_pose = to_real::<T>(&self.camera_pose);
        let camera = to_real::<T>(&self.camera);
        let projected = project_with_params(&camera, &transform_generic(&camera_pose, &p));

        let sqrt_weight: T = nalgebra::convert(self.sqrt_weight);
        let u: T = nalgebra::convert(self.pixel.x);
        let v: T = nalgebra::convert(self.pixel.y);
        DVector::from_vec(vec![
            sqrt_weight.clone() * (projected.x.clone() - u),
            sqrt_weight * (projected.y.clone() - v),
        ])
    }
}
