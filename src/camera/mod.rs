//! Camera model and the per-camera calibration record.
//!
//! [`RadTanModel`] is the only supported optical model (pinhole with
//! Brown-Conrady radial/tangential distortion). [`Camera`] is the record the
//! calibration pipeline owns for each physical camera: it moves from
//! [`CalibrationStatus::Uncalibrated`] to [`CalibrationStatus::IntrinsicsOnly`]
//! and finally to [`CalibrationStatus::FullyPosed`], after which it is frozen.

use nalgebra::{Matrix3, Point3, Vector2, Vector3};
use serde::{Deserialize, Serialize};

use crate::geometry::Pose;

pub mod array;
pub mod rad_tan;

pub use array::CameraArray;
pub use rad_tan::RadTanModel;

/// Identifier of a physical camera (the capture port).
pub type CameraId = u32;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Intrinsics {
    pub fx: f64,
    pub fy: f64,
    pub cx: f64,
    pub cy: f64,
}

impl Intrinsics {
    /// The 3x3 camera matrix `K` (zero skew).
    pub fn matrix(&self) -> Matrix3<f64> {
        Matrix3::new(self.fx, 0.0, self.cx, 0.0, self.fy, self.cy, 0.0, 0.0, 1.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum CameraModelError {
    #[error("Input point is outside the image")]
    PointIsOutSideImage,
    #[error("z is close to zero, point is at camera center")]
    PointAtCameraCenter,
    #[error("Focal length must be positive")]
    FocalLengthMustBePositive,
    #[error("Principal point must be finite")]
    PrincipalPointMustBeFinite,
    #[error("Invalid camera parameters: {0}")]
    InvalidParams(String),
    #[error("Numerical error in computation: {0}")]
    NumericalError(String),
}

/// Trait defining the core functionality for camera models
pub trait CameraModel {
    /// Project a 3D point in camera coordinates to pixel coordinates.
    fn project(&self, point_3d: &Vector3<f64>) -> Result<Vector2<f64>, CameraModelError>;

    /// Unproject pixel coordinates to a unit-length ray in camera coordinates.
    fn unproject(&self, point_2d: &Vector2<f64>) -> Result<Vector3<f64>, CameraModelError>;

    /// Validate camera parameters
    fn validate_params(&self) -> Result<(), CameraModelError>;

    fn get_intrinsics(&self) -> Intrinsics;

    fn get_resolution(&self) -> Resolution;

    fn get_distortion(&self) -> Vec<f64>;
}

/// Common validation functions for camera parameters
pub mod validation {
    use super::*;

    pub fn validate_intrinsics(intrinsics: &Intrinsics) -> Result<(), CameraModelError> {
        if !(intrinsics.fx > 0.0 && intrinsics.fy > 0.0)
            || !intrinsics.fx.is_finite()
            || !intrinsics.fy.is_finite()
        {
            return Err(CameraModelError::FocalLengthMustBePositive);
        }
        if !intrinsics.cx.is_finite() || !intrinsics.cy.is_finite() {
            return Err(CameraModelError::PrincipalPointMustBeFinite);
        }
        Ok(())
    }
}

/// Where a camera is in the calibration pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CalibrationStatus {
    Uncalibrated,
    IntrinsicsOnly,
    FullyPosed,
}

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum CameraStateError {
    #[error("camera {0} is fully posed and can no longer change")]
    AlreadyFrozen(CameraId),
    #[error("camera {0} has no intrinsic calibration")]
    NotIntrinsicallyCalibrated(CameraId),
    #[error("camera {camera} is marked {status:?} but its stored fields disagree")]
    Inconsistent {
        camera: CameraId,
        status: CalibrationStatus,
    },
    #[error("camera {0} has invalid intrinsics: {1}")]
    InvalidModel(CameraId, CameraModelError),
    #[error("camera {camera} is stored under id {key}")]
    MisfiledCamera { key: CameraId, camera: CameraId },
    #[error("reference camera {0} is not in the array")]
    UnknownReference(CameraId),
}

/// The calibration record of one camera.
///
/// There are no setters: every transition consumes the record and returns a
/// new one, and a [`CalibrationStatus::FullyPosed`] record refuses further
/// transitions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Camera {
    id: CameraId,
    resolution: Resolution,
    model: Option<RadTanModel>,
    pose: Option<Pose>,
    status: CalibrationStatus,
    rms_error: Option<f64>,
}

impl Camera {
    pub fn new(id: CameraId, resolution: Resolution) -> Self {
        Camera {
            id,
            resolution,
            model: None,
            pose: None,
            status: CalibrationStatus::Uncalibrated,
            rms_error: None,
        }
    }

    /// Commits an intrinsic calibration.
    ///
    /// # Errors
    ///
    /// [`CameraStateError::AlreadyFrozen`] if the camera is already fully posed.
    pub fn with_intrinsics(self, model: RadTanModel, rms_error: f64) -> Result<Self, CameraStateError> {
        if self.status == CalibrationStatus::FullyPosed {
            return Err(CameraStateError::AlreadyFrozen(self.id));
        }
        Ok(Camera {
            model: Some(model),
            pose: None,
            status: CalibrationStatus::IntrinsicsOnly,
            rms_error: Some(rms_error),
            ..self
        })
    }

    /// Commits the final extrinsic pose (camera-from-world) and freezes the record.
    ///
    /// The model may be replaced when the refinement also adjusted intrinsics.
    pub fn into_posed(
        self,
        model: RadTanModel,
        pose: Pose,
        rms_error: f64,
    ) -> Result<Self, CameraStateError> {
        match self.status {
            CalibrationStatus::FullyPosed => Err(CameraStateError::AlreadyFrozen(self.id)),
            CalibrationStatus::Uncalibrated => {
                Err(CameraStateError::NotIntrinsicallyCalibrated(self.id))
            }
            CalibrationStatus::IntrinsicsOnly => Ok(Camera {
                model: Some(model),
                pose: Some(pose),
                status: CalibrationStatus::FullyPosed,
                rms_error: Some(rms_error),
                ..self
            }),
        }
    }

    pub fn id(&self) -> CameraId {
        self.id
    }

    pub fn resolution(&self) -> Resolution {
        self.resolution
    }

    pub fn model(&self) -> Option<&RadTanModel> {
        self.model.as_ref()
    }

    /// Camera-from-world pose, present only once fully posed.
    pub fn pose(&self) -> Option<&Pose> {
        self.pose.as_ref()
    }

    pub fn status(&self) -> CalibrationStatus {
        self.status
    }

    pub fn rms_error(&self) -> Option<f64> {
        self.rms_error
    }

    pub fn is_fully_posed(&self) -> bool {
        self.status == CalibrationStatus::FullyPosed
    }

    /// Checks that the stored fields are the ones `status` implies, for
    /// records that did not go through the transitions.
    ///
    /// # Errors
    ///
    /// * [`CameraStateError::Inconsistent`] when a model, pose or RMS is
    ///   missing or present against the status, or the pose is not finite.
    /// * [`CameraStateError::InvalidModel`] for invalid intrinsics.
    pub fn validate(&self) -> Result<(), CameraStateError> {
        let (has_model, has_pose) = (self.model.is_some(), self.pose.is_some());
        let consistent = match self.status {
            CalibrationStatus::Uncalibrated => !has_model && !has_pose && self.rms_error.is_none(),
            CalibrationStatus::IntrinsicsOnly => has_model && !has_pose && self.rms_error.is_some(),
            CalibrationStatus::FullyPosed => has_model && has_pose && self.rms_error.is_some(),
        };
        let finite_pose = self.pose.as_ref().map_or(true, |pose| {
            pose.rotation.iter().chain(pose.translation.iter()).all(|v| v.is_finite())
        });
        if !consistent || !finite_pose {
            return Err(CameraStateError::Inconsistent {
                camera: self.id,
                status: self.status,
            });
        }
        if let Some(model) = &self.model {
            model
                .validate_params()
                .map_err(|e| CameraStateError::InvalidModel(self.id, e))?;
        }
        Ok(())
    }

    /// Projects a world point to pixels; `None` unless the camera is fully
    /// posed and the point lies in front of it.
    pub fn project_world(&self, point: &Point3<f64>) -> Option<Vector2<f64>> {
        let (model, pose) = (self.model.as_ref()?, self.pose.as_ref()?);
        let p_cam = pose.transform_point(point);
        model.project(&p_cam.coords).ok()
    }

    /// Position of the optical center in world coordinates.
    pub fn center(&self) -> Option<Point3<f64>> {
        self.pose
            .as_ref()
            .map(|pose| pose.inverse().transform_point(&Point3::origin()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::DVector;

    fn model() -> RadTanModel {
        let mut model = RadTanModel::new(&DVector::from_vec(vec![
            800.0, 790.0, 320.0, 240.0, 0.0, 0.0, 0.0, 0.0, 0.0,
        ]))
        .unwrap();
        model.resolution = Resolution {
            width: 640,
            height: 480,
        };
        model
    }

    #[test]
    fn test_camera_lifecycle_freezes_after_pose() {
        let res = Resolution {
            width: 640,
            height: 480,
        };
        let cam = Camera::new(3, res);
        assert_eq!(cam.status(), CalibrationStatus::Uncalibrated);

        let cam = cam.with_intrinsics(model(), 0.2).unwrap();
        assert_eq!(cam.status(), CalibrationStatus::IntrinsicsOnly);
        assert!(cam.pose().is_none());

        let cam = cam.into_posed(model(), Pose::identity(), 0.3).unwrap();
        assert!(cam.is_fully_posed());
        assert_relative_eq!(cam.rms_error().unwrap(), 0.3);

        let again = cam.clone().into_posed(model(), Pose::identity(), 0.1);
        assert_eq!(again.unwrap_err(), CameraStateError::AlreadyFrozen(3));
        let again = cam.with_intrinsics(model(), 0.1);
        assert_eq!(again.unwrap_err(), CameraStateError::AlreadyFrozen(3));
    }

    #[test]
    fn test_uncalibrated_camera_cannot_be_posed() {
        let cam = Camera::new(
            1,
            Resolution {
                width: 640,
                height: 480,
            },
        );
        let err = cam.into_posed(model(), Pose::identity(), 0.0).unwrap_err();
        assert_eq!(err, CameraStateError::NotIntrinsicallyCalibrated(1));
    }

    #[test]
    fn test_center_of_translated_camera() {
        let res = model().resolution;
        let pose = Pose::from_parts(Vector3::zeros(), Vector3::new(-1.0, 0.0, 0.0));
        let cam = Camera::new(0, res)
            .with_intrinsics(model(), 0.0)
            .unwrap()
            .into_posed(model(), pose, 0.0)
            .unwrap();
        let center = cam.center().unwrap();
        assert_relative_eq!(center.x, 1.0, epsilon = 1e-12);
        assert_relative_eq!(center.y, 0.0, epsilon = 1e-12);
        assert!(cam.project_world(&Point3::new(1.0, 0.0, 2.0)).is_some());
        assert!(cam.project_world(&Point3::new(1.0, 0.0, -2.0)).is_none());
    }
}
