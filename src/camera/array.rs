use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::{Camera, CameraId, CameraStateError, RadTanModel};
use crate::geometry::Pose;

/// The committed calibration of every camera in the capture volume.
///
/// Poses are camera-from-world, where the world frame is the reference
/// camera's frame. Cameras that could not be posed remain in the array with
/// their earlier status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CameraArray {
    reference: CameraId,
    cameras: BTreeMap<CameraId, Camera>,
}

impl CameraArray {
    pub fn new(reference: CameraId, cameras: impl IntoIterator<Item = Camera>) -> Self {
        CameraArray {
            reference,
            cameras: cameras.into_iter().map(|c| (c.id(), c)).collect(),
        }
    }

    /// Builds an array of fully posed cameras from known parameters, such as a
    /// previously exported calibration.
    pub fn from_known(
        reference: CameraId,
        cameras: impl IntoIterator<Item = (CameraId, RadTanModel, Pose)>,
    ) -> Result<Self, CameraStateError> {
        let cameras = cameras
            .into_iter()
            .map(|(id, model, pose)| {
                Camera::new(id, model.resolution)
                    .with_intrinsics(model.clone(), 0.0)?
                    .into_posed(model, pose, 0.0)
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(CameraArray::new(reference, cameras))
    }

    pub fn reference(&self) -> CameraId {
        self.reference
    }

    pub fn get(&self, id: CameraId) -> Option<&Camera> {
        self.cameras.get(&id)
    }

    pub fn cameras(&self) -> impl Iterator<Item = &Camera> {
        self.cameras.values()
    }

    pub fn len(&self) -> usize {
        self.cameras.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cameras.is_empty()
    }

    /// Checks every camera record and the reference, for arrays that were
    /// deserialized rather than built.
    ///
    /// # Errors
    ///
    /// The first [`CameraStateError`] found.
    pub fn validate(&self) -> Result<(), CameraStateError> {
        if !self.cameras.contains_key(&self.reference) {
            return Err(CameraStateError::UnknownReference(self.reference));
        }
        for (key, camera) in &self.cameras {
            if *key != camera.id() {
                return Err(CameraStateError::MisfiledCamera {
                    key: *key,
                    camera: camera.id(),
                });
            }
            camera.validate()?;
        }
        Ok(())
    }

    /// Cameras usable for triangulation.
    pub fn posed(&self) -> impl Iterator<Item = &Camera> {
        self.cameras.values().filter(|c| c.is_fully_posed())
    }

    pub fn posed_count(&self) -> usize {
        self.posed().count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::{CalibrationStatus, Resolution};
    use nalgebra::{DVector, Vector3};

    fn model() -> RadTanModel {
        RadTanModel::with_resolution(
            &DVector::from_vec(vec![500.0, 500.0, 320.0, 240.0, 0.0, 0.0, 0.0, 0.0, 0.0]),
            Resolution {
                width: 640,
                height: 480,
            },
        )
        .unwrap()
    }

    #[test]
    fn test_posed_excludes_unfinished_cameras() {
        let posed = Camera::new(0, model().resolution)
            .with_intrinsics(model(), 0.1)
            .unwrap()
            .into_posed(model(), Pose::identity(), 0.2)
            .unwrap();
        let intrinsics_only = Camera::new(1, model().resolution)
            .with_intrinsics(model(), 0.1)
            .unwrap();
        let array = CameraArray::new(0, [posed, intrinsics_only]);

        assert_eq!(array.len(), 2);
        assert_eq!(array.posed_count(), 1);
        assert_eq!(array.get(1).unwrap().status(), CalibrationStatus::IntrinsicsOnly);
    }

    #[test]
    fn test_from_known_freezes_every_camera() {
        let pose = Pose::from_parts(Vector3::zeros(), Vector3::new(-0.3, 0.0, 0.0));
        let array = CameraArray::from_known(0, [(0, model(), Pose::identity()), (4, model(), pose)])
            .unwrap();
        assert_eq!(array.posed_count(), 2);
        assert_eq!(array.reference(), 0);
        assert!(array.get(4).unwrap().is_fully_posed());
    }
}
