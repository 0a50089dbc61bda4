//! Ground-truth camera rigs for tests and the `simulate` command.
//!
//! Cameras sit on an arc facing the capture volume, a calibration board is
//! placed in a fixed set of positions and tilts, and landmarks follow smooth
//! paths. All poses are expressed with camera 0 as the world frame, so the
//! truth can be compared directly against a calibration whose reference is
//! camera 0.

use std::collections::BTreeMap;
use std::sync::Arc;

use nalgebra::{DVector, Matrix3, Point2, Point3, Vector2, Vector3};

use crate::board::{BoardGeometry, BoardTemplate, FrameId, ObservationStore};
use crate::camera::{CameraArray, CameraId, CameraModel, CameraStateError, RadTanModel, Resolution};
use crate::geometry::Pose;
use crate::triangulation::{Detection, FrameBundle, LandmarkId};

#[derive(Debug, Clone)]
pub struct SyntheticCamera {
    pub id: CameraId,
    pub model: RadTanModel,
    /// Camera-from-world.
    pub pose: Pose,
}

impl SyntheticCamera {
    /// Projects a world point, `None` when it is behind the camera or off the image.
    pub fn observe(&self, point: &Point3<f64>) -> Option<Vector2<f64>> {
        let p_cam = self.pose.transform_point(point);
        if p_cam.z <= 0.0 {
            return None;
        }
        let uv = self.model.project(&p_cam.coords).ok()?;
        self.model.contains(&uv).then_some(uv)
    }
}

/// A true landmark position at one frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LandmarkTruth {
    pub frame_id: FrameId,
    pub landmark_id: LandmarkId,
    pub position: Point3<f64>,
}

#[derive(Debug, Clone)]
pub struct SyntheticRig {
    pub geometry: BoardGeometry,
    pub cameras: Vec<SyntheticCamera>,
    /// World-from-board pose of every board frame.
    pub board_poses: Vec<(FrameId, Pose)>,
    /// Frame in which the rig was laid out, centered on the capture volume.
    pub world_from_scene: Pose,
}

const ARC_RADIUS: f64 = 1.5;
const ARC_STEP: f64 = 10.0 * std::f64::consts::PI / 180.0;

const BOARD_TILTS: [[f64; 3]; 12] = [
    [0.35, 0.0, 0.0],
    [0.0, 0.35, 0.0],
    [-0.35, 0.0, 0.0],
    [0.0, -0.35, 0.0],
    [0.25, 0.25, 0.1],
    [-0.25, 0.25, -0.1],
    [0.25, -0.25, 0.2],
    [-0.25, -0.25, -0.2],
    [0.3, 0.1, 0.0],
    [0.1, -0.3, 0.1],
    [-0.3, -0.1, 0.0],
    [-0.1, 0.3, -0.1],
];

/// Camera-from-scene pose of a camera on the arc, looking at the origin.
fn arc_pose(angle: f64) -> Pose {
    let (s, c) = angle.sin_cos();
    let rotation = Matrix3::new(c, 0.0, s, 0.0, 1.0, 0.0, -s, 0.0, c);
    let center = Vector3::new(ARC_RADIUS * s, 0.0, -ARC_RADIUS * c);
    Pose::from_rotation_matrix(&rotation, -(rotation * center))
}

impl SyntheticRig {
    /// `camera_count` cameras 10 degrees apart and twelve board frames
    /// (ids `0..12`) around the origin of a 7x6 board with 6 cm squares.
    pub fn standard(camera_count: usize) -> Self {
        let geometry = BoardGeometry {
            columns: 7,
            rows: 6,
            square_size: 0.06,
        };
        let resolution = Resolution {
            width: 640,
            height: 480,
        };

        let middle = (camera_count.max(1) - 1) as f64 / 2.0;
        let scene_poses: Vec<Pose> = (0..camera_count)
            .map(|i| arc_pose((i as f64 - middle) * ARC_STEP))
            .collect();
        // Camera 0 becomes the world frame.
        let scene_from_world = scene_poses
            .first()
            .map(Pose::inverse)
            .unwrap_or_default();

        let cameras = scene_poses
            .iter()
            .enumerate()
            .filter_map(|(i, scene_pose)| {
                let k = i as f64;
                let fx = 500.0 + 10.0 * k;
                let params = DVector::from_vec(vec![
                    fx,
                    fx - 5.0,
                    320.0 + 3.0 * k,
                    240.0 - 2.0 * k,
                    -0.05 + 0.01 * k,
                    0.01,
                    0.0005,
                    -0.0003,
                    0.0,
                ]);
                Some(SyntheticCamera {
                    id: i as CameraId,
                    model: RadTanModel::with_resolution(&params, resolution).ok()?,
                    pose: if i == 0 {
                        Pose::identity()
                    } else {
                        scene_pose.compose(&scene_from_world)
                    },
                })
            })
            .collect();

        let center = Vector3::new(
            0.5 * geometry.columns as f64 * geometry.square_size,
            0.5 * geometry.rows as f64 * geometry.square_size,
            0.0,
        );
        let world_from_scene = scene_from_world.inverse();
        let board_poses = BOARD_TILTS
            .iter()
            .enumerate()
            .map(|(i, tilt)| {
                let position = Vector3::new(
                    [-0.3, 0.0, 0.3][i % 3],
                    [-0.2, 0.2][(i / 3) % 2],
                    [-0.2, 0.2][(i / 6) % 2],
                );
                let rotation = Vector3::new(tilt[0], tilt[1], tilt[2]);
                let scene_from_board = Pose::from_parts(rotation, Vector3::zeros());
                let scene_from_board = Pose::from_parts(
                    rotation,
                    position - scene_from_board.rotation_matrix() * center,
                );
                (i as FrameId, world_from_scene.compose(&scene_from_board))
            })
            .collect();

        SyntheticRig {
            geometry,
            cameras,
            board_poses,
            world_from_scene,
        }
    }

    pub fn camera(&self, id: CameraId) -> Option<&SyntheticCamera> {
        self.cameras.iter().find(|c| c.id == id)
    }

    /// Every visible corner of every board frame in every camera.
    pub fn board_observations(&self) -> ObservationStore {
        self.board_observations_where(|_, _| true)
    }

    /// Board observations restricted to the `(camera, frame)` pairs `keep`
    /// accepts.
    pub fn board_observations_where<F>(&self, keep: F) -> ObservationStore
    where
        F: Fn(CameraId, FrameId) -> bool,
    {
        let template = Arc::new(BoardTemplate::layout(self.geometry));
        let mut store = ObservationStore::new(template.clone());
        for camera in &self.cameras {
            store.register_camera(camera.id, camera.model.resolution);
        }
        for (frame_id, world_from_board) in &self.board_poses {
            for camera in self.cameras.iter().filter(|c| keep(c.id, *frame_id)) {
                for (corner_id, corner) in template.corners() {
                    if let Some(uv) = camera.observe(&world_from_board.transform_point(corner)) {
                        store.add_corner(camera.id, *frame_id, corner_id, Point2::new(uv.x, uv.y));
                    }
                }
            }
        }
        store
    }

    /// The true calibration with camera 0 as reference.
    pub fn camera_array(&self) -> Result<CameraArray, CameraStateError> {
        CameraArray::from_known(
            0,
            self.cameras.iter().map(|c| (c.id, c.model.clone(), c.pose)),
        )
    }

    /// Landmarks moving on slow ellipses in front of the cameras.
    pub fn landmark_paths(&self, frame_count: u64, landmark_count: u32) -> Vec<LandmarkTruth> {
        let mut truths = Vec::new();
        for frame_id in 0..frame_count {
            let t = frame_id as f64 * 0.1;
            for landmark_id in 0..landmark_count {
                let phase = landmark_id as f64;
                let scene = Point3::new(
                    0.1 * phase.cos() + 0.2 * (t + phase).cos(),
                    0.1 * phase.sin() + 0.15 * (t + phase).sin(),
                    0.05 * (2.0 * t).sin(),
                );
                truths.push(LandmarkTruth {
                    frame_id,
                    landmark_id,
                    position: self.world_from_scene.transform_point(&scene),
                });
            }
        }
        truths
    }

    /// Noise-free detections of `truths`, grouped by frame.
    pub fn frame_bundles(&self, truths: &[LandmarkTruth]) -> Vec<FrameBundle> {
        let mut frames: BTreeMap<FrameId, FrameBundle> = BTreeMap::new();
        for truth in truths {
            let bundle = frames
                .entry(truth.frame_id)
                .or_insert_with(|| FrameBundle::new(truth.frame_id));
            for camera in &self.cameras {
                if let Some(uv) = camera.observe(&truth.position) {
                    bundle.push(
                        camera.id,
                        Detection {
                            landmark_id: truth.landmark_id,
                            pixel: Point2::new(uv.x, uv.y),
                            confidence: 1.0,
                        },
                    );
                }
            }
        }
        frames.into_values().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_camera_zero_is_world_frame() {
        let rig = SyntheticRig::standard(3);
        assert_eq!(rig.cameras.len(), 3);
        assert_eq!(rig.cameras[0].pose, Pose::identity());
        // The other cameras sit on the arc, 10 degrees apart.
        let angle = rig.cameras[1].pose.angle_to(&rig.cameras[0].pose);
        assert_relative_eq!(angle, ARC_STEP, epsilon = 1e-12);
    }

    #[test]
    fn test_every_frame_fully_visible() {
        let rig = SyntheticRig::standard(3);
        let store = rig.board_observations();
        let corners = rig.geometry.corner_count();
        for camera in &rig.cameras {
            let observations = store.observations_for(camera.id);
            assert_eq!(observations.len(), rig.board_poses.len());
            assert!(observations.iter().all(|o| o.len() == corners));
        }
        assert_eq!(store.dropped(), 0);
    }

    #[test]
    fn test_landmarks_seen_by_all_cameras() {
        let rig = SyntheticRig::standard(2);
        let truths = rig.landmark_paths(5, 3);
        let bundles = rig.frame_bundles(&truths);
        assert_eq!(bundles.len(), 5);
        assert!(bundles.iter().all(|b| b.detection_count() == 6));
    }
}
