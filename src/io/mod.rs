//! CSV and JSON adapters for the detector streams and the produced records.
//!
//! Nothing in the numerical core depends on this module; it only converts
//! between files and the in-memory types.

use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;
use std::sync::Arc;

use log::info;
use nalgebra::Point2;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::board::{BoardTemplate, CornerId, FrameId, ObservationStore};
use crate::camera::{CalibrationStatus, CameraArray, CameraId, CameraStateError};
use crate::config::CameraSpec;
use crate::trajectory::CleanedTrack;
use crate::triangulation::{bundle_detections, Detection, FrameBundle, LandmarkId, TriangulatedPoint};

#[derive(thiserror::Error, Debug)]
pub enum IoError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid camera array: {0}")]
    InvalidCameras(#[from] CameraStateError),
}

/// One detected board corner.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoardCornerRecord {
    pub camera_id: CameraId,
    pub frame_id: FrameId,
    pub corner_id: CornerId,
    pub x: f64,
    pub y: f64,
}

/// One detected landmark.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LandmarkRecord {
    pub camera_id: CameraId,
    pub frame_id: FrameId,
    pub landmark_id: LandmarkId,
    pub x: f64,
    pub y: f64,
    pub confidence: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct IntrinsicsRecord {
    pub camera_id: CameraId,
    pub fx: f64,
    pub fy: f64,
    pub cx: f64,
    pub cy: f64,
    pub k1: f64,
    pub k2: f64,
    pub p1: f64,
    pub p2: f64,
    pub k3: f64,
    pub rms_error: f64,
    pub status: CalibrationStatus,
}

/// Camera-from-world pose as a rotation vector and translation; the pose
/// columns are empty for cameras that could not be posed.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ExtrinsicsRecord {
    pub camera_id: CameraId,
    pub rx: Option<f64>,
    pub ry: Option<f64>,
    pub rz: Option<f64>,
    pub tx: Option<f64>,
    pub ty: Option<f64>,
    pub tz: Option<f64>,
    pub reference_camera_id: CameraId,
    pub rms_error: Option<f64>,
    pub reachable: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PointRecord {
    pub frame_id: FrameId,
    pub landmark_id: LandmarkId,
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub contributing_camera_count: usize,
    pub mean_reprojection_error: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrajectoryRecord {
    pub landmark_id: LandmarkId,
    pub frame_id: FrameId,
    pub x: Option<f64>,
    pub y: Option<f64>,
    pub z: Option<f64>,
    pub is_interpolated: bool,
    pub is_gap: bool,
}

/// Reads every row of a headed CSV file.
pub fn read_records<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<Vec<T>, IoError> {
    let mut reader = csv::Reader::from_path(path)?;
    let records = reader.deserialize().collect::<Result<Vec<T>, _>>()?;
    Ok(records)
}

/// Writes `records` to a headed CSV file, replacing it.
pub fn write_records<T: Serialize>(path: impl AsRef<Path>, records: &[T]) -> Result<(), IoError> {
    let path = path.as_ref();
    let mut writer = csv::Writer::from_path(path)?;
    for record in records {
        writer.serialize(record)?;
    }
    writer.flush()?;
    info!("Wrote {} records to {}", records.len(), path.display());
    Ok(())
}

/// Builds the observation store from corner records. Records for cameras
/// missing from `cameras` are dropped and counted by the store.
pub fn observation_store(
    template: Arc<BoardTemplate>,
    cameras: &[CameraSpec],
    records: &[BoardCornerRecord],
) -> ObservationStore {
    let mut store = ObservationStore::new(template);
    for camera in cameras {
        store.register_camera(camera.id, camera.resolution());
    }
    for r in records {
        store.add_corner(r.camera_id, r.frame_id, r.corner_id, Point2::new(r.x, r.y));
    }
    store
}

pub fn board_corner_records(store: &ObservationStore) -> Vec<BoardCornerRecord> {
    store
        .camera_ids()
        .flat_map(|camera_id| store.observations_for(camera_id))
        .flat_map(|obs| {
            obs.corners.iter().map(move |(corner_id, pixel)| BoardCornerRecord {
                camera_id: obs.camera_id,
                frame_id: obs.frame_id,
                corner_id: *corner_id,
                x: pixel.x,
                y: pixel.y,
            })
        })
        .collect()
}

pub fn frame_bundles(records: &[LandmarkRecord]) -> Vec<FrameBundle> {
    bundle_detections(records.iter().map(|r| {
        (
            r.camera_id,
            r.frame_id,
            Detection {
                landmark_id: r.landmark_id,
                pixel: Point2::new(r.x, r.y),
                confidence: r.confidence,
            },
        )
    }))
}

pub fn landmark_records(bundles: &[FrameBundle]) -> Vec<LandmarkRecord> {
    bundles
        .iter()
        .flat_map(|bundle| {
            bundle.detections.iter().flat_map(move |(camera_id, detections)| {
                detections.iter().map(move |d| LandmarkRecord {
                    camera_id: *camera_id,
                    frame_id: bundle.frame_id,
                    landmark_id: d.landmark_id,
                    x: d.pixel.x,
                    y: d.pixel.y,
                    confidence: d.confidence,
                })
            })
        })
        .collect()
}

/// One record per camera with committed intrinsics.
pub fn intrinsics_records(cameras: &CameraArray) -> Vec<IntrinsicsRecord> {
    cameras
        .cameras()
        .filter_map(|camera| {
            let model = camera.model()?;
            let [k1, k2, p1, p2, k3] = model.distortions;
            Some(IntrinsicsRecord {
                camera_id: camera.id(),
                fx: model.intrinsics.fx,
                fy: model.intrinsics.fy,
                cx: model.intrinsics.cx,
                cy: model.intrinsics.cy,
                k1,
                k2,
                p1,
                p2,
                k3,
                rms_error: camera.rms_error()?,
                status: camera.status(),
            })
        })
        .collect()
}

/// One record per camera; unposed cameras are reported as unreachable.
pub fn extrinsics_records(cameras: &CameraArray) -> Vec<ExtrinsicsRecord> {
    cameras
        .cameras()
        .map(|camera| {
            let pose = camera.pose();
            let r = pose.map(|p| p.rotation);
            let t = pose.map(|p| p.translation);
            ExtrinsicsRecord {
                camera_id: camera.id(),
                rx: r.map(|r| r.x),
                ry: r.map(|r| r.y),
                rz: r.map(|r| r.z),
                tx: t.map(|t| t.x),
                ty: t.map(|t| t.y),
                tz: t.map(|t| t.z),
                reference_camera_id: cameras.reference(),
                rms_error: pose.and(camera.rms_error()),
                reachable: camera.is_fully_posed(),
            }
        })
        .collect()
}

pub fn point_records(points: &[TriangulatedPoint]) -> Vec<PointRecord> {
    points
        .iter()
        .map(|p| PointRecord {
            frame_id: p.frame_id,
            landmark_id: p.landmark_id,
            x: p.position.x,
            y: p.position.y,
            z: p.position.z,
            contributing_camera_count: p.camera_count,
            mean_reprojection_error: p.mean_residual,
        })
        .collect()
}

pub fn trajectory_records(tracks: &[CleanedTrack]) -> Vec<TrajectoryRecord> {
    tracks
        .iter()
        .flat_map(|track| {
            track.samples.iter().map(|s| TrajectoryRecord {
                landmark_id: track.landmark_id,
                frame_id: s.frame_id,
                x: s.position.map(|p| p.x),
                y: s.position.map(|p| p.y),
                z: s.position.map(|p| p.z),
                is_interpolated: s.is_interpolated,
                is_gap: s.is_gap,
            })
        })
        .collect()
}

pub fn save_camera_array(path: impl AsRef<Path>, cameras: &CameraArray) -> Result<(), IoError> {
    let writer = BufWriter::new(File::create(path)?);
    serde_json::to_writer_pretty(writer, cameras)?;
    Ok(())
}

/// Loads a camera array saved by [`save_camera_array`].
///
/// # Errors
///
/// [`IoError::InvalidCameras`] if a record's fields disagree with its
/// status, besides the read and parse errors.
pub fn load_camera_array(path: impl AsRef<Path>) -> Result<CameraArray, IoError> {
    let reader = BufReader::new(File::open(path)?);
    let cameras: CameraArray = serde_json::from_reader(reader)?;
    cameras.validate()?;
    Ok(cameras)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::{Camera, Resolution};
    use crate::geometry::Pose;
    use crate::synthetic::SyntheticRig;
    use crate::trajectory::CleanedSample;
    use approx::assert_relative_eq;
    use nalgebra::Point3;

    #[test]
    fn test_board_corners_csv_round_trip() {
        let rig = SyntheticRig::standard(2);
        let store = rig.board_observations();
        let records = board_corner_records(&store);
        assert_eq!(records.len(), store.corner_count());

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("corners.csv");
        write_records(&path, &records).unwrap();
        let read: Vec<BoardCornerRecord> = read_records(&path).unwrap();
        assert_eq!(read, records);

        // Camera 1 is not configured.
        let cameras = [CameraSpec {
            id: 0,
            width: 640,
            height: 480,
        }];
        let rebuilt = observation_store(store.template().clone(), &cameras, &read);
        assert_eq!(rebuilt.camera_ids().collect::<Vec<_>>(), vec![0]);
        assert_eq!(rebuilt.corner_count() + rebuilt.dropped(), records.len());
    }

    #[test]
    fn test_extrinsics_leave_unposed_cameras_empty() {
        let rig = SyntheticRig::standard(2);
        let posed = rig.camera_array().unwrap();
        let unposed = Camera::new(
            7,
            Resolution {
                width: 640,
                height: 480,
            },
        );
        let cameras = CameraArray::new(0, posed.cameras().cloned().chain([unposed]));

        let records = extrinsics_records(&cameras);
        assert_eq!(records.len(), 3);
        assert!(records[0].reachable);
        assert!(records[0].tx.is_some());
        let missing = records[2];
        assert_eq!(missing.camera_id, 7);
        assert!(!missing.reachable);
        assert!(missing.rx.is_none() && missing.tz.is_none() && missing.rms_error.is_none());
        // Uncalibrated cameras have no intrinsics row.
        assert_eq!(intrinsics_records(&cameras).len(), 2);

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("extrinsics.csv");
        write_records(&path, &records).unwrap();
        let read: Vec<ExtrinsicsRecord> = read_records(&path).unwrap();
        assert_eq!(read, records);
    }

    #[test]
    fn test_camera_array_json_round_trip() {
        let rig = SyntheticRig::standard(3);
        let cameras = rig.camera_array().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cameras.json");
        save_camera_array(&path, &cameras).unwrap();
        let loaded = load_camera_array(&path).unwrap();
        assert_eq!(loaded.posed_count(), 3);
        assert_relative_eq!(
            loaded.get(2).unwrap().pose().unwrap().translation,
            cameras.get(2).unwrap().pose().unwrap().translation,
            epsilon = 1e-12
        );
    }

    #[test]
    fn test_inconsistent_camera_array_is_rejected() {
        let rig = SyntheticRig::standard(3);
        let cameras = rig.camera_array().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cameras.json");
        save_camera_array(&path, &cameras).unwrap();

        let mut json: serde_json::Value =
            serde_json::from_reader(File::open(&path).unwrap()).unwrap();
        // Still marked fully posed.
        json["cameras"]["2"]["pose"] = serde_json::Value::Null;
        serde_json::to_writer(File::create(&path).unwrap(), &json).unwrap();

        let err = load_camera_array(&path).unwrap_err();
        assert!(matches!(
            err,
            IoError::InvalidCameras(CameraStateError::Inconsistent {
                camera: 2,
                status: CalibrationStatus::FullyPosed
            })
        ));

        json["cameras"]["2"]["pose"] = serde_json::to_value(Pose::identity()).unwrap();
        json["reference"] = serde_json::json!(9);
        serde_json::to_writer(File::create(&path).unwrap(), &json).unwrap();
        assert!(matches!(
            load_camera_array(&path).unwrap_err(),
            IoError::InvalidCameras(CameraStateError::UnknownReference(9))
        ));
    }

    #[test]
    fn test_trajectory_gap_rows_have_no_position() {
        let track = CleanedTrack {
            landmark_id: 2,
            samples: vec![
                CleanedSample {
                    frame_id: 0,
                    position: Some(Point3::new(1.0, 2.0, 3.0)),
                    is_interpolated: false,
                    is_gap: false,
                },
                CleanedSample {
                    frame_id: 1,
                    position: None,
                    is_interpolated: false,
                    is_gap: true,
                },
            ],
            rejected_outliers: 0,
        };
        let records = trajectory_records(&[track]);
        assert_eq!(records[0].x, Some(1.0));
        assert!(records[1].is_gap && records[1].x.is_none());

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trajectories.csv");
        write_records(&path, &records).unwrap();
        let read: Vec<TrajectoryRecord> = read_records(&path).unwrap();
        assert_eq!(read, records);
    }

    #[test]
    fn test_landmark_records_group_into_bundles() {
        let records = vec![
            LandmarkRecord {
                camera_id: 0,
                frame_id: 3,
                landmark_id: 1,
                x: 10.0,
                y: 20.0,
                confidence: 0.9,
            },
            LandmarkRecord {
                camera_id: 1,
                frame_id: 3,
                landmark_id: 1,
                x: 12.0,
                y: 21.0,
                confidence: 0.8,
            },
        ];
        let bundles = frame_bundles(&records);
        assert_eq!(bundles.len(), 1);
        assert_eq!(bundles[0].detection_count(), 2);
        assert_eq!(landmark_records(&bundles), records);
    }
}
