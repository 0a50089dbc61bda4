//! Landmark triangulation across fully posed cameras.
//!
//! Each landmark in a frame is seeded with a confidence-weighted linear
//! (DLT) solve on undistorted coordinates, refined by minimizing pixel
//! reprojection error, then checked view by view: the worst view is dropped
//! while its residual is too large, and the landmark is left out of the
//! output once fewer than two views remain.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};

use log::{debug, info};
use nalgebra::{DMatrix, DVector, Point2, Point3, Vector2};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tiny_solver::optimizer::OptimizerOptions;
use tiny_solver::{LevenbergMarquardtOptimizer, Optimizer as TinySolverOptimizer};

use crate::board::FrameId;
use crate::camera::{CameraArray, CameraId, CameraModel, RadTanModel};
use crate::geometry::{null_vector, Pose};
use crate::optimization::PointReprojectionFactor;
use crate::progress::{CancellationToken, ProgressEvent, ProgressObserver, Stage};

/// Identifier of a tracked landmark (a detector keypoint id).
pub type LandmarkId = u32;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub landmark_id: LandmarkId,
    pub pixel: Point2<f64>,
    pub confidence: f64,
}

/// Every landmark detection of one synchronized frame.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FrameBundle {
    pub frame_id: FrameId,
    pub detections: BTreeMap<CameraId, Vec<Detection>>,
}

impl FrameBundle {
    pub fn new(frame_id: FrameId) -> Self {
        FrameBundle {
            frame_id,
            detections: BTreeMap::new(),
        }
    }

    pub fn push(&mut self, camera_id: CameraId, detection: Detection) {
        self.detections.entry(camera_id).or_default().push(detection);
    }

    pub fn detection_count(&self) -> usize {
        self.detections.values().map(Vec::len).sum()
    }
}

/// Groups a flat stream of detections into per-frame bundles, ordered by frame.
pub fn bundle_detections(
    detections: impl IntoIterator<Item = (CameraId, FrameId, Detection)>,
) -> Vec<FrameBundle> {
    let mut frames: BTreeMap<FrameId, FrameBundle> = BTreeMap::new();
    for (camera_id, frame_id, detection) in detections {
        frames
            .entry(frame_id)
            .or_insert_with(|| FrameBundle::new(frame_id))
            .push(camera_id, detection);
    }
    frames.into_values().collect()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TriangulationConfig {
    /// Detections below this confidence are dropped.
    pub min_confidence: f64,
    /// Views whose reprojection error exceeds this are discarded one at a time.
    pub max_residual_px: f64,
    /// Refine the linear estimate by minimizing pixel error.
    pub refine: bool,
    pub max_iterations: usize,
}

impl Default for TriangulationConfig {
    fn default() -> Self {
        TriangulationConfig {
            min_confidence: 0.5,
            max_residual_px: 5.0,
            refine: true,
            max_iterations: 20,
        }
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum TriangulationError {
    #[error("triangulation needs at least 2 fully posed cameras, found {found}")]
    InsufficientCameras { found: usize },
    #[error("triangulation cancelled")]
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TriangulatedPoint {
    pub frame_id: FrameId,
    pub landmark_id: LandmarkId,
    pub position: Point3<f64>,
    pub camera_count: usize,
    /// Mean pixel reprojection error over the contributing views.
    pub mean_residual: f64,
}

#[derive(Debug, Clone, Default)]
pub struct TriangulationOutput {
    /// Ordered by frame, then landmark.
    pub points: Vec<TriangulatedPoint>,
    pub dropped_detections: usize,
}

/// One camera's observation of a landmark.
#[derive(Debug, Clone)]
pub struct View<'a> {
    pub camera_id: CameraId,
    pub model: &'a RadTanModel,
    /// Camera-from-world.
    pub pose: Pose,
    pub pixel: Vector2<f64>,
    /// Undistorted coordinates on the `z = 1` plane.
    pub normalized: Vector2<f64>,
    pub weight: f64,
}

impl View<'_> {
    /// Pixel error of a world point; infinite if the point is behind the camera.
    fn residual(&self, point: &Point3<f64>) -> f64 {
        let p_cam = self.pose.transform_point(point);
        if p_cam.z <= 0.0 {
            return f64::INFINITY;
        }
        match self.model.project(&p_cam.coords) {
            Ok(uv) => (uv - self.pixel).norm(),
            Err(_) => f64::INFINITY,
        }
    }
}

/// Confidence-weighted DLT on normalized coordinates.
fn linear_triangulation(views: &[View<'_>]) -> Option<Point3<f64>> {
    let mut a = DMatrix::<f64>::zeros(2 * views.len(), 4);
    for (i, view) in views.iter().enumerate() {
        let p = view.pose.matrix3x4();
        let w = view.weight.sqrt();
        for j in 0..4 {
            a[(2 * i, j)] = w * (view.normalized.x * p[(2, j)] - p[(0, j)]);
            a[(2 * i + 1, j)] = w * (view.normalized.y * p[(2, j)] - p[(1, j)]);
        }
    }
    let x = null_vector(&a).ok()?;
    if x[3].abs() < 1e-12 {
        return None;
    }
    let point = Point3::new(x[0] / x[3], x[1] / x[3], x[2] / x[3]);
    point.coords.iter().all(|v| v.is_finite()).then_some(point)
}

/// Minimizes the weighted pixel error of `initial` over all views.
fn refine_point(views: &[View<'_>], initial: &Point3<f64>, max_iterations: usize) -> Option<Point3<f64>> {
    let mut problem = tiny_solver::Problem::new();
    for view in views {
        let factor = PointReprojectionFactor::new(
            view.model.params_array(),
            view.pose.to_array(),
            view.pixel,
            view.weight,
        );
        problem.add_residual_block(2, &["point"], Box::new(factor), None);
    }
    let initial_values = HashMap::from([(
        "point".to_string(),
        DVector::from_vec(vec![initial.x, initial.y, initial.z]),
    )]);
    let optimizer = LevenbergMarquardtOptimizer::default();
    let result = optimizer.optimize(
        &problem,
        &initial_values,
        Some(OptimizerOptions {
            max_iteration: max_iterations,
            ..Default::default()
        }),
    )?;
    let p = result.get("point")?;
    let point = Point3::new(p[0], p[1], p[2]);
    point.coords.iter().all(|v| v.is_finite()).then_some(point)
}

/// Triangulates one landmark, discarding the worst view while any residual
/// exceeds `max_residual_px`.
///
/// Returns the position, the number of views used and their mean residual.
/// `None` once fewer than two views are left, or when the rays do not
/// intersect at a finite point.
pub fn triangulate_views(
    mut views: Vec<View<'_>>,
    config: &TriangulationConfig,
) -> Option<(Point3<f64>, usize, f64)> {
    while views.len() >= 2 {
        let candidate = linear_triangulation(&views).map(|linear| {
            if config.refine {
                refine_point(&views, &linear, config.max_iterations).unwrap_or(linear)
            } else {
                linear
            }
        });
        let Some(point) = candidate else {
            debug!("{} rays have no finite intersection", views.len());
            return None;
        };

        let residuals: Vec<f64> = views.iter().map(|v| v.residual(&point)).collect();
        let (worst, worst_residual) = residuals
            .iter()
            .copied()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(&b.1))?;
        if worst_residual <= config.max_residual_px {
            let mean = residuals.iter().sum::<f64>() / residuals.len() as f64;
            return Some((point, views.len(), mean));
        }
        debug!(
            "Dropping camera {} view with residual {:.3} px",
            views[worst].camera_id, worst_residual
        );
        views.remove(worst);
    }
    None
}

struct PosedCamera<'a> {
    model: &'a RadTanModel,
    pose: Pose,
}

fn triangulate_bundle(
    bundle: &FrameBundle,
    cameras: &BTreeMap<CameraId, PosedCamera<'_>>,
    config: &TriangulationConfig,
) -> (Vec<TriangulatedPoint>, usize) {
    let mut dropped = 0;
    let mut landmarks: BTreeMap<LandmarkId, Vec<View<'_>>> = BTreeMap::new();
    for (camera_id, detections) in &bundle.detections {
        let Some(camera) = cameras.get(camera_id) else {
            dropped += detections.len();
            continue;
        };
        for detection in detections {
            let pixel = detection.pixel.coords;
            let usable = detection.confidence.is_finite()
                && detection.confidence >= config.min_confidence
                && pixel.iter().all(|v| v.is_finite());
            let normalized = if usable { camera.model.undistort(&pixel).ok() } else { None };
            let views = landmarks.entry(detection.landmark_id).or_default();
            match normalized {
                Some(normalized) if views.iter().all(|v| v.camera_id != *camera_id) => {
                    views.push(View {
                        camera_id: *camera_id,
                        model: camera.model,
                        pose: camera.pose,
                        pixel,
                        normalized,
                        weight: detection.confidence,
                    });
                }
                _ => dropped += 1,
            }
        }
    }

    let points = landmarks
        .into_par_iter()
        .filter_map(|(landmark_id, views)| {
            let (position, camera_count, mean_residual) = triangulate_views(views, config)?;
            Some(TriangulatedPoint {
                frame_id: bundle.frame_id,
                landmark_id,
                position,
                camera_count,
                mean_residual,
            })
        })
        .collect();
    (points, dropped)
}

/// Triangulates every landmark of every bundle.
///
/// Detections that are below `min_confidence`, non-finite, duplicated, or
/// from a camera that is not fully posed are dropped and counted.
///
/// # Errors
///
/// * [`TriangulationError::InsufficientCameras`] if fewer than two cameras
///   are fully posed.
/// * [`TriangulationError::Cancelled`] if cancelled; checked per frame.
pub fn triangulate(
    cameras: &CameraArray,
    bundles: &[FrameBundle],
    config: &TriangulationConfig,
    observer: &dyn ProgressObserver,
    cancel: &CancellationToken,
) -> Result<TriangulationOutput, TriangulationError> {
    let posed: BTreeMap<CameraId, PosedCamera<'_>> = cameras
        .posed()
        .filter_map(|c| {
            Some((
                c.id(),
                PosedCamera {
                    model: c.model()?,
                    pose: *c.pose()?,
                },
            ))
        })
        .collect();
    if posed.len() < 2 {
        return Err(TriangulationError::InsufficientCameras { found: posed.len() });
    }

    info!(
        "Triangulating {} frames with {} posed cameras",
        bundles.len(),
        posed.len()
    );
    let completed = AtomicUsize::new(0);
    let per_frame: Vec<Option<(Vec<TriangulatedPoint>, usize)>> = bundles
        .par_iter()
        .map(|bundle| {
            if cancel.is_cancelled() {
                return None;
            }
            let result = triangulate_bundle(bundle, &posed, config);
            let done = completed.fetch_add(1, Ordering::Relaxed) + 1;
            observer.on_progress(&ProgressEvent::new(Stage::Triangulation, done, bundles.len()));
            Some(result)
        })
        .collect();

    if cancel.is_cancelled() {
        return Err(TriangulationError::Cancelled);
    }
    let mut output = TriangulationOutput::default();
    for (points, dropped) in per_frame.into_iter().flatten() {
        output.points.extend(points);
        output.dropped_detections += dropped;
    }
    output
        .points
        .sort_by_key(|p| (p.frame_id, p.landmark_id));
    info!(
        "Triangulated {} points, dropped {} detections",
        output.points.len(),
        output.dropped_detections
    );
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::{Camera, Resolution};
    use approx::assert_relative_eq;
    use nalgebra::Vector3;

    fn model() -> RadTanModel {
        RadTanModel::with_resolution(
            &DVector::from_vec(vec![600.0, 600.0, 320.0, 240.0, -0.05, 0.01, 0.0, 0.0, 0.0]),
            Resolution {
                width: 640,
                height: 480,
            },
        )
        .unwrap()
    }

    fn rig() -> CameraArray {
        CameraArray::from_known(
            0,
            [
                (0, model(), Pose::identity()),
                (1, model(), Pose::from_parts(Vector3::new(0.0, -0.2, 0.0), Vector3::new(-0.5, 0.0, 0.1))),
                (2, model(), Pose::from_parts(Vector3::new(0.0, 0.2, 0.0), Vector3::new(0.5, 0.0, 0.1))),
            ],
        )
        .unwrap()
    }

    fn observe(cameras: &CameraArray, frame: FrameId, points: &[(LandmarkId, Point3<f64>)]) -> FrameBundle {
        let mut bundle = FrameBundle::new(frame);
        for camera in cameras.posed() {
            for (id, p) in points {
                let uv = camera.project_world(p).unwrap();
                bundle.push(
                    camera.id(),
                    Detection {
                        landmark_id: *id,
                        pixel: Point2::new(uv.x, uv.y),
                        confidence: 0.9,
                    },
                );
            }
        }
        bundle
    }

    #[test]
    fn test_exact_points_are_recovered() {
        let cameras = rig();
        let truth = [(3, Point3::new(0.1, -0.05, 2.0)), (7, Point3::new(-0.2, 0.1, 2.5))];
        let bundle = observe(&cameras, 4, &truth);
        let output = triangulate(
            &cameras,
            &[bundle],
            &TriangulationConfig::default(),
            &crate::progress::NullObserver,
            &CancellationToken::new(),
        )
        .unwrap();

        assert_eq!(output.points.len(), 2);
        assert_eq!(output.dropped_detections, 0);
        for (point, (id, expected)) in output.points.iter().zip(truth.iter()) {
            assert_eq!(point.landmark_id, *id);
            assert_eq!(point.frame_id, 4);
            assert_eq!(point.camera_count, 3);
            assert_relative_eq!(point.position, *expected, epsilon = 1e-6);
            assert!(point.mean_residual < 1e-6);
        }
    }

    #[test]
    fn test_outlier_view_is_discarded() {
        let cameras = rig();
        let truth = Point3::new(0.0, 0.0, 2.2);
        let mut bundle = observe(&cameras, 0, &[(1, truth)]);
        bundle.detections.get_mut(&2).unwrap()[0].pixel.x += 40.0;

        let output = triangulate(
            &cameras,
            &[bundle],
            &TriangulationConfig::default(),
            &crate::progress::NullObserver,
            &CancellationToken::new(),
        )
        .unwrap();
        let point = output.points[0];
        assert_eq!(point.camera_count, 2);
        assert_relative_eq!(point.position, truth, epsilon = 1e-6);
    }

    #[test]
    fn test_parallel_rays_yield_nothing() {
        let model = model();
        let views: Vec<View<'_>> = [-0.5, 0.0, 0.5]
            .iter()
            .enumerate()
            .map(|(i, x)| View {
                camera_id: i as CameraId,
                model: &model,
                pose: Pose::from_parts(Vector3::zeros(), Vector3::new(*x, 0.0, 0.0)),
                pixel: Vector2::new(320.0, 240.0),
                normalized: Vector2::zeros(),
                weight: 1.0,
            })
            .collect();
        assert!(triangulate_views(views, &TriangulationConfig::default()).is_none());
    }

    #[test]
    fn test_single_view_yields_nothing() {
        let cameras = rig();
        let mut bundle = FrameBundle::new(0);
        bundle.push(
            0,
            Detection {
                landmark_id: 1,
                pixel: Point2::new(300.0, 200.0),
                confidence: 1.0,
            },
        );
        // Low confidence and unknown camera are dropped.
        bundle.push(
            1,
            Detection {
                landmark_id: 1,
                pixel: Point2::new(310.0, 200.0),
                confidence: 0.1,
            },
        );
        bundle.push(
            9,
            Detection {
                landmark_id: 1,
                pixel: Point2::new(310.0, 200.0),
                confidence: 1.0,
            },
        );
        let output = triangulate(
            &cameras,
            &[bundle],
            &TriangulationConfig::default(),
            &crate::progress::NullObserver,
            &CancellationToken::new(),
        )
        .unwrap();
        assert!(output.points.is_empty());
        assert_eq!(output.dropped_detections, 2);
    }

    #[test]
    fn test_refuses_with_one_posed_camera() {
        let single = CameraArray::new(
            0,
            [
                rig().get(0).unwrap().clone(),
                Camera::new(1, model().resolution),
            ],
        );
        let err = triangulate(
            &single,
            &[],
            &TriangulationConfig::default(),
            &crate::progress::NullObserver,
            &CancellationToken::new(),
        )
        .unwrap_err();
        assert_eq!(err, TriangulationError::InsufficientCameras { found: 1 });
    }

    #[test]
    fn test_bundle_detections_groups_by_frame() {
        let d = |id| Detection {
            landmark_id: id,
            pixel: Point2::new(1.0, 2.0),
            confidence: 1.0,
        };
        let bundles = bundle_detections([(0, 5, d(1)), (1, 2, d(1)), (1, 5, d(2))]);
        assert_eq!(bundles.len(), 2);
        assert_eq!(bundles[0].frame_id, 2);
        assert_eq!(bundles[1].detection_count(), 2);
    }
}
