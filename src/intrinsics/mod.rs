//! Per-camera intrinsic calibration from planar board views.
//!
//! For each camera: pick diverse frames ([`selection`]), seed the pinhole
//! parameters and board poses in closed form ([`zhang`]), then refine
//! intrinsics, distortion and every board pose jointly with
//! Levenberg-Marquardt. Cameras are calibrated independently and in parallel.

use std::collections::{BTreeMap, HashMap};

use log::{info, warn};
use nalgebra::{Point2, Point3, Vector2};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::board::{BoardObservation, BoardTemplate, FrameId, ObservationStore};
use crate::camera::{
    CameraId, CameraModel, CameraModelError, Intrinsics, RadTanModel, Resolution,
};
use crate::geometry::Pose;
use crate::optimization::{
    solve_in_rounds, total_cost, BoardViewFactor, Optimizer, ParameterMap, ProjectionError,
    ResidualBlock, SolveSummary, SolverBudget, SolverError,
};
use crate::progress::{CancellationToken, ProgressEvent, ProgressObserver, Stage};

pub mod selection;
pub mod zhang;

pub use selection::{select_diverse_frames, CoverageSignature};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IntrinsicsConfig {
    /// Fewer diverse frames than this is a failure.
    pub min_frames: usize,
    pub max_frames: usize,
    pub min_corners_per_frame: usize,
    /// Cells per image side for the coverage signature.
    pub coverage_grid: u32,
    pub scale_buckets: u32,
    /// Perspective term (scaled by board extent) above which a view counts as tilted.
    pub tilt_threshold: f64,
    pub max_iterations: usize,
    /// Calibrations with a larger RMS reprojection error are rejected.
    pub max_rms: f64,
}

impl Default for IntrinsicsConfig {
    fn default() -> Self {
        IntrinsicsConfig {
            min_frames: 4,
            max_frames: 30,
            min_corners_per_frame: 6,
            coverage_grid: 5,
            scale_buckets: 4,
            tilt_threshold: 0.05,
            max_iterations: 100,
            max_rms: 1.0,
        }
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum IntrinsicsError {
    #[error("camera {camera}: insufficient observations ({detail})")]
    InsufficientObservations { camera: CameraId, detail: String },
    #[error("camera {camera}: calibration did not converge ({detail})")]
    CalibrationDidNotConverge { camera: CameraId, detail: String },
    #[error("camera {0} is not registered")]
    UnknownCamera(CameraId),
    #[error("camera {0}: calibration cancelled")]
    Cancelled(CameraId),
}

/// Board correspondences of one retained frame.
#[derive(Debug, Clone, PartialEq)]
pub struct PlanarView {
    pub frame_id: FrameId,
    pub board_points: Vec<Point3<f64>>,
    pub pixels: Vec<Point2<f64>>,
}

impl PlanarView {
    pub fn from_observation(observation: &BoardObservation, template: &BoardTemplate) -> Self {
        let (board_points, pixels) = observation.correspondences(template);
        PlanarView {
            frame_id: observation.frame_id,
            board_points,
            pixels,
        }
    }
}

/// A converged intrinsic calibration.
#[derive(Debug, Clone)]
pub struct IntrinsicCalibration {
    pub camera_id: CameraId,
    pub model: RadTanModel,
    pub rms: f64,
    pub statistics: ProjectionError,
    /// Number of frames the calibration used.
    pub grid_count: usize,
    /// Camera-from-board pose of each retained frame.
    pub board_poses: BTreeMap<FrameId, Pose>,
    pub summary: SolveSummary,
}

fn board_pose_key(frame_id: FrameId) -> String {
    format!("board_pose_{}", frame_id)
}

const CAMERA_KEY: &str = "camera";

/// Cost function for intrinsic calibration of one [`RadTanModel`].
///
/// Holds the retained views and the current estimate of the model and of the
/// camera-from-board pose of each view.
#[derive(Clone)]
pub struct IntrinsicsOptimizationCost<'a> {
    camera_id: CameraId,
    model: RadTanModel,
    views: Vec<PlanarView>,
    board_poses: Vec<Pose>,
    config: &'a IntrinsicsConfig,
    cancel: &'a CancellationToken,
    summary: Option<SolveSummary>,
}

impl<'a> IntrinsicsOptimizationCost<'a> {
    pub fn new(
        camera_id: CameraId,
        resolution: Resolution,
        views: Vec<PlanarView>,
        config: &'a IntrinsicsConfig,
        cancel: &'a CancellationToken,
    ) -> Self {
        IntrinsicsOptimizationCost {
            camera_id,
            model: RadTanModel {
                intrinsics: Intrinsics {
                    fx: 1.0,
                    fy: 1.0,
                    cx: 0.5 * resolution.width as f64,
                    cy: 0.5 * resolution.height as f64,
                },
                resolution,
                distortions: [0.0; 5],
            },
            views,
            board_poses: Vec::new(),
            config,
            cancel,
            summary: None,
        }
    }

    pub fn model(&self) -> &RadTanModel {
        &self.model
    }

    pub fn board_poses(&self) -> &[Pose] {
        &self.board_poses
    }

    /// Per-corner pixel errors of the current estimate.
    pub fn reprojection_errors(&self) -> Vec<f64> {
        self.views
            .iter()
            .zip(self.board_poses.iter())
            .flat_map(|(view, pose)| {
                view.board_points
                    .iter()
                    .zip(view.pixels.iter())
                    .filter_map(|(p, px)| {
                        let projected = self.model.project(&pose.transform_point(p).coords).ok()?;
                        Some((projected - Vector2::new(px.x, px.y)).norm())
                    })
                    .collect::<Vec<_>>()
            })
            .collect()
    }

    fn residual_blocks(&self) -> Vec<ResidualBlock<BoardViewFactor>> {
        let identity = Pose::identity().to_array();
        self.views
            .iter()
            .map(|view| {
                let factor = BoardViewFactor::new(
                    view.board_points.iter().map(|p| p.coords).collect(),
                    view.pixels.iter().map(|p| p.coords).collect(),
                )
                .with_fixed_camera_pose(identity);
                ResidualBlock::new(
                    factor,
                    vec![board_pose_key(view.frame_id), CAMERA_KEY.to_string()],
                )
            })
            .collect()
    }
}

impl Optimizer for IntrinsicsOptimizationCost<'_> {
    type Error = IntrinsicsError;

    /// Zhang's closed-form solution for `fx, fy, cx, cy` and the board poses.
    ///
    /// # Errors
    ///
    /// [`IntrinsicsError::InsufficientObservations`] if the views are
    /// degenerate (e.g. all fronto-parallel).
    fn linear_estimation(&mut self) -> Result<(), IntrinsicsError> {
        let (intrinsics, poses) = zhang::linear_init(&self.views, self.model.resolution)
            .map_err(|e| IntrinsicsError::InsufficientObservations {
                camera: self.camera_id,
                detail: format!("closed-form initialization failed: {}", e),
            })?;
        self.model.intrinsics = intrinsics;
        self.model.distortions = [0.0; 5];
        self.board_poses = poses;
        self.model
            .validate_params()
            .map_err(|e| IntrinsicsError::InsufficientObservations {
                camera: self.camera_id,
                detail: format!("closed-form initialization is invalid: {}", e),
            })
    }

    /// Refines intrinsics, distortion and board poses with tiny-solver
    /// Levenberg-Marquardt.
    ///
    /// # Errors
    ///
    /// * [`IntrinsicsError::CalibrationDidNotConverge`] on solver failure or
    ///   invalid resulting parameters.
    /// * [`IntrinsicsError::Cancelled`] if cancellation was requested.
    fn optimize(&mut self, verbose: bool) -> Result<(), IntrinsicsError> {
        let camera = self.camera_id;
        let blocks = self.residual_blocks();

        let mut problem = tiny_solver::Problem::new();
        for block in &blocks {
            problem.add_residual_block(
                block.factor.residual_dim(),
                &block.param_refs(),
                Box::new(block.factor.clone()),
                None,
            );
        }

        let mut initial_values: ParameterMap = HashMap::new();
        initial_values.insert(CAMERA_KEY.to_string(), self.model.params());
        for (view, pose) in self.views.iter().zip(self.board_poses.iter()) {
            initial_values.insert(board_pose_key(view.frame_id), pose.to_params());
        }

        if verbose {
            info!("Starting optimization with tiny-solver Levenberg-Marquardt...");
        }

        let budget = SolverBudget::single_round(self.config.max_iterations);
        let (values, summary) = solve_in_rounds(
            &problem,
            initial_values,
            &budget,
            |v| total_cost(&blocks, v, None),
            Stage::Intrinsics,
            &crate::progress::NullObserver,
            self.cancel,
        )
        .map_err(|e| match e {
            SolverError::Cancelled => IntrinsicsError::Cancelled(camera),
            other => IntrinsicsError::CalibrationDidNotConverge {
                camera,
                detail: other.to_string(),
            },
        })?;

        if verbose {
            info!(
                "Optimization finished: cost {:.6e} -> {:.6e} in {} iterations",
                summary.initial_cost, summary.final_cost, summary.iterations
            );
        }

        let params = values
            .get(CAMERA_KEY)
            .ok_or_else(|| IntrinsicsError::CalibrationDidNotConverge {
                camera,
                detail: "solver dropped the camera parameters".to_string(),
            })?;
        self.model = RadTanModel::with_resolution(params, self.model.resolution).map_err(
            |e: CameraModelError| IntrinsicsError::CalibrationDidNotConverge {
                camera,
                detail: e.to_string(),
            },
        )?;
        self.board_poses = self
            .views
            .iter()
            .map(|view| {
                values
                    .get(&board_pose_key(view.frame_id))
                    .map(Pose::from_params)
                    .ok_or_else(|| IntrinsicsError::CalibrationDidNotConverge {
                        camera,
                        detail: format!("missing board pose for frame {}", view.frame_id),
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;
        self.summary = Some(summary);
        Ok(())
    }

    fn get_intrinsics(&self) -> Intrinsics {
        self.model.intrinsics
    }

    fn get_resolution(&self) -> Resolution {
        self.model.resolution
    }

    fn get_distortion(&self) -> Vec<f64> {
        self.model.distortions.to_vec()
    }
}

/// Calibrates one camera from its board observations.
///
/// # Errors
///
/// * [`IntrinsicsError::UnknownCamera`] if the camera is not in the store.
/// * [`IntrinsicsError::InsufficientObservations`] with too few diverse
///   frames or a degenerate closed-form solution.
/// * [`IntrinsicsError::CalibrationDidNotConverge`] if the refinement fails
///   or ends above `max_rms`.
pub fn calibrate_camera(
    store: &ObservationStore,
    camera_id: CameraId,
    config: &IntrinsicsConfig,
    cancel: &CancellationToken,
) -> Result<IntrinsicCalibration, IntrinsicsError> {
    let resolution = store
        .resolution(camera_id)
        .ok_or(IntrinsicsError::UnknownCamera(camera_id))?;
    if cancel.is_cancelled() {
        return Err(IntrinsicsError::Cancelled(camera_id));
    }

    let template = store.template();
    let observations = store.observations_for(camera_id);
    let selected = select_diverse_frames(&observations, template, resolution, config);
    if selected.len() < config.min_frames {
        return Err(IntrinsicsError::InsufficientObservations {
            camera: camera_id,
            detail: format!(
                "{} diverse frames of {} observed, need {}",
                selected.len(),
                observations.len(),
                config.min_frames
            ),
        });
    }

    let views: Vec<PlanarView> = selected
        .iter()
        .map(|obs| PlanarView::from_observation(obs, template))
        .collect();
    let mut cost = IntrinsicsOptimizationCost::new(camera_id, resolution, views, config, cancel);
    cost.linear_estimation()?;
    cost.optimize(false)?;

    let errors = cost.reprojection_errors();
    let statistics = ProjectionError::from_errors(&errors).ok_or_else(|| {
        IntrinsicsError::CalibrationDidNotConverge {
            camera: camera_id,
            detail: "no corner projects in front of the camera".to_string(),
        }
    })?;
    if !(statistics.rmse <= config.max_rms) {
        return Err(IntrinsicsError::CalibrationDidNotConverge {
            camera: camera_id,
            detail: format!(
                "RMS {:.4} px exceeds the limit of {:.4} px",
                statistics.rmse, config.max_rms
            ),
        });
    }

    let summary = cost
        .summary
        .clone()
        .ok_or_else(|| IntrinsicsError::CalibrationDidNotConverge {
            camera: camera_id,
            detail: "optimizer did not run".to_string(),
        })?;
    let board_poses = cost
        .views
        .iter()
        .map(|v| v.frame_id)
        .zip(cost.board_poses.iter().copied())
        .collect();

    info!(
        "Camera {} calibrated from {} frames: RMS {:.4} px ({:?})",
        camera_id,
        cost.views.len(),
        statistics.rmse,
        cost.model
    );

    Ok(IntrinsicCalibration {
        camera_id,
        model: cost.model.clone(),
        rms: statistics.rmse,
        grid_count: cost.views.len(),
        statistics,
        board_poses,
        summary,
    })
}

/// Calibrates every registered camera in parallel.
///
/// Each camera's outcome is independent; failures are returned alongside
/// successes.
pub fn calibrate_all(
    store: &ObservationStore,
    config: &IntrinsicsConfig,
    observer: &dyn ProgressObserver,
    cancel: &CancellationToken,
) -> BTreeMap<CameraId, Result<IntrinsicCalibration, IntrinsicsError>> {
    let camera_ids: Vec<CameraId> = store.camera_ids().collect();
    let total = camera_ids.len();
    info!("Calibrating intrinsics of {} cameras", total);

    let done = std::sync::atomic::AtomicUsize::new(0);
    let results: BTreeMap<_, _> = camera_ids
        .par_iter()
        .map(|&camera_id| {
            let result = calibrate_camera(store, camera_id, config, cancel);
            if let Err(e) = &result {
                warn!("{}", e);
            }
            let completed = done.fetch_add(1, std::sync::atomic::Ordering::SeqCst) + 1;
            observer.on_progress(&ProgressEvent::new(Stage::Intrinsics, completed, total));
            (camera_id, result)
        })
        .collect();
    results
}
