//! Relative pose of camera pairs from jointly observed board frames.
//!
//! For each shared frame the board pose is estimated independently in both
//! cameras; each frame yields one candidate `b-from-a` transform. The
//! candidate that best explains all shared frames (lowest median stereo
//! reprojection error) selects the inlier frames, whose candidates are
//! averaged and then refined jointly with the per-frame board poses.

use std::collections::{BTreeMap, HashMap};

use log::{debug, info, warn};
use nalgebra::{Point2, Point3, Vector2};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tiny_solver::optimizer::OptimizerOptions;
use tiny_solver::{LevenbergMarquardtOptimizer, Optimizer as TinySolverOptimizer};

use crate::board::{BoardObservation, BoardTemplate, FrameId, ObservationStore};
use crate::camera::{CameraId, CameraModel, RadTanModel};
use crate::geometry::{average_poses, estimate_homography, pose_from_homography, GeometryError, Pose};
use crate::optimization::{
    solve_in_rounds, total_cost, BoardViewFactor, ParameterMap, ResidualBlock, SolverBudget,
    SolverError,
};
use crate::progress::{CancellationToken, NullObserver, ProgressEvent, ProgressObserver, Stage};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PairwiseConfig {
    /// Common corners a frame needs to count as shared.
    pub min_shared_corners: usize,
    /// Fewer shared frames than this produces no edge.
    pub min_shared_frames: usize,
    /// Per-frame median reprojection error under which a frame is an inlier.
    pub inlier_threshold_px: f64,
    pub max_iterations: usize,
}

impl Default for PairwiseConfig {
    fn default() -> Self {
        PairwiseConfig {
            min_shared_corners: 6,
            min_shared_frames: 3,
            inlier_threshold_px: 2.0,
            max_iterations: 100,
        }
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum PairwiseError {
    #[error("camera {0} has no intrinsic calibration")]
    IntrinsicsMissing(CameraId),
    #[error("cameras {a} and {b} share {found} usable frames, need {required}")]
    InsufficientSharedObservations {
        a: CameraId,
        b: CameraId,
        found: usize,
        required: usize,
    },
    #[error("cameras {a} and {b}: {detail}")]
    Numerical { a: CameraId, b: CameraId, detail: String },
    #[error("pairwise estimation cancelled")]
    Cancelled,
}

/// Relative pose between two cameras.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoseGraphEdge {
    pub camera_a: CameraId,
    pub camera_b: CameraId,
    /// Maps points from camera `a` coordinates to camera `b` coordinates.
    pub relative: Pose,
    /// Corner observations (both cameras) supporting the estimate.
    pub supporting_observations: usize,
    pub inlier_frames: usize,
    pub rms: f64,
    pub confidence: f64,
}

impl PoseGraphEdge {
    /// The pose taking points from `from`'s frame into the other camera's frame.
    pub fn transform_from(&self, from: CameraId) -> Option<Pose> {
        if from == self.camera_a {
            Some(self.relative)
        } else if from == self.camera_b {
            Some(self.relative.inverse())
        } else {
            None
        }
    }

    pub fn other(&self, camera: CameraId) -> Option<CameraId> {
        if camera == self.camera_a {
            Some(self.camera_b)
        } else if camera == self.camera_b {
            Some(self.camera_a)
        } else {
            None
        }
    }
}

/// Camera-from-board pose of a planar board from one camera's detections,
/// with the camera's calibration held fixed.
///
/// Pixels are undistorted, a homography gives the initial pose and a short
/// Levenberg-Marquardt run refines it against the distorted pixels.
pub fn estimate_board_pose(
    model: &RadTanModel,
    board_points: &[Point3<f64>],
    pixels: &[Point2<f64>],
) -> Result<Pose, GeometryError> {
    let normalized = pixels
        .iter()
        .map(|p| {
            model
                .undistort(&p.coords)
                .map(Point2::from)
                .map_err(|e| GeometryError::Degenerate(e.to_string()))
        })
        .collect::<Result<Vec<_>, _>>()?;
    let plane: Vec<Point2<f64>> = board_points.iter().map(|p| Point2::new(p.x, p.y)).collect();
    let h = estimate_homography(&plane, &normalized)?;
    let initial = pose_from_homography(&nalgebra::Matrix3::identity(), &h)?;

    let factor = BoardViewFactor::new(
        board_points.iter().map(|p| p.coords).collect(),
        pixels.iter().map(|p| p.coords).collect(),
    )
    .with_fixed_camera_pose(Pose::identity().to_array())
    .with_fixed_camera(model.params_array());

    let mut problem = tiny_solver::Problem::new();
    problem.add_residual_block(factor.residual_dim(), &["board_pose"], Box::new(factor), None);
    let mut initial_values = HashMap::new();
    initial_values.insert("board_pose".to_string(), initial.to_params());

    let options = OptimizerOptions {
        max_iteration: 30,
        ..Default::default()
    };
    let refined = LevenbergMarquardtOptimizer::default()
        .optimize(&problem, &initial_values, Some(options))
        .and_then(|values| values.get("board_pose").map(Pose::from_params));
    Ok(refined_or_initial(refined, initial))
}

/// The refined board pose when it is finite, otherwise the homography one.
fn refined_or_initial(refined: Option<Pose>, initial: Pose) -> Pose {
    match refined {
        Some(pose) if pose.rotation.iter().chain(pose.translation.iter()).all(|v| v.is_finite()) => {
            pose
        }
        Some(_) => {
            debug!("Board pose refinement diverged, keeping the homography estimate");
            initial
        }
        None => {
            debug!("Board pose refinement failed, keeping the homography estimate");
            initial
        }
    }
}

/// Pixel errors of `observation` when the board is placed by `camera_from_board`.
fn view_errors(
    model: &RadTanModel,
    camera_from_board: &Pose,
    observation: &BoardObservation,
    template: &BoardTemplate,
    corners: &[u32],
) -> Vec<f64> {
    corners
        .iter()
        .filter_map(|id| {
            let p = template.corner(*id)?;
            let px = observation.corners.get(id)?;
            let projected = model.project(&camera_from_board.transform_point(p).coords);
            // Behind the camera counts as a gross error.
            Some(match projected {
                Ok(uv) => (uv - Vector2::new(px.x, px.y)).norm(),
                Err(_) => f64::INFINITY,
            })
        })
        .collect()
}

fn median(values: &mut [f64]) -> f64 {
    if values.is_empty() {
        return f64::INFINITY;
    }
    values.sort_by(f64::total_cmp);
    let mid = values.len() / 2;
    if values.len() % 2 == 0 {
        0.5 * (values[mid - 1] + values[mid])
    } else {
        values[mid]
    }
}

struct SharedFrame<'a> {
    frame_id: FrameId,
    common: Vec<u32>,
    obs_a: &'a BoardObservation,
    obs_b: &'a BoardObservation,
    pose_a: Pose,
    pose_b: Pose,
}

impl SharedFrame<'_> {
    fn candidate(&self) -> Pose {
        self.pose_b.compose(&self.pose_a.inverse())
    }

    /// Stereo errors of this frame under a hypothesised `b-from-a` transform:
    /// the board posed in `a` is projected into `b` and vice versa.
    fn stereo_errors(
        &self,
        relative: &Pose,
        model_a: &RadTanModel,
        model_b: &RadTanModel,
        template: &BoardTemplate,
    ) -> Vec<f64> {
        let in_b = relative.compose(&self.pose_a);
        let in_a = relative.inverse().compose(&self.pose_b);
        let mut errors = view_errors(model_b, &in_b, self.obs_b, template, &self.common);
        errors.extend(view_errors(model_a, &in_a, self.obs_a, template, &self.common));
        errors
    }
}

fn relative_key() -> String {
    "relative".to_string()
}

fn board_key(frame_id: FrameId) -> String {
    format!("board_{}", frame_id)
}

/// Estimates the `b-from-a` pose of one camera pair.
///
/// # Errors
///
/// * [`PairwiseError::IntrinsicsMissing`] if either camera has no model.
/// * [`PairwiseError::InsufficientSharedObservations`] with fewer than
///   `min_shared_frames` shared frames (or inlier frames).
/// * [`PairwiseError::Numerical`] if pose estimation or refinement fails.
pub fn estimate_pair(
    store: &ObservationStore,
    models: &BTreeMap<CameraId, RadTanModel>,
    a: CameraId,
    b: CameraId,
    config: &PairwiseConfig,
    cancel: &CancellationToken,
) -> Result<PoseGraphEdge, PairwiseError> {
    let model_a = models.get(&a).ok_or(PairwiseError::IntrinsicsMissing(a))?;
    let model_b = models.get(&b).ok_or(PairwiseError::IntrinsicsMissing(b))?;
    if cancel.is_cancelled() {
        return Err(PairwiseError::Cancelled);
    }
    let template = store.template();
    let numerical = |detail: String| PairwiseError::Numerical { a, b, detail };
    let insufficient = |found: usize| PairwiseError::InsufficientSharedObservations {
        a,
        b,
        found,
        required: config.min_shared_frames,
    };

    let shared = store.shared_frames(a, b, config.min_shared_corners.max(4));
    if shared.len() < config.min_shared_frames.max(1) {
        return Err(insufficient(shared.len()));
    }

    let mut frames = Vec::with_capacity(shared.len());
    for (frame_id, common) in shared {
        let (Some(obs_a), Some(obs_b)) = (store.observation(a, frame_id), store.observation(b, frame_id))
        else {
            continue;
        };
        let (pts_a, px_a) = obs_a.correspondences(template);
        let (pts_b, px_b) = obs_b.correspondences(template);
        let pose_a = estimate_board_pose(model_a, &pts_a, &px_a);
        let pose_b = estimate_board_pose(model_b, &pts_b, &px_b);
        match (pose_a, pose_b) {
            (Ok(pose_a), Ok(pose_b)) => frames.push(SharedFrame {
                frame_id,
                common,
                obs_a,
                obs_b,
                pose_a,
                pose_b,
            }),
            (Err(e), _) | (_, Err(e)) => {
                debug!("Frame {} skipped for pair ({}, {}): {}", frame_id, a, b, e);
            }
        }
    }
    if frames.len() < config.min_shared_frames.max(1) {
        return Err(insufficient(frames.len()));
    }

    // Seed: the candidate with the lowest median error over all shared frames.
    let candidates: Vec<Pose> = frames.iter().map(SharedFrame::candidate).collect();
    let seed = candidates
        .iter()
        .map(|candidate| {
            let mut errors: Vec<f64> = frames
                .iter()
                .flat_map(|f| f.stereo_errors(candidate, model_a, model_b, template))
                .collect();
            (median(&mut errors), *candidate)
        })
        .min_by(|x, y| x.0.total_cmp(&y.0))
        .map(|(_, pose)| pose)
        .ok_or_else(|| numerical("no candidate poses".to_string()))?;

    let inliers: Vec<usize> = frames
        .iter()
        .enumerate()
        .filter(|(_, f)| {
            let mut errors = f.stereo_errors(&seed, model_a, model_b, template);
            median(&mut errors) <= config.inlier_threshold_px
        })
        .map(|(i, _)| i)
        .collect();
    if inliers.len() < config.min_shared_frames.max(1) {
        return Err(insufficient(inliers.len()));
    }
    let inlier_candidates: Vec<Pose> = inliers.iter().map(|&i| candidates[i]).collect();
    let averaged = average_poses(&inlier_candidates).map_err(|e| numerical(e.to_string()))?;

    // Joint refinement of the relative pose and the a-from-board pose of each inlier frame.
    let mut blocks = Vec::new();
    let mut initial: ParameterMap = HashMap::new();
    initial.insert(relative_key(), averaged.to_params());
    for &i in &inliers {
        let frame = &frames[i];
        let (pts_a, px_a) = frame.obs_a.correspondences(template);
        let (pts_b, px_b) = frame.obs_b.correspondences(template);
        initial.insert(board_key(frame.frame_id), frame.pose_a.to_params());

        let in_a = BoardViewFactor::new(
            pts_a.iter().map(|p| p.coords).collect(),
            px_a.iter().map(|p| p.coords).collect(),
        )
        .with_fixed_camera_pose(Pose::identity().to_array())
        .with_fixed_camera(model_a.params_array());
        blocks.push(ResidualBlock::new(in_a, vec![board_key(frame.frame_id)]));

        let in_b = BoardViewFactor::new(
            pts_b.iter().map(|p| p.coords).collect(),
            px_b.iter().map(|p| p.coords).collect(),
        )
        .with_fixed_camera(model_b.params_array());
        blocks.push(ResidualBlock::new(
            in_b,
            vec![board_key(frame.frame_id), relative_key()],
        ));
    }

    let mut problem = tiny_solver::Problem::new();
    for block in &blocks {
        problem.add_residual_block(
            block.factor.residual_dim(),
            &block.param_refs(),
            Box::new(block.factor.clone()),
            None,
        );
    }
    let (values, _) = solve_in_rounds(
        &problem,
        initial,
        &SolverBudget::single_round(config.max_iterations),
        |v| total_cost(&blocks, v, None),
        Stage::Pairwise,
        &NullObserver,
        cancel,
    )
    .map_err(|e| match e {
        SolverError::Cancelled => PairwiseError::Cancelled,
        other => numerical(other.to_string()),
    })?;

    let relative = values
        .get(&relative_key())
        .map(Pose::from_params)
        .ok_or_else(|| numerical("solver dropped the relative pose".to_string()))?;

    let residuals: Vec<f64> = blocks
        .iter()
        .filter_map(|block| block.residual(&values))
        .flat_map(|r| {
            r.as_slice()
                .chunks(2)
                .map(|uv| (uv[0] * uv[0] + uv[1] * uv[1]).sqrt())
                .collect::<Vec<_>>()
        })
        .collect();
    if residuals.is_empty() {
        return Err(numerical("no residuals after refinement".to_string()));
    }
    let rms = (residuals.iter().map(|e| e * e).sum::<f64>() / residuals.len() as f64).sqrt();
    let supporting_observations = residuals.len();
    let confidence = supporting_observations as f64 / (1.0 + rms);

    debug!(
        "Pair ({}, {}): {} inlier frames of {}, RMS {:.4} px",
        a,
        b,
        inliers.len(),
        frames.len(),
        rms
    );

    Ok(PoseGraphEdge {
        camera_a: a,
        camera_b: b,
        relative,
        supporting_observations,
        inlier_frames: inliers.len(),
        rms,
        confidence,
    })
}

/// Outcome of one camera pair.
#[derive(Debug, Clone)]
pub struct PairResult {
    pub camera_a: CameraId,
    pub camera_b: CameraId,
    pub result: Result<PoseGraphEdge, PairwiseError>,
}

/// Estimates every pair of calibrated cameras in parallel, in `(a, b)` order.
pub fn estimate_all_pairs(
    store: &ObservationStore,
    models: &BTreeMap<CameraId, RadTanModel>,
    config: &PairwiseConfig,
    observer: &dyn ProgressObserver,
    cancel: &CancellationToken,
) -> Vec<PairResult> {
    let ids: Vec<CameraId> = models.keys().copied().collect();
    let pairs: Vec<(CameraId, CameraId)> = ids
        .iter()
        .enumerate()
        .flat_map(|(i, &a)| ids[i + 1..].iter().map(move |&b| (a, b)))
        .collect();
    let total = pairs.len();
    info!("Estimating {} camera pairs", total);

    let done = std::sync::atomic::AtomicUsize::new(0);
    let mut results: Vec<PairResult> = pairs
        .par_iter()
        .map(|&(a, b)| {
            let result = estimate_pair(store, models, a, b, config, cancel);
            match &result {
                Ok(edge) => debug!(
                    "Pair ({}, {}) confidence {:.2}",
                    a, b, edge.confidence
                ),
                Err(e @ PairwiseError::InsufficientSharedObservations { .. }) => debug!("{}", e),
                Err(e) => warn!("{}", e),
            }
            let completed = done.fetch_add(1, std::sync::atomic::Ordering::SeqCst) + 1;
            observer.on_progress(&ProgressEvent::new(Stage::Pairwise, completed, total));
            PairResult {
                camera_a: a,
                camera_b: b,
                result,
            }
        })
        .collect();
    results.sort_by_key(|r| (r.camera_a, r.camera_b));
    results
}
