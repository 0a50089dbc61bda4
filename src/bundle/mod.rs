//! Joint refinement of all camera poses against every board observation.
//!
//! Unknowns are the camera-from-world pose of each non-reference camera, one
//! world-from-board pose per frame seen by enough posed cameras, and
//! optionally every camera's intrinsics and distortion. The reference camera
//! stays at identity, which fixes the gauge.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::time::Duration;

use log::{debug, info, warn};
use nalgebra::Vector2;
use serde::{Deserialize, Serialize};
use tiny_solver::loss_functions::{HuberLoss, Loss};

use crate::board::{FrameId, ObservationStore};
use crate::camera::{CameraId, CameraModel, CameraModelError, RadTanModel};
use crate::geometry::Pose;
use crate::optimization::{
    solve_in_rounds, total_cost, BoardViewFactor, ParameterMap, ProjectionError, ResidualBlock,
    SolveSummary, SolverBudget, SolverError,
};
use crate::pose_graph::ComposedPoses;
use crate::progress::{CancellationToken, ProgressObserver, Stage};
use crate::stereo::estimate_board_pose;

/// How corner observations are weighted against each other.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Weighting {
    /// Every corner counts the same.
    #[default]
    Uniform,
    /// Each corner of a frame is weighted by `1 / corners in frame`, so every
    /// frame contributes equally.
    PerFrame,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BundleConfig {
    pub refine_intrinsics: bool,
    pub weighting: Weighting,
    /// Huber loss scale in pixels; plain least squares when absent.
    pub huber_scale: Option<f64>,
    pub max_iterations: usize,
    pub iterations_per_round: usize,
    /// Wall-time limit in seconds.
    pub time_budget_secs: Option<f64>,
    /// Cameras whose final RMS exceeds this are flagged.
    pub max_camera_rms: f64,
    pub min_cameras_per_frame: usize,
}

impl Default for BundleConfig {
    fn default() -> Self {
        BundleConfig {
            refine_intrinsics: false,
            weighting: Weighting::Uniform,
            huber_scale: None,
            max_iterations: 200,
            iterations_per_round: 10,
            time_budget_secs: None,
            max_camera_rms: 1.0,
            min_cameras_per_frame: 2,
        }
    }
}

impl BundleConfig {
    pub fn budget(&self) -> SolverBudget {
        SolverBudget {
            max_iterations: self.max_iterations,
            iterations_per_round: self.iterations_per_round.max(1),
            time_budget: self
                .time_budget_secs
                .filter(|s| s.is_finite() && *s > 0.0)
                .map(Duration::from_secs_f64),
            tolerance: 1e-10,
        }
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum BundleError {
    #[error("no posed cameras to refine")]
    NoPosedCameras,
    #[error("camera {0} is posed but has no intrinsic calibration")]
    MissingModel(CameraId),
    #[error("no frame is seen by at least {0} posed cameras")]
    NoUsableFrames(usize),
    #[error("bundle adjustment failed: {0}")]
    Solver(String),
    #[error("refined camera {0} is invalid: {1}")]
    InvalidCamera(CameraId, CameraModelError),
    #[error("camera {camera} shares no frame with {min_cameras} posed cameras")]
    CameraNotObserved { camera: CameraId, min_cameras: usize },
    #[error("reference camera {0} shares no frame with the other posed cameras")]
    ReferenceNotObserved(CameraId),
    #[error("bundle adjustment cancelled")]
    Cancelled,
}

/// Final state of one camera after refinement.
#[derive(Debug, Clone)]
pub struct RefinedCamera {
    pub model: RadTanModel,
    /// Camera-from-world.
    pub pose: Pose,
    pub statistics: ProjectionError,
    pub observations: usize,
    /// RMS above `max_camera_rms`.
    pub flagged: bool,
}

#[derive(Debug, Clone)]
pub struct RefinedPoses {
    pub reference: CameraId,
    pub cameras: BTreeMap<CameraId, RefinedCamera>,
    /// World-from-board pose of every frame used.
    pub board_poses: BTreeMap<FrameId, Pose>,
    /// Composed cameras left out of the refinement.
    pub skipped: BTreeMap<CameraId, BundleError>,
    pub summary: SolveSummary,
}

impl RefinedPoses {
    pub fn flagged_cameras(&self) -> Vec<CameraId> {
        self.cameras
            .iter()
            .filter(|(_, c)| c.flagged)
            .map(|(id, _)| *id)
            .collect()
    }
}

fn pose_key(camera: CameraId) -> String {
    format!("pose_{}", camera)
}

fn camera_key(camera: CameraId) -> String {
    format!("camera_{}", camera)
}

fn board_key(frame: FrameId) -> String {
    format!("board_{}", frame)
}

/// Refines the composed poses.
///
/// # Errors
///
/// * [`BundleError::NoPosedCameras`] / [`BundleError::MissingModel`] for
///   inconsistent input.
/// * [`BundleError::NoUsableFrames`] if no frame is shared by
///   `min_cameras_per_frame` posed cameras.
/// * [`BundleError::ReferenceNotObserved`] if the reference camera sees none
///   of the usable frames. Other such cameras are returned in
///   [`RefinedPoses::skipped`].
/// * [`BundleError::Cancelled`] if cancelled between solver rounds.
/// * [`BundleError::Solver`] if the optimizer fails.
pub fn refine(
    store: &ObservationStore,
    models: &BTreeMap<CameraId, RadTanModel>,
    composed: &ComposedPoses,
    config: &BundleConfig,
    observer: &dyn ProgressObserver,
    cancel: &CancellationToken,
) -> Result<RefinedPoses, BundleError> {
    if composed.poses.is_empty() {
        return Err(BundleError::NoPosedCameras);
    }
    for camera in composed.poses.keys() {
        if !models.contains_key(camera) {
            return Err(BundleError::MissingModel(*camera));
        }
    }
    if cancel.is_cancelled() {
        return Err(BundleError::Cancelled);
    }
    let template = store.template();
    let reference = composed.reference;
    let min_cameras = config.min_cameras_per_frame.max(1);

    // Frames seen by enough posed cameras, with an initial world-from-board pose
    // from the lowest-id camera that can place the board.
    let mut board_poses: BTreeMap<FrameId, Pose> = BTreeMap::new();
    let mut frame_corner_counts: BTreeMap<FrameId, usize> = BTreeMap::new();
    for frame_id in store.frame_ids() {
        let viewers: Vec<CameraId> = composed
            .poses
            .keys()
            .copied()
            .filter(|c| store.observation(*c, frame_id).is_some_and(|o| o.len() >= 4))
            .collect();
        if viewers.len() < min_cameras {
            debug!("Frame {} seen by {} posed cameras, skipped", frame_id, viewers.len());
            continue;
        }
        let initial = viewers.iter().find_map(|camera| {
            let obs = store.observation(*camera, frame_id)?;
            let (pts, px) = obs.correspondences(template);
            let camera_from_board = estimate_board_pose(&models[camera], &pts, &px).ok()?;
            Some(composed.poses[camera].inverse().compose(&camera_from_board))
        });
        if let Some(pose) = initial {
            board_poses.insert(frame_id, pose);
            let corners = viewers
                .iter()
                .filter_map(|c| store.observation(*c, frame_id))
                .map(|o| o.len())
                .sum();
            frame_corner_counts.insert(frame_id, corners);
        }
    }
    if board_poses.is_empty() {
        return Err(BundleError::NoUsableFrames(config.min_cameras_per_frame));
    }

    let mut observed: BTreeSet<CameraId> = BTreeSet::new();
    let mut blocks: Vec<ResidualBlock<BoardViewFactor>> = Vec::new();
    for (frame, corner_count) in &frame_corner_counts {
        let weight = match config.weighting {
            Weighting::Uniform => 1.0,
            Weighting::PerFrame => 1.0 / (*corner_count).max(1) as f64,
        };
        for camera in composed.poses.keys() {
            let Some(obs) = store.observation(*camera, *frame) else {
                continue;
            };
            for (id, pixel) in &obs.corners {
                let Some(point) = template.corner(*id) else {
                    continue;
                };
                let mut factor = BoardViewFactor::new(vec![point.coords], vec![pixel.coords])
                    .with_weight(weight);
                let mut params = vec![board_key(*frame)];
                if *camera == reference {
                    factor = factor.with_fixed_camera_pose(composed.poses[camera].to_array());
                } else {
                    params.push(pose_key(*camera));
                }
                if config.refine_intrinsics {
                    params.push(camera_key(*camera));
                } else {
                    factor = factor.with_fixed_camera(models[camera].params_array());
                }
                blocks.push(ResidualBlock::new(factor, params));
                observed.insert(*camera);
            }
        }
    }
    if composed.poses.contains_key(&reference) && !observed.contains(&reference) {
        return Err(BundleError::ReferenceNotObserved(reference));
    }

    // Only cameras that own residual blocks become unknowns.
    let mut skipped = BTreeMap::new();
    let mut initial: ParameterMap = HashMap::new();
    for (camera, pose) in &composed.poses {
        if !observed.contains(camera) {
            warn!(
                "Camera {} shares no frame with {} posed cameras, leaving it out of bundle adjustment",
                camera, min_cameras
            );
            skipped.insert(
                *camera,
                BundleError::CameraNotObserved {
                    camera: *camera,
                    min_cameras,
                },
            );
            continue;
        }
        if *camera != reference {
            initial.insert(pose_key(*camera), pose.to_params());
        }
        if config.refine_intrinsics {
            initial.insert(camera_key(*camera), models[camera].params());
        }
    }
    for (frame, pose) in &board_poses {
        initial.insert(board_key(*frame), pose.to_params());
    }

    info!(
        "Bundle adjustment: {} cameras, {} frames, {} corner observations",
        observed.len(),
        board_poses.len(),
        blocks.len()
    );

    let mut problem = tiny_solver::Problem::new();
    for block in &blocks {
        let loss = config
            .huber_scale
            .map(|scale| Box::new(HuberLoss::new(scale)) as Box<dyn Loss + Send>);
        problem.add_residual_block(
            block.factor.residual_dim(),
            &block.param_refs(),
            Box::new(block.factor.clone()),
            loss,
        );
    }
    let (values, summary) = solve_in_rounds(
        &problem,
        initial,
        &config.budget(),
        |v| total_cost(&blocks, v, config.huber_scale),
        Stage::BundleAdjustment,
        observer,
        cancel,
    )
    .map_err(|e| match e {
        SolverError::Cancelled => BundleError::Cancelled,
        other => BundleError::Solver(other.to_string()),
    })?;

    info!(
        "Bundle adjustment finished after {} iterations ({:?}): cost {:.6e} -> {:.6e}",
        summary.iterations, summary.stop_reason, summary.initial_cost, summary.final_cost
    );

    let mut refined_models = BTreeMap::new();
    let mut refined_poses = BTreeMap::new();
    for (camera, pose) in composed.poses.iter().filter(|(c, _)| observed.contains(*c)) {
        let model = match values.get(&camera_key(*camera)) {
            Some(params) if config.refine_intrinsics => {
                RadTanModel::with_resolution(params, models[camera].resolution)
                    .map_err(|e| BundleError::InvalidCamera(*camera, e))?
            }
            _ => models[camera].clone(),
        };
        let pose = if *camera == reference {
            *pose
        } else {
            values
                .get(&pose_key(*camera))
                .map(Pose::from_params)
                .ok_or_else(|| BundleError::Solver(format!("missing pose of camera {}", camera)))?
        };
        refined_models.insert(*camera, model);
        refined_poses.insert(*camera, pose);
    }
    let board_poses: BTreeMap<FrameId, Pose> = board_poses
        .keys()
        .filter_map(|frame| Some((*frame, Pose::from_params(values.get(&board_key(*frame))?))))
        .collect();

    // Unweighted pixel errors per camera.
    let mut errors: BTreeMap<CameraId, Vec<f64>> = BTreeMap::new();
    for (frame, world_from_board) in &board_poses {
        for (camera, pose) in &refined_poses {
            let Some(obs) = store.observation(*camera, *frame) else {
                continue;
            };
            let model = &refined_models[camera];
            let camera_from_board = pose.compose(world_from_board);
            for (id, pixel) in &obs.corners {
                let Some(point) = template.corner(*id) else {
                    continue;
                };
                let error = match model.project(&camera_from_board.transform_point(point).coords) {
                    Ok(uv) => (uv - Vector2::new(pixel.x, pixel.y)).norm(),
                    Err(_) => f64::INFINITY,
                };
                errors.entry(*camera).or_default().push(error);
            }
        }
    }

    let mut cameras = BTreeMap::new();
    for (camera, model) in refined_models {
        let camera_errors = errors.remove(&camera).unwrap_or_default();
        let Some(statistics) = ProjectionError::from_errors(&camera_errors) else {
            warn!("Camera {} has no observations in any refined frame", camera);
            skipped.insert(
                camera,
                BundleError::CameraNotObserved {
                    camera,
                    min_cameras,
                },
            );
            continue;
        };
        let flagged = !(statistics.rmse <= config.max_camera_rms);
        if flagged {
            warn!(
                "Camera {} RMS {:.4} px exceeds {:.4} px",
                camera, statistics.rmse, config.max_camera_rms
            );
        }
        cameras.insert(
            camera,
            RefinedCamera {
                model,
                pose: refined_poses[&camera],
                observations: camera_errors.len(),
                statistics,
                flagged,
            },
        );
    }
    Ok(RefinedPoses {
        reference,
        cameras,
        board_poses,
        skipped,
        summary,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::optimization::StopReason;
    use crate::progress::{NullObserver, ProgressEvent};
    use crate::synthetic::SyntheticRig;
    use approx::assert_relative_eq;
    use nalgebra::Vector3;

    fn init_logger() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    fn models(rig: &SyntheticRig) -> BTreeMap<CameraId, RadTanModel> {
        rig.cameras.iter().map(|c| (c.id, c.model.clone())).collect()
    }

    /// Truth poses with every non-reference camera nudged off its true pose.
    fn perturbed(rig: &SyntheticRig, reference: CameraId) -> ComposedPoses {
        let nudge = Pose::from_parts(
            Vector3::new(0.01, -0.008, 0.005),
            Vector3::new(0.02, -0.01, 0.015),
        );
        let poses = rig
            .cameras
            .iter()
            .map(|c| {
                let pose = if c.id == reference {
                    c.pose
                } else {
                    nudge.compose(&c.pose)
                };
                (c.id, pose)
            })
            .collect();
        ComposedPoses {
            reference,
            poses,
            unreachable: BTreeMap::new(),
            tree: Vec::new(),
        }
    }

    fn assert_truth(rig: &SyntheticRig, refined: &RefinedPoses) {
        for camera in &rig.cameras {
            let pose = refined.cameras[&camera.id].pose;
            assert_relative_eq!(pose.rotation, camera.pose.rotation, epsilon = 1e-6);
            assert_relative_eq!(pose.translation, camera.pose.translation, epsilon = 1e-6);
        }
    }

    struct CancelOnFirstEvent(CancellationToken);

    impl ProgressObserver for CancelOnFirstEvent {
        fn on_progress(&self, _event: &ProgressEvent) {
            self.0.cancel();
        }
    }

    #[test]
    fn test_reference_stays_fixed_and_truth_is_recovered() {
        init_logger();
        let rig = SyntheticRig::standard(3);
        let refined = refine(
            &rig.board_observations(),
            &models(&rig),
            &perturbed(&rig, 0),
            &BundleConfig::default(),
            &NullObserver,
            &CancellationToken::new(),
        )
        .unwrap();

        assert_eq!(refined.reference, 0);
        assert_eq!(refined.cameras[&0].pose, Pose::identity());
        assert_truth(&rig, &refined);
        assert_eq!(refined.summary.stop_reason, StopReason::Converged);
        assert!(refined.summary.final_cost < refined.summary.initial_cost);
        assert!(refined.skipped.is_empty());
        assert!(refined.flagged_cameras().is_empty());
        assert_eq!(refined.board_poses.len(), rig.board_poses.len());
        for camera in refined.cameras.values() {
            assert!(camera.statistics.rmse < 1e-4);
            assert!(camera.observations > 0);
        }
    }

    #[test]
    fn test_camera_with_wrong_intrinsics_is_flagged_but_kept() {
        init_logger();
        let rig = SyntheticRig::standard(3);
        let mut models = models(&rig);
        let mut params = models[&2].params();
        params[0] += 20.0;
        let wrong = RadTanModel::with_resolution(&params, models[&2].resolution).unwrap();
        models.insert(2, wrong);
        let config = BundleConfig {
            max_camera_rms: 1e-3,
            ..BundleConfig::default()
        };

        let refined = refine(
            &rig.board_observations(),
            &models,
            &perturbed(&rig, 0),
            &config,
            &NullObserver,
            &CancellationToken::new(),
        )
        .unwrap();

        assert!(refined.flagged_cameras().contains(&2));
        assert!(refined.cameras[&2].flagged);
        assert!(refined.cameras[&2].statistics.rmse > 1e-3);
        assert_eq!(refined.cameras.len(), 3);
        assert!(refined.skipped.is_empty());
    }

    #[test]
    fn test_per_frame_weighting_with_huber_loss_recovers_truth() {
        init_logger();
        let rig = SyntheticRig::standard(3);
        let config = BundleConfig {
            weighting: Weighting::PerFrame,
            huber_scale: Some(1.0),
            ..BundleConfig::default()
        };
        let refined = refine(
            &rig.board_observations(),
            &models(&rig),
            &perturbed(&rig, 0),
            &config,
            &NullObserver,
            &CancellationToken::new(),
        )
        .unwrap();

        assert_eq!(refined.cameras[&0].pose, Pose::identity());
        assert_truth(&rig, &refined);
    }

    #[test]
    fn test_exhausted_time_budget_stops_early() {
        init_logger();
        let rig = SyntheticRig::standard(3);
        let config = BundleConfig {
            time_budget_secs: Some(1e-9),
            ..BundleConfig::default()
        };
        let refined = refine(
            &rig.board_observations(),
            &models(&rig),
            &perturbed(&rig, 0),
            &config,
            &NullObserver,
            &CancellationToken::new(),
        )
        .unwrap();

        assert_eq!(refined.summary.stop_reason, StopReason::TimeBudget);
        assert_eq!(refined.cameras.len(), 3);
    }

    #[test]
    fn test_cancellation_between_rounds() {
        init_logger();
        let rig = SyntheticRig::standard(3);
        let cancel = CancellationToken::new();
        let config = BundleConfig {
            iterations_per_round: 1,
            ..BundleConfig::default()
        };
        let result = refine(
            &rig.board_observations(),
            &models(&rig),
            &perturbed(&rig, 0),
            &config,
            &CancelOnFirstEvent(cancel.clone()),
            &cancel,
        );

        assert_eq!(result.unwrap_err(), BundleError::Cancelled);
        assert!(cancel.is_cancelled());
    }

    #[test]
    fn test_camera_without_shared_frames_is_skipped() {
        init_logger();
        let rig = SyntheticRig::standard(4);
        // Camera 3 only shares frames with camera 1.
        let store =
            rig.board_observations_where(|c, f| if f < 6 { c <= 2 } else { c == 1 || c == 3 });
        let config = BundleConfig {
            min_cameras_per_frame: 3,
            ..BundleConfig::default()
        };

        let refined = refine(
            &store,
            &models(&rig),
            &perturbed(&rig, 0),
            &config,
            &NullObserver,
            &CancellationToken::new(),
        )
        .unwrap();

        assert_eq!(refined.cameras.keys().copied().collect::<Vec<_>>(), vec![0, 1, 2]);
        assert_eq!(
            refined.skipped[&3],
            BundleError::CameraNotObserved {
                camera: 3,
                min_cameras: 3
            }
        );
        assert!(refined.board_poses.keys().all(|f| *f < 6));
        for camera in &rig.cameras[..3] {
            assert_relative_eq!(
                refined.cameras[&camera.id].pose.translation,
                camera.pose.translation,
                epsilon = 1e-6
            );
        }

        let unobserved_reference = refine(
            &store,
            &models(&rig),
            &perturbed(&rig, 3),
            &config,
            &NullObserver,
            &CancellationToken::new(),
        );
        assert_eq!(
            unobserved_reference.unwrap_err(),
            BundleError::ReferenceNotObserved(3)
        );
    }
}
