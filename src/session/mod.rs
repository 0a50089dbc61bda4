//! Staged calibration session.
//!
//! Every stage is an immutable snapshot. A transition borrows the current
//! snapshot, runs one pipeline step and returns the next snapshot, so a
//! caller can inspect (or persist) any intermediate state and re-run a later
//! step without touching earlier results:
//!
//! ```text
//! CalibrationSession -> IntrinsicsStage -> PairwiseStage -> ComposedStage -> CalibrationResult
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;

use log::{info, warn};

use crate::board::{FrameId, ObservationStore};
use crate::bundle::{refine, BundleError, RefinedPoses};
use crate::camera::{Camera, CameraArray, CameraId, CameraStateError, RadTanModel};
use crate::config::{CalibrationConfig, ConfigError};
use crate::geometry::Pose;
use crate::intrinsics::{calibrate_all, IntrinsicCalibration, IntrinsicsError};
use crate::io::IoError;
use crate::optimization::SolveSummary;
use crate::pose_graph::{ComposedPoses, PoseGraph, PoseGraphError};
use crate::progress::{CancellationToken, ProgressObserver};
use crate::stereo::{estimate_all_pairs, PairwiseError, PoseGraphEdge};
use crate::trajectory::{build_tracks, process_tracks, CleanedTrack};
use crate::triangulation::{triangulate, FrameBundle, TriangulationError, TriangulationOutput};

#[derive(thiserror::Error, Debug)]
pub enum PipelineError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Io(#[from] IoError),
    #[error(transparent)]
    PoseGraph(#[from] PoseGraphError),
    #[error(transparent)]
    Bundle(#[from] BundleError),
    #[error(transparent)]
    Triangulation(#[from] TriangulationError),
    #[error(transparent)]
    CameraState(#[from] CameraStateError),
    #[error("no camera could be intrinsically calibrated")]
    NoCalibratedCameras,
    #[error("calibration cancelled")]
    Cancelled,
}

/// A failed camera pair.
#[derive(Debug, Clone, PartialEq)]
pub struct PairFailure {
    pub camera_a: CameraId,
    pub camera_b: CameraId,
    pub error: PairwiseError,
}

/// Everything that went wrong for individual cameras or pairs during a run
/// that still produced a result.
#[derive(Debug, Clone, Default)]
pub struct CalibrationReport {
    pub reference: Option<CameraId>,
    pub dropped_observations: usize,
    pub intrinsics_failures: BTreeMap<CameraId, IntrinsicsError>,
    pub pair_failures: Vec<PairFailure>,
    pub unreachable: BTreeMap<CameraId, PoseGraphError>,
    /// Reachable cameras bundle adjustment could not refine. They stay
    /// intrinsics-only.
    pub unrefined: BTreeMap<CameraId, BundleError>,
    /// Cameras posed with a final RMS above the configured limit.
    pub flagged: Vec<CameraId>,
    pub bundle: Option<SolveSummary>,
}

impl CalibrationReport {
    /// True when every camera was posed and none was flagged.
    pub fn is_clean(&self) -> bool {
        self.intrinsics_failures.is_empty()
            && self.unreachable.is_empty()
            && self.unrefined.is_empty()
            && self.flagged.is_empty()
    }
}

/// The configuration and observations a calibration starts from.
#[derive(Debug, Clone)]
pub struct CalibrationSession {
    config: Arc<CalibrationConfig>,
    store: Arc<ObservationStore>,
    cameras: BTreeMap<CameraId, Camera>,
}

impl CalibrationSession {
    /// Opens a session over every camera registered in `store`.
    ///
    /// # Errors
    ///
    /// [`PipelineError::Config`] if the configuration is invalid.
    pub fn new(config: CalibrationConfig, store: ObservationStore) -> Result<Self, PipelineError> {
        config.validate()?;
        let cameras = store
            .camera_ids()
            .filter_map(|id| Some((id, Camera::new(id, store.resolution(id)?))))
            .collect();
        Ok(CalibrationSession {
            config: Arc::new(config),
            store: Arc::new(store),
            cameras,
        })
    }

    pub fn config(&self) -> &CalibrationConfig {
        &self.config
    }

    pub fn store(&self) -> &ObservationStore {
        &self.store
    }

    pub fn cameras(&self) -> impl Iterator<Item = &Camera> {
        self.cameras.values()
    }

    /// Calibrates every camera's intrinsics independently.
    ///
    /// # Errors
    ///
    /// * [`PipelineError::Cancelled`] if cancelled.
    /// * [`PipelineError::NoCalibratedCameras`] if every camera failed.
    pub fn calibrate_intrinsics(
        &self,
        observer: &dyn ProgressObserver,
        cancel: &CancellationToken,
    ) -> Result<IntrinsicsStage, PipelineError> {
        let results = calibrate_all(&self.store, &self.config.intrinsics, observer, cancel);
        if cancel.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }

        let mut cameras = self.cameras.clone();
        let mut calibrations = BTreeMap::new();
        let mut failures = BTreeMap::new();
        for (id, result) in results {
            match result {
                Ok(calibration) => {
                    if let Some(camera) = cameras.remove(&id) {
                        let camera = camera.with_intrinsics(calibration.model.clone(), calibration.rms)?;
                        cameras.insert(id, camera);
                    }
                    calibrations.insert(id, calibration);
                }
                Err(error) => {
                    warn!("{}", error);
                    failures.insert(id, error);
                }
            }
        }
        if calibrations.is_empty() {
            return Err(PipelineError::NoCalibratedCameras);
        }
        info!(
            "Intrinsics: {} calibrated, {} failed",
            calibrations.len(),
            failures.len()
        );
        Ok(IntrinsicsStage {
            config: self.config.clone(),
            store: self.store.clone(),
            cameras,
            calibrations,
            failures,
        })
    }
}

/// Cameras with committed intrinsics.
#[derive(Debug, Clone)]
pub struct IntrinsicsStage {
    config: Arc<CalibrationConfig>,
    store: Arc<ObservationStore>,
    cameras: BTreeMap<CameraId, Camera>,
    calibrations: BTreeMap<CameraId, IntrinsicCalibration>,
    failures: BTreeMap<CameraId, IntrinsicsError>,
}

impl IntrinsicsStage {
    pub fn cameras(&self) -> impl Iterator<Item = &Camera> {
        self.cameras.values()
    }

    pub fn calibrations(&self) -> &BTreeMap<CameraId, IntrinsicCalibration> {
        &self.calibrations
    }

    pub fn failures(&self) -> &BTreeMap<CameraId, IntrinsicsError> {
        &self.failures
    }

    pub fn models(&self) -> BTreeMap<CameraId, RadTanModel> {
        self.cameras
            .values()
            .filter_map(|c| Some((c.id(), c.model()?.clone())))
            .collect()
    }

    /// Estimates the relative pose of every pair of calibrated cameras.
    ///
    /// # Errors
    ///
    /// [`PipelineError::Cancelled`] if cancelled.
    pub fn estimate_pairs(
        &self,
        observer: &dyn ProgressObserver,
        cancel: &CancellationToken,
    ) -> Result<PairwiseStage, PipelineError> {
        let results = estimate_all_pairs(
            &self.store,
            &self.models(),
            &self.config.pairwise,
            observer,
            cancel,
        );
        if cancel.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }

        let mut edges = Vec::new();
        let mut failures = Vec::new();
        for pair in results {
            match pair.result {
                Ok(edge) => edges.push(edge),
                Err(error) => failures.push(PairFailure {
                    camera_a: pair.camera_a,
                    camera_b: pair.camera_b,
                    error,
                }),
            }
        }
        info!("Pairwise: {} edges, {} pairs without an edge", edges.len(), failures.len());
        Ok(PairwiseStage {
            intrinsics: self.clone(),
            edges,
            failures,
        })
    }
}

/// Pairwise relative poses between calibrated cameras.
#[derive(Debug, Clone)]
pub struct PairwiseStage {
    intrinsics: IntrinsicsStage,
    edges: Vec<PoseGraphEdge>,
    failures: Vec<PairFailure>,
}

impl PairwiseStage {
    pub fn intrinsics(&self) -> &IntrinsicsStage {
        &self.intrinsics
    }

    pub fn edges(&self) -> &[PoseGraphEdge] {
        &self.edges
    }

    pub fn failures(&self) -> &[PairFailure] {
        &self.failures
    }

    /// Chains the pairwise poses into one frame anchored at the reference camera.
    ///
    /// # Errors
    ///
    /// [`PipelineError::PoseGraph`] if there is no calibrated camera at all.
    pub fn compose(&self) -> Result<ComposedStage, PipelineError> {
        let graph = PoseGraph::new(self.intrinsics.calibrations.keys().copied(), self.edges.clone());
        let composed = graph.compose()?;
        Ok(ComposedStage {
            pairwise: self.clone(),
            graph,
            composed,
        })
    }
}

/// Initial extrinsics of every camera reachable from the reference.
#[derive(Debug, Clone)]
pub struct ComposedStage {
    pairwise: PairwiseStage,
    graph: PoseGraph,
    composed: ComposedPoses,
}

/// Outcome of a full calibration run.
#[derive(Debug, Clone)]
pub struct CalibrationResult {
    pub cameras: CameraArray,
    pub report: CalibrationReport,
    /// World-from-board pose of every frame used by the final refinement.
    pub board_poses: BTreeMap<FrameId, Pose>,
}

impl ComposedStage {
    pub fn pairwise(&self) -> &PairwiseStage {
        &self.pairwise
    }

    pub fn graph(&self) -> &PoseGraph {
        &self.graph
    }

    pub fn composed(&self) -> &ComposedPoses {
        &self.composed
    }

    /// Jointly refines every composed pose and freezes the posed cameras.
    ///
    /// A lone reachable camera has nothing to refine against and is committed
    /// at identity with its intrinsic RMS.
    ///
    /// # Errors
    ///
    /// * [`PipelineError::Bundle`] if the refinement fails or is cancelled.
    /// * [`PipelineError::CameraState`] on an invalid camera transition.
    pub fn refine(
        &self,
        observer: &dyn ProgressObserver,
        cancel: &CancellationToken,
    ) -> Result<CalibrationResult, PipelineError> {
        let intrinsics = &self.pairwise.intrinsics;
        let refined = if self.composed.poses.len() > 1 {
            Some(refine(
                &intrinsics.store,
                &intrinsics.models(),
                &self.composed,
                &intrinsics.config.bundle,
                observer,
                cancel,
            )?)
        } else {
            None
        };

        let mut cameras = Vec::new();
        for (id, camera) in &intrinsics.cameras {
            let camera = camera.clone();
            let posed = match &refined {
                Some(RefinedPoses {
                    cameras: refined_cameras,
                    ..
                }) => refined_cameras
                    .get(id)
                    .map(|r| camera.clone().into_posed(r.model.clone(), r.pose, r.statistics.rmse)),
                None => match (self.composed.poses.get(id), camera.model(), camera.rms_error()) {
                    (Some(pose), Some(model), Some(rms)) => {
                        Some(camera.clone().into_posed(model.clone(), *pose, rms))
                    }
                    _ => None,
                },
            };
            cameras.push(match posed {
                Some(posed) => posed?,
                None => camera,
            });
        }
        let cameras = CameraArray::new(self.composed.reference, cameras);

        let report = CalibrationReport {
            reference: Some(self.composed.reference),
            dropped_observations: intrinsics.store.dropped(),
            intrinsics_failures: intrinsics.failures.clone(),
            pair_failures: self.pairwise.failures.clone(),
            unreachable: self.composed.unreachable.clone(),
            unrefined: refined.as_ref().map(|r| r.skipped.clone()).unwrap_or_default(),
            flagged: refined.as_ref().map(RefinedPoses::flagged_cameras).unwrap_or_default(),
            bundle: refined.as_ref().map(|r| r.summary.clone()),
        };
        info!(
            "Calibration committed: {} of {} cameras posed, reference camera {}",
            cameras.posed_count(),
            cameras.len(),
            cameras.reference()
        );
        Ok(CalibrationResult {
            cameras,
            report,
            board_poses: refined.map(|r| r.board_poses).unwrap_or_default(),
        })
    }
}

/// Runs every calibration stage in order.
///
/// # Errors
///
/// See the individual stage transitions.
pub fn run_calibration(
    config: CalibrationConfig,
    store: ObservationStore,
    observer: &dyn ProgressObserver,
    cancel: &CancellationToken,
) -> Result<CalibrationResult, PipelineError> {
    CalibrationSession::new(config, store)?
        .calibrate_intrinsics(observer, cancel)?
        .estimate_pairs(observer, cancel)?
        .compose()?
        .refine(observer, cancel)
}

/// Triangulated points and their cleaned trajectories.
#[derive(Debug, Clone)]
pub struct LandmarkResult {
    pub triangulation: TriangulationOutput,
    pub tracks: Vec<CleanedTrack>,
}

/// Triangulates every bundle and cleans the resulting trajectories.
///
/// # Errors
///
/// [`PipelineError::Triangulation`] if fewer than two cameras are posed or
/// the run is cancelled.
pub fn process_landmarks(
    cameras: &CameraArray,
    bundles: &[FrameBundle],
    config: &CalibrationConfig,
    observer: &dyn ProgressObserver,
    cancel: &CancellationToken,
) -> Result<LandmarkResult, PipelineError> {
    let triangulation = triangulate(cameras, bundles, &config.triangulation, observer, cancel)?;
    let tracks = process_tracks(&build_tracks(&triangulation.points), &config.trajectory);
    Ok(LandmarkResult {
        triangulation,
        tracks,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::CalibrationStatus;
    use crate::config::CameraSpec;
    use crate::progress::NullObserver;
    use crate::synthetic::SyntheticRig;

    fn config(rig: &SyntheticRig) -> CalibrationConfig {
        CalibrationConfig::new(
            rig.geometry,
            rig.cameras
                .iter()
                .map(|c| CameraSpec {
                    id: c.id,
                    width: c.model.resolution.width,
                    height: c.model.resolution.height,
                })
                .collect(),
        )
    }

    #[test]
    fn test_stages_are_snapshots() {
        let rig = SyntheticRig::standard(2);
        let session = CalibrationSession::new(config(&rig), rig.board_observations()).unwrap();
        let cancel = CancellationToken::new();

        let intrinsics = session.calibrate_intrinsics(&NullObserver, &cancel).unwrap();
        assert!(session.cameras().all(|c| c.status() == CalibrationStatus::Uncalibrated));
        assert!(intrinsics
            .cameras()
            .all(|c| c.status() == CalibrationStatus::IntrinsicsOnly));

        let pairwise = intrinsics.estimate_pairs(&NullObserver, &cancel).unwrap();
        assert_eq!(pairwise.edges().len(), 1);
        let composed = pairwise.compose().unwrap();
        assert_eq!(composed.composed().reference, 0);

        let result = composed.refine(&NullObserver, &cancel).unwrap();
        assert_eq!(result.cameras.posed_count(), 2);
        assert!(result.report.is_clean());
        // Earlier snapshots are untouched.
        assert!(intrinsics.cameras().all(|c| !c.is_fully_posed()));
    }

    #[test]
    fn test_cancelled_run() {
        let rig = SyntheticRig::standard(2);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = run_calibration(config(&rig), rig.board_observations(), &NullObserver, &cancel)
            .unwrap_err();
        assert!(matches!(err, PipelineError::Cancelled));
    }

    #[test]
    fn test_single_camera_is_committed_at_identity() {
        let rig = SyntheticRig::standard(1);
        let result = run_calibration(
            config(&rig),
            rig.board_observations(),
            &NullObserver,
            &CancellationToken::new(),
        )
        .unwrap();
        let camera = result.cameras.get(0).unwrap();
        assert!(camera.is_fully_posed());
        assert_eq!(camera.pose(), Some(&Pose::identity()));
        assert!(result.report.bundle.is_none());
    }
}
