//! Cleaning of per-landmark 3D time series.
//!
//! Each track goes through outlier rejection (distance to the local per-axis
//! median), gap filling (linear interpolation for short gaps, explicit
//! markers for long ones) and a centered moving average applied per axis
//! inside every gap-free segment. Tracks are independent and processed in
//! parallel.

use std::collections::BTreeMap;

use log::debug;
use nalgebra::{Point3, Vector3};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::board::FrameId;
use crate::triangulation::{LandmarkId, TriangulatedPoint};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrajectoryConfig {
    /// Half-width, in frames, of the neighbourhood used for outlier rejection.
    pub outlier_window: u64,
    /// Largest distance (world units) a sample may lie from its local median.
    pub max_displacement: f64,
    /// Longest run of missing frames that is interpolated.
    pub max_gap: u64,
    /// Moving-average width in samples; 1 disables smoothing.
    pub smoothing_window: usize,
}

impl Default for TrajectoryConfig {
    fn default() -> Self {
        TrajectoryConfig {
            outlier_window: 2,
            max_displacement: 0.1,
            max_gap: 5,
            smoothing_window: 5,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrackSample {
    pub frame_id: FrameId,
    pub position: Point3<f64>,
    pub camera_count: usize,
    pub mean_residual: f64,
}

/// Observed positions of one landmark, ordered by frame.
#[derive(Debug, Clone, PartialEq)]
pub struct LandmarkTrack {
    pub landmark_id: LandmarkId,
    pub samples: Vec<TrackSample>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CleanedSample {
    pub frame_id: FrameId,
    /// `None` exactly when `is_gap`.
    pub position: Option<Point3<f64>>,
    pub is_interpolated: bool,
    pub is_gap: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CleanedTrack {
    pub landmark_id: LandmarkId,
    /// One entry per frame from the first to the last observed sample.
    pub samples: Vec<CleanedSample>,
    pub rejected_outliers: usize,
}

/// Groups triangulated points into per-landmark tracks.
pub fn build_tracks(points: &[TriangulatedPoint]) -> Vec<LandmarkTrack> {
    let mut tracks: BTreeMap<LandmarkId, BTreeMap<FrameId, TrackSample>> = BTreeMap::new();
    for point in points {
        tracks.entry(point.landmark_id).or_default().insert(
            point.frame_id,
            TrackSample {
                frame_id: point.frame_id,
                position: point.position,
                camera_count: point.camera_count,
                mean_residual: point.mean_residual,
            },
        );
    }
    tracks
        .into_iter()
        .map(|(landmark_id, samples)| LandmarkTrack {
            landmark_id,
            samples: samples.into_values().collect(),
        })
        .collect()
}

fn median(values: &mut [f64]) -> f64 {
    values.sort_by(f64::total_cmp);
    let mid = values.len() / 2;
    if values.len() % 2 == 0 {
        0.5 * (values[mid - 1] + values[mid])
    } else {
        values[mid]
    }
}

/// Indices of samples that lie too far from the median of their neighbourhood.
fn find_outliers(samples: &[&TrackSample], config: &TrajectoryConfig) -> Vec<bool> {
    samples
        .iter()
        .map(|sample| {
            let window: Vec<&TrackSample> = samples
                .iter()
                .copied()
                .filter(|other| other.frame_id.abs_diff(sample.frame_id) <= config.outlier_window)
                .collect();
            if window.len() < 3 {
                return false;
            }
            let mut center = Vector3::zeros();
            for axis in 0..3 {
                let mut values: Vec<f64> = window.iter().map(|s| s.position[axis]).collect();
                center[axis] = median(&mut values);
            }
            (sample.position.coords - center).norm() > config.max_displacement
        })
        .collect()
}

/// Symmetric moving average that shrinks near the ends of the segment, so a
/// linear motion is left unchanged.
fn smooth_segment(positions: &mut [Point3<f64>], window: usize) {
    let half = window / 2;
    if half == 0 || positions.len() < 3 {
        return;
    }
    let original = positions.to_vec();
    let n = original.len();
    for (i, position) in positions.iter_mut().enumerate() {
        let h = half.min(i).min(n - 1 - i);
        let sum: Vector3<f64> = original[i - h..=i + h].iter().map(|p| p.coords).sum();
        *position = Point3::from(sum / (2 * h + 1) as f64);
    }
}

/// Cleans one track.
///
/// Samples are taken in frame order. Of several samples for the same frame
/// only the first is used.
pub fn process_track(track: &LandmarkTrack, config: &TrajectoryConfig) -> CleanedTrack {
    let mut ordered: Vec<&TrackSample> = track.samples.iter().collect();
    ordered.sort_by_key(|s| s.frame_id);
    ordered.dedup_by_key(|s| s.frame_id);
    if ordered.len() < track.samples.len() {
        debug!(
            "Landmark {}: ignored {} duplicate samples",
            track.landmark_id,
            track.samples.len() - ordered.len()
        );
    }

    let outliers = find_outliers(&ordered, config);
    let kept: Vec<&TrackSample> = ordered
        .iter()
        .zip(&outliers)
        .filter(|(_, outlier)| !**outlier)
        .map(|(sample, _)| *sample)
        .collect();
    let rejected_outliers = ordered.len() - kept.len();
    if rejected_outliers > 0 {
        debug!(
            "Landmark {}: rejected {} outlier samples",
            track.landmark_id, rejected_outliers
        );
    }

    let mut samples = Vec::new();
    for (i, sample) in kept.iter().enumerate() {
        if let Some(previous) = i.checked_sub(1).map(|j| kept[j]) {
            let missing = sample.frame_id - previous.frame_id - 1;
            for frame_id in previous.frame_id + 1..sample.frame_id {
                if missing <= config.max_gap {
                    let t = (frame_id - previous.frame_id) as f64
                        / (sample.frame_id - previous.frame_id) as f64;
                    let position = previous.position + (sample.position - previous.position) * t;
                    samples.push(CleanedSample {
                        frame_id,
                        position: Some(position),
                        is_interpolated: true,
                        is_gap: false,
                    });
                } else {
                    samples.push(CleanedSample {
                        frame_id,
                        position: None,
                        is_interpolated: false,
                        is_gap: true,
                    });
                }
            }
        }
        samples.push(CleanedSample {
            frame_id: sample.frame_id,
            position: Some(sample.position),
            is_interpolated: false,
            is_gap: false,
        });
    }

    for segment in samples.split_mut(|s| s.is_gap) {
        let mut positions: Vec<Point3<f64>> = segment.iter().filter_map(|s| s.position).collect();
        smooth_segment(&mut positions, config.smoothing_window);
        for (sample, position) in segment.iter_mut().zip(positions) {
            sample.position = Some(position);
        }
    }

    CleanedTrack {
        landmark_id: track.landmark_id,
        samples,
        rejected_outliers,
    }
}

/// Cleans every track in parallel, preserving order.
pub fn process_tracks(tracks: &[LandmarkTrack], config: &TrajectoryConfig) -> Vec<CleanedTrack> {
    tracks
        .par_iter()
        .map(|track| process_track(track, config))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn sample(frame_id: FrameId, x: f64) -> TrackSample {
        TrackSample {
            frame_id,
            position: Point3::new(x, 2.0 * x, -x),
            camera_count: 2,
            mean_residual: 0.1,
        }
    }

    fn track(frames: impl IntoIterator<Item = FrameId>) -> LandmarkTrack {
        LandmarkTrack {
            landmark_id: 4,
            samples: frames
                .into_iter()
                .map(|f| sample(f, 0.01 * f as f64))
                .collect(),
        }
    }

    #[test]
    fn test_short_gap_is_interpolated() {
        let track = track((0..5).chain(7..12));
        let cleaned = process_track(&track, &TrajectoryConfig::default());

        assert_eq!(cleaned.samples.len(), 12);
        for s in &cleaned.samples {
            assert_eq!(s.is_interpolated, s.frame_id == 5 || s.frame_id == 6);
            assert!(!s.is_gap);
            // Linear motion survives interpolation and smoothing.
            let expected = sample(s.frame_id, 0.01 * s.frame_id as f64).position;
            assert_relative_eq!(s.position.unwrap(), expected, epsilon = 1e-12);
        }
    }

    #[test]
    fn test_long_gap_is_marked() {
        let track = track((0..5).chain(55..60));
        let cleaned = process_track(&track, &TrajectoryConfig::default());

        assert_eq!(cleaned.samples.len(), 60);
        let gaps: Vec<&CleanedSample> = cleaned.samples.iter().filter(|s| s.is_gap).collect();
        assert_eq!(gaps.len(), 50);
        assert!(gaps.iter().all(|s| s.position.is_none() && !s.is_interpolated));
        assert!(cleaned.samples.iter().all(|s| !s.is_interpolated));
    }

    #[test]
    fn test_spike_is_rejected_and_filled() {
        let mut track = track(0..10);
        track.samples[5].position.x += 1.0;
        let config = TrajectoryConfig {
            smoothing_window: 1,
            ..TrajectoryConfig::default()
        };
        let cleaned = process_track(&track, &config);

        assert_eq!(cleaned.rejected_outliers, 1);
        let filled = cleaned.samples[5];
        assert!(filled.is_interpolated);
        assert_relative_eq!(filled.position.unwrap().x, 0.05, epsilon = 1e-12);
    }

    #[test]
    fn test_duplicate_and_unordered_frames() {
        let mut track = track([4, 3, 3, 6, 5]);
        track.samples[2].position.x += 5.0;
        let cleaned = process_track(&track, &TrajectoryConfig::default());

        assert_eq!(
            cleaned.samples.iter().map(|s| s.frame_id).collect::<Vec<_>>(),
            vec![3, 4, 5, 6]
        );
        assert_eq!(cleaned.rejected_outliers, 0);
        assert!(cleaned.samples.iter().all(|s| !s.is_gap && !s.is_interpolated));
        // The first sample of frame 3 is kept.
        assert_relative_eq!(cleaned.samples[0].position.unwrap().x, 0.03, epsilon = 1e-12);
    }

    #[test]
    fn test_smoothing_reduces_noise() {
        let mut positions: Vec<Point3<f64>> = (0..9)
            .map(|i| Point3::new(if i % 2 == 0 { 0.01 } else { -0.01 }, 0.0, 0.0))
            .collect();
        smooth_segment(&mut positions, 5);
        assert!(positions[4].x.abs() < 0.01);
        assert_eq!(positions[0].x, 0.01);
    }

    #[test]
    fn test_tracks_from_points() {
        let point = |frame_id, landmark_id| TriangulatedPoint {
            frame_id,
            landmark_id,
            position: Point3::origin(),
            camera_count: 2,
            mean_residual: 0.0,
        };
        let tracks = build_tracks(&[point(3, 1), point(1, 1), point(2, 0)]);
        assert_eq!(tracks.len(), 2);
        assert_eq!(tracks[1].landmark_id, 1);
        assert_eq!(
            tracks[1].samples.iter().map(|s| s.frame_id).collect::<Vec<_>>(),
            vec![1, 3]
        );
        assert_eq!(process_tracks(&tracks, &TrajectoryConfig::default()).len(), 2);
    }
}
