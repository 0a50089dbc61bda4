//! Composition of pairwise relative poses into one world frame.
//!
//! Cameras are nodes and pairwise estimates are weighted undirected edges.
//! The reference camera (largest total edge confidence, lowest id on ties)
//! defines the world frame; every other camera is posed by chaining relative
//! transforms along a maximum-confidence spanning tree grown from it.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, BinaryHeap};

use log::{info, warn};

use crate::camera::CameraId;
use crate::geometry::Pose;
use crate::stereo::PoseGraphEdge;

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum PoseGraphError {
    #[error("pose graph has no cameras")]
    Empty,
    #[error("camera {camera} is not connected to reference camera {reference}")]
    CameraUnreachable {
        camera: CameraId,
        reference: CameraId,
    },
}

#[derive(Debug, Clone, Default)]
pub struct PoseGraph {
    nodes: BTreeSet<CameraId>,
    edges: Vec<PoseGraphEdge>,
}

/// Parent/child link of the spanning tree, with the edge that joins them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TreeLink {
    pub parent: CameraId,
    pub child: CameraId,
    pub edge: usize,
}

/// Absolute poses (camera-from-world) of every reachable camera.
#[derive(Debug, Clone)]
pub struct ComposedPoses {
    pub reference: CameraId,
    pub poses: BTreeMap<CameraId, Pose>,
    pub unreachable: BTreeMap<CameraId, PoseGraphError>,
    pub tree: Vec<TreeLink>,
}

struct Candidate {
    confidence: f64,
    parent: CameraId,
    child: CameraId,
    edge: usize,
}

impl PartialEq for Candidate {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Candidate {}

impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

// Highest confidence first, then the lowest (child, parent) ids.
impl Ord for Candidate {
    fn cmp(&self, other: &Self) -> Ordering {
        self.confidence
            .total_cmp(&other.confidence)
            .then_with(|| other.child.cmp(&self.child))
            .then_with(|| other.parent.cmp(&self.parent))
    }
}

impl PoseGraph {
    /// Builds the graph; edges touching an unknown camera are ignored.
    pub fn new(cameras: impl IntoIterator<Item = CameraId>, edges: Vec<PoseGraphEdge>) -> Self {
        let nodes: BTreeSet<CameraId> = cameras.into_iter().collect();
        let edges = edges
            .into_iter()
            .filter(|e| {
                let known = nodes.contains(&e.camera_a) && nodes.contains(&e.camera_b);
                if !known {
                    warn!(
                        "Ignoring edge ({}, {}) to an uncalibrated camera",
                        e.camera_a, e.camera_b
                    );
                }
                known && e.camera_a != e.camera_b && e.confidence.is_finite()
            })
            .collect();
        PoseGraph { nodes, edges }
    }

    pub fn nodes(&self) -> &BTreeSet<CameraId> {
        &self.nodes
    }

    pub fn edges(&self) -> &[PoseGraphEdge] {
        &self.edges
    }

    fn incident(&self, camera: CameraId) -> impl Iterator<Item = (usize, &PoseGraphEdge)> {
        self.edges
            .iter()
            .enumerate()
            .filter(move |(_, e)| e.camera_a == camera || e.camera_b == camera)
    }

    pub fn total_confidence(&self, camera: CameraId) -> f64 {
        self.incident(camera).map(|(_, e)| e.confidence).sum()
    }

    /// The camera with the largest summed edge confidence, lowest id on ties.
    pub fn select_reference(&self) -> Option<CameraId> {
        self.nodes.iter().copied().fold(None, |best, camera| {
            let score = self.total_confidence(camera);
            match best {
                Some((_, best_score)) if score <= best_score => best,
                _ => Some((camera, score)),
            }
        })
        .map(|(camera, _)| camera)
    }

    /// Prim's algorithm from `root`, always taking the highest-confidence edge
    /// that reaches a new camera.
    pub fn maximum_spanning_tree(&self, root: CameraId) -> Vec<TreeLink> {
        let mut visited = BTreeSet::from([root]);
        let mut heap = BinaryHeap::new();
        let push_from = |heap: &mut BinaryHeap<Candidate>, camera: CameraId| {
            for (index, edge) in self.incident(camera) {
                if let Some(other) = edge.other(camera) {
                    heap.push(Candidate {
                        confidence: edge.confidence,
                        parent: camera,
                        child: other,
                        edge: index,
                    });
                }
            }
        };
        push_from(&mut heap, root);

        let mut tree = Vec::new();
        while let Some(candidate) = heap.pop() {
            if !visited.insert(candidate.child) {
                continue;
            }
            tree.push(TreeLink {
                parent: candidate.parent,
                child: candidate.child,
                edge: candidate.edge,
            });
            push_from(&mut heap, candidate.child);
        }
        tree
    }

    /// Poses every camera reachable from the reference; the rest are reported
    /// as [`PoseGraphError::CameraUnreachable`].
    ///
    /// # Errors
    ///
    /// [`PoseGraphError::Empty`] if the graph has no cameras.
    pub fn compose(&self) -> Result<ComposedPoses, PoseGraphError> {
        let reference = self.select_reference().ok_or(PoseGraphError::Empty)?;
        let tree = self.maximum_spanning_tree(reference);

        let mut poses = BTreeMap::from([(reference, Pose::identity())]);
        for link in &tree {
            let edge = &self.edges[link.edge];
            let (Some(parent_pose), Some(child_from_parent)) =
                (poses.get(&link.parent).copied(), edge.transform_from(link.parent))
            else {
                continue;
            };
            poses.insert(link.child, child_from_parent.compose(&parent_pose));
        }

        let unreachable: BTreeMap<CameraId, PoseGraphError> = self
            .nodes
            .iter()
            .filter(|camera| !poses.contains_key(camera))
            .map(|&camera| {
                let error = PoseGraphError::CameraUnreachable { camera, reference };
                warn!("{}", error);
                (camera, error)
            })
            .collect();

        info!(
            "Pose graph: reference camera {}, {} posed, {} unreachable",
            reference,
            poses.len(),
            unreachable.len()
        );
        Ok(ComposedPoses {
            reference,
            poses,
            unreachable,
            tree,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::Vector3;

    fn edge(a: CameraId, b: CameraId, relative: Pose, confidence: f64) -> PoseGraphEdge {
        PoseGraphEdge {
            camera_a: a,
            camera_b: b,
            relative,
            supporting_observations: 100,
            inlier_frames: 5,
            rms: 0.1,
            confidence,
        }
    }

    fn camera_pose(x: f64, yaw: f64) -> Pose {
        Pose::from_parts(Vector3::new(0.0, yaw, 0.0), Vector3::new(x, 0.0, 0.0))
    }

    fn relative(a: &Pose, b: &Pose) -> Pose {
        b.compose(&a.inverse())
    }

    #[test]
    fn test_chain_composition_recovers_poses() {
        let truth = [camera_pose(0.0, 0.0), camera_pose(-0.5, 0.1), camera_pose(-1.0, 0.25)];
        let edges = vec![
            edge(0, 1, relative(&truth[0], &truth[1]), 50.0),
            edge(1, 2, relative(&truth[1], &truth[2]), 40.0),
        ];
        let graph = PoseGraph::new([0, 1, 2], edges);
        let composed = graph.compose().unwrap();

        // Camera 1 has the largest total confidence.
        assert_eq!(composed.reference, 1);
        assert!(composed.unreachable.is_empty());
        let reference_inv = truth[1].inverse();
        for (id, pose) in &composed.poses {
            let expected = truth[*id as usize].compose(&reference_inv);
            assert_relative_eq!(pose.translation, expected.translation, epsilon = 1e-12);
            assert_relative_eq!(pose.rotation, expected.rotation, epsilon = 1e-12);
        }
        assert_eq!(composed.poses[&1], Pose::identity());
    }

    #[test]
    fn test_spanning_tree_prefers_confident_edges() {
        let p = camera_pose(0.1, 0.0);
        let edges = vec![
            edge(0, 1, p, 10.0),
            edge(1, 2, p, 10.0),
            edge(0, 2, p, 1.0),
        ];
        let graph = PoseGraph::new([0, 1, 2], edges);
        let tree = graph.maximum_spanning_tree(0);
        assert_eq!(tree.len(), 2);
        assert!(tree.iter().all(|link| link.edge != 2));
    }

    #[test]
    fn test_reference_tie_breaks_to_lowest_id() {
        let graph = PoseGraph::new([3, 5], vec![edge(3, 5, Pose::identity(), 7.0)]);
        assert_eq!(graph.select_reference(), Some(3));
        assert_eq!(PoseGraph::new([], vec![]).compose().unwrap_err(), PoseGraphError::Empty);
    }

    #[test]
    fn test_disconnected_camera_is_unreachable() {
        let graph = PoseGraph::new(
            [0, 1, 2],
            vec![edge(0, 1, camera_pose(0.3, 0.0), 20.0)],
        );
        let composed = graph.compose().unwrap();
        assert_eq!(composed.poses.len(), 2);
        assert_eq!(
            composed.unreachable[&2],
            PoseGraphError::CameraUnreachable {
                camera: 2,
                reference: 0
            }
        );
    }
}
