//! Progress reporting and cooperative cancellation.
//!
//! Long-running stages report through a [`ProgressObserver`] and poll a
//! [`CancellationToken`] at stage, solver-round and frame boundaries. Nothing
//! is interrupted mid-step.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex};

use log::info;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Intrinsics,
    Pairwise,
    PoseGraph,
    BundleAdjustment,
    Triangulation,
    PostProcessing,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Intrinsics => "intrinsics",
            Stage::Pairwise => "pairwise",
            Stage::PoseGraph => "pose graph",
            Stage::BundleAdjustment => "bundle adjustment",
            Stage::Triangulation => "triangulation",
            Stage::PostProcessing => "post-processing",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProgressEvent {
    pub stage: Stage,
    pub completed: usize,
    pub total: usize,
    /// Current objective value, for solver rounds.
    pub cost: Option<f64>,
}

impl ProgressEvent {
    pub fn new(stage: Stage, completed: usize, total: usize) -> Self {
        ProgressEvent {
            stage,
            completed,
            total,
            cost: None,
        }
    }

    pub fn with_cost(mut self, cost: f64) -> Self {
        self.cost = Some(cost);
        self
    }
}

/// Receives progress events. Called from worker threads.
pub trait ProgressObserver: Send + Sync {
    fn on_progress(&self, event: &ProgressEvent);
}

/// Discards every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullObserver;

impl ProgressObserver for NullObserver {
    fn on_progress(&self, _event: &ProgressEvent) {}
}

/// Forwards events to the `log` facade at info level.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogObserver;

impl ProgressObserver for LogObserver {
    fn on_progress(&self, event: &ProgressEvent) {
        match event.cost {
            Some(cost) => info!(
                "[{}] {}/{} (cost {:.6e})",
                event.stage, event.completed, event.total, cost
            ),
            None => info!("[{}] {}/{}", event.stage, event.completed, event.total),
        }
    }
}

/// Sends events over an `mpsc` channel to a consumer thread.
///
/// A disconnected receiver is ignored.
#[derive(Debug)]
pub struct ChannelObserver {
    sender: Mutex<Sender<ProgressEvent>>,
}

impl ChannelObserver {
    pub fn new(sender: Sender<ProgressEvent>) -> Self {
        ChannelObserver {
            sender: Mutex::new(sender),
        }
    }
}

impl ProgressObserver for ChannelObserver {
    fn on_progress(&self, event: &ProgressEvent) {
        if let Ok(sender) = self.sender.lock() {
            let _ = sender.send(event.clone());
        }
    }
}

/// Shared cancellation flag.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn test_channel_observer_forwards_events() {
        let (tx, rx) = mpsc::channel();
        let observer = ChannelObserver::new(tx);
        observer.on_progress(&ProgressEvent::new(Stage::Triangulation, 1, 4));
        observer.on_progress(&ProgressEvent::new(Stage::BundleAdjustment, 2, 10).with_cost(0.5));

        let events: Vec<_> = rx.try_iter().collect();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].stage, Stage::Triangulation);
        assert_eq!(events[1].cost, Some(0.5));
    }

    #[test]
    fn test_dropped_receiver_is_ignored() {
        let (tx, rx) = mpsc::channel();
        drop(rx);
        ChannelObserver::new(tx).on_progress(&ProgressEvent::new(Stage::Intrinsics, 0, 1));
    }

    #[test]
    fn test_cancellation_is_shared_between_clones() {
        let token = CancellationToken::new();
        let clone = token.clone();
        assert!(!clone.is_cancelled());
        token.cancel();
        assert!(clone.is_cancelled());
    }
}
