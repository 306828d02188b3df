//! Runner callbacks: observation hooks, status snapshots and event forwarding.

use crossbeam_channel::Sender;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;
use tw_types::{Trial, TrialId, TrialResult, TrialStatus};

/// Hooks invoked by the runner. Every hook receives the step number and the
/// full trial list.
pub trait Callback: Send {
    fn on_step_begin(&mut self, _iteration: u64, _trials: &[Trial]) {}

    fn on_step_end(&mut self, _iteration: u64, _trials: &[Trial]) {}

    fn on_trial_start(&mut self, _iteration: u64, _trials: &[Trial], _trial: &Trial) {}

    fn on_trial_result(
        &mut self,
        _iteration: u64,
        _trials: &[Trial],
        _trial: &Trial,
        _result: &TrialResult,
    ) {
    }

    fn on_trial_complete(&mut self, _iteration: u64, _trials: &[Trial], _trial: &Trial) {}

    fn on_trial_error(&mut self, _iteration: u64, _trials: &[Trial], _trial: &Trial) {}
}

/// Trial statuses recorded at the end of every step.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrialStatusSnapshot {
    steps: Vec<Vec<(TrialId, TrialStatus)>>,
}

pub type SharedSnapshot = Arc<Mutex<TrialStatusSnapshot>>;

impl TrialStatusSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> SharedSnapshot {
        Arc::new(Mutex::new(Self::new()))
    }

    pub fn record(&mut self, trials: &[Trial]) {
        self.steps
            .push(trials.iter().map(|t| (t.trial_id, t.status())).collect());
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Most trials RUNNING at the same time in any recorded step.
    pub fn max_running_trials(&self) -> usize {
        self.steps
            .iter()
            .map(|step| {
                step.iter()
                    .filter(|(_, status)| *status == TrialStatus::Running)
                    .count()
            })
            .max()
            .unwrap_or(0)
    }

    /// True when the latest snapshot has every trial TERMINATED.
    pub fn all_trials_are_terminated(&self) -> bool {
        self.steps.last().is_some_and(|step| {
            step.iter()
                .all(|(_, status)| *status == TrialStatus::Terminated)
        })
    }
}

/// Records a [`TrialStatusSnapshot`] after every step.
#[derive(Debug, Clone)]
pub struct TrialStatusSnapshotTaker {
    snapshot: SharedSnapshot,
}

impl TrialStatusSnapshotTaker {
    pub fn new(snapshot: SharedSnapshot) -> Self {
        Self { snapshot }
    }
}

impl Callback for TrialStatusSnapshotTaker {
    fn on_step_end(&mut self, _iteration: u64, trials: &[Trial]) {
        self.snapshot.lock().record(trials);
    }
}

/// Runner activity, as published by [`EventForwarder`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RunnerEvent {
    TrialStarted {
        trial: TrialId,
        iteration: u64,
    },
    TrialResult {
        trial: TrialId,
        training_iteration: u64,
    },
    TrialCompleted {
        trial: TrialId,
        status: TrialStatus,
    },
    TrialErrored {
        trial: TrialId,
        error: Option<String>,
    },
    StepEnd {
        iteration: u64,
        running: usize,
        pending: usize,
    },
}

/// Publishes [`RunnerEvent`]s on a channel.
#[derive(Debug, Clone)]
pub struct EventForwarder {
    tx: Sender<RunnerEvent>,
}

impl EventForwarder {
    pub fn new(tx: Sender<RunnerEvent>) -> Self {
        Self { tx }
    }

    fn send(&self, event: RunnerEvent) {
        // Best-effort; the receiver may be gone.
        if self.tx.try_send(event).is_err() {
            debug!("runner event dropped");
        }
    }
}

impl Callback for EventForwarder {
    fn on_step_end(&mut self, iteration: u64, trials: &[Trial]) {
        let count = |status: TrialStatus| trials.iter().filter(|t| t.status() == status).count();
        self.send(RunnerEvent::StepEnd {
            iteration,
            running: count(TrialStatus::Running),
            pending: count(TrialStatus::Pending),
        });
    }

    fn on_trial_start(&mut self, iteration: u64, _trials: &[Trial], trial: &Trial) {
        self.send(RunnerEvent::TrialStarted {
            trial: trial.trial_id,
            iteration,
        });
    }

    fn on_trial_result(
        &mut self,
        _iteration: u64,
        _trials: &[Trial],
        trial: &Trial,
        result: &TrialResult,
    ) {
        self.send(RunnerEvent::TrialResult {
            trial: trial.trial_id,
            training_iteration: result.training_iteration,
        });
    }

    fn on_trial_complete(&mut self, _iteration: u64, _trials: &[Trial], trial: &Trial) {
        self.send(RunnerEvent::TrialCompleted {
            trial: trial.trial_id,
            status: trial.status(),
        });
    }

    fn on_trial_error(&mut self, _iteration: u64, _trials: &[Trial], trial: &Trial) {
        self.send(RunnerEvent::TrialErrored {
            trial: trial.trial_id,
            error: trial.error.clone(),
        });
    }
}
