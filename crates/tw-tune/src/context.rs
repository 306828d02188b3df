//! Read-only view of the runner handed to schedulers.

use tw_executor::TrialExecutor;
use tw_types::{PlacementGroupFactory, ResourceSet, Trial, TrialId, TrialStatus};

/// What a scheduler sees while making a decision.
///
/// Schedulers never mutate trials directly. Pauses of other trials and
/// resource changes are queued here and applied by the runner once the
/// scheduler callback returns.
pub struct SchedulerContext<'a> {
    trials: &'a [Trial],
    executor: &'a TrialExecutor,
    requests: SchedulerRequests,
}

/// Changes a scheduler asked for during one callback.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct SchedulerRequests {
    pub pauses: Vec<TrialId>,
    pub resource_updates: Vec<(TrialId, PlacementGroupFactory)>,
}

impl SchedulerRequests {
    pub fn is_empty(&self) -> bool {
        self.pauses.is_empty() && self.resource_updates.is_empty()
    }

    /// Fold `other` in; a later resize of the same trial replaces an earlier one.
    pub fn merge(&mut self, other: SchedulerRequests) {
        for trial in other.pauses {
            if !self.pauses.contains(&trial) {
                self.pauses.push(trial);
            }
        }
        for (trial, resources) in other.resource_updates {
            self.resource_updates.retain(|(id, _)| *id != trial);
            self.resource_updates.push((trial, resources));
        }
    }
}

impl<'a> SchedulerContext<'a> {
    pub fn new(trials: &'a [Trial], executor: &'a TrialExecutor) -> Self {
        Self {
            trials,
            executor,
            requests: SchedulerRequests::default(),
        }
    }

    pub fn trials(&self) -> &'a [Trial] {
        self.trials
    }

    pub fn get_trial(&self, trial: TrialId) -> Option<&'a Trial> {
        self.trials.iter().find(|t| t.trial_id == trial)
    }

    /// Trials waiting for resources, in creation order.
    pub fn waiting_trials(&self) -> impl Iterator<Item = &'a Trial> {
        self.trials
            .iter()
            .filter(|t| matches!(t.status(), TrialStatus::Pending | TrialStatus::Paused))
    }

    pub fn running_trials(&self) -> impl Iterator<Item = &'a Trial> {
        self.trials
            .iter()
            .filter(|t| t.status() == TrialStatus::Running)
    }

    pub fn executor(&self) -> &'a TrialExecutor {
        self.executor
    }

    pub fn total_resources(&self) -> ResourceSet {
        self.executor.resource_manager().total_resources().clone()
    }

    pub fn available_resources(&self) -> ResourceSet {
        self.executor.resource_manager().available_resources()
    }

    /// Resources currently committed to `trial`, if it holds any.
    pub fn trial_resources(&self, trial: TrialId) -> Option<ResourceSet> {
        self.executor.allocation(trial).map(|a| a.resources())
    }

    /// Ask the runner to pause another RUNNING trial.
    pub fn request_pause(&mut self, trial: TrialId) {
        if !self.requests.pauses.contains(&trial) {
            self.requests.pauses.push(trial);
        }
    }

    /// Ask the runner to replace a trial's resource request. Only takes effect
    /// once the trial is no longer RUNNING.
    pub fn request_resource_update(&mut self, trial: TrialId, resources: PlacementGroupFactory) {
        self.requests.resource_updates.retain(|(id, _)| *id != trial);
        self.requests.resource_updates.push((trial, resources));
    }

    pub fn into_requests(self) -> SchedulerRequests {
        self.requests
    }
}
