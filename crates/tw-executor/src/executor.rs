//! Binds trials to resource allocations and to actors on the execution substrate.

use std::collections::HashMap;
use tracing::{debug, error, info, warn};
use tw_resources::{create_resource_manager, Allocation, RequestId, ResourceManager};
use tw_types::{
    ClusterConfig, PlacementGroupFactory, ResourceManagerKind, ResourceSet, RunnerConfig, Trial,
    TrialError, TrialId, TrialStatus, TwResult,
};

use crate::backend::{ActorHandle, ExecutionBackend, ExecutionEvent, LocalBackend};
use crate::trainable::TrainableRegistry;

#[derive(Debug)]
struct StagedRequest {
    request: RequestId,
    resources: PlacementGroupFactory,
}

/// Owns every allocation and actor handle on behalf of the trials it runs.
///
/// The executor never holds trials itself; the runner passes them in so that
/// all status changes flow through [`Trial::set_status`].
pub struct TrialExecutor {
    resource_manager: Box<dyn ResourceManager>,
    backend: Box<dyn ExecutionBackend>,
    max_staged: usize,
    staged: HashMap<TrialId, StagedRequest>,
    allocations: HashMap<TrialId, Allocation>,
    actors: HashMap<TrialId, ActorHandle>,
}

impl TrialExecutor {
    pub fn new(
        resource_manager: Box<dyn ResourceManager>,
        backend: Box<dyn ExecutionBackend>,
    ) -> Self {
        info!(resource_manager = resource_manager.name(), "trial executor created");
        Self {
            resource_manager,
            backend,
            max_staged: 1,
            staged: HashMap::new(),
            allocations: HashMap::new(),
            actors: HashMap::new(),
        }
    }

    /// Executor over the in-process substrates, sized by `cluster`.
    pub fn local(
        cluster: &ClusterConfig,
        kind: ResourceManagerKind,
        config: &RunnerConfig,
        registry: TrainableRegistry,
    ) -> TwResult<Self> {
        let total = cluster.total_resources()?;
        let resource_manager = create_resource_manager(kind, total, config.placement_delay_steps);
        let backend = LocalBackend::new(registry).with_startup_polls(config.startup_polls);
        Ok(Self::new(resource_manager, Box::new(backend)).with_max_staged(config.max_pending_trials))
    }

    /// Bound on staged, uncommitted resource requests.
    pub fn with_max_staged(mut self, max_staged: usize) -> Self {
        self.max_staged = max_staged.max(1);
        self
    }

    pub fn max_staged(&self) -> usize {
        self.max_staged
    }

    pub fn resource_manager(&self) -> &dyn ResourceManager {
        self.resource_manager.as_ref()
    }

    /// Let the substrate make progress on staged requests. Called once per step.
    pub fn update_state(&mut self) {
        self.resource_manager.update_state();
    }

    pub fn staged_count(&self) -> usize {
        self.resource_manager.staged_count()
    }

    pub fn has_staging_room(&self) -> bool {
        self.staged_count() < self.max_staged
    }

    pub fn is_staged(&self, trial: TrialId) -> bool {
        self.staged.contains_key(&trial)
    }

    pub fn allocation(&self, trial: TrialId) -> Option<&Allocation> {
        self.allocations.get(&trial)
    }

    /// Stage (or reuse) a resource request for a PENDING or PAUSED trial and
    /// launch it once the request is ready. Returns whether the trial is now
    /// RUNNING. Never blocks.
    ///
    /// A request that can never be satisfied moves the trial to ERROR and is
    /// returned as an error.
    pub fn try_start(&mut self, trial: &mut Trial) -> TwResult<bool> {
        if !matches!(trial.status(), TrialStatus::Pending | TrialStatus::Paused) {
            return Ok(false);
        }

        let request = match self.staged_request(trial) {
            Ok(Some(request)) => request,
            Ok(None) => return Ok(false),
            Err(e) => {
                error!(trial = %trial, error = %e, "resource request rejected");
                trial.mark_error(e.to_string())?;
                return Err(e);
            }
        };

        if !self.resource_manager.is_ready(request) {
            return Ok(false);
        }

        let allocation = self.resource_manager.commit(request)?;
        self.staged.remove(&trial.trial_id);

        let actor = match self.backend.launch(trial, &allocation) {
            Ok(actor) => actor,
            Err(e) => {
                error!(trial = %trial, error = %e, "failed to launch trial");
                self.resource_manager.release(&allocation);
                trial.mark_error(e.to_string())?;
                return Err(e);
            }
        };

        let from = trial.status();
        trial.set_status(TrialStatus::Running)?;
        info!(
            trial = %trial,
            from = %from,
            resources = %allocation.resources(),
            "trial started"
        );
        self.actors.insert(trial.trial_id, actor);
        self.allocations.insert(trial.trial_id, allocation);
        Ok(true)
    }

    /// Restart a PAUSED trial. Resources are re-acquired from scratch.
    pub fn resume(&mut self, trial: &mut Trial) -> TwResult<bool> {
        if trial.status() != TrialStatus::Paused {
            return Err(TrialError::InvalidTransition {
                trial: trial.trial_id,
                from: trial.status(),
                to: TrialStatus::Running,
            }
            .into());
        }
        self.try_start(trial)
    }

    /// The staged request for `trial`, issuing a new one when there is none
    /// or when the trial's resource request changed since it was staged.
    /// `Ok(None)` means the backlog is full.
    fn staged_request(&mut self, trial: &Trial) -> TwResult<Option<RequestId>> {
        if let Some(staged) = self.staged.get(&trial.trial_id) {
            if &staged.resources == trial.placement_group_factory() {
                return Ok(Some(staged.request));
            }
            debug!(trial = %trial, request = %staged.request, "resource request changed, re-staging");
            self.resource_manager.cancel(staged.request);
            self.staged.remove(&trial.trial_id);
        }

        if !self.has_staging_room() {
            debug!(trial = %trial, staged = self.staged_count(), "staging backlog full");
            return Ok(None);
        }

        let resources = trial.placement_group_factory().clone();
        let request = self.resource_manager.request(&resources)?;
        self.staged
            .insert(trial.trial_id, StagedRequest { request, resources });
        Ok(Some(request))
    }

    /// Gracefully stop a RUNNING trial, keeping a checkpoint so that it can be
    /// resumed later, and release its resources.
    pub fn pause(&mut self, trial: &mut Trial) -> TwResult<()> {
        if trial.status() != TrialStatus::Running {
            return Err(TrialError::InvalidTransition {
                trial: trial.trial_id,
                from: trial.status(),
                to: TrialStatus::Paused,
            }
            .into());
        }

        if let Some(actor) = self.actors.remove(&trial.trial_id) {
            if let Some(checkpoint) = self.backend.save(actor) {
                trial.checkpoint = Some(checkpoint);
            }
            self.backend.stop(actor);
        }
        self.release(trial.trial_id);
        trial.set_status(TrialStatus::Paused)?;
        info!(trial = %trial, "trial paused");
        Ok(())
    }

    /// Terminate a PENDING, RUNNING or PAUSED trial unconditionally.
    pub fn stop(&mut self, trial: &mut Trial) -> TwResult<()> {
        self.ensure_live(trial, TrialStatus::Terminated)?;
        self.teardown(trial.trial_id);
        trial.set_status(TrialStatus::Terminated)?;
        info!(trial = %trial, "trial terminated");
        Ok(())
    }

    /// Move a trial to ERROR after an execution failure, reclaiming everything
    /// it holds.
    pub fn fail(&mut self, trial: &mut Trial, message: impl Into<String>) -> TwResult<()> {
        self.ensure_live(trial, TrialStatus::Error)?;
        self.teardown(trial.trial_id);
        let message = message.into();
        error!(trial = %trial, error = %message, "trial failed");
        trial.mark_error(message)
    }

    fn ensure_live(&self, trial: &Trial, to: TrialStatus) -> TwResult<()> {
        if trial.is_finished() {
            return Err(TrialError::InvalidTransition {
                trial: trial.trial_id,
                from: trial.status(),
                to,
            }
            .into());
        }
        Ok(())
    }

    fn teardown(&mut self, trial: TrialId) {
        if let Some(staged) = self.staged.remove(&trial) {
            self.resource_manager.cancel(staged.request);
        }
        if let Some(actor) = self.actors.remove(&trial) {
            self.backend.stop(actor);
        }
        self.release(trial);
    }

    fn release(&mut self, trial: TrialId) {
        if let Some(allocation) = self.allocations.remove(&trial) {
            debug!(trial = %trial, resources = %allocation.resources(), "releasing allocation");
            self.resource_manager.release(&allocation);
        }
    }

    /// Newly available events for every trial with a live actor, `None` for
    /// trials with nothing new this step.
    pub fn poll_results(&mut self) -> HashMap<TrialId, Option<ExecutionEvent>> {
        let backend = &mut self.backend;
        self.actors
            .iter()
            .map(|(trial, actor)| (*trial, backend.poll(*actor)))
            .collect()
    }

    /// Aggregate of every committed allocation, keyed by resource name.
    pub fn allocated_resources(&self) -> ResourceSet {
        let mut total = ResourceSet::new();
        for allocation in self.allocations.values() {
            total.add(&allocation.resources());
        }
        total
    }

    /// Stop every trial that is not finished yet.
    pub fn cleanup(&mut self, trials: &mut [Trial]) {
        for trial in trials.iter_mut().filter(|t| !t.is_finished()) {
            if let Err(e) = self.stop(trial) {
                warn!(trial = %trial, error = %e, "failed to stop trial during cleanup");
            }
        }
    }
}
