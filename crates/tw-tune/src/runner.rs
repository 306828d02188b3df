//! The trial runner: one cooperative control step at a time.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use tracing::{debug, info, warn};
use tw_executor::{ExecutionEvent, TrialExecutor};
use tw_types::{
    ResourceSet, ResourceSpec, RunnerError, Trial, TrialError, TrialId, TrialResult, TrialStatus,
    TwResult,
};

use crate::callbacks::Callback;
use crate::context::{SchedulerContext, SchedulerRequests};
use crate::scheduler::{FifoScheduler, SchedulerDecision, TrialScheduler};
use crate::search::{BasicVariantGenerator, SearchAlgorithm};

/// Final state of one trial, as reported at the end of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialSummary {
    pub trial_id: TrialId,
    pub trainable: String,
    pub experiment_tag: String,
    pub status: TrialStatus,
    pub iterations: u64,
    pub last_metrics: HashMap<String, f64>,
    pub error: Option<String>,
}

/// Drives trials through admission, execution and scheduling decisions.
///
/// All state changes happen synchronously inside [`TrialRunner::step`]; the
/// substrate is only ever observed through non-blocking polls.
pub struct TrialRunner {
    search_alg: Box<dyn SearchAlgorithm>,
    scheduler: Box<dyn TrialScheduler>,
    executor: TrialExecutor,
    callbacks: Vec<Box<dyn Callback>>,
    trials: Vec<Trial>,
    reported: HashSet<TrialId>,
    max_pending_trials: usize,
    iteration: u64,
}

impl TrialRunner {
    /// Runner with a FIFO scheduler and an empty search algorithm; trials are
    /// added with [`TrialRunner::add_trial`].
    pub fn new(executor: TrialExecutor) -> Self {
        let max_pending_trials = executor.max_staged();
        Self {
            search_alg: Box::new(BasicVariantGenerator::new()),
            scheduler: Box::new(FifoScheduler::new()),
            executor,
            callbacks: Vec::new(),
            trials: Vec::new(),
            reported: HashSet::new(),
            max_pending_trials,
            iteration: 0,
        }
    }

    pub fn with_search_alg(mut self, search_alg: Box<dyn SearchAlgorithm>) -> Self {
        self.search_alg = search_alg;
        self
    }

    pub fn with_scheduler(mut self, scheduler: Box<dyn TrialScheduler>) -> Self {
        self.scheduler = scheduler;
        self
    }

    pub fn with_callback(mut self, callback: Box<dyn Callback>) -> Self {
        self.callbacks.push(callback);
        self
    }

    pub fn add_callback(&mut self, callback: Box<dyn Callback>) {
        self.callbacks.push(callback);
    }

    /// Number of completed steps.
    pub fn iteration(&self) -> u64 {
        self.iteration
    }

    pub fn executor(&self) -> &TrialExecutor {
        &self.executor
    }

    pub fn scheduler(&self) -> &dyn TrialScheduler {
        self.scheduler.as_ref()
    }

    pub fn allocated_resources(&self) -> ResourceSet {
        self.executor.allocated_resources()
    }

    pub fn get_trials(&self) -> &[Trial] {
        &self.trials
    }

    pub fn get_trial(&self, trial: TrialId) -> Option<&Trial> {
        self.trials.iter().find(|t| t.trial_id == trial)
    }

    fn index_of(&self, trial: TrialId) -> TwResult<usize> {
        self.trials
            .iter()
            .position(|t| t.trial_id == trial)
            .ok_or_else(|| TrialError::NotFound { trial }.into())
    }

    fn count(&self, status: TrialStatus) -> usize {
        self.trials.iter().filter(|t| t.status() == status).count()
    }

    /// True once the search algorithm is exhausted and every trial is
    /// TERMINATED or ERROR.
    pub fn is_finished(&self) -> bool {
        self.search_alg.is_finished() && self.trials.iter().all(Trial::is_finished)
    }

    /// Register a new PENDING trial.
    pub fn add_trial(&mut self, trial: Trial) {
        let mut ctx = SchedulerContext::new(&self.trials, &self.executor);
        self.scheduler.on_trial_add(&mut ctx, &trial);
        let requests = ctx.into_requests();
        info!(
            trial = %trial,
            tag = %trial.experiment_tag,
            resources = %trial.placement_group_factory(),
            "trial added"
        );
        self.trials.push(trial);
        self.apply_requests(requests);
    }

    /// Run one control step.
    ///
    /// Fails with [`RunnerError::AlreadyFinished`] when called after
    /// [`TrialRunner::is_finished`] became true.
    pub fn step(&mut self) -> TwResult<()> {
        if self.is_finished() {
            return Err(RunnerError::AlreadyFinished.into());
        }
        self.iteration += 1;
        for callback in self.callbacks.iter_mut() {
            callback.on_step_begin(self.iteration, &self.trials);
        }

        self.pull_trial()?;
        self.executor.update_state();
        self.start_trials();
        self.process_events()?;
        self.report_finished();

        for callback in self.callbacks.iter_mut() {
            callback.on_step_end(self.iteration, &self.trials);
        }
        debug!(
            iteration = self.iteration,
            running = self.count(TrialStatus::Running),
            pending = self.count(TrialStatus::Pending),
            staged = self.executor.staged_count(),
            "step finished"
        );
        Ok(())
    }

    /// Step until finished, or until `max_steps` steps were taken. Returns the
    /// number of steps run.
    pub fn run_until_finished(&mut self, max_steps: Option<u64>) -> TwResult<u64> {
        let mut steps = 0;
        while !self.is_finished() {
            if max_steps.is_some_and(|max| steps >= max) {
                warn!(steps, "step limit reached before all trials finished");
                break;
            }
            self.step()?;
            steps += 1;
        }
        Ok(steps)
    }

    /// Take at most one new trial from the search algorithm while the
    /// backlog of PENDING trials has room.
    fn pull_trial(&mut self) -> TwResult<()> {
        if self.search_alg.is_finished() || self.count(TrialStatus::Pending) >= self.max_pending_trials
        {
            return Ok(());
        }
        if let Some(trial) = self.search_alg.next_trial()? {
            self.add_trial(trial);
        }
        Ok(())
    }

    fn start_trials(&mut self) {
        let order = {
            let ctx = SchedulerContext::new(&self.trials, &self.executor);
            self.scheduler.choose_trials_to_run(&ctx)
        };

        for trial_id in order {
            let Ok(idx) = self.index_of(trial_id) else {
                continue;
            };
            match self.executor.try_start(&mut self.trials[idx]) {
                Ok(true) => {
                    for callback in self.callbacks.iter_mut() {
                        callback.on_trial_start(self.iteration, &self.trials, &self.trials[idx]);
                    }
                }
                Ok(false) => {}
                // The executor already moved the trial to ERROR; it is reported below.
                Err(e) => debug!(trial = %trial_id, error = %e, "trial could not be started"),
            }
        }
    }

    /// Pauses and resizes queued by the scheduler are applied only after every
    /// polled event has been handled.
    fn process_events(&mut self) -> TwResult<()> {
        let mut events = self.executor.poll_results();
        let mut requests = SchedulerRequests::default();
        for idx in 0..self.trials.len() {
            if self.trials[idx].status() != TrialStatus::Running {
                continue;
            }
            match events.remove(&self.trials[idx].trial_id).flatten() {
                Some(ExecutionEvent::Result(result)) => {
                    requests.merge(self.on_trial_result(idx, result)?)
                }
                Some(ExecutionEvent::Failed(message)) => {
                    self.executor.fail(&mut self.trials[idx], message)?
                }
                None => {}
            }
        }
        self.apply_requests(requests);
        Ok(())
    }

    fn on_trial_result(
        &mut self,
        idx: usize,
        result: TrialResult,
    ) -> TwResult<SchedulerRequests> {
        self.trials[idx].last_result = Some(result.clone());
        let trial = &self.trials[idx];
        for metric in trial.missing_stop_metrics(&result) {
            warn!(trial = %trial, metric, "stopping metric missing from result");
        }

        for callback in self.callbacks.iter_mut() {
            callback.on_trial_result(self.iteration, &self.trials, &self.trials[idx], &result);
        }

        if self.trials[idx].should_stop(&result) {
            debug!(trial = %self.trials[idx], iteration = result.training_iteration, "stopping criterion met");
            self.executor.stop(&mut self.trials[idx])?;
            return Ok(SchedulerRequests::default());
        }

        let (decision, requests) = {
            let mut ctx = SchedulerContext::new(&self.trials, &self.executor);
            let decision = self
                .scheduler
                .on_trial_result(&mut ctx, &self.trials[idx], &result);
            (decision, ctx.into_requests())
        };
        debug!(trial = %self.trials[idx], decision = %decision, "scheduler decision");

        match decision {
            SchedulerDecision::Continue | SchedulerDecision::Noop => {}
            SchedulerDecision::Pause => self.executor.pause(&mut self.trials[idx])?,
            SchedulerDecision::Stop => self.executor.stop(&mut self.trials[idx])?,
        }
        Ok(requests)
    }

    fn apply_requests(&mut self, requests: SchedulerRequests) {
        for trial_id in requests.pauses {
            let Ok(idx) = self.index_of(trial_id) else {
                continue;
            };
            let trial = &mut self.trials[idx];
            if trial.status() == TrialStatus::Running {
                if let Err(e) = self.executor.pause(trial) {
                    warn!(trial = %trial_id, error = %e, "requested pause failed");
                }
            }
        }

        for (trial_id, resources) in requests.resource_updates {
            let Ok(idx) = self.index_of(trial_id) else {
                continue;
            };
            let trial = &mut self.trials[idx];
            match trial.set_placement_group_factory(resources) {
                Ok(()) => info!(
                    trial = %trial,
                    resources = %trial.placement_group_factory(),
                    "trial resources updated"
                ),
                Err(e) => warn!(trial = %trial, error = %e, "resource update rejected"),
            }
        }
    }

    /// Notify scheduler, search algorithm and callbacks about trials that
    /// reached TERMINATED or ERROR since the last report.
    fn report_finished(&mut self) {
        for idx in 0..self.trials.len() {
            let trial = &self.trials[idx];
            if !trial.is_finished() || self.reported.contains(&trial.trial_id) {
                continue;
            }
            self.reported.insert(trial.trial_id);

            let mut ctx = SchedulerContext::new(&self.trials, &self.executor);
            if trial.status() == TrialStatus::Error {
                self.scheduler.on_trial_error(&mut ctx, trial);
                for callback in self.callbacks.iter_mut() {
                    callback.on_trial_error(self.iteration, &self.trials, trial);
                }
            } else {
                self.scheduler
                    .on_trial_complete(&mut ctx, trial, trial.last_result.as_ref());
                for callback in self.callbacks.iter_mut() {
                    callback.on_trial_complete(self.iteration, &self.trials, trial);
                }
            }
            self.search_alg.on_trial_complete(trial);
            let requests = ctx.into_requests();
            if !requests.is_empty() {
                self.apply_requests(requests);
            }
        }
    }

    pub fn pause_trial(&mut self, trial: TrialId) -> TwResult<()> {
        let idx = self.index_of(trial)?;
        self.executor.pause(&mut self.trials[idx])
    }

    pub fn stop_trial(&mut self, trial: TrialId) -> TwResult<()> {
        let idx = self.index_of(trial)?;
        self.executor.stop(&mut self.trials[idx])?;
        self.report_finished();
        Ok(())
    }

    /// Replace the resource request of a PENDING or PAUSED trial.
    pub fn update_pending_trial_resources(
        &mut self,
        trial: TrialId,
        resources: &ResourceSpec,
    ) -> TwResult<()> {
        let idx = self.index_of(trial)?;
        self.trials[idx].update_resources(resources)
    }

    /// Stop every live trial and release everything the executor holds.
    pub fn cleanup(&mut self) {
        info!(live = self.trials.iter().filter(|t| !t.is_finished()).count(), "cleaning up trials");
        self.executor.cleanup(&mut self.trials);
        self.report_finished();
    }

    pub fn summary(&self) -> Vec<TrialSummary> {
        self.trials
            .iter()
            .map(|trial| TrialSummary {
                trial_id: trial.trial_id,
                trainable: trial.trainable_name.clone(),
                experiment_tag: trial.experiment_tag.clone(),
                status: trial.status(),
                iterations: trial
                    .last_result
                    .as_ref()
                    .map_or(0, |r| r.training_iteration),
                last_metrics: trial
                    .last_result
                    .as_ref()
                    .map(|r| r.metrics.clone())
                    .unwrap_or_default(),
                error: trial.error.clone(),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callbacks::{EventForwarder, RunnerEvent, TrialStatusSnapshot, TrialStatusSnapshotTaker};
    use crate::scheduler::{FnScheduler, PriorityScheduler, ResourceChangingScheduler};
    use crate::search::Experiment;
    use crossbeam_channel::unbounded;
    use serde_json::{json, Value};
    use tw_executor::{Metrics, TrainableRegistry};
    use tw_types::{
        ClusterConfig, FlatResources, PlacementGroupFactory, ResourceAmount, ResourceManagerKind,
        RunnerConfig, TwError, CPU, GPU, TRAINING_ITERATION,
    };

    const KINDS: [ResourceManagerKind; 2] =
        [ResourceManagerKind::Fixed, ResourceManagerKind::PlacementGroup];

    fn runner_with(
        cluster: &ClusterConfig,
        kind: ResourceManagerKind,
        registry: TrainableRegistry,
    ) -> TrialRunner {
        let executor =
            TrialExecutor::local(cluster, kind, &RunnerConfig::default(), registry).unwrap();
        TrialRunner::new(executor)
    }

    fn runner(cluster: &ClusterConfig, kind: ResourceManagerKind) -> TrialRunner {
        runner_with(cluster, kind, TrainableRegistry::with_builtins())
    }

    fn pgf(bundles: &[&[(&str, f64)]]) -> PlacementGroupFactory {
        PlacementGroupFactory::from_bundles(bundles.iter().map(|b| b.iter().copied())).unwrap()
    }

    fn fake(resources: PlacementGroupFactory) -> Trial {
        Trial::new("__fake", resources)
    }

    fn statuses(runner: &TrialRunner) -> Vec<TrialStatus> {
        runner.get_trials().iter().map(Trial::status).collect()
    }

    fn run_with_snapshot(runner: TrialRunner, trials: Vec<Trial>) -> TrialStatusSnapshot {
        let snapshot = TrialStatusSnapshot::shared();
        let mut runner =
            runner.with_callback(Box::new(TrialStatusSnapshotTaker::new(snapshot.clone())));
        for trial in trials {
            runner.add_trial(trial);
        }
        runner.run_until_finished(Some(100)).unwrap();
        assert!(runner.is_finished());
        let snapshot = snapshot.lock().clone();
        snapshot
    }

    #[test]
    fn bundles_run_mutually_exclusive() {
        for kind in KINDS {
            let cluster = ClusterConfig::new(4.0, 2.0);
            let resources = pgf(&[&[(CPU, 1.0)], &[(CPU, 3.0), (GPU, 1.0)]]);
            let trials = (0..2)
                .map(|_| fake(resources.clone()).with_stopping_criterion(TRAINING_ITERATION, 1.0))
                .collect();

            let snapshot = run_with_snapshot(runner(&cluster, kind), trials);
            assert_eq!(snapshot.max_running_trials(), 1, "{kind:?}");
            assert!(snapshot.all_trials_are_terminated(), "{kind:?}");
        }
    }

    #[test]
    fn flat_extra_resources_run_mutually_exclusive() {
        let spec = ResourceSpec::Flat(FlatResources {
            cpu: 1.0,
            extra_cpu: 3.0,
            extra_gpu: 1.0,
            ..FlatResources::default()
        });
        for kind in KINDS {
            let cluster = ClusterConfig::new(4.0, 2.0);
            let resources = spec.to_placement_group_factory().unwrap();
            let trials = (0..2)
                .map(|_| fake(resources.clone()).with_stopping_criterion(TRAINING_ITERATION, 1.0))
                .collect();

            let snapshot = run_with_snapshot(runner(&cluster, kind), trials);
            assert_eq!(snapshot.max_running_trials(), 1, "{kind:?}");
            assert!(snapshot.all_trials_are_terminated(), "{kind:?}");
        }
    }

    #[test]
    fn custom_resources_run_mutually_exclusive() {
        for kind in KINDS {
            let cluster = ClusterConfig::new(4.0, 2.0).with_resource("a", 2.0);
            let trials = (0..2)
                .map(|_| {
                    fake(pgf(&[&[(CPU, 1.0), ("a", 2.0)]]))
                        .with_stopping_criterion(TRAINING_ITERATION, 1.0)
                })
                .collect();

            let snapshot = run_with_snapshot(runner(&cluster, kind), trials);
            assert_eq!(snapshot.max_running_trials(), 1, "{kind:?}");
            assert!(snapshot.all_trials_are_terminated(), "{kind:?}");
        }
    }

    #[test]
    fn extra_custom_resources_run_mutually_exclusive() {
        for kind in KINDS {
            let cluster = ClusterConfig::new(4.0, 2.0).with_resource("a", 2.0);
            let trials = (0..2)
                .map(|_| {
                    fake(pgf(&[&[(CPU, 1.0)], &[("a", 2.0)]]))
                        .with_stopping_criterion(TRAINING_ITERATION, 1.0)
                })
                .collect();

            let snapshot = run_with_snapshot(runner(&cluster, kind), trials);
            assert_eq!(snapshot.max_running_trials(), 1, "{kind:?}");
            assert!(snapshot.all_trials_are_terminated(), "{kind:?}");
        }
    }

    #[test]
    fn fractional_gpus_pack_two_trials() {
        for kind in KINDS {
            let mut runner = runner(&ClusterConfig::new(4.0, 1.0), kind);
            for _ in 0..4 {
                runner.add_trial(fake(pgf(&[&[(CPU, 1.0), (GPU, 0.5)]])));
            }
            for _ in 0..10 {
                runner.step().unwrap();
            }

            use TrialStatus::*;
            assert_eq!(statuses(&runner), vec![Running, Running, Pending, Pending], "{kind:?}");
        }
    }

    #[test]
    fn multi_step_run_stops_on_criterion() {
        for kind in KINDS {
            let mut runner = runner(&ClusterConfig::default(), kind);
            runner.add_trial(
                fake(pgf(&[&[(CPU, 1.0)]])).with_stopping_criterion(TRAINING_ITERATION, 5.0),
            );
            runner.add_trial(
                fake(pgf(&[&[(CPU, 1.0)]])).with_stopping_criterion(TRAINING_ITERATION, 5.0),
            );
            runner.run_until_finished(Some(50)).unwrap();

            for trial in runner.get_trials() {
                assert_eq!(trial.status(), TrialStatus::Terminated, "{kind:?}");
                assert_eq!(trial.last_result.as_ref().unwrap().training_iteration, 5);
            }
            assert!(runner.allocated_resources().is_empty());
        }
    }

    #[test]
    fn step_after_finish_is_an_error() {
        for kind in KINDS {
            let mut runner = runner(&ClusterConfig::new(1.0, 0.0), kind);
            runner.add_trial(
                fake(pgf(&[&[(CPU, 1.0)]])).with_stopping_criterion(TRAINING_ITERATION, 2.0),
            );
            let steps = runner.run_until_finished(Some(20)).unwrap();
            assert!(steps < 20);
            assert_eq!(runner.get_trials()[0].status(), TrialStatus::Terminated);

            let err = runner.step().unwrap_err();
            assert!(matches!(err, TwError::Runner(RunnerError::AlreadyFinished)));
        }
    }

    #[test]
    fn resource_changing_scheduler_resizes_trial() {
        for kind in KINDS {
            let scheduler = ResourceChangingScheduler::new(
                Box::new(FifoScheduler::new()),
                |_ctx: &SchedulerContext<'_>, _trial: &Trial, result: &TrialResult| {
                    (result.training_iteration == 1).then(|| pgf(&[&[(CPU, 2.0)]]))
                },
            );
            let mut runner = runner(&ClusterConfig::new(2.0, 0.0), kind)
                .with_scheduler(Box::new(scheduler));
            runner.add_trial(
                fake(pgf(&[&[(CPU, 1.0)]])).with_stopping_criterion(TRAINING_ITERATION, 2.0),
            );
            let id = runner.get_trials()[0].trial_id;

            runner.step().unwrap();
            assert_eq!(runner.get_trial(id).unwrap().status(), TrialStatus::Running);
            assert_eq!(runner.allocated_resources().get(CPU), ResourceAmount::new_units(1));
            assert!(runner
                .update_pending_trial_resources(id, &ResourceSpec::cpu_gpu(2.0, 0.0))
                .is_err());

            runner.step().unwrap();
            assert_eq!(runner.get_trial(id).unwrap().status(), TrialStatus::Paused);
            assert!(runner.allocated_resources().is_empty());

            runner.step().unwrap();
            assert_eq!(runner.get_trial(id).unwrap().status(), TrialStatus::Running);
            assert_eq!(runner.allocated_resources().get(CPU), ResourceAmount::new_units(2));

            runner.run_until_finished(Some(20)).unwrap();
            let trial = runner.get_trial(id).unwrap();
            assert_eq!(trial.status(), TrialStatus::Terminated, "{kind:?}");
            assert_eq!(trial.last_result.as_ref().unwrap().training_iteration, 2);
        }
    }

    fn queue_experiment(samples: usize, cpus: f64) -> Box<BasicVariantGenerator> {
        let mut search = BasicVariantGenerator::with_seed(7);
        search
            .add_experiment(
                Experiment::new("queue", "f1", pgf(&[&[(CPU, cpus)]])).with_num_samples(samples),
            )
            .unwrap();
        Box::new(search)
    }

    fn ten_results() -> TrainableRegistry {
        let mut registry = TrainableRegistry::new();
        registry.register_fn("f1", |_config: &Value| {
            (0..10).map(|i| Metrics::from([("score".to_string(), i as f64)]))
        });
        registry
    }

    #[test]
    fn queue_holds_one_pending_trial() {
        for kind in KINDS {
            let mut runner = runner_with(&ClusterConfig::new(4.0, 0.0), kind, ten_results())
                .with_search_alg(queue_experiment(100, 2.0));

            for _ in 0..3 {
                runner.step().unwrap();
            }
            assert_eq!(runner.get_trials().len(), 3, "{kind:?}");

            runner.step().unwrap();
            use TrialStatus::*;
            assert_eq!(statuses(&runner), vec![Running, Running, Pending], "{kind:?}");
        }
    }

    #[test]
    fn backlog_stays_bounded() {
        for kind in KINDS {
            let mut runner = runner(&ClusterConfig::new(2.0, 0.0), kind);
            let mut search = BasicVariantGenerator::with_seed(3);
            search
                .add_experiment(
                    Experiment::new("bounded", "__fake", pgf(&[&[(CPU, 1.0)]]))
                        .with_num_samples(100)
                        .with_stop(TRAINING_ITERATION, 3.0),
                )
                .unwrap();
            runner = runner.with_search_alg(Box::new(search));

            for _ in 0..40 {
                runner.step().unwrap();
                let executor = runner.executor();
                assert!(executor.staged_count() <= 1, "{kind:?}");
                assert!(runner.count(TrialStatus::Pending) <= 1);
                assert!(runner.count(TrialStatus::Running) <= 2);
                assert!(executor
                    .resource_manager()
                    .total_resources()
                    .contains(&runner.allocated_resources()));
            }
            assert!(runner.count(TrialStatus::Terminated) > 0);
        }
    }

    #[test]
    fn priority_scheduler_preempts_lower_priority() {
        for kind in KINDS {
            let mut runner = runner(&ClusterConfig::new(1.0, 0.0), kind)
                .with_scheduler(Box::new(PriorityScheduler::new()));
            let low = fake(pgf(&[&[(CPU, 1.0)]])).with_config(json!({"priority": 1}));
            let low_id = low.trial_id;
            runner.add_trial(low);
            runner.step().unwrap();
            assert_eq!(runner.get_trial(low_id).unwrap().status(), TrialStatus::Running);

            let high = fake(pgf(&[&[(CPU, 1.0)]])).with_config(json!({"priority": 10}));
            let high_id = high.trial_id;
            runner.add_trial(high);
            runner.step().unwrap();
            runner.step().unwrap();

            assert_eq!(runner.get_trial(high_id).unwrap().status(), TrialStatus::Running, "{kind:?}");
            let low = runner.get_trial(low_id).unwrap();
            assert_eq!(low.status(), TrialStatus::Paused, "{kind:?}");
            assert!(low.checkpoint.is_some());
        }
    }

    #[test]
    fn failing_trial_is_reported() {
        for kind in KINDS {
            let (tx, rx) = unbounded();
            let mut runner = runner(&ClusterConfig::default(), kind)
                .with_callback(Box::new(EventForwarder::new(tx)));
            let trial = fake(pgf(&[&[(CPU, 1.0)]])).with_config(json!({"fail_at": 2}));
            let id = trial.trial_id;
            runner.add_trial(trial);
            runner.run_until_finished(Some(20)).unwrap();

            let trial = runner.get_trial(id).unwrap();
            assert_eq!(trial.status(), TrialStatus::Error);
            assert!(trial.error.as_deref().unwrap().contains("iteration 2"));
            assert!(runner.allocated_resources().is_empty());

            let errored: Vec<RunnerEvent> = rx
                .try_iter()
                .filter(|e| matches!(e, RunnerEvent::TrialErrored { .. }))
                .collect();
            assert_eq!(errored.len(), 1, "{kind:?}");
        }
    }

    fn pause_other_on_first_result(target: TrialId, source: TrialId) -> FnScheduler {
        FnScheduler::new(move |ctx: &mut SchedulerContext<'_>, trial: &Trial, result: &TrialResult| {
            if trial.trial_id == source && result.training_iteration == 1 {
                ctx.request_pause(target);
            }
            SchedulerDecision::Noop
        })
    }

    #[test]
    fn failure_survives_pause_requested_in_same_step() {
        for kind in KINDS {
            let a = fake(pgf(&[&[(CPU, 1.0)]]));
            let b = fake(pgf(&[&[(CPU, 1.0)]])).with_config(json!({"fail_at": 1}));
            let (a_id, b_id) = (a.trial_id, b.trial_id);
            let mut runner = runner(&ClusterConfig::new(2.0, 0.0), kind)
                .with_scheduler(Box::new(pause_other_on_first_result(b_id, a_id)));
            runner.add_trial(a);
            runner.add_trial(b);

            runner.step().unwrap();
            assert_eq!(statuses(&runner), vec![TrialStatus::Running; 2], "{kind:?}");
            runner.step().unwrap();

            let b = runner.get_trial(b_id).unwrap();
            assert_eq!(b.status(), TrialStatus::Error, "{kind:?}");
            assert!(b.error.as_deref().unwrap().contains("iteration 1"));
            assert_eq!(runner.get_trial(a_id).unwrap().status(), TrialStatus::Running);
        }
    }

    #[test]
    fn result_survives_pause_requested_in_same_step() {
        for kind in KINDS {
            let a = fake(pgf(&[&[(CPU, 1.0)]]));
            let b = fake(pgf(&[&[(CPU, 1.0)]]));
            let (a_id, b_id) = (a.trial_id, b.trial_id);
            let mut runner = runner(&ClusterConfig::new(2.0, 0.0), kind)
                .with_scheduler(Box::new(pause_other_on_first_result(b_id, a_id)));
            runner.add_trial(a);
            runner.add_trial(b);

            runner.step().unwrap();
            runner.step().unwrap();

            let b = runner.get_trial(b_id).unwrap();
            assert_eq!(b.status(), TrialStatus::Paused, "{kind:?}");
            assert_eq!(b.last_result.as_ref().unwrap().training_iteration, 1);
            assert!(b.checkpoint.is_some());

            for _ in 0..10 {
                runner.step().unwrap();
                let b = runner.get_trial(b_id).unwrap();
                if b.last_result.as_ref().unwrap().training_iteration > 1 {
                    break;
                }
            }
            let b = runner.get_trial(b_id).unwrap();
            assert_eq!(b.status(), TrialStatus::Running, "{kind:?}");
            assert_eq!(b.last_result.as_ref().unwrap().training_iteration, 2);
        }
    }

    #[test]
    fn infeasible_request_errors_trial() {
        for kind in KINDS {
            let mut runner = runner(&ClusterConfig::new(4.0, 0.0), kind);
            runner.add_trial(fake(pgf(&[&[(CPU, 8.0)]])));
            runner.add_trial(
                fake(pgf(&[&[(CPU, 1.0)]])).with_stopping_criterion(TRAINING_ITERATION, 1.0),
            );
            runner.run_until_finished(Some(20)).unwrap();

            use TrialStatus::*;
            assert_eq!(statuses(&runner), vec![Error, Terminated], "{kind:?}");
            assert!(runner.summary()[0].error.is_some());
        }
    }

    #[test]
    fn manual_stop_and_unknown_trials() {
        let mut runner = runner(&ClusterConfig::default(), ResourceManagerKind::Fixed);
        runner.add_trial(fake(pgf(&[&[(CPU, 1.0)]])));
        runner.step().unwrap();
        let id = runner.get_trials()[0].trial_id;

        runner.pause_trial(id).unwrap();
        assert_eq!(runner.get_trial(id).unwrap().status(), TrialStatus::Paused);
        runner
            .update_pending_trial_resources(id, &ResourceSpec::cpu_gpu(2.0, 0.0))
            .unwrap();
        runner.stop_trial(id).unwrap();
        assert!(runner.is_finished());
        assert!(runner.stop_trial(id).is_err());

        let unknown = TrialId::new();
        assert!(matches!(
            runner.pause_trial(unknown),
            Err(TwError::Trial(TrialError::NotFound { .. }))
        ));
    }

    #[test]
    fn cleanup_terminates_live_trials() {
        let mut runner = runner(&ClusterConfig::new(1.0, 0.0), ResourceManagerKind::PlacementGroup);
        runner.add_trial(fake(pgf(&[&[(CPU, 1.0)]])));
        runner.add_trial(fake(pgf(&[&[(CPU, 1.0)]])));
        runner.step().unwrap();
        runner.step().unwrap();

        runner.cleanup();
        assert!(runner.is_finished());
        assert!(runner.allocated_resources().is_empty());
        assert_eq!(runner.executor().staged_count(), 0);

        let summary = runner.summary();
        assert_eq!(summary.len(), 2);
        assert!(summary.iter().all(|s| s.status == TrialStatus::Terminated));
        assert_eq!(summary[0].iterations, 1);
    }
}
