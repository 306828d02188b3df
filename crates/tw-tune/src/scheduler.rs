//! Trial schedulers: policies deciding what happens to a trial after each result.

use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, info};
use tw_types::{PlacementGroupFactory, Trial, TrialId, TrialResult};

use crate::context::SchedulerContext;

/// Outcome of [`TrialScheduler::on_trial_result`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SchedulerDecision {
    /// Keep the trial running.
    Continue,
    /// Pause the trial and release its resources.
    Pause,
    /// Terminate the trial.
    Stop,
    /// Keep running; the scheduler deferred judgment.
    Noop,
}

impl fmt::Display for SchedulerDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SchedulerDecision::Continue => "CONTINUE",
            SchedulerDecision::Pause => "PAUSE",
            SchedulerDecision::Stop => "STOP",
            SchedulerDecision::Noop => "NOOP",
        };
        f.write_str(name)
    }
}

/// Pluggable continuation policy.
pub trait TrialScheduler: Send {
    fn name(&self) -> &'static str;

    fn on_trial_add(&mut self, _ctx: &mut SchedulerContext<'_>, _trial: &Trial) {}

    fn on_trial_result(
        &mut self,
        ctx: &mut SchedulerContext<'_>,
        trial: &Trial,
        result: &TrialResult,
    ) -> SchedulerDecision;

    fn on_trial_complete(
        &mut self,
        _ctx: &mut SchedulerContext<'_>,
        _trial: &Trial,
        _result: Option<&TrialResult>,
    ) {
    }

    fn on_trial_error(&mut self, _ctx: &mut SchedulerContext<'_>, _trial: &Trial) {}

    /// Order in which PENDING and PAUSED trials attempt admission this step.
    /// Defaults to creation order.
    fn choose_trials_to_run(&mut self, ctx: &SchedulerContext<'_>) -> Vec<TrialId> {
        ctx.waiting_trials().map(|t| t.trial_id).collect()
    }
}

/// First-in, first-out baseline: never preempts, always continues.
#[derive(Debug, Clone, Default)]
pub struct FifoScheduler;

impl FifoScheduler {
    pub fn new() -> Self {
        Self
    }
}

impl TrialScheduler for FifoScheduler {
    fn name(&self) -> &'static str {
        "fifo"
    }

    fn on_trial_result(
        &mut self,
        _ctx: &mut SchedulerContext<'_>,
        _trial: &Trial,
        _result: &TrialResult,
    ) -> SchedulerDecision {
        SchedulerDecision::Continue
    }
}

/// Orders admission by the numeric `priority` config key (higher first) and
/// pauses a lower-priority running trial when a waiting higher-priority trial
/// could only fit into the resources it holds.
#[derive(Debug, Clone)]
pub struct PriorityScheduler {
    key: String,
}

impl Default for PriorityScheduler {
    fn default() -> Self {
        Self {
            key: "priority".to_string(),
        }
    }
}

impl PriorityScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read priorities from a different config key.
    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = key.into();
        self
    }

    pub fn priority(&self, trial: &Trial) -> f64 {
        trial
            .config
            .get(&self.key)
            .and_then(serde_json::Value::as_f64)
            .unwrap_or(0.0)
    }
}

impl TrialScheduler for PriorityScheduler {
    fn name(&self) -> &'static str {
        "priority"
    }

    fn on_trial_result(
        &mut self,
        ctx: &mut SchedulerContext<'_>,
        trial: &Trial,
        _result: &TrialResult,
    ) -> SchedulerDecision {
        let Some(held) = ctx.trial_resources(trial.trial_id) else {
            return SchedulerDecision::Continue;
        };
        let own = self.priority(trial);
        let available = ctx.available_resources();
        let mut freed = available.clone();
        freed.add(&held);

        let blocked = ctx.waiting_trials().find(|waiting| {
            let needed = waiting.placement_group_factory().required_resources();
            self.priority(waiting) > own && !available.contains(&needed) && freed.contains(&needed)
        });
        match blocked {
            Some(waiting) => {
                info!(
                    trial = %trial,
                    preempted_for = %waiting,
                    "pausing lower-priority trial"
                );
                SchedulerDecision::Pause
            }
            None => SchedulerDecision::Continue,
        }
    }

    fn choose_trials_to_run(&mut self, ctx: &SchedulerContext<'_>) -> Vec<TrialId> {
        let mut waiting: Vec<&Trial> = ctx.waiting_trials().collect();
        // Stable: equal priorities keep creation order.
        waiting.sort_by(|a, b| self.priority(b).total_cmp(&self.priority(a)));
        waiting.into_iter().map(|t| t.trial_id).collect()
    }
}

type DecisionFn =
    Box<dyn FnMut(&mut SchedulerContext<'_>, &Trial, &TrialResult) -> SchedulerDecision + Send>;

/// Scheduler defined by a closure over `(context, trial, result)`.
pub struct FnScheduler {
    decide: DecisionFn,
}

impl FnScheduler {
    pub fn new<F>(decide: F) -> Self
    where
        F: FnMut(&mut SchedulerContext<'_>, &Trial, &TrialResult) -> SchedulerDecision
            + Send
            + 'static,
    {
        Self {
            decide: Box::new(decide),
        }
    }
}

impl TrialScheduler for FnScheduler {
    fn name(&self) -> &'static str {
        "fn"
    }

    fn on_trial_result(
        &mut self,
        ctx: &mut SchedulerContext<'_>,
        trial: &Trial,
        result: &TrialResult,
    ) -> SchedulerDecision {
        (self.decide)(ctx, trial, result)
    }
}

type AllocationFn = Box<
    dyn FnMut(&SchedulerContext<'_>, &Trial, &TrialResult) -> Option<PlacementGroupFactory>
        + Send,
>;

/// Wraps a base scheduler and resizes trials on the fly.
///
/// After every result the allocation function may propose a new resource
/// request. When it differs from the trial's current one, the trial is paused,
/// its request replaced, and it resumes on the new resources in a later step.
pub struct ResourceChangingScheduler {
    base: Box<dyn TrialScheduler>,
    allocate: AllocationFn,
}

impl ResourceChangingScheduler {
    pub fn new<F>(base: Box<dyn TrialScheduler>, allocate: F) -> Self
    where
        F: FnMut(&SchedulerContext<'_>, &Trial, &TrialResult) -> Option<PlacementGroupFactory>
            + Send
            + 'static,
    {
        Self {
            base,
            allocate: Box::new(allocate),
        }
    }
}

impl TrialScheduler for ResourceChangingScheduler {
    fn name(&self) -> &'static str {
        "resource_changing"
    }

    fn on_trial_add(&mut self, ctx: &mut SchedulerContext<'_>, trial: &Trial) {
        self.base.on_trial_add(ctx, trial);
    }

    fn on_trial_result(
        &mut self,
        ctx: &mut SchedulerContext<'_>,
        trial: &Trial,
        result: &TrialResult,
    ) -> SchedulerDecision {
        let decision = self.base.on_trial_result(ctx, trial, result);
        if decision == SchedulerDecision::Stop {
            return decision;
        }

        match (self.allocate)(ctx, trial, result) {
            Some(resources) if &resources != trial.placement_group_factory() => {
                debug!(
                    trial = %trial,
                    from = %trial.placement_group_factory(),
                    to = %resources,
                    "resizing trial"
                );
                ctx.request_resource_update(trial.trial_id, resources);
                SchedulerDecision::Pause
            }
            _ => decision,
        }
    }

    fn on_trial_complete(
        &mut self,
        ctx: &mut SchedulerContext<'_>,
        trial: &Trial,
        result: Option<&TrialResult>,
    ) {
        self.base.on_trial_complete(ctx, trial, result);
    }

    fn on_trial_error(&mut self, ctx: &mut SchedulerContext<'_>, trial: &Trial) {
        self.base.on_trial_error(ctx, trial);
    }

    fn choose_trials_to_run(&mut self, ctx: &SchedulerContext<'_>) -> Vec<TrialId> {
        self.base.choose_trials_to_run(ctx)
    }
}

/// Built-in schedulers selectable from configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerKind {
    #[default]
    Fifo,
    Priority,
}

impl SchedulerKind {
    pub fn build(self) -> Box<dyn TrialScheduler> {
        match self {
            SchedulerKind::Fifo => Box::new(FifoScheduler::new()),
            SchedulerKind::Priority => Box::new(PriorityScheduler::new()),
        }
    }
}
