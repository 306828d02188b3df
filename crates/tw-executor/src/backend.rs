//! Execution substrate seam and its in-process implementation.

use serde_json::{json, Value};
use std::collections::HashMap;
use tracing::{debug, warn};
use tw_resources::Allocation;
use tw_types::{ResourceSet, Trial, TrialError, TrialId, TrialResult, TwResult};

use crate::trainable::{Trainable, TrainableRegistry};

/// Substrate-side handle of a launched trial.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ActorHandle(u64);

/// Something a running trial reported since the last poll.
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionEvent {
    Result(TrialResult),
    Failed(String),
}

/// Launches trials on granted allocations and observes them without blocking.
pub trait ExecutionBackend: Send {
    /// Start the trial's trainable bound to `allocation`, restoring its
    /// checkpoint when it has one.
    fn launch(&mut self, trial: &Trial, allocation: &Allocation) -> TwResult<ActorHandle>;

    /// Next event of a launched trial, `None` when nothing new is available.
    fn poll(&mut self, actor: ActorHandle) -> Option<ExecutionEvent>;

    /// Snapshot of the trial's state, taken before a graceful stop.
    fn save(&mut self, actor: ActorHandle) -> Option<Value>;

    /// Stop the actor. Unknown handles are ignored.
    fn stop(&mut self, actor: ActorHandle);
}

struct LocalActor {
    trial_id: TrialId,
    trainable: Box<dyn Trainable>,
    iteration: u64,
    warmup_polls: u32,
    exhausted: bool,
    resources: ResourceSet,
}

/// Runs trainables in-process, one iteration per poll.
///
/// A freshly launched actor stays silent for `startup_polls` polls, which
/// stands in for actor start-up latency on a real cluster.
pub struct LocalBackend {
    registry: TrainableRegistry,
    startup_polls: u32,
    actors: HashMap<ActorHandle, LocalActor>,
    next_actor: u64,
}

impl LocalBackend {
    pub fn new(registry: TrainableRegistry) -> Self {
        Self {
            registry,
            startup_polls: 1,
            actors: HashMap::new(),
            next_actor: 0,
        }
    }

    pub fn with_startup_polls(mut self, polls: u32) -> Self {
        self.startup_polls = polls;
        self
    }

    pub fn live_actors(&self) -> usize {
        self.actors.len()
    }

    /// Resources the actor was launched with.
    pub fn bound_resources(&self, actor: ActorHandle) -> Option<&ResourceSet> {
        self.actors.get(&actor).map(|a| &a.resources)
    }
}

impl ExecutionBackend for LocalBackend {
    fn launch(&mut self, trial: &Trial, allocation: &Allocation) -> TwResult<ActorHandle> {
        let mut trainable = self.registry.create(&trial.trainable_name, &trial.config)?;
        let mut iteration = 0;

        if let Some(checkpoint) = &trial.checkpoint {
            iteration = checkpoint
                .get("training_iteration")
                .and_then(Value::as_u64)
                .unwrap_or(0);
            if let Some(state) = checkpoint.get("state").filter(|s| !s.is_null()) {
                trainable
                    .restore(state)
                    .map_err(|message| TrialError::ExecutionFailed {
                        trial: trial.trial_id,
                        message: format!("restore failed: {message}"),
                    })?;
            }
        }

        let handle = ActorHandle(self.next_actor);
        self.next_actor += 1;
        debug!(trial = %trial, actor = handle.0, iteration, "launching local actor");
        self.actors.insert(
            handle,
            LocalActor {
                trial_id: trial.trial_id,
                trainable,
                iteration,
                warmup_polls: self.startup_polls,
                exhausted: false,
                resources: allocation.resources(),
            },
        );
        Ok(handle)
    }

    fn poll(&mut self, actor: ActorHandle) -> Option<ExecutionEvent> {
        let actor = self.actors.get_mut(&actor)?;
        if actor.exhausted {
            return None;
        }
        if actor.warmup_polls > 0 {
            actor.warmup_polls -= 1;
            return None;
        }

        match actor.trainable.train() {
            Ok(output) => {
                actor.iteration += 1;
                actor.exhausted = output.done;
                let mut result = TrialResult::new(actor.trial_id, actor.iteration, output.metrics);
                result.done = output.done;
                Some(ExecutionEvent::Result(result))
            }
            Err(message) => {
                warn!(trial = %actor.trial_id, %message, "trainable failed");
                actor.exhausted = true;
                Some(ExecutionEvent::Failed(message))
            }
        }
    }

    fn save(&mut self, actor: ActorHandle) -> Option<Value> {
        let actor = self.actors.get_mut(&actor)?;
        let state = actor.trainable.save();
        Some(json!({
            "training_iteration": actor.iteration,
            "state": state,
        }))
    }

    fn stop(&mut self, actor: ActorHandle) {
        if let Some(mut actor) = self.actors.remove(&actor) {
            actor.trainable.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tw_resources::{FixedResourceManager, ResourceManager};
    use tw_types::{PlacementGroupFactory, TrialStatus, CPU};

    fn allocate(manager: &mut FixedResourceManager, trial: &Trial) -> Allocation {
        let id = manager.request(trial.placement_group_factory()).unwrap();
        manager.commit(id).unwrap()
    }

    fn setup() -> (LocalBackend, FixedResourceManager, Trial) {
        let total = ResourceSet::from_f64_pairs([(CPU, 2.0)]).unwrap();
        let resources = PlacementGroupFactory::from_bundles([vec![(CPU, 1.0)]]).unwrap();
        (
            LocalBackend::new(TrainableRegistry::with_builtins()),
            FixedResourceManager::new(total),
            Trial::new("__fake", resources),
        )
    }

    fn expect_result(event: Option<ExecutionEvent>) -> TrialResult {
        match event {
            Some(ExecutionEvent::Result(result)) => result,
            other => panic!("expected a result, got {other:?}"),
        }
    }

    #[test]
    fn first_poll_is_startup() {
        let (mut backend, mut manager, trial) = setup();
        let allocation = allocate(&mut manager, &trial);
        let actor = backend.launch(&trial, &allocation).unwrap();
        assert_eq!(backend.bound_resources(actor), Some(&allocation.resources()));

        assert!(backend.poll(actor).is_none());
        assert_eq!(expect_result(backend.poll(actor)).training_iteration, 1);
        assert_eq!(expect_result(backend.poll(actor)).training_iteration, 2);
    }

    #[test]
    fn relaunch_from_checkpoint_continues_iterations() {
        let (backend, mut manager, mut trial) = setup();
        let mut backend = backend.with_startup_polls(0);
        let allocation = allocate(&mut manager, &trial);
        let actor = backend.launch(&trial, &allocation).unwrap();
        expect_result(backend.poll(actor));
        expect_result(backend.poll(actor));

        trial.checkpoint = backend.save(actor);
        backend.stop(actor);
        assert_eq!(backend.live_actors(), 0);
        assert!(backend.poll(actor).is_none());

        let actor = backend.launch(&trial, &allocation).unwrap();
        assert_eq!(expect_result(backend.poll(actor)).training_iteration, 3);
    }

    #[test]
    fn failure_is_reported_once() {
        let (backend, mut manager, trial) = setup();
        let mut backend = backend.with_startup_polls(0);
        let trial = trial.with_config(json!({"fail_at": 1}));
        let allocation = allocate(&mut manager, &trial);
        let actor = backend.launch(&trial, &allocation).unwrap();

        assert!(matches!(backend.poll(actor), Some(ExecutionEvent::Failed(_))));
        assert!(backend.poll(actor).is_none());
        assert_eq!(trial.status(), TrialStatus::Pending);
    }

    #[test]
    fn unknown_trainable_fails_launch() {
        let (mut backend, mut manager, _) = setup();
        let resources = PlacementGroupFactory::from_bundles([vec![(CPU, 1.0)]]).unwrap();
        let trial = Trial::new("does_not_exist", resources);
        let allocation = allocate(&mut manager, &trial);
        assert!(backend.launch(&trial, &allocation).is_err());
        assert_eq!(backend.live_actors(), 0);
    }
}
