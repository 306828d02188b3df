//! Trainables: the user code a trial runs, one result per `train` call.

use serde_json::{json, Value};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tw_types::{TrialError, TwResult};

pub type Metrics = HashMap<String, f64>;

/// Output of a single training iteration.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrainOutput {
    pub metrics: Metrics,
    /// No further results will follow.
    pub done: bool,
}

impl TrainOutput {
    pub fn new(metrics: Metrics) -> Self {
        Self {
            metrics,
            done: false,
        }
    }

    pub fn finished(metrics: Metrics) -> Self {
        Self {
            metrics,
            done: true,
        }
    }
}

/// User code run by a trial.
///
/// Results are produced lazily, one per [`Trainable::train`] call. A
/// trainable is only ever restarted through pause and resume: the executor
/// saves its state on pause and restores it into a fresh instance on resume.
pub trait Trainable: Send {
    fn train(&mut self) -> Result<TrainOutput, String>;

    fn save(&mut self) -> Option<Value> {
        None
    }

    fn restore(&mut self, _state: &Value) -> Result<(), String> {
        Ok(())
    }

    fn stop(&mut self) {}
}

type TrainableFactory = Arc<dyn Fn(&Value) -> Box<dyn Trainable> + Send + Sync>;

/// Named trainable factories.
#[derive(Clone, Default)]
pub struct TrainableRegistry {
    factories: HashMap<String, TrainableFactory>,
}

impl fmt::Debug for TrainableRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&String> = self.factories.keys().collect();
        names.sort();
        f.debug_struct("TrainableRegistry").field("names", &names).finish()
    }
}

impl TrainableRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with the `__fake` mock trainable.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(MockTrainable::NAME, |config| {
            Box::new(MockTrainable::from_config(config)) as Box<dyn Trainable>
        });
        registry
    }

    pub fn register<F>(&mut self, name: &str, factory: F)
    where
        F: Fn(&Value) -> Box<dyn Trainable> + Send + Sync + 'static,
    {
        self.factories.insert(name.to_string(), Arc::new(factory));
    }

    /// Register a function trainable: `f(config)` yields one metrics map per
    /// iteration, like a generator.
    pub fn register_fn<F, I>(&mut self, name: &str, f: F)
    where
        F: Fn(&Value) -> I + Send + Sync + 'static,
        I: IntoIterator<Item = Metrics>,
        I::IntoIter: Send + 'static,
    {
        self.register(name, move |config| {
            Box::new(IteratorTrainable::new(f(config).into_iter())) as Box<dyn Trainable>
        });
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    pub fn create(&self, name: &str, config: &Value) -> TwResult<Box<dyn Trainable>> {
        let factory = self
            .factories
            .get(name)
            .ok_or_else(|| TrialError::UnknownTrainable {
                name: name.to_string(),
            })?;
        Ok(factory(config))
    }
}

/// Mock trainable reporting a steadily increasing reward.
///
/// Config keys: `fail_at` (iteration that returns an error), `iterations`
/// (marks the result at that iteration as done).
#[derive(Debug, Clone, Default)]
pub struct MockTrainable {
    iteration: u64,
    fail_at: Option<u64>,
    iterations: Option<u64>,
}

impl MockTrainable {
    pub const NAME: &'static str = "__fake";

    pub fn from_config(config: &Value) -> Self {
        Self {
            iteration: 0,
            fail_at: config.get("fail_at").and_then(Value::as_u64),
            iterations: config.get("iterations").and_then(Value::as_u64),
        }
    }
}

impl Trainable for MockTrainable {
    fn train(&mut self) -> Result<TrainOutput, String> {
        self.iteration += 1;
        if self.fail_at == Some(self.iteration) {
            return Err(format!("mock failure at iteration {}", self.iteration));
        }
        let mut metrics = Metrics::new();
        metrics.insert("episode_reward_mean".to_string(), self.iteration as f64 * 0.1);
        let done = self.iterations.is_some_and(|n| self.iteration >= n);
        Ok(TrainOutput { metrics, done })
    }

    fn save(&mut self) -> Option<Value> {
        Some(json!({ "iteration": self.iteration }))
    }

    fn restore(&mut self, state: &Value) -> Result<(), String> {
        self.iteration = state
            .get("iteration")
            .and_then(Value::as_u64)
            .ok_or_else(|| format!("mock checkpoint has no iteration: {state}"))?;
        Ok(())
    }
}

/// Adapts an iterator of metrics into a trainable; exhaustion is reported as
/// a final `done` result.
pub struct IteratorTrainable {
    results: Box<dyn Iterator<Item = Metrics> + Send>,
    consumed: u64,
}

impl IteratorTrainable {
    pub fn new(results: impl Iterator<Item = Metrics> + Send + 'static) -> Self {
        Self {
            results: Box::new(results),
            consumed: 0,
        }
    }
}

impl Trainable for IteratorTrainable {
    fn train(&mut self) -> Result<TrainOutput, String> {
        match self.results.next() {
            Some(metrics) => {
                self.consumed += 1;
                Ok(TrainOutput::new(metrics))
            }
            None => Ok(TrainOutput::finished(Metrics::new())),
        }
    }

    fn save(&mut self) -> Option<Value> {
        Some(json!({ "consumed": self.consumed }))
    }

    /// Replays the iterator up to the saved position.
    fn restore(&mut self, state: &Value) -> Result<(), String> {
        let consumed = state.get("consumed").and_then(Value::as_u64).unwrap_or(0);
        for _ in 0..consumed {
            if self.results.next().is_none() {
                return Err(format!("checkpoint is past the end of the results ({consumed})"));
            }
        }
        self.consumed = consumed;
        Ok(())
    }
}
