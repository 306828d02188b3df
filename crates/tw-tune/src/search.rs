//! Search spaces and search algorithms producing new trials.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{HashMap, VecDeque};
use tracing::debug;
use tw_types::{validation_error, PlacementGroupFactory, Trial, TwResult};

/// A single parameter dimension in the search space.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterDef {
    pub name: String,
    #[serde(flatten)]
    pub kind: ParameterKind,
}

/// Describes how a parameter is sampled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ParameterKind {
    /// Continuous uniform range [low, high].
    FloatRange { low: f64, high: f64 },
    /// Integer range [low, high] inclusive.
    IntRange { low: i64, high: i64 },
    /// Log-uniform range (sampled in log-space then exponentiated).
    LogUniform { low: f64, high: f64 },
    /// One of the values, drawn at random.
    Choice { values: Vec<Value> },
    /// Every value, each in its own variant.
    Grid { values: Vec<Value> },
}

/// The full search space: an ordered list of parameter definitions.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SearchSpace {
    pub parameters: Vec<ParameterDef>,
}

impl SearchSpace {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(mut self, name: impl Into<String>, kind: ParameterKind) -> Self {
        self.parameters.push(ParameterDef {
            name: name.into(),
            kind,
        });
        self
    }

    pub fn add_float(self, name: impl Into<String>, low: f64, high: f64) -> Self {
        self.push(name, ParameterKind::FloatRange { low, high })
    }

    pub fn add_int(self, name: impl Into<String>, low: i64, high: i64) -> Self {
        self.push(name, ParameterKind::IntRange { low, high })
    }

    pub fn add_log_uniform(self, name: impl Into<String>, low: f64, high: f64) -> Self {
        self.push(name, ParameterKind::LogUniform { low, high })
    }

    pub fn add_choice(self, name: impl Into<String>, values: Vec<Value>) -> Self {
        self.push(name, ParameterKind::Choice { values })
    }

    pub fn add_grid(self, name: impl Into<String>, values: Vec<Value>) -> Self {
        self.push(name, ParameterKind::Grid { values })
    }

    /// Float bounds must be finite with a finite span so sampling cannot fail.
    pub fn validate(&self) -> TwResult<()> {
        for param in &self.parameters {
            let valid = match &param.kind {
                ParameterKind::FloatRange { low, high } => {
                    (high - low).is_finite() && low <= high
                }
                ParameterKind::IntRange { low, high } => low <= high,
                ParameterKind::LogUniform { low, high } => {
                    *low > 0.0 && high.is_finite() && low <= high
                }
                ParameterKind::Choice { values } | ParameterKind::Grid { values } => {
                    !values.is_empty()
                }
            };
            if !valid {
                return Err(validation_error!(
                    "invalid search range for parameter '{}': {:?}",
                    param.name,
                    param.kind
                ));
            }
        }
        Ok(())
    }

    /// Number of grid points (1 when the space has no grid axes).
    pub fn grid_size(&self) -> usize {
        self.parameters
            .iter()
            .map(|param| match &param.kind {
                ParameterKind::Grid { values } => values.len(),
                _ => 1,
            })
            .product()
    }

    /// Cartesian product of the grid axes, in definition order.
    pub fn grid_combinations(&self) -> Vec<Vec<(String, Value)>> {
        let mut result: Vec<Vec<(String, Value)>> = vec![Vec::new()];
        for param in &self.parameters {
            let ParameterKind::Grid { values } = &param.kind else {
                continue;
            };
            let mut next = Vec::with_capacity(result.len() * values.len());
            for existing in &result {
                for value in values {
                    let mut combo = existing.clone();
                    combo.push((param.name.clone(), value.clone()));
                    next.push(combo);
                }
            }
            result = next;
        }
        result
    }

    /// Draw every non-grid parameter once.
    pub fn sample<R: Rng>(&self, rng: &mut R) -> Vec<(String, Value)> {
        self.parameters
            .iter()
            .filter_map(|param| {
                let value = match &param.kind {
                    ParameterKind::FloatRange { low, high } => {
                        Value::from(rng.random_range(*low..=*high))
                    }
                    ParameterKind::IntRange { low, high } => {
                        Value::from(rng.random_range(*low..=*high))
                    }
                    ParameterKind::LogUniform { low, high } => {
                        let log_val: f64 = rng.random_range(low.ln()..=high.ln());
                        Value::from(log_val.exp())
                    }
                    ParameterKind::Choice { values } => {
                        values[rng.random_range(0..values.len())].clone()
                    }
                    ParameterKind::Grid { .. } => return None,
                };
                Some((param.name.clone(), value))
            })
            .collect()
    }
}

/// One experiment to expand into trials.
#[derive(Debug, Clone, PartialEq)]
pub struct Experiment {
    pub name: String,
    pub trainable: String,
    /// Repetitions of the whole grid.
    pub num_samples: usize,
    /// Base config every variant starts from.
    pub config: Value,
    pub search_space: SearchSpace,
    pub resources: PlacementGroupFactory,
    pub stop: HashMap<String, f64>,
}

impl Experiment {
    pub fn new(
        name: impl Into<String>,
        trainable: impl Into<String>,
        resources: PlacementGroupFactory,
    ) -> Self {
        Self {
            name: name.into(),
            trainable: trainable.into(),
            num_samples: 1,
            config: Value::Object(Map::new()),
            search_space: SearchSpace::new(),
            resources,
            stop: HashMap::new(),
        }
    }

    pub fn with_num_samples(mut self, n: usize) -> Self {
        self.num_samples = n;
        self
    }

    pub fn with_config(mut self, config: Value) -> Self {
        self.config = config;
        self
    }

    pub fn with_search_space(mut self, space: SearchSpace) -> Self {
        self.search_space = space;
        self
    }

    pub fn with_stop(mut self, metric: &str, threshold: f64) -> Self {
        self.stop.insert(metric.to_string(), threshold);
        self
    }
}

/// Source of new trials for the runner.
pub trait SearchAlgorithm: Send {
    /// The next trial, or `None` when nothing is available right now.
    fn next_trial(&mut self) -> TwResult<Option<Trial>>;

    /// No further trials will ever be produced.
    fn is_finished(&self) -> bool;

    fn on_trial_complete(&mut self, _trial: &Trial) {}
}

struct VariantCursor {
    experiment: Experiment,
    grid: Vec<Vec<(String, Value)>>,
    next: usize,
    total: usize,
}

/// Expands experiments lazily: grid axes form a Cartesian product, repeated
/// `num_samples` times, with random parameters drawn per trial.
pub struct BasicVariantGenerator {
    queue: VecDeque<VariantCursor>,
    rng: StdRng,
    generated: usize,
}

impl Default for BasicVariantGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl BasicVariantGenerator {
    pub fn new() -> Self {
        Self::with_seed(rand::random())
    }

    pub fn with_seed(seed: u64) -> Self {
        Self {
            queue: VecDeque::new(),
            rng: StdRng::seed_from_u64(seed),
            generated: 0,
        }
    }

    pub fn add_experiment(&mut self, experiment: Experiment) -> TwResult<()> {
        experiment.search_space.validate()?;
        if !experiment.config.is_object() {
            return Err(validation_error!(
                "config of experiment '{}' must be a JSON object",
                experiment.name
            ));
        }

        let grid = experiment.search_space.grid_combinations();
        let total = grid.len() * experiment.num_samples;
        debug!(experiment = %experiment.name, variants = total, "experiment added");
        if total > 0 {
            self.queue.push_back(VariantCursor {
                experiment,
                grid,
                next: 0,
                total,
            });
        }
        Ok(())
    }

    /// Trials not yet generated.
    pub fn remaining(&self) -> usize {
        self.queue.iter().map(|c| c.total - c.next).sum()
    }

    fn variant_tag(index: usize, params: &[(String, Value)]) -> String {
        let vars: Vec<String> = params
            .iter()
            .map(|(name, value)| match value {
                Value::String(s) => format!("{name}={s}"),
                other => format!("{name}={other}"),
            })
            .collect();
        if vars.is_empty() {
            index.to_string()
        } else {
            format!("{index}_{}", vars.join(","))
        }
    }
}

impl SearchAlgorithm for BasicVariantGenerator {
    fn next_trial(&mut self) -> TwResult<Option<Trial>> {
        let Some(cursor) = self.queue.front_mut() else {
            return Ok(None);
        };

        let mut params = cursor.grid[cursor.next % cursor.grid.len()].clone();
        params.extend(cursor.experiment.search_space.sample(&mut self.rng));
        cursor.next += 1;

        let mut config = cursor.experiment.config.clone();
        if let Value::Object(map) = &mut config {
            for (name, value) in &params {
                map.insert(name.clone(), value.clone());
            }
        }

        let experiment = &cursor.experiment;
        let mut trial = Trial::new(experiment.trainable.clone(), experiment.resources.clone())
            .with_config(config)
            .with_experiment_tag(Self::variant_tag(self.generated, &params));
        trial.stopping_criterion = experiment.stop.clone();

        if cursor.next >= cursor.total {
            self.queue.pop_front();
        }
        self.generated += 1;
        Ok(Some(trial))
    }

    fn is_finished(&self) -> bool {
        self.queue.is_empty()
    }
}
