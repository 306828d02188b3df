//! Experiment files: everything the `tw-tune` binary needs to run a search.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::path::Path;
use tracing::info;
use tw_types::{
    validation_error, ClusterConfig, ResourceManagerKind, ResourceSpec, RunnerConfig, TwResult,
};

use crate::scheduler::SchedulerKind;
use crate::search::{Experiment, SearchSpace};

fn default_num_samples() -> usize {
    1
}

fn default_config() -> Value {
    Value::Object(Map::new())
}

/// An experiment definition as read from JSON.
///
/// ```json
/// {
///   "name": "lr_sweep",
///   "trainable": "__fake",
///   "num_samples": 2,
///   "search_space": [{"name": "lr", "type": "grid", "values": [0.1, 0.01]}],
///   "resources_per_trial": {"cpu": 1, "gpu": 0.5},
///   "stop": {"training_iteration": 10},
///   "cluster": {"num_cpus": 4, "num_gpus": 1}
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExperimentConfig {
    pub name: String,
    pub trainable: String,
    #[serde(default = "default_num_samples")]
    pub num_samples: usize,
    #[serde(default = "default_config")]
    pub config: Value,
    #[serde(default)]
    pub search_space: SearchSpace,
    /// Defaults to one CPU per trial.
    #[serde(default)]
    pub resources_per_trial: Option<ResourceSpec>,
    #[serde(default)]
    pub stop: HashMap<String, f64>,
    #[serde(default)]
    pub cluster: ClusterConfig,
    #[serde(default)]
    pub resource_manager: ResourceManagerKind,
    #[serde(default)]
    pub scheduler: SchedulerKind,
    #[serde(default)]
    pub runner: RunnerConfig,
    /// Seed for random search-space sampling.
    #[serde(default)]
    pub seed: Option<u64>,
    /// Give up after this many steps.
    #[serde(default)]
    pub max_steps: Option<u64>,
}

impl ExperimentConfig {
    pub fn from_file(path: impl AsRef<Path>) -> TwResult<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)?;
        let config = Self::from_json(&raw)?;
        info!(path = %path.display(), experiment = %config.name, "experiment loaded");
        Ok(config)
    }

    pub fn from_json(raw: &str) -> TwResult<Self> {
        let config: Self = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> TwResult<()> {
        if self.name.trim().is_empty() {
            return Err(validation_error!("experiment name must not be empty"));
        }
        if self.trainable.trim().is_empty() {
            return Err(validation_error!("experiment '{}' names no trainable", self.name));
        }
        if self.num_samples == 0 {
            return Err(validation_error!("experiment '{}' has num_samples = 0", self.name));
        }
        if !self.config.is_object() {
            return Err(validation_error!("config of experiment '{}' must be a JSON object", self.name));
        }
        if self.runner.max_pending_trials == 0 {
            return Err(validation_error!("runner.max_pending_trials must be at least 1"));
        }
        self.search_space.validate()?;
        self.cluster.total_resources()?;
        self.resources().to_placement_group_factory()?;
        Ok(())
    }

    fn resources(&self) -> ResourceSpec {
        self.resources_per_trial
            .clone()
            .unwrap_or_else(|| ResourceSpec::cpu_gpu(1.0, 0.0))
    }

    /// The experiment handed to the search algorithm.
    pub fn to_experiment(&self) -> TwResult<Experiment> {
        let resources = self.resources().to_placement_group_factory()?;
        let mut experiment = Experiment::new(&self.name, &self.trainable, resources)
            .with_num_samples(self.num_samples)
            .with_config(self.config.clone())
            .with_search_space(self.search_space.clone());
        for (metric, threshold) in &self.stop {
            experiment = experiment.with_stop(metric, *threshold);
        }
        Ok(experiment)
    }
}
