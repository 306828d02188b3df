//! Cluster and runner configuration.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::errors::TwResult;
use crate::resources::{ResourceSet, CPU, GPU};
use crate::config_error;

/// Environment variable overriding [`RunnerConfig::max_pending_trials`].
pub const MAX_PENDING_TRIALS_ENV: &str = "TUNE_MAX_PENDING_TRIALS_PG";

/// Explicit capacity view of the cluster, injected into resource managers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterConfig {
    pub num_cpus: f64,
    #[serde(default)]
    pub num_gpus: f64,
    /// Custom resources (e.g. `{"a": 2}`).
    #[serde(default)]
    pub resources: HashMap<String, f64>,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            num_cpus: 4.0,
            num_gpus: 0.0,
            resources: HashMap::new(),
        }
    }
}

impl ClusterConfig {
    pub fn new(num_cpus: f64, num_gpus: f64) -> Self {
        Self {
            num_cpus,
            num_gpus,
            resources: HashMap::new(),
        }
    }

    pub fn with_resource(mut self, name: &str, amount: f64) -> Self {
        self.resources.insert(name.to_string(), amount);
        self
    }

    pub fn total_resources(&self) -> TwResult<ResourceSet> {
        let mut total = ResourceSet::from_f64_pairs([(CPU, self.num_cpus), (GPU, self.num_gpus)])?;
        total.add(&ResourceSet::from_f64_pairs(
            self.resources.iter().map(|(name, amount)| (name.as_str(), *amount)),
        )?);
        Ok(total)
    }
}

/// Which resource-manager strategy backs trial admission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceManagerKind {
    /// Reserve bundles through the substrate's grouped-placement primitive.
    #[default]
    PlacementGroup,
    /// Account resources in-process against a fixed capacity table.
    Fixed,
}

/// Tunables for a trial runner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    /// Upper bound on staged, uncommitted resource requests.
    pub max_pending_trials: usize,
    /// Polls a grouped reservation takes to become ready once placed.
    pub placement_delay_steps: u32,
    /// Polls a freshly launched trial takes before it reports results.
    pub startup_polls: u32,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            max_pending_trials: 1,
            placement_delay_steps: 0,
            startup_polls: 1,
        }
    }
}

impl RunnerConfig {
    pub fn with_max_pending_trials(mut self, n: usize) -> Self {
        self.max_pending_trials = n;
        self
    }

    pub fn with_placement_delay(mut self, steps: u32) -> Self {
        self.placement_delay_steps = steps;
        self
    }

    pub fn with_startup_polls(mut self, polls: u32) -> Self {
        self.startup_polls = polls;
        self
    }

    /// Defaults, with `TUNE_MAX_PENDING_TRIALS_PG` applied when set.
    pub fn from_env() -> TwResult<Self> {
        Self::default().apply_env()
    }

    /// Apply `TUNE_MAX_PENDING_TRIALS_PG` on top of this configuration.
    pub fn apply_env(self) -> TwResult<Self> {
        match std::env::var(MAX_PENDING_TRIALS_ENV) {
            Ok(value) => self.with_pending_override(&value),
            Err(_) => Ok(self),
        }
    }

    fn with_pending_override(self, value: &str) -> TwResult<Self> {
        let n: usize = value
            .trim()
            .parse()
            .map_err(|_| config_error!("{MAX_PENDING_TRIALS_ENV} must be a positive integer, got {value:?}"))?;
        if n == 0 {
            return Err(config_error!("{MAX_PENDING_TRIALS_ENV} must be at least 1"));
        }
        Ok(self.with_max_pending_trials(n))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ResourceAmount;

    #[test]
    fn cluster_total_includes_custom_resources() {
        let cluster = ClusterConfig::new(4.0, 2.0).with_resource("a", 2.0);
        let total = cluster.total_resources().unwrap();
        assert_eq!(total.get(CPU), ResourceAmount::new_units(4));
        assert_eq!(total.get(GPU), ResourceAmount::new_units(2));
        assert_eq!(total.get("a"), ResourceAmount::new_units(2));
    }

    #[test]
    fn cluster_config_from_json() {
        let cluster: ClusterConfig =
            serde_json::from_str(r#"{"num_cpus": 2, "resources": {"tpu": 1}}"#).unwrap();
        assert_eq!(cluster.num_gpus, 0.0);
        assert_eq!(cluster.resources.get("tpu"), Some(&1.0));
    }

    #[test]
    fn resource_manager_kind_names() {
        let kind: ResourceManagerKind = serde_json::from_str("\"fixed\"").unwrap();
        assert_eq!(kind, ResourceManagerKind::Fixed);
        assert_eq!(ResourceManagerKind::default(), ResourceManagerKind::PlacementGroup);
    }

    #[test]
    fn pending_override_parsing() {
        let config = RunnerConfig::default().with_pending_override("8").unwrap();
        assert_eq!(config.max_pending_trials, 8);
        assert!(RunnerConfig::default().with_pending_override("0").is_err());
        assert!(RunnerConfig::default().with_pending_override("many").is_err());
    }

    #[test]
    fn runner_config_fields_default() {
        let config: RunnerConfig = serde_json::from_str(r#"{"startup_polls": 0}"#).unwrap();
        assert_eq!(config.max_pending_trials, 1);
        assert_eq!(config.startup_polls, 0);
    }
}
