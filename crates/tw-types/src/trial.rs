//! Trials: the schedulable unit of work and its lifecycle.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use uuid::Uuid;

use crate::errors::{TrialError, TwResult};
use crate::resources::{PlacementGroupFactory, ResourceSpec};

/// Metric every result carries; usable in stopping criteria.
pub const TRAINING_ITERATION: &str = "training_iteration";

/// Unique trial identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TrialId(Uuid);

impl TrialId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for TrialId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TrialId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let simple = self.0.simple().to_string();
        write!(f, "{}", &simple[..8])
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TrialStatus {
    Pending,
    Running,
    Paused,
    Terminated,
    Error,
}

impl TrialStatus {
    pub fn is_finished(&self) -> bool {
        matches!(self, TrialStatus::Terminated | TrialStatus::Error)
    }

    pub fn can_transition_to(&self, to: TrialStatus) -> bool {
        use TrialStatus::*;
        matches!(
            (self, to),
            (Pending, Running | Terminated | Error)
                | (Running, Paused | Terminated | Error)
                | (Paused, Running | Terminated | Error)
        )
    }
}

impl fmt::Display for TrialStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TrialStatus::Pending => "PENDING",
            TrialStatus::Running => "RUNNING",
            TrialStatus::Paused => "PAUSED",
            TrialStatus::Terminated => "TERMINATED",
            TrialStatus::Error => "ERROR",
        };
        f.write_str(name)
    }
}

/// One reported result snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialResult {
    pub trial_id: TrialId,
    pub training_iteration: u64,
    pub metrics: HashMap<String, f64>,
    /// Set by the trainable when it has nothing more to report.
    pub done: bool,
    pub timestamp: DateTime<Utc>,
}

impl TrialResult {
    pub fn new(trial_id: TrialId, training_iteration: u64, metrics: HashMap<String, f64>) -> Self {
        Self {
            trial_id,
            training_iteration,
            metrics,
            done: false,
            timestamp: Utc::now(),
        }
    }

    pub fn metric(&self, name: &str) -> Option<f64> {
        if name == TRAINING_ITERATION {
            return Some(self.training_iteration as f64);
        }
        self.metrics.get(name).copied()
    }
}

/// A single trial: one trainable configuration with its own resource request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trial {
    pub trial_id: TrialId,
    pub trainable_name: String,
    pub config: serde_json::Value,
    pub experiment_tag: String,
    status: TrialStatus,
    placement_group_factory: PlacementGroupFactory,
    /// Metric name -> threshold; the trial stops once any threshold is reached.
    pub stopping_criterion: HashMap<String, f64>,
    pub last_result: Option<TrialResult>,
    pub error: Option<String>,
    /// Opaque trainable state saved on pause, restored on resume.
    pub checkpoint: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Trial {
    pub fn new(trainable_name: impl Into<String>, resources: PlacementGroupFactory) -> Self {
        Self {
            trial_id: TrialId::new(),
            trainable_name: trainable_name.into(),
            config: serde_json::Value::Object(Default::default()),
            experiment_tag: String::new(),
            status: TrialStatus::Pending,
            placement_group_factory: resources,
            stopping_criterion: HashMap::new(),
            last_result: None,
            error: None,
            checkpoint: None,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }

    pub fn with_config(mut self, config: serde_json::Value) -> Self {
        self.config = config;
        self
    }

    pub fn with_stopping_criterion(mut self, metric: &str, threshold: f64) -> Self {
        self.stopping_criterion.insert(metric.to_string(), threshold);
        self
    }

    pub fn with_experiment_tag(mut self, tag: impl Into<String>) -> Self {
        self.experiment_tag = tag.into();
        self
    }

    pub fn status(&self) -> TrialStatus {
        self.status
    }

    pub fn is_finished(&self) -> bool {
        self.status.is_finished()
    }

    pub fn placement_group_factory(&self) -> &PlacementGroupFactory {
        &self.placement_group_factory
    }

    /// Move to `to`, rejecting transitions the lifecycle does not allow.
    pub fn set_status(&mut self, to: TrialStatus) -> TwResult<()> {
        if !self.status.can_transition_to(to) {
            return Err(TrialError::InvalidTransition {
                trial: self.trial_id,
                from: self.status,
                to,
            }
            .into());
        }
        match to {
            TrialStatus::Running => self.started_at = Some(Utc::now()),
            TrialStatus::Terminated | TrialStatus::Error => self.finished_at = Some(Utc::now()),
            _ => {}
        }
        self.status = to;
        Ok(())
    }

    pub fn mark_error(&mut self, message: impl Into<String>) -> TwResult<()> {
        self.set_status(TrialStatus::Error)?;
        self.error = Some(message.into());
        Ok(())
    }

    /// Replace the resource request. Only allowed while PENDING or PAUSED.
    pub fn set_placement_group_factory(&mut self, resources: PlacementGroupFactory) -> TwResult<()> {
        match self.status {
            TrialStatus::Pending | TrialStatus::Paused => {
                self.placement_group_factory = resources;
                Ok(())
            }
            status => Err(TrialError::ResizeNotAllowed {
                trial: self.trial_id,
                status,
            }
            .into()),
        }
    }

    pub fn update_resources(&mut self, spec: &ResourceSpec) -> TwResult<()> {
        let resources = spec.to_placement_group_factory()?;
        self.set_placement_group_factory(resources)
    }

    pub fn should_stop(&self, result: &TrialResult) -> bool {
        result.done
            || self
                .stopping_criterion
                .iter()
                .any(|(metric, threshold)| result.metric(metric).is_some_and(|v| v >= *threshold))
    }

    /// Stopping-criterion metrics that `result` does not report.
    pub fn missing_stop_metrics<'a>(&'a self, result: &'a TrialResult) -> impl Iterator<Item = &'a str> {
        self.stopping_criterion
            .keys()
            .map(String::as_str)
            .filter(|metric| result.metric(metric).is_none())
    }
}

impl fmt::Display for Trial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.trainable_name, self.trial_id)
    }
}
