//! # tw-tune
//!
//! Trial scheduling for Tunewell. The [`TrialRunner`] pulls trials from a
//! [`SearchAlgorithm`], admits them through a [`tw_executor::TrialExecutor`]
//! and lets a [`TrialScheduler`] decide after every result whether a trial
//! continues, pauses or stops.
//!
//! Every step is synchronous and non-blocking: trials that do not fit yet stay
//! PENDING while their resource requests wait in a bounded backlog.

pub mod callbacks;
pub mod context;
pub mod experiment;
pub mod runner;
pub mod scheduler;
pub mod search;

pub use callbacks::{
    Callback, EventForwarder, RunnerEvent, SharedSnapshot, TrialStatusSnapshot,
    TrialStatusSnapshotTaker,
};
pub use context::{SchedulerContext, SchedulerRequests};
pub use experiment::ExperimentConfig;
pub use runner::{TrialRunner, TrialSummary};
pub use scheduler::{
    FifoScheduler, FnScheduler, PriorityScheduler, ResourceChangingScheduler, SchedulerDecision,
    SchedulerKind, TrialScheduler,
};
pub use search::{
    BasicVariantGenerator, Experiment, ParameterDef, ParameterKind, SearchAlgorithm, SearchSpace,
};
