//! # tw-executor
//!
//! Runs trials. The [`TrialExecutor`] stages resource requests through a
//! [`tw_resources::ResourceManager`], launches trainables on an
//! [`ExecutionBackend`] once their allocation is committed, and pauses, resumes
//! and stops them on the runner's behalf.

pub mod backend;
pub mod executor;
pub mod trainable;

pub use backend::{ActorHandle, ExecutionBackend, ExecutionEvent, LocalBackend};
pub use executor::TrialExecutor;
pub use trainable::{
    IteratorTrainable, Metrics, MockTrainable, TrainOutput, Trainable, TrainableRegistry,
};
