//! # Task definitions and runtime state.

mod definition;
mod task;

pub use definition::{BoxJobFuture, Job, JobFn, JobRef, TaskDefinition, TaskDefinitionBuilder};
pub use task::{Task, TaskSnapshot, TaskState};
