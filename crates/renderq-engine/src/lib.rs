#![forbid(unsafe_code)]
#![deny(unreachable_pub)]

//! Durable, bounded-concurrency task orchestration for a remote image and
//! video generation backend.
//!
//! Submitters enqueue tasks; a dispatcher hands them to workers under a
//! concurrency cap; workers template a workflow, submit it to the backend
//! and poll for artifacts; every state transition is snapshotted into a
//! per-day history file; a supervisor retries failures, kills stuck runs,
//! reconciles with the backend and emails on terminal failure.

pub mod backend;
mod engine;
pub mod executor;
pub mod notifier;
pub mod scheduler;
pub mod store;
mod supervisor;
pub mod task;
pub mod workflow;

pub use engine::{start, start_with, EnqueueError, EnqueueReceipt, Orchestrator};
pub use scheduler::QueueStatus;
pub use task::{Task, TaskId, TaskKind, TaskState};
