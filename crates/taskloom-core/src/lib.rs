//! Shared foundation for the Taskloom multi-agent orchestration engine.
//!
//! This crate defines the data model exchanged between the leader agent,
//! its specialized workers, and the orchestration pipeline, along with the
//! error taxonomy and the contract to the external LLM job queue.
//!
//! # Main types
//!
//! - [`WorkerKind`] — Closed set of specialized worker agents.
//! - [`WorkerTaskSpec`] — One subtask emitted by the leader's plan.
//! - [`WorkerResult`] — Terminal outcome of one dispatched worker.
//! - [`QualityVerdict`] — Structured pass/fail decision from the quality gate.
//! - [`WorkflowSnapshot`] — Persisted progress marker used for crash resume.
//! - [`JobClient`] — Async RPC contract to the LLM job queue.

/// Error taxonomy and result alias.
pub mod error;
/// Contract to the external LLM job queue.
pub mod jobs;
/// Shared orchestration types (task specs, results, verdicts, snapshots).
pub mod types;

pub use error::{TaskloomError, TaskloomResult};
pub use jobs::{
    JobClient, JobId, JobOutcome, JobRequest, ModelTier, GENERATION_TIMEOUT, QUALITY_TIMEOUT,
};
pub use types::{
    AttemptRecord, ExecutionContext, PriorOutput, QualityVerdict, RetryFeedback, RunPhase,
    SnapshotStatus, StepKind, TokenUsage, WorkerKind, WorkerResult, WorkerStatus, WorkerTaskSpec,
    WorkflowSnapshot,
};
