//! Multi-agent orchestration engine for content-generation workflows.
//!
//! A leader agent decomposes a goal into a dependency graph of specialized
//! worker subtasks. The engine schedules the graph in topological layers,
//! dispatches each layer with maximal safe concurrency, quality-gates every
//! worker output with bounded retry and graceful fallback to human review,
//! integrates the results into one document, and snapshots progress so an
//! interrupted run resumes without repeating completed work.
//!
//! # Main types
//!
//! - [`Orchestrator`] — Top-level pipeline: leader → workers → integration.
//! - [`TaskGraph`] — Dependency graph with topological execution layers.
//! - [`WorkerDispatcher`] — Quality-gated retry loop around one worker.
//! - [`QualityGate`] — Rule-based pre-check plus LLM-scored rubric.
//! - [`OutputIntegrator`] — Merge step with bounded conditional routing.
//! - [`SnapshotStore`] — Persistence contract for crash resume.

/// Quality-gated single-worker execution.
pub mod dispatcher;
/// Top-level orchestration pipeline.
pub mod engine;
/// Layer-by-layer concurrent execution.
pub mod executor;
/// Dependency graph and topological layering.
pub mod graph;
/// Output synthesis and conditional routing back to the leader.
pub mod integrator;
/// Leader plan parsing (fenced JSON worker-task blocks).
pub mod plan;
/// Worker profiles: prompts, tiers, and default rubrics.
pub mod profiles;
/// Run progress events and metrics.
pub mod progress;
/// Quality gate: pre-checks, rubric scoring, insight records.
pub mod quality;
/// Transient-error classification and backoff.
pub mod retry;
/// Snapshot persistence and resume state.
pub mod snapshot;

pub use dispatcher::WorkerDispatcher;
pub use engine::{Orchestrator, OrchestratorConfig, ReviewDiagnostics, RunReport};
pub use executor::execute_layers;
pub use graph::TaskGraph;
pub use integrator::{IntegrationOutcome, OutputIntegrator};
pub use plan::parse_worker_tasks;
pub use profiles::{default_profiles, integration_rubric, WorkerProfile};
pub use progress::{ProgressEvent, ProgressHook, ProgressTracker, RunMetrics};
pub use quality::{FileInsightSink, InsightRecord, InsightSink, QualityGate, RubricConfig};
pub use retry::{is_retryable, retry_with_backoff, RetryPolicy};
pub use snapshot::{FileSnapshotStore, MemorySnapshotStore, ResumeState, SnapshotStore};
