use crate::dispatcher::WorkerDispatcher;
use crate::executor::execute_layers;
use crate::graph::TaskGraph;
use crate::integrator::OutputIntegrator;
use crate::plan::parse_worker_tasks;
use crate::profiles::{default_profiles, WorkerProfile};
use crate::progress::{ProgressEvent, ProgressHook, ProgressTracker};
use crate::quality::{InsightSink, QualityGate, RubricConfig};
use crate::retry::{retry_with_backoff, RetryPolicy};
use crate::snapshot::{
    LeaderStepState, ResumeState, SnapshotStore, WorkerStepState, INTEGRATION_STEP_ID,
    LEADER_STEP_ID,
};
use std::collections::HashMap;
use std::sync::Arc;
use taskloom_core::{
    ExecutionContext, JobClient, JobRequest, PriorOutput, RunPhase, TaskloomResult, TokenUsage,
    WorkerKind, WorkerResult, WorkerStatus, WorkerTaskSpec, WorkflowSnapshot, GENERATION_TIMEOUT,
};
use tokio::sync::RwLock;
use tracing::{info, warn};
use uuid::Uuid;

/// Longest leader excerpt injected into worker contexts.
const LEADER_CONTEXT_EXCERPT: usize = 2_000;

/// Run-level knobs for one orchestration pipeline.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Project the run is billed against.
    pub project_id: String,
    /// Leader agent identity; also the resume key.
    pub agent_id: String,
    /// Dispatch independent tasks concurrently per layer. When false, tasks
    /// run one at a time in topological order.
    pub parallel_dispatch: bool,
    /// Run the quality gate over worker and integration output.
    pub quality_enabled: bool,
    /// Total generation attempts per worker inside the quality-retry loop.
    pub max_worker_attempts: u32,
    /// Routing cycles the integrator may spend asking for supplemental work.
    pub max_routing_cycles: u32,
    /// Look for a resumable run before starting fresh.
    pub resume_enabled: bool,
}

impl OrchestratorConfig {
    /// Defaults: parallel, quality-gated, three attempts, two routing
    /// cycles, resume on.
    pub fn new(project_id: impl Into<String>, agent_id: impl Into<String>) -> Self {
        Self {
            project_id: project_id.into(),
            agent_id: agent_id.into(),
            parallel_dispatch: true,
            quality_enabled: true,
            max_worker_attempts: 3,
            max_routing_cycles: 2,
            resume_enabled: true,
        }
    }
}

/// What a human reviewer needs to triage one flagged worker output.
#[derive(Debug, Clone)]
pub struct ReviewDiagnostics {
    /// Task that needs review.
    pub task_id: String,
    /// Worker kind that produced it.
    pub worker: WorkerKind,
    /// Score of the attempt that was kept.
    pub score: f64,
    /// Issues from the last quality verdict.
    pub issues: Vec<String>,
    /// Suggestions from the last quality verdict.
    pub improvement_suggestions: Vec<String>,
    /// Total attempts made.
    pub attempts: u32,
}

/// Final report for one orchestration run.
#[derive(Debug, Clone)]
pub struct RunReport {
    /// The run's id.
    pub run_id: Uuid,
    /// Terminal phase ([`RunPhase::Done`] or [`RunPhase::LeaderFailed`]).
    pub phase: RunPhase,
    /// The integrated deliverable.
    pub output: String,
    /// Worker tasks dispatched, supplemental included.
    pub total_tasks: usize,
    /// Tasks that completed.
    pub completed: usize,
    /// Tasks that failed fatally.
    pub failed: usize,
    /// Tasks flagged for human review.
    pub needs_review: usize,
    /// Triage detail per flagged task.
    pub needs_review_details: Vec<ReviewDiagnostics>,
    /// Tokens spent across the run.
    pub tokens: TokenUsage,
    /// Whether the run resumed from a snapshot.
    pub resumed: bool,
    /// Human-readable checkpoint summary.
    pub summary: String,
}

/// Top-level pipeline: leader planning, layered worker dispatch, quality
/// gating, integration, and snapshot-based resume.
pub struct Orchestrator {
    jobs: Arc<dyn JobClient>,
    snapshots: Arc<dyn SnapshotStore>,
    config: OrchestratorConfig,
    profiles: Vec<WorkerProfile>,
    hook: Option<ProgressHook>,
    insight_sink: Option<Arc<dyn InsightSink>>,
    retry: RetryPolicy,
    integration_rubric: Option<RubricConfig>,
}

impl Orchestrator {
    /// Orchestrator with default worker profiles and retry policy.
    pub fn new(
        jobs: Arc<dyn JobClient>,
        snapshots: Arc<dyn SnapshotStore>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            jobs,
            snapshots,
            config,
            profiles: default_profiles(),
            hook: None,
            insight_sink: None,
            retry: RetryPolicy::default(),
            integration_rubric: None,
        }
    }

    /// Replace the worker profile registry.
    pub fn with_profiles(mut self, profiles: Vec<WorkerProfile>) -> Self {
        self.profiles = profiles;
        self
    }

    /// Attach a progress hook invoked for every run event.
    pub fn with_progress_hook(mut self, hook: ProgressHook) -> Self {
        self.hook = Some(hook);
        self
    }

    /// Attach an insight sink for failed quality evaluations.
    pub fn with_insight_sink(mut self, sink: Arc<dyn InsightSink>) -> Self {
        self.insight_sink = Some(sink);
        self
    }

    /// Override the transient-error retry policy.
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Override the rubric the merged document is gated against.
    pub fn with_integration_rubric(mut self, rubric: RubricConfig) -> Self {
        self.integration_rubric = Some(rubric);
        self
    }

    /// Run the full pipeline for one goal.
    ///
    /// The leader failing to plan aborts the run with
    /// [`RunPhase::LeaderFailed`] and no workers dispatched. Worker failures
    /// are scoped to their task. Snapshot writes are best-effort throughout.
    pub async fn run(&self, goal: &str) -> TaskloomResult<RunReport> {
        let tracker = Arc::new(match &self.hook {
            Some(hook) => ProgressTracker::new().with_hook(hook.clone()),
            None => ProgressTracker::new(),
        });

        let mut gate = QualityGate::new(self.jobs.clone());
        for profile in &self.profiles {
            if let Some(rubric) = &profile.rubric {
                gate = gate.with_rubric(profile.kind.clone(), rubric.clone());
            }
        }
        if let Some(sink) = &self.insight_sink {
            gate = gate.with_insight_sink(sink.clone());
        }
        let gate = Arc::new(gate);

        let dispatcher = WorkerDispatcher::new(self.jobs.clone(), gate.clone(), tracker.clone())
            .with_profiles(self.profiles.clone())
            .with_retry_policy(self.retry.clone());

        let mut integrator = OutputIntegrator::new(self.jobs.clone(), gate.clone())
            .with_max_routing_cycles(self.config.max_routing_cycles)
            .with_retry_policy(self.retry.clone());
        if let Some(rubric) = &self.integration_rubric {
            integrator = integrator.with_rubric(rubric.clone());
        }

        // Resume beats replanning: a usable snapshot skips the leader and
        // every already-completed worker.
        let resume = self.find_resumable_run().await;
        let resumed = resume.is_some();

        let (run_id, leader_output, tasks, mut results) = match resume {
            Some((state, leader_output)) => {
                info!(
                    run_id = %state.run_id,
                    completed = state.completed.len(),
                    "resuming interrupted run"
                );
                let results = completed_results_from(&state);
                (state.run_id, leader_output, state.worker_tasks, results)
            }
            None => {
                let run_id = Uuid::new_v4();
                tracker
                    .emit(ProgressEvent::PhaseChanged {
                        phase: RunPhase::LeaderRunning,
                    })
                    .await;

                let leader_output = match self.run_leader(goal).await {
                    Ok(output) => output,
                    Err(e) => {
                        warn!(error = %e, "leader failed, aborting run");
                        tracker
                            .emit(ProgressEvent::PhaseChanged {
                                phase: RunPhase::LeaderFailed,
                            })
                            .await;
                        return Ok(self.aborted_report(run_id, e.to_string()));
                    }
                };

                let tasks = parse_worker_tasks(&leader_output);
                self.save_snapshot(WorkflowSnapshot::new(
                    run_id,
                    &self.config.project_id,
                    &self.config.agent_id,
                    taskloom_core::StepKind::LeaderCompleted,
                    LEADER_STEP_ID,
                    "leader plan ready",
                    serde_json::to_value(LeaderStepState {
                        output: leader_output.clone(),
                    })?,
                    tasks.clone(),
                ))
                .await;

                (run_id, leader_output, tasks, Vec::new())
            }
        };

        tracker
            .emit(ProgressEvent::PhaseChanged {
                phase: RunPhase::WorkersRunning,
            })
            .await;

        let pending: Vec<WorkerTaskSpec> = tasks
            .iter()
            .filter(|t| !results.iter().any(|r| r.task_id == t.id))
            .cloned()
            .collect();

        let dispatched = self
            .dispatch_workers(run_id, &pending, &results, &leader_output, &dispatcher, &tracker)
            .await;
        results.extend(dispatched);

        tracker
            .emit(ProgressEvent::PhaseChanged {
                phase: RunPhase::Integrating,
            })
            .await;

        let ctx = self.base_context(&leader_output);
        let integration = integrator
            .integrate(
                &ctx,
                &leader_output,
                &results,
                &dispatcher,
                self.config.quality_enabled,
                self.config.max_worker_attempts,
            )
            .await?;
        results.extend(integration.supplemental_results.clone());

        self.save_snapshot(WorkflowSnapshot::new(
            run_id,
            &self.config.project_id,
            &self.config.agent_id,
            taskloom_core::StepKind::IntegrationCompleted,
            INTEGRATION_STEP_ID,
            "deliverable integrated",
            serde_json::json!({ "output": integration.document }),
            vec![],
        ))
        .await;

        tracker
            .emit(ProgressEvent::PhaseChanged {
                phase: RunPhase::ChecklistReady,
            })
            .await;

        let mut tokens = tracker.totals().await.tokens;
        tokens.add(integration.tokens);

        let diagnostics = review_diagnostics(&results);
        let completed = results.iter().filter(|r| r.is_completed()).count();
        let failed = results
            .iter()
            .filter(|r| matches!(r.status, WorkerStatus::Failed { .. }))
            .count();

        let report = RunReport {
            run_id,
            phase: RunPhase::Done,
            summary: checkpoint_summary(
                results.len(),
                completed,
                failed,
                &diagnostics,
                integration.routing_cycles_used,
                resumed,
            ),
            output: integration.document,
            total_tasks: results.len(),
            completed,
            failed,
            needs_review: diagnostics.len(),
            needs_review_details: diagnostics,
            tokens,
            resumed,
        };

        // A finished run must not be offered for resume again.
        if let Err(e) = self.snapshots.invalidate_run(run_id).await {
            warn!(error = %e, "failed to invalidate finished run, continuing");
        }

        tracker
            .emit(ProgressEvent::PhaseChanged {
                phase: RunPhase::Done,
            })
            .await;

        Ok(report)
    }

    async fn find_resumable_run(&self) -> Option<(ResumeState, String)> {
        if !self.config.resume_enabled {
            return None;
        }
        let state = match self
            .snapshots
            .load_completed_workers(&self.config.agent_id)
            .await
        {
            Ok(state) => state?,
            Err(e) => {
                warn!(error = %e, "snapshot lookup failed, starting fresh");
                return None;
            }
        };
        match self.snapshots.leader_output_from_run(state.run_id).await {
            Ok(Some(leader_output)) => Some((state, leader_output)),
            Ok(None) => None,
            Err(e) => {
                warn!(error = %e, "leader snapshot unreadable, starting fresh");
                None
            }
        }
    }

    async fn run_leader(&self, goal: &str) -> TaskloomResult<String> {
        let prompt = format!("Project goal:\n{goal}\n");
        let request = JobRequest::new(&self.config.project_id, &self.config.agent_id, prompt)
            .with_system_prompt(LEADER_PROMPT)
            .with_max_tokens(8192);

        let outcome = retry_with_backoff(&self.retry, || {
            self.jobs.execute(request.clone(), GENERATION_TIMEOUT)
        })
        .await?;
        Ok(outcome.content)
    }

    async fn dispatch_workers(
        &self,
        run_id: Uuid,
        pending: &[WorkerTaskSpec],
        prior_results: &[WorkerResult],
        leader_output: &str,
        dispatcher: &WorkerDispatcher,
        tracker: &Arc<ProgressTracker>,
    ) -> Vec<WorkerResult> {
        if pending.is_empty() {
            return Vec::new();
        }

        let graph = TaskGraph::new(pending.to_vec());
        let base_ctx = self.base_context(leader_output);

        // Outputs visible to downstream tasks, seeded with resumed results.
        let outputs: Arc<RwLock<HashMap<String, PriorOutput>>> = Arc::new(RwLock::new(
            prior_results
                .iter()
                .filter(|r| r.is_completed())
                .map(|r| {
                    (
                        r.task_id.clone(),
                        PriorOutput {
                            worker: r.worker.clone(),
                            task_id: r.task_id.clone(),
                            content: r.output.clone(),
                        },
                    )
                })
                .collect(),
        ));

        let run_one = |spec: WorkerTaskSpec| {
            let outputs = outputs.clone();
            let base_ctx = base_ctx.clone();
            async move {
                let mut ctx = base_ctx;
                {
                    let outputs = outputs.read().await;
                    ctx.prior_outputs = spec
                        .depends_on
                        .iter()
                        .filter_map(|dep| outputs.get(dep).cloned())
                        .collect();
                }

                let result = dispatcher
                    .execute_worker(
                        &ctx,
                        &spec,
                        self.config.quality_enabled,
                        self.config.max_worker_attempts,
                    )
                    .await;

                if result.is_completed() {
                    outputs.write().await.insert(
                        result.task_id.clone(),
                        PriorOutput {
                            worker: result.worker.clone(),
                            task_id: result.task_id.clone(),
                            content: result.output.clone(),
                        },
                    );
                    self.save_snapshot(worker_snapshot(run_id, &self.config, &result)).await;
                }

                Ok(result)
            }
        };

        let outcomes = if self.config.parallel_dispatch {
            // The layer hook is synchronous; forward events to the async
            // tracker through a channel drained by a side task.
            let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
            let forwarder_tracker = tracker.clone();
            let forwarder = tokio::spawn(async move {
                while let Some((index, task_ids)) = rx.recv().await {
                    forwarder_tracker
                        .emit(ProgressEvent::LayerStarted { index, task_ids })
                        .await;
                }
            });
            let outcomes = execute_layers(&graph, run_one, move |index, ids| {
                let _ = tx.send((index, ids.to_vec()));
            })
            .await;
            let _ = forwarder.await;
            outcomes
        } else {
            let mut outcomes = Vec::with_capacity(graph.len());
            for (index, layer) in graph.execution_layers().iter().enumerate() {
                tracker
                    .emit(ProgressEvent::LayerStarted {
                        index,
                        task_ids: layer.clone(),
                    })
                    .await;
                for id in layer {
                    if let Some(spec) = graph.get(id).cloned() {
                        let result = run_one(spec).await;
                        outcomes.push((id.clone(), result));
                    }
                }
            }
            outcomes
        };

        // The dispatcher never errors; flatten to the results themselves.
        outcomes
            .into_iter()
            .filter_map(|(_, outcome)| outcome.ok())
            .collect()
    }

    fn base_context(&self, leader_output: &str) -> ExecutionContext {
        let mut ctx = ExecutionContext::new(&self.config.project_id, &self.config.agent_id);
        let mut end = LEADER_CONTEXT_EXCERPT.min(leader_output.len());
        while end > 0 && !leader_output.is_char_boundary(end) {
            end -= 1;
        }
        ctx.leader_excerpt = leader_output[..end].to_string();
        ctx
    }

    async fn save_snapshot(&self, snapshot: WorkflowSnapshot) {
        if let Err(e) = self.snapshots.save(snapshot).await {
            warn!(error = %e, "snapshot save failed, continuing");
        }
    }

    fn aborted_report(&self, run_id: Uuid, reason: String) -> RunReport {
        RunReport {
            run_id,
            phase: RunPhase::LeaderFailed,
            output: String::new(),
            total_tasks: 0,
            completed: 0,
            failed: 0,
            needs_review: 0,
            needs_review_details: Vec::new(),
            tokens: TokenUsage::default(),
            resumed: false,
            summary: format!("run aborted: leader failed to plan ({reason})"),
        }
    }
}

fn worker_snapshot(
    run_id: Uuid,
    config: &OrchestratorConfig,
    result: &WorkerResult,
) -> WorkflowSnapshot {
    WorkflowSnapshot::new(
        run_id,
        &config.project_id,
        &config.agent_id,
        taskloom_core::StepKind::WorkerCompleted,
        &result.task_id,
        format!("worker {} completed", result.task_id),
        serde_json::to_value(WorkerStepState {
            worker: result.worker.clone(),
            output: result.output.clone(),
            tokens: result.tokens_used,
        })
        .unwrap_or(serde_json::Value::Null),
        vec![],
    )
}

fn completed_results_from(state: &ResumeState) -> Vec<WorkerResult> {
    // Deterministic order: the map comes from a hash-keyed view.
    let mut steps: Vec<_> = state.completed.iter().collect();
    steps.sort_by(|(a, _), (b, _)| a.cmp(b));
    steps
        .into_iter()
        .map(|(task_id, step)| WorkerResult {
            task_id: task_id.clone(),
            worker: step.worker.clone(),
            status: WorkerStatus::Completed,
            output: step.output.clone(),
            verdict: None,
            retries_used: 0,
            tokens_used: step.tokens,
            attempt_history: Vec::new(),
            best_attempt: None,
        })
        .collect()
}

fn review_diagnostics(results: &[WorkerResult]) -> Vec<ReviewDiagnostics> {
    results
        .iter()
        .filter(|r| r.status == WorkerStatus::NeedsHumanReview)
        .map(|r| {
            let best_score = r
                .best_attempt
                .and_then(|i| r.attempt_history.get(i))
                .map_or(0.0, |a| a.score);
            ReviewDiagnostics {
                task_id: r.task_id.clone(),
                worker: r.worker.clone(),
                score: best_score,
                issues: r.verdict.as_ref().map(|v| v.issues.clone()).unwrap_or_default(),
                improvement_suggestions: r
                    .verdict
                    .as_ref()
                    .map(|v| v.improvement_suggestions.clone())
                    .unwrap_or_default(),
                attempts: r.attempt_history.len() as u32,
            }
        })
        .collect()
}

fn checkpoint_summary(
    total: usize,
    completed: usize,
    failed: usize,
    diagnostics: &[ReviewDiagnostics],
    routing_cycles: u32,
    resumed: bool,
) -> String {
    let mut summary = format!(
        "{total} worker task(s): {completed} completed, {failed} failed, {} flagged for review",
        diagnostics.len()
    );
    if routing_cycles > 0 {
        summary.push_str(&format!("; {routing_cycles} routing cycle(s) used"));
    }
    if resumed {
        summary.push_str("; resumed from snapshot");
    }
    for d in diagnostics {
        summary.push_str(&format!(
            "\n- review {} ({}): score {:.2}, {} issue(s)",
            d.task_id,
            d.worker,
            d.score,
            d.issues.len()
        ));
    }
    summary
}

const LEADER_PROMPT: &str = "\
You are the lead agent of a multi-agent content pipeline. Decompose the \
project goal into subtasks for specialized workers (research, design, code, \
media, review).

Reply with your plan as prose, followed by exactly one fenced JSON block:

```json
{\"worker_tasks\": [
  {\"id\": \"t1\", \"worker\": \"research\", \"task\": \"...\", \"depends_on\": []}
]}
```

Give every task a unique id, and list dependencies only on ids within the \
same block. If the goal needs no delegation, emit an empty worker_tasks \
array and produce the deliverable yourself in the prose section.
";
