use chrono::{DateTime, Utc};
use serde::de::Deserializer;
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Kind of specialized worker agent the leader can delegate to.
///
/// The set is closed and statically known; anything else the leader emits
/// lands in [`WorkerKind::Unknown`] and is handled as a normal match arm
/// (the task fails, the run continues).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum WorkerKind {
    /// Gathers background material and source references.
    Research,
    /// Produces design documents and structural outlines.
    Design,
    /// Generates code artifacts.
    Code,
    /// Produces media asset descriptions and briefs.
    Media,
    /// Reviews and critiques other workers' output.
    Review,
    /// A worker type string outside the known set, preserved verbatim.
    Unknown(String),
}

impl WorkerKind {
    /// Parse a worker type string. Never fails; unrecognized strings become
    /// [`WorkerKind::Unknown`].
    pub fn parse(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "research" => WorkerKind::Research,
            "design" => WorkerKind::Design,
            "code" => WorkerKind::Code,
            "media" => WorkerKind::Media,
            "review" => WorkerKind::Review,
            _ => WorkerKind::Unknown(s.trim().to_string()),
        }
    }

    /// Whether this kind belongs to the statically known set.
    pub fn is_known(&self) -> bool {
        !matches!(self, WorkerKind::Unknown(_))
    }

    /// Canonical string form (the verbatim input for unknown kinds).
    pub fn as_str(&self) -> &str {
        match self {
            WorkerKind::Research => "research",
            WorkerKind::Design => "design",
            WorkerKind::Code => "code",
            WorkerKind::Media => "media",
            WorkerKind::Review => "review",
            WorkerKind::Unknown(raw) => raw,
        }
    }

    /// All known kinds, in dispatch-registry order.
    pub fn known() -> [WorkerKind; 5] {
        [
            WorkerKind::Research,
            WorkerKind::Design,
            WorkerKind::Code,
            WorkerKind::Media,
            WorkerKind::Review,
        ]
    }
}

impl std::fmt::Display for WorkerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl Serialize for WorkerKind {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for WorkerKind {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(WorkerKind::parse(&raw))
    }
}

/// One subtask from the leader's plan. Immutable once parsed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerTaskSpec {
    /// Unique id within the batch.
    pub id: String,
    /// Worker type assigned by the leader.
    pub worker: WorkerKind,
    /// Task description handed to the worker.
    pub task: String,
    /// Ids of tasks in the same batch that must complete first.
    #[serde(default)]
    pub depends_on: Vec<String>,
}

/// Output from a previously completed worker, carried into later contexts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriorOutput {
    /// Who produced the output.
    pub worker: WorkerKind,
    /// Task id of the producing subtask.
    pub task_id: String,
    /// The produced text (possibly truncated for prompt budget).
    pub content: String,
}

/// Quality-gate feedback injected into a retry attempt.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RetryFeedback {
    /// Issues the previous attempt was flagged for.
    pub issues: Vec<String>,
    /// Rubric criteria the previous attempt failed.
    pub failed_criteria: Vec<String>,
    /// Concrete suggestions for the next attempt.
    pub improvement_suggestions: Vec<String>,
}

/// Isolated per-worker execution context. Created fresh for every worker
/// invocation; never shared between concurrently running workers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionContext {
    /// Project the run belongs to.
    pub project_id: String,
    /// Agent identity of the leader driving the run.
    pub agent_id: String,
    /// Outputs accumulated from earlier workers.
    pub prior_outputs: Vec<PriorOutput>,
    /// Free-form per-project configuration.
    pub config: serde_json::Value,
    /// Task text assigned to this worker.
    pub task: String,
    /// Filtered excerpt of the leader's output.
    pub leader_excerpt: String,
    /// Feedback from a failed quality verdict, present only on retries.
    pub retry_feedback: Option<RetryFeedback>,
}

impl ExecutionContext {
    /// Create a context with empty accumulated state.
    pub fn new(project_id: impl Into<String>, agent_id: impl Into<String>) -> Self {
        Self {
            project_id: project_id.into(),
            agent_id: agent_id.into(),
            prior_outputs: Vec::new(),
            config: serde_json::Value::Null,
            task: String::new(),
            leader_excerpt: String::new(),
            retry_feedback: None,
        }
    }

    /// Clone this context for a specific task, dropping any retry feedback.
    pub fn for_task(&self, task: impl Into<String>) -> Self {
        let mut ctx = self.clone();
        ctx.task = task.into();
        ctx.retry_feedback = None;
        ctx
    }
}

/// One attempt inside a worker's quality-retry loop. Append-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttemptRecord {
    /// Zero-based attempt index.
    pub attempt: u32,
    /// Quality score recorded for the attempt (0.0 when execution failed).
    pub score: f64,
    /// Raw output of the attempt (empty when execution failed).
    pub output: String,
    /// Execution error, if the attempt never produced output.
    pub error: Option<String>,
}

/// Terminal status of a dispatched worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    /// Output passed the quality gate (or quality checking was disabled).
    Completed,
    /// Execution failed fatally; scoped to this worker only.
    Failed {
        /// Why the worker failed.
        reason: String,
    },
    /// A quality verdict failed but retries remain. Transient.
    NeedsRetry,
    /// Retries exhausted; the best attempt is flagged for a human.
    NeedsHumanReview,
}

/// Token counts for one or more LLM calls.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    /// Prompt-side tokens.
    pub input: u64,
    /// Completion-side tokens.
    pub output: u64,
}

impl TokenUsage {
    /// Accumulate another usage record, saturating on overflow.
    pub fn add(&mut self, other: TokenUsage) {
        self.input = self.input.saturating_add(other.input);
        self.output = self.output.saturating_add(other.output);
    }

    /// Combined prompt and completion tokens.
    pub fn total(&self) -> u64 {
        self.input.saturating_add(self.output)
    }
}

/// Structured decision from one quality-gate evaluation. Recomputed fresh
/// on every call, never mutated in place.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QualityVerdict {
    /// Whether the output cleared the gate.
    pub passed: bool,
    /// Normalized score in `[0, 1]`.
    pub score: f64,
    /// Problems found, highest priority first.
    pub issues: Vec<String>,
    /// Rubric criteria the output failed.
    pub failed_criteria: Vec<String>,
    /// Concrete suggestions for a retry.
    pub improvement_suggestions: Vec<String>,
    /// What the output did well.
    pub strengths: Vec<String>,
    /// Whether another automated attempt is worthwhile.
    pub retry_needed: bool,
    /// Whether a human must look at the output.
    pub human_review_needed: bool,
}

impl QualityVerdict {
    /// A passing verdict with the given score and no findings.
    pub fn pass(score: f64) -> Self {
        Self {
            passed: true,
            score,
            ..Self::default()
        }
    }
}

/// Result of dispatching one worker task end to end.
///
/// Mutated only by the dispatcher; immutable once the status is terminal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerResult {
    /// Id of the task this result answers.
    pub task_id: String,
    /// Worker type that produced it.
    pub worker: WorkerKind,
    /// Terminal status.
    pub status: WorkerStatus,
    /// Output text (the best attempt's output when review is needed).
    pub output: String,
    /// Last quality verdict, when quality checking ran.
    pub verdict: Option<QualityVerdict>,
    /// Retries consumed beyond the first attempt.
    pub retries_used: u32,
    /// Tokens spent across all attempts.
    pub tokens_used: TokenUsage,
    /// Every attempt made, in order.
    pub attempt_history: Vec<AttemptRecord>,
    /// Index into `attempt_history` of the attempt whose output was kept.
    pub best_attempt: Option<usize>,
}

impl WorkerResult {
    /// A failed result carrying only a reason.
    pub fn failed(task_id: impl Into<String>, worker: WorkerKind, reason: impl Into<String>) -> Self {
        let reason = reason.into();
        Self {
            task_id: task_id.into(),
            worker,
            status: WorkerStatus::Failed { reason },
            output: String::new(),
            verdict: None,
            retries_used: 0,
            tokens_used: TokenUsage::default(),
            attempt_history: Vec::new(),
            best_attempt: None,
        }
    }

    /// Whether this result's output can feed integration.
    pub fn is_completed(&self) -> bool {
        self.status == WorkerStatus::Completed
    }
}

/// Pipeline step a snapshot marks as finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    /// The leader produced its plan.
    LeaderCompleted,
    /// One worker task completed.
    WorkerCompleted,
    /// The merged document was produced.
    IntegrationCompleted,
}

/// Lifecycle of a snapshot row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SnapshotStatus {
    /// Usable for resume.
    Active,
    /// Superseded or explicitly invalidated.
    Invalidated,
}

/// Persisted marker of one completed pipeline step. Append-only per run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowSnapshot {
    /// The workflow run this snapshot belongs to.
    pub run_id: Uuid,
    /// Project the run belongs to.
    pub project_id: String,
    /// Leader agent identity, used to find resumable runs.
    pub agent_id: String,
    /// Which pipeline step completed.
    pub step: StepKind,
    /// Step identifier (task id for workers, fixed labels otherwise).
    pub step_id: String,
    /// Human-readable label.
    pub label: String,
    /// Opaque step payload (worker output, leader output, ...).
    pub state: serde_json::Value,
    /// Full task list, carried for resume.
    #[serde(default)]
    pub worker_tasks: Vec<WorkerTaskSpec>,
    /// Row lifecycle.
    pub status: SnapshotStatus,
    /// When the snapshot was written.
    pub created_at: DateTime<Utc>,
}

impl WorkflowSnapshot {
    /// Build an active snapshot stamped with the current time.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        run_id: Uuid,
        project_id: impl Into<String>,
        agent_id: impl Into<String>,
        step: StepKind,
        step_id: impl Into<String>,
        label: impl Into<String>,
        state: serde_json::Value,
        worker_tasks: Vec<WorkerTaskSpec>,
    ) -> Self {
        Self {
            run_id,
            project_id: project_id.into(),
            agent_id: agent_id.into(),
            step,
            step_id: step_id.into(),
            label: label.into(),
            state,
            worker_tasks,
            status: SnapshotStatus::Active,
            created_at: Utc::now(),
        }
    }
}

/// Phase of the top-level orchestration state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunPhase {
    /// Nothing has run yet.
    NotStarted,
    /// The leader is planning.
    LeaderRunning,
    /// The leader failed; the run aborted with no workers dispatched.
    LeaderFailed,
    /// Workers are executing.
    WorkersRunning,
    /// Worker outputs are being merged.
    Integrating,
    /// The checkpoint summary is assembled.
    ChecklistReady,
    /// Run finished.
    Done,
}

impl std::fmt::Display for RunPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            RunPhase::NotStarted => "not_started",
            RunPhase::LeaderRunning => "leader_running",
            RunPhase::LeaderFailed => "leader_failed",
            RunPhase::WorkersRunning => "workers_running",
            RunPhase::Integrating => "integrating",
            RunPhase::ChecklistReady => "checklist_ready",
            RunPhase::Done => "done",
        };
        write!(f, "{name}")
    }
}
