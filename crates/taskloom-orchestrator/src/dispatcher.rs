use crate::profiles::{default_profiles, WorkerProfile};
use crate::progress::{ProgressEvent, ProgressTracker};
use crate::quality::QualityGate;
use crate::retry::{is_retryable, retry_with_backoff, RetryPolicy};
use std::collections::HashMap;
use std::sync::Arc;
use taskloom_core::{
    AttemptRecord, ExecutionContext, JobClient, JobRequest, RetryFeedback, TokenUsage,
    WorkerKind, WorkerResult, WorkerStatus, WorkerTaskSpec, GENERATION_TIMEOUT,
};
use tracing::{info, warn};

/// Longest prior-output excerpt carried into a worker prompt.
const PRIOR_OUTPUT_EXCERPT: usize = 1_500;
/// Longest leader excerpt carried into a worker prompt.
const LEADER_EXCERPT: usize = 2_000;

/// Dispatches one worker task end to end: generation, quality gating, and
/// the quality-retry loop.
///
/// `execute_worker` never returns `Err`; every failure mode is folded into
/// the returned [`WorkerResult`] so one bad worker cannot take down its
/// siblings.
pub struct WorkerDispatcher {
    jobs: Arc<dyn JobClient>,
    gate: Arc<QualityGate>,
    profiles: HashMap<WorkerKind, WorkerProfile>,
    tracker: Arc<ProgressTracker>,
    retry: RetryPolicy,
}

impl WorkerDispatcher {
    /// Dispatcher with the default worker profiles and retry policy.
    pub fn new(
        jobs: Arc<dyn JobClient>,
        gate: Arc<QualityGate>,
        tracker: Arc<ProgressTracker>,
    ) -> Self {
        let profiles = default_profiles()
            .into_iter()
            .map(|p| (p.kind.clone(), p))
            .collect();
        Self {
            jobs,
            gate,
            profiles,
            tracker,
            retry: RetryPolicy::default(),
        }
    }

    /// Replace the worker profile registry.
    pub fn with_profiles(mut self, profiles: Vec<WorkerProfile>) -> Self {
        self.profiles = profiles.into_iter().map(|p| (p.kind.clone(), p)).collect();
        self
    }

    /// Override the transient-error retry policy.
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Execute one worker task through the quality-retry loop.
    ///
    /// `max_attempts` bounds the total number of generation attempts; it is
    /// clamped to at least one. When every attempt fails the gate, the
    /// highest-scoring attempt's output is kept and the result is flagged
    /// for human review.
    pub async fn execute_worker(
        &self,
        ctx: &ExecutionContext,
        spec: &WorkerTaskSpec,
        quality_enabled: bool,
        max_attempts: u32,
    ) -> WorkerResult {
        let Some(profile) = self.profiles.get(&spec.worker) else {
            let reason = if spec.worker.is_known() {
                format!("no profile configured for worker type: {}", spec.worker)
            } else {
                format!("unknown worker type: {}", spec.worker)
            };
            warn!(task_id = %spec.id, worker = %spec.worker, "dispatch refused");
            self.tracker
                .emit(ProgressEvent::WorkerFailed {
                    task_id: spec.id.clone(),
                    worker: spec.worker.clone(),
                    reason: reason.clone(),
                })
                .await;
            return WorkerResult::failed(&spec.id, spec.worker.clone(), reason);
        };

        self.tracker
            .emit(ProgressEvent::WorkerStarted {
                task_id: spec.id.clone(),
                worker: spec.worker.clone(),
            })
            .await;

        let max_attempts = max_attempts.max(1);
        let mut task_ctx = ctx.for_task(&spec.task);
        let mut history: Vec<AttemptRecord> = Vec::new();
        let mut tokens = TokenUsage::default();
        let mut last_verdict = None;

        for attempt in 0..max_attempts {
            let request = JobRequest::new(&ctx.project_id, &ctx.agent_id, worker_prompt(&task_ctx))
                .with_system_prompt(&profile.system_prompt)
                .with_tier(profile.tier)
                .with_temperature(profile.temperature)
                .with_max_tokens(profile.max_tokens);

            let outcome = retry_with_backoff(&self.retry, || {
                self.jobs.execute(request.clone(), GENERATION_TIMEOUT)
            })
            .await;

            let outcome = match outcome {
                Ok(outcome) => outcome,
                Err(e) if is_retryable(&e) || matches!(e, taskloom_core::TaskloomError::MaxRetriesExceeded { .. }) => {
                    // Transient budget exhausted; count the attempt and move on.
                    warn!(task_id = %spec.id, attempt, error = %e, "generation attempt failed");
                    history.push(AttemptRecord {
                        attempt,
                        score: 0.0,
                        output: String::new(),
                        error: Some(e.to_string()),
                    });
                    continue;
                }
                Err(e) => {
                    // Fatal for this worker; siblings keep running.
                    warn!(task_id = %spec.id, error = %e, "worker failed fatally");
                    let reason = e.to_string();
                    self.tracker
                        .emit(ProgressEvent::WorkerFailed {
                            task_id: spec.id.clone(),
                            worker: spec.worker.clone(),
                            reason: reason.clone(),
                        })
                        .await;
                    self.tracker
                        .record_usage(&spec.worker, attempt as u64, tokens)
                        .await;
                    let mut result = WorkerResult::failed(&spec.id, spec.worker.clone(), reason);
                    result.attempt_history = history;
                    result.tokens_used = tokens;
                    result.retries_used = attempt;
                    return result;
                }
            };

            tokens.add(TokenUsage {
                input: outcome.tokens_in,
                output: outcome.tokens_out,
            });

            if !quality_enabled {
                return self
                    .finish_completed(spec, outcome.content, None, attempt, history, tokens)
                    .await;
            }

            let verdict = match self.gate.evaluate(&outcome.content, &spec.worker, &task_ctx).await
            {
                Ok(verdict) => verdict,
                Err(e) => {
                    // Fail open: an unusable evaluator should not discard
                    // good output.
                    warn!(task_id = %spec.id, error = %e, "quality evaluation failed, accepting output");
                    return self
                        .finish_completed(spec, outcome.content, None, attempt, history, tokens)
                        .await;
                }
            };

            history.push(AttemptRecord {
                attempt,
                score: verdict.score,
                output: outcome.content.clone(),
                error: None,
            });

            if verdict.passed {
                let score = verdict.score;
                let mut result = self
                    .finish_completed(spec, outcome.content, Some(score), attempt, history, tokens)
                    .await;
                result.verdict = Some(verdict);
                return result;
            }

            info!(
                task_id = %spec.id,
                attempt,
                score = verdict.score,
                "quality gate rejected attempt"
            );
            task_ctx.retry_feedback = Some(RetryFeedback {
                issues: verdict.issues.clone(),
                failed_criteria: verdict.failed_criteria.clone(),
                improvement_suggestions: verdict.improvement_suggestions.clone(),
            });
            last_verdict = Some(verdict);
        }

        // Retries exhausted: keep the best attempt and route to a human.
        let best = best_attempt(&history);
        if best.is_none() {
            // No attempt ever produced output; there is nothing to review.
            let reason = history
                .last()
                .and_then(|a| a.error.clone())
                .unwrap_or_else(|| "all generation attempts failed".to_string());
            self.tracker
                .emit(ProgressEvent::WorkerFailed {
                    task_id: spec.id.clone(),
                    worker: spec.worker.clone(),
                    reason: reason.clone(),
                })
                .await;
            self.tracker
                .record_usage(&spec.worker, (max_attempts - 1) as u64, tokens)
                .await;
            let mut result = WorkerResult::failed(&spec.id, spec.worker.clone(), reason);
            result.attempt_history = history;
            result.tokens_used = tokens;
            result.retries_used = max_attempts - 1;
            return result;
        }
        let output = best
            .and_then(|i| history.get(i))
            .map(|a| a.output.clone())
            .unwrap_or_default();

        let mut verdict = last_verdict;
        if let Some(v) = verdict.as_mut() {
            v.retry_needed = false;
            v.human_review_needed = true;
        }

        self.tracker
            .emit(ProgressEvent::WorkerNeedsReview {
                task_id: spec.id.clone(),
                worker: spec.worker.clone(),
            })
            .await;
        self.tracker
            .record_usage(&spec.worker, (max_attempts - 1) as u64, tokens)
            .await;

        WorkerResult {
            task_id: spec.id.clone(),
            worker: spec.worker.clone(),
            status: WorkerStatus::NeedsHumanReview,
            output,
            verdict,
            retries_used: max_attempts - 1,
            tokens_used: tokens,
            attempt_history: history,
            best_attempt: best,
        }
    }

    async fn finish_completed(
        &self,
        spec: &WorkerTaskSpec,
        output: String,
        score: Option<f64>,
        attempt: u32,
        history: Vec<AttemptRecord>,
        tokens: TokenUsage,
    ) -> WorkerResult {
        self.tracker
            .emit(ProgressEvent::WorkerCompleted {
                task_id: spec.id.clone(),
                worker: spec.worker.clone(),
                score,
            })
            .await;
        self.tracker
            .record_usage(&spec.worker, attempt as u64, tokens)
            .await;

        let best = if history.is_empty() {
            None
        } else {
            Some(history.len() - 1)
        };
        WorkerResult {
            task_id: spec.id.clone(),
            worker: spec.worker.clone(),
            status: WorkerStatus::Completed,
            output,
            verdict: None,
            retries_used: attempt,
            tokens_used: tokens,
            attempt_history: history,
            best_attempt: best,
        }
    }
}

/// Index of the highest-scoring attempt that produced output.
fn best_attempt(history: &[AttemptRecord]) -> Option<usize> {
    history
        .iter()
        .enumerate()
        .filter(|(_, a)| a.error.is_none())
        .max_by(|(_, a), (_, b)| {
            a.score
                .partial_cmp(&b.score)
                .unwrap_or(std::cmp::Ordering::Equal)
        })
        .map(|(i, _)| i)
}

/// Build the user prompt for one worker attempt.
fn worker_prompt(ctx: &ExecutionContext) -> String {
    let mut prompt = format!("Your assigned task:\n{}\n", ctx.task);

    if !ctx.leader_excerpt.is_empty() {
        prompt.push_str(&format!(
            "\nContext from the project lead:\n{}\n",
            truncate(&ctx.leader_excerpt, LEADER_EXCERPT)
        ));
    }

    if !ctx.prior_outputs.is_empty() {
        prompt.push_str("\nOutputs from earlier workers:\n");
        for prior in &ctx.prior_outputs {
            prompt.push_str(&format!(
                "\n--- {} ({}) ---\n{}\n",
                prior.task_id,
                prior.worker,
                truncate(&prior.content, PRIOR_OUTPUT_EXCERPT)
            ));
        }
    }

    if let Some(feedback) = &ctx.retry_feedback {
        prompt.push_str("\nYour previous attempt was rejected. Address these problems:\n");
        for issue in &feedback.issues {
            prompt.push_str(&format!("- {issue}\n"));
        }
        for criterion in &feedback.failed_criteria {
            prompt.push_str(&format!("- failed criterion: {criterion}\n"));
        }
        if !feedback.improvement_suggestions.is_empty() {
            prompt.push_str("Suggestions:\n");
            for s in &feedback.improvement_suggestions {
                prompt.push_str(&format!("- {s}\n"));
            }
        }
    }

    prompt
}

fn truncate(text: &str, max: usize) -> &str {
    if text.len() <= max {
        return text;
    }
    // Back up to a char boundary.
    let mut end = max;
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::quality::RubricConfig;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;
    use taskloom_core::{JobId, JobOutcome, TaskloomError, TaskloomResult};

    /// Routes requests by prompt shape: scoring prompts (built by the
    /// quality gate) consume scripted scores, everything else is a
    /// generation call.
    struct RoutingClient {
        generation: Mutex<Vec<TaskloomResult<String>>>,
        scores: Mutex<Vec<f64>>,
        prompts: Mutex<Vec<String>>,
        calls: AtomicU32,
    }

    impl RoutingClient {
        fn new(generation: Vec<TaskloomResult<String>>, scores: Vec<f64>) -> Self {
            Self {
                generation: Mutex::new(generation),
                scores: Mutex::new(scores),
                prompts: Mutex::new(Vec::new()),
                calls: AtomicU32::new(0),
            }
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl JobClient for RoutingClient {
        async fn submit(&self, request: JobRequest) -> TaskloomResult<JobId> {
            self.prompts.lock().unwrap().push(request.prompt);
            Ok(JobId(uuid::Uuid::new_v4()))
        }

        async fn wait(&self, _job: JobId, _timeout: Duration) -> TaskloomResult<JobOutcome> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let prompt = self
                .prompts
                .lock()
                .unwrap()
                .last()
                .cloned()
                .unwrap_or_default();

            if prompt.starts_with("Evaluate the following") {
                let score = self.scores.lock().unwrap().remove(0);
                return Ok(JobOutcome {
                    content: format!(
                        "```json\n{{\"score\": {score}, \"issues\": [\"needs depth\"], \
                         \"improvement_suggestions\": [\"expand section two\"]}}\n```"
                    ),
                    tokens_in: 5,
                    tokens_out: 2,
                });
            }

            let mut generation = self.generation.lock().unwrap();
            if generation.is_empty() {
                return Err(TaskloomError::Provider("script exhausted".to_string()));
            }
            generation.remove(0).map(|content| JobOutcome {
                content,
                tokens_in: 100,
                tokens_out: 40,
            })
        }
    }

    fn spec() -> WorkerTaskSpec {
        WorkerTaskSpec {
            id: "t1".to_string(),
            worker: WorkerKind::Research,
            task: "summarize prior art".to_string(),
            depends_on: vec![],
        }
    }

    fn ctx() -> ExecutionContext {
        ExecutionContext::new("proj", "agent")
    }

    fn long_output() -> String {
        "sentence ".repeat(60)
    }

    fn lenient_rubric() -> RubricConfig {
        RubricConfig {
            criteria: vec!["depth".to_string()],
            min_length: 10,
            escalate_borderline: false,
            ..RubricConfig::default()
        }
    }

    fn dispatcher(client: Arc<RoutingClient>) -> WorkerDispatcher {
        let gate =
            QualityGate::new(client.clone()).with_rubric(WorkerKind::Research, lenient_rubric());
        WorkerDispatcher::new(client, Arc::new(gate), Arc::new(ProgressTracker::new()))
    }

    #[tokio::test]
    async fn test_quality_disabled_completes_first_attempt() {
        let client = Arc::new(RoutingClient::new(vec![Ok(long_output())], vec![]));
        let d = dispatcher(client.clone());

        let result = d.execute_worker(&ctx(), &spec(), false, 3).await;

        assert!(result.is_completed());
        assert!(result.verdict.is_none());
        assert_eq!(result.retries_used, 0);
        assert_eq!(client.calls(), 1);
    }

    #[tokio::test]
    async fn test_passing_score_on_third_attempt_completes() {
        let client = Arc::new(RoutingClient::new(
            vec![Ok(long_output()), Ok(long_output()), Ok(long_output())],
            vec![0.3, 0.4, 0.9],
        ));
        let d = dispatcher(client);

        let result = d.execute_worker(&ctx(), &spec(), true, 3).await;

        assert_eq!(result.status, WorkerStatus::Completed);
        assert_eq!(result.retries_used, 2);
        assert_eq!(result.attempt_history.len(), 3);
        assert_eq!(result.best_attempt, Some(2));
        assert!(result.verdict.unwrap().passed);
    }

    #[tokio::test]
    async fn test_exhausted_retries_keep_best_attempt_for_review() {
        let client = Arc::new(RoutingClient::new(
            vec![Ok(format!("{} alpha", long_output())), Ok(format!("{} beta", long_output()))],
            vec![0.3, 0.4],
        ));
        let d = dispatcher(client);

        let result = d.execute_worker(&ctx(), &spec(), true, 2).await;

        assert_eq!(result.status, WorkerStatus::NeedsHumanReview);
        assert_eq!(result.best_attempt, Some(1));
        assert!(result.output.ends_with("beta"));
        let verdict = result.verdict.unwrap();
        assert!(verdict.human_review_needed);
        assert!(!verdict.retry_needed);
    }

    #[tokio::test]
    async fn test_unknown_worker_fails_without_job_calls() {
        let client = Arc::new(RoutingClient::new(vec![], vec![]));
        let d = dispatcher(client.clone());

        let unknown = WorkerTaskSpec {
            worker: WorkerKind::Unknown("sculptor".to_string()),
            ..spec()
        };
        let result = d.execute_worker(&ctx(), &unknown, true, 3).await;

        match result.status {
            WorkerStatus::Failed { reason } => {
                assert!(reason.contains("unknown worker type"));
                assert!(reason.contains("sculptor"));
            }
            other => panic!("expected Failed, got {other:?}"),
        }
        assert_eq!(client.calls(), 0);
    }

    #[tokio::test]
    async fn test_known_kind_without_profile_reports_missing_profile() {
        let client = Arc::new(RoutingClient::new(vec![], vec![]));
        let gate = QualityGate::new(client.clone());
        let d = WorkerDispatcher::new(client.clone(), Arc::new(gate), Arc::new(ProgressTracker::new()))
            .with_profiles(Vec::new());

        let result = d.execute_worker(&ctx(), &spec(), true, 3).await;

        match result.status {
            WorkerStatus::Failed { reason } => {
                assert!(reason.contains("no profile configured"));
                assert!(reason.contains("research"));
                assert!(!reason.contains("unknown worker type"));
            }
            other => panic!("expected Failed, got {other:?}"),
        }
        assert_eq!(client.calls(), 0);
    }

    #[tokio::test]
    async fn test_fatal_generation_error_fails_worker() {
        let client = Arc::new(RoutingClient::new(
            vec![Err(TaskloomError::Provider("invalid api key".to_string()))],
            vec![],
        ));
        let d = dispatcher(client);

        let result = d.execute_worker(&ctx(), &spec(), true, 3).await;

        assert!(matches!(result.status, WorkerStatus::Failed { .. }));
        assert_eq!(result.attempt_history.len(), 0);
    }

    #[tokio::test]
    async fn test_retry_feedback_reaches_next_prompt() {
        let client = Arc::new(RoutingClient::new(
            vec![Ok(long_output()), Ok(long_output())],
            vec![0.2, 0.9],
        ));
        let d = dispatcher(client.clone());

        let result = d.execute_worker(&ctx(), &spec(), true, 3).await;
        assert!(result.is_completed());

        let prompts = client.prompts.lock().unwrap();
        let second_generation = prompts
            .iter()
            .filter(|p| p.starts_with("Your assigned task"))
            .nth(1)
            .unwrap();
        assert!(second_generation.contains("previous attempt was rejected"));
        assert!(second_generation.contains("needs depth"));
        assert!(second_generation.contains("expand section two"));
    }

    #[tokio::test]
    async fn test_tokens_accumulate_across_attempts() {
        let client = Arc::new(RoutingClient::new(
            vec![Ok(long_output()), Ok(long_output())],
            vec![0.2, 0.9],
        ));
        let d = dispatcher(client);

        let result = d.execute_worker(&ctx(), &spec(), true, 3).await;

        // Two generation calls at 100/40 each; scoring tokens are billed to
        // the gate, not the worker.
        assert_eq!(result.tokens_used.input, 200);
        assert_eq!(result.tokens_used.output, 80);
    }

    #[tokio::test]
    async fn test_prior_outputs_and_leader_context_in_prompt() {
        let client = Arc::new(RoutingClient::new(vec![Ok(long_output())], vec![]));
        let d = dispatcher(client.clone());

        let mut context = ctx();
        context.leader_excerpt = "build a landing page".to_string();
        context.prior_outputs.push(taskloom_core::PriorOutput {
            worker: WorkerKind::Research,
            task_id: "r1".to_string(),
            content: "competitor summary".to_string(),
        });

        let result = d.execute_worker(&context, &spec(), false, 1).await;
        assert!(result.is_completed());

        let prompts = client.prompts.lock().unwrap();
        assert!(prompts[0].contains("build a landing page"));
        assert!(prompts[0].contains("competitor summary"));
        assert!(prompts[0].contains("r1"));
    }
}
