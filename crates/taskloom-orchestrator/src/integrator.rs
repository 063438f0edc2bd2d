use crate::dispatcher::WorkerDispatcher;
use crate::plan::parse_worker_tasks;
use crate::profiles::integration_rubric;
use crate::quality::{QualityGate, RubricConfig};
use crate::retry::{retry_with_backoff, RetryPolicy};
use std::collections::HashSet;
use std::sync::Arc;
use taskloom_core::{
    ExecutionContext, JobClient, JobRequest, PriorOutput, QualityVerdict, TaskloomResult,
    TokenUsage, WorkerResult, GENERATION_TIMEOUT,
};
use tracing::{info, warn};

/// Longest worker-output excerpt carried into the synthesis prompt.
const WORKER_EXCERPT: usize = 4_000;

/// Result of merging worker outputs into one deliverable.
#[derive(Debug, Clone)]
pub struct IntegrationOutcome {
    /// The merged document.
    pub document: String,
    /// Verdict on the final document, when quality checking ran.
    pub verdict: Option<QualityVerdict>,
    /// Routing cycles consumed asking the leader for supplemental work.
    pub routing_cycles_used: u32,
    /// Results of supplemental tasks dispatched during routing.
    pub supplemental_results: Vec<WorkerResult>,
    /// Tokens spent on synthesis and routing calls (supplemental worker
    /// tokens are carried inside their results).
    pub tokens: TokenUsage,
}

/// Merges completed worker outputs into a single document, gating the merge
/// and routing gaps back to the leader.
///
/// The routing loop is bounded: each cycle may dispatch supplemental tasks
/// and re-synthesize, and after `max_routing_cycles` cycles the integrator
/// produces a final revision seeded with the gate's suggestions instead of
/// looping again.
pub struct OutputIntegrator {
    jobs: Arc<dyn JobClient>,
    gate: Arc<QualityGate>,
    rubric: RubricConfig,
    max_routing_cycles: u32,
    retry: RetryPolicy,
}

impl OutputIntegrator {
    /// Integrator with the default merge rubric and routing budget.
    pub fn new(jobs: Arc<dyn JobClient>, gate: Arc<QualityGate>) -> Self {
        Self {
            jobs,
            gate,
            rubric: integration_rubric(),
            max_routing_cycles: 2,
            retry: RetryPolicy::default(),
        }
    }

    /// Override the transient-error retry policy for synthesis and routing
    /// calls.
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Override the merge rubric.
    pub fn with_rubric(mut self, rubric: RubricConfig) -> Self {
        self.rubric = rubric;
        self
    }

    /// Override the routing-cycle budget.
    pub fn with_max_routing_cycles(mut self, cycles: u32) -> Self {
        self.max_routing_cycles = cycles;
        self
    }

    /// Merge worker outputs, loop through leader routing while the merge
    /// fails its gate, and return the best document produced.
    pub async fn integrate(
        &self,
        ctx: &ExecutionContext,
        leader_output: &str,
        results: &[WorkerResult],
        dispatcher: &WorkerDispatcher,
        quality_enabled: bool,
        worker_max_attempts: u32,
    ) -> TaskloomResult<IntegrationOutcome> {
        let mut completed: Vec<WorkerResult> =
            results.iter().filter(|r| r.is_completed()).cloned().collect();
        let mut known_ids: HashSet<String> =
            results.iter().map(|r| r.task_id.clone()).collect();
        let mut supplemental_results = Vec::new();
        let mut tokens = TokenUsage::default();
        let mut cycles = 0u32;

        loop {
            let document = self
                .synthesize(ctx, leader_output, &completed, None, &mut tokens)
                .await?;

            if !quality_enabled {
                return Ok(IntegrationOutcome {
                    document,
                    verdict: None,
                    routing_cycles_used: cycles,
                    supplemental_results,
                    tokens,
                });
            }

            let verdict = self
                .gate
                .evaluate_against(&document, &self.rubric, "integration", ctx)
                .await?;

            if verdict.passed {
                return Ok(IntegrationOutcome {
                    document,
                    verdict: Some(verdict),
                    routing_cycles_used: cycles,
                    supplemental_results,
                    tokens,
                });
            }

            if cycles >= self.max_routing_cycles {
                info!(cycles, "routing budget spent, producing final revision");
                let document = self
                    .synthesize(ctx, leader_output, &completed, Some(&verdict), &mut tokens)
                    .await?;
                return Ok(IntegrationOutcome {
                    document,
                    verdict: Some(verdict),
                    routing_cycles_used: cycles,
                    supplemental_results,
                    tokens,
                });
            }

            cycles += 1;
            info!(cycle = cycles, score = verdict.score, "merge failed its gate, routing back to leader");

            let supplemental = match self
                .request_supplemental_tasks(ctx, &document, &verdict, &mut tokens)
                .await
            {
                Ok(tasks) => tasks,
                Err(e) => {
                    // Routing is optional; the finished workers' output must
                    // not be lost to a failed routing call.
                    warn!(error = %e, "routing call failed, skipping supplemental tasks");
                    Vec::new()
                }
            };
            let supplemental: Vec<_> = supplemental
                .into_iter()
                .filter(|t| {
                    if known_ids.contains(&t.id) {
                        warn!(task_id = %t.id, "leader re-issued an already-dispatched task, skipping");
                        return false;
                    }
                    true
                })
                .collect();

            if supplemental.is_empty() {
                info!("leader proposed no supplemental tasks, producing final revision");
                let document = self
                    .synthesize(ctx, leader_output, &completed, Some(&verdict), &mut tokens)
                    .await?;
                return Ok(IntegrationOutcome {
                    document,
                    verdict: Some(verdict),
                    routing_cycles_used: cycles,
                    supplemental_results,
                    tokens,
                });
            }

            let mut supplemental_ctx = ctx.clone();
            supplemental_ctx.prior_outputs = completed
                .iter()
                .map(|r| PriorOutput {
                    worker: r.worker.clone(),
                    task_id: r.task_id.clone(),
                    content: r.output.clone(),
                })
                .collect();

            for task in supplemental {
                known_ids.insert(task.id.clone());
                let result = dispatcher
                    .execute_worker(&supplemental_ctx, &task, quality_enabled, worker_max_attempts)
                    .await;
                if result.is_completed() {
                    completed.push(result.clone());
                }
                supplemental_results.push(result);
            }
        }
    }

    async fn synthesize(
        &self,
        ctx: &ExecutionContext,
        leader_output: &str,
        completed: &[WorkerResult],
        revision_of: Option<&QualityVerdict>,
        tokens: &mut TokenUsage,
    ) -> TaskloomResult<String> {
        let prompt = synthesis_prompt(leader_output, completed, revision_of);
        let request = JobRequest::new(&ctx.project_id, &ctx.agent_id, prompt)
            .with_system_prompt(INTEGRATOR_PROMPT)
            .with_max_tokens(8192);

        let outcome = retry_with_backoff(&self.retry, || {
            self.jobs.execute(request.clone(), GENERATION_TIMEOUT)
        })
        .await?;
        tokens.add(TokenUsage {
            input: outcome.tokens_in,
            output: outcome.tokens_out,
        });
        Ok(outcome.content)
    }

    async fn request_supplemental_tasks(
        &self,
        ctx: &ExecutionContext,
        document: &str,
        verdict: &QualityVerdict,
        tokens: &mut TokenUsage,
    ) -> TaskloomResult<Vec<taskloom_core::WorkerTaskSpec>> {
        let mut prompt = String::from(
            "The merged document below failed its quality review. Decide whether \
             additional worker tasks would fix the gaps. Reply with one fenced JSON \
             block containing a worker_tasks array (empty if nothing would help).\n\n",
        );
        prompt.push_str("Review findings:\n");
        for issue in &verdict.issues {
            prompt.push_str(&format!("- {issue}\n"));
        }
        for criterion in &verdict.failed_criteria {
            prompt.push_str(&format!("- failed criterion: {criterion}\n"));
        }
        prompt.push_str(&format!("\nCurrent document:\n{document}\n"));

        let request = JobRequest::new(&ctx.project_id, &ctx.agent_id, prompt)
            .with_system_prompt(ROUTER_PROMPT)
            .with_temperature(0.2)
            .with_max_tokens(2048);

        let outcome = retry_with_backoff(&self.retry, || {
            self.jobs.execute(request.clone(), GENERATION_TIMEOUT)
        })
        .await?;
        tokens.add(TokenUsage {
            input: outcome.tokens_in,
            output: outcome.tokens_out,
        });
        Ok(parse_worker_tasks(&outcome.content))
    }
}

fn synthesis_prompt(
    leader_output: &str,
    completed: &[WorkerResult],
    revision_of: Option<&QualityVerdict>,
) -> String {
    let mut prompt = format!(
        "Merge the following worker outputs into one coherent deliverable.\n\n\
         Project plan:\n{leader_output}\n"
    );

    if completed.is_empty() {
        prompt.push_str("\nNo worker outputs completed; produce the deliverable from the plan alone.\n");
    } else {
        prompt.push_str("\nWorker outputs:\n");
        for result in completed {
            let excerpt = if result.output.len() > WORKER_EXCERPT {
                let mut end = WORKER_EXCERPT;
                while end > 0 && !result.output.is_char_boundary(end) {
                    end -= 1;
                }
                &result.output[..end]
            } else {
                &result.output
            };
            prompt.push_str(&format!(
                "\n--- {} ({}) ---\n{excerpt}\n",
                result.task_id, result.worker
            ));
        }
    }

    if let Some(verdict) = revision_of {
        prompt.push_str("\nA previous merge failed review. Apply these suggestions:\n");
        for s in &verdict.improvement_suggestions {
            prompt.push_str(&format!("- {s}\n"));
        }
        for issue in &verdict.issues {
            prompt.push_str(&format!("- fix: {issue}\n"));
        }
    }

    prompt
}

const INTEGRATOR_PROMPT: &str = "\
You merge multi-agent content into a single polished deliverable. Preserve \
every contributor's substance, resolve contradictions explicitly, and write \
one document that reads as a whole. Output plain Markdown.
";

const ROUTER_PROMPT: &str = "\
You are the project lead reviewing a failed merge. Propose the smallest set \
of additional worker tasks that would close the gaps, as a fenced JSON block \
with a worker_tasks array. Each task needs id, worker, task, depends_on.
";
