use crate::plan::fenced_json_blocks;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use taskloom_core::{
    ExecutionContext, JobClient, JobRequest, ModelTier, QualityVerdict, TaskloomError,
    TaskloomResult, WorkerKind, QUALITY_TIMEOUT,
};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

/// Fallback minimum output length when a worker kind has no rubric.
const DEFAULT_MIN_LENGTH: usize = 80;

/// Rubric a worker kind's output is scored against.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RubricConfig {
    /// Criteria the scoring model is asked to grade.
    pub criteria: Vec<String>,
    /// Minimum normalized score to pass.
    pub threshold: f64,
    /// Minimum output length for the rule-based pre-check.
    pub min_length: usize,
    /// Section headings that must appear in the output.
    pub required_sections: Vec<String>,
    /// Score band that triggers a premium-tier re-score.
    pub borderline_band: (f64, f64),
    /// Whether borderline scores escalate to the premium tier.
    pub escalate_borderline: bool,
}

impl Default for RubricConfig {
    fn default() -> Self {
        Self {
            criteria: Vec::new(),
            threshold: 0.75,
            min_length: 200,
            required_sections: Vec::new(),
            borderline_band: (0.5, 0.7),
            escalate_borderline: true,
        }
    }
}

/// Durable record of one failed evaluation, kept for future prompting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InsightRecord {
    /// What was being evaluated (worker kind or "integration").
    pub subject: String,
    /// Normalized score at failure.
    pub score: f64,
    /// Criteria the output failed.
    pub failed_criteria: Vec<String>,
    /// Whether hallucination warnings were raised.
    pub hallucination_flagged: bool,
    /// Suggestions the evaluator produced.
    pub improvement_suggestions: Vec<String>,
    /// When the failure was recorded.
    pub recorded_at: DateTime<Utc>,
}

/// Sink for failed-evaluation insight records. Always best-effort: callers
/// log and swallow sink errors.
#[async_trait]
pub trait InsightSink: Send + Sync {
    /// Persist one insight record.
    async fn record(&self, insight: InsightRecord) -> TaskloomResult<()>;
}

/// Appends insight records as JSON lines to a single file.
pub struct FileInsightSink {
    path: PathBuf,
}

impl FileInsightSink {
    /// Sink writing to the given file, created on first record.
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

#[async_trait]
impl InsightSink for FileInsightSink {
    async fn record(&self, insight: InsightRecord) -> TaskloomResult<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut line = serde_json::to_string(&insight)?;
        line.push('\n');
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        Ok(())
    }
}

/// Shape the scoring model is asked to reply with.
#[derive(Debug, Default, Deserialize)]
struct RubricScore {
    #[serde(default)]
    score: f64,
    #[serde(default)]
    issues: Vec<String>,
    #[serde(default)]
    failed_criteria: Vec<String>,
    #[serde(default)]
    improvement_suggestions: Vec<String>,
    #[serde(default)]
    strengths: Vec<String>,
    #[serde(default)]
    hallucination_warnings: Vec<String>,
}

/// Evaluates worker output against a rubric.
///
/// A cheap rule-based pre-check runs first and short-circuits without any
/// LLM call. Kinds without a rubric auto-pass. Otherwise the output is
/// scored once at the standard tier, with an optional premium re-score for
/// borderline results. Failed evaluations emit best-effort insight records.
pub struct QualityGate {
    jobs: Arc<dyn JobClient>,
    rubrics: HashMap<WorkerKind, RubricConfig>,
    insights: Option<Arc<dyn InsightSink>>,
    timeout: Duration,
}

impl QualityGate {
    /// Gate with no rubrics configured (everything auto-passes).
    pub fn new(jobs: Arc<dyn JobClient>) -> Self {
        Self {
            jobs,
            rubrics: HashMap::new(),
            insights: None,
            timeout: QUALITY_TIMEOUT,
        }
    }

    /// Register a rubric for one worker kind.
    pub fn with_rubric(mut self, kind: WorkerKind, rubric: RubricConfig) -> Self {
        self.rubrics.insert(kind, rubric);
        self
    }

    /// Register rubrics in bulk.
    pub fn with_rubrics(mut self, rubrics: HashMap<WorkerKind, RubricConfig>) -> Self {
        self.rubrics.extend(rubrics);
        self
    }

    /// Attach an insight sink for failed evaluations.
    pub fn with_insight_sink(mut self, sink: Arc<dyn InsightSink>) -> Self {
        self.insights = Some(sink);
        self
    }

    /// Override the scoring-call deadline.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Evaluate one worker's output.
    pub async fn evaluate(
        &self,
        output: &str,
        kind: &WorkerKind,
        ctx: &ExecutionContext,
    ) -> TaskloomResult<QualityVerdict> {
        let rubric = self.rubrics.get(kind);

        if let Some(verdict) = precheck(output, rubric) {
            debug!(worker = %kind, "rule-based pre-check failed, skipping rubric call");
            self.emit_insight(kind.as_str(), &verdict).await;
            return Ok(verdict);
        }

        let Some(rubric) = rubric else {
            return Ok(QualityVerdict::pass(1.0));
        };

        let verdict = self
            .evaluate_against(output, rubric, kind.as_str(), ctx)
            .await?;
        Ok(verdict)
    }

    /// Evaluate arbitrary output against an explicit rubric (used for the
    /// integration merge, which is not a worker kind).
    pub async fn evaluate_against(
        &self,
        output: &str,
        rubric: &RubricConfig,
        subject: &str,
        ctx: &ExecutionContext,
    ) -> TaskloomResult<QualityVerdict> {
        if let Some(verdict) = precheck(output, Some(rubric)) {
            self.emit_insight(subject, &verdict).await;
            return Ok(verdict);
        }

        let mut scored = self
            .score(output, rubric, subject, ctx, ModelTier::Standard)
            .await?;

        let (lo, hi) = rubric.borderline_band;
        if rubric.escalate_borderline && scored.score >= lo && scored.score <= hi {
            info!(
                subject,
                score = scored.score,
                "borderline score, re-scoring at premium tier"
            );
            scored = self
                .score(output, rubric, subject, ctx, ModelTier::Premium)
                .await?;
        }

        let verdict = verdict_from(scored, rubric.threshold);
        if !verdict.passed {
            self.emit_insight(subject, &verdict).await;
        }
        Ok(verdict)
    }

    async fn score(
        &self,
        output: &str,
        rubric: &RubricConfig,
        subject: &str,
        ctx: &ExecutionContext,
        tier: ModelTier,
    ) -> TaskloomResult<RubricScore> {
        let prompt = scoring_prompt(output, rubric, subject, &ctx.task);
        let request = JobRequest::new(&ctx.project_id, &ctx.agent_id, prompt)
            .with_system_prompt(SCORER_PROMPT)
            .with_tier(tier)
            .with_temperature(0.0)
            .with_max_tokens(1024);

        let outcome = self.jobs.execute(request, self.timeout).await?;
        let mut scored = parse_rubric_response(&outcome.content)?;
        scored.score = scored.score.clamp(0.0, 1.0);
        Ok(scored)
    }

    async fn emit_insight(&self, subject: &str, verdict: &QualityVerdict) {
        let Some(sink) = &self.insights else {
            return;
        };
        let insight = InsightRecord {
            subject: subject.to_string(),
            score: verdict.score,
            failed_criteria: verdict.failed_criteria.clone(),
            hallucination_flagged: verdict
                .issues
                .iter()
                .any(|i| i.starts_with("hallucination:")),
            improvement_suggestions: verdict.improvement_suggestions.clone(),
            recorded_at: Utc::now(),
        };
        if let Err(e) = sink.record(insight).await {
            warn!(error = %e, "failed to record quality insight, continuing");
        }
    }
}

/// Rule-based pre-check. Returns a failing verdict when the output is
/// structurally unacceptable, `None` when the rubric call should proceed.
fn precheck(output: &str, rubric: Option<&RubricConfig>) -> Option<QualityVerdict> {
    let mut issues = Vec::new();

    let min_length = rubric.map_or(DEFAULT_MIN_LENGTH, |r| r.min_length);
    if output.trim().len() < min_length {
        issues.push(format!(
            "output too short: {} chars, minimum {min_length}",
            output.trim().len()
        ));
    }

    if let Some(rubric) = rubric {
        for section in &rubric.required_sections {
            if !output.contains(section.as_str()) {
                issues.push(format!("missing required section: {section}"));
            }
        }
    }

    for block in fenced_json_blocks(output) {
        if let Err(e) = serde_json::from_str::<serde_json::Value>(block) {
            issues.push(format!("embedded JSON block does not parse: {e}"));
        }
    }

    if issues.is_empty() {
        return None;
    }

    Some(QualityVerdict {
        passed: false,
        score: 0.0,
        issues,
        retry_needed: true,
        ..QualityVerdict::default()
    })
}

fn verdict_from(scored: RubricScore, threshold: f64) -> QualityVerdict {
    let hallucinated = !scored.hallucination_warnings.is_empty();
    let passed = scored.score >= threshold && !hallucinated;

    // Hallucination warnings go first: they are the highest-priority issues.
    let mut issues: Vec<String> = scored
        .hallucination_warnings
        .into_iter()
        .map(|w| format!("hallucination: {w}"))
        .collect();
    issues.extend(scored.issues);

    QualityVerdict {
        passed,
        score: scored.score,
        issues,
        failed_criteria: scored.failed_criteria,
        improvement_suggestions: scored.improvement_suggestions,
        strengths: scored.strengths,
        retry_needed: !passed,
        human_review_needed: false,
    }
}

fn parse_rubric_response(content: &str) -> TaskloomResult<RubricScore> {
    if let Some(block) = fenced_json_blocks(content).first() {
        return serde_json::from_str(block)
            .map_err(|e| TaskloomError::Quality(format!("unparseable rubric response: {e}")));
    }
    serde_json::from_str(content.trim())
        .map_err(|e| TaskloomError::Quality(format!("unparseable rubric response: {e}")))
}

fn scoring_prompt(output: &str, rubric: &RubricConfig, subject: &str, task: &str) -> String {
    let mut prompt = format!("Evaluate the following {subject} output against the rubric.\n\n");
    if !task.is_empty() {
        prompt.push_str(&format!("Assigned task:\n{task}\n\n"));
    }
    prompt.push_str("Rubric criteria:\n");
    for (i, criterion) in rubric.criteria.iter().enumerate() {
        prompt.push_str(&format!("{}. {criterion}\n", i + 1));
    }
    prompt.push_str(&format!("\nOutput to evaluate:\n{output}\n"));
    prompt
}

const SCORER_PROMPT: &str = "\
You are a strict quality evaluator. Grade the output against the rubric and \
reply with exactly one fenced JSON block of the form:

```json
{\"score\": 0.0, \"issues\": [], \"failed_criteria\": [], \
\"improvement_suggestions\": [], \"strengths\": [], \
\"hallucination_warnings\": []}
```

The score is a float in [0, 1]. List any fabricated facts, invented \
references, or unsupported claims in hallucination_warnings.
";

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;
    use taskloom_core::{JobId, JobOutcome};

    /// Mock job client returning scripted rubric responses in order.
    struct ScriptedScorer {
        responses: Mutex<Vec<String>>,
        calls: AtomicU32,
        tiers: Mutex<Vec<ModelTier>>,
    }

    impl ScriptedScorer {
        fn new(responses: Vec<String>) -> Self {
            Self {
                responses: Mutex::new(responses),
                calls: AtomicU32::new(0),
                tiers: Mutex::new(Vec::new()),
            }
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl JobClient for ScriptedScorer {
        async fn submit(&self, request: JobRequest) -> TaskloomResult<JobId> {
            self.tiers.lock().unwrap().push(request.tier);
            Ok(JobId(uuid::Uuid::new_v4()))
        }

        async fn wait(&self, _job: JobId, _timeout: Duration) -> TaskloomResult<JobOutcome> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut responses = self.responses.lock().unwrap();
            if responses.is_empty() {
                return Err(TaskloomError::Provider("no scripted response".to_string()));
            }
            Ok(JobOutcome {
                content: responses.remove(0),
                tokens_in: 10,
                tokens_out: 5,
            })
        }
    }

    fn rubric_response(score: f64) -> String {
        format!(
            "```json\n{{\"score\": {score}, \"issues\": [\"thin evidence\"], \
             \"failed_criteria\": [], \"improvement_suggestions\": [\"add sources\"], \
             \"strengths\": [\"clear\"], \"hallucination_warnings\": []}}\n```"
        )
    }

    fn ctx() -> ExecutionContext {
        ExecutionContext::new("proj", "agent")
    }

    fn long_output() -> String {
        "word ".repeat(100)
    }

    fn rubric() -> RubricConfig {
        RubricConfig {
            criteria: vec!["accuracy".to_string(), "completeness".to_string()],
            threshold: 0.75,
            min_length: 50,
            ..RubricConfig::default()
        }
    }

    #[tokio::test]
    async fn test_precheck_short_circuits_without_llm_call() {
        let scorer = Arc::new(ScriptedScorer::new(Vec::new()));
        let gate = QualityGate::new(scorer.clone())
            .with_rubric(WorkerKind::Research, rubric());

        let verdict = gate
            .evaluate("too short", &WorkerKind::Research, &ctx())
            .await
            .unwrap();

        assert!(!verdict.passed);
        assert!(verdict.retry_needed);
        assert!(verdict.issues[0].contains("too short"));
        assert_eq!(scorer.calls(), 0);
    }

    #[tokio::test]
    async fn test_missing_required_section_fails_precheck() {
        let scorer = Arc::new(ScriptedScorer::new(Vec::new()));
        let mut r = rubric();
        r.required_sections = vec!["## Summary".to_string()];
        let gate = QualityGate::new(scorer.clone()).with_rubric(WorkerKind::Design, r);

        let verdict = gate
            .evaluate(&long_output(), &WorkerKind::Design, &ctx())
            .await
            .unwrap();

        assert!(!verdict.passed);
        assert!(verdict.issues[0].contains("## Summary"));
        assert_eq!(scorer.calls(), 0);
    }

    #[tokio::test]
    async fn test_broken_embedded_json_fails_precheck() {
        let scorer = Arc::new(ScriptedScorer::new(Vec::new()));
        let gate = QualityGate::new(scorer.clone()).with_rubric(WorkerKind::Code, rubric());

        let output = format!("{}\n```json\n{{broken\n```", long_output());
        let verdict = gate.evaluate(&output, &WorkerKind::Code, &ctx()).await.unwrap();

        assert!(!verdict.passed);
        assert!(verdict.issues.iter().any(|i| i.contains("does not parse")));
        assert_eq!(scorer.calls(), 0);
    }

    #[tokio::test]
    async fn test_no_rubric_auto_passes() {
        let scorer = Arc::new(ScriptedScorer::new(Vec::new()));
        let gate = QualityGate::new(scorer.clone());

        let verdict = gate
            .evaluate(&long_output(), &WorkerKind::Media, &ctx())
            .await
            .unwrap();

        assert!(verdict.passed);
        assert_eq!(verdict.score, 1.0);
        assert_eq!(scorer.calls(), 0);
    }

    #[tokio::test]
    async fn test_score_above_threshold_passes() {
        let scorer = Arc::new(ScriptedScorer::new(vec![rubric_response(0.9)]));
        let gate = QualityGate::new(scorer.clone()).with_rubric(WorkerKind::Research, rubric());

        let verdict = gate
            .evaluate(&long_output(), &WorkerKind::Research, &ctx())
            .await
            .unwrap();

        assert!(verdict.passed);
        assert_eq!(verdict.score, 0.9);
        assert_eq!(scorer.calls(), 1);
    }

    #[tokio::test]
    async fn test_borderline_escalates_to_premium_tier() {
        let first = rubric_response(0.6);
        let second = rubric_response(0.85);
        let scorer = Arc::new(ScriptedScorer::new(vec![first, second]));
        let gate = QualityGate::new(scorer.clone()).with_rubric(WorkerKind::Research, rubric());

        let verdict = gate
            .evaluate(&long_output(), &WorkerKind::Research, &ctx())
            .await
            .unwrap();

        assert_eq!(scorer.calls(), 2);
        assert!(verdict.passed);
        assert_eq!(verdict.score, 0.85);
        let tiers = scorer.tiers.lock().unwrap();
        assert_eq!(*tiers, vec![ModelTier::Standard, ModelTier::Premium]);
    }

    #[tokio::test]
    async fn test_borderline_without_escalation_keeps_first_score() {
        let first = rubric_response(0.6);
        let scorer = Arc::new(ScriptedScorer::new(vec![first]));
        let mut r = rubric();
        r.escalate_borderline = false;
        let gate = QualityGate::new(scorer.clone()).with_rubric(WorkerKind::Research, r);

        let verdict = gate
            .evaluate(&long_output(), &WorkerKind::Research, &ctx())
            .await
            .unwrap();

        assert_eq!(scorer.calls(), 1);
        assert!(!verdict.passed);
        assert_eq!(verdict.score, 0.6);
    }

    #[tokio::test]
    async fn test_hallucination_warning_blocks_pass() {
        let response = "```json\n{\"score\": 0.95, \"hallucination_warnings\": \
                        [\"cites a nonexistent paper\"]}\n```";
        let scorer = Arc::new(ScriptedScorer::new(vec![response.to_string()]));
        let gate = QualityGate::new(scorer).with_rubric(WorkerKind::Research, rubric());

        let verdict = gate
            .evaluate(&long_output(), &WorkerKind::Research, &ctx())
            .await
            .unwrap();

        assert!(!verdict.passed);
        assert!(verdict.issues[0].starts_with("hallucination:"));
    }

    #[tokio::test]
    async fn test_unparseable_rubric_response_is_an_error() {
        let scorer = Arc::new(ScriptedScorer::new(vec!["I refuse to grade this.".to_string()]));
        let gate = QualityGate::new(scorer).with_rubric(WorkerKind::Code, rubric());

        let result = gate.evaluate(&long_output(), &WorkerKind::Code, &ctx()).await;
        assert!(matches!(result, Err(TaskloomError::Quality(_))));
    }

    #[tokio::test]
    async fn test_failed_evaluation_emits_insight() {
        struct CapturingSink(Mutex<Vec<InsightRecord>>);

        #[async_trait]
        impl InsightSink for CapturingSink {
            async fn record(&self, insight: InsightRecord) -> TaskloomResult<()> {
                self.0.lock().unwrap().push(insight);
                Ok(())
            }
        }

        let sink = Arc::new(CapturingSink(Mutex::new(Vec::new())));
        let scorer = Arc::new(ScriptedScorer::new(vec![rubric_response(0.2)]));
        let gate = QualityGate::new(scorer)
            .with_rubric(WorkerKind::Design, rubric())
            .with_insight_sink(sink.clone());

        let verdict = gate
            .evaluate(&long_output(), &WorkerKind::Design, &ctx())
            .await
            .unwrap();
        assert!(!verdict.passed);

        let records = sink.0.lock().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].subject, "design");
        assert_eq!(records[0].improvement_suggestions, vec!["add sources"]);
    }

    #[tokio::test]
    async fn test_file_insight_sink_appends_jsonl() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("insights.jsonl");
        let sink = FileInsightSink::new(path.clone());

        for score in [0.1, 0.2] {
            sink.record(InsightRecord {
                subject: "code".to_string(),
                score,
                failed_criteria: vec![],
                hallucination_flagged: false,
                improvement_suggestions: vec![],
                recorded_at: Utc::now(),
            })
            .await
            .unwrap();
        }

        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content.lines().count(), 2);
        let first: InsightRecord = serde_json::from_str(content.lines().next().unwrap()).unwrap();
        assert_eq!(first.score, 0.1);
    }
}
