use crate::error::TaskloomResult;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

/// Default deadline for content-generation jobs.
pub const GENERATION_TIMEOUT: Duration = Duration::from_secs(300);
/// Default deadline for quality-scoring jobs.
pub const QUALITY_TIMEOUT: Duration = Duration::from_secs(60);

/// Cost tier the job queue should route a request to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelTier {
    /// Low-cost tier for generation and first-pass scoring.
    Standard,
    /// Higher-cost tier for borderline re-scoring and hard tasks.
    Premium,
}

/// Handle to a submitted job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobId(pub Uuid);

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One request to the LLM job queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRequest {
    /// Project the call is billed against.
    pub project_id: String,
    /// Agent identity making the call.
    pub agent_id: String,
    /// Cost tier.
    pub tier: ModelTier,
    /// Optional system prompt.
    pub system_prompt: Option<String>,
    /// User prompt.
    pub prompt: String,
    /// Completion-side token budget.
    pub max_tokens: u32,
    /// Sampling temperature.
    pub temperature: f32,
}

impl JobRequest {
    /// Build a standard-tier request with sane generation defaults.
    pub fn new(
        project_id: impl Into<String>,
        agent_id: impl Into<String>,
        prompt: impl Into<String>,
    ) -> Self {
        Self {
            project_id: project_id.into(),
            agent_id: agent_id.into(),
            tier: ModelTier::Standard,
            system_prompt: None,
            prompt: prompt.into(),
            max_tokens: 4096,
            temperature: 0.4,
        }
    }

    /// Set the system prompt.
    pub fn with_system_prompt(mut self, system_prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(system_prompt.into());
        self
    }

    /// Set the cost tier.
    pub fn with_tier(mut self, tier: ModelTier) -> Self {
        self.tier = tier;
        self
    }

    /// Set sampling temperature.
    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    /// Set the completion token budget.
    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }
}

/// Settled output of a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobOutcome {
    /// The generated text.
    pub content: String,
    /// Prompt-side tokens consumed.
    pub tokens_in: u64,
    /// Completion-side tokens consumed.
    pub tokens_out: u64,
}

/// Async RPC contract to the external LLM job queue.
///
/// The orchestrator never implements the LLM call itself: it submits a job,
/// then awaits the outcome under an explicit deadline. Failed or timed-out
/// jobs surface as [`crate::TaskloomError`] values the retry policy can
/// classify.
#[async_trait]
pub trait JobClient: Send + Sync {
    /// Enqueue a job, returning its handle.
    async fn submit(&self, request: JobRequest) -> TaskloomResult<JobId>;

    /// Await a submitted job's outcome under the given deadline.
    async fn wait(&self, job: JobId, timeout: Duration) -> TaskloomResult<JobOutcome>;

    /// Submit a job and await it in one step.
    async fn execute(&self, request: JobRequest, timeout: Duration) -> TaskloomResult<JobOutcome> {
        let job = self.submit(request).await?;
        self.wait(job, timeout).await
    }
}
