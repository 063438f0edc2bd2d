use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use taskloom_core::{RunPhase, TokenUsage, WorkerKind};
use tokio::sync::RwLock;

/// Status-change event emitted while a run progresses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ProgressEvent {
    /// The pipeline moved to a new phase.
    PhaseChanged {
        /// The phase just entered.
        phase: RunPhase,
    },
    /// A new execution layer is about to fan out.
    LayerStarted {
        /// Zero-based layer index.
        index: usize,
        /// Tasks in the layer.
        task_ids: Vec<String>,
    },
    /// A worker began executing.
    WorkerStarted {
        /// Task id.
        task_id: String,
        /// Worker kind.
        worker: WorkerKind,
    },
    /// A worker's output cleared the quality gate.
    WorkerCompleted {
        /// Task id.
        task_id: String,
        /// Worker kind.
        worker: WorkerKind,
        /// Final quality score, when quality checking ran.
        score: Option<f64>,
    },
    /// A worker failed fatally.
    WorkerFailed {
        /// Task id.
        task_id: String,
        /// Worker kind.
        worker: WorkerKind,
        /// Failure reason.
        reason: String,
    },
    /// A worker exhausted its retries and was routed to a human.
    WorkerNeedsReview {
        /// Task id.
        task_id: String,
        /// Worker kind.
        worker: WorkerKind,
    },
}

/// Callback invoked for every [`ProgressEvent`] (progress UI, logging).
pub type ProgressHook = Arc<dyn Fn(&ProgressEvent) + Send + Sync>;

/// Aggregate counters for one run. Threaded through the pipeline explicitly
/// rather than living in process-wide globals.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunMetrics {
    /// Workers started.
    pub workers_started: u64,
    /// Workers completed.
    pub workers_completed: u64,
    /// Workers failed.
    pub workers_failed: u64,
    /// Workers routed to human review.
    pub workers_needing_review: u64,
    /// Quality-loop retries consumed.
    pub retries: u64,
    /// Tokens spent across the run.
    pub tokens: TokenUsage,
}

/// Tracks run metrics per worker kind and forwards events to an optional
/// hook.
pub struct ProgressTracker {
    hook: Option<ProgressHook>,
    per_kind: RwLock<HashMap<WorkerKind, RunMetrics>>,
    totals: RwLock<RunMetrics>,
}

impl ProgressTracker {
    /// Tracker with no hook attached.
    pub fn new() -> Self {
        Self {
            hook: None,
            per_kind: RwLock::new(HashMap::new()),
            totals: RwLock::new(RunMetrics::default()),
        }
    }

    /// Attach a progress hook.
    pub fn with_hook(mut self, hook: ProgressHook) -> Self {
        self.hook = Some(hook);
        self
    }

    /// Record an event: update counters, then notify the hook.
    pub async fn emit(&self, event: ProgressEvent) {
        {
            let mut totals = self.totals.write().await;
            let mut per_kind = self.per_kind.write().await;
            match &event {
                ProgressEvent::WorkerStarted { worker, .. } => {
                    totals.workers_started += 1;
                    per_kind.entry(worker.clone()).or_default().workers_started += 1;
                }
                ProgressEvent::WorkerCompleted { worker, .. } => {
                    totals.workers_completed += 1;
                    per_kind
                        .entry(worker.clone())
                        .or_default()
                        .workers_completed += 1;
                }
                ProgressEvent::WorkerFailed { worker, .. } => {
                    totals.workers_failed += 1;
                    per_kind.entry(worker.clone()).or_default().workers_failed += 1;
                }
                ProgressEvent::WorkerNeedsReview { worker, .. } => {
                    totals.workers_needing_review += 1;
                    per_kind
                        .entry(worker.clone())
                        .or_default()
                        .workers_needing_review += 1;
                }
                ProgressEvent::PhaseChanged { .. } | ProgressEvent::LayerStarted { .. } => {}
            }
        }
        if let Some(hook) = &self.hook {
            hook(&event);
        }
    }

    /// Record retries and token spend attributed to one worker kind.
    pub async fn record_usage(&self, worker: &WorkerKind, retries: u64, tokens: TokenUsage) {
        let mut totals = self.totals.write().await;
        totals.retries += retries;
        totals.tokens.add(tokens);
        let mut per_kind = self.per_kind.write().await;
        let entry = per_kind.entry(worker.clone()).or_default();
        entry.retries += retries;
        entry.tokens.add(tokens);
    }

    /// Aggregate metrics across the run.
    pub async fn totals(&self) -> RunMetrics {
        self.totals.read().await.clone()
    }

    /// Metrics for one worker kind.
    pub async fn for_kind(&self, worker: &WorkerKind) -> Option<RunMetrics> {
        self.per_kind.read().await.get(worker).cloned()
    }
}

impl Default for ProgressTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[tokio::test]
    async fn test_counters_follow_events() {
        let tracker = ProgressTracker::new();
        tracker
            .emit(ProgressEvent::WorkerStarted {
                task_id: "t1".to_string(),
                worker: WorkerKind::Code,
            })
            .await;
        tracker
            .emit(ProgressEvent::WorkerCompleted {
                task_id: "t1".to_string(),
                worker: WorkerKind::Code,
                score: Some(0.9),
            })
            .await;
        tracker
            .emit(ProgressEvent::WorkerFailed {
                task_id: "t2".to_string(),
                worker: WorkerKind::Media,
                reason: "unknown worker type".to_string(),
            })
            .await;

        let totals = tracker.totals().await;
        assert_eq!(totals.workers_started, 1);
        assert_eq!(totals.workers_completed, 1);
        assert_eq!(totals.workers_failed, 1);

        let code = tracker.for_kind(&WorkerKind::Code).await.unwrap();
        assert_eq!(code.workers_completed, 1);
        assert_eq!(code.workers_failed, 0);
    }

    #[tokio::test]
    async fn test_hook_receives_events() {
        let seen: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let seen2 = seen.clone();
        let tracker = ProgressTracker::new().with_hook(Arc::new(move |event| {
            if let ProgressEvent::WorkerStarted { task_id, .. } = event {
                seen2.lock().unwrap().push(task_id.clone());
            }
        }));

        tracker
            .emit(ProgressEvent::WorkerStarted {
                task_id: "t9".to_string(),
                worker: WorkerKind::Design,
            })
            .await;

        assert_eq!(*seen.lock().unwrap(), vec!["t9".to_string()]);
    }

    #[tokio::test]
    async fn test_usage_accumulates() {
        let tracker = ProgressTracker::new();
        tracker
            .record_usage(
                &WorkerKind::Research,
                2,
                TokenUsage {
                    input: 100,
                    output: 50,
                },
            )
            .await;
        tracker
            .record_usage(
                &WorkerKind::Research,
                1,
                TokenUsage {
                    input: 10,
                    output: 5,
                },
            )
            .await;

        let totals = tracker.totals().await;
        assert_eq!(totals.retries, 3);
        assert_eq!(totals.tokens.input, 110);
        assert_eq!(totals.tokens.output, 55);
    }
}
