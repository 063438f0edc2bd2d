use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use taskloom_core::{
    SnapshotStatus, StepKind, TaskloomError, TaskloomResult, TokenUsage, WorkerKind,
    WorkerTaskSpec, WorkflowSnapshot,
};
use tokio::sync::RwLock;
use uuid::Uuid;

/// Step id used for the leader snapshot of a run.
pub const LEADER_STEP_ID: &str = "leader";
/// Step id used for the integration snapshot of a run.
pub const INTEGRATION_STEP_ID: &str = "integration";

/// Payload stored with a `worker_completed` snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerStepState {
    /// Worker kind that produced the output.
    pub worker: WorkerKind,
    /// The output kept for integration on resume.
    pub output: String,
    /// Tokens the worker consumed.
    #[serde(default)]
    pub tokens: TokenUsage,
}

/// Payload stored with a `leader_completed` snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaderStepState {
    /// The leader's full text output.
    pub output: String,
}

/// Everything needed to resume an interrupted run without redoing work.
#[derive(Debug, Clone)]
pub struct ResumeState {
    /// The run being resumed.
    pub run_id: Uuid,
    /// Original task list, from the leader snapshot.
    pub worker_tasks: Vec<WorkerTaskSpec>,
    /// Completed worker steps keyed by task id.
    pub completed: HashMap<String, WorkerStepState>,
}

/// Persistence contract for workflow progress markers.
///
/// Writes are append-only per run; each implementation also maintains a
/// materialized latest-per-`(run, step_id)` view so resume never scans the
/// whole log. Callers treat `save` as best-effort: failures are logged and
/// swallowed, never allowed to block the pipeline.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// Append one snapshot and update the materialized view.
    async fn save(&self, snapshot: WorkflowSnapshot) -> TaskloomResult<()>;

    /// Find the latest resumable run for an agent, reconstructing its
    /// completed worker steps and original task list. `None` when no usable
    /// snapshot exists.
    async fn load_completed_workers(&self, agent_id: &str)
        -> TaskloomResult<Option<ResumeState>>;

    /// The leader's output for a run, when its leader step completed.
    async fn leader_output_from_run(&self, run_id: Uuid) -> TaskloomResult<Option<String>>;

    /// Full append-only log for a run, in write order.
    async fn list_by_run(&self, run_id: Uuid) -> TaskloomResult<Vec<WorkflowSnapshot>>;

    /// Mark every snapshot of a run invalidated, removing it from resume.
    async fn invalidate_run(&self, run_id: Uuid) -> TaskloomResult<()>;
}

/// Build a resume state from the materialized view of one run.
fn resume_from_view(
    run_id: Uuid,
    view: &HashMap<String, WorkflowSnapshot>,
) -> Option<ResumeState> {
    let leader = view
        .get(LEADER_STEP_ID)
        .filter(|s| s.step == StepKind::LeaderCompleted && s.status == SnapshotStatus::Active)?;

    let mut completed = HashMap::new();
    for snap in view.values() {
        if snap.step != StepKind::WorkerCompleted || snap.status != SnapshotStatus::Active {
            continue;
        }
        if let Ok(state) = serde_json::from_value::<WorkerStepState>(snap.state.clone()) {
            completed.insert(snap.step_id.clone(), state);
        }
    }

    Some(ResumeState {
        run_id,
        worker_tasks: leader.worker_tasks.clone(),
        completed,
    })
}

#[derive(Default)]
struct MemoryInner {
    log: Vec<WorkflowSnapshot>,
    /// Materialized latest-per-(run, step_id) view.
    view: HashMap<Uuid, HashMap<String, WorkflowSnapshot>>,
    /// Latest run started per agent.
    agent_runs: HashMap<String, Uuid>,
}

/// In-memory snapshot store for tests and embedded use.
#[derive(Default)]
pub struct MemorySnapshotStore {
    inner: RwLock<MemoryInner>,
}

impl MemorySnapshotStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SnapshotStore for MemorySnapshotStore {
    async fn save(&self, snapshot: WorkflowSnapshot) -> TaskloomResult<()> {
        let mut inner = self.inner.write().await;
        inner
            .agent_runs
            .insert(snapshot.agent_id.clone(), snapshot.run_id);
        inner
            .view
            .entry(snapshot.run_id)
            .or_default()
            .insert(snapshot.step_id.clone(), snapshot.clone());
        inner.log.push(snapshot);
        Ok(())
    }

    async fn load_completed_workers(
        &self,
        agent_id: &str,
    ) -> TaskloomResult<Option<ResumeState>> {
        let inner = self.inner.read().await;
        let Some(run_id) = inner.agent_runs.get(agent_id) else {
            return Ok(None);
        };
        let Some(view) = inner.view.get(run_id) else {
            return Ok(None);
        };
        Ok(resume_from_view(*run_id, view))
    }

    async fn leader_output_from_run(&self, run_id: Uuid) -> TaskloomResult<Option<String>> {
        let inner = self.inner.read().await;
        let Some(snap) = inner
            .view
            .get(&run_id)
            .and_then(|view| view.get(LEADER_STEP_ID))
            .filter(|s| s.status == SnapshotStatus::Active)
        else {
            return Ok(None);
        };
        let state: LeaderStepState = serde_json::from_value(snap.state.clone())?;
        Ok(Some(state.output))
    }

    async fn list_by_run(&self, run_id: Uuid) -> TaskloomResult<Vec<WorkflowSnapshot>> {
        let inner = self.inner.read().await;
        Ok(inner
            .log
            .iter()
            .filter(|s| s.run_id == run_id)
            .cloned()
            .collect())
    }

    async fn invalidate_run(&self, run_id: Uuid) -> TaskloomResult<()> {
        let mut inner = self.inner.write().await;
        for snap in inner.log.iter_mut().filter(|s| s.run_id == run_id) {
            snap.status = SnapshotStatus::Invalidated;
        }
        if let Some(view) = inner.view.get_mut(&run_id) {
            for snap in view.values_mut() {
                snap.status = SnapshotStatus::Invalidated;
            }
        }
        inner.agent_runs.retain(|_, run| *run != run_id);
        Ok(())
    }
}

/// File-backed snapshot store: one directory per run holding an append-only
/// `log.jsonl` plus a materialized `index.json`, and one pointer file per
/// agent naming its latest run. Index and pointer writes go through a temp
/// file and rename.
pub struct FileSnapshotStore {
    dir: PathBuf,
}

impl FileSnapshotStore {
    /// Store rooted at `dir`, created on demand.
    pub async fn new(dir: PathBuf) -> TaskloomResult<Self> {
        tokio::fs::create_dir_all(dir.join("runs")).await?;
        tokio::fs::create_dir_all(dir.join("agents")).await?;
        Ok(Self { dir })
    }

    fn run_dir(&self, run_id: Uuid) -> PathBuf {
        self.dir.join("runs").join(run_id.to_string())
    }

    fn agent_path(&self, agent_id: &str) -> PathBuf {
        // Agent ids are caller-controlled; keep the filename safe.
        let safe: String = agent_id
            .chars()
            .map(|c| if c.is_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.dir.join("agents").join(format!("{safe}.json"))
    }

    async fn read_index(&self, run_id: Uuid) -> TaskloomResult<HashMap<String, WorkflowSnapshot>> {
        let path = self.run_dir(run_id).join("index.json");
        if !path.exists() {
            return Ok(HashMap::new());
        }
        let data = tokio::fs::read_to_string(&path).await?;
        serde_json::from_str(&data)
            .map_err(|e| TaskloomError::Snapshot(format!("corrupt snapshot index: {e}")))
    }

    async fn write_index(
        &self,
        run_id: Uuid,
        index: &HashMap<String, WorkflowSnapshot>,
    ) -> TaskloomResult<()> {
        let dir = self.run_dir(run_id);
        let tmp = dir.join("index.json.tmp");
        let path = dir.join("index.json");
        tokio::fs::write(&tmp, serde_json::to_string_pretty(index)?).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }
}

#[async_trait]
impl SnapshotStore for FileSnapshotStore {
    async fn save(&self, snapshot: WorkflowSnapshot) -> TaskloomResult<()> {
        let dir = self.run_dir(snapshot.run_id);
        tokio::fs::create_dir_all(&dir).await?;

        let mut line = serde_json::to_string(&snapshot)?;
        line.push('\n');
        let log_path = dir.join("log.jsonl");
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .await?;
        tokio::io::AsyncWriteExt::write_all(&mut file, line.as_bytes()).await?;

        let mut index = self.read_index(snapshot.run_id).await?;
        index.insert(snapshot.step_id.clone(), snapshot.clone());
        self.write_index(snapshot.run_id, &index).await?;

        let pointer = serde_json::json!({ "run_id": snapshot.run_id });
        let agent_path = self.agent_path(&snapshot.agent_id);
        let tmp = agent_path.with_extension("json.tmp");
        tokio::fs::write(&tmp, serde_json::to_string(&pointer)?).await?;
        tokio::fs::rename(&tmp, &agent_path).await?;

        Ok(())
    }

    async fn load_completed_workers(
        &self,
        agent_id: &str,
    ) -> TaskloomResult<Option<ResumeState>> {
        let pointer_path = self.agent_path(agent_id);
        if !pointer_path.exists() {
            return Ok(None);
        }
        let data = tokio::fs::read_to_string(&pointer_path).await?;
        let pointer: serde_json::Value = serde_json::from_str(&data)
            .map_err(|e| TaskloomError::Snapshot(format!("corrupt agent pointer: {e}")))?;
        let Some(run_id) = pointer
            .get("run_id")
            .and_then(|v| v.as_str())
            .and_then(|s| Uuid::parse_str(s).ok())
        else {
            return Ok(None);
        };

        let index = self.read_index(run_id).await?;
        Ok(resume_from_view(run_id, &index))
    }

    async fn leader_output_from_run(&self, run_id: Uuid) -> TaskloomResult<Option<String>> {
        let index = self.read_index(run_id).await?;
        let Some(snap) = index
            .get(LEADER_STEP_ID)
            .filter(|s| s.status == SnapshotStatus::Active)
        else {
            return Ok(None);
        };
        let state: LeaderStepState = serde_json::from_value(snap.state.clone())?;
        Ok(Some(state.output))
    }

    async fn list_by_run(&self, run_id: Uuid) -> TaskloomResult<Vec<WorkflowSnapshot>> {
        let log_path = self.run_dir(run_id).join("log.jsonl");
        if !log_path.exists() {
            return Ok(Vec::new());
        }
        let data = tokio::fs::read_to_string(&log_path).await?;
        let mut snapshots = Vec::new();
        for line in data.lines().filter(|l| !l.trim().is_empty()) {
            let snap: WorkflowSnapshot = serde_json::from_str(line)
                .map_err(|e| TaskloomError::Snapshot(format!("corrupt snapshot log: {e}")))?;
            snapshots.push(snap);
        }
        Ok(snapshots)
    }

    async fn invalidate_run(&self, run_id: Uuid) -> TaskloomResult<()> {
        let mut index = self.read_index(run_id).await?;
        if index.is_empty() {
            return Ok(());
        }
        let agent_ids: Vec<String> = index.values().map(|s| s.agent_id.clone()).collect();
        for snap in index.values_mut() {
            snap.status = SnapshotStatus::Invalidated;
        }
        self.write_index(run_id, &index).await?;

        // Drop agent pointers that still reference this run.
        for agent_id in agent_ids {
            let path = self.agent_path(&agent_id);
            if !path.exists() {
                continue;
            }
            let data = tokio::fs::read_to_string(&path).await?;
            if data.contains(&run_id.to_string()) {
                tokio::fs::remove_file(&path).await?;
            }
        }
        Ok(())
    }
}
