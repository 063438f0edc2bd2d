use std::collections::HashMap;
use taskloom_core::WorkerTaskSpec;
use tracing::warn;

/// Dependency graph over one batch of worker tasks.
///
/// Built once from the leader's plan. Dependency ids that reference tasks
/// outside the batch contribute no in-degree and are logged, not rejected.
pub struct TaskGraph {
    tasks: HashMap<String, WorkerTaskSpec>,
    /// Insertion order, kept for deterministic layering.
    order: Vec<String>,
}

impl TaskGraph {
    /// Build a graph from a task list. Duplicate ids keep the first
    /// occurrence.
    pub fn new(specs: Vec<WorkerTaskSpec>) -> Self {
        let mut tasks = HashMap::with_capacity(specs.len());
        let mut order = Vec::with_capacity(specs.len());
        for spec in specs {
            if tasks.contains_key(&spec.id) {
                warn!(task_id = %spec.id, "duplicate task id in batch, keeping first");
                continue;
            }
            order.push(spec.id.clone());
            tasks.insert(spec.id.clone(), spec);
        }
        Self { tasks, order }
    }

    /// O(1) lookup by task id.
    pub fn get(&self, id: &str) -> Option<&WorkerTaskSpec> {
        self.tasks.get(id)
    }

    /// Number of tasks in the graph.
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// Whether the graph holds no tasks.
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Task ids in insertion order.
    pub fn task_ids(&self) -> &[String] {
        &self.order
    }

    /// Compute topological execution layers with Kahn's algorithm.
    ///
    /// Each layer holds every task whose dependencies are already satisfied,
    /// so all tasks in a layer may run concurrently. If a cycle leaves tasks
    /// unscheduled once the frontier empties, the remainder is appended as
    /// one final layer and a warning is logged; the call always terminates
    /// and returns every task exactly once.
    pub fn execution_layers(&self) -> Vec<Vec<String>> {
        let mut indegree: HashMap<&str, usize> = HashMap::with_capacity(self.tasks.len());
        let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();

        for id in &self.order {
            indegree.entry(id.as_str()).or_insert(0);
        }
        for id in &self.order {
            let spec = &self.tasks[id];
            for dep in &spec.depends_on {
                if !self.tasks.contains_key(dep) {
                    warn!(task_id = %id, dep = %dep, "dependency references a task outside the batch, ignoring");
                    continue;
                }
                if let Some(d) = indegree.get_mut(id.as_str()) {
                    *d += 1;
                }
                dependents.entry(dep.as_str()).or_default().push(id);
            }
        }

        let mut layers: Vec<Vec<String>> = Vec::new();
        let mut scheduled = 0usize;
        let mut frontier: Vec<&str> = self
            .order
            .iter()
            .map(String::as_str)
            .filter(|id| indegree[*id] == 0)
            .collect();

        while !frontier.is_empty() {
            scheduled += frontier.len();
            let mut next: Vec<&str> = Vec::new();
            for id in &frontier {
                if let Some(children) = dependents.get(*id) {
                    for child in children {
                        if let Some(d) = indegree.get_mut(*child) {
                            *d -= 1;
                            if *d == 0 {
                                next.push(*child);
                            }
                        }
                    }
                }
            }
            layers.push(frontier.iter().map(|id| (*id).to_string()).collect());
            frontier = next;
        }

        if scheduled < self.tasks.len() {
            // Cyclic remainder: schedule it anyway so the run terminates.
            let remainder: Vec<String> = self
                .order
                .iter()
                .filter(|id| indegree[id.as_str()] > 0)
                .cloned()
                .collect();
            warn!(
                remaining = remainder.len(),
                "dependency cycle detected, scheduling remainder as final layer"
            );
            layers.push(remainder);
        }

        layers
    }
}
