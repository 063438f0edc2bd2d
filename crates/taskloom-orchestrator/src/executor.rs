use crate::graph::TaskGraph;
use futures_util::future::join_all;
use std::future::Future;
use taskloom_core::{TaskloomResult, WorkerTaskSpec};
use tracing::{info, warn};

/// Execute a task graph layer by layer.
///
/// For each topological layer, `on_layer_start` is invoked for progress
/// reporting, then every task in the layer runs concurrently through
/// `exec_fn`. The layer is awaited to completion before the next one starts;
/// this sequencing is what encodes dependency ordering. A layer of size one
/// is awaited directly, without fan-out.
///
/// A task's error never aborts its siblings: each outcome is captured and
/// paired with its task id, and the caller decides what a failure means.
pub async fn execute_layers<F, Fut, T, H>(
    graph: &TaskGraph,
    exec_fn: F,
    mut on_layer_start: H,
) -> Vec<(String, TaskloomResult<T>)>
where
    F: Fn(WorkerTaskSpec) -> Fut,
    Fut: Future<Output = TaskloomResult<T>>,
    H: FnMut(usize, &[String]),
{
    let layers = graph.execution_layers();
    let mut outcomes = Vec::with_capacity(graph.len());

    for (index, layer) in layers.iter().enumerate() {
        on_layer_start(index, layer);
        info!(layer = index, tasks = layer.len(), "starting execution layer");

        let specs: Vec<WorkerTaskSpec> = layer
            .iter()
            .filter_map(|id| graph.get(id).cloned())
            .collect();

        if specs.len() == 1 {
            if let Some(spec) = specs.into_iter().next() {
                let id = spec.id.clone();
                let outcome = exec_fn(spec).await;
                if let Err(e) = &outcome {
                    warn!(task_id = %id, error = %e, "task failed, siblings unaffected");
                }
                outcomes.push((id, outcome));
            }
            continue;
        }

        let ids: Vec<String> = specs.iter().map(|s| s.id.clone()).collect();
        let settled = join_all(specs.into_iter().map(&exec_fn)).await;
        for (id, outcome) in ids.into_iter().zip(settled) {
            if let Err(e) = &outcome {
                warn!(task_id = %id, error = %e, "task failed, siblings unaffected");
            }
            outcomes.push((id, outcome));
        }
    }

    outcomes
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use taskloom_core::{TaskloomError, WorkerKind};

    fn spec(id: &str, deps: &[&str]) -> WorkerTaskSpec {
        WorkerTaskSpec {
            id: id.to_string(),
            worker: WorkerKind::Code,
            task: format!("task {id}"),
            depends_on: deps.iter().map(|d| (*d).to_string()).collect(),
        }
    }

    #[tokio::test]
    async fn test_layers_run_in_order() {
        let graph = TaskGraph::new(vec![spec("a", &[]), spec("b", &["a"]), spec("c", &["b"])]);
        let log: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let log2 = log.clone();

        let outcomes = execute_layers(
            &graph,
            |task| {
                let log = log2.clone();
                async move {
                    log.lock().unwrap().push(task.id.clone());
                    Ok(task.id)
                }
            },
            |_, _| {},
        )
        .await;

        assert_eq!(outcomes.len(), 3);
        assert_eq!(
            *log.lock().unwrap(),
            vec!["a".to_string(), "b".to_string(), "c".to_string()]
        );
    }

    #[tokio::test]
    async fn test_sibling_failure_is_isolated() {
        let graph = TaskGraph::new(vec![spec("ok", &[]), spec("boom", &[])]);

        let outcomes = execute_layers(
            &graph,
            |task| async move {
                if task.id == "boom" {
                    Err(TaskloomError::Provider("exploded".to_string()))
                } else {
                    Ok("fine".to_string())
                }
            },
            |_, _| {},
        )
        .await;

        assert_eq!(outcomes.len(), 2);
        let ok = outcomes.iter().find(|(id, _)| id == "ok").unwrap();
        let boom = outcomes.iter().find(|(id, _)| id == "boom").unwrap();
        assert!(ok.1.is_ok());
        assert!(boom.1.is_err());
    }

    #[tokio::test]
    async fn test_layer_hook_receives_indices_and_ids() {
        let graph = TaskGraph::new(vec![
            spec("a", &[]),
            spec("b", &[]),
            spec("c", &["a"]),
        ]);
        let seen: Arc<Mutex<Vec<(usize, usize)>>> = Arc::new(Mutex::new(Vec::new()));
        let seen2 = seen.clone();

        execute_layers(
            &graph,
            |task| async move { Ok(task.id) },
            |index, ids| {
                seen2.lock().unwrap().push((index, ids.len()));
            },
        )
        .await;

        assert_eq!(*seen.lock().unwrap(), vec![(0, 2), (1, 1)]);
    }

    #[tokio::test]
    async fn test_next_layer_waits_for_previous() {
        // Two tasks in layer 0, one in layer 1. The layer-1 task must
        // observe both layer-0 completions.
        let graph = TaskGraph::new(vec![
            spec("a", &[]),
            spec("b", &[]),
            spec("c", &["a", "b"]),
        ]);
        let completed = Arc::new(AtomicUsize::new(0));
        let completed2 = completed.clone();

        let outcomes = execute_layers(
            &graph,
            |task| {
                let completed = completed2.clone();
                async move {
                    if task.id == "c" {
                        assert_eq!(completed.load(Ordering::SeqCst), 2);
                    } else {
                        tokio::task::yield_now().await;
                        completed.fetch_add(1, Ordering::SeqCst);
                    }
                    Ok(())
                }
            },
            |_, _| {},
        )
        .await;

        assert!(outcomes.iter().all(|(_, o)| o.is_ok()));
    }
}
