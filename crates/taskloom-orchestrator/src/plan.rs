use regex::Regex;
use serde::Deserialize;
use std::collections::HashSet;
use std::sync::OnceLock;
use taskloom_core::WorkerTaskSpec;
use tracing::warn;

fn fenced_json_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?s)```(?:json)?\s*(\{.*?\})\s*```").unwrap_or_else(|e| {
            // A literal pattern; failure here is a programming error.
            panic!("invalid fenced-json regex: {e}")
        })
    })
}

/// Find every fenced JSON object block in a text response, in order.
pub fn fenced_json_blocks(text: &str) -> Vec<&str> {
    fenced_json_re()
        .captures_iter(text)
        .filter_map(|c| c.get(1).map(|m| m.as_str()))
        .collect()
}

#[derive(Debug, Deserialize)]
struct LeaderPlan {
    #[serde(default)]
    worker_tasks: Vec<WorkerTaskSpec>,
}

/// Parse the leader's worker-task plan out of its text response.
///
/// The contract: one fenced JSON block containing a `worker_tasks` array.
/// A missing or malformed block means "no workers needed" and yields an
/// empty list, never an error. Duplicate ids keep the first occurrence;
/// dependencies on ids outside the batch are logged but kept (the graph
/// ignores them when counting in-degree).
pub fn parse_worker_tasks(leader_output: &str) -> Vec<WorkerTaskSpec> {
    let Some(block) = fenced_json_blocks(leader_output)
        .into_iter()
        .find(|b| b.contains("worker_tasks"))
    else {
        warn!("leader output carries no worker_tasks block, treating as no workers needed");
        return Vec::new();
    };

    let plan: LeaderPlan = match serde_json::from_str(block) {
        Ok(plan) => plan,
        Err(e) => {
            warn!(error = %e, "malformed worker_tasks block, treating as no workers needed");
            return Vec::new();
        }
    };

    let mut seen: HashSet<String> = HashSet::new();
    let mut tasks: Vec<WorkerTaskSpec> = Vec::with_capacity(plan.worker_tasks.len());
    for spec in plan.worker_tasks {
        if !seen.insert(spec.id.clone()) {
            warn!(task_id = %spec.id, "duplicate task id in leader plan, keeping first");
            continue;
        }
        tasks.push(spec);
    }

    let ids: HashSet<&str> = tasks.iter().map(|t| t.id.as_str()).collect();
    for task in &tasks {
        for dep in &task.depends_on {
            if !ids.contains(dep.as_str()) {
                warn!(task_id = %task.id, dep = %dep, "task depends on an id outside the batch");
            }
        }
    }

    tasks
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use taskloom_core::WorkerKind;

    #[test]
    fn test_parse_well_formed_plan() {
        let output = r#"Here is my plan.

```json
{"worker_tasks": [
  {"id": "r1", "worker": "research", "task": "gather sources", "depends_on": []},
  {"id": "d1", "worker": "design", "task": "outline", "depends_on": ["r1"]}
]}
```

Good luck."#;
        let tasks = parse_worker_tasks(output);
        assert_eq!(tasks.len(), 2);
        assert_eq!(tasks[0].worker, WorkerKind::Research);
        assert_eq!(tasks[1].depends_on, vec!["r1".to_string()]);
    }

    #[test]
    fn test_missing_block_means_no_workers() {
        assert!(parse_worker_tasks("I can do this alone, no delegation needed.").is_empty());
    }

    #[test]
    fn test_malformed_block_means_no_workers() {
        let output = "```json\n{\"worker_tasks\": [{\"id\": }]}\n```";
        assert!(parse_worker_tasks(output).is_empty());
    }

    #[test]
    fn test_unfenced_json_is_ignored() {
        let output = r#"{"worker_tasks": [{"id": "x", "worker": "code", "task": "t"}]}"#;
        assert!(parse_worker_tasks(output).is_empty());
    }

    #[test]
    fn test_duplicate_ids_keep_first() {
        let output = r#"```json
{"worker_tasks": [
  {"id": "a", "worker": "code", "task": "first"},
  {"id": "a", "worker": "media", "task": "second"}
]}
```"#;
        let tasks = parse_worker_tasks(output);
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].task, "first");
    }

    #[test]
    fn test_unknown_worker_string_preserved() {
        let output = r#"```json
{"worker_tasks": [{"id": "a", "worker": "haiku-smith", "task": "write"}]}
```"#;
        let tasks = parse_worker_tasks(output);
        assert_eq!(
            tasks[0].worker,
            WorkerKind::Unknown("haiku-smith".to_string())
        );
    }

    #[test]
    fn test_picks_block_containing_worker_tasks() {
        let output = r#"```json
{"note": "metadata block"}
```
```json
{"worker_tasks": [{"id": "a", "worker": "review", "task": "check"}]}
```"#;
        let tasks = parse_worker_tasks(output);
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].worker, WorkerKind::Review);
    }

    #[test]
    fn test_fenced_blocks_extraction() {
        let text = "a ```json\n{\"x\":1}\n``` b ```\n{\"y\":2}\n``` c";
        let blocks = fenced_json_blocks(text);
        assert_eq!(blocks.len(), 2);
    }
}
