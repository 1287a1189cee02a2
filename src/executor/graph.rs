use std::collections::{HashMap, HashSet, VecDeque};

use crate::error::{QuorumError, Result};
use crate::workflow::types::{Task, TaskStatus, Workflow};

/// Reject plans whose dependencies reference unknown tasks or form a cycle.
/// Runs once at plan ingestion and again before execution.
pub fn validate_plan(workflow: &Workflow) -> Result<()> {
    for task in workflow.tasks.values() {
        for dep in &task.dependencies {
            if !workflow.tasks.contains_key(dep) {
                return Err(QuorumError::validation(format!(
                    "task '{}' depends on unknown task '{dep}'",
                    task.id
                )));
            }
            if dep == &task.id {
                return Err(QuorumError::CyclicPlan(format!(
                    "task '{}' depends on itself",
                    task.id
                )));
            }
        }
    }
    detect_cycle(&workflow.tasks.values().collect::<Vec<_>>())
}

/// Kahn's algorithm; anything left with in-degree > 0 sits on a cycle.
fn detect_cycle(tasks: &[&Task]) -> Result<()> {
    let mut in_degree: HashMap<&str, usize> = HashMap::new();
    let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();
    for task in tasks {
        in_degree.entry(task.id.as_str()).or_insert(0);
        for dep in &task.dependencies {
            *in_degree.entry(task.id.as_str()).or_insert(0) += 1;
            dependents
                .entry(dep.as_str())
                .or_default()
                .push(task.id.as_str());
        }
    }

    let mut queue: VecDeque<&str> = in_degree
        .iter()
        .filter(|(_, d)| **d == 0)
        .map(|(id, _)| *id)
        .collect();
    let mut visited = 0usize;
    while let Some(id) = queue.pop_front() {
        visited += 1;
        for dependent in dependents.get(id).cloned().unwrap_or_default() {
            if let Some(degree) = in_degree.get_mut(dependent) {
                *degree -= 1;
                if *degree == 0 {
                    queue.push_back(dependent);
                }
            }
        }
    }

    if visited != tasks.len() {
        let mut stuck: Vec<&str> = in_degree
            .iter()
            .filter(|(_, d)| **d > 0)
            .map(|(id, _)| *id)
            .collect();
        stuck.sort_unstable();
        return Err(QuorumError::CyclicPlan(stuck.join(", ")));
    }
    Ok(())
}

/// A task is eligible iff it is pending and every dependency completed.
pub fn eligible_ids(workflow: &Workflow) -> Vec<String> {
    workflow
        .ordered_task_ids()
        .into_iter()
        .filter(|id| {
            let Some(task) = workflow.tasks.get(id) else {
                return false;
            };
            task.status == TaskStatus::Pending
                && task.dependencies.iter().all(|dep| {
                    workflow
                        .tasks
                        .get(dep)
                        .map(|d| d.status == TaskStatus::Completed)
                        .unwrap_or(false)
                })
        })
        .collect()
}

/// Pending tasks with a failed or skipped dependency, paired with the
/// dependency that dooms them. Applied transitively by repeated sweeps.
pub fn doomed_ids(workflow: &Workflow) -> Vec<(String, String)> {
    workflow
        .ordered_task_ids()
        .into_iter()
        .filter_map(|id| {
            let task = workflow.tasks.get(&id)?;
            if task.status != TaskStatus::Pending {
                return None;
            }
            let bad_dep = task.dependencies.iter().find(|dep| {
                workflow
                    .tasks
                    .get(*dep)
                    .map(|d| matches!(d.status, TaskStatus::Failed | TaskStatus::Skipped))
                    .unwrap_or(false)
            })?;
            Some((id.clone(), bad_dep.clone()))
        })
        .collect()
}

/// True while any task could still change state.
pub fn has_schedulable_work(workflow: &Workflow) -> bool {
    workflow
        .tasks
        .values()
        .any(|t| matches!(t.status, TaskStatus::Pending | TaskStatus::Running))
}

/// Transitive dependents of `root`. Isolation is only promised between
/// concurrent tasks outside each other's descendant sets; the isolation
/// suite leans on this to pick its task pairs.
pub fn descendants(workflow: &Workflow, root: &str) -> HashSet<String> {
    let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();
    for task in workflow.tasks.values() {
        for dep in &task.dependencies {
            dependents.entry(dep.as_str()).or_default().push(&task.id);
        }
    }
    let mut out = HashSet::new();
    let mut queue: VecDeque<&str> = VecDeque::from([root]);
    while let Some(id) = queue.pop_front() {
        for dependent in dependents.get(id).into_iter().flatten() {
            if out.insert((*dependent).to_string()) {
                queue.push_back(dependent);
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::types::Task;

    fn plan(specs: &[(&str, &[&str])]) -> Workflow {
        let mut wf = Workflow::new("p", "t", "main");
        let tasks = specs
            .iter()
            .map(|(id, deps)| {
                Task::new(*id, format!("task {id}"), "claude")
                    .with_dependencies(deps.iter().map(|d| d.to_string()).collect())
            })
            .collect();
        wf.install_plan(tasks, false);
        wf
    }

    #[test]
    fn linear_plan_validates() {
        let wf = plan(&[("t1", &[]), ("t2", &["t1"]), ("t3", &["t2"])]);
        validate_plan(&wf).unwrap();
    }

    #[test]
    fn cycle_is_rejected() {
        let wf = plan(&[("t1", &["t3"]), ("t2", &["t1"]), ("t3", &["t2"])]);
        let err = validate_plan(&wf).unwrap_err();
        assert!(matches!(err, QuorumError::CyclicPlan(_)));
    }

    #[test]
    fn self_dependency_is_a_cycle() {
        let wf = plan(&[("t1", &["t1"])]);
        assert!(matches!(
            validate_plan(&wf).unwrap_err(),
            QuorumError::CyclicPlan(_)
        ));
    }

    #[test]
    fn unknown_dependency_is_validation() {
        let wf = plan(&[("t1", &["ghost"])]);
        assert!(matches!(
            validate_plan(&wf).unwrap_err(),
            QuorumError::Validation(_)
        ));
    }

    #[test]
    fn eligibility_respects_order_and_deps() {
        let mut wf = plan(&[("t1", &[]), ("t2", &["t1"]), ("t3", &[])]);
        assert_eq!(eligible_ids(&wf), vec!["t1", "t3"]);

        wf.tasks.get_mut("t1").unwrap().status = TaskStatus::Completed;
        assert_eq!(eligible_ids(&wf), vec!["t2", "t3"]);
    }

    #[test]
    fn failed_dependency_dooms_dependents() {
        let mut wf = plan(&[("t1", &[]), ("t2", &["t1"]), ("t3", &["t2"])]);
        wf.tasks.get_mut("t1").unwrap().status = TaskStatus::Failed;
        assert_eq!(doomed_ids(&wf), vec![("t2".to_string(), "t1".to_string())]);

        // Skip propagates transitively once t2 is marked.
        wf.tasks.get_mut("t2").unwrap().status = TaskStatus::Skipped;
        assert_eq!(doomed_ids(&wf), vec![("t3".to_string(), "t2".to_string())]);
    }

    #[test]
    fn descendants_are_transitive() {
        let wf = plan(&[("t1", &[]), ("t2", &["t1"]), ("t3", &["t2"]), ("t4", &[])]);
        let d = descendants(&wf, "t1");
        assert!(d.contains("t2") && d.contains("t3"));
        assert!(!d.contains("t4"));
    }
}
