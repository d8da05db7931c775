use std::collections::{BTreeSet, HashMap, HashSet};

use super::task::{Task, TaskId};

/// Whether giving `task_id` the dependencies `new_deps` would close a cycle.
///
/// DFS from each candidate dependency along existing dependency edges; a path
/// back to `task_id` means a cycle. Cost is bounded by the current graph
/// size.
pub fn would_create_cycle(
    tasks: &HashMap<TaskId, Task>,
    task_id: TaskId,
    new_deps: &BTreeSet<TaskId>,
) -> bool {
    let mut visited: HashSet<TaskId> = HashSet::new();
    let mut stack: Vec<TaskId> = new_deps.iter().copied().collect();

    while let Some(current) = stack.pop() {
        if current == task_id {
            return true;
        }
        if !visited.insert(current) {
            continue;
        }
        if let Some(task) = tasks.get(&current) {
            stack.extend(task.dependencies.iter().copied());
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::definition::AgentId;
    use crate::broker::message::Priority;
    use crate::task::task::{Requester, TaskStatus};
    use chrono::Utc;

    fn task(id: TaskId, deps: impl IntoIterator<Item = TaskId>) -> Task {
        Task {
            id,
            agent_id: AgentId::new("alpha").unwrap(),
            title: "t".to_string(),
            description: String::new(),
            status: TaskStatus::Todo,
            priority: Priority::Medium,
            requested_by: Requester::User,
            dependencies: deps.into_iter().collect(),
            progress: 0,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            result: None,
            error: None,
        }
    }

    #[test]
    fn self_dependency_is_a_cycle() {
        let a = TaskId::new();
        let tasks = HashMap::from([(a, task(a, []))]);
        assert!(would_create_cycle(&tasks, a, &BTreeSet::from([a])));
    }

    #[test]
    fn chain_is_not_a_cycle() {
        let (a, b, c) = (TaskId::new(), TaskId::new(), TaskId::new());
        let tasks = HashMap::from([(a, task(a, [])), (b, task(b, [a])), (c, task(c, [b]))]);
        // d depending on c keeps the graph a DAG
        assert!(!would_create_cycle(&tasks, TaskId::new(), &BTreeSet::from([c])));
    }

    #[test]
    fn closing_the_loop_is_detected() {
        let (a, b, c) = (TaskId::new(), TaskId::new(), TaskId::new());
        let tasks = HashMap::from([(a, task(a, [])), (b, task(b, [a])), (c, task(c, [b]))]);
        // a depending on c would make a -> c -> b -> a
        assert!(would_create_cycle(&tasks, a, &BTreeSet::from([c])));
    }
}
