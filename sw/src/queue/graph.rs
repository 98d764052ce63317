//! DAG validation and wave layering
//!
//! The decomposer's output is validated (unique ids, known dependencies, no
//! cycles) before it reaches the queue, and every task gets a wave via
//! longest-path layering from the roots: a task's wave is one past the
//! deepest of its dependencies.

use std::collections::{HashMap, HashSet, VecDeque};

use eyre::{Result, bail};

use crate::domain::Task;

/// Validate ids and dependency references, and reject cycles
pub fn validate(tasks: &[Task]) -> Result<()> {
    let mut ids = HashSet::new();
    for task in tasks {
        if !ids.insert(task.id.as_str()) {
            bail!("Duplicate task id: {}", task.id);
        }
    }

    for task in tasks {
        for dep in &task.dependencies {
            if dep == &task.id {
                bail!("Task {} depends on itself", task.id);
            }
            if !ids.contains(dep.as_str()) {
                bail!("Task {} depends on unknown task {}", task.id, dep);
            }
        }
    }

    if let Some(cycle) = find_cycle(tasks) {
        bail!("Circular dependency detected: {}", cycle.join(" -> "));
    }

    Ok(())
}

/// Find a dependency cycle, if any, via iterative DFS coloring
fn find_cycle(tasks: &[Task]) -> Option<Vec<String>> {
    let deps: HashMap<&str, &[String]> = tasks.iter().map(|t| (t.id.as_str(), t.dependencies.as_slice())).collect();

    // 0 = unvisited, 1 = in progress, 2 = done
    let mut color: HashMap<&str, u8> = HashMap::new();

    for task in tasks {
        if color.get(task.id.as_str()).copied().unwrap_or(0) != 0 {
            continue;
        }
        // stack of (node, next dep index)
        let mut stack: Vec<(&str, usize)> = vec![(task.id.as_str(), 0)];
        color.insert(task.id.as_str(), 1);

        while let Some((node, idx)) = stack.pop() {
            let node_deps = deps.get(node).copied().unwrap_or(&[]);
            if idx < node_deps.len() {
                stack.push((node, idx + 1));
                let dep = node_deps[idx].as_str();
                match color.get(dep).copied().unwrap_or(0) {
                    0 => {
                        color.insert(dep, 1);
                        stack.push((dep, 0));
                    }
                    1 => {
                        // Back-edge: report the in-progress chain
                        let mut cycle: Vec<String> = stack.iter().map(|(n, _)| n.to_string()).collect();
                        cycle.push(dep.to_string());
                        return Some(cycle);
                    }
                    _ => {}
                }
            } else {
                color.insert(node, 2);
            }
        }
    }

    None
}

/// Assign waves by longest path from the roots (roots get wave 1)
///
/// Assumes `validate` passed. Returns id → wave. Kahn's ordering with
/// max-propagation: a node is dequeued only after every dependency has
/// propagated into it, so its wave is final at dequeue time.
pub fn assign_waves(tasks: &[Task]) -> HashMap<String, u32> {
    let mut indegree: HashMap<&str, usize> = tasks.iter().map(|t| (t.id.as_str(), t.dependencies.len())).collect();
    let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();
    for task in tasks {
        for dep in &task.dependencies {
            dependents.entry(dep.as_str()).or_default().push(task.id.as_str());
        }
    }

    let mut waves: HashMap<String, u32> = HashMap::new();
    let mut queue: VecDeque<&str> = indegree
        .iter()
        .filter(|&(_, deg)| *deg == 0)
        .map(|(id, _)| *id)
        .collect();

    for id in &queue {
        waves.insert(id.to_string(), 1);
    }

    while let Some(node) = queue.pop_front() {
        let node_wave = waves.get(node).copied().unwrap_or(1);
        for dependent in dependents.get(node).cloned().unwrap_or_default() {
            let entry = waves.entry(dependent.to_string()).or_insert(1);
            *entry = (*entry).max(node_wave + 1);
            let deg = indegree.get_mut(dependent).unwrap();
            *deg -= 1;
            if *deg == 0 {
                queue.push_back(dependent);
            }
        }
    }

    waves
}

/// Direct dependents per task id
pub fn direct_dependents(tasks: &[Task]) -> HashMap<String, Vec<String>> {
    let mut out: HashMap<String, Vec<String>> = HashMap::new();
    for task in tasks {
        out.entry(task.id.clone()).or_default();
        for dep in &task.dependencies {
            out.entry(dep.clone()).or_default().push(task.id.clone());
        }
    }
    out
}

/// Ids of every task transitively depending on `root` (excludes `root`)
pub fn transitive_dependents(root: &str, dependents: &HashMap<String, Vec<String>>) -> Vec<String> {
    let mut seen: HashSet<&str> = HashSet::new();
    let mut queue: VecDeque<&str> = VecDeque::new();
    queue.push_back(root);

    let mut out = Vec::new();
    while let Some(node) = queue.pop_front() {
        for dep in dependents.get(node).map(|v| v.as_slice()).unwrap_or(&[]) {
            if seen.insert(dep.as_str()) {
                out.push(dep.clone());
                queue.push_back(dep.as_str());
            }
        }
    }
    out
}
