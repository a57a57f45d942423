//! Independence groups for the calls of one turn.
//!
//! Calls are grouped into execution waves via topological sort. Calls in a
//! wave run concurrently; wave N completes before wave N+1 starts. Two kinds
//! of edges order calls:
//!
//! - **Explicit**: a call may name another call of the same turn in a
//!   `depends_on` argument.
//! - **Implicit**: two calls that touch the same resource, at least one of
//!   them mutating, keep the order the model gave them. A mutating call with
//!   no resource key conflicts with every other call.
//!
//! If the explicit edges form a cycle the whole batch runs sequentially in
//! the order the model gave.

use crate::tools::core::Capability;
use std::collections::{HashMap, VecDeque};
use tracing::{debug, warn};

/// Scheduling facts about one call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduleEntry {
    pub call_id: String,
    pub depends_on: Option<String>,
    pub capability: Capability,
    pub resource_key: Option<String>,
}

/// Indices into the input slice that may run in parallel.
pub type ExecutionWave = Vec<usize>;

/// Whether `a` and `b` must not overlap.
pub fn conflicts(a: &ScheduleEntry, b: &ScheduleEntry) -> bool {
    if !a.capability.is_mutating() && !b.capability.is_mutating() {
        return false;
    }
    match (&a.resource_key, &b.resource_key) {
        (Some(x), Some(y)) => x == y,
        _ => true,
    }
}

/// Build execution waves via Kahn's algorithm.
///
/// Every index appears in exactly one wave. Within a wave, indices are
/// ascending.
pub fn build_execution_waves(entries: &[ScheduleEntry]) -> Vec<ExecutionWave> {
    if entries.is_empty() {
        return vec![];
    }

    let position: HashMap<&str, usize> = entries
        .iter()
        .enumerate()
        .map(|(i, e)| (e.call_id.as_str(), i))
        .collect();

    let mut in_degree = vec![0usize; entries.len()];
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); entries.len()];
    let mut add_edge = |from: usize, to: usize| {
        if !dependents[from].contains(&to) {
            dependents[from].push(to);
            in_degree[to] += 1;
        }
    };

    for (i, entry) in entries.iter().enumerate() {
        if let Some(dep) = &entry.depends_on {
            match position.get(dep.as_str()) {
                Some(&j) if j != i => add_edge(j, i),
                Some(_) => debug!("Call {} depends on itself, ignoring", entry.call_id),
                None => debug!(
                    "Call {} depends on unknown call {dep}, ignoring",
                    entry.call_id
                ),
            }
        }
        for j in 0..i {
            if conflicts(&entries[j], entry) {
                add_edge(j, i);
            }
        }
    }

    let mut waves: Vec<ExecutionWave> = Vec::new();
    let mut queue: VecDeque<usize> = (0..entries.len()).filter(|&i| in_degree[i] == 0).collect();
    let mut processed = 0;

    while !queue.is_empty() {
        // All items currently in the queue form one wave.
        let mut wave: ExecutionWave = queue.drain(..).collect();
        wave.sort_unstable();
        processed += wave.len();

        for &id in &wave {
            for &next in &dependents[id] {
                in_degree[next] -= 1;
                if in_degree[next] == 0 {
                    queue.push_back(next);
                }
            }
        }
        waves.push(wave);
    }

    if processed < entries.len() {
        warn!(
            "Dependency cycle among tool calls ({} of {} unordered), running sequentially",
            entries.len() - processed,
            entries.len()
        );
        return (0..entries.len()).map(|i| vec![i]).collect();
    }

    waves
}

#[cfg(test)]
mod tests {
    use super::*;

    fn read(id: &str, key: &str) -> ScheduleEntry {
        ScheduleEntry {
            call_id: id.into(),
            depends_on: None,
            capability: Capability::ReadOnly,
            resource_key: Some(key.into()),
        }
    }

    fn write(id: &str, key: Option<&str>) -> ScheduleEntry {
        ScheduleEntry {
            call_id: id.into(),
            depends_on: None,
            capability: Capability::Mutating,
            resource_key: key.map(Into::into),
        }
    }

    fn after(mut entry: ScheduleEntry, dep: &str) -> ScheduleEntry {
        entry.depends_on = Some(dep.into());
        entry
    }

    #[test]
    fn independent_reads_share_a_wave() {
        let waves = build_execution_waves(&[read("a", "file:a"), read("b", "file:b")]);
        assert_eq!(waves, vec![vec![0, 1]]);
    }

    #[test]
    fn reads_of_same_file_do_not_conflict() {
        let waves = build_execution_waves(&[read("a", "file:a"), read("b", "file:a")]);
        assert_eq!(waves.len(), 1);
    }

    #[test]
    fn edits_to_one_file_are_serialized_in_order() {
        let waves = build_execution_waves(&[
            write("e1", Some("file:a")),
            write("e2", Some("file:a")),
            read("r", "file:b"),
            write("e3", Some("file:a")),
        ]);
        assert_eq!(waves, vec![vec![0, 2], vec![1], vec![3]]);
    }

    #[test]
    fn read_after_write_waits() {
        let waves = build_execution_waves(&[write("w", Some("file:a")), read("r", "file:a")]);
        assert_eq!(waves, vec![vec![0], vec![1]]);
    }

    #[test]
    fn unkeyed_mutation_is_a_barrier() {
        let waves = build_execution_waves(&[
            read("a", "file:a"),
            write("cmd", None),
            read("b", "file:b"),
        ]);
        assert_eq!(waves, vec![vec![0], vec![1], vec![2]]);
    }

    #[test]
    fn explicit_dependency_chain() {
        let waves = build_execution_waves(&[
            read("a", "file:a"),
            after(read("b", "file:b"), "a"),
            after(read("c", "file:c"), "b"),
        ]);
        assert_eq!(waves, vec![vec![0], vec![1], vec![2]]);
    }

    #[test]
    fn diamond_dependency() {
        let waves = build_execution_waves(&[
            read("a", "file:a"),
            after(read("b", "file:b"), "a"),
            after(read("c", "file:c"), "a"),
            after(read("d", "file:d"), "b"),
        ]);
        assert_eq!(waves, vec![vec![0], vec![1, 2], vec![3]]);
    }

    #[test]
    fn cycle_falls_back_to_sequential() {
        let waves = build_execution_waves(&[
            after(read("a", "file:a"), "b"),
            after(read("b", "file:b"), "a"),
        ]);
        assert_eq!(waves, vec![vec![0], vec![1]]);
    }

    #[test]
    fn unknown_dependency_is_ignored() {
        let waves = build_execution_waves(&[after(read("a", "file:a"), "ghost")]);
        assert_eq!(waves, vec![vec![0]]);
    }

    #[test]
    fn empty_input() {
        assert!(build_execution_waves(&[]).is_empty());
    }
}
