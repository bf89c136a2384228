//! Wave scheduling over a phase's step dependencies.
//!
//! Computes execution waves — groups of steps whose dependencies are already
//! satisfied and can run concurrently. A cycle or dangling dependency never
//! deadlocks the phase: the blocked remainder is emitted as one final
//! best-effort wave in insertion order.

use crate::plan::Step;
use std::collections::HashSet;
use tracing::warn;

/// Compute the ordered wave sequence for a set of steps.
///
/// Each wave is a list of step ids. For every step in wave `k`, every
/// dependency resolvable within `steps` sits in some wave `< k`, unless the
/// dependency graph is cyclic or references unknown ids — in which case the
/// stuck steps form the last wave.
pub fn build_execution_queue(steps: &[Step]) -> Vec<Vec<String>> {
    let mut waves: Vec<Vec<String>> = Vec::new();
    let mut completed: HashSet<&str> = HashSet::new();

    loop {
        let ready: Vec<String> = steps
            .iter()
            .filter(|step| !completed.contains(step.id.as_str()))
            .filter(|step| {
                step.dependencies
                    .iter()
                    .all(|dep| completed.contains(dep.as_str()))
            })
            .map(|step| step.id.clone())
            .collect();

        if ready.is_empty() {
            break;
        }
        for id in &ready {
            let idx = steps.iter().position(|s| &s.id == id).unwrap();
            completed.insert(steps[idx].id.as_str());
        }
        waves.push(ready);
    }

    let stuck: Vec<String> = steps
        .iter()
        .filter(|step| !completed.contains(step.id.as_str()))
        .map(|step| step.id.clone())
        .collect();
    if !stuck.is_empty() {
        warn!(
            steps = ?stuck,
            "dependency cycle or dangling reference; emitting best-effort final wave"
        );
        waves.push(stuck);
    }

    waves
}
