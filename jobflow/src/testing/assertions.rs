//! Test assertions for finished flows.

use super::MockJobRunner;
use crate::core::BuildResult;
use crate::flow::FlowNode;

/// Asserts the result of the first invocation of `job` below `root`.
pub fn assert_job_result(root: &FlowNode, job: &str, expected: BuildResult) {
    let invocation = root
        .find_invocation(job)
        .unwrap_or_else(|| panic!("No invocation of '{job}' in flow {}", root.sequence()));
    assert_eq!(
        invocation.state().result(),
        expected,
        "Expected result {expected} for '{job}', got {}",
        invocation.state().result()
    );
}

/// Asserts how many builds of each job the runner started.
pub fn assert_invocations(runner: &MockJobRunner, expected: &[(&str, usize)]) {
    for (job, count) in expected {
        assert_eq!(
            runner.invocations(job),
            *count,
            "Expected {count} invocations of '{job}', got {}",
            runner.invocations(job)
        );
    }
}

/// Asserts that `before` finished before `after` was invoked.
pub fn assert_ran_before(runner: &MockJobRunner, before: &str, after: &str) {
    let finished = runner.finished_at(before);
    let invoked = runner.invoked_at(after);
    let last_finished = finished
        .last()
        .copied()
        .flatten()
        .unwrap_or_else(|| panic!("'{before}' never finished"));
    let first_invoked = invoked
        .first()
        .copied()
        .unwrap_or_else(|| panic!("'{after}' was never invoked"));
    assert!(
        last_finished <= first_invoked,
        "'{after}' was invoked at tick {first_invoked} before '{before}' finished at tick {last_finished}"
    );
}
