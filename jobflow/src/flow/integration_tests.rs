//! End-to-end flow runs against the mock job runner.

#[cfg(test)]
mod tests {
    use crate::core::{BuildResult, KillType, Propagation};
    use crate::errors::{FlowError, JobFailure};
    use crate::flow::{ControllerConfig, FlowBuilder, FlowController, GroupOptions, GRAPH_FILE_NAME};
    use crate::testing::{assert_invocations, assert_job_result, assert_ran_before, MockJob, MockJobRunner};
    use crate::utils::params::NO_PARAMS;
    use std::sync::Arc;

    fn config() -> ControllerConfig {
        ControllerConfig::new()
            .with_poll_interval(0.001)
            .with_handle_sigterm(false)
            .with_cause("integration test")
    }

    fn runner_with(jobs: impl IntoIterator<Item = MockJob>) -> MockJobRunner {
        let runner = MockJobRunner::new();
        for job in jobs {
            runner.add_job(job);
        }
        runner
    }

    fn serial(runner: &MockJobRunner, config: ControllerConfig, options: GroupOptions) -> FlowBuilder {
        FlowBuilder::new_serial(Arc::new(runner.clone()), config, options).unwrap()
    }

    fn parallel(runner: &MockJobRunner, config: ControllerConfig, options: GroupOptions) -> FlowBuilder {
        FlowBuilder::new_parallel(Arc::new(runner.clone()), config, options).unwrap()
    }

    fn invoke_all(flow: &mut FlowBuilder, jobs: &[&str]) {
        let root = flow.root();
        for job in jobs {
            flow.invoke(root, job, NO_PARAMS).unwrap();
        }
    }

    fn failure(result: Result<BuildResult, FlowError>) -> JobFailure {
        match result {
            Err(FlowError::Retryable(failure)) => failure,
            other => panic!("Expected a job failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_serial_retry_restarts_from_first_child() {
        let runner = runner_with([MockJob::new("a"), MockJob::new("b").with_max_fails(1), MockJob::new("c")]);
        let mut flow = serial(&runner, config(), GroupOptions::new().with_max_tries(2));
        invoke_all(&mut flow, &["a", "b", "c"]);
        let mut controller = flow.finish().unwrap();

        let result = controller.run().await.unwrap();

        assert_eq!(result, BuildResult::Success);
        assert_invocations(&runner, &[("a", 2), ("b", 2), ("c", 1)]);
        assert_eq!(runner.invocation_order(), vec!["a", "b", "a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_parallel_failure_names_failed_child() {
        let runner = runner_with([
            MockJob::new("a").with_exec_ticks(3),
            MockJob::new("b").with_max_fails(1),
            MockJob::new("c").with_exec_ticks(3),
        ]);
        let mut flow = parallel(&runner, config(), GroupOptions::new());
        invoke_all(&mut flow, &["a", "b", "c"]);
        let mut controller = flow.finish().unwrap();

        let failure = failure(controller.run().await);

        assert_eq!(failure.failed_children(), ["b".to_string()]);
        assert_eq!(controller.result(), BuildResult::Failure);
        assert_job_result(controller.root(), "a", BuildResult::Success);
        assert_job_result(controller.root(), "c", BuildResult::Success);
        assert_invocations(&runner, &[("a", 1), ("b", 1), ("c", 1)]);
    }

    fn warn_only_flow(runner: &MockJobRunner, config: ControllerConfig) -> FlowController {
        let mut flow = serial(runner, config, GroupOptions::new());
        let root = flow.root();
        flow.invoke(root, "x", NO_PARAMS).unwrap();
        flow.with_parallel(
            root,
            GroupOptions::new().with_propagation(Propagation::FailureToUnstable),
            |flow, par| {
                flow.invoke(par, "y", NO_PARAMS)?;
                flow.invoke(par, "z", NO_PARAMS)?;
                Ok(())
            },
        )
        .unwrap();
        flow.finish().unwrap()
    }

    #[tokio::test]
    async fn test_failure_to_unstable_downgrades_result() {
        let runner = runner_with([MockJob::new("x"), MockJob::new("y"), MockJob::new("z").with_max_fails(1)]);
        let mut controller = warn_only_flow(&runner, config().with_raise_if_unsuccessful(false));

        let result = controller.run().await.unwrap();

        assert_eq!(result, BuildResult::Unstable);
        assert_eq!(controller.root().children()[1].state().result(), BuildResult::Unstable);
        assert_job_result(controller.root(), "z", BuildResult::Failure);
    }

    #[tokio::test]
    async fn test_unstable_result_raises_when_requested() {
        let runner = runner_with([MockJob::new("x"), MockJob::new("y"), MockJob::new("z").with_max_fails(1)]);
        let mut controller = warn_only_flow(&runner, config());

        let err = controller.run().await.unwrap_err();

        assert!(matches!(err, FlowError::FinalResult { result: BuildResult::Unstable }));
    }

    #[tokio::test]
    async fn test_use_out_of_scope_contacts_no_job() {
        let runner = runner_with([MockJob::new("a")]);
        let mut flow = serial(&runner, config(), GroupOptions::new());
        let root = flow.root();
        let inner = flow.with_parallel(root, GroupOptions::new(), |flow, par| {
            flow.invoke(par, "a", NO_PARAMS)?;
            Ok(())
        })
        .unwrap();

        let err = flow.invoke(inner, "a", NO_PARAMS).unwrap_err();

        assert!(matches!(err, FlowError::Scope(_)));
        assert_eq!(runner.get_job_calls("a"), 0);
        assert_invocations(&runner, &[("a", 0)]);
    }

    #[tokio::test]
    async fn test_kill_all_stops_foreign_builds() {
        let runner = runner_with([MockJob::new("j").running_elsewhere()]);
        let mut flow = serial(&runner, config().with_kill_all(true), GroupOptions::new());
        invoke_all(&mut flow, &["j"]);
        let mut controller = flow.finish().unwrap();

        let result = controller.run().await.unwrap();

        assert_eq!(result, BuildResult::Failure);
        assert_job_result(controller.root(), "j", BuildResult::Aborted);
        assert_eq!(runner.stop_all_calls("j"), 1);
        assert_eq!(runner.build_results("j"), vec![BuildResult::Aborted]);
        assert_invocations(&runner, &[("j", 0)]);
    }

    #[tokio::test]
    async fn test_kill_current_stops_own_builds_only() {
        let runner = runner_with([MockJob::new("a").with_exec_ticks(50), MockJob::new("b")]);
        let mut flow = serial(&runner, config(), GroupOptions::new().with_max_tries(3));
        invoke_all(&mut flow, &["a", "b"]);
        let mut controller = flow.finish().unwrap();
        runner.kill_at_tick(3, controller.kill_switch(), KillType::Current);

        let err = controller.run().await.unwrap_err();

        assert!(matches!(err, FlowError::FinalResult { result: BuildResult::Failure }));
        assert_job_result(controller.root(), "a", BuildResult::Aborted);
        assert_job_result(controller.root(), "b", BuildResult::Unknown);
        assert_invocations(&runner, &[("a", 1), ("b", 0)]);
        assert_eq!(runner.stop_calls("a"), 1);
        assert_eq!(runner.stop_all_calls("a"), 0);
    }

    #[tokio::test]
    async fn test_graph_json_is_stable() {
        let runner = runner_with([MockJob::new("a"), MockJob::new("b")]);
        let mut flow = serial(&runner, config(), GroupOptions::new().with_job_name_prefix("ci_"));
        invoke_all(&mut flow, &["a", "b"]);
        let controller = flow.finish().unwrap();

        let first = controller.graph_json().unwrap();
        let second = controller.graph_json().unwrap();

        assert_eq!(first, second);
        assert!(first.contains("\"name\":\"a\""));
    }

    #[tokio::test]
    async fn test_serial_children_run_in_order() {
        let runner = runner_with([MockJob::new("a").with_exec_ticks(2), MockJob::new("b").with_queue_ticks(1)]);
        let mut flow = serial(&runner, config(), GroupOptions::new());
        invoke_all(&mut flow, &["a", "b"]);
        let mut controller = flow.finish().unwrap();

        controller.run().await.unwrap();

        assert_ran_before(&runner, "a", "b");
        assert_eq!(runner.last_request("b").unwrap().cause.as_deref(), Some("integration test"));
    }

    #[tokio::test]
    async fn test_group_timeout() {
        let runner = runner_with([MockJob::new("slow").with_exec_ticks(1_000_000)]);
        let mut flow = serial(&runner, config(), GroupOptions::new().with_timeout(0.05));
        invoke_all(&mut flow, &["slow"]);
        let mut controller = flow.finish().unwrap();

        let err = controller.run().await.unwrap_err();

        match err {
            FlowError::Timeout(timeout) => assert_eq!(timeout.unfinished, vec!["slow".to_string()]),
            other => panic!("Expected timeout, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_missing_job_fails_at_start() {
        let runner = runner_with([MockJob::new("a")]);
        let mut flow = serial(&runner, config(), GroupOptions::new());
        invoke_all(&mut flow, &["a", "ghost"]);
        let mut controller = flow.finish().unwrap();

        let failure = failure(controller.run().await);

        assert!(matches!(failure, JobFailure::MissingJob { ref name } if name == "ghost"));
        assert_invocations(&runner, &[("a", 0)]);
    }

    #[tokio::test]
    async fn test_allowed_missing_job_resolved_when_reached() {
        let runner = runner_with([MockJob::new("creator").creates_job("late"), MockJob::new("late").missing()]);
        let mut flow = serial(&runner, config().with_allow_missing_jobs(true), GroupOptions::new());
        invoke_all(&mut flow, &["creator", "late"]);
        let mut controller = flow.finish().unwrap();

        let result = controller.run().await.unwrap();

        assert_eq!(result, BuildResult::Success);
        assert_invocations(&runner, &[("creator", 1), ("late", 1)]);
    }

    #[tokio::test]
    async fn test_busy_job_rejected() {
        let runner = runner_with([MockJob::new("busy").running_elsewhere()]);
        let mut flow = serial(&runner, config(), GroupOptions::new());
        invoke_all(&mut flow, &["busy"]);
        let mut controller = flow.finish().unwrap();

        let err = controller.run().await.unwrap_err();

        assert!(matches!(err, FlowError::JobNotIdle(ref busy) if busy.job == "busy"));
        assert_invocations(&runner, &[("busy", 0)]);
    }

    #[tokio::test]
    async fn test_unchecked_job_retried_but_ignored() {
        let runner = runner_with([MockJob::new("a"), MockJob::new("u").with_max_fails(5)]);
        let mut flow = parallel(&runner, config(), GroupOptions::new().with_max_tries(2));
        let root = flow.root();
        flow.invoke(root, "a", NO_PARAMS).unwrap();
        flow.invoke_unchecked(root, "u", NO_PARAMS).unwrap();
        let mut controller = flow.finish().unwrap();

        let result = controller.run().await.unwrap();

        // The flow does not wait for the retried unchecked build
        assert_eq!(result, BuildResult::Success);
        assert_job_result(controller.root(), "a", BuildResult::Success);
        assert_invocations(&runner, &[("a", 1), ("u", 2)]);
    }

    #[tokio::test]
    async fn test_queued_build_superseded() {
        let runner = runner_with([MockJob::new("a").with_queue_ticks(3)]);
        let mut flow = parallel(&runner, config(), GroupOptions::new());
        let root = flow.root();
        flow.invoke(root, "a", [("run", 1)]).unwrap();
        flow.invoke(root, "a", [("run", 2)]).unwrap();
        let mut controller = flow.finish().unwrap();

        let result = controller.run().await.unwrap();

        assert_eq!(result, BuildResult::Success);
        let invocations = controller.root().invocations();
        assert_eq!(invocations[0].state().result(), BuildResult::Superseded);
        assert_eq!(invocations[1].state().result(), BuildResult::Success);
        assert_eq!(invocations[1].invocation_number(), 2);
    }

    #[tokio::test]
    async fn test_just_dump_writes_graph_only() {
        let dir = tempfile::tempdir().unwrap();
        let runner = runner_with([MockJob::new("a")]);
        let mut flow = serial(&runner, config().with_just_dump(true).with_json_dir(dir.path()), GroupOptions::new());
        invoke_all(&mut flow, &["a"]);
        let mut controller = flow.finish().unwrap();

        let result = controller.run().await.unwrap();

        assert_eq!(result, BuildResult::Unknown);
        assert_invocations(&runner, &[("a", 0)]);
        let graph = std::fs::read_to_string(dir.path().join(GRAPH_FILE_NAME)).unwrap();
        assert_eq!(graph, controller.graph_json().unwrap());
    }

    #[tokio::test]
    async fn test_aborted_build_not_retried() {
        let runner = runner_with([
            MockJob::new("a").with_max_fails(1).with_fail_result(BuildResult::Aborted),
            MockJob::new("b"),
        ]);
        let mut flow = serial(&runner, config(), GroupOptions::new().with_max_tries(3));
        invoke_all(&mut flow, &["a", "b"]);
        let mut controller = flow.finish().unwrap();

        let failure = failure(controller.run().await);

        assert!(failure.is_aborted());
        assert!(matches!(failure, JobFailure::ChildJob { ref child, .. } if child == "a"));
        assert_invocations(&runner, &[("a", 1), ("b", 0)]);
    }

    #[tokio::test]
    async fn test_retry_through_enclosing_serial() {
        let runner = runner_with([
            MockJob::new("j11"),
            MockJob::new("j21"),
            MockJob::new("j31").with_max_fails(2),
            MockJob::new("j32"),
        ]);
        let mut flow = serial(&runner, config(), GroupOptions::new());
        let root = flow.root();
        flow.invoke(root, "j11", NO_PARAMS).unwrap();
        flow.with_serial(root, GroupOptions::new().with_max_tries(2), |flow, outer| {
            flow.invoke(outer, "j21", NO_PARAMS)?;
            flow.with_serial(outer, GroupOptions::new().with_max_tries(2), |flow, inner| {
                flow.invoke(inner, "j31", NO_PARAMS)?;
                flow.invoke(inner, "j32", NO_PARAMS)?;
                Ok(())
            })?;
            Ok(())
        })
        .unwrap();
        let mut controller = flow.finish().unwrap();

        let result = controller.run().await.unwrap();

        assert_eq!(result, BuildResult::Success);
        assert_invocations(&runner, &[("j11", 1), ("j21", 2), ("j31", 3), ("j32", 1)]);
    }

    #[tokio::test]
    async fn test_empty_flow_does_nothing() {
        let runner = MockJobRunner::new();
        let flow = serial(&runner, config(), GroupOptions::new());
        let mut controller = flow.finish().unwrap();

        assert_eq!(controller.run().await.unwrap(), BuildResult::Unknown);
        assert_eq!(runner.tick(), 0);
    }

    #[tokio::test]
    async fn test_kill_before_successor_invoked() {
        let runner = runner_with([MockJob::new("a"), MockJob::new("b")]);
        let mut flow = serial(&runner, config(), GroupOptions::new());
        invoke_all(&mut flow, &["a", "b"]);
        let mut controller = flow.finish().unwrap();
        runner.kill_at_tick(3, controller.kill_switch(), KillType::Current);

        let err = controller.run().await.unwrap_err();

        assert!(matches!(err, FlowError::FinalResult { result: BuildResult::Failure }));
        assert_job_result(controller.root(), "a", BuildResult::Success);
        assert_invocations(&runner, &[("a", 1), ("b", 0)]);
    }

    #[tokio::test]
    async fn test_kill_all_reaches_finished_and_pending_jobs() {
        let runner = runner_with([MockJob::new("a"), MockJob::new("b")]);
        let mut flow = serial(&runner, config(), GroupOptions::new());
        invoke_all(&mut flow, &["a", "b"]);
        let mut controller = flow.finish().unwrap();
        runner.kill_at_tick(3, controller.kill_switch(), KillType::All);

        let result = controller.run().await.unwrap();

        assert_ne!(result, BuildResult::Success);
        assert_invocations(&runner, &[("a", 1), ("b", 0)]);
        assert_eq!(runner.stop_all_calls("a"), 1);
        assert_eq!(runner.stop_all_calls("b"), 1);
    }

    #[tokio::test]
    async fn test_kill_all_stops_every_parallel_job() {
        let runner = runner_with([MockJob::new("a"), MockJob::new("b").with_exec_ticks(50)]);
        let mut flow = parallel(&runner, config(), GroupOptions::new());
        invoke_all(&mut flow, &["a", "b"]);
        let mut controller = flow.finish().unwrap();
        runner.kill_at_tick(4, controller.kill_switch(), KillType::All);

        let result = controller.run().await.unwrap();

        assert_eq!(result, BuildResult::Failure);
        assert_job_result(controller.root(), "a", BuildResult::Success);
        assert_job_result(controller.root(), "b", BuildResult::Aborted);
        assert_eq!(runner.stop_all_calls("a"), 1);
        assert_eq!(runner.stop_all_calls("b"), 1);
    }

    #[tokio::test]
    async fn test_aborted_unchecked_job_keeps_serial_retries() {
        let runner = runner_with([
            MockJob::new("u").with_max_fails(1).with_fail_result(BuildResult::Aborted),
            MockJob::new("a").with_max_fails(1),
        ]);
        let mut flow = serial(&runner, config(), GroupOptions::new());
        let root = flow.root();
        flow.with_serial(root, GroupOptions::new().with_max_tries(2), |flow, outer| {
            flow.with_serial(outer, GroupOptions::new(), |flow, inner| {
                flow.invoke_unchecked(inner, "u", NO_PARAMS)?;
                flow.invoke(inner, "a", NO_PARAMS)?;
                Ok(())
            })?;
            Ok(())
        })
        .unwrap();
        let mut controller = flow.finish().unwrap();

        let result = controller.run().await.unwrap();

        assert_eq!(result, BuildResult::Success);
        assert_invocations(&runner, &[("a", 2)]);
    }

    #[tokio::test]
    async fn test_aborted_unchecked_job_keeps_parallel_retries() {
        let runner = runner_with([
            MockJob::new("u").with_max_fails(1).with_fail_result(BuildResult::Aborted),
            MockJob::new("a").with_max_fails(1).with_exec_ticks(2),
        ]);
        let mut flow = serial(&runner, config(), GroupOptions::new());
        let root = flow.root();
        flow.with_serial(root, GroupOptions::new().with_max_tries(2), |flow, outer| {
            flow.with_parallel(outer, GroupOptions::new(), |flow, par| {
                flow.invoke_unchecked(par, "u", NO_PARAMS)?;
                flow.invoke(par, "a", NO_PARAMS)?;
                Ok(())
            })?;
            Ok(())
        })
        .unwrap();
        let mut controller = flow.finish().unwrap();

        let result = controller.run().await.unwrap();

        assert_eq!(result, BuildResult::Success);
        assert_invocations(&runner, &[("a", 2)]);
    }
}
