use service_orchestrator::mock::MockRuntime;
use service_orchestrator::{
    ConfigurationError, FailureKind, FailurePolicy, HealthCheck, Orchestrator, OrchestratorError,
    OrchestratorSettings, RestartPolicy, RunResult, ServiceDescriptor, ServiceEvent, ServiceFailure,
    ServiceId, ServiceState, StartupOutcome,
};
use std::time::Duration;
use tokio::time::{self, Instant};

// --- Helpers ---

fn svc(id: &str, deps: &[&str]) -> ServiceDescriptor {
    deps.iter()
        .fold(ServiceDescriptor::builder(id).command(id), |b, d| {
            b.depends_on(*d)
        })
        .build()
}

fn contained(runtime: &MockRuntime) -> Orchestrator<MockRuntime> {
    Orchestrator::with_settings(
        runtime.clone(),
        OrchestratorSettings {
            failure_policy: FailurePolicy::Contain,
            ..OrchestratorSettings::default()
        },
    )
}

fn failure(service: &str, kind: FailureKind) -> ServiceFailure {
    ServiceFailure {
        service: service.into(),
        kind,
    }
}

fn position(history: &[ServiceEvent], service: &str, to: ServiceState) -> Option<usize> {
    history
        .iter()
        .position(|e| e.service.as_str() == service && e.to == to)
}

// --- Ordering & propagation ---

#[tokio::test(start_paused = true)]
async fn dependent_receives_outputs_of_both_dependencies() {
    let runtime = MockRuntime::new();
    runtime.expect_service("a").output("endpoint", "10.0.0.1:2379");
    runtime.expect_service("b").output("accessKey", "minioadmin");
    runtime.expect_service("c");

    let c = ServiceDescriptor::builder("c")
        .command("c")
        .depends_on("a")
        .depends_on("b")
        .reference("A_ENDPOINT", "a", "endpoint")
        .reference("B_ACCESS_KEY", "b", "accessKey")
        .literal("MODE", "standalone")
        .build();
    let services = vec![svc("a", &[]), svc("b", &[]), c];

    let plan = service_orchestrator::resolve(&services).unwrap();
    assert_eq!(plan.stages().len(), 2);
    assert!(plan.stages()[0].contains(&ServiceId::from("a")));
    assert!(plan.stages()[0].contains(&ServiceId::from("b")));
    assert_eq!(plan.stages()[1].members(), &[ServiceId::from("c")]);

    let result = Orchestrator::new(runtime.clone())
        .run(services, time::sleep(Duration::from_secs(60)))
        .await
        .unwrap();
    assert_eq!(result, RunResult::Success);

    let starts = runtime.starts();
    assert_eq!(starts.len(), 3);
    assert_eq!(starts[2].as_str(), "c");

    let config = runtime.config_for("c").unwrap();
    assert_eq!(config.get("A_ENDPOINT"), Some("10.0.0.1:2379"));
    assert_eq!(config.get("B_ACCESS_KEY"), Some("minioadmin"));
    assert_eq!(config.get("MODE"), Some("standalone"));
    runtime.verify();
}

#[tokio::test(start_paused = true)]
async fn no_service_starts_before_its_dependencies_are_ready() {
    let runtime = MockRuntime::new();
    runtime.expect_service("b").probe_results([false, false, true]);
    runtime.expect_service("c").start_delay(Duration::from_secs(3));

    let slow_probe = HealthCheck::default()
        .interval(Duration::from_secs(1))
        .thresholds(1, 5);
    let services = vec![
        svc("a", &[]),
        ServiceDescriptor::builder("b")
            .command("b")
            .depends_on("a")
            .health_check(slow_probe)
            .build(),
        svc("c", &["a"]),
        svc("d", &["b", "c"]),
    ];

    let deployment = Orchestrator::new(runtime.clone())
        .start(services.clone())
        .await
        .unwrap();
    assert_eq!(deployment.outcome(), Some(StartupOutcome::Completed));

    let history: Vec<ServiceEvent> = deployment.history().cloned().collect();
    for service in &services {
        let Some(starting) = position(&history, service.id.as_str(), ServiceState::Starting) else {
            panic!("{} never started", service.id);
        };
        for dep in service.dependency_ids() {
            let ready = position(&history, dep.as_str(), ServiceState::Ready)
                .unwrap_or_else(|| panic!("{dep} never became ready"));
            assert!(
                ready < starting,
                "{} started before {dep} was ready",
                service.id
            );
        }
    }

    assert_eq!(deployment.shutdown().await, RunResult::Success);
}

#[tokio::test(start_paused = true)]
async fn started_edge_does_not_wait_for_readiness() {
    let runtime = MockRuntime::new();
    runtime.expect_service("a").probe_results([false, false, true]);

    let services = vec![
        ServiceDescriptor::builder("a")
            .command("a")
            .health_check(
                HealthCheck::default()
                    .interval(Duration::from_secs(10))
                    .thresholds(1, 5),
            )
            .build(),
        ServiceDescriptor::builder("b")
            .command("b")
            .depends_on_started("a")
            .build(),
    ];

    let deployment = Orchestrator::new(runtime.clone())
        .start(services)
        .await
        .unwrap();
    let history: Vec<ServiceEvent> = deployment.history().cloned().collect();
    let b_starting = position(&history, "b", ServiceState::Starting).unwrap();
    if let Some(a_ready) = position(&history, "a", ServiceState::Ready) {
        assert!(b_starting < a_ready);
    }
    assert_eq!(deployment.shutdown().await, RunResult::Success);
}

#[tokio::test(start_paused = true)]
async fn independent_services_share_one_stage_and_start_concurrently() {
    let runtime = MockRuntime::new();
    for id in ["etcd", "minio", "pulsar"] {
        runtime
            .expect_service(id)
            .start_delay(Duration::from_secs(10));
    }
    let services = vec![svc("etcd", &[]), svc("minio", &[]), svc("pulsar", &[])];

    let began = Instant::now();
    let deployment = Orchestrator::new(runtime.clone())
        .start(services)
        .await
        .unwrap();
    assert!(began.elapsed() < Duration::from_secs(15));

    assert_eq!(deployment.plan().stages().len(), 1);
    assert_eq!(deployment.plan().stages()[0].len(), 3);
    let report = deployment.status();
    for id in ["etcd", "minio", "pulsar"] {
        assert_eq!(report.state_of(id), Some(ServiceState::Ready));
    }

    assert_eq!(deployment.shutdown().await, RunResult::Success);
    runtime.verify();
}

// --- Configuration errors ---

#[tokio::test]
async fn cycle_is_rejected_before_anything_starts() {
    let runtime = MockRuntime::new();
    let services = vec![svc("a", &["b"]), svc("b", &["c"]), svc("c", &["a"])];

    let err = Orchestrator::new(runtime.clone())
        .run(services, async {})
        .await
        .unwrap_err();
    match err {
        OrchestratorError::Configuration(ConfigurationError::CyclicDependency(path)) => {
            assert_eq!(path.len(), 4);
            assert_eq!(path.first(), path.last());
        }
        other => panic!("expected a cycle, got {other:?}"),
    }
    assert!(runtime.calls().is_empty());
}

#[tokio::test]
async fn unknown_dependency_is_rejected_before_anything_starts() {
    let runtime = MockRuntime::new();
    let err = Orchestrator::new(runtime.clone())
        .start(vec![svc("a", &[]), svc("b", &["ghost"])])
        .await
        .err()
        .unwrap();
    assert!(matches!(
        err,
        OrchestratorError::Configuration(ConfigurationError::UnknownDependency { .. })
    ));
    assert!(runtime.calls().is_empty());
}

#[tokio::test(start_paused = true)]
async fn missing_output_aborts_the_run() {
    let runtime = MockRuntime::new();
    let services = vec![
        svc("etcd", &[]),
        ServiceDescriptor::builder("milvus")
            .command("milvus")
            .depends_on("etcd")
            .reference("ETCD_ENDPOINTS", "etcd", "endpoint")
            .build(),
    ];

    let result = Orchestrator::new(runtime.clone())
        .run(services, time::sleep(Duration::from_secs(60)))
        .await
        .unwrap();
    match result {
        RunResult::Aborted { reason } => assert!(reason.contains("endpoint"), "{reason}"),
        other => panic!("expected abort, got {other}"),
    }
    assert_eq!(runtime.start_count("milvus"), 0);
    assert_eq!(runtime.stop_order(), vec![ServiceId::from("etcd")]);
}

// --- Failures ---

#[tokio::test(start_paused = true)]
async fn failed_dependency_keeps_dependent_pending() {
    let runtime = MockRuntime::new();
    runtime.expect_service("a").always_unhealthy();

    let a = ServiceDescriptor::builder("a")
        .command("a")
        .health_check(
            HealthCheck::default()
                .interval(Duration::from_secs(1))
                .thresholds(1, 2),
        )
        .restart(RestartPolicy {
            max_retries: 2,
            ..RestartPolicy::default()
        })
        .build();

    let deployment = Orchestrator::new(runtime.clone())
        .start(vec![a, svc("b", &["a"])])
        .await
        .unwrap();
    assert_eq!(deployment.outcome(), Some(StartupOutcome::Failed));

    let report = deployment.status();
    assert_eq!(report.state_of("a"), Some(ServiceState::Failed));
    assert_eq!(report.state_of("b"), Some(ServiceState::Pending));
    let b = report.services.iter().find(|s| s.id.as_str() == "b").unwrap();
    assert_eq!(b.blocked_by, Some(ServiceId::from("a")));
    assert!(!deployment
        .history()
        .any(|e| e.service.as_str() == "b" && e.to == ServiceState::Starting));

    let result = deployment.shutdown().await;
    assert_eq!(
        result,
        RunResult::PartialFailure(vec![failure("a", FailureKind::Probe)])
    );
    assert_eq!(runtime.start_count("a"), 3);
    assert_eq!(runtime.start_count("b"), 0);
}

#[tokio::test(start_paused = true)]
async fn abort_policy_stops_stage_progression() {
    let runtime = MockRuntime::new();
    runtime.expect_service("a").fail_starts(1);

    let a = ServiceDescriptor::builder("a")
        .command("a")
        .restart(RestartPolicy::never())
        .build();
    let services = vec![a, svc("b", &["a"]), svc("c", &[]), svc("d", &["c"])];

    let result = Orchestrator::new(runtime.clone())
        .run(services, time::sleep(Duration::from_secs(600)))
        .await
        .unwrap();
    assert_eq!(
        result,
        RunResult::PartialFailure(vec![failure("a", FailureKind::Start)])
    );
    assert_eq!(runtime.start_count("c"), 1);
    assert_eq!(runtime.start_count("b"), 0);
    assert_eq!(runtime.start_count("d"), 0);
}

#[tokio::test(start_paused = true)]
async fn contain_policy_keeps_independent_branches_running() {
    let runtime = MockRuntime::new();
    runtime.expect_service("a").fail_starts(1);

    let a = ServiceDescriptor::builder("a")
        .command("a")
        .restart(RestartPolicy::never())
        .build();
    let services = vec![
        a,
        svc("b", &["a"]),
        svc("e", &["b"]),
        svc("c", &[]),
        svc("d", &["c"]),
    ];

    let deployment = contained(&runtime).start(services).await.unwrap();
    assert_eq!(deployment.outcome(), Some(StartupOutcome::Completed));

    let report = deployment.status();
    assert_eq!(report.state_of("c"), Some(ServiceState::Ready));
    assert_eq!(report.state_of("d"), Some(ServiceState::Ready));
    for held in ["b", "e"] {
        let status = report.services.iter().find(|s| s.id.as_str() == held).unwrap();
        assert_eq!(status.state, ServiceState::Pending);
        assert_eq!(status.blocked_by, Some(ServiceId::from("a")));
    }

    let result = deployment.shutdown().await;
    assert_eq!(result.failed_services(), vec![&ServiceId::from("a")]);
    assert_eq!(runtime.start_count("b"), 0);
    assert_eq!(runtime.start_count("e"), 0);
}

#[tokio::test(start_paused = true)]
async fn transient_launch_failure_is_retried() {
    let runtime = MockRuntime::new();
    runtime
        .expect_service("etcd")
        .fail_starts(1)
        .output("endpoint", "127.0.0.1:2379");

    let services = vec![
        svc("etcd", &[]),
        ServiceDescriptor::builder("milvus")
            .command("milvus")
            .depends_on("etcd")
            .reference("ETCD_ENDPOINTS", "etcd", "endpoint")
            .build(),
    ];
    let deployment = Orchestrator::new(runtime.clone())
        .start(services)
        .await
        .unwrap();

    assert_eq!(runtime.start_count("etcd"), 2);
    let etcd = deployment.status_handle().snapshot("etcd").unwrap();
    assert_eq!(etcd.state, ServiceState::Ready);
    assert_eq!(etcd.attempts, 2);
    assert_eq!(
        runtime.config_for("milvus").unwrap().get("ETCD_ENDPOINTS"),
        Some("127.0.0.1:2379")
    );
    assert_eq!(deployment.shutdown().await, RunResult::Success);
}

#[tokio::test(start_paused = true)]
async fn failure_after_startup_takes_dependents_down() {
    let runtime = MockRuntime::new();
    runtime
        .expect_service("etcd")
        .probe_results([true, false, false, false]);

    let etcd = ServiceDescriptor::builder("etcd")
        .command("etcd")
        .restart(RestartPolicy::never())
        .build();
    let services = vec![etcd, svc("milvus", &["etcd"]), svc("attu", &[])];

    let result = contained(&runtime)
        .run(services, time::sleep(Duration::from_secs(3600)))
        .await
        .unwrap();
    assert_eq!(
        result,
        RunResult::PartialFailure(vec![
            failure("etcd", FailureKind::Probe),
            failure("milvus", FailureKind::DependencyFailed),
        ])
    );
    assert_eq!(runtime.start_count("milvus"), 1);
}

// --- Shutdown ---

#[tokio::test(start_paused = true)]
async fn shutdown_stops_services_in_reverse_order() {
    let runtime = MockRuntime::new();
    let services = vec![svc("a", &[]), svc("b", &["a"]), svc("c", &["b"])];

    let result = Orchestrator::new(runtime.clone())
        .run(services, time::sleep(Duration::from_secs(60)))
        .await
        .unwrap();
    assert_eq!(result, RunResult::Success);
    assert_eq!(
        runtime.stop_order(),
        vec![ServiceId::from("c"), ServiceId::from("b"), ServiceId::from("a")]
    );
}

#[tokio::test(start_paused = true)]
async fn aborted_run_stops_services_that_never_started() {
    let runtime = MockRuntime::new();
    runtime.expect_service("a").always_unhealthy();

    let a = ServiceDescriptor::builder("a")
        .command("a")
        .health_check(
            HealthCheck::default()
                .interval(Duration::from_secs(1))
                .thresholds(1, 1),
        )
        .restart(RestartPolicy::never())
        .build();
    let services = vec![a, svc("b", &[]), svc("x", &["b"]), svc("y", &["a"])];

    let deployment = Orchestrator::new(runtime.clone())
        .prepare(services)
        .unwrap();
    let status = deployment.status_handle();
    let result = deployment.run_until(std::future::pending()).await;
    assert_eq!(
        result,
        RunResult::PartialFailure(vec![failure("a", FailureKind::Probe)])
    );

    let report = status.report();
    assert_eq!(report.state_of("a"), Some(ServiceState::Failed));
    assert_eq!(report.state_of("b"), Some(ServiceState::Stopped));
    assert_eq!(report.state_of("x"), Some(ServiceState::Stopped));
    // y is held back by a, so it keeps naming the cause.
    assert_eq!(report.state_of("y"), Some(ServiceState::Pending));
    assert_eq!(
        status.snapshot("y").unwrap().blocked_by,
        Some(ServiceId::from("a"))
    );
    assert_eq!(runtime.start_count("x"), 0);
    assert_eq!(
        runtime.stop_order(),
        vec![ServiceId::from("a"), ServiceId::from("b")]
    );
}

#[tokio::test(start_paused = true)]
async fn shutdown_during_startup_aborts() {
    let runtime = MockRuntime::new();
    runtime.expect_service("a").always_unhealthy();

    let a = ServiceDescriptor::builder("a")
        .command("a")
        .health_check(
            HealthCheck::default()
                .interval(Duration::from_secs(10))
                .thresholds(1, 100)
                .start_period(Duration::from_secs(600)),
        )
        .build();

    let result = Orchestrator::new(runtime.clone())
        .run(vec![a, svc("b", &["a"])], time::sleep(Duration::from_secs(5)))
        .await
        .unwrap();
    assert!(matches!(result, RunResult::Aborted { .. }), "{result}");
    assert_eq!(runtime.start_count("b"), 0);
    assert_eq!(runtime.stop_order(), vec![ServiceId::from("a")]);
}
